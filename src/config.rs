//! Controller configuration, loadable from JSON.

use crate::command::{CommandSource, COMMAND_SOURCES};
use crate::counters::CounterMode;
use crate::i2c::I2C_MAX_RETRIES;
use crate::mux::EventLowRateCopy;
use crate::poller::{BusDevice, MAX_BUS_DEVICES, SPI_BUFFER_SIZE};
use serde::{Deserialize, Serialize};
use thiserror::Error;

const BUSY_HIGH_PERCENT: u8 = 80;
const BUSY_LOW_PERCENT: u8 = 70;
const HK_PERIOD_SECS: u16 = 5;
const MAX_RESPONSE_BYTES: usize = 256;

/// Timer interrupts per second driving the housekeeping period.
pub const TICKS_PER_SECOND: u32 = 4;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("busy thresholds out of order: low {low}% must be below high {high}%")]
    Hysteresis { low: u8, high: u8 },
    #[error("busy threshold {0}% above 100")]
    ThresholdRange(u8),
    #[error("command priority must name every source exactly once")]
    Priority,
    #[error("bus device list is empty")]
    NoDevices,
    #[error("bus device list has {0} entries, at most {} allowed", MAX_BUS_DEVICES)]
    TooManyDevices(usize),
    #[error("bus device {0:?} listed twice")]
    DuplicateDevice(BusDevice),
    #[error("max response bytes must be between 1 and {limit}, got {value}")]
    ResponseLimit { value: usize, limit: usize },
    #[error("housekeeping period must be non-zero")]
    ZeroPeriod,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    pub counter_mode: CounterMode,
    /// Drain order of the command sources, highest first.
    pub command_priority: [CommandSource; COMMAND_SOURCES],
    /// Instrument bus poll rotation.
    pub bus_devices: Vec<BusDevice>,
    pub max_response_bytes: usize,
    pub busy_high_percent: u8,
    pub busy_low_percent: u8,
    pub hk_period_secs: u16,
    pub event_copy_mode: EventLowRateCopy,
    pub i2c_max_retries: u8,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            counter_mode: CounterMode::Wrapping,
            command_priority: CommandSource::ALL,
            bus_devices: vec![BusDevice::PowerBoard],
            max_response_bytes: MAX_RESPONSE_BYTES,
            busy_high_percent: BUSY_HIGH_PERCENT,
            busy_low_percent: BUSY_LOW_PERCENT,
            hk_period_secs: HK_PERIOD_SECS,
            event_copy_mode: EventLowRateCopy::EventHousekeeping,
            i2c_max_retries: I2C_MAX_RETRIES,
        }
    }
}

impl ControllerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, ConfigError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for threshold in [self.busy_high_percent, self.busy_low_percent] {
            if threshold > 100 {
                return Err(ConfigError::ThresholdRange(threshold));
            }
        }
        if self.busy_low_percent >= self.busy_high_percent {
            return Err(ConfigError::Hysteresis {
                low: self.busy_low_percent,
                high: self.busy_high_percent,
            });
        }
        if !CommandSource::ALL.iter().all(|s| self.command_priority.contains(s)) {
            return Err(ConfigError::Priority);
        }
        if self.bus_devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        if self.bus_devices.len() > MAX_BUS_DEVICES {
            return Err(ConfigError::TooManyDevices(self.bus_devices.len()));
        }
        for (i, device) in self.bus_devices.iter().enumerate() {
            if self.bus_devices[..i].contains(device) {
                return Err(ConfigError::DuplicateDevice(*device));
            }
        }
        if self.max_response_bytes == 0 || self.max_response_bytes >= SPI_BUFFER_SIZE {
            return Err(ConfigError::ResponseLimit {
                value: self.max_response_bytes,
                limit: SPI_BUFFER_SIZE - 1,
            });
        }
        if self.hk_period_secs == 0 {
            return Err(ConfigError::ZeroPeriod);
        }
        Ok(())
    }

    /// Timer ticks between housekeeping requests.
    #[must_use]
    pub fn hk_period_ticks(&self) -> u32 {
        u32::from(self.hk_period_secs) * TICKS_PER_SECOND
    }
}
