//! Narrow interfaces to the hardware collaborators.
//!
//! Everything the core touches outside its own buffers goes through these
//! traits: serial/USB byte sinks, the shared I2C master, the instrument
//! backplane select lines and the on-die temperature sensor. Non-blocking
//! operations follow the `nb` convention and report `WouldBlock` instead of
//! spinning.

use crate::poller::BusDevice;
use core::convert::Infallible;
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link disconnected")]
    Disconnected,
    #[error("transmit buffer overrun")]
    Overrun,
}

/// Outbound byte link (serial command bus, frame consumers, low-rate link).
pub trait ByteSink {
    /// True when nothing is left in the transmit path.
    fn is_idle(&mut self) -> bool;

    /// Hand `bytes` to the link as one unit. `WouldBlock` means the link
    /// cannot take them right now and nothing was queued.
    fn write(&mut self, bytes: &[u8]) -> nb::Result<(), LinkError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum BusFault {
    #[error("address not acknowledged")]
    Nack,
    #[error("arbitration lost")]
    ArbitrationLost,
    #[error("bus error")]
    BusError,
    #[error("master busy")]
    Busy,
}

/// Latched status of the I2C master after the last transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BusStatus {
    Idle,
    ReadComplete,
    WriteComplete,
    Error(BusFault),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TransferMode {
    #[default]
    Complete,
    RepeatStart,
    NoStop,
}

/// Single-master I2C peripheral driven by polling.
pub trait I2cBus {
    /// `WouldBlock` while a transfer is in flight.
    fn poll_status(&mut self) -> nb::Result<BusStatus, Infallible>;

    fn start_write(&mut self, address: u8, data: &[u8], mode: TransferMode) -> Result<(), BusFault>;

    fn start_read(&mut self, address: u8, len: usize, mode: TransferMode) -> Result<(), BusFault>;

    /// Copy the bytes of the last completed read into `buf`.
    fn read_data(&mut self, buf: &mut [u8]);

    fn clear_status(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SelectLevel {
    Low,
    High,
}

/// Instrument backplane: per-device select lines plus the shared
/// data-ready input and transfer engine.
pub trait InstrumentBus {
    fn set_select(&mut self, device: BusDevice, level: SelectLevel);

    /// Device is asserting data-ready (active low line read as `true`).
    fn data_ready(&mut self, device: BusDevice) -> bool;

    /// Clock out the first fill byte; received bytes arrive through the
    /// capture interrupt.
    fn begin_transfer(&mut self, device: BusDevice);

    /// Select-low timer stopped and no byte is in flight.
    fn transfer_idle(&mut self) -> bool;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("die temperature sensor did not respond")]
pub struct SensorFault;

pub trait DieTemperature {
    fn start(&mut self);

    fn read_celsius(&mut self) -> Result<i16, SensorFault>;
}

/// Everything one main-loop pass needs from the board.
pub trait Hardware {
    type I2c: I2cBus;
    type CommandLink: ByteSink;
    type Primary: ByteSink;
    type Secondary: ByteSink;
    type LowRate: ByteSink;
    type Bus: InstrumentBus;
    type DieTemp: DieTemperature;

    fn i2c(&mut self) -> &mut Self::I2c;
    fn command_link(&mut self) -> &mut Self::CommandLink;
    fn frame_links(&mut self) -> (&mut Self::Primary, &mut Self::Secondary);
    fn low_rate_link(&mut self) -> &mut Self::LowRate;
    fn instrument_bus(&mut self) -> &mut Self::Bus;
    fn die_temperature(&mut self) -> &mut Self::DieTemp;
    fn set_busy(&mut self, busy: bool);
}
