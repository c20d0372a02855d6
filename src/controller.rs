//! Cooperative main loop tying every component together.
//!
//! [`DaqController::poll`] is one pass of the foreground loop. The `on_*`
//! methods are the interrupt-side producers; a host that calls them from
//! other threads wraps the controller in a mutex.

use crate::command::{
    CommandEngine, CommandError, CommandSource, CommandStats, CommandWord, DrainOutcome, ParseEvent, SelfCommand,
};
use crate::config::{ConfigError, ControllerConfig};
use crate::counters::{PulseChannel, PulseCounters};
use crate::event::{EventReceiver, EventStats};
use crate::frame::{Consumer, FrameRingStats};
use crate::hal::{Hardware, LinkError};
use crate::housekeeping::{
    AuxTelemetry, CycleStamp, HousekeepingCollector, HousekeepingStats, HousekeepingStep, RecordSnapshot,
};
use crate::i2c::{I2cError, I2cScheduler, I2cStats, I2cStep};
use crate::lowrate::{LowRateLink, LowRateOutcome, LowRateStats};
use crate::mux::{FrameMultiplexer, MuxStats, PacketOrigin};
use crate::poller::{BusPoller, PollError, PollStep, PollerStats};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const MAX_PASS_ERRORS: usize = 4;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),
    #[error("command: {0}")]
    Command(#[from] CommandError),
    #[error("link: {0}")]
    Link(#[from] LinkError),
    #[error("i2c: {0}")]
    I2c(#[from] I2cError),
    #[error("instrument bus: {0}")]
    Poll(#[from] PollError),
    #[error("science request dropped, low-rate link busy")]
    LowRateBusy,
}

/// What one main-loop pass did.
#[derive(Debug, Default)]
pub struct PassReport {
    pub forwarded: Option<(CommandSource, CommandWord)>,
    pub self_command: Option<SelfCommand>,
    pub packets_found: usize,
    pub frames_served: usize,
    pub framed: Option<PacketOrigin>,
    pub housekeeping: Option<HousekeepingStep>,
    pub low_rate: Option<LowRateOutcome>,
    pub poll: Option<PollStep>,
    pub i2c: Option<I2cStep>,
    /// Errors raised during the pass, oldest first.
    pub errors: heapless::Vec<ControllerError, MAX_PASS_ERRORS>,
    /// Errors that did not fit in `errors`.
    pub overflowed: usize,
}

impl PassReport {
    fn record(&mut self, error: impl Into<ControllerError>) {
        if self.errors.push(error.into()).is_err() {
            self.overflowed += 1;
        }
    }
}

/// Serializable status snapshot.
#[derive(Debug, Clone, Serialize)]
pub struct ControllerStatus {
    pub passes: u64,
    pub general_errors: u8,
    pub command_count: u16,
    pub command_errors: u8,
    pub fifo_percent: u8,
    pub frames_dropped: [u16; 2],
    pub busy: bool,
    pub pulse_totals: [u32; 4],
    pub commands: CommandStats,
    pub events: EventStats,
    pub poller: PollerStats,
    pub frames: FrameRingStats,
    pub mux: MuxStats,
    pub i2c: I2cStats,
    pub housekeeping: HousekeepingStats,
    pub low_rate: LowRateStats,
    pub last_record: RecordSnapshot,
}

#[derive(Debug, Clone)]
pub struct DaqController {
    config: ControllerConfig,
    commands: CommandEngine,
    events: EventReceiver,
    poller: BusPoller,
    mux: FrameMultiplexer,
    i2c: I2cScheduler,
    housekeeping: HousekeepingCollector,
    low_rate: LowRateLink,
    pulses: PulseCounters,
    general_errors: u8,
    ticks: u32,
    passes: u64,
}

impl DaqController {
    pub fn new(config: ControllerConfig) -> Result<Self, ControllerError> {
        config.validate()?;
        let mode = config.counter_mode;
        info!(devices = config.bus_devices.len(), ?mode, "controller configured");
        Ok(Self {
            commands: CommandEngine::new(config.command_priority, mode),
            events: EventReceiver::new(),
            poller: BusPoller::new(&config.bus_devices, config.max_response_bytes),
            mux: FrameMultiplexer::new(mode, config.event_copy_mode),
            i2c: I2cScheduler::new(config.i2c_max_retries),
            housekeeping: HousekeepingCollector::new(config.busy_high_percent, config.busy_low_percent, mode),
            low_rate: LowRateLink::new(),
            pulses: PulseCounters::default(),
            general_errors: 0,
            ticks: 0,
            passes: 0,
            config,
        })
    }

    /// One foreground pass: command drain, self-command interpreter, event
    /// scan, frame multiplexer, housekeeping, low-rate service, bus poller,
    /// I2C scheduler.
    pub fn poll<H: Hardware>(&mut self, hw: &mut H) -> PassReport {
        let mut report = PassReport::default();
        self.passes = self.passes.wrapping_add(1);

        match self.commands.drain(hw.command_link()) {
            Ok(DrainOutcome::Forwarded(source, word)) => report.forwarded = Some((source, word)),
            Ok(DrainOutcome::Busy | DrainOutcome::Empty) => {}
            Err(e) => {
                self.bump_general_errors();
                warn!("command link: {}", e);
                report.record(e);
            }
        }

        match self.commands.interpret() {
            Ok(command) => report.self_command = command,
            Err(e) => report.record(e),
        }

        report.packets_found = self.events.scan();

        {
            let (primary, secondary) = hw.frame_links();
            report.frames_served = self.mux.service_consumers(primary, secondary);
        }
        report.framed = self.mux.run(
            &mut self.events,
            &mut self.poller,
            &mut self.housekeeping,
            self.low_rate.event_hk_mut(),
        );

        let aux = self.aux_telemetry();
        let step = self.housekeeping.check(&mut self.i2c, hw.die_temperature(), &aux);
        if let HousekeepingStep::Completed(cycle) = step {
            if cycle.die_temp_failed {
                self.bump_general_errors();
            }
            if let Some(busy) = cycle.busy_changed {
                info!(busy, fifo = aux.fifo_percent, "busy line changed");
                hw.set_busy(busy);
            }
        }
        report.housekeeping = Some(step);

        let requested = self.commands.take_science_request();
        let main_hk = self.housekeeping.last_complete().main_hk();
        match self.low_rate.service(requested, main_hk, hw.low_rate_link()) {
            Ok(outcome) => {
                if outcome == LowRateOutcome::Dropped {
                    self.bump_general_errors();
                    report.record(ControllerError::LowRateBusy);
                }
                report.low_rate = Some(outcome);
            }
            Err(e) => {
                self.bump_general_errors();
                report.record(e);
            }
        }

        let poll = self.poller.step(hw.instrument_bus());
        if let PollStep::Failed(_, e) = poll {
            self.bump_general_errors();
            report.record(e);
        }
        report.poll = Some(poll);

        let i2c = self.i2c.check(hw.i2c());
        match i2c {
            I2cStep::Failed(_, e) => {
                self.bump_general_errors();
                report.record(e);
            }
            I2cStep::Retrying(_, fault) => {
                self.bump_general_errors();
                report.record(I2cError::Issue(fault));
            }
            _ => {}
        }
        report.i2c = Some(i2c);

        report
    }

    /// Bytes pushed by the event coprocessor link.
    pub fn on_event_bytes(&mut self, bytes: &[u8]) {
        self.events.receive(bytes);
    }

    pub fn on_command_byte(&mut self, source: CommandSource, byte: u8) -> Result<ParseEvent, ControllerError> {
        Ok(self.commands.receive(source, byte)?)
    }

    /// Byte clocked in from the instrument bus. Returns whether to clock
    /// another one.
    pub fn on_bus_byte(&mut self, byte: u8, more: bool) -> bool {
        self.poller.capture_byte(byte, more)
    }

    pub fn on_pulse_capture(&mut self, channel: PulseChannel, value: u16) {
        self.pulses.capture(channel, value);
    }

    /// 4 Hz timer. Raises the housekeeping request once per configured
    /// period; returns whether it did.
    pub fn on_timer_tick(&mut self, packed_time: u32) -> bool {
        self.ticks += 1;
        if self.ticks < self.config.hk_period_ticks() {
            return false;
        }
        self.ticks = 0;
        self.housekeeping.request(CycleStamp::new(packed_time, &self.pulses));
        debug!(packed_time, "housekeeping requested");
        true
    }

    /// Queue an initialization command table on one source, all or nothing.
    pub fn load_init_commands(&mut self, source: CommandSource, words: &[CommandWord]) -> Result<usize, ControllerError> {
        Ok(self.commands.load_batch(source, words)?)
    }

    fn aux_telemetry(&self) -> AuxTelemetry {
        let frames = self.mux.frames();
        AuxTelemetry {
            last_command: self.commands.last_command(),
            command_count: self.commands.command_count(),
            command_errors: self.commands.command_errors(),
            general_errors: self.general_errors,
            fifo_percent: frames.fill_percent(),
            dropped_primary: frames.dropped(Consumer::Primary),
            dropped_secondary: frames.dropped(Consumer::Secondary),
        }
    }

    fn bump_general_errors(&mut self) {
        self.config.counter_mode.bump_u8(&mut self.general_errors);
    }

    #[must_use]
    pub fn status(&self) -> ControllerStatus {
        let aux = self.aux_telemetry();
        ControllerStatus {
            passes: self.passes,
            general_errors: self.general_errors,
            command_count: aux.command_count,
            command_errors: aux.command_errors,
            fifo_percent: aux.fifo_percent,
            frames_dropped: [aux.dropped_primary, aux.dropped_secondary],
            busy: self.housekeeping.is_busy(),
            pulse_totals: PulseChannel::ALL.map(|channel| self.pulses.total(channel)),
            commands: self.commands.stats(),
            events: self.events.stats(),
            poller: self.poller.stats(),
            frames: self.mux.frames().stats(),
            mux: self.mux.stats(),
            i2c: self.i2c.stats(),
            housekeeping: self.housekeeping.stats(),
            low_rate: self.low_rate.stats(),
            last_record: self.housekeeping.last_complete().into(),
        }
    }

    #[must_use]
    pub const fn config(&self) -> &ControllerConfig {
        &self.config
    }

    #[must_use]
    pub const fn general_errors(&self) -> u8 {
        self.general_errors
    }

    #[must_use]
    pub const fn commands(&self) -> &CommandEngine {
        &self.commands
    }

    #[must_use]
    pub const fn events(&self) -> &EventReceiver {
        &self.events
    }

    #[must_use]
    pub const fn poller(&self) -> &BusPoller {
        &self.poller
    }

    #[must_use]
    pub const fn mux(&self) -> &FrameMultiplexer {
        &self.mux
    }

    #[must_use]
    pub const fn i2c(&self) -> &I2cScheduler {
        &self.i2c
    }

    #[must_use]
    pub const fn housekeeping(&self) -> &HousekeepingCollector {
        &self.housekeeping
    }

    #[must_use]
    pub const fn low_rate(&self) -> &LowRateLink {
        &self.low_rate
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_invalid_config() {
        let config = ControllerConfig {
            hk_period_secs: 0,
            ..ControllerConfig::default()
        };
        assert!(matches!(DaqController::new(config), Err(ControllerError::Config(ConfigError::ZeroPeriod))));
    }

    #[test]
    fn test_timer_period() {
        let mut controller = DaqController::new(ControllerConfig {
            hk_period_secs: 1,
            ..ControllerConfig::default()
        })
        .unwrap();
        let raised: Vec<bool> = (0..8).map(|_| controller.on_timer_tick(0)).collect();
        assert_eq!(raised, [false, false, false, true, false, false, false, true]);
    }

    #[test]
    fn test_pass_report_counts_errors_past_capacity() {
        let mut report = PassReport::default();
        for _ in 0..MAX_PASS_ERRORS + 2 {
            report.record(ControllerError::LowRateBusy);
        }
        assert_eq!(report.errors.len(), MAX_PASS_ERRORS);
        assert_eq!(report.overflowed, 2);
    }

    #[test]
    fn test_command_bytes_reach_engine() {
        let mut controller = DaqController::new(ControllerConfig::default()).unwrap();
        let mut last = ParseEvent::Pending;
        for byte in [0x10, 0x14, 0x02, 0xAB, 0xCD, 0x03] {
            last = controller.on_command_byte(CommandSource::Usb, byte).unwrap();
        }
        assert_eq!(last, ParseEvent::Command(CommandWord::new(0xAB, 0xCD)));
        assert_eq!(controller.commands().pending(CommandSource::Usb), 1);
    }
}
