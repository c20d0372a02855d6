//! Telemetry counter arithmetic and pulse-capture accumulation.

use serde::{Deserialize, Serialize};

/// Roll-over point of the 16-bit capture counters feeding [`PulseCounter`].
pub const PULSE_COUNT_MAX: u16 = 0xFFFE;

/// How 8 and 16-bit telemetry counters behave at their storage limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CounterMode {
    #[default]
    Wrapping,
    Saturating,
}

impl CounterMode {
    pub fn bump_u8(self, counter: &mut u8) {
        *counter = match self {
            Self::Wrapping => counter.wrapping_add(1),
            Self::Saturating => counter.saturating_add(1),
        };
    }

    pub fn bump_u16(self, counter: &mut u16) {
        *counter = match self {
            Self::Wrapping => counter.wrapping_add(1),
            Self::Saturating => counter.saturating_add(1),
        };
    }
}

/// Accumulates successive 16-bit capture values into a 32-bit pulse total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PulseCounter {
    last: u16,
    total: u32,
}

impl PulseCounter {
    pub fn capture(&mut self, value: u16) {
        let delta = if self.last > value {
            u32::from(PULSE_COUNT_MAX - self.last.min(PULSE_COUNT_MAX)) + u32::from(value)
        } else {
            u32::from(value - self.last)
        };
        self.total = self.total.wrapping_add(delta);
        self.last = value;
    }

    #[must_use]
    pub const fn total(&self) -> u32 {
        self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PulseChannel {
    BaroTemp1,
    BaroPres1,
    BaroTemp2,
    BaroPres2,
}

impl PulseChannel {
    pub const ALL: [Self; 4] = [Self::BaroTemp1, Self::BaroPres1, Self::BaroTemp2, Self::BaroPres2];

    const fn index(self) -> usize {
        match self {
            Self::BaroTemp1 => 0,
            Self::BaroPres1 => 1,
            Self::BaroTemp2 => 2,
            Self::BaroPres2 => 3,
        }
    }
}

/// The four barometer frequency counters sampled by the capture interrupt.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PulseCounters {
    channels: [PulseCounter; 4],
}

impl PulseCounters {
    pub fn capture(&mut self, channel: PulseChannel, value: u16) {
        self.channels[channel.index()].capture(value);
    }

    #[must_use]
    pub fn total(&self, channel: PulseChannel) -> u32 {
        self.channels[channel.index()].total()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_modes() {
        let mut wrap = 0xFFu8;
        CounterMode::Wrapping.bump_u8(&mut wrap);
        assert_eq!(wrap, 0);

        let mut sat = 0xFFFFu16;
        CounterMode::Saturating.bump_u16(&mut sat);
        assert_eq!(sat, 0xFFFF);

        let mut sat = 0xFEu8;
        CounterMode::Saturating.bump_u8(&mut sat);
        CounterMode::Saturating.bump_u8(&mut sat);
        assert_eq!(sat, 0xFF);
    }

    #[test]
    fn test_pulse_rollover() {
        let mut counter = PulseCounter::default();
        counter.capture(100);
        counter.capture(300);
        assert_eq!(counter.total(), 300);

        // counter restarts after PULSE_COUNT_MAX
        counter.capture(20);
        assert_eq!(counter.total(), 300 + u32::from(PULSE_COUNT_MAX - 300) + 20);
    }

    #[test]
    fn test_channels_are_independent() {
        let mut counters = PulseCounters::default();
        counters.capture(PulseChannel::BaroPres2, 50);
        assert_eq!(counters.total(PulseChannel::BaroPres2), 50);
        assert_eq!(counters.total(PulseChannel::BaroTemp1), 0);
    }
}
