//! Science-data summary packet for the low-rate links.

use crate::command::{DLE, ETX};
use crate::hal::{ByteSink, LinkError};
use crate::housekeeping::MAIN_HK_BYTES;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use tracing::{debug, warn};

pub const SDATA_ID: u8 = 0x53;
pub const EVENT_HK_BYTES: usize = 75;
pub const LOW_RATE_PACKET_BYTES: usize = 147;
pub const VERSION_MAJOR: u8 = 4;
pub const VERSION_MINOR: u8 = 0;

/// Bytes counted by the length field: everything after it except ETX.
const PAYLOAD_LEN: usize = LOW_RATE_PACKET_BYTES - 4;
const MAIN_HK_OFFSET: usize = 5;
const EVENT_HK_OFFSET: usize = MAIN_HK_OFFSET + MAIN_HK_BYTES;

const_assert_eq!(EVENT_HK_OFFSET + EVENT_HK_BYTES + 1, LOW_RATE_PACKET_BYTES);
const_assert_eq!(PAYLOAD_LEN, 143);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LowRateOutcome {
    Idle,
    Sent,
    /// Request arrived while the link was still sending.
    Dropped,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct LowRateStats {
    pub sent: u32,
    pub dropped: u32,
}

#[derive(Debug, Clone)]
pub struct LowRateLink {
    event_hk: [u8; EVENT_HK_BYTES],
    stats: LowRateStats,
}

impl LowRateLink {
    pub fn new() -> Self {
        Self {
            event_hk: [0; EVENT_HK_BYTES],
            stats: LowRateStats::default(),
        }
    }

    /// Latest coprocessor housekeeping mirrored by the frame multiplexer.
    #[must_use]
    pub const fn event_hk(&self) -> &[u8; EVENT_HK_BYTES] {
        &self.event_hk
    }

    pub fn event_hk_mut(&mut self) -> &mut [u8; EVENT_HK_BYTES] {
        &mut self.event_hk
    }

    #[must_use]
    pub const fn stats(&self) -> LowRateStats {
        self.stats
    }

    pub fn build_packet(&self, main_hk: &[u8]) -> [u8; LOW_RATE_PACKET_BYTES] {
        debug_assert_eq!(main_hk.len(), MAIN_HK_BYTES);
        let mut packet = [0u8; LOW_RATE_PACKET_BYTES];
        packet[0] = DLE;
        packet[1] = SDATA_ID;
        packet[2] = PAYLOAD_LEN as u8;
        packet[3] = VERSION_MAJOR;
        packet[4] = VERSION_MINOR;
        let n = main_hk.len().min(MAIN_HK_BYTES);
        packet[MAIN_HK_OFFSET..MAIN_HK_OFFSET + n].copy_from_slice(&main_hk[..n]);
        packet[EVENT_HK_OFFSET..EVENT_HK_OFFSET + EVENT_HK_BYTES].copy_from_slice(&self.event_hk);
        packet[LOW_RATE_PACKET_BYTES - 1] = ETX;
        packet
    }

    /// Answer a pending science-data request.
    pub fn service<L: ByteSink>(&mut self, requested: bool, main_hk: &[u8], link: &mut L) -> Result<LowRateOutcome, LinkError> {
        if !requested {
            return Ok(LowRateOutcome::Idle);
        }
        if !link.is_idle() {
            self.stats.dropped = self.stats.dropped.wrapping_add(1);
            warn!("science request dropped, low-rate link busy");
            return Ok(LowRateOutcome::Dropped);
        }
        let packet = self.build_packet(main_hk);
        match link.write(&packet) {
            Ok(()) => {
                self.stats.sent = self.stats.sent.wrapping_add(1);
                debug!("low-rate packet sent");
                Ok(LowRateOutcome::Sent)
            }
            Err(nb::Error::WouldBlock) => {
                self.stats.dropped = self.stats.dropped.wrapping_add(1);
                Ok(LowRateOutcome::Dropped)
            }
            Err(nb::Error::Other(e)) => Err(e),
        }
    }
}

impl Default for LowRateLink {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Capture {
        idle: bool,
        sent: Vec<u8>,
    }

    impl ByteSink for Capture {
        fn is_idle(&mut self) -> bool {
            self.idle
        }

        fn write(&mut self, bytes: &[u8]) -> nb::Result<(), LinkError> {
            self.sent.extend_from_slice(bytes);
            Ok(())
        }
    }

    #[test]
    fn test_packet_layout() {
        let mut link = LowRateLink::new();
        link.event_hk_mut().fill(0xEE);
        let main = [0x11u8; MAIN_HK_BYTES];
        let packet = link.build_packet(&main);
        assert_eq!(&packet[..5], &[0x10, 0x53, 143, 4, 0]);
        assert_eq!(packet[5], 0x11);
        assert_eq!(packet[70], 0x11);
        assert_eq!(packet[71], 0xEE);
        assert_eq!(packet[145], 0xEE);
        assert_eq!(packet[146], ETX);
    }

    #[test]
    fn test_busy_link_drops_request() {
        let mut link = LowRateLink::new();
        let mut sink = Capture { idle: false, sent: Vec::new() };
        let main = [0u8; MAIN_HK_BYTES];
        assert_eq!(link.service(true, &main, &mut sink), Ok(LowRateOutcome::Dropped));
        assert!(sink.sent.is_empty());

        sink.idle = true;
        assert_eq!(link.service(true, &main, &mut sink), Ok(LowRateOutcome::Sent));
        assert_eq!(sink.sent.len(), LOW_RATE_PACKET_BYTES);
        assert_eq!(link.service(false, &main, &mut sink), Ok(LowRateOutcome::Idle));
        assert_eq!(link.stats().dropped, 1);
    }
}
