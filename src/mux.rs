//! Frame output multiplexer.
//!
//! Each pass first lets both consumers take a frame, then copies at most one
//! packet into the frame ring, strictly in priority order: event packets,
//! instrument bus packets, housekeeping records.

use crate::counters::CounterMode;
use crate::event::EventReceiver;
use crate::frame::{Consumer, FrameRing, FRAME_DATA_BYTES};
use crate::hal::ByteSink;
use crate::housekeeping::HousekeepingCollector;
use crate::lowrate::EVENT_HK_BYTES;
use crate::poller::BusPoller;
use crate::ring::wrap_add;
use serde::{Deserialize, Serialize};
use tracing::{trace, warn};

/// One queued packet inside a source's storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketSpan {
    /// Source-specific storage selector (device slot for the bus poller).
    pub slot: usize,
    pub start: usize,
    pub len: usize,
}

/// A queue of packets stored in a byte ring, drained by the multiplexer.
///
/// The multiplexer is the only party that releases source storage: it calls
/// [`PacketSource::release`] after every copied chunk and
/// [`PacketSource::finish_packet`] once the whole packet is out.
pub trait PacketSource {
    fn next_packet(&self) -> Option<PacketSpan>;

    /// Longest contiguous run of at most `max_len` bytes starting at `start`.
    fn chunk(&self, span: &PacketSpan, start: usize, max_len: usize) -> &[u8];

    fn release(&mut self, span: &PacketSpan, next_read: usize);

    fn finish_packet(&mut self);

    /// Index modulus of the storage holding `span`.
    fn capacity(&self, span: &PacketSpan) -> usize;
}

/// Whether coprocessor housekeeping is mirrored into the low-rate packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventLowRateCopy {
    Disabled,
    #[default]
    EventHousekeeping,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketOrigin {
    Event,
    InstrumentBus,
    Housekeeping,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct MuxStats {
    pub event_packets: u32,
    pub bus_packets: u32,
    pub housekeeping_records: u32,
    pub bytes_copied: u32,
    pub low_rate_copies: u32,
}

#[derive(Debug, Clone)]
pub struct FrameMultiplexer {
    frames: FrameRing,
    copy_mode: EventLowRateCopy,
    stats: MuxStats,
}

impl FrameMultiplexer {
    pub fn new(mode: CounterMode, copy_mode: EventLowRateCopy) -> Self {
        Self {
            frames: FrameRing::new(mode),
            copy_mode,
            stats: MuxStats::default(),
        }
    }

    /// Hand at most one frame to each consumer. Returns the number of frames
    /// handed over.
    pub fn service_consumers<P: ByteSink, S: ByteSink>(&mut self, primary: &mut P, secondary: &mut S) -> usize {
        let mut served = 0;
        match self.frames.serve(Consumer::Primary, primary) {
            Ok(true) => served += 1,
            Ok(false) => {}
            Err(e) => warn!("primary frame link: {}", e),
        }
        match self.frames.serve(Consumer::Secondary, secondary) {
            Ok(true) => served += 1,
            Ok(false) => {}
            Err(e) => warn!("secondary frame link: {}", e),
        }
        served
    }

    /// Copy the highest-priority pending packet into frames.
    pub fn run(
        &mut self,
        events: &mut EventReceiver,
        poller: &mut BusPoller,
        housekeeping: &mut HousekeepingCollector,
        event_hk: &mut [u8; EVENT_HK_BYTES],
    ) -> Option<PacketOrigin> {
        if let Some(packet) = events.peek_packet() {
            let mirror = self.copy_mode == EventLowRateCopy::EventHousekeeping && events.is_housekeeping(&packet);
            let side = if mirror {
                self.stats.low_rate_copies = self.stats.low_rate_copies.wrapping_add(1);
                Some(event_hk)
            } else {
                None
            };
            self.copy_packet(events, side);
            self.stats.event_packets = self.stats.event_packets.wrapping_add(1);
            return Some(PacketOrigin::Event);
        }
        if self.copy_packet(poller, None) {
            self.stats.bus_packets = self.stats.bus_packets.wrapping_add(1);
            return Some(PacketOrigin::InstrumentBus);
        }
        if self.copy_packet(housekeeping, None) {
            self.stats.housekeeping_records = self.stats.housekeeping_records.wrapping_add(1);
            return Some(PacketOrigin::Housekeeping);
        }
        None
    }

    /// Copy the head packet of `source` into consecutive frames, padding the
    /// last one. With `side` set, the final bytes before the packet's own
    /// trailer are mirrored into it.
    pub fn copy_packet<S: PacketSource>(&mut self, source: &mut S, side: Option<&mut [u8; EVENT_HK_BYTES]>) -> bool {
        let Some(span) = source.next_packet() else {
            return false;
        };
        let capacity = source.capacity(&span);

        // Mirror window in packet offsets, trailer excluded.
        let mirror_end = span.len.saturating_sub(3);
        let mirror_start = mirror_end.saturating_sub(EVENT_HK_BYTES);
        let mut side = side;

        self.frames.stamp_sequence();
        let mut cursor = span.start;
        let mut offset = 0;
        let mut fill = 0;
        while offset < span.len {
            let want = (FRAME_DATA_BYTES - fill).min(span.len - offset);
            let chunk = source.chunk(&span, cursor, want);
            let n = chunk.len();
            if n == 0 {
                break;
            }
            self.frames.current_mut().data[fill..fill + n].copy_from_slice(chunk);

            if let Some(dest) = side.as_deref_mut() {
                let lo = offset.max(mirror_start);
                let hi = (offset + n).min(mirror_end);
                if lo < hi {
                    dest[lo - mirror_start..hi - mirror_start].copy_from_slice(&chunk[lo - offset..hi - offset]);
                }
            }

            fill += n;
            offset += n;
            cursor = wrap_add(cursor, n, capacity);
            source.release(&span, cursor);
            if fill == FRAME_DATA_BYTES {
                self.frames.advance();
                fill = 0;
            }
        }
        if fill > 0 {
            self.frames.pad_and_advance(fill);
        }
        source.finish_packet();
        self.stats.bytes_copied = self.stats.bytes_copied.wrapping_add(offset as u32);
        trace!(len = span.len, "packet framed");
        true
    }

    #[must_use]
    pub const fn frames(&self) -> &FrameRing {
        &self.frames
    }

    pub fn frames_mut(&mut self) -> &mut FrameRing {
        &mut self.frames
    }

    #[must_use]
    pub const fn stats(&self) -> MuxStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FILL_TRIPLET;

    /// Contiguous packet list for driving the copy loop directly.
    struct Packets {
        bytes: Vec<u8>,
        spans: Vec<PacketSpan>,
        released: usize,
    }

    impl PacketSource for Packets {
        fn next_packet(&self) -> Option<PacketSpan> {
            self.spans.first().copied()
        }

        fn chunk(&self, _span: &PacketSpan, start: usize, max_len: usize) -> &[u8] {
            let end = (start + max_len).min(self.bytes.len());
            &self.bytes[start..end]
        }

        fn release(&mut self, _span: &PacketSpan, next_read: usize) {
            self.released = next_read;
        }

        fn finish_packet(&mut self) {
            self.spans.remove(0);
        }

        fn capacity(&self, _span: &PacketSpan) -> usize {
            self.bytes.len() + 1
        }
    }

    fn single(bytes: &[u8]) -> Packets {
        Packets {
            bytes: bytes.to_vec(),
            spans: vec![PacketSpan { slot: 0, start: 0, len: bytes.len() }],
            released: 0,
        }
    }

    #[test]
    fn test_short_packet_padding() {
        let mut mux = FrameMultiplexer::new(CounterMode::Wrapping, EventLowRateCopy::Disabled);
        let input: Vec<u8> = (1..=10).collect();
        let mut source = single(&input);
        assert!(mux.copy_packet(&mut source, None));
        assert_eq!(source.released, 10);

        let frame = mux.frames_mut().consume(Consumer::Primary).unwrap();
        assert_eq!(&frame.data[..10], input.as_slice());
        assert_eq!(&frame.data[10..12], &[0, 0]);
        for triplet in frame.data[12..].chunks(3) {
            assert_eq!(triplet, &FILL_TRIPLET);
        }
        assert!(mux.frames_mut().consume(Consumer::Primary).is_none());
    }

    #[test]
    fn test_single_zero_pad_for_remainder_two() {
        let mut mux = FrameMultiplexer::new(CounterMode::Wrapping, EventLowRateCopy::Disabled);
        let mut source = single(&[7u8; 29]);
        mux.copy_packet(&mut source, None);
        let frames = mux.frames_mut();
        let first = frames.consume(Consumer::Primary).unwrap();
        assert_eq!(first.data, [7u8; FRAME_DATA_BYTES]);
        let second = frames.consume(Consumer::Primary).unwrap();
        assert_eq!(&second.data[..3], &[7, 7, 0]);
        assert_eq!(&second.data[3..6], &FILL_TRIPLET);
    }

    #[test]
    fn test_exact_multiple_needs_no_pad_frame() {
        let mut mux = FrameMultiplexer::new(CounterMode::Wrapping, EventLowRateCopy::Disabled);
        let mut source = single(&[3u8; 54]);
        mux.copy_packet(&mut source, None);
        assert_eq!(mux.frames().pending(Consumer::Primary), 2);
    }

    #[test]
    fn test_side_copy_takes_suffix_before_trailer() {
        let mut mux = FrameMultiplexer::new(CounterMode::Wrapping, EventLowRateCopy::EventHousekeeping);
        let mut packet: Vec<u8> = (0..100u32).map(|i| i as u8).collect();
        packet.extend_from_slice(&[0xFF, 0x00, 0xFF]);
        let mut source = single(&packet);
        let mut hk = [0u8; EVENT_HK_BYTES];
        mux.copy_packet(&mut source, Some(&mut hk));
        let expected: Vec<u8> = (25..100u32).map(|i| i as u8).collect();
        assert_eq!(hk.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_side_copy_short_packet_fills_prefix() {
        let mut mux = FrameMultiplexer::new(CounterMode::Wrapping, EventLowRateCopy::EventHousekeeping);
        let packet = [1u8, 2, 3, 4, 0xFF, 0x00, 0xFF];
        let mut source = single(&packet);
        let mut hk = [0xEEu8; EVENT_HK_BYTES];
        mux.copy_packet(&mut source, Some(&mut hk));
        assert_eq!(&hk[..4], &[1, 2, 3, 4]);
        assert_eq!(hk[4], 0xEE);
    }
}
