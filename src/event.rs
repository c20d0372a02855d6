//! Event coprocessor link: byte receiver and retrospective packet boundary
//! scanner.
//!
//! The coprocessor pushes bytes without any out-of-band framing. Packets are
//! recognised after the fact by their `FF 00 FF` trailer: the scanner finds
//! the newest trailer and then tries 3-byte aligned header candidates in
//! front of it until the declared length agrees with the distance.

use crate::frame::{EOR_MARKER, FRAME_DATA_BYTES, SYNC_PAIR};
use crate::mux::{PacketSource, PacketSpan};
use crate::ring::{active_len, wrap_add, wrap_dec, wrap_inc, RingChannel};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use tracing::{debug, trace};

pub const EV_BUFFER_SIZE: usize = 1024;
pub const EVENT_PACKET_QUEUE: usize = 16;

/// Longest run queued verbatim when no packet structure is found.
pub const EV_DUMP_SIZE: usize = EV_BUFFER_SIZE - (EV_BUFFER_SIZE % FRAME_DATA_BYTES);
pub const EV_MIN_SIZE: usize = 9;
pub const EV_MAX_SIZE: usize = 264;

pub const EVFIX_HEAD: u8 = 0xDB;
pub const EVVAR_HEAD: u8 = 0xDC;

/// Housekeeping packets from the coprocessor carry this ID after the header.
pub const EVHK_ID: u8 = 0xDE;
pub const EVHK_ID_OFFSET: usize = 4;

const_assert_eq!(EV_DUMP_SIZE % FRAME_DATA_BYTES, 0);
const_assert_eq!(EV_MAX_SIZE % 3, 0);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PacketKind {
    #[default]
    Framed,
    Dump,
}

/// Byte range `[header, eor]` inside the event ring.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacketEvent {
    pub header: usize,
    pub eor: usize,
    pub kind: PacketKind,
}

impl PacketEvent {
    #[must_use]
    pub const fn len(&self) -> usize {
        active_len(self.header, self.eor, EV_BUFFER_SIZE) + 1
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct EventStats {
    pub bytes_received: u32,
    pub bytes_overwritten: u32,
    pub packets_found: u32,
    pub dumps_queued: u32,
    pub packets_dropped: u32,
}

#[derive(Debug, Clone)]
pub struct EventReceiver {
    ring: RingChannel<u8, EV_BUFFER_SIZE>,
    packets: RingChannel<PacketEvent, EVENT_PACKET_QUEUE>,
    write_last: usize,
    stats: EventStats,
}

impl EventReceiver {
    pub fn new() -> Self {
        Self {
            ring: RingChannel::new(),
            packets: RingChannel::new(),
            write_last: 0,
            stats: EventStats::default(),
        }
    }

    /// Interrupt side: append received bytes, dropping the oldest on overrun.
    pub fn receive(&mut self, bytes: &[u8]) {
        for &byte in bytes {
            if self.ring.push_overwrite(byte) {
                self.stats.bytes_overwritten = self.stats.bytes_overwritten.wrapping_add(1);
            }
        }
        self.stats.bytes_received = self.stats.bytes_received.wrapping_add(bytes.len() as u32);
    }

    /// Locate at most one new packet boundary. Returns the number of packet
    /// events queued (0, 1 or 2).
    pub fn scan(&mut self) -> usize {
        let write = self.ring.write_index();
        if write == self.write_last || self.ring.is_empty() || !self.packets.can_accept(1) {
            return 0;
        }
        self.write_last = write;

        let cur_read = self
            .packets
            .newest()
            .map_or(self.ring.read_index(), |last| wrap_inc(last.eor, EV_BUFFER_SIZE));
        let mut n_bytes = active_len(cur_read, write, EV_BUFFER_SIZE);

        if n_bytes >= EV_DUMP_SIZE {
            let eor = wrap_add(cur_read, EV_DUMP_SIZE - 1, EV_BUFFER_SIZE);
            debug!(start = cur_read, "no packet structure within dump window");
            self.enqueue(cur_read, eor, PacketKind::Dump);
            return 1;
        }

        let mut cur_eor = wrap_dec(write, EV_BUFFER_SIZE);
        while n_bytes >= EV_MIN_SIZE {
            if self.is_trailer(cur_eor) {
                return self.match_header(cur_read, cur_eor);
            }
            n_bytes -= 1;
            cur_eor = wrap_dec(cur_eor, EV_BUFFER_SIZE);
        }
        0
    }

    fn is_trailer(&self, eor: usize) -> bool {
        *self.ring.get(eor) == EOR_MARKER[2]
            && *self.ring.get(wrap_dec(eor, EV_BUFFER_SIZE)) == EOR_MARKER[1]
            && *self.ring.get(wrap_add(eor, EV_BUFFER_SIZE - 2, EV_BUFFER_SIZE)) == EOR_MARKER[0]
    }

    fn implied_len(&self, header: usize) -> Option<usize> {
        match *self.ring.get(header) {
            EVVAR_HEAD => Some(usize::from(*self.ring.get(header + 3)) + EV_MIN_SIZE),
            EVFIX_HEAD => Some(EV_MIN_SIZE),
            _ => None,
        }
    }

    fn has_sync(&self, header: usize) -> bool {
        *self.ring.get(header + 1) == SYNC_PAIR[0] && *self.ring.get(header + 2) == SYNC_PAIR[1]
    }

    fn match_header(&mut self, start_read: usize, eor: usize) -> usize {
        let mut cur_read = start_read;
        let mut expected = active_len(cur_read, eor, EV_BUFFER_SIZE) + 1;

        let misalign = expected % 3;
        if misalign != 0 && misalign < expected {
            expected -= misalign;
            cur_read = wrap_add(cur_read, misalign, EV_BUFFER_SIZE);
        }
        if expected > EV_MAX_SIZE {
            cur_read = wrap_add(eor, EV_BUFFER_SIZE + 1 - EV_MAX_SIZE, EV_BUFFER_SIZE);
            expected = EV_MAX_SIZE;
        }

        while expected >= EV_MIN_SIZE {
            let accepted = self
                .implied_len(cur_read)
                .is_some_and(|implied| implied + 2 >= expected && implied <= expected)
                && self.has_sync(cur_read);
            if accepted {
                let mut queued = 0;
                if cur_read != start_read {
                    self.enqueue(start_read, wrap_dec(cur_read, EV_BUFFER_SIZE), PacketKind::Dump);
                    queued += 1;
                }
                if self.packets.can_accept(1) {
                    self.enqueue(cur_read, eor, PacketKind::Framed);
                    queued += 1;
                }
                return queued;
            }
            expected -= 3;
            cur_read = wrap_add(cur_read, 3, EV_BUFFER_SIZE);
        }
        trace!(eor, "trailer without matching header");
        0
    }

    fn enqueue(&mut self, header: usize, eor: usize, kind: PacketKind) {
        let packet = PacketEvent { header, eor, kind };
        if self.packets.push(packet).is_err() {
            self.stats.packets_dropped = self.stats.packets_dropped.wrapping_add(1);
            return;
        }
        match kind {
            PacketKind::Framed => self.stats.packets_found = self.stats.packets_found.wrapping_add(1),
            PacketKind::Dump => self.stats.dumps_queued = self.stats.dumps_queued.wrapping_add(1),
        }
    }

    /// Whether the packet carries the housekeeping ID. Dumps are checked the
    /// same way as framed packets.
    #[must_use]
    pub fn is_housekeeping(&self, packet: &PacketEvent) -> bool {
        *self.ring.get(packet.header + EVHK_ID_OFFSET) == EVHK_ID
    }

    #[must_use]
    pub fn pending_packets(&self) -> usize {
        self.packets.len()
    }

    #[must_use]
    pub fn peek_packet(&self) -> Option<PacketEvent> {
        self.packets.peek().copied()
    }

    /// Bytes covered by a queued packet, in order, for inspection.
    #[must_use]
    pub fn packet_bytes(&self, packet: &PacketEvent) -> heapless::Vec<u8, EV_BUFFER_SIZE> {
        let mut out = heapless::Vec::new();
        let mut idx = packet.header;
        for _ in 0..packet.len() {
            if out.push(*self.ring.get(idx)).is_err() {
                break;
            }
            idx = wrap_inc(idx, EV_BUFFER_SIZE);
        }
        out
    }

    #[must_use]
    pub fn buffered(&self) -> usize {
        self.ring.len()
    }

    #[must_use]
    pub const fn stats(&self) -> EventStats {
        self.stats
    }
}

impl Default for EventReceiver {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketSource for EventReceiver {
    fn next_packet(&self) -> Option<PacketSpan> {
        self.packets.peek().map(|p| PacketSpan {
            slot: 0,
            start: p.header,
            len: p.len(),
        })
    }

    fn chunk(&self, _span: &PacketSpan, start: usize, max_len: usize) -> &[u8] {
        self.ring.contiguous(start, max_len)
    }

    fn release(&mut self, _span: &PacketSpan, next_read: usize) {
        self.ring.release_to(next_read);
    }

    fn finish_packet(&mut self) {
        self.packets.retire();
    }

    fn capacity(&self, _span: &PacketSpan) -> usize {
        EV_BUFFER_SIZE
    }
}
