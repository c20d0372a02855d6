//! Fixed 34-byte output frames and the sequenced frame ring they live in.

use crate::counters::CounterMode;
use crate::hal::{ByteSink, LinkError};
use crate::ring::{active_len, wrap_inc};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;

pub const FRAME_DATA_BYTES: usize = 27;
pub const FRAME_HEADER_BYTES: usize = 7;
pub const FRAME_BYTES: usize = FRAME_HEADER_BYTES + FRAME_DATA_BYTES;
pub const FRAME_BUFFER_BLOCKS: usize = 6;
pub const FRAME_BUFFER_SIZE: usize = 256 * FRAME_BUFFER_BLOCKS;

pub const FRAME_SYNC: [u8; 2] = [0x55, 0xAB];
/// Two bytes that follow every packet header byte.
pub const SYNC_PAIR: [u8; 2] = [0x00, 0xFF];
/// End-of-record marker in wire order.
pub const EOR_MARKER: [u8; 3] = [0xFF, 0x00, 0xFF];
pub const NULL_HEAD: u8 = 0xF9;
pub const FILL_TRIPLET: [u8; 3] = [NULL_HEAD, SYNC_PAIR[0], SYNC_PAIR[1]];

const_assert_eq!(FRAME_BYTES, 34);
const_assert_eq!(FRAME_DATA_BYTES % 3, 0);
const_assert_eq!(FRAME_BUFFER_SIZE % 256, 0);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame truncated: {0} of 34 bytes")]
    Truncated(usize),
    #[error("bad sync word {0:02X?}")]
    BadSync([u8; 4]),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameOutput {
    pub seq_h: u8,
    pub seq_m: u8,
    pub seq_l: u8,
    pub sync: [u8; 4],
    pub data: [u8; FRAME_DATA_BYTES],
}

impl FrameOutput {
    /// Blank frame for ring slot `slot`; the low sequence byte is the slot
    /// index and never changes afterwards.
    #[must_use]
    pub const fn for_slot(slot: usize) -> Self {
        Self {
            seq_h: 0,
            seq_m: 0,
            seq_l: (slot & 0xFF) as u8,
            sync: [FRAME_SYNC[0], FRAME_SYNC[1], FRAME_SYNC[0], FRAME_SYNC[1]],
            data: [0; FRAME_DATA_BYTES],
        }
    }

    /// 24-bit sequence number.
    #[must_use]
    pub const fn sequence(&self) -> u32 {
        (self.seq_h as u32) << 16 | (self.seq_m as u32) << 8 | self.seq_l as u32
    }

    #[must_use]
    pub fn to_bytes(&self) -> [u8; FRAME_BYTES] {
        let mut out = [0u8; FRAME_BYTES];
        out[0] = self.seq_h;
        out[1] = self.seq_m;
        out[2] = self.seq_l;
        out[3..FRAME_HEADER_BYTES].copy_from_slice(&self.sync);
        out[FRAME_HEADER_BYTES..].copy_from_slice(&self.data);
        out
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, FrameError> {
        if bytes.len() < FRAME_BYTES {
            return Err(FrameError::Truncated(bytes.len()));
        }
        let mut sync = [0u8; 4];
        sync.copy_from_slice(&bytes[3..FRAME_HEADER_BYTES]);
        if sync != [FRAME_SYNC[0], FRAME_SYNC[1], FRAME_SYNC[0], FRAME_SYNC[1]] {
            return Err(FrameError::BadSync(sync));
        }
        let mut data = [0u8; FRAME_DATA_BYTES];
        data.copy_from_slice(&bytes[FRAME_HEADER_BYTES..FRAME_BYTES]);
        Ok(Self {
            seq_h: bytes[0],
            seq_m: bytes[1],
            seq_l: bytes[2],
            sync,
            data,
        })
    }
}

impl Default for FrameOutput {
    fn default() -> Self {
        Self::for_slot(0)
    }
}

/// The two independent slow readers of the frame ring.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Consumer {
    /// RS232 high-rate link.
    Primary,
    /// USB.
    Secondary,
}

impl Consumer {
    pub const ALL: [Self; 2] = [Self::Primary, Self::Secondary];

    const fn index(self) -> usize {
        match self {
            Self::Primary => 0,
            Self::Secondary => 1,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct FrameRingStats {
    pub frames_written: u32,
    pub frames_sent: [u32; 2],
    pub link_errors: u32,
}

/// Frame ring with one writer and two consumer cursors.
///
/// The slot at `write` is the one being filled. Completing it advances
/// `write`; a consumer whose cursor is overtaken loses its oldest frame and
/// has its drop counter bumped.
#[derive(Debug, Clone)]
pub struct FrameRing {
    frames: [FrameOutput; FRAME_BUFFER_SIZE],
    write: usize,
    read: [usize; 2],
    dropped: [u16; 2],
    seq_high: u16,
    mode: CounterMode,
    stats: FrameRingStats,
}

impl FrameRing {
    pub fn new(mode: CounterMode) -> Self {
        Self {
            frames: core::array::from_fn(FrameOutput::for_slot),
            write: 0,
            read: [0; 2],
            dropped: [0; 2],
            seq_high: 0,
            mode,
            stats: FrameRingStats::default(),
        }
    }

    pub fn current_mut(&mut self) -> &mut FrameOutput {
        &mut self.frames[self.write]
    }

    /// Write the running high/middle sequence bytes into the slot being filled.
    pub fn stamp_sequence(&mut self) {
        let [seq_h, seq_m] = self.seq_high.to_be_bytes();
        let frame = &mut self.frames[self.write];
        frame.seq_h = seq_h;
        frame.seq_m = seq_m;
    }

    /// Publish the slot being filled and start the next one.
    pub fn advance(&mut self) {
        if self.frames[self.write].seq_l == 0xFF {
            self.seq_high = self.seq_high.wrapping_add(1);
        }
        self.write = wrap_inc(self.write, FRAME_BUFFER_SIZE);
        for consumer in Consumer::ALL {
            let i = consumer.index();
            if self.read[i] == self.write {
                self.read[i] = wrap_inc(self.read[i], FRAME_BUFFER_SIZE);
                self.mode.bump_u16(&mut self.dropped[i]);
            }
        }
        self.stats.frames_written = self.stats.frames_written.wrapping_add(1);
        self.stamp_sequence();
    }

    /// Pad the slot being filled from `fill` to the end and publish it:
    /// zeros up to 3-byte alignment, then filler triplets.
    pub fn pad_and_advance(&mut self, fill: usize) {
        debug_assert!(fill < FRAME_DATA_BYTES, "pad position {fill} past frame payload");
        let data = &mut self.frames[self.write].data;
        let mut pos = fill;
        let zeros = (3 - pos % 3) % 3;
        data[pos..pos + zeros].fill(0);
        pos += zeros;
        while pos < FRAME_DATA_BYTES {
            data[pos..pos + 3].copy_from_slice(&FILL_TRIPLET);
            pos += 3;
        }
        self.advance();
    }

    #[must_use]
    pub const fn pending(&self, consumer: Consumer) -> usize {
        active_len(self.read[consumer.index()], self.write, FRAME_BUFFER_SIZE)
    }

    #[must_use]
    pub fn peek(&self, consumer: Consumer) -> Option<&FrameOutput> {
        if self.pending(consumer) == 0 {
            None
        } else {
            Some(&self.frames[self.read[consumer.index()]])
        }
    }

    pub fn consume(&mut self, consumer: Consumer) -> Option<FrameOutput> {
        let frame = self.peek(consumer).copied()?;
        let i = consumer.index();
        self.read[i] = wrap_inc(self.read[i], FRAME_BUFFER_SIZE);
        Some(frame)
    }

    /// Offer the consumer's next frame to its link. Returns whether a frame
    /// was handed over.
    pub fn serve<S: ByteSink>(&mut self, consumer: Consumer, link: &mut S) -> Result<bool, LinkError> {
        let Some(frame) = self.peek(consumer) else {
            return Ok(false);
        };
        match link.write(&frame.to_bytes()) {
            Ok(()) => {
                let i = consumer.index();
                self.read[i] = wrap_inc(self.read[i], FRAME_BUFFER_SIZE);
                self.stats.frames_sent[i] = self.stats.frames_sent[i].wrapping_add(1);
                Ok(true)
            }
            Err(nb::Error::WouldBlock) => Ok(false),
            Err(nb::Error::Other(e)) => {
                self.stats.link_errors = self.stats.link_errors.wrapping_add(1);
                Err(e)
            }
        }
    }

    #[must_use]
    pub const fn dropped(&self, consumer: Consumer) -> u16 {
        self.dropped[consumer.index()]
    }

    /// Primary backlog as a percentage of the ring.
    #[must_use]
    pub const fn fill_percent(&self) -> u8 {
        (self.pending(Consumer::Primary) * 100 / FRAME_BUFFER_SIZE) as u8
    }

    #[must_use]
    pub const fn write_index(&self) -> usize {
        self.write
    }

    #[must_use]
    pub const fn stats(&self) -> FrameRingStats {
        self.stats
    }
}

const SEQUENCE_MODULUS: u32 = 1 << 24;

/// Sequence continuity over a captured frame stream.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SequenceCheck {
    last: Option<u32>,
    pub frames: u32,
    pub gaps: u32,
    pub missing: u32,
}

impl SequenceCheck {
    /// Record one frame. Returns the number of frames skipped before it, if any.
    pub fn observe(&mut self, frame: &FrameOutput) -> Option<u32> {
        let seq = frame.sequence();
        self.frames = self.frames.wrapping_add(1);
        let skipped = self.last.and_then(|last| {
            let distance = (seq + SEQUENCE_MODULUS - last) % SEQUENCE_MODULUS;
            (distance != 1).then(|| distance.saturating_sub(1))
        });
        if let Some(n) = skipped {
            self.gaps = self.gaps.wrapping_add(1);
            self.missing = self.missing.wrapping_add(n);
        }
        self.last = Some(seq);
        skipped
    }
}
