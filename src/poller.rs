//! Instrument bus poller.
//!
//! Rotates through the configured backplane devices. Each device gets a
//! window of main-loop passes in which its select line is raised and its
//! data-ready line watched; a response is captured byte by byte into the
//! device's own ring, bracketed with a `head 00 FF` header and a padded
//! `FF 00 FF` trailer, and its extent queued for the frame multiplexer.

use crate::frame::{EOR_MARKER, SYNC_PAIR};
use crate::hal::{InstrumentBus, SelectLevel};
use crate::mux::{PacketSource, PacketSpan};
use crate::ring::{active_len, wrap_dec, RingChannel, RingError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

pub const SPI_BUFFER_SIZE: usize = 512;
pub const MAX_BUS_DEVICES: usize = 5;
pub const PACKET_QUEUE_SIZE: usize = 16 * MAX_BUS_DEVICES;

/// Passes a device may stay silent before the poller moves on.
pub const SELECT_HIGH_LOOPS: u8 = 250;

/// Space that has to stay free while capturing so the trailer still fits.
const TRAILER_RESERVE: usize = 3;

const HEADER_BYTES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BusDevice {
    #[default]
    PowerBoard,
    Pha,
    Counter1,
    Tracker,
    Counter3,
}

impl BusDevice {
    pub const ALL: [Self; MAX_BUS_DEVICES] = [Self::PowerBoard, Self::Pha, Self::Counter1, Self::Tracker, Self::Counter3];

    /// First byte of every packet captured from this device.
    #[must_use]
    pub const fn header_byte(self) -> u8 {
        match self {
            Self::PowerBoard => 0xF6,
            Self::Pha => 0xF3,
            Self::Counter1 => 0xF8,
            Self::Tracker => 0xF4,
            Self::Counter3 => 0xFA,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PacketLocation {
    pub device: BusDevice,
    /// Position of `device` in the poll rotation; selects the byte ring.
    pub slot: usize,
    pub header: usize,
    pub eor: usize,
}

impl PacketLocation {
    #[must_use]
    pub const fn len(&self) -> usize {
        active_len(self.header, self.eor, SPI_BUFFER_SIZE) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum PollError {
    #[error("device answered data-ready with no bytes")]
    EmptyResponse,
    #[error("no room in the device ring for the record")]
    NoSpace,
    #[error("packet location queue full")]
    QueueFull,
}

impl From<RingError> for PollError {
    fn from(_: RingError) -> Self {
        Self::NoSpace
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PollState {
    AwaitingData,
    ReadingData,
    EndOfRecord,
    Error(PollError),
}

/// What one poller step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollStep {
    Idle,
    Started(BusDevice),
    TimedOut(BusDevice),
    Captured(BusDevice),
    Failed(BusDevice, PollError),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct PollerStats {
    pub responses: u32,
    pub bytes_captured: u32,
    pub timeouts: u32,
    pub errors: u32,
    pub stray_bytes: u32,
}

#[derive(Debug, Clone, Copy, Default)]
struct Capture {
    active: bool,
    header: usize,
    bytes: usize,
}

#[derive(Debug, Clone)]
pub struct BusPoller {
    devices: heapless::Vec<BusDevice, MAX_BUS_DEVICES>,
    rings: [RingChannel<u8, SPI_BUFFER_SIZE>; MAX_BUS_DEVICES],
    locations: RingChannel<PacketLocation, PACKET_QUEUE_SIZE>,
    current: usize,
    state: PollState,
    loop_count: u8,
    loop_check: u8,
    capture: Capture,
    max_response_bytes: usize,
    stats: PollerStats,
}

impl BusPoller {
    /// `devices` is the poll rotation; entries past [`MAX_BUS_DEVICES`] are
    /// ignored and an empty list falls back to the power board.
    pub fn new(devices: &[BusDevice], max_response_bytes: usize) -> Self {
        let mut list = heapless::Vec::new();
        for &device in devices.iter().take(MAX_BUS_DEVICES) {
            let _ = list.push(device);
        }
        if list.is_empty() {
            let _ = list.push(BusDevice::PowerBoard);
        }
        Self {
            devices: list,
            rings: core::array::from_fn(|_| RingChannel::new()),
            locations: RingChannel::new(),
            current: 0,
            state: PollState::AwaitingData,
            loop_count: 0,
            loop_check: 0,
            capture: Capture::default(),
            max_response_bytes: max_response_bytes.max(1),
            stats: PollerStats::default(),
        }
    }

    #[must_use]
    pub fn current_device(&self) -> BusDevice {
        self.devices[self.current]
    }

    #[must_use]
    pub fn devices(&self) -> &[BusDevice] {
        &self.devices
    }

    #[must_use]
    pub const fn state(&self) -> PollState {
        self.state
    }

    #[must_use]
    pub fn pending_packets(&self) -> usize {
        self.locations.len()
    }

    #[must_use]
    pub fn peek_packet(&self) -> Option<&PacketLocation> {
        self.locations.peek()
    }

    /// Bytes buffered for the device at rotation slot `slot`.
    #[must_use]
    pub fn buffered(&self, slot: usize) -> usize {
        self.rings.get(slot).map_or(0, RingChannel::len)
    }

    #[must_use]
    pub const fn stats(&self) -> PollerStats {
        self.stats
    }

    /// One main-loop pass of the poll state machine.
    pub fn step<B: InstrumentBus>(&mut self, bus: &mut B) -> PollStep {
        let device = self.current_device();
        let outcome = match self.state {
            PollState::AwaitingData => self.await_data(bus, device),
            PollState::ReadingData => {
                if !self.capture.active && bus.transfer_idle() {
                    self.state = match self.close_response() {
                        Ok(()) => PollState::EndOfRecord,
                        Err(e) => PollState::Error(e),
                    };
                }
                PollStep::Idle
            }
            PollState::EndOfRecord => {
                self.stats.responses = self.stats.responses.wrapping_add(1);
                self.rotate(bus);
                PollStep::Captured(device)
            }
            PollState::Error(e) => {
                self.stats.errors = self.stats.errors.wrapping_add(1);
                warn!(?device, "bus poll failed: {}", e);
                self.rotate(bus);
                PollStep::Failed(device, e)
            }
        };
        self.loop_count = self.loop_count.wrapping_add(1);
        outcome
    }

    fn await_data<B: InstrumentBus>(&mut self, bus: &mut B, device: BusDevice) -> PollStep {
        let high = self.loop_count.wrapping_sub(self.loop_check);
        if high > SELECT_HIGH_LOOPS {
            self.stats.timeouts = self.stats.timeouts.wrapping_add(1);
            self.rotate(bus);
            return PollStep::TimedOut(device);
        }
        if high <= SELECT_HIGH_LOOPS / 4 {
            bus.set_select(device, SelectLevel::Low);
            return PollStep::Idle;
        }
        bus.set_select(device, SelectLevel::High);
        if !bus.data_ready(device) {
            return PollStep::Idle;
        }
        match self.open_response(device) {
            Ok(()) => {
                bus.begin_transfer(device);
                self.state = PollState::ReadingData;
                PollStep::Started(device)
            }
            Err(e) => {
                self.state = PollState::Error(e);
                PollStep::Idle
            }
        }
    }

    /// Reserve the 3-byte packet header at the ring's write position.
    fn open_response(&mut self, device: BusDevice) -> Result<(), PollError> {
        let ring = &mut self.rings[self.current];
        if !ring.can_accept(HEADER_BYTES + 1 + TRAILER_RESERVE) {
            return Err(PollError::NoSpace);
        }
        let header = ring.write_index();
        for byte in [device.header_byte(), SYNC_PAIR[0], SYNC_PAIR[1]] {
            ring.push(byte)?;
        }
        self.capture = Capture {
            active: true,
            header,
            bytes: 0,
        };
        Ok(())
    }

    /// Interrupt side: store one received byte. `more` is false once the
    /// device released its data-ready line. Returns whether the transfer
    /// should clock out another byte.
    pub fn capture_byte(&mut self, byte: u8, more: bool) -> bool {
        if !self.capture.active {
            self.stats.stray_bytes = self.stats.stray_bytes.wrapping_add(1);
            return false;
        }
        let ring = &mut self.rings[self.current];
        if ring.push(byte).is_err() {
            self.capture.active = false;
            return false;
        }
        self.capture.bytes += 1;
        self.stats.bytes_captured = self.stats.bytes_captured.wrapping_add(1);
        if !more || ring.free() <= TRAILER_RESERVE || self.capture.bytes >= self.max_response_bytes {
            self.capture.active = false;
        }
        self.capture.active
    }

    /// Pad the captured response to 3-byte alignment, append the trailer and
    /// queue its location. On failure the response is discarded.
    fn close_response(&mut self) -> Result<(), PollError> {
        let slot = self.current;
        let device = self.devices[slot];
        let header = self.capture.header;
        let ring = &mut self.rings[slot];
        let result = seal_record(ring, &mut self.locations, device, slot, header);
        if result.is_err() {
            ring.rewind_to(header);
        }
        result
    }

    fn rotate<B: InstrumentBus>(&mut self, bus: &mut B) {
        bus.set_select(self.current_device(), SelectLevel::Low);
        self.capture.active = false;
        self.current = (self.current + 1) % self.devices.len();
        bus.set_select(self.current_device(), SelectLevel::Low);
        self.state = PollState::AwaitingData;
        self.loop_check = self.loop_count;
    }
}

fn seal_record(
    ring: &mut RingChannel<u8, SPI_BUFFER_SIZE>,
    locations: &mut RingChannel<PacketLocation, PACKET_QUEUE_SIZE>,
    device: BusDevice,
    slot: usize,
    header: usize,
) -> Result<(), PollError> {
    let written = active_len(header, ring.write_index(), SPI_BUFFER_SIZE);
    if written <= HEADER_BYTES {
        return Err(PollError::EmptyResponse);
    }
    let pad = (3 - written % 3) % 3;
    if ring.free() < pad + EOR_MARKER.len() {
        return Err(PollError::NoSpace);
    }
    if !locations.can_accept(1) {
        return Err(PollError::QueueFull);
    }
    for _ in 0..pad {
        ring.push(0)?;
    }
    for byte in EOR_MARKER {
        ring.push(byte)?;
    }
    let eor = wrap_dec(ring.write_index(), SPI_BUFFER_SIZE);
    locations
        .push(PacketLocation { device, slot, header, eor })
        .map_err(|_| PollError::QueueFull)?;
    debug!(?device, len = active_len(header, eor, SPI_BUFFER_SIZE) + 1, "bus record queued");
    Ok(())
}

impl PacketSource for BusPoller {
    fn next_packet(&self) -> Option<PacketSpan> {
        self.locations.peek().map(|loc| PacketSpan {
            slot: loc.slot,
            start: loc.header,
            len: loc.len(),
        })
    }

    fn chunk(&self, span: &PacketSpan, start: usize, max_len: usize) -> &[u8] {
        self.rings[span.slot].contiguous(start, max_len)
    }

    fn release(&mut self, span: &PacketSpan, next_read: usize) {
        self.rings[span.slot].release_to(next_read);
    }

    fn finish_packet(&mut self) {
        self.locations.retire();
    }

    fn capacity(&self, _span: &PacketSpan) -> usize {
        SPI_BUFFER_SIZE
    }
}
