//! Simulated board for the simulator binary and integration tests.
//!
//! Every peripheral is deterministic: latencies are fixed pass counts and
//! faults come from a seeded linear congruential generator.

use crate::controller::DaqController;
use crate::event::{EVFIX_HEAD, EVHK_ID, EVVAR_HEAD};
use crate::frame::{EOR_MARKER, FRAME_BYTES, SYNC_PAIR};
use crate::hal::{
    BusFault, BusStatus, ByteSink, DieTemperature, Hardware, I2cBus, InstrumentBus, LinkError, SelectLevel, SensorFault,
    TransferMode,
};
use crate::poller::BusDevice;
use core::convert::Infallible;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet, VecDeque};
use tracing::trace;

const GLITCH_SEED: u64 = 0x0DAC_C0DE_5EED_0001;

/// Seeded source of bus glitches: each transfer start rolls once against a
/// percentage. Numerical Recipes LCG, upper bits used for the roll.
#[derive(Debug, Clone)]
pub struct BusGlitches {
    state: u64,
    percent: u8,
    count: u32,
}

impl BusGlitches {
    pub fn new(percent: u8) -> Self {
        Self::with_seed(percent, GLITCH_SEED)
    }

    pub fn with_seed(percent: u8, seed: u64) -> Self {
        Self {
            state: seed,
            percent: percent.min(100),
            count: 0,
        }
    }

    /// Whether the next transfer start is refused.
    pub fn strikes(&mut self) -> bool {
        if self.percent == 0 {
            return false;
        }
        self.state = self.state.wrapping_mul(1_664_525).wrapping_add(1_013_904_223);
        let hit = ((self.state >> 33) % 100) < u64::from(self.percent);
        if hit {
            self.count = self.count.wrapping_add(1);
        }
        hit
    }

    /// Glitches delivered so far.
    #[must_use]
    pub const fn count(&self) -> u32 {
        self.count
    }
}

/// Serial link that stays busy for a fixed number of idle checks after
/// every write.
#[derive(Debug, Clone, Default)]
pub struct SimLink {
    latency: u32,
    busy_for: u32,
    disconnected: bool,
    writes: Vec<Vec<u8>>,
}

impl SimLink {
    pub fn new(latency: u32) -> Self {
        Self {
            latency,
            ..Self::default()
        }
    }

    pub fn set_disconnected(&mut self, disconnected: bool) {
        self.disconnected = disconnected;
    }

    #[must_use]
    pub fn writes(&self) -> &[Vec<u8>] {
        &self.writes
    }

    pub fn take_writes(&mut self) -> Vec<Vec<u8>> {
        core::mem::take(&mut self.writes)
    }
}

impl ByteSink for SimLink {
    fn is_idle(&mut self) -> bool {
        if self.busy_for == 0 {
            return true;
        }
        self.busy_for -= 1;
        false
    }

    fn write(&mut self, bytes: &[u8]) -> nb::Result<(), LinkError> {
        if self.disconnected {
            return Err(nb::Error::Other(LinkError::Disconnected));
        }
        if self.busy_for > 0 {
            return Err(nb::Error::WouldBlock);
        }
        self.writes.push(bytes.to_vec());
        self.busy_for = self.latency;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct SimI2cStats {
    pub writes: u32,
    pub reads: u32,
    pub nacks: u32,
    pub refused: u32,
}

#[derive(Debug, Clone, Copy)]
enum Transfer {
    Write,
    Read { address: u8, len: usize },
    Nack,
}

/// I2C master with a bank of register-addressed sensors behind it.
#[derive(Debug, Clone)]
pub struct SimI2cBus {
    latency: u32,
    countdown: u32,
    in_flight: Option<Transfer>,
    status: BusStatus,
    pointers: HashMap<u8, u8>,
    registers: HashMap<(u8, Option<u8>), Vec<u8>>,
    offline: HashSet<u8>,
    glitches: BusGlitches,
    data: Vec<u8>,
    log: Vec<(u8, Vec<u8>)>,
    stats: SimI2cStats,
}

impl SimI2cBus {
    pub fn new(latency: u32, glitches: BusGlitches) -> Self {
        Self {
            latency,
            countdown: 0,
            in_flight: None,
            status: BusStatus::Idle,
            pointers: HashMap::new(),
            registers: HashMap::new(),
            offline: HashSet::new(),
            glitches,
            data: Vec::new(),
            log: Vec::new(),
            stats: SimI2cStats::default(),
        }
    }

    /// Fix the bytes returned when `address` is read with `register`
    /// selected (`None` for pointerless devices).
    pub fn set_register(&mut self, address: u8, register: Option<u8>, value: &[u8]) {
        self.registers.insert((address, register), value.to_vec());
    }

    /// A device that never acknowledges.
    pub fn set_offline(&mut self, address: u8, offline: bool) {
        if offline {
            self.offline.insert(address);
        } else {
            self.offline.remove(&address);
        }
    }

    /// Every write seen, as `(address, payload)`.
    #[must_use]
    pub fn write_log(&self) -> &[(u8, Vec<u8>)] {
        &self.log
    }

    #[must_use]
    pub const fn stats(&self) -> SimI2cStats {
        self.stats
    }

    fn register_value(&self, address: u8, len: usize) -> Vec<u8> {
        let pointer = self.pointers.get(&address).copied();
        let mut value = self
            .registers
            .get(&(address, pointer))
            .or_else(|| self.registers.get(&(address, None)))
            .cloned()
            .unwrap_or_else(|| (0..len).map(|i| address ^ pointer.unwrap_or(0) ^ i as u8).collect());
        value.resize(len, 0);
        value
    }

    fn start(&mut self, transfer: Transfer) -> Result<(), BusFault> {
        if self.in_flight.is_some() {
            self.stats.refused = self.stats.refused.wrapping_add(1);
            return Err(BusFault::Busy);
        }
        if self.glitches.strikes() {
            self.stats.refused = self.stats.refused.wrapping_add(1);
            return Err(BusFault::ArbitrationLost);
        }
        self.in_flight = Some(transfer);
        self.countdown = self.latency;
        Ok(())
    }
}

impl I2cBus for SimI2cBus {
    fn poll_status(&mut self) -> nb::Result<BusStatus, Infallible> {
        let Some(transfer) = self.in_flight else {
            return Ok(self.status);
        };
        if self.countdown > 0 {
            self.countdown -= 1;
            return Err(nb::Error::WouldBlock);
        }
        self.in_flight = None;
        self.status = match transfer {
            Transfer::Write => BusStatus::WriteComplete,
            Transfer::Read { address, len } => {
                self.data = self.register_value(address, len);
                BusStatus::ReadComplete
            }
            Transfer::Nack => BusStatus::Error(BusFault::Nack),
        };
        Ok(self.status)
    }

    fn start_write(&mut self, address: u8, data: &[u8], _mode: TransferMode) -> Result<(), BusFault> {
        self.start(Transfer::Write)?;
        self.stats.writes = self.stats.writes.wrapping_add(1);
        self.log.push((address, data.to_vec()));
        if self.offline.contains(&address) {
            self.stats.nacks = self.stats.nacks.wrapping_add(1);
            self.in_flight = Some(Transfer::Nack);
            return Ok(());
        }
        if let [pointer] = data {
            self.pointers.insert(address, *pointer);
        }
        Ok(())
    }

    fn start_read(&mut self, address: u8, len: usize, _mode: TransferMode) -> Result<(), BusFault> {
        self.start(Transfer::Read { address, len })?;
        self.stats.reads = self.stats.reads.wrapping_add(1);
        if self.offline.contains(&address) {
            self.stats.nacks = self.stats.nacks.wrapping_add(1);
            self.in_flight = Some(Transfer::Nack);
        }
        Ok(())
    }

    fn read_data(&mut self, buf: &mut [u8]) {
        let n = buf.len().min(self.data.len());
        buf[..n].copy_from_slice(&self.data[..n]);
    }

    fn clear_status(&mut self) {
        self.status = BusStatus::Idle;
    }
}

/// Instrument bus with scripted responses per device. Captured bytes are
/// handed to the controller by [`SimBoard::service_interrupts`].
#[derive(Debug, Clone, Default)]
pub struct SimInstrumentBus {
    responses: HashMap<BusDevice, VecDeque<Vec<u8>>>,
    selected: Option<BusDevice>,
    shifting: VecDeque<u8>,
    transfers: u32,
}

impl SimInstrumentBus {
    pub fn queue_response(&mut self, device: BusDevice, bytes: &[u8]) {
        self.responses.entry(device).or_default().push_back(bytes.to_vec());
    }

    #[must_use]
    pub fn pending_responses(&self, device: BusDevice) -> usize {
        self.responses.get(&device).map_or(0, VecDeque::len)
    }

    #[must_use]
    pub const fn transfers(&self) -> u32 {
        self.transfers
    }

    fn next_byte(&mut self) -> Option<(u8, bool)> {
        let byte = self.shifting.pop_front()?;
        Some((byte, !self.shifting.is_empty()))
    }
}

impl InstrumentBus for SimInstrumentBus {
    fn set_select(&mut self, device: BusDevice, level: SelectLevel) {
        match level {
            SelectLevel::High => self.selected = Some(device),
            SelectLevel::Low if self.selected == Some(device) => self.selected = None,
            SelectLevel::Low => {}
        }
    }

    fn data_ready(&mut self, device: BusDevice) -> bool {
        self.selected == Some(device) && self.pending_responses(device) > 0
    }

    fn begin_transfer(&mut self, device: BusDevice) {
        if let Some(response) = self.responses.get_mut(&device).and_then(VecDeque::pop_front) {
            self.shifting.extend(response);
            self.transfers = self.transfers.wrapping_add(1);
        }
    }

    fn transfer_idle(&mut self) -> bool {
        self.shifting.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct SimDieTemp {
    pub celsius: Option<i16>,
    pub conversions: u32,
}

impl DieTemperature for SimDieTemp {
    fn start(&mut self) {
        self.conversions = self.conversions.wrapping_add(1);
    }

    fn read_celsius(&mut self) -> Result<i16, SensorFault> {
        self.celsius.ok_or(SensorFault)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct SimConfig {
    pub link_latency: u32,
    pub low_rate_latency: u32,
    pub i2c_latency: u32,
    pub i2c_fault_percent: u8,
    pub die_celsius: Option<i16>,
}

impl Default for SimConfig {
    fn default() -> Self {
        Self {
            link_latency: 0,
            low_rate_latency: 0,
            i2c_latency: 1,
            i2c_fault_percent: 0,
            die_celsius: Some(31),
        }
    }
}

/// Every peripheral the controller needs, simulated.
#[derive(Debug, Clone)]
pub struct SimBoard {
    pub i2c: SimI2cBus,
    pub command_link: SimLink,
    pub primary: SimLink,
    pub secondary: SimLink,
    pub low_rate: SimLink,
    pub bus: SimInstrumentBus,
    pub die: SimDieTemp,
    pub busy: bool,
}

impl SimBoard {
    pub fn new(config: SimConfig) -> Self {
        Self {
            i2c: SimI2cBus::new(config.i2c_latency, BusGlitches::new(config.i2c_fault_percent)),
            command_link: SimLink::new(config.link_latency),
            primary: SimLink::new(config.link_latency),
            secondary: SimLink::new(config.link_latency),
            low_rate: SimLink::new(config.low_rate_latency),
            bus: SimInstrumentBus::default(),
            die: SimDieTemp {
                celsius: config.die_celsius,
                conversions: 0,
            },
            busy: false,
        }
    }

    /// Deliver every byte the instrument bus has shifted in, the way the
    /// capture interrupt would between main-loop passes.
    pub fn service_interrupts(&mut self, controller: &mut DaqController) -> usize {
        let mut delivered = 0;
        while let Some((byte, more)) = self.bus.next_byte() {
            delivered += 1;
            if !controller.on_bus_byte(byte, more) {
                self.bus.shifting.clear();
            }
        }
        if delivered > 0 {
            trace!(delivered, "bus bytes captured");
        }
        delivered
    }

    /// Run `passes` main-loop passes, servicing interrupts before each.
    pub fn run(&mut self, controller: &mut DaqController, passes: usize) {
        for _ in 0..passes {
            self.service_interrupts(controller);
            controller.poll(self);
        }
    }
}

impl Default for SimBoard {
    fn default() -> Self {
        Self::new(SimConfig::default())
    }
}

impl Hardware for SimBoard {
    type I2c = SimI2cBus;
    type CommandLink = SimLink;
    type Primary = SimLink;
    type Secondary = SimLink;
    type LowRate = SimLink;
    type Bus = SimInstrumentBus;
    type DieTemp = SimDieTemp;

    fn i2c(&mut self) -> &mut SimI2cBus {
        &mut self.i2c
    }

    fn command_link(&mut self) -> &mut SimLink {
        &mut self.command_link
    }

    fn frame_links(&mut self) -> (&mut SimLink, &mut SimLink) {
        (&mut self.primary, &mut self.secondary)
    }

    fn low_rate_link(&mut self) -> &mut SimLink {
        &mut self.low_rate
    }

    fn instrument_bus(&mut self) -> &mut SimInstrumentBus {
        &mut self.bus
    }

    fn die_temperature(&mut self) -> &mut SimDieTemp {
        &mut self.die
    }

    fn set_busy(&mut self, busy: bool) {
        self.busy = busy;
    }
}

/// Builds coprocessor packets in the event-link wire format.
#[derive(Debug, Clone)]
pub struct EventGenerator {
    counter: u8,
}

impl EventGenerator {
    pub fn new() -> Self {
        Self { counter: 0 }
    }

    /// `DB 00 FF` with a 3-byte body.
    pub fn fixed(&mut self) -> Vec<u8> {
        self.counter = self.counter.wrapping_add(1);
        let mut bytes = vec![EVFIX_HEAD, SYNC_PAIR[0], SYNC_PAIR[1], self.counter, 0x00, 0x00];
        bytes.extend_from_slice(&EOR_MARKER);
        bytes
    }

    /// `DC 00 FF LEN` packet with `payload` body bytes after the 2-byte
    /// type field, zero padded to a 3-byte boundary.
    pub fn variable(&mut self, kind: u8, payload: u8) -> Vec<u8> {
        self.counter = self.counter.wrapping_add(1);
        let mut bytes = vec![EVVAR_HEAD, SYNC_PAIR[0], SYNC_PAIR[1], payload, kind, self.counter];
        bytes.extend((0..payload).map(|i| i.wrapping_mul(7) ^ self.counter));
        while (bytes.len() + EOR_MARKER.len()) % 3 != 0 {
            bytes.push(0);
        }
        bytes.extend_from_slice(&EOR_MARKER);
        bytes
    }

    /// Coprocessor housekeeping; the type byte lands at [`crate::event::EVHK_ID_OFFSET`].
    pub fn housekeeping(&mut self, payload: u8) -> Vec<u8> {
        self.variable(EVHK_ID, payload)
    }
}

impl Default for EventGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// Split a captured frame stream into 34-byte records.
#[must_use]
pub fn split_frames(writes: &[Vec<u8>]) -> Vec<[u8; FRAME_BYTES]> {
    writes
        .iter()
        .filter_map(|w| <[u8; FRAME_BYTES]>::try_from(w.as_slice()).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_glitches_are_deterministic() {
        let mut a = BusGlitches::new(30);
        let mut b = BusGlitches::new(30);
        let rolls_a: Vec<bool> = (0..64).map(|_| a.strikes()).collect();
        let rolls_b: Vec<bool> = (0..64).map(|_| b.strikes()).collect();
        assert_eq!(rolls_a, rolls_b);
        assert!(a.count() > 0);
        assert!(!BusGlitches::new(0).strikes());
        assert!((0..16).all(|_| BusGlitches::new(100).strikes()));
    }

    #[test]
    fn test_link_latency() {
        let mut link = SimLink::new(2);
        assert!(link.is_idle());
        link.write(b"abc").unwrap();
        assert!(!link.is_idle());
        assert!(!link.is_idle());
        assert!(link.is_idle());
        assert_eq!(link.writes().len(), 1);
    }

    #[test]
    fn test_variable_packet_is_aligned() {
        let mut gen = EventGenerator::new();
        for payload in [0u8, 1, 2, 3, 100] {
            let packet = gen.variable(0x01, payload);
            assert_eq!(packet.len() % 3, 0);
            assert!(packet.len() >= usize::from(payload) + 9);
            assert!(packet.len() <= usize::from(payload) + 11);
        }
    }

    #[test]
    fn test_i2c_pointer_selects_register() {
        let mut bus = SimI2cBus::new(0, BusGlitches::new(0));
        bus.set_register(0x44, Some(0x02), &[0x12, 0x34]);
        bus.start_write(0x44, &[0x02], TransferMode::Complete).unwrap();
        assert_eq!(bus.poll_status(), Ok(BusStatus::WriteComplete));
        bus.clear_status();
        bus.start_read(0x44, 2, TransferMode::Complete).unwrap();
        assert_eq!(bus.poll_status(), Ok(BusStatus::ReadComplete));
        let mut buf = [0u8; 2];
        bus.read_data(&mut buf);
        assert_eq!(buf, [0x12, 0x34]);
    }
}
