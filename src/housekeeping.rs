//! Table-driven housekeeping collection.
//!
//! A cycle queues one register-pointer write (when the sensor needs one) and
//! one read per sensor on the shared I2C scheduler, then fills the record as
//! those transactions retire. Records are double buffered: one is being
//! filled while the other waits for the frame multiplexer and the low-rate
//! link.

use crate::command::CommandWord;
use crate::counters::{CounterMode, PulseChannel, PulseCounters};
use crate::frame::{EOR_MARKER, SYNC_PAIR};
use crate::hal::{DieTemperature, TransferMode};
use crate::i2c::{I2cScheduler, I2cTransaction};
use crate::mux::{PacketSource, PacketSpan};
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use tracing::{debug, info, warn};

pub const HK_HEAD: u8 = 0xD0;
pub const HK_RECORD_BYTES: usize = 72;
pub const HK_BUFFER_RECORDS: usize = 2;

/// Main HK block: everything between the header and the trailer.
pub const MAIN_HK_BYTES: usize = HK_RECORD_BYTES - 6;

pub const BARO_ADDRESS: u8 = 0x70;
/// Control register write that forces the next barometer conversion.
pub const BARO_FORCED_SAMPLE: [u8; 2] = [0xF4, 0xFD];

/// Core temperature value written when the die sensor does not answer.
pub const DIE_TEMP_MISSING: [u8; 2] = [0x80, 0x00];

/// I2C queue slots a sensor needs before the collector will issue it.
const SENSOR_QUEUE_MARGIN: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub len: usize,
}

impl Field {
    const fn new(name: &'static str, offset: usize, len: usize) -> Self {
        Self { name, offset, len }
    }

    #[must_use]
    pub const fn end(&self) -> usize {
        self.offset + self.len
    }
}

/// Byte layout of [`HousekeepingRecord`]. All multi-byte fields are big endian.
pub mod layout {
    use super::Field;

    pub const HEADER: Field = Field::new("header", 0, 3);
    pub const PACKED_TIME: Field = Field::new("packed_time_date", 3, 4);
    pub const COMMAND_LAST: Field = Field::new("command_last", 7, 2);
    pub const COMMAND_COUNT: Field = Field::new("command_count", 9, 2);
    pub const COMMAND_ERRORS: Field = Field::new("command_errors", 11, 1);
    pub const GENERAL_ERRORS: Field = Field::new("general_errors", 12, 1);
    pub const MISSING_VALUES: Field = Field::new("missing_values", 13, 1);
    pub const FIFO_PERCENT: Field = Field::new("fifo_percent", 14, 1);
    pub const DROPPED_PRIMARY: Field = Field::new("frames_dropped_primary", 15, 2);
    pub const DROPPED_SECONDARY: Field = Field::new("frames_dropped_secondary", 17, 2);
    pub const BARO_PRES1: Field = Field::new("baro_pres1", 19, 4);
    pub const BARO_TEMP1: Field = Field::new("baro_temp1", 23, 4);
    pub const BARO_PRES2: Field = Field::new("baro_pres2", 27, 4);
    pub const BARO_TEMP2: Field = Field::new("baro_temp2", 31, 4);
    pub const BARO_PRES3: Field = Field::new("baro_pres3", 35, 3);
    pub const BARO_TEMP3: Field = Field::new("baro_temp3", 38, 3);
    pub const BOARD_TEMP: Field = Field::new("board_temperature", 41, 2);
    pub const CORE_DIE_TEMP: Field = Field::new("core_die_temp", 43, 2);
    pub const DIGITAL_3V_VOLTAGE: Field = Field::new("digital_3v_voltage", 45, 2);
    pub const DIGITAL_3V_CURRENT: Field = Field::new("digital_3v_current", 47, 2);
    pub const ANALOG_3V_VOLTAGE: Field = Field::new("analog_3v_voltage", 49, 2);
    pub const ANALOG_3V_CURRENT: Field = Field::new("analog_3v_current", 51, 2);
    pub const DIGITAL_5V_VOLTAGE: Field = Field::new("digital_5v_voltage", 53, 2);
    pub const DIGITAL_5V_CURRENT: Field = Field::new("digital_5v_current", 55, 2);
    pub const ANALOG_5V_VOLTAGE: Field = Field::new("analog_5v_voltage", 57, 2);
    pub const ANALOG_5V_CURRENT: Field = Field::new("analog_5v_current", 59, 2);
    pub const DIGITAL_15V_VOLTAGE: Field = Field::new("digital_15v_voltage", 61, 2);
    pub const TRACKER_VOLTAGE: Field = Field::new("tracker_voltage", 63, 2);
    pub const TRACKER_CURRENT: Field = Field::new("tracker_current", 65, 2);
    pub const TRACKER_BIAS_VOLTAGE: Field = Field::new("tracker_bias_voltage", 67, 2);
    pub const TRAILER: Field = Field::new("trailer", 69, 3);

    pub const FIELDS: [Field; 31] = [
        HEADER,
        PACKED_TIME,
        COMMAND_LAST,
        COMMAND_COUNT,
        COMMAND_ERRORS,
        GENERAL_ERRORS,
        MISSING_VALUES,
        FIFO_PERCENT,
        DROPPED_PRIMARY,
        DROPPED_SECONDARY,
        BARO_PRES1,
        BARO_TEMP1,
        BARO_PRES2,
        BARO_TEMP2,
        BARO_PRES3,
        BARO_TEMP3,
        BOARD_TEMP,
        CORE_DIE_TEMP,
        DIGITAL_3V_VOLTAGE,
        DIGITAL_3V_CURRENT,
        ANALOG_3V_VOLTAGE,
        ANALOG_3V_CURRENT,
        DIGITAL_5V_VOLTAGE,
        DIGITAL_5V_CURRENT,
        ANALOG_5V_VOLTAGE,
        ANALOG_5V_CURRENT,
        DIGITAL_15V_VOLTAGE,
        TRACKER_VOLTAGE,
        TRACKER_CURRENT,
        TRACKER_BIAS_VOLTAGE,
        TRAILER,
    ];
}

const_assert_eq!(layout::TRAILER.end(), HK_RECORD_BYTES);
const_assert_eq!(layout::TRAILER.offset - layout::PACKED_TIME.offset, MAIN_HK_BYTES);
const_assert_eq!(layout::BARO_TEMP3.offset, layout::BARO_PRES3.end());

/// Pack an RTC reading into the 32-bit telemetry timestamp:
/// `yy:4 | month:4 | day:5 | hour:5 | minute:6 | second:6`, high to low.
#[must_use]
pub const fn pack_time_date(year: u8, month: u8, day: u8, hour: u8, minute: u8, second: u8) -> u32 {
    let mut packed = (year as u32 % 100) << 4 | (month as u32 & 0x0F);
    packed = packed << 5 | (day as u32 & 0x1F);
    packed = packed << 5 | (hour as u32 & 0x1F);
    packed = packed << 6 | (minute as u32 & 0x3F);
    packed << 6 | (second as u32 & 0x3F)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HousekeepingRecord(pub [u8; HK_RECORD_BYTES]);

impl HousekeepingRecord {
    /// Zeroed record with its header and trailer in place.
    #[must_use]
    pub const fn blank() -> Self {
        let mut bytes = [0u8; HK_RECORD_BYTES];
        bytes[0] = HK_HEAD;
        bytes[1] = SYNC_PAIR[0];
        bytes[2] = SYNC_PAIR[1];
        bytes[HK_RECORD_BYTES - 3] = EOR_MARKER[0];
        bytes[HK_RECORD_BYTES - 2] = EOR_MARKER[1];
        bytes[HK_RECORD_BYTES - 1] = EOR_MARKER[2];
        Self(bytes)
    }

    #[must_use]
    pub fn field(&self, field: Field) -> &[u8] {
        &self.0[field.offset..field.end()]
    }

    pub fn field_mut(&mut self, field: Field) -> &mut [u8] {
        &mut self.0[field.offset..field.end()]
    }

    pub fn set_u8(&mut self, field: Field, value: u8) {
        debug_assert_eq!(field.len, 1);
        self.0[field.offset] = value;
    }

    pub fn set_u16(&mut self, field: Field, value: u16) {
        debug_assert_eq!(field.len, 2);
        self.field_mut(field).copy_from_slice(&value.to_be_bytes());
    }

    pub fn set_u32(&mut self, field: Field, value: u32) {
        debug_assert_eq!(field.len, 4);
        self.field_mut(field).copy_from_slice(&value.to_be_bytes());
    }

    #[must_use]
    pub fn u16_at(&self, field: Field) -> u16 {
        let b = self.field(field);
        u16::from_be_bytes([b[0], b[1]])
    }

    #[must_use]
    pub fn u32_at(&self, field: Field) -> u32 {
        let b = self.field(field);
        u32::from_be_bytes([b[0], b[1], b[2], b[3]])
    }

    #[must_use]
    pub fn missing_values(&self) -> u8 {
        self.0[layout::MISSING_VALUES.offset]
    }

    /// The 66 bytes between header and trailer.
    #[must_use]
    pub fn main_hk(&self) -> &[u8] {
        &self.0[layout::PACKED_TIME.offset..layout::TRAILER.offset]
    }

    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; HK_RECORD_BYTES] {
        &self.0
    }
}

impl Default for HousekeepingRecord {
    fn default() -> Self {
        Self::blank()
    }
}

/// One entry of the sensor table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SensorEntry {
    pub address: u8,
    /// Register pointer written before the read, if the device needs one.
    pub register: Option<u8>,
    pub field: Field,
}

const fn sensor(address: u8, register: Option<u8>, field: Field) -> SensorEntry {
    SensorEntry { address, register, field }
}

const BARO3_BLOCK: Field = Field::new("baro3", layout::BARO_PRES3.offset, 6);

const INA_BUS_VOLTAGE: u8 = 0x02;
const INA_SHUNT_VOLTAGE: u8 = 0x01;

pub const SENSOR_TABLE: [SensorEntry; 14] = [
    sensor(BARO_ADDRESS, Some(0xF7), BARO3_BLOCK),
    sensor(0x48, None, layout::BOARD_TEMP),
    sensor(0x44, Some(INA_BUS_VOLTAGE), layout::DIGITAL_3V_VOLTAGE),
    sensor(0x44, Some(INA_SHUNT_VOLTAGE), layout::DIGITAL_3V_CURRENT),
    sensor(0x43, Some(INA_BUS_VOLTAGE), layout::ANALOG_3V_VOLTAGE),
    sensor(0x43, Some(INA_SHUNT_VOLTAGE), layout::ANALOG_3V_CURRENT),
    sensor(0x41, Some(INA_BUS_VOLTAGE), layout::DIGITAL_5V_VOLTAGE),
    sensor(0x41, Some(INA_SHUNT_VOLTAGE), layout::DIGITAL_5V_CURRENT),
    sensor(0x45, Some(INA_BUS_VOLTAGE), layout::ANALOG_5V_VOLTAGE),
    sensor(0x45, Some(INA_SHUNT_VOLTAGE), layout::ANALOG_5V_CURRENT),
    sensor(0x42, Some(INA_BUS_VOLTAGE), layout::DIGITAL_15V_VOLTAGE),
    sensor(0x40, Some(INA_BUS_VOLTAGE), layout::TRACKER_VOLTAGE),
    sensor(0x40, Some(INA_SHUNT_VOLTAGE), layout::TRACKER_CURRENT),
    sensor(0x46, Some(INA_BUS_VOLTAGE), layout::TRACKER_BIAS_VOLTAGE),
];

const SENSOR_COUNT: usize = SENSOR_TABLE.len();

/// Queue indices of one sensor's transactions; `None` read means the sensor
/// was never issued this cycle.
#[derive(Debug, Clone, Copy, Default)]
struct SensorSlot {
    write: Option<usize>,
    read: Option<usize>,
}

/// Controller counters stamped into a finished record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuxTelemetry {
    pub last_command: CommandWord,
    pub command_count: u16,
    pub command_errors: u8,
    pub general_errors: u8,
    pub fifo_percent: u8,
    pub dropped_primary: u16,
    pub dropped_secondary: u16,
}

/// Values captured when a collection request is raised.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleStamp {
    pub packed_time: u32,
    pub pulses: [u32; 4],
}

impl CycleStamp {
    #[must_use]
    pub fn new(packed_time: u32, counters: &PulseCounters) -> Self {
        Self {
            packed_time,
            pulses: PulseChannel::ALL.map(|channel| counters.total(channel)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CycleReport {
    pub missing_values: u8,
    pub die_temp_failed: bool,
    /// New busy level when the hysteresis flipped it.
    pub busy_changed: Option<bool>,
    pub forced_sample_queued: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HousekeepingStep {
    Idle,
    Started { issued: usize, missing: u8 },
    Collecting,
    Completed(CycleReport),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct HousekeepingStats {
    pub cycles_started: u32,
    pub cycles_completed: u32,
    pub records_overwritten: u32,
    pub forced_sample_failures: u32,
}

#[derive(Debug, Clone)]
pub struct HousekeepingCollector {
    records: [HousekeepingRecord; HK_BUFFER_RECORDS],
    write: usize,
    read: usize,
    requested: Option<CycleStamp>,
    collecting: bool,
    sensors: [SensorSlot; SENSOR_COUNT],
    next_sensor: usize,
    busy: bool,
    busy_high: u8,
    busy_low: u8,
    mode: CounterMode,
    stats: HousekeepingStats,
}

impl HousekeepingCollector {
    pub fn new(busy_high: u8, busy_low: u8, mode: CounterMode) -> Self {
        Self {
            records: [HousekeepingRecord::blank(); HK_BUFFER_RECORDS],
            write: 0,
            read: 0,
            requested: None,
            collecting: false,
            sensors: [SensorSlot::default(); SENSOR_COUNT],
            next_sensor: 0,
            busy: false,
            busy_high,
            busy_low,
            mode,
            stats: HousekeepingStats::default(),
        }
    }

    /// Ask for a collection cycle. A request raised while a cycle is running
    /// starts the next one as soon as it finishes.
    pub fn request(&mut self, stamp: CycleStamp) {
        self.requested = Some(stamp);
    }

    #[must_use]
    pub const fn is_collecting(&self) -> bool {
        self.collecting
    }

    #[must_use]
    pub const fn is_busy(&self) -> bool {
        self.busy
    }

    /// Record currently being filled.
    #[must_use]
    pub fn current(&self) -> &HousekeepingRecord {
        &self.records[self.write]
    }

    /// Most recently completed record.
    #[must_use]
    pub fn last_complete(&self) -> &HousekeepingRecord {
        &self.records[(self.write + HK_BUFFER_RECORDS - 1) % HK_BUFFER_RECORDS]
    }

    #[must_use]
    pub const fn pending_records(&self) -> usize {
        (self.write + HK_BUFFER_RECORDS - self.read) % HK_BUFFER_RECORDS
    }

    #[must_use]
    pub const fn stats(&self) -> HousekeepingStats {
        self.stats
    }

    /// One main-loop pass: start a requested cycle or collect finished
    /// sensor reads.
    pub fn check<D: DieTemperature>(
        &mut self,
        i2c: &mut I2cScheduler,
        die: &mut D,
        aux: &AuxTelemetry,
    ) -> HousekeepingStep {
        if self.collecting {
            return self.collect(i2c, die, aux);
        }
        match self.requested.take() {
            Some(stamp) => self.start_cycle(i2c, die, stamp),
            None => HousekeepingStep::Idle,
        }
    }

    fn start_cycle<D: DieTemperature>(&mut self, i2c: &mut I2cScheduler, die: &mut D, stamp: CycleStamp) -> HousekeepingStep {
        self.collecting = true;
        self.next_sensor = 0;
        self.stats.cycles_started = self.stats.cycles_started.wrapping_add(1);

        let record = &mut self.records[self.write];
        *record = HousekeepingRecord::blank();
        record.set_u32(layout::PACKED_TIME, stamp.packed_time);
        for (channel, total) in PulseChannel::ALL.iter().zip(stamp.pulses) {
            let field = match channel {
                PulseChannel::BaroTemp1 => layout::BARO_TEMP1,
                PulseChannel::BaroPres1 => layout::BARO_PRES1,
                PulseChannel::BaroTemp2 => layout::BARO_TEMP2,
                PulseChannel::BaroPres2 => layout::BARO_PRES2,
            };
            record.set_u32(field, total);
        }

        let mut missing = 0u8;
        let mut issued = 0;
        let mut queue_full = false;
        for (slot, entry) in self.sensors.iter_mut().zip(SENSOR_TABLE.iter()) {
            *slot = SensorSlot::default();
            if queue_full || !i2c.can_accept(SENSOR_QUEUE_MARGIN) {
                queue_full = true;
                self.mode.bump_u8(&mut missing);
                continue;
            }
            match issue_sensor(i2c, entry) {
                Some(issued_slot) => {
                    *slot = issued_slot;
                    issued += 1;
                }
                None => self.mode.bump_u8(&mut missing),
            }
        }
        record.set_u8(layout::MISSING_VALUES, missing);
        die.start();
        if queue_full {
            warn!(missing, "i2c queue full, housekeeping sensors skipped");
        }
        debug!(issued, "housekeeping cycle started");
        HousekeepingStep::Started { issued, missing }
    }

    fn collect<D: DieTemperature>(&mut self, i2c: &mut I2cScheduler, die: &mut D, aux: &AuxTelemetry) -> HousekeepingStep {
        while self.next_sensor < SENSOR_COUNT {
            let slot = self.sensors[self.next_sensor];
            let entry = SENSOR_TABLE[self.next_sensor];
            if let Some(read) = slot.read {
                if !i2c.is_done(read) {
                    return HousekeepingStep::Collecting;
                }
                let write_ok = slot.write.map_or(true, |w| i2c.transaction(w).succeeded());
                let response = i2c.transaction(read);
                let record = &mut self.records[self.write];
                if write_ok && response.succeeded() && response.data.len() == entry.field.len {
                    record.field_mut(entry.field).copy_from_slice(&response.data);
                } else {
                    record.field_mut(entry.field).fill(0);
                    let mut missing = record.missing_values();
                    self.mode.bump_u8(&mut missing);
                    record.set_u8(layout::MISSING_VALUES, missing);
                }
            }
            self.next_sensor += 1;
        }
        HousekeepingStep::Completed(self.complete(i2c, die, aux))
    }

    fn complete<D: DieTemperature>(&mut self, i2c: &mut I2cScheduler, die: &mut D, aux: &AuxTelemetry) -> CycleReport {
        let mode = self.mode;
        let record = &mut self.records[self.write];
        record.set_u16(layout::COMMAND_LAST, u16::from_be_bytes([aux.last_command.data, aux.last_command.addr]));
        record.set_u16(layout::COMMAND_COUNT, aux.command_count);
        record.set_u8(layout::COMMAND_ERRORS, aux.command_errors);
        record.set_u8(layout::FIFO_PERCENT, aux.fifo_percent);
        record.set_u16(layout::DROPPED_PRIMARY, aux.dropped_primary);
        record.set_u16(layout::DROPPED_SECONDARY, aux.dropped_secondary);

        let mut general_errors = aux.general_errors;
        let die_temp_failed = match die.read_celsius() {
            Ok(celsius) => {
                record.field_mut(layout::CORE_DIE_TEMP).copy_from_slice(&celsius.to_be_bytes());
                false
            }
            Err(e) => {
                record.field_mut(layout::CORE_DIE_TEMP).copy_from_slice(&DIE_TEMP_MISSING);
                let mut missing = record.missing_values();
                mode.bump_u8(&mut missing);
                record.set_u8(layout::MISSING_VALUES, missing);
                mode.bump_u8(&mut general_errors);
                warn!("core temperature: {}", e);
                true
            }
        };
        record.set_u8(layout::GENERAL_ERRORS, general_errors);
        let missing_values = record.missing_values();

        let busy_changed = self.update_busy(aux.fifo_percent);
        self.flip();
        self.collecting = false;
        self.stats.cycles_completed = self.stats.cycles_completed.wrapping_add(1);

        let forced_sample_queued = I2cTransaction::write(BARO_ADDRESS, &BARO_FORCED_SAMPLE, TransferMode::Complete)
            .and_then(|tx| i2c.submit(tx))
            .is_ok();
        if !forced_sample_queued {
            self.stats.forced_sample_failures = self.stats.forced_sample_failures.wrapping_add(1);
        }
        info!(missing_values, fifo = aux.fifo_percent, "housekeeping record complete");
        CycleReport {
            missing_values,
            die_temp_failed,
            busy_changed,
            forced_sample_queued,
        }
    }

    fn update_busy(&mut self, fifo_percent: u8) -> Option<bool> {
        if self.busy && fifo_percent <= self.busy_low {
            self.busy = false;
            Some(false)
        } else if !self.busy && fifo_percent >= self.busy_high {
            self.busy = true;
            Some(true)
        } else {
            None
        }
    }

    fn flip(&mut self) {
        self.write = (self.write + 1) % HK_BUFFER_RECORDS;
        if self.write == self.read {
            // unsent record is about to be refilled
            self.read = (self.read + 1) % HK_BUFFER_RECORDS;
            self.stats.records_overwritten = self.stats.records_overwritten.wrapping_add(1);
        }
    }
}

fn issue_sensor(i2c: &mut I2cScheduler, entry: &SensorEntry) -> Option<SensorSlot> {
    let write = match entry.register {
        Some(register) => {
            let tx = I2cTransaction::write(entry.address, &[register], TransferMode::Complete).ok()?;
            Some(i2c.submit(tx).ok()?)
        }
        None => None,
    };
    let tx = I2cTransaction::read(entry.address, entry.field.len, TransferMode::Complete).ok()?;
    let read = i2c.submit(tx).ok()?;
    Some(SensorSlot { write, read: Some(read) })
}

impl PacketSource for HousekeepingCollector {
    fn next_packet(&self) -> Option<PacketSpan> {
        (self.read != self.write).then_some(PacketSpan {
            slot: self.read,
            start: 0,
            len: HK_RECORD_BYTES,
        })
    }

    fn chunk(&self, span: &PacketSpan, start: usize, max_len: usize) -> &[u8] {
        let bytes = &self.records[span.slot].0;
        let start = start.min(HK_RECORD_BYTES);
        &bytes[start..(start + max_len).min(HK_RECORD_BYTES)]
    }

    // Records are released whole in `finish_packet`.
    fn release(&mut self, _span: &PacketSpan, _next_read: usize) {}

    fn finish_packet(&mut self) {
        if self.read != self.write {
            self.read = (self.read + 1) % HK_BUFFER_RECORDS;
        }
    }

    fn capacity(&self, _span: &PacketSpan) -> usize {
        HK_RECORD_BYTES + 1
    }
}

/// Serializable copy of a record for status output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RecordSnapshot {
    pub missing_values: u8,
    pub packed_time: u32,
    #[serde(with = "serde_bytes")]
    pub bytes: Vec<u8>,
}

impl From<&HousekeepingRecord> for RecordSnapshot {
    fn from(record: &HousekeepingRecord) -> Self {
        Self {
            missing_values: record.missing_values(),
            packed_time: record.u32_at(layout::PACKED_TIME),
            bytes: record.0.to_vec(),
        }
    }
}
