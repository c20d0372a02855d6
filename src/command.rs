//! Command protocol engine.
//!
//! Three independent byte sources feed DLE-framed commands into per-source
//! queues. Queued commands are forwarded one per pass to the shared command
//! bus as a legacy ASCII envelope, and a separate interpreter walks the same
//! queues looking for multi-byte commands addressed to this controller.

use crate::counters::CounterMode;
use crate::hal::{ByteSink, LinkError};
use crate::ring::{active_len, wrap_dec, wrap_inc, RingChannel};
use arrayvec::ArrayString;
use core::fmt::Write;
use serde::{Deserialize, Serialize};
use static_assertions::const_assert_eq;
use thiserror::Error;
use tracing::{debug, trace, warn};

pub const DLE: u8 = 0x10;
pub const ETX: u8 = 0x03;
pub const CMD_ID: u8 = 0x14;
pub const REQ_ID: u8 = 0x13;
pub const CMD_LEN: u8 = 2;

pub const CMD_BUFFER_SIZE: usize = 256;
pub const COMMAND_SOURCES: usize = 3;

/// Address field value of commands for this controller.
pub const MAIN_ADDRESS: u8 = 0b0010_1000;
/// Address byte of the first data byte of a multi-byte command.
pub const MAIN_FIRST_BYTE: u8 = 0b0010_1001;
pub const ADDRESS_MASK: u8 = 0b0011_1100;
pub const LENGTH_MASK: u8 = 0b1100_0011;
/// Address step allowed when the previous address byte ends in `11`.
pub const NIBBLE_SKIP: u8 = 29;

pub const MAX_SELF_BYTES: usize = 15;

const ENVELOPE_START: &str = "S";
const ENVELOPE_END: &str = " 01W";
const ENVELOPE_REPEATS: usize = 3;
pub const ENVELOPE_LEN: usize = ENVELOPE_REPEATS * (ENVELOPE_START.len() + 4 + ENVELOPE_END.len()) + 2;

const_assert_eq!(ENVELOPE_LEN, 29);

/// Length field encoding used in the header address byte.
#[must_use]
pub const fn encode_length(n: usize) -> u8 {
    let n = (n & 0x0F) as u8;
    ((n & 0x0C) << 4) | (n & 0x03)
}

/// DLE frame for a single command, as a ground station would send it.
#[must_use]
pub const fn encode_command(word: CommandWord) -> [u8; 6] {
    [DLE, CMD_ID, CMD_LEN, word.data, word.addr, ETX]
}

#[must_use]
pub const fn encode_request() -> [u8; 3] {
    [DLE, REQ_ID, ETX]
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandWord {
    pub data: u8,
    pub addr: u8,
}

impl CommandWord {
    #[must_use]
    pub const fn new(data: u8, addr: u8) -> Self {
        Self { data, addr }
    }

    /// Four uppercase hex digits, data byte first.
    #[must_use]
    pub fn hex(&self) -> ArrayString<4> {
        let mut out = ArrayString::new();
        let _ = write!(out, "{:02X}{:02X}", self.data, self.addr);
        out
    }

    /// Legacy bus envelope: `S<hex> 01W` three times, then CR LF.
    #[must_use]
    pub fn render_envelope(&self) -> ArrayString<ENVELOPE_LEN> {
        let mut out = ArrayString::new();
        let hex = self.hex();
        for _ in 0..ENVELOPE_REPEATS {
            let _ = write!(out, "{ENVELOPE_START}{hex}{ENVELOPE_END}");
        }
        let _ = out.try_push_str("\r\n");
        out
    }

    #[must_use]
    pub const fn is_self_addressed(&self) -> bool {
        self.addr & ADDRESS_MASK == MAIN_ADDRESS
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandSource {
    LowRate0,
    LowRate1,
    Usb,
}

impl CommandSource {
    pub const ALL: [Self; COMMAND_SOURCES] = [Self::LowRate0, Self::LowRate1, Self::Usb];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::LowRate0 => 0,
            Self::LowRate1 => 1,
            Self::Usb => 2,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ParserState {
    #[default]
    WaitDle,
    CheckId,
    CheckLen,
    ReadCmd { first: Option<u8> },
    CheckEtxCmd(CommandWord),
    CheckEtxReq,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ParseError {
    #[error("unexpected frame id {0:#04x}")]
    UnexpectedId(u8),
    #[error("bad command length {0}")]
    BadLength(u8),
    #[error("expected ETX, got {0:#04x}")]
    MissingEtx(u8),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("{origin:?}: {error}")]
    Parse { origin: CommandSource, error: ParseError },
    #[error("{0:?} command queue full")]
    QueueFull(CommandSource),
    #[error("batch of {requested} commands does not fit, {free} free")]
    BatchTooLarge { requested: usize, free: usize },
    #[error("{origin:?}: address sequence broken at entry {index}")]
    Sequence { origin: CommandSource, index: usize },
}

/// What a received byte completed, if anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseEvent {
    Pending,
    Command(CommandWord),
    ScienceRequest,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainOutcome {
    /// Command link still transmitting.
    Busy,
    Empty,
    Forwarded(CommandSource, CommandWord),
}

/// A complete command addressed to this controller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SelfCommand {
    pub source: CommandSource,
    pub header: CommandWord,
    pub data: heapless::Vec<u8, MAX_SELF_BYTES>,
}

impl SelfCommand {
    #[must_use]
    pub const fn id(&self) -> u8 {
        self.header.data
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Interpretation {
    /// Nothing (more) to look at in this queue yet.
    Idle,
    /// Header belongs to another board and was stepped over.
    Skipped,
    Complete { header: usize, end: usize },
    Sequence(usize),
}

/// One source's queue. `read` (inside the ring) is the forwarding cursor;
/// `header`/`interpret` track the command under interpretation.
#[derive(Debug, Clone)]
struct CommandQueue {
    entries: RingChannel<CommandWord, CMD_BUFFER_SIZE>,
    header: usize,
    interpret: usize,
}

impl CommandQueue {
    fn new() -> Self {
        Self {
            entries: RingChannel::new(),
            header: 0,
            interpret: 0,
        }
    }

    /// Entries still needed by the slower of the forwarder and interpreter.
    fn retained(&self) -> usize {
        let write = self.entries.write_index();
        active_len(self.entries.read_index(), write, CMD_BUFFER_SIZE)
            .max(active_len(self.header, write, CMD_BUFFER_SIZE))
    }

    fn free(&self) -> usize {
        CMD_BUFFER_SIZE - 1 - self.retained()
    }

    fn push_all(&mut self, words: &[CommandWord]) -> Result<(), CommandError> {
        if self.retained() + words.len() >= CMD_BUFFER_SIZE {
            return Err(CommandError::BatchTooLarge {
                requested: words.len(),
                free: self.free(),
            });
        }
        for &word in words {
            self.entries.push(word).map_err(|_| CommandError::BatchTooLarge {
                requested: words.len(),
                free: 0,
            })?;
        }
        Ok(())
    }

    fn addr_at(&self, idx: usize) -> u8 {
        self.entries.get(idx).addr
    }

    fn next_self_command(&mut self) -> Interpretation {
        let write = self.entries.write_index();
        if self.header == write {
            return Interpretation::Idle;
        }
        let head_addr = self.addr_at(self.header);
        let mut last;
        if self.header == self.interpret {
            self.interpret = wrap_inc(self.interpret, CMD_BUFFER_SIZE);
            if head_addr & ADDRESS_MASK != MAIN_ADDRESS {
                self.header = wrap_inc(self.header, CMD_BUFFER_SIZE);
                return Interpretation::Skipped;
            }
            if head_addr & LENGTH_MASK == 0 {
                return Interpretation::Complete {
                    header: self.header,
                    end: self.header,
                };
            }
            last = head_addr;
        } else {
            last = self.addr_at(wrap_dec(self.interpret, CMD_BUFFER_SIZE));
        }

        while self.interpret != write {
            let cur = self.addr_at(self.interpret);
            let in_sequence = if cur == head_addr {
                let n = active_len(self.header, self.interpret, CMD_BUFFER_SIZE);
                if encode_length(n) == head_addr & LENGTH_MASK {
                    return Interpretation::Complete {
                        header: self.header,
                        end: self.interpret,
                    };
                }
                false
            } else if last == head_addr {
                cur == MAIN_FIRST_BYTE
            } else {
                let step = cur.wrapping_sub(last);
                step == 1 || (step == NIBBLE_SKIP && last & 0x03 == 0x03)
            };
            if !in_sequence {
                self.header = self.interpret;
                return Interpretation::Sequence(self.interpret);
            }
            last = cur;
            self.interpret = wrap_inc(self.interpret, CMD_BUFFER_SIZE);
        }
        Interpretation::Idle
    }

    fn collect(&mut self, source: CommandSource, header: usize, end: usize) -> SelfCommand {
        let mut data = heapless::Vec::new();
        let mut idx = header;
        while idx != end {
            idx = wrap_inc(idx, CMD_BUFFER_SIZE);
            if data.push(self.entries.get(idx).data).is_err() {
                break;
            }
        }
        let command = SelfCommand {
            source,
            header: *self.entries.get(header),
            data,
        };
        self.header = wrap_inc(end, CMD_BUFFER_SIZE);
        self.interpret = self.header;
        command
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct CommandStats {
    pub received: [u32; COMMAND_SOURCES],
    pub forwarded: u32,
    pub self_commands: u32,
    pub science_requests: u32,
}

#[derive(Debug, Clone)]
pub struct CommandEngine {
    parsers: [ParserState; COMMAND_SOURCES],
    queues: [CommandQueue; COMMAND_SOURCES],
    priority: [CommandSource; COMMAND_SOURCES],
    last_source: CommandSource,
    science_request: bool,
    command_count: u16,
    command_errors: u8,
    mode: CounterMode,
    stats: CommandStats,
}

impl CommandEngine {
    pub fn new(priority: [CommandSource; COMMAND_SOURCES], mode: CounterMode) -> Self {
        Self {
            parsers: [ParserState::WaitDle; COMMAND_SOURCES],
            queues: core::array::from_fn(|_| CommandQueue::new()),
            priority,
            last_source: CommandSource::LowRate0,
            science_request: false,
            command_count: 0,
            command_errors: 0,
            mode,
            stats: CommandStats::default(),
        }
    }

    /// Interrupt side: feed one received byte from `source`.
    pub fn receive(&mut self, source: CommandSource, byte: u8) -> Result<ParseEvent, CommandError> {
        let i = source.index();
        let (next, outcome) = match self.parsers[i] {
            ParserState::WaitDle => {
                let next = if byte == DLE { ParserState::CheckId } else { ParserState::WaitDle };
                (next, Ok(ParseEvent::Pending))
            }
            ParserState::CheckId => match byte {
                CMD_ID => (ParserState::CheckLen, Ok(ParseEvent::Pending)),
                REQ_ID => (ParserState::CheckEtxReq, Ok(ParseEvent::Pending)),
                _ => (ParserState::WaitDle, Err(ParseError::UnexpectedId(byte))),
            },
            ParserState::CheckLen => {
                if byte == CMD_LEN {
                    (ParserState::ReadCmd { first: None }, Ok(ParseEvent::Pending))
                } else {
                    (ParserState::WaitDle, Err(ParseError::BadLength(byte)))
                }
            }
            ParserState::ReadCmd { first: None } => (ParserState::ReadCmd { first: Some(byte) }, Ok(ParseEvent::Pending)),
            ParserState::ReadCmd { first: Some(data) } => {
                (ParserState::CheckEtxCmd(CommandWord::new(data, byte)), Ok(ParseEvent::Pending))
            }
            ParserState::CheckEtxCmd(word) => {
                if byte == ETX {
                    (ParserState::WaitDle, Ok(ParseEvent::Command(word)))
                } else {
                    (ParserState::WaitDle, Err(ParseError::MissingEtx(byte)))
                }
            }
            ParserState::CheckEtxReq => {
                if byte == ETX {
                    (ParserState::WaitDle, Ok(ParseEvent::ScienceRequest))
                } else {
                    (ParserState::WaitDle, Err(ParseError::MissingEtx(byte)))
                }
            }
        };
        self.parsers[i] = next;

        match outcome {
            Ok(ParseEvent::Command(word)) => {
                self.enqueue(source, word)?;
                Ok(ParseEvent::Command(word))
            }
            Ok(ParseEvent::ScienceRequest) => {
                self.science_request = true;
                self.stats.science_requests = self.stats.science_requests.wrapping_add(1);
                Ok(ParseEvent::ScienceRequest)
            }
            Ok(event) => Ok(event),
            Err(error) => {
                self.mode.bump_u8(&mut self.command_errors);
                trace!(?source, "command frame error: {}", error);
                Err(CommandError::Parse { origin: source, error })
            }
        }
    }

    fn enqueue(&mut self, source: CommandSource, word: CommandWord) -> Result<(), CommandError> {
        let i = source.index();
        if self.queues[i].push_all(&[word]).is_err() {
            self.mode.bump_u8(&mut self.command_errors);
            warn!(?source, "command queue full, dropping {}", word.hex());
            return Err(CommandError::QueueFull(source));
        }
        self.mode.bump_u16(&mut self.command_count);
        self.last_source = source;
        self.stats.received[i] = self.stats.received[i].wrapping_add(1);
        Ok(())
    }

    /// Append a batch to one source queue, all or nothing.
    pub fn load_batch(&mut self, source: CommandSource, words: &[CommandWord]) -> Result<usize, CommandError> {
        self.queues[source.index()].push_all(words)?;
        debug!(?source, count = words.len(), "command batch queued");
        Ok(words.len())
    }

    /// Forward at most one queued command to the command bus.
    pub fn drain<L: ByteSink>(&mut self, link: &mut L) -> Result<DrainOutcome, LinkError> {
        if !link.is_idle() {
            return Ok(DrainOutcome::Busy);
        }
        for source in self.priority {
            let queue = &mut self.queues[source.index()];
            let Some(&word) = queue.entries.peek() else {
                continue;
            };
            let envelope = word.render_envelope();
            return match link.write(envelope.as_bytes()) {
                Ok(()) => {
                    queue.entries.retire();
                    self.stats.forwarded = self.stats.forwarded.wrapping_add(1);
                    trace!(?source, "forwarded {}", word.hex());
                    Ok(DrainOutcome::Forwarded(source, word))
                }
                Err(nb::Error::WouldBlock) => Ok(DrainOutcome::Busy),
                Err(nb::Error::Other(e)) => Err(e),
            };
        }
        Ok(DrainOutcome::Empty)
    }

    /// Look for one complete self-addressed command across the sources.
    pub fn interpret(&mut self) -> Result<Option<SelfCommand>, CommandError> {
        for source in self.priority {
            let queue = &mut self.queues[source.index()];
            match queue.next_self_command() {
                Interpretation::Idle => continue,
                Interpretation::Skipped => return Ok(None),
                Interpretation::Complete { header, end } => {
                    let command = queue.collect(source, header, end);
                    self.stats.self_commands = self.stats.self_commands.wrapping_add(1);
                    debug!(?source, id = command.id(), len = command.data.len(), "self command");
                    return Ok(Some(command));
                }
                Interpretation::Sequence(index) => {
                    self.mode.bump_u8(&mut self.command_errors);
                    warn!(?source, index, "self command sequence error");
                    return Err(CommandError::Sequence { origin: source, index });
                }
            }
        }
        Ok(None)
    }

    /// Most recent command received from the last active source.
    #[must_use]
    pub fn last_command(&self) -> CommandWord {
        let queue = &self.queues[self.last_source.index()];
        *queue.entries.get(wrap_dec(queue.entries.write_index(), CMD_BUFFER_SIZE))
    }

    #[must_use]
    pub const fn last_source(&self) -> CommandSource {
        self.last_source
    }

    pub fn take_science_request(&mut self) -> bool {
        core::mem::take(&mut self.science_request)
    }

    #[must_use]
    pub const fn science_request_pending(&self) -> bool {
        self.science_request
    }

    #[must_use]
    pub fn parser_state(&self, source: CommandSource) -> ParserState {
        self.parsers[source.index()]
    }

    /// Commands waiting to be forwarded.
    #[must_use]
    pub fn pending(&self, source: CommandSource) -> usize {
        self.queues[source.index()].entries.len()
    }

    #[must_use]
    pub fn free(&self, source: CommandSource) -> usize {
        self.queues[source.index()].free()
    }

    #[must_use]
    pub const fn command_count(&self) -> u16 {
        self.command_count
    }

    #[must_use]
    pub const fn command_errors(&self) -> u8 {
        self.command_errors
    }

    #[must_use]
    pub const fn stats(&self) -> CommandStats {
        self.stats
    }
}
