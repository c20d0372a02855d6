//! Single-channel I2C transaction scheduler.
//!
//! Transactions are queued as owned descriptors and issued strictly in
//! order, one at a time. Completion is found by polling the master's latched
//! status once per main-loop pass.

use crate::hal::{BusFault, BusStatus, I2cBus, TransferMode};
use crate::ring::RingChannel;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{trace, warn};

pub const I2C_QUEUE_SIZE: usize = 64;
pub const I2C_MAX_TRANSFER: usize = 20;
pub const I2C_MAX_RETRIES: u8 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    Read,
    #[default]
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum I2cError {
    #[error("transaction queue full")]
    QueueFull,
    #[error("transfer of {0} bytes exceeds descriptor buffer")]
    TooLong(usize),
    #[error("bus reported {0}")]
    Bus(BusFault),
    #[error("could not start transfer: {0}")]
    Issue(BusFault),
    #[error("completion status does not match transfer direction")]
    Mismatch,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Outcome {
    #[default]
    Pending,
    Done,
    Failed(I2cError),
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct I2cTransaction {
    pub direction: Direction,
    pub address: u8,
    /// Write payload, or read destination sized to the read length.
    pub data: heapless::Vec<u8, I2C_MAX_TRANSFER>,
    pub mode: TransferMode,
    pub retries: u8,
    pub outcome: Outcome,
}

impl I2cTransaction {
    pub fn write(address: u8, payload: &[u8], mode: TransferMode) -> Result<Self, I2cError> {
        let data = heapless::Vec::from_slice(payload).map_err(|()| I2cError::TooLong(payload.len()))?;
        Ok(Self {
            direction: Direction::Write,
            address,
            data,
            mode,
            ..Self::default()
        })
    }

    pub fn read(address: u8, len: usize, mode: TransferMode) -> Result<Self, I2cError> {
        let mut data = heapless::Vec::new();
        data.resize(len, 0).map_err(|()| I2cError::TooLong(len))?;
        Ok(Self {
            direction: Direction::Read,
            address,
            data,
            mode,
            ..Self::default()
        })
    }

    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.outcome == Outcome::Done
    }
}

/// What one scheduler step did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum I2cStep {
    Idle,
    Busy,
    Issued(usize),
    /// Issue failed; the head stays queued for another attempt.
    Retrying(usize, BusFault),
    Completed(usize),
    Failed(usize, I2cError),
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct I2cStats {
    pub submitted: u32,
    pub completed: u32,
    pub failed: u32,
    pub retries: u32,
    pub refused: u32,
}

#[derive(Debug, Clone)]
pub struct I2cScheduler {
    queue: RingChannel<I2cTransaction, I2C_QUEUE_SIZE>,
    in_flight: bool,
    max_retries: u8,
    stats: I2cStats,
}

impl I2cScheduler {
    pub fn new(max_retries: u8) -> Self {
        Self {
            queue: RingChannel::new(),
            in_flight: false,
            max_retries,
            stats: I2cStats::default(),
        }
    }

    /// Queue a transaction. Returns its absolute queue index, which stays
    /// valid for [`I2cScheduler::is_done`] and [`I2cScheduler::transaction`].
    pub fn submit(&mut self, transaction: I2cTransaction) -> Result<usize, I2cError> {
        match self.queue.push(transaction) {
            Ok(idx) => {
                self.stats.submitted = self.stats.submitted.wrapping_add(1);
                Ok(idx)
            }
            Err(_) => {
                self.stats.refused = self.stats.refused.wrapping_add(1);
                Err(I2cError::QueueFull)
            }
        }
    }

    #[must_use]
    pub const fn can_accept(&self, n: usize) -> bool {
        self.queue.can_accept(n)
    }

    #[must_use]
    pub const fn free(&self) -> usize {
        self.queue.free()
    }

    #[must_use]
    pub const fn pending(&self) -> usize {
        self.queue.len()
    }

    /// Whether the transaction at `idx` has left the queue.
    #[must_use]
    pub const fn is_done(&self, idx: usize) -> bool {
        self.queue.element_done(idx)
    }

    #[must_use]
    pub fn transaction(&self, idx: usize) -> &I2cTransaction {
        self.queue.get(idx)
    }

    #[must_use]
    pub const fn stats(&self) -> I2cStats {
        self.stats
    }

    /// Advance the head transaction by at most one step.
    pub fn check<B: I2cBus>(&mut self, bus: &mut B) -> I2cStep {
        if self.queue.is_empty() {
            return I2cStep::Idle;
        }
        let status = match bus.poll_status() {
            Ok(status) => status,
            Err(nb::Error::WouldBlock) => return I2cStep::Busy,
            Err(nb::Error::Other(never)) => match never {},
        };
        let step = match status {
            BusStatus::Error(fault) if self.in_flight => self.finish(Err(I2cError::Bus(fault))),
            BusStatus::ReadComplete if self.in_flight => {
                if let Some(head) = self.queue.peek_mut() {
                    if head.direction == Direction::Read {
                        bus.read_data(&mut head.data);
                    }
                }
                self.finish_checked(Direction::Read)
            }
            BusStatus::WriteComplete if self.in_flight => self.finish_checked(Direction::Write),
            _ => self.issue(bus),
        };
        bus.clear_status();
        step
    }

    fn finish_checked(&mut self, completed: Direction) -> I2cStep {
        let matches = self.queue.peek().is_some_and(|head| head.direction == completed);
        if matches {
            self.finish(Ok(()))
        } else {
            self.finish(Err(I2cError::Mismatch))
        }
    }

    fn finish(&mut self, result: Result<(), I2cError>) -> I2cStep {
        let idx = self.queue.read_index();
        self.in_flight = false;
        if let Some(head) = self.queue.peek_mut() {
            head.outcome = match result {
                Ok(()) => Outcome::Done,
                Err(e) => Outcome::Failed(e),
            };
        }
        self.queue.retire();
        match result {
            Ok(()) => {
                self.stats.completed = self.stats.completed.wrapping_add(1);
                I2cStep::Completed(idx)
            }
            Err(e) => {
                self.stats.failed = self.stats.failed.wrapping_add(1);
                warn!(idx, "i2c transaction failed: {}", e);
                I2cStep::Failed(idx, e)
            }
        }
    }

    fn issue<B: I2cBus>(&mut self, bus: &mut B) -> I2cStep {
        let idx = self.queue.read_index();
        let Some(head) = self.queue.peek_mut() else {
            return I2cStep::Idle;
        };
        let started = match head.direction {
            Direction::Write => bus.start_write(head.address, &head.data, head.mode),
            Direction::Read => bus.start_read(head.address, head.data.len(), head.mode),
        };
        match started {
            Ok(()) => {
                self.in_flight = true;
                trace!(idx, address = head.address, "i2c transfer started");
                I2cStep::Issued(idx)
            }
            Err(fault) => {
                head.retries = head.retries.saturating_add(1);
                self.stats.retries = self.stats.retries.wrapping_add(1);
                if head.retries > self.max_retries {
                    self.finish(Err(I2cError::Issue(fault)))
                } else {
                    I2cStep::Retrying(idx, fault)
                }
            }
        }
    }
}

impl Default for I2cScheduler {
    fn default() -> Self {
        Self::new(I2C_MAX_RETRIES)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::convert::Infallible;

    /// Completes every transfer on the poll after it starts.
    #[derive(Default)]
    struct LoopbackBus {
        status: Option<BusStatus>,
        latched: Option<BusStatus>,
        reject_reads: bool,
        started: Vec<u8>,
    }

    impl I2cBus for LoopbackBus {
        fn poll_status(&mut self) -> nb::Result<BusStatus, Infallible> {
            if let Some(status) = self.latched {
                return Ok(status);
            }
            match self.status.take() {
                Some(status) => {
                    self.latched = Some(status);
                    Err(nb::Error::WouldBlock)
                }
                None => Ok(BusStatus::Idle),
            }
        }

        fn start_write(&mut self, address: u8, _data: &[u8], _mode: TransferMode) -> Result<(), BusFault> {
            self.started.push(address);
            self.status = Some(BusStatus::WriteComplete);
            Ok(())
        }

        fn start_read(&mut self, address: u8, _len: usize, _mode: TransferMode) -> Result<(), BusFault> {
            if self.reject_reads {
                return Err(BusFault::Busy);
            }
            self.started.push(address);
            self.status = Some(BusStatus::ReadComplete);
            Ok(())
        }

        fn read_data(&mut self, buf: &mut [u8]) {
            buf.fill(0x5A);
        }

        fn clear_status(&mut self) {
            self.latched = None;
        }
    }

    fn run(scheduler: &mut I2cScheduler, bus: &mut LoopbackBus) {
        for _ in 0..32 {
            scheduler.check(bus);
        }
    }

    #[test]
    fn test_read_copies_data() {
        let mut scheduler = I2cScheduler::default();
        let mut bus = LoopbackBus::default();
        let idx = scheduler.submit(I2cTransaction::read(0x48, 2, TransferMode::Complete).unwrap()).unwrap();
        assert!(!scheduler.is_done(idx));
        run(&mut scheduler, &mut bus);
        assert!(scheduler.is_done(idx));
        let tx = scheduler.transaction(idx);
        assert!(tx.succeeded());
        assert_eq!(tx.data.as_slice(), &[0x5A, 0x5A]);
    }

    #[test]
    fn test_issue_failure_retries_once() {
        let mut scheduler = I2cScheduler::default();
        let mut bus = LoopbackBus {
            reject_reads: true,
            ..LoopbackBus::default()
        };
        let idx = scheduler.submit(I2cTransaction::read(0x40, 2, TransferMode::Complete).unwrap()).unwrap();
        assert_eq!(scheduler.check(&mut bus), I2cStep::Retrying(idx, BusFault::Busy));
        assert_eq!(
            scheduler.check(&mut bus),
            I2cStep::Failed(idx, I2cError::Issue(BusFault::Busy))
        );
        assert_eq!(scheduler.transaction(idx).retries, 2);
    }

    #[test]
    fn test_payload_too_long() {
        assert_eq!(
            I2cTransaction::write(0x70, &[0u8; I2C_MAX_TRANSFER + 1], TransferMode::Complete),
            Err(I2cError::TooLong(I2C_MAX_TRANSFER + 1))
        );
    }

    #[test]
    fn test_queue_refuses_when_full() {
        let mut scheduler = I2cScheduler::default();
        for _ in 0..I2C_QUEUE_SIZE - 1 {
            scheduler.submit(I2cTransaction::default()).unwrap();
        }
        assert_eq!(scheduler.submit(I2cTransaction::default()), Err(I2cError::QueueFull));
        assert_eq!(scheduler.stats().refused, 1);
    }
}
