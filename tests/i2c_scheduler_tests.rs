use core::convert::Infallible;
use daqcore::hal::{BusFault, BusStatus, I2cBus, TransferMode};
use daqcore::i2c::{I2cError, I2cScheduler, I2cStep, I2cTransaction, Outcome};
use daqcore::sim::{BusGlitches, SimI2cBus};

/// Refuses to start any transfer to `refused`; everything else completes on
/// the next status poll.
struct ScriptedBus {
    refused: u8,
    report_read_for_writes: bool,
    pending: Option<BusStatus>,
    latched: BusStatus,
    attempts: Vec<u8>,
}

impl ScriptedBus {
    fn new(refused: u8) -> Self {
        Self {
            refused,
            report_read_for_writes: false,
            pending: None,
            latched: BusStatus::Idle,
            attempts: Vec::new(),
        }
    }

    fn start(&mut self, address: u8, status: BusStatus) -> Result<(), BusFault> {
        self.attempts.push(address);
        if address == self.refused {
            return Err(BusFault::ArbitrationLost);
        }
        self.pending = Some(status);
        Ok(())
    }
}

impl I2cBus for ScriptedBus {
    fn poll_status(&mut self) -> nb::Result<BusStatus, Infallible> {
        if let Some(status) = self.pending.take() {
            self.latched = status;
        }
        Ok(self.latched)
    }

    fn start_write(&mut self, address: u8, _data: &[u8], _mode: TransferMode) -> Result<(), BusFault> {
        let status = if self.report_read_for_writes {
            BusStatus::ReadComplete
        } else {
            BusStatus::WriteComplete
        };
        self.start(address, status)
    }

    fn start_read(&mut self, address: u8, _len: usize, _mode: TransferMode) -> Result<(), BusFault> {
        self.start(address, BusStatus::ReadComplete)
    }

    fn read_data(&mut self, buf: &mut [u8]) {
        for (i, b) in buf.iter_mut().enumerate() {
            *b = 0xA0 + i as u8;
        }
    }

    fn clear_status(&mut self) {
        self.latched = BusStatus::Idle;
    }
}

fn write(address: u8) -> I2cTransaction {
    I2cTransaction::write(address, &[0x01], TransferMode::Complete).unwrap()
}

#[test]
fn test_failed_descriptor_does_not_block_the_queue() {
    let mut scheduler = I2cScheduler::default();
    let mut bus = ScriptedBus::new(0x66);
    let first = scheduler.submit(write(0x40)).unwrap();
    let second = scheduler.submit(write(0x66)).unwrap();
    let third = scheduler
        .submit(I2cTransaction::read(0x41, 2, TransferMode::Complete).unwrap())
        .unwrap();

    let steps: Vec<I2cStep> = (0..7).map(|_| scheduler.check(&mut bus)).collect();
    assert_eq!(
        steps,
        [
            I2cStep::Issued(first),
            I2cStep::Completed(first),
            I2cStep::Retrying(second, BusFault::ArbitrationLost),
            I2cStep::Failed(second, I2cError::Issue(BusFault::ArbitrationLost)),
            I2cStep::Issued(third),
            I2cStep::Completed(third),
            I2cStep::Idle,
        ]
    );
    assert_eq!(bus.attempts, [0x40, 0x66, 0x66, 0x41]);

    assert_eq!(
        scheduler.transaction(second).outcome,
        Outcome::Failed(I2cError::Issue(BusFault::ArbitrationLost))
    );
    assert_eq!(scheduler.transaction(third).data.as_slice(), &[0xA0, 0xA1]);
    assert!([first, second, third].iter().all(|&idx| scheduler.is_done(idx)));

    let stats = scheduler.stats();
    assert_eq!((stats.completed, stats.failed, stats.retries), (2, 1, 2));
}

#[test]
fn test_more_retries_allowed_when_configured() {
    let mut scheduler = I2cScheduler::new(3);
    let mut bus = ScriptedBus::new(0x66);
    let idx = scheduler.submit(write(0x66)).unwrap();
    for _ in 0..3 {
        assert!(matches!(scheduler.check(&mut bus), I2cStep::Retrying(..)));
    }
    assert!(matches!(scheduler.check(&mut bus), I2cStep::Failed(i, _) if i == idx));
    assert_eq!(bus.attempts.len(), 4);
}

#[test]
fn test_completion_direction_mismatch_fails_head() {
    let mut scheduler = I2cScheduler::default();
    let mut bus = ScriptedBus::new(0);
    bus.report_read_for_writes = true;
    let idx = scheduler.submit(write(0x40)).unwrap();
    assert_eq!(scheduler.check(&mut bus), I2cStep::Issued(idx));
    assert_eq!(scheduler.check(&mut bus), I2cStep::Failed(idx, I2cError::Mismatch));
}

#[test]
fn test_nack_reported_after_transfer_starts() {
    let mut scheduler = I2cScheduler::default();
    let mut bus = SimI2cBus::new(1, BusGlitches::new(0));
    bus.set_offline(0x48, true);
    let idx = scheduler
        .submit(I2cTransaction::read(0x48, 2, TransferMode::Complete).unwrap())
        .unwrap();

    assert_eq!(scheduler.check(&mut bus), I2cStep::Issued(idx));
    assert_eq!(scheduler.check(&mut bus), I2cStep::Busy);
    assert_eq!(scheduler.check(&mut bus), I2cStep::Failed(idx, I2cError::Bus(BusFault::Nack)));
    assert_eq!(bus.stats().nacks, 1);
    assert_eq!(scheduler.pending(), 0);
}

#[test]
fn test_register_read_through_simulated_bus() {
    let mut scheduler = I2cScheduler::default();
    let mut bus = SimI2cBus::new(0, BusGlitches::new(0));
    bus.set_register(0x44, Some(0x02), &[0x12, 0x34]);
    scheduler
        .submit(I2cTransaction::write(0x44, &[0x02], TransferMode::Complete).unwrap())
        .unwrap();
    let read = scheduler
        .submit(I2cTransaction::read(0x44, 2, TransferMode::Complete).unwrap())
        .unwrap();
    for _ in 0..8 {
        scheduler.check(&mut bus);
    }
    assert!(scheduler.transaction(read).succeeded());
    assert_eq!(scheduler.transaction(read).data.as_slice(), &[0x12, 0x34]);
    assert_eq!(bus.write_log(), &[(0x44, vec![0x02])]);
}
