use daqcore::command::{
    encode_command, encode_request, CommandEngine, CommandError, CommandSource, CommandWord, DrainOutcome, ParseError,
    ParseEvent, ParserState, CMD_BUFFER_SIZE, DLE, ETX,
};
use daqcore::counters::CounterMode;
use daqcore::lowrate::{LOW_RATE_PACKET_BYTES, SDATA_ID};
use daqcore::sim::{SimBoard, SimConfig, SimLink};
use daqcore::{ControllerConfig, ControllerError, DaqController};

fn engine() -> CommandEngine {
    CommandEngine::new(CommandSource::ALL, CounterMode::Wrapping)
}

fn feed(engine: &mut CommandEngine, source: CommandSource, bytes: &[u8]) -> Vec<Result<ParseEvent, CommandError>> {
    bytes.iter().map(|&b| engine.receive(source, b)).collect()
}

fn foreign(data: u8) -> CommandWord {
    CommandWord::new(data, 0xB6)
}

#[test]
fn test_well_formed_frame_is_queued() {
    let mut engine = engine();
    let results = feed(&mut engine, CommandSource::LowRate0, &[DLE, 0x14, 0x02, 0xAB, 0xCD, ETX]);
    assert_eq!(results[5], Ok(ParseEvent::Command(CommandWord::new(0xAB, 0xCD))));
    assert!(results[..5].iter().all(|r| *r == Ok(ParseEvent::Pending)));
    assert_eq!(engine.pending(CommandSource::LowRate0), 1);
    assert_eq!(engine.last_command(), CommandWord::new(0xAB, 0xCD));
    assert_eq!(engine.command_count(), 1);
    assert_eq!(engine.command_errors(), 0);
}

#[test]
fn test_short_frame_fails_on_missing_etx() {
    let mut engine = engine();
    // One data byte short: the ETX is taken as the address byte.
    let results = feed(&mut engine, CommandSource::Usb, &[DLE, 0x14, 0x02, 0xAB, ETX]);
    assert!(results.iter().all(Result::is_ok));
    assert_eq!(
        engine.parser_state(CommandSource::Usb),
        ParserState::CheckEtxCmd(CommandWord::new(0xAB, ETX))
    );

    assert_eq!(
        engine.receive(CommandSource::Usb, DLE),
        Err(CommandError::Parse {
            origin: CommandSource::Usb,
            error: ParseError::MissingEtx(DLE),
        })
    );
    assert_eq!(engine.parser_state(CommandSource::Usb), ParserState::WaitDle);
    assert_eq!(engine.command_errors(), 1);
    assert_eq!(engine.pending(CommandSource::Usb), 0);
}

#[test]
fn test_bad_length_resets_parser() {
    let mut engine = engine();
    let results = feed(&mut engine, CommandSource::LowRate1, &[DLE, 0x14, 0x03]);
    assert_eq!(
        results[2],
        Err(CommandError::Parse {
            origin: CommandSource::LowRate1,
            error: ParseError::BadLength(0x03),
        })
    );
    // A fresh frame right after is accepted.
    feed(&mut engine, CommandSource::LowRate1, &encode_command(foreign(1)));
    assert_eq!(engine.pending(CommandSource::LowRate1), 1);
}

#[test]
fn test_drain_follows_priority_order() {
    let mut engine = CommandEngine::new(
        [CommandSource::Usb, CommandSource::LowRate0, CommandSource::LowRate1],
        CounterMode::Wrapping,
    );
    let mut link = SimLink::new(0);
    feed(&mut engine, CommandSource::LowRate1, &encode_command(CommandWord::new(0x01, 0xB6)));
    feed(&mut engine, CommandSource::Usb, &encode_command(CommandWord::new(0x0A, 0xB6)));

    assert_eq!(
        engine.drain(&mut link),
        Ok(DrainOutcome::Forwarded(CommandSource::Usb, CommandWord::new(0x0A, 0xB6)))
    );
    assert_eq!(
        engine.drain(&mut link),
        Ok(DrainOutcome::Forwarded(CommandSource::LowRate1, CommandWord::new(0x01, 0xB6)))
    );
    assert_eq!(engine.drain(&mut link), Ok(DrainOutcome::Empty));
    assert_eq!(link.writes()[0], b"S0AB6 01WS0AB6 01WS0AB6 01W\r\n".to_vec());
}

#[test]
fn test_drain_waits_for_busy_link() {
    let mut engine = engine();
    let mut link = SimLink::new(2);
    engine
        .load_batch(CommandSource::LowRate0, &[foreign(1), foreign(2)])
        .unwrap();
    assert!(matches!(engine.drain(&mut link), Ok(DrainOutcome::Forwarded(..))));
    assert_eq!(engine.drain(&mut link), Ok(DrainOutcome::Busy));
    assert_eq!(engine.drain(&mut link), Ok(DrainOutcome::Busy));
    assert!(matches!(engine.drain(&mut link), Ok(DrainOutcome::Forwarded(..))));
    assert_eq!(link.writes().len(), 2);
}

#[test]
fn test_batch_is_all_or_nothing() {
    let mut engine = engine();
    let batch: Vec<CommandWord> = (0..CMD_BUFFER_SIZE).map(|i| foreign(i as u8)).collect();
    assert_eq!(
        engine.load_batch(CommandSource::LowRate0, &batch),
        Err(CommandError::BatchTooLarge {
            requested: CMD_BUFFER_SIZE,
            free: CMD_BUFFER_SIZE - 1,
        })
    );
    assert_eq!(engine.pending(CommandSource::LowRate0), 0);

    assert_eq!(engine.load_batch(CommandSource::LowRate0, &batch[1..]), Ok(CMD_BUFFER_SIZE - 1));
    assert_eq!(engine.free(CommandSource::LowRate0), 0);
    assert!(engine.load_batch(CommandSource::LowRate0, &batch[..1]).is_err());
}

#[test]
fn test_admission_waits_for_interpreter() {
    let mut engine = engine();
    let mut link = SimLink::new(0);
    let batch: Vec<CommandWord> = (0..10).map(foreign).collect();
    engine.load_batch(CommandSource::LowRate0, &batch).unwrap();
    for _ in 0..10 {
        engine.drain(&mut link).unwrap();
    }
    assert_eq!(engine.pending(CommandSource::LowRate0), 0);
    // Forwarded but not yet walked by the interpreter: still occupied.
    assert_eq!(engine.free(CommandSource::LowRate0), CMD_BUFFER_SIZE - 1 - 10);

    for _ in 0..10 {
        assert_eq!(engine.interpret(), Ok(None));
    }
    assert_eq!(engine.free(CommandSource::LowRate0), CMD_BUFFER_SIZE - 1);
}

#[test]
fn test_multi_byte_self_command() {
    let mut engine = engine();
    engine
        .load_batch(
            CommandSource::LowRate1,
            &[
                CommandWord::new(0x11, 0x2B),
                CommandWord::new(0xA1, 0x29),
                CommandWord::new(0xA2, 0x2A),
                CommandWord::new(0xA3, 0x2B),
            ],
        )
        .unwrap();
    let command = engine.interpret().unwrap().unwrap();
    assert_eq!(command.source, CommandSource::LowRate1);
    assert_eq!(command.id(), 0x11);
    assert_eq!(command.data.as_slice(), &[0xA1, 0xA2, 0xA3]);
    assert_eq!(engine.interpret(), Ok(None));
    assert_eq!(engine.stats().self_commands, 1);
}

#[test]
fn test_broken_address_run_is_a_sequence_error() {
    let mut engine = engine();
    engine
        .load_batch(
            CommandSource::LowRate0,
            &[
                CommandWord::new(0x11, 0x2B),
                CommandWord::new(0xA1, 0x29),
                CommandWord::new(0xA2, 0x35),
            ],
        )
        .unwrap();
    assert_eq!(
        engine.interpret(),
        Err(CommandError::Sequence {
            origin: CommandSource::LowRate0,
            index: 2,
        })
    );
    assert_eq!(engine.command_errors(), 1);
}

#[test]
fn test_controller_forwards_and_answers_requests() {
    let mut controller = DaqController::new(ControllerConfig::default()).unwrap();
    let mut board = SimBoard::default();
    for byte in encode_command(CommandWord::new(0x0A, 0xB6)) {
        controller.on_command_byte(CommandSource::LowRate0, byte).unwrap();
    }
    for byte in encode_request() {
        controller.on_command_byte(CommandSource::LowRate1, byte).unwrap();
    }

    let report = controller.poll(&mut board);
    assert_eq!(report.forwarded, Some((CommandSource::LowRate0, CommandWord::new(0x0A, 0xB6))));
    assert!(report.errors.is_empty());
    assert_eq!(board.command_link.writes().len(), 1);

    let packet = &board.low_rate.writes()[0];
    assert_eq!(packet.len(), LOW_RATE_PACKET_BYTES);
    assert_eq!(&packet[..3], &[DLE, SDATA_ID, 143]);
    assert_eq!(packet[LOW_RATE_PACKET_BYTES - 1], ETX);
}

#[test]
fn test_request_on_busy_low_rate_link_is_dropped() {
    let mut controller = DaqController::new(ControllerConfig::default()).unwrap();
    let mut board = SimBoard::new(SimConfig {
        low_rate_latency: 5,
        ..SimConfig::default()
    });
    for _ in 0..2 {
        for byte in encode_request() {
            controller.on_command_byte(CommandSource::Usb, byte).unwrap();
        }
        board.run(&mut controller, 1);
    }
    assert_eq!(board.low_rate.writes().len(), 1);
    assert_eq!(controller.low_rate().stats().dropped, 1);
    assert_eq!(controller.general_errors(), 1);

    for byte in encode_request() {
        controller.on_command_byte(CommandSource::Usb, byte).unwrap();
    }
    let report = controller.poll(&mut board);
    assert!(matches!(report.errors.first(), Some(ControllerError::LowRateBusy)));
}
