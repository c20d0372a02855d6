use daqcore::counters::PulseChannel;
use daqcore::housekeeping::pack_time_date;
use daqcore::sim::{EventGenerator, SimBoard, SimConfig};
use daqcore::{CommandSource, ControllerConfig, DaqController};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::time::{self, Instant};
use tracing::{error, info, warn};

const MAIN_LOOP_PERIOD_US: u64 = 500;
const TICK_PERIOD_MS: u64 = 250;
const EVENT_PERIOD_MS: u64 = 40;
const STATUS_PERIOD_S: u64 = 5;

/// Controller plus the board it runs on, shared by every task.
struct Bench {
    controller: DaqController,
    board: SimBoard,
    frames_out: usize,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt::init();

    println!("DAQ controller simulator");
    println!("========================");
    println!("stdin: <lr0|lr1|usb> <hex bytes...>, status, quit");

    let config = match std::env::args().nth(1) {
        Some(path) => ControllerConfig::from_json(&std::fs::read_to_string(path)?)?,
        None => ControllerConfig::default(),
    };
    let sim = SimConfig {
        i2c_fault_percent: 2,
        ..SimConfig::default()
    };
    let bench = Arc::new(Mutex::new(Bench {
        controller: DaqController::new(config)?,
        board: SimBoard::new(sim),
        frames_out: 0,
    }));

    // 4 Hz timer: pulse captures and the housekeeping period.
    let tick_bench = Arc::clone(&bench);
    let ticker = tokio::spawn(async move {
        let started = Instant::now();
        let mut interval = time::interval(Duration::from_millis(TICK_PERIOD_MS));
        let mut capture: u16 = 0;
        loop {
            interval.tick().await;
            let secs = started.elapsed().as_secs();
            let packed = pack_time_date(
                24,
                1,
                1,
                ((secs / 3600) % 24) as u8,
                ((secs / 60) % 60) as u8,
                (secs % 60) as u8,
            );
            capture = capture.wrapping_add(1_733);
            let mut guard = tick_bench.lock().await;
            for (i, channel) in PulseChannel::ALL.into_iter().enumerate() {
                guard.controller.on_pulse_capture(channel, capture.wrapping_mul(i as u16 + 1));
            }
            if guard.controller.on_timer_tick(packed) {
                info!(packed, "housekeeping cycle requested");
            }
        }
    });

    // Coprocessor traffic, with an occasional housekeeping packet.
    let event_bench = Arc::clone(&bench);
    let events = tokio::spawn(async move {
        let mut generator = EventGenerator::new();
        let mut interval = time::interval(Duration::from_millis(EVENT_PERIOD_MS));
        let mut n: u32 = 0;
        loop {
            interval.tick().await;
            n = n.wrapping_add(1);
            let packet = match n % 25 {
                0 => generator.housekeeping(90),
                k if k % 2 == 0 => generator.fixed(),
                k => generator.variable(0x01, (k * 9) as u8),
            };
            event_bench.lock().await.controller.on_event_bytes(&packet);
        }
    });

    let status_bench = Arc::clone(&bench);
    let status = tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_secs(STATUS_PERIOD_S));
        loop {
            interval.tick().await;
            let guard = status_bench.lock().await;
            match serde_json::to_string(&guard.controller.status()) {
                Ok(json) => println!("{}", json),
                Err(e) => warn!("status encode failed: {}", e),
            }
        }
    });

    let loop_bench = Arc::clone(&bench);
    let main_loop = tokio::spawn(async move {
        let mut interval = time::interval(Duration::from_micros(MAIN_LOOP_PERIOD_US));
        loop {
            interval.tick().await;
            let mut guard = loop_bench.lock().await;
            let Bench { controller, board, frames_out } = &mut *guard;
            board.service_interrupts(controller);
            let report = controller.poll(board);
            *frames_out += report.frames_served;
            for e in &report.errors {
                warn!("{}", e);
            }
            if let Some(command) = report.self_command {
                info!(source = ?command.source, id = command.id(), data = ?command.data.as_slice(), "self command");
            }
            // links keep every write until drained
            board.primary.take_writes();
            board.secondary.take_writes();
            for packet in board.low_rate.take_writes() {
                info!(len = packet.len(), "low-rate packet sent");
            }
            for envelope in board.command_link.take_writes() {
                info!("command bus: {}", String::from_utf8_lossy(&envelope).trim_end());
            }
        }
    });

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        match line {
            "" => continue,
            "quit" => break,
            "status" => {
                let guard = bench.lock().await;
                println!("{}", serde_json::to_string_pretty(&guard.controller.status())?);
                println!("frames out: {}", guard.frames_out);
            }
            _ => match parse_command_line(line) {
                Ok((source, bytes)) => {
                    let mut guard = bench.lock().await;
                    for byte in bytes {
                        match guard.controller.on_command_byte(source, byte) {
                            Ok(event) => info!(?source, ?event, "command byte"),
                            Err(e) => error!("{}", e),
                        }
                    }
                }
                Err(e) => warn!("{}", e),
            },
        }
    }

    for task in [ticker, events, status, main_loop] {
        task.abort();
    }
    println!("DAQ controller simulator stopped");
    Ok(())
}

fn parse_command_line(line: &str) -> Result<(CommandSource, Vec<u8>), String> {
    let mut words = line.split_whitespace();
    let source = match words.next() {
        Some("lr0") => CommandSource::LowRate0,
        Some("lr1") => CommandSource::LowRate1,
        Some("usb") => CommandSource::Usb,
        other => return Err(format!("unknown source {:?}", other.unwrap_or(""))),
    };
    let bytes = words
        .map(|w| u8::from_str_radix(w.trim_start_matches("0x"), 16).map_err(|e| format!("bad byte {}: {}", w, e)))
        .collect::<Result<Vec<u8>, String>>()?;
    Ok((source, bytes))
}
