use clap::{App, AppSettings, Arg, ArgMatches, SubCommand};
use colored::*;
use daqcore::command::{encode_command, encode_request, CommandWord};
use daqcore::frame::{FrameOutput, SequenceCheck, FRAME_BYTES};
use daqcore::housekeeping::{layout, HK_HEAD, HK_RECORD_BYTES};
use daqcore::ControllerConfig;
use std::fs;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let matches = App::new("daqtool")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Encode controller commands and inspect captured frame streams")
        .setting(AppSettings::SubcommandRequiredElseHelp)
        .arg(
            Arg::with_name("format")
                .short("f")
                .long("format")
                .value_name("FORMAT")
                .help("Output format")
                .takes_value(true)
                .possible_values(&["table", "json", "compact"])
                .default_value("table")
                .global(true),
        )
        .subcommand(
            SubCommand::with_name("command")
                .about("DLE frame for one command word")
                .arg(Arg::with_name("data").required(true).validator(validate_byte).help("Data byte, hex"))
                .arg(Arg::with_name("addr").required(true).validator(validate_byte).help("Address byte, hex")),
        )
        .subcommand(SubCommand::with_name("request").about("DLE science-data request"))
        .subcommand(
            SubCommand::with_name("envelope")
                .about("Legacy command-bus text for one command word")
                .arg(Arg::with_name("data").required(true).validator(validate_byte))
                .arg(Arg::with_name("addr").required(true).validator(validate_byte)),
        )
        .subcommand(
            SubCommand::with_name("decode")
                .about("Decode a captured stream of 34-byte frames")
                .arg(Arg::with_name("file").required(true).help("Raw capture file"))
                .arg(
                    Arg::with_name("payload")
                        .short("p")
                        .long("payload")
                        .help("Print each frame's payload bytes"),
                ),
        )
        .subcommand(SubCommand::with_name("layout").about("Housekeeping record byte layout"))
        .subcommand(
            SubCommand::with_name("config")
                .about("Print the default configuration, or validate a file")
                .arg(Arg::with_name("file").help("Configuration JSON to validate")),
        )
        .get_matches();

    let format = matches.value_of("format").unwrap_or("table");
    match matches.subcommand() {
        ("command", Some(sub)) => {
            let word = command_word(sub)?;
            print_bytes("command", &encode_command(word), format);
        }
        ("request", _) => print_bytes("request", &encode_request(), format),
        ("envelope", Some(sub)) => {
            let envelope = command_word(sub)?.render_envelope();
            match format {
                "json" => println!("{}", serde_json::json!({ "envelope": envelope.as_str() })),
                _ => print!("{}", envelope),
            }
        }
        ("decode", Some(sub)) => handle_decode(sub, format)?,
        ("layout", _) => print_layout(format)?,
        ("config", Some(sub)) => handle_config(sub)?,
        _ => println!("{}", "No command specified. Use --help for usage information.".yellow()),
    }
    Ok(())
}

fn parse_byte(value: &str) -> Result<u8, std::num::ParseIntError> {
    u8::from_str_radix(value.trim_start_matches("0x"), 16)
}

fn validate_byte(value: String) -> Result<(), String> {
    parse_byte(&value).map(|_| ()).map_err(|_| format!("{} is not a hex byte", value))
}

fn command_word(matches: &ArgMatches<'_>) -> Result<CommandWord, Box<dyn std::error::Error>> {
    let data = parse_byte(matches.value_of("data").unwrap_or_default())?;
    let addr = parse_byte(matches.value_of("addr").unwrap_or_default())?;
    Ok(CommandWord::new(data, addr))
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02X}", b)).collect::<Vec<_>>().join(" ")
}

fn print_bytes(label: &str, bytes: &[u8], format: &str) {
    match format {
        "json" => println!("{}", serde_json::json!({ label: bytes })),
        "compact" => println!("{}", hex(bytes)),
        _ => println!("{} {}", format!("{}:", label).bright_white(), hex(bytes).bright_cyan()),
    }
}

fn handle_decode(matches: &ArgMatches<'_>, format: &str) -> Result<(), Box<dyn std::error::Error>> {
    let path = matches.value_of("file").unwrap_or_default();
    let capture = fs::read(path)?;
    let show_payload = matches.is_present("payload");
    let mut check = SequenceCheck::default();
    let mut bad_frames = 0u32;

    for (i, chunk) in capture.chunks(FRAME_BYTES).enumerate() {
        let frame = match FrameOutput::from_bytes(chunk) {
            Ok(frame) => frame,
            Err(e) => {
                bad_frames += 1;
                if format != "json" {
                    println!("{} frame {}: {}", "✗".red(), i, e.to_string().bright_red());
                }
                continue;
            }
        };
        let gap = check.observe(&frame);
        if format == "table" {
            let seq = format!("{:06X}", frame.sequence());
            let head = format!("{:02X}", frame.data[0]);
            match gap {
                Some(n) => println!("{} {} {} {}", seq.yellow(), head, "gap".bright_red(), n),
                None => println!("{} {}", seq.bright_green(), head),
            }
            if show_payload {
                println!("    {}", hex(&frame.data).dimmed());
            }
        }
    }

    let trailing = capture.len() % FRAME_BYTES;
    match format {
        "json" => println!(
            "{}",
            serde_json::json!({
                "frames": check.frames,
                "gaps": check.gaps,
                "missing": check.missing,
                "bad_frames": bad_frames,
                "trailing_bytes": trailing,
            })
        ),
        _ => {
            let summary = format!(
                "{} frames, {} gaps ({} missing), {} bad, {} trailing bytes",
                check.frames, check.gaps, check.missing, bad_frames, trailing
            );
            if check.gaps == 0 && bad_frames == 0 {
                println!("{}", summary.bright_green());
            } else {
                println!("{}", summary.yellow());
            }
        }
    }
    Ok(())
}

fn print_layout(format: &str) -> Result<(), Box<dyn std::error::Error>> {
    if format == "json" {
        println!("{}", serde_json::to_string_pretty(&layout::FIELDS)?);
        return Ok(());
    }
    println!(
        "{}",
        format!("Housekeeping record: {} bytes, header {:02X} 00 FF", HK_RECORD_BYTES, HK_HEAD)
            .bright_blue()
            .bold()
    );
    for field in layout::FIELDS {
        println!("{:>4} {:>2}  {}", field.offset, field.len, field.name.bright_white());
    }
    Ok(())
}

fn handle_config(matches: &ArgMatches<'_>) -> Result<(), Box<dyn std::error::Error>> {
    match matches.value_of("file") {
        Some(path) => match ControllerConfig::from_json(&fs::read_to_string(path)?) {
            Ok(_) => println!("{} {}", "✓".green(), "configuration valid".bright_green()),
            Err(e) => {
                println!("{} {}", "✗".red(), e.to_string().bright_red());
                std::process::exit(1);
            }
        },
        None => println!("{}", ControllerConfig::default().to_json()?),
    }
    Ok(())
}
