use std::path::PathBuf;
use std::process::exit;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::LevelFilter;
use serde::Serialize;
use serde_json::json;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;

use polar_pmd::{
    decode_control_point_response, decode_frame, encode_get_settings, encode_start, encode_stop,
    init_rust_logging, parse_heart_rate_measurement, spawn_sensor, ActiveSettings,
    ControlTransport, MeasurementType, NegotiatorConfig, PmdError, SampleBatch, Samples,
    SensorHandle, SensorUpdate, SettingType, TransportRequest,
};

#[derive(Parser, Debug)]
#[command(name = "polar-pmd", about = "Encode, decode and replay Polar PMD traffic")]
struct Args {
    /// Log level (off, error, warn, info, debug, trace). Defaults to POLAR_PMD_LOG / RUST_LOG.
    #[arg(long, global = true)]
    log_level: Option<LevelFilter>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print a control point request as hex.
    #[command(subcommand)]
    Encode(EncodeCommand),
    /// Decode a control point notification.
    DecodeControl { hex: String },
    /// Decode a data notification.
    DecodeFrame {
        hex: String,
        /// Negotiated setting, e.g. `resolution=14`. Repeatable.
        #[arg(long = "setting", value_parser = parse_setting)]
        settings: Vec<(SettingType, u16)>,
    },
    /// Decode a Heart Rate Measurement notification.
    DecodeHr { hex: String },
    /// Drive one sensor task from a capture file and print everything it does as JSON lines.
    ///
    /// Lines: `ready`, `cp <hex>`, `data <hex>`, `start <type> [setting=value ...]`,
    /// `stop <type>`, `wait <ms>`, `disconnect`. `#` starts a comment.
    Replay {
        file: PathBuf,
        /// Acknowledgement timeout in milliseconds.
        #[arg(long)]
        ack_timeout_ms: Option<u64>,
        /// Re-sends of an unacknowledged request.
        #[arg(long, default_value_t = 0)]
        max_retries: u32,
    },
}

#[derive(Subcommand, Debug)]
enum EncodeCommand {
    GetSettings {
        measurement: MeasurementType,
    },
    Start {
        measurement: MeasurementType,
        /// `setting=value`, e.g. `samplerate=130 resolution=14`.
        #[arg(value_parser = parse_setting)]
        settings: Vec<(SettingType, u16)>,
    },
    Stop {
        measurement: MeasurementType,
    },
}

fn main() {
    if let Err(e) = run() {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run() -> Result<()> {
    let args = Args::parse();
    init_rust_logging(args.log_level);

    match args.command {
        Command::Encode(encode) => {
            let bytes = match encode {
                EncodeCommand::GetSettings { measurement } => encode_get_settings(measurement),
                EncodeCommand::Start {
                    measurement,
                    settings,
                } => encode_start(measurement, &settings),
                EncodeCommand::Stop { measurement } => encode_stop(measurement),
            };
            println!("{}", hex::encode(bytes));
        }
        Command::DecodeControl { hex } => {
            let response = decode_control_point_response(&parse_hex(&hex)?)?;
            println!("{}", serde_json::to_string(&response)?);
        }
        Command::DecodeFrame { hex, settings } => {
            let active = ActiveSettings::resolve(&settings)?;
            let frame = decode_frame(&parse_hex(&hex)?, &active)?;
            println!(
                "{}",
                json!({
                    "measurement": frame.measurement,
                    "timestamp": frame.timestamp,
                    "frameType": frame.frame_type,
                    "samples": frame.samples.to_tuples(),
                    "settings": active,
                })
            );
        }
        Command::DecodeHr { hex } => {
            let hr = parse_heart_rate_measurement(&parse_hex(&hex)?)?;
            println!("{}", serde_json::to_string(&hr)?);
        }
        Command::Replay {
            file,
            ack_timeout_ms,
            max_retries,
        } => {
            let script = std::fs::read_to_string(&file)
                .with_context(|| format!("Failed to read {}", file.display()))?;
            let lines = parse_script(&script)?;
            let config = NegotiatorConfig {
                ack_timeout: ack_timeout_ms.map(Duration::from_millis),
                max_retries,
                ..Default::default()
            };
            let rt = Runtime::new().context("tokio runtime init failed")?;
            rt.block_on(replay(config, lines))?;
        }
    }
    Ok(())
}

/// `name=value` with a physical value, e.g. `samplerate=130`.
fn parse_setting(s: &str) -> std::result::Result<(SettingType, u16), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected setting=value, got '{s}'"))?;
    let setting: SettingType = name.trim().parse()?;
    let value: u16 = value
        .trim()
        .parse()
        .map_err(|e| format!("bad value '{value}': {e}"))?;
    let raw = setting
        .encode(value)
        .ok_or_else(|| format!("{value} is not a documented {setting} value"))?;
    Ok((setting, raw))
}

/// Hex with optional spaces, colons or dashes between bytes.
fn parse_hex(s: &str) -> Result<Vec<u8>> {
    let cleaned: String = s
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':' && *c != '-')
        .collect();
    hex::decode(&cleaned).with_context(|| format!("invalid hex '{s}'"))
}

// ============================================================================
// Replay
// ============================================================================

#[derive(Debug, PartialEq)]
enum ScriptLine {
    Ready,
    ControlPoint(Vec<u8>),
    Data(Vec<u8>),
    Start(MeasurementType, Option<Vec<(SettingType, u16)>>),
    Stop(MeasurementType),
    Wait(Duration),
    Disconnect,
}

fn parse_script(script: &str) -> Result<Vec<ScriptLine>> {
    let mut lines = Vec::new();
    for (number, line) in script.lines().enumerate() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }
        let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
        let rest = rest.trim();
        let parsed = match keyword {
            "ready" => ScriptLine::Ready,
            "cp" => ScriptLine::ControlPoint(parse_hex(rest)?),
            "data" => ScriptLine::Data(parse_hex(rest)?),
            "start" => {
                let mut words = rest.split_whitespace();
                let measurement = parse_measurement(words.next())?;
                let settings = words
                    .map(parse_setting)
                    .collect::<std::result::Result<Vec<_>, _>>()
                    .map_err(anyhow::Error::msg)?;
                ScriptLine::Start(measurement, (!settings.is_empty()).then_some(settings))
            }
            "stop" => ScriptLine::Stop(parse_measurement(rest.split_whitespace().next())?),
            "wait" => ScriptLine::Wait(Duration::from_millis(
                rest.parse().with_context(|| format!("bad wait '{rest}'"))?,
            )),
            "disconnect" => ScriptLine::Disconnect,
            other => bail!("line {}: unknown command '{other}'", number + 1),
        };
        lines.push(parsed);
    }
    Ok(lines)
}

fn parse_measurement(word: Option<&str>) -> Result<MeasurementType> {
    word.context("missing measurement type")?
        .parse()
        .map_err(anyhow::Error::msg)
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
enum Output {
    Request(TransportRequest),
    Update(SensorUpdate),
    Samples(SampleBatch),
    Error(String),
}

/// Hands outgoing requests to the printer instead of a radio.
struct ReplayTransport {
    out: mpsc::UnboundedSender<Output>,
}

impl ControlTransport for ReplayTransport {
    fn send(&mut self, request: TransportRequest) -> futures::future::BoxFuture<'_, polar_pmd::Result<()>> {
        let result = self
            .out
            .send(Output::Request(request))
            .map_err(|_| PmdError::Transport("replay output closed".into()));
        Box::pin(async move { result })
    }
}

async fn replay(config: NegotiatorConfig, lines: Vec<ScriptLine>) -> Result<()> {
    let (out, mut out_rx) = mpsc::unbounded_channel();
    let samples_out = out.clone();
    let sink = move |m: MeasurementType, s: &Samples, a: &ActiveSettings| {
        let _ = samples_out.send(Output::Samples(SampleBatch::new(m, s, a)));
    };
    let (sensor, mut updates) = spawn_sensor(config, ReplayTransport { out: out.clone() }, sink);

    for line in lines {
        match line {
            ScriptLine::Ready => sensor.characteristic_ready()?,
            ScriptLine::ControlPoint(bytes) => sensor.control_point(bytes)?,
            ScriptLine::Data(bytes) => sensor.data(bytes)?,
            ScriptLine::Start(measurement, settings) => {
                if let Err(e) = sensor.start(measurement, settings).await {
                    let _ = out.send(Output::Error(e.to_string()));
                }
            }
            ScriptLine::Stop(measurement) => {
                if let Err(e) = sensor.stop(measurement).await {
                    let _ = out.send(Output::Error(e.to_string()));
                }
            }
            ScriptLine::Wait(duration) => tokio::time::sleep(duration).await,
            ScriptLine::Disconnect => sensor.disconnected()?,
        }
        settle(&sensor).await?;
        while let Ok(update) = updates.try_recv() {
            print_json(&Output::Update(update))?;
        }
        while let Ok(output) = out_rx.try_recv() {
            print_json(&output)?;
        }
    }

    for (measurement, status) in sensor.status().await? {
        log::info!("{measurement}: {status}");
    }
    Ok(())
}

/// Returns once the sensor task has handled every command sent so far.
async fn settle(sensor: &SensorHandle) -> Result<()> {
    sensor.status().await?;
    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string(value)?);
    Ok(())
}
