//! Offline soak simulator.
//!
//! Drives one session through a mock device clock with a chosen producer
//! pattern and reports latency percentiles plus the final flow counters.
//! No audio hardware is touched.

use std::{path::PathBuf, sync::Arc};

use anyhow::{bail, Context};
use playout_core::{
    audio::device::list_output_devices,
    codec::{ByteOrder, PayloadFormat, SampleEncoding},
    FlowEvent, ManualClock, MockBackend, PlayoutConfig, SessionConfig, SessionRegistry,
    StreamStats,
};
use serde::Serialize;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
enum Scenario {
    /// One burst in per burst out.
    Steady,
    /// Four bursts every fourth tick.
    Bursty,
    /// Steady with a seven second producer stall in the middle.
    Stall,
    /// Three bursts in per burst out.
    Flood,
}

impl Scenario {
    fn parse(raw: &str) -> anyhow::Result<Self> {
        Ok(match raw {
            "steady" => Self::Steady,
            "bursty" => Self::Bursty,
            "stall" => Self::Stall,
            "flood" => Self::Flood,
            other => bail!("unknown scenario: {other}"),
        })
    }

    fn frames_for_tick(self, tick: u64, now_ms: u64, total_ms: u64, burst: usize) -> usize {
        match self {
            Self::Steady => burst,
            Self::Bursty => {
                if tick % 4 == 0 {
                    burst * 4
                } else {
                    0
                }
            }
            Self::Stall => {
                let stall_start = total_ms / 2;
                if (stall_start..stall_start + 7_000).contains(&now_ms) {
                    0
                } else {
                    burst
                }
            }
            Self::Flood => burst * 3,
        }
    }
}

#[derive(Debug)]
struct Args {
    scenario: Scenario,
    seconds: u64,
    burst: usize,
    config: Option<PathBuf>,
    wav: Option<PathBuf>,
    output: Option<PathBuf>,
    list_devices: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Report {
    scenario: Scenario,
    payload: PayloadFormat,
    seconds: u64,
    ticks: u64,
    frames_submitted: u64,
    frames_accepted: u64,
    p50_latency_ms: f32,
    p95_latency_ms: f32,
    max_latency_ms: f32,
    flow_events: usize,
    final_stats: StreamStats,
}

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        scenario: Scenario::Steady,
        seconds: 30,
        burst: 192,
        config: None,
        wav: None,
        output: None,
        list_devices: false,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = || it.next().with_context(|| format!("missing value for {arg}"));
        match arg.as_str() {
            "--scenario" => args.scenario = Scenario::parse(&value()?)?,
            "--seconds" => {
                args.seconds = value()?
                    .parse::<u64>()
                    .context("invalid value for --seconds")?
                    .clamp(1, 3_600);
            }
            "--burst" => {
                args.burst = value()?
                    .parse::<usize>()
                    .context("invalid value for --burst")?
                    .clamp(16, 8_192);
            }
            "--config" => args.config = Some(PathBuf::from(value()?)),
            "--wav" => args.wav = Some(PathBuf::from(value()?)),
            "--output" => args.output = Some(PathBuf::from(value()?)),
            "--list-devices" => args.list_devices = true,
            "--help" | "-h" => {
                println!(
                    "Usage: cargo run -p playout-core --bin soak -- \\
  [--scenario steady|bursty|stall|flood] [--seconds <n>] [--burst <frames>] \\
  [--config <file.json>] [--wav <out.wav>] [--output <report.json>] [--list-devices]"
                );
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

fn percentile(values: &[f32], p: f32) -> f32 {
    if values.is_empty() {
        return 0.0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_by(|a, b| a.total_cmp(b));
    let idx = ((sorted.len() - 1) as f32 * p.clamp(0.0, 1.0)).round() as usize;
    sorted[idx.min(sorted.len() - 1)]
}

/// 440 Hz tone at -12 dBFS, continuous across calls.
fn tone(phase: &mut f32, frames: usize, channels: usize, sample_rate: u32) -> Vec<f32> {
    let step = 440.0 * std::f32::consts::TAU / sample_rate as f32;
    let mut out = Vec::with_capacity(frames * channels);
    for _ in 0..frames {
        let sample = phase.sin() * 0.25;
        out.extend(std::iter::repeat(sample).take(channels));
        *phase = (*phase + step) % std::f32::consts::TAU;
    }
    out
}

/// Serialise samples the way a network peer would send them.
fn encode(samples: &[f32], format: PayloadFormat) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(samples.len() * 4);
    for sample in samples {
        match (format.encoding, format.byte_order) {
            (SampleEncoding::Float32, ByteOrder::Little) => {
                bytes.extend_from_slice(&sample.to_le_bytes());
            }
            (SampleEncoding::Float32, ByteOrder::Big) => {
                bytes.extend_from_slice(&sample.to_be_bytes());
            }
            (SampleEncoding::Pcm16, order) => {
                let value = (sample.clamp(-1.0, 1.0) * 32767.0) as i16;
                bytes.extend_from_slice(&match order {
                    ByteOrder::Little => value.to_le_bytes(),
                    ByteOrder::Big => value.to_be_bytes(),
                });
            }
        }
    }
    bytes
}

fn print_devices() {
    let devices = list_output_devices();
    if devices.is_empty() {
        println!("No output devices found.");
    }
    for device in devices {
        let mut tags = Vec::new();
        if device.is_default {
            tags.push("default");
        }
        if device.is_virtual {
            tags.push("virtual");
        }
        if tags.is_empty() {
            println!("{}", device.name);
        } else {
            println!("{} ({})", device.name, tags.join(", "));
        }
    }
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;
    if args.list_devices {
        print_devices();
        return Ok(());
    }
    let base = match &args.config {
        Some(path) => PlayoutConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => PlayoutConfig::default(),
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&base.log_filter)),
        )
        .init();

    let session_config = SessionConfig {
        realtime_priority: false,
        ..base.session
    };
    let sample_rate = session_config.sample_rate;
    let channels = session_config.channels;

    let clock = Arc::new(ManualClock::new(0));
    let backend = Arc::new(MockBackend::new(args.burst));
    let payload = base.payload;
    let registry = SessionRegistry::new(backend.clone(), payload.factory(), clock.clone());
    let id = registry.open(session_config)?;
    let session = registry.get(id)?;
    let events = session.engine().flow().subscribe();
    let device = backend
        .last_stream()
        .context("mock backend did not record the stream")?;
    registry.start(id)?;

    let mut wav = match &args.wav {
        Some(path) => Some(
            hound::WavWriter::create(
                path,
                hound::WavSpec {
                    channels: u16::try_from(channels).context("too many channels for WAV")?,
                    sample_rate,
                    bits_per_sample: 32,
                    sample_format: hound::SampleFormat::Float,
                },
            )
            .with_context(|| format!("creating {}", path.display()))?,
        ),
        None => None,
    };

    let total_ms = args.seconds * 1_000;
    let total_frames = args.seconds * u64::from(sample_rate);
    let mut rendered_frames = 0u64;
    let mut ticks = 0u64;
    let mut phase = 0.0f32;
    let mut latencies = Vec::new();
    let mut frames_submitted = 0u64;
    let mut frames_accepted = 0u64;
    let mut flow_events = 0usize;

    info!(scenario = ?args.scenario, seconds = args.seconds, burst = args.burst, "soak started");

    while rendered_frames < total_frames {
        let now_ms = rendered_frames * 1_000 / u64::from(sample_rate);
        clock.set_ms(now_ms);

        let frames = args.scenario.frames_for_tick(ticks, now_ms, total_ms, args.burst);
        if frames > 0 {
            let samples = tone(&mut phase, frames, channels, sample_rate);
            frames_submitted += frames as u64;
            frames_accepted += registry.submit_packet(id, &encode(&samples, payload))? as u64;
        }

        let Some(out) = device.tick() else {
            bail!("mock stream stopped rendering");
        };
        if let Some(writer) = wav.as_mut() {
            for sample in &out {
                writer.write_sample(*sample)?;
            }
        }

        latencies.push(registry.stats(id)?.latency_ms);
        flow_events += events
            .try_iter()
            .filter(|e| !matches!(e, FlowEvent::PreventiveDrop { .. }))
            .count();
        rendered_frames += args.burst as u64;
        ticks += 1;
    }

    if let Some(writer) = wav {
        writer.finalize()?;
    }

    let report = Report {
        scenario: args.scenario,
        payload,
        seconds: args.seconds,
        ticks,
        frames_submitted,
        frames_accepted,
        p50_latency_ms: percentile(&latencies, 0.50),
        p95_latency_ms: percentile(&latencies, 0.95),
        max_latency_ms: latencies.iter().copied().fold(0.0, f32::max),
        flow_events,
        final_stats: registry.stats(id)?,
    };
    registry.close_all()?;

    println!(
        "Done. ticks={} p50={:.2}ms p95={:.2}ms underruns={} drops={} resets={}",
        report.ticks,
        report.p50_latency_ms,
        report.p95_latency_ms,
        report.final_stats.underruns,
        report.final_stats.drops,
        report.final_stats.resets
    );

    let json = serde_json::to_string_pretty(&report)?;
    if let Some(out) = args.output {
        if let Some(parent) = out.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&out, json)?;
        println!("Wrote soak report: {}", out.display());
    } else {
        println!("{json}");
    }

    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("soak failed: {e:#}");
        std::process::exit(1);
    }
}
