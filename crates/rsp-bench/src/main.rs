//! Soak and throughput bench for the sdrplay3 streaming bridge
//!
//! Streams from a simulated RSP device for a while, optionally writes the
//! samples to a file and reports the health counters of each channel.
//!
//! # Usage Examples
//!
//! ## Ten seconds of RSP1A at 2 MHz
//! ```bash
//! rsp-bench --model rsp1a -c 100M -s 2M --duration 10
//! ```
//!
//! ## Dual tuner RSPduo from a JSON configuration, raw samples to a file
//! ```bash
//! rsp-bench --model rspduo --config dual.json --format cs16 --output iq.bin
//! ```
//!
//! ## Stress the sequence tracking
//! ```bash
//! rsp-bench --gap-every 100 --overload-every 500 --no-realtime -vv
//! ```

use std::fs::File;
use std::io::{BufWriter, Write, stdout};
use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use clap::{ArgAction, Parser, ValueEnum};
use num_complex::Complex;
use serde::Serialize;
use tracing::{info, warn};

use sdrplay3::api::HwVersion;
use sdrplay3::api::sim::{SimOptions, SimulatedApi};
use sdrplay3::{
    ControllerOptions, DeviceController, DeviceRegistry, DeviceSelector, Health, Produced,
    RspSource, StreamConfig,
};

#[derive(Debug, Clone, Copy)]
struct Frequency(f64);

impl FromStr for Frequency {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if let Some(stripped) = s.strip_suffix('M') {
            let val: f64 = stripped.trim().parse().map_err(|_| "Invalid MHz value")?;
            Ok(Frequency(val * 1e6))
        } else if let Some(stripped) = s.strip_suffix('k') {
            let val: f64 = stripped.trim().parse().map_err(|_| "Invalid kHz value")?;
            Ok(Frequency(val * 1e3))
        } else {
            let val: f64 = s.parse().map_err(|_| "Invalid Hz value")?;
            Ok(Frequency(val))
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Model {
    Rsp1,
    Rsp1a,
    Rsp1b,
    Rsp2,
    Rspduo,
    Rspdx,
    RspdxR2,
}

impl From<Model> for HwVersion {
    fn from(model: Model) -> Self {
        match model {
            Model::Rsp1 => HwVersion::Rsp1,
            Model::Rsp1a => HwVersion::Rsp1a,
            Model::Rsp1b => HwVersion::Rsp1b,
            Model::Rsp2 => HwVersion::Rsp2,
            Model::Rspduo => HwVersion::RspDuo,
            Model::Rspdx => HwVersion::RspDx,
            Model::RspdxR2 => HwVersion::RspDxR2,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum OutputFormat {
    /// Complex 32-bit float, little endian
    Cf32,
    /// Complex signed 16-bit, little endian
    Cs16,
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Streaming bench for SDRplay RSP devices (simulated)", long_about = None)]
struct Args {
    /// Device index or serial number
    #[arg(short, long, default_value = "0")]
    device: String,

    /// Center frequency in Hz (accepts k/M suffix, e.g. 100M)
    #[arg(short, long, value_parser = Frequency::from_str, default_value = "100M")]
    center_freq: Frequency,

    /// Output sample rate in Hz (accepts k/M suffix)
    #[arg(short, long, value_parser = Frequency::from_str, default_value = "2M")]
    sample_rate: Frequency,

    /// IF gain reduction in dB
    #[arg(long, default_value_t = 40)]
    gr: u32,

    /// LNA state
    #[arg(long, default_value_t = 0)]
    lna: u8,

    /// Stream configuration as JSON, overrides the tuning options
    #[arg(long)]
    config: Option<String>,

    /// Slots in each channel's ring buffer
    #[arg(long, default_value_t = sdrplay3::ring_buffer::DEFAULT_CAPACITY)]
    capacity: usize,

    /// Streaming duration in seconds
    #[arg(long, default_value_t = 5.0)]
    duration: f64,

    /// Samples pulled per work call
    #[arg(long, default_value_t = 16384)]
    chunk_size: usize,

    /// Write the samples of the first channel to this file ("-" for stdout)
    #[arg(short, long)]
    output: Option<String>,

    /// Sample format of the output file
    #[arg(long, default_value = "cf32")]
    format: OutputFormat,

    /// Print the health report as JSON (on stderr when samples go to stdout)
    #[arg(long, default_value_t = false)]
    json: bool,

    /// Verbosity level (-v=info, -vv=debug, -vvv=trace)
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,

    /// Simulated device model
    #[arg(long, default_value = "rsp1a")]
    model: Model,

    /// Serial number of the simulated device
    #[arg(long, default_value = "2305001234")]
    serial: String,

    /// Samples per simulated callback block
    #[arg(long, default_value_t = sdrplay3::api::sim::DEFAULT_BLOCK_SIZE)]
    block_size: usize,

    /// Skip a block of sample numbers every N blocks
    #[arg(long)]
    gap_every: Option<u64>,

    /// Raise a power overload every N blocks
    #[arg(long)]
    overload_every: Option<u64>,

    /// Generate blocks as fast as possible instead of in real time
    #[arg(long, default_value_t = false)]
    no_realtime: bool,

    /// Log every sample sequence gap
    #[arg(long, default_value_t = false)]
    gaps_check: bool,
}

#[derive(Debug, Serialize)]
struct Report {
    serial: String,
    model: HwVersion,
    config: StreamConfig,
    elapsed_s: f64,
    samples: u64,
    samples_per_s: f64,
    channels: Vec<Health>,
}

fn write_samples<W: Write>(out: &mut W, samples: &[Complex<i16>], format: OutputFormat) -> std::io::Result<()> {
    match format {
        OutputFormat::Cs16 => {
            for s in samples {
                out.write_all(&s.re.to_le_bytes())?;
                out.write_all(&s.im.to_le_bytes())?;
            }
        }
        OutputFormat::Cf32 => {
            for s in samples {
                out.write_all(&(f32::from(s.re) / 32768.0).to_le_bytes())?;
                out.write_all(&(f32::from(s.im) / 32768.0).to_le_bytes())?;
            }
        }
    }
    Ok(())
}

impl Args {
    /// The sample stream takes stdout.
    fn samples_to_stdout(&self) -> bool {
        self.output.as_deref() == Some("-")
    }
}

fn main() -> sdrplay3::Result<()> {
    let args = Args::parse();

    // 0 = WARN (quiet), 1 = INFO, 2 = DEBUG, 3+ = TRACE
    let log_level = match args.verbose {
        0 => tracing::Level::WARN,
        1 => tracing::Level::INFO,
        2 => tracing::Level::DEBUG,
        _ => tracing::Level::TRACE,
    };
    let _ = tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_writer(std::io::stderr)
        .try_init();

    let config = match &args.config {
        Some(path) => StreamConfig::from_json_file(path)?,
        None => StreamConfig::new(args.center_freq.0, args.sample_rate.0, args.gr, args.lna),
    };

    let api = Arc::new(SimulatedApi::new(SimOptions {
        block_size: args.block_size,
        realtime: !args.no_realtime,
        gap_every: args.gap_every,
        overload_every: args.overload_every,
        ..SimOptions::default()
    }));
    api.add_device(&args.serial, args.model.into());

    let controller = DeviceController::open(
        api,
        DeviceRegistry::global(),
        &DeviceSelector::parse(&args.device)?,
        config,
        ControllerOptions {
            ring_capacity: args.capacity,
            sample_sequence_gaps_check: args.gaps_check,
            ..ControllerOptions::default()
        },
    )?;
    let serial = controller.serial().unwrap_or_default();
    let model = controller.capabilities()?.model;
    let config = controller.config()?;

    let mut output: Option<Box<dyn Write>> = match args.output.as_deref() {
        None => None,
        Some("-") => Some(Box::new(BufWriter::new(stdout()))),
        Some(path) => Some(Box::new(BufWriter::new(File::create(path)?))),
    };

    let mut source = RspSource::new(controller)?;
    let channels = source.channels();
    let mut buffers = vec![vec![Complex::<i16>::default(); args.chunk_size.max(1)]; channels];
    let duration = Duration::from_secs_f64(args.duration.max(0.0));

    source.start()?;
    let started = Instant::now();
    let mut samples: u64 = 0;
    let mut stopped = false;
    loop {
        if !stopped && started.elapsed() >= duration {
            source.stop()?;
            stopped = true;
        }
        let mut outputs: Vec<&mut [Complex<i16>]> =
            buffers.iter_mut().map(|b| b.as_mut_slice()).collect();
        match source.work(&mut outputs) {
            Produced::Items(0) => std::thread::sleep(Duration::from_millis(1)),
            Produced::Items(n) => {
                samples += n as u64;
                if let Some(out) = output.as_mut() {
                    write_samples(out, &buffers[0][..n], args.format)?;
                }
            }
            Produced::Done => break,
        }
    }
    let elapsed = started.elapsed().as_secs_f64();
    if let Some(out) = output.as_mut() {
        out.flush()?;
    }

    let health = source.health();
    for h in &health {
        if h.dropped_count > 0 {
            warn!("channel {}: {} samples dropped", h.channel, h.dropped_count);
        }
        info!(
            "channel {}: {} blocks, {} discontinuities, {} overloads",
            h.channel, h.blocks, h.discontinuities, h.overloads
        );
    }

    let report = Report {
        serial,
        model,
        config,
        elapsed_s: elapsed,
        samples,
        samples_per_s: samples as f64 / elapsed.max(f64::EPSILON),
        channels: health,
    };
    if args.json {
        let json = serde_json::to_string_pretty(&report)?;
        if args.samples_to_stdout() {
            eprintln!("{}", json);
        } else {
            println!("{}", json);
        }
    } else {
        eprintln!(
            "{} {}: {} samples in {:.2}s ({:.0} samples/s)",
            report.model, report.serial, report.samples, report.elapsed_s, report.samples_per_s
        );
        for h in &report.channels {
            eprintln!(
                "  channel {}: dropped={} blocks={} discontinuities={} missing={} late={} overloads={}",
                h.channel,
                h.dropped_count,
                h.blocks,
                h.discontinuities,
                h.missing_samples,
                h.late_blocks,
                h.overloads
            );
        }
    }
    source.controller().close()
}
