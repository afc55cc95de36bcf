//! dmacap — capture a DMA-fed device stream to disk
//!
//! Keeps `--concurrency` block reads in flight against the capture device
//! and writes each block out as soon as it arrives, by default through
//! `gzip -9`.
//!
//! Usage:
//!     cargo build --release -p dmacap
//!     ./target/release/dmacap --device /dev/example --output output.bin.gz
//!
//!     # no hardware: modelled driver fed by a pattern generator
//!     ./target/release/dmacap --simulate --rate 64M --blocks 100 --raw -o sim.bin
//!
//! Environment:
//!     DMACAP_LOG=debug          per-block timings
//!     DMACAP_BLOCK_SIZE=1M      defaults for the flags below
//!     DMACAP_CONCURRENCY=10
//!     DMACAP_RING_SIZE=4M

use std::path::PathBuf;
use std::process::ExitCode;
use std::thread;
use std::time::Duration;

use clap::Parser;
use dmacap_core::config::{DeviceConfig, PipelineConfig};
use dmacap_core::env::parse_size;
use dmacap_core::error::{DmacapError, Result};
use dmacap_core::sink::ByteSink;
use dmacap_driver::{Device, SimController};
use dmacap_pipeline::stats::format_rate;
use dmacap_pipeline::{FileSink, FilterSink, Pipeline, RunReport, StopHandle, WorkerQueue};
use tracing::{error, info, warn};

/// Simulated feed rate when `--simulate` is given without `--rate`.
const DEFAULT_SIM_RATE: usize = 64 * 1024 * 1024;

#[derive(Parser, Debug)]
#[command(name = "dmacap", version)]
#[command(about = "Capture a DMA-fed device stream to disk", long_about = None)]
struct Args {
    /// Capture device node
    #[arg(long, default_value = "/dev/example")]
    device: PathBuf,

    /// Output file
    #[arg(short, long, default_value = "output.bin.gz")]
    output: PathBuf,

    /// Bytes per read/write block (K/M/G suffixes)
    #[arg(short, long, value_parser = size_arg)]
    block_size: Option<usize>,

    /// Reads + writes in flight
    #[arg(short, long)]
    concurrency: Option<usize>,

    /// Stop after this many blocks
    #[arg(short = 'n', long)]
    blocks: Option<u64>,

    /// Stop after this many seconds (in-flight blocks are still written)
    #[arg(long)]
    duration: Option<f64>,

    /// Write the raw stream, no filter process
    #[arg(long)]
    raw: bool,

    /// Filter command the stream is piped through
    #[arg(long, default_value = "gzip -9", conflicts_with = "raw")]
    filter: String,

    /// Use the modelled driver with a simulated DMA engine
    #[arg(long)]
    simulate: bool,

    /// Ring size for --simulate (power of two, K/M/G suffixes)
    #[arg(long, value_parser = size_arg, requires = "simulate")]
    ring_size: Option<usize>,

    /// Simulated producer rate in bytes/s (K/M/G suffixes)
    #[arg(long, value_parser = size_arg, requires = "simulate")]
    rate: Option<usize>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,
}

fn size_arg(s: &str) -> std::result::Result<usize, String> {
    parse_size(s).ok_or_else(|| format!("invalid size: {s}"))
}

/// The two sink kinds behind one type, so each backend is built once.
enum OutputSink {
    File(FileSink),
    Filter(FilterSink),
}

impl ByteSink for OutputSink {
    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<usize> {
        match self {
            OutputSink::File(s) => s.write_at(offset, bytes),
            OutputSink::Filter(s) => s.write_at(offset, bytes),
        }
    }

    fn is_stream(&self) -> bool {
        matches!(self, OutputSink::Filter(_))
    }

    fn raw_fd(&self) -> std::os::unix::io::RawFd {
        match self {
            OutputSink::File(s) => s.raw_fd(),
            OutputSink::Filter(s) => s.raw_fd(),
        }
    }

    fn finish(&mut self) -> Result<()> {
        match self {
            OutputSink::File(s) => s.finish(),
            OutputSink::Filter(s) => s.finish(),
        }
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    dmacap_core::log::init_with_default(match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    });

    match run(&args) {
        Ok(report) => {
            print_report(&report);
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!(error = %e, errno = e.errno(), "capture failed");
            ExitCode::FAILURE
        }
    }
}

fn pipeline_config(args: &Args) -> Result<PipelineConfig> {
    let mut config = PipelineConfig::from_env();
    if let Some(b) = args.block_size {
        config = config.block_size(b);
    }
    if let Some(c) = args.concurrency {
        config = config.concurrency(c);
    }
    if let Some(n) = args.blocks {
        config = config.target_blocks(n);
    }
    config.validate()?;
    Ok(config)
}

fn open_sink(args: &Args, block_size: usize) -> Result<OutputSink> {
    if args.raw {
        return Ok(OutputSink::File(FileSink::create(&args.output)?));
    }
    let filter = FilterSink::from_command_line(&args.filter, &args.output, block_size)?;
    Ok(OutputSink::Filter(filter))
}

/// Stop the pipeline after `secs`, from a detached timer thread.
fn arm_timer(stop: &StopHandle, secs: Option<f64>) -> Result<()> {
    let Some(secs) = secs else { return Ok(()) };
    if !secs.is_finite() || secs <= 0.0 {
        return Err(DmacapError::InvalidConfig("duration must be > 0"));
    }
    let stop = stop.clone();
    thread::Builder::new()
        .name("dmacap-timer".into())
        .spawn(move || {
            thread::sleep(Duration::from_secs_f64(secs));
            info!(secs, "duration reached, stopping");
            stop.stop();
        })?;
    Ok(())
}

fn run(args: &Args) -> Result<RunReport> {
    let config = pipeline_config(args)?;
    let sink = open_sink(args, config.block_size)?;
    info!(
        block_size = config.block_size,
        concurrency = config.concurrency,
        blocks = config.target_blocks_count(),
        output = %args.output.display(),
        filter = if args.raw { "none" } else { args.filter.as_str() },
        "capture starting"
    );

    if args.simulate {
        run_simulated(args, config, sink)
    } else {
        run_device(args, config, sink)
    }
}

cfg_if::cfg_if! {
    if #[cfg(target_os = "linux")] {
        fn run_device(args: &Args, config: PipelineConfig, sink: OutputSink) -> Result<RunReport> {
            use dmacap_pipeline::UringQueue;

            let device = std::fs::File::open(&args.device)?;
            let queue = UringQueue::new(device, sink, config.queue_depth)?;
            let mut pipeline = Pipeline::new(queue, config)?;
            arm_timer(&pipeline.stop_handle(), args.duration)?;

            let result = pipeline.run();
            let (_device, mut sink) = pipeline.into_queue().into_parts();
            // Reap the filter even when the run failed.
            let finished = sink.finish();
            let report = result?;
            finished?;
            Ok(report)
        }
    } else {
        fn run_device(_args: &Args, _config: PipelineConfig, _sink: OutputSink) -> Result<RunReport> {
            Err(DmacapError::ResourceUnavailable("device capture needs io_uring (Linux)"))
        }
    }
}

fn run_simulated(args: &Args, config: PipelineConfig, sink: OutputSink) -> Result<RunReport> {
    let mut dev_config = DeviceConfig::from_env();
    if let Some(size) = args.ring_size {
        dev_config = dev_config.ring_size(size);
    }
    let rate = args.rate.unwrap_or(DEFAULT_SIM_RATE) as u64;
    let chunk = (dev_config.period() / 4).max(1);

    let ctrl = SimController::new();
    let device = Device::new(ctrl.clone(), dev_config, None)?;
    let session = device.open()?;
    let closer = session.closer();
    let feeder = ctrl.producer().spawn_feeder(chunk, Some(rate))?;
    info!(
        ring_size = session.ring_size(),
        rate = %format_rate(rate as f64),
        "simulated device feeding"
    );

    let mut queue = WorkerQueue::new(session, sink, config.workers, config.concurrency)?;
    queue.set_interrupt(move || closer.cancel());
    let mut pipeline = Pipeline::new(queue, config)?;
    arm_timer(&pipeline.stop_handle(), args.duration)?;

    let result = pipeline.run();
    let (mut session, mut sink) = pipeline.into_queue().shutdown()?;
    let produced = feeder.stop();
    let stats = session.stats();
    session.close();
    let finished = sink.finish();

    info!(
        produced,
        read = stats.bytes,
        overruns = stats.overruns,
        lost = stats.lost,
        "simulated session done"
    );
    if stats.overruns > 0 {
        warn!(overruns = stats.overruns, "consumer fell behind the producer; lower --rate");
    }

    let report = result?;
    finished?;
    Ok(report)
}

fn print_report(report: &RunReport) {
    let wall = report.throughput.wall_bps;
    info!(
        bytes = report.bytes_written,
        blocks = report.blocks,
        max_outstanding = report.max_outstanding,
        elapsed_ms = report.elapsed.as_millis() as u64,
        estimate = %format_rate(report.throughput.estimate_bps),
        wall = %format_rate(wall),
        mbit = wall * 8.0 / 1e6,
        "capture complete"
    );
}
