// src/main.rs
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::thread;
use std::time::{Duration, Instant};

use adc_streamer::config::StreamerConfig;
use adc_streamer::device::{
    suggest_sweeps_per_block, AcquisitionSettings, BlockCapturer, DeviceRunner, GroundMode,
    Session, SimulatedAdc,
};
use adc_streamer::host::{
    loopback, open_serial, spawn_ingest, ArchiveMetadata, ArchiveReader, IngestPipeline,
    IngestSnapshot, JsonlArchive, SharedSweepBuffer, SweepViewer, TimestampReconstructor,
};
use adc_streamer::protocol::FrameCodec;
use adc_streamer::types::{DeviceCommand, HostCommand, RunMode, StreamMessage};
use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};

#[derive(Parser)]
#[command(name = "adc-streamer", version, about = "Stream multi-channel ADC blocks into a sweep ring")]
struct Cli {
    /// JSON config file; missing keys keep their defaults
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[arg(short, long, global = true, help = "Show debug logs")]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Drive a simulated device over an in-process wire and ingest its frames
    Simulate {
        /// Run length on the device clock
        #[arg(long, default_value_t = 500)]
        duration_ms: u64,
        /// Start the device clock here, e.g. 4294967000 to cross the wrap
        #[arg(long)]
        clock_start: Option<u32>,
        /// Largest fragment the wire delivers in one read
        #[arg(long, default_value_t = 61)]
        max_fragment: usize,
        #[arg(long, default_value_t = 1)]
        seed: u64,
        #[arg(long)]
        no_archive: bool,
    },
    /// Ingest frames from a serial port
    Listen {
        port: String,
        /// Stop after this many seconds (default: until the port closes)
        #[arg(long)]
        seconds: Option<u64>,
        #[arg(long)]
        no_archive: bool,
    },
    /// Print the sweeps stored in an archive file
    Replay {
        path: PathBuf,
        #[arg(long)]
        limit: Option<usize>,
    },
    /// Rank sweeps-per-block sizes for the configured channels and baud rate
    Suggest {
        #[arg(long, default_value_t = 50)]
        latency_ms: u64,
        #[arg(long, default_value_t = 5)]
        count: usize,
    },
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::init();
    }

    let config = StreamerConfig::load_or_default(cli.config.as_deref())
        .context("failed to load config")?;
    config.validate().context("invalid config")?;

    match cli.command {
        Command::Simulate {
            duration_ms,
            clock_start,
            max_fragment,
            seed,
            no_archive,
        } => simulate(&config, duration_ms, clock_start, max_fragment, seed, no_archive),
        Command::Listen {
            port,
            seconds,
            no_archive,
        } => listen(&config, &port, seconds, no_archive),
        Command::Replay { path, limit } => replay(&path, limit),
        Command::Suggest { latency_ms, count } => {
            suggest(&config, Duration::from_millis(latency_ms), count);
            Ok(())
        }
    }
}

fn open_archive(config: &StreamerConfig, disabled: bool) -> Result<Option<JsonlArchive>> {
    if disabled {
        return Ok(None);
    }
    let metadata = ArchiveMetadata::new(
        config.channels.clone(),
        config.repeat,
        config.samples_per_sweep(),
    )
    .with_layout(config.frame_layout);
    let archive = JsonlArchive::create_in(&config.archive_dir, &metadata)
        .with_context(|| format!("cannot create archive in {}", config.archive_dir.display()))?
        .with_flush_every(config.archive_flush_every);
    println!("💾 Archive: {}", archive.path().display());
    Ok(Some(archive))
}

fn simulate(
    config: &StreamerConfig,
    duration_ms: u64,
    clock_start: Option<u32>,
    max_fragment: usize,
    seed: u64,
    no_archive: bool,
) -> Result<()> {
    let session = Session::new(AcquisitionSettings::from(config));
    let applied = session.validate().context("acquisition settings rejected")?;
    let sps = applied.plan.samples_per_sweep();
    println!(
        "Plan: {} scan entries/sweep, {} samples/sweep, {} sweeps/block",
        applied.plan.scan_entries_per_sweep(),
        sps,
        applied.sweeps_per_block
    );

    let (writer, reader) = loopback(config.read_timeout());
    let writer = writer.with_fragmentation(max_fragment, seed);
    let mut hw = SimulatedAdc::new().with_seed(seed);
    if let Some(start) = clock_start {
        hw = hw.with_clock_start(start);
    }

    // 设备线程
    let (tx_dev, rx_dev) = mpsc::channel::<DeviceCommand>();
    let layout = config.frame_layout;
    let device = thread::spawn(move || {
        let mut runner = DeviceRunner::new(session, BlockCapturer::new(hw), layout, writer);
        runner.run_loop(&rx_dev)
    });

    // 接收线程
    let buffer = SharedSweepBuffer::new(config.ring_capacity, sps);
    let pipeline = IngestPipeline::new(
        FrameCodec::new(layout),
        buffer.clone(),
        open_archive(config, no_archive)?,
    );
    let stats = pipeline.stats();
    let (tx_msg, rx_msg) = mpsc::channel();
    let (tx_cmd, rx_cmd) = mpsc::channel();
    tx_cmd.send(HostCommand::StartCapture).ok();
    let ingest = spawn_ingest(reader, pipeline, tx_msg, rx_cmd);

    let mut viewer = SweepViewer::new(buffer);
    viewer.start_capture();
    tx_dev
        .send(DeviceCommand::Run(RunMode::Timed(Duration::from_millis(duration_ms))))
        .context("device thread is gone")?;

    let mut tx_dev = Some(tx_dev);
    for msg in rx_msg.iter() {
        match msg {
            StreamMessage::DeviceStatus(line) => {
                info!("{line}");
                if line.starts_with("# DONE") || line.starts_with("# ERROR") {
                    // 关闭命令通道, 设备线程随之退出
                    tx_dev.take();
                }
            }
            StreamMessage::Resync { skipped } => warn!("resync, {skipped} bytes skipped"),
            StreamMessage::Error(e) => error!("{e}"),
            StreamMessage::Stopped => break,
            _ => {}
        }
    }
    viewer.stop_capture();
    tx_cmd.send(HostCommand::StopCapture).ok();

    let device_stats = device
        .join()
        .map_err(|_| anyhow::anyhow!("device thread panicked"))?
        .context("device loop failed")?;
    let pipeline = ingest
        .join()
        .map_err(|_| anyhow::anyhow!("ingest thread panicked"))?;
    println!(
        "Device: {} blocks, {} samples sent, {} scan reads",
        device_stats.blocks_sent, device_stats.samples_sent, device_stats.scan_reads
    );
    print_summary(&viewer, &stats.snapshot(), pipeline.reconstructor(), config.window_size)?;
    pipeline.finish();
    Ok(())
}

fn listen(
    config: &StreamerConfig,
    port_name: &str,
    seconds: Option<u64>,
    no_archive: bool,
) -> Result<()> {
    let port = open_serial(port_name, config).with_context(|| format!("cannot open {port_name}"))?;
    let sps = config.samples_per_sweep();
    let buffer = SharedSweepBuffer::new(config.ring_capacity, sps);
    let pipeline = IngestPipeline::new(
        FrameCodec::new(config.frame_layout),
        buffer.clone(),
        open_archive(config, no_archive)?,
    );
    let stats = pipeline.stats();
    let (tx_msg, rx_msg) = mpsc::channel();
    let (tx_cmd, rx_cmd) = mpsc::channel();
    tx_cmd.send(HostCommand::StartCapture).ok();
    let ingest = spawn_ingest(port, pipeline, tx_msg, rx_cmd);
    let mut viewer = SweepViewer::new(buffer);
    viewer.start_capture();
    println!("Listening on {port_name}, {sps} samples/sweep");

    let mut deadline = seconds.map(|s| Instant::now() + Duration::from_secs(s));
    loop {
        if deadline.is_some_and(|d| Instant::now() >= d) {
            tx_cmd.send(HostCommand::StopCapture).ok();
            tx_cmd.send(HostCommand::Shutdown).ok();
            deadline = None;
        }
        match rx_msg.recv_timeout(Duration::from_millis(200)) {
            Ok(StreamMessage::DeviceStatus(line)) => println!("{line}"),
            Ok(StreamMessage::Resync { skipped }) => warn!("resync, {skipped} bytes skipped"),
            Ok(StreamMessage::Error(e)) => error!("{e}"),
            Ok(StreamMessage::Stopped) => break,
            Ok(_) => {}
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    viewer.stop_capture();
    let pipeline = ingest
        .join()
        .map_err(|_| anyhow::anyhow!("ingest thread panicked"))?;
    print_summary(&viewer, &stats.snapshot(), pipeline.reconstructor(), config.window_size)?;
    pipeline.finish();
    Ok(())
}

fn replay(path: &Path, limit: Option<usize>) -> Result<()> {
    let mut reader =
        ArchiveReader::open(path).with_context(|| format!("cannot open {}", path.display()))?;
    let meta = reader.metadata().clone();
    println!(
        "Archive: channels {:?} x{} ({} samples/sweep, {:?} frames)",
        meta.channels, meta.repeat, meta.samples_per_sweep, meta.layout
    );
    let mut origin = None;
    let mut shown = 0;
    for record in reader.by_ref() {
        let record = record?;
        let first = *origin.get_or_insert(record.timestamp);
        if limit.is_some_and(|l| shown >= l) {
            continue;
        }
        let rel = record
            .timestamp
            .seconds_since(&first)
            .map(|s| format!("{s:.6}"))
            .unwrap_or_else(|| "-".to_owned());
        println!(
            "{:>8} {:>12} {:?} {:?}",
            record.index, rel, record.timestamp.source, record.samples
        );
        shown += 1;
    }
    if reader.skipped() > 0 {
        warn!("{} malformed lines skipped", reader.skipped());
    }
    Ok(())
}

fn suggest(config: &StreamerConfig, latency: Duration, count: usize) {
    let sps = config.samples_per_sweep();
    let ground = GroundMode::from(config.ground_pin);
    println!(
        "{} channels x{} (ground {:?}), {} baud, target {:?}",
        config.channels.len(),
        config.repeat,
        ground,
        config.baud_rate,
        latency
    );
    for c in suggest_sweeps_per_block(sps, config.frame_layout, config.baud_rate, latency, count) {
        println!(
            "{:>6} sweeps  {:>6} samples  {:>6} bytes  {:>8.2?}  usb {:>5.1}%  latency {:>5.1}%",
            c.sweeps,
            c.total_samples,
            c.block_bytes,
            c.transmit_time,
            c.usb_efficiency * 100.0,
            c.latency_ratio * 100.0
        );
    }
}

fn print_summary(
    viewer: &SweepViewer,
    stats: &IngestSnapshot,
    timing: &TimestampReconstructor,
    window: usize,
) -> Result<()> {
    println!(
        "Host: {} sweeps ingested, {} bytes, {} resyncs ({} bytes skipped), {} dropped frames",
        stats.sweeps_ingested,
        stats.bytes_received,
        stats.resyncs,
        stats.bytes_skipped,
        stats.frames_dropped
    );
    if let Some(rate) = timing.effective_sample_rate_hz() {
        println!("Effective sample rate: {rate:.1} Hz");
    }
    let snapshot = viewer.read(window)?;
    if snapshot.is_empty() {
        println!("No sweeps captured");
        return Ok(());
    }
    let last = snapshot.len() - 1;
    println!(
        "Window: {} sweeps x {} samples, indices {}..={}, last sweep at {:.6}s ({:?})",
        snapshot.len(),
        snapshot.samples_per_sweep(),
        snapshot.indices[0],
        snapshot.indices[last],
        timing
            .relative_seconds(&snapshot.timestamps[last])
            .unwrap_or_default(),
        snapshot.timestamps[last].source
    );
    println!("Last sweep: {:?}", snapshot.sweep(last).to_vec());
    Ok(())
}
