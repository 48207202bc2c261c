use std::fs;
use std::path::{Path, PathBuf};
use std::process::exit;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use log::info;
use tokio::runtime::Runtime;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use biolink::logging::init_rust_logging_with;
use biolink::{
    flush_channel, DecodeWorker, DecodedOutput, DeviceProfile, DriverError, FirmwareImage,
    FlushQueue, ReplayTransport, SerialAcquisition, SessionConfig, SessionStats,
};

#[derive(Parser, Debug)]
#[command(name = "biolink", about = "Stream, replay and update a biosensing headband")]
struct Args {
    /// Log level (overrides BIOLINK_LOG / RUST_LOG)
    #[arg(long, global = true)]
    log_level: Option<String>,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Acquire from a serial port (e.g. /dev/rfcomm0) for a fixed duration
    Stream {
        port: String,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Run a captured serial byte dump through the full pipeline
    Replay {
        file: PathBuf,
        /// Bytes served per read
        #[arg(long, default_value_t = 512)]
        chunk: usize,
        #[command(flatten)]
        session: SessionArgs,
    },
    /// Patch a firmware image's length and CRC fields and list its blocks
    Oad {
        image: PathBuf,
        /// Where to write the patched image
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Subscribe to BLE notifications for a fixed duration
    #[cfg(feature = "bluez")]
    Notify {
        mac: String,
        #[arg(long)]
        service: String,
        #[arg(long)]
        data: String,
        #[arg(long)]
        command: Option<String>,
        #[arg(long, default_value_t = 10)]
        seconds: u64,
        #[command(flatten)]
        session: SessionArgs,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ProfileArg {
    Ble,
    Spp,
}

#[derive(clap::Args, Debug)]
struct SessionArgs {
    #[arg(long, value_enum, default_value = "spp")]
    profile: ProfileArg,
    #[arg(long)]
    samples_per_packet: Option<usize>,
    #[arg(long, default_value_t = 250)]
    samples_per_flush: usize,
    #[arg(long)]
    gain: Option<f32>,
}

impl SessionArgs {
    fn config(&self) -> Result<SessionConfig> {
        let profile = match self.profile {
            ProfileArg::Ble => DeviceProfile::Ble2Channel,
            ProfileArg::Spp => DeviceProfile::Spp9Channel,
        };
        let mut config =
            SessionConfig::for_profile(profile).with_samples_per_flush(self.samples_per_flush);
        if let Some(n) = self.samples_per_packet {
            config = config.with_samples_per_packet(n);
        }
        if let Some(g) = self.gain {
            config = config.with_gain(g);
        }
        config.validate().context("invalid session settings")?;
        Ok(config)
    }
}

fn main() {
    let args = Args::parse();
    init_rust_logging_with(args.log_level.as_deref());
    if let Err(e) = run(args) {
        eprintln!("Error: {e:#}");
        exit(1);
    }
}

fn run(args: Args) -> Result<()> {
    match args.command {
        Command::Stream {
            port,
            seconds,
            session,
        } => stream(&port, seconds, session.config()?),
        Command::Replay {
            file,
            chunk,
            session,
        } => replay(&file, chunk, session.config()?),
        Command::Oad { image, output } => oad(&image, output.as_deref()),
        #[cfg(feature = "bluez")]
        Command::Notify {
            mac,
            service,
            data,
            command,
            seconds,
            session,
        } => notify(&mac, &service, &data, command.as_deref(), seconds, session.config()?),
    }
}

/// Decode worker plus a consumer printing one line per block.
struct Decoding {
    rt: Runtime,
    worker: JoinHandle<()>,
    printer: JoinHandle<u64>,
}

impl Decoding {
    fn start(config: &SessionConfig) -> Result<(Self, FlushQueue)> {
        let rt = Runtime::new().context("failed to start tokio runtime")?;
        let (queue, rx) = flush_channel(config.queue_depth);
        let (out_tx, out_rx) = mpsc::channel(config.queue_depth);
        let worker = DecodeWorker::new(config).spawn(rt.handle(), rx, out_tx);
        let printer = rt.spawn(print_blocks(out_rx));
        Ok((Self { rt, worker, printer }, queue))
    }

    /// Wait for queued flushes to drain; the queue must already be dropped.
    fn finish(self) -> Result<u64> {
        self.rt.block_on(self.worker).context("decode worker panicked")?;
        self.rt.block_on(self.printer).context("printer task panicked")
    }
}

async fn print_blocks(mut rx: mpsc::Receiver<DecodedOutput>) -> u64 {
    let mut blocks = 0;
    while let Some(output) = rx.recv().await {
        let block = &output.block;
        let means: Vec<String> = block
            .channels
            .iter()
            .map(|row| {
                let valid: Vec<f32> = row.iter().copied().filter(|v| !v.is_nan()).collect();
                if valid.is_empty() {
                    "nan".to_string()
                } else {
                    format!("{:.3e}", valid.iter().sum::<f32>() / valid.len() as f32)
                }
            })
            .collect();
        println!(
            "[Block {}] ordinal={} samples={} interpolated={} mean={:?}",
            block.sequence,
            block.first_ordinal,
            block.sample_count(),
            block.interpolated_slots,
            means
        );
        blocks += 1;
    }
    blocks
}

fn print_stats(stats: &SessionStats, overruns: u64) {
    println!(
        "frames={} flushes={} lost_slots={} anomalies={} desyncs={} rejected={} overruns={}",
        stats.frames,
        stats.flushes,
        stats.lost_slots,
        stats.anomalies,
        stats.desyncs,
        stats.rejected_frames,
        overruns
    );
}

fn stream(port: &str, seconds: u64, config: SessionConfig) -> Result<()> {
    let (decoding, queue) = Decoding::start(&config)?;
    let mut acq = SerialAcquisition::connect_serial(port, config, queue)
        .with_context(|| format!("failed to open serial port at {port}"))?;

    acq.start()?;
    acq.poll_battery()?;
    let stats = acq.run_until(Instant::now() + Duration::from_secs(seconds))?;
    if let Some(level) = acq.battery() {
        println!("Battery: {level:?}");
    }
    let overruns = acq.queue().overruns();
    drop(acq);

    let blocks = decoding.finish()?;
    print_stats(&stats, overruns);
    info!("stream finished: blocks={}", blocks);
    Ok(())
}

fn replay(file: &Path, chunk: usize, config: SessionConfig) -> Result<()> {
    let bytes = fs::read(file).with_context(|| format!("failed to read {}", file.display()))?;
    let (decoding, queue) = Decoding::start(&config)?;
    let transport = ReplayTransport::new(bytes).with_chunk(chunk);
    let mut acq = SerialAcquisition::from_transport(transport, config, queue)?
        .with_command_delay(Duration::ZERO);

    acq.start()?;
    loop {
        match acq.pump() {
            Ok(_) => {}
            Err(DriverError::Disconnected(_)) => break,
            Err(e) => return Err(e.into()),
        }
    }
    let stats = acq.stats();
    let overruns = acq.queue().overruns();
    drop(acq);

    let blocks = decoding.finish()?;
    print_stats(&stats, overruns);
    info!("replay finished: file={}, blocks={}", file.display(), blocks);
    Ok(())
}

fn oad(path: &Path, output: Option<&Path>) -> Result<()> {
    let mut image = FirmwareImage::load(path)
        .with_context(|| format!("failed to load firmware image {}", path.display()))?;
    let crc = image.prepare()?;
    println!(
        "Image: len={} crc32={:#010X} version={} blocks={}",
        image.declared_length(),
        crc,
        image.version_string(),
        image.block_count()
    );
    if let Some(out) = output {
        fs::write(out, image.bytes())
            .with_context(|| format!("failed to write {}", out.display()))?;
        println!("Wrote patched image to {}", out.display());
    }
    Ok(())
}

#[cfg(feature = "bluez")]
fn notify(
    mac: &str,
    service: &str,
    data: &str,
    command: Option<&str>,
    seconds: u64,
    config: SessionConfig,
) -> Result<()> {
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;

    use biolink::ble::{parse_uuid, NotificationLink, NotificationLinkConfig};
    use biolink::AcquisitionSession;

    let mut link_config = NotificationLinkConfig::new(mac, parse_uuid(service)?, parse_uuid(data)?);
    if let Some(command) = command {
        link_config = link_config.with_command_uuid(parse_uuid(command)?);
    }
    let link = NotificationLink::new(link_config)?;

    let (decoding, mut queue) = Decoding::start(&config)?;
    let mut session = AcquisitionSession::new(config)?;
    let stop = Arc::new(AtomicBool::new(false));
    let timer = {
        let stop = Arc::clone(&stop);
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_secs(seconds));
            stop.store(true, Ordering::Relaxed);
        })
    };

    let stats = link.stream(&mut session, &mut queue, &stop)?;
    let _ = timer.join();
    let overruns = queue.overruns();
    drop(queue);

    decoding.finish()?;
    print_stats(&stats, overruns);
    Ok(())
}
