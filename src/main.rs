// src/main.rs
use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use log::{error, info, warn};

use resoscan::analysis::peak::{Analyzer, FixtureAnalyzer, GaussianPeakAnalyzer, PeakReading};
use resoscan::config::{ExperimentConfig, ReaderConfig};
use resoscan::drivers::port::{list_device_serials, SerialOpener};
use resoscan::drivers::source::{ReplayDevice, SweepDevice, SweepPlan, SyntheticDevice};
use resoscan::drivers::sweep::SweepDriver;
use resoscan::engine::{spawn_reader, ReaderHandle, ReaderLoop};
use resoscan::recorder::{read_peak_csv, ScanRecorder};
use resoscan::types::{ConnectionMode, ReaderCommand, ReaderEvent};

#[derive(Parser, Debug)]
#[command(version, about = "Resonance reader acquisition and analysis", long_about = None)]
struct Cli {
    /// Experiment configuration (JSON).
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Use simulated devices instead of serial hardware.
    #[arg(long, default_value_t = false)]
    simulate: bool,

    /// Replay recorded sweep CSVs from this directory (implies --simulate).
    #[arg(long, value_name = "DIR")]
    fixtures: Option<PathBuf>,

    /// Replay recorded peak readings instead of fitting (implies --simulate).
    #[arg(long, value_name = "FILE")]
    peaks: Option<PathBuf>,

    /// Override the configured output directory.
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Print the serial numbers of attached devices and exit.
    #[arg(long, default_value_t = false)]
    list_devices: bool,
}

/// Everything a reader thread needs besides its device and analyzer.
struct Launch<'a> {
    reader: &'a ReaderConfig,
    config: &'a ExperimentConfig,
    events: Sender<ReaderEvent>,
    shutdown: Arc<AtomicBool>,
}

impl Launch<'_> {
    fn start<D, A>(self, mode: ConnectionMode, device: D, analyzer: A) -> Result<ReaderHandle>
    where
        D: SweepDevice + 'static,
        A: Analyzer + 'static,
    {
        let recorder = ScanRecorder::new(self.config.reader_dir(self.reader), &self.reader.name)?;
        let mut reader = ReaderLoop::new(
            self.reader.name.clone(),
            mode,
            device,
            analyzer,
            self.config,
            self.events,
        )
        .with_recorder(recorder);
        reader
            .configure(self.reader)
            .with_context(|| format!("configuring {}", self.reader.name))?;
        spawn_reader(reader, self.shutdown)
            .with_context(|| format!("spawning {}", self.reader.name))
    }
}

fn start_hardware(launch: Launch<'_>) -> Result<ReaderHandle> {
    let reader = launch.reader;
    let opener = SerialOpener::new(
        reader.serial_number.clone(),
        reader.baud_rate,
        Duration::from_millis(reader.timeout_ms),
    );
    let mut driver = SweepDriver::disconnected(opener);
    // Not fatal: the reader keeps retrying and reports an issue if it never connects.
    match driver.perform_handshake() {
        Ok(true) => match driver.firmware_version() {
            Ok(version) => info!("{}: firmware {version}", reader.name),
            Err(e) => warn!("{}: firmware version unavailable: {e}", reader.name),
        },
        Ok(false) => warn!("{}: handshake not acknowledged", reader.name),
        Err(e) => warn!("{}: not connected yet: {e}", reader.name),
    }
    launch.start(ConnectionMode::Hardware, driver, GaussianPeakAnalyzer::new())
}

fn start_simulated(
    launch: Launch<'_>,
    seed: u64,
    fixtures: Option<&PathBuf>,
    peaks: Option<&Vec<PeakReading>>,
) -> Result<ReaderHandle> {
    let reader = launch.reader;
    let mode = ConnectionMode::Simulation;
    match (fixtures, peaks) {
        (Some(dir), Some(peaks)) => launch.start(
            mode,
            ReplayDevice::from_dir(dir)?,
            FixtureAnalyzer::new(peaks.clone()),
        ),
        (Some(dir), None) => launch.start(mode, ReplayDevice::from_dir(dir)?, GaussianPeakAnalyzer::new()),
        (None, peaks) => {
            let plan = SweepPlan::scan(reader.start_mhz, reader.stop_mhz)?;
            let device = SyntheticDevice::new(plan, seed);
            match peaks {
                Some(peaks) => launch.start(mode, device, FixtureAnalyzer::new(peaks.clone())),
                None => launch.start(mode, device, GaussianPeakAnalyzer::new()),
            }
        }
    }
}

/// Reads operator commands from stdin: `c` calibrate, `r` reset run, `q` quit.
/// End of input also stops every reader.
fn watch_stdin(commands: Vec<Sender<ReaderCommand>>, shutdown: Arc<AtomicBool>) {
    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let Ok(line) = line else { break };
        let command = match line.trim() {
            "q" | "quit" => break,
            "c" => ReaderCommand::Calibrate,
            "r" => ReaderCommand::ResetRun,
            "" => continue,
            other => {
                warn!("unknown command {other:?} (c = calibrate, r = reset run, q = quit)");
                continue;
            }
        };
        for tx in &commands {
            tx.send(command.clone()).ok();
        }
    }
    info!("stopping readers");
    shutdown.store(true, Ordering::Relaxed);
    for tx in &commands {
        tx.send(ReaderCommand::Stop).ok();
    }
}

fn log_event(event: &ReaderEvent) {
    match event {
        // Already logged by the reader itself.
        ReaderEvent::Log { .. } => {}
        ReaderEvent::Status(s) => info!(
            "[{}] {:.3} h: {} points ({} failed), f = {}, growth = {}, harvest {:?}",
            s.reader,
            s.time_hours,
            s.points,
            s.failed_points,
            s.latest_frequency_mhz
                .map_or_else(|| "-".to_owned(), |f| format!("{f:.6} MHz")),
            s.growth_index
                .map_or_else(|| "-".to_owned(), |g| format!("{g:.3} %")),
            s.harvest_phase,
        ),
        ReaderEvent::ScanFailed {
            reader,
            time_hours,
            reason,
        } => warn!("[{reader}] scan at {time_hours:.3} h failed: {reason}"),
        ReaderEvent::IntervalIncreased {
            reader,
            interval_secs,
        } => warn!("[{reader}] scan interval increased to {interval_secs} s"),
        ReaderEvent::ZeroPointSet {
            reader,
            frequency_mhz,
        } => info!("[{reader}] zero point {frequency_mhz:.6} MHz"),
        ReaderEvent::Harvested {
            reader,
            predicted_hours,
        } => info!("[{reader}] HARVEST (predicted {predicted_hours:.2} h)"),
        ReaderEvent::Contaminated { reader, time_hours } => {
            error!("[{reader}] CONTAMINATION suspected at {time_hours:.2} h")
        }
        ReaderEvent::Issue { reader, message } => error!("[{reader}] issue: {message}"),
        ReaderEvent::CalibrationComplete { reader, points } => {
            info!("[{reader}] calibration stored ({points} points)")
        }
        ReaderEvent::Stopped { reader } => info!("[{reader}] stopped"),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    if cli.list_devices {
        for serial in list_device_serials().context("enumerating serial ports")? {
            println!("{serial}");
        }
        return Ok(());
    }

    let mut config = match &cli.config {
        Some(path) => ExperimentConfig::load(path)?,
        None => ExperimentConfig::default(),
    };
    if let Some(output) = cli.output {
        config.output_dir = output;
    }
    config.validate()?;

    let peaks = cli.peaks.as_deref().map(read_peak_csv).transpose()?;
    let simulate = cli.simulate || cli.fixtures.is_some() || peaks.is_some();
    info!(
        "{} reader(s), {} mode, output {}",
        config.readers.len(),
        if simulate { "simulation" } else { "hardware" },
        config.output_dir.display()
    );

    let shutdown = Arc::new(AtomicBool::new(false));
    let (tx, rx) = mpsc::channel();
    let mut handles = Vec::new();
    for (i, reader) in config.readers.iter().enumerate() {
        let launch = Launch {
            reader,
            config: &config,
            events: tx.clone(),
            shutdown: shutdown.clone(),
        };
        let started = if simulate {
            start_simulated(launch, i as u64 + 1, cli.fixtures.as_ref(), peaks.as_ref())
        } else {
            start_hardware(launch)
        };
        match started {
            Ok(handle) => handles.push(handle),
            Err(e) => error!("{}: {e:#}", reader.name),
        }
    }
    drop(tx);
    if handles.is_empty() {
        bail!("no reader could be started");
    }

    let commands: Vec<Sender<ReaderCommand>> = handles.iter().map(ReaderHandle::commands).collect();
    let watcher_shutdown = shutdown.clone();
    thread::spawn(move || watch_stdin(commands, watcher_shutdown));

    // Ends once every reader has stopped and dropped its sender.
    for event in rx {
        log_event(&event);
    }
    for handle in handles {
        let name = handle.name().to_owned();
        if handle.join().is_err() {
            error!("{name}: reader thread panicked");
        }
    }
    Ok(())
}
