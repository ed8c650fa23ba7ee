// src/engine.rs
use std::any::Any;
use std::io;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, Sender, TryRecvError};
use std::sync::{mpsc, Arc};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use chrono::Local;
use log::{debug, error, info, warn};

use crate::analysis::peak::Analyzer;
use crate::config::{ExperimentConfig, ReaderConfig};
use crate::drivers::error::SweepError;
use crate::drivers::source::SweepDevice;
use crate::predict::{ContaminationDetector, HarvestPredictor};
use crate::recorder::ScanRecorder;
use crate::series::{ResultPoint, ResultSeries};
use crate::types::{ConnectionMode, ReaderCommand, ReaderEvent, ReaderStatus};

/// How often a sleeping reader checks for shutdown and commands.
pub const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Result of one scan-and-analyze step.
#[derive(Clone, Debug, PartialEq)]
pub enum ScanOutcome {
    Measured(ResultPoint),
    /// Scan lost but the link came back; try again next cycle.
    Reconnected(String),
    ConnectionError(String),
    HardwareFault(String),
    /// Bad frame, unexpected response or device-side data problem.
    ProtocolError(String),
    AnalysisFailure(String),
    ConfigurationInvalid(String),
    Closed,
}

impl ScanOutcome {
    fn from_sweep_error(err: SweepError) -> Self {
        match err {
            SweepError::Reconnected(s) => ScanOutcome::Reconnected(s),
            SweepError::Connection(s) => ScanOutcome::ConnectionError(s),
            SweepError::HardwareFault(s) => ScanOutcome::HardwareFault(s),
            SweepError::Protocol(s) | SweepError::Fixture(s) => ScanOutcome::ProtocolError(s),
            SweepError::ConfigurationInvalid(s) => ScanOutcome::ConfigurationInvalid(s),
            SweepError::Closed => ScanOutcome::Closed,
        }
    }

    fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            ScanOutcome::ConnectionError(_) | ScanOutcome::HardwareFault(_)
        )
    }

    fn describe(&self) -> String {
        match self {
            ScanOutcome::Measured(_) => "measured".to_owned(),
            ScanOutcome::Reconnected(s) => format!("link recovered, scan lost: {s}"),
            ScanOutcome::ConnectionError(s) => format!("connection error: {s}"),
            ScanOutcome::HardwareFault(s) => format!("hardware fault: {s}"),
            ScanOutcome::ProtocolError(s) => format!("protocol error: {s}"),
            ScanOutcome::AnalysisFailure(s) => format!("analysis failed: {s}"),
            ScanOutcome::ConfigurationInvalid(s) => format!("invalid configuration: {s}"),
            ScanOutcome::Closed => "device closed".to_owned(),
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Interval to use after a cycle that took `took`: the duration rounded up to
/// the next whole second.
pub fn next_interval(took: Duration) -> Duration {
    let secs = took.as_secs() + u64::from(took.subsec_nanos() > 0);
    Duration::from_secs(secs.max(1))
}

/// One reader: device, analyzer, series and both predictors.
pub struct ReaderLoop<D: SweepDevice, A: Analyzer> {
    name: String,
    mode: ConnectionMode,
    device: D,
    analyzer: A,
    recorder: Option<ScanRecorder>,
    series: ResultSeries,
    harvest: HarvestPredictor,
    contamination: ContaminationDetector,
    events: Sender<ReaderEvent>,
    interval: Duration,
    equilibration_hours: f64,
    max_connection_failures: usize,
    connection_failures: usize,
    issue_raised: bool,
    harvest_reported: bool,
    contamination_reported: bool,
    calibration_requested: bool,
    last_time: f64,
}

impl<D: SweepDevice, A: Analyzer> ReaderLoop<D, A> {
    pub fn new(
        name: impl Into<String>,
        mode: ConnectionMode,
        device: D,
        analyzer: A,
        config: &ExperimentConfig,
        events: Sender<ReaderEvent>,
    ) -> Self {
        Self {
            name: name.into(),
            mode,
            device,
            analyzer,
            recorder: None,
            series: ResultSeries::new(config.series.clone()),
            harvest: HarvestPredictor::new(config.harvest.clone()),
            contamination: ContaminationDetector::new(config.contamination.clone()),
            events,
            interval: Duration::from_secs_f64(config.scan_interval_secs.max(0.0)),
            equilibration_hours: config.equilibration_hours,
            max_connection_failures: config.max_connection_failures.max(1),
            connection_failures: 0,
            issue_raised: false,
            harvest_reported: false,
            contamination_reported: false,
            calibration_requested: false,
            last_time: f64::NEG_INFINITY,
        }
    }

    pub fn with_recorder(mut self, recorder: ScanRecorder) -> Self {
        self.recorder = Some(recorder);
        self
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn series(&self) -> &ResultSeries {
        &self.series
    }

    pub fn harvest(&self) -> &HarvestPredictor {
        &self.harvest
    }

    pub fn contamination(&self) -> &ContaminationDetector {
        &self.contamination
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    fn emit(&self, event: ReaderEvent) {
        // Nobody listening is not an error for the reader.
        self.events.send(event).ok();
    }

    fn log(&self, message: impl Into<String>) {
        let message = message.into();
        info!("[{}] {message}", self.name);
        self.emit(ReaderEvent::Log {
            reader: self.name.clone(),
            message,
        });
    }

    fn raise_issue(&mut self, message: String) {
        error!("[{}] {message}", self.name);
        self.issue_raised = true;
        self.emit(ReaderEvent::Issue {
            reader: self.name.clone(),
            message,
        });
    }

    /// Apply the reader's sweep bounds and reload any stored calibration.
    /// A rejected configuration is reported as a reader-level issue.
    pub fn configure(&mut self, reader: &ReaderConfig) -> Result<(), SweepError> {
        if let Err(e) = self.device.configure(reader.start_mhz, reader.stop_mhz) {
            self.raise_issue(format!("configuration rejected: {e}"));
            return Err(e);
        }
        if let Some(recorder) = &self.recorder {
            match recorder.load_calibration() {
                Ok(Some(curve)) => {
                    self.log(format!("loaded calibration ({} points)", curve.len()));
                    self.device.load_calibration(curve);
                }
                Ok(None) => self.log("no stored calibration; request one with Calibrate"),
                Err(e) => warn!("[{}] stored calibration unreadable: {e:#}", self.name),
            }
        }
        self.log(format!(
            "configured {:.3}-{:.3} MHz",
            reader.start_mhz, reader.stop_mhz
        ));
        Ok(())
    }

    /// Take a calibration sweep and store it in the calibration location.
    pub fn calibrate(&mut self) -> Result<(), SweepError> {
        let curve = self.device.take_calibration_scan()?;
        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.save_calibration(&curve) {
                warn!("[{}] could not store calibration: {e:#}", self.name);
            }
        }
        let points = curve.len();
        self.device.load_calibration(curve);
        self.emit(ReaderEvent::CalibrationComplete {
            reader: self.name.clone(),
            points,
        });
        Ok(())
    }

    /// Drive the device once and analyze the sweep.
    pub fn scan_and_analyze(&mut self, time_hours: f64) -> ScanOutcome {
        let sweep = match self.device.take_scan() {
            Ok(sweep) => sweep,
            Err(e) => return ScanOutcome::from_sweep_error(e),
        };
        let timestamp = Local::now();
        let filename = match self.recorder.as_mut() {
            Some(recorder) => recorder.record_sweep(&sweep, timestamp).unwrap_or_else(|e| {
                warn!("[{}] could not store sweep: {e:#}", self.name);
                String::new()
            }),
            None => format!("{}_{:.4}h", self.name, time_hours),
        };
        match self.analyzer.analyze(&sweep) {
            Ok(reading) => ScanOutcome::Measured(ResultPoint::from_reading(
                time_hours, &reading, filename, timestamp,
            )),
            Err(e) => ScanOutcome::AnalysisFailure(e.to_string()),
        }
    }

    /// One full cycle at the given elapsed time: scan, record, predict, report.
    pub fn run_cycle_at(&mut self, time_hours: f64) -> ScanOutcome {
        if std::mem::take(&mut self.calibration_requested) {
            match panic::catch_unwind(AssertUnwindSafe(|| self.calibrate())) {
                Ok(Ok(())) => self.log("calibration complete"),
                Ok(Err(e)) => self.log(format!("calibration failed: {e}")),
                Err(payload) => self.log(format!(
                    "calibration failed: panic: {}",
                    panic_message(payload.as_ref())
                )),
            }
        }

        let outcome = panic::catch_unwind(AssertUnwindSafe(|| self.scan_and_analyze(time_hours)))
            .unwrap_or_else(|payload| {
                ScanOutcome::AnalysisFailure(format!("panic: {}", panic_message(payload.as_ref())))
            });

        let point = match &outcome {
            ScanOutcome::Measured(point) => {
                self.connection_failures = 0;
                point.clone()
            }
            failed => {
                self.record_failure(failed, time_hours);
                ResultPoint::missing(time_hours, Local::now())
            }
        };
        if time_hours > self.last_time {
            self.last_time = time_hours;
            if let Err(e) = self.series.append(point) {
                warn!("[{}] point dropped: {e}", self.name);
            }
        } else {
            warn!("[{}] cycle time {time_hours} h is not after {} h", self.name, self.last_time);
        }

        self.capture_zero_point(time_hours);
        // Both predictors ignore input whose newest finite sample they have
        // already seen, so failed cycles only advance the harvest clock.
        self.evaluate_predictors(time_hours);
        if let Some(recorder) = &self.recorder {
            if let Err(e) = recorder.write_results(&self.series) {
                warn!("[{}] could not write results: {e:#}", self.name);
            }
        }
        self.emit(ReaderEvent::Status(self.status(time_hours)));
        outcome
    }

    fn record_failure(&mut self, outcome: &ScanOutcome, time_hours: f64) {
        let reason = outcome.describe();
        warn!("[{}] scan at {time_hours:.3} h failed: {reason}", self.name);
        self.emit(ReaderEvent::ScanFailed {
            reader: self.name.clone(),
            time_hours,
            reason: reason.clone(),
        });
        match outcome {
            ScanOutcome::Reconnected(_) => self.connection_failures = 0,
            o if o.is_connection_loss() => {
                self.connection_failures += 1;
                if self.connection_failures >= self.max_connection_failures && !self.issue_raised {
                    self.raise_issue(format!(
                        "{} consecutive connection failures, last: {reason}",
                        self.connection_failures
                    ));
                }
            }
            ScanOutcome::ConfigurationInvalid(_) if !self.issue_raised => {
                self.raise_issue(reason);
            }
            _ => {}
        }
    }

    fn capture_zero_point(&mut self, time_hours: f64) {
        if self.series.zero_point().is_some() || time_hours < self.equilibration_hours {
            return;
        }
        let Some(latest) = self.series.latest_valid() else {
            return;
        };
        match self.series.set_zero_point(latest.raw_frequency) {
            Ok(()) => {
                self.series.reset_run();
                self.log(format!(
                    "zero point {:.6} MHz after {time_hours:.2} h",
                    latest.raw_frequency
                ));
                self.emit(ReaderEvent::ZeroPointSet {
                    reader: self.name.clone(),
                    frequency_mhz: latest.raw_frequency,
                });
            }
            Err(e) => warn!("[{}] {e}", self.name),
        }
    }

    fn evaluate_predictors(&mut self, time_hours: f64) {
        self.harvest.evaluate(
            self.series.derivative_time(),
            self.series.derivative_mean(),
            time_hours,
        );
        if self.harvest.is_harvested() && !self.harvest_reported {
            self.harvest_reported = true;
            let predicted_hours = self.harvest.prediction().unwrap_or(time_hours);
            self.log(format!("harvest time reached (predicted {predicted_hours:.2} h)"));
            self.emit(ReaderEvent::Harvested {
                reader: self.name.clone(),
                predicted_hours,
            });
        }

        self.contamination
            .evaluate(self.series.time(), self.series.raw_frequency());
        if self.contamination.is_contaminated() && !self.contamination_reported {
            self.contamination_reported = true;
            self.emit(ReaderEvent::Contaminated {
                reader: self.name.clone(),
                time_hours,
            });
        }
    }

    pub fn status(&self, time_hours: f64) -> ReaderStatus {
        let latest = self.series.latest_valid();
        ReaderStatus {
            reader: self.name.clone(),
            mode: self.mode,
            time_hours,
            points: self.series.len(),
            failed_points: self.series.failed_points(),
            latest_frequency_mhz: latest.as_ref().map(|p| p.raw_frequency),
            growth_index: latest
                .as_ref()
                .and_then(|p| self.series.growth_index(p.raw_frequency)),
            harvest_phase: self.harvest.phase(),
            predicted_harvest_hours: self.harvest.prediction(),
            harvested: self.harvest.is_harvested(),
            contaminated: self.contamination.is_contaminated(),
        }
    }

    /// Apply queued commands. Returns true when the reader should stop.
    pub fn handle_commands(&mut self, commands: &Receiver<ReaderCommand>) -> bool {
        loop {
            match commands.try_recv() {
                Ok(ReaderCommand::Calibrate) => self.calibration_requested = true,
                Ok(ReaderCommand::ResetRun) => {
                    self.series.reset_run();
                    self.log("run reset");
                }
                Ok(ReaderCommand::Stop) | Err(TryRecvError::Disconnected) => return true,
                Err(TryRecvError::Empty) => return false,
            }
        }
    }

    /// Raise the interval when a cycle overran it. The interval never shrinks.
    pub fn adapt_interval(&mut self, took: Duration) -> bool {
        if took <= self.interval {
            return false;
        }
        self.interval = next_interval(took);
        warn!("[{}] cycle took {took:?}; interval raised to {:?}", self.name, self.interval);
        self.emit(ReaderEvent::IntervalIncreased {
            reader: self.name.clone(),
            interval_secs: self.interval.as_secs_f64(),
        });
        true
    }

    /// Cycle until stopped. Sleeps out the remainder of each interval while
    /// polling for commands and shutdown; an in-flight scan always finishes.
    pub fn run(mut self, commands: Receiver<ReaderCommand>, shutdown: Arc<AtomicBool>) {
        let started = Instant::now();
        self.log(format!("reader started, interval {:?}", self.interval));
        'cycles: loop {
            if shutdown.load(Ordering::Relaxed) || self.handle_commands(&commands) {
                break;
            }
            let cycle_start = Instant::now();
            let elapsed_hours = started.elapsed().as_secs_f64() / 3600.0;
            self.run_cycle_at(elapsed_hours);

            self.adapt_interval(cycle_start.elapsed());
            loop {
                let elapsed = cycle_start.elapsed();
                if elapsed >= self.interval {
                    break;
                }
                if shutdown.load(Ordering::Relaxed) || self.handle_commands(&commands) {
                    break 'cycles;
                }
                thread::sleep(POLL_INTERVAL.min(self.interval - elapsed));
            }
        }
        self.device.close();
        debug!("[{}] device closed", self.name);
        self.log("reader stopped");
        self.emit(ReaderEvent::Stopped {
            reader: self.name.clone(),
        });
    }
}

/// Running reader thread plus its command channel.
pub struct ReaderHandle {
    name: String,
    commands: Sender<ReaderCommand>,
    thread: JoinHandle<()>,
}

impl ReaderHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn send(&self, command: ReaderCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    pub fn commands(&self) -> Sender<ReaderCommand> {
        self.commands.clone()
    }

    pub fn join(self) -> thread::Result<()> {
        self.thread.join()
    }
}

/// Run `reader` on its own worker thread.
pub fn spawn_reader<D, A>(reader: ReaderLoop<D, A>, shutdown: Arc<AtomicBool>) -> io::Result<ReaderHandle>
where
    D: SweepDevice + 'static,
    A: Analyzer + 'static,
{
    let (tx_cmd, rx_cmd) = mpsc::channel();
    let name = reader.name().to_owned();
    let thread = thread::Builder::new()
        .name(format!("reader-{name}"))
        .spawn(move || reader.run(rx_cmd, shutdown))?;
    Ok(ReaderHandle {
        name,
        commands: tx_cmd,
        thread,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analysis::peak::{FixtureAnalyzer, GaussianPeakAnalyzer, Peak, PeakReading};
    use crate::drivers::source::{CalibrationCurve, ReplayDevice, SweepPlan, SweepSample, SyntheticDevice};
    use crate::drivers::sweep::tests::{FakeOpener, Misbehave};
    use crate::drivers::sweep::SweepDriver;
    use crate::drivers::error::AnalysisError;
    use crate::predict::HarvestPhase;

    fn config() -> ExperimentConfig {
        ExperimentConfig {
            equilibration_hours: 1.0,
            ..Default::default()
        }
    }

    fn reading(freq: f64) -> PeakReading {
        let peak = Peak {
            amplitude: 1.0,
            frequency_mhz: freq,
        };
        PeakReading { raw: peak, smooth: peak }
    }

    fn replay() -> ReplayDevice {
        ReplayDevice::new(vec![SweepSample::new(vec![5.5], vec![1.0]).unwrap()]).unwrap()
    }

    fn drain(rx: &Receiver<ReaderEvent>) -> Vec<ReaderEvent> {
        rx.try_iter().collect()
    }

    /// Device whose every scan fails the same way.
    struct FailingDevice(fn() -> SweepError);

    impl SweepDevice for FailingDevice {
        fn configure(&mut self, _: f64, _: f64) -> Result<(), SweepError> {
            Ok(())
        }
        fn take_scan(&mut self) -> Result<SweepSample, SweepError> {
            Err((self.0)())
        }
        fn take_calibration_scan(&mut self) -> Result<CalibrationCurve, SweepError> {
            Err((self.0)())
        }
        fn perform_handshake(&mut self) -> Result<bool, SweepError> {
            Ok(false)
        }
        fn load_calibration(&mut self, _: CalibrationCurve) {}
        fn close(&mut self) {}
    }

    /// Replay device that is slow on its first scan or panics when asked to calibrate.
    struct QuirkyDevice {
        inner: ReplayDevice,
        first_scan_delay: Option<Duration>,
        panic_on_calibration: bool,
    }

    impl QuirkyDevice {
        fn slow_first_scan(delay: Duration) -> Self {
            Self {
                inner: replay(),
                first_scan_delay: Some(delay),
                panic_on_calibration: false,
            }
        }

        fn panicking_calibration() -> Self {
            Self {
                inner: replay(),
                first_scan_delay: None,
                panic_on_calibration: true,
            }
        }
    }

    impl SweepDevice for QuirkyDevice {
        fn configure(&mut self, start: f64, stop: f64) -> Result<(), SweepError> {
            self.inner.configure(start, stop)
        }
        fn take_scan(&mut self) -> Result<SweepSample, SweepError> {
            if let Some(delay) = self.first_scan_delay.take() {
                thread::sleep(delay);
            }
            self.inner.take_scan()
        }
        fn take_calibration_scan(&mut self) -> Result<CalibrationCurve, SweepError> {
            if self.panic_on_calibration {
                panic!("calibration sweep blew up");
            }
            self.inner.take_calibration_scan()
        }
        fn perform_handshake(&mut self) -> Result<bool, SweepError> {
            self.inner.perform_handshake()
        }
        fn load_calibration(&mut self, curve: CalibrationCurve) {
            self.inner.load_calibration(curve)
        }
        fn close(&mut self) {
            self.inner.close()
        }
    }

    struct PanickingAnalyzer;

    impl Analyzer for PanickingAnalyzer {
        fn analyze(&mut self, _: &SweepSample) -> Result<PeakReading, AnalysisError> {
            panic!("fit blew up");
        }
    }

    #[test]
    fn synthetic_reader_sets_zero_point_after_equilibration() {
        let (tx, rx) = mpsc::channel();
        let plan = SweepPlan::scan(5.0, 6.0).unwrap();
        let device = SyntheticDevice::new(plan, 7).with_drift(2e-3);
        let mut reader = ReaderLoop::new(
            "r1",
            ConnectionMode::Simulation,
            device,
            GaussianPeakAnalyzer::new(),
            &config(),
            tx,
        );
        for i in 0..5 {
            let outcome = reader.run_cycle_at(i as f64 * 0.25);
            assert!(matches!(outcome, ScanOutcome::Measured(_)), "{outcome:?}");
        }
        // Zero point captured at 1.0 h, then the run restarts from that point.
        assert_eq!(reader.series().len(), 1);
        let zp = reader.series().zero_point().unwrap();
        assert!((zp - 5.5).abs() < 0.01);
        reader.run_cycle_at(1.25);
        assert_eq!(reader.series().len(), 2);
        let events = drain(&rx);
        assert!(events
            .iter()
            .any(|e| matches!(e, ReaderEvent::ZeroPointSet { .. })));
        assert!(matches!(events.last(), Some(ReaderEvent::Status(s)) if s.growth_index.unwrap() > 0.0));
    }

    #[test]
    fn analysis_failure_records_missing_point() {
        let (tx, rx) = mpsc::channel();
        let analyzer = FixtureAnalyzer::new(vec![reading(5.6)]);
        let mut reader = ReaderLoop::new("r1", ConnectionMode::Simulation, replay(), analyzer, &config(), tx);
        assert!(matches!(reader.run_cycle_at(0.1), ScanOutcome::Measured(_)));
        assert!(matches!(reader.run_cycle_at(0.2), ScanOutcome::AnalysisFailure(_)));
        assert_eq!(reader.series().len(), 2);
        assert_eq!(reader.series().failed_points(), 1);
        assert!(drain(&rx)
            .iter()
            .any(|e| matches!(e, ReaderEvent::ScanFailed { time_hours, .. } if *time_hours == 0.2)));
    }

    #[test]
    fn panic_in_analyzer_is_contained() {
        let (tx, _rx) = mpsc::channel();
        let mut reader =
            ReaderLoop::new("r1", ConnectionMode::Simulation, replay(), PanickingAnalyzer, &config(), tx);
        for i in 1..=3 {
            let outcome = reader.run_cycle_at(i as f64 * 0.1);
            assert!(matches!(outcome, ScanOutcome::AnalysisFailure(ref m) if m.contains("fit blew up")));
        }
        assert_eq!(reader.series().len(), 3);
        assert_eq!(reader.series().failed_points(), 3);
    }

    #[test]
    fn repeated_connection_loss_raises_one_issue() {
        let (tx, rx) = mpsc::channel();
        let device = FailingDevice(|| SweepError::Connection("port gone".into()));
        let analyzer = FixtureAnalyzer::new(Vec::new());
        let mut reader = ReaderLoop::new("r1", ConnectionMode::Hardware, device, analyzer, &config(), tx);
        for i in 1..=8 {
            assert!(matches!(reader.run_cycle_at(i as f64 * 0.1), ScanOutcome::ConnectionError(_)));
        }
        let issues = drain(&rx)
            .into_iter()
            .filter(|e| matches!(e, ReaderEvent::Issue { .. }))
            .count();
        assert_eq!(issues, 1);
    }

    #[test]
    fn reconnect_loses_one_scan_then_recovers() {
        let (tx, _rx) = mpsc::channel();
        let (opener, log) = FakeOpener::new();
        let driver = SweepDriver::connect(opener)
            .unwrap()
            .with_settle_delay(Duration::from_millis(1));
        let analyzer = FixtureAnalyzer::new(vec![reading(5.3), reading(5.3)]);
        let mut reader = ReaderLoop::new("r1", ConnectionMode::Hardware, driver, analyzer, &config(), tx);
        reader
            .configure(&ReaderConfig {
                start_mhz: 5.0,
                stop_mhz: 5.5,
                ..Default::default()
            })
            .unwrap();
        assert!(matches!(reader.run_cycle_at(0.1), ScanOutcome::Measured(_)));
        log.lock().unwrap().faults.push_back(Misbehave::DropDuringSweep);
        assert!(matches!(reader.run_cycle_at(0.2), ScanOutcome::Reconnected(_)));
        assert!(matches!(reader.run_cycle_at(0.3), ScanOutcome::Measured(_)));
        assert_eq!(reader.series().failed_points(), 1);
    }

    #[test]
    fn contamination_is_reported_once() {
        let (tx, rx) = mpsc::channel();
        let mut freq = 5.6;
        let readings: Vec<PeakReading> = (0..40)
            .map(|i| {
                freq += if i < 20 { -0.001 } else { -0.05 };
                reading(freq)
            })
            .collect();
        let analyzer = FixtureAnalyzer::new(readings);
        let cfg = ExperimentConfig {
            equilibration_hours: 1000.0,
            ..Default::default()
        };
        let mut reader = ReaderLoop::new("r1", ConnectionMode::Simulation, replay(), analyzer, &cfg, tx);
        for i in 0..40 {
            reader.run_cycle_at(i as f64);
        }
        assert!(reader.contamination().is_contaminated());
        let flagged = drain(&rx)
            .into_iter()
            .filter(|e| matches!(e, ReaderEvent::Contaminated { .. }))
            .count();
        assert_eq!(flagged, 1);
        assert_eq!(reader.harvest().phase(), HarvestPhase::NotTracking);
    }

    #[test]
    fn failed_scans_do_not_extend_a_suspicious_run() {
        let (tx, rx) = mpsc::channel();
        let mut freq = 5.6;
        let mut readings: Vec<PeakReading> = (0..20)
            .map(|_| {
                freq -= 0.001;
                reading(freq)
            })
            .collect();
        readings.push(reading(freq - 0.5));
        let analyzer = FixtureAnalyzer::new(readings);
        let cfg = ExperimentConfig {
            equilibration_hours: 1000.0,
            ..Default::default()
        };
        let mut reader = ReaderLoop::new("r1", ConnectionMode::Simulation, replay(), analyzer, &cfg, tx);
        for i in 0..21 {
            assert!(matches!(reader.run_cycle_at(i as f64), ScanOutcome::Measured(_)));
        }
        assert_eq!(reader.contamination().consecutive(), 1);
        for i in 21..30 {
            assert!(matches!(reader.run_cycle_at(i as f64), ScanOutcome::AnalysisFailure(_)));
        }
        assert_eq!(reader.contamination().consecutive(), 1);
        assert!(!reader.contamination().is_contaminated());
        assert!(!drain(&rx)
            .iter()
            .any(|e| matches!(e, ReaderEvent::Contaminated { .. })));
    }

    #[test]
    fn panic_during_calibration_is_contained() {
        let (tx, rx) = mpsc::channel();
        let analyzer = FixtureAnalyzer::new(vec![reading(5.6)]);
        let mut reader = ReaderLoop::new(
            "r1",
            ConnectionMode::Simulation,
            QuirkyDevice::panicking_calibration(),
            analyzer,
            &config(),
            tx,
        );
        let (tx_cmd, rx_cmd) = mpsc::channel();
        tx_cmd.send(ReaderCommand::Calibrate).unwrap();
        assert!(!reader.handle_commands(&rx_cmd));
        assert!(matches!(reader.run_cycle_at(0.1), ScanOutcome::Measured(_)));
        assert!(drain(&rx).iter().any(|e| matches!(
            e,
            ReaderEvent::Log { message, .. } if message.contains("calibration sweep blew up")
        )));
        // The request is consumed, not retried every cycle.
        assert!(matches!(reader.run_cycle_at(0.2), ScanOutcome::AnalysisFailure(_)));
    }

    #[test]
    fn commands_reset_and_stop() {
        let (tx, _rx) = mpsc::channel();
        let analyzer = FixtureAnalyzer::new((0..5).map(|_| reading(5.6)));
        let mut reader = ReaderLoop::new("r1", ConnectionMode::Simulation, replay(), analyzer, &config(), tx);
        for i in 0..3 {
            reader.run_cycle_at(i as f64 * 0.1);
        }
        let (tx_cmd, rx_cmd) = mpsc::channel();
        tx_cmd.send(ReaderCommand::ResetRun).unwrap();
        assert!(!reader.handle_commands(&rx_cmd));
        assert_eq!(reader.series().len(), 1);
        tx_cmd.send(ReaderCommand::Calibrate).unwrap();
        tx_cmd.send(ReaderCommand::Stop).unwrap();
        assert!(reader.handle_commands(&rx_cmd));
    }

    #[test]
    fn overrun_rounds_interval_up() {
        assert_eq!(next_interval(Duration::from_millis(2300)), Duration::from_secs(3));
        assert_eq!(next_interval(Duration::from_secs(4)), Duration::from_secs(4));
        assert_eq!(next_interval(Duration::from_millis(10)), Duration::from_secs(1));
    }

    #[test]
    fn interval_only_grows() {
        let (tx, rx) = mpsc::channel();
        let analyzer = FixtureAnalyzer::new(Vec::new());
        let mut reader = ReaderLoop::new("r1", ConnectionMode::Simulation, replay(), analyzer, &config(), tx)
            .with_interval(Duration::from_secs(1));
        assert!(reader.adapt_interval(Duration::from_millis(2300)));
        assert_eq!(reader.interval(), Duration::from_secs(3));
        assert!(!reader.adapt_interval(Duration::from_millis(500)));
        assert!(!reader.adapt_interval(Duration::from_secs(3)));
        assert_eq!(reader.interval(), Duration::from_secs(3));
        let raised: Vec<f64> = drain(&rx)
            .into_iter()
            .filter_map(|e| match e {
                ReaderEvent::IntervalIncreased { interval_secs, .. } => Some(interval_secs),
                _ => None,
            })
            .collect();
        assert_eq!(raised, vec![3.0]);
    }

    #[test]
    fn overrunning_cycle_raises_interval_while_running() {
        let (tx, rx) = mpsc::channel();
        let analyzer = FixtureAnalyzer::new((0..10).map(|_| reading(5.6)));
        let device = QuirkyDevice::slow_first_scan(Duration::from_millis(1100));
        let reader = ReaderLoop::new("r1", ConnectionMode::Simulation, device, analyzer, &config(), tx)
            .with_interval(Duration::from_millis(20));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_reader(reader, shutdown.clone()).unwrap();
        // First cycle ends near 1.1 s, the second starts 2 s after the first.
        thread::sleep(Duration::from_millis(2500));
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let events: Vec<ReaderEvent> = rx.try_iter().collect();
        let raised: Vec<f64> = events
            .iter()
            .filter_map(|e| match e {
                ReaderEvent::IntervalIncreased { interval_secs, .. } => Some(*interval_secs),
                _ => None,
            })
            .collect();
        assert_eq!(raised, vec![2.0]);
        let cycles = events
            .iter()
            .filter(|e| matches!(e, ReaderEvent::Status(_)))
            .count();
        assert_eq!(cycles, 2);
    }

    #[test]
    fn spawned_reader_stops_on_shutdown() {
        let (tx, rx) = mpsc::channel();
        let analyzer = FixtureAnalyzer::new((0..1000).map(|_| reading(5.6)));
        let reader = ReaderLoop::new("r1", ConnectionMode::Simulation, replay(), analyzer, &config(), tx)
            .with_interval(Duration::from_millis(20));
        let shutdown = Arc::new(AtomicBool::new(false));
        let handle = spawn_reader(reader, shutdown.clone()).unwrap();
        assert_eq!(handle.name(), "r1");
        thread::sleep(Duration::from_millis(100));
        shutdown.store(true, Ordering::Relaxed);
        handle.join().unwrap();
        let events: Vec<ReaderEvent> = rx.try_iter().collect();
        assert!(events.iter().any(|e| matches!(e, ReaderEvent::Status(_))));
        assert!(events.iter().all(|e| e.reader() == "r1"));
        assert!(matches!(events.last(), Some(ReaderEvent::Stopped { .. })));
    }

    #[test]
    fn calibrate_command_runs_before_next_scan() {
        let (tx, rx) = mpsc::channel();
        let dir = tempfile::tempdir().unwrap();
        let recorder = ScanRecorder::new(dir.path(), "r1").unwrap();
        let analyzer = FixtureAnalyzer::new(vec![reading(5.6)]);
        let mut reader = ReaderLoop::new("r1", ConnectionMode::Simulation, replay(), analyzer, &config(), tx)
            .with_recorder(recorder);
        let (tx_cmd, rx_cmd) = mpsc::channel();
        tx_cmd.send(ReaderCommand::Calibrate).unwrap();
        assert!(!reader.handle_commands(&rx_cmd));
        reader.run_cycle_at(0.1);
        assert!(drain(&rx)
            .iter()
            .any(|e| matches!(e, ReaderEvent::CalibrationComplete { .. })));
        assert!(dir.path().join("calibration").join("calibration.csv").exists());
        assert!(dir.path().join("results_raw.csv").exists());
    }
}
