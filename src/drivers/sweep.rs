//! Serial sweep driver for one resonance board.
//!
//! The driver owns the link, replays the sweep configuration before every scan
//! and recovers from link failures by reopening the same physical device.
//! Recovery never completes the interrupted scan: the caller sees
//! [`SweepError::Reconnected`] and tries again on its next cycle.
use std::thread;
use std::time::Duration;

use crate::drivers::error::{ProtocolError, SweepError};
use crate::drivers::port::PortOpener;
use crate::drivers::protocol::{read_response, write_command, Command, Response};
use crate::drivers::source::{
    CalibrationCurve, SweepDevice, SweepPlan, SweepSample, LEADING_ARTIFACT_POINTS,
};

pub const HANDSHAKE_CHALLENGE: u32 = 0x5EED_CAFE;
pub const DEFAULT_AMPLITUDE: u16 = 2000;
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(5);
const ADC_REFERENCE_VOLTS: f64 = 3.3;
const ADC_FULL_SCALE: f64 = 4095.0;
/// Upper bound on frames discarded while resynchronizing after a bad frame.
const RESYNC_FRAME_LIMIT: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DriverState {
    Disconnected,
    Idle,
    Sweeping,
    CalibratingSweep,
    Reconnecting,
    Closed,
}

/// Internal failure classes; mapped to [`SweepError`] after recovery is attempted.
#[derive(Debug)]
enum Fault {
    Link(String),
    DeviceConfig(String),
    Protocol(String),
}

impl From<ProtocolError> for Fault {
    fn from(err: ProtocolError) -> Self {
        if err.is_link_failure() {
            Fault::Link(err.to_string())
        } else {
            Fault::Protocol(err.to_string())
        }
    }
}

pub fn counts_to_volts(count: u16) -> f64 {
    count as f64 * ADC_REFERENCE_VOLTS / ADC_FULL_SCALE
}

pub struct SweepDriver<O: PortOpener> {
    opener: O,
    link: Option<O::Link>,
    state: DriverState,
    plan: Option<SweepPlan>,
    calibration: Option<CalibrationCurve>,
    amplitude: u16,
    settle_delay: Duration,
}

impl<O: PortOpener> SweepDriver<O> {
    /// Open the link and verify the board answers the handshake.
    pub fn connect(opener: O) -> Result<Self, SweepError> {
        let mut driver = Self::disconnected(opener);
        driver.open_link().map_err(|e| SweepError::Connection(fault_text(&e)))?;
        Ok(driver)
    }

    /// A driver with no link yet; the first scan attempts to connect.
    pub fn disconnected(opener: O) -> Self {
        Self {
            opener,
            link: None,
            state: DriverState::Disconnected,
            plan: None,
            calibration: None,
            amplitude: DEFAULT_AMPLITUDE,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    pub fn with_amplitude(mut self, amplitude: u16) -> Self {
        self.amplitude = amplitude;
        self
    }

    pub fn state(&self) -> DriverState {
        self.state
    }

    pub fn plan(&self) -> Option<&SweepPlan> {
        self.plan.as_ref()
    }

    pub fn calibration(&self) -> Option<&CalibrationCurve> {
        self.calibration.as_ref()
    }

    pub fn firmware_version(&mut self) -> Result<String, SweepError> {
        self.ensure_open()?;
        match self.exchange(&Command::Version) {
            Ok(Response::Version(v)) => Ok(v),
            Ok(other) => Err(SweepError::Protocol(format!(
                "unexpected reply to version query: {}",
                other.summary()
            ))),
            Err(fault) => Err(self.recover(fault)),
        }
    }

    fn link_mut(&mut self) -> Result<&mut O::Link, Fault> {
        self.link
            .as_mut()
            .ok_or_else(|| Fault::Link("link is not open".into()))
    }

    fn exchange(&mut self, cmd: &Command) -> Result<Response, Fault> {
        let link = self.link_mut()?;
        write_command(link, cmd)?;
        Ok(read_response(link)?)
    }

    fn send_expect_ok(&mut self, cmd: &Command) -> Result<(), Fault> {
        match self.exchange(cmd)? {
            Response::Ok => Ok(()),
            Response::Error(code) => Err(Fault::DeviceConfig(format!(
                "device rejected {cmd:?} with error code {code}"
            ))),
            other => Err(Fault::Protocol(format!(
                "unexpected reply to {cmd:?}: {}",
                other.summary()
            ))),
        }
    }

    fn handshake(&mut self) -> Result<bool, Fault> {
        match self.exchange(&Command::Handshake(HANDSHAKE_CHALLENGE))? {
            Response::HandshakeEcho(v) => Ok(v == HANDSHAKE_CHALLENGE),
            _ => Ok(false),
        }
    }

    fn open_link(&mut self) -> Result<(), Fault> {
        let link = self
            .opener
            .open()
            .map_err(|e| Fault::Link(format!("{}: {e}", self.opener.describe())))?;
        self.link = Some(link);
        if !self.handshake()? {
            self.drop_link();
            return Err(Fault::Link(format!(
                "{} failed the handshake",
                self.opener.describe()
            )));
        }
        self.state = DriverState::Idle;
        log::info!("connected to {}", self.opener.describe());
        Ok(())
    }

    fn drop_link(&mut self) {
        if let Some(link) = self.link.take() {
            self.opener.release(link);
        }
    }

    fn ensure_open(&mut self) -> Result<(), SweepError> {
        match self.state {
            DriverState::Closed => Err(SweepError::Closed),
            _ if self.link.is_some() => Ok(()),
            _ => {
                self.state = DriverState::Reconnecting;
                self.reconnect().map_err(|e| {
                    self.state = DriverState::Disconnected;
                    SweepError::Connection(e)
                })
            }
        }
    }

    /// Close and reopen the same physical port, then restore the configuration.
    fn reconnect(&mut self) -> Result<(), String> {
        self.state = DriverState::Reconnecting;
        self.drop_link();
        log::warn!("reconnecting to {}", self.opener.describe());
        self.open_link().map_err(|f| fault_text(&f))?;
        if let Some(plan) = self.plan {
            self.write_config(&plan).map_err(|f| fault_text(&f))?;
        }
        self.state = DriverState::Idle;
        Ok(())
    }

    fn hard_reset(&mut self) {
        if let Ok(link) = self.link_mut() {
            if let Err(e) = write_command(link, &Command::Reset) {
                log::warn!("reset command failed on {}: {e}", self.opener.describe());
            }
        }
        self.drop_link();
        thread::sleep(self.settle_delay);
    }

    fn recover(&mut self, fault: Fault) -> SweepError {
        match fault {
            Fault::Link(cause) => {
                log::warn!("link failure on {}: {cause}", self.opener.describe());
                match self.reconnect() {
                    Ok(()) => SweepError::Reconnected(cause),
                    Err(e) => {
                        self.state = DriverState::Disconnected;
                        SweepError::Connection(format!("{cause}; reconnect failed: {e}"))
                    }
                }
            }
            Fault::DeviceConfig(cause) => {
                log::warn!("device configuration failed, resetting: {cause}");
                self.hard_reset();
                match self.reconnect() {
                    Ok(()) => SweepError::Reconnected(cause),
                    Err(e) => {
                        self.state = DriverState::Disconnected;
                        SweepError::HardwareFault(format!("{cause}; reset recovery failed: {e}"))
                    }
                }
            }
            Fault::Protocol(cause) => {
                log::warn!("protocol error on {}: {cause}", self.opener.describe());
                self.resync();
                self.state = DriverState::Idle;
                SweepError::Protocol(cause)
            }
        }
    }

    /// Discard what the board still has queued from a failed exchange, up to
    /// its closing `Ok` or a read timeout, so the next command starts clean.
    fn resync(&mut self) {
        let Ok(link) = self.link_mut() else {
            return;
        };
        let mut discarded = 0;
        while discarded < RESYNC_FRAME_LIMIT {
            match read_response(link) {
                Ok(Response::Ok) => break,
                Err(e) if e.is_link_failure() => break,
                Ok(_) | Err(_) => discarded += 1,
            }
        }
        log::debug!("resync discarded {discarded} frame(s)");
    }

    fn write_config(&mut self, plan: &SweepPlan) -> Result<(), Fault> {
        self.send_expect_ok(&Command::SetStartFreq(plan.start_hz()))?;
        self.send_expect_ok(&Command::SetStopFreq(plan.stop_hz()))?;
        self.send_expect_ok(&Command::SetNumPoints(plan.points))?;
        self.send_expect_ok(&Command::SetAmplitude(self.amplitude))
    }

    /// Runs one sweep and returns voltages with the leading artifact stripped.
    fn run_sweep(&mut self, plan: &SweepPlan) -> Result<(Vec<f64>, Vec<f64>), Fault> {
        self.write_config(plan)?;
        self.send_expect_ok(&Command::Wake)?;
        let link = self.link_mut()?;
        write_command(link, &Command::StartSweep)?;
        let mut counts: Vec<u16> = Vec::with_capacity(plan.points as usize);
        loop {
            match read_response(link)? {
                Response::SendData(samples) => counts.extend(samples),
                Response::Ok => break,
                other => {
                    return Err(Fault::Protocol(format!(
                        "unexpected response during sweep: {}",
                        other.summary()
                    )))
                }
            }
        }
        if counts.len() != plan.points as usize {
            return Err(Fault::Protocol(format!(
                "expected {} samples, received {}",
                plan.points,
                counts.len()
            )));
        }
        if let Err(fault) = self.send_expect_ok(&Command::Sleep) {
            log::debug!("sleep after sweep not acknowledged: {fault:?}");
        }
        let frequencies: Vec<f64> = plan
            .frequencies()
            .into_iter()
            .skip(LEADING_ARTIFACT_POINTS)
            .collect();
        let volts: Vec<f64> = counts
            .into_iter()
            .skip(LEADING_ARTIFACT_POINTS)
            .map(counts_to_volts)
            .collect();
        Ok((frequencies, volts))
    }

    fn sweep_with_recovery(
        &mut self,
        plan: SweepPlan,
        state: DriverState,
    ) -> Result<(Vec<f64>, Vec<f64>), SweepError> {
        self.ensure_open()?;
        self.state = state;
        match self.run_sweep(&plan) {
            Ok(result) => {
                self.state = DriverState::Idle;
                Ok(result)
            }
            Err(fault) => Err(self.recover(fault)),
        }
    }
}

fn fault_text(fault: &Fault) -> String {
    match fault {
        Fault::Link(s) | Fault::DeviceConfig(s) | Fault::Protocol(s) => s.clone(),
    }
}

impl<O: PortOpener> SweepDevice for SweepDriver<O> {
    fn configure(&mut self, start_mhz: f64, stop_mhz: f64) -> Result<(), SweepError> {
        if self.state == DriverState::Closed {
            return Err(SweepError::Closed);
        }
        self.plan = Some(SweepPlan::scan(start_mhz, stop_mhz)?);
        Ok(())
    }

    fn take_scan(&mut self) -> Result<SweepSample, SweepError> {
        let plan = self.plan.ok_or_else(|| {
            SweepError::ConfigurationInvalid("take_scan called before configure".into())
        })?;
        let (frequencies, volts) = self.sweep_with_recovery(plan, DriverState::Sweeping)?;
        let magnitudes = match &self.calibration {
            Some(curve) => curve.normalize(&frequencies, &volts),
            None => {
                log::warn!("no calibration loaded for {}; using raw volts", self.opener.describe());
                volts
            }
        };
        SweepSample::new(frequencies, magnitudes).map_err(|e| SweepError::Protocol(e.to_string()))
    }

    fn take_calibration_scan(&mut self) -> Result<CalibrationCurve, SweepError> {
        let plan = SweepPlan::calibration();
        let (frequencies, volts) =
            self.sweep_with_recovery(plan, DriverState::CalibratingSweep)?;
        let curve =
            CalibrationCurve::new(frequencies, volts).map_err(|e| SweepError::Protocol(e.to_string()))?;
        self.calibration = Some(curve.clone());
        Ok(curve)
    }

    fn perform_handshake(&mut self) -> Result<bool, SweepError> {
        self.ensure_open()?;
        self.handshake().map_err(|fault| self.recover(fault))
    }

    fn load_calibration(&mut self, curve: CalibrationCurve) {
        self.calibration = Some(curve);
    }

    fn close(&mut self) {
        if self.state == DriverState::Closed {
            return;
        }
        if self.link.is_some() {
            if let Err(fault) = self.send_expect_ok(&Command::Sleep) {
                log::debug!("sleep on close not acknowledged: {fault:?}");
            }
        }
        self.drop_link();
        self.state = DriverState::Closed;
        log::info!("closed {}", self.opener.describe());
    }
}

impl<O: PortOpener> Drop for SweepDriver<O> {
    fn drop(&mut self) {
        self.drop_link();
    }
}
