// src/types.rs
use crate::predict::harvest::HarvestPhase;

/// Where a reader's sweeps come from.
#[derive(PartialEq, Clone, Copy, Debug)]
pub enum ConnectionMode {
    Simulation,
    Hardware,
}

/// Commands sent to a running reader.
#[derive(Clone, Debug, PartialEq)]
pub enum ReaderCommand {
    /// Take a calibration sweep before the next scan.
    Calibrate,
    /// Keep only the latest point and start a fresh measurement epoch.
    ResetRun,
    Stop,
}

/// Messages a reader sends back to whoever is listening.
#[derive(Clone, Debug, PartialEq)]
pub enum ReaderEvent {
    Log { reader: String, message: String },
    Status(ReaderStatus),
    ScanFailed { reader: String, time_hours: f64, reason: String },
    IntervalIncreased { reader: String, interval_secs: f64 },
    ZeroPointSet { reader: String, frequency_mhz: f64 },
    Harvested { reader: String, predicted_hours: f64 },
    Contaminated { reader: String, time_hours: f64 },
    /// Reader-level problem an operator should look at.
    Issue { reader: String, message: String },
    CalibrationComplete { reader: String, points: usize },
    Stopped { reader: String },
}

impl ReaderEvent {
    pub fn reader(&self) -> &str {
        match self {
            ReaderEvent::Status(status) => &status.reader,
            ReaderEvent::Log { reader, .. }
            | ReaderEvent::ScanFailed { reader, .. }
            | ReaderEvent::IntervalIncreased { reader, .. }
            | ReaderEvent::ZeroPointSet { reader, .. }
            | ReaderEvent::Harvested { reader, .. }
            | ReaderEvent::Contaminated { reader, .. }
            | ReaderEvent::Issue { reader, .. }
            | ReaderEvent::CalibrationComplete { reader, .. }
            | ReaderEvent::Stopped { reader } => reader,
        }
    }
}

/// Snapshot sent after every cycle.
#[derive(Clone, Debug, PartialEq)]
pub struct ReaderStatus {
    pub reader: String,
    pub mode: ConnectionMode,
    pub time_hours: f64,
    pub points: usize,
    pub failed_points: usize,
    pub latest_frequency_mhz: Option<f64>,
    pub growth_index: Option<f64>,
    pub harvest_phase: HarvestPhase,
    pub predicted_harvest_hours: Option<f64>,
    pub harvested: bool,
    pub contaminated: bool,
}
