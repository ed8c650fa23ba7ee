// src/config.rs
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Debug, Error, PartialEq)]
pub enum ConfigError {
    #[error("no readers configured")]
    NoReaders,
    #[error("reader {name:?}: {reason}")]
    InvalidReader { name: String, reason: String },
    #[error("scan interval must be positive (got {0} s)")]
    InvalidInterval(f64),
}

/// Rolling-derivative parameters for `ResultSeries`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeriesConfig {
    pub derivative_window: usize,
    pub derivative_smoothing_window: usize,
    pub derivative_smoothing_order: usize,
}

impl Default for SeriesConfig {
    fn default() -> Self {
        Self {
            derivative_window: 10,
            derivative_smoothing_window: 51,
            derivative_smoothing_order: 2,
        }
    }
}

/// Harvest-time predictor tuning.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HarvestConfig {
    /// Derivative-mean points required before the first fit.
    pub min_points: usize,
    /// Harvest estimate is `centroid + k * sigma`.
    pub k: f64,
    pub r_squared_threshold: f64,
    /// Minimum distance of `(now, derivative)` from the line `y = x`.
    pub distance_threshold: f64,
    pub min_lead_hours: f64,
    pub max_lead_hours: f64,
    pub early_exclusion_hours: f64,
    /// Growth-index rate (%/h) that bypasses the timing gate.
    pub fast_growth_override: f64,
}

impl Default for HarvestConfig {
    fn default() -> Self {
        Self {
            min_points: 10,
            k: 2.0,
            r_squared_threshold: 0.9,
            distance_threshold: 1.0,
            min_lead_hours: 1.0,
            max_lead_hours: 12.0,
            early_exclusion_hours: 24.0,
            fast_growth_override: 5.0,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContaminationConfig {
    /// Points per slope window.
    pub window: usize,
    pub min_points: usize,
    /// Previous-window slopes at or below this (MHz/h) are treated as noise.
    pub slope_floor: f64,
    pub slope_ratio: f64,
    /// Contaminated once the consecutive count exceeds this.
    pub consecutive_limit: usize,
}

impl Default for ContaminationConfig {
    fn default() -> Self {
        Self {
            window: 5,
            min_points: 10,
            slope_floor: 1e-4,
            slope_ratio: 10.0,
            consecutive_limit: 4,
        }
    }
}

/// One physical (or simulated) reader.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReaderConfig {
    pub name: String,
    pub serial_number: String,
    pub start_mhz: f64,
    pub stop_mhz: f64,
    pub baud_rate: u32,
    pub timeout_ms: u64,
}

impl Default for ReaderConfig {
    fn default() -> Self {
        Self {
            name: "reader-1".to_owned(),
            serial_number: String::new(),
            start_mhz: 5.0,
            stop_mhz: 6.5,
            baud_rate: 115_200,
            timeout_ms: 2_000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    pub output_dir: PathBuf,
    pub scan_interval_secs: f64,
    pub equilibration_hours: f64,
    pub max_connection_failures: usize,
    pub readers: Vec<ReaderConfig>,
    pub series: SeriesConfig,
    pub harvest: HarvestConfig,
    pub contamination: ContaminationConfig,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            output_dir: PathBuf::from("data"),
            scan_interval_secs: 300.0,
            equilibration_hours: 1.0,
            max_connection_failures: 5,
            readers: vec![ReaderConfig::default()],
            series: SeriesConfig::default(),
            harvest: HarvestConfig::default(),
            contamination: ContaminationConfig::default(),
        }
    }
}

impl ExperimentConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: Self = serde_json::from_str(&text)
            .with_context(|| format!("parsing config {}", path.display()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.scan_interval_secs > 0.0) {
            return Err(ConfigError::InvalidInterval(self.scan_interval_secs));
        }
        if self.readers.is_empty() {
            return Err(ConfigError::NoReaders);
        }
        for reader in &self.readers {
            if reader.name.trim().is_empty() {
                return Err(ConfigError::InvalidReader {
                    name: reader.name.clone(),
                    reason: "name is empty".to_owned(),
                });
            }
            if !(reader.start_mhz < reader.stop_mhz) {
                return Err(ConfigError::InvalidReader {
                    name: reader.name.clone(),
                    reason: format!(
                        "start {} MHz is not below stop {} MHz",
                        reader.start_mhz, reader.stop_mhz
                    ),
                });
            }
        }
        Ok(())
    }

    /// Per-reader output directory.
    pub fn reader_dir(&self, reader: &ReaderConfig) -> PathBuf {
        self.output_dir.join(&reader.name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn missing_fields_take_defaults() {
        let config: ExperimentConfig =
            serde_json::from_str(r#"{ "scan_interval_secs": 60, "harvest": { "k": 1.5 } }"#)
                .unwrap();
        assert_eq!(config.scan_interval_secs, 60.0);
        assert_eq!(config.harvest.k, 1.5);
        assert_eq!(config.harvest.min_points, HarvestConfig::default().min_points);
        assert_eq!(config.series, SeriesConfig::default());
        assert_eq!(config.readers.len(), 1);
    }

    #[test]
    fn load_reads_and_validates_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{ "readers": [{{ "name": "a", "start_mhz": 6.0, "stop_mhz": 5.0 }}] }}"#
        )
        .unwrap();
        let err = ExperimentConfig::load(file.path()).unwrap_err();
        assert!(err.downcast_ref::<ConfigError>().is_some());
    }

    #[test]
    fn validate_rejects_empty_reader_list() {
        let config = ExperimentConfig {
            readers: Vec::new(),
            ..Default::default()
        };
        assert_eq!(config.validate(), Err(ConfigError::NoReaders));
    }
}
