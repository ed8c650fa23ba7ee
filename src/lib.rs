// src/lib.rs
pub mod analysis;
pub mod config;
pub mod drivers;
pub mod engine;
pub mod predict;
pub mod recorder;
pub mod series;
pub mod types;

pub use config::ExperimentConfig;
pub use engine::{spawn_reader, ReaderHandle, ReaderLoop, ScanOutcome};
pub use series::{ResultPoint, ResultSeries};
pub use types::{ConnectionMode, ReaderCommand, ReaderEvent, ReaderStatus};
