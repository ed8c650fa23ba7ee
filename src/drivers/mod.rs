// src/drivers/mod.rs
pub mod error;
pub mod port;
pub mod protocol;
pub mod source;
pub mod sweep;

pub use error::{AnalysisError, FitError, ProtocolError, SeriesError, SweepError};
pub use port::{find_port_by_serial, list_device_serials, PortOpener, SerialOpener};
pub use source::{
    CalibrationCurve, ReplayDevice, SweepDevice, SweepPlan, SweepSample, SyntheticDevice,
};
pub use sweep::{DriverState, SweepDriver};
