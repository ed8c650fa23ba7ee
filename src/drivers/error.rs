use std::io;
use thiserror::Error;

/// Framing / decoding failures on the serial wire.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("serial link failure: {0}")]
    Io(#[from] io::Error),
    #[error("bad frame sync byte 0x{0:02x}")]
    BadSync(u8),
    #[error("frame checksum mismatch: expected 0x{expected:02x}, got 0x{actual:02x}")]
    Checksum { expected: u8, actual: u8 },
    #[error("frame payload too long: {0} bytes")]
    PayloadTooLong(usize),
    #[error("malformed {what} payload ({len} bytes)")]
    Malformed { what: &'static str, len: usize },
    #[error("unrecognized response code 0x{0:02x}")]
    Unrecognized(u8),
}

impl ProtocolError {
    /// True when the failure came from the link itself (I/O error or timeout)
    /// rather than from the bytes the device sent.
    pub fn is_link_failure(&self) -> bool {
        matches!(self, ProtocolError::Io(_))
    }
}

#[derive(Debug, Error)]
pub enum SweepError {
    #[error("invalid sweep configuration: {0}")]
    ConfigurationInvalid(String),
    #[error("serial connection failed: {0}")]
    Connection(String),
    #[error("scan lost, link recovered after: {0}")]
    Reconnected(String),
    #[error("device fault, reset did not recover the link: {0}")]
    HardwareFault(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("driver is closed")]
    Closed,
    #[error("fixture data error: {0}")]
    Fixture(String),
}

#[derive(Debug, Error, PartialEq)]
pub enum FitError {
    #[error("not enough points to fit: need {needed}, got {actual}")]
    TooFewPoints { needed: usize, actual: usize },
    #[error("fit did not converge after {0} iterations")]
    NoConvergence(usize),
    #[error("singular normal equations")]
    Singular,
    #[error("non-finite values in fit input")]
    NonFinite,
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("sweep is empty")]
    EmptySweep,
    #[error("frequency/magnitude length mismatch: {frequencies} vs {magnitudes}")]
    LengthMismatch { frequencies: usize, magnitudes: usize },
    #[error("peak fit failed: {0}")]
    Fit(#[from] FitError),
    #[error("fixture analyzer exhausted")]
    FixtureExhausted,
}

#[derive(Debug, Error, PartialEq)]
pub enum SeriesError {
    #[error("time must be strictly increasing: last {last}, got {got}")]
    NonMonotonicTime { last: f64, got: f64 },
    #[error("zero point already set to {0}")]
    ZeroPointAlreadySet(f64),
    #[error("zero point must be a finite, non-zero frequency (got {0})")]
    InvalidZeroPoint(f64),
}
