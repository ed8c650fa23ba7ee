// src/analysis/mod.rs
pub mod denoise;
pub mod fit;
pub mod linalg;
pub mod peak;
pub mod smoothing;
pub mod stats;

pub use denoise::denoise;
pub use fit::{fit_gaussian, Gaussian, GaussianBounds, GaussianFit};
pub use peak::{find_peak, Analyzer, FixtureAnalyzer, GaussianPeakAnalyzer, Peak, PeakReading};
pub use smoothing::SavitzkyGolay;
