pub mod contamination;
pub mod harvest;

pub use contamination::ContaminationDetector;
pub use harvest::{HarvestPhase, HarvestPredictor};
