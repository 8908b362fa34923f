pub mod gap;
pub mod report;

pub use gap::{GapDetector, GapPlan, HardGapRecord, SoftStallObservation};
pub use report::QualityReport;
