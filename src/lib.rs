//! SensorWatch -- staged anomaly detection for industrial sensor streams.
//!
//! Records pass through static threshold rules, an adaptive IQR check over
//! each sensor's sliding window, and a PCA reconstruction-error model. Any
//! alarm is enriched with operator context (cause and recommended actions).

pub mod analysis;
pub mod config;
pub mod detect;
pub mod enrich;
pub mod ingest;
pub mod retry;
pub mod storage;

pub use config::Settings;
pub use detect::{
    AlarmClass, AlarmResult, DetectError, DetectionEngine, DetectionMethod, DetectionReport,
    PipelineReport, SensorRecord, Status,
};
