//! Anomaly detection stages and the engine that sequences them.

pub mod engine;
pub mod model;
pub mod statistical;
pub mod threshold;

pub use engine::{DetectionEngine, HealthReport, PipelineReport};

use std::collections::BTreeMap;

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectError {
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("missing required features: {missing:?}")]
    MissingFeatures { missing: Vec<String> },

    #[error("{dependency} timed out after {timeout_ms}ms")]
    DependencyTimeout {
        dependency: &'static str,
        timeout_ms: u64,
    },

    #[error("{dependency} unavailable after {attempts} attempts: {reason}")]
    DependencyUnavailable {
        dependency: &'static str,
        attempts: u32,
        reason: String,
    },

    #[error("invalid key pattern '{pattern}': {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("summarizer error: {0}")]
    Summarizer(String),

    /// The summarizer refused the request itself; retrying cannot help.
    #[error("summarizer rejected request: {0}")]
    SummarizerRejected(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error("connection pool error: {0}")]
    Pool(#[from] r2d2::Error),

    #[error("background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl DetectError {
    /// Whether retrying the same call may succeed.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DetectError::DependencyTimeout { .. }
                | DetectError::Summarizer(_)
                | DetectError::Storage(_)
                | DetectError::Pool(_)
                | DetectError::Task(_)
        )
    }
}

/// Alarm class, encoding direction and severity of a deviation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AlarmClass {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "Low")]
    Low,
    #[serde(rename = "Low-Low")]
    LowLow,
    #[serde(rename = "High")]
    High,
    #[serde(rename = "High-High")]
    HighHigh,
}

impl AlarmClass {
    /// Label used by the context corpus and in reports.
    pub fn label(&self) -> &'static str {
        match self {
            AlarmClass::Ok => "OK",
            AlarmClass::Low => "Low",
            AlarmClass::LowLow => "Low-Low",
            AlarmClass::High => "High",
            AlarmClass::HighHigh => "High-High",
        }
    }

    pub fn is_ok(&self) -> bool {
        matches!(self, AlarmClass::Ok)
    }

    pub fn status(&self) -> Status {
        if self.is_ok() {
            Status::Normal
        } else {
            Status::Anomaly
        }
    }
}

impl std::fmt::Display for AlarmClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.label())
    }
}

/// User-visible outcome of one evaluation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Normal,
    Anomaly,
    Error,
}

impl std::fmt::Display for Status {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Status::Normal => write!(f, "Normal"),
            Status::Anomaly => write!(f, "Anomaly"),
            Status::Error => write!(f, "Error"),
        }
    }
}

/// One multi-variable reading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorRecord {
    #[serde(deserialize_with = "deserialize_timestamp")]
    pub timestamp: DateTime<Utc>,
    pub data: BTreeMap<String, f64>,
}

impl SensorRecord {
    pub fn new(timestamp: DateTime<Utc>, data: BTreeMap<String, f64>) -> Self {
        Self { timestamp, data }
    }
}

/// Accepts RFC 3339 timestamps and offset-less ISO-8601 timestamps (read as UTC).
fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<DateTime<Utc>, D::Error>
where
    D: Deserializer<'de>,
{
    let raw = String::deserialize(deserializer)?;
    parse_timestamp(&raw).map_err(serde::de::Error::custom)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, String> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| format!("invalid timestamp '{}': {}", raw, e))
}

/// Per-variable classification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmResult {
    pub value: f64,
    pub alarm_type: AlarmClass,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
}

impl AlarmResult {
    pub fn new(value: f64, alarm_type: AlarmClass) -> Self {
        Self {
            value,
            alarm_type,
            status: alarm_type.status(),
            context: None,
        }
    }

    pub fn is_anomaly(&self) -> bool {
        self.status == Status::Anomaly
    }
}

/// Which stage produced a report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    Heuristic,
    Statistical,
    Ml,
}

impl std::fmt::Display for DetectionMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DetectionMethod::Heuristic => write!(f, "heuristic"),
            DetectionMethod::Statistical => write!(f, "statistical"),
            DetectionMethod::Ml => write!(f, "ml"),
        }
    }
}

impl std::str::FromStr for DetectionMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "heuristic" | "threshold" => Ok(DetectionMethod::Heuristic),
            "statistical" => Ok(DetectionMethod::Statistical),
            "ml" | "model" => Ok(DetectionMethod::Ml),
            other => Err(format!("unknown detection method '{}'", other)),
        }
    }
}

/// Aggregate result of the model stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelResult {
    pub values: BTreeMap<String, f64>,
    pub status: Status,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reconstruction_error: Option<f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_features: Vec<String>,
}

/// Stage output carried by a [`DetectionReport`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Findings {
    PerVariable(BTreeMap<String, AlarmResult>),
    Aggregate(ModelResult),
}

impl Findings {
    pub fn status(&self) -> Status {
        match self {
            Findings::PerVariable(results) => {
                if results.values().any(AlarmResult::is_anomaly) {
                    Status::Anomaly
                } else {
                    Status::Normal
                }
            }
            Findings::Aggregate(result) => result.status,
        }
    }
}

/// Timed output of a single stage.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionReport {
    pub timestamp: DateTime<Utc>,
    pub method: DetectionMethod,
    pub results: Findings,
    pub processing_time_ms: f64,
}

impl DetectionReport {
    pub fn status(&self) -> Status {
        self.results.status()
    }
}
