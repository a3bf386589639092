//! Static four-level rule thresholds.
//!
//! Boundaries are deliberately asymmetric: `Low` and `High` themselves are
//! OK, while `LowLow` is the first value that is only `Low`.
//!
//! ```text
//! value <  LowLow            -> Low-Low
//! LowLow <= value < Low      -> Low
//! Low <= value <= High       -> OK
//! High < value <= HighHigh   -> High
//! value >  HighHigh          -> High-High
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use super::{AlarmClass, AlarmResult, DetectError, SensorRecord};
use crate::enrich::Enricher;

/// Four alarm limits for one variable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Limits {
    #[serde(rename = "Low-Low")]
    pub low_low: f64,
    #[serde(rename = "Low")]
    pub low: f64,
    #[serde(rename = "High")]
    pub high: f64,
    #[serde(rename = "High-High")]
    pub high_high: f64,
}

impl Limits {
    pub fn new(low_low: f64, low: f64, high: f64, high_high: f64) -> Self {
        Self {
            low_low,
            low,
            high,
            high_high,
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.low_low <= self.low && self.low <= self.high && self.high <= self.high_high
    }

    /// Order-sensitive; the first matching rule wins.
    pub fn classify(&self, value: f64) -> AlarmClass {
        if value < self.low_low {
            AlarmClass::LowLow
        } else if value < self.low {
            AlarmClass::Low
        } else if value <= self.high {
            AlarmClass::Ok
        } else if value <= self.high_high {
            AlarmClass::High
        } else {
            AlarmClass::HighHigh
        }
    }
}

pub type ThresholdSet = HashMap<String, Limits>;

/// Load a threshold set from JSON. A missing, unreadable or empty file is a
/// configuration error.
pub fn load_thresholds(path: impl AsRef<Path>) -> Result<ThresholdSet, DetectError> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path).map_err(|e| {
        DetectError::Configuration(format!("could not read thresholds {}: {}", path.display(), e))
    })?;
    let set: ThresholdSet = serde_json::from_str(&content).map_err(|e| {
        DetectError::Configuration(format!("invalid thresholds {}: {}", path.display(), e))
    })?;
    info!(path = %path.display(), variables = set.len(), "Loaded thresholds");
    Ok(set)
}

/// Classify every variable in `record`.
///
/// Variables without limits are reported as OK/Normal. Limits for variables
/// absent from the record produce nothing.
pub fn classify_record(
    record: &SensorRecord,
    thresholds: &ThresholdSet,
) -> BTreeMap<String, AlarmResult> {
    record
        .data
        .iter()
        .map(|(var, &value)| {
            let class = thresholds
                .get(var)
                .map_or(AlarmClass::Ok, |limits| limits.classify(value));
            (var.clone(), AlarmResult::new(value, class))
        })
        .collect()
}

pub struct ThresholdDetector {
    thresholds: ThresholdSet,
    enricher: Arc<Enricher>,
}

impl ThresholdDetector {
    pub fn new(thresholds: ThresholdSet, enricher: Arc<Enricher>) -> Result<Self, DetectError> {
        if thresholds.is_empty() {
            return Err(DetectError::Configuration(
                "threshold set is empty; refusing to classify against no limits".into(),
            ));
        }
        for (var, limits) in &thresholds {
            if !limits.is_ordered() {
                warn!(variable = %var, ?limits, "Threshold limits are not ordered LowLow <= Low <= High <= HighHigh");
            }
        }
        Ok(Self {
            thresholds,
            enricher,
        })
    }

    pub fn from_file(path: impl AsRef<Path>, enricher: Arc<Enricher>) -> Result<Self, DetectError> {
        Self::new(load_thresholds(path)?, enricher)
    }

    pub fn thresholds(&self) -> &ThresholdSet {
        &self.thresholds
    }

    /// Classify and attach context to every non-OK result.
    pub async fn evaluate(&self, record: &SensorRecord) -> BTreeMap<String, AlarmResult> {
        let mut results = classify_record(record, &self.thresholds);

        let pending: Vec<_> = results
            .iter()
            .filter(|(_, r)| !r.alarm_type.is_ok())
            .map(|(var, r)| (var.clone(), r.alarm_type))
            .collect();

        let contexts = join_all(pending.iter().map(|(var, class)| async move {
            (var, self.enricher.context_for(var, *class).await)
        }))
        .await;

        for (var, ctx) in contexts {
            if let Some(r) = results.get_mut(var) {
                r.context = Some(ctx);
            }
        }
        results
    }
}
