//! Adaptive IQR outlier detection over each sensor's recent history.
//!
//! Every variable is its own series. A point is classified against the
//! window as it stood *before* that point arrived, and then becomes part of
//! the window. All points of one record go to the store as one atomic
//! `exchange_batch`: concurrent writers cannot interleave, and a failed
//! record leaves no trace in any window.

use std::collections::BTreeMap;
use std::sync::Arc;

use futures::future::join_all;
use tracing::debug;

use super::{AlarmClass, AlarmResult, DetectError, SensorRecord};
use crate::analysis::stats::IqrBand;
use crate::enrich::Enricher;
use crate::retry::RetryPolicy;
use crate::storage::{WindowPoint, WindowStore};

pub const DEFAULT_MIN_DATA_POINTS: usize = 4;

/// Classify `value` against prior history. Fewer than `min_data_points`
/// prior points is always OK.
pub fn classify_against(previous: &[f64], value: f64, min_data_points: usize) -> AlarmClass {
    if previous.len() < min_data_points {
        return AlarmClass::Ok;
    }
    match IqrBand::from_history(previous) {
        Some(band) => band.classify(value),
        None => AlarmClass::Ok,
    }
}

pub struct StatisticalDetector {
    store: Arc<dyn WindowStore>,
    enricher: Arc<Enricher>,
    min_data_points: usize,
    retry: RetryPolicy,
}

impl StatisticalDetector {
    /// Store calls are bounded by the store itself; `retry` only re-issues
    /// calls that failed without committing.
    pub fn new(
        store: Arc<dyn WindowStore>,
        enricher: Arc<Enricher>,
        min_data_points: usize,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            store,
            enricher,
            min_data_points,
            retry,
        }
    }

    pub fn store(&self) -> &Arc<dyn WindowStore> {
        &self.store
    }

    pub fn min_data_points(&self) -> usize {
        self.min_data_points
    }

    /// Evaluate every variable of `record`. A store failure fails the whole
    /// evaluation and appends nothing; it is never reported as OK.
    pub async fn evaluate(
        &self,
        record: &SensorRecord,
    ) -> Result<BTreeMap<String, AlarmResult>, DetectError> {
        let points: BTreeMap<String, WindowPoint> = record
            .data
            .iter()
            .map(|(sensor, &value)| (sensor.clone(), WindowPoint::new(record.timestamp, value)))
            .collect();
        if points.is_empty() {
            return Ok(BTreeMap::new());
        }

        let previous = self
            .retry
            .run("window_store", || self.store.exchange_batch(&points))
            .await?;

        let classified: Vec<(&String, f64, AlarmClass)> = points
            .iter()
            .map(|(sensor, point)| {
                let history: Vec<f64> = previous
                    .get(sensor)
                    .map(|w| w.iter().map(|p| p.value).collect())
                    .unwrap_or_default();
                let class = classify_against(&history, point.value, self.min_data_points);
                debug!(%sensor, value = point.value, history = history.len(), alarm = %class, "Classified point");
                (sensor, point.value, class)
            })
            .collect();

        let results = join_all(classified.into_iter().map(|(sensor, value, class)| async move {
            let mut result = AlarmResult::new(value, class);
            if !class.is_ok() {
                result.context = Some(self.enricher.context_for(sensor, class).await);
            }
            (sensor.clone(), result)
        }))
        .await;

        Ok(results.into_iter().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::detect::Status;
    use crate::enrich::ContextCorpus;
    use crate::storage::MemoryWindowStore;
    use chrono::{TimeZone, Utc};

    fn detector(store: Arc<dyn WindowStore>) -> StatisticalDetector {
        StatisticalDetector::new(
            store,
            Arc::new(Enricher::without_summaries(ContextCorpus::default())),
            DEFAULT_MIN_DATA_POINTS,
            RetryPolicy::none(),
        )
    }

    fn record(i: i64, pairs: &[(&str, f64)]) -> SensorRecord {
        SensorRecord::new(
            Utc.timestamp_opt(1_700_000_000 + i, 0).unwrap(),
            pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
        )
    }

    #[test]
    fn test_warmup_is_always_ok() {
        assert_eq!(classify_against(&[], 1e12, 4), AlarmClass::Ok);
        assert_eq!(classify_against(&[1.0, 1.0, 1.0], -1e12, 4), AlarmClass::Ok);
        assert_eq!(classify_against(&[1.0, 1.0, 1.0, 1.0], -1e12, 4), AlarmClass::LowLow);
    }

    #[tokio::test]
    async fn test_first_points_are_ok_then_spike_detected() {
        let store = Arc::new(MemoryWindowStore::new(100).unwrap());
        let det = detector(store.clone());

        for (i, v) in [10.0, 12.0, 14.0, 16.0].iter().enumerate() {
            let out = det.evaluate(&record(i as i64, &[("P1", *v)])).await.unwrap();
            assert_eq!(out["P1"].alarm_type, AlarmClass::Ok);
        }

        let out = det.evaluate(&record(5, &[("P1", 100.0)])).await.unwrap();
        assert_eq!(out["P1"].alarm_type, AlarmClass::HighHigh);
        assert_eq!(out["P1"].status, Status::Anomaly);
        // Lookup miss -> empty context, not an error.
        assert_eq!(out["P1"].context.as_deref(), Some(""));

        // The spike is now part of the window.
        assert_eq!(store.read("P1").await.unwrap().len(), 5);
    }

    #[tokio::test]
    async fn test_point_never_classified_against_itself() {
        let store = Arc::new(MemoryWindowStore::new(100).unwrap());
        let det = detector(store);
        for (i, v) in [5.0, 5.0, 5.0, 5.0].iter().enumerate() {
            det.evaluate(&record(i as i64, &[("P1", *v)])).await.unwrap();
        }
        // Against [5,5,5,5], 6 is beyond max; were 6 in its own history it
        // would only be High.
        let out = det.evaluate(&record(9, &[("P1", 6.0)])).await.unwrap();
        assert_eq!(out["P1"].alarm_type, AlarmClass::HighHigh);
    }

    #[tokio::test]
    async fn test_sensors_have_independent_windows() {
        let store = Arc::new(MemoryWindowStore::new(100).unwrap());
        let det = detector(store.clone());
        for i in 0..4 {
            det.evaluate(&record(i, &[("A", 1.0)])).await.unwrap();
        }
        let out = det
            .evaluate(&record(10, &[("A", 50.0), ("B", 50.0)]))
            .await
            .unwrap();
        assert_eq!(out["A"].alarm_type, AlarmClass::HighHigh);
        assert_eq!(out["B"].alarm_type, AlarmClass::Ok);
        assert_eq!(store.read("B").await.unwrap().len(), 1);
    }
}
