//! SQLite window store behaviour against a real database file.

use std::collections::BTreeMap;
use std::sync::{mpsc, Arc};
use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;
use sensorwatch::detect::statistical::StatisticalDetector;
use sensorwatch::enrich::{ContextCorpus, Enricher};
use sensorwatch::retry::RetryPolicy;
use sensorwatch::storage::{MemoryWindowStore, SqliteWindowStore, WindowPoint, WindowStore};
use sensorwatch::{DetectError, SensorRecord};

fn point(i: i64, value: f64) -> WindowPoint {
    WindowPoint::new(Utc.timestamp_opt(1_700_000_000 + i, 0).unwrap(), value)
}

fn values(points: &[WindowPoint]) -> Vec<f64> {
    points.iter().map(|p| p.value).collect()
}

#[tokio::test]
async fn test_exchange_returns_prior_window_and_trims() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteWindowStore::open(dir.path().join("w.db"), 3).unwrap();

    assert!(store.exchange("P1", point(0, 1.0)).await.unwrap().is_empty());
    assert_eq!(values(&store.exchange("P1", point(1, 2.0)).await.unwrap()), vec![1.0]);
    store.append("P1", point(2, 3.0)).await.unwrap();
    assert_eq!(
        values(&store.exchange("P1", point(3, 4.0)).await.unwrap()),
        vec![1.0, 2.0, 3.0]
    );
    assert_eq!(values(&store.read("P1").await.unwrap()), vec![2.0, 3.0, 4.0]);

    let window = store.read("P1").await.unwrap();
    assert_eq!(window[0].timestamp, Utc.timestamp_opt(1_700_000_001, 0).unwrap());
}

#[tokio::test]
async fn test_windows_persist_across_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("w.db");
    {
        let store = SqliteWindowStore::open(&path, 10).unwrap();
        for i in 0..4 {
            store.append("T7", point(i, i as f64)).await.unwrap();
        }
    }
    let store = SqliteWindowStore::open(&path, 10).unwrap();
    assert_eq!(values(&store.read("T7").await.unwrap()), vec![0.0, 1.0, 2.0, 3.0]);
}

#[tokio::test]
async fn test_clear_and_lengths_by_pattern() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteWindowStore::open(dir.path().join("w.db"), 10).unwrap();
    for key in ["P1", "P2", "T1"] {
        store.append(key, point(0, 1.0)).await.unwrap();
        store.append(key, point(1, 2.0)).await.unwrap();
    }

    let lengths = store.lengths("P*").await.unwrap();
    assert_eq!(lengths.len(), 2);
    assert_eq!(lengths["P1"], 2);

    assert_eq!(store.clear("P*").await.unwrap(), 2);
    assert_eq!(store.clear("P*").await.unwrap(), 0);
    let remaining = store.lengths("*").await.unwrap();
    assert_eq!(remaining.keys().collect::<Vec<_>>(), vec!["T1"]);
}

#[tokio::test]
async fn test_invalid_pattern_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteWindowStore::open(dir.path().join("w.db"), 10).unwrap();
    assert!(matches!(
        store.clear("[").await,
        Err(DetectError::InvalidPattern { .. })
    ));
}

#[test]
fn test_zero_capacity_rejected() {
    let dir = tempfile::tempdir().unwrap();
    assert!(matches!(
        SqliteWindowStore::open(dir.path().join("w.db"), 0),
        Err(DetectError::Configuration(_))
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_exchanges_see_distinct_histories() {
    let dir = tempfile::tempdir().unwrap();
    let store = std::sync::Arc::new(SqliteWindowStore::open(dir.path().join("w.db"), 100).unwrap());

    let tasks: Vec<_> = (0..20)
        .map(|i| {
            let store = store.clone();
            tokio::spawn(async move { store.exchange("P1", point(i, i as f64)).await.unwrap().len() })
        })
        .collect();

    let mut seen = Vec::new();
    for t in tasks {
        seen.push(t.await.unwrap());
    }
    seen.sort_unstable();
    // Each exchange observed a different prior length: no lost or doubled appends.
    assert_eq!(seen, (0..20).collect::<Vec<_>>());
}

fn detector(store: SqliteWindowStore, retry: RetryPolicy) -> StatisticalDetector {
    StatisticalDetector::new(
        Arc::new(store),
        Arc::new(Enricher::without_summaries(ContextCorpus::default())),
        4,
        retry,
    )
}

fn record(pairs: &[(&str, f64)]) -> SensorRecord {
    let data: BTreeMap<String, f64> = pairs.iter().map(|(k, v)| (k.to_string(), *v)).collect();
    SensorRecord::new(Utc.timestamp_opt(1_700_000_000, 0).unwrap(), data)
}

#[tokio::test]
async fn test_locked_database_retries_append_exactly_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("w.db");
    let store = SqliteWindowStore::open_with_timeout(&path, 100, Duration::from_millis(200)).unwrap();

    // Another writer holds the database past the store's lock timeout.
    let (locked_tx, locked_rx) = mpsc::channel();
    let holder_path = path.clone();
    let holder = std::thread::spawn(move || {
        let conn = rusqlite::Connection::open(holder_path).unwrap();
        conn.execute_batch("BEGIN IMMEDIATE").unwrap();
        locked_tx.send(()).unwrap();
        std::thread::sleep(Duration::from_millis(500));
        conn.execute_batch("COMMIT").unwrap();
    });
    locked_rx.recv().unwrap();

    let detector = detector(
        store.clone(),
        RetryPolicy {
            max_attempts: 10,
            base_delay_ms: 50,
            max_delay_ms: 100,
        },
    );
    let results = detector.evaluate(&record(&[("P1", 42.0)])).await.unwrap();
    assert!(results["P1"].alarm_type.is_ok());
    holder.join().unwrap();

    // Failed attempts rolled back; only the successful one appended.
    assert_eq!(values(&store.read("P1").await.unwrap()), vec![42.0]);
}

#[tokio::test]
async fn test_failed_record_leaves_no_partial_windows() {
    let dir = tempfile::tempdir().unwrap();
    let store = SqliteWindowStore::open(dir.path().join("w.db"), 10).unwrap();
    let detector = detector(store.clone(), RetryPolicy::none());

    // NaN binds as NULL and violates the schema on the second sensor.
    assert!(detector
        .evaluate(&record(&[("A", 1.0), ("B", f64::NAN)]))
        .await
        .is_err());
    assert!(store.lengths("*").await.unwrap().is_empty());

    let mut batch = BTreeMap::new();
    batch.insert("A".to_string(), point(1, 1.0));
    batch.insert("B".to_string(), point(1, f64::NAN));
    assert!(store.exchange_batch(&batch).await.is_err());
    assert!(store.read("A").await.unwrap().is_empty());
}

#[tokio::test]
async fn test_negated_class_matches_across_stores() {
    let dir = tempfile::tempdir().unwrap();
    let sqlite = SqliteWindowStore::open(dir.path().join("w.db"), 10).unwrap();
    let memory = MemoryWindowStore::new(10).unwrap();
    let stores: [&dyn WindowStore; 2] = [&sqlite, &memory];

    for store in stores {
        store.append("P1", point(0, 1.0)).await.unwrap();
        store.append("T1", point(0, 1.0)).await.unwrap();
        assert_eq!(store.lengths("[!P]*").await.unwrap().len(), 1);
        assert_eq!(store.clear("[!P]*").await.unwrap(), 1);
        let remaining = store.lengths("*").await.unwrap();
        assert_eq!(remaining.keys().collect::<Vec<_>>(), vec!["P1"]);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn prop_window_keeps_most_recent_capacity_points(
        capacity in 1usize..8,
        writes in proptest::collection::vec(-1e6f64..1e6, 0..30),
    ) {
        let dir = tempfile::tempdir().unwrap();
        let store = SqliteWindowStore::open(dir.path().join("w.db"), capacity).unwrap();

        let window = tokio_test::block_on(async {
            for (i, v) in writes.iter().enumerate() {
                store.append("S", point(i as i64, *v)).await.unwrap();
            }
            store.read("S").await.unwrap()
        });

        let start = writes.len().saturating_sub(capacity);
        prop_assert_eq!(values(&window), writes[start..].to_vec());
    }
}
