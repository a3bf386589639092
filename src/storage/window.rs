//! Per-sensor bounded history.
//!
//! Every sensor id owns an ordered list of `(timestamp, value)` points, oldest
//! first, never longer than the store's capacity. Appends insert at the tail
//! and trim from the head in one atomic step per key. `exchange_batch`
//! additionally returns each window as it was before the append, so a caller
//! can classify a point against strictly prior history without a second round
//! trip. A batch covers every sensor of one record and commits all or nothing.
//!
//! Key patterns are shell-style globs (`*`, `?`, `[..]`, `[!..]`) and are
//! matched with [`glob::Pattern`] by every store.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, TransactionBehavior};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::Pool;
use crate::config::WindowConfig;
use crate::detect::DetectError;

pub const DEFAULT_WINDOW_SIZE: usize = 100;
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WindowPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

impl WindowPoint {
    pub fn new(timestamp: DateTime<Utc>, value: f64) -> Self {
        Self { timestamp, value }
    }
}

/// Shared windowed state used by the statistical detector.
///
/// Implementations bound their own calls: a call either completes or fails,
/// it is never left running after the caller gave up on it. That makes a
/// failed call safe to retry.
#[async_trait]
pub trait WindowStore: Send + Sync {
    /// Maximum number of points kept per sensor.
    fn capacity(&self) -> usize;

    /// Current window, oldest first.
    async fn read(&self, sensor_id: &str) -> Result<Vec<WindowPoint>, DetectError>;

    /// Append at the tail, then trim the head down to capacity.
    async fn append(&self, sensor_id: &str, point: WindowPoint) -> Result<(), DetectError>;

    /// Atomically read every window in `points` and append its point. Either
    /// all points are appended or none is. Returns each window as it was
    /// before the append.
    async fn exchange_batch(
        &self,
        points: &BTreeMap<String, WindowPoint>,
    ) -> Result<BTreeMap<String, Vec<WindowPoint>>, DetectError>;

    /// Single-sensor [`exchange_batch`](Self::exchange_batch).
    async fn exchange(
        &self,
        sensor_id: &str,
        point: WindowPoint,
    ) -> Result<Vec<WindowPoint>, DetectError> {
        let mut batch = BTreeMap::new();
        batch.insert(sensor_id.to_string(), point);
        let mut previous = self.exchange_batch(&batch).await?;
        Ok(previous.remove(sensor_id).unwrap_or_default())
    }

    /// Drop every window whose key matches `pattern`. Returns the number of
    /// keys removed.
    async fn clear(&self, pattern: &str) -> Result<usize, DetectError>;

    /// Window length per key matching `pattern`.
    async fn lengths(&self, pattern: &str) -> Result<BTreeMap<String, usize>, DetectError>;
}

fn compile_pattern(pattern: &str) -> Result<glob::Pattern, DetectError> {
    glob::Pattern::new(pattern).map_err(|e| DetectError::InvalidPattern {
        pattern: pattern.to_string(),
        reason: e.to_string(),
    })
}

fn check_capacity(capacity: usize) -> Result<(), DetectError> {
    if capacity == 0 {
        return Err(DetectError::Configuration(
            "window size must be at least 1".into(),
        ));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// SQLite
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct SqliteWindowStore {
    pool: Pool,
    capacity: usize,
}

impl SqliteWindowStore {
    pub fn new(pool: Pool, capacity: usize) -> Result<Self, DetectError> {
        check_capacity(capacity)?;
        Ok(Self { pool, capacity })
    }

    pub fn open(path: impl AsRef<Path>, capacity: usize) -> Result<Self, DetectError> {
        Self::open_with_timeout(path, capacity, DEFAULT_STORE_TIMEOUT)
    }

    /// `timeout` bounds lock and connection waits of every call.
    pub fn open_with_timeout(
        path: impl AsRef<Path>,
        capacity: usize,
        timeout: Duration,
    ) -> Result<Self, DetectError> {
        check_capacity(capacity)?;
        Self::new(super::open_pool(path, timeout)?, capacity)
    }

    pub fn from_config(cfg: &WindowConfig) -> Result<Self, DetectError> {
        Self::open_with_timeout(
            &cfg.db_path,
            cfg.window_size,
            Duration::from_millis(cfg.timeout_ms),
        )
    }
}

fn read_window(
    conn: &Connection,
    sensor_id: &str,
    capacity: usize,
) -> rusqlite::Result<Vec<WindowPoint>> {
    let mut stmt = conn.prepare_cached(
        "SELECT ts, value FROM (
             SELECT id, ts, value FROM window_points
             WHERE sensor_id = ?1
             ORDER BY id DESC LIMIT ?2
         ) ORDER BY id ASC",
    )?;
    let rows = stmt.query_map(params![sensor_id, capacity as i64], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, f64>(1)?))
    })?;

    let mut points = Vec::with_capacity(capacity);
    for r in rows {
        let (ts, value) = r?;
        match DateTime::parse_from_rfc3339(&ts) {
            Ok(dt) => points.push(WindowPoint::new(dt.with_timezone(&Utc), value)),
            Err(e) => warn!(%sensor_id, %ts, error = %e, "Skipping unparseable window point"),
        }
    }
    Ok(points)
}

fn append_trimmed(
    conn: &Connection,
    sensor_id: &str,
    point: &WindowPoint,
    capacity: usize,
) -> rusqlite::Result<()> {
    conn.execute(
        "INSERT INTO window_points (sensor_id, ts, value) VALUES (?1, ?2, ?3)",
        params![sensor_id, point.timestamp.to_rfc3339(), point.value],
    )?;
    conn.execute(
        "DELETE FROM window_points
         WHERE sensor_id = ?1
         AND id NOT IN (
             SELECT id FROM window_points WHERE sensor_id = ?1 ORDER BY id DESC LIMIT ?2
         )",
        params![sensor_id, capacity as i64],
    )?;
    Ok(())
}

/// Stored sensor ids matching `pattern`, with their point counts.
fn matching_keys(
    conn: &Connection,
    pattern: &glob::Pattern,
) -> rusqlite::Result<BTreeMap<String, usize>> {
    let mut stmt = conn.prepare_cached(
        "SELECT sensor_id, COUNT(*) FROM window_points GROUP BY sensor_id",
    )?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut keys = BTreeMap::new();
    for r in rows {
        let (sensor, len) = r?;
        if pattern.matches(&sensor) {
            keys.insert(sensor, len as usize);
        }
    }
    Ok(keys)
}

#[async_trait]
impl WindowStore for SqliteWindowStore {
    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn read(&self, sensor_id: &str) -> Result<Vec<WindowPoint>, DetectError> {
        let pool = self.pool.clone();
        let sensor_id = sensor_id.to_string();
        let capacity = self.capacity;
        tokio::task::spawn_blocking(move || -> Result<_, DetectError> {
            let conn = pool.get()?;
            Ok(read_window(&conn, &sensor_id, capacity)?)
        })
        .await?
    }

    async fn append(&self, sensor_id: &str, point: WindowPoint) -> Result<(), DetectError> {
        let pool = self.pool.clone();
        let sensor_id = sensor_id.to_string();
        let capacity = self.capacity;
        tokio::task::spawn_blocking(move || -> Result<_, DetectError> {
            let mut conn = pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            append_trimmed(&tx, &sensor_id, &point, capacity)?;
            tx.commit()?;
            Ok(())
        })
        .await?
    }

    async fn exchange_batch(
        &self,
        points: &BTreeMap<String, WindowPoint>,
    ) -> Result<BTreeMap<String, Vec<WindowPoint>>, DetectError> {
        let pool = self.pool.clone();
        let points = points.clone();
        let capacity = self.capacity;
        tokio::task::spawn_blocking(move || -> Result<_, DetectError> {
            let mut conn = pool.get()?;
            // IMMEDIATE takes the write lock up front so no other writer can
            // slip a point in between our reads and our appends. Dropping the
            // transaction on error rolls back every append of the batch.
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let mut previous = BTreeMap::new();
            for (sensor_id, point) in &points {
                previous.insert(sensor_id.clone(), read_window(&tx, sensor_id, capacity)?);
                append_trimmed(&tx, sensor_id, point, capacity)?;
            }
            tx.commit()?;
            Ok(previous)
        })
        .await?
    }

    async fn clear(&self, pattern: &str) -> Result<usize, DetectError> {
        let compiled = compile_pattern(pattern)?;
        let pool = self.pool.clone();
        let removed = tokio::task::spawn_blocking(move || -> Result<_, DetectError> {
            let mut conn = pool.get()?;
            let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
            let keys = matching_keys(&tx, &compiled)?;
            let mut rows = 0;
            for sensor_id in keys.keys() {
                rows += tx.execute(
                    "DELETE FROM window_points WHERE sensor_id = ?1",
                    params![sensor_id],
                )?;
            }
            tx.commit()?;
            debug!(keys = keys.len(), rows, "Deleted window points");
            Ok(keys.len())
        })
        .await??;
        debug!(%pattern, removed, "Cleared sensor windows");
        Ok(removed)
    }

    async fn lengths(&self, pattern: &str) -> Result<BTreeMap<String, usize>, DetectError> {
        let compiled = compile_pattern(pattern)?;
        let pool = self.pool.clone();
        tokio::task::spawn_blocking(move || -> Result<_, DetectError> {
            let conn = pool.get()?;
            Ok(matching_keys(&conn, &compiled)?)
        })
        .await?
    }
}

// ---------------------------------------------------------------------------
// In-process
// ---------------------------------------------------------------------------

/// Window store held in process memory. Windows do not survive a restart and
/// are not shared with other processes.
pub struct MemoryWindowStore {
    windows: Mutex<HashMap<String, VecDeque<WindowPoint>>>,
    capacity: usize,
}

impl MemoryWindowStore {
    pub fn new(capacity: usize) -> Result<Self, DetectError> {
        check_capacity(capacity)?;
        Ok(Self {
            windows: Mutex::new(HashMap::new()),
            capacity,
        })
    }

    fn push_trimmed(window: &mut VecDeque<WindowPoint>, point: WindowPoint, capacity: usize) {
        window.push_back(point);
        while window.len() > capacity {
            window.pop_front();
        }
    }
}

#[async_trait]
impl WindowStore for MemoryWindowStore {
    fn capacity(&self) -> usize {
        self.capacity
    }

    async fn read(&self, sensor_id: &str) -> Result<Vec<WindowPoint>, DetectError> {
        let windows = self.windows.lock().await;
        Ok(windows
            .get(sensor_id)
            .map(|w| w.iter().copied().collect())
            .unwrap_or_default())
    }

    async fn append(&self, sensor_id: &str, point: WindowPoint) -> Result<(), DetectError> {
        let mut windows = self.windows.lock().await;
        let window = windows.entry(sensor_id.to_string()).or_default();
        Self::push_trimmed(window, point, self.capacity);
        Ok(())
    }

    async fn exchange_batch(
        &self,
        points: &BTreeMap<String, WindowPoint>,
    ) -> Result<BTreeMap<String, Vec<WindowPoint>>, DetectError> {
        let mut windows = self.windows.lock().await;
        let mut previous = BTreeMap::new();
        for (sensor_id, point) in points {
            let window = windows.entry(sensor_id.clone()).or_default();
            previous.insert(sensor_id.clone(), window.iter().copied().collect());
            Self::push_trimmed(window, *point, self.capacity);
        }
        Ok(previous)
    }

    async fn clear(&self, pattern: &str) -> Result<usize, DetectError> {
        let pattern = compile_pattern(pattern)?;
        let mut windows = self.windows.lock().await;
        let before = windows.len();
        windows.retain(|key, _| !pattern.matches(key));
        Ok(before - windows.len())
    }

    async fn lengths(&self, pattern: &str) -> Result<BTreeMap<String, usize>, DetectError> {
        let pattern = compile_pattern(pattern)?;
        let windows = self.windows.lock().await;
        Ok(windows
            .iter()
            .filter(|(key, _)| pattern.matches(key))
            .map(|(key, w)| (key.clone(), w.len()))
            .collect())
    }
}
