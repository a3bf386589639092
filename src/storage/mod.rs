//! SQLite storage layer -- connection pool, schema, and the sliding window store.

pub mod schema;
pub mod window;

use std::path::Path;
use std::time::Duration;

use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;

use crate::detect::DetectError;

pub use window::{MemoryWindowStore, SqliteWindowStore, WindowPoint, WindowStore};

/// Connection Pool type
pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Open (or create) the SQLite database and return a connection pool.
///
/// Several processes may open the same file; WAL mode plus a busy timeout
/// lets their window writes interleave safely. `timeout` bounds both the
/// wait for the database write lock and the wait for a pooled connection,
/// so a blocked call fails inside its blocking task instead of being
/// abandoned mid-transaction.
pub fn open_pool(path: impl AsRef<Path>, timeout: Duration) -> Result<Pool, DetectError> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DetectError::Configuration(format!(
                    "cannot create database directory {}: {}",
                    parent.display(),
                    e
                ))
            })?;
        }
    }

    let manager = SqliteConnectionManager::file(path).with_init(move |c| {
        c.busy_timeout(timeout)?;
        c.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA synchronous = NORMAL;
             PRAGMA temp_store = MEMORY;",
        )
    });

    let pool = R2D2Pool::builder()
        .connection_timeout(timeout)
        .build(manager)?;

    // Run migrations on a single connection
    let conn = pool.get()?;
    schema::migrate(&conn)?;

    tracing::debug!(path = %path.display(), "Window database ready");
    Ok(pool)
}
