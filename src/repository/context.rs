//! Database context for managing connections and repository access.

use std::path::Path;

use super::checkpoint::CheckpointRepository;
use super::pool::{DbPool, DieselError};
use super::snapshot::SnapshotRepository;
use crate::with_conn;

/// Holds the connection pool and hands out repositories.
///
/// # Example
/// ```ignore
/// let ctx = DbContext::from_url("sqlite:pricewatch.db")?;
/// let today = ctx.checkpoints().get(scan_date).await?;
/// ```
#[derive(Clone)]
pub struct DbContext {
    pool: DbPool,
}

impl DbContext {
    /// Create a context from a database file path (SQLite only).
    pub fn new(db_path: &Path) -> Self {
        Self {
            pool: DbPool::sqlite_from_path(db_path),
        }
    }

    /// Create a context from a database URL.
    ///
    /// Supports:
    /// - SQLite: file paths or `sqlite:` URLs
    /// - PostgreSQL: `postgres://` or `postgresql://` URLs
    pub fn from_url(url: &str) -> Result<Self, DieselError> {
        Ok(Self {
            pool: DbPool::from_url(url)?,
        })
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }

    pub fn checkpoints(&self) -> CheckpointRepository {
        CheckpointRepository::new(self.pool.clone())
    }

    pub fn snapshots(&self) -> SnapshotRepository {
        SnapshotRepository::new(self.pool.clone())
    }

    /// Open a connection and run a trivial query.
    pub async fn test_connection(&self) -> Result<(), DieselError> {
        use diesel_async::SimpleAsyncConnection;

        with_conn!(self.pool, conn => {
            conn.batch_execute("SELECT 1").await
        })
    }
}
