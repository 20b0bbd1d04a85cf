//! Persistence seams used by the orchestrator.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;

use crate::models::{Checkpoint, ScrapeResult};

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] diesel::result::Error),

    #[error("{0}")]
    Other(String),
}

/// Durable per-day progress record.
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    async fn get(&self, scan_date: NaiveDate) -> Result<Option<Checkpoint>, StoreError>;

    /// Upsert the single checkpoint for `scan_date`.
    async fn save(
        &self,
        scan_date: NaiveDate,
        last_identifier: Option<&str>,
        last_index: usize,
        completed: bool,
    ) -> Result<(), StoreError>;
}

/// Durable per-identifier results, one row per (identifier, scan_date).
#[async_trait]
pub trait ResultSink: Send + Sync {
    /// Upsert every result in `results`. Either all of them are stored or
    /// none are.
    async fn save_batch(&self, results: &[ScrapeResult]) -> Result<(), StoreError>;

    /// Identifiers that already have a row for `scan_date`.
    async fn recorded_identifiers(
        &self,
        scan_date: NaiveDate,
    ) -> Result<HashSet<String>, StoreError>;
}
