//! Checkpoint repository.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use diesel::prelude::*;
use diesel_async::RunQueryDsl;

use super::pool::{DbPool, DieselError};
use super::util::{format_date, parse_date, parse_datetime};
use crate::models::Checkpoint;
use crate::schema::scrape_checkpoints;
use crate::scrapers::{CheckpointStore, StoreError};
use crate::with_conn;
use crate::with_conn_split;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = scrape_checkpoints)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct CheckpointRecord {
    pub scan_date: String,
    pub last_identifier: Option<String>,
    pub last_index: i32,
    pub completed: bool,
    pub updated_at: String,
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = scrape_checkpoints)]
#[diesel(treat_none_as_null = true)]
struct NewCheckpoint<'a> {
    scan_date: &'a str,
    last_identifier: Option<&'a str>,
    last_index: i32,
    completed: bool,
    updated_at: &'a str,
}

impl TryFrom<CheckpointRecord> for Checkpoint {
    type Error = DieselError;

    fn try_from(record: CheckpointRecord) -> Result<Self, Self::Error> {
        Ok(Checkpoint {
            scan_date: parse_date(&record.scan_date)?,
            last_identifier: record.last_identifier,
            last_index: usize::try_from(record.last_index).unwrap_or(0),
            completed: record.completed,
            updated_at: parse_datetime(&record.updated_at),
        })
    }
}

/// Checkpoint repository, one row per scan date.
#[derive(Clone)]
pub struct CheckpointRepository {
    pool: DbPool,
}

impl CheckpointRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, scan_date: NaiveDate) -> Result<Option<Checkpoint>, DieselError> {
        let key = format_date(scan_date);
        let record = with_conn!(self.pool, conn => {
            scrape_checkpoints::table
                .find(key.as_str())
                .select(CheckpointRecord::as_select())
                .first(&mut conn)
                .await
                .optional()
        })?;

        record.map(Checkpoint::try_from).transpose()
    }

    /// Upsert the checkpoint for `scan_date`.
    ///
    /// A stored `last_index` is never lowered, and a completed day stays
    /// completed.
    pub async fn save(
        &self,
        scan_date: NaiveDate,
        last_identifier: Option<&str>,
        last_index: usize,
        completed: bool,
    ) -> Result<(), DieselError> {
        let existing = self.get(scan_date).await?;

        let mut last_identifier = last_identifier.map(str::to_string);
        let mut last_index = last_index;
        let mut completed = completed;
        if let Some(existing) = existing {
            if existing.last_index > last_index {
                last_index = existing.last_index;
                last_identifier = existing.last_identifier;
            }
            completed |= existing.completed;
        }

        let key = format_date(scan_date);
        let now = Utc::now().to_rfc3339();
        let row = NewCheckpoint {
            scan_date: &key,
            last_identifier: last_identifier.as_deref(),
            last_index: i32::try_from(last_index).unwrap_or(i32::MAX),
            completed,
            updated_at: &now,
        };

        with_conn_split!(self.pool,
            sqlite: conn => {
                diesel::replace_into(scrape_checkpoints::table)
                    .values(&row)
                    .execute(&mut conn)
                    .await?;
                Ok(())
            },
            postgres: conn => {
                diesel::insert_into(scrape_checkpoints::table)
                    .values(&row)
                    .on_conflict(scrape_checkpoints::scan_date)
                    .do_update()
                    .set(&row)
                    .execute(&mut conn)
                    .await?;
                Ok(())
            }
        )
    }

    /// Most recent checkpoints, newest first.
    pub async fn recent(&self, limit: i64) -> Result<Vec<Checkpoint>, DieselError> {
        let records = with_conn!(self.pool, conn => {
            scrape_checkpoints::table
                .order(scrape_checkpoints::scan_date.desc())
                .limit(limit)
                .select(CheckpointRecord::as_select())
                .load(&mut conn)
                .await
        })?;

        records.into_iter().map(Checkpoint::try_from).collect()
    }
}

#[async_trait]
impl CheckpointStore for CheckpointRepository {
    async fn get(&self, scan_date: NaiveDate) -> Result<Option<Checkpoint>, StoreError> {
        Ok(CheckpointRepository::get(self, scan_date).await?)
    }

    async fn save(
        &self,
        scan_date: NaiveDate,
        last_identifier: Option<&str>,
        last_index: usize,
        completed: bool,
    ) -> Result<(), StoreError> {
        Ok(CheckpointRepository::save(self, scan_date, last_identifier, last_index, completed).await?)
    }
}
