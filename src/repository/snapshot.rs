//! Product snapshot repository.

use std::collections::HashSet;

use async_trait::async_trait;
use chrono::NaiveDate;
use diesel::prelude::*;
use diesel_async::scoped_futures::ScopedFutureExt;
use diesel_async::{AsyncConnection, RunQueryDsl};

use super::pool::{DbPool, DieselError};
use super::util::{format_date, parse_date, parse_datetime, to_diesel_error};
use crate::models::{MarketOffer, OfferCount, ProductFields, ResultStatus, ScrapeResult};
use crate::schema::product_snapshots;
use crate::scrapers::{ResultSink, StoreError};
use crate::with_conn;
use crate::with_conn_split;

#[derive(Debug, Clone, Queryable, Selectable)]
#[diesel(table_name = product_snapshots)]
#[diesel(check_for_backend(diesel::sqlite::Sqlite))]
pub struct SnapshotRecord {
    pub id: i32,
    pub identifier: String,
    pub scan_date: String,
    pub status: String,
    pub title: Option<String>,
    pub price: Option<String>,
    pub minimum_price: Option<String>,
    pub offer_count: Option<i32>,
    pub best_seller_rank: Option<String>,
    pub error: Option<String>,
    pub scraped_at: String,
    pub rating: Option<String>,
    pub reviews_count: Option<i32>,
    pub buybox_shipped_from: Option<String>,
    pub buybox_sold_by: Option<String>,
    pub buybox_price: Option<String>,
    pub other_offers: Option<String>,
}

#[derive(Insertable, AsChangeset)]
#[diesel(table_name = product_snapshots)]
#[diesel(treat_none_as_null = true)]
struct NewSnapshot {
    identifier: String,
    scan_date: String,
    status: &'static str,
    title: Option<String>,
    price: Option<String>,
    minimum_price: Option<String>,
    offer_count: Option<i32>,
    best_seller_rank: Option<String>,
    error: Option<String>,
    scraped_at: String,
    rating: Option<String>,
    reviews_count: Option<i32>,
    buybox_shipped_from: Option<String>,
    buybox_sold_by: Option<String>,
    buybox_price: Option<String>,
    other_offers: Option<String>,
}

impl TryFrom<&ScrapeResult> for NewSnapshot {
    type Error = serde_json::Error;

    fn try_from(result: &ScrapeResult) -> Result<Self, Self::Error> {
        let fields = &result.fields;
        let other_offers = if fields.other_offers.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&fields.other_offers)?)
        };

        Ok(Self {
            identifier: result.identifier.clone(),
            scan_date: format_date(result.scan_date),
            status: result.status.as_str(),
            title: fields.title.clone(),
            price: fields.price.clone(),
            minimum_price: fields.minimum_price.clone(),
            offer_count: fields
                .offers
                .map(|OfferCount(n)| i32::try_from(n).unwrap_or(i32::MAX)),
            best_seller_rank: fields.best_seller_rank.clone(),
            error: result.error.clone(),
            scraped_at: result.scraped_at.to_rfc3339(),
            rating: fields.rating.clone(),
            reviews_count: fields
                .reviews_count
                .map(|n| i32::try_from(n).unwrap_or(i32::MAX)),
            buybox_shipped_from: fields.buybox_shipped_from.clone(),
            buybox_sold_by: fields.buybox_sold_by.clone(),
            buybox_price: fields.buybox_price.clone(),
            other_offers,
        })
    }
}

impl TryFrom<SnapshotRecord> for ScrapeResult {
    type Error = DieselError;

    fn try_from(record: SnapshotRecord) -> Result<Self, Self::Error> {
        Ok(ScrapeResult {
            identifier: record.identifier,
            scan_date: parse_date(&record.scan_date)?,
            status: record.status.parse().unwrap_or(ResultStatus::Error),
            fields: ProductFields {
                title: record.title,
                price: record.price,
                minimum_price: record.minimum_price,
                offers: record
                    .offer_count
                    .and_then(|n| u32::try_from(n).ok())
                    .map(OfferCount),
                best_seller_rank: record.best_seller_rank,
                rating: record.rating,
                reviews_count: record.reviews_count.and_then(|n| u32::try_from(n).ok()),
                buybox_shipped_from: record.buybox_shipped_from,
                buybox_sold_by: record.buybox_sold_by,
                buybox_price: record.buybox_price,
                other_offers: match record.other_offers {
                    Some(json) => serde_json::from_str(&json).map_err(to_diesel_error)?,
                    None => Vec::new(),
                },
            },
            error: record.error,
            scraped_at: parse_datetime(&record.scraped_at),
        })
    }
}

/// Per-day counts of stored snapshots.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SnapshotCounts {
    pub ok: u64,
    pub error: u64,
}

/// Snapshot repository, one row per (identifier, scan_date).
#[derive(Clone)]
pub struct SnapshotRepository {
    pool: DbPool,
}

impl SnapshotRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Upsert a batch of results in one transaction.
    pub async fn save_batch(&self, results: &[ScrapeResult]) -> Result<(), DieselError> {
        if results.is_empty() {
            return Ok(());
        }
        let rows = results
            .iter()
            .map(NewSnapshot::try_from)
            .collect::<Result<Vec<_>, _>>()
            .map_err(to_diesel_error)?;
        let rows = rows.as_slice();

        with_conn_split!(self.pool,
            sqlite: conn => {
                conn.transaction::<_, DieselError, _>(|conn| {
                    async move {
                        for row in rows {
                            diesel::replace_into(product_snapshots::table)
                                .values(row)
                                .execute(conn)
                                .await?;
                        }
                        Ok(())
                    }
                    .scope_boxed()
                })
                .await
            },
            postgres: conn => {
                conn.transaction::<_, DieselError, _>(|conn| {
                    async move {
                        for row in rows {
                            diesel::insert_into(product_snapshots::table)
                                .values(row)
                                .on_conflict((
                                    product_snapshots::identifier,
                                    product_snapshots::scan_date,
                                ))
                                .do_update()
                                .set(row)
                                .execute(conn)
                                .await?;
                        }
                        Ok(())
                    }
                    .scope_boxed()
                })
                .await
            }
        )
    }

    pub async fn get(
        &self,
        identifier: &str,
        scan_date: NaiveDate,
    ) -> Result<Option<ScrapeResult>, DieselError> {
        let key = format_date(scan_date);
        let record = with_conn!(self.pool, conn => {
            product_snapshots::table
                .filter(product_snapshots::identifier.eq(identifier))
                .filter(product_snapshots::scan_date.eq(&key))
                .select(SnapshotRecord::as_select())
                .first(&mut conn)
                .await
                .optional()
        })?;

        record.map(ScrapeResult::try_from).transpose()
    }

    /// All snapshots for a day, in identifier order.
    pub async fn for_date(&self, scan_date: NaiveDate) -> Result<Vec<ScrapeResult>, DieselError> {
        let key = format_date(scan_date);
        let records = with_conn!(self.pool, conn => {
            product_snapshots::table
                .filter(product_snapshots::scan_date.eq(&key))
                .order(product_snapshots::identifier.asc())
                .select(SnapshotRecord::as_select())
                .load(&mut conn)
                .await
        })?;

        records.into_iter().map(ScrapeResult::try_from).collect()
    }

    pub async fn identifiers_for_date(
        &self,
        scan_date: NaiveDate,
    ) -> Result<HashSet<String>, DieselError> {
        let key = format_date(scan_date);
        let identifiers: Vec<String> = with_conn!(self.pool, conn => {
            product_snapshots::table
                .filter(product_snapshots::scan_date.eq(&key))
                .select(product_snapshots::identifier)
                .load(&mut conn)
                .await
        })?;

        Ok(identifiers.into_iter().collect())
    }

    pub async fn count_for_date(&self, scan_date: NaiveDate) -> Result<SnapshotCounts, DieselError> {
        let key = format_date(scan_date);
        let rows: Vec<(String, i64)> = with_conn!(self.pool, conn => {
            product_snapshots::table
                .filter(product_snapshots::scan_date.eq(&key))
                .group_by(product_snapshots::status)
                .select((product_snapshots::status, diesel::dsl::count_star()))
                .load(&mut conn)
                .await
        })?;

        let mut counts = SnapshotCounts::default();
        for (status, count) in rows {
            let count = u64::try_from(count).unwrap_or(0);
            match status.parse() {
                Ok(ResultStatus::Ok) => counts.ok += count,
                _ => counts.error += count,
            }
        }
        Ok(counts)
    }
}

#[async_trait]
impl ResultSink for SnapshotRepository {
    async fn save_batch(&self, results: &[ScrapeResult]) -> Result<(), StoreError> {
        Ok(SnapshotRepository::save_batch(self, results).await?)
    }

    async fn recorded_identifiers(
        &self,
        scan_date: NaiveDate,
    ) -> Result<HashSet<String>, StoreError> {
        Ok(self.identifiers_for_date(scan_date).await?)
    }
}
