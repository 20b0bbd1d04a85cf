//! Per-identifier scrape results.

use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// Number of marketplace offers shown on a product page.
///
/// A page with no offer widget yields `None` rather than a guessed count;
/// `Some(OfferCount(1))` always means the page itself reported one offer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OfferCount(pub u32);

/// One row of the "other sellers" panel.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MarketOffer {
    /// Condition heading, e.g. "New" or "Used - Like New".
    #[serde(rename = "type")]
    pub offer_type: Option<String>,
    pub shipped_from: Option<String>,
    pub seller_name: Option<String>,
    pub price: Option<String>,
}

/// Fields extracted from a product page. Any of them may be missing.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProductFields {
    pub title: Option<String>,
    pub price: Option<String>,
    pub minimum_price: Option<String>,
    pub offers: Option<OfferCount>,
    pub best_seller_rank: Option<String>,
    /// Average star rating, e.g. "4.5".
    pub rating: Option<String>,
    pub reviews_count: Option<u32>,
    pub buybox_shipped_from: Option<String>,
    pub buybox_sold_by: Option<String>,
    pub buybox_price: Option<String>,
    /// Empty when the offers panel was missing or could not be opened.
    #[serde(default)]
    pub other_offers: Vec<MarketOffer>,
}

impl ProductFields {
    /// True when no field could be read.
    pub fn is_empty(&self) -> bool {
        self.title.is_none()
            && self.price.is_none()
            && self.minimum_price.is_none()
            && self.offers.is_none()
            && self.best_seller_rank.is_none()
            && self.rating.is_none()
            && self.reviews_count.is_none()
            && self.buybox_shipped_from.is_none()
            && self.buybox_sold_by.is_none()
            && self.buybox_price.is_none()
            && self.other_offers.is_empty()
    }
}

/// Whether a snapshot holds extracted data or records a terminal failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Ok,
    Error,
}

impl ResultStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown result status: {0}")]
pub struct UnknownStatus(String);

impl FromStr for ResultStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ok" => Ok(Self::Ok),
            "error" => Ok(Self::Error),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Outcome of scraping one identifier on one day.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapeResult {
    pub identifier: String,
    pub scan_date: NaiveDate,
    pub status: ResultStatus,
    pub fields: ProductFields,
    /// Last error seen when `status` is `Error`.
    pub error: Option<String>,
    pub scraped_at: DateTime<Utc>,
}

impl ScrapeResult {
    pub fn success(identifier: &str, scan_date: NaiveDate, fields: ProductFields) -> Self {
        Self {
            identifier: identifier.to_string(),
            scan_date,
            status: ResultStatus::Ok,
            fields,
            error: None,
            scraped_at: Utc::now(),
        }
    }

    /// Sentinel record for an identifier whose retries were exhausted.
    pub fn failure(identifier: &str, scan_date: NaiveDate, error: impl Into<String>) -> Self {
        Self {
            identifier: identifier.to_string(),
            scan_date,
            status: ResultStatus::Error,
            fields: ProductFields::default(),
            error: Some(error.into()),
            scraped_at: Utc::now(),
        }
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Ok
    }
}
