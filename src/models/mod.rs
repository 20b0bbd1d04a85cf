//! Data models for pricewatch.

mod checkpoint;
mod snapshot;

pub use checkpoint::Checkpoint;
pub use snapshot::{MarketOffer, OfferCount, ProductFields, ResultStatus, ScrapeResult, UnknownStatus};
