//! pricewatch - resumable daily product-page scraper.
//!
//! Walks a fixed list of product identifiers once per day through a single
//! browser session, clears interactive challenges, and persists one snapshot
//! per identifier per day. Progress is checkpointed so an interrupted or
//! degraded run resumes where it left off.

pub mod config;
pub mod identifiers;
pub mod migrations;
pub mod models;
pub mod repository;
pub mod schema;
pub mod scrapers;
