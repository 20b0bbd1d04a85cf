//! Repository layer for database persistence.
//!
//! All database access uses Diesel ORM with compile-time query checking.
//! SQLite is the default backend; PostgreSQL is available behind the
//! `postgres` feature.

pub mod checkpoint;
pub mod context;
pub mod migrations;
pub mod pool;
pub mod snapshot;
pub mod util;

pub use checkpoint::CheckpointRepository;
pub use context::DbContext;
pub use pool::{DbPool, DieselError};
pub use snapshot::{SnapshotCounts, SnapshotRepository};
