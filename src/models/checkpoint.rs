//! Per-day progress marker.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

/// How far a day's run has walked through the identifier list.
///
/// `last_index` counts positions that have been attempted and durably
/// recorded, so it is also the position the next run resumes from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub scan_date: NaiveDate,
    pub last_identifier: Option<String>,
    pub last_index: usize,
    pub completed: bool,
    pub updated_at: DateTime<Utc>,
}

impl Checkpoint {
    pub fn new(scan_date: NaiveDate) -> Self {
        Self {
            scan_date,
            last_identifier: None,
            last_index: 0,
            completed: false,
            updated_at: Utc::now(),
        }
    }

    /// Position to resume from given an explicit start position.
    pub fn resume_index(&self, start: usize) -> usize {
        start.max(self.last_index)
    }
}
