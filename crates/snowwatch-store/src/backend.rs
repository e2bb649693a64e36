//! Storage traits consumed by the fetch orchestrator.
//!
//! `SnapshotStore` is the append-only history of forecasts and discussions;
//! `AlertLedger` remembers which changes were already notified. `SqliteStore`
//! implements both, but the orchestrator only depends on the traits.

use chrono::{DateTime, Utc};

use snowwatch_core::{LedgerError, StorageError};
use snowwatch_weather::{ChangeEvent, Discussion, ForecastSnapshot, SnowEvent};

/// Rows removed by a purge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub forecasts: usize,
    pub discussions: usize,
    pub storms: usize,
}

impl PurgeReport {
    pub fn total(&self) -> usize {
        self.forecasts + self.discussions + self.storms
    }
}

impl std::ops::AddAssign for PurgeReport {
    fn add_assign(&mut self, other: Self) {
        self.forecasts += other.forecasts;
        self.discussions += other.discussions;
        self.storms += other.storms;
    }
}

pub trait SnapshotStore {
    /// Append a snapshot for a location.
    ///
    /// # Errors
    /// Returns `StorageError::OutOfOrder` unless `snapshot.captured_at` is strictly
    /// later than every snapshot already stored for the location.
    fn append_snapshot(&self, location_id: i64, snapshot: &ForecastSnapshot) -> Result<(), StorageError>;

    /// Up to two most recent snapshots, newest first.
    ///
    /// Fewer than two means no comparison is possible yet.
    fn latest_two(&self, location_id: i64) -> Result<Vec<ForecastSnapshot>, StorageError>;

    /// Delete snapshots, discussions and storm detections from before `cutoff`. Idempotent.
    fn purge_older_than(&self, location_id: i64, cutoff: DateTime<Utc>) -> Result<PurgeReport, StorageError>;

    /// Record the storms found in the snapshot captured at `detected_at`.
    ///
    /// A storm overlapping the dates of one detected in the past week keeps
    /// that storm's id. Returns the id assigned to each storm, in order.
    fn save_detected_events(
        &self,
        location_id: i64,
        detected_at: DateTime<Utc>,
        events: &[SnowEvent],
    ) -> Result<Vec<String>, StorageError>;

    /// Store a discussion; `false` when that issuance is already stored.
    fn save_discussion(&self, location_id: i64, discussion: &Discussion) -> Result<bool, StorageError>;

    fn latest_discussion(&self, location_id: i64) -> Result<Option<Discussion>, StorageError>;
}

pub trait AlertLedger {
    /// Events whose fingerprint has no alert record yet. Read-only.
    fn filter_unnotified(&self, location_id: i64, events: &[ChangeEvent]) -> Result<Vec<ChangeEvent>, StorageError>;

    /// Record every event as notified now.
    ///
    /// # Errors
    /// Returns `LedgerError::Duplicate` when another writer already recorded some of
    /// the fingerprints. The remaining events are still recorded.
    fn record_notified(&self, location_id: i64, events: &[ChangeEvent]) -> Result<(), LedgerError>;
}
