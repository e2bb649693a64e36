//! Local persistence for snowwatch
//!
//! A single SQLite database holds tracked locations, forecast snapshots,
//! forecast discussions, user observations, detected storms and the alert
//! ledger.

pub mod backend;
pub mod ledger;
pub mod sqlite;
pub mod storms;

pub use backend::{AlertLedger, PurgeReport, SnapshotStore};
pub use sqlite::SqliteStore;
