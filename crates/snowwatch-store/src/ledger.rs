//! Alert ledger on top of the `alert_history` table.
//!
//! Uniqueness of (location_id, fingerprint) is enforced by the schema; the
//! ledger only reports when an insert was ignored.

use chrono::{DateTime, Utc};
use rusqlite::params;
use std::collections::HashSet;

use snowwatch_core::{DuplicateAlertError, LedgerError, StorageError};
use snowwatch_weather::{AlertRecord, ChangeEvent};

use crate::backend::AlertLedger;
use crate::sqlite::{millis_to_utc, SqliteStore};

impl AlertLedger for SqliteStore {
    fn filter_unnotified(&self, location_id: i64, events: &[ChangeEvent]) -> Result<Vec<ChangeEvent>, StorageError> {
        let mut stmt = self
            .conn
            .prepare("SELECT EXISTS(SELECT 1 FROM alert_history WHERE location_id = ?1 AND fingerprint = ?2)")?;

        let mut seen = HashSet::new();
        let mut fresh = Vec::new();
        for event in events {
            let fingerprint = event.fingerprint();
            if !seen.insert(fingerprint.clone()) {
                continue;
            }
            let exists: bool = stmt.query_row(params![location_id, fingerprint], |row| row.get(0))?;
            if !exists {
                fresh.push(event.clone());
            }
        }

        tracing::debug!(
            "{} of {} events not yet notified for location {}",
            fresh.len(),
            events.len(),
            location_id
        );
        Ok(fresh)
    }

    fn record_notified(&self, location_id: i64, events: &[ChangeEvent]) -> Result<(), LedgerError> {
        let now = Utc::now().timestamp_millis();
        let tx = self
            .conn
            .unchecked_transaction()
            .map_err(StorageError::from)?;

        let mut duplicates = Vec::new();
        for event in events {
            let fingerprint = event.fingerprint();
            let detail = serde_json::to_string(event).map_err(StorageError::from)?;
            let inserted = tx
                .execute(
                    "INSERT OR IGNORE INTO alert_history
                     (location_id, fingerprint, kind, summary, detail_json, notified_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                    params![
                        location_id,
                        fingerprint,
                        event.kind.as_str(),
                        event.summary(),
                        detail,
                        now
                    ],
                )
                .map_err(StorageError::from)?;
            if inserted == 0 {
                duplicates.push(fingerprint);
            }
        }
        tx.commit().map_err(StorageError::from)?;

        if duplicates.is_empty() {
            Ok(())
        } else {
            Err(DuplicateAlertError {
                location_id,
                fingerprints: duplicates,
            }
            .into())
        }
    }
}

impl SqliteStore {
    /// Alert history since `since`, newest first.
    pub fn alerts_for_location(
        &self,
        location_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<AlertRecord>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT location_id, fingerprint, kind, summary, notified_at
             FROM alert_history
             WHERE location_id = ?1 AND notified_at >= ?2
             ORDER BY notified_at DESC, id DESC",
        )?;
        let rows = stmt.query_map(params![location_id, since.timestamp_millis()], |row| {
            Ok(AlertRecord {
                location_id: row.get(0)?,
                fingerprint: row.get(1)?,
                kind: row.get(2)?,
                summary: row.get(3)?,
                notified_at: millis_to_utc(4, row.get(4)?)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Forget alerts older than `cutoff`; a change seen again after that may re-fire.
    pub fn purge_alerts_older_than(&self, location_id: i64, cutoff: DateTime<Utc>) -> Result<usize, StorageError> {
        let deleted = self.conn.execute(
            "DELETE FROM alert_history WHERE location_id = ?1 AND notified_at < ?2",
            params![location_id, cutoff.timestamp_millis()],
        )?;
        Ok(deleted)
    }
}
