//! Storm detections on top of the `detected_events` table.
//!
//! Each fetch stores the storms found in its snapshot. A storm whose dates
//! overlap one detected during the past week is treated as the same storm,
//! so its detections can be followed while the forecast moves it around.

use chrono::{DateTime, Duration, Utc};
use rusqlite::params;

use snowwatch_core::StorageError;
use snowwatch_weather::{SnowEvent, TrackedEvent};

use crate::sqlite::{millis_to_utc, SqliteStore};

const TRACKING_WINDOW_DAYS: i64 = 7;

impl SqliteStore {
    pub(crate) fn insert_detected_events(
        &self,
        location_id: i64,
        detected_at: DateTime<Utc>,
        events: &[SnowEvent],
    ) -> Result<Vec<String>, StorageError> {
        let window_start = (detected_at - Duration::days(TRACKING_WINDOW_DAYS)).timestamp_millis();
        let tx = self.conn.unchecked_transaction()?;

        let mut assigned: Vec<String> = Vec::with_capacity(events.len());
        {
            let mut matching = tx.prepare(
                "SELECT event_id FROM detected_events
                 WHERE location_id = ?1 AND detected_at >= ?2 AND detected_at <= ?3
                   AND start_date <= ?4 AND end_date >= ?5
                 ORDER BY detected_at DESC, id DESC",
            )?;

            for event in events {
                let start_date = event.start_date().to_string();
                let end_date = event.end_date().to_string();

                let candidates = matching
                    .query_map(
                        params![
                            location_id,
                            window_start,
                            detected_at.timestamp_millis(),
                            end_date,
                            start_date
                        ],
                        |row| row.get::<_, String>(0),
                    )?
                    .collect::<Result<Vec<_>, _>>()?;
                let event_id = candidates
                    .into_iter()
                    .find(|id| !assigned.contains(id))
                    .unwrap_or_else(|| event.new_event_id(location_id));

                tx.execute(
                    "INSERT OR IGNORE INTO detected_events
                     (location_id, event_id, detected_at, start_date, end_date, snow_total_in, confidence, event_json)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                    params![
                        location_id,
                        event_id,
                        detected_at.timestamp_millis(),
                        start_date,
                        end_date,
                        event.snow_total_in,
                        event.confidence.label(),
                        serde_json::to_string(event)?,
                    ],
                )?;
                assigned.push(event_id);
            }
        }
        tx.commit()?;

        tracing::debug!(
            "Stored {} storm detection(s) for location {}",
            assigned.len(),
            location_id
        );
        Ok(assigned)
    }

    /// Storm detections since `since`, oldest first.
    pub fn detected_events(
        &self,
        location_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<TrackedEvent>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT event_id, detected_at, event_json
             FROM detected_events
             WHERE location_id = ?1 AND detected_at >= ?2
             ORDER BY detected_at ASC, id ASC",
        )?;
        let rows = stmt.query_map(params![location_id, since.timestamp_millis()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                millis_to_utc(1, row.get(1)?)?,
                row.get::<_, String>(2)?,
            ))
        })?;

        let mut tracked = Vec::new();
        for row in rows {
            let (event_id, detected_at, json) = row?;
            tracked.push(TrackedEvent {
                event_id,
                detected_at,
                event: serde_json::from_str(&json)?,
            });
        }
        Ok(tracked)
    }
}
