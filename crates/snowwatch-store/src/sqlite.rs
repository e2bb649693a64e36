//! SQLite-backed store.
//!
//! Timestamps are stored as UTC milliseconds. Snapshots are kept as JSON
//! (structured fields) with the upstream payload in a separate column.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use snowwatch_core::StorageError;
use snowwatch_weather::{
    Discussion, ForecastSnapshot, GridRef, Location, NewLocation, NewObservation, SnowEvent,
    UserObservation,
};

use crate::backend::{PurgeReport, SnapshotStore};

const SCHEMA_VERSION: i32 = 2;

/// SQLite storage for locations, snapshots, discussions, observations, storms and alerts.
pub struct SqliteStore {
    pub(crate) conn: Connection,
}

impl SqliteStore {
    /// Open or create the database at `path`, creating parent directories.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    StorageError::ConnectionFailed(format!("{}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open(path)?;
        let store = Self { conn };
        store.init_schema()?;
        tracing::debug!("Opened database at {}", path.display());
        Ok(store)
    }

    /// Create an in-memory store (for testing).
    pub fn in_memory() -> Result<Self, StorageError> {
        let conn = Connection::open_in_memory()?;
        let store = Self { conn };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StorageError> {
        self.conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS schema_version (version INTEGER NOT NULL);

            CREATE TABLE IF NOT EXISTS locations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                zip_code TEXT NOT NULL UNIQUE,
                latitude REAL NOT NULL,
                longitude REAL NOT NULL,
                grid_office TEXT NOT NULL,
                grid_x INTEGER NOT NULL,
                grid_y INTEGER NOT NULL,
                city TEXT,
                state TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS forecasts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location_id INTEGER NOT NULL REFERENCES locations(id) ON DELETE CASCADE,
                captured_at INTEGER NOT NULL,
                snapshot_json TEXT NOT NULL,
                raw_payload TEXT,
                UNIQUE (location_id, captured_at)
            );

            CREATE TABLE IF NOT EXISTS discussions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location_id INTEGER NOT NULL REFERENCES locations(id) ON DELETE CASCADE,
                issued_at INTEGER NOT NULL,
                fetched_at INTEGER NOT NULL,
                office TEXT NOT NULL,
                text TEXT NOT NULL,
                UNIQUE (location_id, issued_at)
            );

            CREATE TABLE IF NOT EXISTS user_observations (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location_id INTEGER NOT NULL REFERENCES locations(id) ON DELETE CASCADE,
                observed_at INTEGER NOT NULL,
                snow_depth_in REAL,
                new_snow_in REAL,
                temperature_f REAL,
                notes TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS alert_history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location_id INTEGER NOT NULL REFERENCES locations(id) ON DELETE CASCADE,
                fingerprint TEXT NOT NULL,
                kind TEXT NOT NULL,
                summary TEXT NOT NULL,
                detail_json TEXT NOT NULL,
                notified_at INTEGER NOT NULL,
                UNIQUE (location_id, fingerprint)
            );

            CREATE TABLE IF NOT EXISTS detected_events (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                location_id INTEGER NOT NULL REFERENCES locations(id) ON DELETE CASCADE,
                event_id TEXT NOT NULL,
                detected_at INTEGER NOT NULL,
                start_date TEXT NOT NULL,
                end_date TEXT NOT NULL,
                snow_total_in REAL NOT NULL,
                confidence TEXT NOT NULL,
                event_json TEXT NOT NULL,
                UNIQUE (location_id, event_id, detected_at)
            );

            CREATE INDEX IF NOT EXISTS idx_forecasts_location ON forecasts(location_id, captured_at);
            CREATE INDEX IF NOT EXISTS idx_discussions_location ON discussions(location_id, issued_at);
            CREATE INDEX IF NOT EXISTS idx_observations_location ON user_observations(location_id, observed_at);
            CREATE INDEX IF NOT EXISTS idx_alerts_location ON alert_history(location_id, notified_at);
            CREATE INDEX IF NOT EXISTS idx_events_location ON detected_events(location_id, detected_at);
            "#,
        )?;

        let version: Option<i32> = self
            .conn
            .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| row.get(0))
            .optional()?;

        match version {
            None => {
                self.conn.execute(
                    "INSERT INTO schema_version (version) VALUES (?1)",
                    params![SCHEMA_VERSION],
                )?;
            }
            Some(v) if v > SCHEMA_VERSION => {
                return Err(StorageError::Corruption(format!(
                    "database schema v{} is newer than supported v{}",
                    v, SCHEMA_VERSION
                )));
            }
            Some(v) if v < SCHEMA_VERSION => {
                // Tables added since v1 are created above
                self.conn.execute("UPDATE schema_version SET version = ?1", params![SCHEMA_VERSION])?;
                tracing::info!("Upgraded database schema v{} -> v{}", v, SCHEMA_VERSION);
            }
            Some(_) => {}
        }

        Ok(())
    }

    fn row_to_location(row: &rusqlite::Row) -> rusqlite::Result<Location> {
        Ok(Location {
            id: row.get(0)?,
            zip_code: row.get(1)?,
            latitude: row.get(2)?,
            longitude: row.get(3)?,
            grid: GridRef {
                office: row.get(4)?,
                x: row.get(5)?,
                y: row.get(6)?,
            },
            city: row.get(7)?,
            state: row.get(8)?,
            created_at: millis_to_utc(9, row.get(9)?)?,
        })
    }

    /// Insert a location, or refresh coordinates and grid for a known zip code.
    pub fn upsert_location(&self, location: &NewLocation) -> Result<Location, StorageError> {
        self.conn.execute(
            r#"
            INSERT INTO locations (zip_code, latitude, longitude, grid_office, grid_x, grid_y, city, state, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
            ON CONFLICT(zip_code) DO UPDATE SET
                latitude = excluded.latitude,
                longitude = excluded.longitude,
                grid_office = excluded.grid_office,
                grid_x = excluded.grid_x,
                grid_y = excluded.grid_y,
                city = COALESCE(excluded.city, locations.city),
                state = COALESCE(excluded.state, locations.state)
            "#,
            params![
                location.zip_code,
                location.latitude,
                location.longitude,
                location.grid.office,
                location.grid.x,
                location.grid.y,
                location.city,
                location.state,
                Utc::now().timestamp_millis(),
            ],
        )?;

        self.location_by_zip(&location.zip_code)?
            .ok_or_else(|| StorageError::not_found(format!("location {}", location.zip_code)))
    }

    pub fn location_by_zip(&self, zip_code: &str) -> Result<Option<Location>, StorageError> {
        let location = self
            .conn
            .query_row(
                "SELECT id, zip_code, latitude, longitude, grid_office, grid_x, grid_y, city, state, created_at
                 FROM locations WHERE zip_code = ?1",
                params![zip_code],
                Self::row_to_location,
            )
            .optional()?;
        Ok(location)
    }

    pub fn location(&self, id: i64) -> Result<Option<Location>, StorageError> {
        let location = self
            .conn
            .query_row(
                "SELECT id, zip_code, latitude, longitude, grid_office, grid_x, grid_y, city, state, created_at
                 FROM locations WHERE id = ?1",
                params![id],
                Self::row_to_location,
            )
            .optional()?;
        Ok(location)
    }

    /// All tracked locations, by city then zip code.
    pub fn all_locations(&self) -> Result<Vec<Location>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, zip_code, latitude, longitude, grid_office, grid_x, grid_y, city, state, created_at
             FROM locations
             ORDER BY city IS NULL, city, zip_code",
        )?;
        let rows = stmt.query_map([], Self::row_to_location)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Point a location at a new forecast grid cell (the old mapping went stale).
    pub fn update_grid(&self, location_id: i64, grid: &GridRef) -> Result<(), StorageError> {
        let updated = self.conn.execute(
            "UPDATE locations SET grid_office = ?1, grid_x = ?2, grid_y = ?3 WHERE id = ?4",
            params![grid.office, grid.x, grid.y, location_id],
        )?;
        if updated == 0 {
            return Err(StorageError::not_found(format!("location {}", location_id)));
        }
        tracing::info!("Location {} re-resolved to grid {}", location_id, grid);
        Ok(())
    }

    pub fn save_observation(
        &self,
        location_id: i64,
        observation: &NewObservation,
    ) -> Result<UserObservation, StorageError> {
        self.conn.execute(
            r#"
            INSERT INTO user_observations
            (location_id, observed_at, snow_depth_in, new_snow_in, temperature_f, notes, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                location_id,
                observation.observed_at.timestamp_millis(),
                observation.snow_depth_in,
                observation.new_snow_in,
                observation.temperature_f,
                observation.notes,
                Utc::now().timestamp_millis(),
            ],
        )?;

        let id = self.conn.last_insert_rowid();
        tracing::debug!("Saved observation {} for location {}", id, location_id);

        Ok(UserObservation {
            id,
            location_id,
            observed_at: observation.observed_at,
            snow_depth_in: observation.snow_depth_in,
            new_snow_in: observation.new_snow_in,
            temperature_f: observation.temperature_f,
            notes: observation.notes.clone(),
        })
    }

    /// Observations since `since`, newest first.
    pub fn observations_for_location(
        &self,
        location_id: i64,
        since: DateTime<Utc>,
    ) -> Result<Vec<UserObservation>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, location_id, observed_at, snow_depth_in, new_snow_in, temperature_f, notes
             FROM user_observations
             WHERE location_id = ?1 AND observed_at >= ?2
             ORDER BY observed_at DESC",
        )?;
        let rows = stmt.query_map(params![location_id, since.timestamp_millis()], |row| {
            Ok(UserObservation {
                id: row.get(0)?,
                location_id: row.get(1)?,
                observed_at: millis_to_utc(2, row.get(2)?)?,
                snow_depth_in: row.get(3)?,
                new_snow_in: row.get(4)?,
                temperature_f: row.get(5)?,
                notes: row.get(6)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Returns `false` if the location has no such observation.
    pub fn delete_observation(&self, location_id: i64, id: i64) -> Result<bool, StorageError> {
        let deleted = self.conn.execute(
            "DELETE FROM user_observations WHERE id = ?1 AND location_id = ?2",
            params![id, location_id],
        )?;
        Ok(deleted > 0)
    }

    pub fn snapshot_count(&self, location_id: i64) -> Result<usize, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM forecasts WHERE location_id = ?1",
            params![location_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    pub fn discussion_count(&self, location_id: i64) -> Result<usize, StorageError> {
        let count: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM discussions WHERE location_id = ?1",
            params![location_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }
}

impl SnapshotStore for SqliteStore {
    fn append_snapshot(&self, location_id: i64, snapshot: &ForecastSnapshot) -> Result<(), StorageError> {
        let captured_ms = snapshot.captured_at.timestamp_millis();
        let tx = self.conn.unchecked_transaction()?;

        let latest: Option<i64> = tx.query_row(
            "SELECT MAX(captured_at) FROM forecasts WHERE location_id = ?1",
            params![location_id],
            |row| row.get(0),
        )?;
        if let Some(latest) = latest {
            if captured_ms <= latest {
                return Err(StorageError::OutOfOrder {
                    location_id,
                    captured_at: snapshot.captured_at,
                    latest: DateTime::from_timestamp_millis(latest).unwrap_or_default(),
                });
            }
        }

        let mut structured = snapshot.clone();
        let raw_payload = structured.raw_payload.take();
        let json = serde_json::to_string(&structured)?;

        tx.execute(
            "INSERT INTO forecasts (location_id, captured_at, snapshot_json, raw_payload)
             VALUES (?1, ?2, ?3, ?4)",
            params![location_id, captured_ms, json, raw_payload],
        )?;
        tx.commit()?;

        tracing::debug!(
            "Stored snapshot for location {} captured at {}",
            location_id,
            snapshot.captured_at
        );
        Ok(())
    }

    fn latest_two(&self, location_id: i64) -> Result<Vec<ForecastSnapshot>, StorageError> {
        let mut stmt = self.conn.prepare(
            "SELECT snapshot_json, raw_payload FROM forecasts
             WHERE location_id = ?1
             ORDER BY captured_at DESC
             LIMIT 2",
        )?;
        let rows = stmt.query_map(params![location_id], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, Option<String>>(1)?))
        })?;

        let mut snapshots = Vec::with_capacity(2);
        for row in rows {
            let (json, raw_payload) = row?;
            let mut snapshot: ForecastSnapshot = serde_json::from_str(&json)?;
            snapshot.raw_payload = raw_payload;
            snapshots.push(snapshot);
        }
        Ok(snapshots)
    }

    fn purge_older_than(&self, location_id: i64, cutoff: DateTime<Utc>) -> Result<PurgeReport, StorageError> {
        let cutoff_ms = cutoff.timestamp_millis();
        let tx = self.conn.unchecked_transaction()?;
        let forecasts = tx.execute(
            "DELETE FROM forecasts WHERE location_id = ?1 AND captured_at < ?2",
            params![location_id, cutoff_ms],
        )?;
        let discussions = tx.execute(
            "DELETE FROM discussions WHERE location_id = ?1 AND fetched_at < ?2",
            params![location_id, cutoff_ms],
        )?;
        let storms = tx.execute(
            "DELETE FROM detected_events WHERE location_id = ?1 AND detected_at < ?2",
            params![location_id, cutoff_ms],
        )?;
        tx.commit()?;

        let report = PurgeReport {
            forecasts,
            discussions,
            storms,
        };
        if report.total() > 0 {
            tracing::info!(
                "Purged {} forecasts, {} discussions and {} storm detections for location {} older than {}",
                forecasts,
                discussions,
                storms,
                location_id,
                cutoff
            );
        }
        Ok(report)
    }

    fn save_detected_events(
        &self,
        location_id: i64,
        detected_at: DateTime<Utc>,
        events: &[SnowEvent],
    ) -> Result<Vec<String>, StorageError> {
        self.insert_detected_events(location_id, detected_at, events)
    }

    fn save_discussion(&self, location_id: i64, discussion: &Discussion) -> Result<bool, StorageError> {
        let inserted = self.conn.execute(
            "INSERT OR IGNORE INTO discussions (location_id, issued_at, fetched_at, office, text)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                location_id,
                discussion.issued_at.timestamp_millis(),
                discussion.fetched_at.timestamp_millis(),
                discussion.office,
                discussion.text,
            ],
        )?;
        Ok(inserted > 0)
    }

    fn latest_discussion(&self, location_id: i64) -> Result<Option<Discussion>, StorageError> {
        let discussion = self
            .conn
            .query_row(
                "SELECT issued_at, fetched_at, office, text FROM discussions
                 WHERE location_id = ?1
                 ORDER BY issued_at DESC
                 LIMIT 1",
                params![location_id],
                |row| {
                    Ok(Discussion {
                        issued_at: millis_to_utc(0, row.get(0)?)?,
                        fetched_at: millis_to_utc(1, row.get(1)?)?,
                        office: row.get(2)?,
                        text: row.get(3)?,
                    })
                },
            )
            .optional()?;
        Ok(discussion)
    }
}

pub(crate) fn millis_to_utc(column: usize, ms: i64) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or(rusqlite::Error::IntegralValueOutOfRange(column, ms))
}
