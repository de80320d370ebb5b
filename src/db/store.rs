//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Result as SqlResult, Row};
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use super::gateway::Gateway;
use super::models::*;

/// Fixed-width so lexical order in SQLite matches time order.
const TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.9f";

const CONNECTIVITY_COLUMNS: &str =
    "time, target, probe_kind, success, latency_ms, error, attempts";
const SPEED_COLUMNS: &str =
    "time, download_mbps, upload_mbps, ping_ms, method, server, success, error, calibration_factor";
const OUTAGE_COLUMNS: &str =
    "id, start_time, end_time, severity, resolved, description, duration_seconds";

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("Not found")]
    NotFound,
    #[error("database connection poisoned")]
    Poisoned,
}

/// Thread-safe database store.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        Self::with_connection(Connection::open(path)?)
    }

    /// Create a store backed by a private in-memory database.
    pub fn open_in_memory() -> Result<Self, DbError> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self, DbError> {
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Initialize the database with migrations.
    fn init(&self) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute_batch(include_str!("../../migrations/000001_init.up.sql"))
            .map_err(|e| DbError::Migration(format!("Migration 1 failed: {}", e)))?;
        Ok(())
    }

    fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Row counts per table, used by the health endpoint.
    pub fn row_counts(&self) -> Result<(i64, i64, i64), DbError> {
        let conn = self.conn()?;
        let c: i64 = conn.query_row("SELECT COUNT(*) FROM connectivity_samples", [], |r| r.get(0))?;
        let s: i64 = conn.query_row("SELECT COUNT(*) FROM speed_samples", [], |r| r.get(0))?;
        let o: i64 = conn.query_row("SELECT COUNT(*) FROM outage_events", [], |r| r.get(0))?;
        Ok((c, s, o))
    }
}

impl Gateway for Store {
    // --- Connectivity ---

    fn append_connectivity(&self, samples: &[ConnectivitySample]) -> Result<(), DbError> {
        if samples.is_empty() {
            return Ok(());
        }

        let conn = self.conn()?;
        let tx = conn.unchecked_transaction()?;

        {
            let mut stmt = tx.prepare(&format!(
                "INSERT INTO connectivity_samples ({CONNECTIVITY_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"
            ))?;

            for s in samples {
                stmt.execute(params![
                    format_db_time(s.time),
                    s.target,
                    s.kind.as_str(),
                    s.success,
                    s.latency_ms,
                    s.error,
                    s.attempts,
                ])?;
            }
        }

        tx.commit()?;
        Ok(())
    }

    fn connectivity_in(&self, window: &TimeWindow) -> Result<Vec<ConnectivitySample>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONNECTIVITY_COLUMNS} FROM connectivity_samples
             WHERE time >= ?1 AND time < ?2 ORDER BY time ASC, id ASC"
        ))?;

        let samples = stmt
            .query_map(
                params![format_db_time(window.start), format_db_time(window.end)],
                connectivity_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    fn delete_connectivity_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM connectivity_samples WHERE time < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(n)
    }

    fn latest_connectivity(&self) -> Result<Option<ConnectivitySample>, DbError> {
        let conn = self.conn()?;
        let sample = conn
            .query_row(
                &format!(
                    "SELECT {CONNECTIVITY_COLUMNS} FROM connectivity_samples
                     ORDER BY time DESC, id DESC LIMIT 1"
                ),
                [],
                connectivity_from_row,
            )
            .optional()?;
        Ok(sample)
    }

    fn latest_round(&self) -> Result<Vec<ConnectivitySample>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {CONNECTIVITY_COLUMNS} FROM connectivity_samples
             WHERE time = (SELECT MAX(time) FROM connectivity_samples) ORDER BY id ASC"
        ))?;
        let samples = stmt
            .query_map([], connectivity_from_row)?
            .collect::<SqlResult<Vec<_>>>()?;
        Ok(samples)
    }

    // --- Speed ---

    fn append_speed(&self, sample: &SpeedSample) -> Result<(), DbError> {
        let conn = self.conn()?;
        conn.execute(
            &format!(
                "INSERT INTO speed_samples ({SPEED_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"
            ),
            params![
                format_db_time(sample.time),
                sample.download_mbps,
                sample.upload_mbps,
                sample.ping_ms,
                sample.method.as_str(),
                sample.server,
                sample.success,
                sample.error,
                sample.calibration_factor,
            ],
        )?;
        Ok(())
    }

    fn speed_in(&self, window: &TimeWindow) -> Result<Vec<SpeedSample>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {SPEED_COLUMNS} FROM speed_samples
             WHERE time >= ?1 AND time < ?2 ORDER BY time ASC, id ASC"
        ))?;

        let samples = stmt
            .query_map(
                params![format_db_time(window.start), format_db_time(window.end)],
                speed_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(samples)
    }

    fn delete_speed_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM speed_samples WHERE time < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(n)
    }

    fn latest_speed(&self) -> Result<Option<SpeedSample>, DbError> {
        let conn = self.conn()?;
        let sample = conn
            .query_row(
                &format!("SELECT {SPEED_COLUMNS} FROM speed_samples ORDER BY time DESC, id DESC LIMIT 1"),
                [],
                speed_from_row,
            )
            .optional()?;
        Ok(sample)
    }

    // --- Outages ---

    fn append_outage(&self, outage: &NewOutage) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT INTO outage_events (start_time, severity, resolved, description) VALUES (?1, ?2, 0, ?3)",
            params![
                format_db_time(outage.start),
                outage.severity.as_str(),
                outage.description,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn resolve_outage(&self, id: i64, end: DateTime<Utc>) -> Result<(), DbError> {
        let conn = self.conn()?;
        let start: Option<String> = conn
            .query_row(
                "SELECT start_time FROM outage_events WHERE id = ?1 AND resolved = 0",
                params![id],
                |row| row.get(0),
            )
            .optional()?;

        let start = start
            .as_deref()
            .and_then(parse_db_time)
            .ok_or(DbError::NotFound)?;
        let duration = (end - start).num_seconds().max(0);

        conn.execute(
            "UPDATE outage_events SET end_time = ?1, resolved = 1, duration_seconds = ?2
             WHERE id = ?3 AND resolved = 0",
            params![format_db_time(end), duration, id],
        )?;
        Ok(())
    }

    fn outages_in(&self, window: &TimeWindow) -> Result<Vec<OutageEvent>, DbError> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {OUTAGE_COLUMNS} FROM outage_events
             WHERE start_time < ?2 AND (end_time IS NULL OR end_time >= ?1)
             ORDER BY start_time ASC"
        ))?;

        let events = stmt
            .query_map(
                params![format_db_time(window.start), format_db_time(window.end)],
                outage_from_row,
            )?
            .collect::<SqlResult<Vec<_>>>()?;

        Ok(events)
    }

    fn delete_resolved_outages_before(&self, cutoff: DateTime<Utc>) -> Result<usize, DbError> {
        let conn = self.conn()?;
        let n = conn.execute(
            "DELETE FROM outage_events
             WHERE resolved = 1 AND end_time IS NOT NULL AND end_time < ?1",
            params![format_db_time(cutoff)],
        )?;
        Ok(n)
    }

    fn ongoing_outage(&self) -> Result<Option<OutageEvent>, DbError> {
        let conn = self.conn()?;
        let event = conn
            .query_row(
                &format!(
                    "SELECT {OUTAGE_COLUMNS} FROM outage_events
                     WHERE end_time IS NULL ORDER BY start_time DESC LIMIT 1"
                ),
                [],
                outage_from_row,
            )
            .optional()?;
        Ok(event)
    }
}

fn connectivity_from_row(row: &Row<'_>) -> SqlResult<ConnectivitySample> {
    Ok(ConnectivitySample {
        time: time_column(row, 0)?,
        target: row.get(1)?,
        kind: enum_column(row, 2)?,
        success: row.get(3)?,
        latency_ms: row.get(4)?,
        error: row.get(5)?,
        attempts: row.get(6)?,
    })
}

fn speed_from_row(row: &Row<'_>) -> SqlResult<SpeedSample> {
    Ok(SpeedSample {
        time: time_column(row, 0)?,
        download_mbps: row.get(1)?,
        upload_mbps: row.get(2)?,
        ping_ms: row.get(3)?,
        method: enum_column(row, 4)?,
        server: row.get(5)?,
        success: row.get(6)?,
        error: row.get(7)?,
        calibration_factor: row.get(8)?,
    })
}

fn outage_from_row(row: &Row<'_>) -> SqlResult<OutageEvent> {
    let end: Option<String> = row.get(2)?;
    let end = match end {
        Some(s) => Some(parse_db_time(&s).ok_or_else(|| bad_time(2, &s))?),
        None => None,
    };

    Ok(OutageEvent {
        id: row.get(0)?,
        start: time_column(row, 1)?,
        end,
        severity: enum_column(row, 3)?,
        resolved: row.get(4)?,
        description: row.get(5)?,
        duration_seconds: row.get(6)?,
    })
}

fn time_column(row: &Row<'_>, idx: usize) -> SqlResult<DateTime<Utc>> {
    let s: String = row.get(idx)?;
    parse_db_time(&s).ok_or_else(|| bad_time(idx, &s))
}

fn enum_column<T>(row: &Row<'_>, idx: usize) -> SqlResult<T>
where
    T: FromStr<Err = ParseEnumError>,
{
    let s: String = row.get(idx)?;
    s.parse()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)))
}

fn bad_time(idx: usize, s: &str) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        idx,
        Type::Text,
        format!("invalid timestamp: {}", s).into(),
    )
}

fn format_db_time(t: DateTime<Utc>) -> String {
    t.format(TIME_FORMAT).to_string()
}

/// Parse a datetime string from the database.
fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
    ];

    for fmt in &formats {
        if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(DateTime::from_naive_utc_and_offset(dt, Utc));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }

    None
}
