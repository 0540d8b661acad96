//! SQLite database store implementation.

use chrono::{DateTime, NaiveDateTime, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

mod embedded {
    refinery::embed_migrations!("migrations");
}

/// Database error types.
#[derive(Error, Debug)]
pub enum DbError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("Migration error: {0}")]
    Migration(String),
    #[error("invalid row: {0}")]
    InvalidRow(String),
    #[error("database lock poisoned")]
    Poisoned,
    #[error("Not found")]
    NotFound,
}

/// Thread-safe database store.
///
/// Query methods are split by concern across `registry`, `targets` and
/// `bus_log`; this file owns connection setup and shared helpers.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Create a new store with the given database path.
    pub fn new<P: AsRef<Path>>(path: P) -> Result<Self, DbError> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        store.init()?;
        Ok(store)
    }

    /// Configure the connection and run embedded migrations.
    fn init(&self) -> Result<(), DbError> {
        let mut conn = self.conn()?;

        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )?;

        embedded::migrations::runner()
            .run(&mut *conn)
            .map_err(|e| DbError::Migration(e.to_string()))?;

        Ok(())
    }

    /// Lock the shared connection.
    pub(super) fn conn(&self) -> Result<MutexGuard<'_, Connection>, DbError> {
        self.conn.lock().map_err(|_| DbError::Poisoned)
    }

    /// Run raw SQL and return the last inserted row id; lets tests build
    /// states the typed API refuses to produce.
    #[cfg(test)]
    pub(crate) fn execute_raw(&self, sql: &str) -> Result<i64, DbError> {
        let conn = self.conn()?;
        conn.execute(sql, [])?;
        Ok(conn.last_insert_rowid())
    }

    /// Get database size in bytes.
    pub fn get_db_size_bytes(&self) -> Result<i64, DbError> {
        let conn = self.conn()?;
        let page_count: i64 = conn.query_row("PRAGMA page_count", [], |r| r.get(0))?;
        let page_size: i64 = conn.query_row("PRAGMA page_size", [], |r| r.get(0))?;
        Ok(page_count * page_size)
    }
}

/// Format a timestamp the way every table stores it.
pub(super) fn format_db_time(t: DateTime<Utc>) -> String {
    t.format("%Y-%m-%d %H:%M:%S%.9f").to_string()
}

/// Parse a datetime string from the database.
pub(super) fn parse_db_time(s: &str) -> Option<DateTime<Utc>> {
    let formats = [
        "%Y-%m-%d %H:%M:%S%.9f",
        "%Y-%m-%d %H:%M:%S%.f",
        "%Y-%m-%d %H:%M:%S",
        "%Y-%m-%dT%H:%M:%S%.9fZ",
        "%Y-%m-%dT%H:%M:%SZ",
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

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::NamedTempFile;

    #[test]
    fn test_migrations_are_idempotent() {
        let tmp = NamedTempFile::new().unwrap();
        Store::new(tmp.path()).unwrap();
        // Reopening must not re-apply V1.
        let store = Store::new(tmp.path()).unwrap();
        assert!(store.get_db_size_bytes().unwrap() > 0);
    }

    #[test]
    fn test_db_time_round_trip() {
        let now = Utc::now();
        let parsed = parse_db_time(&format_db_time(now)).unwrap();
        assert_eq!(parsed, now);
        assert!(parse_db_time("2024-01-02T03:04:05Z").is_some());
        assert!(parse_db_time("yesterday").is_none());
    }
}
