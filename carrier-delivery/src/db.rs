//! SQLite persistence shared by the registry and the queue store.
//!
//! One [`Database`] is opened at startup and handed to every component
//! that needs it. The file may be shared by several relay processes; WAL
//! mode and a busy timeout let them queue for the write lock instead of
//! failing.

use std::{path::PathBuf, time::Duration};

use carrier_common::internal;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use sqlx::{
    SqlitePool,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions, SqliteSynchronous},
};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("Database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt {table} row: {reason}")]
    Corrupt { table: &'static str, reason: String },

    /// Another claimer took over the host after our lease expired.
    #[error("Lease on {0} was lost")]
    LeaseLost(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_path")]
    pub path: PathBuf,

    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// How long a writer waits for another to finish before giving up.
    #[serde(default = "default_busy_timeout_secs")]
    pub busy_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_path(),
            max_connections: default_max_connections(),
            busy_timeout_secs: default_busy_timeout_secs(),
        }
    }
}

fn default_path() -> PathBuf {
    PathBuf::from("/var/lib/carrier/carrier.db")
}

const fn default_max_connections() -> u32 {
    8
}

const fn default_busy_timeout_secs() -> u64 {
    30
}

const SCHEMA: [&str; 3] = [
    "CREATE TABLE IF NOT EXISTS hosts (
        name         TEXT PRIMARY KEY NOT NULL,
        lock_expires INTEGER,
        next_attempt INTEGER,
        attempts     INTEGER NOT NULL DEFAULT 0
    )",
    "CREATE TABLE IF NOT EXISTS queue_items (
        id           INTEGER PRIMARY KEY AUTOINCREMENT,
        created_time INTEGER NOT NULL,
        lock_expires INTEGER,
        next_attempt INTEGER,
        attempts     INTEGER NOT NULL DEFAULT 0,
        host         TEXT NOT NULL,
        mail_from    TEXT NOT NULL,
        rcpt_to      TEXT NOT NULL,
        body         TEXT NOT NULL,
        owner        TEXT
    )",
    "CREATE INDEX IF NOT EXISTS queue_items_by_host
        ON queue_items (host, created_time, id)",
];

#[derive(Debug, Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    /// Opens (creating if needed) the database file and its schema.
    pub async fn connect(config: &DatabaseConfig) -> Result<Self, DatabaseError> {
        if let Some(parent) = config.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }

        internal!("Opening database {}", config.path.display());

        let options = SqliteConnectOptions::new()
            .filename(&config.path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(config.busy_timeout_secs));

        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections)
            .connect_with(options)
            .await?;

        let database = Self { pool };
        database.migrate().await?;
        Ok(database)
    }

    async fn migrate(&self) -> Result<(), DatabaseError> {
        for statement in SCHEMA {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

/// Current time at the millisecond precision timestamps are stored with,
/// so values read back compare equal to values written.
#[must_use]
pub fn now() -> DateTime<Utc> {
    let now = Utc::now();
    DateTime::from_timestamp_millis(now.timestamp_millis()).unwrap_or(now)
}

pub(crate) fn to_millis(time: DateTime<Utc>) -> i64 {
    time.timestamp_millis()
}

pub(crate) fn opt_to_millis(time: Option<DateTime<Utc>>) -> Option<i64> {
    time.map(to_millis)
}

pub(crate) fn from_millis(
    table: &'static str,
    millis: i64,
) -> Result<DateTime<Utc>, DatabaseError> {
    DateTime::from_timestamp_millis(millis).ok_or_else(|| DatabaseError::Corrupt {
        table,
        reason: format!("timestamp {millis} out of range"),
    })
}

pub(crate) fn opt_from_millis(
    table: &'static str,
    millis: Option<i64>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    millis.map(|ms| from_millis(table, ms)).transpose()
}

pub(crate) fn attempts_from(table: &'static str, raw: i64) -> Result<u32, DatabaseError> {
    u32::try_from(raw).map_err(|_| DatabaseError::Corrupt {
        table,
        reason: format!("attempt count {raw} out of range"),
    })
}


#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn schema_is_idempotent() {
        let (dir, database) = testing::database().await;
        database.close().await;

        let config = DatabaseConfig {
            path: dir.path().join("carrier.db"),
            ..DatabaseConfig::default()
        };
        let reopened = Database::connect(&config).await.unwrap();
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM hosts")
            .fetch_one(reopened.pool())
            .await
            .unwrap();
        assert_eq!(count, 0);
    }

    #[test]
    fn now_round_trips_through_millis() {
        let t = now();
        assert_eq!(from_millis("hosts", to_millis(t)).unwrap(), t);
    }

    #[test]
    fn config_defaults() {
        let config: DatabaseConfig = ron::from_str(r#"(path: "/tmp/relay.db")"#).unwrap();
        assert_eq!(config.path, PathBuf::from("/tmp/relay.db"));
        assert_eq!(config.max_connections, 8);
        assert_eq!(config.busy_timeout_secs, 30);
    }
}
