//! Storage primitives shared by the relay: the error type, the `SQLite`
//! pool opener and the clock used for every persisted timestamp.

use std::path::Path;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use tracing::info;

#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Cannot open database: {0}")]
    Open(String),

    #[error("Migration error: {0}")]
    Migration(String),

    #[error("Query error: {0}")]
    Query(String),

    #[error("Not found: {0}")]
    NotFound(String),
}

impl From<sqlx::Error> for DatabaseError {
    fn from(e: sqlx::Error) -> Self {
        Self::Query(e.to_string())
    }
}

/// Where a database lives.
#[derive(Debug, Clone, Copy)]
pub enum Location<'a> {
    File(&'a Path),
    /// Private to the returned pool; gone when the pool closes.
    Memory,
}

/// Connect a pool for `location`.
///
/// Files get WAL journaling and a busy timeout, and their parent directory
/// is created on demand. An in-memory database is pinned to one connection
/// that never recycles, since a fresh connection would see an empty schema.
pub async fn connect(location: Location<'_>) -> Result<SqlitePool, DatabaseError> {
    let (options, pool) = match location {
        Location::File(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DatabaseError::Open(format!("{}: {e}", parent.display()))
                })?;
            }
            let options = SqliteConnectOptions::new()
                .filename(path)
                .create_if_missing(true)
                .journal_mode(SqliteJournalMode::Wal)
                .busy_timeout(Duration::from_secs(5));
            (options, SqlitePoolOptions::new().max_connections(4))
        }
        Location::Memory => {
            let options = SqliteConnectOptions::new().in_memory(true);
            let pool = SqlitePoolOptions::new()
                .max_connections(1)
                .idle_timeout(None)
                .max_lifetime(None);
            (options, pool)
        }
    };

    let pool = pool
        .connect_with(options.foreign_keys(true))
        .await
        .map_err(|e| DatabaseError::Open(e.to_string()))?;
    if let Location::File(path) = location {
        info!(path = %path.display(), "Database opened");
    }
    Ok(pool)
}

/// Seconds since the Unix epoch.
#[allow(clippy::cast_possible_wrap)]
pub fn unix_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn clock_is_past_2024() {
        assert!(unix_timestamp() > 1_704_067_200);
    }

    #[tokio::test]
    async fn file_database_gets_its_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("relay.db");

        let pool = connect(Location::File(&path)).await.unwrap();
        sqlx::query("SELECT 1").execute(&pool).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn memory_database_survives_across_queries() {
        let pool = connect(Location::Memory).await.unwrap();
        sqlx::query("CREATE TABLE seen (id INTEGER)")
            .execute(&pool)
            .await
            .unwrap();
        sqlx::query("INSERT INTO seen (id) VALUES (7)")
            .execute(&pool)
            .await
            .unwrap();

        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM seen")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn unreachable_file_is_an_open_error() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, b"").unwrap();

        let err = connect(Location::File(&blocker.join("relay.db")))
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::Open(_)));
    }
}
