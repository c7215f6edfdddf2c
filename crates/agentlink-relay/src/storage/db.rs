//! SQLite database for the agentlink relay.

use std::path::Path;

use sqlx::SqlitePool;
use tracing::info;

pub use agentlink_core::db::DatabaseError;
use agentlink_core::db::{Location, connect};

/// Handle to the relay database. Clones share one pool.
#[derive(Clone)]
pub struct RelayDatabase {
    pool: SqlitePool,
}

impl RelayDatabase {
    /// Open or create the database file and bring its schema up to date.
    pub async fn open(path: &Path) -> Result<Self, DatabaseError> {
        Self::migrated(connect(Location::File(path)).await?).await
    }

    /// Fresh private database, used by tests.
    pub async fn open_in_memory() -> Result<Self, DatabaseError> {
        Self::migrated(connect(Location::Memory).await?).await
    }

    async fn migrated(pool: SqlitePool) -> Result<Self, DatabaseError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| DatabaseError::Migration(e.to_string()))?;
        info!("Relay schema up to date");
        Ok(Self { pool })
    }

    pub(crate) const fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}
