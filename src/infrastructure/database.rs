//! Pooled SQLite connection

use crate::error::{Error, Result};
use sqlx::SqlitePool;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use std::ops::{Deref, DerefMut};
use std::str::FromStr;

pub struct DatabaseConnection {
    connection: SqlitePool,
}

impl DatabaseConnection {
    /// Opens (creating if needed) the database at `database_url` and applies migrations.
    pub async fn connect(database_url: &str) -> Result<DatabaseConnection> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .foreign_keys(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::migrate(&pool).await?;
        Ok(DatabaseConnection { connection: pool })
    }

    /// Private in-memory database, one connection kept alive for the pool's lifetime.
    pub async fn in_memory() -> Result<DatabaseConnection> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;

        Self::migrate(&pool).await?;
        Ok(DatabaseConnection { connection: pool })
    }

    pub fn from_pool(pool: SqlitePool) -> DatabaseConnection {
        DatabaseConnection { connection: pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.connection
    }

    async fn migrate(pool: &SqlitePool) -> Result<()> {
        sqlx::migrate!()
            .run(pool)
            .await
            .map_err(|e| Error::Database(e.into()))
    }
}

impl Deref for DatabaseConnection {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.connection
    }
}

impl DerefMut for DatabaseConnection {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.connection
    }
}
