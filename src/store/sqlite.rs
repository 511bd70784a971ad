//! `SQLite`-backed key-value store (primary backend).
//!
//! A single `kv` table keyed by string. WAL mode and a busy timeout keep
//! concurrent readers from tripping over the writer.

use std::path::Path;

use async_trait::async_trait;
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use tracing::instrument;

use super::{KeyValueStore, Result};

/// Maximum connections in the pool. Kept low for `SQLite` since it uses
/// file-level locking.
const MAX_CONNECTIONS: u32 = 5;

/// `SQLite` busy timeout in milliseconds.
const BUSY_TIMEOUT_MS: u32 = 5000;

/// Key-value store backed by a `SQLite` database file.
#[derive(Debug, Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Opens (creating if needed) the database at `db_path` and ensures the
    /// `kv` table exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the
    /// connection or schema setup fails.
    #[instrument(skip(db_path), fields(path = %db_path.display()))]
    pub async fn open(db_path: &Path) -> Result<Self> {
        let db_url = format!("sqlite:{}?mode=rwc", db_path.display());

        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect(&db_url)
            .await?;

        Self::configure(&pool).await?;
        Ok(Self { pool })
    }

    /// Opens an in-memory database for testing.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`](super::StoreError::Database) if the
    /// connection fails.
    #[instrument]
    pub async fn open_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;

        sqlx::query("CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(&pool)
            .await?;

        Ok(Self { pool })
    }

    async fn configure(pool: &SqlitePool) -> Result<()> {
        // WAL mode for concurrent reads
        sqlx::query("PRAGMA journal_mode=WAL").execute(pool).await?;
        sqlx::query(&format!("PRAGMA busy_timeout={BUSY_TIMEOUT_MS}"))
            .execute(pool)
            .await?;
        sqlx::query("CREATE TABLE IF NOT EXISTS kv (key TEXT PRIMARY KEY, value TEXT NOT NULL)")
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[async_trait]
impl KeyValueStore for SqliteStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM kv WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>(0)))
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            "INSERT INTO kv (key, value) VALUES (?, ?) \
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
        )
        .bind(key)
        .bind(value)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM kv WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "sqlite"
    }
}
