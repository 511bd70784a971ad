//! Durable key-value store for task state and tunable settings.
//!
//! The bridge persists a serialized task map plus two scalar settings so
//! downloads survive a process restart. Two backends implement the same
//! [`KeyValueStore`] capability:
//!
//! - [`SqliteStore`] - the primary, fast backend (`SQLite` via sqlx)
//! - [`JsonFileStore`] - a flat-file fallback used when the database
//!   cannot be opened
//!
//! [`open_store`] selects the backend at startup; nothing above this module
//! ever branches on which backend is active.

mod json_file;
mod sqlite;

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::warn;

pub use json_file::JsonFileStore;
pub use sqlite::SqliteStore;

/// Fixed key for the serialized os-id -> task-config map.
pub const KEY_TASK_MAP: &str = "downloads.task_map";

/// Fixed key for the persisted progress report interval (milliseconds).
pub const KEY_PROGRESS_INTERVAL: &str = "downloads.progress_interval";

/// Fixed key for the persisted minimum-bytes progress threshold.
pub const KEY_PROGRESS_MIN_BYTES: &str = "downloads.progress_min_bytes";

/// Result type for store operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors from the durable key-value store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// File-backed store could not be read or written.
    #[error("store io error: {0}")]
    Io(#[from] std::io::Error),

    /// Stored value could not be serialized or deserialized.
    #[error("store serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Capability interface over a durable string key-value store.
///
/// Implementations must be safe for concurrent use; the bridge calls them
/// from inside its registry lock so writes are serialized with the
/// mutations that triggered them.
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Returns the value stored under `key`, if any.
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    async fn put(&self, key: &str, value: &str) -> Result<()>;

    /// Removes `key` if present.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Short name of the active backend, exposed through the bridge
    /// constants ("sqlite" or "json-file").
    fn backend_name(&self) -> &'static str;
}

/// Opens the durable store under `dir`, preferring the `SQLite` backend.
///
/// Falls back to the JSON-file backend when the database cannot be opened
/// (missing sqlite support on the platform, unwritable path, corrupt file).
/// The fallback itself is infallible to construct; a corrupt fallback file
/// is treated as empty on first read.
pub async fn open_store(dir: &Path) -> Arc<dyn KeyValueStore> {
    match SqliteStore::open(&dir.join("downloads.db")).await {
        Ok(store) => Arc::new(store),
        Err(error) => {
            warn!(
                dir = %dir.display(),
                error = %error,
                "sqlite store unavailable, falling back to json file store"
            );
            Arc::new(JsonFileStore::new(dir.join("downloads.json")))
        }
    }
}
