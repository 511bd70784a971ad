//! JSON flat-file key-value store (fallback backend).
//!
//! One JSON object per file, rewritten on every mutation. Slower than the
//! database backend but has no native dependencies, which is exactly why it
//! exists: it is the structured-preferences fallback when `SQLite` cannot
//! be opened.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::sync::Mutex;
use tracing::warn;

use super::{KeyValueStore, Result};

/// Key-value store backed by a single JSON file.
///
/// An internal mutex serializes read-modify-write cycles so concurrent
/// writers cannot clobber each other's updates.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl JsonFileStore {
    /// Creates a store rooted at `path`. The file is created lazily on the
    /// first write.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    /// Reads the backing file into a map. A missing or corrupt file yields
    /// an empty map rather than an error; corruption is logged and the next
    /// write starts fresh.
    async fn read_map(&self) -> BTreeMap<String, String> {
        match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => match serde_json::from_str(&contents) {
                Ok(map) => map,
                Err(error) => {
                    warn!(
                        path = %self.path.display(),
                        error = %error,
                        "corrupt json store, starting empty"
                    );
                    BTreeMap::new()
                }
            },
            Err(_) => BTreeMap::new(),
        }
    }

    async fn write_map(&self, map: &BTreeMap<String, String>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let contents = serde_json::to_string(map)?;
        tokio::fs::write(&self.path, contents).await?;
        Ok(())
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl KeyValueStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let _guard = self.lock.lock().await;
        Ok(self.read_map().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map().await;
        map.insert(key.to_string(), value.to_string());
        self.write_map(&map).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let _guard = self.lock.lock().await;
        let mut map = self.read_map().await;
        if map.remove(key).is_some() {
            self.write_map(&map).await?;
        }
        Ok(())
    }

    fn backend_name(&self) -> &'static str {
        "json-file"
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_delete_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("kv.json"));

        assert_eq!(store.get("missing").await.unwrap(), None);

        store.put("a", "1").await.unwrap();
        store.put("b", "2").await.unwrap();
        assert_eq!(store.get("a").await.unwrap().as_deref(), Some("1"));

        store.delete("a").await.unwrap();
        assert_eq!(store.get("a").await.unwrap(), None);
        assert_eq!(store.get("b").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_corrupt_file_treated_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");
        std::fs::write(&path, "{not valid json!").unwrap();

        let store = JsonFileStore::new(&path);
        assert_eq!(store.get("anything").await.unwrap(), None);

        // A write after corruption starts a fresh map.
        store.put("k", "v").await.unwrap();
        assert_eq!(store.get("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn test_values_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.json");

        JsonFileStore::new(&path).put("persisted", "yes").await.unwrap();

        let store = JsonFileStore::new(&path);
        assert_eq!(store.get("persisted").await.unwrap().as_deref(), Some("yes"));
    }
}
