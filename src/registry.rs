//! Task registry: the bridge's authoritative in-memory state.
//!
//! Four dependent maps live under one coarse lock:
//!
//! - os-id -> task configuration (the persisted map)
//! - task-id -> os-id (reverse lookup)
//! - task-id -> last reported percent / bytes (progress marks)
//! - task-id -> poller handle (stop flag + join handle)
//!
//! Every mutation that touches the persisted map writes it back to the
//! durable store before releasing the lock, so a crash loses at most the
//! update in flight. Removal clears all four maps in a single critical
//! section; partial removal is never observable.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, instrument, warn};

use crate::service::OsDownloadId;
use crate::store::{KEY_TASK_MAP, KeyValueStore};

/// Per-task configuration, persisted keyed by os download id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Caller-assigned stable task identifier.
    pub task_id: String,
    /// Source URL the download was submitted with.
    pub source_url: String,
    /// Final destination for the completed file.
    pub destination_path: PathBuf,
    /// Opaque caller metadata, echoed back on discovery.
    #[serde(default)]
    pub metadata: String,
    /// Title used for the platform notification, when one was requested.
    #[serde(default)]
    pub notification_title: Option<String>,
    /// Whether the begin event has already been emitted for this task.
    /// Persisted so a restart does not produce a second begin.
    #[serde(default)]
    pub reported_begin: bool,
}

/// Handle to a running poller task.
#[derive(Debug)]
pub struct PollerHandle {
    stop: Arc<AtomicBool>,
    // Held so the task is accounted for; dropping detaches, stopping is
    // always via the flag.
    _handle: JoinHandle<()>,
}

impl PollerHandle {
    /// Wraps a spawned poller with its stop flag.
    #[must_use]
    pub fn new(stop: Arc<AtomicBool>, handle: JoinHandle<()>) -> Self {
        Self {
            stop,
            _handle: handle,
        }
    }

    fn signal_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
    }
}

#[derive(Default)]
struct RegistryInner {
    by_os: HashMap<OsDownloadId, TaskConfig>,
    by_task: HashMap<String, OsDownloadId>,
    last_percent: HashMap<String, f64>,
    last_bytes: HashMap<String, u64>,
    pollers: HashMap<String, PollerHandle>,
}

/// Registry of active download tasks, backed by the durable store.
pub struct TaskRegistry {
    inner: Mutex<RegistryInner>,
    store: Arc<dyn KeyValueStore>,
}

impl TaskRegistry {
    /// Creates an empty registry persisting through `store`.
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self {
            inner: Mutex::new(RegistryInner::default()),
            store,
        }
    }

    /// Loads the persisted task map, replacing in-memory state, and returns
    /// the recovered entries so the caller can resume their pollers.
    ///
    /// Unreadable or corrupt persisted state yields an empty registry; the
    /// problem is logged and the next persist starts fresh.
    #[instrument(skip(self))]
    pub async fn load(&self) -> Vec<(OsDownloadId, TaskConfig)> {
        let raw = match self.store.get(KEY_TASK_MAP).await {
            Ok(raw) => raw,
            Err(error) => {
                warn!(error = %error, "could not read persisted task map, starting empty");
                None
            }
        };

        let by_os: HashMap<OsDownloadId, TaskConfig> = match raw {
            Some(raw) => match serde_json::from_str(&raw) {
                Ok(map) => map,
                Err(error) => {
                    warn!(error = %error, "corrupt persisted task map, starting empty");
                    HashMap::new()
                }
            },
            None => HashMap::new(),
        };

        let mut inner = self.inner.lock().await;
        inner.by_task = by_os
            .iter()
            .map(|(os_id, config)| (config.task_id.clone(), *os_id))
            .collect();
        inner.last_percent = by_os
            .values()
            .map(|config| (config.task_id.clone(), 0.0))
            .collect();
        inner.last_bytes = by_os
            .values()
            .map(|config| (config.task_id.clone(), 0))
            .collect();
        inner.by_os = by_os;

        debug!(tasks = inner.by_os.len(), "task registry loaded");
        inner
            .by_os
            .iter()
            .map(|(os_id, config)| (*os_id, config.clone()))
            .collect()
    }

    /// Registers a task under its os download id, seeding progress marks at
    /// zero, and persists the updated map.
    ///
    /// Re-registering a task id that already exists (restart re-link) simply
    /// overwrites the previous binding.
    #[instrument(skip(self, config), fields(task_id = %config.task_id))]
    pub async fn register(&self, os_id: OsDownloadId, config: TaskConfig) {
        let mut inner = self.inner.lock().await;
        inner.by_task.insert(config.task_id.clone(), os_id);
        inner.last_percent.insert(config.task_id.clone(), 0.0);
        inner.last_bytes.insert(config.task_id.clone(), 0);
        inner.by_os.insert(os_id, config);
        self.persist(&inner).await;
    }

    /// Looks up a task's configuration by its os download id.
    pub async fn lookup_by_os_id(&self, os_id: OsDownloadId) -> Option<TaskConfig> {
        self.inner.lock().await.by_os.get(&os_id).cloned()
    }

    /// Looks up the os download id bound to a task id.
    pub async fn lookup_by_task_id(&self, task_id: &str) -> Option<OsDownloadId> {
        self.inner.lock().await.by_task.get(task_id).copied()
    }

    /// Attaches the poller handle for a task. A previous handle for the same
    /// task is signalled to stop first.
    pub async fn attach_poller(&self, task_id: &str, handle: PollerHandle) {
        let mut inner = self.inner.lock().await;
        if let Some(previous) = inner.pollers.insert(task_id.to_string(), handle) {
            previous.signal_stop();
        }
    }

    /// Signals a task's poller to stop and detaches it. No-op when the task
    /// has no poller.
    pub async fn stop_poller(&self, task_id: &str) {
        if let Some(handle) = self.inner.lock().await.pollers.remove(task_id) {
            handle.signal_stop();
        }
    }

    /// Claims the right to report a task's begin event. The first caller
    /// flips the persisted flag and gets `true`; later callers (and unknown
    /// ids) get `false`, so the event goes out exactly once, including
    /// across restarts.
    pub async fn claim_begin_report(&self, os_id: OsDownloadId) -> bool {
        let mut inner = self.inner.lock().await;
        let claimed = match inner.by_os.get_mut(&os_id) {
            Some(config) if !config.reported_begin => {
                config.reported_begin = true;
                true
            }
            _ => false,
        };
        if claimed {
            self.persist(&inner).await;
        }
        claimed
    }

    /// Records the latest reported progress marks for a task. In-memory
    /// only; marks reset to zero on restart.
    pub async fn update_progress_marks(&self, task_id: &str, percent: f64, bytes: u64) {
        let mut inner = self.inner.lock().await;
        inner.last_percent.insert(task_id.to_string(), percent);
        inner.last_bytes.insert(task_id.to_string(), bytes);
    }

    /// Returns the last reported (percent, bytes) marks for a task, zeroes
    /// when the task is unknown.
    pub async fn progress_marks(&self, task_id: &str) -> (f64, u64) {
        let inner = self.inner.lock().await;
        (
            inner.last_percent.get(task_id).copied().unwrap_or(0.0),
            inner.last_bytes.get(task_id).copied().unwrap_or(0),
        )
    }

    /// Removes a task and everything attached to it in one critical section:
    /// configuration, reverse mapping, progress marks, and the poller (which
    /// is signalled to stop). Persists the shrunken map before releasing the
    /// lock. Returns the removed configuration, if the id was known.
    #[instrument(skip(self))]
    pub async fn remove(&self, os_id: OsDownloadId) -> Option<TaskConfig> {
        let mut inner = self.inner.lock().await;
        let config = inner.by_os.remove(&os_id)?;

        inner.by_task.remove(&config.task_id);
        inner.last_percent.remove(&config.task_id);
        inner.last_bytes.remove(&config.task_id);
        if let Some(handle) = inner.pollers.remove(&config.task_id) {
            handle.signal_stop();
        }

        self.persist(&inner).await;
        debug!(task_id = %config.task_id, "task removed from registry");
        Some(config)
    }

    /// The currently persisted (os-id, config) pairs.
    pub async fn snapshot(&self) -> Vec<(OsDownloadId, TaskConfig)> {
        self.inner
            .lock()
            .await
            .by_os
            .iter()
            .map(|(os_id, config)| (*os_id, config.clone()))
            .collect()
    }

    /// Writes the primary map back to the store. Called with the lock held;
    /// a failed write is logged and the in-memory state stays authoritative.
    async fn persist(&self, inner: &RegistryInner) {
        let serialized = match serde_json::to_string(&inner.by_os) {
            Ok(serialized) => serialized,
            Err(error) => {
                warn!(error = %error, "could not serialize task map");
                return;
            }
        };
        if let Err(error) = self.store.put(KEY_TASK_MAP, &serialized).await {
            warn!(error = %error, "could not persist task map");
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::store::SqliteStore;

    fn config(task_id: &str) -> TaskConfig {
        TaskConfig {
            task_id: task_id.to_string(),
            source_url: format!("https://example.com/{task_id}"),
            destination_path: PathBuf::from(format!("/downloads/{task_id}.bin")),
            metadata: String::new(),
            notification_title: None,
            reported_begin: false,
        }
    }

    async fn registry() -> TaskRegistry {
        let store = SqliteStore::open_in_memory().await.unwrap();
        TaskRegistry::new(Arc::new(store))
    }

    #[tokio::test]
    async fn test_register_and_lookup_both_directions() {
        let registry = registry().await;
        registry.register(OsDownloadId(7), config("alpha")).await;

        assert_eq!(
            registry.lookup_by_task_id("alpha").await,
            Some(OsDownloadId(7))
        );
        let found = registry.lookup_by_os_id(OsDownloadId(7)).await.unwrap();
        assert_eq!(found.task_id, "alpha");
        assert_eq!(registry.progress_marks("alpha").await, (0.0, 0));
    }

    #[tokio::test]
    async fn test_remove_clears_every_dependent_map() {
        let registry = registry().await;
        registry.register(OsDownloadId(1), config("doomed")).await;
        registry.update_progress_marks("doomed", 0.5, 500).await;

        let stop = Arc::new(AtomicBool::new(false));
        let handle = tokio::spawn(async {});
        registry
            .attach_poller("doomed", PollerHandle::new(Arc::clone(&stop), handle))
            .await;

        let removed = registry.remove(OsDownloadId(1)).await.unwrap();
        assert_eq!(removed.task_id, "doomed");

        assert!(registry.lookup_by_os_id(OsDownloadId(1)).await.is_none());
        assert!(registry.lookup_by_task_id("doomed").await.is_none());
        assert_eq!(registry.progress_marks("doomed").await, (0.0, 0));
        assert!(stop.load(Ordering::SeqCst), "poller must be signalled");
        assert!(registry.remove(OsDownloadId(1)).await.is_none());
    }

    #[tokio::test]
    async fn test_task_map_round_trips_through_store() {
        let store: Arc<dyn KeyValueStore> =
            Arc::new(SqliteStore::open_in_memory().await.unwrap());

        let registry = TaskRegistry::new(Arc::clone(&store));
        registry.register(OsDownloadId(1), config("one")).await;
        registry.register(OsDownloadId(2), config("two")).await;
        assert!(registry.claim_begin_report(OsDownloadId(2)).await);
        assert!(
            !registry.claim_begin_report(OsDownloadId(2)).await,
            "second claim must lose"
        );
        assert!(!registry.claim_begin_report(OsDownloadId(404)).await);
        let mut expected = registry.snapshot().await;
        expected.sort_by_key(|(os_id, _)| *os_id);

        let reloaded = TaskRegistry::new(store);
        let mut recovered = reloaded.load().await;
        recovered.sort_by_key(|(os_id, _)| *os_id);

        assert_eq!(recovered, expected);
        assert!(recovered[1].1.reported_begin);
        assert_eq!(
            reloaded.lookup_by_task_id("one").await,
            Some(OsDownloadId(1))
        );
    }

    #[tokio::test]
    async fn test_corrupt_persisted_map_loads_empty() {
        let store: Arc<dyn KeyValueStore> =
            Arc::new(SqliteStore::open_in_memory().await.unwrap());
        store.put(KEY_TASK_MAP, "{broken").await.unwrap();

        let registry = TaskRegistry::new(store);
        assert!(registry.load().await.is_empty());
        assert!(registry.snapshot().await.is_empty());
    }

    #[tokio::test]
    async fn test_attach_poller_replaces_and_stops_previous() {
        let registry = registry().await;
        registry.register(OsDownloadId(3), config("swap")).await;

        let first_stop = Arc::new(AtomicBool::new(false));
        registry
            .attach_poller(
                "swap",
                PollerHandle::new(Arc::clone(&first_stop), tokio::spawn(async {})),
            )
            .await;
        registry
            .attach_poller(
                "swap",
                PollerHandle::new(Arc::new(AtomicBool::new(false)), tokio::spawn(async {})),
            )
            .await;

        assert!(first_stop.load(Ordering::SeqCst));
    }
}
