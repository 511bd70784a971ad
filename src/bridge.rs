//! Application-facing facade.
//!
//! # Overview
//!
//! [`DownloadBridge`] ties the pieces together: it accepts download
//! requests, registers them, spawns their pollers, reconciles service
//! completion notices (file move, events, purge), recovers persisted tasks
//! after a restart, and answers discovery queries.
//!
//! Everything after a request is accepted surfaces through the event sink;
//! the only synchronous errors are parameter rejections and submission
//! failures.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use background_downloader::bridge::{BridgeConfig, DownloadBridge, DownloadRequest};
//! use background_downloader::events::ChannelSink;
//! use background_downloader::fsops::NoopMediaScanner;
//! use background_downloader::service::HttpDownloadService;
//! use background_downloader::store::open_store;
//!
//! # async fn run() -> background_downloader::error::Result<()> {
//! let store = open_store(std::path::Path::new("/var/lib/app")).await;
//! let (service, completions) = HttpDownloadService::new("/var/lib/app/staging")?;
//! let (sink, mut events) = ChannelSink::new();
//!
//! let bridge = Arc::new(DownloadBridge::new(
//!     BridgeConfig { download_dir: "/var/lib/app/downloads".into() },
//!     Arc::new(service),
//!     completions,
//!     Arc::new(sink),
//!     Arc::new(NoopMediaScanner),
//!     store,
//! ));
//! bridge.start().await;
//!
//! bridge
//!     .download_file(DownloadRequest {
//!         url: "https://example.com/file.bin".to_string(),
//!         destination_path: "/var/lib/app/downloads/file.bin".into(),
//!         task_id: "file-1".to_string(),
//!         ..DownloadRequest::default()
//!     })
//!     .await?;
//!
//! while let Some(event) = events.recv().await {
//!     println!("{event:?}");
//! }
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info, instrument, warn};
use url::Url;

use crate::error::{BridgeError, Result};
use crate::events::{DownloadEvent, EventSink, ProgressEmitter, ProgressSettings};
use crate::fsops::{self, MediaScanner};
use crate::poller::{self, PollerContext};
use crate::registry::{TaskConfig, TaskRegistry};
use crate::service::{
    CompletionFeed, DownloadService, FailureCode, OsDownloadId, ServiceState,
};
use crate::store::{KEY_PROGRESS_INTERVAL, KEY_PROGRESS_MIN_BYTES, KeyValueStore};

/// Numeric task state: actively downloading.
pub const TASK_RUNNING: i64 = 0;
/// Numeric task state: suspended by the service.
pub const TASK_SUSPENDED: i64 = 1;
/// Numeric task state: failed, being torn down.
pub const TASK_CANCELING: i64 = 2;
/// Numeric task state: finished.
pub const TASK_COMPLETED: i64 = 3;

/// Reason text substituted when the service reports it cannot resume a
/// download; the original reason is unrecoverable by then.
const CANNOT_RESUME_GUIDANCE: &str = "unable to resume download, restart it from the beginning";

/// Maps a service state onto the numeric task-state code exposed to the
/// application.
#[must_use]
pub fn task_state_code(state: ServiceState) -> i64 {
    match state {
        ServiceState::Pending | ServiceState::Running => TASK_RUNNING,
        ServiceState::Paused => TASK_SUSPENDED,
        ServiceState::Failed => TASK_CANCELING,
        ServiceState::Successful => TASK_COMPLETED,
    }
}

/// Static bridge configuration.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Default directory offered to callers for destinations; exposed
    /// through [`DownloadBridge::constants`].
    pub download_dir: PathBuf,
}

/// One download request from the application.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DownloadRequest {
    /// Source URL.
    pub url: String,
    /// Where the completed file must end up.
    pub destination_path: PathBuf,
    /// Caller-assigned stable task id.
    pub task_id: String,
    /// Extra request headers.
    #[serde(default)]
    pub headers: Option<HashMap<String, String>>,
    /// Opaque metadata echoed back on discovery.
    #[serde(default)]
    pub metadata: Option<String>,
    /// Positive value overrides the progress batch interval (ms).
    #[serde(default)]
    pub progress_interval_ms: Option<u64>,
    /// Positive value overrides the minimum-bytes progress threshold.
    #[serde(default)]
    pub progress_min_bytes: Option<u64>,
    /// Transfer may proceed over roaming connections.
    #[serde(default = "default_true")]
    pub allow_over_roaming: bool,
    /// Transfer may proceed over metered connections.
    #[serde(default = "default_true")]
    pub allow_over_metered: bool,
    /// Show a platform notification for the transfer.
    #[serde(default)]
    pub show_notification: bool,
    /// Title for the platform notification.
    #[serde(default)]
    pub notification_title: Option<String>,
}

fn default_true() -> bool {
    true
}

impl Default for DownloadRequest {
    fn default() -> Self {
        Self {
            url: String::new(),
            destination_path: PathBuf::new(),
            task_id: String::new(),
            headers: None,
            metadata: None,
            progress_interval_ms: None,
            progress_min_bytes: None,
            allow_over_roaming: true,
            allow_over_metered: true,
            show_notification: false,
            notification_title: None,
        }
    }
}

/// A download recovered by [`DownloadBridge::check_for_existing_downloads`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FoundDownload {
    /// Caller-assigned task id.
    pub task_id: String,
    /// Metadata the download was submitted with.
    pub metadata: String,
    /// Numeric task state code.
    pub state: i64,
    /// Bytes received so far.
    pub bytes_downloaded: u64,
    /// Expected total, when known.
    pub bytes_total: Option<u64>,
}

/// Values the application needs up front.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConstants {
    /// Default directory for download destinations.
    pub download_dir: PathBuf,
    /// Numeric code for a running task.
    pub task_running: i64,
    /// Numeric code for a suspended task.
    pub task_suspended: i64,
    /// Numeric code for a task being torn down.
    pub task_canceling: i64,
    /// Numeric code for a completed task.
    pub task_completed: i64,
    /// Name of the active durable-store backend.
    pub storage_backend: &'static str,
}

/// The bridge between application code and the download service.
pub struct DownloadBridge {
    config: BridgeConfig,
    service: Arc<dyn DownloadService>,
    registry: Arc<TaskRegistry>,
    emitter: Arc<ProgressEmitter>,
    settings: Arc<StdMutex<ProgressSettings>>,
    store: Arc<dyn KeyValueStore>,
    scanner: Arc<dyn MediaScanner>,
    // Completed-file moves run one at a time.
    move_gate: Semaphore,
    // Taken by start() when the reconciler is spawned.
    completions: Mutex<Option<CompletionFeed>>,
    staging_seq: AtomicU64,
}

impl DownloadBridge {
    /// Wires the bridge together. Nothing runs until [`start`] is called.
    ///
    /// [`start`]: DownloadBridge::start
    pub fn new(
        config: BridgeConfig,
        service: Arc<dyn DownloadService>,
        completions: CompletionFeed,
        sink: Arc<dyn EventSink>,
        scanner: Arc<dyn MediaScanner>,
        store: Arc<dyn KeyValueStore>,
    ) -> Self {
        let settings = Arc::new(StdMutex::new(ProgressSettings::default()));
        let emitter = Arc::new(ProgressEmitter::new(sink, Arc::clone(&settings)));
        Self {
            config,
            service,
            registry: Arc::new(TaskRegistry::new(Arc::clone(&store))),
            emitter,
            settings,
            store,
            scanner,
            move_gate: Semaphore::new(1),
            completions: Mutex::new(Some(completions)),
            staging_seq: AtomicU64::new(0),
        }
    }

    /// Loads persisted settings and tasks, resumes a poller for every
    /// recovered task, and spawns the reconciler worker. Call once.
    #[instrument(skip(self))]
    pub async fn start(self: &Arc<Self>) {
        self.load_settings().await;

        let recovered = self.registry.load().await;
        info!(tasks = recovered.len(), "resuming persisted downloads");
        for (os_id, task) in recovered {
            self.spawn_poller(os_id, &task).await;
        }

        let feed = self.completions.lock().await.take();
        if let Some(mut feed) = feed {
            let bridge = Arc::clone(self);
            tokio::spawn(async move {
                while let Some(os_id) = feed.recv().await {
                    bridge.reconcile(os_id).await;
                }
                debug!("completion feed closed, reconciler exiting");
            });
        } else {
            warn!("start called more than once, reconciler already running");
        }
    }

    /// Submits a download.
    ///
    /// Rejections are synchronous; every failure after acceptance surfaces
    /// as a [`DownloadEvent::Failed`] on the sink instead.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Parameter`] for a missing task id, url, or
    /// destination, or an unparseable url; [`BridgeError::Service`] when
    /// submission itself fails.
    #[instrument(skip(self, request), fields(task_id = %request.task_id))]
    pub async fn download_file(&self, request: DownloadRequest) -> Result<()> {
        if request.task_id.is_empty() {
            return Err(BridgeError::missing_field("task_id"));
        }
        if request.url.is_empty() {
            return Err(BridgeError::missing_field("url"));
        }
        if request.destination_path.as_os_str().is_empty() {
            return Err(BridgeError::missing_field("destination_path"));
        }
        Url::parse(&request.url)
            .map_err(|error| BridgeError::Parameter(format!("invalid url: {error}")))?;

        self.apply_setting_overrides(&request).await;

        let staging_filename = self.staging_filename(&request.destination_path);
        let os_id = self
            .service
            .submit(crate::service::SubmitRequest {
                url: request.url.clone(),
                headers: request.headers.clone().unwrap_or_default(),
                staging_filename,
                allow_over_roaming: request.allow_over_roaming,
                allow_over_metered: request.allow_over_metered,
                show_notification: request.show_notification,
                notification_title: request.notification_title.clone(),
            })
            .await?;

        let task = TaskConfig {
            task_id: request.task_id.clone(),
            source_url: request.url,
            destination_path: request.destination_path,
            metadata: request.metadata.unwrap_or_default(),
            notification_title: request.notification_title,
            reported_begin: false,
        };
        self.registry.register(os_id, task.clone()).await;
        self.spawn_poller(os_id, &task).await;

        info!(task_id = %task.task_id, os_id = %os_id, "download accepted");
        Ok(())
    }

    /// Cancels a download and forgets it. Unknown task ids are a silent
    /// no-op.
    #[instrument(skip(self))]
    pub async fn cancel_download(&self, task_id: &str) {
        let Some(os_id) = self.registry.lookup_by_task_id(task_id).await else {
            debug!(task_id = %task_id, "cancel for unknown task, ignoring");
            return;
        };

        self.emitter.drop_pending(task_id);
        self.registry.remove(os_id).await;
        if let Err(error) = self.service.cancel(os_id).await {
            debug!(task_id = %task_id, error = %error, "service had no record to cancel");
        }
        info!(task_id = %task_id, "download cancelled");
    }

    /// Pausing is not supported by the underlying service; logged and
    /// ignored.
    pub fn pause_download(&self, task_id: &str) {
        warn!(task_id = %task_id, "pause is not supported, ignoring");
    }

    /// Resuming is not supported by the underlying service; logged and
    /// ignored.
    pub fn resume_download(&self, task_id: &str) {
        warn!(task_id = %task_id, "resume is not supported, ignoring");
    }

    /// Reconciles service records against the registry and reports every
    /// download the application still owns.
    ///
    /// Already-successful entries get their file move performed (best
    /// effort) before reporting; service records with no owning task are
    /// cancelled.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Service`] when the service cannot enumerate its
    /// records.
    #[instrument(skip(self))]
    pub async fn check_for_existing_downloads(&self) -> Result<Vec<FoundDownload>> {
        let mut found = Vec::new();

        for (os_id, snapshot) in self.service.list_all().await? {
            let Some(task) = self.registry.lookup_by_os_id(os_id).await else {
                debug!(os_id = %os_id, "orphan service record, cancelling");
                if let Err(error) = self.service.cancel(os_id).await {
                    debug!(os_id = %os_id, error = %error, "orphan cancel failed");
                }
                continue;
            };

            if snapshot.state == ServiceState::Successful {
                if let Some(staged) = &snapshot.local_path {
                    let moved = {
                        // The gate is never closed; acquire cannot fail.
                        let _permit = self.move_gate.acquire().await.ok();
                        fsops::move_to_destination(staged, &task.destination_path).await
                    };
                    if let Err(error) = moved {
                        warn!(task_id = %task.task_id, error = %error, "deferred file move failed");
                    }
                }
            }

            // Re-link so lookups and progress marks are fresh for this run.
            self.registry.register(os_id, task.clone()).await;

            found.push(FoundDownload {
                task_id: task.task_id,
                metadata: task.metadata,
                state: task_state_code(snapshot.state),
                bytes_downloaded: snapshot.bytes_downloaded,
                bytes_total: snapshot.bytes_total,
            });
        }

        Ok(found)
    }

    /// Platform lifecycle acknowledgement that a task's events were
    /// handled. Nothing to release in this implementation.
    pub fn complete_handler(&self, task_id: &str) {
        debug!(task_id = %task_id, "completion acknowledged");
    }

    /// Values the application needs before any download starts.
    #[must_use]
    pub fn constants(&self) -> BridgeConstants {
        BridgeConstants {
            download_dir: self.config.download_dir.clone(),
            task_running: TASK_RUNNING,
            task_suspended: TASK_SUSPENDED,
            task_canceling: TASK_CANCELING,
            task_completed: TASK_COMPLETED,
            storage_backend: self.store.backend_name(),
        }
    }

    async fn spawn_poller(&self, os_id: OsDownloadId, task: &TaskConfig) {
        let ctx = PollerContext {
            service: Arc::clone(&self.service),
            registry: Arc::clone(&self.registry),
            emitter: Arc::clone(&self.emitter),
            settings: Arc::clone(&self.settings),
        };
        let handle = poller::spawn(ctx, os_id, task.task_id.clone(), task.reported_begin);
        self.registry.attach_poller(&task.task_id, handle).await;
    }

    /// Handles one completion notice from the service.
    #[instrument(skip(self))]
    async fn reconcile(&self, os_id: OsDownloadId) {
        let Some(task) = self.registry.lookup_by_os_id(os_id).await else {
            debug!(os_id = %os_id, "completion for unknown download, cancelling record");
            if let Err(error) = self.service.cancel(os_id).await {
                debug!(os_id = %os_id, error = %error, "orphan cancel failed");
            }
            return;
        };

        self.registry.stop_poller(&task.task_id).await;
        self.emitter.drop_pending(&task.task_id);

        // A transfer can finish before its poller ever ran; the begin event
        // still goes out first.
        if !task.reported_begin && self.registry.claim_begin_report(os_id).await {
            let info = self
                .service
                .begin_info(os_id)
                .await
                .unwrap_or_default();
            self.emitter.emit_immediate(DownloadEvent::Begin {
                id: task.task_id.clone(),
                headers: info.headers,
                expected_bytes: info.expected_bytes,
            });
        }

        let snapshot = match self.service.query_status(os_id).await {
            Ok(snapshot) => snapshot,
            Err(error) => {
                self.fail_task(
                    os_id,
                    &task,
                    FailureCode::Unknown.as_i64(),
                    error.to_string(),
                    None,
                )
                .await;
                return;
            }
        };

        if snapshot.state == ServiceState::Successful {
            let Some(staged) = snapshot.local_path else {
                self.fail_task(
                    os_id,
                    &task,
                    FailureCode::Unknown.as_i64(),
                    "service reported success without a file".to_string(),
                    None,
                )
                .await;
                return;
            };

            let moved = {
                // The gate is never closed; a failed acquire cannot happen.
                let _permit = self.move_gate.acquire().await.ok();
                fsops::move_to_destination(&staged, &task.destination_path).await
            };
            match moved {
                Ok(()) => {
                    self.emitter.emit_immediate(DownloadEvent::Complete {
                        id: task.task_id.clone(),
                        location: task.destination_path.clone(),
                        bytes_downloaded: snapshot.bytes_downloaded,
                        bytes_total: snapshot.bytes_total,
                    });
                    self.finish_task(os_id, &task, Some(task.destination_path.as_path()))
                        .await;
                }
                Err(error) => {
                    self.fail_task(
                        os_id,
                        &task,
                        FailureCode::Unknown.as_i64(),
                        error.to_string(),
                        None,
                    )
                    .await;
                }
            }
            return;
        }

        let (code, reason) = snapshot
            .failure
            .unwrap_or((FailureCode::Unknown, "download failed".to_string()));

        if code == FailureCode::CannotResume {
            // The record is unrecoverable; purge first so a retry of the
            // same task id cannot race the teardown.
            warn!(task_id = %task.task_id, "download cannot be resumed, purging");
            self.finish_task(os_id, &task, None).await;
            self.emitter.emit_immediate(DownloadEvent::Failed {
                id: task.task_id,
                error_code: code.as_i64(),
                error: CANNOT_RESUME_GUIDANCE.to_string(),
            });
            return;
        }

        self.fail_task(os_id, &task, code.as_i64(), reason, snapshot.local_path.as_deref())
            .await;
    }

    async fn fail_task(
        &self,
        os_id: OsDownloadId,
        task: &TaskConfig,
        error_code: i64,
        error: String,
        scanned_path: Option<&Path>,
    ) {
        warn!(task_id = %task.task_id, error_code, error = %error, "download failed");
        self.emitter.emit_immediate(DownloadEvent::Failed {
            id: task.task_id.clone(),
            error_code,
            error,
        });
        self.finish_task(os_id, task, scanned_path).await;
    }

    /// Final teardown: rescan any touched file, then remove the task and
    /// the service-side record.
    async fn finish_task(&self, os_id: OsDownloadId, task: &TaskConfig, path: Option<&Path>) {
        if let Some(path) = path {
            self.scanner.scan(path).await;
        }
        self.registry.remove(os_id).await;
        if let Err(error) = self.service.cancel(os_id).await {
            debug!(task_id = %task.task_id, error = %error, "service had no record to cancel");
        }
    }

    async fn apply_setting_overrides(&self, request: &DownloadRequest) {
        let mut interval_update = None;
        let mut min_bytes_update = None;
        {
            let mut settings = match self.settings.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if let Some(interval) = request.progress_interval_ms {
                if interval > 0 && settings.interval_ms != interval {
                    settings.interval_ms = interval;
                    interval_update = Some(interval);
                }
            }
            if let Some(min_bytes) = request.progress_min_bytes {
                if min_bytes > 0 && settings.min_bytes != min_bytes {
                    settings.min_bytes = min_bytes;
                    min_bytes_update = Some(min_bytes);
                }
            }
        }

        if let Some(interval) = interval_update {
            if let Err(error) = self
                .store
                .put(KEY_PROGRESS_INTERVAL, &interval.to_string())
                .await
            {
                warn!(error = %error, "could not persist progress interval");
            }
        }
        if let Some(min_bytes) = min_bytes_update {
            if let Err(error) = self
                .store
                .put(KEY_PROGRESS_MIN_BYTES, &min_bytes.to_string())
                .await
            {
                warn!(error = %error, "could not persist progress min bytes");
            }
        }
    }

    async fn load_settings(&self) {
        let interval = self.read_setting(KEY_PROGRESS_INTERVAL).await;
        let min_bytes = self.read_setting(KEY_PROGRESS_MIN_BYTES).await;

        let mut settings = match self.settings.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(interval) = interval {
            settings.interval_ms = interval;
        }
        if let Some(min_bytes) = min_bytes {
            settings.min_bytes = min_bytes;
        }
    }

    async fn read_setting(&self, key: &str) -> Option<u64> {
        match self.store.get(key).await {
            Ok(Some(raw)) => match raw.parse() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!(key, raw = %raw, "unparseable persisted setting, using default");
                    None
                }
            },
            Ok(None) => None,
            Err(error) => {
                warn!(key, error = %error, "could not read persisted setting");
                None
            }
        }
    }

    fn staging_filename(&self, destination: &Path) -> String {
        let millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_millis())
            .unwrap_or_default();
        let uid = self.staging_seq.fetch_add(1, Ordering::Relaxed);
        match destination.extension().and_then(|ext| ext.to_str()) {
            Some(ext) => format!("{millis}-{uid}.{ext}"),
            None => format!("{millis}-{uid}"),
        }
    }
}
