//! Shared test support: a scripted download-service double and tracing
//! setup.

use std::collections::HashMap;
use std::sync::{Mutex, Once};
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tokio::sync::mpsc;

use background_downloader::{
    BeginInfo, CompletionFeed, DownloadService, DownloadSnapshot, OsDownloadId, ServiceError,
    ServiceState,
};

type ServiceResult<T> = std::result::Result<T, ServiceError>;

static INIT_TRACING: Once = Once::new();

/// Installs a tracing subscriber honoring `RUST_LOG`. Safe to call from
/// every test.
pub fn init_tracing() {
    INIT_TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Download service whose records the test scripts directly.
///
/// `submit` allocates ids from 1 and seeds a pending record with a known
/// total; the test then drives state with [`set_status`] and signals
/// completion with [`fire_completion`].
///
/// [`set_status`]: MockDownloadService::set_status
/// [`fire_completion`]: MockDownloadService::fire_completion
pub struct MockDownloadService {
    records: Mutex<HashMap<OsDownloadId, DownloadSnapshot>>,
    next_id: AtomicU64,
    completion_tx: mpsc::UnboundedSender<OsDownloadId>,
    cancelled: Mutex<Vec<OsDownloadId>>,
}

/// Total size every scripted record starts with.
pub const MOCK_TOTAL: u64 = 1000;

impl MockDownloadService {
    pub fn new() -> (Self, CompletionFeed) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        (
            Self {
                records: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(1),
                completion_tx,
                cancelled: Mutex::new(Vec::new()),
            },
            completion_rx,
        )
    }

    /// Replaces (or seeds) the record for `id`.
    pub fn set_status(&self, id: OsDownloadId, snapshot: DownloadSnapshot) {
        self.records.lock().unwrap().insert(id, snapshot);
    }

    /// Pushes a completion notice for `id`.
    pub fn fire_completion(&self, id: OsDownloadId) {
        self.completion_tx.send(id).unwrap();
    }

    /// Ids cancelled so far.
    pub fn cancelled(&self) -> Vec<OsDownloadId> {
        self.cancelled.lock().unwrap().clone()
    }

    pub fn running(bytes: u64) -> DownloadSnapshot {
        DownloadSnapshot {
            state: ServiceState::Running,
            bytes_downloaded: bytes,
            bytes_total: Some(MOCK_TOTAL),
            local_path: None,
            failure: None,
        }
    }

    pub fn successful(staged: std::path::PathBuf) -> DownloadSnapshot {
        DownloadSnapshot {
            state: ServiceState::Successful,
            bytes_downloaded: MOCK_TOTAL,
            bytes_total: Some(MOCK_TOTAL),
            local_path: Some(staged),
            failure: None,
        }
    }

    pub fn failed(
        code: background_downloader::FailureCode,
        reason: &str,
    ) -> DownloadSnapshot {
        DownloadSnapshot {
            state: ServiceState::Failed,
            bytes_downloaded: 0,
            bytes_total: Some(MOCK_TOTAL),
            local_path: None,
            failure: Some((code, reason.to_string())),
        }
    }
}

#[async_trait]
impl DownloadService for MockDownloadService {
    async fn submit(
        &self,
        _request: background_downloader::SubmitRequest,
    ) -> ServiceResult<OsDownloadId> {
        let id = OsDownloadId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.records.lock().unwrap().insert(
            id,
            DownloadSnapshot {
                state: ServiceState::Pending,
                bytes_downloaded: 0,
                bytes_total: Some(MOCK_TOTAL),
                local_path: None,
                failure: None,
            },
        );
        Ok(id)
    }

    async fn query_status(&self, id: OsDownloadId) -> ServiceResult<DownloadSnapshot> {
        self.records
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(ServiceError::UnknownId(id))
    }

    async fn begin_info(&self, id: OsDownloadId) -> ServiceResult<BeginInfo> {
        if !self.records.lock().unwrap().contains_key(&id) {
            return Err(ServiceError::UnknownId(id));
        }
        let mut headers = HashMap::new();
        headers.insert(
            "content-type".to_string(),
            "application/octet-stream".to_string(),
        );
        Ok(BeginInfo {
            headers,
            expected_bytes: Some(MOCK_TOTAL),
        })
    }

    async fn cancel(&self, id: OsDownloadId) -> ServiceResult<()> {
        self.cancelled.lock().unwrap().push(id);
        self.records
            .lock()
            .unwrap()
            .remove(&id)
            .map(|_| ())
            .ok_or(ServiceError::UnknownId(id))
    }

    async fn list_all(&self) -> ServiceResult<Vec<(OsDownloadId, DownloadSnapshot)>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .iter()
            .map(|(id, snapshot)| (*id, snapshot.clone()))
            .collect())
    }
}
