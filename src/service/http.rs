//! HTTP-backed download service.
//!
//! The production [`DownloadService`]: each submission spawns a streaming
//! GET into a staging directory. Status is tracked in a shared record map
//! that `query_status` reads without blocking the transfer; completion
//! (success or failure) is pushed onto the service's completion channel.
//!
//! Cancellation is cooperative: the transfer task checks a flag between
//! chunks, deletes the partial staging file, and drops its record without
//! signalling completion.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::StreamExt;
use reqwest::Client;
use reqwest::header::CONTENT_LENGTH;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use tokio::sync::mpsc;
use tracing::{debug, instrument, warn};

use super::{
    BeginInfo, CompletionFeed, DownloadService, DownloadSnapshot, FailureCode, OsDownloadId,
    Result, ServiceError, ServiceState, SubmitRequest,
};

/// Connect timeout for transfer requests.
const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Poll step while waiting for response metadata in `begin_info`.
const BEGIN_POLL_STEP: Duration = Duration::from_millis(50);

/// User-Agent sent when the caller did not supply one.
pub const DEFAULT_USER_AGENT: &str = concat!("background-downloader/", env!("CARGO_PKG_VERSION"));

/// Mutable record for one download, shared between the transfer task and
/// status queries.
#[derive(Debug)]
struct Record {
    state: ServiceState,
    bytes_downloaded: u64,
    bytes_total: Option<u64>,
    local_path: Option<PathBuf>,
    failure: Option<(FailureCode, String)>,
    begin: Option<BeginInfo>,
    cancel: Arc<AtomicBool>,
}

impl Record {
    fn new(cancel: Arc<AtomicBool>) -> Self {
        Self {
            state: ServiceState::Pending,
            bytes_downloaded: 0,
            bytes_total: None,
            local_path: None,
            failure: None,
            begin: None,
            cancel,
        }
    }

    fn snapshot(&self) -> DownloadSnapshot {
        DownloadSnapshot {
            state: self.state,
            bytes_downloaded: self.bytes_downloaded,
            bytes_total: self.bytes_total,
            local_path: self.local_path.clone(),
            failure: self.failure.clone(),
        }
    }
}

/// State shared between the service front-end and its transfer tasks.
#[derive(Clone)]
struct Shared {
    records: Arc<Mutex<HashMap<OsDownloadId, Record>>>,
    completion_tx: mpsc::UnboundedSender<OsDownloadId>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, HashMap<OsDownloadId, Record>> {
        // Record mutation never panics while holding the lock; recover the
        // map rather than poisoning every later call.
        match self.records.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn update(&self, id: OsDownloadId, apply: impl FnOnce(&mut Record)) {
        if let Some(record) = self.lock().get_mut(&id) {
            apply(record);
        }
    }

    fn finish(&self, id: OsDownloadId, apply: impl FnOnce(&mut Record)) {
        self.update(id, apply);
        // Receiver gone means the bridge shut down; nothing left to notify.
        let _ = self.completion_tx.send(id);
    }

    fn fail(&self, id: OsDownloadId, code: FailureCode, reason: String) {
        self.finish(id, |r| {
            r.state = ServiceState::Failed;
            r.failure = Some((code, reason));
        });
    }
}

/// HTTP download service staging transfers under a dedicated directory.
pub struct HttpDownloadService {
    client: Client,
    staging_dir: PathBuf,
    shared: Shared,
    next_id: AtomicU64,
}

impl HttpDownloadService {
    /// Creates the service and the completion feed the bridge consumes.
    ///
    /// # Errors
    ///
    /// Returns [`ServiceError::Http`] if the HTTP client cannot be built.
    pub fn new(staging_dir: impl Into<PathBuf>) -> Result<(Self, CompletionFeed)> {
        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .gzip(true)
            .build()?;
        Ok(Self::with_client(client, staging_dir))
    }

    /// Creates the service around an existing HTTP client (tests, custom
    /// proxy/TLS configuration).
    pub fn with_client(client: Client, staging_dir: impl Into<PathBuf>) -> (Self, CompletionFeed) {
        let (completion_tx, completion_rx) = mpsc::unbounded_channel();
        (
            Self {
                client,
                staging_dir: staging_dir.into(),
                shared: Shared {
                    records: Arc::new(Mutex::new(HashMap::new())),
                    completion_tx,
                },
                next_id: AtomicU64::new(1),
            },
            completion_rx,
        )
    }

    /// Directory transfers are staged into.
    #[must_use]
    pub fn staging_dir(&self) -> &std::path::Path {
        &self.staging_dir
    }
}

/// Runs one transfer to completion, updating the shared record as it goes.
/// Returns early without signalling when cancelled.
async fn run_transfer(
    client: Client,
    shared: Shared,
    staging_path: PathBuf,
    id: OsDownloadId,
    request: SubmitRequest,
) {
    if let Some(parent) = staging_path.parent() {
        if let Err(error) = tokio::fs::create_dir_all(parent).await {
            shared.fail(id, FailureCode::FileError, error.to_string());
            return;
        }
    }

    let mut http_request = client.get(&request.url);
    for (name, value) in &request.headers {
        http_request = http_request.header(name, value);
    }

    let response = match http_request.send().await {
        Ok(response) => response,
        Err(error) => {
            shared.fail(id, FailureCode::HttpDataError, error.to_string());
            return;
        }
    };

    let status = response.status();
    if !status.is_success() {
        shared.fail(
            id,
            FailureCode::UnhandledHttpCode,
            format!("server returned HTTP {status}"),
        );
        return;
    }

    let headers: HashMap<String, String> = response
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect();
    let expected_bytes = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse::<u64>().ok());

    shared.update(id, |r| {
        r.state = ServiceState::Running;
        r.bytes_total = expected_bytes;
        r.begin = Some(BeginInfo {
            headers,
            expected_bytes,
        });
    });

    let cancel = {
        shared
            .lock()
            .get(&id)
            .map(|record| Arc::clone(&record.cancel))
    };
    let Some(cancel) = cancel else {
        // Cancelled before the response arrived; record already gone.
        return;
    };

    let file = match File::create(&staging_path).await {
        Ok(file) => file,
        Err(error) => {
            shared.fail(id, FailureCode::FileError, error.to_string());
            return;
        }
    };
    let mut writer = BufWriter::new(file);

    let mut bytes_downloaded: u64 = 0;
    let mut stream = response.bytes_stream();

    while let Some(chunk) = stream.next().await {
        if cancel.load(Ordering::SeqCst) {
            debug!(id = %id, "transfer cancelled, removing partial staging file");
            drop(writer);
            let _ = tokio::fs::remove_file(&staging_path).await;
            return;
        }

        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(error) => {
                let _ = tokio::fs::remove_file(&staging_path).await;
                shared.fail(id, FailureCode::HttpDataError, error.to_string());
                return;
            }
        };

        if let Err(error) = writer.write_all(&chunk).await {
            let _ = tokio::fs::remove_file(&staging_path).await;
            shared.fail(id, FailureCode::FileError, error.to_string());
            return;
        }

        bytes_downloaded += chunk.len() as u64;
        shared.update(id, |r| r.bytes_downloaded = bytes_downloaded);
    }

    if let Err(error) = writer.flush().await {
        let _ = tokio::fs::remove_file(&staging_path).await;
        shared.fail(id, FailureCode::FileError, error.to_string());
        return;
    }

    debug!(id = %id, bytes = bytes_downloaded, path = %staging_path.display(), "transfer complete");
    shared.finish(id, |r| {
        r.state = ServiceState::Successful;
        r.bytes_downloaded = bytes_downloaded;
        if r.bytes_total.is_none() {
            r.bytes_total = Some(bytes_downloaded);
        }
        r.local_path = Some(staging_path.clone());
    });
}

#[async_trait]
impl DownloadService for HttpDownloadService {
    #[instrument(skip(self, request), fields(url = %request.url))]
    async fn submit(&self, mut request: SubmitRequest) -> Result<OsDownloadId> {
        let id = OsDownloadId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let has_user_agent = request
            .headers
            .keys()
            .any(|k| k.eq_ignore_ascii_case("user-agent"));
        if !has_user_agent {
            request
                .headers
                .insert("User-Agent".to_string(), DEFAULT_USER_AGENT.to_string());
        }
        request
            .headers
            .entry("Connection".to_string())
            .or_insert_with(|| "keep-alive".to_string());

        let cancel = Arc::new(AtomicBool::new(false));
        self.shared.lock().insert(id, Record::new(Arc::clone(&cancel)));

        debug!(id = %id, staging = %request.staging_filename, "submitting transfer");
        let staging_path = self.staging_dir.join(&request.staging_filename);
        tokio::spawn(run_transfer(
            self.client.clone(),
            self.shared.clone(),
            staging_path,
            id,
            request,
        ));

        Ok(id)
    }

    async fn query_status(&self, id: OsDownloadId) -> Result<DownloadSnapshot> {
        self.shared
            .lock()
            .get(&id)
            .map(Record::snapshot)
            .ok_or(ServiceError::UnknownId(id))
    }

    async fn begin_info(&self, id: OsDownloadId) -> Result<BeginInfo> {
        // Bounded by the service's own behavior: resolves as soon as a
        // response (or terminal state) is recorded.
        loop {
            {
                let records = self.shared.lock();
                let record = records.get(&id).ok_or(ServiceError::UnknownId(id))?;
                if let Some(begin) = &record.begin {
                    return Ok(begin.clone());
                }
                if record.state.is_terminal() {
                    return Ok(BeginInfo::default());
                }
            }
            tokio::time::sleep(BEGIN_POLL_STEP).await;
        }
    }

    #[instrument(skip(self))]
    async fn cancel(&self, id: OsDownloadId) -> Result<()> {
        let removed = self.shared.lock().remove(&id);
        match removed {
            Some(record) => {
                record.cancel.store(true, Ordering::SeqCst);
                if let Some(path) = record.local_path {
                    if let Err(error) = tokio::fs::remove_file(&path).await {
                        warn!(id = %id, error = %error, "could not remove staged file on cancel");
                    }
                }
                Ok(())
            }
            None => Err(ServiceError::UnknownId(id)),
        }
    }

    async fn list_all(&self) -> Result<Vec<(OsDownloadId, DownloadSnapshot)>> {
        Ok(self
            .shared
            .lock()
            .iter()
            .map(|(id, record)| (*id, record.snapshot()))
            .collect())
    }
}
