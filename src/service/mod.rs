//! Download service abstraction.
//!
//! The bridge never performs transfers itself; it delegates to a
//! [`DownloadService`], which owns the actual byte movement and reports
//! status on demand. The crate ships [`HttpDownloadService`] as the
//! production implementation; tests substitute a scripted double.
//!
//! Completion is signalled by message passing: every service pushes the
//! [`OsDownloadId`] of a finished (successful or failed) download onto an
//! unbounded channel, consumed by the bridge's reconciler worker.

mod http;

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

pub use http::HttpDownloadService;

/// Result type for service operations.
pub type Result<T> = std::result::Result<T, ServiceError>;

/// Receiver side of the completion channel a service reports on.
pub type CompletionFeed = mpsc::UnboundedReceiver<OsDownloadId>;

/// Errors from the download service.
#[derive(Debug, Error)]
pub enum ServiceError {
    /// The service has no record for this download id. Happens after a
    /// cancel, or when service records were invalidated externally.
    #[error("unknown download id: {0}")]
    UnknownId(OsDownloadId),

    /// The HTTP request could not be issued.
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Staging-file IO failed.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Service-issued identifier for one in-flight or completed download.
///
/// Valid only for the lifetime of the service's own records; the bridge
/// maps it to the caller's stable task id.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct OsDownloadId(pub u64);

impl fmt::Display for OsDownloadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transfer state as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceState {
    /// Accepted, not yet transferring.
    Pending,
    /// Actively transferring.
    Running,
    /// Transfer suspended by the service.
    Paused,
    /// Transfer finished; staged file is complete.
    Successful,
    /// Transfer failed; see the failure reason.
    Failed,
}

impl ServiceState {
    /// Whether the state admits no further transitions.
    #[must_use]
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Successful | Self::Failed)
    }
}

/// Numeric failure codes mirroring the platform download manager's set.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i64)]
pub enum FailureCode {
    /// Unclassified failure.
    Unknown = 1000,
    /// Storage issue writing the staged file.
    FileError = 1001,
    /// Server returned a status the service cannot handle.
    UnhandledHttpCode = 1002,
    /// Error receiving or processing data at the HTTP level.
    HttpDataError = 1004,
    /// Too many redirects.
    TooManyRedirects = 1005,
    /// Not enough space for the staged file.
    InsufficientSpace = 1006,
    /// Staging device not found.
    DeviceNotFound = 1007,
    /// The transfer cannot be resumed; the record is unrecoverable.
    CannotResume = 1008,
    /// Destination already exists and the service will not overwrite it.
    FileAlreadyExists = 1009,
}

impl FailureCode {
    /// The numeric wire value.
    #[must_use]
    pub fn as_i64(self) -> i64 {
        self as i64
    }
}

/// Point-in-time snapshot of one download's status.
#[derive(Debug, Clone)]
pub struct DownloadSnapshot {
    /// Current transfer state.
    pub state: ServiceState,
    /// Bytes received so far.
    pub bytes_downloaded: u64,
    /// Expected total size, when the server reported one.
    pub bytes_total: Option<u64>,
    /// Staged file location, once known.
    pub local_path: Option<PathBuf>,
    /// Failure code and human-readable reason, when `state` is `Failed`.
    pub failure: Option<(FailureCode, String)>,
}

/// Response metadata captured when the transfer began, surfaced once to the
/// caller via the begin event.
#[derive(Debug, Clone, Default)]
pub struct BeginInfo {
    /// Response headers from the server.
    pub headers: HashMap<String, String>,
    /// Expected total size, when known at response time.
    pub expected_bytes: Option<u64>,
}

/// A download submission.
#[derive(Debug, Clone)]
pub struct SubmitRequest {
    /// Source URL.
    pub url: String,
    /// Request headers to send.
    pub headers: HashMap<String, String>,
    /// File name to stage the transfer under (service-managed directory).
    pub staging_filename: String,
    /// Hint: transfer may proceed over roaming connections.
    pub allow_over_roaming: bool,
    /// Hint: transfer may proceed over metered connections.
    pub allow_over_metered: bool,
    /// Hint: show a platform notification for the transfer.
    pub show_notification: bool,
    /// Title for the platform notification, when shown.
    pub notification_title: Option<String>,
}

/// Contract for the platform download service.
///
/// Submitting issues a transfer as a side effect. Nothing here is retried
/// internally; retry policy, if any, belongs to the service itself.
#[async_trait]
pub trait DownloadService: Send + Sync {
    /// Submits a download and returns the service-issued id.
    async fn submit(&self, request: SubmitRequest) -> Result<OsDownloadId>;

    /// Returns the current status of a download.
    async fn query_status(&self, id: OsDownloadId) -> Result<DownloadSnapshot>;

    /// Returns the response metadata captured when the transfer began.
    /// Resolves once the service has seen the response (or the transfer
    /// reached a terminal state first).
    async fn begin_info(&self, id: OsDownloadId) -> Result<BeginInfo>;

    /// Cancels a download and discards its record and staged data.
    async fn cancel(&self, id: OsDownloadId) -> Result<()>;

    /// Lists every download the service currently has a record for.
    async fn list_all(&self) -> Result<Vec<(OsDownloadId, DownloadSnapshot)>>;
}
