//! Background Downloader Bridge
//!
//! This library bridges application code to an operating-system-style
//! download manager: it accepts download requests, hands the transfer to a
//! download service, tracks each task durably across process restarts, and
//! translates service state into begin/progress/complete/failure events.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`bridge`] - Application-facing facade and completion reconciler
//! - [`service`] - Download service trait and HTTP implementation
//! - [`registry`] - Task registry mapping service ids to task ids
//! - [`poller`] - Per-task background progress polling
//! - [`events`] - Event model and coalescing progress emitter
//! - [`fsops`] - Completed-file placement and media-scan hook
//! - [`store`] - Durable key-value store (sqlite, json fallback)
//! - [`error`] - Bridge-level error taxonomy

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod bridge;
pub mod error;
pub mod events;
pub mod fsops;
pub mod poller;
pub mod registry;
pub mod service;
pub mod store;

// Re-export commonly used types
pub use bridge::{
    BridgeConfig, BridgeConstants, DownloadBridge, DownloadRequest, FoundDownload,
    TASK_CANCELING, TASK_COMPLETED, TASK_RUNNING, TASK_SUSPENDED, task_state_code,
};
pub use error::{BridgeError, Result};
pub use events::{
    ChannelSink, DEFAULT_PROGRESS_MIN_BYTES, DownloadEvent, EventSink, ProgressEmitter,
    ProgressReport, ProgressSettings,
};
pub use fsops::{MediaScanner, NoopMediaScanner, move_to_destination};
pub use registry::{TaskConfig, TaskRegistry};
pub use service::{
    BeginInfo, CompletionFeed, DownloadService, DownloadSnapshot, FailureCode,
    HttpDownloadService, OsDownloadId, ServiceError, ServiceState, SubmitRequest,
};
pub use store::{JsonFileStore, KeyValueStore, SqliteStore, StoreError, open_store};
