//! Application-visible events and the coalescing progress emitter.
//!
//! # Overview
//!
//! The bridge talks to the application through a single [`EventSink`].
//! Begin, completion, and failure events pass through unconditionally;
//! progress samples go through a [`ProgressEmitter`] that keeps at most one
//! pending record per task and flushes them as one batched
//! [`DownloadEvent::Progress`] no more often than the configured interval.
//!
//! [`ChannelSink`] is the stock sink: events land on an unbounded channel
//! the application drains at its own pace.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

/// Default minimum byte delta between progress reports (1 MiB).
pub const DEFAULT_PROGRESS_MIN_BYTES: u64 = 1024 * 1024;

/// Tunable progress-reporting thresholds, shared between the bridge (which
/// applies caller overrides and persists them) and the pollers that read
/// them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgressSettings {
    /// Minimum milliseconds between progress batches. Zero flushes on every
    /// check.
    pub interval_ms: u64,
    /// Minimum byte delta that qualifies a new progress sample.
    pub min_bytes: u64,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            interval_ms: 0,
            min_bytes: DEFAULT_PROGRESS_MIN_BYTES,
        }
    }
}

/// One task's progress sample inside a batched progress event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressReport {
    /// Application-level task id.
    pub id: String,
    /// Bytes received so far.
    pub bytes_downloaded: u64,
    /// Expected total, when the server reported one.
    pub bytes_total: Option<u64>,
}

/// Events delivered to the application.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum DownloadEvent {
    /// The transfer has started; response metadata is attached. Emitted at
    /// most once per task, including across restarts.
    Begin {
        /// Application-level task id.
        id: String,
        /// Response headers observed when the transfer began.
        headers: HashMap<String, String>,
        /// Expected total size, when known.
        expected_bytes: Option<u64>,
    },
    /// A batch of coalesced progress samples, at most one per task.
    Progress(Vec<ProgressReport>),
    /// The file arrived at its destination.
    Complete {
        /// Application-level task id.
        id: String,
        /// Final location of the downloaded file.
        location: PathBuf,
        /// Bytes received.
        bytes_downloaded: u64,
        /// Expected total, when known.
        bytes_total: Option<u64>,
    },
    /// The download failed; the task has been (or is being) purged.
    Failed {
        /// Application-level task id.
        id: String,
        /// Numeric failure code (platform download-manager set).
        error_code: i64,
        /// Human-readable reason.
        error: String,
    },
}

/// Synchronous event delivery seam.
///
/// Implementations must not block; the stock [`ChannelSink`] just enqueues.
pub trait EventSink: Send + Sync {
    /// Delivers one event to the application.
    fn emit(&self, event: DownloadEvent);
}

/// Sink delivering events over an unbounded channel.
pub struct ChannelSink {
    tx: mpsc::UnboundedSender<DownloadEvent>,
}

impl ChannelSink {
    /// Creates the sink and the receiver the application consumes.
    #[must_use]
    pub fn new() -> (Self, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl EventSink for ChannelSink {
    fn emit(&self, event: DownloadEvent) {
        // A dropped receiver means the application stopped listening.
        if self.tx.send(event).is_err() {
            debug!("event receiver dropped, discarding event");
        }
    }
}

struct EmitterState {
    pending: HashMap<String, ProgressReport>,
    last_flush: Instant,
}

/// Coalescing tier in front of the sink for progress events.
///
/// Safe to share across poller tasks; internal state is mutex-guarded.
/// Non-progress events bypass the buffer via [`emit_immediate`].
///
/// [`emit_immediate`]: ProgressEmitter::emit_immediate
pub struct ProgressEmitter {
    sink: Arc<dyn EventSink>,
    settings: Arc<Mutex<ProgressSettings>>,
    state: Mutex<EmitterState>,
}

impl ProgressEmitter {
    /// Creates an emitter in front of `sink`, reading the flush interval
    /// from the shared `settings`.
    pub fn new(sink: Arc<dyn EventSink>, settings: Arc<Mutex<ProgressSettings>>) -> Self {
        Self {
            sink,
            settings,
            state: Mutex::new(EmitterState {
                pending: HashMap::new(),
                // The first window opens at construction.
                last_flush: Instant::now(),
            }),
        }
    }

    fn lock<'a, T>(mutex: &'a Mutex<T>) -> MutexGuard<'a, T> {
        match mutex.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Buffers a progress sample (replacing any pending one for the same
    /// task) and runs the flush check.
    pub fn offer(&self, report: ProgressReport) {
        Self::lock(&self.state)
            .pending
            .insert(report.id.clone(), report);
        self.flush_if_due();
    }

    /// Flushes the pending buffer as one batched progress event when the
    /// configured interval has elapsed since the last flush. A no-op when
    /// nothing is pending.
    pub fn flush_if_due(&self) {
        let interval = Duration::from_millis(Self::lock(&self.settings).interval_ms);
        let batch = {
            let mut state = Self::lock(&self.state);
            if state.pending.is_empty() || state.last_flush.elapsed() < interval {
                return;
            }
            state.last_flush = Instant::now();
            state.pending.drain().map(|(_, report)| report).collect()
        };
        self.sink.emit(DownloadEvent::Progress(batch));
    }

    /// Discards any buffered sample for a task that stopped, so a later
    /// flush cannot report on a purged task.
    pub fn drop_pending(&self, task_id: &str) {
        Self::lock(&self.state).pending.remove(task_id);
    }

    /// Emits a non-progress event straight to the sink.
    pub fn emit_immediate(&self, event: DownloadEvent) {
        self.sink.emit(event);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    fn emitter_with(interval_ms: u64) -> (ProgressEmitter, mpsc::UnboundedReceiver<DownloadEvent>) {
        let (sink, rx) = ChannelSink::new();
        let settings = Arc::new(Mutex::new(ProgressSettings {
            interval_ms,
            ..ProgressSettings::default()
        }));
        (ProgressEmitter::new(Arc::new(sink), settings), rx)
    }

    fn report(id: &str, bytes: u64) -> ProgressReport {
        ProgressReport {
            id: id.to_string(),
            bytes_downloaded: bytes,
            bytes_total: Some(1000),
        }
    }

    #[tokio::test]
    async fn test_zero_interval_flushes_every_offer() {
        let (emitter, mut rx) = emitter_with(0);

        emitter.offer(report("a", 10));
        emitter.offer(report("a", 20));

        let DownloadEvent::Progress(first) = rx.try_recv().unwrap() else {
            panic!("expected progress");
        };
        assert_eq!(first, vec![report("a", 10)]);
        let DownloadEvent::Progress(second) = rx.try_recv().unwrap() else {
            panic!("expected progress");
        };
        assert_eq!(second, vec![report("a", 20)]);
    }

    #[tokio::test]
    async fn test_samples_inside_window_coalesce_to_latest() {
        let (emitter, mut rx) = emitter_with(60_000);

        emitter.offer(report("a", 10));
        emitter.offer(report("a", 20));
        emitter.offer(report("a", 30));
        emitter.offer(report("b", 5));
        assert!(rx.try_recv().is_err(), "window not elapsed, nothing flushed");

        // Force the window open and re-check.
        ProgressEmitter::lock(&emitter.settings).interval_ms = 0;
        emitter.flush_if_due();
        let DownloadEvent::Progress(mut batch) = rx.try_recv().unwrap() else {
            panic!("expected progress");
        };
        batch.sort_by(|x, y| x.id.cmp(&y.id));
        assert_eq!(batch, vec![report("a", 30), report("b", 5)]);
        assert!(rx.try_recv().is_err(), "exactly one batch per window");
    }

    #[tokio::test]
    async fn test_flush_with_empty_buffer_is_noop() {
        let (emitter, mut rx) = emitter_with(0);
        emitter.flush_if_due();
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_drop_pending_discards_buffered_sample() {
        let (emitter, mut rx) = emitter_with(60_000);
        emitter.offer(report("a", 20));
        emitter.drop_pending("a");
        ProgressEmitter::lock(&emitter.settings).interval_ms = 0;
        emitter.flush_if_due();
        assert!(rx.try_recv().is_err(), "dropped sample must not flush");
    }

    #[test]
    fn test_event_payloads_serialize_camel_case() {
        let event = DownloadEvent::Complete {
            id: "a".to_string(),
            location: PathBuf::from("/downloads/f.bin"),
            bytes_downloaded: 5,
            bytes_total: Some(10),
        };
        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("\"complete\""));
        assert!(json.contains("\"bytesDownloaded\":5"));
        assert!(json.contains("\"bytesTotal\":10"));
    }

    #[tokio::test]
    async fn test_immediate_events_bypass_buffer() {
        let (emitter, mut rx) = emitter_with(60_000);
        emitter.emit_immediate(DownloadEvent::Failed {
            id: "a".to_string(),
            error_code: 1000,
            error: "boom".to_string(),
        });
        assert!(matches!(
            rx.try_recv().unwrap(),
            DownloadEvent::Failed { .. }
        ));
    }
}
