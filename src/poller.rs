//! Per-task background progress polling.
//!
//! One tokio task per active download. The poller performs the one-time
//! begin probe, samples service status on a fixed cadence, applies the
//! progress thresholds, and feeds qualifying samples to the coalescing
//! emitter. It stops itself when the download reaches a terminal state,
//! when its stop flag is raised, or when the service no longer knows the
//! download id (in which case the task is failed and purged).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, warn};

use crate::events::{DownloadEvent, ProgressEmitter, ProgressReport, ProgressSettings};
use crate::registry::{PollerHandle, TaskRegistry};
use crate::service::{DownloadService, OsDownloadId, ServiceError};

/// Cadence of status sampling.
pub const POLL_INTERVAL: Duration = Duration::from_millis(250);

/// Fraction-of-total change that qualifies a progress sample on its own.
const PERCENT_THRESHOLD: f64 = 0.01;

/// Shared collaborators a poller needs; cheap to clone per spawned task.
#[derive(Clone)]
pub struct PollerContext {
    /// Service to sample status from.
    pub service: Arc<dyn DownloadService>,
    /// Registry holding the task's progress marks.
    pub registry: Arc<TaskRegistry>,
    /// Coalescing emitter qualifying samples are offered to.
    pub emitter: Arc<ProgressEmitter>,
    /// Shared thresholds (min-bytes read here, interval read by the emitter).
    pub settings: Arc<Mutex<ProgressSettings>>,
}

impl PollerContext {
    fn min_bytes(&self) -> u64 {
        match self.settings.lock() {
            Ok(guard) => guard.min_bytes,
            Err(poisoned) => poisoned.into_inner().min_bytes,
        }
    }
}

/// Whether a sample qualifies for reporting given the last reported marks.
///
/// Qualifies when the completed fraction moved by more than 1% of total,
/// when at least `min_bytes` new bytes arrived, or always while the total
/// is unknown (no fraction can be computed, so byte counts are the only
/// signal worth forwarding).
fn should_report(
    bytes: u64,
    total: Option<u64>,
    last_percent: f64,
    last_bytes: u64,
    min_bytes: u64,
) -> bool {
    match total {
        None | Some(0) => true,
        #[allow(clippy::cast_precision_loss)]
        Some(total) => {
            let percent = bytes as f64 / total as f64;
            percent - last_percent > PERCENT_THRESHOLD
                || bytes.saturating_sub(last_bytes) >= min_bytes
        }
    }
}

#[allow(clippy::cast_precision_loss)]
fn fraction(bytes: u64, total: Option<u64>) -> f64 {
    match total {
        None | Some(0) => 0.0,
        Some(total) => bytes as f64 / total as f64,
    }
}

/// Spawns the polling task for one download and returns its handle.
///
/// `reported_begin` comes from the persisted task configuration; when
/// false the poller emits the begin event (exactly once, flag persisted)
/// before the first progress sample can flush.
pub fn spawn(
    ctx: PollerContext,
    os_id: OsDownloadId,
    task_id: String,
    reported_begin: bool,
) -> PollerHandle {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_for_task = Arc::clone(&stop);
    let handle = tokio::spawn(run(ctx, os_id, task_id, reported_begin, stop_for_task));
    PollerHandle::new(stop, handle)
}

async fn run(
    ctx: PollerContext,
    os_id: OsDownloadId,
    task_id: String,
    mut reported_begin: bool,
    stop: Arc<AtomicBool>,
) {
    debug!(task_id = %task_id, os_id = %os_id, "poller started");

    loop {
        if stop.load(Ordering::SeqCst) {
            debug!(task_id = %task_id, "poller stop requested");
            return;
        }

        if !reported_begin {
            match ctx.service.begin_info(os_id).await {
                Ok(info) => {
                    // Teardown may have raced us while begin_info was in
                    // flight; a stopped poller must not emit.
                    if stop.load(Ordering::SeqCst) {
                        return;
                    }
                    if ctx.registry.claim_begin_report(os_id).await {
                        ctx.emitter.emit_immediate(DownloadEvent::Begin {
                            id: task_id.clone(),
                            headers: info.headers,
                            expected_bytes: info.expected_bytes,
                        });
                    }
                    reported_begin = true;
                }
                Err(ServiceError::UnknownId(_)) => {
                    // Teardown cancels the service record after raising the
                    // stop flag; only an unprompted disappearance is a failure.
                    if stop.load(Ordering::SeqCst) {
                        return;
                    }
                    fail_unknown(&ctx, os_id, &task_id).await;
                    return;
                }
                Err(error) => {
                    warn!(task_id = %task_id, error = %error, "begin probe failed, retrying");
                }
            }
        }

        let snapshot = match ctx.service.query_status(os_id).await {
            Ok(snapshot) => snapshot,
            Err(ServiceError::UnknownId(_)) => {
                if stop.load(Ordering::SeqCst) {
                    return;
                }
                fail_unknown(&ctx, os_id, &task_id).await;
                return;
            }
            Err(error) => {
                warn!(task_id = %task_id, error = %error, "status query failed");
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
        };

        if snapshot.state.is_terminal() {
            // The reconciler owns the final report; polling just ends.
            debug!(task_id = %task_id, state = ?snapshot.state, "poller observed terminal state");
            return;
        }

        let (last_percent, last_bytes) = ctx.registry.progress_marks(&task_id).await;
        if should_report(
            snapshot.bytes_downloaded,
            snapshot.bytes_total,
            last_percent,
            last_bytes,
            ctx.min_bytes(),
        ) {
            ctx.emitter.offer(ProgressReport {
                id: task_id.clone(),
                bytes_downloaded: snapshot.bytes_downloaded,
                bytes_total: snapshot.bytes_total,
            });
            ctx.registry
                .update_progress_marks(
                    &task_id,
                    fraction(snapshot.bytes_downloaded, snapshot.bytes_total),
                    snapshot.bytes_downloaded,
                )
                .await;
        }
        ctx.emitter.flush_if_due();

        tokio::time::sleep(POLL_INTERVAL).await;
    }
}

/// The service invalidated its record mid-flight; surface a failure and
/// purge the task.
async fn fail_unknown(ctx: &PollerContext, os_id: OsDownloadId, task_id: &str) {
    warn!(task_id = %task_id, os_id = %os_id, "download no longer known to the service");
    ctx.emitter.drop_pending(task_id);
    ctx.emitter.emit_immediate(DownloadEvent::Failed {
        id: task_id.to_string(),
        error_code: crate::service::FailureCode::Unknown.as_i64(),
        error: "download no longer known to the service".to_string(),
    });
    ctx.registry.remove(os_id).await;
}
