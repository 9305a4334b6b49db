//! Per-job runner
//!
//! One runner task owns each job for its whole lifetime: it drives the
//! channel scan, spawns one transfer task per discovered file, tallies
//! outcomes into the job counters, and performs the final state transition.
//! Pause, resume and cancel reach the runner (and its transfer tasks)
//! through a watch-backed gate observed at every checkpoint.

use crate::manager::DownloadManager;
use crate::scan::{self, ScanMsg};
use crate::types::{FileTransfer, JobId, JobState, TransferState};
use crate::worker::{self, TransferOutcome};
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;

/// Control state of a job, observed cooperatively by its tasks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Gate {
    /// Tasks may run
    Active,
    /// Tasks hold at their next checkpoint and wait
    Paused,
    /// Tasks stop at their next checkpoint and exit
    Cancelled,
}

/// Wait until the gate reads `Active` or `Cancelled`.
///
/// Returns `Cancelled` if the gate's sender is gone.
pub(crate) async fn wait_active(rx: &mut watch::Receiver<Gate>) -> Gate {
    loop {
        match *rx.borrow_and_update() {
            Gate::Active => return Gate::Active,
            Gate::Cancelled => return Gate::Cancelled,
            Gate::Paused => {}
        }
        if rx.changed().await.is_err() {
            return Gate::Cancelled;
        }
    }
}

/// Wait until the gate leaves `Active` (used to withdraw queued waiters)
pub(crate) async fn wait_not_active(rx: &mut watch::Receiver<Gate>) {
    loop {
        if *rx.borrow_and_update() != Gate::Active {
            return;
        }
        if rx.changed().await.is_err() {
            return;
        }
    }
}

/// Everything a job's scan and transfer tasks need, cloned once per job
pub(crate) struct JobContext {
    pub job_id: JobId,
    pub channel: String,
    pub filter: crate::types::JobFilter,
    pub skip_duplicates: bool,
    pub priority: crate::types::JobPriority,
    /// Per-job directory files land in
    pub job_dir: std::path::PathBuf,
    pub client: Arc<dyn crate::client::ChannelClient>,
    pub storage: Arc<dyn crate::storage::Storage>,
    pub ledger: Arc<crate::ledger::TransferLedger>,
    pub fingerprints: Arc<crate::fingerprint::FingerprintStore>,
    pub queue: Arc<crate::queue::TransferQueue>,
    pub events: crate::events::EventBus,
    pub config: crate::config::ManagerConfig,
    pub gate: watch::Receiver<Gate>,
    /// When set, a cancelled gate means "halt but keep resume state"
    /// (shutdown, scan failure) rather than a user cancel that discards
    /// partial files.
    pub halt_keep_state: Arc<AtomicBool>,
}

impl JobContext {
    pub(crate) fn halting(&self) -> bool {
        self.halt_keep_state.load(Ordering::Relaxed)
    }
}

/// Why the runner stopped driving work
enum StopReason {
    /// Scan finalized and every transfer settled
    Completed,
    /// User cancel: discard non-terminal transfers
    Cancelled,
    /// The channel scan failed
    Failed(String),
    /// Shutdown: persist as-is for the next start
    Halted,
}

/// Drive one job to a terminal state (or to a halt on shutdown)
pub(crate) async fn run_job(manager: Arc<DownloadManager>, ctx: Arc<JobContext>) {
    let job_id = ctx.job_id;

    // Re-derive counters and pending work purely from persisted transfer
    // state, so a restart after a crash picks up exactly where the rows say
    // we were.
    let existing = match ctx.storage.load_transfers(job_id).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!("Failed to load transfers for job {}: {}", job_id, e);
            Vec::new()
        }
    };

    let mut known_uids: HashSet<String> = HashSet::new();
    let mut used_names: HashSet<String> = HashSet::new();
    let mut pending: Vec<FileTransfer> = Vec::new();
    {
        let mut counters = crate::types::JobCounters {
            total_files: existing.len() as u64,
            ..Default::default()
        };
        for row in &existing {
            known_uids.insert(row.source.file_uid.clone());
            if let Some(name) = row.target_path.file_name().and_then(|n| n.to_str()) {
                used_names.insert(name.to_string());
            }
            counters.total_bytes += row.source.size.unwrap_or(0);
            match &row.state {
                TransferState::Done => {
                    counters.completed_files += 1;
                    counters.downloaded_bytes += row.bytes_transferred;
                }
                TransferState::DuplicateSkipped => counters.skipped_files += 1,
                TransferState::Failed { .. } => counters.failed_files += 1,
                _ => pending.push(row.clone()),
            }
        }
        let snapshot = manager.update_snapshot(job_id, |job| job.counters = counters);
        if let Some(snapshot) = snapshot {
            manager.persist_job(&snapshot).await;
        }
    }

    // pending -> active, unless the job was restored paused
    if manager
        .job(job_id)
        .map(|j| j.state.is_active())
        .unwrap_or(false)
    {
        manager.transition(job_id, JobState::Active).await;
    }

    let mut tasks: JoinSet<(crate::types::TransferId, TransferOutcome)> = JoinSet::new();
    for row in pending {
        let ctx = Arc::clone(&ctx);
        tasks.spawn(worker::run_transfer(ctx, row));
    }

    // The scan task is the sole owner of the cursor; it reports discoveries
    // and cursor movement back over a channel.
    let (scan_tx, mut scan_rx) = mpsc::channel::<ScanMsg>(16);
    let snapshot = manager.job(job_id);
    let mut scan_running = match &snapshot {
        Some(job) if !job.scan_complete => {
            let ctx = Arc::clone(&ctx);
            let cursor = job.cursor;
            let accepted = job.counters.total_files;
            tokio::spawn(scan::run_scan(
                ctx, cursor, known_uids, used_names, accepted, scan_tx,
            ));
            true
        }
        _ => {
            drop(scan_tx);
            false
        }
    };

    let mut stop: Option<StopReason> = None;

    loop {
        tokio::select! {
            msg = scan_rx.recv(), if scan_running => match msg {
                Some(ScanMsg::Found(transfer)) => {
                    let size = transfer.source.size.unwrap_or(0);
                    if let Some(snapshot) = manager.update_snapshot(job_id, |job| {
                        job.counters.total_files += 1;
                        job.counters.total_bytes += size;
                    }) {
                        manager.persist_job(&snapshot).await;
                    }
                    let ctx = Arc::clone(&ctx);
                    tasks.spawn(worker::run_transfer(ctx, *transfer));
                }
                Some(ScanMsg::Cursor(cursor)) => {
                    if let Some(snapshot) =
                        manager.update_snapshot(job_id, |job| job.cursor = Some(cursor))
                    {
                        manager.persist_job(&snapshot).await;
                    }
                }
                Some(ScanMsg::Done) => {
                    scan_running = false;
                    if let Some(snapshot) =
                        manager.update_snapshot(job_id, |job| job.scan_complete = true)
                    {
                        manager.persist_job(&snapshot).await;
                    }
                }
                Some(ScanMsg::Failed(error)) => {
                    scan_running = false;
                    tracing::warn!("Channel scan failed for job {}: {}", job_id, error);
                    // Stop in-flight transfers at their next checkpoint but
                    // keep their resume state; individual files are not at
                    // fault here.
                    ctx.halt_keep_state.store(true, Ordering::Relaxed);
                    manager.signal_gate(job_id, Gate::Cancelled);
                    stop = Some(StopReason::Failed(error.to_string()));
                }
                None => {
                    // Scan exited without a verdict (job cancel or shutdown)
                    scan_running = false;
                }
            },
            outcome = tasks.join_next(), if !tasks.is_empty() => {
                if let Some(Ok((_, outcome))) = outcome {
                    tally(&manager, &ctx, outcome).await;
                }
            },
            else => break,
        }

        if !scan_running && tasks.is_empty() {
            break;
        }
    }

    // Work has drained; decide the final state
    let gate_now = *ctx.gate.clone().borrow_and_update();
    let reason = stop.unwrap_or(match gate_now {
        Gate::Cancelled if ctx.halting() => StopReason::Halted,
        Gate::Cancelled => StopReason::Cancelled,
        _ => StopReason::Completed,
    });

    match reason {
        StopReason::Completed => {
            // A job that paused while the last transfers drained stays
            // paused; completion happens on resume.
            let paused = manager
                .job(job_id)
                .map(|j| j.state == JobState::Paused)
                .unwrap_or(false);
            if paused {
                return;
            }
            let snapshot = manager.update_snapshot(job_id, |job| {
                job.state = JobState::Completed;
                job.completed_at = Some(chrono::Utc::now());
            });
            if let Some(snapshot) = snapshot {
                manager.persist_job(&snapshot).await;
                manager.events().publish(crate::events::Event::JobStateChanged {
                    job: job_id,
                    old_state: JobState::Active,
                    new_state: JobState::Completed,
                });
                manager.events().publish(crate::events::Event::JobCompleted {
                    job: job_id,
                    counters: snapshot.counters,
                });
                tracing::info!(
                    "Job {} completed: {} done, {} failed, {} skipped",
                    job_id,
                    snapshot.counters.completed_files,
                    snapshot.counters.failed_files,
                    snapshot.counters.skipped_files
                );
            }
        }
        StopReason::Cancelled => {
            discard_unfinished(&ctx).await;
            manager.transition(job_id, JobState::Cancelled).await;
            tracing::info!("Job {} cancelled", job_id);
        }
        StopReason::Failed(message) => {
            manager
                .transition(
                    job_id,
                    JobState::Failed {
                        message: message.clone(),
                    },
                )
                .await;
            manager.events().publish(crate::events::Event::JobFailed {
                job: job_id,
                error: message,
            });
        }
        StopReason::Halted => {
            // Shutdown: leave the persisted state for the next start
            if let Some(snapshot) = manager.job(job_id) {
                manager.persist_job(&snapshot).await;
            }
        }
    }
}

/// Fold one transfer outcome into the job counters
async fn tally(manager: &Arc<DownloadManager>, ctx: &Arc<JobContext>, outcome: TransferOutcome) {
    let job_id = ctx.job_id;
    let snapshot = match outcome {
        TransferOutcome::Done { bytes } => manager.update_snapshot(job_id, |job| {
            job.counters.completed_files += 1;
            job.counters.downloaded_bytes += bytes;
        }),
        TransferOutcome::DuplicateSkipped => {
            manager.update_snapshot(job_id, |job| job.counters.skipped_files += 1)
        }
        TransferOutcome::Failed { storage_error } => {
            let snapshot =
                manager.update_snapshot(job_id, |job| job.counters.failed_files += 1);
            if storage_error {
                // A disk-level problem will take every sibling transfer down
                // with it; hold the job for user intervention.
                if let Some(snapshot) = snapshot {
                    manager.persist_job(&snapshot).await;
                }
                manager.auto_pause(job_id).await;
                return;
            }
            snapshot
        }
        TransferOutcome::Stopped => None,
    };
    if let Some(snapshot) = snapshot {
        manager.persist_job(&snapshot).await;
    }
}

/// Cancel cascade: discard every non-terminal transfer of the job (rows,
/// ledger entries, partial files). Terminal transfers stay as history.
async fn discard_unfinished(ctx: &Arc<JobContext>) {
    let job_id = ctx.job_id;
    let rows = match ctx.storage.load_transfers(job_id).await {
        Ok(rows) => rows,
        Err(e) => {
            tracing::warn!("Failed to load transfers for cancel cleanup: {}", e);
            return;
        }
    };
    for row in rows.iter().filter(|r| !r.state.is_terminal()) {
        let part = row.part_path();
        if part.exists() {
            if let Err(e) = tokio::fs::remove_file(&part).await {
                tracing::debug!("Failed to remove partial file {:?}: {}", part, e);
            }
        }
        if let Err(e) = ctx.storage.delete_transfer(row.id).await {
            tracing::debug!("Failed to delete transfer row {}: {}", row.id, e);
        }
    }
    if let Err(e) = ctx.ledger.clear_job(job_id).await {
        tracing::debug!("Failed to clear ledger for job {}: {}", job_id, e);
    }
}
