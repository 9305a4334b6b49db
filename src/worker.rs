//! Transfer worker
//!
//! Executes one file transfer: duplicate pre-check, ledger-based resume,
//! chunked streaming to a `.part` file with flush-interval checkpoints,
//! cooperative pause/cancel, retry with exponential backoff, and fingerprint
//! recording on completion.

use crate::error::ManagerError;
use crate::events::Event;
use crate::fingerprint::{Digester, Fingerprint, FingerprintRecord};
use crate::runner::{wait_active, wait_not_active, Gate, JobContext};
use crate::types::{FileTransfer, TransferId, TransferState};
use chrono::Utc;
use futures_util::StreamExt;
use std::sync::Arc;
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::watch;

/// Result of running one transfer to rest
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TransferOutcome {
    /// All bytes landed and the fingerprint was recorded
    Done { bytes: u64 },
    /// Suppressed by the fingerprint store
    DuplicateSkipped,
    /// Permanently failed; `storage_error` holds the job for intervention
    Failed { storage_error: bool },
    /// The job was cancelled or halted before this transfer settled
    Stopped,
}

/// How a single streaming attempt ended
enum AttemptEnd {
    Done { bytes: u64 },
    DuplicateSkipped,
    /// Halted at a checkpoint because the job paused
    Paused,
    /// Halted at a checkpoint because the job was cancelled/halted
    Stopped,
}

/// Run a transfer until it settles, parking across job pauses.
///
/// The task outlives pauses: it waits on the gate, re-acquires a queue slot
/// on resume, and continues from the committed ledger offset. It returns
/// only when the transfer is terminal or the job stops.
pub(crate) async fn run_transfer(
    ctx: Arc<JobContext>,
    mut transfer: FileTransfer,
) -> (TransferId, TransferOutcome) {
    let id = transfer.id;
    let mut gate = ctx.gate.clone();

    loop {
        if wait_active(&mut gate).await == Gate::Cancelled {
            let outcome = stop_cleanup(&ctx, &transfer).await;
            return (id, outcome);
        }

        // Queue for a slot; withdraw if the job leaves Active while waiting
        // so a paused job's tasks vacate the runnable set immediately.
        let permit = tokio::select! {
            permit = ctx.queue.acquire(id, ctx.job_id, ctx.priority) => permit,
            _ = wait_not_active(&mut gate) => {
                ctx.queue.remove(id);
                continue;
            }
        };

        let end = run_attempts(&ctx, &mut transfer, &mut gate).await;
        drop(permit);

        match end {
            Ok(AttemptEnd::Done { bytes }) => return (id, TransferOutcome::Done { bytes }),
            Ok(AttemptEnd::DuplicateSkipped) => return (id, TransferOutcome::DuplicateSkipped),
            Ok(AttemptEnd::Paused) => continue,
            Ok(AttemptEnd::Stopped) => {
                let outcome = stop_cleanup(&ctx, &transfer).await;
                return (id, outcome);
            }
            Err(error) => {
                let storage_error = matches!(
                    error,
                    ManagerError::Storage { .. } | ManagerError::Database(_)
                );
                fail_transfer(&ctx, &mut transfer, &error).await;
                return (id, TransferOutcome::Failed { storage_error });
            }
        }
    }
}

/// Attempt the transfer, retrying transient transport errors with backoff
async fn run_attempts(
    ctx: &Arc<JobContext>,
    transfer: &mut FileTransfer,
    gate: &mut watch::Receiver<Gate>,
) -> Result<AttemptEnd, ManagerError> {
    loop {
        transfer.attempts += 1;
        match attempt(ctx, transfer, gate).await {
            Ok(end) => return Ok(end),
            Err(error)
                if error.is_retryable() && transfer.attempts < ctx.config.retry.max_attempts =>
            {
                tracing::debug!(
                    "Transfer {} attempt {} failed, retrying: {}",
                    transfer.id,
                    transfer.attempts,
                    error
                );
                ctx.events.publish(Event::TransferRetrying {
                    job: ctx.job_id,
                    transfer: transfer.id,
                    attempt: transfer.attempts,
                    error: error.to_string(),
                });
                persist_transfer(ctx, transfer).await;

                let delay = ctx.config.retry.delay_for_attempt(transfer.attempts);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = wait_not_active(gate) => {
                        return Ok(match *gate.borrow() {
                            Gate::Cancelled => AttemptEnd::Stopped,
                            _ => AttemptEnd::Paused,
                        });
                    }
                }
            }
            Err(error) => return Err(error),
        }
    }
}

/// One streaming pass over the file
async fn attempt(
    ctx: &Arc<JobContext>,
    transfer: &mut FileTransfer,
    gate: &mut watch::Receiver<Gate>,
) -> Result<AttemptEnd, ManagerError> {
    let job_id = ctx.job_id;
    let uid = transfer.source.file_uid.clone();

    // Fast-path duplicate pre-check: platform uid, then platform hash.
    // No bytes move for a known source.
    if ctx.skip_duplicates {
        if let Some(known) = ctx
            .fingerprints
            .check_source(&uid, transfer.source.content_hash.as_deref())
        {
            return skip_duplicate(ctx, transfer, known.fingerprint).await;
        }
    }

    // Resolve the resume offset: the ledger holds the committed truth, the
    // partial file what actually hit disk. Resume from the shorter of the
    // two; bytes past the last flush are refetched (at most one interval).
    let part = transfer.part_path();
    let committed = ctx.ledger.offset(job_id, &uid).unwrap_or(0);
    let on_disk = match fs::metadata(&part).await {
        Ok(meta) => meta.len(),
        Err(_) => 0,
    };
    let offset = committed.min(on_disk);

    if let Some(parent) = part.parent() {
        fs::create_dir_all(parent).await?;
    }

    let mut file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(&part)
        .await?;
    if on_disk != offset {
        file.set_len(offset).await?;
    }
    file.seek(SeekFrom::Start(offset)).await?;

    // The fingerprint covers the whole file, so a resumed transfer re-hashes
    // the prefix it is keeping.
    let mut digester = Digester::new();
    if offset > 0 {
        hash_prefix(&part, offset, &mut digester).await?;
    }

    let mut stream = ctx.client.fetch_file(&transfer.source, offset).await?;

    transfer.state = TransferState::Downloading;
    transfer.bytes_transferred = offset;
    persist_transfer(ctx, transfer).await;
    if offset == 0 {
        ctx.events.publish(Event::TransferStarted {
            job: job_id,
            transfer: transfer.id,
            name: transfer.source.name.clone(),
        });
    } else {
        ctx.events.publish(Event::TransferResumed {
            job: job_id,
            transfer: transfer.id,
            offset,
        });
    }

    let mut written = offset;
    let mut last_flush = offset;

    loop {
        // Wake on gate changes even while the platform read stalls, so a
        // pause or cancel never waits on a dead connection.
        let next = tokio::select! {
            chunk = stream.next() => chunk,
            _ = wait_not_active(gate) => {
                let gate_state = *gate.borrow();
                match gate_state {
                    Gate::Cancelled => {
                        if ctx.halting() {
                            checkpoint(ctx, transfer, &mut file, written).await?;
                            persist_transfer(ctx, transfer).await;
                        }
                        return Ok(AttemptEnd::Stopped);
                    }
                    _ => {
                        checkpoint(ctx, transfer, &mut file, written).await?;
                        transfer.state = TransferState::Paused;
                        persist_transfer(ctx, transfer).await;
                        ctx.events.publish(Event::TransferPaused {
                            job: job_id,
                            transfer: transfer.id,
                            bytes: written,
                        });
                        return Ok(AttemptEnd::Paused);
                    }
                }
            }
        };
        let Some(chunk) = next else { break };
        let chunk = chunk?;
        file.write_all(&chunk).await?;
        digester.update(&chunk);
        written += chunk.len() as u64;

        if let Some(expected) = transfer.expected_size {
            if written > expected {
                return Err(ManagerError::transport(format!(
                    "stream exceeded declared size ({} > {})",
                    written, expected
                )));
            }
        }

        if written - last_flush >= ctx.config.flush_interval_bytes {
            checkpoint(ctx, transfer, &mut file, written).await?;
            last_flush = written;
        }

        // Post-chunk-write checkpoint: pause/cancel takes effect here, so
        // stop latency is bounded by one chunk write.
        let gate_state = *gate.borrow_and_update();
        match gate_state {
            Gate::Active => {}
            Gate::Paused => {
                checkpoint(ctx, transfer, &mut file, written).await?;
                transfer.state = TransferState::Paused;
                persist_transfer(ctx, transfer).await;
                ctx.events.publish(Event::TransferPaused {
                    job: job_id,
                    transfer: transfer.id,
                    bytes: written,
                });
                return Ok(AttemptEnd::Paused);
            }
            Gate::Cancelled => {
                if ctx.halting() {
                    // Keep resume state for the next start
                    checkpoint(ctx, transfer, &mut file, written).await?;
                    persist_transfer(ctx, transfer).await;
                }
                return Ok(AttemptEnd::Stopped);
            }
        }
    }

    file.flush().await?;

    // A short stream is a transient transport fault: commit what landed so
    // the retry resumes past it.
    if let Some(expected) = transfer.expected_size {
        if written < expected {
            ctx.ledger.commit(job_id, &uid, written).await?;
            transfer.bytes_transferred = written;
            persist_transfer(ctx, transfer).await;
            return Err(ManagerError::transient(format!(
                "stream ended early ({} of {} bytes)",
                written, expected
            )));
        }
    }

    let fingerprint = digester.finalize();

    // Authoritative post-download check: two distinct messages can carry the
    // same bytes. The first copy wins; this one is discarded.
    if ctx.skip_duplicates && ctx.fingerprints.check_content(&fingerprint).is_some() {
        drop(file);
        fs::remove_file(&part).await.ok();
        return skip_duplicate(ctx, transfer, fingerprint).await;
    }

    drop(file);
    fs::rename(&part, &transfer.target_path).await?;

    ctx.fingerprints
        .record(FingerprintRecord {
            fingerprint: fingerprint.clone(),
            source_uid: uid.clone(),
            path: transfer.target_path.clone(),
            job_id,
            recorded_at: Utc::now(),
        })
        .await?;
    ctx.ledger.clear(job_id, &uid).await?;

    transfer.state = TransferState::Done;
    transfer.bytes_transferred = written;
    if transfer.expected_size.is_none() {
        transfer.expected_size = Some(written);
    }
    transfer.fingerprint = Some(fingerprint.as_str().to_string());
    persist_transfer(ctx, transfer).await;
    ctx.events.publish(Event::TransferCompleted {
        job: job_id,
        transfer: transfer.id,
        bytes: written,
        fingerprint: fingerprint.as_str().to_string(),
    });

    Ok(AttemptEnd::Done { bytes: written })
}

/// Flush the file and commit the ledger + row at a checkpoint
async fn checkpoint(
    ctx: &Arc<JobContext>,
    transfer: &mut FileTransfer,
    file: &mut tokio::fs::File,
    written: u64,
) -> Result<(), ManagerError> {
    file.flush().await?;
    ctx.ledger
        .commit(ctx.job_id, &transfer.source.file_uid, written)
        .await?;
    transfer.bytes_transferred = written;
    persist_transfer(ctx, transfer).await;
    ctx.events.publish(Event::TransferProgress {
        job: ctx.job_id,
        transfer: transfer.id,
        bytes: written,
        total: transfer.expected_size,
    });
    Ok(())
}

/// Settle a transfer as a duplicate
async fn skip_duplicate(
    ctx: &Arc<JobContext>,
    transfer: &mut FileTransfer,
    fingerprint: Fingerprint,
) -> Result<AttemptEnd, ManagerError> {
    // A transfer paused in an earlier session may have left a partial file
    let part = transfer.part_path();
    if part.exists() {
        fs::remove_file(&part).await.ok();
    }
    ctx.ledger
        .clear(ctx.job_id, &transfer.source.file_uid)
        .await?;
    transfer.state = TransferState::DuplicateSkipped;
    transfer.fingerprint = Some(fingerprint.as_str().to_string());
    persist_transfer(ctx, transfer).await;
    ctx.events.publish(Event::DuplicateSkipped {
        job: ctx.job_id,
        transfer: transfer.id,
        fingerprint: Some(fingerprint.as_str().to_string()),
    });
    Ok(AttemptEnd::DuplicateSkipped)
}

/// Settle a transfer as permanently failed
async fn fail_transfer(ctx: &Arc<JobContext>, transfer: &mut FileTransfer, error: &ManagerError) {
    let part = transfer.part_path();
    if part.exists() {
        fs::remove_file(&part).await.ok();
    }
    if let Err(e) = ctx
        .ledger
        .clear(ctx.job_id, &transfer.source.file_uid)
        .await
    {
        tracing::debug!("Failed to clear ledger for failed transfer: {}", e);
    }
    transfer.state = TransferState::Failed {
        message: error.to_string(),
    };
    persist_transfer(ctx, transfer).await;
    ctx.events.publish(Event::TransferFailed {
        job: ctx.job_id,
        transfer: transfer.id,
        error: error.to_string(),
    });
    tracing::warn!("Transfer {} failed permanently: {}", transfer.id, error);
}

/// Cleanup when the job stops under this transfer.
///
/// A user cancel discards the partial file and ledger entry (a cancelled
/// job has no resumption path); a halt (shutdown, scan failure) keeps both.
async fn stop_cleanup(ctx: &Arc<JobContext>, transfer: &FileTransfer) -> TransferOutcome {
    if !ctx.halting() {
        let part = transfer.part_path();
        if part.exists() {
            fs::remove_file(&part).await.ok();
        }
        if let Err(e) = ctx
            .ledger
            .clear(ctx.job_id, &transfer.source.file_uid)
            .await
        {
            tracing::debug!("Failed to clear ledger for cancelled transfer: {}", e);
        }
        ctx.events.publish(Event::TransferCancelled {
            job: ctx.job_id,
            transfer: transfer.id,
        });
    }
    TransferOutcome::Stopped
}

/// Feed the first `len` bytes of a file through the digester
async fn hash_prefix(
    path: &std::path::Path,
    len: u64,
    digester: &mut Digester,
) -> Result<(), ManagerError> {
    let mut file = fs::File::open(path).await?;
    let mut remaining = len;
    let mut buf = vec![0u8; 64 * 1024];
    while remaining > 0 {
        let want = (buf.len() as u64).min(remaining) as usize;
        let read = file.read(&mut buf[..want]).await?;
        if read == 0 {
            break;
        }
        digester.update(&buf[..read]);
        remaining -= read as u64;
    }
    Ok(())
}

/// Persist a transfer row, logging instead of failing the transfer when the
/// write is for bookkeeping only
async fn persist_transfer(ctx: &Arc<JobContext>, transfer: &mut FileTransfer) {
    transfer.updated_at = Utc::now();
    if let Err(e) = ctx.storage.save_transfer(transfer).await {
        tracing::warn!("Failed to persist transfer {}: {}", transfer.id, e);
    }
}
