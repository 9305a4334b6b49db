//! Channel scan
//!
//! Pages through a channel's document-bearing messages from the persisted
//! cursor, filters by extension/MIME, and creates one transfer row per
//! accepted file. Exactly one scan task runs per job; it is the sole owner
//! of the job's cursor.

use crate::client::FileRef;
use crate::error::ManagerError;
use crate::runner::{wait_active, Gate, JobContext};
use crate::types::{FileTransfer, TransferState};
use chrono::Utc;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Messages from the scan task to the job runner
pub(crate) enum ScanMsg {
    /// An accepted file; its transfer row is already persisted
    Found(Box<FileTransfer>),
    /// The cursor advanced past a page boundary
    Cursor(i64),
    /// End of channel, or the max_files cap was reached
    Done,
    /// The scan cannot proceed; this fails the whole job
    Failed(ManagerError),
}

/// Drive the scan until the channel is exhausted, the cap is reached, or
/// the job stops.
pub(crate) async fn run_scan(
    ctx: Arc<JobContext>,
    mut cursor: Option<i64>,
    mut known_uids: HashSet<String>,
    mut used_names: HashSet<String>,
    mut accepted: u64,
    tx: mpsc::Sender<ScanMsg>,
) {
    let mut gate = ctx.gate.clone();
    let max_files = ctx.filter.max_files.map(|n| n as u64);
    let mut page_attempts: u32 = 0;

    loop {
        if wait_active(&mut gate).await == Gate::Cancelled {
            return;
        }

        if max_files.is_some_and(|max| accepted >= max) {
            let _ = tx.send(ScanMsg::Done).await;
            return;
        }

        let page = match ctx
            .client
            .fetch_messages(&ctx.channel, cursor, ctx.config.scan_page_size)
            .await
        {
            Ok(page) => {
                page_attempts = 0;
                page
            }
            Err(e) if e.is_retryable() && page_attempts + 1 < ctx.config.retry.max_attempts => {
                page_attempts += 1;
                tracing::debug!(
                    "Scan page for job {} failed (attempt {}): {}",
                    ctx.job_id,
                    page_attempts,
                    e
                );
                tokio::time::sleep(ctx.config.retry.delay_for_attempt(page_attempts)).await;
                continue;
            }
            Err(e) => {
                let _ = tx
                    .send(ScanMsg::Failed(ManagerError::scan(e.to_string())))
                    .await;
                return;
            }
        };

        for file in page.files {
            if max_files.is_some_and(|max| accepted >= max) {
                break;
            }
            if !ctx.filter.accepts(&file.name, file.mime.as_deref()) {
                continue;
            }
            // Rescans (resume after restart) see files that already have rows
            if !known_uids.insert(file.file_uid.clone()) {
                continue;
            }

            let transfer = match make_transfer(&ctx, &file, &mut used_names) {
                Some(t) => t,
                None => continue,
            };
            if let Err(e) = ctx.storage.save_transfer(&transfer).await {
                let _ = tx
                    .send(ScanMsg::Failed(ManagerError::scan(format!(
                        "failed to persist discovered file: {}",
                        e
                    ))))
                    .await;
                return;
            }
            accepted += 1;
            ctx.events.publish(crate::events::Event::ScanProgress {
                job: ctx.job_id,
                discovered: accepted,
                cursor: file.message_id,
            });
            if tx.send(ScanMsg::Found(Box::new(transfer))).await.is_err() {
                return;
            }
        }

        match page.next_cursor {
            Some(next) => {
                cursor = Some(next);
                if tx.send(ScanMsg::Cursor(next)).await.is_err() {
                    return;
                }
            }
            None => {
                let _ = tx.send(ScanMsg::Done).await;
                return;
            }
        }
    }
}

/// Build a transfer record with a deterministic, collision-free target path
fn make_transfer(
    ctx: &JobContext,
    file: &FileRef,
    used_names: &mut HashSet<String>,
) -> Option<FileTransfer> {
    let name = target_filename(file, used_names)?;
    used_names.insert(name.clone());

    let now = Utc::now();
    Some(FileTransfer {
        id: crate::types::TransferId::new(),
        job_id: ctx.job_id,
        source: file.clone(),
        target_path: ctx.job_dir.join(name),
        expected_size: file.size,
        bytes_transferred: 0,
        fingerprint: None,
        state: TransferState::Queued,
        attempts: 0,
        created_at: now,
        updated_at: now,
    })
}

/// Sanitized filename, disambiguated with the message id on collision.
///
/// The result is deterministic from the source reference, so the same file
/// lands at the same path on every rescan.
fn target_filename(file: &FileRef, used_names: &HashSet<String>) -> Option<String> {
    let sanitized = sanitize_filename(&file.name);
    let name = if sanitized.is_empty() {
        file.file_uid.clone()
    } else {
        sanitized
    };
    if !used_names.contains(&name) {
        return Some(name);
    }

    let path = PathBuf::from(&name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(&name);
    let disambiguated = match path.extension().and_then(|e| e.to_str()) {
        Some(ext) => format!("{}.{}.{}", stem, file.message_id, ext),
        None => format!("{}.{}", stem, file.message_id),
    };
    if used_names.contains(&disambiguated) {
        // Same message id and name twice means a platform glitch; skip it
        return None;
    }
    Some(disambiguated)
}

/// Strip path separators and other characters that would escape the job
/// directory
fn sanitize_filename(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| match c {
            '/' | '\\' | '\0' => '_',
            c => c,
        })
        .collect();
    cleaned.trim_matches(['.', ' ']).to_string()
}
