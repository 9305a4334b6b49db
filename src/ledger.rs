//! Partial transfer ledger
//!
//! Persisted byte-offset bookkeeping that lets transfers resume after a
//! pause, crash, or restart. An offset in the ledger is a promise: those
//! bytes are on disk and are never fetched again.

use crate::error::Result;
use crate::storage::Storage;
use crate::types::JobId;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Committed byte offset for one (job, source) pair
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Owning job
    pub job_id: JobId,
    /// Platform file uid
    pub source_uid: String,
    /// Bytes confirmed on disk
    pub offset: u64,
    /// Last flush time
    pub updated_at: DateTime<Utc>,
}

/// Process-wide resume-offset index.
///
/// An in-memory map fronts the storage layer; reads take a shared lock and
/// each commit updates one key before persisting, so independent transfers
/// never contend on a global write lock for the duration of the I/O.
pub struct TransferLedger {
    entries: RwLock<HashMap<(JobId, String), LedgerEntry>>,
    storage: Arc<dyn Storage>,
}

impl TransferLedger {
    /// Load the index from storage
    pub async fn load(storage: Arc<dyn Storage>) -> Result<Self> {
        let entries = storage.load_ledger().await?;
        let map = entries
            .into_iter()
            .map(|e| ((e.job_id, e.source_uid.clone()), e))
            .collect();
        Ok(Self {
            entries: RwLock::new(map),
            storage,
        })
    }

    /// Committed offset for a transfer, if any
    pub fn offset(&self, job_id: JobId, source_uid: &str) -> Option<u64> {
        self.entries
            .read()
            .get(&(job_id, source_uid.to_string()))
            .map(|e| e.offset)
    }

    /// Commit an offset at a flush checkpoint
    pub async fn commit(&self, job_id: JobId, source_uid: &str, offset: u64) -> Result<()> {
        let entry = LedgerEntry {
            job_id,
            source_uid: source_uid.to_string(),
            offset,
            updated_at: Utc::now(),
        };
        self.entries
            .write()
            .insert((job_id, source_uid.to_string()), entry.clone());
        self.storage.upsert_ledger(&entry).await
    }

    /// Remove a transfer's entry (called when it reaches a terminal state)
    pub async fn clear(&self, job_id: JobId, source_uid: &str) -> Result<()> {
        self.entries
            .write()
            .remove(&(job_id, source_uid.to_string()));
        self.storage.delete_ledger(job_id, source_uid).await
    }

    /// Remove every entry belonging to a job (cancel cascade)
    pub async fn clear_job(&self, job_id: JobId) -> Result<()> {
        self.entries.write().retain(|(job, _), _| *job != job_id);
        self.storage.delete_job_ledger(job_id).await
    }

    /// Number of live entries
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Is the ledger empty?
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}
