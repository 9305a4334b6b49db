//! Storage Module
//!
//! Persistent state for jobs, transfers, the resume ledger, the fingerprint
//! index, and platform sessions. Uses SQLite with WAL mode for crash-safe
//! atomic commits.

pub mod sqlite;

pub use sqlite::SqliteStorage;

use crate::client::SessionInfo;
use crate::error::Result;
use crate::fingerprint::FingerprintRecord;
use crate::ledger::LedgerEntry;
use crate::types::{FileTransfer, JobId, JobSnapshot, TransferId};
use async_trait::async_trait;

/// Storage trait for persisting manager state
///
/// Implementations handle storing and retrieving job and transfer state to
/// allow resume after crashes or restarts. All tables survive the process;
/// the manager reconciles its in-memory scheduler state from them on
/// startup.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Save or update a job snapshot (status and counters in one write)
    async fn save_job(&self, job: &JobSnapshot) -> Result<()>;

    /// Load a job by ID
    async fn load_job(&self, id: JobId) -> Result<Option<JobSnapshot>>;

    /// Load all jobs, newest first
    async fn load_jobs(&self) -> Result<Vec<JobSnapshot>>;

    /// Delete a job record (transfers cascade)
    async fn delete_job(&self, id: JobId) -> Result<()>;

    /// Save or update a transfer record
    async fn save_transfer(&self, transfer: &FileTransfer) -> Result<()>;

    /// Load all transfers of a job, oldest first
    async fn load_transfers(&self, job: JobId) -> Result<Vec<FileTransfer>>;

    /// Delete one transfer record
    async fn delete_transfer(&self, id: TransferId) -> Result<()>;

    /// Delete every transfer of a job
    async fn delete_job_transfers(&self, job: JobId) -> Result<()>;

    /// Insert or update a ledger entry
    async fn upsert_ledger(&self, entry: &LedgerEntry) -> Result<()>;

    /// Delete one ledger entry
    async fn delete_ledger(&self, job: JobId, source_uid: &str) -> Result<()>;

    /// Delete every ledger entry of a job
    async fn delete_job_ledger(&self, job: JobId) -> Result<()>;

    /// Load the full ledger
    async fn load_ledger(&self) -> Result<Vec<LedgerEntry>>;

    /// Insert a fingerprint record (first writer wins)
    async fn insert_fingerprint(&self, record: &FingerprintRecord) -> Result<()>;

    /// Load the full fingerprint index
    async fn load_fingerprints(&self) -> Result<Vec<FingerprintRecord>>;

    /// Drop every fingerprint record
    async fn purge_fingerprints(&self) -> Result<()>;

    /// Save or update a platform session
    async fn save_session(&self, session: &SessionInfo) -> Result<()>;

    /// Load a session by phone number
    async fn load_session(&self, phone: &str) -> Result<Option<SessionInfo>>;

    /// Check if the database is healthy
    async fn health_check(&self) -> Result<()>;

    /// Compact/vacuum the database
    async fn compact(&self) -> Result<()>;
}

/// In-memory storage for testing
#[derive(Default)]
pub struct MemoryStorage {
    jobs: parking_lot::RwLock<std::collections::HashMap<JobId, JobSnapshot>>,
    transfers: parking_lot::RwLock<std::collections::HashMap<TransferId, FileTransfer>>,
    ledger: parking_lot::RwLock<std::collections::HashMap<(JobId, String), LedgerEntry>>,
    fingerprints: parking_lot::RwLock<std::collections::HashMap<String, FingerprintRecord>>,
    sessions: parking_lot::RwLock<std::collections::HashMap<String, SessionInfo>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn save_job(&self, job: &JobSnapshot) -> Result<()> {
        self.jobs.write().insert(job.id, job.clone());
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> Result<Option<JobSnapshot>> {
        Ok(self.jobs.read().get(&id).cloned())
    }

    async fn load_jobs(&self) -> Result<Vec<JobSnapshot>> {
        let mut jobs: Vec<_> = self.jobs.read().values().cloned().collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }

    async fn delete_job(&self, id: JobId) -> Result<()> {
        self.jobs.write().remove(&id);
        self.transfers.write().retain(|_, t| t.job_id != id);
        self.ledger.write().retain(|(job, _), _| *job != id);
        Ok(())
    }

    async fn save_transfer(&self, transfer: &FileTransfer) -> Result<()> {
        self.transfers.write().insert(transfer.id, transfer.clone());
        Ok(())
    }

    async fn load_transfers(&self, job: JobId) -> Result<Vec<FileTransfer>> {
        let mut transfers: Vec<_> = self
            .transfers
            .read()
            .values()
            .filter(|t| t.job_id == job)
            .cloned()
            .collect();
        transfers.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then(a.source.message_id.cmp(&b.source.message_id))
        });
        Ok(transfers)
    }

    async fn delete_transfer(&self, id: TransferId) -> Result<()> {
        self.transfers.write().remove(&id);
        Ok(())
    }

    async fn delete_job_transfers(&self, job: JobId) -> Result<()> {
        self.transfers.write().retain(|_, t| t.job_id != job);
        Ok(())
    }

    async fn upsert_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        self.ledger
            .write()
            .insert((entry.job_id, entry.source_uid.clone()), entry.clone());
        Ok(())
    }

    async fn delete_ledger(&self, job: JobId, source_uid: &str) -> Result<()> {
        self.ledger.write().remove(&(job, source_uid.to_string()));
        Ok(())
    }

    async fn delete_job_ledger(&self, job: JobId) -> Result<()> {
        self.ledger.write().retain(|(j, _), _| *j != job);
        Ok(())
    }

    async fn load_ledger(&self) -> Result<Vec<LedgerEntry>> {
        Ok(self.ledger.read().values().cloned().collect())
    }

    async fn insert_fingerprint(&self, record: &FingerprintRecord) -> Result<()> {
        self.fingerprints
            .write()
            .entry(record.fingerprint.as_str().to_string())
            .or_insert_with(|| record.clone());
        Ok(())
    }

    async fn load_fingerprints(&self) -> Result<Vec<FingerprintRecord>> {
        Ok(self.fingerprints.read().values().cloned().collect())
    }

    async fn purge_fingerprints(&self) -> Result<()> {
        self.fingerprints.write().clear();
        Ok(())
    }

    async fn save_session(&self, session: &SessionInfo) -> Result<()> {
        self.sessions
            .write()
            .insert(session.phone.clone(), session.clone());
        Ok(())
    }

    async fn load_session(&self, phone: &str) -> Result<Option<SessionInfo>> {
        Ok(self.sessions.read().get(phone).cloned())
    }

    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    async fn compact(&self) -> Result<()> {
        Ok(())
    }
}
