//! Shared helpers for integration tests
//!
//! Provides an in-process fake `ChannelClient` with controllable pacing and
//! fault injection, a storage wrapper that injects disk errors, and
//! event/state wait utilities.

#![allow(dead_code)]

use bytes::Bytes;
use chanfetch::{
    AuthChallenge, AuthOutcome, ByteStream, ChannelClient, ChannelInfo, DownloadManager, Event,
    FileRef, FingerprintRecord, FileTransfer, JobId, JobSnapshot, JobState, LedgerEntry,
    ManagerError, MessagePage, Result, SessionInfo, Storage, StorageErrorKind, TransferId,
};
use chrono::Utc;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, Semaphore};
use tokio::time::timeout;

/// One file served by the fake channel
#[derive(Clone)]
pub struct FakeFile {
    pub file: FileRef,
    pub content: Arc<Vec<u8>>,
}

/// Build a fake file; the uid derives from the message id
pub fn fake_file(message_id: i64, name: &str, content: &[u8]) -> FakeFile {
    FakeFile {
        file: FileRef {
            message_id,
            file_uid: format!("uid-{}", message_id),
            name: name.to_string(),
            size: Some(content.len() as u64),
            mime: None,
            content_hash: None,
        },
        content: Arc::new(content.to_vec()),
    }
}

/// Error class for injected fetch faults
#[derive(Clone, Copy)]
pub enum FaultKind {
    /// Retryable transport error
    Transient,
    /// Platform reports the file gone
    Permanent,
}

impl FaultKind {
    fn to_error(self) -> ManagerError {
        match self {
            Self::Transient => ManagerError::transient("injected transport fault"),
            Self::Permanent => ManagerError::file_unavailable("injected: file gone"),
        }
    }
}

/// A fault consumed by one `fetch_file` call
#[derive(Clone, Copy)]
pub enum FetchFault {
    /// Fail before any bytes move
    OnOpen(FaultKind),
    /// Deliver `after` bytes (relative to the requested offset), then fail
    MidStream { after: u64, kind: FaultKind },
}

/// In-process fake of the messaging platform.
///
/// Serves a fixed set of document-bearing messages, streams file content in
/// chunks, optionally gated on a semaphore (one permit per chunk) so tests
/// control exactly how many bytes flow, and records every fetch offset so
/// tests can prove bytes are never re-transmitted.
pub struct FakeChannel {
    files: Vec<FakeFile>,
    chunk_size: usize,
    throttle: Option<Arc<Semaphore>>,
    fetch_faults: Mutex<HashMap<String, VecDeque<FetchFault>>>,
    scan_fault: Mutex<Option<String>>,
    fetch_log: Mutex<Vec<(String, u64)>>,
}

impl FakeChannel {
    pub fn new(files: Vec<FakeFile>) -> Self {
        Self {
            files,
            chunk_size: 100,
            throttle: None,
            fetch_faults: Mutex::new(HashMap::new()),
            scan_fault: Mutex::new(None),
            fetch_log: Mutex::new(Vec::new()),
        }
    }

    pub fn with_chunk_size(mut self, chunk_size: usize) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    /// Gate each chunk on one permit from this semaphore
    pub fn with_throttle(mut self, throttle: Arc<Semaphore>) -> Self {
        self.throttle = Some(throttle);
        self
    }

    /// Queue a fault for the next fetch of this uid
    pub fn inject_fetch_fault(&self, uid: &str, fault: FetchFault) {
        self.fetch_faults
            .lock()
            .entry(uid.to_string())
            .or_default()
            .push_back(fault);
    }

    /// Make every scan page fail with a channel-scan error
    pub fn fail_scans(&self, message: &str) {
        *self.scan_fault.lock() = Some(message.to_string());
    }

    /// Every (uid, offset) pair `fetch_file` was called with, in order
    pub fn fetch_log(&self) -> Vec<(String, u64)> {
        self.fetch_log.lock().clone()
    }
}

#[async_trait::async_trait]
impl ChannelClient for FakeChannel {
    async fn authenticate(&self, phone: &str) -> Result<AuthOutcome> {
        Ok(AuthOutcome::CodeRequired(AuthChallenge {
            phone: phone.to_string(),
            token: "fake-token".to_string(),
        }))
    }

    async fn confirm(&self, challenge: &AuthChallenge, _code: &str) -> Result<SessionInfo> {
        Ok(SessionInfo {
            phone: challenge.phone.clone(),
            session_data: "fake-session".to_string(),
            created_at: Utc::now(),
            last_used: Utc::now(),
        })
    }

    async fn channel_info(&self, channel: &str) -> Result<ChannelInfo> {
        Ok(ChannelInfo {
            id: 7,
            title: channel.to_string(),
            username: Some(channel.to_string()),
        })
    }

    async fn fetch_messages(
        &self,
        _channel: &str,
        cursor: Option<i64>,
        limit: usize,
    ) -> Result<MessagePage> {
        if let Some(message) = self.scan_fault.lock().clone() {
            return Err(ManagerError::scan(message));
        }

        let mut files: Vec<_> = self
            .files
            .iter()
            .filter(|f| cursor.is_none_or(|c| f.file.message_id > c))
            .map(|f| f.file.clone())
            .collect();
        files.sort_by_key(|f| f.message_id);

        let page: Vec<_> = files.iter().take(limit).cloned().collect();
        let next_cursor = if files.len() > limit {
            page.last().map(|f| f.message_id)
        } else {
            None
        };

        Ok(MessagePage {
            files: page,
            next_cursor,
        })
    }

    async fn fetch_file(&self, file: &FileRef, offset: u64) -> Result<ByteStream> {
        self.fetch_log
            .lock()
            .push((file.file_uid.clone(), offset));

        let fault = self
            .fetch_faults
            .lock()
            .get_mut(&file.file_uid)
            .and_then(|q| q.pop_front());

        let fail_at = match fault {
            Some(FetchFault::OnOpen(kind)) => return Err(kind.to_error()),
            Some(FetchFault::MidStream { after, kind }) => Some((offset + after, kind)),
            None => None,
        };

        let content = self
            .files
            .iter()
            .find(|f| f.file.file_uid == file.file_uid)
            .map(|f| Arc::clone(&f.content))
            .ok_or_else(|| ManagerError::file_unavailable("no such file"))?;

        struct StreamState {
            content: Arc<Vec<u8>>,
            pos: usize,
            chunk_size: usize,
            throttle: Option<Arc<Semaphore>>,
            fail_at: Option<(u64, FaultKind)>,
            errored: bool,
        }

        let state = StreamState {
            content,
            pos: offset as usize,
            chunk_size: self.chunk_size,
            throttle: self.throttle.clone(),
            fail_at,
            errored: false,
        };

        let stream = futures_util::stream::unfold(state, |mut st| async move {
            if st.errored || st.pos >= st.content.len() {
                return None;
            }
            if let Some((fail_pos, kind)) = st.fail_at {
                if st.pos as u64 >= fail_pos {
                    st.errored = true;
                    return Some((Err(kind.to_error()), st));
                }
            }
            if let Some(throttle) = st.throttle.clone() {
                let permit = throttle.acquire_owned().await.ok()?;
                permit.forget();
            }
            let mut end = (st.pos + st.chunk_size).min(st.content.len());
            if let Some((fail_pos, _)) = st.fail_at {
                end = end.min(fail_pos as usize);
            }
            let chunk = Bytes::copy_from_slice(&st.content[st.pos..end]);
            st.pos = end;
            Some((Ok(chunk), st))
        });

        Ok(Box::pin(stream))
    }
}

/// Storage wrapper that injects a disk-full error on ledger writes while
/// armed; everything else passes through.
pub struct FlakyStorage {
    inner: Arc<dyn Storage>,
    fail_ledger_writes: AtomicBool,
}

impl FlakyStorage {
    pub fn new(inner: Arc<dyn Storage>) -> Self {
        Self {
            inner,
            fail_ledger_writes: AtomicBool::new(false),
        }
    }

    pub fn arm(&self) {
        self.fail_ledger_writes.store(true, Ordering::SeqCst);
    }

    pub fn disarm(&self) {
        self.fail_ledger_writes.store(false, Ordering::SeqCst);
    }
}

#[async_trait::async_trait]
impl Storage for FlakyStorage {
    async fn save_job(&self, job: &JobSnapshot) -> Result<()> {
        self.inner.save_job(job).await
    }

    async fn load_job(&self, id: JobId) -> Result<Option<JobSnapshot>> {
        self.inner.load_job(id).await
    }

    async fn load_jobs(&self) -> Result<Vec<JobSnapshot>> {
        self.inner.load_jobs().await
    }

    async fn delete_job(&self, id: JobId) -> Result<()> {
        self.inner.delete_job(id).await
    }

    async fn save_transfer(&self, transfer: &FileTransfer) -> Result<()> {
        self.inner.save_transfer(transfer).await
    }

    async fn load_transfers(&self, job: JobId) -> Result<Vec<FileTransfer>> {
        self.inner.load_transfers(job).await
    }

    async fn delete_transfer(&self, id: TransferId) -> Result<()> {
        self.inner.delete_transfer(id).await
    }

    async fn delete_job_transfers(&self, job: JobId) -> Result<()> {
        self.inner.delete_job_transfers(job).await
    }

    async fn upsert_ledger(&self, entry: &LedgerEntry) -> Result<()> {
        if self.fail_ledger_writes.load(Ordering::SeqCst) {
            return Err(ManagerError::storage(
                StorageErrorKind::DiskFull,
                "/dev/full",
                "injected: disk full",
            ));
        }
        self.inner.upsert_ledger(entry).await
    }

    async fn delete_ledger(&self, job: JobId, source_uid: &str) -> Result<()> {
        self.inner.delete_ledger(job, source_uid).await
    }

    async fn delete_job_ledger(&self, job: JobId) -> Result<()> {
        self.inner.delete_job_ledger(job).await
    }

    async fn load_ledger(&self) -> Result<Vec<LedgerEntry>> {
        self.inner.load_ledger().await
    }

    async fn insert_fingerprint(&self, record: &FingerprintRecord) -> Result<()> {
        self.inner.insert_fingerprint(record).await
    }

    async fn load_fingerprints(&self) -> Result<Vec<FingerprintRecord>> {
        self.inner.load_fingerprints().await
    }

    async fn purge_fingerprints(&self) -> Result<()> {
        self.inner.purge_fingerprints().await
    }

    async fn save_session(&self, session: &SessionInfo) -> Result<()> {
        self.inner.save_session(session).await
    }

    async fn load_session(&self, phone: &str) -> Result<Option<SessionInfo>> {
        self.inner.load_session(phone).await
    }

    async fn health_check(&self) -> Result<()> {
        self.inner.health_check().await
    }

    async fn compact(&self) -> Result<()> {
        self.inner.compact().await
    }
}

/// Wait for a specific event, discarding others
pub async fn wait_for_event<F>(
    rx: &mut broadcast::Receiver<Event>,
    predicate: F,
    timeout_duration: Duration,
) -> Option<Event>
where
    F: Fn(&Event) -> bool,
{
    let result = timeout(timeout_duration, async {
        loop {
            match rx.recv().await {
                Ok(event) if predicate(&event) => return Some(event),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => return None,
            }
        }
    })
    .await;
    result.unwrap_or(None)
}

/// Poll until the job reaches the given state
pub async fn wait_for_state(
    manager: &DownloadManager,
    id: JobId,
    state: JobState,
    timeout_duration: Duration,
) -> bool {
    let deadline = tokio::time::Instant::now() + timeout_duration;
    loop {
        if manager.job(id).map(|j| j.state) == Some(state.clone()) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
