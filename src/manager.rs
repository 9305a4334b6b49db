//! Download Manager - Main coordinator
//!
//! The `DownloadManager` is the primary entry point for the library.
//! It creates, pauses, resumes and cancels jobs, reconciles persisted state
//! on startup, fans out progress events, and exposes job status and
//! history. One runner task drives each job (see `runner`).

use crate::client::{AuthChallenge, AuthOutcome, ChannelClient, SessionInfo};
use crate::config::ManagerConfig;
use crate::error::{ManagerError, Result};
use crate::events::{Event, EventBus};
use crate::fingerprint::FingerprintStore;
use crate::ledger::TransferLedger;
use crate::queue::TransferQueue;
use crate::runner::{self, Gate, JobContext};
use crate::storage::{SqliteStorage, Storage};
use crate::types::{
    FileTransfer, JobId, JobRequest, JobSnapshot, JobState, TransferState,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{broadcast, watch};

/// A job under management: its latest snapshot plus control handles
struct ManagedJob {
    snapshot: JobSnapshot,
    gate: watch::Sender<Gate>,
    halt_keep_state: Arc<AtomicBool>,
    runner: Option<tokio::task::JoinHandle<()>>,
}

/// Aggregate counts across the whole manager
#[derive(Debug, Clone, Default)]
pub struct ManagerStats {
    /// Jobs in any state
    pub total_jobs: usize,
    /// Jobs currently pending or active
    pub active_jobs: usize,
    /// Transfers holding a worker slot right now
    pub active_transfers: usize,
    /// Transfers waiting for a worker slot
    pub waiting_transfers: usize,
}

/// The main download manager
pub struct DownloadManager {
    /// Weak self-reference for spawning runner tasks from `&self` methods
    self_ref: Weak<Self>,

    /// Configuration
    config: ManagerConfig,

    /// Messaging-platform client
    client: Arc<dyn ChannelClient>,

    /// Persistent storage
    storage: Arc<dyn Storage>,

    /// Resume-offset ledger (process-wide)
    ledger: Arc<TransferLedger>,

    /// Duplicate-suppression index (process-wide)
    fingerprints: Arc<FingerprintStore>,

    /// Transfer queue enforcing the concurrency cap
    queue: Arc<TransferQueue>,

    /// Event fan-out
    events: EventBus,

    /// All managed jobs
    jobs: RwLock<HashMap<JobId, ManagedJob>>,

    /// Shutdown flag
    shutdown: tokio_util::sync::CancellationToken,
}

impl DownloadManager {
    /// Obtain a strong `Arc<Self>` reference for spawning runner tasks
    fn arc(&self) -> Result<Arc<Self>> {
        self.self_ref.upgrade().ok_or(ManagerError::Shutdown)
    }

    /// Create a manager persisting to the configured SQLite database
    pub async fn new(config: ManagerConfig, client: Arc<dyn ChannelClient>) -> Result<Arc<Self>> {
        let storage = Arc::new(SqliteStorage::new(config.get_database_path()).await?);
        Self::with_storage(config, client, storage).await
    }

    /// Create a manager with an injected storage backend
    pub async fn with_storage(
        config: ManagerConfig,
        client: Arc<dyn ChannelClient>,
        storage: Arc<dyn Storage>,
    ) -> Result<Arc<Self>> {
        config.validate()?;

        let ledger = Arc::new(TransferLedger::load(storage.clone()).await?);
        let fingerprints = Arc::new(FingerprintStore::load(storage.clone()).await?);
        let queue = TransferQueue::new(config.max_concurrent_transfers);
        let events = EventBus::new(config.event_capacity);

        let manager = Arc::new_cyclic(|weak| Self {
            self_ref: weak.clone(),
            config,
            client,
            storage,
            ledger,
            fingerprints,
            queue,
            events,
            jobs: RwLock::new(HashMap::new()),
            shutdown: tokio_util::sync::CancellationToken::new(),
        });

        manager.restore_persisted_jobs().await?;

        Ok(manager)
    }

    /// Reconcile in-memory scheduler state from persisted rows on startup.
    ///
    /// Terminal jobs load as history only. Non-terminal jobs get a runner:
    /// active/pending ones resume immediately, paused ones hold in the
    /// paused gate. Any transfer row still marked `downloading` belonged to
    /// an interrupted process and is requeued from its ledger offset.
    async fn restore_persisted_jobs(&self) -> Result<()> {
        let persisted = self.storage.load_jobs().await?;

        for job in persisted {
            let id = job.id;

            if job.state.is_terminal() {
                let (gate, _) = watch::channel(Gate::Cancelled);
                self.jobs.write().insert(
                    id,
                    ManagedJob {
                        snapshot: job,
                        gate,
                        halt_keep_state: Arc::new(AtomicBool::new(false)),
                        runner: None,
                    },
                );
                continue;
            }

            // Requeue interrupted transfers
            let transfers = self.storage.load_transfers(id).await?;
            for mut row in transfers {
                if matches!(row.state, TransferState::Downloading) {
                    row.state = TransferState::Queued;
                    row.updated_at = Utc::now();
                    self.storage.save_transfer(&row).await?;
                }
            }

            let initial_gate = match job.state {
                JobState::Paused => Gate::Paused,
                _ => Gate::Active,
            };
            let (gate, _) = watch::channel(initial_gate);

            tracing::info!(
                "Restored job {} ({}) in state {}",
                id,
                job.channel,
                job.state
            );

            self.jobs.write().insert(
                id,
                ManagedJob {
                    snapshot: job,
                    gate,
                    halt_keep_state: Arc::new(AtomicBool::new(false)),
                    runner: None,
                },
            );
            self.spawn_runner(id)?;
        }

        Ok(())
    }

    /// Begin platform authentication for a phone number
    pub async fn authenticate(&self, phone: &str) -> Result<AuthOutcome> {
        self.client.authenticate(phone).await
    }

    /// Confirm a verification code; the resulting session is persisted so
    /// it survives restarts
    pub async fn confirm_code(&self, challenge: &AuthChallenge, code: &str) -> Result<SessionInfo> {
        let session = self.client.confirm(challenge, code).await?;
        self.storage.save_session(&session).await?;
        Ok(session)
    }

    /// Load a persisted session, if one exists for this phone number
    pub async fn session(&self, phone: &str) -> Result<Option<SessionInfo>> {
        self.storage.load_session(phone).await
    }

    /// Create a job and start it
    pub async fn create_job(&self, request: JobRequest) -> Result<JobId> {
        if self.shutdown.is_cancelled() {
            return Err(ManagerError::Shutdown);
        }
        if request.channel.trim().is_empty() {
            return Err(ManagerError::invalid_input("channel", "Must not be empty"));
        }
        if let Some(0) = request.filter.max_files {
            return Err(ManagerError::invalid_input(
                "max_files",
                "Must be at least 1 when set",
            ));
        }

        let id = JobId::new();
        let now = Utc::now();
        let save_dir = request
            .save_dir
            .clone()
            .unwrap_or_else(|| self.config.download_dir.clone());

        let snapshot = JobSnapshot {
            id,
            channel: request.channel.clone(),
            state: JobState::Pending,
            priority: request.priority,
            filter: request.filter,
            skip_duplicates: request.skip_duplicates,
            counters: Default::default(),
            cursor: None,
            scan_complete: false,
            save_dir,
            created_at: now,
            updated_at: now,
            completed_at: None,
        };

        self.storage.save_job(&snapshot).await?;

        let (gate, _) = watch::channel(Gate::Active);
        self.jobs.write().insert(
            id,
            ManagedJob {
                snapshot,
                gate,
                halt_keep_state: Arc::new(AtomicBool::new(false)),
                runner: None,
            },
        );

        self.events.publish(Event::JobCreated {
            job: id,
            channel: request.channel.clone(),
        });
        tracing::info!("Created job {} for channel {}", id, request.channel);

        self.spawn_runner(id)?;

        Ok(id)
    }

    /// Spawn (or respawn) the runner task for a job
    fn spawn_runner(&self, id: JobId) -> Result<()> {
        let manager = self.arc()?;
        let ctx = {
            let jobs = self.jobs.read();
            let job = jobs
                .get(&id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            Arc::new(JobContext {
                job_id: id,
                channel: job.snapshot.channel.clone(),
                filter: job.snapshot.filter.clone(),
                skip_duplicates: job.snapshot.skip_duplicates,
                priority: job.snapshot.priority,
                job_dir: job.snapshot.save_dir.join(job.snapshot.short_id()),
                client: self.client.clone(),
                storage: self.storage.clone(),
                ledger: self.ledger.clone(),
                fingerprints: self.fingerprints.clone(),
                queue: self.queue.clone(),
                events: self.events.clone(),
                config: self.config.clone(),
                gate: job.gate.subscribe(),
                halt_keep_state: job.halt_keep_state.clone(),
            })
        };

        let handle = tokio::spawn(runner::run_job(manager, ctx));
        if let Some(job) = self.jobs.write().get_mut(&id) {
            job.runner = Some(handle);
        }
        Ok(())
    }

    /// Pause a job.
    ///
    /// Queued transfers leave the runnable set immediately; in-flight
    /// transfers finish their current chunk and hold at the next checkpoint
    /// without losing flushed bytes. No-op if already paused.
    pub async fn pause(&self, id: JobId) -> Result<()> {
        {
            let jobs = self.jobs.read();
            let job = jobs
                .get(&id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            if job.snapshot.state.is_terminal() {
                return Err(ManagerError::InvalidTransition {
                    action: "pause",
                    current_state: job.snapshot.state.to_string(),
                });
            }
            if job.snapshot.state == JobState::Paused {
                return Ok(());
            }
            job.gate.send_replace(Gate::Paused);
        }

        self.queue.remove_job(id);
        self.transition(id, JobState::Paused).await;
        tracing::info!("Paused job {}", id);
        Ok(())
    }

    /// Resume a paused job. No-op if already active.
    pub async fn resume(&self, id: JobId) -> Result<()> {
        let respawn = {
            let jobs = self.jobs.read();
            let job = jobs
                .get(&id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            if job.snapshot.state.is_terminal() {
                return Err(ManagerError::InvalidTransition {
                    action: "resume",
                    current_state: job.snapshot.state.to_string(),
                });
            }
            if job.snapshot.state.is_active() {
                return Ok(());
            }
            job.gate.send_replace(Gate::Active);
            job.runner.as_ref().is_none_or(|r| r.is_finished())
        };

        self.transition(id, JobState::Active).await;
        if respawn {
            // The runner exited while the job was paused (e.g. everything in
            // flight had settled); a fresh one picks up from the rows.
            self.spawn_runner(id)?;
        }
        tracing::info!("Resumed job {}", id);
        Ok(())
    }

    /// Cancel a job.
    ///
    /// Queued transfers are purged from the scheduler immediately; in-flight
    /// workers stop at their next checkpoint and discard partial files. The
    /// job reaches `Cancelled` once every transfer has settled.
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let respawn = {
            let jobs = self.jobs.read();
            let job = jobs
                .get(&id)
                .ok_or_else(|| ManagerError::NotFound(id.to_string()))?;
            if job.snapshot.state.is_terminal() {
                return Err(ManagerError::InvalidTransition {
                    action: "cancel",
                    current_state: job.snapshot.state.to_string(),
                });
            }
            job.halt_keep_state.store(false, Ordering::Relaxed);
            job.gate.send_replace(Gate::Cancelled);
            job.runner.as_ref().is_none_or(|r| r.is_finished())
        };

        self.queue.remove_job(id);
        if respawn {
            // The runner exited while the job sat paused; a fresh one runs
            // the cancel cascade and finalizes the state.
            self.spawn_runner(id)?;
        }
        tracing::info!("Cancelling job {}", id);
        Ok(())
    }

    /// Get the current snapshot of a job
    pub fn job(&self, id: JobId) -> Option<JobSnapshot> {
        self.jobs.read().get(&id).map(|j| j.snapshot.clone())
    }

    /// Get snapshots of all jobs, newest first
    pub fn jobs(&self) -> Vec<JobSnapshot> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .values()
            .map(|j| j.snapshot.clone())
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        jobs
    }

    /// Get job history (terminal and live jobs, newest first)
    pub fn history(&self, limit: usize) -> Vec<JobSnapshot> {
        let mut jobs = self.jobs();
        jobs.truncate(limit);
        jobs
    }

    /// Get the transfer records of a job
    pub async fn job_transfers(&self, id: JobId) -> Result<Vec<FileTransfer>> {
        if !self.jobs.read().contains_key(&id) {
            return Err(ManagerError::NotFound(id.to_string()));
        }
        self.storage.load_transfers(id).await
    }

    /// Subscribe to live events
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.events.subscribe()
    }

    /// Aggregate statistics
    pub fn stats(&self) -> ManagerStats {
        let jobs = self.jobs.read();
        let queue_stats = self.queue.stats();
        ManagerStats {
            total_jobs: jobs.len(),
            active_jobs: jobs
                .values()
                .filter(|j| j.snapshot.state.is_active())
                .count(),
            active_transfers: queue_stats.active,
            waiting_transfers: queue_stats.waiting,
        }
    }

    /// Stop all work, persisting resume state, and wait for runners to exit.
    ///
    /// Non-terminal jobs keep their persisted state (including ledger
    /// offsets and partial files) so a fresh manager resumes them.
    pub async fn shutdown(&self) -> Result<()> {
        self.shutdown.cancel();

        let handles: Vec<_> = {
            let mut jobs = self.jobs.write();
            jobs.values_mut()
                .filter(|j| !j.snapshot.state.is_terminal())
                .map(|j| {
                    j.halt_keep_state.store(true, Ordering::Relaxed);
                    j.gate.send_replace(Gate::Cancelled);
                    j.runner.take()
                })
                .collect()
        };

        for handle in handles.into_iter().flatten() {
            if let Err(e) = handle.await {
                tracing::debug!("Runner task ended abnormally during shutdown: {}", e);
            }
        }

        tracing::info!("Download manager shut down");
        Ok(())
    }

    // ---- internals shared with the runner ----

    pub(crate) fn events(&self) -> &EventBus {
        &self.events
    }

    /// Mutate a job's snapshot under the map lock, bumping `updated_at`
    pub(crate) fn update_snapshot(
        &self,
        id: JobId,
        f: impl FnOnce(&mut JobSnapshot),
    ) -> Option<JobSnapshot> {
        let mut jobs = self.jobs.write();
        let job = jobs.get_mut(&id)?;
        f(&mut job.snapshot);
        job.snapshot.updated_at = Utc::now();
        Some(job.snapshot.clone())
    }

    /// Persist a snapshot, logging on failure (bookkeeping writes never
    /// take a job down)
    pub(crate) async fn persist_job(&self, snapshot: &JobSnapshot) {
        if let Err(e) = self.storage.save_job(snapshot).await {
            tracing::warn!("Failed to persist job {}: {}", snapshot.id, e);
        }
    }

    /// Transition a job to a new state, persisting and emitting the change
    pub(crate) async fn transition(&self, id: JobId, new_state: JobState) -> Option<JobSnapshot> {
        let mut old_state = None;
        let snapshot = self.update_snapshot(id, |job| {
            old_state = Some(job.state.clone());
            job.state = new_state.clone();
        })?;
        self.persist_job(&snapshot).await;
        if let Some(old_state) = old_state {
            if old_state != new_state {
                self.events.publish(Event::JobStateChanged {
                    job: id,
                    old_state,
                    new_state,
                });
            }
        }
        Some(snapshot)
    }

    /// Pause a job from inside the machinery (storage-error auto-pause)
    pub(crate) async fn auto_pause(&self, id: JobId) {
        let paused = {
            let jobs = self.jobs.read();
            match jobs.get(&id) {
                Some(job) if job.snapshot.state == JobState::Active => {
                    job.gate.send_replace(Gate::Paused);
                    true
                }
                _ => false,
            }
        };
        if paused {
            self.queue.remove_job(id);
            self.transition(id, JobState::Paused).await;
            tracing::warn!("Auto-paused job {} after a storage error", id);
        }
    }

    /// Flip a job's gate (used by the runner on scan failure)
    pub(crate) fn signal_gate(&self, id: JobId, gate: Gate) {
        if let Some(job) = self.jobs.read().get(&id) {
            job.gate.send_replace(gate);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ByteStream, ChannelInfo, FileRef, MessagePage};
    use crate::storage::MemoryStorage;
    use tempfile::tempdir;

    /// Client that serves an empty channel
    struct EmptyChannel;

    #[async_trait::async_trait]
    impl ChannelClient for EmptyChannel {
        async fn authenticate(&self, phone: &str) -> Result<AuthOutcome> {
            Ok(AuthOutcome::CodeRequired(AuthChallenge {
                phone: phone.to_string(),
                token: "token".to_string(),
            }))
        }

        async fn confirm(&self, challenge: &AuthChallenge, _code: &str) -> Result<SessionInfo> {
            Ok(SessionInfo {
                phone: challenge.phone.clone(),
                session_data: "session".to_string(),
                created_at: Utc::now(),
                last_used: Utc::now(),
            })
        }

        async fn channel_info(&self, channel: &str) -> Result<ChannelInfo> {
            Ok(ChannelInfo {
                id: 1,
                title: channel.to_string(),
                username: None,
            })
        }

        async fn fetch_messages(
            &self,
            _channel: &str,
            _cursor: Option<i64>,
            _limit: usize,
        ) -> Result<MessagePage> {
            Ok(MessagePage::default())
        }

        async fn fetch_file(&self, _file: &FileRef, _offset: u64) -> Result<ByteStream> {
            Err(ManagerError::file_unavailable("empty channel has no files"))
        }
    }

    async fn test_manager(dir: &tempfile::TempDir) -> Arc<DownloadManager> {
        let config = ManagerConfig::new().download_dir(dir.path());
        DownloadManager::with_storage(config, Arc::new(EmptyChannel), Arc::new(MemoryStorage::new()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn create_job_rejects_empty_channel() {
        let dir = tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let result = manager.create_job(JobRequest::new("  ")).await;
        assert!(matches!(result, Err(ManagerError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn create_job_rejects_zero_max_files() {
        let dir = tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let mut request = JobRequest::new("chan");
        request.filter.max_files = Some(0);
        let result = manager.create_job(request).await;
        assert!(matches!(result, Err(ManagerError::InvalidInput { .. })));
    }

    #[tokio::test]
    async fn pause_unknown_job_is_not_found() {
        let dir = tempdir().unwrap();
        let manager = test_manager(&dir).await;
        assert!(matches!(
            manager.pause(JobId::new()).await,
            Err(ManagerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn control_actions_on_terminal_job_are_rejected() {
        let dir = tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let id = manager.create_job(JobRequest::new("chan")).await.unwrap();

        // An empty channel completes immediately
        for _ in 0..100 {
            if manager.job(id).unwrap().state == JobState::Completed {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
        assert_eq!(manager.job(id).unwrap().state, JobState::Completed);

        assert!(matches!(
            manager.pause(id).await,
            Err(ManagerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.resume(id).await,
            Err(ManagerError::InvalidTransition { .. })
        ));
        assert!(matches!(
            manager.cancel(id).await,
            Err(ManagerError::InvalidTransition { .. })
        ));
    }

    #[tokio::test]
    async fn auth_persists_session() {
        let dir = tempdir().unwrap();
        let manager = test_manager(&dir).await;

        let outcome = manager.authenticate("+1555").await.unwrap();
        let challenge = match outcome {
            AuthOutcome::CodeRequired(c) => c,
            AuthOutcome::Authorized => panic!("expected a challenge"),
        };
        manager.confirm_code(&challenge, "12345").await.unwrap();

        let session = manager.session("+1555").await.unwrap();
        assert!(session.is_some());
        assert_eq!(session.unwrap().session_data, "session");
    }

    #[tokio::test]
    async fn history_is_newest_first() {
        let dir = tempdir().unwrap();
        let manager = test_manager(&dir).await;
        let first = manager.create_job(JobRequest::new("one")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = manager.create_job(JobRequest::new("two")).await.unwrap();

        let history = manager.history(10);
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].id, second);
        assert_eq!(history[1].id, first);

        assert_eq!(manager.history(1).len(), 1);
    }
}
