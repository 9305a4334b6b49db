//! # chanfetch
//!
//! A resumable, deduplicating bulk file downloader for messaging-platform
//! channels.
//!
//! ## Features
//!
//! - **Channel scans**: page through a channel and pick out files by
//!   extension/MIME, with an optional cap
//! - **Pause/Resume**: cooperative checkpoints, a persisted byte-offset
//!   ledger, and ranged re-fetches mean flushed bytes are never downloaded
//!   twice
//! - **Deduplication**: a content-fingerprint store suppresses files that
//!   are already on disk, across jobs and restarts
//! - **Crash-safe**: jobs, transfers, ledger and fingerprints persist in
//!   SQLite (WAL); a fresh manager reconciles and resumes interrupted work
//! - **Async**: built on Tokio with a bounded, priority-ordered worker pool
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chanfetch::{DownloadManager, JobRequest, ManagerConfig};
//! use std::sync::Arc;
//!
//! # async fn example(client: Arc<dyn chanfetch::ChannelClient>) -> Result<(), chanfetch::ManagerError> {
//! // Create a manager over your platform client
//! let config = ManagerConfig::default();
//! let manager = DownloadManager::new(config, client).await?;
//!
//! // Start pulling files from a channel
//! let job = manager.create_job(JobRequest::new("ebooks_channel")).await?;
//!
//! // Watch progress
//! let mut events = manager.subscribe();
//! while let Ok(event) = events.recv().await {
//!     println!("Event: {:?}", event);
//! }
//! # let _ = job;
//! # Ok(())
//! # }
//! ```

// Modules
pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod fingerprint;
pub mod ledger;
pub mod manager;
pub mod queue;
pub mod storage;
pub mod types;

mod runner;
mod scan;
mod worker;

// Re-exports for convenience
pub use client::{
    AuthChallenge, AuthOutcome, ByteStream, ChannelClient, ChannelInfo, FileRef, MessagePage,
    SessionInfo,
};
pub use config::{ManagerConfig, RetryConfig};
pub use error::{ManagerError, Result, StorageErrorKind};
pub use events::{Event, EventBus};
pub use fingerprint::{Digester, Fingerprint, FingerprintRecord, FingerprintStore};
pub use ledger::{LedgerEntry, TransferLedger};
pub use manager::{DownloadManager, ManagerStats};
pub use queue::{QueueStats, TransferQueue};
pub use types::{
    FileKind, FileTransfer, JobCounters, JobFilter, JobId, JobPriority, JobRequest, JobSnapshot,
    JobState, TransferId, TransferState,
};

// Storage exports
pub use storage::{MemoryStorage, SqliteStorage, Storage};
