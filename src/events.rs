//! Progress and lifecycle events
//!
//! Events emitted by the download manager. Delivery is fan-out over a
//! broadcast channel: subscribers see live events from subscription time
//! forward, never a replay of history.

use crate::types::{JobCounters, JobId, JobState, TransferId};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted by the download manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    /// A job was created
    JobCreated { job: JobId, channel: String },
    /// A job changed state
    JobStateChanged {
        job: JobId,
        old_state: JobState,
        new_state: JobState,
    },
    /// The channel scan advanced
    ScanProgress {
        job: JobId,
        discovered: u64,
        cursor: i64,
    },
    /// A transfer started from byte zero
    TransferStarted {
        job: JobId,
        transfer: TransferId,
        name: String,
    },
    /// A transfer continued from a ledger offset
    TransferResumed {
        job: JobId,
        transfer: TransferId,
        offset: u64,
    },
    /// Bytes landed (emitted at flush-interval cadence, not per chunk)
    TransferProgress {
        job: JobId,
        transfer: TransferId,
        bytes: u64,
        total: Option<u64>,
    },
    /// A transfer halted at a checkpoint because the job paused
    TransferPaused {
        job: JobId,
        transfer: TransferId,
        bytes: u64,
    },
    /// A transfer stopped and discarded its partial file
    TransferCancelled { job: JobId, transfer: TransferId },
    /// A transient failure; the transfer will retry after a delay
    TransferRetrying {
        job: JobId,
        transfer: TransferId,
        attempt: u32,
        error: String,
    },
    /// A transfer finished and its fingerprint was recorded
    TransferCompleted {
        job: JobId,
        transfer: TransferId,
        bytes: u64,
        fingerprint: String,
    },
    /// A transfer was suppressed because its content is already downloaded
    DuplicateSkipped {
        job: JobId,
        transfer: TransferId,
        fingerprint: Option<String>,
    },
    /// A transfer permanently failed
    TransferFailed {
        job: JobId,
        transfer: TransferId,
        error: String,
    },
    /// A job settled with every transfer terminal
    JobCompleted { job: JobId, counters: JobCounters },
    /// The channel scan failed and took the job with it
    JobFailed { job: JobId, error: String },
}

impl Event {
    /// The job this event belongs to
    pub fn job_id(&self) -> JobId {
        match self {
            Self::JobCreated { job, .. }
            | Self::JobStateChanged { job, .. }
            | Self::ScanProgress { job, .. }
            | Self::TransferStarted { job, .. }
            | Self::TransferResumed { job, .. }
            | Self::TransferProgress { job, .. }
            | Self::TransferPaused { job, .. }
            | Self::TransferCancelled { job, .. }
            | Self::TransferRetrying { job, .. }
            | Self::TransferCompleted { job, .. }
            | Self::DuplicateSkipped { job, .. }
            | Self::TransferFailed { job, .. }
            | Self::JobCompleted { job, .. }
            | Self::JobFailed { job, .. } => *job,
        }
    }
}

/// Fan-out publisher decoupling the core from any particular transport.
///
/// Publishing never blocks; with no subscribers the event is dropped, and a
/// subscriber that falls behind loses the oldest buffered events first.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<Event>,
}

impl EventBus {
    /// Create a bus with the given buffer capacity
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    /// Publish an event to all current subscribers
    pub fn publish(&self, event: Event) {
        let _ = self.tx.send(event);
    }

    /// Subscribe to live events from this point forward
    pub fn subscribe(&self) -> broadcast::Receiver<Event> {
        self.tx.subscribe()
    }

    /// Number of connected subscribers
    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
