//! Transfer queue and slot scheduling
//!
//! A global concurrency cap governs how many file transfers run at once.
//! Waiting transfers are ordered by their job's priority (Pinned > High >
//! Normal > Low) with FIFO ordering within the same priority level.

use crate::types::{JobId, JobPriority, TransferId};
use parking_lot::Mutex;
use std::collections::{BinaryHeap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{Notify, OwnedSemaphorePermit, Semaphore};

/// Entry in the transfer queue
#[derive(Debug, Clone, Eq, PartialEq)]
struct QueueEntry {
    transfer: TransferId,
    job: JobId,
    priority: JobPriority,
    /// Sequence number for FIFO ordering within same priority
    sequence: u64,
}

impl Ord for QueueEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Higher priority first, then lower sequence (earlier) first
        match self.priority.cmp(&other.priority) {
            std::cmp::Ordering::Equal => other.sequence.cmp(&self.sequence),
            other => other,
        }
    }
}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

/// A permit that allows a transfer to proceed.
/// When dropped, releases the slot back to the queue.
pub struct TransferPermit {
    _permit: OwnedSemaphorePermit,
    transfer: TransferId,
    queue: Arc<TransferQueue>,
}

impl Drop for TransferPermit {
    fn drop(&mut self) {
        self.queue.inner.lock().active.remove(&self.transfer);
        // Wake all waiters so the highest priority can claim the slot
        self.queue.notify.notify_waiters();
    }
}

/// Internal state of the transfer queue
struct QueueInner {
    /// Transfers waiting for a slot
    waiting: BinaryHeap<QueueEntry>,
    /// Transfers currently holding a slot
    active: HashMap<TransferId, JobId>,
    /// Owning job of each waiting transfer (for quick lookup and purge)
    waiting_jobs: HashMap<TransferId, JobId>,
}

/// Priority-ordered transfer queue with a global concurrency cap.
///
/// The internal mutex is the single point of mutual exclusion for slot
/// selection; workers perform all I/O after the permit is granted, outside
/// the lock.
pub struct TransferQueue {
    /// Semaphore enforcing the concurrency cap
    semaphore: Arc<Semaphore>,
    /// Internal queue state
    inner: Mutex<QueueInner>,
    /// Sequence counter for FIFO ordering
    sequence: AtomicU64,
    /// Notification for waiting transfers
    notify: Notify,
}

impl TransferQueue {
    /// Create a new queue with the given concurrency limit
    pub fn new(max_concurrent: usize) -> Arc<Self> {
        Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            inner: Mutex::new(QueueInner {
                waiting: BinaryHeap::new(),
                active: HashMap::new(),
                waiting_jobs: HashMap::new(),
            }),
            sequence: AtomicU64::new(0),
            notify: Notify::new(),
        })
    }

    /// Wait in line for a transfer slot.
    ///
    /// Adds the transfer to the waiting set and blocks until a slot is free
    /// AND this transfer is the highest-priority waiter. A caller that
    /// abandons the returned future (e.g. inside `select!` when its job
    /// pauses) must call [`remove`](Self::remove) to withdraw its entry.
    pub async fn acquire(
        self: &Arc<Self>,
        transfer: TransferId,
        job: JobId,
        priority: JobPriority,
    ) -> TransferPermit {
        let sequence = self.sequence.fetch_add(1, Ordering::Relaxed);
        {
            let mut inner = self.inner.lock();
            inner.waiting.push(QueueEntry {
                transfer,
                job,
                priority,
                sequence,
            });
            inner.waiting_jobs.insert(transfer, job);
        }

        loop {
            {
                let inner = self.inner.lock();
                if let Some(next) = inner.waiting.peek() {
                    if next.transfer == transfer {
                        // We're next; release the lock before touching the
                        // semaphore
                        drop(inner);

                        if let Ok(permit) = self.semaphore.clone().try_acquire_owned() {
                            let mut inner = self.inner.lock();
                            inner.waiting.pop();
                            inner.waiting_jobs.remove(&transfer);
                            inner.active.insert(transfer, job);

                            return TransferPermit {
                                _permit: permit,
                                transfer,
                                queue: Arc::clone(self),
                            };
                        }
                    }
                }
            }

            // Wait until a slot frees or the queue changes shape
            self.notify.notified().await;
        }
    }

    /// Withdraw a single waiting transfer (no-op if it isn't waiting)
    pub fn remove(&self, transfer: TransferId) {
        let mut inner = self.inner.lock();
        if inner.waiting_jobs.remove(&transfer).is_none() {
            return;
        }
        let entries: Vec<_> = inner
            .waiting
            .drain()
            .filter(|e| e.transfer != transfer)
            .collect();
        for entry in entries {
            inner.waiting.push(entry);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Purge every waiting transfer belonging to a job.
    ///
    /// This is how pausing or cancelling a job removes its tasks from the
    /// runnable set within one scheduling cycle; in-flight transfers stop
    /// cooperatively at their next checkpoint instead.
    pub fn remove_job(&self, job: JobId) {
        let mut inner = self.inner.lock();
        inner.waiting_jobs.retain(|_, j| *j != job);
        let entries: Vec<_> = inner.waiting.drain().filter(|e| e.job != job).collect();
        for entry in entries {
            inner.waiting.push(entry);
        }
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Number of transfers holding a slot
    pub fn active_count(&self) -> usize {
        self.inner.lock().active.len()
    }

    /// Number of transfers waiting for a slot
    pub fn waiting_count(&self) -> usize {
        self.inner.lock().waiting.len()
    }

    /// Is this transfer currently waiting?
    pub fn is_waiting(&self, transfer: TransferId) -> bool {
        self.inner.lock().waiting_jobs.contains_key(&transfer)
    }

    /// Get statistics about the queue
    pub fn stats(&self) -> QueueStats {
        let inner = self.inner.lock();
        let mut waiting_by_job = HashMap::new();
        for job in inner.waiting_jobs.values() {
            *waiting_by_job.entry(*job).or_insert(0) += 1;
        }
        QueueStats {
            active: inner.active.len(),
            waiting: inner.waiting.len(),
            waiting_by_job,
        }
    }
}

/// Statistics about the transfer queue
#[derive(Debug, Clone)]
pub struct QueueStats {
    /// Number of transfers holding a slot
    pub active: usize,
    /// Total number of waiting transfers
    pub waiting: usize,
    /// Waiting transfers grouped by owning job
    pub waiting_by_job: HashMap<JobId, usize>,
}
