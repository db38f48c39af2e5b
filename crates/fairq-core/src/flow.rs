//! Per-(process, disk) fairness unit.
//!
//! An [`IoFlow`] owns the FIFO queue of one process's pending requests
//! against one disk, plus the rate and latency accounting the balancer
//! feeds on. The disk's membership list holds the only strong `Arc`; the
//! logical reference count tracks observers, one per outstanding request.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::request::RequestQueue;
use crate::types::{DiskId, Priority, ProcessId};

/// Mutable state of a flow, guarded by the flow lock.
///
/// Lock ordering: the disk lock, when held, is always acquired before
/// this lock, never the reverse.
#[derive(Debug)]
pub(crate) struct FlowInner {
    /// Pending (not yet issued) requests, FIFO.
    pub queue: RequestQueue,
    /// Requests handed to the device but not yet completed.
    pub issued: u32,
    /// Completions observed in the current interval.
    pub transactions: u64,
    /// Incremental-mean latency over the current interval, microseconds.
    pub avg_latency_us: f64,
    /// Frozen transaction count of the previous interval.
    pub interval_transactions: u64,
    /// Frozen mean latency of the previous interval, microseconds.
    pub interval_avg_latency_us: f64,
    /// Requests this flow may have dispatched per interval; None = unlimited.
    pub max_tp: Option<u32>,
    /// Requests dispatched so far in the current interval.
    pub dispatched_interval: u32,
    /// Requests a fresh `max_tp` derivation at the next rebalance.
    pub rebalance: bool,
}

/// One process's I/O flow against one disk.
#[derive(Debug)]
pub struct IoFlow {
    disk: DiskId,
    owner: ProcessId,
    priority: Priority,
    refs: AtomicU32,
    unlinked: AtomicBool,
    inner: Mutex<FlowInner>,
}

impl IoFlow {
    /// Creates a flow with one logical reference held by the caller.
    pub(crate) fn new(disk: DiskId, owner: ProcessId, priority: Priority) -> Self {
        Self {
            disk,
            owner,
            priority,
            refs: AtomicU32::new(1),
            unlinked: AtomicBool::new(false),
            inner: Mutex::new(FlowInner {
                queue: RequestQueue::new(),
                issued: 0,
                transactions: 0,
                avg_latency_us: 0.0,
                interval_transactions: 0,
                interval_avg_latency_us: 0.0,
                max_tp: None,
                dispatched_interval: 0,
                rebalance: true,
            }),
        }
    }

    /// The disk this flow belongs to.
    #[inline]
    pub fn disk(&self) -> &DiskId {
        &self.disk
    }

    /// The owning process.
    #[inline]
    pub fn owner(&self) -> ProcessId {
        self.owner
    }

    /// The flow's priority class.
    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    /// Increments the logical reference count. Callable from any context,
    /// including the completion path; never fails.
    pub fn acquire(&self) {
        self.refs.fetch_add(1, Ordering::SeqCst);
    }

    /// Decrements the logical reference count. Returns true exactly once,
    /// for the caller that observes the 1 -> 0 transition.
    ///
    /// A refcount underflow is a scheduler bug; debug builds assert,
    /// release builds clamp and log.
    pub(crate) fn release_observes_zero(&self) -> bool {
        let prev = self.refs.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "flow refcount underflow");
        if prev == 0 {
            warn!(disk = %self.disk, owner = %self.owner, "flow refcount underflow, clamping");
            self.refs.store(0, Ordering::SeqCst);
            return false;
        }
        prev == 1
    }

    /// Current logical reference count.
    pub fn refcount(&self) -> u32 {
        self.refs.load(Ordering::SeqCst)
    }

    /// Claims the right to unlink this flow from disk membership.
    /// Succeeds exactly once over the flow's lifetime.
    pub(crate) fn claim_unlink(&self) -> bool {
        self.unlinked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, FlowInner> {
        self.inner.lock()
    }

    /// Number of requests pending in the queue.
    pub fn queued(&self) -> usize {
        self.inner.lock().queue.len()
    }

    /// Number of requests issued to the device and not yet completed.
    pub fn issued(&self) -> u32 {
        self.inner.lock().issued
    }

    /// Records one completion: drains the issued count and folds the
    /// latency sample into the running mean.
    ///
    /// The transaction count resets each interval, so the first sample
    /// after a snapshot replaces the mean outright.
    pub(crate) fn record_completion(&self, latency: Duration) {
        let mut inner = self.inner.lock();
        debug_assert!(inner.issued > 0, "completion for flow with no issued requests");
        inner.issued = inner.issued.saturating_sub(1);
        inner.transactions += 1;
        let sample = latency.as_secs_f64() * 1_000_000.0;
        let n = inner.transactions as f64;
        inner.avg_latency_us += (sample - inner.avg_latency_us) / n;
    }

    /// Freezes the current interval's accumulators into the interval
    /// snapshot and zeroes them for the next interval. Balancer only.
    pub(crate) fn snapshot_interval(&self) {
        let mut inner = self.inner.lock();
        inner.interval_transactions = inner.transactions;
        inner.interval_avg_latency_us = inner.avg_latency_us;
        inner.transactions = 0;
        inner.avg_latency_us = 0.0;
        inner.dispatched_interval = 0;
    }

    /// Point-in-time view of the flow for observability.
    pub fn snapshot(&self) -> FlowSnapshot {
        let inner = self.inner.lock();
        FlowSnapshot {
            owner: self.owner,
            priority: self.priority,
            queued: inner.queue.len(),
            issued: inner.issued,
            interval_transactions: inner.interval_transactions,
            interval_avg_latency_us: inner.interval_avg_latency_us,
            max_tp: inner.max_tp,
            refcount: self.refcount(),
        }
    }
}

/// Serializable point-in-time view of one flow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowSnapshot {
    /// Owning process.
    pub owner: ProcessId,
    /// Priority class.
    pub priority: Priority,
    /// Requests pending in the queue.
    pub queued: usize,
    /// Requests issued and not yet completed.
    pub issued: u32,
    /// Transactions in the previous interval.
    pub interval_transactions: u64,
    /// Mean latency of the previous interval, microseconds.
    pub interval_avg_latency_us: f64,
    /// Per-interval dispatch limit, if throttled.
    pub max_tp: Option<u32>,
    /// Current logical reference count.
    pub refcount: u32,
}
