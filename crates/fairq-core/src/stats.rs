//! Per-disk scheduler statistics.

use serde::{Deserialize, Serialize};

use crate::types::PRIO_CLASSES;

/// Counters for one scheduled disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SchedStats {
    /// Requests admitted into a flow queue.
    pub enqueued: u64,
    /// Requests handed to the device.
    pub dispatched: u64,
    /// Requests completed successfully.
    pub completed: u64,
    /// Requests completed with a device error.
    pub errored: u64,
    /// Requests failed with a cancellation status.
    pub cancelled: u64,
    /// Submissions rejected at admission.
    pub rejected: u64,
    /// Times the disk went idle.
    pub idle_transitions: u64,
    /// Balancer intervals processed.
    pub rebalances: u64,
    /// Dispatch counts per priority class, idle class first.
    pub per_class_dispatched: [u64; PRIO_CLASSES],
}

impl SchedStats {
    /// Records an admission.
    #[inline]
    pub fn record_enqueue(&mut self) {
        self.enqueued += 1;
    }

    /// Records a dispatch for the given class index.
    #[inline]
    pub fn record_dispatch(&mut self, class_index: usize) {
        self.dispatched += 1;
        if let Some(slot) = self.per_class_dispatched.get_mut(class_index) {
            *slot += 1;
        }
    }

    /// Records a completion with the given outcome.
    #[inline]
    pub fn record_complete(&mut self, ok: bool) {
        if ok {
            self.completed += 1;
        } else {
            self.errored += 1;
        }
    }

    /// Records a cancellation.
    #[inline]
    pub fn record_cancel(&mut self) {
        self.cancelled += 1;
    }

    /// Records a rejected submission.
    #[inline]
    pub fn record_reject(&mut self) {
        self.rejected += 1;
    }
}
