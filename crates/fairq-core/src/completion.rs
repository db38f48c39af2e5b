//! Completion handling for issued requests.
//!
//! The device layer receives an [`IssuedIo`] and a [`CompletionPort`] and
//! must hand the I/O back through the port exactly once. The port is
//! cheap to clone and safe to call from any thread; it takes no disk
//! lock, so a completion never blocks behind the dispatcher or balancer.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tracing::debug;

use crate::disk::DiskCtx;
use crate::flow::IoFlow;
use crate::request::{CompletedIo, IoRequest, IoStatus, PendingIo};
use crate::stats::SchedStats;

/// A request in flight at the device layer.
///
/// Ownership travels to the device on submit and returns through
/// [`CompletionPort::complete`].
#[derive(Debug)]
pub struct IssuedIo {
    /// The issued request.
    pub request: IoRequest,
    pub(crate) origin: IoOrigin,
    pub(crate) reply: tokio::sync::oneshot::Sender<CompletedIo>,
}

impl IssuedIo {
    pub(crate) fn from_pending(pending: PendingIo, origin: IoOrigin) -> Self {
        let mut request = pending.request;
        request.mark_issued();
        Self {
            request,
            origin,
            reply: pending.reply,
        }
    }
}

/// Where an issued request came from, for completion bookkeeping.
#[derive(Debug)]
pub(crate) enum IoOrigin {
    /// Dispatched from a fair-queued flow.
    Flow(Arc<IoFlow>),
    /// Passed straight through by the noop policy.
    Direct,
}

/// Shared state for passthrough (noop) completions.
#[derive(Debug, Default)]
pub(crate) struct DirectState {
    pub incomplete: AtomicI64,
    pub draining: AtomicBool,
    pub drain_notify: Notify,
    pub stats: parking_lot::Mutex<SchedStats>,
}

#[derive(Debug, Clone)]
enum PortTarget {
    Disk(Arc<DiskCtx>),
    Direct(Arc<DirectState>),
}

/// Delivers completions back into the scheduler.
#[derive(Debug, Clone)]
pub struct CompletionPort {
    target: PortTarget,
}

impl CompletionPort {
    pub(crate) fn for_disk(disk: Arc<DiskCtx>) -> Self {
        Self {
            target: PortTarget::Disk(disk),
        }
    }

    pub(crate) fn for_direct(state: Arc<DirectState>) -> Self {
        Self {
            target: PortTarget::Direct(state),
        }
    }

    /// Completes one issued request with its terminal status.
    ///
    /// Updates the owning flow's statistics, drops the request's logical
    /// reference, returns ownership to the issuer, and wakes the
    /// dispatcher. Invoked by the device layer (or by the dispatcher
    /// itself when a submission fails synchronously).
    pub fn complete(&self, io: IssuedIo, status: IoStatus) {
        let latency = io.request.submitted_at().elapsed();
        let ok = status.is_ok();

        match &self.target {
            PortTarget::Disk(disk) => {
                if let IoOrigin::Flow(flow) = &io.origin {
                    flow.record_completion(latency);
                }
                let remaining = disk.dec_incomplete();
                disk.with_stats(|s| s.record_complete(ok));

                debug!(
                    disk = %disk.disk(),
                    request = ?io.request.id,
                    %status,
                    latency_us = latency.as_micros() as u64,
                    "request complete"
                );

                let _ = io.reply.send(CompletedIo {
                    request: io.request,
                    status,
                    latency,
                });

                if let IoOrigin::Flow(flow) = io.origin {
                    disk.release(&flow);
                }

                disk.notify_dispatch();
                // Unconditional: keeps the completion path off the disk
                // lock; a waiter only exists while draining.
                if remaining == 0 {
                    disk.notify_drain();
                }
            }
            PortTarget::Direct(state) => {
                let remaining = state.incomplete.fetch_sub(1, Ordering::SeqCst) - 1;
                state.stats.lock().record_complete(ok);

                let _ = io.reply.send(CompletedIo {
                    request: io.request,
                    status,
                    latency,
                });

                if remaining == 0 && state.draining.load(Ordering::SeqCst) {
                    state.drain_notify.notify_waiters();
                }
            }
        }
    }
}
