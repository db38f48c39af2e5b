//! Scheduling policies and the per-disk scheduler trait.
//!
//! A [`Policy`] is a named factory: attaching it to a disk produces the
//! [`DiskSched`] instance the I/O boundary routes through. Two policies
//! ship built in: `fq` (the fair-queuing engine) and `noop`, the default
//! passthrough that hands every request straight to the device.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::debug;

use crate::completion::{CompletionPort, DirectState, IoOrigin, IssuedIo};
use crate::device::BlockDevice;
use crate::disk::{DiskConfig, DrainMode};
use crate::error::SubmitError;
use crate::fq::FqSched;
use crate::request::{CompletionTicket, IoRequest, IoStatus, PendingIo};
use crate::stats::SchedStats;
use crate::types::{DiskId, ProcessId};

/// Per-disk scheduler instance produced by a policy.
#[async_trait]
pub trait DiskSched: Send + Sync {
    /// Name of the policy this instance belongs to.
    fn policy_name(&self) -> &'static str;

    /// Admits one request on behalf of `owner`.
    fn submit(
        &self,
        owner: ProcessId,
        nice: i32,
        request: IoRequest,
    ) -> Result<CompletionTicket, SubmitError>;

    /// Fails queued-but-unissued requests of an exiting process.
    fn cancel_all(&self, owner: ProcessId);

    /// Quiesces the disk; returns once nothing is queued or in flight.
    async fn drain(&self, mode: DrainMode);

    /// Snapshot of the instance's counters.
    fn stats(&self) -> SchedStats;
}

/// A named scheduling policy.
pub trait Policy: Send + Sync {
    /// The policy's registry name.
    fn name(&self) -> &'static str;

    /// Builds a scheduler instance for one disk.
    fn attach(
        &self,
        disk: DiskId,
        device: Arc<dyn BlockDevice>,
        cfg: &DiskConfig,
    ) -> Arc<dyn DiskSched>;
}

/// The fair-queuing policy.
#[derive(Debug, Default)]
pub struct FqPolicy;

impl Policy for FqPolicy {
    fn name(&self) -> &'static str {
        "fq"
    }

    fn attach(
        &self,
        disk: DiskId,
        device: Arc<dyn BlockDevice>,
        cfg: &DiskConfig,
    ) -> Arc<dyn DiskSched> {
        FqSched::start(disk, cfg.clone(), device)
    }
}

#[async_trait]
impl DiskSched for FqSched {
    fn policy_name(&self) -> &'static str {
        "fq"
    }

    fn submit(
        &self,
        owner: ProcessId,
        nice: i32,
        request: IoRequest,
    ) -> Result<CompletionTicket, SubmitError> {
        FqSched::submit(self, owner, nice, request)
    }

    fn cancel_all(&self, owner: ProcessId) {
        FqSched::cancel_all(self, owner);
    }

    async fn drain(&self, mode: DrainMode) {
        FqSched::drain(self, mode).await;
    }

    fn stats(&self) -> SchedStats {
        FqSched::stats(self)
    }
}

/// The noop (default) policy: straight passthrough.
#[derive(Debug, Default)]
pub struct NoopPolicy;

impl Policy for NoopPolicy {
    fn name(&self) -> &'static str {
        "noop"
    }

    fn attach(
        &self,
        disk: DiskId,
        device: Arc<dyn BlockDevice>,
        _cfg: &DiskConfig,
    ) -> Arc<dyn DiskSched> {
        Arc::new(NoopSched::new(disk, device))
    }
}

/// Passthrough scheduler: no queues, no budgets, only enough bookkeeping
/// to honor drains and deliver tickets.
pub struct NoopSched {
    disk: DiskId,
    device: Arc<dyn BlockDevice>,
    state: Arc<DirectState>,
}

impl NoopSched {
    /// Creates a passthrough scheduler for `disk`.
    pub fn new(disk: DiskId, device: Arc<dyn BlockDevice>) -> Self {
        debug!(disk = %disk, "noop policy attached");
        Self {
            disk,
            device,
            state: Arc::new(DirectState::default()),
        }
    }
}

#[async_trait]
impl DiskSched for NoopSched {
    fn policy_name(&self) -> &'static str {
        "noop"
    }

    fn submit(
        &self,
        _owner: ProcessId,
        _nice: i32,
        request: IoRequest,
    ) -> Result<CompletionTicket, SubmitError> {
        if self.state.draining.load(Ordering::SeqCst) {
            self.state.stats.lock().record_reject();
            return Err(SubmitError::Draining {
                disk: self.disk.to_string(),
            });
        }

        let (tx, rx) = oneshot::channel();
        let pending = PendingIo { request, reply: tx };
        let io = IssuedIo::from_pending(pending, IoOrigin::Direct);
        let port = CompletionPort::for_direct(Arc::clone(&self.state));

        self.state.incomplete.fetch_add(1, Ordering::SeqCst);
        {
            let mut stats = self.state.stats.lock();
            stats.record_enqueue();
            stats.dispatched += 1;
        }
        if let Err(failure) = self.device.submit(io, port.clone()) {
            let status = IoStatus::Error(failure.error.to_string());
            port.complete(failure.io, status);
        }
        Ok(CompletionTicket::new(rx))
    }

    fn cancel_all(&self, _owner: ProcessId) {
        // Nothing is ever queued here; in-flight work completes normally.
    }

    async fn drain(&self, _mode: DrainMode) {
        self.state.draining.store(true, Ordering::SeqCst);
        loop {
            if self.state.incomplete.load(Ordering::SeqCst) == 0 {
                break;
            }
            tokio::select! {
                _ = self.state.drain_notify.notified() => {}
                _ = tokio::time::sleep(Duration::from_millis(20)) => {}
            }
        }
        debug!(disk = %self.disk, "noop drain complete");
    }

    fn stats(&self) -> SchedStats {
        self.state.stats.lock().clone()
    }
}
