//! The fair-queuing scheduler instance for one disk.
//!
//! [`FqSched::start`] spawns the disk's dispatcher and balancer tasks and
//! returns the handle the block-I/O boundary talks to: `submit`,
//! `cancel_all` and `drain`.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info};

use crate::balance::run_balancer;
use crate::device::BlockDevice;
use crate::disk::{DiskConfig, DiskCtx, DrainMode, DrainPhase};
use crate::dispatch::run_dispatcher;
use crate::error::SubmitError;
use crate::request::{CompletedIo, CompletionTicket, IoRequest, IoStatus, PendingIo};
use crate::stats::SchedStats;
use crate::types::{DiskId, ProcessId};

/// Poll bound while waiting for a drain to quiesce; completions also
/// signal the waiter directly.
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Fair-queuing scheduler for one disk.
pub struct FqSched {
    ctx: Arc<DiskCtx>,
    device: Arc<dyn BlockDevice>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl FqSched {
    /// Creates the disk state and spawns its dispatcher and balancer.
    pub fn start(disk: DiskId, cfg: DiskConfig, device: Arc<dyn BlockDevice>) -> Arc<Self> {
        let ctx = DiskCtx::new(disk, cfg);
        let (shutdown, rx) = watch::channel(false);

        let dispatcher = tokio::spawn(run_dispatcher(
            Arc::clone(&ctx),
            Arc::clone(&device),
            rx.clone(),
        ));
        let balancer = tokio::spawn(run_balancer(Arc::clone(&ctx), rx));

        info!(disk = %ctx.disk(), "fair queuing enabled");
        Arc::new(Self {
            ctx,
            device,
            shutdown,
            tasks: Mutex::new(vec![dispatcher, balancer]),
        })
    }

    /// The underlying disk state, for stats and budget inspection.
    pub fn disk_ctx(&self) -> &Arc<DiskCtx> {
        &self.ctx
    }

    /// Admits one request for `owner` and signals the dispatcher.
    ///
    /// Synchronous errors cover admission only; the terminal status
    /// arrives on the returned ticket.
    pub fn submit(
        &self,
        owner: ProcessId,
        nice: i32,
        request: IoRequest,
    ) -> Result<CompletionTicket, SubmitError> {
        let (tx, rx) = oneshot::channel();
        let pending = PendingIo { request, reply: tx };

        match self.ctx.admit(owner, nice, pending) {
            Ok(_flow) => {
                self.ctx.notify_dispatch();
                Ok(CompletionTicket::new(rx))
            }
            Err(e) => {
                self.ctx.with_stats(|s| s.record_reject());
                Err(e)
            }
        }
    }

    /// Fails every queued-but-unissued request of `owner` with a
    /// cancellation status and drops their references. In-flight requests
    /// finish normally; the flow disappears once the last one completes.
    pub fn cancel_all(&self, owner: ProcessId) {
        let flow = {
            let inner = self.ctx.lock();
            inner.members.iter().find(|f| f.owner() == owner).cloned()
        };
        let Some(flow) = flow else {
            return;
        };

        let cancelled = flow.lock().queue.drain_all();
        let n = cancelled.len();
        for pending in cancelled {
            let latency = pending.request.submitted_at().elapsed();
            let _ = pending.reply.send(CompletedIo {
                request: pending.request,
                status: IoStatus::Cancelled,
                latency,
            });
            self.ctx.with_stats(|s| s.record_cancel());
            self.ctx.release(&flow);
        }
        if n > 0 {
            debug!(disk = %self.ctx.disk(), %owner, cancelled = n, "queued requests cancelled");
        }
    }

    /// Drains the disk and stops its tasks.
    ///
    /// Idempotent and safe to call concurrently with traffic: every
    /// caller returns once the disk is quiesced. `Flush` lets queued work
    /// dispatch and complete; `Cancel` fails queued work immediately and
    /// only waits for what is already in flight.
    pub async fn drain(&self, mode: DrainMode) {
        let initiated = self.ctx.begin_drain(mode);
        if initiated {
            info!(disk = %self.ctx.disk(), ?mode, "drain started");
        }

        // Cancellation sweep runs for every Cancel caller; the queues it
        // clears stay clear because admission is already closed.
        if mode == DrainMode::Cancel {
            self.cancel_queued_everywhere();
        }
        self.ctx.notify_dispatch();

        loop {
            if self.ctx.quiesced() {
                break;
            }
            tokio::select! {
                _ = self.ctx.drain_signal() => {}
                _ = tokio::time::sleep(DRAIN_POLL) => {}
            }
        }

        self.ctx.mark_drained();
        let _ = self.shutdown.send(true);
        self.ctx.notify_dispatch();

        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            let _ = task.await;
        }
        info!(disk = %self.ctx.disk(), ?mode, "drain complete");
    }

    fn cancel_queued_everywhere(&self) {
        for flow in self.ctx.members_snapshot() {
            let cancelled = flow.lock().queue.drain_all();
            for pending in cancelled {
                let latency = pending.request.submitted_at().elapsed();
                let _ = pending.reply.send(CompletedIo {
                    request: pending.request,
                    status: IoStatus::Cancelled,
                    latency,
                });
                self.ctx.with_stats(|s| s.record_cancel());
                self.ctx.release(&flow);
            }
        }
    }

    /// Snapshot of the disk's counters.
    pub fn stats(&self) -> SchedStats {
        self.ctx.stats()
    }

    /// Current drain phase.
    pub fn drain_phase(&self) -> DrainPhase {
        self.ctx.drain_phase()
    }

    /// The device this scheduler dispatches to.
    pub fn device(&self) -> &Arc<dyn BlockDevice> {
        &self.device
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{MemDevice, MemDeviceConfig};
    use crate::types::{IoDirection, RequestId, RequestIdGen};

    fn req(ids: &RequestIdGen) -> IoRequest {
        IoRequest::new(ids.next_id(), IoDirection::Read, 4096, 0)
    }

    #[tokio::test]
    async fn test_submit_complete_round_trip() {
        let sched = FqSched::start(
            DiskId::new("nvme0"),
            DiskConfig::default(),
            MemDevice::instant(),
        );
        let ids = RequestIdGen::new();

        let ticket = sched.submit(ProcessId(1), 0, req(&ids)).unwrap();
        let done = ticket.wait().await.unwrap();
        assert!(done.status.is_ok());
        assert_eq!(done.request.id, RequestId(1));

        sched.drain(DrainMode::Flush).await;
        assert_eq!(sched.stats().completed, 1);
    }

    #[tokio::test]
    async fn test_cancel_all_fails_queued_only() {
        // A class budget of 2 keeps six requests queued while two sit in
        // flight at a slow device; cancel_all must fail exactly the
        // queued six.
        let sched = FqSched::start(
            DiskId::new("nvme0"),
            DiskConfig::default(),
            MemDevice::new(MemDeviceConfig {
                latency: Duration::from_millis(200),
                ..Default::default()
            }),
        );
        {
            let mut inner = sched.disk_ctx().lock();
            inner.throttle = crate::balance::ThrottleState::Throttled;
            inner.budgetpb[crate::types::Priority::new(5).as_index()] = 2;
        }
        let ids = RequestIdGen::new();

        let mut tickets = vec![];
        for _ in 0..8 {
            tickets.push(sched.submit(ProcessId(1), 0, req(&ids)).unwrap());
        }
        // Let the dispatcher issue up to the class budget.
        tokio::time::sleep(Duration::from_millis(50)).await;

        sched.cancel_all(ProcessId(1));

        let mut cancelled = 0;
        let mut ok = 0;
        for t in tickets {
            match t.wait().await.unwrap().status {
                IoStatus::Cancelled => cancelled += 1,
                IoStatus::Ok => ok += 1,
                IoStatus::Error(e) => panic!("unexpected error: {}", e),
            }
        }
        assert_eq!(ok, 2, "issued requests complete normally");
        assert_eq!(cancelled, 6, "queued requests fail with Cancelled");

        sched.drain(DrainMode::Flush).await;
    }

    #[tokio::test]
    async fn test_drain_flush_completes_everything() {
        let sched = FqSched::start(
            DiskId::new("nvme0"),
            DiskConfig::default(),
            MemDevice::new(MemDeviceConfig {
                latency: Duration::from_millis(5),
                ..Default::default()
            }),
        );
        let ids = RequestIdGen::new();

        let tickets: Vec<_> = (0..20)
            .map(|i| sched.submit(ProcessId(1 + i % 3), 0, req(&ids)).unwrap())
            .collect();

        sched.drain(DrainMode::Flush).await;
        assert_eq!(sched.disk_ctx().incomplete_tp(), 0);
        assert_eq!(sched.drain_phase(), DrainPhase::Drained);

        for t in tickets {
            assert!(t.wait().await.unwrap().status.is_ok());
        }
        assert_eq!(sched.stats().completed, 20);
    }

    #[tokio::test]
    async fn test_drain_cancel_empties_queues() {
        // Slow device, tiny pass cap: most requests are still queued when
        // the cancel drain hits.
        let sched = FqSched::start(
            DiskId::new("nvme0"),
            DiskConfig {
                pass_cap: 1,
                ..Default::default()
            },
            MemDevice::new(MemDeviceConfig {
                latency: Duration::from_millis(100),
                ..Default::default()
            }),
        );
        let ids = RequestIdGen::new();

        let tickets: Vec<_> = (0..10)
            .map(|_| sched.submit(ProcessId(1), 0, req(&ids)).unwrap())
            .collect();

        sched.drain(DrainMode::Cancel).await;

        // No request remains queued anywhere.
        let inner_empty = sched
            .disk_ctx()
            .members_snapshot()
            .iter()
            .all(|f| f.queued() == 0);
        assert!(inner_empty);
        assert_eq!(sched.disk_ctx().incomplete_tp(), 0);

        let mut cancelled = 0;
        for t in tickets {
            if t.wait().await.unwrap().status == IoStatus::Cancelled {
                cancelled += 1;
            }
        }
        assert!(cancelled >= 1);
    }

    #[tokio::test]
    async fn test_submit_after_drain_rejected() {
        let sched = FqSched::start(
            DiskId::new("nvme0"),
            DiskConfig::default(),
            MemDevice::instant(),
        );
        sched.drain(DrainMode::Flush).await;

        let ids = RequestIdGen::new();
        let err = sched.submit(ProcessId(1), 0, req(&ids));
        assert!(matches!(
            err,
            Err(crate::error::SubmitError::Draining { .. })
        ));
        assert_eq!(sched.stats().rejected, 1);
    }

    #[tokio::test]
    async fn test_drain_idempotent_and_concurrent() {
        let sched = FqSched::start(
            DiskId::new("nvme0"),
            DiskConfig::default(),
            MemDevice::instant(),
        );
        let ids = RequestIdGen::new();
        for _ in 0..5 {
            let _ = sched.submit(ProcessId(1), 0, req(&ids)).unwrap();
        }

        let s1 = Arc::clone(&sched);
        let s2 = Arc::clone(&sched);
        let (a, b) = tokio::join!(
            s1.drain(DrainMode::Flush),
            s2.drain(DrainMode::Flush)
        );
        let _ = (a, b);
        assert_eq!(sched.drain_phase(), DrainPhase::Drained);

        // A third drain returns immediately.
        sched.drain(DrainMode::Flush).await;
    }

    #[tokio::test]
    async fn test_exited_process_with_inflight_completions() {
        // The §8 exit scenario: requests are in flight when the owner
        // exits; the flow stays allocated until the last completion and
        // is then torn down exactly once.
        let sched = FqSched::start(
            DiskId::new("nvme0"),
            DiskConfig::default(),
            MemDevice::new(MemDeviceConfig {
                latency: Duration::from_millis(50),
                ..Default::default()
            }),
        );
        let ids = RequestIdGen::new();

        let tickets: Vec<_> = (0..3)
            .map(|_| sched.submit(ProcessId(7), 0, req(&ids)).unwrap())
            .collect();

        // Wait for all three to be issued.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sched.disk_ctx().flow_count(), 1);

        // Exit path: nothing queued, so cancel_all releases nothing; the
        // in-flight references hold the flow alive.
        sched.cancel_all(ProcessId(7));
        assert_eq!(sched.disk_ctx().flow_count(), 1);

        for t in tickets {
            assert!(t.wait().await.unwrap().status.is_ok());
        }
        // Last completion released the last reference.
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sched.disk_ctx().flow_count(), 0);

        sched.drain(DrainMode::Flush).await;
    }
}
