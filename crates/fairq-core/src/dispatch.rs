//! Dispatcher: releases queued requests to the device layer.
//!
//! One dispatcher task runs per disk. Each pass walks the membership
//! list highest priority class first, round-robin within a class, and
//! hands at most one request per step to the device. Budget and rate
//! gates apply while the balancer reports throttling. Submission happens
//! outside every lock; the critical sections here are all bounded.

use std::sync::Arc;
use std::time::Instant;

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::completion::{CompletionPort, IoOrigin, IssuedIo};
use crate::device::BlockDevice;
use crate::disk::{DiskCtx, DrainMode, DrainPhase};
use crate::flow::IoFlow;
use crate::request::{IoStatus, PendingIo};
use crate::types::PRIO_CLASSES;

/// Picks the next dispatchable request, or None when every flow is out
/// of budget or work. Runs one bounded critical section.
fn pick_next(disk: &DiskCtx) -> Option<(Arc<IoFlow>, PendingIo, usize)> {
    let mut inner = disk.lock();

    let flushing = match inner.drain {
        DrainPhase::Active => false,
        DrainPhase::Draining(DrainMode::Flush) => true,
        // Cancelled or fully drained: nothing further leaves the queues.
        DrainPhase::Draining(DrainMode::Cancel) | DrainPhase::Drained => return None,
    };
    let enforce = inner.throttle.is_throttling() && !flushing;

    for class_idx in (0..PRIO_CLASSES).rev() {
        let n = inner.members.len();
        if n == 0 {
            return None;
        }
        let budget = inner.budgetpb[class_idx];
        let start = inner.cursor[class_idx] % n;

        for k in 0..n {
            let i = (start + k) % n;
            if inner.members[i].priority().as_index() != class_idx {
                continue;
            }
            let flow = Arc::clone(&inner.members[i]);
            let mut f = flow.lock();
            if f.queue.is_empty() {
                continue;
            }
            if enforce {
                if (f.issued as i64) >= budget {
                    continue;
                }
                if let Some(tp) = f.max_tp {
                    if f.dispatched_interval >= tp {
                        continue;
                    }
                }
            }

            let pending = f.queue.dequeue().expect("queue checked non-empty");
            f.issued += 1;
            f.dispatched_interval += 1;
            drop(f);

            // Counted while the disk lock is held, so a concurrent drain
            // never sees the request as neither queued nor in flight.
            disk.inc_incomplete();
            inner.cursor[class_idx] = (i + 1) % n;
            return Some((flow, pending, class_idx));
        }
    }
    None
}

/// Runs one dispatch pass for `disk`, returning the number of requests
/// handed to the device.
///
/// Normally driven by the dispatcher task; exposed so tests and
/// embedders can step the scheduler deterministically.
pub fn dispatch_pass(disk: &Arc<DiskCtx>, device: &Arc<dyn BlockDevice>) -> usize {
    let mut dispatched = 0usize;

    while dispatched < disk.cfg().pass_cap {
        let Some((flow, pending, class_idx)) = pick_next(disk) else {
            break;
        };

        disk.with_stats(|s| s.record_dispatch(class_idx));
        dispatched += 1;

        let io = IssuedIo::from_pending(pending, IoOrigin::Flow(flow));
        let port = CompletionPort::for_disk(Arc::clone(disk));
        if let Err(failure) = device.submit(io, port.clone()) {
            // Device refusal becomes a synchronous error completion; the
            // pass moves on to the next flow.
            warn!(
                disk = %disk.disk(),
                request = ?failure.io.request.id,
                error = %failure.error,
                "device rejected submission"
            );
            let status = IoStatus::Error(failure.error.to_string());
            port.complete(failure.io, status);
        }
    }

    if dispatched == 0 {
        mark_idle_if_empty(disk);
    }
    dispatched
}

/// After a zero-dispatch pass with nothing queued anywhere, the disk is
/// idle; the next admission folds the elapsed time into `idle_time`.
fn mark_idle_if_empty(disk: &DiskCtx) {
    let mut inner = disk.lock();
    if inner.idle || !matches!(inner.drain, DrainPhase::Active) {
        return;
    }
    let queues_empty = inner.members.iter().all(|f| f.lock().queue.is_empty());
    if queues_empty {
        inner.idle = true;
        inner.start_idle = Some(Instant::now());
        drop(inner);
        disk.with_stats(|s| s.idle_transitions += 1);
        debug!(disk = %disk.disk(), "disk idle");
    }
}

/// Dispatcher task: dispatch until signalled out or shut down.
pub(crate) async fn run_dispatcher(
    disk: Arc<DiskCtx>,
    device: Arc<dyn BlockDevice>,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!(disk = %disk.disk(), "dispatcher started");
    loop {
        if *shutdown.borrow() {
            break;
        }

        let dispatched = dispatch_pass(&disk, &device);
        if dispatched > 0 {
            // More work may remain beyond the pass cap; yield and rescan.
            tokio::task::yield_now().await;
            continue;
        }

        tokio::select! {
            _ = disk.dispatch_signal() => {}
            _ = tokio::time::sleep(disk.cfg().dispatcher_timeout) => {}
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(disk = %disk.disk(), "dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::balance::ThrottleState;
    use crate::device::{MemDevice, MemDeviceConfig, SubmitFailure};
    use crate::disk::DiskConfig;
    use crate::error::DeviceError;
    use crate::request::{CompletionTicket, IoRequest};
    use crate::types::{DiskId, IoDirection, ProcessId, Priority, RequestId};

    /// Device that accepts everything and completes nothing, recording
    /// the payload of each submission in order.
    #[derive(Debug, Default)]
    struct CollectDevice {
        seen: parking_lot::Mutex<Vec<u64>>,
        held: parking_lot::Mutex<Vec<(IssuedIo, CompletionPort)>>,
    }

    impl CollectDevice {
        fn order(&self) -> Vec<u64> {
            self.seen.lock().clone()
        }

        fn complete_all(&self) {
            for (io, port) in self.held.lock().drain(..) {
                port.complete(io, IoStatus::Ok);
            }
        }
    }

    impl BlockDevice for CollectDevice {
        fn submit(&self, io: IssuedIo, port: CompletionPort) -> Result<(), SubmitFailure> {
            self.seen.lock().push(io.request.payload);
            self.held.lock().push((io, port));
            Ok(())
        }
    }

    /// Device that refuses every handoff.
    #[derive(Debug)]
    struct DeadDevice;

    impl BlockDevice for DeadDevice {
        fn submit(&self, io: IssuedIo, _port: CompletionPort) -> Result<(), SubmitFailure> {
            Err(SubmitFailure {
                io,
                error: DeviceError::Unavailable("device removed".to_string()),
            })
        }
    }

    fn ctx_with(cfg: DiskConfig) -> Arc<DiskCtx> {
        DiskCtx::new(DiskId::new("nvme0"), cfg)
    }

    fn submit_n(
        disk: &Arc<DiskCtx>,
        owner: ProcessId,
        nice: i32,
        n: u64,
    ) -> Vec<CompletionTicket> {
        let mut tickets = vec![];
        for i in 0..n {
            let (tx, rx) = tokio::sync::oneshot::channel();
            let pending = PendingIo {
                request: IoRequest::new(
                    RequestId(owner.0 * 1_000_000 + i),
                    IoDirection::Read,
                    4096,
                    owner.0,
                ),
                reply: tx,
            };
            disk.admit(owner, nice, pending).unwrap();
            tickets.push(CompletionTicket::new(rx));
        }
        tickets
    }

    fn drain_passes(disk: &Arc<DiskCtx>, device: &Arc<dyn BlockDevice>) -> usize {
        let mut total = 0;
        loop {
            let n = dispatch_pass(disk, device);
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }

    #[test]
    fn test_priority_ordering_within_pass() {
        let disk = ctx_with(DiskConfig::default());
        let device = Arc::new(CollectDevice::default());
        let dyn_dev: Arc<dyn BlockDevice> = device.clone();

        let _low = submit_n(&disk, ProcessId(1), 10, 3); // class 0
        let _high = submit_n(&disk, ProcessId(2), -10, 3); // class 10

        dispatch_pass(&disk, &dyn_dev);

        // Every high-class request dispatches before any low-class one.
        assert_eq!(device.order(), vec![2, 2, 2, 1, 1, 1]);
    }

    #[test]
    fn test_round_robin_within_class() {
        let disk = ctx_with(DiskConfig::default());
        let device = Arc::new(CollectDevice::default());
        let dyn_dev: Arc<dyn BlockDevice> = device.clone();

        let _a = submit_n(&disk, ProcessId(1), 0, 4);
        let _b = submit_n(&disk, ProcessId(2), 0, 4);

        dispatch_pass(&disk, &dyn_dev);

        // Strict alternation between the two equal-priority flows.
        assert_eq!(device.order(), vec![1, 2, 1, 2, 1, 2, 1, 2]);
    }

    #[test]
    fn test_fairness_bounded_over_rounds() {
        let disk = ctx_with(DiskConfig {
            pass_cap: 10,
            ..Default::default()
        });
        let device = Arc::new(CollectDevice::default());
        let dyn_dev: Arc<dyn BlockDevice> = device.clone();

        let flows: Vec<_> = (1..=3)
            .map(|pid| {
                let _ = submit_n(&disk, ProcessId(pid), 0, 100);
                disk.find_or_create(ProcessId(pid), 0).unwrap()
            })
            .collect();

        dispatch_pass(&disk, &dyn_dev);

        // 10 dispatches over 3 flows: each within +-1 of 10/3.
        let counts: Vec<u32> = flows.iter().map(|f| f.issued()).collect();
        assert_eq!(counts.iter().sum::<u32>(), 10);
        for &c in &counts {
            assert!((3..=4).contains(&c), "unfair split: {:?}", counts);
        }
        for f in &flows {
            disk.release(f);
        }
    }

    #[test]
    fn test_budget_scenario_equal_split() {
        // Two priority-5 flows, class budget 100: each ends the interval
        // with 50 issued, regardless of submission order.
        let disk = ctx_with(DiskConfig {
            pass_cap: 64,
            ..Default::default()
        });
        let device = Arc::new(CollectDevice::default());
        let dyn_dev: Arc<dyn BlockDevice> = device.clone();

        let _a = submit_n(&disk, ProcessId(1), 0, 1000);
        let _b = submit_n(&disk, ProcessId(2), 0, 1000);
        let a = disk.find_or_create(ProcessId(1), 0).unwrap();
        let b = disk.find_or_create(ProcessId(2), 0).unwrap();

        let class5 = Priority::new(5).as_index();
        {
            let mut inner = disk.lock();
            inner.throttle = ThrottleState::Throttled;
            inner.budgetpb[class5] = 100;
        }
        {
            a.lock().max_tp = Some(50);
            b.lock().max_tp = Some(50);
        }

        let total = drain_passes(&disk, &dyn_dev);
        assert_eq!(total, 100);
        assert_eq!(a.issued(), 50);
        assert_eq!(b.issued(), 50);

        disk.release(&a);
        disk.release(&b);
    }

    #[test]
    fn test_class_budget_caps_outstanding() {
        let disk = ctx_with(DiskConfig::default());
        let device = Arc::new(CollectDevice::default());
        let dyn_dev: Arc<dyn BlockDevice> = device.clone();

        let _t = submit_n(&disk, ProcessId(1), 0, 20);
        let flow = disk.find_or_create(ProcessId(1), 0).unwrap();

        let class5 = Priority::new(5).as_index();
        {
            let mut inner = disk.lock();
            inner.throttle = ThrottleState::Throttled;
            inner.budgetpb[class5] = 4;
        }

        drain_passes(&disk, &dyn_dev);
        assert_eq!(flow.issued(), 4);

        // Completions free budget; the dispatcher can issue again.
        device.complete_all();
        drain_passes(&disk, &dyn_dev);
        assert_eq!(flow.issued(), 4);
        assert_eq!(flow.queued(), 12);

        disk.release(&flow);
    }

    #[test]
    fn test_empty_disk_goes_idle() {
        let disk = ctx_with(DiskConfig::default());
        let dyn_dev: Arc<dyn BlockDevice> = Arc::new(CollectDevice::default());

        assert_eq!(dispatch_pass(&disk, &dyn_dev), 0);
        assert!(disk.lock().idle);
        assert_eq!(disk.stats().idle_transitions, 1);
    }

    #[test]
    fn test_admission_clears_idle() {
        let disk = ctx_with(DiskConfig::default());
        let dyn_dev: Arc<dyn BlockDevice> = Arc::new(CollectDevice::default());

        dispatch_pass(&disk, &dyn_dev);
        assert!(disk.lock().idle);

        std::thread::sleep(std::time::Duration::from_millis(5));
        let _t = submit_n(&disk, ProcessId(1), 0, 1);
        let inner = disk.lock();
        assert!(!inner.idle);
        assert!(inner.idle_time > std::time::Duration::ZERO);
    }

    #[test]
    fn test_submission_failure_completes_with_error() {
        let disk = ctx_with(DiskConfig::default());
        let dyn_dev: Arc<dyn BlockDevice> = Arc::new(DeadDevice);

        let mut tickets = submit_n(&disk, ProcessId(1), 0, 2);

        let n = dispatch_pass(&disk, &dyn_dev);
        assert_eq!(n, 2);
        assert_eq!(disk.incomplete_tp(), 0);
        assert_eq!(disk.stats().errored, 2);

        for t in tickets.iter_mut() {
            let done = t.try_wait().expect("error completion delivered");
            assert!(matches!(done.status, IoStatus::Error(_)));
        }
    }

    #[test]
    fn test_exhausted_flow_skipped_not_errored() {
        let disk = ctx_with(DiskConfig::default());
        let device = Arc::new(CollectDevice::default());
        let dyn_dev: Arc<dyn BlockDevice> = device.clone();

        let _a = submit_n(&disk, ProcessId(1), 0, 2);
        // Flow 2 exists but has no queued work.
        let empty = disk.find_or_create(ProcessId(2), 0).unwrap();

        let n = dispatch_pass(&disk, &dyn_dev);
        assert_eq!(n, 2);
        assert_eq!(empty.issued(), 0);
        disk.release(&empty);
    }

    #[test]
    fn test_cancel_drain_stops_dispatch() {
        let disk = ctx_with(DiskConfig::default());
        let device = Arc::new(CollectDevice::default());
        let dyn_dev: Arc<dyn BlockDevice> = device.clone();

        let _t = submit_n(&disk, ProcessId(1), 0, 5);
        disk.begin_drain(DrainMode::Cancel);

        assert_eq!(dispatch_pass(&disk, &dyn_dev), 0);
        assert!(device.order().is_empty());
    }

    #[test]
    fn test_flush_drain_keeps_dispatching_queued_work() {
        let disk = ctx_with(DiskConfig::default());
        let device = Arc::new(CollectDevice::default());
        let dyn_dev: Arc<dyn BlockDevice> = device.clone();

        let _t = submit_n(&disk, ProcessId(1), 0, 5);
        disk.begin_drain(DrainMode::Flush);

        assert_eq!(drain_passes(&disk, &dyn_dev), 5);
    }

    #[tokio::test]
    async fn test_mem_device_round_trip() {
        let disk = ctx_with(DiskConfig::default());
        let dyn_dev: Arc<dyn BlockDevice> = MemDevice::new(MemDeviceConfig::default());

        let mut tickets = submit_n(&disk, ProcessId(1), 0, 3);
        dispatch_pass(&disk, &dyn_dev);

        for t in tickets.drain(..) {
            let done = t.wait().await.unwrap();
            assert!(done.status.is_ok());
            assert!(done.request.is_issued());
        }
        assert_eq!(disk.incomplete_tp(), 0);
    }
}
