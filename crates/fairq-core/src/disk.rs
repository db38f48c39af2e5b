//! Per-disk scheduling state and the flow lifecycle manager.
//!
//! A [`DiskCtx`] owns the membership list of live flows, the per-class
//! budget table the balancer rewrites each interval, the idle/busy
//! accounting, and the drain state machine. The lifecycle operations
//! (`find_or_create`, `acquire`, `release`) guarantee that a flow is
//! unlinked exactly once, and only when nothing references it anymore.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, MutexGuard};
use serde::{Deserialize, Serialize};
use tokio::sync::Notify;
use tracing::debug;

use crate::balance::ThrottleState;
use crate::error::SubmitError;
use crate::flow::IoFlow;
use crate::request::PendingIo;
use crate::stats::SchedStats;
use crate::types::{DiskId, Priority, ProcessId, PRIO_CLASSES};

/// How a drain disposes of queued-but-unissued requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DrainMode {
    /// Let queued work dispatch and all issued work complete normally.
    Flush,
    /// Fail queued work with a cancellation status; let issued work finish.
    Cancel,
}

/// Drain progress for one disk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DrainPhase {
    /// Normal operation.
    Active,
    /// Admission closed; waiting for in-flight work to finish.
    Draining(DrainMode),
    /// Fully quiesced; tasks stopped or stopping.
    Drained,
}

/// Tuning knobs for one scheduled disk.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskConfig {
    /// Balancer interval; budgets are recomputed once per interval.
    pub interval: Duration,
    /// Ceiling on the per-interval budget table sum, in request units.
    pub total_budget: i64,
    /// Busy fraction above which an interval counts as full.
    pub busy_threshold: f64,
    /// Fraction of the ceiling distributed while throttling; the rest is
    /// headroom for latency-sensitive bursts.
    pub throttle_factor: f64,
    /// Maximum dispatches per dispatcher pass.
    pub pass_cap: usize,
    /// Dispatcher sleep bound when no signal arrives.
    pub dispatcher_timeout: Duration,
    /// Maximum live flows per disk; admission fails beyond this.
    pub max_flows: usize,
}

impl Default for DiskConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            total_budget: 1024,
            busy_threshold: 0.90,
            throttle_factor: 0.90,
            pass_cap: 64,
            dispatcher_timeout: Duration::from_millis(100),
            max_flows: 1024,
        }
    }
}

/// Mutable per-disk state, guarded by the disk lock.
///
/// Lock ordering: this lock is always acquired before any member flow's
/// lock, never the reverse.
#[derive(Debug)]
pub(crate) struct DiskInner {
    /// Live flows; the only strong owner of each [`IoFlow`].
    pub members: Vec<Arc<IoFlow>>,
    /// Per-class request budgets for the current interval.
    pub budgetpb: [i64; PRIO_CLASSES],
    /// Hysteresis state driving budget tightening.
    pub throttle: ThrottleState,
    /// Whether the disk is currently idle.
    pub idle: bool,
    /// When the current idle period began.
    pub start_idle: Option<Instant>,
    /// Idle time accumulated in the current interval.
    pub idle_time: Duration,
    /// When the current interval began.
    pub interval_started: Instant,
    /// Drain progress.
    pub drain: DrainPhase,
    /// Round-robin cursors, one per priority class.
    pub cursor: [usize; PRIO_CLASSES],
}

/// State for one disk under the fair-queuing policy.
#[derive(Debug)]
pub struct DiskCtx {
    disk: DiskId,
    cfg: DiskConfig,
    inner: Mutex<DiskInner>,
    /// Requests issued to the device and not yet completed, disk-wide.
    incomplete_tp: AtomicI64,
    dispatch_notify: Notify,
    drain_notify: Notify,
    stats: Mutex<SchedStats>,
}

impl DiskCtx {
    /// Creates scheduling state for one disk.
    pub fn new(disk: DiskId, cfg: DiskConfig) -> Arc<Self> {
        Arc::new(Self {
            disk,
            cfg,
            inner: Mutex::new(DiskInner {
                members: Vec::new(),
                budgetpb: [0; PRIO_CLASSES],
                throttle: ThrottleState::Stable,
                idle: false,
                start_idle: None,
                idle_time: Duration::ZERO,
                interval_started: Instant::now(),
                drain: DrainPhase::Active,
                cursor: [0; PRIO_CLASSES],
            }),
            incomplete_tp: AtomicI64::new(0),
            dispatch_notify: Notify::new(),
            drain_notify: Notify::new(),
            stats: Mutex::new(SchedStats::default()),
        })
    }

    /// The disk this state belongs to.
    #[inline]
    pub fn disk(&self) -> &DiskId {
        &self.disk
    }

    /// The configuration this disk was created with.
    #[inline]
    pub fn cfg(&self) -> &DiskConfig {
        &self.cfg
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, DiskInner> {
        self.inner.lock()
    }

    /// Wakes the dispatcher.
    pub fn notify_dispatch(&self) {
        self.dispatch_notify.notify_one();
    }

    pub(crate) async fn dispatch_signal(&self) {
        self.dispatch_notify.notified().await;
    }

    pub(crate) fn notify_drain(&self) {
        self.drain_notify.notify_waiters();
    }

    pub(crate) async fn drain_signal(&self) {
        self.drain_notify.notified().await;
    }

    /// Disk-wide count of issued-but-incomplete requests.
    pub fn incomplete_tp(&self) -> i64 {
        self.incomplete_tp.load(Ordering::SeqCst)
    }

    pub(crate) fn inc_incomplete(&self) {
        self.incomplete_tp.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn dec_incomplete(&self) -> i64 {
        let prev = self.incomplete_tp.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "incomplete_tp underflow");
        prev - 1
    }

    /// Runs `f` against the disk stats.
    pub(crate) fn with_stats<F: FnOnce(&mut SchedStats)>(&self, f: F) {
        f(&mut self.stats.lock());
    }

    /// Snapshot of the disk's counters.
    pub fn stats(&self) -> SchedStats {
        self.stats.lock().clone()
    }

    /// Snapshot of the per-class budget table.
    pub fn budgets(&self) -> [i64; PRIO_CLASSES] {
        self.inner.lock().budgetpb
    }

    /// Current drain phase.
    pub fn drain_phase(&self) -> DrainPhase {
        self.inner.lock().drain
    }

    /// Whether the throttle state machine currently enforces budgets.
    pub fn is_throttling(&self) -> bool {
        self.inner.lock().throttle.is_throttling()
    }

    /// Number of live flows.
    pub fn flow_count(&self) -> usize {
        self.inner.lock().members.len()
    }

    /// Finds the flow for `owner`, creating it with the priority derived
    /// from `nice` if absent. The scan-then-insert runs entirely under
    /// the disk lock, so concurrent calls for the same owner never create
    /// duplicates. The returned flow carries one extra logical reference
    /// for the caller.
    pub fn find_or_create(
        &self,
        owner: ProcessId,
        nice: i32,
    ) -> Result<Arc<IoFlow>, SubmitError> {
        let mut inner = self.inner.lock();
        self.find_or_create_locked(&mut inner, owner, nice)
    }

    pub(crate) fn find_or_create_locked(
        &self,
        inner: &mut DiskInner,
        owner: ProcessId,
        nice: i32,
    ) -> Result<Arc<IoFlow>, SubmitError> {
        if let Some(flow) = inner.members.iter().find(|f| f.owner() == owner) {
            flow.acquire();
            return Ok(Arc::clone(flow));
        }

        if inner.members.len() >= self.cfg.max_flows {
            return Err(SubmitError::OutOfMemory {
                disk: self.disk.to_string(),
            });
        }

        let flow = Arc::new(IoFlow::new(
            self.disk.clone(),
            owner,
            Priority::from_nice(nice),
        ));
        inner.members.push(Arc::clone(&flow));
        debug!(disk = %self.disk, owner = %owner, priority = %flow.priority(), "flow created");
        Ok(flow)
    }

    /// Adds a logical reference to `flow`.
    pub fn acquire(&self, flow: &Arc<IoFlow>) {
        flow.acquire();
    }

    /// Drops a logical reference to `flow`. The caller that observes the
    /// count reach zero unlinks the flow from membership, under the disk
    /// lock and exactly once.
    pub fn release(&self, flow: &Arc<IoFlow>) {
        if flow.release_observes_zero() {
            self.unlink_if_dead(flow);
        }
    }

    /// Unlinks `flow` from membership if it is still unreferenced by the
    /// time the disk lock is held. A concurrent `find_or_create` that
    /// revived the flow wins; the unlink is abandoned.
    fn unlink_if_dead(&self, flow: &Arc<IoFlow>) {
        let mut inner = self.inner.lock();
        if flow.refcount() != 0 {
            return;
        }
        if !flow.claim_unlink() {
            return;
        }
        debug_assert!(flow.queued() == 0, "unlinking flow with queued requests");
        debug_assert!(flow.issued() == 0, "unlinking flow with issued requests");
        inner.members.retain(|f| !Arc::ptr_eq(f, flow));
        debug!(disk = %self.disk, owner = %flow.owner(), "flow unlinked");
    }

    /// Admits one request: checks the drain gate, finds or creates the
    /// flow, enqueues, and clears the idle state — all under one disk-lock
    /// critical section so a concurrent drain cannot strand the request.
    pub(crate) fn admit(
        &self,
        owner: ProcessId,
        nice: i32,
        pending: PendingIo,
    ) -> Result<Arc<IoFlow>, SubmitError> {
        let mut inner = self.inner.lock();

        if !matches!(inner.drain, DrainPhase::Active) {
            return Err(SubmitError::Draining {
                disk: self.disk.to_string(),
            });
        }

        let flow = self.find_or_create_locked(&mut inner, owner, nice)?;
        flow.lock().queue.enqueue(pending);

        if inner.idle {
            inner.idle = false;
            if let Some(start) = inner.start_idle.take() {
                inner.idle_time += start.elapsed();
            }
        }
        drop(inner);

        self.with_stats(|s| s.record_enqueue());
        Ok(flow)
    }

    /// Moves the disk into draining state. Returns true for the caller
    /// that performed the transition; later callers see false and simply
    /// wait for the same terminal state.
    pub(crate) fn begin_drain(&self, mode: DrainMode) -> bool {
        let mut inner = self.inner.lock();
        match inner.drain {
            DrainPhase::Active => {
                inner.drain = DrainPhase::Draining(mode);
                true
            }
            _ => false,
        }
    }

    pub(crate) fn mark_drained(&self) {
        self.inner.lock().drain = DrainPhase::Drained;
    }

    /// True once nothing is queued or in flight. The whole check runs
    /// under the disk lock: the dispatcher dequeues and counts a request
    /// in one critical section, so no request can hide between the two
    /// conditions.
    pub(crate) fn quiesced(&self) -> bool {
        let inner = self.inner.lock();
        self.incomplete_tp() == 0 && inner.members.iter().all(|f| f.queued() == 0)
    }

    /// Membership snapshot for iteration outside the disk lock.
    pub(crate) fn members_snapshot(&self) -> Vec<Arc<IoFlow>> {
        self.inner.lock().members.to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Arc<DiskCtx> {
        DiskCtx::new(DiskId::new("nvme0"), DiskConfig::default())
    }

    #[test]
    fn test_find_or_create_no_duplicates() {
        let disk = ctx();
        let a = disk.find_or_create(ProcessId(1), 0).unwrap();
        let b = disk.find_or_create(ProcessId(1), 0).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(disk.flow_count(), 1);
        assert_eq!(a.refcount(), 2);
    }

    #[test]
    fn test_find_or_create_distinct_owners() {
        let disk = ctx();
        disk.find_or_create(ProcessId(1), 0).unwrap();
        disk.find_or_create(ProcessId(2), -10).unwrap();
        assert_eq!(disk.flow_count(), 2);
    }

    #[test]
    fn test_flow_table_bound() {
        let cfg = DiskConfig {
            max_flows: 2,
            ..Default::default()
        };
        let disk = DiskCtx::new(DiskId::new("nvme0"), cfg);
        disk.find_or_create(ProcessId(1), 0).unwrap();
        disk.find_or_create(ProcessId(2), 0).unwrap();

        let err = disk.find_or_create(ProcessId(3), 0);
        assert!(matches!(err, Err(SubmitError::OutOfMemory { .. })));
    }

    #[test]
    fn test_release_unlinks_idle_flow() {
        let disk = ctx();
        let flow = disk.find_or_create(ProcessId(1), 0).unwrap();
        assert_eq!(disk.flow_count(), 1);

        disk.release(&flow);
        assert_eq!(disk.flow_count(), 0);
    }

    #[test]
    fn test_release_keeps_referenced_flow() {
        let disk = ctx();
        let flow = disk.find_or_create(ProcessId(1), 0).unwrap();
        disk.acquire(&flow);

        disk.release(&flow);
        assert_eq!(disk.flow_count(), 1);

        disk.release(&flow);
        assert_eq!(disk.flow_count(), 0);
    }

    #[test]
    fn test_revived_flow_survives_release_race() {
        let disk = ctx();
        let flow = disk.find_or_create(ProcessId(1), 0).unwrap();

        // Another submit revives the flow before the unlink runs.
        let again = disk.find_or_create(ProcessId(1), 0).unwrap();
        disk.release(&flow);
        assert_eq!(disk.flow_count(), 1);
        drop(again);
    }

    #[test]
    fn test_concurrent_releases_single_teardown() {
        let disk = ctx();
        let n = 12u32;
        let flow = disk.find_or_create(ProcessId(9), 0).unwrap();
        for _ in 1..n {
            disk.acquire(&flow);
        }
        assert_eq!(flow.refcount(), n);

        let mut handles = vec![];
        for _ in 0..n {
            let disk = Arc::clone(&disk);
            let flow = Arc::clone(&flow);
            handles.push(std::thread::spawn(move || disk.release(&flow)));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(disk.flow_count(), 0);
        assert_eq!(flow.refcount(), 0);
    }

    #[test]
    fn test_begin_drain_once() {
        let disk = ctx();
        assert!(disk.begin_drain(DrainMode::Flush));
        assert!(!disk.begin_drain(DrainMode::Cancel));
        assert_eq!(disk.drain_phase(), DrainPhase::Draining(DrainMode::Flush));
    }

    #[test]
    fn test_quiesced_empty_disk() {
        let disk = ctx();
        assert!(disk.quiesced());
    }

    #[test]
    fn test_config_defaults() {
        let cfg = DiskConfig::default();
        assert_eq!(cfg.interval, Duration::from_secs(1));
        assert_eq!(cfg.total_budget, 1024);
        assert!((cfg.busy_threshold - 0.90).abs() < 1e-9);
        assert!(cfg.pass_cap > 0);
    }
}
