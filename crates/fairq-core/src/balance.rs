//! Interval budget balancer and the busy/idle hysteresis.
//!
//! Once per interval the balancer freezes each flow's accumulators,
//! derives the disk's busy fraction from the idle time the dispatcher
//! recorded, steps the throttle state machine, and rewrites the per-class
//! budget table plus each flow's `max_tp` rate limit.

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info};

use crate::disk::DiskCtx;
use crate::types::{Priority, PRIO_CLASSES};

/// Hysteresis over the per-interval busy sample.
///
/// Throttling engages only after two consecutive busy intervals and
/// releases only after two consecutive non-busy intervals. A load
/// hovering at the threshold therefore cannot flip the decision every
/// interval, which would show up as latency jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ThrottleState {
    /// Not throttling; last interval was not busy.
    Stable,
    /// Not throttling; one busy interval seen.
    PendingThrottle,
    /// Throttling; last interval was busy.
    Throttled,
    /// Throttling; one non-busy interval seen.
    PendingRelax,
}

impl ThrottleState {
    /// Advances the state machine with one interval's busy sample.
    pub fn step(self, busy: bool) -> ThrottleState {
        match (self, busy) {
            (ThrottleState::Stable, true) => ThrottleState::PendingThrottle,
            (ThrottleState::Stable, false) => ThrottleState::Stable,
            (ThrottleState::PendingThrottle, true) => ThrottleState::Throttled,
            (ThrottleState::PendingThrottle, false) => ThrottleState::Stable,
            (ThrottleState::Throttled, true) => ThrottleState::Throttled,
            (ThrottleState::Throttled, false) => ThrottleState::PendingRelax,
            (ThrottleState::PendingRelax, true) => ThrottleState::Throttled,
            (ThrottleState::PendingRelax, false) => ThrottleState::Stable,
        }
    }

    /// Whether budgets and `max_tp` are enforced in this state.
    #[inline]
    pub fn is_throttling(self) -> bool {
        matches!(self, ThrottleState::Throttled | ThrottleState::PendingRelax)
    }
}

/// Runs one balancer interval for `disk`.
///
/// Normally driven by the balancer task; exposed so tests and embedders
/// can step intervals deterministically.
pub fn rebalance(disk: &DiskCtx, now: Instant) {
    let mut inner = disk.lock();

    // Freeze per-flow accumulators and count active flows per class.
    let mut active = [0i64; PRIO_CLASSES];
    for flow in &inner.members {
        flow.snapshot_interval();
        active[flow.priority().as_index()] += 1;
    }

    // Busy fraction of the interval just ended. An open idle period is
    // folded in and restarted so it spans intervals correctly.
    if inner.idle {
        if let Some(start) = inner.start_idle {
            inner.idle_time += now.saturating_duration_since(start);
            inner.start_idle = Some(now);
        }
    }
    let interval = now
        .saturating_duration_since(inner.interval_started)
        .as_secs_f64()
        .max(1e-9);
    let idle = inner.idle_time.as_secs_f64().min(interval);
    let busy_frac = 1.0 - idle / interval;
    inner.idle_time = Duration::ZERO;
    inner.interval_started = now;

    let cfg = disk.cfg();
    let busy = busy_frac > cfg.busy_threshold;
    let prev = inner.throttle;
    inner.throttle = prev.step(busy);
    let throttling = inner.throttle.is_throttling();
    let throttling_changed = prev.is_throttling() != throttling;
    if throttling_changed {
        info!(
            disk = %disk.disk(),
            busy_frac,
            throttling,
            "throttle state changed"
        );
    }

    // Rewrite the budget table: weight-proportional shares of the ceiling
    // across classes with active flows. While throttling, only a fraction
    // of the ceiling is distributed so headroom remains.
    let total_weight: i64 = (0..PRIO_CLASSES)
        .filter(|&i| active[i] > 0)
        .map(|i| Priority::from_index(i).weight())
        .sum();
    let spend = if throttling {
        (cfg.total_budget as f64 * cfg.throttle_factor) as i64
    } else {
        cfg.total_budget
    };
    let mut budgetpb = [0i64; PRIO_CLASSES];
    if total_weight > 0 {
        for i in 0..PRIO_CLASSES {
            if active[i] > 0 {
                budgetpb[i] = spend * Priority::from_index(i).weight() / total_weight;
            }
        }
    }
    let sum: i64 = budgetpb.iter().sum();
    debug_assert!(sum <= cfg.total_budget, "budget table exceeds ceiling");
    if sum > cfg.total_budget {
        // Integer division cannot overshoot, but clamp defensively.
        for b in budgetpb.iter_mut() {
            *b = *b * cfg.total_budget / sum.max(1);
        }
    }
    inner.budgetpb = budgetpb;

    // Derive per-flow rate limits for flagged flows, or all flows when
    // the throttle decision flipped.
    for flow in &inner.members {
        let idx = flow.priority().as_index();
        let mut f = flow.lock();
        if f.rebalance || throttling_changed {
            f.max_tp = if throttling {
                Some((budgetpb[idx] / active[idx].max(1)).max(1) as u32)
            } else {
                None
            };
            f.rebalance = false;
        }
    }

    drop(inner);
    disk.with_stats(|s| s.rebalances += 1);
    debug!(disk = %disk.disk(), busy_frac, throttling, "rebalance");
    disk.notify_dispatch();
}

/// Balancer task: one rebalance per configured interval until shutdown.
pub(crate) async fn run_balancer(disk: Arc<DiskCtx>, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(disk.cfg().interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // The first tick fires immediately; skip it so the first real
    // interval covers a full period.
    ticker.tick().await;

    debug!(disk = %disk.disk(), "balancer started");
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                rebalance(&disk, Instant::now());
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    break;
                }
            }
        }
    }
    debug!(disk = %disk.disk(), "balancer stopped");
}
