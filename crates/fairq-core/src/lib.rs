#![warn(missing_docs)]

//! fairq scheduling core: per-disk, per-process fair-queuing I/O admission
//!
//! This crate sits between a block-I/O layer and the device drivers and
//! divides disk throughput fairly across the processes hammering the same
//! disk. Each scheduled disk gets a dispatcher task that releases queued
//! requests in priority order with round-robin fairness inside a class,
//! and a balancer task that once per interval re-derives per-class
//! budgets from the observed busyness, with hysteresis so the throttle
//! decision cannot oscillate. Requests are admitted through a policy
//! registry that also backs the administrative CLI.

pub mod balance;
pub mod completion;
pub mod device;
pub mod disk;
pub mod dispatch;
pub mod error;
pub mod flow;
pub mod fq;
pub mod policy;
pub mod registry;
pub mod request;
pub mod stats;
pub mod types;

pub use balance::{rebalance, ThrottleState};
pub use completion::{CompletionPort, IssuedIo};
pub use device::{BlockDevice, MemDevice, MemDeviceConfig, SubmitFailure};
pub use disk::{DiskConfig, DiskCtx, DrainMode, DrainPhase};
pub use dispatch::dispatch_pass;
pub use error::{DeviceError, SchedError, SchedResult, SubmitError};
pub use flow::{FlowSnapshot, IoFlow};
pub use fq::FqSched;
pub use policy::{DiskSched, FqPolicy, NoopPolicy, NoopSched, Policy};
pub use registry::{Registry, DEFAULT_POLICY};
pub use request::{
    CompletedIo, CompletionTicket, IoRequest, IoStatus, PendingIo, RequestQueue,
};
pub use stats::SchedStats;
pub use types::{
    DiskId, IoDirection, Priority, ProcessId, RequestId, RequestIdGen, PRIO_CLASSES, PRIO_IDLE,
    PRIO_MAX,
};
