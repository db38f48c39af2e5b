//! Policy registry: the administrative surface of the scheduler.
//!
//! Tracks the named policies available, which disks are attached, and
//! which policy each disk currently runs. Switching a disk's policy
//! drains the old instance before the new one is installed, so no
//! request is ever stranded in a torn-down scheduler.

use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use tracing::info;

use crate::device::BlockDevice;
use crate::disk::{DiskConfig, DrainMode};
use crate::error::{SchedError, SchedResult, SubmitError};
use crate::policy::{DiskSched, FqPolicy, NoopPolicy, Policy};
use crate::request::{CompletionTicket, IoRequest};
use crate::stats::SchedStats;
use crate::types::{DiskId, ProcessId};

/// Name of the policy new disks start under.
pub const DEFAULT_POLICY: &str = "noop";

struct Attached {
    device: Arc<dyn BlockDevice>,
    sched: Arc<dyn DiskSched>,
}

/// Registry of policies and scheduled disks.
pub struct Registry {
    policies: Mutex<Vec<Arc<dyn Policy>>>,
    disks: DashMap<DiskId, Attached>,
    cfg: DiskConfig,
}

impl Registry {
    /// Creates a registry with the built-in `noop` and `fq` policies.
    pub fn new(cfg: DiskConfig) -> Self {
        let registry = Self {
            policies: Mutex::new(Vec::new()),
            disks: DashMap::new(),
            cfg,
        };
        registry
            .register(Arc::new(NoopPolicy))
            .expect("fresh registry accepts noop");
        registry
            .register(Arc::new(FqPolicy))
            .expect("fresh registry accepts fq");
        registry
    }

    /// Registers a policy. Fails if the name is already taken.
    pub fn register(&self, policy: Arc<dyn Policy>) -> SchedResult<()> {
        let mut policies = self.policies.lock();
        if policies.iter().any(|p| p.name() == policy.name()) {
            return Err(SchedError::PolicyExists {
                name: policy.name().to_string(),
            });
        }
        policies.push(policy);
        Ok(())
    }

    fn find_policy(&self, name: &str) -> SchedResult<Arc<dyn Policy>> {
        self.policies
            .lock()
            .iter()
            .find(|p| p.name() == name)
            .cloned()
            .ok_or_else(|| SchedError::PolicyNotFound {
                name: name.to_string(),
            })
    }

    /// Names of the registered policies, in registration order.
    pub fn list_policies(&self) -> Vec<String> {
        self.policies
            .lock()
            .iter()
            .map(|p| p.name().to_string())
            .collect()
    }

    /// Attached disks with their current policy names.
    pub fn list_disks(&self) -> Vec<(DiskId, String)> {
        let mut disks: Vec<_> = self
            .disks
            .iter()
            .map(|e| (e.key().clone(), e.value().sched.policy_name().to_string()))
            .collect();
        disks.sort_by(|a, b| a.0.as_str().cmp(b.0.as_str()));
        disks
    }

    /// Places `disk` under the default policy.
    pub fn attach_disk(&self, disk: DiskId, device: Arc<dyn BlockDevice>) -> SchedResult<()> {
        self.attach_disk_with(disk, device, DEFAULT_POLICY)
    }

    /// Places `disk` under the named policy.
    pub fn attach_disk_with(
        &self,
        disk: DiskId,
        device: Arc<dyn BlockDevice>,
        policy: &str,
    ) -> SchedResult<()> {
        let policy = self.find_policy(policy)?;
        if self.disks.contains_key(&disk) {
            return Err(SchedError::DiskExists {
                disk: disk.to_string(),
            });
        }
        let sched = policy.attach(disk.clone(), Arc::clone(&device), &self.cfg);
        info!(disk = %disk, policy = policy.name(), "disk attached");
        self.disks.insert(disk, Attached { device, sched });
        Ok(())
    }

    /// Switches `disk` to the named policy, draining the old instance
    /// first. Switching to the current policy is a no-op.
    pub async fn set_policy(&self, disk: &DiskId, name: &str) -> SchedResult<()> {
        let policy = self.find_policy(name)?;

        let (old, device) = {
            let entry = self.disks.get(disk).ok_or_else(|| SchedError::DiskNotFound {
                disk: disk.to_string(),
            })?;
            if entry.sched.policy_name() == name {
                return Ok(());
            }
            (Arc::clone(&entry.sched), Arc::clone(&entry.device))
        };

        old.drain(DrainMode::Flush).await;

        let sched = policy.attach(disk.clone(), Arc::clone(&device), &self.cfg);
        match self.disks.get_mut(disk) {
            Some(mut entry) => {
                entry.sched = sched;
            }
            None => {
                // Detached while draining; nothing to install.
                return Err(SchedError::DiskNotFound {
                    disk: disk.to_string(),
                });
            }
        }
        info!("disk scheduler: set policy of {} to {}", disk, name);
        Ok(())
    }

    /// Switches every attached disk to the named policy.
    pub async fn set_policy_all(&self, name: &str) -> SchedResult<()> {
        // Resolve once so an unknown name fails before any drain runs.
        self.find_policy(name)?;
        let disks: Vec<DiskId> = self.disks.iter().map(|e| e.key().clone()).collect();
        for disk in disks {
            match self.set_policy(&disk, name).await {
                Ok(()) => {}
                // A disk detached mid-sweep is not an error for the sweep.
                Err(SchedError::DiskNotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Removes `disk`, cancelling queued work and waiting out in-flight
    /// requests.
    pub async fn detach_disk(&self, disk: &DiskId) -> SchedResult<()> {
        let (_, attached) = self
            .disks
            .remove(disk)
            .ok_or_else(|| SchedError::DiskNotFound {
                disk: disk.to_string(),
            })?;
        attached.sched.drain(DrainMode::Cancel).await;
        info!(disk = %disk, "disk detached");
        Ok(())
    }

    /// Routes one request to the disk's current scheduler.
    pub fn submit(
        &self,
        disk: &DiskId,
        owner: ProcessId,
        nice: i32,
        request: IoRequest,
    ) -> Result<CompletionTicket, SubmitError> {
        let entry = self.disks.get(disk).ok_or_else(|| SubmitError::DiskNotFound {
            disk: disk.to_string(),
        })?;
        entry.sched.submit(owner, nice, request)
    }

    /// Routes a process-exit cancellation to the disk's scheduler.
    pub fn cancel_all(&self, disk: &DiskId, owner: ProcessId) -> SchedResult<()> {
        let entry = self.disks.get(disk).ok_or_else(|| SchedError::DiskNotFound {
            disk: disk.to_string(),
        })?;
        entry.sched.cancel_all(owner);
        Ok(())
    }

    /// Counters for one disk's current scheduler instance.
    pub fn stats(&self, disk: &DiskId) -> SchedResult<SchedStats> {
        let entry = self.disks.get(disk).ok_or_else(|| SchedError::DiskNotFound {
            disk: disk.to_string(),
        })?;
        Ok(entry.sched.stats())
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(DiskConfig::default())
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("policies", &self.list_policies())
            .field("disks", &self.list_disks())
            .finish()
    }
}
