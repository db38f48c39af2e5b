//! TOML configuration for the control CLI.
//!
//! The kernel-side ioctl plumbing is out of scope here; `fairqctl`
//! drives an in-process registry seeded from a disk table like:
//!
//! ```toml
//! default_policy = "fq"
//!
//! [[disks]]
//! name = "nvme0"
//! latency_us = 150
//!
//! [[disks]]
//! name = "nvme1"
//! policy = "noop"
//! ```

use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use fairq_core::{DiskConfig, DEFAULT_POLICY};

/// One disk entry in the config file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiskEntry {
    /// Device name, e.g. "nvme0".
    pub name: String,
    /// Simulated per-request service time in microseconds.
    #[serde(default)]
    pub latency_us: u64,
    /// Policy to attach at startup; falls back to `default_policy`.
    #[serde(default)]
    pub policy: Option<String>,
}

/// Scheduler tuning shared by every disk the CLI attaches.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerSection {
    /// Balancer interval in milliseconds.
    pub interval_ms: u64,
    /// Per-interval budget ceiling in request units.
    pub total_budget: i64,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        let cfg = DiskConfig::default();
        Self {
            interval_ms: cfg.interval.as_millis() as u64,
            total_budget: cfg.total_budget,
        }
    }
}

/// Root of the CLI configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CtlConfig {
    /// Policy used when a disk entry names none.
    #[serde(default = "default_policy_name")]
    pub default_policy: String,
    /// Disks to attach.
    #[serde(default)]
    pub disks: Vec<DiskEntry>,
    /// Scheduler tuning.
    #[serde(default)]
    pub scheduler: SchedulerSection,
}

fn default_policy_name() -> String {
    DEFAULT_POLICY.to_string()
}

impl Default for CtlConfig {
    fn default() -> Self {
        Self {
            default_policy: default_policy_name(),
            disks: Vec::new(),
            scheduler: SchedulerSection::default(),
        }
    }
}

impl CtlConfig {
    /// Loads the configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading config {}", path.display()))?;
        let config: CtlConfig =
            toml::from_str(&raw).with_context(|| format!("parsing config {}", path.display()))?;
        Ok(config)
    }

    /// The disk tuning derived from the `[scheduler]` section.
    pub fn disk_config(&self) -> DiskConfig {
        DiskConfig {
            interval: Duration::from_millis(self.scheduler.interval_ms),
            total_budget: self.scheduler.total_budget,
            ..DiskConfig::default()
        }
    }
}
