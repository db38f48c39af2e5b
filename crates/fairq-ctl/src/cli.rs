//! Command-line interface for the fairq control tool.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use fairq_core::{
    DiskId, MemDevice, MemDeviceConfig, Registry, SchedError, SchedResult,
};

use crate::config::CtlConfig;

/// Exit code for success.
pub const EXIT_OK: u8 = 0;
/// Exit code for any other failure (config, I/O, registry).
pub const EXIT_FAILURE: u8 = 1;
/// Exit code when the named policy does not exist.
pub const EXIT_POLICY_NOT_FOUND: u8 = 2;
/// Exit code when the named disk does not exist.
pub const EXIT_DISK_NOT_FOUND: u8 = 3;

/// fairq disk scheduler control.
#[derive(Parser)]
#[command(name = "fairqctl")]
#[command(about = "fairq disk scheduler control", long_about = None)]
pub struct Cli {
    /// Disk table and scheduler tuning.
    #[arg(short, long, default_value = "/etc/fairq/disks.toml")]
    pub config: PathBuf,

    /// Subcommand to run.
    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand)]
pub enum Command {
    /// List disks currently under a scheduling policy.
    Disks,
    /// List available policy names.
    Policies,
    /// Set the scheduling policy for one disk or all disks.
    Set {
        /// Policy name to install.
        policy: String,
        /// Disk to switch.
        #[arg(long, conflicts_with = "all")]
        disk: Option<String>,
        /// Switch every attached disk.
        #[arg(long)]
        all: bool,
    },
    /// Show scheduler counters for one disk.
    Stats {
        /// Disk to inspect.
        disk: String,
    },
}

/// Maps a registry error onto the documented exit codes.
pub fn exit_code(err: &SchedError) -> u8 {
    match err {
        SchedError::PolicyNotFound { .. } => EXIT_POLICY_NOT_FOUND,
        SchedError::DiskNotFound { .. } => EXIT_DISK_NOT_FOUND,
        _ => EXIT_FAILURE,
    }
}

impl Cli {
    /// Runs the selected subcommand; returns the process exit code.
    pub async fn run(self) -> u8 {
        let config = if self.config.exists() {
            match CtlConfig::from_file(&self.config) {
                Ok(c) => c,
                Err(e) => {
                    eprintln!("fairqctl: {:#}", e);
                    return EXIT_FAILURE;
                }
            }
        } else {
            tracing::warn!(
                "config not found, using defaults: {}",
                self.config.display()
            );
            CtlConfig::default()
        };

        let registry = match build_registry(&config) {
            Ok(r) => r,
            Err(e) => {
                eprintln!("fairqctl: {}", e);
                return exit_code(&e);
            }
        };

        match self.command {
            Command::Disks => {
                for (disk, policy) in registry.list_disks() {
                    println!("{}\t{}", disk, policy);
                }
                EXIT_OK
            }
            Command::Policies => {
                println!("{}", registry.list_policies().join(" "));
                EXIT_OK
            }
            Command::Set { policy, disk, all } => {
                let result = if all {
                    registry.set_policy_all(&policy).await
                } else {
                    match disk {
                        Some(name) => registry.set_policy(&DiskId::new(name), &policy).await,
                        None => {
                            eprintln!("fairqctl: set requires --disk <name> or --all");
                            return EXIT_FAILURE;
                        }
                    }
                };
                match result {
                    Ok(()) => EXIT_OK,
                    Err(e) => {
                        eprintln!("fairqctl: {}", e);
                        exit_code(&e)
                    }
                }
            }
            Command::Stats { disk } => match registry.stats(&DiskId::new(disk)) {
                Ok(stats) => {
                    match serde_json::to_string_pretty(&stats) {
                        Ok(json) => println!("{}", json),
                        Err(e) => {
                            eprintln!("fairqctl: {}", e);
                            return EXIT_FAILURE;
                        }
                    }
                    EXIT_OK
                }
                Err(e) => {
                    eprintln!("fairqctl: {}", e);
                    exit_code(&e)
                }
            },
        }
    }
}

/// Builds the in-process registry from the config's disk table.
pub fn build_registry(config: &CtlConfig) -> SchedResult<Arc<Registry>> {
    let registry = Arc::new(Registry::new(config.disk_config()));
    for entry in &config.disks {
        let device = MemDevice::new(MemDeviceConfig {
            latency: Duration::from_micros(entry.latency_us),
            ..Default::default()
        });
        let policy = entry.policy.as_deref().unwrap_or(&config.default_policy);
        registry.attach_disk_with(DiskId::new(entry.name.clone()), device, policy)?;
    }
    Ok(registry)
}
