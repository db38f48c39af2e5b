#![warn(missing_docs)]

//! fairq administrative CLI: list disks, list policies, switch policies.

pub mod cli;
pub mod config;

pub use cli::{build_registry, exit_code, Cli, Command};
pub use config::{CtlConfig, DiskEntry, SchedulerSection};
