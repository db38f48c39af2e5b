//! Device-layer boundary.
//!
//! The scheduler hands issued requests to a [`BlockDevice`] and gets them
//! back through the [`CompletionPort`]. The handoff must not block the
//! dispatcher; a device that cannot accept a request returns it in the
//! error so the dispatcher can fail it synchronously.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::completion::{CompletionPort, IssuedIo};
use crate::error::DeviceError;

/// A failed handoff; the device returns the I/O so the caller can
/// complete it with an error status.
#[derive(Debug)]
pub struct SubmitFailure {
    /// The rejected I/O, ownership back with the caller.
    pub io: IssuedIo,
    /// Why the device refused it.
    pub error: DeviceError,
}

/// Driver-facing queue abstraction below the scheduler.
///
/// `submit` is a non-blocking handoff: the device takes ownership of the
/// I/O and must later call `port.complete` with a terminal status exactly
/// once, from any thread.
pub trait BlockDevice: Send + Sync + 'static {
    /// Accepts one issued request for asynchronous execution.
    fn submit(&self, io: IssuedIo, port: CompletionPort) -> Result<(), SubmitFailure>;
}

/// Configuration for the in-memory device.
#[derive(Debug, Clone)]
pub struct MemDeviceConfig {
    /// Simulated service time per request.
    pub latency: Duration,
    /// Complete every Nth request with an injected error.
    pub fail_every: Option<u64>,
    /// Refuse every Nth handoff at submission time.
    pub reject_every: Option<u64>,
}

impl Default for MemDeviceConfig {
    fn default() -> Self {
        Self {
            latency: Duration::ZERO,
            fail_every: None,
            reject_every: None,
        }
    }
}

/// In-memory device executing requests on a spawned task.
///
/// Must be used inside a Tokio runtime. Intended for tests and the demo
/// path; a real deployment implements [`BlockDevice`] over an actual
/// driver queue.
#[derive(Debug)]
pub struct MemDevice {
    cfg: MemDeviceConfig,
    submitted: AtomicU64,
}

impl MemDevice {
    /// Creates a device with the given behavior.
    pub fn new(cfg: MemDeviceConfig) -> Arc<Self> {
        Arc::new(Self {
            cfg,
            submitted: AtomicU64::new(0),
        })
    }

    /// Creates a device that completes instantly and never fails.
    pub fn instant() -> Arc<Self> {
        Self::new(MemDeviceConfig::default())
    }

    /// Number of requests accepted so far.
    pub fn submitted(&self) -> u64 {
        self.submitted.load(Ordering::SeqCst)
    }
}

impl BlockDevice for MemDevice {
    fn submit(&self, io: IssuedIo, port: CompletionPort) -> Result<(), SubmitFailure> {
        let seq = self.submitted.fetch_add(1, Ordering::SeqCst) + 1;

        if let Some(n) = self.cfg.reject_every {
            if n > 0 && seq % n == 0 {
                return Err(SubmitFailure {
                    io,
                    error: DeviceError::Rejected(format!("injected rejection of request {}", seq)),
                });
            }
        }

        let latency = self.cfg.latency;
        let fail = match self.cfg.fail_every {
            Some(n) if n > 0 => seq % n == 0,
            _ => false,
        };

        tokio::spawn(async move {
            if latency > Duration::ZERO {
                tokio::time::sleep(latency).await;
            }
            let status = if fail {
                crate::request::IoStatus::Error("injected device failure".to_string())
            } else {
                crate::request::IoStatus::Ok
            };
            port.complete(io, status);
        });

        Ok(())
    }
}
