//! Error types for the fair-queuing scheduler.

use thiserror::Error;

/// Result type alias for scheduler operations.
pub type SchedResult<T> = Result<T, SchedError>;

/// Error variants for registry and lifecycle operations.
#[derive(Debug, Error)]
pub enum SchedError {
    /// No policy with the given name is registered.
    #[error("policy not found: {name}")]
    PolicyNotFound {
        /// The policy name that was looked up.
        name: String,
    },

    /// The disk is not attached to the registry.
    #[error("disk not found: {disk}")]
    DiskNotFound {
        /// The disk that was looked up.
        disk: String,
    },

    /// A policy with the same name is already registered.
    #[error("policy already registered: {name}")]
    PolicyExists {
        /// The conflicting policy name.
        name: String,
    },

    /// The disk is already attached to the registry.
    #[error("disk already attached: {disk}")]
    DiskExists {
        /// The conflicting disk.
        disk: String,
    },

    /// The completion channel closed before a terminal status arrived.
    #[error("completion lost: channel closed before a status arrived")]
    CompletionLost,
}

/// Error variants surfaced synchronously by `submit`.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// The per-disk flow table is full; the request was not admitted.
    #[error("out of memory: flow table full for {disk}")]
    OutOfMemory {
        /// The disk whose flow table is exhausted.
        disk: String,
    },

    /// The disk is draining and no longer admits new requests.
    #[error("disk {disk} is draining")]
    Draining {
        /// The draining disk.
        disk: String,
    },

    /// The disk is not attached to the registry.
    #[error("disk not found: {disk}")]
    DiskNotFound {
        /// The disk that was looked up.
        disk: String,
    },
}

/// Device-layer error, passed through opaquely to the issuer.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device is gone or cannot accept work.
    #[error("device unavailable: {0}")]
    Unavailable(String),

    /// The device rejected this particular request.
    #[error("device rejected request: {0}")]
    Rejected(String),
}
