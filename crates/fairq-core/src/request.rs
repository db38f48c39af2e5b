//! I/O request model and the per-flow FIFO queue.
//!
//! A request is immutable once submitted, except for the scheduler-private
//! `issued` flag. Ownership of the request returns to the issuer on
//! completion or cancellation, carried by a [`CompletionTicket`].

use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use crate::error::{SchedError, SchedResult};
use crate::types::{IoDirection, RequestId};

/// One I/O operation handed to the scheduler.
#[derive(Debug, Clone)]
pub struct IoRequest {
    /// Unique request identifier.
    pub id: RequestId,
    /// Read or write.
    pub dir: IoDirection,
    /// Transfer size in bytes.
    pub bytes: u64,
    /// Opaque handle to the caller's payload (buffer, bio, ...).
    pub payload: u64,
    submitted_at: Instant,
    issued: bool,
}

impl IoRequest {
    /// Creates a new request stamped with the current time.
    pub fn new(id: RequestId, dir: IoDirection, bytes: u64, payload: u64) -> Self {
        Self {
            id,
            dir,
            bytes,
            payload,
            submitted_at: Instant::now(),
            issued: false,
        }
    }

    /// When the request entered the scheduler.
    #[inline]
    pub fn submitted_at(&self) -> Instant {
        self.submitted_at
    }

    /// Whether the request has been handed to the device.
    #[inline]
    pub fn is_issued(&self) -> bool {
        self.issued
    }

    pub(crate) fn mark_issued(&mut self) {
        self.issued = true;
    }
}

/// Terminal status of a request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoStatus {
    /// The device completed the request successfully.
    Ok,
    /// The device reported an error; the text passes through verbatim.
    Error(String),
    /// The request was cancelled before it was issued.
    Cancelled,
}

impl IoStatus {
    /// True for a successful completion.
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, IoStatus::Ok)
    }
}

impl fmt::Display for IoStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoStatus::Ok => write!(f, "ok"),
            IoStatus::Error(e) => write!(f, "error: {}", e),
            IoStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// A finished request, returned to its issuer.
#[derive(Debug)]
pub struct CompletedIo {
    /// The request, ownership back with the caller.
    pub request: IoRequest,
    /// Terminal status.
    pub status: IoStatus,
    /// Time from submission to completion.
    pub latency: Duration,
}

/// Receives the terminal status of one submitted request.
///
/// Admission errors are synchronous on `submit`; everything after
/// admission, including cancellation, arrives here exactly once.
#[derive(Debug)]
pub struct CompletionTicket {
    rx: oneshot::Receiver<CompletedIo>,
}

impl CompletionTicket {
    pub(crate) fn new(rx: oneshot::Receiver<CompletedIo>) -> Self {
        Self { rx }
    }

    /// Waits for the terminal status.
    pub async fn wait(self) -> SchedResult<CompletedIo> {
        self.rx.await.map_err(|_| SchedError::CompletionLost)
    }

    /// Non-blocking poll; returns the completion if it already arrived.
    pub fn try_wait(&mut self) -> Option<CompletedIo> {
        self.rx.try_recv().ok()
    }
}

/// A queued request together with its reply channel.
#[derive(Debug)]
pub struct PendingIo {
    /// The queued request.
    pub request: IoRequest,
    /// Channel delivering the terminal status to the issuer.
    pub reply: oneshot::Sender<CompletedIo>,
}

/// FIFO queue of pending requests for one flow.
///
/// No reordering happens within a queue; cross-flow fairness is the
/// dispatcher's job, not this queue's.
#[derive(Debug, Default)]
pub struct RequestQueue {
    items: VecDeque<PendingIo>,
}

impl RequestQueue {
    /// Creates an empty queue.
    pub fn new() -> Self {
        Self {
            items: VecDeque::new(),
        }
    }

    /// Appends a request; O(1).
    pub fn enqueue(&mut self, pending: PendingIo) {
        self.items.push_back(pending);
    }

    /// Removes and returns the oldest request, if any.
    pub fn dequeue(&mut self) -> Option<PendingIo> {
        self.items.pop_front()
    }

    /// Removes and returns up to `n` leading requests.
    pub fn dequeue_up_to(&mut self, n: usize) -> Vec<PendingIo> {
        let k = n.min(self.items.len());
        self.items.drain(..k).collect()
    }

    /// Removes and returns everything still queued.
    pub fn drain_all(&mut self) -> Vec<PendingIo> {
        self.items.drain(..).collect()
    }

    /// True when nothing is queued; O(1).
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of queued requests.
    #[inline]
    pub fn len(&self) -> usize {
        self.items.len()
    }
}
