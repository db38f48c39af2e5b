//! Core identifier and priority types shared across the scheduler.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Lowest (idle) priority class.
pub const PRIO_IDLE: i8 = -1;
/// Highest priority class.
pub const PRIO_MAX: i8 = 10;
/// Number of priority classes (`PRIO_IDLE..=PRIO_MAX`).
pub const PRIO_CLASSES: usize = (PRIO_MAX - PRIO_IDLE) as usize + 1;

/// Identifies one disk under scheduling (e.g. "nvme0").
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DiskId(String);

impl DiskId {
    /// Creates a disk identifier from a device name.
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    /// Returns the device name.
    #[inline]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DiskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DiskId {
    fn from(name: &str) -> Self {
        Self::new(name)
    }
}

/// Identifies the process owning a flow of I/O requests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProcessId(pub u64);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid{}", self.0)
    }
}

/// Unique identifier for one I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RequestId(pub u64);

/// Atomic counter for generating unique request IDs.
#[derive(Debug)]
pub struct RequestIdGen {
    next: AtomicU64,
}

impl RequestIdGen {
    /// Create a new ID generator starting from 1.
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }

    /// Generate the next unique request ID.
    pub fn next_id(&self) -> RequestId {
        RequestId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for RequestIdGen {
    fn default() -> Self {
        Self::new()
    }
}

/// Direction of an I/O request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum IoDirection {
    /// Read data from the disk.
    Read,
    /// Write data to the disk.
    Write,
}

impl fmt::Display for IoDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IoDirection::Read => write!(f, "read"),
            IoDirection::Write => write!(f, "write"),
        }
    }
}

/// Priority class of a flow, in `PRIO_IDLE..=PRIO_MAX`.
///
/// Derived from the owning process's nice value with a +5 bias, so a
/// nice-0 process lands in the middle class and only strongly-niced
/// processes fall to the idle class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Priority(i8);

impl Priority {
    /// The idle class.
    pub const IDLE: Priority = Priority(PRIO_IDLE);
    /// The highest class.
    pub const MAX: Priority = Priority(PRIO_MAX);

    /// Creates a priority, clamping into the valid range.
    pub fn new(raw: i8) -> Self {
        Self(raw.clamp(PRIO_IDLE, PRIO_MAX))
    }

    /// Derives the priority class from a process nice value.
    ///
    /// Nice 0 maps to class 5; nice -20 to class 10; nice 11 and above
    /// fall into the idle class.
    pub fn from_nice(nice: i32) -> Self {
        let biased = 5 - nice / 2;
        Self::new(biased.clamp(PRIO_IDLE as i32, PRIO_MAX as i32) as i8)
    }

    /// Raw class value in `PRIO_IDLE..=PRIO_MAX`.
    #[inline]
    pub fn value(self) -> i8 {
        self.0
    }

    /// Index into per-class tables (`0..PRIO_CLASSES`).
    #[inline]
    pub fn as_index(self) -> usize {
        (self.0 - PRIO_IDLE) as usize
    }

    /// Reconstructs a priority from a table index.
    pub fn from_index(index: usize) -> Self {
        Self::new(index as i8 + PRIO_IDLE)
    }

    /// Proportional weight used when splitting the disk budget across
    /// classes. Strictly positive, so the idle class still advances.
    #[inline]
    pub fn weight(self) -> i64 {
        (self.0 as i64) + 2
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 == PRIO_IDLE {
            write!(f, "idle")
        } else {
            write!(f, "prio{}", self.0)
        }
    }
}
