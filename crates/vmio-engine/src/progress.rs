//! Transfer progress
//!
//! Byte counters shared between the planner and the workers. Updates
//! are monotonic in total bytes but not in arrival order, since
//! workers may complete requests out of order.

use std::sync::atomic::{AtomicU64, Ordering};

/// Shared progress counter for one transfer.
#[derive(Debug, Default)]
pub struct Progress {
    size: AtomicU64,
    done: AtomicU64,
}

impl Progress {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the total transfer size.
    pub fn set_size(&self, size: u64) {
        self.size.store(size, Ordering::Relaxed);
    }

    #[must_use]
    pub fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    /// Account `n` transferred (or skipped) bytes.
    pub fn update(&self, n: u64) {
        self.done.fetch_add(n, Ordering::Relaxed);
    }

    #[must_use]
    pub fn done(&self) -> u64 {
        self.done.load(Ordering::Relaxed)
    }
}
