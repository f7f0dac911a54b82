//! Write tracking
//!
//! The functions subsystem does not persist anything itself; it only tells
//! the persistence/replication side that state changed.

use std::sync::atomic::{AtomicU64, Ordering};

/// Receives a notification for every mutation of function state.
pub trait WriteTracker: Send + Sync {
    /// Record one change
    fn mark_dirty(&self);
}

/// Monotonic change counter, the default [`WriteTracker`].
#[derive(Debug, Default)]
pub struct DirtyCounter {
    dirty: AtomicU64,
}

impl DirtyCounter {
    /// Create a counter starting at zero
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of changes recorded so far
    pub fn get(&self) -> u64 {
        self.dirty.load(Ordering::Relaxed)
    }
}

impl WriteTracker for DirtyCounter {
    fn mark_dirty(&self) {
        self.dirty.fetch_add(1, Ordering::Relaxed);
    }
}
