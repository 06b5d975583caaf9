//! Atomic transaction counters.

use std::sync::atomic::{AtomicU32, Ordering};

/// Concurrent counter for presence replies and approval tallies.
///
/// Increment and reset are atomic so inbound handlers may race without
/// corrupting the tally; transaction boundaries reset it to zero.
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU32,
}

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn value(&self) -> u32 {
        self.value.load(Ordering::SeqCst)
    }

    /// Add one and return the new value.
    pub fn increment(&self) -> u32 {
        self.value.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn reset(&self) {
        self.value.store(0, Ordering::SeqCst);
    }
}
