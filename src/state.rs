//! Tracks the live activity of the engine.
//!
//! The drain condition ("everything submitted has fully settled") needs to
//! see work that is not sitting in the scheduler queue: dispatches being
//! executed, items inside pipeline chains, and retries sleeping out their
//! backoff. Each gets an atomic counter here.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Shared activity counters for the engine's tasks.
#[derive(Debug, Default)]
pub struct EngineState {
    /// Dispatches currently being executed by workers.
    pub in_flight_requests: AtomicUsize,
    /// Items currently inside a pipeline chain.
    pub processing_items: AtomicUsize,
    /// Retries sleeping out their backoff before re-submission.
    pub pending_retries: AtomicUsize,
}

impl EngineState {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// True when no dispatch, item chain, or pending retry is active.
    pub fn is_idle(&self) -> bool {
        self.in_flight_requests.load(Ordering::SeqCst) == 0
            && self.processing_items.load(Ordering::SeqCst) == 0
            && self.pending_retries.load(Ordering::SeqCst) == 0
    }
}

/// Increments a counter for a scope, decrementing on drop so early returns
/// and cancellations cannot leak activity.
pub(crate) struct ActivityGuard<'a> {
    counter: &'a AtomicUsize,
}

impl<'a> ActivityGuard<'a> {
    pub(crate) fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        ActivityGuard { counter }
    }
}

impl Drop for ActivityGuard<'_> {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::SeqCst);
    }
}
