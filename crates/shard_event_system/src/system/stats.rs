/// Dispatch statistics
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Point-in-time view of the dispatcher counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventSystemStats {
    /// Every `fire` call
    pub events_fired: u64,
    /// Fires that found no handlers and completed immediately
    pub events_without_handlers: u64,
    /// Dispatches where every handler ran
    pub dispatches_completed: u64,
    /// Dispatches aborted by a handler error or panic
    pub dispatch_failures: u64,
    /// Individual handler invocations that returned successfully
    pub handlers_invoked: u64,
    /// Handlers registered at the time of the snapshot
    pub total_handlers: usize,
}

#[derive(Debug, Default)]
pub(crate) struct StatsCounters {
    fired: AtomicU64,
    fast_path: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    invoked: AtomicU64,
}

impl StatsCounters {
    pub(crate) fn record_fire(&self) {
        self.fired.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_fast_path(&self) {
        self.fast_path.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_invocation(&self) {
        self.invoked.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_outcome(&self, success: bool) {
        let counter = if success { &self.completed } else { &self.failed };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self, total_handlers: usize) -> EventSystemStats {
        EventSystemStats {
            events_fired: self.fired.load(Ordering::Relaxed),
            events_without_handlers: self.fast_path.load(Ordering::Relaxed),
            dispatches_completed: self.completed.load(Ordering::Relaxed),
            dispatch_failures: self.failed.load(Ordering::Relaxed),
            handlers_invoked: self.invoked.load(Ordering::Relaxed),
            total_handlers,
        }
    }
}
