//! Run monitor for metrics.
//!
//! Counters are updated concurrently by every unit of a run; a [`Metrics`]
//! snapshot is attached to the run outcome.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// Live counters of one run
#[derive(Debug, Default)]
pub struct RunMetrics {
    invocations: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    suppressed: AtomicU64,
    retries: AtomicU64,
    items_emitted: AtomicU64,
    units_completed: AtomicU64,
    units_failed: AtomicU64,
    units_cancelled: AtomicU64,
}

impl RunMetrics {
    /// Create zeroed counters
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a body invocation
    pub fn record_invocation(&self) {
        self.invocations.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a successful invocation
    pub fn record_success(&self) {
        self.successes.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an unrecovered invocation failure
    pub fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a suppressed failure
    pub fn record_suppressed(&self) {
        self.suppressed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a retry
    pub fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an item pushed downstream
    pub fn record_emit(&self) {
        self.items_emitted.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a unit that drained its inputs
    pub fn record_unit_completed(&self) {
        self.units_completed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a unit that failed
    pub fn record_unit_failed(&self) {
        self.units_failed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a unit stopped by cancellation
    pub fn record_unit_cancelled(&self) {
        self.units_cancelled.fetch_add(1, Ordering::Relaxed);
    }

    /// Consistent-enough copy of every counter
    #[must_use]
    pub fn snapshot(&self) -> Metrics {
        Metrics {
            invocations: self.invocations.load(Ordering::Relaxed),
            successes: self.successes.load(Ordering::Relaxed),
            failures: self.failures.load(Ordering::Relaxed),
            suppressed: self.suppressed.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            items_emitted: self.items_emitted.load(Ordering::Relaxed),
            units_completed: self.units_completed.load(Ordering::Relaxed),
            units_failed: self.units_failed.load(Ordering::Relaxed),
            units_cancelled: self.units_cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Execution metrics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metrics {
    /// Body invocations, retries included
    pub invocations: u64,
    /// Invocations that returned normally
    pub successes: u64,
    /// Invocations whose error failed the node
    pub failures: u64,
    /// Invocations whose error was suppressed
    pub suppressed: u64,
    /// Invocations retried by middleware
    pub retries: u64,
    /// Items pushed to output channels
    pub items_emitted: u64,
    /// Units that drained their inputs
    pub units_completed: u64,
    /// Units that failed
    pub units_failed: u64,
    /// Units stopped by cancellation
    pub units_cancelled: u64,
}

impl Metrics {
    /// Get success rate (0.0 - 1.0)
    #[must_use]
    pub fn success_rate(&self) -> f64 {
        if self.invocations == 0 {
            return 1.0;
        }
        self.successes as f64 / self.invocations as f64
    }

    /// Get failure rate (0.0 - 1.0)
    #[must_use]
    pub fn failure_rate(&self) -> f64 {
        if self.invocations == 0 {
            return 0.0;
        }
        self.failures as f64 / self.invocations as f64
    }

    /// Total units that reached a terminal state
    #[must_use]
    pub fn units_finished(&self) -> u64 {
        self.units_completed + self.units_failed + self.units_cancelled
    }
}
