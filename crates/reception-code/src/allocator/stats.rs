use portable_atomic::{AtomicU64, Ordering};

/// Lock-free counters describing how allocations went.
///
/// Shared by reference (usually through an `Arc`) between an allocator and
/// whatever reports metrics.
#[derive(Debug, Default)]
pub struct AllocationStats {
    attempts: AtomicU64,
    retries: AtomicU64,
    conflicts: AtomicU64,
    allocations: AtomicU64,
}

/// A point-in-time copy of [`AllocationStats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct StatsSnapshot {
    /// Transactions started by the retry loop.
    pub attempts: u64,
    /// Attempts that failed retryably and were followed by another attempt.
    pub retries: u64,
    /// Allocations that ran out of attempts.
    pub conflicts: u64,
    /// Allocations that committed.
    pub allocations: u64,
}

impl AllocationStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_attempt(&self) {
        self.attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_retry(&self) {
        self.retries.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_conflict(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_allocation(&self) {
        self.allocations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            attempts: self.attempts.load(Ordering::Relaxed),
            retries: self.retries.load(Ordering::Relaxed),
            conflicts: self.conflicts.load(Ordering::Relaxed),
            allocations: self.allocations.load(Ordering::Relaxed),
        }
    }
}

impl StatsSnapshot {
    /// Counter increments since `earlier`.
    pub const fn since(&self, earlier: &Self) -> Self {
        Self {
            attempts: self.attempts.saturating_sub(earlier.attempts),
            retries: self.retries.saturating_sub(earlier.retries),
            conflicts: self.conflicts.saturating_sub(earlier.conflicts),
            allocations: self.allocations.saturating_sub(earlier.allocations),
        }
    }
}
