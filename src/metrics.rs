//! Per-thread sampling statistics.
//!
//! Counters accumulate in thread-local cells so concurrent samplers never
//! contend on shared state; `snapshot` reads the calling thread's view.

use std::cell::Cell;

thread_local! {
    static ATTEMPTS: Cell<u64> = const { Cell::new(0) };
    static TOMBSTONE_REJECTIONS: Cell<u64> = const { Cell::new(0) };
    static BOUNDS_REJECTIONS: Cell<u64> = const { Cell::new(0) };
    static DELETION_REJECTIONS: Cell<u64> = const { Cell::new(0) };
    static BAILOUTS: Cell<u64> = const { Cell::new(0) };
    static CANCELLATIONS: Cell<u64> = const { Cell::new(0) };
}

/// Snapshot of the calling thread's sampling counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SamplingMetrics {
    /// Candidate records drawn.
    pub attempts: u64,
    /// Candidates rejected for being tombstones.
    pub tombstone_rejections: u64,
    /// Candidates rejected for falling outside the query bounds.
    pub bounds_rejections: u64,
    /// Candidates rejected because a delete shadows them.
    pub deletion_rejections: u64,
    /// Queries that terminated early on a provably or effectively empty range.
    pub bailouts: u64,
    /// Record/tombstone pairs cancelled during run construction.
    pub cancellations: u64,
}

impl SamplingMetrics {
    /// Total rejections across all kinds.
    pub fn rejections(&self) -> u64 {
        self.tombstone_rejections + self.bounds_rejections + self.deletion_rejections
    }
}

fn bump(cell: &'static std::thread::LocalKey<Cell<u64>>) {
    cell.with(|c| c.set(c.get() + 1));
}

pub(crate) fn record_attempt() {
    bump(&ATTEMPTS);
}

pub(crate) fn record_tombstone_rejection() {
    bump(&TOMBSTONE_REJECTIONS);
}

pub(crate) fn record_bounds_rejection() {
    bump(&BOUNDS_REJECTIONS);
}

pub(crate) fn record_deletion_rejection() {
    bump(&DELETION_REJECTIONS);
}

pub(crate) fn record_bailout() {
    bump(&BAILOUTS);
}

pub(crate) fn record_cancellation() {
    bump(&CANCELLATIONS);
}

/// Read the calling thread's counters.
pub fn snapshot() -> SamplingMetrics {
    SamplingMetrics {
        attempts: ATTEMPTS.with(Cell::get),
        tombstone_rejections: TOMBSTONE_REJECTIONS.with(Cell::get),
        bounds_rejections: BOUNDS_REJECTIONS.with(Cell::get),
        deletion_rejections: DELETION_REJECTIONS.with(Cell::get),
        bailouts: BAILOUTS.with(Cell::get),
        cancellations: CANCELLATIONS.with(Cell::get),
    }
}

/// Zero the calling thread's counters.
pub fn reset() {
    ATTEMPTS.with(|c| c.set(0));
    TOMBSTONE_REJECTIONS.with(|c| c.set(0));
    BOUNDS_REJECTIONS.with(|c| c.set(0));
    DELETION_REJECTIONS.with(|c| c.set(0));
    BAILOUTS.with(|c| c.set(0));
    CANCELLATIONS.with(|c| c.set(0));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_accumulate_and_reset() {
        reset();
        record_attempt();
        record_attempt();
        record_tombstone_rejection();
        record_bailout();

        let stats = snapshot();
        assert_eq!(stats.attempts, 2);
        assert_eq!(stats.tombstone_rejections, 1);
        assert_eq!(stats.rejections(), 1);
        assert_eq!(stats.bailouts, 1);

        reset();
        assert_eq!(snapshot(), SamplingMetrics::default());
    }

    #[test]
    fn test_counters_are_thread_local() {
        reset();
        record_attempt();

        let other = std::thread::spawn(|| snapshot().attempts)
            .join()
            .expect("thread failed");
        assert_eq!(other, 0);
        assert_eq!(snapshot().attempts, 1);
    }
}
