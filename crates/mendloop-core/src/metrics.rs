//! Process-wide atomic counters.
//!
//! Counters are bumped at the call site and reported together by
//! [`Metrics::flush`], normally once at the end of a run.

use std::sync::atomic::{AtomicU64, Ordering};

pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    iterations: AtomicU64,
    patches_applied: AtomicU64,
    patches_rejected: AtomicU64,
    rollbacks: AtomicU64,
    hunks_repaired: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            iterations: AtomicU64::new(0),
            patches_applied: AtomicU64::new(0),
            patches_rejected: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            hunks_repaired: AtomicU64::new(0),
        }
    }

    pub fn inc_iterations(&self) {
        self.iterations.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_patches_applied(&self) {
        self.patches_applied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_patches_rejected(&self) {
        self.patches_rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rollbacks", "counter incremented");
    }

    pub fn add_hunks_repaired(&self, n: u64) {
        self.hunks_repaired.fetch_add(n, Ordering::Relaxed);
    }

    /// Emit all counters as one `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            iterations = self.iterations(),
            patches_applied = self.patches_applied(),
            patches_rejected = self.patches_rejected(),
            rollbacks = self.rollbacks(),
            hunks_repaired = self.hunks_repaired(),
        );
    }

    pub fn iterations(&self) -> u64 {
        self.iterations.load(Ordering::Relaxed)
    }

    pub fn patches_applied(&self) -> u64 {
        self.patches_applied.load(Ordering::Relaxed)
    }

    pub fn patches_rejected(&self) -> u64 {
        self.patches_rejected.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn hunks_repaired(&self) -> u64 {
        self.hunks_repaired.load(Ordering::Relaxed)
    }

    pub fn reset(&self) {
        for counter in [
            &self.iterations,
            &self.patches_applied,
            &self.patches_rejected,
            &self.rollbacks,
            &self.hunks_repaired,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_reset() {
        let m = Metrics::new();
        m.inc_iterations();
        m.inc_iterations();
        m.inc_rollbacks();
        m.add_hunks_repaired(3);
        assert_eq!(m.iterations(), 2);
        assert_eq!(m.rollbacks(), 1);
        assert_eq!(m.hunks_repaired(), 3);
        m.reset();
        assert_eq!(m.iterations(), 0);
        assert_eq!(m.hunks_repaired(), 0);
    }
}
