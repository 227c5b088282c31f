//! Global atomic counters for controller observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. on shutdown or a monitor tick).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

pub struct Metrics {
    deployments_requested: AtomicU64,
    conflicts: AtomicU64,
    promotions: AtomicU64,
    rollbacks: AtomicU64,
    build_failures: AtomicU64,
    events_appended: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            deployments_requested: AtomicU64::new(0),
            conflicts: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            rollbacks: AtomicU64::new(0),
            build_failures: AtomicU64::new(0),
            events_appended: AtomicU64::new(0),
        }
    }

    pub fn inc_deployments_requested(&self) {
        self.deployments_requested.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "deployments_requested", "counter incremented");
    }

    pub fn inc_conflicts(&self) {
        self.conflicts.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "conflicts", "counter incremented");
    }

    pub fn inc_promotions(&self) {
        self.promotions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "promotions", "counter incremented");
    }

    pub fn inc_rollbacks(&self) {
        self.rollbacks.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "rollbacks", "counter incremented");
    }

    pub fn inc_build_failures(&self) {
        self.build_failures.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "build_failures", "counter incremented");
    }

    pub fn inc_events_appended(&self) {
        self.events_appended.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            deployments_requested = self.deployments_requested(),
            conflicts = self.conflicts(),
            promotions = self.promotions(),
            rollbacks = self.rollbacks(),
            build_failures = self.build_failures(),
            events_appended = self.events_appended(),
        );
    }

    pub fn deployments_requested(&self) -> u64 {
        self.deployments_requested.load(Ordering::Relaxed)
    }

    pub fn conflicts(&self) -> u64 {
        self.conflicts.load(Ordering::Relaxed)
    }

    pub fn promotions(&self) -> u64 {
        self.promotions.load(Ordering::Relaxed)
    }

    pub fn rollbacks(&self) -> u64 {
        self.rollbacks.load(Ordering::Relaxed)
    }

    pub fn build_failures(&self) -> u64 {
        self.build_failures.load(Ordering::Relaxed)
    }

    pub fn events_appended(&self) -> u64 {
        self.events_appended.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.deployments_requested.store(0, Ordering::Relaxed);
        self.conflicts.store(0, Ordering::Relaxed);
        self.promotions.store(0, Ordering::Relaxed);
        self.rollbacks.store(0, Ordering::Relaxed);
        self.build_failures.store(0, Ordering::Relaxed);
        self.events_appended.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment() {
        let m = Metrics::new();
        m.inc_deployments_requested();
        m.inc_deployments_requested();
        m.inc_conflicts();
        m.inc_rollbacks();
        assert_eq!(m.deployments_requested(), 2);
        assert_eq!(m.conflicts(), 1);
        assert_eq!(m.rollbacks(), 1);
        assert_eq!(m.promotions(), 0);
    }

    #[test]
    fn reset_zeroes_all() {
        let m = Metrics::new();
        m.inc_promotions();
        m.inc_build_failures();
        m.inc_events_appended();
        m.reset();
        assert_eq!(m.promotions(), 0);
        assert_eq!(m.build_failures(), 0);
        assert_eq!(m.events_appended(), 0);
    }
}
