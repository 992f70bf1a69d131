//! # Metrics Sink
//!
//! The store reports named timer and counter events through [`MetricsSink`].
//! Reporting is fire-and-forget: sinks must not block and cannot fail.
//!
//! [`CounterMetrics`] keeps totals in memory and is what the store uses when
//! no sink is supplied; [`CounterMetrics::snapshot`] exposes them to tests and
//! health endpoints.

use std::collections::BTreeMap;
use std::time::Duration;

use parking_lot::Mutex;

/// Catchup wall time, per subscription.
pub const CATCHUP_DURATION: &str = "catchup.duration";
/// Transformation served from either cache tier.
pub const TRANSFORMATION_CACHE_HIT: &str = "transformation.cache.hit";
/// Transformation computed by running the chain.
pub const TRANSFORMATION_CACHE_MISS: &str = "transformation.cache.miss";
/// Publish rejected by schema validation.
pub const VALIDATION_FAILED: &str = "validation.failed";
/// Registration rejected because the id is known with another hash.
pub const REGISTRY_CONFLICT: &str = "registry.conflict";
/// Follow re-query executed.
pub const FOLLOW_REQUERY: &str = "follow.requery";

/// Receiver of named metric events.
pub trait MetricsSink: Send + Sync + 'static {
    /// Records a duration.
    fn timer(&self, name: &'static str, elapsed: Duration);

    /// Increments a counter.
    fn count(&self, name: &'static str, delta: u64);
}

/// Sink that drops everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn timer(&self, _name: &'static str, _elapsed: Duration) {}
    fn count(&self, _name: &'static str, _delta: u64) {}
}

/// Totals of one metric.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct MetricTotals {
    /// Number of events (timer samples or counter increments).
    pub count: u64,
    /// Summed durations, zero for pure counters.
    pub total: Duration,
}

/// In-memory sink summing every metric by name.
#[derive(Debug, Default)]
pub struct CounterMetrics {
    totals: Mutex<BTreeMap<&'static str, MetricTotals>>,
}

impl CounterMetrics {
    /// Creates an empty sink.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the count recorded for `name` (0 if never seen).
    pub fn get(&self, name: &str) -> u64 {
        self.totals.lock().get(name).map_or(0, |t| t.count)
    }

    /// Copies all totals.
    pub fn snapshot(&self) -> BTreeMap<&'static str, MetricTotals> {
        self.totals.lock().clone()
    }
}

impl MetricsSink for CounterMetrics {
    fn timer(&self, name: &'static str, elapsed: Duration) {
        let mut totals = self.totals.lock();
        let entry = totals.entry(name).or_default();
        entry.count += 1;
        entry.total += elapsed;
    }

    fn count(&self, name: &'static str, delta: u64) {
        self.totals.lock().entry(name).or_default().count += delta;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counter_metrics_totals() {
        let metrics = CounterMetrics::new();
        metrics.count(TRANSFORMATION_CACHE_HIT, 2);
        metrics.count(TRANSFORMATION_CACHE_HIT, 1);
        metrics.timer(CATCHUP_DURATION, Duration::from_millis(5));
        metrics.timer(CATCHUP_DURATION, Duration::from_millis(7));

        assert_eq!(metrics.get(TRANSFORMATION_CACHE_HIT), 3);
        assert_eq!(metrics.get(REGISTRY_CONFLICT), 0);

        let snapshot = metrics.snapshot();
        assert_eq!(
            snapshot[CATCHUP_DURATION],
            MetricTotals {
                count: 2,
                total: Duration::from_millis(12)
            }
        );
    }
}
