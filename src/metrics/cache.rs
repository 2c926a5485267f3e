//! Instance Cache Metrics
//!
//! Counters for the checkout protocol, the LRU pass and the passivation store.

use super::ratio;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by an [`InstanceCache`](crate::InstanceCache).
#[derive(Debug, Default)]
pub struct InstanceCacheMetrics {
    adds: AtomicU64,
    checkouts: AtomicU64,
    checkins: AtomicU64,
    misses: AtomicU64,
    activations: AtomicU64,
    load_failures: AtomicU64,
    removals: AtomicU64,
    passivations: AtomicU64,
    passivation_failures: AtomicU64,
    vetoes: AtomicU64,
    timeouts: AtomicU64,
}

impl InstanceCacheMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn record_add(&self) {
        self.adds.fetch_add(1, Ordering::Relaxed);
    }

    /// A checkout served from memory.
    pub(crate) fn record_checkout(&self) {
        self.checkouts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_checkin(&self) {
        self.checkins.fetch_add(1, Ordering::Relaxed);
    }

    /// A checkout that found nothing in memory or in the store.
    pub(crate) fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    /// A checkout served by activating a passivated value.
    pub(crate) fn record_activation(&self) {
        self.activations.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_load_failure(&self) {
        self.load_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_removal(&self) {
        self.removals.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_passivations(&self, count: usize) {
        self.passivations.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn record_passivation_failure(&self) {
        self.passivation_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_veto(&self) {
        self.vetoes.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn record_timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    /// Number of values passivated so far.
    pub fn passivations(&self) -> u64 {
        self.passivations.load(Ordering::Relaxed)
    }

    /// Number of values activated from the store so far.
    pub fn activations(&self) -> u64 {
        self.activations.load(Ordering::Relaxed)
    }

    /// Number of entries discarded for idleness so far.
    pub fn timeouts(&self) -> u64 {
        self.timeouts.load(Ordering::Relaxed)
    }

    /// Fraction of successful checkouts that did not need an activation.
    pub fn memory_hit_rate(&self) -> f64 {
        let checkouts = self.checkouts.load(Ordering::Relaxed);
        ratio(checkouts, checkouts + self.activations())
    }

    /// Converts the counters to a BTreeMap for reporting.
    pub fn to_btreemap(&self) -> BTreeMap<String, f64> {
        let counters = [
            ("activations", &self.activations),
            ("adds", &self.adds),
            ("checkins", &self.checkins),
            ("checkouts", &self.checkouts),
            ("load_failures", &self.load_failures),
            ("misses", &self.misses),
            ("passivation_failures", &self.passivation_failures),
            ("passivations", &self.passivations),
            ("removals", &self.removals),
            ("timeouts", &self.timeouts),
            ("vetoes", &self.vetoes),
        ];
        let mut metrics: BTreeMap<String, f64> = counters
            .iter()
            .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed) as f64))
            .collect();
        metrics.insert("memory_hit_rate".to_string(), self.memory_hit_rate());
        metrics
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hit_rate() {
        let metrics = InstanceCacheMetrics::new();
        assert_eq!(metrics.memory_hit_rate(), 0.0);
        metrics.record_checkout();
        metrics.record_checkout();
        metrics.record_checkout();
        metrics.record_activation();
        assert_eq!(metrics.memory_hit_rate(), 0.75);
    }

    #[test]
    fn test_btreemap_keys_are_sorted() {
        let metrics = InstanceCacheMetrics::new();
        metrics.record_passivations(4);
        let map = metrics.to_btreemap();
        assert_eq!(map["passivations"], 4.0);
        let keys: Vec<_> = map.keys().cloned().collect();
        let mut sorted = keys.clone();
        sorted.sort();
        assert_eq!(keys, sorted);
    }
}
