//! Container Metrics
//!
//! Call counts by operation and outcome.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Counters maintained by a [`StatefulContainer`](crate::StatefulContainer).
#[derive(Debug, Default)]
pub struct ContainerMetrics {
    creates: AtomicU64,
    business_calls: AtomicU64,
    removes: AtomicU64,
    invalid_references: AtomicU64,
    concurrent_access_rejections: AtomicU64,
    affinity_rejections: AtomicU64,
    application_exceptions: AtomicU64,
    system_exceptions: AtomicU64,
    discards: AtomicU64,
}

macro_rules! recorders {
    ($($method:ident => $field:ident),* $(,)?) => {
        $(
            pub(crate) fn $method(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }
        )*
    };
}

impl ContainerMetrics {
    /// Creates zeroed counters.
    pub fn new() -> Self {
        Self::default()
    }

    recorders! {
        record_create => creates,
        record_business => business_calls,
        record_remove => removes,
        record_invalid_reference => invalid_references,
        record_concurrent_access => concurrent_access_rejections,
        record_affinity_rejection => affinity_rejections,
        record_application_exception => application_exceptions,
        record_system_exception => system_exceptions,
        record_discard => discards,
    }

    /// Number of instances discarded after system exceptions or removal.
    pub fn discards(&self) -> u64 {
        self.discards.load(Ordering::Relaxed)
    }

    /// Number of system exceptions handled.
    pub fn system_exceptions(&self) -> u64 {
        self.system_exceptions.load(Ordering::Relaxed)
    }

    /// Converts the counters to a BTreeMap for reporting.
    pub fn to_btreemap(&self) -> BTreeMap<String, f64> {
        [
            ("affinity_rejections", &self.affinity_rejections),
            ("application_exceptions", &self.application_exceptions),
            ("business_calls", &self.business_calls),
            ("concurrent_access_rejections", &self.concurrent_access_rejections),
            ("creates", &self.creates),
            ("discards", &self.discards),
            ("invalid_references", &self.invalid_references),
            ("removes", &self.removes),
            ("system_exceptions", &self.system_exceptions),
        ]
        .iter()
        .map(|(name, counter)| (name.to_string(), counter.load(Ordering::Relaxed) as f64))
        .collect()
    }
}
