//! Metrics System
//!
//! The cache and the container count what they do with relaxed atomics and report
//! the counters as a `BTreeMap<String, f64>` through the [`Manageable`] trait.
//!
//! # Why BTreeMap over HashMap?
//!
//! - **Deterministic ordering**: Metrics always appear in consistent order
//! - **Reproducible output**: Simulator runs can be diffed line by line
//! - **Stable serialization**: CSV exports have predictable column ordering

use std::collections::BTreeMap;

pub mod cache;
pub mod container;

pub use cache::InstanceCacheMetrics;
pub use container::ContainerMetrics;

/// A component that exposes its counters for management tooling.
pub trait Manageable {
    /// Returns all metrics as key-value pairs in deterministic order.
    fn metrics(&self) -> BTreeMap<String, f64>;

    /// Short name identifying the component in reports.
    fn component_name(&self) -> &'static str;
}

/// Ratio helper shared by the metric structs; 0.0 when the denominator is zero.
#[inline]
pub(crate) fn ratio(numerator: u64, denominator: u64) -> f64 {
    if denominator > 0 {
        numerator as f64 / denominator as f64
    } else {
        0.0
    }
}
