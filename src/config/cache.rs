//! Configuration for the instance cache.
//!
//! # Sizing Guidelines
//!
//! `capacity` bounds the number of *available* (checked-in) entries the cache keeps
//! in memory before the LRU pass starts passivating. Checked-out entries are never
//! counted against it, so a burst of concurrent sessions cannot force an in-use
//! instance to disk.
//!
//! `bulk_passivate` is how many of the oldest available entries are stored in one
//! pass. Larger batches amortize the cost of a directory store; smaller batches keep
//! more warm instances in memory.
//!
//! ```text
//! available entries ≥ capacity  ──▶  passivate up to bulk_passivate oldest entries
//! idle time ≥ timeout           ──▶  discard (no passivation)
//! ```

use core::fmt;
use core::num::NonZeroUsize;
use std::time::Duration;

/// Default number of available entries kept in memory.
pub const DEFAULT_CAPACITY: usize = 1000;

/// Default passivation batch size.
pub const DEFAULT_BULK_PASSIVATE: usize = 100;

/// Default idle timeout: 20 minutes.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20 * 60);

/// Configuration for an [`InstanceCache`](crate::InstanceCache).
///
/// # Examples
///
/// ```
/// use stateful_rs::config::InstanceCacheConfig;
/// use core::num::NonZeroUsize;
/// use std::time::Duration;
///
/// let config = InstanceCacheConfig {
///     capacity: NonZeroUsize::new(64).unwrap(),
///     bulk_passivate: 8,
///     timeout: Some(Duration::from_secs(300)),
/// };
/// assert_eq!(config.capacity.get(), 64);
///
/// // Entries never time out
/// let config = InstanceCacheConfig {
///     timeout: None,
///     ..InstanceCacheConfig::default()
/// };
/// assert!(config.timeout.is_none());
/// ```
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct InstanceCacheConfig {
    /// Number of available entries kept in memory before passivation starts.
    pub capacity: NonZeroUsize,
    /// Maximum number of entries passivated in one LRU pass.
    pub bulk_passivate: usize,
    /// Idle time after which an available entry is discarded. `None` disables
    /// timeouts; `Some(Duration::ZERO)` times entries out on the next pass.
    pub timeout: Option<Duration>,
}

impl InstanceCacheConfig {
    /// Batch size actually used by a pass; never zero and never above capacity.
    pub(crate) fn effective_bulk_passivate(&self) -> usize {
        self.bulk_passivate.clamp(1, self.capacity.get())
    }
}

impl Default for InstanceCacheConfig {
    fn default() -> Self {
        Self {
            capacity: NonZeroUsize::new(DEFAULT_CAPACITY).unwrap_or(NonZeroUsize::MIN),
            bulk_passivate: DEFAULT_BULK_PASSIVATE,
            timeout: Some(DEFAULT_TIMEOUT),
        }
    }
}

impl fmt::Debug for InstanceCacheConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InstanceCacheConfig")
            .field("capacity", &self.capacity)
            .field("bulk_passivate", &self.bulk_passivate)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = InstanceCacheConfig::default();
        assert_eq!(config.capacity.get(), 1000);
        assert_eq!(config.bulk_passivate, 100);
        assert_eq!(config.timeout, Some(Duration::from_secs(1200)));
    }

    #[test]
    fn test_bulk_passivate_is_clamped() {
        let config = InstanceCacheConfig {
            capacity: NonZeroUsize::new(4).unwrap(),
            bulk_passivate: 0,
            timeout: None,
        };
        assert_eq!(config.effective_bulk_passivate(), 1);

        let config = InstanceCacheConfig {
            bulk_passivate: 50,
            ..config
        };
        assert_eq!(config.effective_bulk_passivate(), 4);
    }
}
