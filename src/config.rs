//! Container Configuration Module
//!
//! Configuration structures for the instance cache and the stateful container.
//! Like the rest of the crate's configs, these are plain structs with public fields:
//!
//! - **Simple**: Just create the struct with all fields set, or start from `Default`
//! - **Type safety**: Durations are [`Duration`](std::time::Duration), not raw integers
//! - **Deployable**: [`ContainerConfig::from_properties`] reads the string properties
//!   a deployment descriptor provides
//!
//! # Configs
//!
//! | Config | Used by | Description |
//! |--------|---------|-------------|
//! | [`InstanceCacheConfig`] | [`InstanceCache`](crate::InstanceCache) | Capacity, bulk passivation size, idle timeout |
//! | [`ContainerConfig`] | [`StatefulContainer`](crate::StatefulContainer) | Cache config, access timeout, passivation target |
//!
//! # Property Names
//!
//! | Property | Field | Default |
//! |----------|-------|---------|
//! | `Capacity` | `cache.capacity` | 1000 |
//! | `BulkPassivate` | `cache.bulk_passivate` | 100 |
//! | `TimeOut` | `cache.timeout` | 20 minutes |
//! | `AccessTimeout` | `access_timeout` | 30 seconds |
//! | `PassivationDirectory` | `passivation` | in memory |
//!
//! Durations accept a number followed by an optional unit (`ms`, `seconds`,
//! `minutes`, `hours`). A bare number is read as minutes; a negative number
//! disables the timeout.
//!
//! # Examples
//!
//! ```
//! use std::collections::BTreeMap;
//! use std::time::Duration;
//! use stateful_rs::config::ContainerConfig;
//!
//! let mut props = BTreeMap::new();
//! props.insert("Capacity".to_string(), "50".to_string());
//! props.insert("TimeOut".to_string(), "-1".to_string());
//! props.insert("AccessTimeout".to_string(), "250 ms".to_string());
//!
//! let config = ContainerConfig::from_properties(&props).unwrap();
//! assert_eq!(config.cache.capacity.get(), 50);
//! assert_eq!(config.cache.timeout, None);
//! assert_eq!(config.access_timeout, Some(Duration::from_millis(250)));
//! ```

pub mod cache;
pub mod container;

pub use cache::InstanceCacheConfig;
pub use container::{parse_duration, ContainerConfig, PassivationTarget};
