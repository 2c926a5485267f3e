//! Configuration for the stateful container.

use super::cache::InstanceCacheConfig;
use crate::error::ConfigError;
use core::fmt;
use core::num::NonZeroUsize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

/// Default time a caller waits for an instance bound to another transaction.
pub const DEFAULT_ACCESS_TIMEOUT: Duration = Duration::from_secs(30);

/// Where passivated instances are stored.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum PassivationTarget {
    /// Keep serialized snapshots in process memory.
    #[default]
    Memory,
    /// Write one file per session into the directory.
    Directory(PathBuf),
}

/// Configuration for a [`StatefulContainer`](crate::StatefulContainer).
///
/// # Examples
///
/// ```
/// use stateful_rs::config::{ContainerConfig, PassivationTarget};
/// use std::time::Duration;
///
/// let config = ContainerConfig {
///     access_timeout: None,
///     passivation: PassivationTarget::Directory("/var/tmp/sessions".into()),
///     ..ContainerConfig::default()
/// };
/// assert_eq!(config.cache.capacity.get(), 1000);
/// ```
#[derive(Clone, PartialEq, Eq)]
pub struct ContainerConfig {
    /// Instance cache settings.
    pub cache: InstanceCacheConfig,
    /// How long a call waits for an instance bound to another transaction.
    /// `None` fails such calls immediately.
    pub access_timeout: Option<Duration>,
    /// Passivation store.
    pub passivation: PassivationTarget,
}

impl ContainerConfig {
    /// Builds a config from deployment properties, falling back to defaults for
    /// anything not set. Property names are matched case-insensitively.
    pub fn from_properties(properties: &BTreeMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = ContainerConfig::default();
        for (name, value) in properties {
            let value = value.trim();
            match name.to_ascii_lowercase().as_str() {
                "capacity" => {
                    config.cache.capacity = value
                        .parse::<NonZeroUsize>()
                        .map_err(|_| invalid(name, value))?;
                }
                "bulkpassivate" => {
                    config.cache.bulk_passivate =
                        value.parse::<usize>().map_err(|_| invalid(name, value))?;
                }
                "timeout" => {
                    config.cache.timeout = parse_duration(value).ok_or_else(|| invalid(name, value))?;
                }
                "accesstimeout" => {
                    config.access_timeout =
                        parse_duration(value).ok_or_else(|| invalid(name, value))?;
                }
                "passivationdirectory" if !value.is_empty() => {
                    config.passivation = PassivationTarget::Directory(PathBuf::from(value));
                }
                _ => {}
            }
        }
        Ok(config)
    }
}

fn invalid(property: &str, value: &str) -> ConfigError {
    ConfigError::InvalidProperty {
        property: property.to_string(),
        value: value.to_string(),
    }
}

/// Parses a timeout property.
///
/// Returns `None` for malformed input, `Some(None)` for a negative value (timeout
/// disabled) and `Some(Some(duration))` otherwise. A number without a unit is
/// read as minutes.
///
/// ```
/// use stateful_rs::config::parse_duration;
/// use std::time::Duration;
///
/// assert_eq!(parse_duration("20"), Some(Some(Duration::from_secs(1200))));
/// assert_eq!(parse_duration("90 seconds"), Some(Some(Duration::from_secs(90))));
/// assert_eq!(parse_duration("-1"), Some(None));
/// assert_eq!(parse_duration("soon"), None);
/// ```
#[allow(clippy::option_option)]
pub fn parse_duration(value: &str) -> Option<Option<Duration>> {
    let value = value.trim();
    let split = value
        .char_indices()
        .find(|&(i, c)| !(c.is_ascii_digit() || (i == 0 && (c == '-' || c == '+'))))
        .map_or(value.len(), |(i, _)| i);
    let (amount, unit) = value.split_at(split);
    let amount: i64 = amount.parse().ok()?;
    if amount < 0 {
        return Some(None);
    }
    let amount = amount.unsigned_abs();
    let duration = match unit.trim().to_ascii_lowercase().as_str() {
        "ms" | "millisecond" | "milliseconds" => Duration::from_millis(amount),
        "s" | "sec" | "secs" | "second" | "seconds" => Duration::from_secs(amount),
        "" | "m" | "min" | "mins" | "minute" | "minutes" => Duration::from_secs(amount * 60),
        "h" | "hr" | "hour" | "hours" => Duration::from_secs(amount * 3600),
        _ => return None,
    };
    Some(Some(duration))
}

impl Default for ContainerConfig {
    fn default() -> Self {
        Self {
            cache: InstanceCacheConfig::default(),
            access_timeout: Some(DEFAULT_ACCESS_TIMEOUT),
            passivation: PassivationTarget::Memory,
        }
    }
}

impl fmt::Debug for ContainerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ContainerConfig")
            .field("cache", &self.cache)
            .field("access_timeout", &self.access_timeout)
            .field("passivation", &self.passivation)
            .finish()
    }
}
