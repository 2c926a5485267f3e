//! Checked-Out Registry
//!
//! Instances that are bound to an in-flight transaction (or are not passivable)
//! live here instead of in the instance cache. Lookups happen on every call, so
//! the registry partitions keys across independently locked segments.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────┐
//! │                  CheckedOutRegistry                    │
//! │                                                        │
//! │  hash(session id) % N  ──▶  Segment Selection          │
//! │                                                        │
//! │  ┌──────────────┐ ┌──────────────┐     ┌──────────────┐│
//! │  │  Segment 0   │ │  Segment 1   │ ... │  Segment N-1 ││
//! │  │ Mutex<Map>   │ │ Mutex<Map>   │     │ Mutex<Map>   ││
//! │  └──────────────┘ └──────────────┘     └──────────────┘│
//! └────────────────────────────────────────────────────────┘
//! ```

use super::instance::{Instance, SessionId};
use crate::{DefaultHashBuilder, HashMap};
use parking_lot::Mutex;
use std::fmt;
use std::hash::BuildHasher;
use std::sync::Arc;

/// Default number of segments.
#[inline]
pub fn default_segment_count() -> usize {
    16
}

/// Session id → instance map for instances outside the cache.
pub struct CheckedOutRegistry {
    segments: Box<[Mutex<HashMap<SessionId, Arc<Instance>>>]>,
    hash_builder: DefaultHashBuilder,
}

impl CheckedOutRegistry {
    /// Creates an empty registry with `segments` segments (at least one).
    pub fn new(segments: usize) -> Self {
        let segments: Vec<_> = (0..segments.max(1))
            .map(|_| Mutex::new(HashMap::new()))
            .collect();
        Self {
            segments: segments.into_boxed_slice(),
            hash_builder: DefaultHashBuilder::default(),
        }
    }

    #[inline]
    fn segment(&self, key: &SessionId) -> &Mutex<HashMap<SessionId, Arc<Instance>>> {
        let index = (self.hash_builder.hash_one(key) as usize) % self.segments.len();
        &self.segments[index]
    }

    /// Instance registered under `key`.
    pub fn get(&self, key: &SessionId) -> Option<Arc<Instance>> {
        self.segment(key).lock().get(key).cloned()
    }

    /// Registers an instance, returning the one it replaced.
    pub fn insert(&self, key: SessionId, instance: Arc<Instance>) -> Option<Arc<Instance>> {
        self.segment(&key).lock().insert(key, instance)
    }

    /// Unregisters `key`.
    pub fn remove(&self, key: &SessionId) -> Option<Arc<Instance>> {
        self.segment(key).lock().remove(key)
    }

    /// `true` if `key` is registered.
    pub fn contains(&self, key: &SessionId) -> bool {
        self.segment(key).lock().contains_key(key)
    }

    /// Unregisters every instance matching `filter` and returns them.
    pub fn remove_all<F>(&self, filter: F) -> Vec<Arc<Instance>>
    where
        F: Fn(&Instance) -> bool,
    {
        let mut removed = Vec::new();
        for segment in self.segments.iter() {
            let mut segment = segment.lock();
            let keys: Vec<SessionId> = segment
                .iter()
                .filter(|(_, instance)| filter(instance))
                .map(|(key, _)| *key)
                .collect();
            removed.extend(keys.iter().filter_map(|key| segment.remove(key)));
        }
        removed
    }

    /// Number of registered instances.
    ///
    /// Locks each segment in turn, so the count may be stale under contention.
    pub fn len(&self) -> usize {
        self.segments.iter().map(|s| s.lock().len()).sum()
    }

    /// `true` if nothing is registered.
    pub fn is_empty(&self) -> bool {
        self.segments.iter().all(|s| s.lock().is_empty())
    }

    /// Number of segments.
    pub fn segment_count(&self) -> usize {
        self.segments.len()
    }
}

impl Default for CheckedOutRegistry {
    fn default() -> Self {
        Self::new(default_segment_count())
    }
}

impl fmt::Debug for CheckedOutRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CheckedOutRegistry")
            .field("segments", &self.segments.len())
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bean::{BeanContext, BeanError, SessionBean};
    use serde_json::Value;

    struct Nothing;

    impl SessionBean for Nothing {
        fn invoke(&mut self, _: &str, _: &[Value]) -> Result<Value, BeanError> {
            Ok(Value::Null)
        }

        fn snapshot(&self) -> Result<Value, BeanError> {
            Ok(Value::Null)
        }
    }

    fn instance(deployment: &Arc<BeanContext>) -> Arc<Instance> {
        Arc::new(Instance::new(
            SessionId::random(),
            Arc::clone(deployment),
            Box::new(Nothing),
        ))
    }

    fn deployment(id: &str) -> Arc<BeanContext> {
        Arc::new(BeanContext::new(
            id,
            || Ok(Box::new(Nothing) as Box<dyn SessionBean>),
            |_| Ok(Box::new(Nothing) as Box<dyn SessionBean>),
        ))
    }

    #[test]
    fn test_insert_get_remove() {
        let registry = CheckedOutRegistry::new(4);
        let a = instance(&deployment("a"));
        let key = a.primary_key();
        assert!(registry.insert(key, Arc::clone(&a)).is_none());
        assert!(registry.contains(&key));
        assert!(Arc::ptr_eq(&registry.get(&key).unwrap(), &a));
        assert_eq!(registry.len(), 1);
        assert!(registry.remove(&key).is_some());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_remove_all_by_deployment() {
        let registry = CheckedOutRegistry::default();
        assert_eq!(registry.segment_count(), 16);
        let a = deployment("a");
        let b = deployment("b");
        for _ in 0..20 {
            let i = instance(&a);
            registry.insert(i.primary_key(), i);
            let j = instance(&b);
            registry.insert(j.primary_key(), j);
        }
        let removed = registry.remove_all(|i| i.deployment_id() == "a");
        assert_eq!(removed.len(), 20);
        assert_eq!(registry.len(), 20);
    }

    #[test]
    fn test_zero_segments_is_clamped() {
        assert_eq!(CheckedOutRegistry::new(0).segment_count(), 1);
    }
}
