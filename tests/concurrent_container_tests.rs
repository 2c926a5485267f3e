//! Concurrency Tests for the Stateful Container
//!
//! Calls from many threads against shared and distinct sessions, with a cache
//! small enough that passivation and reactivation interleave with the calls.
//!
//! ## Test Strategy
//! - A barrier inside a bean method to hold an instance in use deterministically
//! - Distinct sessions per worker to check state never leaks between sessions
//! - A single contended session to check calls are serialized, never overlapped

use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use serde_json::{json, Value};
use stateful_rs::bean::{BeanContext, BeanError, MethodInfo, SessionBean};
use stateful_rs::config::{ContainerConfig, InstanceCacheConfig};
use stateful_rs::error::ContainerError;
use stateful_rs::{Call, SessionId, StatefulContainer, TransactionManager};
use tracing_subscriber::EnvFilter;

// ============================================================================
// TEST BEAN
// ============================================================================

struct Counter {
    value: i64,
    gate: Option<Arc<Barrier>>,
}

impl SessionBean for Counter {
    fn invoke(&mut self, method: &str, _args: &[Value]) -> Result<Value, BeanError> {
        match method {
            "add" => {
                self.value += 1;
                Ok(json!(self.value))
            }
            "hold" => {
                if let Some(gate) = &self.gate {
                    // entered, then wait to be let go
                    gate.wait();
                    gate.wait();
                }
                Ok(json!(self.value))
            }
            _ => Ok(json!(self.value)),
        }
    }

    fn snapshot(&self) -> Result<Value, BeanError> {
        Ok(json!(self.value))
    }
}

fn counter_context(gate: Option<Arc<Barrier>>) -> BeanContext {
    BeanContext::new(
        "counter",
        move || {
            Ok(Box::new(Counter {
                value: 0,
                gate: gate.clone(),
            }) as Box<dyn SessionBean>)
        },
        |state| {
            Ok(Box::new(Counter {
                value: state.as_i64().unwrap_or_default(),
                gate: None,
            }) as Box<dyn SessionBean>)
        },
    )
    .with_method("open", MethodInfo::create())
    .with_session_synchronization(true)
}

fn container(capacity: usize, gate: Option<Arc<Barrier>>) -> StatefulContainer {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
    let config = ContainerConfig {
        cache: InstanceCacheConfig {
            capacity: NonZeroUsize::new(capacity).unwrap(),
            bulk_passivate: 4,
            timeout: None,
        },
        access_timeout: None,
        ..ContainerConfig::default()
    };
    let container = StatefulContainer::new("counters", config, TransactionManager::new()).unwrap();
    container.deploy(counter_context(gate));
    container
}

fn open(container: &StatefulContainer) -> SessionId {
    container
        .create(Call::new("counter", "open"))
        .unwrap()
        .primary_key
}

// ============================================================================
// CONCURRENT ACCESS
// ============================================================================

#[test]
fn test_overlapping_call_is_rejected() {
    let gate = Arc::new(Barrier::new(2));
    let container = container(16, Some(Arc::clone(&gate)));
    let key = open(&container);

    thread::scope(|scope| {
        let holder = scope.spawn(|| container.business(Call::new("counter", "hold").on(key)));

        gate.wait();
        let err = container
            .business(Call::new("counter", "add").on(key))
            .unwrap_err();
        assert!(matches!(err, ContainerError::ConcurrentAccess(k) if k == key));
        gate.wait();

        assert_eq!(holder.join().unwrap().unwrap(), json!(0));
    });

    assert_eq!(
        container.business(Call::new("counter", "add").on(key)).unwrap(),
        json!(1)
    );
    assert_eq!(
        container.container_metrics().to_btreemap()["concurrent_access_rejections"],
        1.0
    );
}

#[test]
fn test_contended_session_never_loses_updates() {
    let container = container(16, None);
    let key = open(&container);
    let succeeded = AtomicUsize::new(0);

    let mut pool = scoped_threadpool::Pool::new(8);
    pool.scoped(|scope| {
        for _ in 0..8 {
            let container = &container;
            let succeeded = &succeeded;
            scope.execute(move || {
                for _ in 0..200 {
                    match container.business(Call::new("counter", "add").on(key)) {
                        Ok(_) => {
                            succeeded.fetch_add(1, Ordering::Relaxed);
                        }
                        Err(ContainerError::ConcurrentAccess(_))
                        | Err(ContainerError::TransactionAffinity(_)) => {}
                        Err(err) => panic!("unexpected error: {err}"),
                    }
                }
            });
        }
    });

    let value = container
        .business(Call::new("counter", "get").on(key))
        .unwrap();
    assert_eq!(value, json!(succeeded.load(Ordering::Relaxed)));
    assert!(succeeded.load(Ordering::Relaxed) > 0);
    assert_eq!(container.checked_out_count(), 0);
}

// ============================================================================
// PASSIVATION UNDER LOAD
// ============================================================================

#[test]
fn test_distinct_sessions_across_threads() {
    let container = container(16, None);
    let threads = 8;
    let per_thread = 25;
    let rounds = 3;

    let mut pool = scoped_threadpool::Pool::new(threads);
    let mut keys: Vec<Vec<SessionId>> = vec![Vec::new(); threads as usize];
    pool.scoped(|scope| {
        for owned in keys.iter_mut() {
            let container = &container;
            scope.execute(move || {
                for _ in 0..per_thread {
                    owned.push(open(container));
                }
                for _ in 0..rounds {
                    for key in owned.iter() {
                        container
                            .business(Call::new("counter", "add").on(*key))
                            .unwrap();
                    }
                }
            });
        }
    });

    for key in keys.iter().flatten() {
        let value = container
            .business(Call::new("counter", "get").on(*key))
            .unwrap();
        assert_eq!(value, json!(rounds));
    }
    assert_eq!(container.checked_out_count(), 0);
    let metrics = container.cache().cache_metrics();
    assert!(metrics.passivations() > 0);
    assert!(metrics.activations() > 0);
}

// ============================================================================
// TRANSACTIONS ACROSS THREADS
// ============================================================================

#[test]
fn test_transaction_committed_on_another_thread_releases_sessions() {
    let container = container(16, None);
    let keys: Vec<SessionId> = (0..10).map(|_| open(&container)).collect();
    let tx = container.transaction_manager().begin();

    for key in &keys {
        container
            .business(Call::new("counter", "add").on(*key).in_transaction(&tx))
            .unwrap();
    }
    assert_eq!(container.checked_out_count(), keys.len());

    thread::scope(|scope| {
        scope.spawn(|| {
            thread::sleep(Duration::from_millis(10));
            tx.commit().unwrap();
        });
    });

    assert_eq!(container.checked_out_count(), 0);
    for key in &keys {
        assert_eq!(
            container.business(Call::new("counter", "add").on(*key)).unwrap(),
            json!(2)
        );
    }
}
