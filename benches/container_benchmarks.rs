//! Container Benchmarks
//!
//! Checkout/check-in round trips on the bare instance cache, and full business
//! calls through the container with and without passivation in the loop.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use serde_json::{json, Value};
use stateful_rs::bean::{BeanContext, BeanError, MethodInfo, SessionBean};
use stateful_rs::config::{ContainerConfig, InstanceCacheConfig};
use stateful_rs::passivation::{JsonCodec, MemoryPassivater};
use stateful_rs::{Call, InstanceCache, SessionId, StatefulContainer, TransactionManager};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;

const SESSIONS: usize = 1_000;

struct Tally(i64);

impl SessionBean for Tally {
    fn invoke(&mut self, _method: &str, _args: &[Value]) -> Result<Value, BeanError> {
        self.0 += 1;
        Ok(json!(self.0))
    }

    fn snapshot(&self) -> Result<Value, BeanError> {
        Ok(json!(self.0))
    }
}

fn cache_config(capacity: usize) -> InstanceCacheConfig {
    InstanceCacheConfig {
        capacity: NonZeroUsize::new(capacity).unwrap(),
        bulk_passivate: (capacity / 10).max(1),
        timeout: None,
    }
}

fn make_container(capacity: usize) -> (StatefulContainer, Vec<SessionId>) {
    let config = ContainerConfig {
        cache: cache_config(capacity),
        ..ContainerConfig::default()
    };
    let container = StatefulContainer::new("bench", config, TransactionManager::new()).unwrap();
    container.deploy(
        BeanContext::new(
            "tally",
            || Ok(Box::new(Tally(0)) as Box<dyn SessionBean>),
            |state| Ok(Box::new(Tally(state.as_i64().unwrap_or_default())) as Box<dyn SessionBean>),
        )
        .with_method("open", MethodInfo::create()),
    );
    let keys = (0..SESSIONS)
        .map(|_| container.create(Call::new("tally", "open")).unwrap().primary_key)
        .collect();
    (container, keys)
}

fn cache_round_trip(c: &mut Criterion) {
    let mut group = c.benchmark_group("Instance Cache");

    let cache: InstanceCache<usize, String> = InstanceCache::init(
        cache_config(SESSIONS * 2),
        MemoryPassivater::new(JsonCodec::<String>::new()),
    );
    for i in 0..SESSIONS {
        cache.add(i, i.to_string()).unwrap();
        cache.check_in(&i).unwrap();
    }

    group.bench_function("check_out + check_in", |b| {
        b.iter(|| {
            for i in 0..100 {
                let key = i % SESSIONS;
                black_box(cache.check_out(&key).unwrap());
                cache.check_in(&key).unwrap();
            }
        });
    });

    let small: InstanceCache<usize, String> = InstanceCache::init(
        cache_config(SESSIONS / 10),
        MemoryPassivater::new(JsonCodec::<String>::new()),
    );
    for i in 0..SESSIONS {
        small.add(i, i.to_string()).unwrap();
        small.check_in(&i).unwrap();
    }

    group.bench_function("check_out + check_in with passivation", |b| {
        let mut next = 0;
        b.iter(|| {
            for _ in 0..100 {
                next = (next + 7) % SESSIONS;
                if let Ok(Some(value)) = small.check_out(&next) {
                    black_box(value);
                    small.check_in(&next).unwrap();
                }
            }
        });
    });

    group.finish();
}

fn business_calls(c: &mut Criterion) {
    let mut group = c.benchmark_group("Business Calls");
    group.throughput(Throughput::Elements(100));

    for capacity in [SESSIONS, SESSIONS / 10] {
        let (container, keys) = make_container(capacity);
        group.bench_with_input(
            BenchmarkId::new("sequential", capacity),
            &capacity,
            |b, _| {
                let mut next = 0;
                b.iter(|| {
                    for _ in 0..100 {
                        next = (next + 13) % keys.len();
                        black_box(
                            container
                                .business(Call::new("tally", "add").on(keys[next]))
                                .unwrap(),
                        );
                    }
                });
            },
        );
    }

    group.finish();
}

fn concurrent_calls(c: &mut Criterion) {
    const THREADS: usize = 8;
    const CALLS_PER_THREAD: usize = 250;

    let mut group = c.benchmark_group("Concurrent Calls");
    group.throughput(Throughput::Elements((THREADS * CALLS_PER_THREAD) as u64));

    let (container, keys) = make_container(SESSIONS);
    let keys = Arc::new(keys);

    group.bench_function("distinct sessions", |b| {
        b.iter(|| {
            thread::scope(|scope| {
                for t in 0..THREADS {
                    let container = &container;
                    let keys = Arc::clone(&keys);
                    scope.spawn(move || {
                        let slice = keys.len() / THREADS;
                        for i in 0..CALLS_PER_THREAD {
                            let key = keys[t * slice + i % slice];
                            black_box(
                                container
                                    .business(Call::new("tally", "add").on(key))
                                    .unwrap(),
                            );
                        }
                    });
                }
            });
        });
    });

    group.finish();
}

criterion_group!(benches, cache_round_trip, business_calls, concurrent_calls);
criterion_main!(benches);
