//! Simulation runner
//!
//! Builds a container from the simulation config, deploys a small shopping cart
//! bean and replays a workload against it. Requests are partitioned by client
//! so every client runs sequentially on one worker thread, while different
//! clients run concurrently.

use crate::models::{
    Action, LatencyPercentiles, OpLatencyStats, Outcome, Request, SimulationConfig,
    SimulationResult,
};
use serde_json::{json, Value};
use stateful_rs::bean::{BeanContext, BeanError, MethodInfo, SessionBean};
use stateful_rs::config::{ContainerConfig, InstanceCacheConfig, PassivationTarget};
use stateful_rs::metrics::Manageable;
use stateful_rs::{
    Call, ContainerError, SessionId, StatefulContainer, Transaction, TransactionError,
    TransactionManager,
};
use std::collections::{BTreeMap, HashMap};
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info};

const DEPLOYMENT: &str = "cart";

/// Shopping cart used as the simulated bean
struct Cart {
    items: u64,
}

impl SessionBean for Cart {
    fn invoke(&mut self, method: &str, _args: &[Value]) -> Result<Value, BeanError> {
        if method == "add" {
            self.items += 1;
        }
        Ok(json!(self.items))
    }

    fn snapshot(&self) -> Result<Value, BeanError> {
        Ok(json!(self.items))
    }
}

fn cart_context() -> BeanContext {
    BeanContext::new(
        DEPLOYMENT,
        || Ok(Box::new(Cart { items: 0 }) as Box<dyn SessionBean>),
        |state| {
            Ok(Box::new(Cart {
                items: state.as_u64().unwrap_or_default(),
            }) as Box<dyn SessionBean>)
        },
    )
    .with_method("open", MethodInfo::create())
    .with_method("close", MethodInfo::remove())
    .with_session_synchronization(true)
}

/// Tracks latency for a single action
#[derive(Debug)]
struct OpLatencyTracker {
    total_ns: u64,
    count: u64,
    min_ns: u64,
    max_ns: u64,
    /// Sample reservoir for percentile calculation
    samples: Vec<u64>,
}

impl OpLatencyTracker {
    const MAX_SAMPLES: usize = 5000;

    fn new() -> Self {
        Self {
            total_ns: 0,
            count: 0,
            min_ns: u64::MAX,
            max_ns: 0,
            samples: Vec::with_capacity(Self::MAX_SAMPLES),
        }
    }

    #[inline]
    fn record(&mut self, latency_ns: u64) {
        self.total_ns += latency_ns;
        self.count += 1;
        self.min_ns = self.min_ns.min(latency_ns);
        self.max_ns = self.max_ns.max(latency_ns);

        if self.samples.len() < Self::MAX_SAMPLES {
            self.samples.push(latency_ns);
        } else {
            let idx = rand::random::<usize>() % (self.count as usize);
            if idx < Self::MAX_SAMPLES {
                self.samples[idx] = latency_ns;
            }
        }
    }

    fn merge(&mut self, other: OpLatencyTracker) {
        self.total_ns += other.total_ns;
        self.count += other.count;
        self.min_ns = self.min_ns.min(other.min_ns);
        self.max_ns = self.max_ns.max(other.max_ns);
        self.samples.extend(other.samples);
    }

    fn finalize(mut self) -> OpLatencyStats {
        self.samples.sort_unstable();
        let len = self.samples.len();
        let percentiles = if len == 0 {
            LatencyPercentiles::default()
        } else {
            LatencyPercentiles {
                p50_ns: self.samples[len * 50 / 100],
                p90_ns: self.samples[len * 90 / 100],
                p99_ns: self.samples[len * 99 / 100],
            }
        };
        OpLatencyStats {
            total_ns: self.total_ns,
            count: self.count,
            min_ns: if self.min_ns == u64::MAX { 0 } else { self.min_ns },
            max_ns: self.max_ns,
            percentiles,
        }
    }
}

/// State of one worker thread
struct Worker<'a> {
    container: &'a StatefulContainer,
    sessions: HashMap<(u32, u32), SessionId>,
    transaction: Option<(u32, Arc<Transaction>)>,
    latency: BTreeMap<Action, OpLatencyTracker>,
    outcomes: BTreeMap<(Action, Outcome), u64>,
}

impl<'a> Worker<'a> {
    fn new(container: &'a StatefulContainer) -> Self {
        Self {
            container,
            sessions: HashMap::new(),
            transaction: None,
            latency: BTreeMap::new(),
            outcomes: BTreeMap::new(),
        }
    }

    fn run(mut self, requests: &[Request]) -> Self {
        for request in requests {
            self.switch_transaction(request.tx);
            match request.action {
                Action::Open => {
                    self.open(request);
                }
                Action::Call => {
                    let key = match self.sessions.get(&(request.client, request.session)) {
                        Some(key) => *key,
                        None => match self.open(request) {
                            Some(key) => key,
                            None => continue,
                        },
                    };
                    let call = self.in_transaction(Call::new(DEPLOYMENT, "add").on(key));
                    let container = self.container;
                    let result = self.timed(Action::Call, || container.business(call));
                    if matches!(result, Err(ContainerError::InvalidReference(_))) {
                        // timed out or discarded; reopened on next use
                        self.sessions.remove(&(request.client, request.session));
                    }
                }
                Action::Close => {
                    if let Some(key) = self.sessions.remove(&(request.client, request.session)) {
                        let call = self.in_transaction(Call::new(DEPLOYMENT, "close").on(key));
                        let container = self.container;
                        let _ = self.timed(Action::Close, || container.remove(call));
                    }
                }
            }
        }
        self.switch_transaction(0);
        self
    }

    fn open(&mut self, request: &Request) -> Option<SessionId> {
        let call = self.in_transaction(Call::new(DEPLOYMENT, "open"));
        let container = self.container;
        let handle = self.timed(Action::Open, || container.create(call)).ok()?;
        self.sessions
            .insert((request.client, request.session), handle.primary_key);
        Some(handle.primary_key)
    }

    fn in_transaction(&self, call: Call) -> Call {
        match &self.transaction {
            Some((_, tx)) => call.in_transaction(tx),
            None => call,
        }
    }

    /// Commits the open transaction group when the group changes and begins the
    /// next one.
    fn switch_transaction(&mut self, group: u32) {
        if self.transaction.as_ref().map(|(g, _)| *g) == Some(group) {
            return;
        }
        if let Some((previous, tx)) = self.transaction.take() {
            if let Err(err) = tx.commit() {
                debug!(group = previous, error = %err, "transaction group did not commit");
            }
        }
        if group != 0 {
            self.transaction = Some((group, self.container.transaction_manager().begin()));
        }
    }

    fn timed<T>(
        &mut self,
        action: Action,
        f: impl FnOnce() -> Result<T, ContainerError>,
    ) -> Result<T, ContainerError> {
        let start = Instant::now();
        let result = f();
        let elapsed = start.elapsed().as_nanos() as u64;
        self.latency
            .entry(action)
            .or_insert_with(OpLatencyTracker::new)
            .record(elapsed);
        *self
            .outcomes
            .entry((action, classify(&result)))
            .or_default() += 1;
        result
    }
}

fn classify<T>(result: &Result<T, ContainerError>) -> Outcome {
    match result {
        Ok(_) => Outcome::Ok,
        Err(ContainerError::InvalidReference(_)) => Outcome::InvalidReference,
        Err(ContainerError::ConcurrentAccess(_)) => Outcome::ConcurrentAccess,
        Err(ContainerError::TransactionAffinity(_)) => Outcome::TransactionAffinity,
        Err(ContainerError::TransactionRolledBack(_))
        | Err(ContainerError::Transaction(TransactionError::RolledBack { .. })) => {
            Outcome::RolledBack
        }
        Err(_) => Outcome::Failed,
    }
}

/// Runs workloads against a freshly built container
pub struct SimulationRunner {
    config: SimulationConfig,
}

impl SimulationRunner {
    /// Create a new runner
    pub fn new(config: SimulationConfig) -> Self {
        Self { config }
    }

    /// Container configuration derived from the simulation config
    pub fn container_config(&self) -> ContainerConfig {
        let config = &self.config;
        ContainerConfig {
            cache: InstanceCacheConfig {
                capacity: NonZeroUsize::new(config.capacity).unwrap_or(NonZeroUsize::MIN),
                bulk_passivate: config.bulk_passivate,
                timeout: config.timeout_secs.map(Duration::from_secs),
            },
            access_timeout: config.access_timeout_ms.map(Duration::from_millis),
            passivation: match &config.passivation_dir {
                Some(dir) => PassivationTarget::Directory(dir.clone()),
                None => PassivationTarget::Memory,
            },
        }
    }

    /// Replay `requests` and collect statistics
    pub fn run(&self, requests: &[Request]) -> Result<SimulationResult, ContainerError> {
        let container =
            StatefulContainer::new("simulator", self.container_config(), TransactionManager::new())?;
        container.deploy(cart_context());

        let threads = self.config.threads.max(1);
        let mut partitions: Vec<Vec<Request>> = vec![Vec::new(); threads];
        for request in requests {
            partitions[request.client as usize % threads].push(*request);
        }
        info!(threads, requests = requests.len(), "starting simulation");

        let start = Instant::now();
        let workers: Vec<Worker<'_>> = thread::scope(|scope| {
            let handles: Vec<_> = partitions
                .iter()
                .map(|partition| {
                    let container = &container;
                    scope.spawn(move || Worker::new(container).run(partition))
                })
                .collect();
            handles
                .into_iter()
                .filter_map(|handle| handle.join().ok())
                .collect()
        });
        let duration = start.elapsed();

        let mut latency: BTreeMap<Action, OpLatencyTracker> = BTreeMap::new();
        let mut outcomes: BTreeMap<(Action, Outcome), u64> = BTreeMap::new();
        for worker in workers {
            for (action, tracker) in worker.latency {
                match latency.get_mut(&action) {
                    Some(merged) => merged.merge(tracker),
                    None => {
                        latency.insert(action, tracker);
                    }
                }
            }
            for (key, count) in worker.outcomes {
                *outcomes.entry(key).or_default() += count;
            }
        }

        Ok(SimulationResult {
            latency: latency
                .into_iter()
                .map(|(action, tracker)| (action, tracker.finalize()))
                .collect(),
            outcomes,
            container_metrics: container.metrics(),
            total_requests: requests.len(),
            duration,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generator::{WorkloadConfig, WorkloadGenerator};

    #[test]
    fn test_small_run_completes_without_failures() {
        let requests = WorkloadGenerator::new(WorkloadConfig {
            clients: 4,
            sessions_per_client: 20,
            calls: 2_000,
            seed: Some(1),
            ..WorkloadConfig::default()
        })
        .generate();

        let runner = SimulationRunner::new(SimulationConfig {
            threads: 4,
            capacity: 16,
            bulk_passivate: 4,
            timeout_secs: None,
            access_timeout_ms: Some(100),
            passivation_dir: None,
        });
        let result = runner.run(&requests).unwrap();

        assert_eq!(result.total_requests, requests.len());
        assert_eq!(result.count(Action::Call, Outcome::Ok), 2_000);
        assert_eq!(result.count(Action::Call, Outcome::Failed), 0);
        assert!(result.container_metrics["cache.passivations"] > 0.0);
    }
}
