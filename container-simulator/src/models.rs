// Data models for container simulation

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// What a client does to one of its sessions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    /// Create the session
    Open,
    /// Business call on the session
    Call,
    /// Remove the session
    Close,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Open => "open",
            Action::Call => "call",
            Action::Close => "close",
        }
    }

    /// Get all actions
    pub fn all() -> [Action; 3] {
        [Action::Open, Action::Call, Action::Close]
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a workload, as written to and read from CSV
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Request {
    /// Client issuing the request; each client runs on its own thread
    pub client: u32,
    /// Session index, local to the client
    pub session: u32,
    /// What to do
    pub action: Action,
    /// Client transaction group; consecutive requests of a client with the same
    /// non-zero group run in one transaction
    pub tx: u32,
}

/// How a request ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Outcome {
    Ok,
    InvalidReference,
    ConcurrentAccess,
    TransactionAffinity,
    RolledBack,
    Failed,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Ok => "ok",
            Outcome::InvalidReference => "invalid_reference",
            Outcome::ConcurrentAccess => "concurrent_access",
            Outcome::TransactionAffinity => "transaction_affinity",
            Outcome::RolledBack => "rolled_back",
            Outcome::Failed => "failed",
        }
    }
}

/// Configuration for a simulation run
#[derive(Debug, Clone)]
pub struct SimulationConfig {
    /// Worker threads; requests are partitioned by client modulo this
    pub threads: usize,
    /// Instance cache capacity
    pub capacity: usize,
    /// Instances passivated per LRU pass
    pub bulk_passivate: usize,
    /// Idle timeout in seconds (None = never)
    pub timeout_secs: Option<u64>,
    /// How long a call waits for another transaction to release an instance
    pub access_timeout_ms: Option<u64>,
    /// Passivate to files in this directory instead of memory
    pub passivation_dir: Option<PathBuf>,
}

/// Latency statistics for one action
#[derive(Debug, Clone, Default)]
pub struct OpLatencyStats {
    /// Total time spent (nanoseconds)
    pub total_ns: u64,
    /// Number of operations
    pub count: u64,
    /// Minimum latency (nanoseconds)
    pub min_ns: u64,
    /// Maximum latency (nanoseconds)
    pub max_ns: u64,
    /// Latency percentiles
    pub percentiles: LatencyPercentiles,
}

impl OpLatencyStats {
    /// Calculate average latency in nanoseconds
    pub fn avg_ns(&self) -> f64 {
        if self.count > 0 {
            self.total_ns as f64 / self.count as f64
        } else {
            0.0
        }
    }

    /// Calculate throughput in operations per second
    pub fn ops_per_sec(&self) -> f64 {
        if self.total_ns > 0 {
            (self.count as f64 * 1_000_000_000.0) / self.total_ns as f64
        } else {
            0.0
        }
    }
}

/// Latency percentiles
#[derive(Debug, Clone, Copy, Default)]
pub struct LatencyPercentiles {
    pub p50_ns: u64,
    pub p90_ns: u64,
    pub p99_ns: u64,
}

/// Results of a simulation run
#[derive(Debug)]
pub struct SimulationResult {
    /// Latency per action
    pub latency: BTreeMap<Action, OpLatencyStats>,
    /// Outcome counts per action
    pub outcomes: BTreeMap<(Action, Outcome), u64>,
    /// Container and cache metrics at the end of the run
    pub container_metrics: BTreeMap<String, f64>,
    /// Total number of requests processed
    pub total_requests: usize,
    /// Wall-clock duration of the run
    pub duration: Duration,
}

impl SimulationResult {
    /// Number of requests of `action` that ended with `outcome`
    pub fn count(&self, action: Action, outcome: Outcome) -> u64 {
        self.outcomes.get(&(action, outcome)).copied().unwrap_or(0)
    }
}

/// CSV export row for simulation results
#[derive(Debug, Serialize)]
pub struct CsvResultRow {
    pub action: String,
    pub ops: u64,
    pub ok: u64,
    pub invalid_reference: u64,
    pub concurrent_access: u64,
    pub transaction_affinity: u64,
    pub rolled_back: u64,
    pub failed: u64,
    pub ops_per_sec: f64,
    pub avg_ns: f64,
    pub min_ns: u64,
    pub max_ns: u64,
    pub p50_ns: u64,
    pub p90_ns: u64,
    pub p99_ns: u64,
}
