//! Synthetic client workloads
//!
//! Each client owns a fixed set of session slots. Traffic is skewed towards a
//! popular subset of the slots so some sessions stay hot in the cache while the
//! long tail gets passivated. A slot is opened on first use, may be closed, and
//! is reopened by the next request that lands on it.

use crate::models::{Action, Request};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::Path;

/// Parameters for generating a workload
#[derive(Debug, Clone)]
pub struct WorkloadConfig {
    /// Number of clients
    pub clients: u32,
    /// Session slots per client
    pub sessions_per_client: u32,
    /// Number of business calls to generate; opens and closes come on top
    pub calls: usize,
    /// Percentage of calls that hit popular sessions
    pub popular_traffic_percent: u8,
    /// Percentage of sessions considered popular
    pub popular_sessions_percent: u8,
    /// Percentage of calls followed by a close of the same session
    pub close_percent: u8,
    /// Percentage of calls that start a client transaction
    pub tx_percent: u8,
    /// RNG seed for reproducible workloads
    pub seed: Option<u64>,
}

impl Default for WorkloadConfig {
    fn default() -> Self {
        Self {
            clients: 8,
            sessions_per_client: 100,
            calls: 100_000,
            popular_traffic_percent: 80,
            popular_sessions_percent: 20,
            close_percent: 2,
            tx_percent: 10,
            seed: None,
        }
    }
}

/// Generator for synthetic workloads
pub struct WorkloadGenerator {
    config: WorkloadConfig,
}

impl WorkloadGenerator {
    /// Create a new generator with the given configuration
    pub fn new(config: WorkloadConfig) -> Self {
        Self { config }
    }

    /// Generate the workload in memory
    pub fn generate(&self) -> Vec<Request> {
        let config = &self.config;
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };

        let clients = config.clients.max(1);
        let slots = config.sessions_per_client.max(1);
        let popular = (slots * u32::from(config.popular_sessions_percent) / 100).max(1);

        let mut open = vec![vec![false; slots as usize]; clients as usize];
        // remaining calls in the current transaction group, per client
        let mut tx_left = vec![0u32; clients as usize];
        let mut tx_group = vec![0u32; clients as usize];
        let mut next_group = 1;

        let mut requests = Vec::with_capacity(config.calls + config.calls / 10);
        for _ in 0..config.calls {
            let client = rng.gen_range(0..clients);
            let c = client as usize;

            let session = if rng.gen_range(0..100) < config.popular_traffic_percent || popular == slots
            {
                rng.gen_range(0..popular)
            } else {
                rng.gen_range(popular..slots)
            };

            if tx_left[c] == 0 {
                tx_group[c] = 0;
                if rng.gen_range(0..100) < config.tx_percent {
                    tx_group[c] = next_group;
                    tx_left[c] = rng.gen_range(1..=4);
                    next_group += 1;
                }
            }
            let tx = tx_group[c];

            if !open[c][session as usize] {
                requests.push(Request {
                    client,
                    session,
                    action: Action::Open,
                    tx,
                });
                open[c][session as usize] = true;
            }

            requests.push(Request {
                client,
                session,
                action: Action::Call,
                tx,
            });
            tx_left[c] = tx_left[c].saturating_sub(1);

            if tx == 0 && rng.gen_range(0..100) < config.close_percent {
                requests.push(Request {
                    client,
                    session,
                    action: Action::Close,
                    tx: 0,
                });
                open[c][session as usize] = false;
            }
        }

        requests
    }

    /// Generate the workload and write it to a CSV file
    pub fn generate_to(&self, path: &Path) -> Result<usize, csv::Error> {
        let requests = self.generate();
        write_requests(path, &requests)?;
        Ok(requests.len())
    }
}

/// Write requests to a CSV file with a header row
pub fn write_requests(path: &Path, requests: &[Request]) -> Result<(), csv::Error> {
    let mut writer = csv::Writer::from_path(path)?;
    for request in requests {
        writer.serialize(request)?;
    }
    writer.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(calls: usize) -> Vec<Request> {
        WorkloadGenerator::new(WorkloadConfig {
            clients: 4,
            sessions_per_client: 10,
            calls,
            seed: Some(7),
            ..WorkloadConfig::default()
        })
        .generate()
    }

    #[test]
    fn test_every_call_targets_an_open_session() {
        let mut open = std::collections::HashSet::new();
        for request in seeded(2_000) {
            let slot = (request.client, request.session);
            match request.action {
                Action::Open => assert!(open.insert(slot)),
                Action::Call => assert!(open.contains(&slot)),
                Action::Close => assert!(open.remove(&slot)),
            }
        }
    }

    #[test]
    fn test_seed_makes_workload_reproducible() {
        assert_eq!(seeded(500), seeded(500));
        let calls = seeded(500)
            .iter()
            .filter(|r| r.action == Action::Call)
            .count();
        assert_eq!(calls, 500);
    }
}
