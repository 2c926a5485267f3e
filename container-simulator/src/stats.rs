// Reporting for container simulation

use crate::models::{Action, CsvResultRow, Outcome, SimulationResult};
use std::path::Path;

/// Formats and exports simulation results
pub struct SimulationStats<'a> {
    result: &'a SimulationResult,
}

impl<'a> SimulationStats<'a> {
    /// Wrap a finished result
    pub fn from_result(result: &'a SimulationResult) -> Self {
        Self { result }
    }

    /// One row per action
    pub fn rows(&self) -> Vec<CsvResultRow> {
        let result = self.result;
        Action::all()
            .into_iter()
            .filter_map(|action| {
                let latency = result.latency.get(&action)?;
                Some(CsvResultRow {
                    action: action.as_str().to_string(),
                    ops: latency.count,
                    ok: result.count(action, Outcome::Ok),
                    invalid_reference: result.count(action, Outcome::InvalidReference),
                    concurrent_access: result.count(action, Outcome::ConcurrentAccess),
                    transaction_affinity: result.count(action, Outcome::TransactionAffinity),
                    rolled_back: result.count(action, Outcome::RolledBack),
                    failed: result.count(action, Outcome::Failed),
                    ops_per_sec: latency.ops_per_sec(),
                    avg_ns: latency.avg_ns(),
                    min_ns: latency.min_ns,
                    max_ns: latency.max_ns,
                    p50_ns: latency.percentiles.p50_ns,
                    p90_ns: latency.percentiles.p90_ns,
                    p99_ns: latency.percentiles.p99_ns,
                })
            })
            .collect()
    }

    /// Print a results table followed by the container metrics
    pub fn print_results(&self) {
        println!(
            "\n{:<8} {:>10} {:>10} {:>10} {:>10} {:>12} {:>10} {:>10}",
            "Action", "Ops", "Ok", "Rejected", "Failed", "Avg (ns)", "p50 (ns)", "p99 (ns)"
        );
        println!("{}", "-".repeat(88));
        for row in self.rows() {
            let rejected = row.invalid_reference
                + row.concurrent_access
                + row.transaction_affinity
                + row.rolled_back;
            println!(
                "{:<8} {:>10} {:>10} {:>10} {:>10} {:>12.0} {:>10} {:>10}",
                row.action,
                row.ops,
                row.ok,
                rejected,
                row.failed,
                row.avg_ns,
                row.p50_ns,
                row.p99_ns
            );
        }

        println!("\nContainer metrics");
        println!("-----------------");
        for (name, value) in &self.result.container_metrics {
            println!("{name:<36} {value:>12.2}");
        }
    }

    /// Export the per-action rows to CSV
    pub fn export_csv(&self, path: &Path) -> Result<(), csv::Error> {
        let mut writer = csv::Writer::from_path(path)?;
        for row in self.rows() {
            writer.serialize(row)?;
        }
        writer.flush()?;
        Ok(())
    }
}
