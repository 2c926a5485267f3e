use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::EnvFilter;

mod generator;
mod input;
mod models;
mod runner;
mod stats;

/// Stateful container simulator CLI
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[command(subcommand)]
    command: Commands,
}

/// Container settings shared by the commands that run a simulation
#[derive(clap::Args, Debug)]
struct ContainerArgs {
    /// Worker threads; clients are spread over them
    #[arg(long, default_value = "8")]
    threads: usize,

    /// Instance cache capacity
    #[arg(short, long, default_value = "1000")]
    capacity: usize,

    /// Instances passivated per LRU pass
    #[arg(long, default_value = "100")]
    bulk: usize,

    /// Idle timeout in seconds; sessions never time out when omitted
    #[arg(long)]
    timeout: Option<u64>,

    /// How long a call waits for another transaction's instance, in milliseconds
    #[arg(long, default_value = "30000")]
    access_timeout: u64,

    /// Passivate to files in this directory instead of memory
    #[arg(long, value_name = "DIR")]
    passivation_dir: Option<PathBuf>,

    /// Export results to CSV file
    #[arg(long, value_name = "PATH")]
    output_csv: Option<PathBuf>,
}

/// Workload shape shared by the commands that generate one
#[derive(clap::Args, Debug)]
struct WorkloadArgs {
    /// Number of clients
    #[arg(long, default_value = "8")]
    clients: u32,

    /// Session slots per client
    #[arg(long, default_value = "200")]
    sessions: u32,

    /// Number of business calls
    #[arg(long, default_value = "100000")]
    calls: usize,

    /// Percentage of calls that hit popular sessions
    #[arg(long, default_value = "80")]
    popular_traffic: u8,

    /// Percentage of sessions that are popular
    #[arg(long, default_value = "20")]
    popular_sessions: u8,

    /// Percentage of calls followed by a close
    #[arg(long, default_value = "2")]
    close: u8,

    /// Percentage of calls that start a client transaction
    #[arg(long, default_value = "10")]
    tx: u8,

    /// RNG seed for a reproducible workload
    #[arg(long)]
    seed: Option<u64>,
}

impl WorkloadArgs {
    fn into_config(self) -> generator::WorkloadConfig {
        generator::WorkloadConfig {
            clients: self.clients,
            sessions_per_client: self.sessions,
            calls: self.calls,
            popular_traffic_percent: self.popular_traffic,
            popular_sessions_percent: self.popular_sessions,
            close_percent: self.close,
            tx_percent: self.tx,
            seed: self.seed,
        }
    }
}

/// Subcommands for the CLI
#[derive(Subcommand, Debug)]
enum Commands {
    /// Generate a workload and run it
    Simulate {
        #[command(flatten)]
        workload: WorkloadArgs,

        #[command(flatten)]
        container: ContainerArgs,
    },

    /// Replay a workload file, or every CSV file in a directory
    Replay {
        /// Workload file or directory
        #[arg(short, long, value_name = "PATH")]
        input: PathBuf,

        #[command(flatten)]
        container: ContainerArgs,
    },

    /// Write a generated workload to a CSV file
    Generate {
        #[command(flatten)]
        workload: WorkloadArgs,

        /// Output file
        #[arg(short, long, default_value = "workload.csv")]
        output: PathBuf,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    match Args::parse().command {
        Commands::Simulate {
            workload,
            container,
        } => {
            let requests = generator::WorkloadGenerator::new(workload.into_config()).generate();
            run_simulation(&requests, container)
        }
        Commands::Replay { input, container } => {
            let requests = input::WorkloadReader::new(&input).read_all()?;
            println!("Loaded {} requests from {}", requests.len(), input.display());
            run_simulation(&requests, container)
        }
        Commands::Generate { workload, output } => {
            let count = generator::WorkloadGenerator::new(workload.into_config()).generate_to(&output)?;
            println!("Wrote {count} requests to {}", output.display());
            Ok(())
        }
    }
}

/// Run the simulation with the given container settings
fn run_simulation(
    requests: &[models::Request],
    args: ContainerArgs,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = models::SimulationConfig {
        threads: args.threads,
        capacity: args.capacity,
        bulk_passivate: args.bulk,
        timeout_secs: args.timeout,
        access_timeout_ms: Some(args.access_timeout),
        passivation_dir: args.passivation_dir,
    };

    println!("Container Simulation");
    println!("====================");
    println!("Requests: {}", requests.len());
    println!("Threads: {}", config.threads);
    println!(
        "Cache capacity: {} (bulk passivate {})",
        config.capacity, config.bulk_passivate
    );
    match config.timeout_secs {
        Some(secs) => println!("Idle timeout: {secs}s"),
        None => println!("Idle timeout: none"),
    }
    if let Some(dir) = &config.passivation_dir {
        println!("Passivation directory: {}", dir.display());
    }

    let result = runner::SimulationRunner::new(config).run(requests)?;
    println!("\nSimulation completed in {:.2?}", result.duration);
    println!("Total requests: {}", result.total_requests);

    let stats = stats::SimulationStats::from_result(&result);
    stats.print_results();

    if let Some(csv_path) = args.output_csv {
        match stats.export_csv(&csv_path) {
            Ok(()) => println!("\nResults exported to: {}", csv_path.display()),
            Err(e) => eprintln!("Failed to export CSV: {e}"),
        }
    }

    Ok(())
}
