//! Fedsim Simulation Engine CLI
//!
//! Runs a synthetic federated training job on the virtual clock and reports
//! how client heterogeneity shaped each round.

use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fedsim_simulation_engine::{Simulation, SimulationConfig};

#[derive(Parser, Debug)]
#[command(name = "fedsim")]
#[command(about = "Simulate client heterogeneity in federated learning rounds", long_about = None)]
struct Args {
    /// JSON config file; flags below override its values
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Number of clients
    #[arg(long)]
    clients: Option<usize>,

    /// Number of rounds
    #[arg(short, long)]
    rounds: Option<u64>,

    /// Clients sampled per round
    #[arg(short, long)]
    per_round: Option<usize>,

    /// Random seed
    #[arg(short, long)]
    seed: Option<u64>,

    /// Synchronous wait budget per round (virtual time units)
    #[arg(short, long)]
    tolerance: Option<u64>,

    /// Collect responses without waiting
    #[arg(short, long)]
    asynchronous: bool,

    /// Output JSON file path (optional)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

impl Args {
    fn into_config(self) -> anyhow::Result<(SimulationConfig, Option<PathBuf>)> {
        let mut config = match &self.config {
            Some(path) => SimulationConfig::from_file(path)
                .with_context(|| format!("loading config from {}", path.display()))?,
            None => SimulationConfig::default(),
        };
        if let Some(clients) = self.clients {
            config = config.with_clients(clients);
        }
        if let Some(rounds) = self.rounds {
            config = config.with_rounds(rounds);
        }
        if let Some(per_round) = self.per_round {
            config = config.with_clients_per_round(per_round);
        }
        if let Some(seed) = self.seed {
            config = config.with_seed(seed);
        }
        if let Some(tolerance) = self.tolerance {
            config = config.with_tolerance_for_latency(tolerance);
        }
        if self.asynchronous {
            config = config.with_asynchronous(true);
        }
        config.validate().context("invalid configuration")?;
        Ok((config, self.output))
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "fedsim=info,info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let (config, output) = Args::parse().into_config()?;

    println!("╔══════════════════════════════════════════════════════════╗");
    println!("║  Fedsim Simulation Engine                                ║");
    println!("╚══════════════════════════════════════════════════════════╝\n");

    println!("Configuration:");
    println!("  Clients: {} ({} per round)", config.num_clients, config.clients_per_round);
    println!("  Rounds: {}", config.num_rounds);
    println!("  Local steps: {}", config.num_steps);
    println!("  Tolerance for latency: {}", config.tolerance_for_latency);
    println!("  Mode: {}", if config.asynchronous { "asynchronous" } else { "synchronous" });
    println!("  Seed: {}\n", config.seed);

    let mut simulation = Simulation::new(config)?;
    info!("simulation initialized");
    let result = simulation.run()?;

    println!("Policies (availability, connectivity, completeness, responsiveness):");
    println!("  {}\n", result.policies.join(", "));

    println!("{:<8} {:>8} {:>8} {:>10} {:>12} {:>8} {:>8} {:>10} {:>10}",
        "Round", "Start", "End", "Selected", "Unavailable", "Dropped", "Overdue", "Received", "Loss");
    println!("{}", "-".repeat(92));

    for round in &result.rounds {
        let loss = round
            .mean_loss
            .map_or_else(|| "N/A".to_string(), |l| format!("{l:.4}"));
        println!("{:<8} {:>8} {:>8} {:>10} {:>12} {:>8} {:>8} {:>10} {:>10}",
            round.round,
            round.start_time,
            round.end_time,
            round.selected.len(),
            round.unavailable.len(),
            round.dropped.len(),
            round.overdue.len(),
            round.received.len(),
            loss,
        );
    }

    println!("{}", "-".repeat(92));
    println!("{:<8} {:>8} {:>8} {:>10} {:>12} {:>8} {:>8} {:>10}",
        "Total", "", result.final_time,
        result.total_selected,
        result.total_unavailable,
        result.total_dropped,
        result.total_overdue,
        result.total_received,
    );
    println!("\nFinal global model loss: {:.6}", result.final_loss);

    if let Some(output_path) = output {
        println!("\nWriting results to {}...", output_path.display());
        let json = serde_json::to_string_pretty(&result)?;
        fs::write(&output_path, json)
            .with_context(|| format!("writing {}", output_path.display()))?;
        println!("  Results saved");
    }

    println!("\n✅ Simulation complete!\n");
    Ok(())
}
