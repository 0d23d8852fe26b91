//! ClusterAdmin Simulator
//!
//! Runs AdminAPI scenarios against a simulated InnoDB cluster.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use clusteradmin_coordinator::CoordinatorConfig;
use clusteradmin_simulator::scenario::BUILTIN;
use clusteradmin_simulator::{Scenario, SimulationController};

/// ClusterAdmin Simulator CLI
#[derive(Parser, Debug)]
#[command(name = "simulator")]
#[command(about = "Run cluster administration scenarios against simulated servers")]
struct Args {
    /// Number of simulated servers to create
    #[arg(short = 'n', long, default_value = "4")]
    servers: usize,

    /// Built-in scenario to run
    #[arg(short, long, conflicts_with = "scenario_file")]
    scenario: Option<String>,

    /// Scenario to run, as a JSON file
    #[arg(long)]
    scenario_file: Option<PathBuf>,

    /// List built-in scenarios and exit
    #[arg(long)]
    list: bool,

    /// Members seeded into the cluster when no scenario is given
    #[arg(long, default_value = "3")]
    members: usize,

    /// Membership changes to make when no scenario is given
    #[arg(long, default_value = "10")]
    iterations: usize,

    /// Pause between membership changes, in milliseconds
    #[arg(long, default_value = "100")]
    pause_ms: u64,

    /// Emit logs as JSON
    #[arg(long)]
    json_logs: bool,

    /// Random seed for reproducibility
    #[arg(long)]
    seed: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(args.json_logs.then(|| fmt::layer().json()))
        .with((!args.json_logs).then(|| fmt::layer()))
        .init();

    if args.list {
        for name in BUILTIN {
            let scenario = Scenario::load(name)?;
            println!("{:<24} {}", scenario.name, scenario.description);
        }
        return Ok(());
    }

    let config = CoordinatorConfig::from_env();
    if let Err(e) = config.validate() {
        error!(error = %e, "Invalid configuration");
        return Err(anyhow::anyhow!("Configuration error: {}", e));
    }

    let scenario = match (&args.scenario, &args.scenario_file) {
        (Some(name), _) => Some(Scenario::load(name)?),
        (None, Some(path)) => Some(Scenario::from_file(path)?),
        (None, None) => None,
    };

    info!("Starting ClusterAdmin Simulator");

    let servers = scenario
        .as_ref()
        .map_or(args.servers, |s| args.servers.max(s.servers));
    let members = scenario.as_ref().map_or(args.members, |s| s.members);

    let mut controller = SimulationController::new(servers, config, args.seed);
    controller.initialize(members).await?;
    info!(servers, members, "Simulator initialized");

    let report = match &scenario {
        Some(scenario) => Some(controller.run_scenario(scenario).await?),
        None => {
            controller
                .run(args.iterations, Duration::from_millis(args.pause_ms))
                .await?;
            None
        }
    };

    let coordinator_metrics = controller.coordinator()?.metrics();
    controller.stop().await?;

    let metrics = controller.metrics().await;
    info!(
        invocations = metrics.total_invocations,
        succeeded = metrics.successful_invocations,
        failed = metrics.failed_invocations,
        average_latency_ms = metrics.average_latency_ms(),
        p99_latency_ms = metrics.p99_latency_ms(),
        "Simulation complete"
    );

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "scenario": report,
            "simulation": metrics,
            "coordinator": coordinator_metrics,
            "members": controller.topology().group_members(),
        }))?
    );

    match report {
        Some(report) if !report.passed() => Err(anyhow::anyhow!(
            "scenario '{}' failed {} expectation(s)",
            report.scenario,
            report.failures.len()
        )),
        _ => Ok(()),
    }
}
