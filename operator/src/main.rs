use anyhow::{Context, Result};
use clap::Parser;
use kube::Client;
use owo_colors::OwoColorize;
use validator_types::BuildStrategyName;

mod actions;
mod build;
mod compare;
mod pod;
mod reconcile;
mod results;
mod util;
mod validation;

#[cfg(feature = "metrics")]
use std::sync::Arc;

#[derive(Parser, Debug, Clone)]
#[command(author, version, about = "Validates Jupyter notebooks by executing them in ephemeral pods", long_about = None)]
struct Cli {
    /// Namespace to watch for ValidationJob resources and to run leader election in.
    #[arg(long, env = "WATCH_NAMESPACE", default_value = "default")]
    namespace: String,

    /// Build strategies to attempt to enable; each is still gated by its own detect().
    #[arg(long, env = "ENABLED_BUILD_STRATEGIES", value_delimiter = ',', default_value = "s2i,tekton")]
    enabled_build_strategies: Vec<String>,

    /// Number of ValidationJob reconciles to run concurrently.
    #[arg(long, env = "WORKER_COUNT", default_value = "4")]
    worker_count: usize,

    /// Contend for a Lease before running the controller, for multi-replica HA.
    /// Single-replica deployments can skip lease contention entirely.
    #[arg(long, env = "LEADER_ELECT", default_value = "true")]
    leader_elect: bool,

    /// Address the Prometheus metrics/health server binds to.
    #[cfg(feature = "metrics")]
    #[arg(long, env = "METRICS_BIND_ADDRESS", default_value = "0.0.0.0:8080")]
    metrics_bind_address: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    validator_common::init();
    let cli = Cli::parse();

    let enabled_build_strategies: Vec<BuildStrategyName> = cli
        .enabled_build_strategies
        .iter()
        .filter_map(|s| {
            s.trim().parse::<BuildStrategyName>().map_err(|_| {
                eprintln!("{}", format!("ignoring unknown build strategy '{s}'").yellow());
            }).ok()
        })
        .collect();

    let client = Client::try_default()
        .await
        .context("Failed to create Kubernetes client from in-cluster or kubeconfig context")?;

    #[cfg(feature = "metrics")]
    let metrics = Arc::new(util::metrics::ControllerMetrics::new("validator"));

    #[cfg(feature = "metrics")]
    {
        let metrics = metrics.clone();
        let bind_address = cli.metrics_bind_address.clone();
        tokio::spawn(async move {
            if let Err(e) = util::metrics::run_metrics_server(&bind_address, metrics).await {
                eprintln!("{}", format!("metrics server exited: {e}").red());
            }
        });
    }

    reconcile::run(
        client,
        reconcile::ReconcilerConfig {
            namespace: cli.namespace,
            enabled_build_strategies,
            worker_count: cli.worker_count,
            leader_elect: cli.leader_elect,
            #[cfg(feature = "metrics")]
            metrics,
        },
    )
    .await
    .context("ValidationJob controller exited with an error")?;

    println!("{}", "🛑 validator-operator shut down gracefully.".red());
    Ok(())
}
