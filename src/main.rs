//! tobs - The Observability Stack CLI.
//!
//! Upgrades a deployed observability stack release with:
//! - Upgrade legality checks against fixed version boundaries
//! - Ordered, version-gated values and resource migrations
//! - Prometheus volume hand-over across the CRD boundary
//! - Deferred cert-manager upgrade after the release upgrade

mod config;
mod error;
mod helm;
mod k8s;
mod output;
mod upgrade;
mod values;
mod version;

use anyhow::Result;
use clap::Parser;
use tracing::debug;

use config::{Args, Command, Config};
use error::TobsError;
use helm::client::HelmCli;
use k8s::client::build_client;
use k8s::cluster::KubeCluster;
use upgrade::{TerminalConfirmation, Upgrader};
use version::MigrationBoundaries;

#[tokio::main]
async fn main() {
    let args = Args::parse();
    let config = Config::from_args(args);

    // Initialize logging
    if let Err(e) = init_tracing(&config.log_level) {
        eprintln!("Failed to initialize logging: {}", e);
        std::process::exit(1);
    }

    debug!("Starting tobs {}", config::VERSION);

    let result = match tokio::time::timeout(config.timeout, run(&config)).await {
        Ok(result) => result,
        Err(_) => Err(TobsError::Timeout {
            operation: "upgrade".to_string(),
            details: format!(
                "did not complete within {} seconds",
                config.timeout.as_secs()
            ),
        }
        .into()),
    };

    if let Err(e) = result {
        eprintln!("Error: {:#}", e);
        std::process::exit(1);
    }
}

/// Main application logic.
async fn run(config: &Config) -> Result<()> {
    match &config.command {
        Command::Upgrade(args) => {
            let request = config.upgrade_request(args);
            let boundaries = MigrationBoundaries::standard()?;

            let client = build_client(config.context.as_deref()).await?;
            let cluster = KubeCluster::new(client);
            let charts = HelmCli::new(config.context.clone());
            let prompt = TerminalConfirmation;

            let outcome = Upgrader::new(&cluster, &charts, &prompt, boundaries)
                .run(&request)
                .await?;
            output::print_outcome(&outcome);
            Ok(())
        }
    }
}

/// Initialize tracing subscriber. Diagnostics go to stderr so they never mix
/// with progress output.
fn init_tracing(log_level: &str) -> Result<()> {
    use tracing_subscriber::{EnvFilter, fmt};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(log_level))
        .map_err(|e| anyhow::anyhow!("Failed to initialize log filter: {}", e))?;

    fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    Ok(())
}
