//! CLI configuration and argument parsing.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Args as ClapArgs, Parser, Subcommand};

use crate::upgrade::{DEFAULT_CHART, UpgradeRequest};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const COMMIT: &str = env!("BUILD_COMMIT");
pub const BUILD_DATE: &str = env!("BUILD_DATE");

/// The Observability Stack CLI.
///
/// Upgrades a deployed tobs release, carrying its values and stateful data
/// across chart versions that changed structure.
#[derive(Parser, Debug, Clone)]
#[command(name = "tobs")]
#[command(about = "CLI tool for The Observability Stack")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    /// Namespace the release is deployed in
    #[arg(short, long, global = true, default_value = "default", env = "TOBS_NAMESPACE")]
    pub namespace: String,

    /// Helm release name
    #[arg(long, global = true, default_value = "tobs", env = "TOBS_RELEASE_NAME")]
    pub name: String,

    /// Kubernetes context to use
    #[arg(long, global = true, env = "KUBECONFIG_CONTEXT")]
    pub context: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "warn", env = "TOBS_LOG_LEVEL")]
    pub log_level: String,

    /// Timeout in seconds for the whole operation
    #[arg(long, global = true, default_value = "1800")]
    pub timeout: u64,

    #[command(subcommand)]
    pub command: Command,
}

/// Available subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Upgrade The Observability Stack
    #[command(after_help = r#"Examples:
  tobs upgrade                       Upgrade to the latest chart
  tobs upgrade -f values.yaml -y     Upgrade with a values file, no prompt
  tobs upgrade --same-chart -f v.yaml  Apply new values to the deployed chart"#)]
    Upgrade(UpgradeArgs),
}

#[derive(ClapArgs, Debug, Clone)]
pub struct UpgradeArgs {
    /// Values file applied on top of the chart defaults
    #[arg(short, long)]
    pub filename: Option<PathBuf>,

    /// Helm chart reference
    #[arg(short = 'c', long, default_value = DEFAULT_CHART)]
    pub chart_reference: String,

    /// Reset the release to the chart's default values (same as helm)
    #[arg(long, default_value = "false")]
    pub reset_values: bool,

    /// Reuse the last release's values and merge in overrides (same as helm).
    /// Ignored when --reset-values is set.
    #[arg(long, default_value = "false")]
    pub reuse_values: bool,

    /// Keep the deployed chart and only apply new values
    #[arg(long, default_value = "false")]
    pub same_chart: bool,

    /// Skip confirmation prompts
    #[arg(short = 'y', long, default_value = "false")]
    pub confirm: bool,

    /// Skip creating CRDs on upgrade
    #[arg(long, default_value = "false")]
    pub skip_crds: bool,
}

/// Application configuration derived from CLI args.
#[derive(Debug, Clone)]
pub struct Config {
    pub namespace: String,
    pub release: String,
    pub context: Option<String>,
    pub log_level: String,
    pub timeout: Duration,
    pub command: Command,
}

impl Config {
    /// Create config from CLI arguments.
    pub fn from_args(args: Args) -> Self {
        Self {
            namespace: args.namespace,
            release: args.name,
            context: args.context,
            log_level: args.log_level,
            timeout: Duration::from_secs(args.timeout),
            command: args.command,
        }
    }

    /// Build the upgrade request for `tobs upgrade`.
    pub fn upgrade_request(&self, args: &UpgradeArgs) -> UpgradeRequest {
        UpgradeRequest {
            release: self.release.clone(),
            namespace: self.namespace.clone(),
            chart_ref: args.chart_reference.clone(),
            values_file: args.filename.clone(),
            // helm ignores reuse when reset is requested
            reset_values: args.reset_values,
            reuse_values: args.reuse_values && !args.reset_values,
            same_chart: args.same_chart,
            confirm: args.confirm,
            skip_crds: args.skip_crds,
        }
    }
}
