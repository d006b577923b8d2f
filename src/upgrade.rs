//! Upgrade orchestration.
//!
//! The [`Upgrader`] decides whether an upgrade is legal, picks the migration
//! path, runs the applicable steps in order and only then hands the resulting
//! values to the chart installer. Any failure before that point leaves the
//! release itself untouched.

pub mod context;
pub mod crds;
#[cfg(test)]
pub mod fakes;
pub mod otel;
pub mod path;
pub mod promscale;
pub mod steps;
pub mod storage;

use std::path::PathBuf;

use anyhow::{Context, Result};
use dialoguer::Confirm;
use tracing::{debug, info};

use crate::error::TobsError;
use crate::helm::client::{ChartProvider, ReleaseSpec};
use crate::k8s::cluster::ClusterOps;
use crate::output;
use crate::version::{MigrationBoundaries, Version};
use context::UpgradeContext;
use path::{MigrationPath, MigrationWindow, ReleaseState};
use storage::DrainPolicy;

/// Chart reference used when none is given.
pub const DEFAULT_CHART: &str = "timescale/tobs";
pub const DEFAULT_REPO_NAME: &str = "timescale";
pub const DEFAULT_REPO_URL: &str = "https://charts.timescale.com";

/// One `upgrade` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub release: String,
    pub namespace: String,
    pub chart_ref: String,
    pub values_file: Option<PathBuf>,
    pub reset_values: bool,
    pub reuse_values: bool,
    pub same_chart: bool,
    /// Skip the interactive confirmation.
    pub confirm: bool,
    pub skip_crds: bool,
}

impl UpgradeRequest {
    fn release_spec(&self, version: &str, values_yaml: Option<String>) -> ReleaseSpec {
        ReleaseSpec {
            release: self.release.clone(),
            chart_ref: self.chart_ref.clone(),
            version: Some(version.to_string()),
            namespace: self.namespace.clone(),
            values_files: self.values_file.iter().cloned().collect(),
            values_yaml,
            reset_values: self.reset_values,
            reuse_values: self.reuse_values,
        }
    }
}

/// Gate in front of every mutating action.
pub trait Confirmation: Send + Sync {
    fn confirm(&self, prompt: &str) -> Result<bool>;
}

/// Asks on the terminal.
pub struct TerminalConfirmation;

impl Confirmation for TerminalConfirmation {
    fn confirm(&self, prompt: &str) -> Result<bool> {
        Confirm::new()
            .with_prompt(prompt)
            .default(false)
            .interact()
            .context("Failed to read confirmation")
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpgradeOutcome {
    /// No release existed, so the chart was installed.
    Installed { release: String, version: String },
    Upgraded {
        release: String,
        version: String,
        path: MigrationPath,
        cert_manager_upgraded: bool,
    },
}

pub struct Upgrader<'a> {
    cluster: &'a dyn ClusterOps,
    charts: &'a dyn ChartProvider,
    prompt: &'a dyn Confirmation,
    boundaries: MigrationBoundaries,
    drain: DrainPolicy,
}

impl<'a> Upgrader<'a> {
    pub fn new(
        cluster: &'a dyn ClusterOps,
        charts: &'a dyn ChartProvider,
        prompt: &'a dyn Confirmation,
        boundaries: MigrationBoundaries,
    ) -> Self {
        Self {
            cluster,
            charts,
            prompt,
            boundaries,
            drain: DrainPolicy::default(),
        }
    }

    pub fn with_drain_policy(mut self, drain: DrainPolicy) -> Self {
        self.drain = drain;
        self
    }

    fn confirm(&self, request: &UpgradeRequest, prompt: &str) -> Result<()> {
        if request.confirm || self.prompt.confirm(prompt)? {
            Ok(())
        } else {
            Err(TobsError::UserCancelled.into())
        }
    }

    pub async fn run(&self, request: &UpgradeRequest) -> Result<UpgradeOutcome> {
        // Only the default chart comes from a repository we manage.
        if request.chart_ref == DEFAULT_CHART && !request.same_chart {
            self.charts
                .add_or_update_repo(DEFAULT_REPO_NAME, DEFAULT_REPO_URL)
                .await
                .context("Failed to add and update the tobs chart repository")?;
        }

        let latest = self
            .charts
            .chart_metadata(&request.chart_ref)
            .await
            .with_context(|| format!("Failed to read chart {}", request.chart_ref))?;

        let deployed = self
            .charts
            .deployed_chart(&request.release, &request.namespace)
            .await?;

        let latest_version =
            Version::parse(&latest.version, 3).context("Failed to parse latest chart version")?;
        let deployed_version = deployed
            .as_ref()
            .map(|chart| Version::parse(&chart.version, 3))
            .transpose()
            .context("Failed to parse deployed chart version")?;
        debug!(
            "Deployed chart {:?}, latest chart {} {} (app {})",
            deployed.as_ref().map(|c| format!("{} {}", c.name, c.version)),
            latest.name,
            latest_version,
            latest.app_version.as_deref().unwrap_or("-")
        );

        let values_identical = match deployed_version {
            Some(deployed) if path::needs_values_comparison(latest_version, deployed) => {
                self.values_identical(request).await?
            }
            _ => false,
        };

        let state = path::release_state(
            deployed_version,
            latest_version,
            request.same_chart,
            values_identical,
        )?;

        // Re-valuing pins the deployed chart, even when the chart source
        // reports an older one.
        let (deployed_version, target_version, target_label) =
            match (state, deployed_version, deployed) {
                (ReleaseState::UpToDate, ..) => return Err(TobsError::NothingToUpgrade.into()),
                (ReleaseState::NewerChartAvailable, Some(version), Some(_)) => {
                    println!("Upgrading to latest helm chart version: {}", latest.version);
                    (version, latest_version, latest.version.clone())
                }
                (ReleaseState::SameChartRevalue, Some(version), Some(chart)) => {
                    println!("Upgrading the existing helm chart with the provided values");
                    (version, version, chart.version)
                }
                // NoDeployment is the only state without a deployed chart.
                _ => return self.install(request, &latest.version).await,
            };

        let window = MigrationWindow {
            deployed: deployed_version,
            target: target_version,
            boundaries: self.boundaries,
            skip_crds: request.skip_crds,
        };
        // Legality is settled before anything is confirmed or touched.
        let migration = window.ensure_supported()?;
        let plan = steps::plan(&window);

        output::print_plan(&request.release, deployed_version, target_version, migration, &plan);
        self.confirm(request, "Proceed with the upgrade?")?;

        let mut ctx = UpgradeContext::new(
            &request.release,
            &request.namespace,
            &request.chart_ref,
            window,
            self.cluster,
            self.charts,
        );
        ctx.values_file = request.values_file.clone();
        ctx.drain = self.drain;

        if !plan.is_empty() {
            output::print_phase("Migrating release");
            steps::run(&mut ctx, &plan).await?;
        }

        output::print_phase(&format!("Upgrading to chart {target_label}"));
        let spec = request.release_spec(&target_label, ctx.migrated_values()?);
        self.charts
            .install_or_upgrade(&spec)
            .await
            .context("Failed to upgrade")?;

        // cert-manager goes last: upgrading it first breaks the installer's
        // diff against resources still using its removed API versions.
        let cert_manager_upgraded = ctx.upgrade_cert_manager;
        if cert_manager_upgraded {
            output::print_phase("Upgrading cert-manager");
            ctx.apply_manifest_set(&crds::cert_manager()).await?;
        }

        Ok(UpgradeOutcome::Upgraded {
            release: request.release.clone(),
            version: target_label,
            path: migration,
            cert_manager_upgraded,
        })
    }

    /// Deployed user values against the chart defaults merged with the
    /// user's values file, compared through their canonical encoding.
    async fn values_identical(&self, request: &UpgradeRequest) -> Result<bool> {
        let deployed = self
            .charts
            .release_values(&request.release, &request.namespace, false)
            .await
            .with_context(|| format!("Failed to read values of release {}", request.release))?;
        let provided = self
            .charts
            .chart_values(&request.chart_ref, request.values_file.as_deref())
            .await?;
        deployed.same_as(&provided)
    }

    async fn install(&self, request: &UpgradeRequest, version: &str) -> Result<UpgradeOutcome> {
        println!(
            "Couldn't find the existing {} deployment. Deploying tobs...",
            request.release
        );
        self.confirm(request, "Install the observability stack?")?;

        info!("Installing release {} in {}", request.release, request.namespace);
        self.charts
            .install_or_upgrade(&request.release_spec(version, None))
            .await
            .context("Failed to install")?;

        Ok(UpgradeOutcome::Installed {
            release: request.release.clone(),
            version: version.to_string(),
        })
    }
}
