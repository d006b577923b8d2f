//! The ordered catalogue of version-gated migration steps.
//!
//! Steps run strictly in catalogue order. The order is part of the contract:
//! CRDs go in before anything that needs them, the Prometheus volume is
//! handed over before values are restructured, and the tracing step relies
//! on the flag captured while restructuring `promscale`.

use anyhow::{Context, Result};
use colored::Colorize;
use serde_yaml::Value;
use tracing::debug;

use super::context::UpgradeContext;
use super::crds;
use super::otel::{self, CertManagerState};
use super::path::{MigrationPath, MigrationWindow};
use super::promscale;
use super::storage::{PrometheusStorage, StorageMigrator};
use crate::k8s::cluster::labels;
use crate::values::{expect_bool, expect_str};

/// Secret key holding the database superuser password.
pub const DB_SUPERUSER_SECRET_KEY: &str = "PATRONI_SUPERUSER_PASSWORD";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepId {
    ApplyKubePrometheusCrds,
    RemoveNodeExporter,
    MigratePrometheusStorage,
    SnapshotDbCredential,
    RemoveKubeStateMetrics,
    RemoveGrafanaDbJob,
    RefreshKubePrometheusCrds,
    ExtractExternalDb,
    RestructurePromscale,
    MigrateTracing,
}

/// A step and the (deployed, target) windows it applies to.
#[derive(Debug, Clone, Copy)]
pub struct MigrationStep {
    pub id: StepId,
    pub description: &'static str,
    guard: fn(&MigrationWindow) -> bool,
}

impl MigrationStep {
    pub fn applies_to(&self, window: &MigrationWindow) -> bool {
        (self.guard)(window)
    }
}

fn crd_boundary_with_crds(w: &MigrationWindow) -> bool {
    w.crosses_crd_boundary() && !w.skip_crds
}

fn crd_boundary(w: &MigrationWindow) -> bool {
    w.crosses_crd_boundary()
}

fn storage_migration(w: &MigrationWindow) -> bool {
    w.needs_storage_migration()
}

fn path_to_0_8(w: &MigrationWindow) -> bool {
    w.path() == MigrationPath::PathTo0_8
}

pub const CATALOGUE: &[MigrationStep] = &[
    MigrationStep {
        id: StepId::ApplyKubePrometheusCrds,
        description: "Apply kube-prometheus CRDs",
        guard: crd_boundary_with_crds,
    },
    MigrationStep {
        id: StepId::RemoveNodeExporter,
        description: "Remove legacy node-exporter DaemonSet and Service",
        guard: crd_boundary,
    },
    MigrationStep {
        id: StepId::MigratePrometheusStorage,
        description: "Move Prometheus data to the operator-managed volume claim",
        guard: storage_migration,
    },
    MigrationStep {
        id: StepId::SnapshotDbCredential,
        description: "Capture the TimescaleDB superuser password",
        guard: path_to_0_8,
    },
    MigrationStep {
        id: StepId::RemoveKubeStateMetrics,
        description: "Remove kube-state-metrics Deployment",
        guard: path_to_0_8,
    },
    MigrationStep {
        id: StepId::RemoveGrafanaDbJob,
        description: "Remove the Grafana database job so it reruns",
        guard: path_to_0_8,
    },
    MigrationStep {
        id: StepId::RefreshKubePrometheusCrds,
        description: "Refresh kube-prometheus CRDs",
        guard: path_to_0_8,
    },
    MigrationStep {
        id: StepId::ExtractExternalDb,
        description: "Fold timescaledbExternal into the Promscale connection",
        guard: path_to_0_8,
    },
    MigrationStep {
        id: StepId::RestructurePromscale,
        description: "Restructure Promscale values",
        guard: path_to_0_8,
    },
    MigrationStep {
        id: StepId::MigrateTracing,
        description: "Migrate the OpenTelemetry collector (when tracing is enabled)",
        guard: path_to_0_8,
    },
];

/// Steps that apply to `window`, in execution order.
pub fn plan(window: &MigrationWindow) -> Vec<&'static MigrationStep> {
    CATALOGUE.iter().filter(|s| s.applies_to(window)).collect()
}

/// Run `steps` in order, stopping at the first failure.
pub async fn run(ctx: &mut UpgradeContext<'_>, steps: &[&MigrationStep]) -> Result<()> {
    let total = steps.len();
    debug!(
        "Running {} migration steps for {} -> {}",
        total, ctx.window.deployed, ctx.window.target
    );
    for (i, step) in steps.iter().enumerate() {
        println!(
            "{}",
            format!("[{}/{}] {}", i + 1, total, step.description).cyan()
        );
        run_step(ctx, step.id)
            .await
            .with_context(|| format!("Migration step '{}' failed", step.description))?;
    }
    Ok(())
}

async fn run_step(ctx: &mut UpgradeContext<'_>, id: StepId) -> Result<()> {
    match id {
        StepId::ApplyKubePrometheusCrds | StepId::RefreshKubePrometheusCrds => {
            ctx.apply_manifest_set(&crds::kube_prometheus()).await
        }
        StepId::RemoveNodeExporter => remove_node_exporter(ctx).await,
        StepId::MigratePrometheusStorage => {
            StorageMigrator::new(ctx.cluster, &ctx.namespace, ctx.drain)
                .migrate(&PrometheusStorage::for_release(&ctx.release))
                .await
        }
        StepId::SnapshotDbCredential => snapshot_db_credential(ctx).await,
        StepId::RemoveKubeStateMetrics => {
            let selector = labels([
                ("app.kubernetes.io/instance", ctx.release.as_str()),
                ("app.kubernetes.io/name", "kube-state-metrics"),
            ]);
            ctx.cluster
                .delete_deployments(&ctx.namespace, &selector)
                .await
                .context("Failed to delete kube-state-metrics")
        }
        StepId::RemoveGrafanaDbJob => {
            let job = format!("{}-grafana-db", ctx.release);
            let result = ctx.cluster.delete_job(&ctx.namespace, &job).await;
            UpgradeContext::tolerate_not_found(result, "Job", &job)
        }
        StepId::ExtractExternalDb => {
            let uri = promscale::extract_external_db(ctx.values_mut().await?)?;
            if uri.is_some() {
                debug!("Preserving external database URI");
            }
            ctx.external_db_uri = uri;
            Ok(())
        }
        StepId::RestructurePromscale => {
            let uri = ctx.external_db_uri.clone();
            let credential = ctx.db_credential.clone();
            let outcome =
                promscale::restructure(ctx.values_mut().await?, uri.as_deref(), credential.as_deref())?;
            if outcome.synthesized {
                debug!("promscale values were absent and have been synthesized");
            }
            ctx.tracing_enabled = outcome.tracing_enabled;
            Ok(())
        }
        StepId::MigrateTracing => migrate_tracing(ctx).await,
    }
}

async fn remove_node_exporter(ctx: &mut UpgradeContext<'_>) -> Result<()> {
    let name = format!("{}-prometheus-node-exporter", ctx.release);

    let result = ctx.cluster.delete_daemonset(&ctx.namespace, &name).await;
    UpgradeContext::tolerate_not_found(result, "DaemonSet", &name)?;

    let result = ctx.cluster.delete_service(&ctx.namespace, &name).await;
    UpgradeContext::tolerate_not_found(result, "Service", &name)
}

async fn snapshot_db_credential(ctx: &mut UpgradeContext<'_>) -> Result<()> {
    let computed = ctx
        .charts
        .release_values(&ctx.release, &ctx.namespace, true)
        .await
        .with_context(|| format!("Failed to read computed values of release {}", ctx.release))?;

    // Absent means the chart default, which enables the database.
    let enabled = match computed.get_path(&["timescaledb-single", "enabled"])? {
        Some(value) => expect_bool("timescaledb-single.enabled", value)?,
        None => true,
    };
    if !enabled {
        debug!("TimescaleDB is disabled, no credential to capture");
        return Ok(());
    }

    let secret = format!("{}-credentials", ctx.release);
    let password = ctx
        .cluster
        .secret_value(&ctx.namespace, &secret, DB_SUPERUSER_SECRET_KEY)
        .await
        .with_context(|| format!("Failed to read secret {secret}"))?;
    ctx.db_credential = Some(password);
    Ok(())
}

async fn migrate_tracing(ctx: &mut UpgradeContext<'_>) -> Result<()> {
    if !ctx.tracing_enabled {
        debug!("Tracing is not enabled, skipping collector migration");
        return Ok(());
    }

    ctx.apply_manifest_set(&crds::opentelemetry()).await?;

    let config = ctx
        .charts
        .chart_field(&ctx.chart_ref, ctx.values_file.as_deref(), otel::COLLECTOR_CONFIG_PATH)
        .await?
        .unwrap_or(Value::Null);
    let config = expect_str("opentelemetryOperator.collector.config", &config)?.to_string();

    match otel::cert_manager_state(ctx.cluster).await? {
        CertManagerState::Missing => {
            println!("cert-manager not found, installing version {}", crds::CERT_MANAGER_VERSION);
            ctx.apply_manifest_set(&crds::cert_manager()).await?;
        }
        CertManagerState::Outdated(installed) => {
            println!(
                "cert-manager {} is older than {}, it will be upgraded after the release",
                installed,
                crds::CERT_MANAGER_VERSION
            );
            ctx.upgrade_cert_manager = true;
        }
        CertManagerState::Current(installed) => {
            debug!("cert-manager {} satisfies {}", installed, crds::CERT_MANAGER_VERSION);
        }
    }

    otel::recreate_collector(ctx.cluster, &ctx.namespace, &ctx.release, &config).await?;
    otel::remove_jaeger_query(ctx.values_mut().await?)?;
    Ok(())
}
