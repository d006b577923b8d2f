//! State threaded through one migration run.

use std::collections::BTreeSet;
use std::path::PathBuf;

use anyhow::{Context, Result};
use colored::Colorize;
use tracing::{debug, info};

use super::path::MigrationWindow;
use super::storage::DrainPolicy;
use crate::error::is_not_found;
use crate::helm::client::ChartProvider;
use crate::k8s::cluster::ClusterOps;
use crate::k8s::manifest::ManifestSet;
use crate::values::ValuesTree;

/// Mutable state of one upgrade invocation. Nothing here outlives the run;
/// a re-run rebuilds it from the cluster and the chart provider.
pub struct UpgradeContext<'a> {
    pub release: String,
    pub namespace: String,
    pub chart_ref: String,
    pub values_file: Option<PathBuf>,
    pub window: MigrationWindow,
    pub cluster: &'a dyn ClusterOps,
    pub charts: &'a dyn ChartProvider,
    pub drain: DrainPolicy,

    /// Set when cert-manager must be upgraded after the release upgrade.
    pub upgrade_cert_manager: bool,
    /// Release values being migrated; loaded by the first step that needs them.
    pub values: Option<ValuesTree>,
    /// Superuser password captured before any mutation.
    pub db_credential: Option<String>,
    pub external_db_uri: Option<String>,
    pub tracing_enabled: bool,
    applied_sets: BTreeSet<&'static str>,
}

impl<'a> UpgradeContext<'a> {
    pub fn new(
        release: impl Into<String>,
        namespace: impl Into<String>,
        chart_ref: impl Into<String>,
        window: MigrationWindow,
        cluster: &'a dyn ClusterOps,
        charts: &'a dyn ChartProvider,
    ) -> Self {
        Self {
            release: release.into(),
            namespace: namespace.into(),
            chart_ref: chart_ref.into(),
            values_file: None,
            window,
            cluster,
            charts,
            drain: DrainPolicy::default(),
            upgrade_cert_manager: false,
            values: None,
            db_credential: None,
            external_db_uri: None,
            tracing_enabled: false,
            applied_sets: BTreeSet::new(),
        }
    }

    /// The deployed release's user-supplied values, fetched once.
    pub async fn values_mut(&mut self) -> Result<&mut ValuesTree> {
        if self.values.is_none() {
            let values = self
                .charts
                .release_values(&self.release, &self.namespace, false)
                .await
                .with_context(|| format!("Failed to read values of release {}", self.release))?;
            self.values = Some(values);
        }
        Ok(self.values.get_or_insert_with(ValuesTree::default))
    }

    /// Apply a manifest set unless this run already applied it.
    pub async fn apply_manifest_set(&mut self, set: &ManifestSet) -> Result<()> {
        if self.has_applied(set.name) {
            debug!("Manifest set {} already applied in this run", set.name);
            return Ok(());
        }

        self.cluster
            .apply_manifests(&self.namespace, set)
            .await
            .with_context(|| format!("Failed to apply {} manifests", set.name))?;
        self.applied_sets.insert(set.name);

        println!(
            "{} Successfully applied {}: {}",
            "✓".green(),
            set.name,
            set.resource_names().join(", ")
        );
        Ok(())
    }

    pub fn has_applied(&self, set_name: &str) -> bool {
        self.applied_sets.contains(set_name)
    }

    /// Treat an absent resource as already deleted.
    pub fn tolerate_not_found(result: Result<()>, kind: &str, name: &str) -> Result<()> {
        match result {
            Err(e) if is_not_found(&e) => {
                info!("{} {} not found, nothing to delete", kind, name);
                Ok(())
            }
            Err(e) => Err(e.context(format!("Failed to delete {kind} {name}"))),
            Ok(()) => Ok(()),
        }
    }

    /// Rendered values for the chart installer, `None` when no step loaded them.
    pub fn migrated_values(&self) -> Result<Option<String>> {
        self.values.as_ref().map(ValuesTree::to_yaml).transpose()
    }
}
