//! Chart and release access through the `helm` CLI.

use std::io::Write;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Deserialize;
use serde_yaml::Value;
use tracing::debug;

use crate::error::TobsError;
use crate::values::ValuesTree;

/// Chart identity as reported by `helm show chart` or a deployed release.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChartMetadata {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub app_version: Option<String>,
}

/// Everything needed for one `helm upgrade --install`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleaseSpec {
    pub release: String,
    pub chart_ref: String,
    /// Chart version to install; `None` lets helm pick the newest.
    pub version: Option<String>,
    pub namespace: String,
    /// User-supplied values files, applied after `values_yaml`.
    pub values_files: Vec<PathBuf>,
    /// Values generated by the migration engine.
    pub values_yaml: Option<String>,
    pub reset_values: bool,
    pub reuse_values: bool,
}

/// Chart repository and release operations consumed by the upgrade engine.
#[async_trait]
pub trait ChartProvider: Send + Sync {
    async fn add_or_update_repo(&self, name: &str, url: &str) -> Result<()>;

    async fn chart_metadata(&self, chart_ref: &str) -> Result<ChartMetadata>;

    /// Chart default values with an optional values file merged on top.
    async fn chart_values(&self, chart_ref: &str, values_file: Option<&Path>) -> Result<ValuesTree>;

    /// Chart of the deployed release, `None` when no such release exists.
    async fn deployed_chart(&self, release: &str, namespace: &str) -> Result<Option<ChartMetadata>>;

    /// Values of the deployed release; `all` includes computed chart defaults.
    async fn release_values(&self, release: &str, namespace: &str, all: bool) -> Result<ValuesTree>;

    async fn install_or_upgrade(&self, spec: &ReleaseSpec) -> Result<()>;

    /// One field of the chart values, addressed by key path.
    async fn chart_field(
        &self,
        chart_ref: &str,
        values_file: Option<&Path>,
        path: &[&str],
    ) -> Result<Option<Value>> {
        let values = self.chart_values(chart_ref, values_file).await?;
        Ok(values.get_path(path)?.cloned())
    }
}

/// [`ChartProvider`] that shells out to the `helm` binary.
#[derive(Debug, Clone)]
pub struct HelmCli {
    binary: String,
    kube_context: Option<String>,
}

impl HelmCli {
    pub fn new(kube_context: Option<String>) -> Self {
        Self {
            binary: std::env::var("TOBS_HELM_BINARY").unwrap_or_else(|_| "helm".to_string()),
            kube_context,
        }
    }

    /// Run helm and return stdout. Failures carry helm's stderr.
    async fn run(&self, args: &[String]) -> Result<String> {
        let mut cmd = tokio::process::Command::new(&self.binary);
        // A dropped future (the overall timeout) must not leave helm running.
        cmd.args(args).kill_on_drop(true);
        if let Some(ctx) = &self.kube_context {
            cmd.args(["--kube-context", ctx.as_str()]);
        }

        debug!("Running: {} {}", self.binary, args.join(" "));

        let output = cmd
            .output()
            .await
            .with_context(|| format!("Failed to execute '{}'. Is helm installed?", self.binary))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TobsError::Helm(format!(
                "helm {} failed: {}",
                args.first().map(String::as_str).unwrap_or_default(),
                stderr.trim()
            ))
            .into());
        }

        String::from_utf8(output.stdout).context("helm produced non UTF-8 output")
    }
}

fn owned(args: &[&str]) -> Vec<String> {
    args.iter().map(|s| s.to_string()).collect()
}

/// Output of `helm get metadata -o json`.
#[derive(Debug, Deserialize)]
struct ReleaseMetadata {
    chart: String,
    version: String,
    #[serde(default, rename = "appVersion")]
    app_version: Option<String>,
}

fn parse_release_metadata(json: &str) -> Result<ChartMetadata> {
    let metadata: ReleaseMetadata =
        serde_json::from_str(json).context("Failed to parse helm release metadata")?;
    Ok(ChartMetadata {
        name: metadata.chart,
        version: metadata.version,
        app_version: metadata.app_version,
    })
}

fn is_release_not_found(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<TobsError>(),
        Some(TobsError::Helm(msg)) if msg.contains("not found")
    )
}

/// Arguments for `helm upgrade --install`. `generated` is the path of the
/// engine's values file, placed before user files so theirs take precedence.
pub fn upgrade_args(spec: &ReleaseSpec, generated: Option<&Path>) -> Vec<String> {
    let mut args = owned(&["upgrade", "--install", spec.release.as_str(), spec.chart_ref.as_str()]);
    args.extend(owned(&["--namespace", spec.namespace.as_str(), "--create-namespace"]));

    if let Some(version) = &spec.version {
        args.extend(["--version".to_string(), version.clone()]);
    }

    if spec.reset_values {
        args.push("--reset-values".to_string());
    }
    if spec.reuse_values {
        args.push("--reuse-values".to_string());
    }
    if let Some(path) = generated {
        args.extend(["--values".to_string(), path.display().to_string()]);
    }
    for file in &spec.values_files {
        args.extend(["--values".to_string(), file.display().to_string()]);
    }

    args
}

#[async_trait]
impl ChartProvider for HelmCli {
    async fn add_or_update_repo(&self, name: &str, url: &str) -> Result<()> {
        self.run(&owned(&["repo", "add", name, url, "--force-update"]))
            .await?;
        self.run(&owned(&["repo", "update", name])).await?;
        debug!("Updated chart repository {} ({})", name, url);
        Ok(())
    }

    async fn chart_metadata(&self, chart_ref: &str) -> Result<ChartMetadata> {
        let out = self.run(&owned(&["show", "chart", chart_ref])).await?;
        serde_yaml::from_str(&out)
            .with_context(|| format!("Failed to parse chart metadata of {chart_ref}"))
    }

    async fn chart_values(&self, chart_ref: &str, values_file: Option<&Path>) -> Result<ValuesTree> {
        let out = self.run(&owned(&["show", "values", chart_ref])).await?;
        let mut values = ValuesTree::from_yaml_str(&out)
            .with_context(|| format!("Failed to parse default values of {chart_ref}"))?;

        if let Some(path) = values_file {
            values.merge(&ValuesTree::load_file(path)?);
        }
        Ok(values)
    }

    async fn deployed_chart(&self, release: &str, namespace: &str) -> Result<Option<ChartMetadata>> {
        let args = owned(&["get", "metadata", release, "--namespace", namespace, "--output", "json"]);
        match self.run(&args).await {
            Ok(out) => Ok(Some(parse_release_metadata(&out)?)),
            Err(e) if is_release_not_found(&e) => {
                debug!("Release {} not found in {}", release, namespace);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    async fn release_values(&self, release: &str, namespace: &str, all: bool) -> Result<ValuesTree> {
        let mut args = owned(&["get", "values", release, "--namespace", namespace, "--output", "json"]);
        if all {
            args.push("--all".to_string());
        }
        let out = self.run(&args).await?;
        ValuesTree::from_yaml_str(&out)
            .with_context(|| format!("Failed to parse values of release {release}"))
    }

    async fn install_or_upgrade(&self, spec: &ReleaseSpec) -> Result<()> {
        // Kept alive until helm exits.
        let generated = match &spec.values_yaml {
            Some(yaml) => {
                let mut file = tempfile::Builder::new()
                    .prefix("tobs-values-")
                    .suffix(".yaml")
                    .tempfile()
                    .context("Failed to create temporary values file")?;
                file.write_all(yaml.as_bytes())
                    .context("Failed to write temporary values file")?;
                Some(file)
            }
            None => None,
        };

        let args = upgrade_args(spec, generated.as_ref().map(|f| f.path()));
        self.run(&args).await?;
        Ok(())
    }
}
