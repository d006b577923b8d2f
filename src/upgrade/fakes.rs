//! In-memory recording fakes of the cluster and chart provider.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::Path;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;

use crate::error::TobsError;
use crate::helm::client::{ChartMetadata, ChartProvider, ReleaseSpec};
use crate::k8s::cluster::{ClusterOps, CustomResourceRef, Labels, OneShotJob, VolumeRebind, selector};
use crate::k8s::manifest::ManifestSet;
use crate::values::ValuesTree;

/// Call log shared by both fakes, in call order.
pub type CallLog = Arc<Mutex<Vec<String>>>;

/// Call prefixes that change cluster or release state. Repository refresh
/// only touches the local chart cache and is not one of them.
const MUTATIONS: &[&str] = &["scale", "delete-", "create-", "rebind", "apply", "install"];

fn record(log: &CallLog, call: String) {
    log.lock().unwrap().push(call);
}

fn not_found(kind: &str, name: &str) -> anyhow::Error {
    TobsError::NotFound {
        kind: kind.to_string(),
        name: name.to_string(),
    }
    .into()
}

#[derive(Default)]
struct ClusterState {
    /// `Kind/name` of resources that exist.
    existing: BTreeSet<String>,
    /// `namespace/name` to replica count.
    deployments: BTreeMap<String, i32>,
    /// `namespace/name` to first container image.
    images: BTreeMap<String, String>,
    /// `namespace/name/key` to decoded value.
    secrets: BTreeMap<String, String>,
    /// Pod counts returned by successive polls; the last one repeats.
    pod_counts: VecDeque<usize>,
    /// Call prefixes that fail with a cluster error.
    failing: Vec<String>,
}

pub struct FakeCluster {
    log: CallLog,
    state: Mutex<ClusterState>,
}

impl FakeCluster {
    pub fn new() -> Self {
        let mut state = ClusterState::default();
        state.deployments.insert("default/tobs-prometheus-server".to_string(), 1);
        state.pod_counts.push_back(0);
        Self {
            log: CallLog::default(),
            state: Mutex::new(state),
        }
    }

    pub fn log(&self) -> CallLog {
        Arc::clone(&self.log)
    }

    pub fn with_existing(self, key: &str) -> Self {
        self.state.lock().unwrap().existing.insert(key.to_string());
        self
    }

    pub fn with_existing_job(self, name: &str) -> Self {
        self.with_existing(&format!("Job/{name}"))
    }

    pub fn without_deployment(self, name: &str) -> Self {
        self.state.lock().unwrap().deployments.remove(&format!("default/{name}"));
        self
    }

    pub fn with_image(self, deployment: &str, image: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .images
            .insert(deployment.to_string(), image.to_string());
        self
    }

    pub fn with_secret(self, secret: &str, key: &str, value: &str) -> Self {
        self.state
            .lock()
            .unwrap()
            .secrets
            .insert(format!("{secret}/{key}"), value.to_string());
        self
    }

    pub fn with_pod_counts<const N: usize>(self, counts: [usize; N]) -> Self {
        self.state.lock().unwrap().pod_counts = counts.into_iter().collect();
        self
    }

    pub fn failing(self, prefix: &str) -> Self {
        self.state.lock().unwrap().failing.push(prefix.to_string());
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }

    pub fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| c.starts_with(prefix))
            .collect()
    }

    /// Calls that changed cluster or release state.
    pub fn mutations(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| MUTATIONS.iter().any(|m| c.starts_with(m)))
            .collect()
    }

    /// Record a call and fail it if configured to.
    fn call(&self, call: String) -> Result<()> {
        let fail = self
            .state
            .lock()
            .unwrap()
            .failing
            .iter()
            .any(|p| call.starts_with(p.as_str()));
        record(&self.log, call.clone());
        if fail {
            return Err(TobsError::ClusterOperation {
                operation: "call".to_string(),
                target: call,
                message: "injected failure".to_string(),
            }
            .into());
        }
        Ok(())
    }

    fn delete(&self, call: String, kind: &str, name: &str) -> Result<()> {
        self.call(call)?;
        if self.state.lock().unwrap().existing.remove(&format!("{kind}/{name}")) {
            Ok(())
        } else {
            Err(not_found(kind, name))
        }
    }

    fn create(&self, call: String, kind: &str, name: &str) -> Result<()> {
        self.call(call)?;
        if self.state.lock().unwrap().existing.insert(format!("{kind}/{name}")) {
            Ok(())
        } else {
            Err(TobsError::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            }
            .into())
        }
    }
}

#[async_trait]
impl ClusterOps for FakeCluster {
    async fn deployment_replicas(&self, namespace: &str, name: &str) -> Result<i32> {
        self.call(format!("get-replicas {namespace}/{name}"))?;
        self.state
            .lock()
            .unwrap()
            .deployments
            .get(&format!("{namespace}/{name}"))
            .copied()
            .ok_or_else(|| not_found("Deployment", name))
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        self.call(format!("scale {namespace}/{name} {replicas}"))?;
        self.state
            .lock()
            .unwrap()
            .deployments
            .insert(format!("{namespace}/{name}"), replicas);
        Ok(())
    }

    async fn deployment_image(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        self.call(format!("get-image {namespace}/{name}"))?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .images
            .get(&format!("{namespace}/{name}"))
            .cloned())
    }

    async fn delete_deployments(&self, namespace: &str, labels: &Labels) -> Result<()> {
        self.call(format!("delete-deployments {namespace} {}", selector(labels)))
    }

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete(format!("delete-daemonset {namespace}/{name}"), "DaemonSet", name)
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete(format!("delete-service {namespace}/{name}"), "Service", name)
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        self.delete(format!("delete-job {namespace}/{name}"), "Job", name)
    }

    async fn create_job(&self, namespace: &str, job: &OneShotJob) -> Result<()> {
        self.create(format!("create-job {namespace}/{}", job.name), "Job", &job.name)
    }

    async fn list_pods(&self, namespace: &str, labels: &Labels) -> Result<Vec<String>> {
        self.call(format!("list-pods {namespace} {}", selector(labels)))?;
        let mut state = self.state.lock().unwrap();
        let count = if state.pod_counts.len() > 1 {
            state.pod_counts.pop_front().unwrap_or_default()
        } else {
            state.pod_counts.front().copied().unwrap_or_default()
        };
        Ok((0..count).map(|i| format!("prometheus-server-{i}")).collect())
    }

    async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        self.call(format!("get-secret {namespace}/{name}/{key}"))?;
        self.state
            .lock()
            .unwrap()
            .secrets
            .get(&format!("{namespace}/{name}/{key}"))
            .cloned()
            .ok_or_else(|| not_found("Secret", name))
    }

    async fn rebind_volume(&self, namespace: &str, rebind: &VolumeRebind) -> Result<()> {
        self.call(format!(
            "rebind {namespace} {}->{}",
            rebind.old_claim, rebind.new_claim
        ))
    }

    async fn apply_manifests(&self, namespace: &str, set: &ManifestSet) -> Result<()> {
        self.call(format!("apply {namespace} {}", set.name))
    }

    async fn delete_custom_resource(&self, namespace: &str, resource: &CustomResourceRef) -> Result<()> {
        self.delete(
            format!("delete-cr {namespace} {}/{}", resource.kind, resource.name),
            &resource.kind,
            &resource.name,
        )
    }

    async fn create_custom_resource(
        &self,
        namespace: &str,
        resource: &CustomResourceRef,
        _spec: serde_json::Value,
    ) -> Result<()> {
        self.create(
            format!("create-cr {namespace} {}/{}", resource.kind, resource.name),
            &resource.kind,
            &resource.name,
        )
    }
}

fn metadata(version: &str) -> ChartMetadata {
    ChartMetadata {
        name: "tobs".to_string(),
        version: version.to_string(),
        app_version: Some(version.to_string()),
    }
}

fn parse(yaml: &str) -> ValuesTree {
    ValuesTree::from_yaml_str(yaml).unwrap()
}

pub struct FakeCharts {
    log: CallLog,
    latest: ChartMetadata,
    deployed: Option<ChartMetadata>,
    release_values: ValuesTree,
    computed_values: ValuesTree,
    chart_values: ValuesTree,
    installs: Mutex<Vec<ReleaseSpec>>,
}

impl FakeCharts {
    pub fn new(log: CallLog) -> Self {
        Self {
            log,
            latest: metadata("0.9.0"),
            deployed: Some(metadata("0.8.5")),
            release_values: ValuesTree::default(),
            computed_values: ValuesTree::default(),
            chart_values: ValuesTree::default(),
            installs: Mutex::new(Vec::new()),
        }
    }

    pub fn with_latest(mut self, version: &str) -> Self {
        self.latest = metadata(version);
        self
    }

    pub fn with_deployed(mut self, version: Option<&str>) -> Self {
        self.deployed = version.map(metadata);
        self
    }

    pub fn with_release_values(mut self, yaml: &str) -> Self {
        self.release_values = parse(yaml);
        self
    }

    pub fn with_computed_values(mut self, yaml: &str) -> Self {
        self.computed_values = parse(yaml);
        self
    }

    pub fn with_chart_values(mut self, yaml: &str) -> Self {
        self.chart_values = parse(yaml);
        self
    }

    pub fn installs(&self) -> Vec<ReleaseSpec> {
        self.installs.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChartProvider for FakeCharts {
    async fn add_or_update_repo(&self, name: &str, _url: &str) -> Result<()> {
        record(&self.log, format!("repo-update {name}"));
        Ok(())
    }

    async fn chart_metadata(&self, chart_ref: &str) -> Result<ChartMetadata> {
        record(&self.log, format!("chart-metadata {chart_ref}"));
        Ok(self.latest.clone())
    }

    async fn chart_values(&self, chart_ref: &str, values_file: Option<&Path>) -> Result<ValuesTree> {
        record(&self.log, format!("chart-values {chart_ref}"));
        let mut values = self.chart_values.clone();
        if let Some(path) = values_file {
            values.merge(&ValuesTree::load_file(path)?);
        }
        Ok(values)
    }

    async fn deployed_chart(&self, release: &str, namespace: &str) -> Result<Option<ChartMetadata>> {
        record(&self.log, format!("deployed-chart {namespace}/{release}"));
        Ok(self.deployed.clone())
    }

    async fn release_values(&self, release: &str, namespace: &str, all: bool) -> Result<ValuesTree> {
        record(&self.log, format!("release-values {namespace}/{release} all={all}"));
        if all {
            let mut values = self.computed_values.clone();
            values.merge(&self.release_values);
            Ok(values)
        } else {
            Ok(self.release_values.clone())
        }
    }

    async fn install_or_upgrade(&self, spec: &ReleaseSpec) -> Result<()> {
        record(&self.log, format!("install {} {}", spec.release, spec.chart_ref));
        self.installs.lock().unwrap().push(spec.clone());
        Ok(())
    }
}
