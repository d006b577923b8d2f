//! Typed façade over the cluster control plane.
//!
//! [`ClusterOps`] is the only surface the migration engine uses to touch the
//! cluster. Deletes report an absent resource as [`TobsError::NotFound`] and
//! creates report a clash as [`TobsError::AlreadyExists`]; deciding whether
//! those are tolerable is left to the caller.

use std::collections::BTreeMap;

use anyhow::Result;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{DaemonSet, Deployment};
use k8s_openapi::api::batch::v1::{Job, JobSpec};
use k8s_openapi::api::core::v1::{
    Container, PersistentVolume, PersistentVolumeClaim, PersistentVolumeClaimSpec,
    PersistentVolumeClaimVolumeSource, Pod, PodSpec, PodTemplateSpec, Secret, Service, Volume,
    VolumeMount, VolumeResourceRequirements,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use kube::Api;
use kube::api::{ApiResource, DeleteParams, DynamicObject, ListParams, Patch, PatchParams, PostParams};
use serde_json::json;
use tracing::{debug, info};

use super::manifest::{self, ManifestSet};
use crate::error::TobsError;

/// Label key/value pairs, kept sorted for stable selectors.
pub type Labels = BTreeMap<String, String>;

/// Build a `Labels` map from string pairs.
pub fn labels<const N: usize>(pairs: [(&str, &str); N]) -> Labels {
    pairs
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Render labels as an equality-based selector (`a=b,c=d`).
pub fn selector(labels: &Labels) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// A short-lived job that mounts one persistent volume claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OneShotJob {
    pub name: String,
    pub labels: Labels,
    pub image: String,
    pub command: Vec<String>,
    pub claim_name: String,
    pub volume_name: String,
    pub mount_path: String,
    pub backoff_limit: i32,
    pub restart_policy: String,
}

/// Move the volume behind `old_claim` to a new claim that selects it by label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeRebind {
    pub old_claim: String,
    pub new_claim: String,
    pub labels: Labels,
}

/// Coordinates of a namespaced custom resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CustomResourceRef {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub name: String,
}

impl CustomResourceRef {
    fn api_resource(&self) -> ApiResource {
        ApiResource {
            group: self.group.clone(),
            version: self.version.clone(),
            api_version: format!("{}/{}", self.group, self.version),
            kind: self.kind.clone(),
            plural: self.plural.clone(),
        }
    }
}

/// Cluster operations consumed by the upgrade engine.
#[async_trait]
pub trait ClusterOps: Send + Sync {
    /// Current desired replica count of a Deployment.
    async fn deployment_replicas(&self, namespace: &str, name: &str) -> Result<i32>;

    /// Set the desired replica count of a Deployment.
    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()>;

    /// Image of the first container of a Deployment, `None` if the Deployment is absent.
    async fn deployment_image(&self, namespace: &str, name: &str) -> Result<Option<String>>;

    /// Delete every Deployment matching `labels`. Matching nothing is not an error.
    async fn delete_deployments(&self, namespace: &str, labels: &Labels) -> Result<()>;

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()>;

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()>;

    async fn create_job(&self, namespace: &str, job: &OneShotJob) -> Result<()>;

    /// Names of pods matching `labels`.
    async fn list_pods(&self, namespace: &str, labels: &Labels) -> Result<Vec<String>>;

    /// One decoded key of an opaque Secret.
    async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<String>;

    async fn rebind_volume(&self, namespace: &str, rebind: &VolumeRebind) -> Result<()>;

    /// Apply every manifest in the set (apply-or-replace).
    async fn apply_manifests(&self, namespace: &str, set: &ManifestSet) -> Result<()>;

    async fn delete_custom_resource(&self, namespace: &str, resource: &CustomResourceRef) -> Result<()>;

    async fn create_custom_resource(
        &self,
        namespace: &str,
        resource: &CustomResourceRef,
        spec: serde_json::Value,
    ) -> Result<()>;
}

/// [`ClusterOps`] backed by a live Kubernetes API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: kube::Client,
    http: reqwest::Client,
}

impl KubeCluster {
    pub fn new(client: kube::Client) -> Self {
        Self {
            client,
            http: reqwest::Client::new(),
        }
    }
}

/// Where a volume rebind stands, judged from what is left in the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RebindState {
    /// The new claim exists.
    Done,
    /// The volume still has to move to the new claim.
    Pending { volume: String },
}

/// Decide what a rebind has left to do.
///
/// The old claim is gone when a previous run stopped after deleting it; the
/// volume already carries the new labels then and is found through them.
pub fn rebind_state(
    rebind: &VolumeRebind,
    new_claim_exists: bool,
    old_claim: Option<&PersistentVolumeClaim>,
    labelled: &[PersistentVolume],
) -> Result<RebindState, TobsError> {
    if new_claim_exists {
        return Ok(RebindState::Done);
    }

    if let Some(claim) = old_claim {
        return claim
            .spec
            .as_ref()
            .and_then(|s| s.volume_name.clone())
            .map(|volume| RebindState::Pending { volume })
            .ok_or_else(|| TobsError::ClusterOperation {
                operation: "rebind".to_string(),
                target: format!("PersistentVolumeClaim {}", rebind.old_claim),
                message: "claim is not bound to a volume".to_string(),
            });
    }

    match labelled {
        [volume] => volume
            .metadata
            .name
            .clone()
            .map(|volume| RebindState::Pending { volume })
            .ok_or_else(|| TobsError::NotFound {
                kind: "PersistentVolume".to_string(),
                name: selector(&rebind.labels),
            }),
        [] => Err(TobsError::NotFound {
            kind: "PersistentVolumeClaim".to_string(),
            name: rebind.old_claim.clone(),
        }),
        many => Err(TobsError::ClusterOperation {
            operation: "rebind".to_string(),
            target: format!("PersistentVolumes {}", selector(&rebind.labels)),
            message: format!("{} volumes carry the new labels, expected one", many.len()),
        }),
    }
}

#[async_trait]
impl ClusterOps for KubeCluster {
    async fn deployment_replicas(&self, namespace: &str, name: &str) -> Result<i32> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = api
            .get(name)
            .await
            .map_err(|e| TobsError::kube("get", "Deployment", name, e))?;
        Ok(deployment.spec.and_then(|s| s.replicas).unwrap_or(1))
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let patch = json!({ "spec": { "replicas": replicas } });
        api.patch(name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
            .map_err(|e| TobsError::kube("scale", "Deployment", name, e))?;
        debug!("Scaled Deployment {}/{} to {}", namespace, name, replicas);
        Ok(())
    }

    async fn deployment_image(&self, namespace: &str, name: &str) -> Result<Option<String>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let deployment = api
            .get_opt(name)
            .await
            .map_err(|e| TobsError::kube("get", "Deployment", name, e))?;

        Ok(deployment.and_then(|d| {
            d.spec?
                .template
                .spec?
                .containers
                .into_iter()
                .next()?
                .image
        }))
    }

    async fn delete_deployments(&self, namespace: &str, labels: &Labels) -> Result<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let selector = selector(labels);
        api.delete_collection(&DeleteParams::default(), &ListParams::default().labels(&selector))
            .await
            .map_err(|e| TobsError::kube("delete", "Deployment", &selector, e))?;
        debug!("Deleted Deployments matching {} in {}", selector, namespace);
        Ok(())
    }

    async fn delete_daemonset(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<DaemonSet> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| TobsError::kube("delete", "DaemonSet", name, e))?;
        Ok(())
    }

    async fn delete_service(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Service> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::default())
            .await
            .map_err(|e| TobsError::kube("delete", "Service", name, e))?;
        Ok(())
    }

    async fn delete_job(&self, namespace: &str, name: &str) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.delete(name, &DeleteParams::background())
            .await
            .map_err(|e| TobsError::kube("delete", "Job", name, e))?;
        Ok(())
    }

    async fn create_job(&self, namespace: &str, job: &OneShotJob) -> Result<()> {
        let api: Api<Job> = Api::namespaced(self.client.clone(), namespace);
        api.create(&PostParams::default(), &build_job(namespace, job))
            .await
            .map_err(|e| TobsError::kube("create", "Job", &job.name, e))?;
        debug!("Created Job {}/{}", namespace, job.name);
        Ok(())
    }

    async fn list_pods(&self, namespace: &str, labels: &Labels) -> Result<Vec<String>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let selector = selector(labels);
        let pods = api
            .list(&ListParams::default().labels(&selector))
            .await
            .map_err(|e| TobsError::kube("list", "Pod", &selector, e))?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect())
    }

    async fn secret_value(&self, namespace: &str, name: &str, key: &str) -> Result<String> {
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = api
            .get(name)
            .await
            .map_err(|e| TobsError::kube("get", "Secret", name, e))?;

        let bytes = secret
            .data
            .and_then(|mut data| data.remove(key))
            .ok_or_else(|| TobsError::NotFound {
                kind: "Secret key".to_string(),
                name: format!("{name}/{key}"),
            })?;

        String::from_utf8(bytes.0).map_err(|e| {
            TobsError::ClusterOperation {
                operation: "decode".to_string(),
                target: format!("Secret {name}/{key}"),
                message: e.to_string(),
            }
            .into()
        })
    }

    async fn rebind_volume(&self, namespace: &str, rebind: &VolumeRebind) -> Result<()> {
        let claims: Api<PersistentVolumeClaim> = Api::namespaced(self.client.clone(), namespace);
        let volumes: Api<PersistentVolume> = Api::all(self.client.clone());

        let new_claim = claims
            .get_opt(&rebind.new_claim)
            .await
            .map_err(|e| TobsError::kube("get", "PersistentVolumeClaim", &rebind.new_claim, e))?;
        let old_claim = claims
            .get_opt(&rebind.old_claim)
            .await
            .map_err(|e| TobsError::kube("get", "PersistentVolumeClaim", &rebind.old_claim, e))?;
        let labelled = volumes
            .list(&ListParams::default().labels(&selector(&rebind.labels)))
            .await
            .map_err(|e| TobsError::kube("list", "PersistentVolume", &selector(&rebind.labels), e))?;

        let volume_name =
            match rebind_state(rebind, new_claim.is_some(), old_claim.as_ref(), &labelled.items)? {
                RebindState::Done => {
                    info!(
                        "PersistentVolumeClaim {} already exists, volume already rebound",
                        rebind.new_claim
                    );
                    return Ok(());
                }
                RebindState::Pending { volume } => volume,
            };

        // Keep the data when the old claim goes away, and label the volume
        // first so an interrupted run can still find it.
        let retain = json!({
            "metadata": { "labels": rebind.labels },
            "spec": { "persistentVolumeReclaimPolicy": "Retain" },
        });
        volumes
            .patch(&volume_name, &PatchParams::default(), &Patch::Merge(&retain))
            .await
            .map_err(|e| TobsError::kube("patch", "PersistentVolume", &volume_name, e))?;

        match claims.delete(&rebind.old_claim, &DeleteParams::default()).await {
            Ok(_) => {}
            Err(kube::Error::Api(resp)) if resp.code == 404 => {}
            Err(e) => {
                return Err(
                    TobsError::kube("delete", "PersistentVolumeClaim", &rebind.old_claim, e).into(),
                );
            }
        }

        let release = json!({ "spec": { "claimRef": null } });
        let volume = volumes
            .patch(&volume_name, &PatchParams::default(), &Patch::Merge(&release))
            .await
            .map_err(|e| TobsError::kube("patch", "PersistentVolume", &volume_name, e))?;

        let volume_spec = volume.spec.unwrap_or_default();
        let claim = PersistentVolumeClaim {
            metadata: ObjectMeta {
                name: Some(rebind.new_claim.clone()),
                namespace: Some(namespace.to_string()),
                labels: Some(rebind.labels.clone()),
                ..Default::default()
            },
            spec: Some(PersistentVolumeClaimSpec {
                access_modes: volume_spec.access_modes,
                storage_class_name: volume_spec.storage_class_name,
                volume_name: Some(volume_name.clone()),
                selector: Some(LabelSelector {
                    match_labels: Some(rebind.labels.clone()),
                    ..Default::default()
                }),
                resources: Some(VolumeResourceRequirements {
                    requests: volume_spec.capacity,
                    ..Default::default()
                }),
                ..Default::default()
            }),
            ..Default::default()
        };

        claims
            .create(&PostParams::default(), &claim)
            .await
            .map_err(|e| TobsError::kube("create", "PersistentVolumeClaim", &rebind.new_claim, e))?;

        debug!(
            "Rebound PersistentVolume {} from {} to {}",
            volume_name, rebind.old_claim, rebind.new_claim
        );
        Ok(())
    }

    async fn apply_manifests(&self, namespace: &str, set: &ManifestSet) -> Result<()> {
        for (resource, url) in &set.manifests {
            let text = manifest::fetch(&self.http, url).await?;
            for object in manifest::split_documents(&text)? {
                manifest::apply_object(&self.client, &object, namespace).await?;
            }
            debug!("Applied {} from {}", resource, url);
        }
        Ok(())
    }

    async fn delete_custom_resource(&self, namespace: &str, resource: &CustomResourceRef) -> Result<()> {
        let api: Api<DynamicObject> =
            Api::namespaced_with(self.client.clone(), namespace, &resource.api_resource());
        api.delete(&resource.name, &DeleteParams::default())
            .await
            .map_err(|e| TobsError::kube("delete", &resource.kind, &resource.name, e))?;
        Ok(())
    }

    async fn create_custom_resource(
        &self,
        namespace: &str,
        resource: &CustomResourceRef,
        spec: serde_json::Value,
    ) -> Result<()> {
        let ar = resource.api_resource();
        let mut object = DynamicObject::new(&resource.name, &ar).within(namespace);
        object.data = json!({ "spec": spec });

        let api: Api<DynamicObject> = Api::namespaced_with(self.client.clone(), namespace, &ar);
        api.create(&PostParams::default(), &object)
            .await
            .map_err(|e| TobsError::kube("create", &resource.kind, &resource.name, e))?;
        Ok(())
    }
}

/// Build the batch Job for a [`OneShotJob`].
pub fn build_job(namespace: &str, job: &OneShotJob) -> Job {
    Job {
        metadata: ObjectMeta {
            name: Some(job.name.clone()),
            namespace: Some(namespace.to_string()),
            labels: Some(job.labels.clone()),
            ..Default::default()
        },
        spec: Some(JobSpec {
            backoff_limit: Some(job.backoff_limit),
            template: PodTemplateSpec {
                metadata: None,
                spec: Some(PodSpec {
                    restart_policy: Some(job.restart_policy.clone()),
                    containers: vec![Container {
                        name: job.name.clone(),
                        image: Some(job.image.clone()),
                        image_pull_policy: Some("IfNotPresent".to_string()),
                        command: Some(job.command.clone()),
                        volume_mounts: Some(vec![VolumeMount {
                            name: job.volume_name.clone(),
                            mount_path: job.mount_path.clone(),
                            ..Default::default()
                        }]),
                        ..Default::default()
                    }],
                    volumes: Some(vec![Volume {
                        name: job.volume_name.clone(),
                        persistent_volume_claim: Some(PersistentVolumeClaimVolumeSource {
                            claim_name: job.claim_name.clone(),
                            read_only: None,
                        }),
                        ..Default::default()
                    }]),
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}
