//! Remote manifest sets and idempotent server-side apply.
//!
//! A manifest set maps a resource name (usually a CRD name) to the URL of the
//! YAML that defines it. Applying a set fetches every URL, splits it into
//! documents, and server-side applies each one with a forced field manager,
//! so applying the same set twice converges to the same state.

use std::collections::BTreeMap;

use anyhow::{Context, Result};
use kube::api::{ApiResource, DynamicObject, Patch, PatchParams};
use kube::core::GroupVersionKind;
use kube::discovery::Scope;
use kube::{Api, ResourceExt};
use serde::Deserialize;
use tracing::debug;

use crate::error::TobsError;

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "tobs";

/// A named collection of manifests keyed by resource name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestSet {
    pub name: &'static str,
    pub manifests: BTreeMap<String, String>,
}

impl ManifestSet {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            manifests: BTreeMap::new(),
        }
    }

    pub fn with(mut self, resource: impl Into<String>, url: impl Into<String>) -> Self {
        self.manifests.insert(resource.into(), url.into());
        self
    }

    /// Resource names in the set, sorted.
    pub fn resource_names(&self) -> Vec<&str> {
        self.manifests.keys().map(String::as_str).collect()
    }
}

/// Download a manifest over HTTP(S).
pub async fn fetch(http: &reqwest::Client, url: &str) -> Result<String> {
    debug!("Fetching manifest {}", url);
    let response = http
        .get(url)
        .send()
        .await
        .map_err(|e| TobsError::Manifest(format!("GET {url}: {e}")))?;

    let status = response.status();
    if !status.is_success() {
        return Err(TobsError::Manifest(format!("GET {url}: HTTP {status}")).into());
    }

    response
        .text()
        .await
        .with_context(|| format!("Failed to read manifest body from {url}"))
}

/// Split multi-document YAML into objects, skipping empty documents.
pub fn split_documents(text: &str) -> Result<Vec<DynamicObject>> {
    let mut objects = Vec::new();
    for document in serde_yaml::Deserializer::from_str(text) {
        let value = serde_yaml::Value::deserialize(document)
            .map_err(|e| TobsError::Manifest(format!("invalid YAML document: {e}")))?;
        if value.is_null() {
            continue;
        }
        let object: DynamicObject = serde_yaml::from_value(value)
            .map_err(|e| TobsError::Manifest(format!("not a Kubernetes object: {e}")))?;
        objects.push(object);
    }
    Ok(objects)
}

/// Server-side apply one object, resolving its kind through API discovery.
pub async fn apply_object(
    client: &kube::Client,
    object: &DynamicObject,
    default_namespace: &str,
) -> Result<()> {
    let types = object.types.as_ref().ok_or_else(|| {
        TobsError::Manifest(format!(
            "object {} has no apiVersion/kind",
            object.name_any()
        ))
    })?;
    let gvk = GroupVersionKind::try_from(types)
        .map_err(|e| TobsError::Manifest(format!("invalid apiVersion/kind: {e}")))?;
    let name = object.name_any();

    let (resource, capabilities): (ApiResource, _) = kube::discovery::pinned_kind(client, &gvk)
        .await
        .map_err(|e| TobsError::kube("discover", &gvk.kind, &name, e))?;

    let api: Api<DynamicObject> = match capabilities.scope {
        Scope::Cluster => Api::all_with(client.clone(), &resource),
        Scope::Namespaced => {
            let namespace = object.namespace().unwrap_or_else(|| default_namespace.to_string());
            Api::namespaced_with(client.clone(), &namespace, &resource)
        }
    };

    let params = PatchParams::apply(FIELD_MANAGER).force();
    api.patch(&name, &params, &Patch::Apply(object))
        .await
        .map_err(|e| TobsError::kube("apply", &gvk.kind, &name, e))?;

    debug!("Applied {} {}", gvk.kind, name);
    Ok(())
}
