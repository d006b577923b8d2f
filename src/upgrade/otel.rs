//! OpenTelemetry collector and its cert-manager dependency.

use anyhow::{Context, Result};
use serde_json::json;
use tracing::info;

use crate::error::{TobsError, is_not_found};
use crate::k8s::cluster::{ClusterOps, CustomResourceRef};
use crate::upgrade::crds::CERT_MANAGER_VERSION;
use crate::values::{ValuesTree, expect_mapping_mut};
use crate::version::Version;

pub const CERT_MANAGER_NAMESPACE: &str = "cert-manager";
pub const CERT_MANAGER_DEPLOYMENT: &str = "cert-manager";

/// Chart field holding the default collector configuration.
pub const COLLECTOR_CONFIG_PATH: &[&str] = &["opentelemetryOperator", "collector", "config"];

/// The collector created by default for a release.
pub fn collector_ref(release: &str) -> CustomResourceRef {
    CustomResourceRef {
        group: "opentelemetry.io".to_string(),
        version: "v1alpha1".to_string(),
        kind: "OpenTelemetryCollector".to_string(),
        plural: "opentelemetrycollectors".to_string(),
        name: format!("{release}-opentelemetry"),
    }
}

pub fn collector_spec(config: &str) -> serde_json::Value {
    json!({
        "mode": "deployment",
        "config": config,
    })
}

/// Replace the default collector so it picks up `config`.
pub async fn recreate_collector(
    cluster: &dyn ClusterOps,
    namespace: &str,
    release: &str,
    config: &str,
) -> Result<()> {
    let collector = collector_ref(release);

    match cluster.delete_custom_resource(namespace, &collector).await {
        Ok(()) => {}
        Err(e) if is_not_found(&e) => {
            info!("{} {} not found, skipping delete", collector.kind, collector.name);
        }
        Err(e) => {
            return Err(e.context(format!("Failed to delete {} {}", collector.kind, collector.name)));
        }
    }

    cluster
        .create_custom_resource(namespace, &collector, collector_spec(config))
        .await
        .with_context(|| format!("Failed to create {} {}", collector.kind, collector.name))?;

    println!("Created default OpenTelemetry collector {}", collector.name);
    Ok(())
}

/// Installed cert-manager relative to the version the collector needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertManagerState {
    Missing,
    Outdated(Version),
    Current(Version),
}

/// Tag of a container image reference, ignoring registry ports and digests.
pub fn image_tag(image: &str) -> Option<&str> {
    let image = image.split('@').next().unwrap_or(image);
    let (_, tag) = image.rsplit_once(':')?;
    (!tag.contains('/') && !tag.is_empty()).then_some(tag)
}

pub async fn cert_manager_state(cluster: &dyn ClusterOps) -> Result<CertManagerState> {
    let image = cluster
        .deployment_image(CERT_MANAGER_NAMESPACE, CERT_MANAGER_DEPLOYMENT)
        .await
        .context("Failed to inspect cert-manager")?;

    let Some(image) = image else {
        return Ok(CertManagerState::Missing);
    };

    let tag = image_tag(&image).ok_or_else(|| TobsError::InvalidVersion(image.clone()))?;
    let installed = Version::parse(tag, 3)?;
    let required = Version::parse(CERT_MANAGER_VERSION, 3)?;

    Ok(if installed < required {
        CertManagerState::Outdated(installed)
    } else {
        CertManagerState::Current(installed)
    })
}

/// Drop `opentelemetryOperator.jaegerPromscaleQuery`, which the 0.8 chart
/// no longer reads.
pub fn remove_jaeger_query(values: &mut ValuesTree) -> Result<(), TobsError> {
    let Some(operator) = values.root_mut().get_mut("opentelemetryOperator") else {
        return Ok(());
    };
    expect_mapping_mut("opentelemetryOperator", operator)?.shift_remove("jaegerPromscaleQuery");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrade::fakes::FakeCluster;

    #[test]
    fn test_image_tag() {
        assert_eq!(image_tag("quay.io/jetstack/cert-manager-controller:v1.6.1"), Some("v1.6.1"));
        assert_eq!(image_tag("registry:5000/cert-manager-controller:v1.5.3"), Some("v1.5.3"));
        assert_eq!(image_tag("registry:5000/cert-manager-controller"), None);
        assert_eq!(
            image_tag("quay.io/jetstack/cert-manager-controller:v1.6.1@sha256:abc"),
            Some("v1.6.1")
        );
        assert_eq!(image_tag("cert-manager-controller"), None);
    }

    #[test]
    fn test_collector_spec() {
        let spec = collector_spec("receivers: {}");
        assert_eq!(spec["mode"], "deployment");
        assert_eq!(spec["config"], "receivers: {}");
        assert_eq!(collector_ref("tobs").name, "tobs-opentelemetry");
    }

    #[test]
    fn test_remove_jaeger_query() {
        let mut values = ValuesTree::from_yaml_str(
            "opentelemetryOperator:\n  enabled: true\n  jaegerPromscaleQuery:\n    enabled: true\n",
        )
        .unwrap();
        remove_jaeger_query(&mut values).unwrap();
        assert!(
            values
                .get_path(&["opentelemetryOperator", "jaegerPromscaleQuery"])
                .unwrap()
                .is_none()
        );
        assert!(
            values
                .get_path(&["opentelemetryOperator", "enabled"])
                .unwrap()
                .is_some()
        );

        // Absent block and second run are both fine.
        remove_jaeger_query(&mut values).unwrap();
        let mut empty = ValuesTree::default();
        remove_jaeger_query(&mut empty).unwrap();
    }

    #[test]
    fn test_remove_jaeger_query_shape_error() {
        let mut values = ValuesTree::from_yaml_str("opentelemetryOperator: true\n").unwrap();
        let err = remove_jaeger_query(&mut values).unwrap_err();
        assert!(err.to_string().contains("'opentelemetryOperator'"));
    }

    #[tokio::test]
    async fn test_cert_manager_state() {
        let cluster = FakeCluster::new();
        assert_eq!(cert_manager_state(&cluster).await.unwrap(), CertManagerState::Missing);

        let cluster = FakeCluster::new()
            .with_image("cert-manager/cert-manager", "quay.io/jetstack/cert-manager-controller:v1.5.3");
        assert!(matches!(
            cert_manager_state(&cluster).await.unwrap(),
            CertManagerState::Outdated(_)
        ));

        let cluster = FakeCluster::new()
            .with_image("cert-manager/cert-manager", "quay.io/jetstack/cert-manager-controller:v1.6.1");
        assert!(matches!(
            cert_manager_state(&cluster).await.unwrap(),
            CertManagerState::Current(_)
        ));
    }

    #[tokio::test]
    async fn test_cert_manager_unparsable_tag() {
        let cluster = FakeCluster::new()
            .with_image("cert-manager/cert-manager", "quay.io/jetstack/cert-manager-controller:latest");
        let err = cert_manager_state(&cluster).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<TobsError>(),
            Some(TobsError::InvalidVersion(_))
        ));
    }

    #[tokio::test]
    async fn test_recreate_collector_tolerates_missing() {
        let cluster = FakeCluster::new();
        recreate_collector(&cluster, "default", "tobs", "receivers: {}")
            .await
            .unwrap();
        assert_eq!(
            cluster.calls(),
            vec![
                "delete-cr default OpenTelemetryCollector/tobs-opentelemetry",
                "create-cr default OpenTelemetryCollector/tobs-opentelemetry",
            ]
        );
    }
}
