//! Manifest sets applied during migrations.

use crate::k8s::manifest::ManifestSet;

/// prometheus-operator release the kube-prometheus CRDs are pinned to.
pub const KUBE_PROMETHEUS_CRD_VERSION: &str = "v0.56.2";

/// opentelemetry-operator release the OpenTelemetry CRDs are pinned to.
pub const OPENTELEMETRY_OPERATOR_VERSION: &str = "v0.56.0";

/// cert-manager release required by the OpenTelemetry operator.
pub const CERT_MANAGER_VERSION: &str = "1.6.1";

const KUBE_PROMETHEUS_KINDS: &[&str] = &[
    "alertmanagerconfigs",
    "alertmanagers",
    "podmonitors",
    "probes",
    "prometheuses",
    "prometheusrules",
    "servicemonitors",
    "thanosrulers",
];

const OPENTELEMETRY_KINDS: &[&str] = &["instrumentations", "opentelemetrycollectors"];

/// CRDs of the kube-prometheus stack (`monitoring.coreos.com`).
pub fn kube_prometheus() -> ManifestSet {
    let prefix = format!(
        "https://raw.githubusercontent.com/prometheus-operator/prometheus-operator/{}/example/prometheus-operator-crd/monitoring.coreos.com",
        KUBE_PROMETHEUS_CRD_VERSION
    );

    KUBE_PROMETHEUS_KINDS
        .iter()
        .fold(ManifestSet::new("kube-prometheus"), |set, kind| {
            set.with(
                format!("{kind}.monitoring.coreos.com"),
                format!("{prefix}_{kind}.yaml"),
            )
        })
}

/// CRDs of the OpenTelemetry operator (`opentelemetry.io`).
pub fn opentelemetry() -> ManifestSet {
    let prefix = format!(
        "https://raw.githubusercontent.com/open-telemetry/opentelemetry-operator/{}/bundle/manifests/opentelemetry.io",
        OPENTELEMETRY_OPERATOR_VERSION
    );

    OPENTELEMETRY_KINDS
        .iter()
        .fold(ManifestSet::new("opentelemetry"), |set, kind| {
            set.with(
                format!("{kind}.opentelemetry.io"),
                format!("{prefix}_{kind}.yaml"),
            )
        })
}

/// The full cert-manager installation manifest.
pub fn cert_manager() -> ManifestSet {
    ManifestSet::new("cert-manager").with(
        "cert-manager",
        format!(
            "https://github.com/cert-manager/cert-manager/releases/download/v{CERT_MANAGER_VERSION}/cert-manager.yaml"
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kube_prometheus_set() {
        let set = kube_prometheus();
        assert_eq!(set.name, "kube-prometheus");
        assert_eq!(set.manifests.len(), 8);
        assert_eq!(
            set.manifests["servicemonitors.monitoring.coreos.com"],
            "https://raw.githubusercontent.com/prometheus-operator/prometheus-operator/v0.56.2/example/prometheus-operator-crd/monitoring.coreos.com_servicemonitors.yaml"
        );
    }

    #[test]
    fn test_opentelemetry_set() {
        let set = opentelemetry();
        assert_eq!(
            set.resource_names(),
            vec![
                "instrumentations.opentelemetry.io",
                "opentelemetrycollectors.opentelemetry.io"
            ]
        );
    }

    #[test]
    fn test_cert_manager_manifest_is_pinned() {
        let set = cert_manager();
        assert!(set.manifests["cert-manager"].contains("/v1.6.1/"));
    }
}
