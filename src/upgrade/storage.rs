//! Prometheus data hand-over across the CRD boundary.
//!
//! Charts older than 0.4.0 run Prometheus as a plain Deployment. The
//! operator-managed Prometheus that replaces it must reuse the same volume,
//! so the old server is drained before its volume is rebound to the claim the
//! operator's StatefulSet will look for.

use std::time::Duration;

use anyhow::{Context, Result};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, info};

use crate::error::{TobsError, is_already_exists};
use crate::k8s::cluster::{ClusterOps, Labels, OneShotJob, VolumeRebind, labels};

/// Claim name the operator-managed Prometheus binds to.
pub const PROMETHEUS_CLAIM: &str =
    "prometheus-tobs-kube-prometheus-prometheus-db-prometheus-tobs-kube-prometheus-prometheus-0";

/// Job that hands the data directory to the new Prometheus user.
pub const PERMISSION_JOB: &str = "tobs-prometheus-permission-change";

/// UID:GID the operator-managed Prometheus runs as.
const PROMETHEUS_OWNER: &str = "1000:1000";

/// How long to wait for the old server pods to terminate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPolicy {
    pub max_attempts: u32,
    /// Attempt `n` sleeps `n * backoff_step`.
    pub backoff_step: Duration,
}

impl Default for DrainPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            backoff_step: Duration::from_secs(10),
        }
    }
}

/// Names of everything the migration touches for one release.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrometheusStorage {
    pub deployment: String,
    pub pod_labels: Labels,
    pub rebind: VolumeRebind,
    pub job: OneShotJob,
}

impl PrometheusStorage {
    pub fn for_release(release: &str) -> Self {
        let deployment = format!("{release}-prometheus-server");
        Self {
            pod_labels: labels([
                ("app", "prometheus"),
                ("component", "server"),
                ("release", release),
            ]),
            rebind: VolumeRebind {
                old_claim: deployment.clone(),
                new_claim: PROMETHEUS_CLAIM.to_string(),
                labels: labels([("prometheus", "tobs-kube-prometheus"), ("release", release)]),
            },
            job: OneShotJob {
                name: PERMISSION_JOB.to_string(),
                labels: labels([("app", "tobs-upgrade"), ("release", release)]),
                image: "alpine".to_string(),
                command: ["chown", PROMETHEUS_OWNER, "-R", "/data/"]
                    .map(String::from)
                    .to_vec(),
                claim_name: PROMETHEUS_CLAIM.to_string(),
                volume_name: "prometheus".to_string(),
                mount_path: "/data".to_string(),
                backoff_limit: 3,
                restart_policy: "OnFailure".to_string(),
            },
            deployment,
        }
    }
}

/// Drives the scale-down, drain, rebind and permission fix.
pub struct StorageMigrator<'a> {
    cluster: &'a dyn ClusterOps,
    namespace: &'a str,
    policy: DrainPolicy,
}

impl<'a> StorageMigrator<'a> {
    pub fn new(cluster: &'a dyn ClusterOps, namespace: &'a str, policy: DrainPolicy) -> Self {
        Self {
            cluster,
            namespace,
            policy,
        }
    }

    pub async fn migrate(&self, storage: &PrometheusStorage) -> Result<()> {
        println!("Migrating the Prometheus persistent volume to the new Prometheus instance...");

        let replicas = self
            .cluster
            .deployment_replicas(self.namespace, &storage.deployment)
            .await
            .with_context(|| format!("Failed to read {}", storage.deployment))?;
        debug!("{} currently has {} replicas", storage.deployment, replicas);

        println!("Scaling down Prometheus to 0 replicas...");
        self.cluster
            .scale_deployment(self.namespace, &storage.deployment, 0)
            .await
            .with_context(|| format!("Failed to scale down {}", storage.deployment))?;

        self.wait_for_drain(&storage.pod_labels).await?;

        self.cluster
            .rebind_volume(self.namespace, &storage.rebind)
            .await
            .context("Failed to rebind the Prometheus persistent volume")?;

        println!("Creating job to update Prometheus data directory permissions...");
        match self.cluster.create_job(self.namespace, &storage.job).await {
            Ok(()) => {}
            Err(e) if is_already_exists(&e) => {
                info!("Job {} already exists, skipping", storage.job.name);
            }
            Err(e) => return Err(e.context("Failed to create the Prometheus permission job")),
        }

        Ok(())
    }

    /// Poll until no pod matches `pod_labels`, sleeping `attempt * step`
    /// between polls. Fails once the attempt ceiling is reached.
    pub async fn wait_for_drain(&self, pod_labels: &Labels) -> Result<()> {
        let pb = ProgressBar::new_spinner();
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.cyan} {msg}") {
            pb.set_style(style);
        }
        pb.enable_steady_tick(Duration::from_millis(100));

        let mut attempt = 0u32;
        loop {
            let pods = self
                .cluster
                .list_pods(self.namespace, pod_labels)
                .await
                .context("Failed to list Prometheus pods")?;

            if pods.is_empty() {
                pb.finish_with_message(format!("{} Prometheus pods terminated", "✓".green()));
                return Ok(());
            }

            if attempt == self.policy.max_attempts {
                pb.finish_with_message(format!("{} Prometheus is still running", "✗".red()));
                return Err(TobsError::Timeout {
                    operation: "Prometheus shutdown".to_string(),
                    details: format!(
                        "{} pod(s) still running after {} attempts; Prometheus flushes in-memory \
                         data to the volume on shutdown and is taking too long",
                        pods.len(),
                        attempt
                    ),
                }
                .into());
            }

            attempt += 1;
            pb.set_message(format!(
                "Waiting for {} Prometheus pod(s) to terminate (attempt {}/{})",
                pods.len(),
                attempt,
                self.policy.max_attempts
            ));
            tokio::time::sleep(self.policy.backoff_step * attempt).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upgrade::fakes::FakeCluster;

    fn fast_policy() -> DrainPolicy {
        DrainPolicy {
            max_attempts: 3,
            backoff_step: Duration::from_millis(1),
        }
    }

    #[test]
    fn test_storage_names_for_release() {
        let storage = PrometheusStorage::for_release("obs");
        assert_eq!(storage.deployment, "obs-prometheus-server");
        assert_eq!(storage.rebind.old_claim, "obs-prometheus-server");
        assert_eq!(storage.rebind.new_claim, PROMETHEUS_CLAIM);
        assert_eq!(storage.rebind.labels["release"], "obs");
        assert_eq!(storage.job.claim_name, PROMETHEUS_CLAIM);
        assert_eq!(storage.job.command, vec!["chown", "1000:1000", "-R", "/data/"]);
        assert_eq!(storage.pod_labels["component"], "server");
    }

    #[test]
    fn test_default_drain_policy() {
        let policy = DrainPolicy::default();
        assert_eq!(policy.max_attempts, 10);
        assert_eq!(policy.backoff_step, Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_migrate_runs_protocol_in_order() {
        let cluster = FakeCluster::new().with_pod_counts([2, 1, 0]);
        let migrator = StorageMigrator::new(&cluster, "default", fast_policy());

        migrator
            .migrate(&PrometheusStorage::for_release("tobs"))
            .await
            .unwrap();

        assert_eq!(
            cluster.calls(),
            vec![
                "get-replicas default/tobs-prometheus-server",
                "scale default/tobs-prometheus-server 0",
                "list-pods default app=prometheus,component=server,release=tobs",
                "list-pods default app=prometheus,component=server,release=tobs",
                "list-pods default app=prometheus,component=server,release=tobs",
                format!("rebind default tobs-prometheus-server->{PROMETHEUS_CLAIM}").as_str(),
                "create-job default/tobs-prometheus-permission-change",
            ]
        );
    }

    #[tokio::test]
    async fn test_drain_times_out_at_ceiling() {
        let cluster = FakeCluster::new().with_pod_counts([1]);
        let migrator = StorageMigrator::new(&cluster, "default", fast_policy());

        let err = migrator
            .wait_for_drain(&labels([("app", "prometheus")]))
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<TobsError>(),
            Some(TobsError::Timeout { .. })
        ));
        // One poll per attempt plus the final one that hits the ceiling.
        assert_eq!(cluster.calls_matching("list-pods").len(), 4);
    }

    #[tokio::test]
    async fn test_rebind_not_attempted_when_drain_fails() {
        let cluster = FakeCluster::new().with_pod_counts([1]);
        let migrator = StorageMigrator::new(&cluster, "default", fast_policy());

        assert!(migrator.migrate(&PrometheusStorage::for_release("tobs")).await.is_err());
        assert!(cluster.calls_matching("rebind").is_empty());
        assert!(cluster.calls_matching("create-job").is_empty());
    }

    #[tokio::test]
    async fn test_existing_permission_job_is_tolerated() {
        let cluster = FakeCluster::new().with_existing_job(PERMISSION_JOB);
        let migrator = StorageMigrator::new(&cluster, "default", fast_policy());

        migrator
            .migrate(&PrometheusStorage::for_release("tobs"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_deployment_fails_before_scaling() {
        let cluster = FakeCluster::new().without_deployment("tobs-prometheus-server");
        let migrator = StorageMigrator::new(&cluster, "default", fast_policy());

        let err = migrator
            .migrate(&PrometheusStorage::for_release("tobs"))
            .await
            .unwrap_err();
        assert!(format!("{err:#}").contains("tobs-prometheus-server"));
        assert!(cluster.calls_matching("scale").is_empty());
    }
}
