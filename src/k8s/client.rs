//! Kubernetes client builder with kubeconfig context support.

use anyhow::Result;
use tracing::debug;

use crate::error::TobsError;

/// Build a Kubernetes client from kubeconfig (or the in-cluster config).
///
/// Uses the specified context if provided, otherwise the current context.
pub async fn build_client(context: Option<&str>) -> Result<kube::Client> {
    let client = match context {
        Some(ctx) => {
            debug!("Using kubeconfig context: {}", ctx);
            let kubeconfig = kube::config::Kubeconfig::read()
                .map_err(|e| TobsError::Kubeconfig(e.to_string()))?;
            let config = kube::Config::from_custom_kubeconfig(
                kubeconfig,
                &kube::config::KubeConfigOptions {
                    context: Some(ctx.to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| TobsError::Kubeconfig(format!("context '{}': {}", ctx, e)))?;
            kube::Client::try_from(config)
                .map_err(|e| TobsError::Kubeconfig(format!("context '{}': {}", ctx, e)))?
        }
        None => {
            debug!("Using default kubeconfig context");
            kube::Client::try_default()
                .await
                .map_err(|e| TobsError::Kubeconfig(e.to_string()))?
        }
    };

    Ok(client)
}
