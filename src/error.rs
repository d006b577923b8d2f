//! Custom error types for tobs.

use thiserror::Error;

/// Errors that can occur while upgrading an observability stack release.
#[derive(Error, Debug)]
pub enum TobsError {
    #[error("Invalid version format: {0}")]
    InvalidVersion(String),

    #[error("Unexpected value shape at '{key}': expected {expected}, found {actual}")]
    ShapeMismatch {
        key: String,
        expected: &'static str,
        actual: &'static str,
    },

    #[error("{kind} not found: {name}")]
    NotFound { kind: String, name: String },

    #[error("{kind} already exists: {name}")]
    AlreadyExists { kind: String, name: String },

    #[error("Failed to {operation} {target}: {message}")]
    ClusterOperation {
        operation: String,
        target: String,
        message: String,
    },

    #[error(
        "Upgrade from version {deployed} (at or below {boundary}) is no longer supported. \
         Please use an older tobs binary to do a step-by-step upgrade"
    )]
    UnsupportedUpgrade { deployed: String, boundary: String },

    #[error(
        "Nothing to upgrade: no newer helm chart is available and the deployed values \
         are the same as the provided values"
    )]
    NothingToUpgrade,

    #[error(
        "Provided helm chart {latest} is newer than the deployed chart {deployed}; \
         cannot upgrade with --same-chart"
    )]
    NewerChartWithSameChart { latest: String, deployed: String },

    #[error("Timeout waiting for {operation}: {details}")]
    Timeout { operation: String, details: String },

    #[error("Helm error: {0}")]
    Helm(String),

    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Kubeconfig error: {0}")]
    Kubeconfig(String),

    #[error("Operation cancelled by user")]
    UserCancelled,
}

impl TobsError {
    /// Map a kube API error for `operation` on `kind`/`name`.
    ///
    /// HTTP 404 becomes `NotFound` and 409 becomes `AlreadyExists` so callers can
    /// tolerate them; everything else is a `ClusterOperation` failure.
    pub fn kube(operation: &str, kind: &str, name: &str, err: kube::Error) -> Self {
        match &err {
            kube::Error::Api(resp) if resp.code == 404 => Self::NotFound {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            kube::Error::Api(resp) if resp.code == 409 => Self::AlreadyExists {
                kind: kind.to_string(),
                name: name.to_string(),
            },
            _ => Self::ClusterOperation {
                operation: operation.to_string(),
                target: format!("{kind} {name}"),
                message: err.to_string(),
            },
        }
    }

    /// Returns true if the error reports an absent resource.
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Returns true if the error reports a resource that already exists.
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Returns true if an `anyhow` error wraps a `TobsError::NotFound`.
pub fn is_not_found(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TobsError>()
        .is_some_and(TobsError::is_not_found)
}

/// Returns true if an `anyhow` error wraps a `TobsError::AlreadyExists`.
pub fn is_already_exists(err: &anyhow::Error) -> bool {
    err.downcast_ref::<TobsError>()
        .is_some_and(TobsError::is_already_exists)
}
