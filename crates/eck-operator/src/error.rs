//! Error types for the ECK operator

use std::time::Duration;
use thiserror::Error;

/// Errors that can occur during operator operations
#[derive(Error, Debug)]
pub enum OperatorError {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// A dependency of the reconciled resource does not exist
    #[error("Resource not found: {kind}/{name} in namespace {namespace}")]
    NotFound {
        kind: String,
        name: String,
        namespace: String,
    },

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Reconciliation failed
    #[error("Reconciliation failed: {0}")]
    ReconcileFailed(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// YAML serialization error
    #[error("YAML serialization error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Validation error on the declared resource
    #[error("Validation error: {0}")]
    ValidationError(String),

    /// Version string that cannot be parsed
    #[error("Invalid version {version}: {source}")]
    InvalidVersion {
        version: String,
        #[source]
        source: semver::Error,
    },

    /// HTTP transport error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Enterprise Search answered the read-only mode call with a non-200 status
    #[error("invalid read-only mode API response (status code {status}): {body}")]
    ReadOnlyMode { status: u16, body: String },

    /// A version upgrade cannot proceed yet
    #[error("Version upgrade blocked: {0}")]
    UpgradeBlocked(String),

    /// License lookup failed
    #[error("License check failed: {0}")]
    License(String),

    /// Certificate generation or parsing failed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Timeout error
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type for operator operations
pub type Result<T> = std::result::Result<T, OperatorError>;

impl OperatorError {
    /// Check if this error is retryable.
    ///
    /// Validation failures are permanent until the user edits the resource, every
    /// other failure is retried with backoff.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            OperatorError::ValidationError(_)
                | OperatorError::InvalidConfig(_)
                | OperatorError::InvalidVersion { .. }
        )
    }

    /// Get a fixed requeue delay for errors that should not back off
    pub fn requeue_delay(&self) -> Option<Duration> {
        match self {
            OperatorError::KubeError(e) if is_conflict(e) => Some(Duration::from_secs(1)),
            OperatorError::UpgradeBlocked(_) => Some(Duration::from_secs(10)),
            _ => None,
        }
    }

    /// Short reason used when the error is published as an event
    pub fn event_reason(&self) -> &'static str {
        match self {
            OperatorError::ValidationError(_) | OperatorError::InvalidVersion { .. } => {
                "Validation"
            }
            _ => "ReconciliationError",
        }
    }
}

/// Returns true if the API server answered 404
pub fn is_not_found(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 404)
}

/// Returns true if the API server rejected a stale resourceVersion
pub fn is_conflict(err: &kube::Error) -> bool {
    matches!(err, kube::Error::Api(resp) if resp.code == 409)
}
