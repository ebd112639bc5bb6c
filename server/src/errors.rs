//! Error types for the Dockyard server

use thiserror::Error;

use crate::models::deployment::DeploymentStatus;

/// Main error type for the Dockyard server
#[derive(Error, Debug)]
pub enum DockyardError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    HttpError(#[from] reqwest::Error),

    #[error("Compose parse error: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),

    #[error("Invalid transition: cannot {requested} a deployment in status '{current}'")]
    InvalidTransition {
        current: DeploymentStatus,
        requested: String,
    },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Orchestration failure: {0}")]
    OrchestrationFailure(String),

    #[error("Integrity check failed: {0}")]
    IntegrityCheckFailed(String),

    #[error("Storage failure: {0}")]
    StorageFailure(String),

    #[error("No deployments selected for backup")]
    NoDeploymentsSelected,

    #[error("Invalid restore request: {0}")]
    InvalidRestoreRequest(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Shutdown error: {0}")]
    ShutdownError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl DockyardError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Validation, transition and integrity errors are permanent: the caller
    /// must change the request or re-fetch state first.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            DockyardError::IoError(_)
                | DockyardError::HttpError(_)
                | DockyardError::OrchestrationFailure(_)
                | DockyardError::StorageFailure(_)
        )
    }
}

impl From<anyhow::Error> for DockyardError {
    fn from(err: anyhow::Error) -> Self {
        DockyardError::Internal(err.to_string())
    }
}
