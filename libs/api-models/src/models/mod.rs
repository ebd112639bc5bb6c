//! Dockyard API models

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
}

/// Version response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionResponse {
    pub version: String,
    pub git_hash: String,
    pub build_time: String,
}

/// Error body returned with every non-2xx response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine readable kind, e.g. `invalid_transition`
    pub code: String,
    pub error: String,
    pub retryable: bool,
}

/// List envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse<T> {
    pub items: Vec<T>,
    pub total: usize,
}

impl<T> From<Vec<T>> for ListResponse<T> {
    fn from(items: Vec<T>) -> Self {
        let total = items.len();
        Self { items, total }
    }
}

/// Accepted asynchronous operation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedResponse {
    pub success: bool,
    pub message: String,
}

/// Tunnel agent credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelCredentials {
    pub endpoint: String,
    pub newt_id: String,
    pub secret: String,
    #[serde(default)]
    pub image: Option<String>,
}

/// Create deployment request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateDeploymentRequest {
    pub template_ref: String,
    pub stack_name: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub tunnel: Option<TunnelCredentials>,
    /// Defaults to true
    #[serde(default)]
    pub auto_start: Option<bool>,
    /// Use the saved global tunnel credentials when `tunnel` is absent
    #[serde(default)]
    pub use_global_tunnel: bool,
}

/// Deployment list query
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentListQuery {
    #[serde(default)]
    pub status: Option<String>,
}

/// Lifecycle operation request: `deploy`, `start`, `stop` or `restart`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionRequest {
    pub operation: String,
}

/// Create backup request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateBackupRequest {
    #[serde(default)]
    pub name: Option<String>,
    /// Capture every running deployment; `deployment_ids` is ignored
    #[serde(default)]
    pub all_deployments: bool,
    #[serde(default)]
    pub deployment_ids: Vec<String>,
    #[serde(default)]
    pub include_volumes: bool,
    #[serde(default)]
    pub encrypted: bool,
}

/// Restore backup request
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RestoreBackupRequest {
    #[serde(default)]
    pub selective: bool,
    #[serde(default)]
    pub deployment_ids: Vec<String>,
    #[serde(default)]
    pub overwrite_existing: bool,
    #[serde(default)]
    pub restore_volumes: bool,
    #[serde(default)]
    pub test_restore: bool,
}

/// Create or update a cron backup schedule
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupScheduleRequest {
    pub name: String,
    /// Five-field cron expression, evaluated in UTC
    pub cron_expression: String,
    #[serde(default)]
    pub include_volumes: bool,
    #[serde(default)]
    pub encrypted: bool,
    /// Defaults to true
    #[serde(default)]
    pub enabled: Option<bool>,
}

/// Tunnel credential check
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelValidationResponse {
    pub valid: bool,
    pub issues: Vec<String>,
}

/// Compose injection or preview request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeRequest {
    /// Raw Compose YAML
    pub compose: String,
    pub tunnel: TunnelCredentials,
}

/// Compose injection response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComposeInjectResponse<R> {
    /// Corrected Compose YAML
    pub compose: String,
    pub report: R,
}
