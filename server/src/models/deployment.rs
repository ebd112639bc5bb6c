//! Deployment models

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::DockyardError;

/// Maximum stack name length, matching common orchestrator project name limits
pub const MAX_STACK_NAME_LEN: usize = 63;

/// Deployment status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentStatus {
    /// Record created, orchestration not started
    Pending,

    /// Orchestration in progress
    Deploying,

    /// Stack is up
    Running,

    /// Stack is stopped
    Stopped,

    /// Last orchestration attempt failed
    Failed,
}

impl DeploymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeploymentStatus::Pending => "pending",
            DeploymentStatus::Deploying => "deploying",
            DeploymentStatus::Running => "running",
            DeploymentStatus::Stopped => "stopped",
            DeploymentStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for DeploymentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DeploymentStatus {
    type Err = DockyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "pending" => Ok(DeploymentStatus::Pending),
            "deploying" => Ok(DeploymentStatus::Deploying),
            "running" => Ok(DeploymentStatus::Running),
            "stopped" => Ok(DeploymentStatus::Stopped),
            "failed" => Ok(DeploymentStatus::Failed),
            _ => Err(DockyardError::ValidationError(format!(
                "Unknown deployment status: {}",
                s
            ))),
        }
    }
}

/// Credentials for the tunnel agent sidecar of one deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelConfig {
    /// Tunnel control-plane endpoint
    pub endpoint: String,

    /// Tunnel agent identity
    pub newt_id: String,

    /// Tunnel agent secret
    pub secret: String,

    /// Image override for this deployment
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

impl TunnelConfig {
    pub fn validate(&self) -> Result<(), DockyardError> {
        match self.issues().into_iter().next() {
            Some(issue) => Err(DockyardError::ValidationError(issue)),
            None => Ok(()),
        }
    }

    /// Every problem with the credentials, empty when they are usable
    pub fn issues(&self) -> Vec<String> {
        let mut issues = Vec::new();
        if self.endpoint.trim().is_empty() {
            issues.push("tunnel endpoint is required".to_string());
        } else {
            match url::Url::parse(self.endpoint.trim()) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => {}
                Ok(url) => issues.push(format!(
                    "tunnel endpoint must use http or https, not {}",
                    url.scheme()
                )),
                Err(e) => issues.push(format!("tunnel endpoint is not a valid URL: {}", e)),
            }
        }
        if self.newt_id.trim().is_empty() {
            issues.push("tunnel agent ID is required".to_string());
        }
        if self.secret.trim().is_empty() {
            issues.push("tunnel agent secret is required".to_string());
        }
        issues
    }

    /// Copy safe to return to callers: only the ends of the secret survive
    pub fn masked(&self) -> Self {
        let chars: Vec<char> = self.secret.chars().collect();
        let secret = if chars.len() > 8 {
            let head: String = chars[..4].iter().collect();
            let tail: String = chars[chars.len() - 4..].iter().collect();
            format!("{}****{}", head, tail)
        } else {
            "****".to_string()
        };
        Self {
            secret,
            ..self.clone()
        }
    }
}

/// Server-wide tunnel credentials deployments can opt into
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalTunnelConfig {
    #[serde(flatten)]
    pub credentials: TunnelConfig,
    pub updated_at: DateTime<Utc>,
}

/// Typed configuration blob stored with every deployment
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentConfig {
    /// Variables written to the stack's `.env` file
    #[serde(default)]
    pub environment: BTreeMap<String, String>,

    /// Tunnel agent configuration; `None` disables injection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel: Option<TunnelConfig>,

    /// Start orchestration as soon as the record is created
    #[serde(default = "default_true")]
    pub auto_start: bool,
}

fn default_true() -> bool {
    true
}

impl DeploymentConfig {
    /// Validate the blob once at the boundary
    pub fn validate(&self) -> Result<(), DockyardError> {
        for key in self.environment.keys() {
            if key.is_empty() || key.contains('=') || key.chars().any(char::is_whitespace) {
                return Err(DockyardError::ValidationError(format!(
                    "invalid environment variable name: '{}'",
                    key
                )));
            }
        }
        if let Some(tunnel) = &self.tunnel {
            tunnel.validate()?;
        }
        Ok(())
    }
}

/// A deployed Docker Compose stack
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Deployment {
    /// Unique deployment ID
    pub id: String,

    /// Template the compose source is fetched from
    pub template_ref: String,

    /// Unique stack name
    pub stack_name: String,

    /// Current status
    pub status: DeploymentStatus,

    /// Configuration blob
    pub config: DeploymentConfig,

    /// Whether the tunnel agent is part of this stack
    pub tunnel_active: bool,

    /// Last known tunnel URL; kept after the stack stops
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tunnel_url: Option<String>,

    /// Compose source of the last successful deploy, tunnel agent included
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub compose_source: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Deployment {
    /// Create a new deployment record in `pending`
    pub fn new(
        id: impl Into<String>,
        template_ref: impl Into<String>,
        stack_name: impl Into<String>,
        config: DeploymentConfig,
    ) -> Self {
        let now = Utc::now();
        let tunnel_active = config.tunnel.is_some();
        Self {
            id: id.into(),
            template_ref: template_ref.into(),
            stack_name: stack_name.into(),
            status: DeploymentStatus::Pending,
            config,
            tunnel_active,
            tunnel_url: None,
            compose_source: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_running(&self) -> bool {
        self.status == DeploymentStatus::Running
    }

    pub fn can_start(&self) -> bool {
        matches!(self.status, DeploymentStatus::Stopped | DeploymentStatus::Failed)
    }

    pub fn can_stop(&self) -> bool {
        matches!(self.status, DeploymentStatus::Running | DeploymentStatus::Deploying)
    }

    pub fn can_restart(&self) -> bool {
        matches!(self.status, DeploymentStatus::Running | DeploymentStatus::Stopped)
    }

    pub fn can_delete(&self) -> bool {
        matches!(self.status, DeploymentStatus::Stopped | DeploymentStatus::Failed)
    }

    /// Project name passed to the orchestrator
    pub fn compose_project_name(&self) -> String {
        compose_project_name(&self.stack_name)
    }
}

/// Compose only accepts lowercase project names
pub fn compose_project_name(stack_name: &str) -> String {
    stack_name.to_ascii_lowercase()
}

/// Validate a stack name: 1-63 chars of `[A-Za-z0-9_-]`, starting alphanumeric
pub fn validate_stack_name(name: &str) -> Result<(), DockyardError> {
    if name.is_empty() {
        return Err(DockyardError::ValidationError(
            "stack name is required".to_string(),
        ));
    }
    if name.len() > MAX_STACK_NAME_LEN {
        return Err(DockyardError::ValidationError(format!(
            "stack name must be at most {} characters",
            MAX_STACK_NAME_LEN
        )));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        return Err(DockyardError::ValidationError(format!(
            "stack name '{}' may only contain letters, digits, '-' and '_'",
            name
        )));
    }
    if !name.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err(DockyardError::ValidationError(format!(
            "stack name '{}' must start with a letter or digit",
            name
        )));
    }
    Ok(())
}

/// Severity of a deployment log entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogSeverity {
    Debug,
    Info,
    Warning,
    Error,
}

/// Append-only log entry attached to a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentLog {
    pub deployment_id: String,
    pub level: LogSeverity,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Request to create a deployment
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentRequest {
    pub template_ref: String,
    pub stack_name: String,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub tunnel: Option<TunnelConfig>,
    #[serde(default = "default_true")]
    pub auto_start: bool,
    /// Fill `tunnel` from the server-wide tunnel configuration
    #[serde(default)]
    pub use_global_tunnel: bool,
}

impl DeploymentRequest {
    /// Validate and convert into the stored config blob
    pub fn into_parts(self) -> Result<(String, String, DeploymentConfig), DockyardError> {
        if self.template_ref.trim().is_empty() {
            return Err(DockyardError::ValidationError(
                "template reference is required".to_string(),
            ));
        }
        validate_stack_name(&self.stack_name)?;
        let config = DeploymentConfig {
            environment: self.environment,
            tunnel: self.tunnel,
            auto_start: self.auto_start,
        };
        config.validate()?;
        Ok((self.template_ref, self.stack_name, config))
    }
}

/// Caller-visible lifecycle operations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeploymentOperation {
    /// Begin the first deployment of a pending record
    Deploy,
    Start,
    Stop,
    Restart,
}

impl FromStr for DeploymentOperation {
    type Err = DockyardError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deploy" => Ok(DeploymentOperation::Deploy),
            "start" => Ok(DeploymentOperation::Start),
            "stop" => Ok(DeploymentOperation::Stop),
            "restart" => Ok(DeploymentOperation::Restart),
            _ => Err(DockyardError::ValidationError(format!(
                "Unknown operation: {}",
                s
            ))),
        }
    }
}
