//! Backup models

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use croner::Cron;
use serde::{Deserialize, Serialize};

use crate::errors::DockyardError;
use crate::models::deployment::DeploymentConfig;

/// Archive format version written into every backup
pub const BACKUP_FORMAT_VERSION: &str = "1.0";

/// Who asked for the backup
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupType {
    Manual,
    Scheduled,
    Auto,
}

impl Default for BackupType {
    fn default() -> Self {
        BackupType::Manual
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupStatus {
    Creating,
    Completed,
    Failed,
}

impl fmt::Display for BackupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            BackupStatus::Creating => "creating",
            BackupStatus::Completed => "completed",
            BackupStatus::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A backup record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backup {
    /// Unique backup ID
    pub id: String,

    /// Human readable name
    pub name: String,

    pub backup_type: BackupType,

    pub status: BackupStatus,

    /// Size of the stored archive in bytes
    pub size_bytes: u64,

    pub include_volumes: bool,

    pub encrypted: bool,

    /// Handle returned by the storage backend
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_path: Option<String>,

    /// SHA-256 of the plaintext archive
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,

    /// Captured deployments, fixed at creation
    pub deployment_ids: Vec<String>,

    /// Failure reason when `status` is `failed`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    pub created_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

impl Backup {
    /// Create a new record in `creating`
    pub fn new(id: impl Into<String>, options: &BackupOptions, deployment_ids: Vec<String>) -> Self {
        Self {
            id: id.into(),
            name: options.name.clone(),
            backup_type: options.backup_type,
            status: BackupStatus::Creating,
            size_bytes: 0,
            include_volumes: options.include_volumes,
            encrypted: options.encrypted,
            storage_path: None,
            checksum: None,
            deployment_ids,
            error: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn is_completed(&self) -> bool {
        self.status == BackupStatus::Completed
    }
}

/// Which deployments a backup captures
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind", content = "ids")]
pub enum BackupSelection {
    /// Every deployment currently `running`
    AllRunning,

    /// An explicit list of deployment IDs
    Explicit(Vec<String>),
}

impl BackupSelection {
    /// Build a selection from the request flags used by the HTTP layer
    pub fn from_request(all_deployments: bool, deployment_ids: Vec<String>) -> Self {
        if all_deployments {
            BackupSelection::AllRunning
        } else {
            BackupSelection::Explicit(deployment_ids)
        }
    }
}

/// Options for a new backup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackupOptions {
    pub name: String,
    #[serde(default)]
    pub backup_type: BackupType,
    #[serde(default)]
    pub include_volumes: bool,
    #[serde(default)]
    pub encrypted: bool,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            name: format!("backup-{}", Utc::now().format("%Y%m%d-%H%M%S")),
            backup_type: BackupType::Manual,
            include_volumes: false,
            encrypted: false,
        }
    }
}

/// Request to restore deployments from a backup
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreRequest {
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

impl RestoreRequest {
    pub fn validate(&self) -> Result<(), DockyardError> {
        if self.selective && self.deployment_ids.is_empty() {
            return Err(DockyardError::InvalidRestoreRequest(
                "selective restore requires at least one deployment ID".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether a captured deployment is part of this restore
    pub fn includes(&self, deployment_id: &str) -> bool {
        !self.selective || self.deployment_ids.iter().any(|id| id == deployment_id)
    }
}

/// Backup-level metadata written as `metadata.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupMetadata {
    pub version: String,
    pub backup_id: String,
    pub created_at: DateTime<Utc>,
    pub app_version: String,
    pub deployment_count: usize,
    pub volume_count: usize,
    pub deployment_ids: Vec<String>,
    pub encrypted: bool,
}

/// Named volume captured with a deployment
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeManifest {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub driver: Option<String>,
    /// Services mounting this volume
    pub services: Vec<String>,
}

/// Per-deployment manifest written as `deployments/<id>/manifest.json`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentManifest {
    pub deployment_id: String,
    pub stack_name: String,
    pub template_ref: String,
    pub config: DeploymentConfig,
    /// Compose source as corrected by the injector
    pub compose_source: String,
    /// SHA-256 of `compose_source`
    pub compose_checksum: String,
    #[serde(default)]
    pub volumes: Vec<VolumeManifest>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl DeploymentManifest {
    /// Check the manifest is internally consistent
    pub fn verify(&self) -> Result<(), DockyardError> {
        if self.deployment_id.is_empty() || self.stack_name.is_empty() {
            return Err(DockyardError::IntegrityCheckFailed(format!(
                "manifest for '{}' is missing identity fields",
                self.deployment_id
            )));
        }
        let actual = crate::utils::sha256_hex(self.compose_source.as_bytes());
        if actual != self.compose_checksum {
            return Err(DockyardError::IntegrityCheckFailed(format!(
                "compose checksum mismatch for deployment '{}'",
                self.deployment_id
            )));
        }
        Ok(())
    }
}

/// What happened to one captured deployment during a restore
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreAction {
    /// Record recreated and resubmitted for deployment
    Restored,

    /// Existing record replaced and resubmitted
    Overwritten,

    /// Test restore: manifest checked, nothing changed
    Validated,

    /// A deployment with that ID or stack name exists and overwrite was off
    SkippedExisting,

    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreOutcome {
    pub deployment_id: String,
    pub stack_name: String,
    pub action: RestoreAction,
    pub message: String,
}

/// Result of the last restore of a backup
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RestoreReport {
    pub backup_id: String,
    pub test_restore: bool,
    pub started_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub outcomes: Vec<RestoreOutcome>,
}

impl RestoreReport {
    pub fn new(backup_id: impl Into<String>, test_restore: bool) -> Self {
        Self {
            backup_id: backup_id.into(),
            test_restore,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
            outcomes: Vec::new(),
        }
    }

    pub fn failed_count(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| o.action == RestoreAction::Failed)
            .count()
    }
}

// ================================ SCHEDULES ===================================== //

/// Parse a five-field cron expression, evaluated in UTC
pub fn parse_cron(expression: &str) -> Result<Cron, DockyardError> {
    Cron::new(expression.trim()).parse().map_err(|e| {
        DockyardError::ValidationError(format!("invalid cron expression '{}': {}", expression, e))
    })
}

/// Fields a caller sets on a backup schedule
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduleRequest {
    pub name: String,
    pub cron_expression: String,
    #[serde(default)]
    pub include_volumes: bool,
    #[serde(default)]
    pub encrypted: bool,
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ScheduleRequest {
    pub fn validate(&self) -> Result<Cron, DockyardError> {
        if self.name.trim().is_empty() {
            return Err(DockyardError::ValidationError(
                "schedule name must not be empty".to_string(),
            ));
        }
        parse_cron(&self.cron_expression)
    }
}

/// Cron-driven backup of every running deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupSchedule {
    pub id: String,
    pub name: String,
    pub cron_expression: String,
    pub include_volumes: bool,
    pub encrypted: bool,
    pub enabled: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_run: Option<DateTime<Utc>>,

    /// Next fire time; `None` while disabled
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackupSchedule {
    pub fn new(
        id: impl Into<String>,
        request: ScheduleRequest,
        now: DateTime<Utc>,
    ) -> Result<Self, DockyardError> {
        let mut schedule = Self {
            id: id.into(),
            name: String::new(),
            cron_expression: String::new(),
            include_volumes: false,
            encrypted: false,
            enabled: false,
            last_run: None,
            next_run: None,
            created_at: now,
            updated_at: now,
        };
        schedule.apply(request, now)?;
        Ok(schedule)
    }

    /// Replace the caller-set fields and recompute `next_run`
    pub fn apply(&mut self, request: ScheduleRequest, now: DateTime<Utc>) -> Result<(), DockyardError> {
        let cron = request.validate()?;
        self.name = request.name;
        self.cron_expression = request.cron_expression.trim().to_string();
        self.include_volumes = request.include_volumes;
        self.encrypted = request.encrypted;
        self.enabled = request.enabled;
        self.next_run = if self.enabled {
            next_occurrence(&cron, now)
        } else {
            None
        };
        self.updated_at = now;
        Ok(())
    }

    /// Whether the schedule fired in `(since, now]`
    pub fn is_due(&self, since: DateTime<Utc>, now: DateTime<Utc>) -> Result<bool, DockyardError> {
        if !self.enabled || now <= since {
            return Ok(false);
        }
        let cron = parse_cron(&self.cron_expression)?;
        Ok(next_occurrence(&cron, since).map_or(false, |next| next <= now))
    }

    /// Record a run at `now`
    pub fn mark_run(&mut self, now: DateTime<Utc>) -> Result<(), DockyardError> {
        let cron = parse_cron(&self.cron_expression)?;
        self.last_run = Some(now);
        self.next_run = next_occurrence(&cron, now);
        self.updated_at = now;
        Ok(())
    }
}

/// First occurrence strictly after `after`
fn next_occurrence(cron: &Cron, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
    cron.find_next_occurrence(&after, false).ok()
}
