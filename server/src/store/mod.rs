//! Persistence of deployment, backup and schedule records.
//!
//! The store is the serialization point for status changes: every status
//! write is conditioned on the status the caller last observed.

pub mod memory;

use async_trait::async_trait;

use crate::errors::DockyardError;
use crate::models::backup::{Backup, BackupSchedule, BackupStatus};
use crate::models::deployment::{
    Deployment, DeploymentLog, DeploymentStatus, GlobalTunnelConfig, LogSeverity,
};

pub use memory::MemoryStore;

#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a new deployment; `Conflict` if the ID is taken or the stack
    /// name is taken in any letter case
    async fn insert_deployment(&self, deployment: Deployment) -> Result<(), DockyardError>;

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, DockyardError>;

    /// Case-insensitive lookup
    async fn find_by_stack_name(&self, stack_name: &str) -> Result<Option<Deployment>, DockyardError>;

    /// Deployments ordered by creation time, optionally filtered by status
    async fn list_deployments(
        &self,
        status: Option<DeploymentStatus>,
    ) -> Result<Vec<Deployment>, DockyardError>;

    /// Set `new` if the stored status is `expected`, optionally recording a
    /// tunnel URL in the same write. Returns whether the write happened.
    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: DeploymentStatus,
        new: DeploymentStatus,
        tunnel_url: Option<String>,
    ) -> Result<bool, DockyardError>;

    /// Set `new` if the stored status is `expected`
    async fn update_status(
        &self,
        id: &str,
        expected: DeploymentStatus,
        new: DeploymentStatus,
    ) -> Result<bool, DockyardError> {
        self.compare_and_set_status(id, expected, new, None).await
    }

    /// Remember the compose source a deployment was last deployed from
    async fn set_compose_source(&self, id: &str, compose_source: String)
        -> Result<(), DockyardError>;

    /// Remove a deployment and its logs if its status is `expected`
    async fn delete_deployment(
        &self,
        id: &str,
        expected: DeploymentStatus,
    ) -> Result<bool, DockyardError>;

    /// Append a log entry; timestamps strictly increase per deployment
    async fn append_log(
        &self,
        deployment_id: &str,
        level: LogSeverity,
        message: &str,
    ) -> Result<DeploymentLog, DockyardError>;

    /// Log entries in append order
    async fn logs(&self, deployment_id: &str) -> Result<Vec<DeploymentLog>, DockyardError>;

    async fn insert_backup(&self, backup: Backup) -> Result<(), DockyardError>;

    async fn get_backup(&self, id: &str) -> Result<Option<Backup>, DockyardError>;

    /// Backups ordered by creation time
    async fn list_backups(&self) -> Result<Vec<Backup>, DockyardError>;

    /// Replace a backup record if its stored status is `expected`.
    ///
    /// The captured deployment IDs are never changed.
    async fn update_backup(
        &self,
        expected: BackupStatus,
        backup: Backup,
    ) -> Result<bool, DockyardError>;

    async fn delete_backup(&self, id: &str) -> Result<bool, DockyardError>;

    async fn insert_schedule(&self, schedule: BackupSchedule) -> Result<(), DockyardError>;

    async fn get_schedule(&self, id: &str) -> Result<Option<BackupSchedule>, DockyardError>;

    /// Schedules ordered by creation time
    async fn list_schedules(&self) -> Result<Vec<BackupSchedule>, DockyardError>;

    /// Replace an existing schedule; `NotFound` if it was deleted
    async fn update_schedule(&self, schedule: BackupSchedule) -> Result<(), DockyardError>;

    async fn delete_schedule(&self, id: &str) -> Result<bool, DockyardError>;

    async fn tunnel_config(&self) -> Result<Option<GlobalTunnelConfig>, DockyardError>;

    async fn set_tunnel_config(&self, config: GlobalTunnelConfig) -> Result<(), DockyardError>;
}
