//! In-memory store with an optional JSON snapshot

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::errors::DockyardError;
use crate::filesys::file::File;
use crate::models::backup::{Backup, BackupSchedule, BackupStatus};
use crate::models::deployment::{
    Deployment, DeploymentLog, DeploymentStatus, GlobalTunnelConfig, LogSeverity,
};
use crate::store::Store;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct State {
    #[serde(default)]
    deployments: BTreeMap<String, Deployment>,
    #[serde(default)]
    logs: BTreeMap<String, Vec<DeploymentLog>>,
    #[serde(default)]
    backups: BTreeMap<String, Backup>,
    #[serde(default)]
    schedules: BTreeMap<String, BackupSchedule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    tunnel: Option<GlobalTunnelConfig>,
}

/// Store keeping records in memory.
///
/// With a snapshot file every mutation is applied to a copy of the state,
/// written through atomically, and only then swapped in. A failed write
/// leaves both the file and memory as they were.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: RwLock<State>,
    snapshot: Option<File>,
}

impl MemoryStore {
    /// Volatile store
    pub fn new() -> Self {
        Self::default()
    }

    /// Store backed by `file`, loading it when present
    pub async fn open(file: File) -> Result<Self, DockyardError> {
        let state = if file.exists().await {
            let state: State = file.read_json().await?;
            info!(
                "Loaded {} deployments, {} backups and {} schedules from {}",
                state.deployments.len(),
                state.backups.len(),
                state.schedules.len(),
                file.path().display()
            );
            state
        } else {
            State::default()
        };

        Ok(Self {
            state: RwLock::new(state),
            snapshot: Some(file),
        })
    }

    /// Run `change` under the write lock and commit its result.
    ///
    /// `change` must check its preconditions before touching the state.
    async fn mutate<T, F>(&self, change: F) -> Result<T, DockyardError>
    where
        F: FnOnce(&mut State) -> Result<T, DockyardError> + Send,
        T: Send,
    {
        let mut state = self.state.write().await;
        let Some(file) = &self.snapshot else {
            return change(&mut *state);
        };

        let mut next = state.clone();
        let out = change(&mut next)?;
        let bytes = serde_json::to_vec_pretty(&next)?;
        file.write_atomic(&bytes).await?;
        debug!("Persisted state to {}", file.path().display());
        *state = next;
        Ok(out)
    }
}

fn deployment_not_found(id: &str) -> DockyardError {
    DockyardError::NotFound(format!("deployment {}", id))
}

#[async_trait]
impl Store for MemoryStore {
    async fn insert_deployment(&self, deployment: Deployment) -> Result<(), DockyardError> {
        self.mutate(move |state| {
            if state.deployments.contains_key(&deployment.id) {
                return Err(DockyardError::Conflict(format!(
                    "deployment {} already exists",
                    deployment.id
                )));
            }
            if state
                .deployments
                .values()
                .any(|d| d.stack_name.eq_ignore_ascii_case(&deployment.stack_name))
            {
                return Err(DockyardError::Conflict(format!(
                    "stack name '{}' is already in use",
                    deployment.stack_name
                )));
            }
            state.deployments.insert(deployment.id.clone(), deployment);
            Ok(())
        })
        .await
    }

    async fn get_deployment(&self, id: &str) -> Result<Option<Deployment>, DockyardError> {
        Ok(self.state.read().await.deployments.get(id).cloned())
    }

    async fn find_by_stack_name(&self, stack_name: &str) -> Result<Option<Deployment>, DockyardError> {
        Ok(self
            .state
            .read()
            .await
            .deployments
            .values()
            .find(|d| d.stack_name.eq_ignore_ascii_case(stack_name))
            .cloned())
    }

    async fn list_deployments(
        &self,
        status: Option<DeploymentStatus>,
    ) -> Result<Vec<Deployment>, DockyardError> {
        let state = self.state.read().await;
        let mut deployments: Vec<Deployment> = state
            .deployments
            .values()
            .filter(|d| status.map_or(true, |s| d.status == s))
            .cloned()
            .collect();
        deployments.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(deployments)
    }

    async fn compare_and_set_status(
        &self,
        id: &str,
        expected: DeploymentStatus,
        new: DeploymentStatus,
        tunnel_url: Option<String>,
    ) -> Result<bool, DockyardError> {
        {
            let state = self.state.read().await;
            match state.deployments.get(id) {
                None => return Err(deployment_not_found(id)),
                Some(d) if d.status != expected => return Ok(false),
                Some(_) => {}
            }
        }

        self.mutate(|state| {
            let deployment = state
                .deployments
                .get_mut(id)
                .ok_or_else(|| deployment_not_found(id))?;
            if deployment.status != expected {
                return Ok(false);
            }
            deployment.status = new;
            if tunnel_url.is_some() {
                deployment.tunnel_url = tunnel_url;
            }
            deployment.updated_at = Utc::now();
            Ok(true)
        })
        .await
    }

    async fn set_compose_source(
        &self,
        id: &str,
        compose_source: String,
    ) -> Result<(), DockyardError> {
        self.mutate(|state| {
            let deployment = state
                .deployments
                .get_mut(id)
                .ok_or_else(|| deployment_not_found(id))?;
            deployment.compose_source = Some(compose_source);
            deployment.updated_at = Utc::now();
            Ok(())
        })
        .await
    }

    async fn delete_deployment(
        &self,
        id: &str,
        expected: DeploymentStatus,
    ) -> Result<bool, DockyardError> {
        self.mutate(|state| {
            match state.deployments.get(id) {
                None => return Err(deployment_not_found(id)),
                Some(d) if d.status != expected => return Ok(false),
                Some(_) => {}
            }
            state.deployments.remove(id);
            state.logs.remove(id);
            Ok(true)
        })
        .await
    }

    async fn append_log(
        &self,
        deployment_id: &str,
        level: LogSeverity,
        message: &str,
    ) -> Result<DeploymentLog, DockyardError> {
        self.mutate(|state| {
            if !state.deployments.contains_key(deployment_id) {
                return Err(deployment_not_found(deployment_id));
            }

            let entries = state.logs.entry(deployment_id.to_string()).or_default();
            let mut timestamp = Utc::now();
            if let Some(last) = entries.last() {
                if timestamp <= last.timestamp {
                    timestamp = last.timestamp + Duration::microseconds(1);
                }
            }
            let entry = DeploymentLog {
                deployment_id: deployment_id.to_string(),
                level,
                message: message.to_string(),
                timestamp,
            };
            entries.push(entry.clone());
            Ok(entry)
        })
        .await
    }

    async fn logs(&self, deployment_id: &str) -> Result<Vec<DeploymentLog>, DockyardError> {
        Ok(self
            .state
            .read()
            .await
            .logs
            .get(deployment_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn insert_backup(&self, backup: Backup) -> Result<(), DockyardError> {
        self.mutate(move |state| {
            if state.backups.contains_key(&backup.id) {
                return Err(DockyardError::Conflict(format!(
                    "backup {} already exists",
                    backup.id
                )));
            }
            state.backups.insert(backup.id.clone(), backup);
            Ok(())
        })
        .await
    }

    async fn get_backup(&self, id: &str) -> Result<Option<Backup>, DockyardError> {
        Ok(self.state.read().await.backups.get(id).cloned())
    }

    async fn list_backups(&self) -> Result<Vec<Backup>, DockyardError> {
        let state = self.state.read().await;
        let mut backups: Vec<Backup> = state.backups.values().cloned().collect();
        backups.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(backups)
    }

    async fn update_backup(
        &self,
        expected: BackupStatus,
        mut backup: Backup,
    ) -> Result<bool, DockyardError> {
        self.mutate(move |state| {
            let stored = state
                .backups
                .get_mut(&backup.id)
                .ok_or_else(|| DockyardError::NotFound(format!("backup {}", backup.id)))?;
            if stored.status != expected {
                return Ok(false);
            }
            backup.deployment_ids = stored.deployment_ids.clone();
            *stored = backup;
            Ok(true)
        })
        .await
    }

    async fn delete_backup(&self, id: &str) -> Result<bool, DockyardError> {
        if !self.state.read().await.backups.contains_key(id) {
            return Ok(false);
        }
        self.mutate(|state| Ok(state.backups.remove(id).is_some()))
            .await
    }

    async fn insert_schedule(&self, schedule: BackupSchedule) -> Result<(), DockyardError> {
        self.mutate(move |state| {
            if state.schedules.contains_key(&schedule.id) {
                return Err(DockyardError::Conflict(format!(
                    "schedule {} already exists",
                    schedule.id
                )));
            }
            state.schedules.insert(schedule.id.clone(), schedule);
            Ok(())
        })
        .await
    }

    async fn get_schedule(&self, id: &str) -> Result<Option<BackupSchedule>, DockyardError> {
        Ok(self.state.read().await.schedules.get(id).cloned())
    }

    async fn list_schedules(&self) -> Result<Vec<BackupSchedule>, DockyardError> {
        let state = self.state.read().await;
        let mut schedules: Vec<BackupSchedule> = state.schedules.values().cloned().collect();
        schedules.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(schedules)
    }

    async fn update_schedule(&self, schedule: BackupSchedule) -> Result<(), DockyardError> {
        self.mutate(move |state| {
            let stored = state
                .schedules
                .get_mut(&schedule.id)
                .ok_or_else(|| DockyardError::NotFound(format!("schedule {}", schedule.id)))?;
            *stored = schedule;
            Ok(())
        })
        .await
    }

    async fn delete_schedule(&self, id: &str) -> Result<bool, DockyardError> {
        if !self.state.read().await.schedules.contains_key(id) {
            return Ok(false);
        }
        self.mutate(|state| Ok(state.schedules.remove(id).is_some()))
            .await
    }

    async fn tunnel_config(&self) -> Result<Option<GlobalTunnelConfig>, DockyardError> {
        Ok(self.state.read().await.tunnel.clone())
    }

    async fn set_tunnel_config(&self, config: GlobalTunnelConfig) -> Result<(), DockyardError> {
        self.mutate(move |state| {
            state.tunnel = Some(config);
            Ok(())
        })
        .await
    }
}
