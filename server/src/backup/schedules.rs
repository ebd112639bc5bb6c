//! Persisted cron backup schedules

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::info;

use crate::errors::DockyardError;
use crate::models::backup::{BackupSchedule, ScheduleRequest};
use crate::store::Store;
use crate::utils::generate_uuid;

#[derive(Clone)]
pub struct ScheduleBook {
    store: Arc<dyn Store>,
}

impl ScheduleBook {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub async fn create(&self, request: ScheduleRequest) -> Result<BackupSchedule, DockyardError> {
        let schedule = BackupSchedule::new(generate_uuid(), request, Utc::now())?;
        self.store.insert_schedule(schedule.clone()).await?;
        info!(
            "Created backup schedule {} ({}, '{}')",
            schedule.id, schedule.name, schedule.cron_expression
        );
        Ok(schedule)
    }

    pub async fn get(&self, id: &str) -> Result<BackupSchedule, DockyardError> {
        self.store
            .get_schedule(id)
            .await?
            .ok_or_else(|| DockyardError::NotFound(format!("backup schedule {}", id)))
    }

    pub async fn list(&self) -> Result<Vec<BackupSchedule>, DockyardError> {
        self.store.list_schedules().await
    }

    pub async fn update(
        &self,
        id: &str,
        request: ScheduleRequest,
    ) -> Result<BackupSchedule, DockyardError> {
        let mut schedule = self.get(id).await?;
        schedule.apply(request, Utc::now())?;
        self.store.update_schedule(schedule.clone()).await?;
        info!("Updated backup schedule {} ({})", schedule.id, schedule.name);
        Ok(schedule)
    }

    pub async fn delete(&self, id: &str) -> Result<(), DockyardError> {
        if !self.store.delete_schedule(id).await? {
            return Err(DockyardError::NotFound(format!("backup schedule {}", id)));
        }
        info!("Deleted backup schedule {}", id);
        Ok(())
    }

    /// Record that `schedule` fired at `now`
    pub async fn record_run(
        &self,
        schedule: &BackupSchedule,
        now: DateTime<Utc>,
    ) -> Result<BackupSchedule, DockyardError> {
        let mut updated = schedule.clone();
        updated.mark_run(now)?;
        self.store.update_schedule(updated.clone()).await?;
        Ok(updated)
    }
}
