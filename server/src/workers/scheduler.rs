//! Backup scheduler worker

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use chrono::{DateTime, Datelike, Days, Utc};
use tracing::{debug, error, info};

use crate::backup::BackupEngine;
use crate::errors::DockyardError;
use crate::models::backup::{BackupOptions, BackupSelection, BackupType};
use crate::storage::settings::{RetentionSettings, Schedule, ScheduleSettings};

/// Scheduler worker options
#[derive(Debug, Clone)]
pub struct Options {
    /// How often schedules are evaluated
    pub poll_interval: Duration,

    /// Initial delay before the first evaluation
    pub initial_delay: Duration,

    pub schedules: ScheduleSettings,

    pub retention: RetentionSettings,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(30),
            initial_delay: Duration::from_secs(5),
            schedules: ScheduleSettings::default(),
            retention: RetentionSettings::default(),
        }
    }
}

/// Whether `schedule` had a run time in `(since, now]`
pub fn is_due(
    schedule: &Schedule,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) -> Result<bool, DockyardError> {
    if !schedule.enabled || now <= since {
        return Ok(false);
    }
    let time = schedule.time_of_day()?;
    let weekday = schedule.weekday()?;

    let mut date = since.date_naive();
    while date <= now.date_naive() {
        let run_at = date.and_time(time).and_utc();
        let day_matches = weekday.map_or(true, |w| date.weekday() == w);
        if day_matches && run_at > since && run_at <= now {
            return Ok(true);
        }
        match date.checked_add_days(Days::new(1)) {
            Some(next) => date = next,
            None => break,
        }
    }
    Ok(false)
}

/// Capture all running deployments as a scheduled backup
async fn run_schedule(
    engine: &BackupEngine,
    label: &str,
    include_volumes: bool,
    encrypted: bool,
    now: DateTime<Utc>,
) {
    let options = BackupOptions {
        name: format!("scheduled-{}-{}", label, now.format("%Y%m%d-%H%M")),
        backup_type: BackupType::Scheduled,
        include_volumes,
        encrypted,
    };

    match engine
        .create_backup(BackupSelection::AllRunning, options)
        .await
    {
        Ok(backup) => info!("Started {} backup {}", label, backup.id),
        Err(DockyardError::NoDeploymentsSelected) => {
            debug!("Skipping {} backup: no running deployments", label)
        }
        Err(e) => error!("Failed to start {} backup: {}", label, e),
    }
}

/// Evaluate schedules once for the window `(since, now]`
pub async fn tick(
    options: &Options,
    engine: &BackupEngine,
    since: DateTime<Utc>,
    now: DateTime<Utc>,
) {
    let mut ran = false;
    for (label, schedule) in [
        ("daily", &options.schedules.daily),
        ("weekly", &options.schedules.weekly),
    ] {
        match is_due(schedule, since, now) {
            Ok(true) => {
                run_schedule(engine, label, schedule.include_volumes, schedule.encrypted, now)
                    .await;
                ran = true;
            }
            Ok(false) => {}
            Err(e) => error!("Invalid {} schedule: {}", label, e),
        }
    }

    let schedules = match engine.schedules().list().await {
        Ok(schedules) => schedules,
        Err(e) => {
            error!("Failed to load backup schedules: {}", e);
            Vec::new()
        }
    };
    for schedule in schedules {
        match schedule.is_due(since, now) {
            Ok(true) => {
                run_schedule(
                    engine,
                    &schedule.name,
                    schedule.include_volumes,
                    schedule.encrypted,
                    now,
                )
                .await;
                if let Err(e) = engine.schedules().record_run(&schedule, now).await {
                    error!("Failed to record run of schedule {}: {}", schedule.id, e);
                }
                ran = true;
            }
            Ok(false) => {}
            Err(e) => error!("Invalid schedule {}: {}", schedule.id, e),
        }
    }

    if ran {
        if let Err(e) = engine.apply_retention(&options.retention, now).await {
            error!("Failed to apply backup retention: {}", e);
        }
    }
}

/// Run the scheduler worker
pub async fn run<S, F>(
    options: &Options,
    engine: &BackupEngine,
    sleep_fn: S,
    mut shutdown_signal: Pin<Box<dyn Future<Output = ()> + Send>>,
) where
    S: Fn(Duration) -> F,
    F: Future<Output = ()>,
{
    info!("Backup scheduler starting...");

    tokio::select! {
        _ = &mut shutdown_signal => {
            info!("Backup scheduler shutting down...");
            return;
        }
        _ = sleep_fn(options.initial_delay) => {}
    }

    let mut last_checked = Utc::now();
    loop {
        tokio::select! {
            _ = &mut shutdown_signal => {
                info!("Backup scheduler shutting down...");
                return;
            }
            _ = sleep_fn(options.poll_interval) => {}
        }

        let now = Utc::now();
        debug!("Evaluating backup schedules...");
        tick(options, engine, last_checked, now).await;
        last_checked = now;
    }
}
