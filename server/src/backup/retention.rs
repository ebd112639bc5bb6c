//! Retention of scheduled backups.
//!
//! Each scheduled backup falls into one bucket by the alignment of its
//! creation time: first of the month at midnight is monthly, Sunday at
//! midnight is weekly, anything else is daily. A bucket with count `n` keeps
//! at most its `n` newest backups, and only those younger than `n` periods.

use chrono::{DateTime, Datelike, Duration, Months, Timelike, Utc, Weekday};
use serde::{Deserialize, Serialize};

use crate::models::backup::{Backup, BackupStatus, BackupType};
use crate::storage::settings::RetentionSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RetentionBucket {
    Daily,
    Weekly,
    Monthly,
}

/// Bucket of a backup created at `created_at`
pub fn classify(created_at: DateTime<Utc>) -> RetentionBucket {
    let midnight = created_at.hour() == 0;
    if midnight && created_at.day() == 1 {
        RetentionBucket::Monthly
    } else if midnight && created_at.weekday() == Weekday::Sun {
        RetentionBucket::Weekly
    } else {
        RetentionBucket::Daily
    }
}

fn keep_count(bucket: RetentionBucket, policy: &RetentionSettings) -> u32 {
    match bucket {
        RetentionBucket::Daily => policy.daily,
        RetentionBucket::Weekly => policy.weekly,
        RetentionBucket::Monthly => policy.monthly,
    }
}

/// Oldest creation time still inside a bucket's window
fn window_start(bucket: RetentionBucket, count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let start = match bucket {
        RetentionBucket::Daily => now.checked_sub_signed(Duration::days(count.into())),
        RetentionBucket::Weekly => now.checked_sub_signed(Duration::weeks(count.into())),
        RetentionBucket::Monthly => now.checked_sub_months(Months::new(count)),
    };
    start.unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// IDs of scheduled backups the policy no longer keeps.
///
/// Manual and auto backups, and backups still being created, are never
/// selected.
pub fn plan_retention(
    backups: &[Backup],
    policy: &RetentionSettings,
    now: DateTime<Utc>,
) -> Vec<String> {
    let mut expired = Vec::new();

    for bucket in [
        RetentionBucket::Daily,
        RetentionBucket::Weekly,
        RetentionBucket::Monthly,
    ] {
        let mut members: Vec<&Backup> = backups
            .iter()
            .filter(|b| b.backup_type == BackupType::Scheduled)
            .filter(|b| b.status != BackupStatus::Creating)
            .filter(|b| classify(b.created_at) == bucket)
            .collect();
        // newest first
        members.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));

        let count = keep_count(bucket, policy);
        let oldest_kept = window_start(bucket, count, now);
        for (rank, backup) in members.into_iter().enumerate() {
            if rank >= count as usize || backup.created_at < oldest_kept {
                expired.push(backup.id.clone());
            }
        }
    }

    expired
}
