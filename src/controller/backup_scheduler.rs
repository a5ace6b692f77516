//! Scheduled backups
//!
//! Every tick, the cron schedules of the cached datacenters are evaluated
//! over the elapsed window and a backup [`Task`] is created for each firing.
//! Task names derive from the firing time, so a firing is created at most
//! once even if two operator replicas overlap.

use std::collections::BTreeMap;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use kube::api::{Api, PostParams};
use kube::Client;
use tracing::{debug, info, warn};

use super::cache::ResourceCache;
use super::phase::{CLUSTER_LABEL, DATACENTER_LABEL, MANAGED_BY_LABEL, MANAGED_BY_VALUE};
use crate::crd::{BackupTaskSpec, DataCenter, ScheduledBackup, Task, TaskSpec};

/// Backup tasks whose schedule fired in `(since, now]`
pub fn due_backups(dc: &DataCenter, since: DateTime<Utc>, now: DateTime<Utc>) -> Vec<Task> {
    let mut tasks = Vec::new();
    for backup in &dc.spec.scheduled_backups {
        let schedule = match cron::Schedule::from_str(&backup.schedule) {
            Ok(schedule) => schedule,
            Err(e) => {
                warn!(
                    datacenter = %dc.datacenter_key(),
                    backup = %backup.name,
                    "Invalid backup schedule: {}", e
                );
                continue;
            }
        };
        // Only the latest firing of the window, missed ones are not replayed
        let fired = schedule.after(&since).take_while(|t| *t <= now).last();
        if let Some(fired) = fired {
            tasks.push(backup_task(dc, backup, fired));
        }
    }
    tasks
}

fn backup_task(dc: &DataCenter, backup: &ScheduledBackup, fired: DateTime<Utc>) -> Task {
    let stamp = fired.format("%Y%m%d%H%M%S").to_string();
    let mut task = Task::new(
        &format!("{}-{}-{}", dc.resource_prefix(), backup.name, stamp),
        TaskSpec {
            cluster: dc.spec.cluster_name.clone(),
            datacenter: dc.spec.datacenter_name.clone(),
            backup: Some(BackupTaskSpec {
                target: backup.target.clone(),
                snapshot_tag: Some(format!("{}-{}", backup.name, stamp)),
            }),
            ..Default::default()
        },
    );
    task.metadata.namespace = Some(dc.namespace_or_default());
    task.metadata.labels = Some(BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY_VALUE.to_string()),
        (CLUSTER_LABEL.to_string(), dc.spec.cluster_name.clone()),
        (DATACENTER_LABEL.to_string(), dc.spec.datacenter_name.clone()),
    ]));
    task
}

pub struct BackupScheduler {
    client: Client,
    datacenters: ResourceCache<DataCenter>,
    interval: Duration,
    is_leader: Arc<AtomicBool>,
}

impl BackupScheduler {
    pub fn new(
        client: Client,
        datacenters: ResourceCache<DataCenter>,
        interval: Duration,
        is_leader: Arc<AtomicBool>,
    ) -> Self {
        Self {
            client,
            datacenters,
            interval,
            is_leader,
        }
    }

    pub async fn run(self) {
        info!(interval = ?self.interval, "Starting backup scheduler");
        let mut ticker = tokio::time::interval(self.interval);
        let mut since = Utc::now();
        loop {
            ticker.tick().await;
            let now = Utc::now();
            if self.is_leader.load(Ordering::Relaxed) {
                for dc in self.datacenters.values() {
                    for task in due_backups(&dc, since, now) {
                        self.create(task).await;
                    }
                }
            }
            since = now;
        }
    }

    async fn create(&self, task: Task) {
        let namespace = task.namespace_or_default();
        let name = task.metadata.name.clone().unwrap_or_default();
        let api: Api<Task> = Api::namespaced(self.client.clone(), &namespace);
        match api.create(&PostParams::default(), &task).await {
            Ok(_) => info!(task = %name, namespace = %namespace, "Scheduled backup task created"),
            Err(kube::Error::Api(e)) if e.code == 409 => {
                debug!(task = %name, "Backup task already exists");
            }
            Err(e) => warn!(task = %name, "Failed to create backup task: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::datacenter;
    use chrono::TimeZone;

    fn nightly() -> DataCenter {
        let mut dc = datacenter("cl1", "dc1");
        dc.spec.scheduled_backups.push(ScheduledBackup {
            name: "nightly".to_string(),
            schedule: "0 0 2 * * *".to_string(),
            target: "s3://bucket/cl1".to_string(),
        });
        dc
    }

    #[test]
    fn test_backup_due_in_window() {
        let dc = nightly();
        let since = Utc.with_ymd_and_hms(2024, 5, 1, 1, 59, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 30).unwrap();

        let tasks = due_backups(&dc, since, now);
        assert_eq!(tasks.len(), 1);
        let task = &tasks[0];
        assert_eq!(
            task.metadata.name.as_deref(),
            Some("elassandra-cl1-dc1-nightly-20240501020000")
        );
        assert_eq!(task.metadata.namespace.as_deref(), Some("db"));
        let backup = task.spec.backup.as_ref().unwrap();
        assert_eq!(backup.target, "s3://bucket/cl1");
        assert_eq!(backup.snapshot_tag.as_deref(), Some("nightly-20240501020000"));
    }

    #[test]
    fn test_nothing_due_outside_window() {
        let dc = nightly();
        let since = Utc.with_ymd_and_hms(2024, 5, 1, 2, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap();
        assert!(due_backups(&dc, since, now).is_empty());
    }

    #[test]
    fn test_invalid_schedule_skipped() {
        let mut dc = nightly();
        dc.spec.scheduled_backups[0].schedule = "every night".to_string();
        let since = Utc.with_ymd_and_hms(2024, 5, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2024, 5, 2, 0, 0, 0).unwrap();
        assert!(due_backups(&dc, since, now).is_empty());
    }
}
