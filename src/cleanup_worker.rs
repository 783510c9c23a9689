//! Scheduled retention sweeps: location history, notification expiry, kv
//! prefixes, and temp files, all driven by a single one-minute ticker.

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::config::CleanupConfig;
use crate::kv::{DynKvStore, SWEEP_PREFIXES};
use crate::locations_repo::DynLocationsRepo;
use crate::notifications_repo::DynNotificationsRepo;

const TICK: std::time::Duration = std::time::Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TaskKind {
    Locations,
    Notifications,
    KvSweep,
    TempFiles,
}

struct TaskState {
    kind: TaskKind,
    name: &'static str,
    interval: Duration,
    enabled: bool,
    last_run: Option<DateTime<Utc>>,
    next_run: DateTime<Utc>,
    runs: u64,
    failures: u64,
}

/// Snapshot of one task's schedule and outcome counters.
#[derive(Debug, Clone)]
pub struct CleanupTaskStats {
    pub name: &'static str,
    pub enabled: bool,
    pub last_run: Option<DateTime<Utc>>,
    pub next_run: DateTime<Utc>,
    pub runs: u64,
    pub failures: u64,
}

pub struct CleanupWorker {
    config: CleanupConfig,
    retention_days: u32,
    locations_repo: DynLocationsRepo,
    notifications_repo: DynNotificationsRepo,
    kv: DynKvStore,
    tasks: Vec<TaskState>,
}

impl CleanupWorker {
    pub fn new(
        config: CleanupConfig,
        retention_days: u32,
        locations_repo: DynLocationsRepo,
        notifications_repo: DynNotificationsRepo,
        kv: DynKvStore,
    ) -> Self {
        let now = Utc::now();
        let task = |kind, name, hours: u64, enabled| TaskState {
            kind,
            name,
            interval: Duration::hours(hours as i64),
            enabled,
            last_run: None,
            next_run: now,
            runs: 0,
            failures: 0,
        };
        let tasks = vec![
            task(
                TaskKind::Locations,
                "locations",
                config.locations_interval_hours,
                true,
            ),
            task(
                TaskKind::Notifications,
                "notifications",
                config.notifications_interval_hours,
                true,
            ),
            task(TaskKind::KvSweep, "kv", config.kv_interval_hours, true),
            task(
                TaskKind::TempFiles,
                "temp_files",
                config.temp_files_interval_hours,
                config.temp_dir.is_some(),
            ),
        ];
        Self {
            config,
            retention_days,
            locations_repo,
            notifications_repo,
            kv,
            tasks,
        }
    }

    pub fn task_stats(&self) -> Vec<CleanupTaskStats> {
        self.tasks
            .iter()
            .map(|t| CleanupTaskStats {
                name: t.name,
                enabled: t.enabled,
                last_run: t.last_run,
                next_run: t.next_run,
                runs: t.runs,
                failures: t.failures,
            })
            .collect()
    }

    /// Run every task whose `next_run` has passed; returns how many ran.
    /// Failures are logged and counted; a failed task still waits out its
    /// full interval.
    pub async fn run_pending(&mut self, now: DateTime<Utc>) -> usize {
        let mut ran = 0;
        for i in 0..self.tasks.len() {
            if !self.tasks[i].enabled || now < self.tasks[i].next_run {
                continue;
            }
            let kind = self.tasks[i].kind;
            let name = self.tasks[i].name;
            let result = self.run_task(kind, now).await;

            let task = &mut self.tasks[i];
            task.last_run = Some(now);
            task.next_run = now + task.interval;
            task.runs += 1;
            ran += 1;
            match result {
                Ok(removed) => {
                    info!(task = name, removed, "Cleanup task finished");
                    metrics::counter!("cleanup.runs_total", "task" => name).increment(1);
                }
                Err(e) => {
                    task.failures += 1;
                    error!(task = name, error = %e, "Cleanup task failed");
                    metrics::counter!("cleanup.failures_total", "task" => name).increment(1);
                }
            }
        }
        ran
    }

    async fn run_task(&self, kind: TaskKind, now: DateTime<Utc>) -> Result<u64> {
        match kind {
            TaskKind::Locations => {
                let cutoff = now - Duration::days(self.retention_days as i64);
                Ok(self
                    .locations_repo
                    .delete_older_than(cutoff)
                    .await
                    .context("location retention sweep")?)
            }
            TaskKind::Notifications => {
                let cutoff = now - Duration::days(self.retention_days as i64);
                Ok(self
                    .notifications_repo
                    .delete_expired(now, cutoff)
                    .await
                    .context("notification expiry sweep")?)
            }
            TaskKind::KvSweep => self.sweep_kv().await,
            TaskKind::TempFiles => self.sweep_temp_files(now).await,
        }
    }

    /// Delete keys under the well-known prefixes that were written without
    /// a TTL and have exceeded the configured age.
    async fn sweep_kv(&self) -> Result<u64> {
        let max_age = Duration::hours(self.config.kv_max_age_hours as i64);
        let mut removed = 0u64;
        for prefix in SWEEP_PREFIXES {
            let entries = self
                .kv
                .scan_prefix(prefix)
                .await
                .with_context(|| format!("kv scan of {prefix}"))?;
            for entry in entries {
                if !entry.has_ttl && entry.age > max_age {
                    if self.kv.delete(&entry.key).await.unwrap_or(false) {
                        removed += 1;
                    }
                }
            }
        }
        Ok(removed)
    }

    async fn sweep_temp_files(&self, now: DateTime<Utc>) -> Result<u64> {
        let Some(dir) = self.config.temp_dir.as_deref() else {
            return Ok(0);
        };
        let max_age = std::time::Duration::from_secs(self.config.temp_max_age_hours * 3600);
        let mut removed = 0u64;
        let mut entries = tokio::fs::read_dir(dir)
            .await
            .with_context(|| format!("reading temp dir {dir}"))?;
        while let Some(entry) = entries.next_entry().await? {
            let metadata = match entry.metadata().await {
                Ok(m) if m.is_file() => m,
                _ => continue,
            };
            let modified: DateTime<Utc> = match metadata.modified() {
                Ok(t) => t.into(),
                Err(_) => continue,
            };
            if (now - modified).to_std().unwrap_or_default() > max_age {
                match tokio::fs::remove_file(entry.path()).await {
                    Ok(()) => removed += 1,
                    Err(e) => debug!(path = ?entry.path(), error = %e, "Failed to remove temp file"),
                }
            }
        }
        Ok(removed)
    }

    /// Run under the shared one-minute ticker until cancelled. The
    /// in-flight task always completes before shutdown.
    pub fn spawn(mut self, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(TICK);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            tick.tick().await;
            info!("Cleanup worker started");
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        self.run_pending(Utc::now()).await;
                    }
                }
            }
            info!("Cleanup worker stopped");
        })
    }
}
