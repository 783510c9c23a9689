//! Notification job store and per-user delivery preferences.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::notifications::{DeliveryOutcome, NotificationJob};
use crate::users::NotificationPreferences;

#[async_trait]
pub trait NotificationsRepository: Send + Sync {
    /// Persist a job for later pickup by the poller.
    async fn enqueue(&self, job: NotificationJob) -> StoreResult<()>;

    /// Up to `limit` undelivered jobs. Implementations must not hand the
    /// same job to two concurrent pollers.
    async fn list_pending(&self, limit: usize) -> StoreResult<Vec<NotificationJob>>;

    /// Record the terminal outcome for a job.
    async fn mark_sent(
        &self,
        job_id: Uuid,
        outcome: DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> StoreResult<()>;

    async fn get_preferences(&self, user_id: Uuid) -> StoreResult<NotificationPreferences>;

    /// Expiry sweep: drop jobs whose `expires_at` has passed or that are
    /// older than `older_than`, returning the number removed.
    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        older_than: DateTime<Utc>,
    ) -> StoreResult<u64>;
}

pub type DynNotificationsRepo = Arc<dyn NotificationsRepository>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum JobState {
    Pending,
    Claimed,
    Done(DeliveryOutcome),
}

struct StoredJob {
    job: NotificationJob,
    state: JobState,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct MemoryNotificationsRepository {
    jobs: DashMap<Uuid, StoredJob>,
    preferences: DashMap<Uuid, NotificationPreferences>,
}

impl MemoryNotificationsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_preferences(&self, prefs: NotificationPreferences) {
        self.preferences.insert(prefs.user_id, prefs);
    }

    pub fn outcome_of(&self, job_id: Uuid) -> Option<DeliveryOutcome> {
        self.jobs.get(&job_id).and_then(|s| match s.state {
            JobState::Done(outcome) => Some(outcome),
            _ => None,
        })
    }

    pub fn finished_at_of(&self, job_id: Uuid) -> Option<DateTime<Utc>> {
        self.jobs.get(&job_id).and_then(|s| s.finished_at)
    }

    pub fn job_count(&self) -> usize {
        self.jobs.len()
    }
}

#[async_trait]
impl NotificationsRepository for MemoryNotificationsRepository {
    async fn enqueue(&self, job: NotificationJob) -> StoreResult<()> {
        self.jobs.insert(
            job.id,
            StoredJob {
                job,
                state: JobState::Pending,
                finished_at: None,
            },
        );
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> StoreResult<Vec<NotificationJob>> {
        let mut claimed = Vec::new();
        for mut entry in self.jobs.iter_mut() {
            if claimed.len() >= limit {
                break;
            }
            if entry.state == JobState::Pending {
                entry.state = JobState::Claimed;
                claimed.push(entry.job.clone());
            }
        }
        Ok(claimed)
    }

    async fn mark_sent(
        &self,
        job_id: Uuid,
        outcome: DeliveryOutcome,
        at: DateTime<Utc>,
    ) -> StoreResult<()> {
        if let Some(mut stored) = self.jobs.get_mut(&job_id) {
            stored.state = JobState::Done(outcome);
            stored.finished_at = Some(at);
        }
        Ok(())
    }

    async fn get_preferences(&self, user_id: Uuid) -> StoreResult<NotificationPreferences> {
        Ok(self
            .preferences
            .get(&user_id)
            .map(|p| p.clone())
            .unwrap_or_else(|| NotificationPreferences::allow_all(user_id)))
    }

    async fn delete_expired(
        &self,
        now: DateTime<Utc>,
        older_than: DateTime<Utc>,
    ) -> StoreResult<u64> {
        let before = self.jobs.len();
        self.jobs.retain(|_, stored| {
            let expired = stored.job.expires_at.is_some_and(|e| e < now);
            let stale = stored.job.created_at < older_than;
            !(expired || stale)
        });
        Ok((before - self.jobs.len()) as u64)
    }
}
