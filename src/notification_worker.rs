//! Notification delivery worker: a bounded queue, a small pool, and a
//! poller that picks up jobs persisted by other processes.
//!
//! Preference resolution happens here, not at submission: the global
//! kill-switch and quiet hours are evaluated against the recipient at
//! dispatch time, so a job enqueued at noon still respects a window that
//! started before it was picked up. Urgent jobs bypass quiet hours.

use chrono::Utc;
use rand::RngExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::NotifyConfig;
use crate::dispatcher::DynDispatcher;
use crate::error::{StoreError, SubmitError};
use crate::hub::HubHandle;
use crate::notifications::{DeliveryOutcome, NotificationChannel, NotificationJob};
use crate::notifications_repo::DynNotificationsRepo;
use crate::protocol::{Frame, FrameType};
use crate::users::{NotificationPreferences, User};
use crate::users_repo::DynUsersRepo;

const REPO_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

#[derive(Clone)]
pub struct NotificationWorkerHandle {
    tx: flume::Sender<NotificationJob>,
    capacity: usize,
    dropped: Arc<AtomicU64>,
}

impl NotificationWorkerHandle {
    /// Non-blocking submission from other workers.
    pub fn submit(&self, job: NotificationJob) -> Result<(), SubmitError> {
        match self.tx.try_send(job) {
            Ok(()) => {
                metrics::gauge!("notify.queue.depth").set(self.tx.len() as f64);
                Ok(())
            }
            Err(flume::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("notify.queue.dropped_total").increment(1);
                Err(SubmitError::QueueFull {
                    queue: "notify",
                    capacity: self.capacity,
                })
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                Err(SubmitError::Closed { queue: "notify" })
            }
        }
    }

    pub fn queue_depth(&self) -> usize {
        self.tx.len()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

pub struct NotificationWorker {
    config: NotifyConfig,
    repo: DynNotificationsRepo,
    users_repo: DynUsersRepo,
    dispatcher: DynDispatcher,
    hub: HubHandle,
}

impl NotificationWorker {
    pub fn new(
        config: NotifyConfig,
        repo: DynNotificationsRepo,
        users_repo: DynUsersRepo,
        dispatcher: DynDispatcher,
        hub: HubHandle,
    ) -> Self {
        Self {
            config,
            repo,
            users_repo,
            dispatcher,
            hub,
        }
    }

    /// Spawn the worker pool and the pending-job poller.
    pub fn spawn(self, cancel: CancellationToken) -> NotificationWorkerHandle {
        let (tx, rx) = flume::bounded::<NotificationJob>(self.config.queue_size);
        let handle = NotificationWorkerHandle {
            tx: tx.clone(),
            capacity: self.config.queue_size,
            dropped: Arc::new(AtomicU64::new(0)),
        };
        let worker = Arc::new(self);

        for worker_id in 0..worker.config.worker_count {
            let worker = worker.clone();
            let rx = rx.clone();
            let handle = handle.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => {
                            // Drain what is already queued, then exit.
                            while let Ok(job) = rx.try_recv() {
                                worker.process(job, &handle).await;
                            }
                            break;
                        }
                        job = rx.recv_async() => match job {
                            Ok(job) => worker.process(job, &handle).await,
                            Err(_) => break,
                        }
                    }
                }
                debug!(worker_id, "Notification worker stopped");
            });
        }

        // Poller: pending jobs persisted by collaborators outside this
        // process flow in through the same queue.
        {
            let worker = worker.clone();
            let tx = tx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                let mut tick = tokio::time::interval(worker.config.poll_interval());
                tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                tick.tick().await;
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tick.tick() => {
                            match worker.repo.list_pending(worker.config.poll_batch_size).await {
                                Ok(jobs) => {
                                    let count = jobs.len();
                                    for job in jobs {
                                        if tx.send_async(job).await.is_err() {
                                            return;
                                        }
                                    }
                                    if count > 0 {
                                        debug!(count, "Poller enqueued pending notifications");
                                    }
                                }
                                Err(e) => warn!(error = %e, "Failed to poll pending notifications"),
                            }
                        }
                    }
                }
                debug!("Notification poller stopped");
            });
        }

        info!(
            workers = worker.config.worker_count,
            queue = worker.config.queue_size,
            "Notification worker pool started"
        );
        handle
    }

    async fn process(&self, job: NotificationJob, handle: &NotificationWorkerHandle) {
        let now = Utc::now();

        let prefs = match self.get_preferences(job.user_id).await {
            Some(prefs) => prefs,
            None => {
                self.finish(&job, DeliveryOutcome::Failed).await;
                return;
            }
        };

        if !prefs.global_enabled {
            debug!(user = %job.user_id, "Notifications disabled, skipping");
            self.finish(&job, DeliveryOutcome::Skipped).await;
            return;
        }

        if prefs.in_quiet_hours(now)
            && job.priority != crate::notifications::NotificationPriority::Urgent
        {
            debug!(user = %job.user_id, "Quiet hours active, skipping");
            metrics::counter!("notify.quiet_hours_skipped_total").increment(1);
            self.finish(&job, DeliveryOutcome::Skipped).await;
            return;
        }

        let recipient = match self.users_repo.get(job.user_id).await {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(user = %job.user_id, "Notification recipient not found");
                self.finish(&job, DeliveryOutcome::Failed).await;
                return;
            }
            Err(e) => {
                error!(user = %job.user_id, error = %e, "Failed to load recipient");
                self.retry_or_fail(job, handle).await;
                return;
            }
        };

        let mut attempted = 0u32;
        let mut succeeded = 0u32;
        for channel in &job.channels {
            if !channel_enabled(*channel, &prefs) || !addressable(*channel, &recipient) {
                continue;
            }
            attempted += 1;
            let delivered = match channel {
                NotificationChannel::InApp => self.deliver_in_app(&job).await,
                channel => match self.dispatcher.dispatch(*channel, &recipient, &job).await {
                    Ok(()) => true,
                    Err(e) => {
                        warn!(
                            user = %job.user_id,
                            channel = ?channel,
                            error = %e,
                            "Channel dispatch failed"
                        );
                        false
                    }
                },
            };
            if delivered {
                succeeded += 1;
            }
        }

        if attempted == 0 {
            self.finish(&job, DeliveryOutcome::Skipped).await;
        } else if succeeded > 0 {
            metrics::counter!("notify.sent_total").increment(1);
            self.finish(&job, DeliveryOutcome::Sent).await;
        } else {
            self.retry_or_fail(job, handle).await;
        }
    }

    /// In-app delivery is a `notification` frame to the user's live
    /// connection; an offline user simply has nothing to deliver to.
    async fn deliver_in_app(&self, job: &NotificationJob) -> bool {
        if !self.hub.is_user_online(job.user_id).await {
            return false;
        }
        let frame = Frame::new(
            FrameType::Notification,
            serde_json::json!({
                "title": job.title,
                "body": job.body,
                "priority": job.priority,
                "data": job.data,
            }),
        );
        self.hub.send_to_user(job.user_id, frame).is_ok()
    }

    async fn get_preferences(&self, user_id: uuid::Uuid) -> Option<NotificationPreferences> {
        for attempt in 0..=self.config.retry_attempts {
            match tokio::time::timeout(REPO_CALL_TIMEOUT, self.repo.get_preferences(user_id)).await
            {
                Ok(Ok(prefs)) => return Some(prefs),
                Ok(Err(StoreError::Fatal(e))) => {
                    error!(user = %user_id, error = %e, "Fatal error loading preferences");
                    return None;
                }
                Ok(Err(StoreError::Transient(e))) if attempt < self.config.retry_attempts => {
                    warn!(user = %user_id, error = %e, attempt, "Retrying preference load");
                    tokio::time::sleep(self.config.retry_delay() * (attempt + 1)).await;
                }
                Ok(Err(e)) => {
                    error!(user = %user_id, error = %e, "Giving up on preference load");
                    return None;
                }
                Err(_) if attempt < self.config.retry_attempts => {
                    tokio::time::sleep(self.config.retry_delay() * (attempt + 1)).await;
                }
                Err(_) => {
                    error!(user = %user_id, "Timed out loading preferences");
                    return None;
                }
            }
        }
        None
    }

    async fn retry_or_fail(&self, mut job: NotificationJob, handle: &NotificationWorkerHandle) {
        if job.retry_count < self.config.retry_attempts {
            job.retry_count += 1;
            // Jitter keeps a burst of failures from retrying in lockstep.
            let jitter = std::time::Duration::from_millis(rand::rng().random_range(0..250));
            let delay = self.config.retry_delay() * job.retry_count + jitter;
            let handle = handle.clone();
            metrics::counter!("notify.retries_total").increment(1);
            debug!(job = %job.id, retry = job.retry_count, "Scheduling notification retry");
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Err(e) = handle.submit(job) {
                    warn!(error = %e, "Dropped notification retry");
                }
            });
        } else {
            metrics::counter!("notify.failed_total").increment(1);
            self.finish(&job, DeliveryOutcome::Failed).await;
        }
    }

    async fn finish(&self, job: &NotificationJob, outcome: DeliveryOutcome) {
        if let Err(e) = self.repo.mark_sent(job.id, outcome, Utc::now()).await {
            error!(job = %job.id, error = %e, "Failed to record notification outcome");
        }
    }
}

fn channel_enabled(channel: NotificationChannel, prefs: &NotificationPreferences) -> bool {
    match channel {
        NotificationChannel::Push => prefs.push_enabled,
        NotificationChannel::Sms => prefs.sms_enabled,
        NotificationChannel::Email => prefs.email_enabled,
        NotificationChannel::InApp => prefs.in_app_enabled,
    }
}

fn addressable(channel: NotificationChannel, user: &User) -> bool {
    match channel {
        NotificationChannel::Push => user.push_token.is_some(),
        NotificationChannel::Sms => user.phone.is_some(),
        NotificationChannel::Email => user.email.is_some(),
        // Liveness is checked at delivery time.
        NotificationChannel::InApp => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dispatcher::Dispatcher;
    use crate::notifications::NotificationPriority;
    use crate::notifications_repo::{MemoryNotificationsRepository, NotificationsRepository};
    use crate::users_repo::MemoryUsersRepository;
    use crate::users::QuietHours;
    use anyhow::Result;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use std::time::Duration;
    use uuid::Uuid;

    struct RecordingDispatcher {
        calls: Mutex<Vec<(NotificationChannel, Uuid)>>,
        fail: bool,
    }

    impl RecordingDispatcher {
        fn new(fail: bool) -> Arc<Self> {
            Arc::new(Self {
                calls: Mutex::new(Vec::new()),
                fail,
            })
        }

        fn calls(&self) -> Vec<(NotificationChannel, Uuid)> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Dispatcher for RecordingDispatcher {
        async fn dispatch(
            &self,
            channel: NotificationChannel,
            recipient: &User,
            _job: &NotificationJob,
        ) -> Result<()> {
            self.calls.lock().unwrap().push((channel, recipient.id));
            if self.fail {
                anyhow::bail!("gateway unavailable")
            }
            Ok(())
        }
    }

    struct Fixture {
        repo: Arc<MemoryNotificationsRepository>,
        users: Arc<MemoryUsersRepository>,
        dispatcher: Arc<RecordingDispatcher>,
        handle: NotificationWorkerHandle,
        cancel: CancellationToken,
    }

    fn fixture(fail_dispatch: bool, config: NotifyConfig) -> Fixture {
        let repo = Arc::new(MemoryNotificationsRepository::new());
        let users = Arc::new(MemoryUsersRepository::new());
        let dispatcher = RecordingDispatcher::new(fail_dispatch);
        let cancel = CancellationToken::new();
        let hub = crate::hub::Hub::spawn(users.clone(), cancel.clone());
        let worker = NotificationWorker::new(
            config,
            repo.clone(),
            users.clone(),
            dispatcher.clone(),
            hub,
        );
        let handle = worker.spawn(cancel.clone());
        Fixture {
            repo,
            users,
            dispatcher,
            handle,
            cancel,
        }
    }

    fn recipient(users: &MemoryUsersRepository) -> Uuid {
        let id = Uuid::new_v4();
        users.insert(User {
            id,
            email: Some("u@example.com".to_string()),
            phone: Some("+15550100".to_string()),
            first_name: "Test".to_string(),
            last_name: "User".to_string(),
            push_token: Some("token".to_string()),
            is_online: false,
            last_seen: None,
            created_at: Utc::now(),
        });
        id
    }

    async fn wait_for_outcome(
        repo: &MemoryNotificationsRepository,
        job_id: Uuid,
    ) -> DeliveryOutcome {
        for _ in 0..200 {
            if let Some(outcome) = repo.outcome_of(job_id) {
                return outcome;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("job {job_id} never reached a terminal outcome");
    }

    fn quiet_now(prefs: &mut NotificationPreferences) {
        // A window straddling the current time; wraps midnight when needed.
        let now = Utc::now();
        let start = (now - chrono::Duration::hours(2)).format("%H:%M").to_string();
        let end = (now + chrono::Duration::hours(2)).format("%H:%M").to_string();
        prefs.quiet_hours = QuietHours {
            enabled: true,
            start,
            end,
            days: [true; 7],
        };
    }

    #[tokio::test]
    async fn normal_priority_suppressed_in_quiet_hours() {
        let f = fixture(false, NotifyConfig::default());
        let user = recipient(&f.users);
        let mut prefs = NotificationPreferences::allow_all(user);
        quiet_now(&mut prefs);
        f.repo.set_preferences(prefs);

        let job = NotificationJob::new(user, "t", "b", NotificationPriority::Normal);
        let id = job.id;
        f.repo.enqueue(job.clone()).await.unwrap();
        f.handle.submit(job).unwrap();

        assert_eq!(wait_for_outcome(&f.repo, id).await, DeliveryOutcome::Skipped);
        assert!(f.dispatcher.calls().is_empty());
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn urgent_priority_bypasses_quiet_hours() {
        let f = fixture(false, NotifyConfig::default());
        let user = recipient(&f.users);
        let mut prefs = NotificationPreferences::allow_all(user);
        quiet_now(&mut prefs);
        f.repo.set_preferences(prefs);

        let job = NotificationJob::new(user, "t", "b", NotificationPriority::Urgent);
        let id = job.id;
        f.repo.enqueue(job.clone()).await.unwrap();
        f.handle.submit(job).unwrap();

        assert_eq!(wait_for_outcome(&f.repo, id).await, DeliveryOutcome::Sent);
        assert!(!f.dispatcher.calls().is_empty());
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn global_kill_switch_skips() {
        let f = fixture(false, NotifyConfig::default());
        let user = recipient(&f.users);
        let mut prefs = NotificationPreferences::allow_all(user);
        prefs.global_enabled = false;
        f.repo.set_preferences(prefs);

        let job = NotificationJob::new(user, "t", "b", NotificationPriority::Urgent);
        let id = job.id;
        f.repo.enqueue(job.clone()).await.unwrap();
        f.handle.submit(job).unwrap();

        assert_eq!(wait_for_outcome(&f.repo, id).await, DeliveryOutcome::Skipped);
        assert!(f.dispatcher.calls().is_empty());
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn total_failure_exhausts_retry_budget_then_fails() {
        let mut config = NotifyConfig::default();
        config.retry_attempts = 2;
        config.retry_delay_secs = 0;
        let f = fixture(true, config);
        let user = recipient(&f.users);

        let job = NotificationJob::new(user, "t", "b", NotificationPriority::High)
            .with_channels(vec![NotificationChannel::Push]);
        let id = job.id;
        f.repo.enqueue(job.clone()).await.unwrap();
        f.handle.submit(job).unwrap();

        assert_eq!(wait_for_outcome(&f.repo, id).await, DeliveryOutcome::Failed);
        // Initial attempt plus two retries.
        assert_eq!(f.dispatcher.calls().len(), 3);
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn channels_without_address_are_not_attempted() {
        let f = fixture(false, NotifyConfig::default());
        let user = Uuid::new_v4();
        f.users.insert(User {
            id: user,
            email: None,
            phone: None,
            first_name: "No".to_string(),
            last_name: "Address".to_string(),
            push_token: Some("tok".to_string()),
            is_online: false,
            last_seen: None,
            created_at: Utc::now(),
        });

        let job = NotificationJob::new(user, "t", "b", NotificationPriority::Normal)
            .with_channels(vec![NotificationChannel::Push, NotificationChannel::Email]);
        let id = job.id;
        f.repo.enqueue(job.clone()).await.unwrap();
        f.handle.submit(job).unwrap();

        assert_eq!(wait_for_outcome(&f.repo, id).await, DeliveryOutcome::Sent);
        let calls = f.dispatcher.calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, NotificationChannel::Push);
        f.cancel.cancel();
    }

    #[tokio::test]
    async fn poller_picks_up_persisted_jobs() {
        let mut config = NotifyConfig::default();
        config.poll_interval_secs = 1;
        let f = fixture(false, config);
        let user = recipient(&f.users);

        let job = NotificationJob::new(user, "t", "b", NotificationPriority::Normal);
        let id = job.id;
        // Persisted only, never submitted directly.
        f.repo.enqueue(job).await.unwrap();

        assert_eq!(wait_for_outcome(&f.repo, id).await, DeliveryOutcome::Sent);
        f.cancel.cancel();
    }
}
