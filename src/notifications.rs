//! Notification job model: what gets handed to the NotificationWorker.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationPriority {
    Low,
    Normal,
    High,
    /// Urgent bypasses quiet hours.
    Urgent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NotificationChannel {
    Push,
    Sms,
    Email,
    InApp,
}

impl NotificationChannel {
    pub const ALL: [NotificationChannel; 4] = [
        NotificationChannel::Push,
        NotificationChannel::Sms,
        NotificationChannel::Email,
        NotificationChannel::InApp,
    ];
}

/// Terminal state recorded against a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryOutcome {
    /// At least one channel succeeded.
    Sent,
    /// Suppressed by preferences or quiet hours; never retried.
    Skipped,
    /// Every channel failed and the retry budget is exhausted.
    Failed,
}

/// A single pending delivery to one recipient.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationJob {
    pub id: Uuid,
    pub user_id: Uuid,
    pub title: String,
    pub body: String,
    /// Free-form payload forwarded to the client (place id, event type, ...).
    #[serde(default)]
    pub data: serde_json::Value,
    pub priority: NotificationPriority,
    /// Channels this job may use; intersected with the recipient's
    /// preferences at dispatch time.
    pub channels: Vec<NotificationChannel>,
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NotificationJob {
    pub fn new(
        user_id: Uuid,
        title: impl Into<String>,
        body: impl Into<String>,
        priority: NotificationPriority,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            title: title.into(),
            body: body.into(),
            data: serde_json::Value::Null,
            priority,
            channels: NotificationChannel::ALL.to_vec(),
            retry_count: 0,
            created_at: Utc::now(),
            expires_at: None,
        }
    }

    pub fn with_data(mut self, data: serde_json::Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_channels(mut self, channels: Vec<NotificationChannel>) -> Self {
        self.channels = channels;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_ordering_puts_urgent_on_top() {
        assert!(NotificationPriority::Urgent > NotificationPriority::High);
        assert!(NotificationPriority::High > NotificationPriority::Normal);
        assert!(NotificationPriority::Normal > NotificationPriority::Low);
    }

    #[test]
    fn new_job_targets_all_channels() {
        let job = NotificationJob::new(
            Uuid::new_v4(),
            "Arrived",
            "Ana arrived at Home",
            NotificationPriority::Normal,
        );
        assert_eq!(job.channels.len(), 4);
        assert_eq!(job.retry_count, 0);
    }
}
