//! User model, notification preferences, and the quiet-hours schedule.

use chrono::{DateTime, Datelike, FixedOffset, NaiveTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct User {
    pub id: Uuid,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub first_name: String,
    pub last_name: String,
    /// Device push token, present once the app has registered one.
    pub push_token: Option<String>,
    pub is_online: bool,
    pub last_seen: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn display_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }
}

/// Weekly quiet-hours window in the user's local time.
///
/// `start`/`end` are `HH:MM`; a window whose start is later than its end
/// wraps midnight (22:00-06:00 covers late evening through early morning).
/// `days` is Monday-first and gates the day the window *starts* on.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuietHours {
    pub enabled: bool,
    pub start: String,
    pub end: String,
    #[serde(default = "all_days")]
    pub days: [bool; 7],
}

fn all_days() -> [bool; 7] {
    [true; 7]
}

impl Default for QuietHours {
    fn default() -> Self {
        Self {
            enabled: false,
            start: "22:00".to_string(),
            end: "07:00".to_string(),
            days: all_days(),
        }
    }
}

impl QuietHours {
    fn parse_hhmm(s: &str) -> Option<NaiveTime> {
        NaiveTime::parse_from_str(s, "%H:%M").ok()
    }

    /// Whether `local_now` falls inside the configured window.
    ///
    /// For an overnight window, the early-morning tail belongs to the day
    /// the window started on.
    pub fn is_active(&self, local_now: chrono::DateTime<FixedOffset>) -> bool {
        if !self.enabled {
            return false;
        }
        let (Some(start), Some(end)) = (Self::parse_hhmm(&self.start), Self::parse_hhmm(&self.end))
        else {
            return false;
        };

        let now = local_now.time();
        let today = local_now.weekday().num_days_from_monday() as usize;

        if start <= end {
            self.days[today] && now >= start && now < end
        } else {
            // Overnight wrap: the post-start leg is gated on today, the
            // pre-end leg on the day the window started (yesterday).
            let yesterday = (today + 6) % 7;
            (self.days[today] && now >= start) || (self.days[yesterday] && now < end)
        }
    }
}

/// How a user wants to be reached, resolved per notification job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NotificationPreferences {
    pub user_id: Uuid,
    /// Global kill-switch; when false every non-delivery is recorded as
    /// skipped.
    pub global_enabled: bool,
    pub push_enabled: bool,
    pub sms_enabled: bool,
    pub email_enabled: bool,
    pub in_app_enabled: bool,
    #[serde(default)]
    pub quiet_hours: QuietHours,
    /// Minutes east of UTC for the user's home timezone; quiet hours are
    /// evaluated in this offset.
    pub utc_offset_minutes: i32,
}

impl NotificationPreferences {
    pub fn allow_all(user_id: Uuid) -> Self {
        Self {
            user_id,
            global_enabled: true,
            push_enabled: true,
            sms_enabled: true,
            email_enabled: true,
            in_app_enabled: true,
            quiet_hours: QuietHours::default(),
            utc_offset_minutes: 0,
        }
    }

    /// The user's current local time.
    pub fn local_now(&self, now: DateTime<Utc>) -> chrono::DateTime<FixedOffset> {
        let offset = FixedOffset::east_opt(self.utc_offset_minutes * 60)
            .unwrap_or_else(|| FixedOffset::east_opt(0).expect("zero offset"));
        now.with_timezone(&offset)
    }

    /// Whether quiet hours suppress delivery at `now` (UTC).
    pub fn in_quiet_hours(&self, now: DateTime<Utc>) -> bool {
        self.quiet_hours.is_active(self.local_now(now))
    }
}
