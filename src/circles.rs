//! Circle models: the sharing group behind every room.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Active,
    Pending,
    Invited,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircleMember {
    pub user_id: Uuid,
    pub status: MemberStatus,
    pub joined_at: DateTime<Utc>,
}

/// Per-circle feature toggles. Each gate controls one fan-out path.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CircleSettings {
    pub location_sharing: bool,
    pub place_notifications: bool,
    pub emergency_alerts: bool,
    pub messaging: bool,
}

impl Default for CircleSettings {
    fn default() -> Self {
        Self {
            location_sharing: true,
            place_notifications: true,
            emergency_alerts: true,
            messaging: true,
        }
    }
}

/// A group of users sharing locations, places, messages, and alerts.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Circle {
    pub id: Uuid,
    pub name: String,
    pub admin_user_id: Uuid,
    pub members: Vec<CircleMember>,
    #[serde(default)]
    pub settings: CircleSettings,
    pub created_at: DateTime<Utc>,
}

impl Circle {
    /// Member ids with `Active` status; the broadcast-eligible set.
    pub fn active_member_ids(&self) -> Vec<Uuid> {
        self.members
            .iter()
            .filter(|m| m.status == MemberStatus::Active)
            .map(|m| m.user_id)
            .collect()
    }

    pub fn has_active_member(&self, user_id: Uuid) -> bool {
        self.members
            .iter()
            .any(|m| m.user_id == user_id && m.status == MemberStatus::Active)
    }
}
