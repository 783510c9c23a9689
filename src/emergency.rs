//! Emergency alerts: model plus the fan-out path. The core treats these
//! purely as a broadcast trigger with elevated priority; lifecycle
//! management (resolve, dismiss, escalation timers) lives elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::circles_repo::DynCirclesRepo;
use crate::error::FrameError;
use crate::geo;
use crate::hub::HubHandle;
use crate::notification_worker::NotificationWorkerHandle;
use crate::notifications::{NotificationJob, NotificationPriority};
use crate::protocol::{EmergencyAlertRequest, Frame, FrameType};
use crate::room::BroadcastFilter;
use crate::users_repo::DynUsersRepo;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyKind {
    Sos,
    CrashDetected,
    Medical,
    Custom,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EmergencyStatus {
    Active,
    Resolved,
    FalseAlarm,
    Cancelled,
    Dismissed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub kind: EmergencyKind,
    pub status: EmergencyStatus,
    pub latitude: f64,
    pub longitude: f64,
    pub message: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl EmergencyEvent {
    pub fn new(
        user_id: Uuid,
        kind: EmergencyKind,
        latitude: f64,
        longitude: f64,
        message: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            kind,
            status: EmergencyStatus::Active,
            latitude,
            longitude,
            message,
            created_at: Utc::now(),
        }
    }
}

/// Fan-out collaborator for `emergency_alert_request` frames: broadcast to
/// every circle room with emergency alerts enabled and page every active
/// member at urgent priority, which bypasses quiet hours.
pub struct EmergencyAlerts {
    hub: HubHandle,
    circles_repo: DynCirclesRepo,
    users_repo: DynUsersRepo,
    notifications: NotificationWorkerHandle,
}

impl EmergencyAlerts {
    pub fn new(
        hub: HubHandle,
        circles_repo: DynCirclesRepo,
        users_repo: DynUsersRepo,
        notifications: NotificationWorkerHandle,
    ) -> Self {
        Self {
            hub,
            circles_repo,
            users_repo,
            notifications,
        }
    }

    pub async fn raise(
        &self,
        user_id: Uuid,
        req: EmergencyAlertRequest,
    ) -> Result<EmergencyEvent, FrameError> {
        if !geo::valid_coord(req.latitude, req.longitude) {
            return Err(FrameError::InvalidLocation(
                "coordinates out of range".to_string(),
            ));
        }

        let event =
            EmergencyEvent::new(user_id, req.kind, req.latitude, req.longitude, req.message);

        let circles = match self.circles_repo.list_for_user(user_id).await {
            Ok(circles) => circles,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Failed to list circles for emergency");
                Vec::new()
            }
        };

        let sender_name = match self.users_repo.get(user_id).await {
            Ok(Some(user)) => user.display_name(),
            _ => "A circle member".to_string(),
        };

        let frame = Frame::new(
            FrameType::EmergencyAlert,
            json!({
                "eventId": event.id,
                "userId": user_id,
                "userName": sender_name,
                "kind": event.kind,
                "latitude": event.latitude,
                "longitude": event.longitude,
                "message": event.message,
                "createdAt": event.created_at,
            }),
        );

        let mut recipients: Vec<Uuid> = Vec::new();
        for circle in &circles {
            if !circle.settings.emergency_alerts {
                continue;
            }
            if let Err(e) = self.hub.broadcast_to_room(
                circle.id,
                frame.clone(),
                BroadcastFilter::excluding(user_id),
            ) {
                debug!(circle = %circle.id, error = %e, "Emergency broadcast dropped");
            }
            for member in circle.active_member_ids() {
                if member != user_id && !recipients.contains(&member) {
                    recipients.push(member);
                }
            }
        }

        let title = format!("Emergency: {}", sender_name);
        let body = match &event.message {
            Some(message) => format!("{} needs help: {}", sender_name, message),
            None => format!("{} triggered an emergency alert.", sender_name),
        };
        for recipient in recipients {
            let job = NotificationJob::new(
                recipient,
                title.clone(),
                body.clone(),
                NotificationPriority::Urgent,
            )
            .with_data(json!({
                "eventId": event.id,
                "userId": user_id,
                "kind": event.kind,
                "latitude": event.latitude,
                "longitude": event.longitude,
            }));
            if let Err(e) = self.notifications.submit(job) {
                warn!(recipient = %recipient, error = %e, "Dropped emergency notification");
            }
        }

        metrics::counter!("emergency.alerts_total").increment(1);
        Ok(event)
    }
}
