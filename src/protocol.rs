//! Websocket wire protocol: one UTF-8 JSON object per text message.
//!
//! Server-to-client frames carry `type`, `data`, `timestamp`, and echo the
//! client's `requestId` when replying to a request. Frames larger than the
//! configured limit (4 KiB by default) are rejected before parsing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use uuid::Uuid;

use crate::emergency::EmergencyKind;
use crate::locations::{LocationSample, LocationSource, MovementKind};

/// Frame `type` discriminator, bit-exact on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameType {
    Auth,
    Ping,
    Pong,
    Success,
    Error,
    LocationUpdate,
    LocationUpdateRequest,
    SendMessageRequest,
    NewMessage,
    EmergencyAlertRequest,
    TypingStartRequest,
    TypingStopRequest,
    TypingIndicator,
    PlaceEvent,
    EmergencyAlert,
    UserStatus,
    ConnectionStatus,
    Notification,
}

/// Error codes surfaced to clients inside error-frame `data`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    InvalidMessage,
    Unauthorized,
    RateLimit,
    CircleNotFound,
    UserNotFound,
    InvalidLocation,
    ConnectionLost,
}

/// A single websocket frame in either direction.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    #[serde(rename = "type")]
    pub kind: FrameType,
    #[serde(default)]
    pub data: serde_json::Value,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "requestId", skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
}

impl Frame {
    pub fn new(kind: FrameType, data: serde_json::Value) -> Self {
        Self {
            kind,
            data,
            timestamp: Utc::now(),
            request_id: None,
        }
    }

    pub fn replying_to(mut self, request_id: Option<String>) -> Self {
        self.request_id = request_id;
        self
    }

    pub fn success(request_id: Option<String>) -> Self {
        Frame::new(FrameType::Success, json!({})).replying_to(request_id)
    }

    pub fn error(code: ErrorCode, message: impl Into<String>, request_id: Option<String>) -> Self {
        let now = Utc::now();
        Frame {
            kind: FrameType::Error,
            data: json!({
                "code": code,
                "message": message.into(),
                "timestamp": now,
            }),
            timestamp: now,
            request_id,
        }
    }

    pub fn pong(request_id: Option<String>) -> Self {
        Frame::new(FrameType::Pong, json!({})).replying_to(request_id)
    }

    pub fn connection_status(connection_id: Uuid, status: &str) -> Self {
        Frame::new(
            FrameType::ConnectionStatus,
            json!({ "connectionId": connection_id, "status": status }),
        )
    }

    pub fn user_status(user_id: Uuid, online: bool) -> Self {
        Frame::new(
            FrameType::UserStatus,
            json!({ "userId": user_id, "online": online }),
        )
    }

    pub fn location_update(sample: &LocationSample) -> Self {
        Frame::new(
            FrameType::LocationUpdate,
            serde_json::to_value(sample).unwrap_or(serde_json::Value::Null),
        )
    }

    /// Serialize for the socket. Serialization of these types cannot fail;
    /// the expect documents that assumption.
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).expect("frame serialization is infallible")
    }
}

/// `auth` request payload.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthRequest {
    pub token: String,
}

/// `location_update_request` payload: the device-side fields of a sample.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationUpdateRequest {
    pub latitude: f64,
    pub longitude: f64,
    pub accuracy: Option<f64>,
    pub speed: Option<f64>,
    pub bearing: Option<f64>,
    pub battery_level: Option<f64>,
    #[serde(default)]
    pub is_driving: bool,
    #[serde(default)]
    pub is_moving: bool,
    #[serde(default)]
    pub is_charging: bool,
    #[serde(default)]
    pub movement_kind: MovementKind,
    #[serde(default)]
    pub source: LocationSource,
    pub device_time: Option<DateTime<Utc>>,
    pub timezone: Option<String>,
}

impl LocationUpdateRequest {
    /// Stamp the request into a full sample at ingress; `server_time` is
    /// assigned here and nowhere else.
    pub fn into_sample(self, user_id: Uuid) -> LocationSample {
        LocationSample {
            user_id,
            latitude: self.latitude,
            longitude: self.longitude,
            accuracy: self.accuracy,
            speed: self.speed,
            bearing: self.bearing,
            battery_level: self.battery_level,
            is_driving: self.is_driving,
            is_moving: self.is_moving,
            is_charging: self.is_charging,
            movement_kind: self.movement_kind,
            source: self.source,
            device_time: self.device_time,
            server_time: Utc::now(),
            timezone: self.timezone,
        }
    }
}

/// Message kinds accepted from `send_message_request`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Text,
    Image,
    Video,
    Audio,
    Location,
    File,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SendMessageRequest {
    pub circle_id: Uuid,
    pub kind: MessageKind,
    pub content: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EmergencyAlertRequest {
    pub kind: EmergencyKind,
    pub latitude: f64,
    pub longitude: f64,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingRequest {
    pub circle_id: Uuid,
}
