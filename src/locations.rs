//! Location sample model and ingress validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo;

/// How the device classified its own motion when the sample was taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MovementKind {
    #[default]
    Stationary,
    Walking,
    Driving,
    Cycling,
    Running,
}

/// Where the coordinate came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LocationSource {
    #[default]
    Gps,
    Network,
    Passive,
    Manual,
}

/// One location sample from a user's device.
///
/// `server_time` is assigned at ingress and is the timestamp every
/// downstream consumer (geofencing, visits, retention) keys on;
/// `device_time` is whatever the phone claimed.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocationSample {
    pub user_id: Uuid,
    pub latitude: f64,
    pub longitude: f64,
    /// Horizontal accuracy in meters.
    pub accuracy: Option<f64>,
    /// Ground speed in m/s.
    pub speed: Option<f64>,
    /// Bearing in degrees, 0-360.
    pub bearing: Option<f64>,
    /// Battery level, 0-100.
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
    pub server_time: DateTime<Utc>,
    pub timezone: Option<String>,
}

impl LocationSample {
    /// Validate the coordinate and the bounded auxiliary fields.
    ///
    /// Returns the reason that failed, suitable for an
    /// `INVALID_LOCATION` error frame.
    pub fn validate(&self) -> Result<(), &'static str> {
        if !geo::valid_coord(self.latitude, self.longitude) {
            return Err("coordinates out of range");
        }
        if let Some(acc) = self.accuracy
            && !(acc.is_finite() && acc >= 0.0)
        {
            return Err("accuracy must be non-negative");
        }
        if let Some(speed) = self.speed
            && !(speed.is_finite() && speed >= 0.0)
        {
            return Err("speed must be non-negative");
        }
        if let Some(bearing) = self.bearing
            && !(bearing.is_finite() && (0.0..=360.0).contains(&bearing))
        {
            return Err("bearing must be within 0-360");
        }
        if let Some(battery) = self.battery_level
            && !(battery.is_finite() && (0.0..=100.0).contains(&battery))
        {
            return Err("battery level must be within 0-100");
        }
        Ok(())
    }

    /// Fast movement (driving flag or >= 20 m/s) bumps the advisory queue
    /// priority so a future scheduler can prefer these jobs.
    pub fn advisory_priority(&self) -> u8 {
        if self.is_driving || self.speed.is_some_and(|s| s >= 20.0) {
            3
        } else {
            1
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn sample(lat: f64, lon: f64) -> LocationSample {
        LocationSample {
            user_id: Uuid::new_v4(),
            latitude: lat,
            longitude: lon,
            accuracy: Some(12.0),
            speed: Some(1.2),
            bearing: Some(90.0),
            battery_level: Some(80.0),
            is_driving: false,
            is_moving: true,
            is_charging: false,
            movement_kind: MovementKind::Walking,
            source: LocationSource::Gps,
            device_time: Some(Utc::now()),
            server_time: Utc::now(),
            timezone: Some("America/Los_Angeles".to_string()),
        }
    }

    #[test]
    fn valid_sample_passes() {
        assert!(sample(37.77, -122.41).validate().is_ok());
    }

    #[test]
    fn out_of_range_coordinates_rejected() {
        assert!(sample(91.0, 0.0).validate().is_err());
        assert!(sample(0.0, 181.0).validate().is_err());
        assert!(sample(f64::NAN, 0.0).validate().is_err());
    }

    #[test]
    fn bounded_fields_rejected() {
        let mut s = sample(0.0, 0.0);
        s.bearing = Some(361.0);
        assert!(s.validate().is_err());
        let mut s = sample(0.0, 0.0);
        s.battery_level = Some(-1.0);
        assert!(s.validate().is_err());
        let mut s = sample(0.0, 0.0);
        s.speed = Some(-0.1);
        assert!(s.validate().is_err());
    }

    #[test]
    fn driving_bumps_priority() {
        let mut s = sample(0.0, 0.0);
        assert_eq!(s.advisory_priority(), 1);
        s.is_driving = true;
        assert_eq!(s.advisory_priority(), 3);
        s.is_driving = false;
        s.speed = Some(30.0);
        assert_eq!(s.advisory_priority(), 3);
    }

    #[test]
    fn wire_field_names_are_camel_case() {
        let json = serde_json::to_value(sample(1.0, 2.0)).unwrap();
        assert!(json.get("userId").is_some());
        assert!(json.get("batteryLevel").is_some());
        assert!(json.get("movementKind").is_some());
        assert!(json.get("serverTime").is_some());
    }
}
