//! Place models: named geographic discs with notification policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::geo;

/// Minimum allowed place radius in meters.
pub const MIN_RADIUS_M: f64 = 10.0;
/// Maximum allowed place radius in meters.
pub const MAX_RADIUS_M: f64 = 5_000.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceCategory {
    Home,
    Work,
    School,
    Gym,
    Store,
    Other,
}

impl Default for PlaceCategory {
    fn default() -> Self {
        PlaceCategory::Other
    }
}

/// Per-place notification policy.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct PlaceNotifyPolicy {
    #[serde(default)]
    pub on_arrival: bool,
    #[serde(default)]
    pub on_departure: bool,
    #[serde(default)]
    pub on_long_stay: bool,
    /// Minutes of continuous presence before a long-stay fires.
    #[serde(default)]
    pub long_stay_minutes: Option<u32>,
    /// Extra user ids notified in addition to the place's circle members.
    #[serde(default)]
    pub notify_members: Vec<Uuid>,
}

/// A named geographic disc owned by a user, optionally shared with a circle.
///
/// Only `active` places are considered for geofencing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Place {
    pub id: Uuid,
    pub owner_user_id: Uuid,
    pub circle_id: Option<Uuid>,
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Radius in meters, clamped to 10..=5000.
    pub radius_m: f64,
    #[serde(default)]
    pub category: PlaceCategory,
    #[serde(default)]
    pub notify: PlaceNotifyPolicy,
    pub active: bool,
    pub created_at: DateTime<Utc>,
}

impl Place {
    /// Whether a coordinate lies inside this place's boundary.
    pub fn contains(&self, lat: f64, lon: f64) -> bool {
        geo::haversine_distance_m(lat, lon, self.latitude, self.longitude) <= self.radius_m
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("name is required".to_string());
        }
        if !geo::valid_coord(self.latitude, self.longitude) {
            return Err("center coordinates out of range".to_string());
        }
        if !(MIN_RADIUS_M..=MAX_RADIUS_M).contains(&self.radius_m) {
            return Err(format!(
                "radius must be between {MIN_RADIUS_M} and {MAX_RADIUS_M} meters"
            ));
        }
        Ok(())
    }
}

/// Rolling per-place visit statistics, updated on entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaceStats {
    pub visit_count: u64,
    pub last_visit: Option<DateTime<Utc>>,
    /// Visit tallies per weekday, Monday-first.
    pub visits_by_weekday: [u64; 7],
    /// Visit tallies per arrival hour bucket, 0-23.
    pub arrivals_by_hour: [u64; 24],
}

impl PlaceStats {
    /// Fold one arrival into the rolling stats.
    pub fn record_entry(&mut self, at: DateTime<Utc>) {
        use chrono::{Datelike, Timelike};
        self.visit_count += 1;
        self.last_visit = Some(at);
        self.visits_by_weekday[at.weekday().num_days_from_monday() as usize] += 1;
        self.arrivals_by_hour[at.hour() as usize] += 1;
    }

    /// The weekday with the most recorded visits, Monday-first index.
    pub fn most_visited_day(&self) -> Option<usize> {
        let max = *self.visits_by_weekday.iter().max()?;
        if max == 0 {
            return None;
        }
        self.visits_by_weekday.iter().position(|&v| v == max)
    }

    /// The modal arrival hour bucket.
    pub fn usual_arrival_hour(&self) -> Option<u32> {
        let max = *self.arrivals_by_hour.iter().max()?;
        if max == 0 {
            return None;
        }
        self.arrivals_by_hour
            .iter()
            .position(|&v| v == max)
            .map(|h| h as u32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn place(radius_m: f64) -> Place {
        Place {
            id: Uuid::new_v4(),
            owner_user_id: Uuid::new_v4(),
            circle_id: None,
            name: "Home".to_string(),
            latitude: 37.7749,
            longitude: -122.4194,
            radius_m,
            category: PlaceCategory::Home,
            notify: PlaceNotifyPolicy::default(),
            active: true,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn contains_uses_radius() {
        let p = place(100.0);
        assert!(p.contains(37.77495, -122.41945));
        assert!(!p.contains(37.7760, -122.4200));
    }

    #[test]
    fn radius_bounds_enforced() {
        assert!(place(100.0).validate().is_ok());
        assert!(place(9.9).validate().is_err());
        assert!(place(5_001.0).validate().is_err());
    }

    #[test]
    fn stats_track_modal_buckets() {
        let mut stats = PlaceStats::default();
        // Two Monday-morning arrivals, one Tuesday afternoon
        let monday_9 = Utc.with_ymd_and_hms(2025, 6, 2, 9, 15, 0).unwrap();
        let monday_9b = Utc.with_ymd_and_hms(2025, 6, 9, 9, 45, 0).unwrap();
        let tuesday_15 = Utc.with_ymd_and_hms(2025, 6, 3, 15, 0, 0).unwrap();
        stats.record_entry(monday_9);
        stats.record_entry(monday_9b);
        stats.record_entry(tuesday_15);

        assert_eq!(stats.visit_count, 3);
        assert_eq!(stats.last_visit, Some(tuesday_15));
        assert_eq!(stats.most_visited_day(), Some(0));
        assert_eq!(stats.usual_arrival_hour(), Some(9));
    }

    #[test]
    fn empty_stats_have_no_modal_buckets() {
        let stats = PlaceStats::default();
        assert_eq!(stats.most_visited_day(), None);
        assert_eq!(stats.usual_arrival_hour(), None);
    }
}
