//! Visit model: the interval a user spends continuously inside a place.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A stay at a place. At most one ongoing visit exists per (user, place);
/// the repository enforces that and `close` derives the duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Visit {
    pub id: Uuid,
    pub user_id: Uuid,
    pub place_id: Uuid,
    pub arrival: DateTime<Utc>,
    pub departure: Option<DateTime<Utc>>,
    pub duration_seconds: Option<i64>,
    pub ongoing: bool,
}

impl Visit {
    pub fn begin(user_id: Uuid, place_id: Uuid, arrival: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::now_v7(),
            user_id,
            place_id,
            arrival,
            departure: None,
            duration_seconds: None,
            ongoing: true,
        }
    }

    /// Close the visit at `departure`, deriving the duration.
    pub fn close(&mut self, departure: DateTime<Utc>) {
        self.departure = Some(departure);
        self.duration_seconds = Some((departure - self.arrival).num_seconds());
        self.ongoing = false;
    }
}

/// Mutation applied by the repository when a visit closes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VisitUpdate {
    pub departure: DateTime<Utc>,
    pub duration_seconds: i64,
    pub ongoing: bool,
}

impl VisitUpdate {
    pub fn closing(arrival: DateTime<Utc>, departure: DateTime<Utc>) -> Self {
        Self {
            departure,
            duration_seconds: (departure - arrival).num_seconds(),
            ongoing: false,
        }
    }
}
