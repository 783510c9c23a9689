//! Places and visits repository contract.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::places::{Place, PlaceStats};
use crate::visits::{Visit, VisitUpdate};

/// Stats mutation applied when a user enters a place.
#[derive(Debug, Clone)]
pub struct PlaceStatsUpdate {
    pub entry_at: DateTime<Utc>,
}

#[async_trait]
pub trait PlacesRepository: Send + Sync {
    /// Active places the geofence engine must evaluate for a user: the
    /// user's own plus those shared with circles the user belongs to.
    async fn list_active_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Place>>;

    /// Create an ongoing visit. Implementations enforce the at-most-one
    /// ongoing visit per (user, place) invariant: if one already exists it
    /// is returned unchanged.
    async fn create_visit(&self, visit: Visit) -> StoreResult<Visit>;

    async fn find_ongoing_visit(&self, user_id: Uuid, place_id: Uuid)
    -> StoreResult<Option<Visit>>;

    /// Apply a close (or other) update; returns false when the visit is
    /// unknown.
    async fn update_visit(&self, visit_id: Uuid, update: VisitUpdate) -> StoreResult<bool>;

    /// Fold an entry into the place's rolling stats.
    async fn update_stats(&self, place_id: Uuid, update: PlaceStatsUpdate) -> StoreResult<()>;
}

pub type DynPlacesRepo = Arc<dyn PlacesRepository>;

/// In-memory places, visits, and stats.
#[derive(Default)]
pub struct MemoryPlacesRepository {
    places: DashMap<Uuid, Place>,
    visits: DashMap<Uuid, Visit>,
    stats: DashMap<Uuid, PlaceStats>,
    /// userId -> circleIds, used to resolve shared places.
    memberships: DashMap<Uuid, Vec<Uuid>>,
}

impl MemoryPlacesRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_place(&self, place: Place) {
        self.places.insert(place.id, place);
    }

    pub fn set_memberships(&self, user_id: Uuid, circle_ids: Vec<Uuid>) {
        self.memberships.insert(user_id, circle_ids);
    }

    pub fn visits_for(&self, user_id: Uuid, place_id: Uuid) -> Vec<Visit> {
        self.visits
            .iter()
            .filter(|v| v.user_id == user_id && v.place_id == place_id)
            .map(|v| v.clone())
            .collect()
    }

    pub fn stats_for(&self, place_id: Uuid) -> PlaceStats {
        self.stats
            .get(&place_id)
            .map(|s| s.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl PlacesRepository for MemoryPlacesRepository {
    async fn list_active_for_user(&self, user_id: Uuid) -> StoreResult<Vec<Place>> {
        let circles = self
            .memberships
            .get(&user_id)
            .map(|c| c.clone())
            .unwrap_or_default();
        Ok(self
            .places
            .iter()
            .filter(|p| p.active)
            .filter(|p| {
                p.owner_user_id == user_id
                    || p.circle_id.is_some_and(|c| circles.contains(&c))
            })
            .map(|p| p.clone())
            .collect())
    }

    async fn create_visit(&self, visit: Visit) -> StoreResult<Visit> {
        if let Some(existing) = self
            .find_ongoing_visit(visit.user_id, visit.place_id)
            .await?
        {
            return Ok(existing);
        }
        self.visits.insert(visit.id, visit.clone());
        Ok(visit)
    }

    async fn find_ongoing_visit(
        &self,
        user_id: Uuid,
        place_id: Uuid,
    ) -> StoreResult<Option<Visit>> {
        Ok(self
            .visits
            .iter()
            .find(|v| v.user_id == user_id && v.place_id == place_id && v.ongoing)
            .map(|v| v.clone()))
    }

    async fn update_visit(&self, visit_id: Uuid, update: VisitUpdate) -> StoreResult<bool> {
        match self.visits.get_mut(&visit_id) {
            Some(mut visit) => {
                visit.departure = Some(update.departure);
                visit.duration_seconds = Some(update.duration_seconds);
                visit.ongoing = update.ongoing;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn update_stats(&self, place_id: Uuid, update: PlaceStatsUpdate) -> StoreResult<()> {
        self.stats
            .entry(place_id)
            .or_default()
            .record_entry(update.entry_at);
        Ok(())
    }
}
