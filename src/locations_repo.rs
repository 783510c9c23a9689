//! Location history repository contract.
//!
//! Production deployments back this with a document store indexed on
//! `(userId, timestamp desc)` plus a 2dsphere index and a TTL on
//! `timestamp`; the in-memory implementation here backs the dev server and
//! the test suite.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

use crate::error::StoreResult;
use crate::locations::LocationSample;

#[async_trait]
pub trait LocationsRepository: Send + Sync {
    /// Append one sample to the user's history.
    async fn append(&self, sample: &LocationSample) -> StoreResult<()>;

    /// The most recent sample for a user, by server time.
    async fn get_last(&self, user_id: Uuid) -> StoreResult<Option<LocationSample>>;

    /// Retention sweep: delete samples older than `cutoff`, returning the
    /// number removed.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64>;
}

pub type DynLocationsRepo = Arc<dyn LocationsRepository>;

/// In-memory history keyed by user, append-ordered.
#[derive(Default)]
pub struct MemoryLocationsRepository {
    samples: DashMap<Uuid, Vec<LocationSample>>,
}

impl MemoryLocationsRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn count_for(&self, user_id: Uuid) -> usize {
        self.samples.get(&user_id).map_or(0, |v| v.len())
    }
}

#[async_trait]
impl LocationsRepository for MemoryLocationsRepository {
    async fn append(&self, sample: &LocationSample) -> StoreResult<()> {
        self.samples
            .entry(sample.user_id)
            .or_default()
            .push(sample.clone());
        Ok(())
    }

    async fn get_last(&self, user_id: Uuid) -> StoreResult<Option<LocationSample>> {
        Ok(self.samples.get(&user_id).and_then(|v| {
            v.iter()
                .max_by_key(|s| s.server_time)
                .cloned()
        }))
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<u64> {
        let mut removed = 0u64;
        for mut entry in self.samples.iter_mut() {
            let before = entry.len();
            entry.retain(|s| s.server_time >= cutoff);
            removed += (before - entry.len()) as u64;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::locations::{LocationSource, MovementKind};
    use chrono::Duration;

    fn sample_at(user_id: Uuid, server_time: DateTime<Utc>) -> LocationSample {
        LocationSample {
            user_id,
            latitude: 37.0,
            longitude: -122.0,
            accuracy: None,
            speed: None,
            bearing: None,
            battery_level: None,
            is_driving: false,
            is_moving: false,
            is_charging: false,
            movement_kind: MovementKind::Stationary,
            source: LocationSource::Gps,
            device_time: None,
            server_time,
            timezone: None,
        }
    }

    #[tokio::test]
    async fn get_last_returns_newest_by_server_time() {
        let repo = MemoryLocationsRepository::new();
        let user = Uuid::new_v4();
        let now = Utc::now();
        repo.append(&sample_at(user, now)).await.unwrap();
        repo.append(&sample_at(user, now - Duration::minutes(5)))
            .await
            .unwrap();

        let last = repo.get_last(user).await.unwrap().unwrap();
        assert_eq!(last.server_time, now);
    }

    #[tokio::test]
    async fn retention_sweep_counts_removals() {
        let repo = MemoryLocationsRepository::new();
        let user = Uuid::new_v4();
        let now = Utc::now();
        repo.append(&sample_at(user, now)).await.unwrap();
        repo.append(&sample_at(user, now - Duration::days(40)))
            .await
            .unwrap();
        repo.append(&sample_at(user, now - Duration::days(45)))
            .await
            .unwrap();

        let removed = repo
            .delete_older_than(now - Duration::days(30))
            .await
            .unwrap();
        assert_eq!(removed, 2);
        assert_eq!(repo.count_for(user), 1);
    }
}
