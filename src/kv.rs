//! Cache/queue store contract: string keys with optional TTL.
//!
//! The core touches this in two places: the geofence worker persists each
//! user's last location under `ws:lastloc:` so restarts skip the initial
//! entry-storm, and the cleanup worker sweeps well-known prefixes for keys
//! that were written without a TTL and have outlived their usefulness.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use std::sync::Arc;

use crate::error::StoreResult;

/// Prefixes the cleanup sweep is allowed to touch.
pub const SWEEP_PREFIXES: [&str; 4] = ["session:", "cache:", "temp:", "ws:"];

/// Prefix under which the geofence worker persists last locations.
pub const LAST_LOCATION_PREFIX: &str = "ws:lastloc:";

#[derive(Debug, Clone)]
pub struct KvEntry {
    pub key: String,
    pub age: Duration,
    pub has_ttl: bool,
}

#[async_trait]
pub trait KvStore: Send + Sync {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()>;

    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Metadata for every live key under `prefix`.
    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<KvEntry>>;
}

pub type DynKvStore = Arc<dyn KvStore>;

struct Stored {
    value: String,
    inserted_at: DateTime<Utc>,
    expires_at: Option<DateTime<Utc>>,
}

impl Stored {
    fn expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|e| e <= now)
    }
}

/// In-memory kv with lazy expiry.
#[derive(Default)]
pub struct MemoryKvStore {
    entries: DashMap<String, Stored>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Test hook: backdate a key's insertion time.
    pub fn backdate(&self, key: &str, age: Duration) {
        if let Some(mut stored) = self.entries.get_mut(key) {
            stored.inserted_at = Utc::now() - age;
        }
    }
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn set(&self, key: &str, value: String, ttl: Option<Duration>) -> StoreResult<()> {
        let now = Utc::now();
        self.entries.insert(
            key.to_string(),
            Stored {
                value,
                inserted_at: now,
                expires_at: ttl.map(|t| now + t),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        let now = Utc::now();
        if let Some(stored) = self.entries.get(key) {
            if stored.expired(now) {
                drop(stored);
                self.entries.remove(key);
                return Ok(None);
            }
            return Ok(Some(stored.value.clone()));
        }
        Ok(None)
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> StoreResult<Vec<KvEntry>> {
        let now = Utc::now();
        Ok(self
            .entries
            .iter()
            .filter(|e| e.key().starts_with(prefix) && !e.expired(now))
            .map(|e| KvEntry {
                key: e.key().clone(),
                age: now - e.inserted_at,
                has_ttl: e.expires_at.is_some(),
            })
            .collect())
    }
}
