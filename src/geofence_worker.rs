//! Geofence engine: previous-vs-current membership diffing, visit
//! bookkeeping, notifications, and place-event fan-out.
//!
//! Samples are sharded by `hash(user_id)` so every sample for a given user
//! lands on the same worker. That serialises the previous-location cache
//! per user without a global lock; between users the shards run in
//! parallel and no ordering is guaranteed.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde_json::json;
use std::collections::HashMap;
use std::hash::{DefaultHasher, Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::circles_repo::DynCirclesRepo;
use crate::config::GeofenceConfig;
use crate::error::{StoreError, SubmitError};
use crate::hub::HubHandle;
use crate::kv::{DynKvStore, LAST_LOCATION_PREFIX};
use crate::locations::LocationSample;
use crate::notification_worker::NotificationWorkerHandle;
use crate::notifications::{NotificationJob, NotificationPriority};
use crate::places::Place;
use crate::places_repo::{DynPlacesRepo, PlaceStatsUpdate};
use crate::protocol::{Frame, FrameType};
use crate::room::BroadcastFilter;
use crate::users_repo::DynUsersRepo;
use crate::visits::{Visit, VisitUpdate};

const STORE_RETRY_ATTEMPTS: u32 = 3;
const STORE_RETRY_BASE: std::time::Duration = std::time::Duration::from_secs(1);
const REPO_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);
/// Persisted last locations outlive a restart but not a vacation.
const LAST_LOCATION_TTL: chrono::Duration = chrono::Duration::days(7);

#[derive(Debug, Clone)]
pub struct GeofenceJob {
    pub user_id: Uuid,
    pub location: LocationSample,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlaceEventKind {
    Entry,
    Exit,
}

/// One boundary crossing for a (user, place) pair.
#[derive(Debug, Clone)]
pub struct PlaceEvent {
    pub kind: PlaceEventKind,
    pub place: Place,
    pub user_id: Uuid,
    pub at: DateTime<Utc>,
}

/// Diff a user's membership across two consecutive samples.
///
/// With no previous sample, every place currently containing the user
/// yields an entry and nothing can yield an exit; a worker restart
/// therefore re-announces presence but never fabricates departures.
pub fn detect_transitions(
    prev: Option<&LocationSample>,
    curr: &LocationSample,
    places: &[Place],
) -> Vec<PlaceEvent> {
    let mut events = Vec::new();
    for place in places {
        if !place.active {
            continue;
        }
        let is_in = place.contains(curr.latitude, curr.longitude);
        let was_in = match prev {
            Some(prev) => place.contains(prev.latitude, prev.longitude),
            None => false,
        };
        let kind = match (was_in, is_in) {
            (false, true) => PlaceEventKind::Entry,
            (true, false) => PlaceEventKind::Exit,
            _ => continue,
        };
        events.push(PlaceEvent {
            kind,
            place: place.clone(),
            user_id: curr.user_id,
            at: curr.server_time,
        });
    }
    events
}

struct CachedPlaces {
    places: Vec<Place>,
    fetched_at: Instant,
}

#[derive(Clone)]
pub struct GeofenceWorkerHandle {
    shards: Vec<flume::Sender<GeofenceJob>>,
    shard_capacity: usize,
    dropped: Arc<AtomicU64>,
    places_cache: Arc<RwLock<HashMap<Uuid, CachedPlaces>>>,
}

impl GeofenceWorkerHandle {
    /// Route a sample to its user's shard. Fire-and-forget from the
    /// LocationWorker's point of view; a full shard is a counted drop.
    pub fn submit(&self, job: GeofenceJob) -> Result<(), SubmitError> {
        let shard = shard_for(job.user_id, self.shards.len());
        match self.shards[shard].try_send(job) {
            Ok(()) => {
                let depth: usize = self.shards.iter().map(|s| s.len()).sum();
                metrics::gauge!("geofence.queue.depth").set(depth as f64);
                Ok(())
            }
            Err(flume::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("geofence.queue.dropped_total").increment(1);
                Err(SubmitError::QueueFull {
                    queue: "geofence",
                    capacity: self.shard_capacity,
                })
            }
            Err(flume::TrySendError::Disconnected(_)) => {
                Err(SubmitError::Closed { queue: "geofence" })
            }
        }
    }

    /// Drop a user's cached place list; the next sample refetches.
    pub async fn invalidate_places(&self, user_id: Uuid) {
        self.places_cache.write().await.remove(&user_id);
    }

    pub fn queue_depth(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

fn shard_for(user_id: Uuid, shards: usize) -> usize {
    let mut hasher = DefaultHasher::new();
    user_id.hash(&mut hasher);
    (hasher.finish() as usize) % shards.max(1)
}

pub struct GeofenceWorker {
    config: GeofenceConfig,
    places_repo: DynPlacesRepo,
    circles_repo: DynCirclesRepo,
    users_repo: DynUsersRepo,
    notifications: NotificationWorkerHandle,
    hub: HubHandle,
    kv: DynKvStore,
    places_cache: Arc<RwLock<HashMap<Uuid, CachedPlaces>>>,
    last_locations: Arc<DashMap<Uuid, LocationSample>>,
    long_stay_notified: Arc<DashMap<(Uuid, Uuid), ()>>,
}

impl GeofenceWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: GeofenceConfig,
        places_repo: DynPlacesRepo,
        circles_repo: DynCirclesRepo,
        users_repo: DynUsersRepo,
        notifications: NotificationWorkerHandle,
        hub: HubHandle,
        kv: DynKvStore,
    ) -> Self {
        Self {
            config,
            places_repo,
            circles_repo,
            users_repo,
            notifications,
            hub,
            kv,
            places_cache: Arc::new(RwLock::new(HashMap::new())),
            last_locations: Arc::new(DashMap::new()),
            long_stay_notified: Arc::new(DashMap::new()),
        }
    }

    /// Spawn one worker task per shard and return the routing handle.
    pub fn spawn(self, cancel: CancellationToken) -> GeofenceWorkerHandle {
        let shard_count = self.config.worker_count.max(1);
        let shard_capacity = (self.config.queue_size / shard_count).max(1);

        let mut senders = Vec::with_capacity(shard_count);
        let mut receivers = Vec::with_capacity(shard_count);
        for _ in 0..shard_count {
            let (tx, rx) = flume::bounded::<GeofenceJob>(shard_capacity);
            senders.push(tx);
            receivers.push(rx);
        }

        let handle = GeofenceWorkerHandle {
            shards: senders,
            shard_capacity,
            dropped: Arc::new(AtomicU64::new(0)),
            places_cache: self.places_cache.clone(),
        };

        let worker = Arc::new(self);
        for (shard_id, rx) in receivers.into_iter().enumerate() {
            let worker = worker.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        job = rx.recv_async() => match job {
                            Ok(job) => worker.process(job).await,
                            Err(_) => break,
                        }
                    }
                }
                debug!(shard_id, "Geofence worker stopped");
            });
        }

        info!(
            shards = shard_count,
            shard_capacity, "Geofence worker pool started"
        );
        handle
    }

    async fn process(&self, job: GeofenceJob) {
        let user_id = job.user_id;
        let location = job.location;

        let places = match self.places_for(user_id).await {
            Some(places) => places,
            None => return,
        };

        let prev = match self.last_locations.get(&user_id) {
            Some(entry) => Some(entry.clone()),
            None => self.load_persisted_location(user_id).await,
        };

        let events = detect_transitions(prev.as_ref(), &location, &places);

        self.last_locations.insert(user_id, location.clone());
        self.persist_location(&location).await;

        for event in &events {
            self.handle_event(event, &location).await;
            metrics::counter!(
                "geofence.events_total",
                "kind" => match event.kind {
                    PlaceEventKind::Entry => "entry",
                    PlaceEventKind::Exit => "exit",
                }
            )
            .increment(1);
        }

        self.check_long_stays(&location, &places, &events).await;
    }

    /// Place list for a user, refreshed when older than the configured
    /// cache window.
    async fn places_for(&self, user_id: Uuid) -> Option<Vec<Place>> {
        {
            let cache = self.places_cache.read().await;
            if let Some(entry) = cache.get(&user_id)
                && entry.fetched_at.elapsed() < self.config.cache_refresh()
            {
                return Some(entry.places.clone());
            }
        }

        for attempt in 0..=STORE_RETRY_ATTEMPTS {
            match tokio::time::timeout(
                REPO_CALL_TIMEOUT,
                self.places_repo.list_active_for_user(user_id),
            )
            .await
            {
                Ok(Ok(mut places)) => {
                    // A place stored without a usable radius falls back to
                    // the configured default.
                    for place in &mut places {
                        if !(crate::places::MIN_RADIUS_M..=crate::places::MAX_RADIUS_M)
                            .contains(&place.radius_m)
                        {
                            place.radius_m = self.config.default_radius_meters;
                        }
                    }
                    self.places_cache.write().await.insert(
                        user_id,
                        CachedPlaces {
                            places: places.clone(),
                            fetched_at: Instant::now(),
                        },
                    );
                    return Some(places);
                }
                Ok(Err(StoreError::Fatal(e))) => {
                    error!(user = %user_id, error = %e, "Fatal error listing places, dropping sample");
                    metrics::counter!("geofence.store_failures_total").increment(1);
                    return None;
                }
                Ok(Err(StoreError::Transient(e))) if attempt < STORE_RETRY_ATTEMPTS => {
                    warn!(user = %user_id, error = %e, attempt, "Retrying place list");
                    tokio::time::sleep(STORE_RETRY_BASE * (attempt + 1)).await;
                }
                Ok(Err(e)) => {
                    error!(user = %user_id, error = %e, "Giving up listing places");
                    metrics::counter!("geofence.store_failures_total").increment(1);
                    return None;
                }
                Err(_) if attempt < STORE_RETRY_ATTEMPTS => {
                    tokio::time::sleep(STORE_RETRY_BASE * (attempt + 1)).await;
                }
                Err(_) => {
                    error!(user = %user_id, "Timed out listing places");
                    metrics::counter!("geofence.store_failures_total").increment(1);
                    return None;
                }
            }
        }
        None
    }

    async fn load_persisted_location(&self, user_id: Uuid) -> Option<LocationSample> {
        if !self.config.persist_last_location {
            return None;
        }
        let key = format!("{LAST_LOCATION_PREFIX}{user_id}");
        match self.kv.get(&key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(sample) => Some(sample),
                Err(e) => {
                    warn!(user = %user_id, error = %e, "Discarding malformed persisted location");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                warn!(user = %user_id, error = %e, "Failed to read persisted location");
                None
            }
        }
    }

    async fn persist_location(&self, location: &LocationSample) {
        if !self.config.persist_last_location {
            return;
        }
        let key = format!("{LAST_LOCATION_PREFIX}{}", location.user_id);
        match serde_json::to_string(location) {
            Ok(raw) => {
                if let Err(e) = self.kv.set(&key, raw, Some(LAST_LOCATION_TTL)).await {
                    warn!(user = %location.user_id, error = %e, "Failed to persist last location");
                }
            }
            Err(e) => warn!(error = %e, "Failed to serialize last location"),
        }
    }

    async fn handle_event(&self, event: &PlaceEvent, location: &LocationSample) {
        match event.kind {
            PlaceEventKind::Entry => self.handle_entry(event).await,
            PlaceEventKind::Exit => self.handle_exit(event).await,
        }

        let wants_notification = match event.kind {
            PlaceEventKind::Entry => event.place.notify.on_arrival,
            PlaceEventKind::Exit => event.place.notify.on_departure,
        };
        if wants_notification {
            self.send_place_notifications(event).await;
        }

        self.broadcast_place_event(event, location).await;
    }

    async fn handle_entry(&self, event: &PlaceEvent) {
        let user_id = event.user_id;
        let place_id = event.place.id;

        for attempt in 0..=STORE_RETRY_ATTEMPTS {
            let outcome = async {
                match self.places_repo.find_ongoing_visit(user_id, place_id).await? {
                    Some(_) => Ok(false),
                    None => {
                        self.places_repo
                            .create_visit(Visit::begin(user_id, place_id, event.at))
                            .await?;
                        Ok(true)
                    }
                }
            }
            .await;

            match outcome {
                Ok(created) => {
                    if created {
                        debug!(user = %user_id, place = %place_id, "Visit opened");
                        metrics::counter!("geofence.visits_opened_total").increment(1);
                    }
                    break;
                }
                Err(StoreError::Transient(e)) if attempt < STORE_RETRY_ATTEMPTS => {
                    warn!(user = %user_id, place = %place_id, error = %e, attempt, "Retrying visit open");
                    tokio::time::sleep(STORE_RETRY_BASE * (attempt + 1)).await;
                }
                Err(e) => {
                    error!(user = %user_id, place = %place_id, error = %e, "Failed to open visit");
                    metrics::counter!("geofence.store_failures_total").increment(1);
                    break;
                }
            }
        }

        if let Err(e) = self
            .places_repo
            .update_stats(place_id, PlaceStatsUpdate { entry_at: event.at })
            .await
        {
            warn!(place = %place_id, error = %e, "Failed to update place stats");
        }
    }

    async fn handle_exit(&self, event: &PlaceEvent) {
        let user_id = event.user_id;
        let place_id = event.place.id;
        self.long_stay_notified.remove(&(user_id, place_id));

        for attempt in 0..=STORE_RETRY_ATTEMPTS {
            let outcome = async {
                match self.places_repo.find_ongoing_visit(user_id, place_id).await? {
                    Some(visit) => {
                        self.places_repo
                            .update_visit(visit.id, VisitUpdate::closing(visit.arrival, event.at))
                            .await?;
                        Ok(true)
                    }
                    None => Ok(false),
                }
            }
            .await;

            match outcome {
                Ok(closed) => {
                    if closed {
                        debug!(user = %user_id, place = %place_id, "Visit closed");
                        metrics::counter!("geofence.visits_closed_total").increment(1);
                    } else {
                        // An exit with no ongoing visit happens after a
                        // restart mid-stay; nothing to close.
                        debug!(user = %user_id, place = %place_id, "Exit without ongoing visit");
                    }
                    break;
                }
                Err(StoreError::Transient(e)) if attempt < STORE_RETRY_ATTEMPTS => {
                    warn!(user = %user_id, place = %place_id, error = %e, attempt, "Retrying visit close");
                    tokio::time::sleep(STORE_RETRY_BASE * (attempt + 1)).await;
                }
                Err(e) => {
                    error!(user = %user_id, place = %place_id, error = %e, "Failed to close visit");
                    metrics::counter!("geofence.store_failures_total").increment(1);
                    break;
                }
            }
        }
    }

    async fn send_place_notifications(&self, event: &PlaceEvent) {
        let recipients = self.notification_recipients(&event.place, event.user_id).await;
        if recipients.is_empty() {
            return;
        }

        let actor = self.actor_name(event.user_id).await;
        let (title, body) = match event.kind {
            PlaceEventKind::Entry => (
                format!("{} arrived at {}", actor, event.place.name),
                format!("{} arrived at {}.", actor, event.place.name),
            ),
            PlaceEventKind::Exit => (
                format!("{} left {}", actor, event.place.name),
                format!("{} left {}.", actor, event.place.name),
            ),
        };
        let data = json!({
            "placeId": event.place.id,
            "userId": event.user_id,
            "eventType": event.kind,
        });

        for recipient in recipients {
            let job = NotificationJob::new(
                recipient,
                title.clone(),
                body.clone(),
                NotificationPriority::Normal,
            )
            .with_data(data.clone());
            if let Err(e) = self.notifications.submit(job) {
                warn!(recipient = %recipient, error = %e, "Dropped place notification");
            }
        }
    }

    /// Active members of the place's circle (excluding the acting user)
    /// plus the policy's explicit extra recipients.
    async fn notification_recipients(&self, place: &Place, actor: Uuid) -> Vec<Uuid> {
        let mut recipients: Vec<Uuid> = Vec::new();

        if let Some(circle_id) = place.circle_id {
            match self.circles_repo.get(circle_id).await {
                Ok(Some(circle)) => {
                    recipients.extend(
                        circle
                            .active_member_ids()
                            .into_iter()
                            .filter(|id| *id != actor),
                    );
                }
                Ok(None) => {
                    debug!(circle = %circle_id, "Place circle not found");
                }
                Err(e) => {
                    warn!(circle = %circle_id, error = %e, "Failed to load place circle");
                }
            }
        }

        for extra in &place.notify.notify_members {
            if *extra != actor && !recipients.contains(extra) {
                recipients.push(*extra);
            }
        }
        recipients
    }

    async fn actor_name(&self, user_id: Uuid) -> String {
        match self.users_repo.get(user_id).await {
            Ok(Some(user)) => user.display_name(),
            _ => "A circle member".to_string(),
        }
    }

    async fn broadcast_place_event(&self, event: &PlaceEvent, location: &LocationSample) {
        let circles = match self.circles_repo.list_for_user(event.user_id).await {
            Ok(circles) => circles,
            Err(e) => {
                warn!(user = %event.user_id, error = %e, "Failed to list circles for place event");
                return;
            }
        };

        let frame = Frame::new(
            FrameType::PlaceEvent,
            json!({
                "placeId": event.place.id,
                "placeName": event.place.name,
                "userId": event.user_id,
                "eventType": event.kind,
                "latitude": location.latitude,
                "longitude": location.longitude,
                "timestamp": event.at,
            }),
        );

        for circle in circles {
            if !circle.settings.place_notifications {
                continue;
            }
            if let Err(e) =
                self.hub
                    .broadcast_to_room(circle.id, frame.clone(), BroadcastFilter::none())
            {
                debug!(circle = %circle.id, error = %e, "Place event broadcast dropped");
            }
        }
    }

    /// Long-stay detection for places the user is still inside: when the
    /// ongoing visit crosses the policy threshold, notify once per stay.
    async fn check_long_stays(
        &self,
        location: &LocationSample,
        places: &[Place],
        events: &[PlaceEvent],
    ) {
        for place in places {
            if !place.notify.on_long_stay {
                continue;
            }
            let Some(threshold_minutes) = place.notify.long_stay_minutes else {
                continue;
            };
            if !place.contains(location.latitude, location.longitude) {
                continue;
            }
            // A fresh entry this job starts the clock, it does not ring it.
            if events
                .iter()
                .any(|e| e.place.id == place.id && e.kind == PlaceEventKind::Entry)
            {
                continue;
            }
            let key = (location.user_id, place.id);
            if self.long_stay_notified.contains_key(&key) {
                continue;
            }

            let visit = match self
                .places_repo
                .find_ongoing_visit(location.user_id, place.id)
                .await
            {
                Ok(Some(visit)) => visit,
                _ => continue,
            };
            let stayed = location.server_time - visit.arrival;
            if stayed < chrono::Duration::minutes(threshold_minutes as i64) {
                continue;
            }

            self.long_stay_notified.insert(key, ());
            let actor = self.actor_name(location.user_id).await;
            let minutes = stayed.num_minutes();
            let recipients = self
                .notification_recipients(place, location.user_id)
                .await;
            for recipient in recipients {
                let job = NotificationJob::new(
                    recipient,
                    format!("{} is still at {}", actor, place.name),
                    format!("{} has been at {} for {} minutes.", actor, place.name, minutes),
                    NotificationPriority::Normal,
                )
                .with_data(json!({
                    "placeId": place.id,
                    "userId": location.user_id,
                    "eventType": "long_stay",
                    "minutes": minutes,
                }));
                if let Err(e) = self.notifications.submit(job) {
                    warn!(recipient = %recipient, error = %e, "Dropped long-stay notification");
                }
            }
            metrics::counter!("geofence.long_stays_total").increment(1);
        }
    }
}
