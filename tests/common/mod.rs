//! Shared fixtures: a fully wired engine over the in-memory stores with a
//! recording dispatcher.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use tether::circles::{Circle, CircleMember, CircleSettings, MemberStatus};
use tether::circles_repo::MemoryCirclesRepository;
use tether::config::{GeofenceConfig, LocationConfig, NotifyConfig};
use tether::dispatcher::Dispatcher;
use tether::geofence_worker::{GeofenceWorker, GeofenceWorkerHandle};
use tether::hub::{ClientHandle, Hub, HubHandle};
use tether::kv::MemoryKvStore;
use tether::location_worker::{LocationWorker, LocationWorkerHandle};
use tether::locations::{LocationSample, LocationSource, MovementKind};
use tether::locations_repo::MemoryLocationsRepository;
use tether::notification_worker::{NotificationWorker, NotificationWorkerHandle};
use tether::notifications::{NotificationChannel, NotificationJob};
use tether::notifications_repo::MemoryNotificationsRepository;
use tether::places::{Place, PlaceCategory, PlaceNotifyPolicy};
use tether::places_repo::MemoryPlacesRepository;
use tether::protocol::Frame;
use tether::users::User;
use tether::users_repo::MemoryUsersRepository;

/// Records every dispatch instead of delivering it.
pub struct RecordingDispatcher {
    deliveries: Mutex<Vec<(NotificationChannel, Uuid, String)>>,
}

impl RecordingDispatcher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            deliveries: Mutex::new(Vec::new()),
        })
    }

    pub fn deliveries(&self) -> Vec<(NotificationChannel, Uuid, String)> {
        self.deliveries.lock().unwrap().clone()
    }
}

#[async_trait]
impl Dispatcher for RecordingDispatcher {
    async fn dispatch(
        &self,
        channel: NotificationChannel,
        recipient: &User,
        job: &NotificationJob,
    ) -> Result<()> {
        self.deliveries
            .lock()
            .unwrap()
            .push((channel, recipient.id, job.title.clone()));
        Ok(())
    }
}

pub struct Engine {
    pub locations: Arc<MemoryLocationsRepository>,
    pub places: Arc<MemoryPlacesRepository>,
    pub circles: Arc<MemoryCirclesRepository>,
    pub users: Arc<MemoryUsersRepository>,
    pub notifications_repo: Arc<MemoryNotificationsRepository>,
    pub kv: Arc<MemoryKvStore>,
    pub dispatcher: Arc<RecordingDispatcher>,
    pub hub: HubHandle,
    pub location_worker: LocationWorkerHandle,
    pub geofence: GeofenceWorkerHandle,
    pub notifications: NotificationWorkerHandle,
    pub cancel: CancellationToken,
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

pub fn engine() -> Engine {
    let locations = Arc::new(MemoryLocationsRepository::new());
    let places = Arc::new(MemoryPlacesRepository::new());
    let circles = Arc::new(MemoryCirclesRepository::new());
    let users = Arc::new(MemoryUsersRepository::new());
    let notifications_repo = Arc::new(MemoryNotificationsRepository::new());
    let kv = Arc::new(MemoryKvStore::new());
    let dispatcher = RecordingDispatcher::new();
    let cancel = CancellationToken::new();

    let hub = Hub::spawn(users.clone(), cancel.clone());

    let notify_config = NotifyConfig {
        retry_delay_secs: 0,
        ..NotifyConfig::default()
    };
    let notifications = NotificationWorker::new(
        notify_config,
        notifications_repo.clone(),
        users.clone(),
        dispatcher.clone(),
        hub.clone(),
    )
    .spawn(cancel.clone());

    let geofence = GeofenceWorker::new(
        GeofenceConfig::default(),
        places.clone(),
        circles.clone(),
        users.clone(),
        notifications.clone(),
        hub.clone(),
        kv.clone(),
    )
    .spawn(cancel.clone());

    let location_config = LocationConfig {
        retry_delay_secs: 0,
        ..LocationConfig::default()
    };
    let location_worker = LocationWorker::new(
        location_config,
        locations.clone(),
        circles.clone(),
        users.clone(),
        geofence.clone(),
        hub.clone(),
    )
    .spawn(cancel.clone());

    Engine {
        locations,
        places,
        circles,
        users,
        notifications_repo,
        kv,
        dispatcher,
        hub,
        location_worker,
        geofence,
        notifications,
        cancel,
    }
}

pub fn make_user(engine: &Engine, first_name: &str) -> Uuid {
    let id = Uuid::new_v4();
    engine.users.insert(User {
        id,
        email: Some(format!("{}@example.com", first_name.to_lowercase())),
        phone: Some("+15550100".to_string()),
        first_name: first_name.to_string(),
        last_name: "Reyes".to_string(),
        push_token: Some("push-token".to_string()),
        is_online: false,
        last_seen: None,
        created_at: Utc::now(),
    });
    id
}

pub fn make_circle(engine: &Engine, members: &[Uuid]) -> Uuid {
    let id = Uuid::new_v4();
    engine.circles.insert(Circle {
        id,
        name: "Family".to_string(),
        admin_user_id: members[0],
        members: members
            .iter()
            .map(|m| CircleMember {
                user_id: *m,
                status: MemberStatus::Active,
                joined_at: Utc::now(),
            })
            .collect(),
        settings: CircleSettings::default(),
        created_at: Utc::now(),
    });
    for member in members {
        engine.places.set_memberships(*member, vec![id]);
    }
    id
}

pub fn make_place(
    engine: &Engine,
    owner: Uuid,
    circle_id: Option<Uuid>,
    lat: f64,
    lon: f64,
    radius_m: f64,
    notify: PlaceNotifyPolicy,
) -> Uuid {
    let id = Uuid::new_v4();
    engine.places.insert_place(Place {
        id,
        owner_user_id: owner,
        circle_id,
        name: "Home".to_string(),
        latitude: lat,
        longitude: lon,
        radius_m,
        category: PlaceCategory::Home,
        notify,
        active: true,
        created_at: Utc::now(),
    });
    id
}

pub fn sample_at(user_id: Uuid, lat: f64, lon: f64, at: DateTime<Utc>) -> LocationSample {
    LocationSample {
        user_id,
        latitude: lat,
        longitude: lon,
        accuracy: Some(10.0),
        speed: Some(1.0),
        bearing: None,
        battery_level: Some(90.0),
        is_driving: false,
        is_moving: true,
        is_charging: false,
        movement_kind: MovementKind::Walking,
        source: LocationSource::Gps,
        device_time: Some(at),
        server_time: at,
        timezone: Some("America/Los_Angeles".to_string()),
    }
}

/// Register a bare client for a user and drain its greeting frames.
pub async fn connect(engine: &Engine, user: Uuid, circles: Vec<Uuid>) -> (Arc<ClientHandle>, flume::Receiver<Frame>) {
    let (tx, rx) = flume::bounded(64);
    let client = ClientHandle::new(user, circles, tx);
    engine.hub.register(client.clone()).await;
    wait_until(|| {
        let hub = engine.hub.clone();
        async move { hub.is_user_online(user).await }
    })
    .await;
    while rx.try_recv().is_ok() {}
    (client, rx)
}

pub async fn wait_until<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached within timeout");
}
