//! Connection registry and cross-user routing.
//!
//! One task owns every mutation of the client and room maps, fed by four
//! bounded channels (`register`, `unregister`, `broadcast`, `send_to_user`)
//! plus cleanup and metrics tickers. Producers never block: the fan-out
//! channels are `try_send` and a full channel is a counted drop. Read
//! helpers on the handle take the shared read lock only.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::SubmitError;
use crate::protocol::Frame;
use crate::room::{BroadcastFilter, Room};
use crate::users_repo::DynUsersRepo;

const CONTROL_CHANNEL_CAPACITY: usize = 64;
const FANOUT_CHANNEL_CAPACITY: usize = 1024;

/// Repository calls made from the hub task are bounded so a slow store can
/// never stall registry mutations.
const REPO_CALL_TIMEOUT: std::time::Duration = std::time::Duration::from_secs(10);

/// One live connection as the hub and rooms see it.
pub struct ClientHandle {
    pub id: Uuid,
    pub user_id: Uuid,
    pub circle_ids: Vec<Uuid>,
    sender: flume::Sender<Frame>,
    cancel: CancellationToken,
    is_active: AtomicBool,
    last_activity: AtomicI64,
    dropped_frames: AtomicU64,
}

impl ClientHandle {
    pub fn new(user_id: Uuid, circle_ids: Vec<Uuid>, sender: flume::Sender<Frame>) -> Arc<Self> {
        Self::with_cancel(user_id, circle_ids, sender, CancellationToken::new())
    }

    pub fn with_cancel(
        user_id: Uuid,
        circle_ids: Vec<Uuid>,
        sender: flume::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Self::for_connection(Uuid::new_v4(), user_id, circle_ids, sender, cancel)
    }

    /// Build a handle for an upgraded connection that already has an id
    /// and a cancellation token shared with its pumps.
    pub fn for_connection(
        id: Uuid,
        user_id: Uuid,
        circle_ids: Vec<Uuid>,
        sender: flume::Sender<Frame>,
        cancel: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            user_id,
            circle_ids,
            sender,
            cancel,
            is_active: AtomicBool::new(true),
            last_activity: AtomicI64::new(Utc::now().timestamp()),
            dropped_frames: AtomicU64::new(0),
        })
    }

    /// Non-blocking handoff to the connection's write pump. A full buffer
    /// is the backpressure point for broadcasts: the frame is dropped and
    /// counted.
    pub fn send(&self, frame: Frame) -> bool {
        match self.sender.try_send(frame) {
            Ok(()) => true,
            Err(_) => {
                let dropped = self.dropped_frames.fetch_add(1, Ordering::Relaxed) + 1;
                metrics::counter!("ws.frames.dropped_total").increment(1);
                if dropped == 1 || dropped % 100 == 0 {
                    warn!(
                        connection = %self.id,
                        user = %self.user_id,
                        dropped,
                        "Send buffer full, dropping outbound frame"
                    );
                }
                false
            }
        }
    }

    pub fn touch(&self) {
        self.last_activity
            .store(Utc::now().timestamp(), Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.is_active.load(Ordering::Relaxed)
    }

    /// Flag the connection dead and cancel its pumps. Idempotent.
    pub fn deactivate(&self) {
        self.is_active.store(false, Ordering::Relaxed);
        self.cancel.cancel();
    }

    pub fn idle_duration(&self, now: DateTime<Utc>) -> chrono::Duration {
        now - DateTime::from_timestamp(self.last_activity.load(Ordering::Relaxed), 0)
            .unwrap_or(now)
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone)]
pub struct HubStats {
    pub clients: usize,
    pub users_online: usize,
    pub rooms: usize,
    pub messages_total: u64,
    pub messages_per_sec: f64,
    pub dropped_total: u64,
}

struct RoomBroadcast {
    room_id: Uuid,
    frame: Frame,
    filter: BroadcastFilter,
}

struct UserSend {
    user_id: Uuid,
    frame: Frame,
}

struct HubShared {
    clients: RwLock<HashMap<Uuid, Arc<ClientHandle>>>,
    user_clients: RwLock<HashMap<Uuid, Arc<ClientHandle>>>,
    rooms: RwLock<HashMap<Uuid, Arc<Room>>>,
    messages_total: AtomicU64,
    dropped_total: AtomicU64,
    messages_per_sec_bits: AtomicU64,
    broadcast_drop_logged: AtomicBool,
    send_drop_logged: AtomicBool,
}

/// Cloneable producer side of the hub. Connections hold only this; the
/// maps stay owned by the hub task.
#[derive(Clone)]
pub struct HubHandle {
    shared: Arc<HubShared>,
    register_tx: flume::Sender<Arc<ClientHandle>>,
    unregister_tx: flume::Sender<Uuid>,
    broadcast_tx: flume::Sender<RoomBroadcast>,
    send_to_user_tx: flume::Sender<UserSend>,
}

impl HubHandle {
    /// Register an authenticated connection. Awaits channel space; the
    /// control path is allowed to apply backpressure to the caller.
    pub async fn register(&self, client: Arc<ClientHandle>) {
        if self.register_tx.send_async(client).await.is_err() {
            warn!("Hub register channel closed, dropping registration");
        }
    }

    pub async fn unregister(&self, connection_id: Uuid) {
        if self.unregister_tx.send_async(connection_id).await.is_err() {
            debug!("Hub unregister channel closed");
        }
    }

    /// Queue a room broadcast. Never blocks; a full channel is a counted
    /// drop.
    pub fn broadcast_to_room(
        &self,
        room_id: Uuid,
        frame: Frame,
        filter: BroadcastFilter,
    ) -> Result<(), SubmitError> {
        self.fanout_send(
            &self.broadcast_tx,
            RoomBroadcast {
                room_id,
                frame,
                filter,
            },
            &self.shared.broadcast_drop_logged,
            "hub.broadcast",
        )
    }

    /// Queue a direct frame to a user's live connection, if any.
    pub fn send_to_user(&self, user_id: Uuid, frame: Frame) -> Result<(), SubmitError> {
        self.fanout_send(
            &self.send_to_user_tx,
            UserSend { user_id, frame },
            &self.shared.send_drop_logged,
            "hub.send_to_user",
        )
    }

    fn fanout_send<T>(
        &self,
        tx: &flume::Sender<T>,
        item: T,
        drop_logged: &AtomicBool,
        queue: &'static str,
    ) -> Result<(), SubmitError> {
        match tx.try_send(item) {
            Ok(()) => Ok(()),
            Err(flume::TrySendError::Full(_)) => {
                self.shared.dropped_total.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("hub.messages.dropped_total", "queue" => queue).increment(1);
                if !drop_logged.swap(true, Ordering::Relaxed) {
                    warn!(queue, "Hub fan-out channel full, dropping messages");
                }
                Err(SubmitError::QueueFull {
                    queue,
                    capacity: FANOUT_CHANNEL_CAPACITY,
                })
            }
            Err(flume::TrySendError::Disconnected(_)) => Err(SubmitError::Closed { queue }),
        }
    }

    pub async fn is_user_online(&self, user_id: Uuid) -> bool {
        self.shared.user_clients.read().await.contains_key(&user_id)
    }

    pub async fn room_client_count(&self, room_id: Uuid) -> usize {
        match self.shared.rooms.read().await.get(&room_id) {
            Some(room) => room.client_count().await,
            None => 0,
        }
    }

    pub async fn stats(&self) -> HubStats {
        HubStats {
            clients: self.shared.clients.read().await.len(),
            users_online: self.shared.user_clients.read().await.len(),
            rooms: self.shared.rooms.read().await.len(),
            messages_total: self.shared.messages_total.load(Ordering::Relaxed),
            messages_per_sec: f64::from_bits(
                self.shared.messages_per_sec_bits.load(Ordering::Relaxed),
            ),
            dropped_total: self.shared.dropped_total.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone)]
pub struct HubOptions {
    pub cleanup_interval: std::time::Duration,
    pub metrics_interval: std::time::Duration,
    /// Connections idle beyond this are evicted by the cleanup tick.
    pub max_client_idle: chrono::Duration,
    /// Rooms sweep members idle beyond this.
    pub max_room_idle: chrono::Duration,
}

impl Default for HubOptions {
    fn default() -> Self {
        Self {
            cleanup_interval: std::time::Duration::from_secs(300),
            metrics_interval: std::time::Duration::from_secs(60),
            max_client_idle: chrono::Duration::minutes(5),
            max_room_idle: chrono::Duration::minutes(10),
        }
    }
}

pub struct Hub {
    shared: Arc<HubShared>,
    register_rx: flume::Receiver<Arc<ClientHandle>>,
    unregister_rx: flume::Receiver<Uuid>,
    broadcast_rx: flume::Receiver<RoomBroadcast>,
    send_to_user_rx: flume::Receiver<UserSend>,
    users_repo: DynUsersRepo,
    options: HubOptions,
    cancel: CancellationToken,
}

impl Hub {
    /// Build the hub and spawn its mutator task, returning the producer
    /// handle.
    pub fn spawn(users_repo: DynUsersRepo, cancel: CancellationToken) -> HubHandle {
        Self::spawn_with(users_repo, cancel, HubOptions::default())
    }

    pub fn spawn_with(
        users_repo: DynUsersRepo,
        cancel: CancellationToken,
        options: HubOptions,
    ) -> HubHandle {
        let (register_tx, register_rx) = flume::bounded(CONTROL_CHANNEL_CAPACITY);
        let (unregister_tx, unregister_rx) = flume::bounded(CONTROL_CHANNEL_CAPACITY);
        let (broadcast_tx, broadcast_rx) = flume::bounded(FANOUT_CHANNEL_CAPACITY);
        let (send_to_user_tx, send_to_user_rx) = flume::bounded(FANOUT_CHANNEL_CAPACITY);

        let shared = Arc::new(HubShared {
            clients: RwLock::new(HashMap::new()),
            user_clients: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
            messages_total: AtomicU64::new(0),
            dropped_total: AtomicU64::new(0),
            messages_per_sec_bits: AtomicU64::new(0),
            broadcast_drop_logged: AtomicBool::new(false),
            send_drop_logged: AtomicBool::new(false),
        });

        let handle = HubHandle {
            shared: shared.clone(),
            register_tx,
            unregister_tx,
            broadcast_tx,
            send_to_user_tx,
        };

        let hub = Hub {
            shared,
            register_rx,
            unregister_rx,
            broadcast_rx,
            send_to_user_rx,
            users_repo,
            options,
            cancel,
        };
        tokio::spawn(hub.run());

        handle
    }

    /// Sole mutator loop. Every change to the client/room maps happens
    /// here.
    async fn run(self) {
        let mut cleanup = tokio::time::interval(self.options.cleanup_interval);
        let mut metrics_tick = tokio::time::interval(self.options.metrics_interval);
        cleanup.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        metrics_tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // The first tick of a tokio interval fires immediately.
        cleanup.tick().await;
        metrics_tick.tick().await;

        let mut last_message_total = 0u64;
        info!("Hub started");

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                Ok(client) = self.register_rx.recv_async() => {
                    self.handle_register(client).await;
                }
                Ok(connection_id) = self.unregister_rx.recv_async() => {
                    self.handle_unregister(connection_id).await;
                }
                Ok(broadcast) = self.broadcast_rx.recv_async() => {
                    self.handle_broadcast(broadcast).await;
                }
                Ok(send) = self.send_to_user_rx.recv_async() => {
                    self.handle_send_to_user(send).await;
                }
                _ = cleanup.tick() => {
                    self.cleanup_pass().await;
                }
                _ = metrics_tick.tick() => {
                    last_message_total = self.metrics_pass(last_message_total).await;
                }
            }
        }

        self.shutdown().await;
    }

    async fn handle_register(&self, client: Arc<ClientHandle>) {
        let user_id = client.user_id;

        // Latest wins: a previous connection for the same user is evicted.
        let previous = {
            let mut user_clients = self.shared.user_clients.write().await;
            user_clients.insert(user_id, client.clone())
        };
        if let Some(old) = previous
            && old.id != client.id
        {
            debug!(user = %user_id, old_connection = %old.id, "Replacing existing connection");
            old.deactivate();
            self.detach_from_rooms(&old).await;
            self.shared.clients.write().await.remove(&old.id);
        }

        self.shared
            .clients
            .write()
            .await
            .insert(client.id, client.clone());

        // Join one room per circle, creating rooms lazily.
        for circle_id in &client.circle_ids {
            let room = {
                let mut rooms = self.shared.rooms.write().await;
                rooms
                    .entry(*circle_id)
                    .or_insert_with(|| Arc::new(Room::new(*circle_id)))
                    .clone()
            };
            room.add(client.clone()).await;
        }

        self.set_online(user_id, true).await;

        let frame = Frame::user_status(user_id, true);
        for circle_id in &client.circle_ids {
            if let Some(room) = self.shared.rooms.read().await.get(circle_id) {
                room.broadcast(&frame, &BroadcastFilter::excluding(user_id))
                    .await;
            }
        }

        metrics::gauge!("hub.clients.active").increment(1.0);
        info!(user = %user_id, connection = %client.id, circles = client.circle_ids.len(), "Connection registered");
    }

    async fn handle_unregister(&self, connection_id: Uuid) {
        // Idempotent: a connection that already unregistered is a no-op.
        let Some(client) = self.shared.clients.write().await.remove(&connection_id) else {
            return;
        };
        client.deactivate();
        self.detach_from_rooms(&client).await;

        // Only flip the user offline if no newer connection took over.
        let was_current = {
            let mut user_clients = self.shared.user_clients.write().await;
            match user_clients.get(&client.user_id) {
                Some(current) if current.id == connection_id => {
                    user_clients.remove(&client.user_id);
                    true
                }
                _ => false,
            }
        };

        if was_current {
            self.set_online(client.user_id, false).await;
            let frame = Frame::user_status(client.user_id, false);
            for circle_id in &client.circle_ids {
                if let Some(room) = self.shared.rooms.read().await.get(circle_id) {
                    room.broadcast(&frame, &BroadcastFilter::excluding(client.user_id))
                        .await;
                }
            }
        }

        self.gc_empty_rooms().await;
        metrics::gauge!("hub.clients.active").decrement(1.0);
        info!(user = %client.user_id, connection = %connection_id, "Connection unregistered");
    }

    async fn handle_broadcast(&self, broadcast: RoomBroadcast) {
        let room = { self.shared.rooms.read().await.get(&broadcast.room_id).cloned() };
        if let Some(room) = room {
            room.broadcast(&broadcast.frame, &broadcast.filter).await;
            self.shared.messages_total.fetch_add(1, Ordering::Relaxed);
            metrics::counter!("hub.messages.broadcast_total").increment(1);
        } else {
            debug!(room = %broadcast.room_id, "Broadcast to unknown room dropped");
        }
    }

    async fn handle_send_to_user(&self, send: UserSend) {
        let client = { self.shared.user_clients.read().await.get(&send.user_id).cloned() };
        match client {
            Some(client) => {
                client.send(send.frame);
                self.shared.messages_total.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("hub.messages.direct_total").increment(1);
            }
            None => {
                // No live connection; the message is dropped by design.
                debug!(user = %send.user_id, "send_to_user with no live connection");
            }
        }
    }

    async fn detach_from_rooms(&self, client: &Arc<ClientHandle>) {
        for circle_id in &client.circle_ids {
            let room = { self.shared.rooms.read().await.get(circle_id).cloned() };
            if let Some(room) = room {
                room.remove(client.id).await;
            }
        }
    }

    async fn gc_empty_rooms(&self) {
        let empty: Vec<Uuid> = {
            let rooms = self.shared.rooms.read().await;
            let mut out = Vec::new();
            for (id, room) in rooms.iter() {
                if room.is_empty().await {
                    out.push(*id);
                }
            }
            out
        };
        if !empty.is_empty() {
            let mut rooms = self.shared.rooms.write().await;
            for id in empty {
                // Re-check under the write lock; a join may have raced in.
                if let Some(room) = rooms.get(&id)
                    && room.is_empty().await
                {
                    rooms.remove(&id);
                    debug!(room = %id, "Removed empty room");
                }
            }
        }
    }

    async fn cleanup_pass(&self) {
        let now = Utc::now();
        let stale: Vec<Uuid> = {
            let clients = self.shared.clients.read().await;
            clients
                .values()
                .filter(|c| !c.is_active() || c.idle_duration(now) > self.options.max_client_idle)
                .map(|c| c.id)
                .collect()
        };
        for connection_id in stale {
            debug!(connection = %connection_id, "Cleanup evicting stale connection");
            self.handle_unregister(connection_id).await;
        }

        let rooms: Vec<Arc<Room>> =
            { self.shared.rooms.read().await.values().cloned().collect() };
        for room in rooms {
            room.sweep_idle(self.options.max_room_idle).await;
        }
        self.gc_empty_rooms().await;
    }

    async fn metrics_pass(&self, last_total: u64) -> u64 {
        let total = self.shared.messages_total.load(Ordering::Relaxed);
        let per_sec =
            (total - last_total) as f64 / self.options.metrics_interval.as_secs_f64();
        self.shared
            .messages_per_sec_bits
            .store(per_sec.to_bits(), Ordering::Relaxed);

        metrics::gauge!("hub.messages.per_second").set(per_sec);
        metrics::gauge!("hub.rooms.active").set(self.shared.rooms.read().await.len() as f64);
        metrics::gauge!("hub.users.online")
            .set(self.shared.user_clients.read().await.len() as f64);
        total
    }

    async fn shutdown(&self) {
        info!("Hub shutting down, closing connections");
        let clients: Vec<Arc<ClientHandle>> =
            { self.shared.clients.read().await.values().cloned().collect() };
        for client in &clients {
            client.deactivate();
        }
        self.shared.clients.write().await.clear();
        self.shared.user_clients.write().await.clear();
        self.shared.rooms.write().await.clear();
        info!(closed = clients.len(), "Hub stopped");
    }

    async fn set_online(&self, user_id: Uuid, online: bool) {
        let result = tokio::time::timeout(
            REPO_CALL_TIMEOUT,
            self.users_repo.set_online(user_id, online, Utc::now()),
        )
        .await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(user = %user_id, error = %e, "Failed to update online flag"),
            Err(_) => warn!(user = %user_id, "Timed out updating online flag"),
        }
    }
}
