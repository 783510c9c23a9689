//! Per-circle fan-out set.
//!
//! A room owns its member map under its own lock. Broadcast snapshots the
//! membership under a read lock and performs every send outside it, so a
//! slow client can never hold the room.

use serde_json::json;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::hub::ClientHandle;
use crate::protocol::{Frame, FrameType};

/// Recipient filter for a broadcast. When `include_users` is non-empty only
/// those users are considered; `exclude_users` always applies.
#[derive(Debug, Clone, Default)]
pub struct BroadcastFilter {
    pub exclude_users: Vec<Uuid>,
    pub include_users: Vec<Uuid>,
}

impl BroadcastFilter {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn excluding(user_id: Uuid) -> Self {
        Self {
            exclude_users: vec![user_id],
            include_users: Vec::new(),
        }
    }

    pub fn only(users: Vec<Uuid>) -> Self {
        Self {
            exclude_users: Vec::new(),
            include_users: users,
        }
    }

    pub fn allows(&self, user_id: Uuid) -> bool {
        if !self.include_users.is_empty() && !self.include_users.contains(&user_id) {
            return false;
        }
        !self.exclude_users.contains(&user_id)
    }
}

#[derive(Debug, Clone)]
pub struct RoomStats {
    pub circle_id: Uuid,
    pub client_count: usize,
    pub messages_broadcast: u64,
    pub frames_dropped: u64,
    pub last_activity: chrono::DateTime<chrono::Utc>,
}

pub struct Room {
    pub circle_id: Uuid,
    clients: RwLock<HashMap<Uuid, Arc<ClientHandle>>>,
    last_activity: AtomicI64,
    messages_broadcast: AtomicU64,
    frames_dropped: AtomicU64,
}

impl Room {
    pub fn new(circle_id: Uuid) -> Self {
        Self {
            circle_id,
            clients: RwLock::new(HashMap::new()),
            last_activity: AtomicI64::new(chrono::Utc::now().timestamp()),
            messages_broadcast: AtomicU64::new(0),
            frames_dropped: AtomicU64::new(0),
        }
    }

    fn touch(&self) {
        self.last_activity
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Add a member. Idempotent per connection id; the joined frame only
    /// goes out the first time.
    pub async fn add(&self, client: Arc<ClientHandle>) {
        let inserted = {
            let mut clients = self.clients.write().await;
            clients.insert(client.id, client.clone()).is_none()
        };
        self.touch();
        if inserted {
            let frame = member_status_frame(self.circle_id, client.user_id, "joined");
            self.broadcast(&frame, &BroadcastFilter::excluding(client.user_id))
                .await;
        }
    }

    /// Remove a member. Idempotent; the left frame only goes out when the
    /// connection was actually a member.
    pub async fn remove(&self, connection_id: Uuid) -> bool {
        let removed = {
            let mut clients = self.clients.write().await;
            clients.remove(&connection_id)
        };
        self.touch();
        match removed {
            Some(client) => {
                let frame = member_status_frame(self.circle_id, client.user_id, "left");
                self.broadcast(&frame, &BroadcastFilter::excluding(client.user_id))
                    .await;
                true
            }
            None => false,
        }
    }

    /// Fan a frame out to every member passing the filter. Returns the
    /// number of members the frame was handed to; members with a full send
    /// buffer are counted as drops, never waited on.
    pub async fn broadcast(&self, frame: &Frame, filter: &BroadcastFilter) -> usize {
        let members: Vec<Arc<ClientHandle>> =
            { self.clients.read().await.values().cloned().collect() };

        let mut delivered = 0;
        for member in members {
            if !filter.allows(member.user_id) {
                continue;
            }
            if member.send(frame.clone()) {
                delivered += 1;
            } else {
                self.frames_dropped.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("room.frames.dropped_total").increment(1);
            }
        }
        self.messages_broadcast.fetch_add(1, Ordering::Relaxed);
        self.touch();
        delivered
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    pub async fn client_count(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn has_user(&self, user_id: Uuid) -> bool {
        self.clients
            .read()
            .await
            .values()
            .any(|c| c.user_id == user_id)
    }

    /// Evict members that are inactive or idle beyond `max_idle`.
    pub async fn sweep_idle(&self, max_idle: chrono::Duration) -> usize {
        let now = chrono::Utc::now();
        let stale: Vec<Uuid> = {
            let clients = self.clients.read().await;
            clients
                .values()
                .filter(|c| !c.is_active() || c.idle_duration(now) > max_idle)
                .map(|c| c.id)
                .collect()
        };
        for id in &stale {
            debug!(room = %self.circle_id, connection = %id, "Evicting idle room member");
            self.remove(*id).await;
        }
        stale.len()
    }

    pub async fn stats(&self) -> RoomStats {
        RoomStats {
            circle_id: self.circle_id,
            client_count: self.client_count().await,
            messages_broadcast: self.messages_broadcast.load(Ordering::Relaxed),
            frames_dropped: self.frames_dropped.load(Ordering::Relaxed),
            last_activity: chrono::DateTime::from_timestamp(
                self.last_activity.load(Ordering::Relaxed),
                0,
            )
            .unwrap_or_else(chrono::Utc::now),
        }
    }
}

fn member_status_frame(circle_id: Uuid, user_id: Uuid, status: &str) -> Frame {
    Frame::new(
        FrameType::UserStatus,
        json!({ "circleId": circle_id, "userId": user_id, "status": status }),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(user_id: Uuid, buffer: usize) -> (Arc<ClientHandle>, flume::Receiver<Frame>) {
        let (tx, rx) = flume::bounded(buffer);
        (ClientHandle::new(user_id, vec![], tx), rx)
    }

    #[tokio::test]
    async fn broadcast_respects_exclude_filter() {
        let room = Room::new(Uuid::new_v4());
        let (a, rx_a) = client(Uuid::new_v4(), 8);
        let (b, rx_b) = client(Uuid::new_v4(), 8);
        let (c, rx_c) = client(Uuid::new_v4(), 8);
        for handle in [&a, &b, &c] {
            room.add(handle.clone()).await;
        }
        // Drain join frames
        while rx_a.try_recv().is_ok() {}
        while rx_b.try_recv().is_ok() {}
        while rx_c.try_recv().is_ok() {}

        let frame = Frame::user_status(a.user_id, true);
        let delivered = room
            .broadcast(&frame, &BroadcastFilter::excluding(a.user_id))
            .await;

        assert_eq!(delivered, 2);
        assert!(rx_a.try_recv().is_err());
        assert!(rx_b.try_recv().is_ok());
        assert!(rx_c.try_recv().is_ok());
    }

    #[tokio::test]
    async fn include_filter_narrows_recipients() {
        let room = Room::new(Uuid::new_v4());
        let (a, _rx_a) = client(Uuid::new_v4(), 8);
        let (b, rx_b) = client(Uuid::new_v4(), 8);
        room.add(a.clone()).await;
        room.add(b.clone()).await;
        while rx_b.try_recv().is_ok() {}

        let frame = Frame::user_status(a.user_id, true);
        let delivered = room
            .broadcast(&frame, &BroadcastFilter::only(vec![b.user_id]))
            .await;
        assert_eq!(delivered, 1);
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn add_is_idempotent() {
        let room = Room::new(Uuid::new_v4());
        let (a, _rx) = client(Uuid::new_v4(), 8);
        room.add(a.clone()).await;
        room.add(a.clone()).await;
        assert_eq!(room.client_count().await, 1);
    }

    #[tokio::test]
    async fn remove_is_idempotent() {
        let room = Room::new(Uuid::new_v4());
        let (a, _rx) = client(Uuid::new_v4(), 8);
        room.add(a.clone()).await;
        assert!(room.remove(a.id).await);
        assert!(!room.remove(a.id).await);
        assert!(room.is_empty().await);
    }

    #[tokio::test]
    async fn full_send_buffer_counts_as_drop() {
        let room = Room::new(Uuid::new_v4());
        let (a, _rx) = client(Uuid::new_v4(), 1);
        room.add(a.clone()).await;

        let frame = Frame::user_status(a.user_id, true);
        // First fill the buffer, then overflow it.
        assert_eq!(room.broadcast(&frame, &BroadcastFilter::none()).await, 1);
        assert_eq!(room.broadcast(&frame, &BroadcastFilter::none()).await, 0);
        let stats = room.stats().await;
        assert_eq!(stats.frames_dropped, 1);
    }

    #[tokio::test]
    async fn join_emits_status_to_existing_members_only() {
        let room = Room::new(Uuid::new_v4());
        let (a, rx_a) = client(Uuid::new_v4(), 8);
        let (b, rx_b) = client(Uuid::new_v4(), 8);
        room.add(a.clone()).await;
        room.add(b.clone()).await;

        // a sees b's join; b sees nothing (the join frame excludes b).
        let frame = rx_a.try_recv().unwrap();
        assert_eq!(frame.data["status"], "joined");
        assert_eq!(frame.data["userId"], serde_json::json!(b.user_id));
        assert!(rx_b.try_recv().is_err());
    }

    #[tokio::test]
    async fn sweep_evicts_inactive_members() {
        let room = Room::new(Uuid::new_v4());
        let (a, _rx_a) = client(Uuid::new_v4(), 8);
        let (b, _rx_b) = client(Uuid::new_v4(), 8);
        room.add(a.clone()).await;
        room.add(b.clone()).await;

        a.deactivate();
        let evicted = room.sweep_idle(chrono::Duration::minutes(10)).await;
        assert_eq!(evicted, 1);
        assert!(!room.has_user(a.user_id).await);
        assert!(room.has_user(b.user_id).await);
    }
}
