//! Circle message and typing-indicator fan-out.
//!
//! Message persistence, drafts, and templates belong to the messaging
//! service; the realtime core only validates the request against the
//! sender's circles and re-broadcasts to the room.

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::circles_repo::DynCirclesRepo;
use crate::error::FrameError;
use crate::hub::{ClientHandle, HubHandle};
use crate::protocol::{Frame, FrameType, SendMessageRequest};
use crate::room::BroadcastFilter;

pub struct MessageRouter {
    hub: HubHandle,
    circles_repo: DynCirclesRepo,
}

impl MessageRouter {
    pub fn new(hub: HubHandle, circles_repo: DynCirclesRepo) -> Self {
        Self { hub, circles_repo }
    }

    /// Validate and fan a message out to the circle room, excluding the
    /// sender's own connection.
    pub async fn handle_send(
        &self,
        sender: &Arc<ClientHandle>,
        req: SendMessageRequest,
    ) -> Result<(), FrameError> {
        if !sender.circle_ids.contains(&req.circle_id) {
            return Err(FrameError::CircleNotFound(req.circle_id));
        }
        if req.content.trim().is_empty() {
            return Err(FrameError::InvalidMessage(
                "message content is empty".to_string(),
            ));
        }

        // A circle that disabled messaging silently swallows the fan-out;
        // the sender still gets an ack. A store failure here fails open.
        match self.circles_repo.get(req.circle_id).await {
            Ok(Some(circle)) if !circle.settings.messaging => {
                debug!(circle = %req.circle_id, "Messaging disabled for circle");
                return Ok(());
            }
            Ok(_) => {}
            Err(e) => {
                warn!(circle = %req.circle_id, error = %e, "Failed to check circle settings");
            }
        }

        let frame = Frame::new(
            FrameType::NewMessage,
            json!({
                "messageId": Uuid::now_v7(),
                "circleId": req.circle_id,
                "senderId": sender.user_id,
                "kind": req.kind,
                "content": req.content,
                "sentAt": Utc::now(),
            }),
        );
        if let Err(e) = self.hub.broadcast_to_room(
            req.circle_id,
            frame,
            BroadcastFilter::excluding(sender.user_id),
        ) {
            debug!(circle = %req.circle_id, error = %e, "Message broadcast dropped");
        }
        metrics::counter!("messages.fanout_total").increment(1);
        Ok(())
    }

    /// Typing indicators go to the circle room, excluding the typist.
    pub fn handle_typing(
        &self,
        sender: &Arc<ClientHandle>,
        circle_id: Uuid,
        typing: bool,
    ) -> Result<(), FrameError> {
        if !sender.circle_ids.contains(&circle_id) {
            return Err(FrameError::CircleNotFound(circle_id));
        }
        let frame = Frame::new(
            FrameType::TypingIndicator,
            json!({
                "circleId": circle_id,
                "userId": sender.user_id,
                "typing": typing,
            }),
        );
        if let Err(e) =
            self.hub
                .broadcast_to_room(circle_id, frame, BroadcastFilter::excluding(sender.user_id))
        {
            debug!(circle = %circle_id, error = %e, "Typing indicator dropped");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circles_repo::MemoryCirclesRepository;
    use crate::circles::{Circle, CircleMember, CircleSettings, MemberStatus};
    use crate::hub::Hub;
    use crate::protocol::MessageKind;
    use crate::users_repo::MemoryUsersRepository;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Fixture {
        router: MessageRouter,
        hub: HubHandle,
        circles: Arc<MemoryCirclesRepository>,
    }

    fn fixture() -> Fixture {
        let users = Arc::new(MemoryUsersRepository::new());
        let circles = Arc::new(MemoryCirclesRepository::new());
        let hub = Hub::spawn(users, CancellationToken::new());
        Fixture {
            router: MessageRouter::new(hub.clone(), circles.clone()),
            hub,
            circles,
        }
    }

    fn circle_with(circles: &MemoryCirclesRepository, members: &[Uuid], messaging: bool) -> Uuid {
        let id = Uuid::new_v4();
        circles.insert(Circle {
            id,
            name: "C".to_string(),
            admin_user_id: members[0],
            members: members
                .iter()
                .map(|m| CircleMember {
                    user_id: *m,
                    status: MemberStatus::Active,
                    joined_at: Utc::now(),
                })
                .collect(),
            settings: CircleSettings {
                messaging,
                ..CircleSettings::default()
            },
            created_at: Utc::now(),
        });
        id
    }

    async fn register(hub: &HubHandle, user: Uuid, circle: Uuid) -> (Arc<ClientHandle>, flume::Receiver<Frame>) {
        let (tx, rx) = flume::bounded(16);
        let client = ClientHandle::new(user, vec![circle], tx);
        hub.register(client.clone()).await;
        for _ in 0..100 {
            if hub.is_user_online(user).await {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        while rx.try_recv().is_ok() {}
        (client, rx)
    }

    #[tokio::test]
    async fn message_reaches_peers_but_not_sender() {
        let f = fixture();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let circle = circle_with(&f.circles, &[alice, bob], true);
        let (alice_client, alice_rx) = register(&f.hub, alice, circle).await;
        let (_bob_client, bob_rx) = register(&f.hub, bob, circle).await;
        while alice_rx.try_recv().is_ok() {}

        f.router
            .handle_send(
                &alice_client,
                SendMessageRequest {
                    circle_id: circle,
                    kind: MessageKind::Text,
                    content: "on my way".to_string(),
                },
            )
            .await
            .unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv_async())
            .await
            .expect("message delivered")
            .unwrap();
        assert_eq!(frame.kind, FrameType::NewMessage);
        assert_eq!(frame.data["content"], "on my way");
        assert!(alice_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn foreign_circle_is_rejected() {
        let f = fixture();
        let alice = Uuid::new_v4();
        let circle = circle_with(&f.circles, &[alice], true);
        let (client, _rx) = register(&f.hub, alice, circle).await;

        let err = f
            .router
            .handle_send(
                &client,
                SendMessageRequest {
                    circle_id: Uuid::new_v4(),
                    kind: MessageKind::Text,
                    content: "hi".to_string(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, FrameError::CircleNotFound(_)));
    }

    #[tokio::test]
    async fn disabled_messaging_swallows_fanout() {
        let f = fixture();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let circle = circle_with(&f.circles, &[alice, bob], false);
        let (alice_client, _alice_rx) = register(&f.hub, alice, circle).await;
        let (_bob_client, bob_rx) = register(&f.hub, bob, circle).await;

        f.router
            .handle_send(
                &alice_client,
                SendMessageRequest {
                    circle_id: circle,
                    kind: MessageKind::Text,
                    content: "hi".to_string(),
                },
            )
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(bob_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn typing_indicator_excludes_typist() {
        let f = fixture();
        let alice = Uuid::new_v4();
        let bob = Uuid::new_v4();
        let circle = circle_with(&f.circles, &[alice, bob], true);
        let (alice_client, alice_rx) = register(&f.hub, alice, circle).await;
        let (_bob_client, bob_rx) = register(&f.hub, bob, circle).await;
        while alice_rx.try_recv().is_ok() {}

        f.router.handle_typing(&alice_client, circle, true).unwrap();

        let frame = tokio::time::timeout(Duration::from_secs(1), bob_rx.recv_async())
            .await
            .expect("indicator delivered")
            .unwrap();
        assert_eq!(frame.kind, FrameType::TypingIndicator);
        assert_eq!(frame.data["typing"], true);
        assert!(alice_rx.try_recv().is_err());
    }
}
