//! Per-client websocket session: read and write pumps sharing a
//! cancellation token, an auth gate, and the protocol dispatch table.
//!
//! The state machine is strictly one-way: Authenticating -> Authenticated
//! -> Closing. Before authentication only `auth` frames are accepted;
//! everything else is answered with `UNAUTHORIZED` and the socket stays
//! open.

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use futures_util::stream::{SplitSink, SplitStream};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::auth::DynTokenValidator;
use crate::circles_repo::DynCirclesRepo;
use crate::config::{RateConfig, WsConfig};
use crate::emergency::EmergencyAlerts;
use crate::error::FrameError;
use crate::hub::{ClientHandle, HubHandle};
use crate::location_worker::LocationWorkerHandle;
use crate::messages::MessageRouter;
use crate::protocol::{
    AuthRequest, EmergencyAlertRequest, ErrorCode, Frame, FrameType, LocationUpdateRequest,
    SendMessageRequest, TypingRequest,
};
use crate::rate_limiter::RateLimiter;

/// After this many consecutive unanswered control pings the write pump
/// closes the connection.
const MAX_PING_FAILURES: u32 = 3;

/// Everything a connection needs from the rest of the system.
pub struct ConnectionContext {
    pub hub: HubHandle,
    pub validator: DynTokenValidator,
    pub circles_repo: DynCirclesRepo,
    pub location_worker: LocationWorkerHandle,
    pub messages: Arc<MessageRouter>,
    pub emergency: Arc<EmergencyAlerts>,
    pub ws: WsConfig,
    pub rate: RateConfig,
    pub shutdown: CancellationToken,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Authenticating,
    Authenticated,
    Closing,
}

struct Session {
    state: ConnState,
    client: Option<Arc<ClientHandle>>,
    limiter: RateLimiter,
}

/// Entry point from the websocket upgrade handler. Returns when the
/// connection is gone and fully cleaned up.
pub async fn handle_socket(socket: WebSocket, ctx: Arc<ConnectionContext>) {
    let connection_id = Uuid::new_v4();
    let cancel = ctx.shutdown.child_token();
    let (send_tx, send_rx) = flume::bounded::<Frame>(ctx.ws.send_buffer);
    let ping_fail = Arc::new(AtomicU32::new(0));

    metrics::gauge!("ws.connections.active").increment(1.0);
    metrics::counter!("ws.connections.accepted_total").increment(1);
    info!(connection = %connection_id, "WebSocket connection established");

    // Pre-auth greeting; nothing else flows until the auth frame.
    let _ = send_tx.try_send(Frame::connection_status(connection_id, "connected"));

    let (ws_sink, ws_stream) = socket.split();

    let writer = tokio::spawn(write_pump(
        ws_sink,
        send_rx,
        ctx.ws.clone(),
        cancel.clone(),
        ping_fail.clone(),
    ));
    let reader = tokio::spawn(read_pump(
        ws_stream,
        send_tx,
        ctx.clone(),
        connection_id,
        cancel.clone(),
        ping_fail,
    ));

    // Either pump ending tears the whole session down.
    let _ = tokio::join!(reader, writer);

    metrics::gauge!("ws.connections.active").decrement(1.0);
    metrics::counter!("ws.connections.closed_total").increment(1);
    info!(connection = %connection_id, "WebSocket connection closed");
}

/// Read pump: owns the session state. The read deadline is the pong wait;
/// any inbound traffic resets it.
async fn read_pump(
    mut stream: SplitStream<WebSocket>,
    send_tx: flume::Sender<Frame>,
    ctx: Arc<ConnectionContext>,
    connection_id: Uuid,
    cancel: CancellationToken,
    ping_fail: Arc<AtomicU32>,
) {
    let mut session = Session {
        state: ConnState::Authenticating,
        client: None,
        limiter: RateLimiter::per_minute(ctx.rate.requests_per_minute),
    };

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            next = tokio::time::timeout(ctx.ws.pong_wait(), stream.next()) => match next {
                Err(_) => {
                    info!(connection = %connection_id, "Read deadline expired, closing");
                    metrics::counter!("ws.read_deadline_expired_total").increment(1);
                    break;
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    debug!(connection = %connection_id, error = %e, "WebSocket read error");
                    break;
                }
                Ok(Some(Ok(msg))) => msg,
            }
        };

        if let Some(client) = &session.client {
            client.touch();
        }

        match msg {
            Message::Pong(_) => {
                ping_fail.store(0, Ordering::SeqCst);
            }
            // The transport answers control pings on its own.
            Message::Ping(_) => {}
            Message::Close(_) => {
                debug!(connection = %connection_id, "Client closed connection");
                break;
            }
            Message::Text(text) => {
                if text.len() > ctx.ws.max_frame_bytes {
                    metrics::counter!("ws.frames.oversize_total").increment(1);
                    send_or_drop(
                        &send_tx,
                        Frame::error(ErrorCode::InvalidMessage, "frame too large", None),
                    );
                    continue;
                }
                handle_text(&text, &mut session, &send_tx, &ctx, connection_id, &cancel).await;
            }
            Message::Binary(_) => {
                send_or_drop(
                    &send_tx,
                    Frame::error(ErrorCode::InvalidMessage, "binary frames not supported", None),
                );
            }
        }
    }

    // Cleanup is idempotent: deactivate flags the handle dead, the hub
    // unregister of an unknown connection is a no-op.
    session.state = ConnState::Closing;
    if let Some(client) = session.client.take() {
        client.deactivate();
        ctx.hub.unregister(client.id).await;
    }
    cancel.cancel();
}

/// Write pump: serializes outbound frames and keeps the control-ping
/// schedule at 90% of the pong deadline.
async fn write_pump(
    mut sink: SplitSink<WebSocket, Message>,
    send_rx: flume::Receiver<Frame>,
    ws: WsConfig,
    cancel: CancellationToken,
    ping_fail: Arc<AtomicU32>,
) {
    let mut ping = tokio::time::interval(ws.ping_interval());
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ping.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break;
            }
            _ = ping.tick() => {
                let sent = tokio::time::timeout(
                    ws.write_wait(),
                    sink.send(Message::Ping(Vec::new().into())),
                )
                .await;
                if !matches!(sent, Ok(Ok(()))) {
                    let failures = ping_fail.fetch_add(1, Ordering::SeqCst) + 1;
                    warn!(failures, "Control ping failed");
                    if failures >= MAX_PING_FAILURES {
                        break;
                    }
                }
            }
            frame = send_rx.recv_async() => match frame {
                Ok(frame) => {
                    let json = frame.to_json();
                    let sent = tokio::time::timeout(
                        ws.write_wait(),
                        sink.send(Message::Text(json.into())),
                    )
                    .await;
                    match sent {
                        Ok(Ok(())) => {
                            metrics::counter!("ws.messages.sent_total").increment(1);
                        }
                        Ok(Err(e)) => {
                            debug!(error = %e, "WebSocket write failed");
                            break;
                        }
                        Err(_) => {
                            debug!("WebSocket write deadline expired");
                            break;
                        }
                    }
                }
                Err(_) => break,
            }
        }
    }
    cancel.cancel();
}

async fn handle_text(
    text: &str,
    session: &mut Session,
    send_tx: &flume::Sender<Frame>,
    ctx: &Arc<ConnectionContext>,
    connection_id: Uuid,
    cancel: &CancellationToken,
) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            metrics::counter!("ws.frames.invalid_total").increment(1);
            send_or_drop(
                send_tx,
                Frame::error(ErrorCode::InvalidMessage, format!("malformed frame: {e}"), None),
            );
            return;
        }
    };
    let request_id = frame.request_id.clone();

    // Frame-level ping is answered regardless of auth state.
    if frame.kind == FrameType::Ping {
        send_or_drop(send_tx, Frame::pong(request_id));
        return;
    }

    if session.state != ConnState::Authenticated {
        if frame.kind == FrameType::Auth {
            handle_auth(frame, session, send_tx, ctx, connection_id, cancel).await;
        } else {
            send_or_drop(
                send_tx,
                Frame::error(ErrorCode::Unauthorized, "authentication required", request_id),
            );
        }
        return;
    }

    let result = match frame.kind {
        FrameType::Auth => Err(FrameError::InvalidMessage(
            "already authenticated".to_string(),
        )),
        FrameType::LocationUpdateRequest => {
            handle_location_update(frame, session, ctx).await.map(|()| true)
        }
        FrameType::SendMessageRequest => {
            handle_send_message(frame, session, ctx).await.map(|()| true)
        }
        FrameType::EmergencyAlertRequest => {
            handle_emergency(frame, session, ctx).await.map(|()| true)
        }
        FrameType::TypingStartRequest => handle_typing(frame, session, ctx, true).map(|()| false),
        FrameType::TypingStopRequest => handle_typing(frame, session, ctx, false).map(|()| false),
        _ => Err(FrameError::InvalidMessage(format!(
            "unexpected frame type {:?}",
            frame.kind
        ))),
    };

    match result {
        Ok(true) => send_or_drop(send_tx, Frame::success(request_id)),
        Ok(false) => {}
        Err(err) => send_or_drop(send_tx, error_reply(err, request_id)),
    }
}

async fn handle_auth(
    frame: Frame,
    session: &mut Session,
    send_tx: &flume::Sender<Frame>,
    ctx: &Arc<ConnectionContext>,
    connection_id: Uuid,
    cancel: &CancellationToken,
) {
    let request_id = frame.request_id;
    let req: AuthRequest = match serde_json::from_value(frame.data) {
        Ok(req) => req,
        Err(_) => {
            send_or_drop(
                send_tx,
                Frame::error(ErrorCode::InvalidMessage, "auth frame requires a token", request_id),
            );
            return;
        }
    };

    let auth = match ctx.validator.validate(&req.token).await {
        Ok(auth) => auth,
        Err(e) => {
            debug!(connection = %connection_id, error = %e, "Token validation failed");
            metrics::counter!("ws.auth.failed_total").increment(1);
            send_or_drop(
                send_tx,
                Frame::error(ErrorCode::Unauthorized, "invalid token", request_id),
            );
            return;
        }
    };

    let circles = match ctx.circles_repo.list_for_user(auth.user_id).await {
        Ok(circles) => circles,
        Err(e) => {
            warn!(user = %auth.user_id, error = %e, "Failed to load circles during auth");
            send_or_drop(
                send_tx,
                Frame::error(ErrorCode::ConnectionLost, "could not load circles", request_id),
            );
            return;
        }
    };
    let circle_ids: Vec<Uuid> = circles.iter().map(|c| c.id).collect();

    let client = ClientHandle::for_connection(
        connection_id,
        auth.user_id,
        circle_ids.clone(),
        send_tx.clone(),
        cancel.clone(),
    );
    ctx.hub.register(client.clone()).await;
    session.client = Some(client);
    session.state = ConnState::Authenticated;

    metrics::counter!("ws.auth.succeeded_total").increment(1);
    info!(connection = %connection_id, user = %auth.user_id, "Connection authenticated");
    send_or_drop(
        send_tx,
        Frame::new(
            FrameType::Auth,
            json!({
                "success": true,
                "userId": auth.user_id,
                "circleIds": circle_ids,
            }),
        )
        .replying_to(request_id),
    );
}

async fn handle_location_update(
    frame: Frame,
    session: &mut Session,
    ctx: &Arc<ConnectionContext>,
) -> Result<(), FrameError> {
    if !session.limiter.allow("location_update") {
        return Err(FrameError::RateLimited {
            action: "location_update",
        });
    }
    let client = session.client.as_ref().expect("authenticated session");

    let req: LocationUpdateRequest = serde_json::from_value(frame.data)
        .map_err(|e| FrameError::InvalidMessage(format!("bad location payload: {e}")))?;
    let sample = req.into_sample(client.user_id);
    sample
        .validate()
        .map_err(|reason| FrameError::InvalidLocation(reason.to_string()))?;

    // A full ingest queue is overload shedding, not a client error: the
    // drop is counted and the frame still acks.
    if let Err(e) = ctx.location_worker.submit(sample) {
        debug!(user = %client.user_id, error = %e, "Location submission shed");
    }
    Ok(())
}

async fn handle_send_message(
    frame: Frame,
    session: &mut Session,
    ctx: &Arc<ConnectionContext>,
) -> Result<(), FrameError> {
    if !session.limiter.allow("send_message") {
        return Err(FrameError::RateLimited {
            action: "send_message",
        });
    }
    let client = session.client.as_ref().expect("authenticated session");
    let req: SendMessageRequest = serde_json::from_value(frame.data)
        .map_err(|e| FrameError::InvalidMessage(format!("bad message payload: {e}")))?;
    ctx.messages.handle_send(client, req).await
}

async fn handle_emergency(
    frame: Frame,
    session: &mut Session,
    ctx: &Arc<ConnectionContext>,
) -> Result<(), FrameError> {
    if !session.limiter.allow("emergency_alert") {
        return Err(FrameError::RateLimited {
            action: "emergency_alert",
        });
    }
    let client = session.client.as_ref().expect("authenticated session");
    let req: EmergencyAlertRequest = serde_json::from_value(frame.data)
        .map_err(|e| FrameError::InvalidMessage(format!("bad emergency payload: {e}")))?;
    ctx.emergency.raise(client.user_id, req).await.map(|_| ())
}

fn handle_typing(
    frame: Frame,
    session: &mut Session,
    ctx: &Arc<ConnectionContext>,
    typing: bool,
) -> Result<(), FrameError> {
    if !session.limiter.allow("typing") {
        return Err(FrameError::RateLimited { action: "typing" });
    }
    let client = session.client.as_ref().expect("authenticated session");
    let req: TypingRequest = serde_json::from_value(frame.data)
        .map_err(|e| FrameError::InvalidMessage(format!("bad typing payload: {e}")))?;
    ctx.messages.handle_typing(client, req.circle_id, typing)
}

fn error_reply(err: FrameError, request_id: Option<String>) -> Frame {
    let (code, message) = match &err {
        FrameError::InvalidMessage(m) => (ErrorCode::InvalidMessage, m.clone()),
        FrameError::InvalidLocation(m) => (ErrorCode::InvalidLocation, m.clone()),
        FrameError::Unauthorized => (ErrorCode::Unauthorized, "not authenticated".to_string()),
        FrameError::RateLimited { action } => (
            ErrorCode::RateLimit,
            format!("rate limit exceeded for {action}"),
        ),
        FrameError::CircleNotFound(id) => {
            (ErrorCode::CircleNotFound, format!("circle {id} not found"))
        }
        FrameError::UserNotFound(id) => (ErrorCode::UserNotFound, format!("user {id} not found")),
    };
    metrics::counter!("ws.errors.sent_total").increment(1);
    Frame::error(code, message, request_id)
}

/// Outbound replies share the bounded send buffer with broadcasts; if the
/// client cannot even keep up with its own acks, they drop too.
fn send_or_drop(send_tx: &flume::Sender<Frame>, frame: Frame) {
    if send_tx.try_send(frame).is_err() {
        metrics::counter!("ws.frames.dropped_total").increment(1);
    }
}
