// WebSocket endpoint and frame routing.
//
// Every accepted socket is assigned a v4 client id and greeted with a
// welcome `sync` frame carrying that id and the protocol version. The
// socket task then pumps an outbound queue and the socket side by side;
// inbound frames are routed to rooms here. Malformed text is logged and
// dropped without closing the connection.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::Utc;
use tandem_common::presence::{PresenceState, PresenceStatus, USER_JOINED, USER_LEFT};
use tandem_common::protocol::{
    Envelope, MessageBody, PongPayload, SyncPayload, LOCKS_CHANNEL, PRESENCE_CHANNEL,
    PROTOCOL_VERSION,
};
use tokio::sync::mpsc;
use tower_http::cors::CorsLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clients::Outbound;
use crate::HubState;

/// Build the hub router: the WebSocket endpoint plus a health probe.
pub fn router(state: HubState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

async fn healthz() -> &'static str {
    "ok"
}

async fn ws_upgrade(State(state): State<HubState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: HubState, mut socket: WebSocket) {
    let client_id = Uuid::new_v4();
    let (outbound_sender, mut outbound_receiver) = mpsc::unbounded_channel();
    state.clients.register(client_id, outbound_sender, Utc::now()).await;
    info!(client_id = %client_id, "client connected");

    // Welcome frame: the assigned id plus the protocol the hub speaks.
    let welcome = Envelope::new(MessageBody::Sync(SyncPayload {
        client_id: Some(client_id),
        protocol: Some(PROTOCOL_VERSION.to_owned()),
        ..SyncPayload::default()
    }));
    if send_frame(&mut socket, &welcome).await.is_err() {
        disconnect_client(&state, client_id).await;
        return;
    }

    loop {
        tokio::select! {
            maybe_outbound = outbound_receiver.recv() => {
                match maybe_outbound {
                    Some(Outbound::Frame(envelope)) => {
                        if send_frame(&mut socket, &envelope).await.is_err() {
                            break;
                        }
                    }
                    Some(Outbound::Close) => {
                        let _ = socket.send(Message::Close(None)).await;
                        break;
                    }
                    // Record dropped out from under us.
                    None => break,
                }
            }
            maybe_inbound = socket.recv() => {
                match maybe_inbound {
                    Some(Ok(Message::Text(raw))) => {
                        match Envelope::decode(&raw) {
                            Ok(envelope) => {
                                state
                                    .clients
                                    .touch(client_id, envelope.user_id.as_deref(), Utc::now())
                                    .await;
                                route_frame(&state, client_id, envelope).await;
                            }
                            Err(error) => {
                                // Dropped, but still counts as activity.
                                warn!(client_id = %client_id, %error, "dropping malformed frame");
                                state.clients.touch(client_id, None, Utc::now()).await;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        if socket.send(Message::Pong(payload)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.clients.touch(client_id, None, Utc::now()).await;
                    }
                    Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                    Some(Err(error)) => {
                        debug!(client_id = %client_id, %error, "socket error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }

    disconnect_client(&state, client_id).await;
}

async fn send_frame(socket: &mut WebSocket, envelope: &Envelope) -> Result<(), axum::Error> {
    match envelope.encode() {
        Ok(text) => socket.send(Message::Text(text.into())).await,
        Err(error) => {
            warn!(%error, "failed to encode outbound frame");
            Ok(())
        }
    }
}

/// Route one decoded frame from `sender`.
///
/// - `subscribe`/`unsubscribe` manage room membership and announce the
///   change to the remaining members.
/// - `update`, `comment`, `activity`, and `sync` fan out verbatim to the
///   frame's channel, excluding the sender.
/// - `presence` updates the presence map and fans out to the presence
///   room; `lock` fans out to the locks room.
/// - `ping` is answered directly with a `pong`; nothing is broadcast.
pub(crate) async fn route_frame(state: &HubState, sender: Uuid, envelope: Envelope) {
    match &envelope.body {
        MessageBody::Subscribe => {
            let Some(channel) = envelope.channel.as_deref() else {
                warn!(client_id = %sender, "subscribe without a channel");
                return;
            };
            if state.rooms.join(channel, sender).await {
                debug!(client_id = %sender, channel, "joined room");
                if let Some(user_id) = state.clients.user_of(sender).await {
                    announce_membership(state, sender, channel, &user_id, USER_JOINED).await;
                }
            }
        }
        MessageBody::Unsubscribe => {
            let Some(channel) = envelope.channel.as_deref() else {
                warn!(client_id = %sender, "unsubscribe without a channel");
                return;
            };
            if state.rooms.leave(channel, sender).await {
                debug!(client_id = %sender, channel, "left room");
                if let Some(user_id) = state.clients.user_of(sender).await {
                    announce_membership(state, sender, channel, &user_id, USER_LEFT).await;
                }
            }
        }
        MessageBody::Update(_)
        | MessageBody::Comment(_)
        | MessageBody::Activity(_)
        | MessageBody::Sync(_) => {
            let Some(channel) = envelope.channel.as_deref() else {
                warn!(client_id = %sender, kind = envelope.message_type(), "frame without a channel");
                return;
            };
            let recipients = state.rooms.members_excluding(channel, sender).await;
            let delivered = state.clients.send_to_each(&recipients, &envelope).await;
            debug!(
                client_id = %sender,
                channel,
                kind = envelope.message_type(),
                delivered,
                "rebroadcast frame"
            );
        }
        MessageBody::Presence(presence) => {
            state.presence.update(presence.clone()).await;
            let recipients = state.rooms.members(PRESENCE_CHANNEL).await;
            let delivered = state.clients.send_to_each(&recipients, &envelope).await;
            debug!(user_id = %presence.user_id, delivered, "presence update");
        }
        MessageBody::Lock(signal) => {
            let recipients = state.rooms.members(LOCKS_CHANNEL).await;
            let delivered = state.clients.send_to_each(&recipients, &envelope).await;
            debug!(
                entity_type = %signal.entity_type,
                entity_id = %signal.entity_id,
                delivered,
                "lock signal"
            );
        }
        MessageBody::Ping(_) => {
            let pong =
                Envelope::new(MessageBody::Pong(PongPayload { ping_id: envelope.message_id }));
            if !state.clients.send(sender, pong).await {
                debug!(client_id = %sender, "pong undeliverable");
            }
        }
        MessageBody::Pong(_) => {
            // Liveness answer to a sweep ping; activity is already refreshed.
        }
        MessageBody::Error(payload) => {
            warn!(
                client_id = %sender,
                code = %payload.code,
                message = %payload.message,
                "client reported an error"
            );
        }
    }
}

/// Tell the rest of a room that a user entered or left it. Join events
/// read online, leave events offline.
async fn announce_membership(
    state: &HubState,
    about: Uuid,
    channel: &str,
    user_id: &str,
    activity: &'static str,
) {
    let status =
        if activity == USER_LEFT { PresenceStatus::Offline } else { PresenceStatus::Online };
    let mut presence = PresenceState::bare(user_id, status, Utc::now());
    presence.activity = Some(activity.to_owned());

    let event = Envelope::new(MessageBody::Presence(presence)).with_channel(channel);
    let recipients = state.rooms.members_excluding(channel, about).await;
    let delivered = state.clients.send_to_each(&recipients, &event).await;
    debug!(channel, user_id, activity, delivered, "membership change");
}

/// Tear down a departed client: leave every room (announcing each exit),
/// mark the user offline and broadcast that, then drop the record.
pub(crate) async fn disconnect_client(state: &HubState, client_id: Uuid) {
    let user_id = state.clients.user_of(client_id).await;
    let channels = state.rooms.leave_all(client_id).await;

    if let Some(user_id) = &user_id {
        for channel in &channels {
            announce_membership(state, client_id, channel, user_id, USER_LEFT).await;
        }

        let offline = state.presence.mark_offline(user_id, Utc::now()).await;
        let event = Envelope::new(MessageBody::Presence(offline)).with_channel(PRESENCE_CHANNEL);
        let recipients = state.rooms.members(PRESENCE_CHANNEL).await;
        state.clients.send_to_each(&recipients, &event).await;
    }

    if let Some(record) = state.clients.remove(client_id).await {
        let connected_ms = (Utc::now() - record.connected_at).num_milliseconds();
        info!(client_id = %client_id, connected_ms, "client disconnected");
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
