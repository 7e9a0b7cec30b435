// Wire envelope and message bodies for the tandem-sync.v1 protocol.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use crate::change::Change;
use crate::lock::LockSignal;
use crate::presence::PresenceState;

pub const PROTOCOL_VERSION: &str = "tandem-sync.v1";
pub const SUPPORTED_PROTOCOL_VERSIONS: &[&str] = &[PROTOCOL_VERSION];

#[must_use]
pub fn is_supported_protocol_version(version: &str) -> bool {
    SUPPORTED_PROTOCOL_VERSIONS.contains(&version)
}

/// Room that carries presence updates for every connected user.
pub const PRESENCE_CHANNEL: &str = "user-presence";
/// Room that carries advisory lock signals.
pub const LOCKS_CHANNEL: &str = "edit-locks";

/// Room name for one entity's change traffic.
#[must_use]
pub fn entity_channel(entity_type: &str, entity_id: &str) -> String {
    format!("sync:{entity_type}:{entity_id}")
}

/// One frame on the wire. Every message shares this envelope; the body
/// enum supplies the `type` and `payload` keys.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    #[serde(flatten)]
    pub body: MessageBody,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    /// Globally unique; receivers use it for deduplication and ping/pong
    /// pairing.
    pub message_id: Uuid,
}

/// All message types in the tandem-sync.v1 protocol.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "snake_case")]
pub enum MessageBody {
    /// Bidirectional: one entity change, rebroadcast verbatim by the hub.
    Update(UpdatePayload),

    /// Bidirectional: presence announcement, fanned out on the
    /// user-presence room.
    Presence(PresenceState),

    /// Bidirectional: ephemeral activity signal for a room.
    Activity(ActivityPayload),

    /// Bidirectional: advisory lock signal, fanned out on the edit-locks
    /// room. The hub does not enforce exclusivity.
    Lock(LockSignal),

    /// Bidirectional: a comment, rebroadcast verbatim.
    Comment(CommentPayload),

    /// Server -> Client: error report.
    Error(ErrorPayload),

    /// Bidirectional: heartbeat probe, answered directly with `pong`.
    Ping(PingPayload),

    /// Bidirectional: heartbeat answer, paired by the ping's message id.
    Pong(PongPayload),

    /// Bidirectional: snapshot request or snapshot delivery; also the
    /// server's welcome frame.
    Sync(SyncPayload),

    /// Client -> Server: join the room named by the envelope channel.
    Subscribe,

    /// Client -> Server: leave the room named by the envelope channel.
    Unsubscribe,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UpdatePayload {
    pub change: Change,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ActivityPayload {
    pub action: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CommentPayload {
    pub comment_id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub body: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ErrorPayload {
    pub code: String,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PingPayload {
    pub sent_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PongPayload {
    pub ping_id: Uuid,
}

/// `sync` payload. The hub's welcome frame sets `client_id` and
/// `protocol`; engines request snapshots with `request_sync = true`;
/// collaborators answer with `snapshot` set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SyncPayload {
    #[serde(default)]
    pub request_sync: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub protocol: Option<String>,
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("failed to encode message: {0}")]
    Encode(#[source] serde_json::Error),
    #[error("failed to decode message: {0}")]
    Decode(#[source] serde_json::Error),
}

impl Envelope {
    /// Fresh envelope with a new message id and the current time. Channel
    /// and user are attached with the `with_*` builders where relevant.
    pub fn new(body: MessageBody) -> Self {
        Self {
            body,
            channel: None,
            timestamp: Utc::now(),
            user_id: None,
            message_id: Uuid::new_v4(),
        }
    }

    #[must_use]
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    #[must_use]
    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = Some(user_id.into());
        self
    }

    /// Wire name of the message type, for logging.
    pub fn message_type(&self) -> &'static str {
        match &self.body {
            MessageBody::Update(_) => "update",
            MessageBody::Presence(_) => "presence",
            MessageBody::Activity(_) => "activity",
            MessageBody::Lock(_) => "lock",
            MessageBody::Comment(_) => "comment",
            MessageBody::Error(_) => "error",
            MessageBody::Ping(_) => "ping",
            MessageBody::Pong(_) => "pong",
            MessageBody::Sync(_) => "sync",
            MessageBody::Subscribe => "subscribe",
            MessageBody::Unsubscribe => "unsubscribe",
        }
    }

    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
