// Presence payloads: who is online, where, and what they are doing.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Activity value on synthetic presence events emitted when a user
/// enters a room.
pub const USER_JOINED: &str = "user-joined";
/// Activity value on synthetic presence events emitted when a user
/// leaves a room.
pub const USER_LEFT: &str = "user-left";

/// Payload of a `presence` message.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PresenceState {
    pub user_id: String,
    pub username: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    pub status: PresenceStatus,
    pub last_seen: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_location: Option<Location>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mouse_position: Option<MousePosition>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PresenceStatus {
    Online,
    Away,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Location {
    pub page: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub section: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct MousePosition {
    pub x: f64,
    pub y: f64,
}

impl PresenceState {
    /// Minimal presence record for a user the server has never heard
    /// announce themselves.
    pub fn bare(user_id: impl Into<String>, status: PresenceStatus, now: DateTime<Utc>) -> Self {
        let user_id = user_id.into();
        Self {
            username: user_id.clone(),
            user_id,
            avatar: None,
            status,
            last_seen: now,
            current_location: None,
            activity: None,
            mouse_position: None,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
