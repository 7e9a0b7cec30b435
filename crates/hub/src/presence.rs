// Presence map: the latest announced state per user.
//
// Entries are written by inbound `presence` frames and on disconnect;
// they are never dropped, so reconnecting users keep their last state.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tandem_common::presence::{PresenceState, PresenceStatus};
use tokio::sync::RwLock;

/// Shared presence map, keyed by user id.
#[derive(Debug, Clone, Default)]
pub struct PresenceRegistry {
    users: Arc<RwLock<HashMap<String, PresenceState>>>,
}

impl PresenceRegistry {
    /// Store the latest announced state for a user.
    pub async fn update(&self, state: PresenceState) {
        let mut users = self.users.write().await;
        users.insert(state.user_id.clone(), state);
    }

    /// Mark a user offline, stamping when they were last seen, and return
    /// the updated state for rebroadcast. Users the hub never heard
    /// announce themselves get a bare offline record.
    pub async fn mark_offline(&self, user_id: &str, now: DateTime<Utc>) -> PresenceState {
        let mut users = self.users.write().await;
        let state = users
            .entry(user_id.to_owned())
            .or_insert_with(|| PresenceState::bare(user_id, PresenceStatus::Offline, now));
        state.status = PresenceStatus::Offline;
        state.last_seen = now;
        state.clone()
    }

    pub async fn get(&self, user_id: &str) -> Option<PresenceState> {
        self.users.read().await.get(user_id).cloned()
    }

    pub async fn all(&self) -> Vec<PresenceState> {
        self.users.read().await.values().cloned().collect()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
