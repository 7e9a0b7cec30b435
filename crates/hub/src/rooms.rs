// Room membership: channel name → subscribed client ids.
//
// Rooms are created on first subscribe and dropped with their last
// member, so the map only ever holds channels somebody is listening to.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::RwLock;
use uuid::Uuid;

/// Shared map of rooms.
#[derive(Debug, Clone, Default)]
pub struct RoomRegistry {
    rooms: Arc<RwLock<HashMap<String, HashSet<Uuid>>>>,
}

impl RoomRegistry {
    /// Add a client to a room. False when it was already a member.
    pub async fn join(&self, channel: &str, client_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        rooms.entry(channel.to_owned()).or_default().insert(client_id)
    }

    /// Remove a client from a room, dropping the room with its last
    /// member. False when the client was not a member.
    pub async fn leave(&self, channel: &str, client_id: Uuid) -> bool {
        let mut rooms = self.rooms.write().await;
        let Some(members) = rooms.get_mut(channel) else {
            return false;
        };
        let removed = members.remove(&client_id);
        if members.is_empty() {
            rooms.remove(channel);
        }
        removed
    }

    /// Remove a client from every room it is in, returning the channels
    /// it left.
    pub async fn leave_all(&self, client_id: Uuid) -> Vec<String> {
        let mut rooms = self.rooms.write().await;
        let mut left = Vec::new();
        rooms.retain(|channel, members| {
            if members.remove(&client_id) {
                left.push(channel.clone());
            }
            !members.is_empty()
        });
        left
    }

    pub async fn members(&self, channel: &str) -> Vec<Uuid> {
        let rooms = self.rooms.read().await;
        rooms.get(channel).map(|members| members.iter().copied().collect()).unwrap_or_default()
    }

    /// Members of a room except one client, usually the sender.
    pub async fn members_excluding(&self, channel: &str, excluded: Uuid) -> Vec<Uuid> {
        let rooms = self.rooms.read().await;
        rooms
            .get(channel)
            .map(|members| members.iter().copied().filter(|id| *id != excluded).collect())
            .unwrap_or_default()
    }

    pub async fn is_member(&self, channel: &str, client_id: Uuid) -> bool {
        self.rooms.read().await.get(channel).is_some_and(|members| members.contains(&client_id))
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
