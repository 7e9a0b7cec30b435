// Advisory entity locks and the wire signals that announce them.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An advisory lock on one entity.
///
/// Expiry is lazy: nothing sweeps locks, holders and observers evaluate
/// `expires_at` against their own clock on access.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EntityLock {
    pub entity_id: String,
    pub entity_type: String,
    pub locked_by: String,
    pub locked_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub renewable: bool,
}

impl EntityLock {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        self.expires_at <= now
    }

    /// True when `user_id` holds this lock and it has not lapsed.
    pub fn is_held_by(&self, user_id: &str, now: DateTime<Utc>) -> bool {
        !self.is_expired_at(now) && self.locked_by == user_id
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum LockSignalKind {
    LockAcquired,
    LockReleased,
}

/// Payload of a `lock` message, broadcast on the edit-locks channel.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct LockSignal {
    #[serde(rename = "type")]
    pub kind: LockSignalKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lock: Option<EntityLock>,
    pub entity_type: String,
    pub entity_id: String,
    pub locked_by: String,
}

impl LockSignal {
    pub fn acquired(lock: EntityLock) -> Self {
        Self {
            kind: LockSignalKind::LockAcquired,
            entity_type: lock.entity_type.clone(),
            entity_id: lock.entity_id.clone(),
            locked_by: lock.locked_by.clone(),
            lock: Some(lock),
        }
    }

    pub fn released(entity_type: String, entity_id: String, locked_by: String) -> Self {
        Self { kind: LockSignalKind::LockReleased, lock: None, entity_type, entity_id, locked_by }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
