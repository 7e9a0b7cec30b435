// Advisory lock table.
//
// Locks coordinate users across the hub, not threads within a process.
// Expiry is lazy: an expired lock stays in the table until the next
// operation observes it. Time is always passed in explicitly.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};

use tandem_common::lock::EntityLock;

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct LockTable {
    locks: HashMap<(String, String), EntityLock>,
    timeout: Duration,
}

impl LockTable {
    pub fn new(timeout: Duration) -> Self {
        Self { locks: HashMap::new(), timeout }
    }

    /// Take the lock for `user_id`, or return None when another user
    /// holds it and it has not expired. The owner may re-acquire,
    /// which refreshes the expiry.
    pub fn acquire(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Option<EntityLock> {
        if let Some(existing) = self.locks.get(&key(entity_type, entity_id)) {
            if !existing.is_expired_at(now) && existing.locked_by != user_id {
                return None;
            }
        }
        let lock = EntityLock {
            entity_id: entity_id.to_string(),
            entity_type: entity_type.to_string(),
            locked_by: user_id.to_string(),
            locked_at: now,
            expires_at: now + self.expiry_delta(),
            renewable: true,
        };
        self.locks.insert(key(entity_type, entity_id), lock.clone());
        Some(lock)
    }

    /// Extend the expiry if `user_id` still holds the lock.
    pub fn renew(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Option<EntityLock> {
        let delta = self.expiry_delta();
        let lock = self.locks.get_mut(&key(entity_type, entity_id))?;
        if lock.locked_by != user_id {
            return None;
        }
        lock.expires_at = now + delta;
        Some(lock.clone())
    }

    /// Remove the lock if `user_id` owns it; a no-op otherwise.
    pub fn release(&mut self, entity_type: &str, entity_id: &str, user_id: &str) -> Option<EntityLock> {
        let entry = key(entity_type, entity_id);
        match self.locks.get(&entry) {
            Some(lock) if lock.locked_by == user_id => self.locks.remove(&entry),
            _ => None,
        }
    }

    /// Whether the entity is locked against `user_id`: held by someone
    /// else and not yet expired.
    pub fn blocks(&self, entity_type: &str, entity_id: &str, user_id: &str, now: DateTime<Utc>) -> bool {
        self.locks
            .get(&key(entity_type, entity_id))
            .is_some_and(|lock| !lock.is_expired_at(now) && lock.locked_by != user_id)
    }

    pub fn held_by(&self, entity_type: &str, entity_id: &str, user_id: &str, now: DateTime<Utc>) -> bool {
        self.locks
            .get(&key(entity_type, entity_id))
            .is_some_and(|lock| lock.is_held_by(user_id, now))
    }

    pub fn get(&self, entity_type: &str, entity_id: &str) -> Option<&EntityLock> {
        self.locks.get(&key(entity_type, entity_id))
    }

    /// Record a lock announced by a peer. Signals arrive serialized
    /// through the hub, so the latest announcement wins.
    pub fn store(&mut self, lock: EntityLock) {
        self.locks.insert(key(&lock.entity_type, &lock.entity_id), lock);
    }

    /// Drop a lock a peer announced as released, if they still hold it.
    pub fn remove_released(&mut self, entity_type: &str, entity_id: &str, locked_by: &str) {
        let entry = key(entity_type, entity_id);
        if self.locks.get(&entry).is_some_and(|lock| lock.locked_by == locked_by) {
            self.locks.remove(&entry);
        }
    }

    fn expiry_delta(&self) -> TimeDelta {
        TimeDelta::milliseconds(self.timeout.as_millis() as i64)
    }
}

impl Default for LockTable {
    fn default() -> Self {
        Self::new(DEFAULT_LOCK_TIMEOUT)
    }
}

fn key(entity_type: &str, entity_id: &str) -> (String, String) {
    (entity_type.to_string(), entity_id.to_string())
}

// ── Tests ───────────────────────────────────────────────────────────
