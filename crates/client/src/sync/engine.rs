// Synchronization engine core: per-entity change tracking, conflict
// handling, and advisory locks.
//
// The core is synchronous and does no I/O. Every operation takes the
// current time explicitly and returns what should happen next (frames to
// broadcast, conflicts to surface), so the async wrapper stays thin and
// the logic stays testable without a runtime.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use tandem_common::change::{Change, ChangeMetadata, ChangeOperation, ConflictResolution};
use tandem_common::lock::{EntityLock, LockSignal, LockSignalKind};
use tandem_common::protocol::{entity_channel, MessageBody, SyncPayload};

use super::conflict::{
    in_conflict_window, resolve_with_strategy, shallow_overlay, Conflict, ResolutionStrategy,
};
use super::history::{ChangeHistory, DEFAULT_HISTORY_LIMIT};
use super::locks::{LockTable, DEFAULT_LOCK_TIMEOUT};

type EntityKey = (String, String);

fn key(entity_type: &str, entity_id: &str) -> EntityKey {
    (entity_type.to_string(), entity_id.to_string())
}

// ── Configuration ───────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub strategy: ResolutionStrategy,
    /// Settle conflicts immediately per strategy instead of surfacing
    /// them for manual resolution.
    pub auto_resolve: bool,
    /// Wall-clock proximity within which same-path edits conflict.
    pub conflict_window: Duration,
    pub history_limit: usize,
    /// How often tracked entities request a fresh snapshot.
    pub resync_interval: Duration,
    pub lock_timeout: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            strategy: ResolutionStrategy::LastWriteWins,
            auto_resolve: true,
            conflict_window: Duration::from_secs(5),
            history_limit: DEFAULT_HISTORY_LIMIT,
            resync_interval: Duration::from_secs(5),
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }
}

// ── State & outcomes ────────────────────────────────────────────────

/// Tracking state for one entity, created by `start_entity` and
/// destroyed by `stop_entity`.
#[derive(Debug, Clone)]
pub struct SyncState {
    pub version: u64,
    pub last_synced_at: DateTime<Utc>,
    /// Own changes not yet reconciled against a conflict.
    pub local_changes: Vec<Change>,
    /// Peer changes received since the last reconciliation.
    pub remote_changes: Vec<Change>,
    pub conflicts: Vec<Conflict>,
}

impl SyncState {
    fn new(now: DateTime<Utc>) -> Self {
        Self {
            version: 0,
            last_synced_at: now,
            local_changes: Vec::new(),
            remote_changes: Vec::new(),
            conflicts: Vec::new(),
        }
    }
}

/// An unstamped mutation; the engine assigns id, author, version, and
/// timestamp on push.
#[derive(Debug, Clone)]
pub struct ChangeDraft {
    pub entity_type: String,
    pub entity_id: String,
    pub operation: ChangeOperation,
    pub path: String,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl ChangeDraft {
    pub fn update(
        entity_type: impl Into<String>,
        entity_id: impl Into<String>,
        path: impl Into<String>,
        before: Option<Value>,
        after: Option<Value>,
    ) -> Self {
        Self {
            entity_type: entity_type.into(),
            entity_id: entity_id.into(),
            operation: ChangeOperation::Update,
            path: path.into(),
            before,
            after,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct PushOutcome {
    pub change: Change,
    /// Channel the update should be broadcast on.
    pub channel: String,
}

#[derive(Debug)]
pub struct StartOutcome {
    pub channel: String,
    pub snapshot_request: MessageBody,
    /// False when the entity was already tracked.
    pub created: bool,
}

#[derive(Debug)]
pub enum RemoteOutcome {
    /// Authored by this engine; the broadcast came back around.
    Echo,
    /// Already recorded in history.
    Duplicate,
    /// No tracking state for the entity.
    Untracked,
    Applied { change: Change, conflicts: Vec<ConflictOutcome> },
}

#[derive(Debug)]
pub enum ConflictOutcome {
    /// Settled immediately; the reconciling change must be broadcast.
    Auto { conflict: Conflict, reconciling: PushOutcome },
    /// Left open for `resolve_conflict`.
    Surfaced(Conflict),
}

#[derive(Debug)]
pub struct SettledConflict {
    pub conflict: Conflict,
    pub reconciling: PushOutcome,
}

#[derive(Debug, Clone)]
pub struct LockGrant {
    pub lock: EntityLock,
    pub signal: LockSignal,
    /// When the owner should renew: 80% of the lock timeout.
    pub renew_after: Duration,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntitySnapshot {
    pub entity_type: String,
    pub entity_id: String,
    pub snapshot: Value,
}

#[derive(Debug)]
pub struct ResyncRequest {
    pub channel: String,
    pub body: MessageBody,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("entity {entity_type}:{entity_id} is not being tracked")]
    NotTracked { entity_type: String, entity_id: String },
    #[error("conflict {0} not found")]
    ConflictNotFound(Uuid),
    #[error("change {0} not found in history")]
    ChangeNotFound(Uuid),
}

// ── Engine core ─────────────────────────────────────────────────────

#[derive(Debug)]
pub struct EngineCore {
    user_id: String,
    config: EngineConfig,
    states: HashMap<EntityKey, SyncState>,
    history: ChangeHistory,
    locks: LockTable,
}

impl EngineCore {
    pub fn new(user_id: impl Into<String>, config: EngineConfig) -> Self {
        let history = ChangeHistory::new(config.history_limit);
        let locks = LockTable::new(config.lock_timeout);
        Self { user_id: user_id.into(), config, states: HashMap::new(), history, locks }
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn state(&self, entity_type: &str, entity_id: &str) -> Option<&SyncState> {
        self.states.get(&key(entity_type, entity_id))
    }

    pub fn history(&self) -> &ChangeHistory {
        &self.history
    }

    pub fn lock(&self, entity_type: &str, entity_id: &str) -> Option<&EntityLock> {
        self.locks.get(entity_type, entity_id)
    }

    /// Begin tracking an entity. Idempotent: existing state survives.
    pub fn start_entity(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> StartOutcome {
        let entry = key(entity_type, entity_id);
        let created = !self.states.contains_key(&entry);
        self.states.entry(entry).or_insert_with(|| SyncState::new(now));
        StartOutcome {
            channel: entity_channel(entity_type, entity_id),
            snapshot_request: snapshot_request(entity_type, entity_id),
            created,
        }
    }

    /// Stop tracking an entity. History and locks are untouched; the
    /// returned channel should be unsubscribed.
    pub fn stop_entity(&mut self, entity_type: &str, entity_id: &str) -> Option<String> {
        self.states
            .remove(&key(entity_type, entity_id))
            .map(|_| entity_channel(entity_type, entity_id))
    }

    /// Stamp and record a local change. The caller broadcasts the
    /// returned update on the returned channel.
    pub fn push_change(
        &mut self,
        draft: ChangeDraft,
        now: DateTime<Utc>,
    ) -> Result<PushOutcome, EngineError> {
        let entry = key(&draft.entity_type, &draft.entity_id);
        let state = self.states.get_mut(&entry).ok_or_else(|| EngineError::NotTracked {
            entity_type: draft.entity_type.clone(),
            entity_id: draft.entity_id.clone(),
        })?;
        let channel = entity_channel(&draft.entity_type, &draft.entity_id);
        let change = stamp_change(state, &mut self.history, &self.user_id, draft, false, None, now);
        Ok(PushOutcome { change, channel })
    }

    /// Apply a change received from the hub. Echoes of our own changes
    /// and duplicates are ignored; everything else is recorded and run
    /// through conflict detection.
    pub fn apply_remote(&mut self, change: Change, now: DateTime<Utc>) -> RemoteOutcome {
        if change.user_id == self.user_id {
            return RemoteOutcome::Echo;
        }
        if self.history.contains(change.id) {
            return RemoteOutcome::Duplicate;
        }
        let entry = key(&change.entity_type, &change.entity_id);
        let Some(state) = self.states.get_mut(&entry) else {
            return RemoteOutcome::Untracked;
        };
        state.remote_changes.push(change.clone());
        self.history.record(change.clone());

        let detected = self.detect_against(&entry, &change);
        let mut conflicts = Vec::with_capacity(detected.len());
        for conflict in detected {
            if self.config.auto_resolve {
                let held = self.locks.held_by(&entry.0, &entry.1, &self.user_id, now);
                let outcome = resolve_with_strategy(
                    self.config.strategy,
                    &conflict.local_change,
                    &conflict.remote_change,
                    held,
                );
                if let Some(settled) =
                    self.settle_conflict(&entry, conflict, outcome.resolution, outcome.merged_value, now)
                {
                    conflicts.push(ConflictOutcome::Auto {
                        conflict: settled.conflict,
                        reconciling: settled.reconciling,
                    });
                }
            } else {
                if let Some(state) = self.states.get_mut(&entry) {
                    state.conflicts.push(conflict.clone());
                }
                conflicts.push(ConflictOutcome::Surfaced(conflict));
            }
        }
        RemoteOutcome::Applied { change, conflicts }
    }

    /// Settle an open conflict with the caller's chosen outcome.
    pub fn resolve_conflict(
        &mut self,
        conflict_id: Uuid,
        resolution: ConflictResolution,
        merged_value: Option<Value>,
        now: DateTime<Utc>,
    ) -> Result<SettledConflict, EngineError> {
        let mut found: Option<(EntityKey, Conflict)> = None;
        for (entry, state) in self.states.iter_mut() {
            if let Some(pos) = state.conflicts.iter().position(|c| c.id == conflict_id) {
                found = Some((entry.clone(), state.conflicts.remove(pos)));
                break;
            }
        }
        let (entry, conflict) = found.ok_or(EngineError::ConflictNotFound(conflict_id))?;
        self.settle_conflict(&entry, conflict, resolution, merged_value, now).ok_or_else(|| {
            EngineError::NotTracked { entity_type: entry.0.clone(), entity_id: entry.1.clone() }
        })
    }

    /// Push the inverse of a recorded change: before/after swapped,
    /// tagged as an undo. Forward-only compensation, not rollback.
    pub fn undo(&mut self, change_id: Uuid, now: DateTime<Utc>) -> Result<PushOutcome, EngineError> {
        let original =
            self.history.find(change_id).cloned().ok_or(EngineError::ChangeNotFound(change_id))?;
        let entry = key(&original.entity_type, &original.entity_id);
        let state = self.states.get_mut(&entry).ok_or_else(|| EngineError::NotTracked {
            entity_type: original.entity_type.clone(),
            entity_id: original.entity_id.clone(),
        })?;
        let draft = ChangeDraft {
            entity_type: original.entity_type.clone(),
            entity_id: original.entity_id.clone(),
            operation: original.operation,
            path: original.path.clone(),
            before: original.after.clone(),
            after: original.before.clone(),
        };
        let metadata = ChangeMetadata::undo_of(change_id);
        let change =
            stamp_change(state, &mut self.history, &self.user_id, draft, false, Some(metadata), now);
        Ok(PushOutcome {
            change,
            channel: entity_channel(&original.entity_type, &original.entity_id),
        })
    }

    // ── Locks ───────────────────────────────────────────────────────

    /// Take the advisory lock, or None when a peer holds it.
    pub fn acquire_lock(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Option<LockGrant> {
        let lock = self.locks.acquire(entity_type, entity_id, &self.user_id, now)?;
        Some(self.grant(lock))
    }

    /// Refresh an owned lock's expiry; None once ownership is gone.
    pub fn renew_lock(
        &mut self,
        entity_type: &str,
        entity_id: &str,
        now: DateTime<Utc>,
    ) -> Option<LockGrant> {
        let lock = self.locks.renew(entity_type, entity_id, &self.user_id, now)?;
        Some(self.grant(lock))
    }

    /// Release an owned lock; None (no-op) for non-owners.
    pub fn release_lock(
        &mut self,
        entity_type: &str,
        entity_id: &str,
    ) -> Option<LockSignal> {
        let lock = self.locks.release(entity_type, entity_id, &self.user_id)?;
        Some(LockSignal::released(lock.entity_type, lock.entity_id, lock.locked_by))
    }

    /// Whether the entity is locked against this engine's user.
    /// Expired locks are treated as absent.
    pub fn is_locked(&self, entity_type: &str, entity_id: &str, now: DateTime<Utc>) -> bool {
        self.locks.blocks(entity_type, entity_id, &self.user_id, now)
    }

    /// Fold a peer's lock broadcast into the table.
    pub fn apply_lock_signal(&mut self, signal: &LockSignal) {
        match signal.kind {
            LockSignalKind::LockAcquired => {
                if let Some(lock) = &signal.lock {
                    if lock.locked_by != self.user_id {
                        self.locks.store(lock.clone());
                    }
                }
            }
            LockSignalKind::LockReleased => {
                self.locks.remove_released(
                    &signal.entity_type,
                    &signal.entity_id,
                    &signal.locked_by,
                );
            }
        }
    }

    // ── Periodic work ───────────────────────────────────────────────

    /// One re-sync tick: prune pending changes too old to conflict and
    /// emit a snapshot request per tracked entity.
    pub fn resync_tick(&mut self, now: DateTime<Utc>) -> Vec<ResyncRequest> {
        let window_ms = self.config.conflict_window.as_millis() as i64;
        let stale = |change: &Change| (now - change.timestamp).num_milliseconds() >= window_ms;

        let mut requests = Vec::with_capacity(self.states.len());
        for ((entity_type, entity_id), state) in self.states.iter_mut() {
            state.local_changes.retain(|c| !stale(c));
            state.remote_changes.retain(|c| !stale(c));
            requests.push(ResyncRequest {
                channel: entity_channel(entity_type, entity_id),
                body: snapshot_request(entity_type, entity_id),
            });
        }
        requests
    }

    /// Fold an inbound sync frame into tracking state. Peer snapshot
    /// requests return None; answering them is a storage concern.
    pub fn apply_sync(
        &mut self,
        payload: &SyncPayload,
        now: DateTime<Utc>,
    ) -> Option<EntitySnapshot> {
        if payload.request_sync {
            return None;
        }
        let (Some(entity_type), Some(entity_id)) = (&payload.entity_type, &payload.entity_id)
        else {
            return None;
        };
        let state = self.states.get_mut(&key(entity_type, entity_id))?;
        state.last_synced_at = now;
        payload.snapshot.clone().map(|snapshot| EntitySnapshot {
            entity_type: entity_type.clone(),
            entity_id: entity_id.clone(),
            snapshot,
        })
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Pair the newly arrived remote change against pending local
    /// changes. Reconciling changes never re-enter detection.
    fn detect_against(&self, entry: &EntityKey, remote: &Change) -> Vec<Conflict> {
        if remote.resolved {
            return Vec::new();
        }
        let Some(state) = self.states.get(entry) else {
            return Vec::new();
        };
        let window_ms = self.config.conflict_window.as_millis() as i64;
        state
            .local_changes
            .iter()
            .filter(|local| !local.resolved)
            .filter(|local| in_conflict_window(local, remote, window_ms))
            .filter(|local| {
                !state
                    .conflicts
                    .iter()
                    .any(|c| c.local_change.id == local.id && c.remote_change.id == remote.id)
            })
            .map(|local| Conflict::between(local.clone(), remote.clone(), self.config.strategy))
            .collect()
    }

    fn settle_conflict(
        &mut self,
        entry: &EntityKey,
        mut conflict: Conflict,
        resolution: ConflictResolution,
        merged_value: Option<Value>,
        now: DateTime<Utc>,
    ) -> Option<SettledConflict> {
        let state = self.states.get_mut(entry)?;
        let (before, after) = reconciling_values(&conflict, resolution, merged_value);
        conflict.resolved = true;
        conflict.resolution = Some(resolution);
        if resolution == ConflictResolution::Merged {
            conflict.merged_value = after.clone();
        }
        state.local_changes.retain(|c| c.id != conflict.local_change.id);
        state.remote_changes.retain(|c| c.id != conflict.remote_change.id);

        let draft = ChangeDraft {
            entity_type: conflict.local_change.entity_type.clone(),
            entity_id: conflict.local_change.entity_id.clone(),
            operation: ChangeOperation::Update,
            path: conflict.local_change.path.clone(),
            before,
            after,
        };
        let metadata = ChangeMetadata::resolution_of(conflict.id, resolution);
        let change =
            stamp_change(state, &mut self.history, &self.user_id, draft, true, Some(metadata), now);
        let channel = entity_channel(&change.entity_type, &change.entity_id);
        Some(SettledConflict { conflict, reconciling: PushOutcome { change, channel } })
    }

    fn grant(&self, lock: EntityLock) -> LockGrant {
        LockGrant {
            signal: LockSignal::acquired(lock.clone()),
            lock,
            renew_after: self.config.lock_timeout.mul_f64(0.8),
        }
    }
}

fn stamp_change(
    state: &mut SyncState,
    history: &mut ChangeHistory,
    user_id: &str,
    draft: ChangeDraft,
    resolved: bool,
    metadata: Option<ChangeMetadata>,
    now: DateTime<Utc>,
) -> Change {
    state.version += 1;
    let change = Change {
        id: Uuid::new_v4(),
        entity_type: draft.entity_type,
        entity_id: draft.entity_id,
        user_id: user_id.to_string(),
        operation: draft.operation,
        path: draft.path,
        before: draft.before,
        after: draft.after,
        timestamp: now,
        version: state.version,
        resolved,
        metadata,
    };
    state.local_changes.push(change.clone());
    history.record(change.clone());
    change
}

/// Before/after for the reconciling change: `before` compensates from
/// the losing value, `after` carries the winning one.
fn reconciling_values(
    conflict: &Conflict,
    resolution: ConflictResolution,
    merged_value: Option<Value>,
) -> (Option<Value>, Option<Value>) {
    let local = &conflict.local_change;
    let remote = &conflict.remote_change;
    match resolution {
        ConflictResolution::Local => (remote.after.clone(), local.after.clone()),
        ConflictResolution::Remote => (local.after.clone(), remote.after.clone()),
        ConflictResolution::Merged => {
            let merged =
                merged_value.or_else(|| shallow_overlay(local.after.as_ref(), remote.after.as_ref()));
            (local.after.clone(), merged)
        }
    }
}

fn snapshot_request(entity_type: &str, entity_id: &str) -> MessageBody {
    MessageBody::Sync(SyncPayload {
        request_sync: true,
        entity_type: Some(entity_type.to_string()),
        entity_id: Some(entity_id.to_string()),
        ..Default::default()
    })
}

// ── Tests ───────────────────────────────────────────────────────────
