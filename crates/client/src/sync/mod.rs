// Synchronization engine: change tracking, conflict handling, and
// advisory locks over a live session.
//
// `SyncEngine` wraps the synchronous `EngineCore` behind an async
// facade. A pump task feeds inbound session frames into the core, a
// re-sync task ticks snapshot requests, and renewal tasks keep owned
// locks alive. The core decides, the wrapper moves frames.

pub mod conflict;
pub mod engine;
pub mod history;
pub mod locks;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, MissedTickBehavior};
use tracing::{debug, warn};
use uuid::Uuid;

use tandem_common::change::{Change, ConflictResolution};
use tandem_common::lock::{EntityLock, LockSignal};
use tandem_common::protocol::{Envelope, MessageBody, UpdatePayload, LOCKS_CHANNEL};

use crate::session::{SessionError, SessionHandle};
use crate::transport::{ConnectionEvent, ConnectionState};

use self::engine::{ConflictOutcome, EngineCore, PushOutcome, RemoteOutcome};

pub use self::conflict::{Conflict, ResolutionStrategy};
pub use self::engine::{ChangeDraft, EngineConfig, EngineError, EntitySnapshot, SyncState};

const SYNC_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Session(#[from] SessionError),
}

/// Notifications fanned out to engine listeners.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    /// A change authored here was recorded and broadcast.
    LocalChange(Change),
    /// A peer change was applied.
    RemoteChange(Change),
    /// A conflict needs `resolve_conflict`.
    ConflictDetected(Conflict),
    /// A conflict settled; the reconciling change was broadcast.
    ConflictResolved { conflict: Conflict, reconciling: Change },
    /// A lock signal arrived from a peer.
    Lock(LockSignal),
    /// A peer answered a snapshot request.
    Snapshot(EntitySnapshot),
}

struct EngineInner {
    core: Mutex<EngineCore>,
    session: SessionHandle,
    events: broadcast::Sender<SyncEvent>,
    /// Renewal task per owned lock, aborted on release.
    renewals: Mutex<HashMap<(String, String), JoinHandle<()>>>,
}

// ── Engine ──────────────────────────────────────────────────────────

/// Async synchronization engine bound to one session.
///
/// Dropping the engine stops its background tasks; running lock
/// renewals lapse on their next wakeup.
pub struct SyncEngine {
    inner: Arc<EngineInner>,
    pump: JoinHandle<()>,
    resync: JoinHandle<()>,
}

impl SyncEngine {
    /// Start the engine over a running session.
    pub fn spawn(
        session: SessionHandle,
        user_id: impl Into<String>,
        config: EngineConfig,
    ) -> Result<Self, SyncError> {
        let period = config.resync_interval;
        let (events, _) = broadcast::channel(SYNC_EVENT_CAPACITY);
        let inner = Arc::new(EngineInner {
            core: Mutex::new(EngineCore::new(user_id, config)),
            session,
            events,
            renewals: Mutex::new(HashMap::new()),
        });

        // Lock signals are engine-wide; entity rooms are joined per
        // start_sync call.
        inner.session.subscribe(LOCKS_CHANNEL)?;

        let frames = inner.session.events();
        let pump = tokio::spawn(pump_frames(Arc::clone(&inner), frames));
        let resync = tokio::spawn(resync_loop(Arc::clone(&inner), period));
        Ok(Self { inner, pump, resync })
    }

    /// New subscription to the engine event stream.
    pub fn events(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Track an entity: join its channel and request a snapshot.
    pub async fn start_sync(&self, entity_type: &str, entity_id: &str) -> Result<(), SyncError> {
        let outcome =
            self.inner.core.lock().await.start_entity(entity_type, entity_id, Utc::now());
        self.inner.session.subscribe(&outcome.channel)?;
        self.inner.session.send(outcome.snapshot_request, Some(outcome.channel)).await?;
        Ok(())
    }

    /// Stop tracking an entity. History and locks survive.
    pub async fn stop_sync(&self, entity_type: &str, entity_id: &str) -> Result<(), SyncError> {
        let channel = self.inner.core.lock().await.stop_entity(entity_type, entity_id);
        if let Some(channel) = channel {
            self.inner.session.unsubscribe(channel)?;
        }
        Ok(())
    }

    /// Record a local change and broadcast it.
    pub async fn push_change(&self, draft: ChangeDraft) -> Result<Change, SyncError> {
        let push = self.inner.core.lock().await.push_change(draft, Utc::now())?;
        self.inner.send_change(&push).await?;
        self.inner.emit(SyncEvent::LocalChange(push.change.clone()));
        Ok(push.change)
    }

    /// Settle a surfaced conflict and broadcast the reconciling change.
    pub async fn resolve_conflict(
        &self,
        conflict_id: Uuid,
        resolution: ConflictResolution,
        merged_value: Option<Value>,
    ) -> Result<Conflict, SyncError> {
        let settled = self
            .inner
            .core
            .lock()
            .await
            .resolve_conflict(conflict_id, resolution, merged_value, Utc::now())?;
        self.inner.send_change(&settled.reconciling).await?;
        self.inner.emit(SyncEvent::ConflictResolved {
            conflict: settled.conflict.clone(),
            reconciling: settled.reconciling.change,
        });
        Ok(settled.conflict)
    }

    /// Push the inverse of a recorded change.
    pub async fn undo_change(&self, change_id: Uuid) -> Result<Change, SyncError> {
        let push = self.inner.core.lock().await.undo(change_id, Utc::now())?;
        self.inner.send_change(&push).await?;
        self.inner.emit(SyncEvent::LocalChange(push.change.clone()));
        Ok(push.change)
    }

    /// Take the advisory lock for this user. `None` means a peer holds
    /// it. A grant broadcasts the signal and schedules auto-renewal.
    pub async fn acquire_lock(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<Option<EntityLock>, SyncError> {
        let grant =
            self.inner.core.lock().await.acquire_lock(entity_type, entity_id, Utc::now());
        let Some(grant) = grant else {
            return Ok(None);
        };
        self.inner.send_lock(&grant.signal).await?;

        let task = spawn_renewal(
            &self.inner,
            entity_type.to_string(),
            entity_id.to_string(),
            grant.renew_after,
        );
        let mut renewals = self.inner.renewals.lock().await;
        if let Some(previous) =
            renewals.insert((entity_type.to_string(), entity_id.to_string()), task)
        {
            previous.abort();
        }
        Ok(Some(grant.lock))
    }

    /// Release an owned lock. Returns false (and stays silent) when
    /// this user does not hold it.
    pub async fn release_lock(
        &self,
        entity_type: &str,
        entity_id: &str,
    ) -> Result<bool, SyncError> {
        let signal = self.inner.core.lock().await.release_lock(entity_type, entity_id);
        let Some(signal) = signal else {
            return Ok(false);
        };
        if let Some(task) = self
            .inner
            .renewals
            .lock()
            .await
            .remove(&(entity_type.to_string(), entity_id.to_string()))
        {
            task.abort();
        }
        self.inner.send_lock(&signal).await?;
        Ok(true)
    }

    /// Whether the entity is locked against this user.
    pub async fn is_locked(&self, entity_type: &str, entity_id: &str) -> bool {
        self.inner.core.lock().await.is_locked(entity_type, entity_id, Utc::now())
    }

    /// Open conflicts for one entity.
    pub async fn conflicts(&self, entity_type: &str, entity_id: &str) -> Vec<Conflict> {
        self.inner
            .core
            .lock()
            .await
            .state(entity_type, entity_id)
            .map(|state| state.conflicts.clone())
            .unwrap_or_default()
    }

    /// Snapshot of one entity's tracking state.
    pub async fn sync_state(&self, entity_type: &str, entity_id: &str) -> Option<SyncState> {
        self.inner.core.lock().await.state(entity_type, entity_id).cloned()
    }

    /// Recent changes, local and remote, oldest first.
    pub async fn change_history(&self) -> Vec<Change> {
        self.inner.core.lock().await.history().iter().cloned().collect()
    }

    /// Stop the pump, the re-sync tick, and every renewal task.
    pub async fn shutdown(self) {
        for (_, task) in self.inner.renewals.lock().await.drain() {
            task.abort();
        }
        self.pump.abort();
        self.resync.abort();
    }
}

impl Drop for SyncEngine {
    fn drop(&mut self) {
        self.pump.abort();
        self.resync.abort();
    }
}

// ── Inner plumbing ──────────────────────────────────────────────────

impl EngineInner {
    async fn handle_frame(&self, envelope: Envelope) {
        let now = Utc::now();
        match envelope.body {
            MessageBody::Update(payload) => {
                let outcome = self.core.lock().await.apply_remote(payload.change, now);
                self.handle_remote_outcome(outcome).await;
            }
            MessageBody::Lock(signal) => {
                self.core.lock().await.apply_lock_signal(&signal);
                self.emit(SyncEvent::Lock(signal));
            }
            MessageBody::Sync(payload) => {
                if let Some(snapshot) = self.core.lock().await.apply_sync(&payload, now) {
                    self.emit(SyncEvent::Snapshot(snapshot));
                }
            }
            _ => {}
        }
    }

    async fn handle_remote_outcome(&self, outcome: RemoteOutcome) {
        match outcome {
            RemoteOutcome::Applied { change, conflicts } => {
                self.emit(SyncEvent::RemoteChange(change));
                for conflict in conflicts {
                    match conflict {
                        ConflictOutcome::Auto { conflict, reconciling } => {
                            if let Err(error) = self.send_change(&reconciling).await {
                                warn!(%error, "reconciling change broadcast failed");
                            }
                            self.emit(SyncEvent::ConflictResolved {
                                conflict,
                                reconciling: reconciling.change,
                            });
                        }
                        ConflictOutcome::Surfaced(conflict) => {
                            self.emit(SyncEvent::ConflictDetected(conflict));
                        }
                    }
                }
            }
            RemoteOutcome::Duplicate => debug!("duplicate change dropped"),
            RemoteOutcome::Echo | RemoteOutcome::Untracked => {}
        }
    }

    async fn send_change(&self, push: &PushOutcome) -> Result<(), SessionError> {
        let body = MessageBody::Update(UpdatePayload { change: push.change.clone() });
        self.session.send(body, Some(push.channel.clone())).await?;
        Ok(())
    }

    async fn send_lock(&self, signal: &LockSignal) -> Result<(), SessionError> {
        let body = MessageBody::Lock(signal.clone());
        self.session.send(body, Some(LOCKS_CHANNEL.to_string())).await?;
        Ok(())
    }

    fn emit(&self, event: SyncEvent) {
        let _ = self.events.send(event);
    }
}

async fn pump_frames(inner: Arc<EngineInner>, mut frames: broadcast::Receiver<ConnectionEvent>) {
    loop {
        match frames.recv().await {
            Ok(ConnectionEvent::Inbound(envelope)) => inner.handle_frame(envelope).await,
            Ok(_) => {}
            Err(RecvError::Lagged(skipped)) => {
                warn!(skipped, "engine pump lagged behind session events");
            }
            Err(RecvError::Closed) => break,
        }
    }
}

async fn resync_loop(inner: Arc<EngineInner>, period: Duration) {
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        if inner.session.state() != ConnectionState::Connected {
            continue;
        }
        let requests = inner.core.lock().await.resync_tick(Utc::now());
        for request in requests {
            if let Err(error) = inner.session.send(request.body, Some(request.channel)).await {
                debug!(%error, "re-sync request skipped");
                break;
            }
        }
    }
}

/// Renew an owned lock at each `renew_after` until ownership lapses.
/// Holds only a weak reference so a dropped engine ends the task.
fn spawn_renewal(
    inner: &Arc<EngineInner>,
    entity_type: String,
    entity_id: String,
    first_wait: Duration,
) -> JoinHandle<()> {
    let weak = Arc::downgrade(inner);
    tokio::spawn(async move {
        let mut wait = first_wait;
        loop {
            sleep(wait).await;
            let Some(inner) = weak.upgrade() else { break };
            let renewed =
                inner.core.lock().await.renew_lock(&entity_type, &entity_id, Utc::now());
            let Some(grant) = renewed else { break };
            if let Err(error) = inner.send_lock(&grant.signal).await {
                warn!(%error, "lock renewal broadcast failed");
            }
            wait = grant.renew_after;
        }
    })
}

// ── Tests ───────────────────────────────────────────────────────────
