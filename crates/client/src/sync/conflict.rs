// Conflict detection and resolution strategies.
//
// Two changes conflict when they touch the same path within a bounded
// wall-clock window. This is a proximity heuristic, not a logical
// clock: skewed peer clocks can miss real conflicts or flag false
// ones, and the overlay merge is a named placeholder rather than
// convergent operational transformation.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use tandem_common::change::{Change, ConflictResolution};

/// How detected conflicts are settled. Chosen at engine construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResolutionStrategy {
    /// The change with the larger timestamp wins outright.
    LastWriteWins,
    /// Shallow-overlay the local value onto the remote value when both
    /// are objects; otherwise keep the local value.
    OperationalTransformation,
    /// The side holding the entity lock wins.
    LockBased,
    /// Never settled automatically; under forced auto-resolution the
    /// remote change wins. Unrecognized strategy names land here.
    #[serde(other)]
    Manual,
}

/// One local change paired with one remote change on the same path.
#[derive(Debug, Clone, PartialEq)]
pub struct Conflict {
    pub id: Uuid,
    pub local_change: Change,
    pub remote_change: Change,
    pub strategy: ResolutionStrategy,
    pub resolved: bool,
    pub resolution: Option<ConflictResolution>,
    pub merged_value: Option<Value>,
}

impl Conflict {
    pub fn between(local: Change, remote: Change, strategy: ResolutionStrategy) -> Self {
        Self {
            id: Uuid::new_v4(),
            local_change: local,
            remote_change: remote,
            strategy,
            resolved: false,
            resolution: None,
            merged_value: None,
        }
    }
}

/// Same path, timestamps strictly closer than the window.
pub fn in_conflict_window(local: &Change, remote: &Change, window_ms: i64) -> bool {
    local.path == remote.path
        && (local.timestamp - remote.timestamp).num_milliseconds().abs() < window_ms
}

/// Outcome of applying a strategy to a conflict pair.
#[derive(Debug, Clone, PartialEq)]
pub struct StrategyOutcome {
    pub resolution: ConflictResolution,
    pub merged_value: Option<Value>,
}

pub fn resolve_with_strategy(
    strategy: ResolutionStrategy,
    local: &Change,
    remote: &Change,
    local_holds_lock: bool,
) -> StrategyOutcome {
    match strategy {
        ResolutionStrategy::LastWriteWins => {
            if local.timestamp > remote.timestamp {
                local_wins()
            } else {
                remote_wins()
            }
        }
        ResolutionStrategy::OperationalTransformation => {
            match overlay_objects(local.after.as_ref(), remote.after.as_ref()) {
                Some(merged) => StrategyOutcome {
                    resolution: ConflictResolution::Merged,
                    merged_value: Some(merged),
                },
                None => local_wins(),
            }
        }
        ResolutionStrategy::LockBased => {
            if local_holds_lock {
                local_wins()
            } else {
                remote_wins()
            }
        }
        ResolutionStrategy::Manual => remote_wins(),
    }
}

/// Overlay the local value's keys onto the remote value when both are
/// objects; local keys win on overlap.
pub fn shallow_overlay(local: Option<&Value>, remote: Option<&Value>) -> Option<Value> {
    overlay_objects(local, remote).or_else(|| local.cloned())
}

fn overlay_objects(local: Option<&Value>, remote: Option<&Value>) -> Option<Value> {
    match (local, remote) {
        (Some(Value::Object(local_map)), Some(Value::Object(remote_map))) => {
            let mut merged = remote_map.clone();
            for (k, v) in local_map {
                merged.insert(k.clone(), v.clone());
            }
            Some(Value::Object(merged))
        }
        _ => None,
    }
}

fn local_wins() -> StrategyOutcome {
    StrategyOutcome { resolution: ConflictResolution::Local, merged_value: None }
}

fn remote_wins() -> StrategyOutcome {
    StrategyOutcome { resolution: ConflictResolution::Remote, merged_value: None }
}

// ── Tests ───────────────────────────────────────────────────────────
