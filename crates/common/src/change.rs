// Change records: the unit of synchronization between peers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A single mutation to one field of one entity.
///
/// `version` is a per-entity monotonic sequence assigned by the authoring
/// engine. Two peers can assign colliding versions; conflict detection, not
/// version comparison, decides how overlapping edits reconcile.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Change {
    pub id: Uuid,
    pub entity_type: String,
    pub entity_id: String,
    pub user_id: String,
    pub operation: ChangeOperation,
    /// Field path within the entity, e.g. "status" or "address.city".
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub before: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<Value>,
    pub timestamp: DateTime<Utc>,
    pub version: u64,
    #[serde(default)]
    pub resolved: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ChangeMetadata>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOperation {
    Insert,
    Update,
    Delete,
    Move,
}

/// Provenance tags for compensating and reconciling changes.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChangeMetadata {
    /// True when this change compensates an earlier one.
    #[serde(default)]
    pub undo: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub undo_of: Option<Uuid>,
    /// Set when this change was pushed to settle a conflict.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub conflict_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolution: Option<ConflictResolution>,
}

impl ChangeMetadata {
    pub fn undo_of(change_id: Uuid) -> Self {
        Self { undo: true, undo_of: Some(change_id), ..Self::default() }
    }

    pub fn resolution_of(conflict_id: Uuid, resolution: ConflictResolution) -> Self {
        Self { conflict_id: Some(conflict_id), resolution: Some(resolution), ..Self::default() }
    }
}

/// Which side a resolved conflict settled on.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    Local,
    Remote,
    Merged,
}

impl Change {
    pub fn is_undo(&self) -> bool {
        self.metadata.as_ref().is_some_and(|m| m.undo)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
