// Bounded change history with FIFO eviction.

use std::collections::VecDeque;

use uuid::Uuid;

use tandem_common::change::Change;

pub const DEFAULT_HISTORY_LIMIT: usize = 100;

/// Recent changes, local and remote, in arrival order. The cap bounds
/// memory and also bounds the window for undo and duplicate detection.
#[derive(Debug)]
pub struct ChangeHistory {
    entries: VecDeque<Change>,
    limit: usize,
}

impl ChangeHistory {
    pub fn new(limit: usize) -> Self {
        Self { entries: VecDeque::new(), limit }
    }

    pub fn record(&mut self, change: Change) {
        self.entries.push_back(change);
        while self.entries.len() > self.limit {
            self.entries.pop_front();
        }
    }

    pub fn find(&self, id: Uuid) -> Option<&Change> {
        self.entries.iter().find(|c| c.id == id)
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.find(id).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Change> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ChangeHistory {
    fn default() -> Self {
        Self::new(DEFAULT_HISTORY_LIMIT)
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Utc};
    use tandem_common::change::ChangeOperation;

    fn change(version: u64) -> Change {
        Change {
            id: Uuid::new_v4(),
            entity_type: "order".to_string(),
            entity_id: "42".to_string(),
            user_id: "user-a".to_string(),
            operation: ChangeOperation::Update,
            path: "status".to_string(),
            before: None,
            after: None,
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000, 0).unwrap(),
            version,
            resolved: false,
            metadata: None,
        }
    }

    #[test]
    fn finds_recorded_changes_by_id() {
        let mut history = ChangeHistory::new(10);
        let tracked = change(1);
        let id = tracked.id;
        history.record(tracked);

        assert!(history.contains(id));
        assert_eq!(history.find(id).map(|c| c.version), Some(1));
        assert!(!history.contains(Uuid::new_v4()));
    }

    #[test]
    fn evicts_oldest_beyond_the_cap() {
        let mut history = ChangeHistory::new(3);
        let first = change(1);
        let first_id = first.id;
        history.record(first);
        for version in 2..=4 {
            history.record(change(version));
        }

        assert_eq!(history.len(), 3);
        assert!(!history.contains(first_id), "oldest entry is evicted first");
        let versions: Vec<_> = history.iter().map(|c| c.version).collect();
        assert_eq!(versions, [2, 3, 4]);
    }

    #[test]
    fn default_cap_is_one_hundred() {
        assert_eq!(ChangeHistory::default().limit, DEFAULT_HISTORY_LIMIT);
        assert_eq!(DEFAULT_HISTORY_LIMIT, 100);
    }
}
