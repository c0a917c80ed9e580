use serde::{Deserialize, Serialize};
use std::fmt;

/// Address of one record in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub kind: String,
    pub id: String,
}

impl RecordKey {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
        }
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// A committed record together with its optimistic-concurrency revision.
///
/// Revisions start at 1 on insert and grow by one on every update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub kind: String,
    pub id: String,
    pub revision: u64,
    pub body: serde_json::Value,
}

impl StoredRecord {
    pub fn new(kind: impl Into<String>, id: impl Into<String>, body: serde_json::Value) -> Self {
        Self {
            kind: kind.into(),
            id: id.into(),
            revision: 0,
            body,
        }
    }

    pub fn key(&self) -> RecordKey {
        RecordKey::new(self.kind.clone(), self.id.clone())
    }
}

/// A single conditional write inside a commit batch.
///
/// A batch is applied all-or-nothing: one failed condition rejects every
/// change in it.
#[derive(Debug, Clone, PartialEq)]
pub enum Change {
    /// Create a record; fails if the id already exists.
    Insert { record: StoredRecord },

    /// Replace a record body; fails unless the stored revision equals `expected_revision`.
    Update {
        kind: String,
        id: String,
        expected_revision: u64,
        body: serde_json::Value,
    },

    /// Remove a record. With `expected_revision` the stored revision must
    /// match; without it the delete is unconditional and a no-op when absent.
    Delete {
        kind: String,
        id: String,
        expected_revision: Option<u64>,
    },
}

impl Change {
    pub fn kind(&self) -> &str {
        match self {
            Change::Insert { record } => &record.kind,
            Change::Update { kind, .. } => kind,
            Change::Delete { kind, .. } => kind,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Change::Insert { record } => &record.id,
            Change::Update { id, .. } => id,
            Change::Delete { id, .. } => id,
        }
    }

    pub fn is_delete(&self) -> bool {
        matches!(self, Change::Delete { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_change_addressing() {
        let insert = Change::Insert {
            record: StoredRecord::new("job", "j-1", json!({})),
        };
        assert_eq!(insert.kind(), "job");
        assert_eq!(insert.id(), "j-1");
        assert!(!insert.is_delete());

        let delete = Change::Delete {
            kind: "job".to_string(),
            id: "j-1".to_string(),
            expected_revision: None,
        };
        assert!(delete.is_delete());
    }

    #[test]
    fn test_record_key_display() {
        assert_eq!(RecordKey::new("scope", "p1").to_string(), "scope:p1");
    }
}
