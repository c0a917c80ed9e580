// ============================================================================
// Pending Write Tracking
// ============================================================================
//
// A unit of work keeps at most one pending write per record. Successive
// writes to the same record are folded together so that the flush emits a
// single conditional change carrying the revision first observed.
//
// ============================================================================

use crate::core::{EngineError, Result};
use crate::storage::{Change, RecordKey, StoredRecord};

/// Uncommitted write staged against one record.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingWrite {
    Insert {
        body: serde_json::Value,
    },
    Update {
        expected_revision: u64,
        body: serde_json::Value,
    },
    Delete {
        expected_revision: u64,
    },
}

/// Result of folding a new write into an existing pending one.
#[derive(Debug, Clone, PartialEq)]
pub enum Folded {
    Pending(PendingWrite),
    /// The writes cancel out (insert followed by delete).
    Nothing,
}

impl PendingWrite {
    /// Revision the record will carry once the pending write is committed.
    pub fn projected_revision(&self) -> Option<u64> {
        match self {
            PendingWrite::Insert { .. } => Some(1),
            PendingWrite::Update {
                expected_revision, ..
            } => Some(expected_revision + 1),
            PendingWrite::Delete { .. } => None,
        }
    }

    /// The record as seen by reads inside the unit of work.
    pub fn visible_record(&self, key: &RecordKey) -> Option<StoredRecord> {
        let body = match self {
            PendingWrite::Insert { body } | PendingWrite::Update { body, .. } => body.clone(),
            PendingWrite::Delete { .. } => return None,
        };
        Some(StoredRecord {
            kind: key.kind.clone(),
            id: key.id.clone(),
            revision: self.projected_revision().unwrap_or(0),
            body,
        })
    }

    /// Fold `next` on top of `self`.
    ///
    /// `in_hand` is the revision the caller's copy carries; it must be the
    /// projected revision of the pending write, otherwise the caller is
    /// writing from a stale copy.
    pub fn fold(self, key: &RecordKey, next: PendingWrite, in_hand: u64) -> Result<Folded> {
        let projected = self.projected_revision();
        let stale = EngineError::conflict(&key.kind, &key.id, in_hand, projected);

        match (self, next) {
            // Deleting twice is idempotent.
            (PendingWrite::Delete { expected_revision }, PendingWrite::Delete { .. }) => {
                Ok(Folded::Pending(PendingWrite::Delete { expected_revision }))
            }
            (PendingWrite::Delete { expected_revision }, PendingWrite::Insert { body }) => {
                Ok(Folded::Pending(PendingWrite::Update {
                    expected_revision,
                    body,
                }))
            }
            (PendingWrite::Delete { .. }, PendingWrite::Update { .. }) => Err(stale),
            (_, PendingWrite::Insert { .. }) => Err(stale),
            _ if Some(in_hand) != projected => Err(stale),
            (PendingWrite::Insert { .. }, PendingWrite::Update { body, .. }) => {
                Ok(Folded::Pending(PendingWrite::Insert { body }))
            }
            (PendingWrite::Insert { .. }, PendingWrite::Delete { .. }) => Ok(Folded::Nothing),
            (PendingWrite::Update { expected_revision, .. }, PendingWrite::Update { body, .. }) => {
                Ok(Folded::Pending(PendingWrite::Update {
                    expected_revision,
                    body,
                }))
            }
            (PendingWrite::Update { expected_revision, .. }, PendingWrite::Delete { .. }) => {
                Ok(Folded::Pending(PendingWrite::Delete { expected_revision }))
            }
        }
    }

    pub fn into_change(self, key: RecordKey) -> Change {
        match self {
            PendingWrite::Insert { body } => Change::Insert {
                record: StoredRecord::new(key.kind, key.id, body),
            },
            PendingWrite::Update {
                expected_revision,
                body,
            } => Change::Update {
                kind: key.kind,
                id: key.id,
                expected_revision,
                body,
            },
            PendingWrite::Delete { expected_revision } => Change::Delete {
                kind: key.kind,
                id: key.id,
                expected_revision: Some(expected_revision),
            },
        }
    }
}
