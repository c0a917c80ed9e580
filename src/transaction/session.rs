// ============================================================================
// Entity Session
// ============================================================================
//
// Per-unit-of-work record cache:
// - first read of a record is cached, later reads see the same version
// - writes are staged as pending and overlaid on reads and queries
// - nothing reaches the store until `flush`
//
// ============================================================================

use super::change::{Folded, PendingWrite};
use crate::core::{EngineError, Result};
use crate::storage::{Change, RecordKey, RecordQuery, StoredRecord, TransactionalStore};
use std::collections::HashMap;

#[derive(Debug, Default)]
pub struct EntitySession {
    loaded: HashMap<RecordKey, StoredRecord>,
    pending: HashMap<RecordKey, PendingWrite>,
    // first-touch order of pending keys, so flush is deterministic
    order: Vec<RecordKey>,
}

impl EntitySession {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Point read with read-your-writes semantics.
    pub async fn get(
        &mut self,
        store: &dyn TransactionalStore,
        key: &RecordKey,
    ) -> Result<Option<StoredRecord>> {
        if let Some(pending) = self.pending.get(key) {
            return Ok(pending.visible_record(key));
        }
        if let Some(loaded) = self.loaded.get(key) {
            return Ok(Some(loaded.clone()));
        }

        let fetched = store.get(&key.kind, &key.id).await?;
        if let Some(record) = &fetched {
            self.loaded.insert(key.clone(), record.clone());
        }
        Ok(fetched)
    }

    /// Range read: committed records overlaid with this session's pending writes.
    pub async fn query(
        &mut self,
        store: &dyn TransactionalStore,
        query: &RecordQuery,
    ) -> Result<Vec<StoredRecord>> {
        let committed = store.query(&query.unbounded()).await?;

        let mut visible = Vec::with_capacity(committed.len());
        for record in committed {
            let key = record.key();
            if self.pending.contains_key(&key) {
                continue;
            }
            match self.loaded.get(&key) {
                Some(cached) => {
                    if query.matches(cached) {
                        visible.push(cached.clone());
                    }
                }
                None => {
                    self.loaded.insert(key, record.clone());
                    visible.push(record);
                }
            }
        }

        for key in &self.order {
            if key.kind != query.kind {
                continue;
            }
            if let Some(record) = self.pending.get(key).and_then(|p| p.visible_record(key))
                && query.matches(&record)
            {
                visible.push(record);
            }
        }

        Ok(query.finish(visible))
    }

    /// Revision the unit of work currently attributes to `key`, if the record
    /// is known to exist.
    pub fn known_revision(&self, key: &RecordKey) -> Option<u64> {
        match self.pending.get(key) {
            Some(pending) => pending.projected_revision(),
            None => self.loaded.get(key).map(|r| r.revision),
        }
    }

    pub fn stage_insert(&mut self, key: RecordKey, body: serde_json::Value) -> Result<u64> {
        if !self.pending.contains_key(&key)
            && let Some(existing) = self.loaded.get(&key)
        {
            return Err(EngineError::conflict(
                &key.kind,
                &key.id,
                0,
                Some(existing.revision),
            ));
        }
        self.stage(key, PendingWrite::Insert { body }, 0)
    }

    pub fn stage_update(
        &mut self,
        key: RecordKey,
        in_hand: u64,
        body: serde_json::Value,
    ) -> Result<u64> {
        self.stage(
            key,
            PendingWrite::Update {
                expected_revision: in_hand,
                body,
            },
            in_hand,
        )
    }

    pub fn stage_delete(&mut self, key: RecordKey, in_hand: u64) -> Result<()> {
        self.stage(
            key,
            PendingWrite::Delete {
                expected_revision: in_hand,
            },
            in_hand,
        )
        .map(|_| ())
    }

    /// Stage `write` and return the revision the record will carry after commit
    /// (0 for deletes).
    fn stage(&mut self, key: RecordKey, write: PendingWrite, in_hand: u64) -> Result<u64> {
        match self.pending.remove(&key) {
            Some(current) => match current.clone().fold(&key, write, in_hand) {
                Ok(Folded::Pending(folded)) => {
                    let projected = folded.projected_revision().unwrap_or(0);
                    self.pending.insert(key, folded);
                    Ok(projected)
                }
                Ok(Folded::Nothing) => {
                    self.order.retain(|k| k != &key);
                    Ok(0)
                }
                Err(err) => {
                    self.pending.insert(key, current);
                    Err(err)
                }
            },
            None => {
                if !matches!(write, PendingWrite::Insert { .. })
                    && let Some(loaded) = self.loaded.get(&key)
                    && loaded.revision != in_hand
                {
                    return Err(EngineError::conflict(
                        &key.kind,
                        &key.id,
                        in_hand,
                        Some(loaded.revision),
                    ));
                }
                let projected = write.projected_revision().unwrap_or(0);
                self.order.push(key.clone());
                self.pending.insert(key, write);
                Ok(projected)
            }
        }
    }

    /// Drain pending writes as one ordered commit batch.
    pub fn flush(&mut self) -> Vec<Change> {
        let order = std::mem::take(&mut self.order);
        let mut changes = Vec::with_capacity(order.len());
        for key in order {
            if let Some(pending) = self.pending.remove(&key) {
                changes.push(pending.into_change(key));
            }
        }
        self.pending.clear();
        self.loaded.clear();
        changes
    }

    /// Forget everything staged and cached.
    pub fn discard(&mut self) {
        self.pending.clear();
        self.order.clear();
        self.loaded.clear();
    }
}
