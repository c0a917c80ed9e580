use super::{Change, RecordQuery, StoredRecord, TransactionalStore};
use crate::core::{EngineError, Result};
use async_trait::async_trait;
use im::{HashMap as ImHashMap, OrdMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

type Table = OrdMap<String, StoredRecord>;
type Tables = ImHashMap<String, Table>;

/// In-process implementation of [`TransactionalStore`].
///
/// Tables are persistent maps, so a commit stages its changes on a cheap
/// structural copy and swaps it in only when every condition held.
pub struct InMemoryStore {
    tables: RwLock<Tables>,
    commits: AtomicU64,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(ImHashMap::new()),
            commits: AtomicU64::new(0),
        }
    }

    /// Number of committed batches.
    pub fn commit_count(&self) -> u64 {
        self.commits.load(Ordering::SeqCst)
    }

    /// Number of records of one kind.
    pub async fn count(&self, kind: &str) -> usize {
        let tables = self.tables.read().await;
        tables.get(kind).map(|t| t.len()).unwrap_or(0)
    }

    pub async fn kinds(&self) -> Vec<String> {
        let tables = self.tables.read().await;
        let mut kinds: Vec<String> = tables.keys().cloned().collect();
        kinds.sort();
        kinds
    }

    /// All committed records, ordered by kind then id.
    pub async fn export(&self) -> Vec<StoredRecord> {
        let tables = self.tables.read().await;
        let mut kinds: Vec<&String> = tables.keys().collect();
        kinds.sort();

        let mut records = Vec::new();
        for kind in kinds {
            if let Some(table) = tables.get(kind) {
                records.extend(table.values().cloned());
            }
        }
        records
    }

    /// Replace the whole content with the given records (revisions kept as-is).
    pub async fn restore(&self, records: Vec<StoredRecord>) {
        let mut restored = Tables::new();
        for record in records {
            table_mut(&mut restored, &record.kind).insert(record.id.clone(), record);
        }
        let mut tables = self.tables.write().await;
        *tables = restored;
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

fn table_mut<'a>(tables: &'a mut Tables, kind: &str) -> &'a mut Table {
    tables.entry(kind.to_string()).or_default()
}

fn apply_change(tables: &mut Tables, change: Change) -> Result<()> {
    match change {
        Change::Insert { mut record } => {
            let table = table_mut(tables, &record.kind);
            if let Some(existing) = table.get(&record.id) {
                return Err(EngineError::conflict(
                    &record.kind,
                    &record.id,
                    0,
                    Some(existing.revision),
                ));
            }
            record.revision = 1;
            table.insert(record.id.clone(), record);
        }
        Change::Update {
            kind,
            id,
            expected_revision,
            body,
        } => {
            let table = table_mut(tables, &kind);
            let actual = table.get(&id).map(|r| r.revision);
            if actual != Some(expected_revision) {
                return Err(EngineError::conflict(kind, id, expected_revision, actual));
            }
            let record = StoredRecord {
                kind: kind.clone(),
                id: id.clone(),
                revision: expected_revision + 1,
                body,
            };
            table.insert(id, record);
        }
        Change::Delete {
            kind,
            id,
            expected_revision,
        } => {
            let table = table_mut(tables, &kind);
            let actual = table.get(&id).map(|r| r.revision);
            match (actual, expected_revision) {
                (None, None) => {}
                (actual, Some(expected)) if actual != Some(expected) => {
                    return Err(EngineError::conflict(kind, id, expected, actual));
                }
                _ => {
                    table.remove(&id);
                }
            }
        }
    }
    Ok(())
}

#[async_trait]
impl TransactionalStore for InMemoryStore {
    async fn get(&self, kind: &str, id: &str) -> Result<Option<StoredRecord>> {
        let tables = self.tables.read().await;
        Ok(tables.get(kind).and_then(|t| t.get(id)).cloned())
    }

    async fn query(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>> {
        let tables = self.tables.read().await;
        let Some(table) = tables.get(&query.kind) else {
            return Ok(Vec::new());
        };
        let matching = table
            .values()
            .filter(|record| query.matches(record))
            .cloned()
            .collect();
        Ok(query.finish(matching))
    }

    async fn commit(&self, changes: Vec<Change>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        let mut tables = self.tables.write().await;
        let mut staged = tables.clone();
        for change in changes {
            apply_change(&mut staged, change)?;
        }
        *tables = staged;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
