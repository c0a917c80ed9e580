use super::{Change, RecordQuery, StoredRecord};
use crate::core::Result;
use async_trait::async_trait;

/// Durable, indexed record store with optimistic-concurrency writes.
///
/// Only committed state is ever visible through this trait; uncommitted
/// writes live in the caller's execution context until `commit`.
#[async_trait]
pub trait TransactionalStore: Send + Sync {
    /// Point lookup.
    async fn get(&self, kind: &str, id: &str) -> Result<Option<StoredRecord>>;

    /// Range lookup over one kind.
    async fn query(&self, query: &RecordQuery) -> Result<Vec<StoredRecord>>;

    /// Apply a batch of conditional writes atomically.
    ///
    /// # Errors
    /// `RevisionConflict` if any change's condition does not hold; nothing is
    /// applied in that case.
    async fn commit(&self, changes: Vec<Change>) -> Result<()>;

    async fn insert(&self, record: StoredRecord) -> Result<()> {
        self.commit(vec![Change::Insert { record }]).await
    }

    async fn update(
        &self,
        kind: &str,
        id: &str,
        expected_revision: u64,
        body: serde_json::Value,
    ) -> Result<()> {
        self.commit(vec![Change::Update {
            kind: kind.to_string(),
            id: id.to_string(),
            expected_revision,
            body,
        }])
        .await
    }

    async fn delete(&self, kind: &str, id: &str) -> Result<()> {
        self.commit(vec![Change::Delete {
            kind: kind.to_string(),
            id: id.to_string(),
            expected_revision: None,
        }])
        .await
    }
}
