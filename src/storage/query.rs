use super::StoredRecord;
use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

pub type RecordFilter = Arc<dyn Fn(&StoredRecord) -> bool + Send + Sync>;
pub type RecordOrder = Arc<dyn Fn(&StoredRecord, &StoredRecord) -> Ordering + Send + Sync>;

/// Range query over one record kind: optional predicate, ordering and limit.
///
/// ```
/// use procengine::storage::RecordQuery;
///
/// let query = RecordQuery::kind("job")
///     .filter(|r| r.body["retries"].as_u64() > Some(0))
///     .order_by(|a, b| a.id.cmp(&b.id))
///     .limit(10);
/// assert_eq!(query.kind, "job");
/// ```
#[derive(Clone)]
pub struct RecordQuery {
    pub kind: String,
    filter: Option<RecordFilter>,
    order: Option<RecordOrder>,
    limit: Option<usize>,
}

impl RecordQuery {
    pub fn kind(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            filter: None,
            order: None,
            limit: None,
        }
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&StoredRecord) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn order_by<F>(mut self, order: F) -> Self
    where
        F: Fn(&StoredRecord, &StoredRecord) -> Ordering + Send + Sync + 'static,
    {
        self.order = Some(Arc::new(order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Same query without the limit. Used when results still have to be merged
    /// with uncommitted writes before truncating.
    pub fn unbounded(&self) -> Self {
        Self {
            limit: None,
            ..self.clone()
        }
    }

    pub fn get_limit(&self) -> Option<usize> {
        self.limit
    }

    pub fn matches(&self, record: &StoredRecord) -> bool {
        record.kind == self.kind && self.filter.as_ref().is_none_or(|f| f(record))
    }

    /// Sort and truncate an already-filtered result set.
    pub fn finish(&self, mut records: Vec<StoredRecord>) -> Vec<StoredRecord> {
        if let Some(order) = &self.order {
            records.sort_by(|a, b| order(a, b));
        }
        if let Some(limit) = self.limit {
            records.truncate(limit);
        }
        records
    }
}

impl fmt::Debug for RecordQuery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordQuery")
            .field("kind", &self.kind)
            .field("filtered", &self.filter.is_some())
            .field("ordered", &self.order.is_some())
            .field("limit", &self.limit)
            .finish()
    }
}
