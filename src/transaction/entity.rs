use crate::core::Result;
use crate::storage::{RecordKey, StoredRecord};
use serde::Serialize;
use serde::de::DeserializeOwned;

/// A typed record persisted through an execution context.
///
/// The revision is not part of the serialized body: it is owned by the store
/// and copied onto the entity when it is read.
pub trait Entity: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const KIND: &'static str;

    fn id(&self) -> &str;
    fn revision(&self) -> u64;
    fn set_revision(&mut self, revision: u64);

    fn key(&self) -> RecordKey {
        RecordKey::new(Self::KIND, self.id())
    }

    fn to_body(&self) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn from_record(record: StoredRecord) -> Result<Self> {
        let mut entity: Self = serde_json::from_value(record.body)?;
        entity.set_revision(record.revision);
        Ok(entity)
    }
}

/// Implements [`Entity`] for a struct with `id: String` and `revision: u64` fields.
#[macro_export]
macro_rules! impl_entity {
    ($ty:ty, $kind:expr) => {
        impl $crate::transaction::Entity for $ty {
            const KIND: &'static str = $kind;

            fn id(&self) -> &str {
                &self.id
            }

            fn revision(&self) -> u64 {
                self.revision
            }

            fn set_revision(&mut self, revision: u64) {
                self.revision = revision;
            }
        }
    };
}

type EntityFilter<T> = std::sync::Arc<dyn Fn(&T) -> bool + Send + Sync>;
type EntityOrder<T> = std::sync::Arc<dyn Fn(&T, &T) -> std::cmp::Ordering + Send + Sync>;

/// Typed query over one entity kind.
pub struct EntityQuery<T: Entity> {
    filter: Option<EntityFilter<T>>,
    order: Option<EntityOrder<T>>,
    limit: Option<usize>,
}

impl<T: Entity> EntityQuery<T> {
    pub fn new() -> Self {
        Self {
            filter: None,
            order: None,
            limit: None,
        }
    }

    pub fn filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(std::sync::Arc::new(filter));
        self
    }

    pub fn order_by<F>(mut self, order: F) -> Self
    where
        F: Fn(&T, &T) -> std::cmp::Ordering + Send + Sync + 'static,
    {
        self.order = Some(std::sync::Arc::new(order));
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Store-level form of the query. Ordering and limit are applied on the
    /// typed side, after pending writes have been merged in.
    pub fn to_record_query(&self) -> crate::storage::RecordQuery {
        let query = crate::storage::RecordQuery::kind(T::KIND);
        match &self.filter {
            Some(filter) => {
                let filter = filter.clone();
                query.filter(move |record| {
                    serde_json::from_value::<T>(record.body.clone())
                        .map(|entity| filter(&entity))
                        .unwrap_or(false)
                })
            }
            None => query,
        }
    }

    pub fn finish(&self, mut entities: Vec<T>) -> Vec<T> {
        if let Some(order) = &self.order {
            entities.sort_by(|a, b| order(a, b));
        }
        if let Some(limit) = self.limit {
            entities.truncate(limit);
        }
        entities
    }
}

impl<T: Entity> Default for EntityQuery<T> {
    fn default() -> Self {
        Self::new()
    }
}
