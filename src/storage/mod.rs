pub mod engine;
pub mod memory;
pub mod persistence;
pub mod query;
pub mod record;

pub use engine::TransactionalStore;
pub use memory::InMemoryStore;
pub use persistence::{SnapshotManager, StoreSnapshot};
pub use query::RecordQuery;
pub use record::{Change, RecordKey, StoredRecord};
