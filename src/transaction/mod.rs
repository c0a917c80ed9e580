// ============================================================================
// Unit-of-Work Module
// ============================================================================
//
// Everything a single execution context needs to stage writes against the
// transactional store and flush them as one conditional commit:
// - state: context identity and Active -> Committed/RolledBack lifecycle
// - change: folding successive writes to one record into one pending write
// - session: first-read cache + pending overlay (read-your-writes)
// - entity: typed records on top of raw store records
//
// ============================================================================

pub mod change;
pub mod entity;
pub mod session;
pub mod state;

pub use change::PendingWrite;
pub use entity::{Entity, EntityQuery};
pub use session::EntitySession;
pub use state::{ContextId, ContextState};
