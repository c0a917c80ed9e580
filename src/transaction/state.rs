// ============================================================================
// Unit-of-Work State Management
// ============================================================================
//
// Every top-level command runs inside one unit of work. It moves through
// Active -> Committed/RolledBack exactly once; nested commands reuse the
// unit of work of their caller and never drive these transitions.
//
// ============================================================================

use crate::core::{EngineError, Result};
use std::sync::atomic::{AtomicU64, Ordering};

/// Global context ID counter
static NEXT_CONTEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for an execution context
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ContextId(pub u64);

impl ContextId {
    /// Generate a new unique context ID
    pub fn new() -> Self {
        ContextId(NEXT_CONTEXT_ID.fetch_add(1, Ordering::SeqCst))
    }

    /// Get the raw ID value
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ContextId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ContextId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "ctx_{}", self.0)
    }
}

/// Lifecycle of a unit of work
///
/// State transitions:
/// ```text
/// Active ──commit──> Committed
///   │
///   └──rollback──> RolledBack
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContextState {
    /// Commands may read and stage writes
    Active,

    /// Pending writes reached the store
    Committed,

    /// Pending writes were discarded
    RolledBack,
}

impl ContextState {
    pub fn is_active(&self) -> bool {
        matches!(self, ContextState::Active)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ContextState::Committed | ContextState::RolledBack)
    }

    /// Move to `next`, refusing to leave a terminal state.
    pub fn transition(&mut self, id: ContextId, next: ContextState) -> Result<()> {
        if !self.is_active() {
            return Err(EngineError::Fatal(format!(
                "cannot move {} to {}: already {}",
                id, next, self
            )));
        }
        *self = next;
        Ok(())
    }
}

impl std::fmt::Display for ContextState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ContextState::Active => write!(f, "ACTIVE"),
            ContextState::Committed => write!(f, "COMMITTED"),
            ContextState::RolledBack => write!(f, "ROLLED_BACK"),
        }
    }
}
