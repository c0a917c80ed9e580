// ============================================================================
// procengine Library
// ============================================================================
//
// Execution core of a process-automation engine:
// - a command pipeline that runs every unit of work inside an execution
//   context, committing its writes atomically or discarding them
// - a lease-based job scheduler built on top of that pipeline, safe for
//   many workers sharing one store
//
// ============================================================================

pub mod batch;
pub mod config;
pub mod core;
pub mod document;
pub mod executor;
pub mod facade;
pub mod jobs;
pub mod scope;
pub mod storage;
pub mod transaction;

// Re-export main types for convenience
pub use config::{ConflictRetryPolicy, EngineConfig, JobExecutorConfig, TenantFilter};
pub use crate::core::{Clock, EngineError, ErrorKind, ManualClock, Result, SystemClock};
pub use executor::{
    Command, CommandExecutor, CommandExt, CommandInterceptor, EngineEvent, EventListener,
    EventLog, ExecutionContext, Guard, Invocation,
};
pub use facade::{ProcessEngine, ProcessEngineBuilder};
pub use jobs::{
    Job, JobDefinition, JobExecutor, JobFailure, JobHandler, JobHandlerRegistry, JobPopulation,
    JobService, JobState, JobType,
};
pub use scope::{ActiveScope, BulkDeleteReport, ProcessScope};
pub use storage::{InMemoryStore, TransactionalStore};
pub use transaction::{Entity, EntityQuery};
