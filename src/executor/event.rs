use std::sync::Mutex;

/// Something that happened inside a committed unit of work.
///
/// Events are queued on the execution context and only handed to listeners
/// after the top-level commit succeeded. A rolled back context drops them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    JobCreated { job_id: String, scope_id: Option<String> },
    JobLocked { job_id: String, lock_owner: String },
    JobCompleted { job_id: String },
    JobFailed { job_id: String, retries_left: u32 },
    JobDeadLettered { job_id: String },
    ScopeSuspended { scope_id: String, jobs_moved: usize },
    ScopeActivated { scope_id: String, jobs_moved: usize },
    ScopeDeleted { scope_id: String },
    BatchDeleted { batch_id: String },
}

impl EngineEvent {
    pub fn name(&self) -> &'static str {
        match self {
            EngineEvent::JobCreated { .. } => "job_created",
            EngineEvent::JobLocked { .. } => "job_locked",
            EngineEvent::JobCompleted { .. } => "job_completed",
            EngineEvent::JobFailed { .. } => "job_failed",
            EngineEvent::JobDeadLettered { .. } => "job_dead_lettered",
            EngineEvent::ScopeSuspended { .. } => "scope_suspended",
            EngineEvent::ScopeActivated { .. } => "scope_activated",
            EngineEvent::ScopeDeleted { .. } => "scope_deleted",
            EngineEvent::BatchDeleted { .. } => "batch_deleted",
        }
    }
}

/// Receives events after commit.
pub trait EventListener: Send + Sync {
    fn on_event(&self, event: &EngineEvent);
}

/// Listener that keeps every event it sees.
#[derive(Debug, Default)]
pub struct EventLog {
    events: Mutex<Vec<EngineEvent>>,
}

impl EventLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<EngineEvent> {
        match self.events.lock() {
            Ok(events) => events.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.events().iter().map(EngineEvent::name).collect()
    }

    pub fn clear(&self) {
        if let Ok(mut events) = self.events.lock() {
            events.clear();
        }
    }
}

impl EventListener for EventLog {
    fn on_event(&self, event: &EngineEvent) {
        let mut events = match self.events.lock() {
            Ok(events) => events,
            Err(poisoned) => poisoned.into_inner(),
        };
        events.push(event.clone());
    }
}
