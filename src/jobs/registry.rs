use super::model::Job;
use crate::core::Result;
use crate::executor::ExecutionContext;
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

/// The work behind one job handler type.
///
/// A handler runs inside the unit of work that also deletes the job, so any
/// state it changes through `ctx` commits only if the job completes.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    async fn execute(
        &self,
        job: &Job,
        payload: Option<Vec<u8>>,
        ctx: &mut ExecutionContext,
    ) -> Result<()>;
}

/// Handlers by handler type
#[derive(Default)]
pub struct JobHandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl JobHandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration for the same type wins.
    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers
            .insert(handler.handler_type().to_string(), handler);
    }

    pub fn with_handler(mut self, handler: Arc<dyn JobHandler>) -> Self {
        self.register(handler);
        self
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_type).cloned()
    }

    /// Registered handler types, sorted
    pub fn handler_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }
}
