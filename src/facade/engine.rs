use crate::batch::{Batch, CreateBatchCmd, DeleteBatchCmd};
use crate::config::EngineConfig;
use crate::core::{Clock, Result};
use crate::executor::{Command, CommandExecutor, CommandInterceptor, EventListener};
use crate::jobs::{JobExecutor, JobHandlerRegistry, JobService};
use crate::scope::{BulkDeleteReport, CreateScopeCmd, DeleteProcessInstancesCmd, ProcessScope};
use crate::storage::InMemoryStore;
use std::path::Path;
use std::sync::Arc;

/// In-process engine: an in-memory store, the command pipeline over it, and
/// the job service.
///
/// # Examples
///
/// ```
/// use procengine::{JobDefinition, ProcessEngine};
///
/// # #[tokio::main]
/// # async fn main() -> procengine::Result<()> {
/// let engine = ProcessEngine::builder().build();
/// engine.create_scope("p1").await?;
/// let job_id = engine
///     .jobs()
///     .schedule(JobDefinition::async_continuation("noop").scope("p1"))
///     .await?;
/// assert!(engine.jobs().find(&job_id).await?.is_some());
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct ProcessEngine {
    store: Arc<InMemoryStore>,
    executor: CommandExecutor,
    jobs: JobService,
}

impl ProcessEngine {
    pub fn builder() -> ProcessEngineBuilder {
        ProcessEngineBuilder::new()
    }

    /// Engine over a store restored from a snapshot file. A missing file
    /// gives an empty store.
    pub async fn open_snapshot<P: AsRef<Path>>(path: P, config: EngineConfig) -> Result<Self> {
        let store = InMemoryStore::load_snapshot(path).await?;
        Ok(Self::builder().store(Arc::new(store)).config(config).build())
    }

    pub fn store(&self) -> &Arc<InMemoryStore> {
        &self.store
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub fn jobs(&self) -> &JobService {
        &self.jobs
    }

    pub fn config(&self) -> &EngineConfig {
        self.executor.config()
    }

    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output> {
        self.executor.execute(command).await
    }

    pub async fn create_scope(&self, id: &str) -> Result<ProcessScope> {
        self.executor.execute(&CreateScopeCmd::new(id)).await
    }

    pub async fn delete_process_instances<I, S>(&self, ids: I) -> Result<BulkDeleteReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.executor
            .execute(&DeleteProcessInstancesCmd::new(ids))
            .await
    }

    pub async fn create_batch(&self, command: CreateBatchCmd) -> Result<Batch> {
        self.executor.execute(&command).await
    }

    pub async fn delete_batch(&self, batch_id: &str) -> Result<()> {
        self.executor.execute(&DeleteBatchCmd::new(batch_id)).await
    }

    /// A job executor for this engine, using the configured lock owner.
    pub fn job_executor(&self, registry: JobHandlerRegistry) -> JobExecutor {
        JobExecutor::new(self.executor.clone(), registry)
    }

    pub async fn save_snapshot<P: AsRef<Path>>(&self, path: P) -> Result<usize> {
        self.store.save_snapshot(path).await
    }
}

pub struct ProcessEngineBuilder {
    store: Option<Arc<InMemoryStore>>,
    clock: Option<Arc<dyn Clock>>,
    config: EngineConfig,
    interceptors: Vec<Arc<dyn CommandInterceptor>>,
    listeners: Vec<Arc<dyn EventListener>>,
}

impl ProcessEngineBuilder {
    pub fn new() -> Self {
        Self {
            store: None,
            clock: None,
            config: EngineConfig::default(),
            interceptors: Vec::new(),
            listeners: Vec::new(),
        }
    }

    /// Share an existing store, e.g. to run several engine nodes against it.
    pub fn store(mut self, store: Arc<InMemoryStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.interceptors.push(interceptor);
        self
    }

    pub fn listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> ProcessEngine {
        let store = self.store.unwrap_or_default();

        let mut builder = CommandExecutor::builder(store.clone()).config(self.config);
        if let Some(clock) = self.clock {
            builder = builder.clock(clock);
        }
        for interceptor in self.interceptors {
            builder = builder.with_interceptor(interceptor);
        }
        for listener in self.listeners {
            builder = builder.with_listener(listener);
        }

        let executor = builder.build();
        ProcessEngine {
            store,
            jobs: JobService::new(executor.clone()),
            executor,
        }
    }
}

impl Default for ProcessEngineBuilder {
    fn default() -> Self {
        Self::new()
    }
}
