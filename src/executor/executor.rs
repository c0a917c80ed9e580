use super::command::{Command, downcast_output};
use super::event::EventListener;
use super::interceptor::{
    CommandInterceptor, ContextInterceptor, Invocation, LogInterceptor, RetryInterceptor,
};
use crate::config::EngineConfig;
use crate::core::{Clock, Result, SystemClock};
use crate::storage::TransactionalStore;
use std::sync::Arc;

/// Everything a command can reach besides its own context: the store, the
/// time source, configuration, the interceptor chain and event listeners.
pub struct EngineServices {
    pub store: Arc<dyn TransactionalStore>,
    pub clock: Arc<dyn Clock>,
    pub config: EngineConfig,
    pub interceptors: Vec<Arc<dyn CommandInterceptor>>,
    pub listeners: Vec<Arc<dyn EventListener>>,
}

/// Entry point of the pipeline.
///
/// Cheap to clone; clones share the same services.
#[derive(Clone)]
pub struct CommandExecutor {
    services: Arc<EngineServices>,
}

impl CommandExecutor {
    pub fn builder(store: Arc<dyn TransactionalStore>) -> CommandExecutorBuilder {
        CommandExecutorBuilder::new(store)
    }

    /// Run `command` as its own unit of work: commit when it returns `Ok`,
    /// roll back otherwise.
    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Output> {
        let output = Invocation::top_level(command, &self.services)
            .proceed()
            .await?;
        downcast_output(output)
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.services.clock
    }

    pub fn store(&self) -> &Arc<dyn TransactionalStore> {
        &self.services.store
    }

    /// Interceptor names, outermost first.
    pub fn interceptor_names(&self) -> Vec<&'static str> {
        self.services.interceptors.iter().map(|i| i.name()).collect()
    }
}

pub struct CommandExecutorBuilder {
    store: Arc<dyn TransactionalStore>,
    clock: Arc<dyn Clock>,
    config: EngineConfig,
    custom: Vec<Arc<dyn CommandInterceptor>>,
    listeners: Vec<Arc<dyn EventListener>>,
}

impl CommandExecutorBuilder {
    pub fn new(store: Arc<dyn TransactionalStore>) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config: EngineConfig::default(),
            custom: Vec::new(),
            listeners: Vec::new(),
        }
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Add an interceptor between the retry and context interceptors.
    /// Interceptors run in the order they were added.
    pub fn with_interceptor(mut self, interceptor: Arc<dyn CommandInterceptor>) -> Self {
        self.custom.push(interceptor);
        self
    }

    pub fn with_listener(mut self, listener: Arc<dyn EventListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn build(self) -> CommandExecutor {
        let mut interceptors: Vec<Arc<dyn CommandInterceptor>> = Vec::new();
        interceptors.push(Arc::new(LogInterceptor));
        interceptors.push(Arc::new(RetryInterceptor::new(
            self.config.conflict_retry.clone(),
        )));
        interceptors.extend(self.custom);
        interceptors.push(Arc::new(ContextInterceptor));

        CommandExecutor {
            services: Arc::new(EngineServices {
                store: self.store,
                clock: self.clock,
                config: self.config,
                interceptors,
                listeners: self.listeners,
            }),
        }
    }
}
