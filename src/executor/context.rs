use super::command::{Command, downcast_output};
use super::event::EngineEvent;
use super::interceptor::Invocation;
use super::EngineServices;
use crate::config::EngineConfig;
use crate::core::{EngineError, Result};
use crate::storage::TransactionalStore;
use crate::transaction::{ContextId, ContextState, Entity, EntityQuery, EntitySession};
use chrono::{DateTime, Utc};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Per-kind entity manager, created at most once per execution context.
pub trait EntityManager: Send + Sync + 'static {
    fn create(services: &EngineServices) -> Self
    where
        Self: Sized;
}

type Callback = Box<dyn FnOnce() + Send>;

/// Handle to the store for one logical unit of work.
///
/// A context is opened by the outermost command and reused by every command
/// that command invokes through [`ExecutionContext::execute`]. It is used by
/// one call stack at a time and is never shared across tasks.
pub struct ExecutionContext {
    id: ContextId,
    state: ContextState,
    services: Arc<EngineServices>,
    session: EntitySession,
    managers: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    depth: usize,
    rollback_only: bool,
    on_commit: Vec<Callback>,
    on_rollback: Vec<Callback>,
    events: Vec<EngineEvent>,
}

impl ExecutionContext {
    pub(crate) fn open(services: Arc<EngineServices>) -> Self {
        let id = ContextId::new();
        debug!(ctx = %id, "execution context opened");
        Self {
            id,
            state: ContextState::Active,
            services,
            session: EntitySession::new(),
            managers: HashMap::new(),
            depth: 0,
            rollback_only: false,
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> ContextId {
        self.id
    }

    pub fn state(&self) -> ContextState {
        self.state
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.services.clock.now()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.services.config
    }

    pub fn services(&self) -> &Arc<EngineServices> {
        &self.services
    }

    fn store(&self) -> &dyn TransactionalStore {
        self.services.store.as_ref()
    }

    /// Number of commands currently running on this context.
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// True while a nested command runs on its caller's context.
    pub fn is_reused(&self) -> bool {
        self.depth > 1
    }

    pub(crate) fn enter(&mut self) {
        self.depth += 1;
    }

    pub(crate) fn exit(&mut self) {
        self.depth = self.depth.saturating_sub(1);
    }

    pub fn is_rollback_only(&self) -> bool {
        self.rollback_only
    }

    pub fn set_rollback_only(&mut self) {
        self.rollback_only = true;
    }

    /// Undo a rollback-only mark left by a nested command whose failure the
    /// caller has handled.
    pub fn clear_rollback_only(&mut self) {
        self.rollback_only = false;
    }

    /// Run after a successful top-level commit.
    pub fn on_commit<F: FnOnce() + Send + 'static>(&mut self, callback: F) {
        self.on_commit.push(Box::new(callback));
    }

    /// Run after the unit of work is rolled back.
    pub fn on_rollback<F: FnOnce() + Send + 'static>(&mut self, callback: F) {
        self.on_rollback.push(Box::new(callback));
    }

    /// Queue an event for delivery to listeners once the commit succeeded.
    pub fn dispatch_event(&mut self, event: EngineEvent) {
        self.events.push(event);
    }

    /// Lazily created, context-scoped manager instance.
    pub fn manager<M: EntityManager>(&mut self) -> Arc<M> {
        let services = &self.services;
        let entry = self
            .managers
            .entry(TypeId::of::<M>())
            .or_insert_with(|| Arc::new(M::create(services)) as Arc<dyn Any + Send + Sync>);
        match entry.clone().downcast::<M>() {
            Ok(manager) => manager,
            // keyed by TypeId, so the stored value is always an M
            Err(_) => Arc::new(M::create(&self.services)),
        }
    }

    // ------------------------------------------------------------------
    // Nested commands
    // ------------------------------------------------------------------

    /// Run `command` on this context. No commit boundary is created: its
    /// writes are visible to the caller right away and share the caller's fate.
    pub async fn execute<C: Command>(&mut self, command: &C) -> Result<C::Output> {
        let services = self.services.clone();
        let output = Invocation::nested(command, self, &services).proceed().await?;
        downcast_output(output)
    }

    // ------------------------------------------------------------------
    // Typed entity access
    // ------------------------------------------------------------------

    pub async fn find<T: Entity>(&mut self, id: &str) -> Result<Option<T>> {
        let key = crate::storage::RecordKey::new(T::KIND, id);
        let store = self.services.store.clone();
        match self.session.get(store.as_ref(), &key).await? {
            Some(record) => Ok(Some(T::from_record(record)?)),
            None => Ok(None),
        }
    }

    /// Like [`find`](Self::find) but absence is a `NotFound` error.
    pub async fn require<T: Entity>(&mut self, id: &str) -> Result<T> {
        self.find::<T>(id)
            .await?
            .ok_or_else(|| EngineError::not_found(T::KIND, id))
    }

    pub async fn query<T: Entity>(&mut self, query: EntityQuery<T>) -> Result<Vec<T>> {
        let store = self.services.store.clone();
        let records = self
            .session
            .query(store.as_ref(), &query.to_record_query())
            .await?;
        let entities = records
            .into_iter()
            .map(T::from_record)
            .collect::<Result<Vec<T>>>()?;
        Ok(query.finish(entities))
    }

    /// Stage an insert. The entity's revision becomes the one it will have
    /// after commit.
    pub fn insert<T: Entity>(&mut self, entity: &mut T) -> Result<()> {
        let revision = self.session.stage_insert(entity.key(), entity.to_body()?)?;
        entity.set_revision(revision);
        Ok(())
    }

    /// Stage an update conditioned on the entity's current revision.
    pub fn update<T: Entity>(&mut self, entity: &mut T) -> Result<()> {
        let revision = self
            .session
            .stage_update(entity.key(), entity.revision(), entity.to_body()?)?;
        entity.set_revision(revision);
        Ok(())
    }

    /// Stage a delete conditioned on the entity's current revision.
    pub fn delete<T: Entity>(&mut self, entity: &T) -> Result<()> {
        self.session.stage_delete(entity.key(), entity.revision())
    }

    /// Delete by id; returns false when there is nothing to delete.
    pub async fn delete_by_id<T: Entity>(&mut self, id: &str) -> Result<bool> {
        match self.find::<T>(id).await? {
            Some(entity) => {
                self.delete(&entity)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn pending_writes(&self) -> usize {
        self.session.pending_count()
    }

    // ------------------------------------------------------------------
    // Closing
    // ------------------------------------------------------------------

    /// Finish the unit of work for the outermost command: commit on success,
    /// roll back on failure or when marked rollback-only.
    pub(crate) async fn close<T>(&mut self, result: Result<T>) -> Result<T> {
        match result {
            Ok(value) if !self.rollback_only => {
                self.commit().await?;
                Ok(value)
            }
            Ok(_) => {
                self.rollback();
                Err(EngineError::Fatal(format!(
                    "{} was marked rollback-only by a nested command",
                    self.id
                )))
            }
            Err(err) => {
                self.rollback();
                Err(err)
            }
        }
    }

    async fn commit(&mut self) -> Result<()> {
        let changes = self.session.flush();
        let change_count = changes.len();

        if let Err(err) = self.store().commit(changes).await {
            debug!(ctx = %self.id, error = %err, "commit rejected by store");
            self.rollback();
            return Err(err);
        }

        self.state.transition(self.id, ContextState::Committed)?;
        debug!(ctx = %self.id, changes = change_count, "execution context committed");

        self.on_rollback.clear();
        for callback in std::mem::take(&mut self.on_commit) {
            callback();
        }

        let events = std::mem::take(&mut self.events);
        for event in &events {
            for listener in &self.services.listeners {
                listener.on_event(event);
            }
        }
        Ok(())
    }

    fn rollback(&mut self) {
        let discarded = self.session.pending_count();
        self.session.discard();
        self.events.clear();
        self.on_commit.clear();

        if let Err(err) = self.state.transition(self.id, ContextState::RolledBack) {
            debug!(ctx = %self.id, error = %err, "rollback on closed context");
            return;
        }
        debug!(ctx = %self.id, discarded, "execution context rolled back");

        for callback in std::mem::take(&mut self.on_rollback) {
            callback();
        }
    }
}

impl std::fmt::Debug for ExecutionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContext")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("depth", &self.depth)
            .field("rollback_only", &self.rollback_only)
            .field("pending_writes", &self.session.pending_count())
            .finish()
    }
}
