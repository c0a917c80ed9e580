// ============================================================================
// Process Scopes
// ============================================================================
//
// A scope is the owner of a set of jobs (a process instance). Suspending it
// parks its jobs, activating it brings them back, and deleting it removes
// them from every population. Exclusive jobs additionally lease their scope
// so that at most one exclusive job per scope runs at a time.
//
// ============================================================================

use crate::core::{EngineError, Result};
use crate::executor::{
    Command, EngineEvent, EngineServices, EntityManager, ExecutionContext, Guard,
};
use crate::impl_entity;
use crate::jobs::JobManager;
use crate::transaction::EntityQuery;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessScope {
    pub id: String,
    pub tenant_id: Option<String>,
    pub business_key: Option<String>,
    pub suspended: bool,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub revision: u64,
}

impl_entity!(ProcessScope, "scope");

impl ProcessScope {
    pub fn new(id: &str, created_at: DateTime<Utc>) -> Self {
        Self {
            id: id.to_string(),
            tenant_id: None,
            business_key: None,
            suspended: false,
            lock_owner: None,
            lock_expiration_time: None,
            created_at,
            revision: 0,
        }
    }

    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration_time.is_some_and(|exp| exp > now)
    }

}

/// Context-scoped access to scopes.
pub struct ScopeManager;

impl EntityManager for ScopeManager {
    fn create(_services: &EngineServices) -> Self {
        ScopeManager
    }
}

impl ScopeManager {
    pub async fn find(&self, ctx: &mut ExecutionContext, id: &str) -> Result<Option<ProcessScope>> {
        ctx.find::<ProcessScope>(id).await
    }

    pub async fn require(&self, ctx: &mut ExecutionContext, id: &str) -> Result<ProcessScope> {
        ctx.require::<ProcessScope>(id).await
    }

    /// Whether the given scope exists and is suspended. Jobs without a scope,
    /// or whose scope record is gone, are never suspended.
    pub async fn is_suspended(&self, ctx: &mut ExecutionContext, id: Option<&str>) -> Result<bool> {
        match id {
            Some(id) => Ok(self.find(ctx, id).await?.is_some_and(|s| s.suspended)),
            None => Ok(false),
        }
    }

    /// Lease the scope for an exclusive job. Returns false while any valid
    /// lease is held, including one of the same owner for another job.
    pub async fn acquire_lease(
        &self,
        ctx: &mut ExecutionContext,
        id: &str,
        owner: &str,
        until: DateTime<Utc>,
    ) -> Result<bool> {
        let now = ctx.now();
        let Some(mut scope) = self.find(ctx, id).await? else {
            return Ok(true);
        };
        if scope.is_locked_at(now) {
            return Ok(false);
        }
        scope.lock_owner = Some(owner.to_string());
        scope.lock_expiration_time = Some(until);
        ctx.update(&mut scope)?;
        Ok(true)
    }

    /// Drop the scope lease taken together with a job lease. Owner and
    /// expiration must both match, so a lease taken later for another job
    /// stays in place.
    pub async fn release_lease(
        &self,
        ctx: &mut ExecutionContext,
        id: &str,
        owner: &str,
        expiration: Option<DateTime<Utc>>,
    ) -> Result<()> {
        if let Some(mut scope) = self.find(ctx, id).await?
            && scope.lock_owner.as_deref() == Some(owner)
            && scope.lock_expiration_time == expiration
        {
            scope.lock_owner = None;
            scope.lock_expiration_time = None;
            ctx.update(&mut scope)?;
        }
        Ok(())
    }

    pub async fn find_leased_by(&self, ctx: &mut ExecutionContext, owner: &str) -> Result<Vec<ProcessScope>> {
        let owner = owner.to_string();
        ctx.query(
            EntityQuery::<ProcessScope>::new()
                .filter(move |s| s.lock_owner.as_deref() == Some(owner.as_str())),
        )
        .await
    }
}

// ============================================================================
// Guard
// ============================================================================

enum ScopeTarget {
    Scope(String),
    OfJob(String),
}

/// Fails fast unless the scope exists and is not suspended.
pub struct ActiveScope {
    target: ScopeTarget,
}

impl ActiveScope {
    pub fn scope(scope_id: &str) -> Self {
        Self {
            target: ScopeTarget::Scope(scope_id.to_string()),
        }
    }

    /// Check the scope of an executable job. Jobs without a scope pass.
    pub fn of_job(job_id: &str) -> Self {
        Self {
            target: ScopeTarget::OfJob(job_id.to_string()),
        }
    }
}

#[async_trait]
impl Guard for ActiveScope {
    async fn check(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let scope_id = match &self.target {
            ScopeTarget::Scope(id) => id.clone(),
            ScopeTarget::OfJob(job_id) => {
                let job = ctx.require::<crate::jobs::Job>(job_id).await?;
                match job.core.scope_id {
                    Some(scope_id) => scope_id,
                    None => return Ok(()),
                }
            }
        };

        let scope = ctx.manager::<ScopeManager>().require(ctx, &scope_id).await?;
        if scope.suspended {
            return Err(EngineError::BusinessRuleViolation(format!(
                "scope '{}' is suspended",
                scope.id
            )));
        }
        Ok(())
    }
}

// ============================================================================
// Commands
// ============================================================================

pub struct CreateScopeCmd {
    pub id: String,
    pub tenant_id: Option<String>,
    pub business_key: Option<String>,
}

impl CreateScopeCmd {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            tenant_id: None,
            business_key: None,
        }
    }

    pub fn tenant(mut self, tenant_id: &str) -> Self {
        self.tenant_id = Some(tenant_id.to_string());
        self
    }

    pub fn business_key(mut self, key: &str) -> Self {
        self.business_key = Some(key.to_string());
        self
    }
}

#[async_trait]
impl Command for CreateScopeCmd {
    type Output = ProcessScope;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<ProcessScope> {
        if self.id.is_empty() {
            return Err(EngineError::IllegalArgument("scope id is empty".into()));
        }
        if ctx.find::<ProcessScope>(&self.id).await?.is_some() {
            return Err(EngineError::IllegalArgument(format!(
                "scope '{}' already exists",
                self.id
            )));
        }

        let mut scope = ProcessScope::new(&self.id, ctx.now());
        scope.tenant_id = self.tenant_id.clone();
        scope.business_key = self.business_key.clone();
        ctx.insert(&mut scope)?;
        Ok(scope)
    }
}

/// Suspend a scope and park every job of it that is not currently leased.
/// Returns the number of jobs parked; suspending twice parks nothing more.
pub struct SuspendScopeCmd {
    pub scope_id: String,
}

impl SuspendScopeCmd {
    pub fn new(scope_id: &str) -> Self {
        Self {
            scope_id: scope_id.to_string(),
        }
    }
}

#[async_trait]
impl Command for SuspendScopeCmd {
    type Output = usize;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<usize> {
        let mut scope = ctx.manager::<ScopeManager>().require(ctx, &self.scope_id).await?;
        if scope.suspended {
            debug!(scope = %scope.id, "scope already suspended");
            return Ok(0);
        }

        scope.suspended = true;
        ctx.update(&mut scope)?;

        let moved = ctx
            .manager::<JobManager>()
            .suspend_scope_jobs(ctx, &scope.id)
            .await?;
        ctx.dispatch_event(EngineEvent::ScopeSuspended {
            scope_id: scope.id.clone(),
            jobs_moved: moved,
        });
        Ok(moved)
    }
}

/// Activate a scope and return all of its parked jobs to the executable
/// population in the same commit. Returns the number of jobs restored.
pub struct ActivateScopeCmd {
    pub scope_id: String,
}

impl ActivateScopeCmd {
    pub fn new(scope_id: &str) -> Self {
        Self {
            scope_id: scope_id.to_string(),
        }
    }
}

#[async_trait]
impl Command for ActivateScopeCmd {
    type Output = usize;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<usize> {
        let mut scope = ctx.manager::<ScopeManager>().require(ctx, &self.scope_id).await?;
        if !scope.suspended {
            debug!(scope = %scope.id, "scope already active");
            return Ok(0);
        }

        scope.suspended = false;
        ctx.update(&mut scope)?;

        let moved = ctx
            .manager::<JobManager>()
            .activate_scope_jobs(ctx, &scope.id)
            .await?;
        ctx.dispatch_event(EngineEvent::ScopeActivated {
            scope_id: scope.id.clone(),
            jobs_moved: moved,
        });
        Ok(moved)
    }
}

/// Outcome of a bulk delete, item by item.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BulkDeleteReport {
    pub deleted: Vec<String>,
    /// Ids that did not exist
    pub skipped: Vec<String>,
    pub failed: Vec<(String, EngineError)>,
}

impl BulkDeleteReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Delete process instances together with their jobs in every population
/// and the documents those jobs own.
///
/// Duplicate ids are deleted once. Missing ids are reported as skipped. An
/// instance that cannot be deleted (one of its jobs is leased) is reported as
/// failed and the others are still deleted.
pub struct DeleteProcessInstancesCmd {
    pub ids: Vec<String>,
}

impl DeleteProcessInstancesCmd {
    pub fn new<I, S>(ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            ids: ids.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl Command for DeleteProcessInstancesCmd {
    type Output = BulkDeleteReport;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<BulkDeleteReport> {
        if self.ids.is_empty() {
            return Err(EngineError::IllegalArgument(
                "process instance ids are empty".into(),
            ));
        }

        let mut seen = HashSet::new();
        let mut report = BulkDeleteReport::default();

        for id in &self.ids {
            if !seen.insert(id.as_str()) {
                continue;
            }
            if id.is_empty() {
                report
                    .failed
                    .push((id.clone(), EngineError::IllegalArgument("process instance id is empty".into())));
                continue;
            }

            let Some(scope) = ctx.find::<ProcessScope>(id).await? else {
                report.skipped.push(id.clone());
                continue;
            };

            let jobs = ctx.manager::<JobManager>();
            // checked before anything is staged, so a refused item leaves no writes behind
            if let Err(err) = jobs.ensure_scope_unlocked(ctx, &scope.id).await {
                report.failed.push((id.clone(), err));
                continue;
            }
            jobs.delete_scope_jobs(ctx, &scope.id).await?;
            ctx.delete(&scope)?;
            ctx.dispatch_event(EngineEvent::ScopeDeleted {
                scope_id: scope.id.clone(),
            });
            report.deleted.push(id.clone());
        }

        Ok(report)
    }
}
