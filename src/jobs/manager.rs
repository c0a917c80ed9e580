// ============================================================================
// Job Manager
// ============================================================================
//
// All job bookkeeping happens here, always inside the caller's execution
// context. There is no separate locking: a lease is just a conditional
// update of the job record, so two workers racing for the same job collide
// on its revision at commit time and exactly one of them wins.
//
// Populations:
//   job              due, scheduled for later, leased, or failed with retries left
//   suspended_job    parked while the owning scope is suspended
//   dead_letter_job  out of retries, kept for inspection
//
// ============================================================================

use super::model::{DeadLetterJob, Job, JobCore, JobDefinition, JobPopulation, JobState, SuspendedJob};
use crate::config::TenantFilter;
use crate::core::{EngineError, Result};
use crate::document::DocumentManager;
use crate::executor::{EngineEvent, EngineServices, EntityManager, ExecutionContext};
use crate::scope::{ProcessScope, ScopeManager};
use crate::transaction::{Entity, EntityQuery};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, warn};

/// Failure reported by a job handler.
#[derive(Debug, Clone, PartialEq)]
pub struct JobFailure {
    pub message: String,
    /// Full failure text (stack trace, cause chain). Defaults to the message.
    pub detail: Option<String>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl From<&EngineError> for JobFailure {
    fn from(err: &EngineError) -> Self {
        JobFailure::new(err.to_string()).with_detail(format!("{err:?}"))
    }
}

pub struct JobManager {
    max_exception_message_length: usize,
    retry_wait: Duration,
    default_retries: u32,
}

impl EntityManager for JobManager {
    fn create(services: &EngineServices) -> Self {
        Self {
            max_exception_message_length: services.config.max_exception_message_length,
            retry_wait: services.config.job_executor.retry_wait_value(),
            default_retries: services.config.job_executor.default_retries,
        }
    }
}

impl JobManager {
    // ------------------------------------------------------------------
    // Scheduling and lookup
    // ------------------------------------------------------------------

    /// Schedule a job. A job for a suspended scope is parked right away.
    pub async fn create(&self, ctx: &mut ExecutionContext, definition: &JobDefinition) -> Result<String> {
        if definition.handler_type.is_empty() {
            return Err(EngineError::IllegalArgument("job handler type is empty".into()));
        }

        let scope = match &definition.scope_id {
            Some(scope_id) => ctx.find::<ProcessScope>(scope_id).await?,
            None => None,
        };

        let payload_id = match &definition.payload {
            Some(bytes) => Some(
                ctx.manager::<DocumentManager>()
                    .insert(ctx, "job-payload", bytes.clone())?,
            ),
            None => None,
        };

        let now = ctx.now();
        let core = JobCore {
            job_type: definition.job_type,
            handler_type: definition.handler_type.clone(),
            handler_configuration: definition.handler_configuration.clone(),
            scope_id: definition.scope_id.clone(),
            exclusive: definition.exclusive,
            due_date: definition.due_date.unwrap_or(now),
            retries: definition.retries.unwrap_or(self.default_retries),
            exception_message: None,
            exception_detail_id: None,
            payload_id,
            tenant_id: definition
                .tenant_id
                .clone()
                .or_else(|| scope.as_ref().and_then(|s| s.tenant_id.clone())),
            search_key: definition.search_key.clone(),
            created_at: now,
        };

        let id = uuid::Uuid::new_v4().to_string();
        let job = Job::new(id.clone(), core);
        if scope.is_some_and(|s| s.suspended) {
            ctx.insert(&mut job.into_suspended())?;
        } else {
            ctx.insert(&mut job.clone())?;
        }

        ctx.dispatch_event(EngineEvent::JobCreated {
            job_id: id.clone(),
            scope_id: definition.scope_id.clone(),
        });
        Ok(id)
    }

    pub async fn find(&self, ctx: &mut ExecutionContext, job_id: &str) -> Result<Option<Job>> {
        ctx.find::<Job>(job_id).await
    }

    pub async fn require(&self, ctx: &mut ExecutionContext, job_id: &str) -> Result<Job> {
        ctx.require::<Job>(job_id).await
    }

    /// Due jobs nobody holds a valid lease on, earliest due first.
    pub async fn find_acquirable(
        &self,
        ctx: &mut ExecutionContext,
        batch_size: usize,
        tenant_filter: &TenantFilter,
    ) -> Result<Vec<Job>> {
        let now = ctx.now();
        let tenant_filter = tenant_filter.clone();
        ctx.query(
            EntityQuery::<Job>::new()
                .filter(move |job| {
                    job.is_acquirable_at(now) && tenant_filter.matches(job.core.tenant_id.as_deref())
                })
                .order_by(|a, b| {
                    a.core
                        .due_date
                        .cmp(&b.core.due_date)
                        .then(a.core.created_at.cmp(&b.core.created_at))
                        .then_with(|| a.id.cmp(&b.id))
                })
                .limit(batch_size),
        )
        .await
    }

    pub async fn find_by_search_key(&self, ctx: &mut ExecutionContext, key: &str) -> Result<Vec<Job>> {
        let key = key.to_string();
        ctx.query(
            EntityQuery::<Job>::new()
                .filter(move |job| job.core.search_key.as_deref() == Some(key.as_str()))
                .order_by(|a, b| a.core.created_at.cmp(&b.core.created_at).then_with(|| a.id.cmp(&b.id))),
        )
        .await
    }

    pub async fn find_jobs(&self, ctx: &mut ExecutionContext, scope_id: Option<&str>) -> Result<Vec<Job>> {
        ctx.query(by_scope::<Job>(scope_id, |j| &j.core)).await
    }

    pub async fn find_suspended_jobs(
        &self,
        ctx: &mut ExecutionContext,
        scope_id: Option<&str>,
    ) -> Result<Vec<SuspendedJob>> {
        ctx.query(by_scope::<SuspendedJob>(scope_id, |j| &j.core)).await
    }

    pub async fn find_dead_letter_jobs(
        &self,
        ctx: &mut ExecutionContext,
        scope_id: Option<&str>,
    ) -> Result<Vec<DeadLetterJob>> {
        ctx.query(by_scope::<DeadLetterJob>(scope_id, |j| &j.core)).await
    }

    pub async fn count(&self, ctx: &mut ExecutionContext, population: JobPopulation) -> Result<usize> {
        Ok(match population {
            JobPopulation::Executable => self.find_jobs(ctx, None).await?.len(),
            JobPopulation::Suspended => self.find_suspended_jobs(ctx, None).await?.len(),
            JobPopulation::DeadLetter => self.find_dead_letter_jobs(ctx, None).await?.len(),
        })
    }

    // ------------------------------------------------------------------
    // Leasing
    // ------------------------------------------------------------------

    /// Try to lease one job for `owner`.
    ///
    /// Returns `None` when the job is gone, not due, validly leased by
    /// someone, or its exclusive scope is leased by another owner. A job whose
    /// scope has been suspended is parked instead of leased.
    pub async fn lock(
        &self,
        ctx: &mut ExecutionContext,
        job_id: &str,
        owner: &str,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let now = ctx.now();
        let until = lease_until(now, lease)?;
        let Some(mut job) = self.find(ctx, job_id).await? else {
            return Ok(None);
        };
        if !job.is_acquirable_at(now) {
            return Ok(None);
        }

        let scopes = ctx.manager::<ScopeManager>();
        if scopes.is_suspended(ctx, job.core.scope_id.as_deref()).await? {
            debug!(job = %job.id, "scope suspended, parking job instead of locking");
            self.park(ctx, job)?;
            return Ok(None);
        }

        if job.core.exclusive
            && let Some(scope_id) = job.core.scope_id.clone()
            && !scopes.acquire_lease(ctx, &scope_id, owner, until).await?
        {
            debug!(job = %job.id, scope = %scope_id, "exclusive scope already leased");
            return Ok(None);
        }

        job.lock_owner = Some(owner.to_string());
        job.lock_expiration_time = Some(until);
        ctx.update(&mut job)?;

        ctx.dispatch_event(EngineEvent::JobLocked {
            job_id: job.id.clone(),
            lock_owner: owner.to_string(),
        });
        Ok(Some(job))
    }

    /// Give a leased job back. Returns false if there was nothing to release.
    pub async fn unacquire(&self, ctx: &mut ExecutionContext, job_id: &str) -> Result<bool> {
        let Some(job) = self.find(ctx, job_id).await? else {
            return Ok(false);
        };
        if job.lock_owner.is_none() && job.lock_expiration_time.is_none() {
            return Ok(false);
        }
        self.release(ctx, job).await?;
        Ok(true)
    }

    /// Release every job `owner` holds, expired or not. Jobs of a suspended
    /// scope are parked on the way.
    pub async fn unacquire_all_owned_by(&self, ctx: &mut ExecutionContext, owner: &str) -> Result<usize> {
        let jobs = self.find_owned_by(ctx, owner, &TenantFilter::Any).await?;
        let count = jobs.len();
        for job in jobs {
            self.release(ctx, job).await?;
        }

        let scopes = ctx.manager::<ScopeManager>();
        for mut scope in scopes.find_leased_by(ctx, owner).await? {
            scope.lock_owner = None;
            scope.lock_expiration_time = None;
            ctx.update(&mut scope)?;
        }

        debug!(owner, count, "unacquired all jobs of owner");
        Ok(count)
    }

    /// Expire every lease `owner` holds without touching the owner field.
    /// The jobs become acquirable at once.
    pub async fn clear_lock_times(
        &self,
        ctx: &mut ExecutionContext,
        owner: &str,
        tenant_filter: &TenantFilter,
    ) -> Result<usize> {
        let jobs: Vec<Job> = self
            .find_owned_by(ctx, owner, tenant_filter)
            .await?
            .into_iter()
            .filter(|job| job.lock_expiration_time.is_some())
            .collect();
        for mut job in jobs.iter().cloned() {
            job.lock_expiration_time = None;
            ctx.update(&mut job)?;
        }

        let scopes = ctx.manager::<ScopeManager>();
        for mut scope in scopes.find_leased_by(ctx, owner).await? {
            if scope.lock_expiration_time.is_some() && tenant_filter.matches(scope.tenant_id.as_deref()) {
                scope.lock_expiration_time = None;
                ctx.update(&mut scope)?;
            }
        }

        debug!(owner, count = jobs.len(), "cleared lock times");
        Ok(jobs.len())
    }

    async fn find_owned_by(
        &self,
        ctx: &mut ExecutionContext,
        owner: &str,
        tenant_filter: &TenantFilter,
    ) -> Result<Vec<Job>> {
        let owner = owner.to_string();
        let tenant_filter = tenant_filter.clone();
        ctx.query(EntityQuery::<Job>::new().filter(move |job| {
            job.lock_owner.as_deref() == Some(owner.as_str())
                && tenant_filter.matches(job.core.tenant_id.as_deref())
        }))
        .await
    }

    /// Check that `owner` still holds a valid lease on the job.
    pub fn ensure_lease(&self, job: &Job, owner: &str, now: DateTime<Utc>) -> Result<()> {
        if job.is_locked_by(owner, now) {
            Ok(())
        } else {
            Err(EngineError::conflict(Job::KIND, &job.id, job.revision, None))
        }
    }

    // ------------------------------------------------------------------
    // Outcomes
    // ------------------------------------------------------------------

    /// Remove a successfully executed job with everything it owns.
    pub async fn complete(&self, ctx: &mut ExecutionContext, job: &Job) -> Result<()> {
        self.release_scope_lease(ctx, job).await?;
        ctx.delete(job)?;
        self.delete_documents(ctx, &job.core).await?;
        ctx.dispatch_event(EngineEvent::JobCompleted { job_id: job.id.clone() });
        Ok(())
    }

    /// Apply retry accounting to a failed job.
    ///
    /// The retry count drops by one. At zero the job is dead-lettered,
    /// otherwise its lease is cleared and it becomes due again after the
    /// configured retry wait. When `owner` is given and another owner now
    /// holds a valid lease, the failure is stale and rejected as a conflict.
    pub async fn record_failure(
        &self,
        ctx: &mut ExecutionContext,
        job_id: &str,
        owner: Option<&str>,
        failure: &JobFailure,
    ) -> Result<JobState> {
        let now = ctx.now();
        let mut job = self.require(ctx, job_id).await?;
        if let Some(owner) = owner
            && job.is_locked_at(now)
            && job.lock_owner.as_deref() != Some(owner)
        {
            return Err(EngineError::conflict(Job::KIND, &job.id, job.revision, None));
        }

        job.core.retries = job.core.retries.saturating_sub(1);
        job.core.exception_message = Some(truncate(&failure.message, self.max_exception_message_length));

        let documents = ctx.manager::<DocumentManager>();
        documents
            .delete_if_present(ctx, job.core.exception_detail_id.as_deref())
            .await?;
        let detail = failure.detail.as_ref().unwrap_or(&failure.message);
        job.core.exception_detail_id =
            Some(documents.insert(ctx, "exception-detail", detail.clone().into_bytes())?);

        self.release_scope_lease(ctx, &job).await?;
        job.clear_lock();

        if job.core.retries == 0 {
            warn!(job = %job.id, error = %failure.message, "job out of retries, moving to dead letter");
            ctx.delete(&job)?;
            let job_id = job.id.clone();
            ctx.insert(&mut job.into_dead_letter())?;
            ctx.dispatch_event(EngineEvent::JobDeadLettered { job_id });
            return Ok(JobState::Dead);
        }

        warn!(job = %job.id, retries_left = job.core.retries, error = %failure.message, "job failed");
        if self.retry_wait > Duration::zero() {
            job.core.due_date = now.checked_add_signed(self.retry_wait).ok_or_else(|| {
                EngineError::IllegalArgument(format!(
                    "retry wait of {} ms is out of range",
                    self.retry_wait.num_milliseconds()
                ))
            })?;
        }
        ctx.dispatch_event(EngineEvent::JobFailed {
            job_id: job.id.clone(),
            retries_left: job.core.retries,
        });

        let scopes = ctx.manager::<ScopeManager>();
        if scopes.is_suspended(ctx, job.core.scope_id.as_deref()).await? {
            self.park(ctx, job)?;
            return Ok(JobState::Suspended);
        }
        ctx.update(&mut job)?;
        Ok(JobState::FailedPendingRetry)
    }

    // ------------------------------------------------------------------
    // Suspension
    // ------------------------------------------------------------------

    /// Park every job of the scope that is not validly leased. Leased jobs
    /// keep running and are routed when released.
    pub async fn suspend_scope_jobs(&self, ctx: &mut ExecutionContext, scope_id: &str) -> Result<usize> {
        let now = ctx.now();
        let jobs = self.find_jobs(ctx, Some(scope_id)).await?;
        let mut moved = 0;
        for job in jobs {
            if job.is_locked_at(now) {
                debug!(job = %job.id, "leased job left running on suspend");
                continue;
            }
            self.park(ctx, job)?;
            moved += 1;
        }
        Ok(moved)
    }

    /// Bring back every parked job of the scope.
    pub async fn activate_scope_jobs(&self, ctx: &mut ExecutionContext, scope_id: &str) -> Result<usize> {
        let parked = self.find_suspended_jobs(ctx, Some(scope_id)).await?;
        for job in &parked {
            ctx.delete(job)?;
            ctx.insert(&mut job.clone().into_executable())?;
        }
        Ok(parked.len())
    }

    fn park(&self, ctx: &mut ExecutionContext, job: Job) -> Result<()> {
        ctx.delete(&job)?;
        ctx.insert(&mut job.into_suspended())
    }

    async fn release(&self, ctx: &mut ExecutionContext, mut job: Job) -> Result<()> {
        self.release_scope_lease(ctx, &job).await?;
        job.clear_lock();

        let scopes = ctx.manager::<ScopeManager>();
        if scopes.is_suspended(ctx, job.core.scope_id.as_deref()).await? {
            self.park(ctx, job)
        } else {
            ctx.update(&mut job)
        }
    }

    async fn release_scope_lease(&self, ctx: &mut ExecutionContext, job: &Job) -> Result<()> {
        if let (true, Some(scope_id), Some(owner)) =
            (job.core.exclusive, job.core.scope_id.as_deref(), job.lock_owner.as_deref())
        {
            ctx.manager::<ScopeManager>()
                .release_lease(ctx, scope_id, owner, job.lock_expiration_time)
                .await?;
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Administration
    // ------------------------------------------------------------------

    /// Delete one executable job. It must exist and must not be leased.
    pub async fn delete(&self, ctx: &mut ExecutionContext, job_id: &str) -> Result<()> {
        let now = ctx.now();
        let job = self.require(ctx, job_id).await?;
        if job.is_locked_at(now) {
            return Err(locked_violation(&job, "deleted"));
        }
        ctx.delete(&job)?;
        self.delete_documents(ctx, &job.core).await
    }

    pub async fn delete_dead_letter(&self, ctx: &mut ExecutionContext, job_id: &str) -> Result<()> {
        let job = ctx.require::<DeadLetterJob>(job_id).await?;
        ctx.delete(&job)?;
        self.delete_documents(ctx, &job.core).await
    }

    pub async fn move_to_dead_letter(&self, ctx: &mut ExecutionContext, job_id: &str) -> Result<DeadLetterJob> {
        let now = ctx.now();
        let job = self.require(ctx, job_id).await?;
        if job.is_locked_at(now) {
            return Err(locked_violation(&job, "moved to the dead letter population"));
        }
        ctx.delete(&job)?;
        let mut dead = job.into_dead_letter();
        ctx.insert(&mut dead)?;
        ctx.dispatch_event(EngineEvent::JobDeadLettered { job_id: dead.id.clone() });
        Ok(dead)
    }

    pub async fn move_dead_letter_to_executable(
        &self,
        ctx: &mut ExecutionContext,
        job_id: &str,
        retries: u32,
    ) -> Result<Job> {
        if retries == 0 {
            return Err(EngineError::IllegalArgument(
                "retries must be greater than 0 to make a dead letter job executable".into(),
            ));
        }
        let dead = ctx.require::<DeadLetterJob>(job_id).await?;
        ctx.delete(&dead)?;
        let mut job = dead.into_executable(retries);
        ctx.insert(&mut job)?;
        Ok(job)
    }

    pub async fn set_retries(&self, ctx: &mut ExecutionContext, job_id: &str, retries: u32) -> Result<Job> {
        let mut job = self.require(ctx, job_id).await?;
        job.core.retries = retries;
        ctx.update(&mut job)?;
        Ok(job)
    }

    pub async fn reschedule(&self, ctx: &mut ExecutionContext, job_id: &str, due_date: DateTime<Utc>) -> Result<Job> {
        let mut job = self.require(ctx, job_id).await?;
        job.core.due_date = due_date;
        ctx.update(&mut job)?;
        Ok(job)
    }

    /// Fails when any job of the scope is validly leased.
    pub async fn ensure_scope_unlocked(&self, ctx: &mut ExecutionContext, scope_id: &str) -> Result<()> {
        let now = ctx.now();
        let jobs = self.find_jobs(ctx, Some(scope_id)).await?;
        match jobs.iter().find(|job| job.is_locked_at(now)) {
            Some(job) => Err(locked_violation(job, "deleted with its scope")),
            None => Ok(()),
        }
    }

    /// Delete every job of the scope in all populations, with their documents.
    pub async fn delete_scope_jobs(&self, ctx: &mut ExecutionContext, scope_id: &str) -> Result<usize> {
        let mut deleted = 0;
        for job in self.find_jobs(ctx, Some(scope_id)).await? {
            ctx.delete(&job)?;
            self.delete_documents(ctx, &job.core).await?;
            deleted += 1;
        }
        for job in self.find_suspended_jobs(ctx, Some(scope_id)).await? {
            ctx.delete(&job)?;
            self.delete_documents(ctx, &job.core).await?;
            deleted += 1;
        }
        for job in self.find_dead_letter_jobs(ctx, Some(scope_id)).await? {
            ctx.delete(&job)?;
            self.delete_documents(ctx, &job.core).await?;
            deleted += 1;
        }
        Ok(deleted)
    }

    async fn delete_documents(&self, ctx: &mut ExecutionContext, core: &JobCore) -> Result<()> {
        let documents = ctx.manager::<DocumentManager>();
        for id in core.document_ids() {
            documents.delete_if_present(ctx, Some(&id)).await?;
        }
        Ok(())
    }
}

fn by_scope<T: Entity>(scope_id: Option<&str>, core: fn(&T) -> &JobCore) -> EntityQuery<T> {
    let query = EntityQuery::<T>::new().order_by(move |a, b| {
        core(a)
            .created_at
            .cmp(&core(b).created_at)
            .then_with(|| a.id().cmp(b.id()))
    });
    match scope_id {
        Some(scope_id) => {
            let scope_id = scope_id.to_string();
            query.filter(move |job| core(job).belongs_to(&scope_id))
        }
        None => query,
    }
}

/// Expiration of a lease of length `lease` taken at `now`.
pub(crate) fn lease_until(now: DateTime<Utc>, lease: Duration) -> Result<DateTime<Utc>> {
    if lease <= Duration::zero() {
        return Err(EngineError::IllegalArgument(format!(
            "lease duration must be positive, got {} ms",
            lease.num_milliseconds()
        )));
    }
    now.checked_add_signed(lease).ok_or_else(|| {
        EngineError::IllegalArgument(format!(
            "lease duration of {} ms is out of range",
            lease.num_milliseconds()
        ))
    })
}

fn locked_violation(job: &Job, action: &str) -> EngineError {
    EngineError::BusinessRuleViolation(format!(
        "job '{}' is locked by '{}' and cannot be {}",
        job.id,
        job.lock_owner.as_deref().unwrap_or("unknown"),
        action
    ))
}

fn truncate(message: &str, max_chars: usize) -> String {
    match message.char_indices().nth(max_chars) {
        Some((cut, _)) => message[..cut].to_string(),
        None => message.to_string(),
    }
}
