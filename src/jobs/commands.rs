//! Job operations as commands. Each one is a thin wrapper that runs the
//! matching [`JobManager`] operation inside the caller's execution context.

use super::manager::{JobFailure, JobManager};
use super::model::{DeadLetterJob, Job, JobDefinition, JobPopulation, JobState, SuspendedJob};
use super::registry::JobHandlerRegistry;
use crate::config::TenantFilter;
use crate::core::{EngineError, Result};
use crate::document::DocumentManager;
use crate::executor::{Command, CommandExt, ExecutionContext, Guarded};
use crate::scope::ActiveScope;
use crate::transaction::Entity;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

pub struct CreateJobCmd {
    pub definition: JobDefinition,
}

impl CreateJobCmd {
    pub fn new(definition: JobDefinition) -> Self {
        Self { definition }
    }
}

#[async_trait]
impl Command for CreateJobCmd {
    type Output = String;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<String> {
        ctx.manager::<JobManager>().create(ctx, &self.definition).await
    }
}

pub struct FindJobCmd {
    pub job_id: String,
}

#[async_trait]
impl Command for FindJobCmd {
    type Output = Option<Job>;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Option<Job>> {
        ctx.manager::<JobManager>().find(ctx, &self.job_id).await
    }
}

/// Read-only acquisition scan.
pub struct FindAcquirableJobsCmd {
    pub batch_size: usize,
    pub tenant_filter: TenantFilter,
}

#[async_trait]
impl Command for FindAcquirableJobsCmd {
    type Output = Vec<Job>;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Vec<Job>> {
        if self.batch_size == 0 {
            return Err(EngineError::IllegalArgument("batch size must be > 0".into()));
        }
        ctx.manager::<JobManager>()
            .find_acquirable(ctx, self.batch_size, &self.tenant_filter)
            .await
    }
}

/// Lease attempt for one acquisition candidate.
pub struct LockJobCmd {
    pub job_id: String,
    pub lock_owner: String,
    pub lease: Duration,
}

#[async_trait]
impl Command for LockJobCmd {
    type Output = Option<Job>;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Option<Job>> {
        ctx.manager::<JobManager>()
            .lock(ctx, &self.job_id, &self.lock_owner, self.lease)
            .await
    }
}

pub struct UnacquireJobCmd {
    pub job_id: String,
}

#[async_trait]
impl Command for UnacquireJobCmd {
    type Output = bool;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<bool> {
        ctx.manager::<JobManager>().unacquire(ctx, &self.job_id).await
    }
}

pub struct UnacquireAllOwnedByCmd {
    pub lock_owner: String,
}

#[async_trait]
impl Command for UnacquireAllOwnedByCmd {
    type Output = usize;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<usize> {
        require_owner(&self.lock_owner)?;
        ctx.manager::<JobManager>()
            .unacquire_all_owned_by(ctx, &self.lock_owner)
            .await
    }
}

pub struct ClearLockTimesCmd {
    pub lock_owner: String,
    pub tenant_filter: TenantFilter,
}

#[async_trait]
impl Command for ClearLockTimesCmd {
    type Output = usize;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<usize> {
        require_owner(&self.lock_owner)?;
        ctx.manager::<JobManager>()
            .clear_lock_times(ctx, &self.lock_owner, &self.tenant_filter)
            .await
    }
}

/// Success report from a worker that ran the job itself.
pub struct CompleteJobCmd {
    pub job_id: String,
    pub lock_owner: String,
}

#[async_trait]
impl Command for CompleteJobCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let jobs = ctx.manager::<JobManager>();
        let now = ctx.now();
        let job = jobs.require(ctx, &self.job_id).await?;
        jobs.ensure_lease(&job, &self.lock_owner, now)?;
        jobs.complete(ctx, &job).await
    }
}

pub struct RecordJobFailureCmd {
    pub job_id: String,
    pub lock_owner: Option<String>,
    pub failure: JobFailure,
}

#[async_trait]
impl Command for RecordJobFailureCmd {
    type Output = JobState;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<JobState> {
        ctx.manager::<JobManager>()
            .record_failure(ctx, &self.job_id, self.lock_owner.as_deref(), &self.failure)
            .await
    }
}

/// Run a leased job's handler and delete the job in the same commit.
///
/// Fails with a revision conflict when the lease was lost; the handler does
/// not run in that case. A handler failure rolls the whole unit of work back.
pub struct ExecuteJobCmd {
    pub job_id: String,
    pub lock_owner: String,
    pub registry: Arc<JobHandlerRegistry>,
}

#[async_trait]
impl Command for ExecuteJobCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<()> {
        let jobs = ctx.manager::<JobManager>();
        let now = ctx.now();
        let job = match jobs.find(ctx, &self.job_id).await? {
            Some(job) => job,
            None => return Err(EngineError::conflict(Job::KIND, &self.job_id, 0, None)),
        };
        jobs.ensure_lease(&job, &self.lock_owner, now)?;

        let handler = self.registry.get(&job.core.handler_type).ok_or_else(|| {
            EngineError::Fatal(format!(
                "no handler registered for job handler type '{}'",
                job.core.handler_type
            ))
        })?;

        let payload = match job.core.payload_id.as_deref() {
            Some(id) => ctx
                .manager::<DocumentManager>()
                .find(ctx, id)
                .await?
                .map(|document| document.bytes),
            None => None,
        };

        handler.execute(&job, payload, ctx).await?;
        jobs.complete(ctx, &job).await
    }
}

pub struct DeleteJobCmd {
    pub job_id: String,
}

#[async_trait]
impl Command for DeleteJobCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.manager::<JobManager>().delete(ctx, &self.job_id).await
    }
}

pub struct FindJobsBySearchKeyCmd {
    pub search_key: String,
}

#[async_trait]
impl Command for FindJobsBySearchKeyCmd {
    type Output = Vec<Job>;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Vec<Job>> {
        ctx.manager::<JobManager>()
            .find_by_search_key(ctx, &self.search_key)
            .await
    }
}

pub struct MoveJobToDeadLetterCmd {
    pub job_id: String,
}

#[async_trait]
impl Command for MoveJobToDeadLetterCmd {
    type Output = DeadLetterJob;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<DeadLetterJob> {
        ctx.manager::<JobManager>()
            .move_to_dead_letter(ctx, &self.job_id)
            .await
    }
}

pub struct MoveDeadLetterJobToExecutableCmd {
    pub job_id: String,
    pub retries: u32,
}

#[async_trait]
impl Command for MoveDeadLetterJobToExecutableCmd {
    type Output = Job;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Job> {
        ctx.manager::<JobManager>()
            .move_dead_letter_to_executable(ctx, &self.job_id, self.retries)
            .await
    }
}

pub struct SetJobRetriesCmd {
    pub job_id: String,
    pub retries: u32,
}

#[async_trait]
impl Command for SetJobRetriesCmd {
    type Output = Job;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Job> {
        ctx.manager::<JobManager>()
            .set_retries(ctx, &self.job_id, self.retries)
            .await
    }
}

pub struct DeleteDeadLetterJobCmd {
    pub job_id: String,
}

#[async_trait]
impl Command for DeleteDeadLetterJobCmd {
    type Output = ();

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<()> {
        ctx.manager::<JobManager>()
            .delete_dead_letter(ctx, &self.job_id)
            .await
    }
}

pub struct FindDeadLetterJobsCmd {
    pub scope_id: Option<String>,
}

#[async_trait]
impl Command for FindDeadLetterJobsCmd {
    type Output = Vec<DeadLetterJob>;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Vec<DeadLetterJob>> {
        ctx.manager::<JobManager>()
            .find_dead_letter_jobs(ctx, self.scope_id.as_deref())
            .await
    }
}

pub struct FindSuspendedJobsCmd {
    pub scope_id: Option<String>,
}

#[async_trait]
impl Command for FindSuspendedJobsCmd {
    type Output = Vec<SuspendedJob>;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Vec<SuspendedJob>> {
        ctx.manager::<JobManager>()
            .find_suspended_jobs(ctx, self.scope_id.as_deref())
            .await
    }
}

pub struct CountJobsCmd {
    pub population: JobPopulation,
}

#[async_trait]
impl Command for CountJobsCmd {
    type Output = usize;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<usize> {
        ctx.manager::<JobManager>().count(ctx, self.population).await
    }
}

/// Move a job's due date. Refused while the job's scope is suspended.
pub struct RescheduleJobCmd {
    pub job_id: String,
    pub due_date: DateTime<Utc>,
}

impl RescheduleJobCmd {
    pub fn guarded(job_id: &str, due_date: DateTime<Utc>) -> Guarded<ActiveScope, RescheduleJobCmd> {
        RescheduleJobCmd {
            job_id: job_id.to_string(),
            due_date,
        }
        .guarded_by(ActiveScope::of_job(job_id))
    }
}

#[async_trait]
impl Command for RescheduleJobCmd {
    type Output = Job;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<Job> {
        ctx.manager::<JobManager>()
            .reschedule(ctx, &self.job_id, self.due_date)
            .await
    }
}

fn require_owner(owner: &str) -> Result<()> {
    if owner.is_empty() {
        return Err(EngineError::IllegalArgument("lock owner is empty".into()));
    }
    Ok(())
}
