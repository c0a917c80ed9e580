use super::commands::*;
use super::manager::JobFailure;
use super::model::{DeadLetterJob, Job, JobDefinition, JobPopulation, JobState, SuspendedJob};
use crate::config::TenantFilter;
use crate::core::{EngineError, Result};
use crate::executor::CommandExecutor;
use crate::scope::{ActivateScopeCmd, SuspendScopeCmd};
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

/// Job operations for callers and workers. Every call is its own unit of
/// work, except acquisition which is one scan plus one unit of work per
/// candidate.
#[derive(Clone)]
pub struct JobService {
    executor: CommandExecutor,
}

impl JobService {
    pub fn new(executor: CommandExecutor) -> Self {
        Self { executor }
    }

    pub fn executor(&self) -> &CommandExecutor {
        &self.executor
    }

    pub async fn schedule(&self, definition: JobDefinition) -> Result<String> {
        self.executor.execute(&CreateJobCmd::new(definition)).await
    }

    pub async fn find(&self, job_id: &str) -> Result<Option<Job>> {
        self.executor
            .execute(&FindJobCmd {
                job_id: job_id.to_string(),
            })
            .await
    }

    /// Lease up to `batch_size` due jobs for `owner`.
    ///
    /// Candidates another worker wins in the meantime are skipped silently;
    /// the next scan will not see them until their lease is released or
    /// expires.
    pub async fn acquire_next_jobs(
        &self,
        owner: &str,
        lease: Duration,
        batch_size: usize,
        tenant_filter: &TenantFilter,
    ) -> Result<Vec<Job>> {
        if lease <= Duration::zero() {
            return Err(EngineError::IllegalArgument(format!(
                "lease duration must be positive, got {} ms",
                lease.num_milliseconds()
            )));
        }
        let candidates = self
            .executor
            .execute(&FindAcquirableJobsCmd {
                batch_size,
                tenant_filter: tenant_filter.clone(),
            })
            .await?;

        let mut acquired = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            let attempt = LockJobCmd {
                job_id: candidate.id.clone(),
                lock_owner: owner.to_string(),
                lease,
            };
            match self.executor.execute(&attempt).await {
                Ok(Some(job)) => acquired.push(job),
                Ok(None) => debug!(job = %candidate.id, owner, "candidate no longer acquirable"),
                Err(err) if err.is_revision_conflict() => {
                    debug!(job = %candidate.id, owner, "lost acquisition race, skipping")
                }
                Err(err) => return Err(err),
            }
        }
        Ok(acquired)
    }

    pub async fn unacquire(&self, job_id: &str) -> Result<bool> {
        self.executor
            .execute(&UnacquireJobCmd {
                job_id: job_id.to_string(),
            })
            .await
    }

    pub async fn unacquire_all_owned_by(&self, owner: &str) -> Result<usize> {
        self.executor
            .execute(&UnacquireAllOwnedByCmd {
                lock_owner: owner.to_string(),
            })
            .await
    }

    pub async fn clear_lock_times(&self, owner: &str, tenant_filter: &TenantFilter) -> Result<usize> {
        self.executor
            .execute(&ClearLockTimesCmd {
                lock_owner: owner.to_string(),
                tenant_filter: tenant_filter.clone(),
            })
            .await
    }

    pub async fn record_success(&self, job_id: &str, owner: &str) -> Result<()> {
        self.executor
            .execute(&CompleteJobCmd {
                job_id: job_id.to_string(),
                lock_owner: owner.to_string(),
            })
            .await
    }

    pub async fn record_failure(
        &self,
        job_id: &str,
        owner: Option<&str>,
        failure: JobFailure,
    ) -> Result<JobState> {
        self.executor
            .execute(&RecordJobFailureCmd {
                job_id: job_id.to_string(),
                lock_owner: owner.map(str::to_string),
                failure,
            })
            .await
    }

    pub async fn suspend(&self, scope_id: &str) -> Result<usize> {
        self.executor.execute(&SuspendScopeCmd::new(scope_id)).await
    }

    pub async fn activate(&self, scope_id: &str) -> Result<usize> {
        self.executor.execute(&ActivateScopeCmd::new(scope_id)).await
    }

    pub async fn find_by_search_key(&self, key: &str) -> Result<Vec<Job>> {
        self.executor
            .execute(&FindJobsBySearchKeyCmd {
                search_key: key.to_string(),
            })
            .await
    }

    pub async fn delete(&self, job_id: &str) -> Result<()> {
        self.executor
            .execute(&DeleteJobCmd {
                job_id: job_id.to_string(),
            })
            .await
    }

    pub async fn reschedule(&self, job_id: &str, due_date: DateTime<Utc>) -> Result<Job> {
        self.executor
            .execute(&RescheduleJobCmd::guarded(job_id, due_date))
            .await
    }

    pub async fn move_to_dead_letter(&self, job_id: &str) -> Result<DeadLetterJob> {
        self.executor
            .execute(&MoveJobToDeadLetterCmd {
                job_id: job_id.to_string(),
            })
            .await
    }

    pub async fn move_dead_letter_to_executable(&self, job_id: &str, retries: u32) -> Result<Job> {
        self.executor
            .execute(&MoveDeadLetterJobToExecutableCmd {
                job_id: job_id.to_string(),
                retries,
            })
            .await
    }

    pub async fn set_retries(&self, job_id: &str, retries: u32) -> Result<Job> {
        self.executor
            .execute(&SetJobRetriesCmd {
                job_id: job_id.to_string(),
                retries,
            })
            .await
    }

    pub async fn delete_dead_letter(&self, job_id: &str) -> Result<()> {
        self.executor
            .execute(&DeleteDeadLetterJobCmd {
                job_id: job_id.to_string(),
            })
            .await
    }

    pub async fn find_dead_letter_jobs(&self, scope_id: Option<&str>) -> Result<Vec<DeadLetterJob>> {
        self.executor
            .execute(&FindDeadLetterJobsCmd {
                scope_id: scope_id.map(str::to_string),
            })
            .await
    }

    pub async fn find_suspended_jobs(&self, scope_id: Option<&str>) -> Result<Vec<SuspendedJob>> {
        self.executor
            .execute(&FindSuspendedJobsCmd {
                scope_id: scope_id.map(str::to_string),
            })
            .await
    }

    pub async fn count(&self, population: JobPopulation) -> Result<usize> {
        self.executor.execute(&CountJobsCmd { population }).await
    }
}
