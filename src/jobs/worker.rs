use super::commands::ExecuteJobCmd;
use super::manager::JobFailure;
use super::model::{Job, JobState};
use super::registry::JobHandlerRegistry;
use super::service::JobService;
use crate::config::JobExecutorConfig;
use crate::core::{EngineError, Result};
use crate::executor::CommandExecutor;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What happened to one leased job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Failed { retries_left: u32 },
    DeadLettered,
    /// Failed while its scope was suspended, so it was parked.
    Suspended,
    /// Someone else holds the job now; nothing was recorded.
    LeaseLost,
}

/// Counters for one or more acquisition rounds.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub acquired: usize,
    pub completed: usize,
    pub failed: usize,
    pub dead_lettered: usize,
    pub lease_lost: usize,
}

impl RunSummary {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Failed { .. } | JobOutcome::Suspended => self.failed += 1,
            JobOutcome::DeadLettered => self.dead_lettered += 1,
            JobOutcome::LeaseLost => self.lease_lost += 1,
        }
    }

    pub fn merge(&mut self, other: RunSummary) {
        self.acquired += other.acquired;
        self.completed += other.completed;
        self.failed += other.failed;
        self.dead_lettered += other.dead_lettered;
        self.lease_lost += other.lease_lost;
    }
}

/// Polls for due jobs, leases them under this node's lock owner and runs
/// their handlers.
pub struct JobExecutor {
    service: JobService,
    registry: Arc<JobHandlerRegistry>,
    config: JobExecutorConfig,
    stop_tx: watch::Sender<bool>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl JobExecutor {
    pub fn new(executor: CommandExecutor, registry: JobHandlerRegistry) -> Self {
        let config = executor.config().job_executor.clone();
        let (stop_tx, _) = watch::channel(false);
        Self {
            service: JobService::new(executor),
            registry: Arc::new(registry),
            config,
            stop_tx,
            workers: Mutex::new(Vec::new()),
        }
    }

    pub fn lock_owner(&self) -> &str {
        &self.config.lock_owner
    }

    pub fn service(&self) -> &JobService {
        &self.service
    }

    /// One acquisition round: lease a batch and run every job in it.
    pub async fn run_once(&self) -> Result<RunSummary> {
        let jobs = self
            .service
            .acquire_next_jobs(
                &self.config.lock_owner,
                self.config.lease_duration_value(),
                self.config.acquire_batch_size,
                &self.config.tenant_filter,
            )
            .await?;

        let mut summary = RunSummary {
            acquired: jobs.len(),
            ..RunSummary::default()
        };
        for job in &jobs {
            summary.record(self.execute_job(job).await?);
        }
        Ok(summary)
    }

    /// Rounds until a scan comes back empty or `max_rounds` is reached.
    pub async fn run_until_idle(&self, max_rounds: usize) -> Result<RunSummary> {
        let mut total = RunSummary::default();
        for _ in 0..max_rounds {
            let round = self.run_once().await?;
            total.merge(round);
            if round.acquired == 0 {
                break;
            }
        }
        Ok(total)
    }

    /// Run a job this executor has leased.
    pub async fn execute_job(&self, job: &Job) -> Result<JobOutcome> {
        let command = ExecuteJobCmd {
            job_id: job.id.clone(),
            lock_owner: self.config.lock_owner.clone(),
            registry: self.registry.clone(),
        };

        let err = match self.service.executor().execute(&command).await {
            Ok(()) => return Ok(JobOutcome::Completed),
            Err(err) if err.is_revision_conflict() => {
                debug!(job = %job.id, error = %err, "lease lost before completion");
                return Ok(JobOutcome::LeaseLost);
            }
            Err(err) => err,
        };

        debug!(job = %job.id, error = %err, "job handler failed");
        match self
            .service
            .record_failure(&job.id, Some(&self.config.lock_owner), JobFailure::from(&err))
            .await
        {
            Ok(JobState::Dead) => Ok(JobOutcome::DeadLettered),
            Ok(JobState::Suspended) => Ok(JobOutcome::Suspended),
            Ok(_) => Ok(JobOutcome::Failed {
                retries_left: job.core.retries.saturating_sub(1),
            }),
            Err(err) if err.is_revision_conflict() || matches!(err, EngineError::NotFound { .. }) => {
                debug!(job = %job.id, error = %err, "failure not recorded, job moved on");
                Ok(JobOutcome::LeaseLost)
            }
            Err(err) => Err(err),
        }
    }

    /// Spawn `worker_count` polling tasks.
    pub async fn start(self: &Arc<Self>) -> Result<()> {
        let mut workers = self.workers.lock().await;
        if !workers.is_empty() {
            return Err(EngineError::IllegalArgument(format!(
                "job executor '{}' is already running",
                self.config.lock_owner
            )));
        }
        self.stop_tx.send_replace(false);

        for worker in 0..self.config.worker_count {
            let this = Arc::clone(self);
            let mut stop_rx = self.stop_tx.subscribe();
            workers.push(tokio::spawn(async move {
                loop {
                    if *stop_rx.borrow() {
                        break;
                    }
                    let idle = match this.run_once().await {
                        Ok(summary) => summary.acquired == 0,
                        Err(err) => {
                            warn!(worker, error = %err, "acquisition round failed");
                            true
                        }
                    };
                    if idle {
                        tokio::select! {
                            _ = stop_rx.changed() => {}
                            _ = tokio::time::sleep(this.config.idle_wait_value()) => {}
                        }
                    }
                }
                debug!(worker, "job worker stopped");
            }));
        }

        info!(
            owner = %self.config.lock_owner,
            workers = self.config.worker_count,
            "job executor started"
        );
        Ok(())
    }

    /// Signal every worker, wait for them, then hand back all jobs still
    /// leased by this executor's lock owner. Returns how many were released.
    pub async fn stop(&self) -> Result<usize> {
        self.stop_tx.send_replace(true);

        let handles: Vec<JoinHandle<()>> = self.workers.lock().await.drain(..).collect();
        for handle in handles {
            handle
                .await
                .map_err(|err| EngineError::Fatal(format!("job worker join: {}", err)))?;
        }

        let released = self
            .service
            .unacquire_all_owned_by(&self.config.lock_owner)
            .await?;
        info!(owner = %self.config.lock_owner, released, "job executor stopped");
        Ok(released)
    }
}

impl Drop for JobExecutor {
    fn drop(&mut self) {
        self.stop_tx.send_replace(true);
        if let Ok(mut workers) = self.workers.try_lock() {
            for handle in workers.drain(..) {
                handle.abort();
            }
        }
    }
}
