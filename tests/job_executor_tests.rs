/// Job executor tests
///
/// Acquisition rounds, handler execution inside the completing unit of work,
/// failure recording and the background worker lifecycle.
/// Run with: cargo test --test job_executor_tests

use async_trait::async_trait;
use chrono::Duration;
use procengine::document::{Document, JobPayload};
use procengine::jobs::JobOutcome;
use procengine::{
    EngineConfig, EngineError, ExecutionContext, Job, JobDefinition, JobExecutorConfig,
    JobHandler, JobHandlerRegistry, JobPopulation, ManualClock, ProcessEngine, Result,
    TenantFilter,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct ApprovalPayload {
    order: u32,
    approver: String,
}

/// Writes one document per job and remembers the payloads it saw.
#[derive(Default)]
struct ApproveHandler {
    seen: Mutex<Vec<ApprovalPayload>>,
}

#[async_trait]
impl JobHandler for ApproveHandler {
    fn handler_type(&self) -> &str {
        "approve"
    }

    async fn execute(
        &self,
        job: &Job,
        payload: Option<Vec<u8>>,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        if let Some(bytes) = payload {
            let decoded: ApprovalPayload = JobPayload::decode(&bytes)?;
            self.seen.lock().unwrap().push(decoded);
        }
        let mut doc = Document::new("approval", job.id.as_bytes().to_vec());
        ctx.insert(&mut doc)
    }
}

/// Writes a document and then fails, so the write must be rolled back.
#[derive(Default)]
struct RejectHandler {
    calls: AtomicUsize,
}

#[async_trait]
impl JobHandler for RejectHandler {
    fn handler_type(&self) -> &str {
        "reject"
    }

    async fn execute(
        &self,
        _job: &Job,
        _payload: Option<Vec<u8>>,
        ctx: &mut ExecutionContext,
    ) -> Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut doc = Document::new("partial", b"never committed".to_vec());
        ctx.insert(&mut doc)?;
        Err(EngineError::BusinessRuleViolation("approval rejected".into()))
    }
}

fn config(worker_count: usize) -> EngineConfig {
    EngineConfig::new("executor").job_executor(
        JobExecutorConfig::new("node-exec")
            .worker_count(worker_count)
            .acquire_batch_size(3)
            .idle_wait(std::time::Duration::from_millis(10))
            .retry_wait(std::time::Duration::ZERO),
    )
}

#[tokio::test]
async fn test_run_once_executes_a_batch() {
    let engine = ProcessEngine::builder().config(config(1)).build();
    for order in 0..4 {
        let payload = JobPayload::encode(&ApprovalPayload {
            order,
            approver: "ops".into(),
        })
        .unwrap();
        engine
            .jobs()
            .schedule(JobDefinition::async_continuation("approve").payload(payload))
            .await
            .unwrap();
    }

    let handler = Arc::new(ApproveHandler::default());
    let executor = engine.job_executor(JobHandlerRegistry::new().with_handler(handler.clone()));
    assert_eq!(executor.lock_owner(), "node-exec");

    let summary = executor.run_once().await.unwrap();
    assert_eq!(summary.acquired, 3);
    assert_eq!(summary.completed, 3);
    assert_eq!(engine.jobs().count(JobPopulation::Executable).await.unwrap(), 1);

    let summary = executor.run_until_idle(5).await.unwrap();
    assert_eq!(summary.completed, 1);
    assert_eq!(engine.jobs().count(JobPopulation::Executable).await.unwrap(), 0);

    // payload documents went away with their jobs, handler documents stayed
    assert_eq!(engine.store().count("document").await, 4);
    let mut orders: Vec<u32> = handler.seen.lock().unwrap().iter().map(|p| p.order).collect();
    orders.sort();
    assert_eq!(orders, vec![0, 1, 2, 3]);
}

#[tokio::test]
async fn test_handler_failure_rolls_back_and_records_retry() {
    let engine = ProcessEngine::builder().config(config(1)).build();
    let job_id = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("reject").retries(3))
        .await
        .unwrap();

    let handler = Arc::new(RejectHandler::default());
    let executor = engine.job_executor(JobHandlerRegistry::new().with_handler(handler.clone()));

    let summary = executor.run_once().await.unwrap();
    assert_eq!(summary.acquired, 1);
    assert_eq!(summary.failed, 1);

    let job = engine.jobs().find(&job_id).await.unwrap().unwrap();
    assert_eq!(job.core.retries, 2);
    assert!(job.lock_owner.is_none());
    assert_eq!(
        job.core.exception_message.as_deref(),
        Some("Business rule violation: approval rejected")
    );

    // only the failure detail survives; the handler's write was discarded
    assert_eq!(engine.store().count("document").await, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_repeated_failures_end_in_dead_letter() {
    let engine = ProcessEngine::builder().config(config(1)).build();
    engine
        .jobs()
        .schedule(JobDefinition::async_continuation("reject").retries(2))
        .await
        .unwrap();

    let handler = Arc::new(RejectHandler::default());
    let executor = engine.job_executor(JobHandlerRegistry::new().with_handler(handler.clone()));

    let summary = executor.run_until_idle(10).await.unwrap();
    assert_eq!(summary.acquired, 2);
    assert_eq!(summary.failed, 1);
    assert_eq!(summary.dead_lettered, 1);
    assert_eq!(handler.calls.load(Ordering::SeqCst), 2);
    assert_eq!(engine.jobs().count(JobPopulation::DeadLetter).await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_handler_type_counts_as_failure() {
    let engine = ProcessEngine::builder().config(config(1)).build();
    let job_id = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("unregistered"))
        .await
        .unwrap();

    let executor = engine.job_executor(JobHandlerRegistry::new());
    let summary = executor.run_once().await.unwrap();
    assert_eq!(summary.failed, 1);

    let job = engine.jobs().find(&job_id).await.unwrap().unwrap();
    assert!(
        job.core
            .exception_message
            .unwrap()
            .contains("no handler registered for job handler type 'unregistered'")
    );
}

#[tokio::test]
async fn test_job_leased_elsewhere_is_not_executed() {
    let clock = Arc::new(ManualClock::default());
    let engine = ProcessEngine::builder()
        .clock(clock.clone())
        .config(config(1))
        .build();
    engine
        .jobs()
        .schedule(JobDefinition::async_continuation("approve"))
        .await
        .unwrap();

    let foreign = engine
        .jobs()
        .acquire_next_jobs("node-other", Duration::minutes(5), 1, &TenantFilter::Any)
        .await
        .unwrap();

    let handler = Arc::new(ApproveHandler::default());
    let executor = engine.job_executor(JobHandlerRegistry::new().with_handler(handler.clone()));

    let outcome = executor.execute_job(&foreign[0]).await.unwrap();
    assert_eq!(outcome, JobOutcome::LeaseLost);
    assert_eq!(engine.store().count("document").await, 0);

    let job = engine.jobs().find(&foreign[0].id).await.unwrap().unwrap();
    assert_eq!(job.lock_owner.as_deref(), Some("node-other"));
    assert_eq!(job.core.retries, 3);
}

#[tokio::test]
async fn test_stop_releases_jobs_still_leased() {
    let engine = ProcessEngine::builder().config(config(1)).build();
    for _ in 0..2 {
        engine
            .jobs()
            .schedule(JobDefinition::async_continuation("approve"))
            .await
            .unwrap();
    }
    let executor = engine.job_executor(JobHandlerRegistry::new());
    engine
        .jobs()
        .acquire_next_jobs(
            executor.lock_owner(),
            Duration::minutes(5),
            5,
            &TenantFilter::Any,
        )
        .await
        .unwrap();

    assert_eq!(executor.stop().await.unwrap(), 2);
    let free = engine
        .jobs()
        .acquire_next_jobs("node-next", Duration::minutes(5), 5, &TenantFilter::Any)
        .await
        .unwrap();
    assert_eq!(free.len(), 2);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_background_workers_drain_due_jobs() {
    let engine = ProcessEngine::builder().config(config(3)).build();
    for _ in 0..12 {
        engine
            .jobs()
            .schedule(JobDefinition::async_continuation("approve"))
            .await
            .unwrap();
    }

    let handler = Arc::new(ApproveHandler::default());
    let executor = Arc::new(
        engine.job_executor(JobHandlerRegistry::new().with_handler(handler.clone())),
    );
    executor.start().await.unwrap();

    let err = executor.start().await.unwrap_err();
    assert!(matches!(err, EngineError::IllegalArgument(_)));

    let drained = tokio::time::timeout(std::time::Duration::from_secs(10), async {
        loop {
            if engine.jobs().count(JobPopulation::Executable).await.unwrap() == 0 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "workers did not drain the queue");

    assert_eq!(executor.stop().await.unwrap(), 0);
    assert_eq!(engine.store().count("document").await, 12);

    // a stopped executor can be started again
    executor.start().await.unwrap();
    executor.stop().await.unwrap();
}
