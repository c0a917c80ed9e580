/// Administrative command tests
///
/// Bulk deletion of process instances, batches, and operator actions on
/// individual jobs.
/// Run with: cargo test --test admin_command_tests

use chrono::Duration;
use procengine::batch::{CreateBatchCmd, FindBatchCmd};
use procengine::{
    Clock, EngineConfig, EngineError, ErrorKind, EventLog, JobDefinition, JobExecutorConfig,
    JobFailure, JobPopulation, ManualClock, ProcessEngine, TenantFilter,
};
use std::sync::Arc;

fn engine_with(clock: &Arc<ManualClock>) -> ProcessEngine {
    let config = EngineConfig::new("admin").job_executor(
        JobExecutorConfig::new("node-test").retry_wait(std::time::Duration::ZERO),
    );
    ProcessEngine::builder()
        .clock(clock.clone())
        .config(config)
        .build()
}

async fn lease(engine: &ProcessEngine, owner: &str) -> Vec<String> {
    engine
        .jobs()
        .acquire_next_jobs(owner, Duration::minutes(5), 10, &TenantFilter::Any)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect()
}

/// Scope with one executable job carrying a payload and one dead-lettered job.
async fn populate_scope(engine: &ProcessEngine, scope: &str) {
    engine.create_scope(scope).await.unwrap();
    engine
        .jobs()
        .schedule(
            JobDefinition::async_continuation("noop")
                .scope(scope)
                .payload(b"payload".to_vec()),
        )
        .await
        .unwrap();
    let doomed = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop").scope(scope))
        .await
        .unwrap();
    engine.jobs().move_to_dead_letter(&doomed).await.unwrap();
}

#[tokio::test]
async fn test_bulk_delete_with_duplicate_ids_deletes_each_once() {
    let clock = Arc::new(ManualClock::default());
    let log = Arc::new(EventLog::new());
    let engine = ProcessEngine::builder()
        .clock(clock.clone())
        .listener(log.clone())
        .build();
    populate_scope(&engine, "p1").await;
    populate_scope(&engine, "p2").await;
    engine.jobs().suspend("p2").await.unwrap();
    log.clear();

    let report = engine
        .delete_process_instances(["p1", "p2", "p1"])
        .await
        .unwrap();

    assert!(report.is_clean());
    assert_eq!(report.deleted, vec!["p1".to_string(), "p2".to_string()]);
    assert!(report.skipped.is_empty());

    assert_eq!(engine.store().count("scope").await, 0);
    for population in JobPopulation::ALL {
        assert_eq!(engine.jobs().count(population).await.unwrap(), 0);
    }
    assert_eq!(engine.store().count("document").await, 0);
    assert_eq!(log.names(), vec!["scope_deleted", "scope_deleted"]);
}

#[tokio::test]
async fn test_bulk_delete_reports_missing_ids_as_skipped() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    populate_scope(&engine, "p1").await;

    let report = engine
        .delete_process_instances(vec!["ghost".to_string(), "p1".to_string()])
        .await
        .unwrap();

    assert_eq!(report.deleted, vec!["p1".to_string()]);
    assert_eq!(report.skipped, vec!["ghost".to_string()]);
    assert!(report.is_clean());
}

#[tokio::test]
async fn test_bulk_delete_keeps_going_past_a_locked_instance() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    populate_scope(&engine, "p1").await;
    assert_eq!(lease(&engine, "node-a").await.len(), 1);
    populate_scope(&engine, "p2").await;

    let report = engine.delete_process_instances(["p1", "p2"]).await.unwrap();

    assert_eq!(report.deleted, vec!["p2".to_string()]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "p1");
    assert_eq!(report.failed[0].1.kind(), ErrorKind::BusinessRuleViolation);

    // the refused instance is untouched
    assert_eq!(engine.store().count("scope").await, 1);
    assert_eq!(engine.jobs().count(JobPopulation::Executable).await.unwrap(), 1);
    assert_eq!(engine.jobs().count(JobPopulation::DeadLetter).await.unwrap(), 1);

    // once the lease expires the instance can go
    clock.advance(Duration::minutes(5));
    let report = engine.delete_process_instances(["p1"]).await.unwrap();
    assert_eq!(report.deleted, vec!["p1".to_string()]);
}

#[tokio::test]
async fn test_bulk_delete_requires_ids() {
    let engine = ProcessEngine::builder().build();
    let err = engine
        .delete_process_instances(Vec::<String>::new())
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::IllegalArgument(_)));
}

#[tokio::test]
async fn test_create_scope_rejects_duplicates() {
    let engine = ProcessEngine::builder().build();
    engine.create_scope("p1").await.unwrap();
    let err = engine.create_scope("p1").await.unwrap_err();
    assert_eq!(err.to_string(), "Illegal argument: scope 'p1' already exists");
}

#[tokio::test]
async fn test_delete_batch_with_its_configuration() {
    let log = Arc::new(EventLog::new());
    let engine = ProcessEngine::builder().listener(log.clone()).build();
    let batch = engine
        .create_batch(
            CreateBatchCmd::new("migration")
                .search_key("release-7")
                .configuration(b"{\"instances\":[\"p1\"]}".to_vec()),
        )
        .await
        .unwrap();
    assert!(batch.document_id.is_some());
    assert_eq!(engine.store().count("document").await, 1);

    engine.delete_batch(&batch.id).await.unwrap();

    let found = engine
        .execute(&FindBatchCmd {
            batch_id: batch.id.clone(),
        })
        .await
        .unwrap();
    assert!(found.is_none());
    assert_eq!(engine.store().count("document").await, 0);
    assert_eq!(log.names(), vec!["batch_deleted"]);

    let err = engine.delete_batch(&batch.id).await.unwrap_err();
    assert_eq!(err, EngineError::not_found("batch", batch.id.clone()));
}

#[tokio::test]
async fn test_delete_job_checks_existence_and_lease() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);

    let err = engine.jobs().delete("nope").await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);

    let job_id = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop").payload(b"x".to_vec()))
        .await
        .unwrap();
    lease(&engine, "node-a").await;

    let err = engine.jobs().delete(&job_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BusinessRuleViolation);
    assert!(err.to_string().contains("node-a"));

    engine.jobs().unacquire(&job_id).await.unwrap();
    engine.jobs().delete(&job_id).await.unwrap();
    assert!(engine.jobs().find(&job_id).await.unwrap().is_none());
    assert_eq!(engine.store().count("document").await, 0);
}

#[tokio::test]
async fn test_dead_letter_operator_actions() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    let job_id = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop").retries(1))
        .await
        .unwrap();
    lease(&engine, "node-a").await;
    engine
        .jobs()
        .record_failure(&job_id, Some("node-a"), JobFailure::new("out of luck"))
        .await
        .unwrap();
    assert_eq!(engine.jobs().count(JobPopulation::DeadLetter).await.unwrap(), 1);

    let err = engine
        .jobs()
        .move_dead_letter_to_executable(&job_id, 0)
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IllegalArgument);

    let job = engine
        .jobs()
        .move_dead_letter_to_executable(&job_id, 2)
        .await
        .unwrap();
    assert_eq!(job.core.retries, 2);
    assert!(job.lock_owner.is_none());
    assert_eq!(engine.jobs().count(JobPopulation::DeadLetter).await.unwrap(), 0);

    let job = engine.jobs().set_retries(&job_id, 7).await.unwrap();
    assert_eq!(job.core.retries, 7);

    engine.jobs().move_to_dead_letter(&job_id).await.unwrap();
    engine.jobs().delete_dead_letter(&job_id).await.unwrap();
    assert_eq!(engine.jobs().count(JobPopulation::DeadLetter).await.unwrap(), 0);
    assert_eq!(engine.store().count("document").await, 0);

    let err = engine.jobs().delete_dead_letter(&job_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_leased_job_cannot_be_moved_to_dead_letter() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    let job_id = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop"))
        .await
        .unwrap();
    lease(&engine, "node-a").await;

    let err = engine.jobs().move_to_dead_letter(&job_id).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::BusinessRuleViolation);
    assert_eq!(engine.jobs().count(JobPopulation::DeadLetter).await.unwrap(), 0);
}

#[tokio::test]
async fn test_reschedule_is_refused_while_scope_is_suspended() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    engine.create_scope("p1").await.unwrap();
    let job_id = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop").scope("p1"))
        .await
        .unwrap();

    let later = clock.now() + Duration::hours(1);
    let job = engine.jobs().reschedule(&job_id, later).await.unwrap();
    assert_eq!(job.core.due_date, later);

    // a leased job stays executable when its scope is suspended
    clock.advance(Duration::hours(1));
    lease(&engine, "node-a").await;
    engine.jobs().suspend("p1").await.unwrap();

    let err = engine
        .jobs()
        .reschedule(&job_id, later + Duration::hours(1))
        .await
        .unwrap_err();
    assert_eq!(
        err,
        EngineError::BusinessRuleViolation("scope 'p1' is suspended".into())
    );
    let unchanged = engine.jobs().find(&job_id).await.unwrap().unwrap();
    assert_eq!(unchanged.core.due_date, later);

    let err = engine.jobs().reschedule("nope", later).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotFound);
}
