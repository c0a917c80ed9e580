/// Job leasing tests
///
/// Acquisition races, lease expiry, lock release and exclusive scopes.
/// Run with: cargo test --test job_leasing_tests

use chrono::Duration;
use futures::future::join_all;
use procengine::jobs::FindAcquirableJobsCmd;
use procengine::{
    Clock, EngineConfig, EngineError, JobDefinition, JobExecutorConfig, JobFailure, JobService, JobState,
    ManualClock, ProcessEngine, TenantFilter,
};
use std::collections::HashSet;
use std::sync::Arc;

fn engine_with(clock: &Arc<ManualClock>) -> ProcessEngine {
    let config = EngineConfig::new("leasing").job_executor(
        JobExecutorConfig::new("node-test").retry_wait(std::time::Duration::ZERO),
    );
    ProcessEngine::builder()
        .clock(clock.clone())
        .config(config)
        .build()
}

async fn acquire(service: &JobService, owner: &str, lease: Duration) -> Vec<String> {
    service
        .acquire_next_jobs(owner, lease, 10, &TenantFilter::Any)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect()
}

#[tokio::test]
async fn test_acquired_job_carries_owner_and_expiration() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    let job_id = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop"))
        .await
        .unwrap();

    let jobs = engine
        .jobs()
        .acquire_next_jobs("node-a", Duration::seconds(30), 3, &TenantFilter::Any)
        .await
        .unwrap();

    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, job_id);
    assert_eq!(jobs[0].lock_owner.as_deref(), Some("node-a"));
    assert_eq!(
        jobs[0].lock_expiration_time,
        Some(clock.now() + Duration::seconds(30))
    );
    assert_eq!(jobs[0].state_at(clock.now()), JobState::Locked);
}

#[tokio::test]
async fn test_future_jobs_are_not_acquirable() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    let due = clock.now() + Duration::minutes(5);
    engine
        .jobs()
        .schedule(JobDefinition::timer("noop", due))
        .await
        .unwrap();

    assert!(acquire(engine.jobs(), "node-a", Duration::seconds(30)).await.is_empty());

    clock.advance(Duration::minutes(5));
    assert_eq!(acquire(engine.jobs(), "node-a", Duration::seconds(30)).await.len(), 1);
}

#[tokio::test]
async fn test_scan_orders_by_due_date_and_respects_batch_size() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    let now = clock.now();

    let late = engine
        .jobs()
        .schedule(JobDefinition::timer("noop", now - Duration::seconds(1)))
        .await
        .unwrap();
    let early = engine
        .jobs()
        .schedule(JobDefinition::timer("noop", now - Duration::seconds(10)))
        .await
        .unwrap();
    engine
        .jobs()
        .schedule(JobDefinition::timer("noop", now))
        .await
        .unwrap();

    let jobs = engine
        .execute(&FindAcquirableJobsCmd {
            batch_size: 2,
            tenant_filter: TenantFilter::Any,
        })
        .await
        .unwrap();
    let ids: Vec<&str> = jobs.iter().map(|j| j.id.as_str()).collect();
    assert_eq!(ids, vec![early.as_str(), late.as_str()]);

    let err = engine
        .execute(&FindAcquirableJobsCmd {
            batch_size: 0,
            tenant_filter: TenantFilter::Any,
        })
        .await
        .unwrap_err();
    assert_eq!(err.kind(), procengine::ErrorKind::IllegalArgument);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_acquirers_never_share_a_job() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    for _ in 0..40 {
        engine
            .jobs()
            .schedule(JobDefinition::async_continuation("noop"))
            .await
            .unwrap();
    }

    let workers = (0..6).map(|n| {
        let service = engine.jobs().clone();
        tokio::spawn(async move {
            let owner = format!("node-{n}");
            let mut mine = Vec::new();
            loop {
                let got = service
                    .acquire_next_jobs(&owner, Duration::minutes(5), 3, &TenantFilter::Any)
                    .await
                    .unwrap();
                if got.is_empty() {
                    let remaining = service
                        .executor()
                        .execute(&FindAcquirableJobsCmd {
                            batch_size: 1,
                            tenant_filter: TenantFilter::Any,
                        })
                        .await
                        .unwrap();
                    if remaining.is_empty() {
                        break;
                    }
                }
                mine.extend(got.into_iter().map(|job| (job.id, owner.clone())));
            }
            mine
        })
    });

    let results: Vec<(String, String)> = join_all(workers)
        .await
        .into_iter()
        .flat_map(|r| r.unwrap())
        .collect();

    let distinct: HashSet<&str> = results.iter().map(|(id, _)| id.as_str()).collect();
    assert_eq!(results.len(), 40, "every job acquired exactly once");
    assert_eq!(distinct.len(), 40);

    for (job_id, owner) in &results {
        let job = engine.jobs().find(job_id).await.unwrap().unwrap();
        assert_eq!(job.lock_owner.as_deref(), Some(owner.as_str()));
    }
}

#[tokio::test]
async fn test_expired_lease_is_reclaimed_by_another_worker() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    let job_id = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop"))
        .await
        .unwrap();

    assert_eq!(acquire(engine.jobs(), "node-a", Duration::seconds(30)).await, vec![job_id.clone()]);

    clock.advance(Duration::seconds(29));
    assert!(acquire(engine.jobs(), "node-b", Duration::seconds(30)).await.is_empty());

    // expiry is decided on read; the stale owner is still on the record
    clock.advance(Duration::seconds(1));
    let stale = engine.jobs().find(&job_id).await.unwrap().unwrap();
    assert_eq!(stale.lock_owner.as_deref(), Some("node-a"));
    assert_eq!(stale.state_at(clock.now()), JobState::Created);

    assert_eq!(acquire(engine.jobs(), "node-b", Duration::seconds(30)).await, vec![job_id.clone()]);

    // the previous owner can no longer complete it
    let err = engine.jobs().record_success(&job_id, "node-a").await.unwrap_err();
    assert!(err.is_revision_conflict());
    engine.jobs().record_success(&job_id, "node-b").await.unwrap();
    assert!(engine.jobs().find(&job_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_failed_job_is_acquirable_by_next_scan() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    let job_id = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop").retries(3))
        .await
        .unwrap();

    // t=0: worker A leases J1 for 30s
    assert_eq!(acquire(engine.jobs(), "worker-a", Duration::seconds(30)).await, vec![job_id.clone()]);

    // t=1: worker B finds nothing
    clock.advance(Duration::seconds(1));
    assert!(acquire(engine.jobs(), "worker-b", Duration::seconds(30)).await.is_empty());

    // worker A's command fails
    let state = engine
        .jobs()
        .record_failure(&job_id, Some("worker-a"), JobFailure::new("boom"))
        .await
        .unwrap();
    assert_eq!(state, JobState::FailedPendingRetry);

    let failed = engine.jobs().find(&job_id).await.unwrap().unwrap();
    assert_eq!(failed.core.retries, 2);
    assert!(failed.lock_owner.is_none());
    assert!(failed.lock_expiration_time.is_none());
    assert_eq!(failed.core.exception_message.as_deref(), Some("boom"));

    // t=2: worker B now acquires J1
    clock.advance(Duration::seconds(1));
    assert_eq!(acquire(engine.jobs(), "worker-b", Duration::seconds(30)).await, vec![job_id]);
}

#[tokio::test]
async fn test_clear_lock_times_makes_owned_jobs_acquirable_at_once() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    for _ in 0..3 {
        engine
            .jobs()
            .schedule(JobDefinition::async_continuation("noop"))
            .await
            .unwrap();
    }
    let other = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop"))
        .await
        .unwrap();

    let owned = engine
        .jobs()
        .acquire_next_jobs("node-7", Duration::hours(1), 3, &TenantFilter::Any)
        .await
        .unwrap();
    assert_eq!(owned.len(), 3);
    assert_eq!(acquire(engine.jobs(), "node-8", Duration::hours(1)).await, vec![other]);

    let cleared = engine
        .jobs()
        .clear_lock_times("node-7", &TenantFilter::Any)
        .await
        .unwrap();
    assert_eq!(cleared, 3);

    // owner field stays, expiration is gone
    let job = engine.jobs().find(&owned[0].id).await.unwrap().unwrap();
    assert_eq!(job.lock_owner.as_deref(), Some("node-7"));
    assert!(job.lock_expiration_time.is_none());

    let reacquired: HashSet<String> = acquire(engine.jobs(), "node-9", Duration::hours(1))
        .await
        .into_iter()
        .collect();
    let expected: HashSet<String> = owned.into_iter().map(|j| j.id).collect();
    assert_eq!(reacquired, expected);
}

#[tokio::test]
async fn test_clear_lock_times_honours_tenant_filter() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop").tenant("acme"))
        .await
        .unwrap();
    engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop").tenant("globex"))
        .await
        .unwrap();
    assert_eq!(acquire(engine.jobs(), "node-7", Duration::hours(1)).await.len(), 2);

    let cleared = engine
        .jobs()
        .clear_lock_times("node-7", &TenantFilter::tenants(["acme"]))
        .await
        .unwrap();
    assert_eq!(cleared, 1);

    let jobs = engine
        .jobs()
        .acquire_next_jobs("node-9", Duration::hours(1), 10, &TenantFilter::Any)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].core.tenant_id.as_deref(), Some("acme"));
}

#[tokio::test]
async fn test_unacquire_all_owned_by_clears_owner_and_expiration() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    for _ in 0..2 {
        engine
            .jobs()
            .schedule(JobDefinition::async_continuation("noop"))
            .await
            .unwrap();
    }
    let owned = acquire(engine.jobs(), "node-a", Duration::hours(1)).await;
    assert_eq!(owned.len(), 2);

    assert_eq!(engine.jobs().unacquire_all_owned_by("node-a").await.unwrap(), 2);
    for id in &owned {
        let job = engine.jobs().find(id).await.unwrap().unwrap();
        assert!(job.lock_owner.is_none());
        assert!(job.lock_expiration_time.is_none());
    }

    assert!(!engine.jobs().unacquire(&owned[0]).await.unwrap());
    assert!(engine.jobs().unacquire_all_owned_by("").await.is_err());
}

#[tokio::test]
async fn test_tenant_filter_limits_acquisition() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop").tenant("acme"))
        .await
        .unwrap();
    let untenanted = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop"))
        .await
        .unwrap();

    let jobs = engine
        .jobs()
        .acquire_next_jobs("node-a", Duration::hours(1), 10, &TenantFilter::WithoutTenant)
        .await
        .unwrap();
    assert_eq!(jobs.len(), 1);
    assert_eq!(jobs[0].id, untenanted);
}

#[tokio::test]
async fn test_exclusive_jobs_of_one_scope_run_one_owner_at_a_time() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    engine.create_scope("p1").await.unwrap();
    let first = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop").scope("p1").exclusive())
        .await
        .unwrap();

    assert_eq!(acquire(engine.jobs(), "node-a", Duration::minutes(5)).await, vec![first.clone()]);

    let second = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop").scope("p1").exclusive())
        .await
        .unwrap();
    assert!(acquire(engine.jobs(), "node-b", Duration::minutes(5)).await.is_empty());

    engine.jobs().record_success(&first, "node-a").await.unwrap();
    assert_eq!(acquire(engine.jobs(), "node-b", Duration::minutes(5)).await, vec![second]);
}

#[tokio::test]
async fn test_one_owner_runs_one_exclusive_job_of_a_scope_at_a_time() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    engine.create_scope("p1").await.unwrap();
    for _ in 0..2 {
        engine
            .jobs()
            .schedule(JobDefinition::async_continuation("noop").scope("p1").exclusive())
            .await
            .unwrap();
    }

    let first = acquire(engine.jobs(), "node-a", Duration::minutes(5)).await;
    assert_eq!(first.len(), 1);
    // a second batch of the same owner gets nothing either
    assert!(acquire(engine.jobs(), "node-a", Duration::minutes(5)).await.is_empty());

    engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop").scope("p1").exclusive())
        .await
        .unwrap();
    assert!(acquire(engine.jobs(), "node-b", Duration::minutes(5)).await.is_empty());

    engine.jobs().record_success(&first[0], "node-a").await.unwrap();
    let next = acquire(engine.jobs(), "node-b", Duration::minutes(5)).await;
    assert_eq!(next.len(), 1);
    assert_ne!(next[0], first[0]);
}

#[tokio::test]
async fn test_lease_outside_valid_range_is_rejected() {
    let clock = Arc::new(ManualClock::default());
    let engine = engine_with(&clock);
    let job_id = engine
        .jobs()
        .schedule(JobDefinition::async_continuation("noop"))
        .await
        .unwrap();

    for lease in [Duration::zero(), Duration::seconds(-30), Duration::MAX] {
        let err = engine
            .jobs()
            .acquire_next_jobs("node-a", lease, 10, &TenantFilter::Any)
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::IllegalArgument(_)), "{lease:?}: {err:?}");
    }

    let job = engine.jobs().find(&job_id).await.unwrap().unwrap();
    assert!(job.lock_owner.is_none());
    assert_eq!(acquire(engine.jobs(), "node-b", Duration::minutes(5)).await, vec![job_id]);
}
