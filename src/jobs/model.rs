use crate::impl_entity;
use crate::transaction::Entity;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobType {
    AsyncContinuation,
    Timer,
    HistoryProcessing,
}

/// Lifecycle state of a job, derived from the population it lives in and,
/// for executable jobs, from its lock fields at a given instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobState {
    Created,
    Locked,
    FailedPendingRetry,
    Suspended,
    Dead,
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            JobState::Created => "CREATED",
            JobState::Locked => "LOCKED",
            JobState::FailedPendingRetry => "FAILED_PENDING_RETRY",
            JobState::Suspended => "SUSPENDED",
            JobState::Dead => "DEAD",
        };
        write!(f, "{label}")
    }
}

/// The record kinds jobs are stored under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobPopulation {
    Executable,
    Suspended,
    DeadLetter,
}

impl JobPopulation {
    pub const ALL: [JobPopulation; 3] = [
        JobPopulation::Executable,
        JobPopulation::Suspended,
        JobPopulation::DeadLetter,
    ];

    pub fn kind(&self) -> &'static str {
        match self {
            JobPopulation::Executable => Job::KIND,
            JobPopulation::Suspended => SuspendedJob::KIND,
            JobPopulation::DeadLetter => DeadLetterJob::KIND,
        }
    }
}

/// Attributes shared by every job population.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCore {
    pub job_type: JobType,
    pub handler_type: String,
    pub handler_configuration: Option<String>,
    pub scope_id: Option<String>,
    pub exclusive: bool,
    pub due_date: DateTime<Utc>,
    pub retries: u32,
    pub exception_message: Option<String>,
    pub exception_detail_id: Option<String>,
    pub payload_id: Option<String>,
    pub tenant_id: Option<String>,
    pub search_key: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl JobCore {
    /// Document ids owned by the job; they go away with it.
    pub fn document_ids(&self) -> Vec<String> {
        self.exception_detail_id
            .iter()
            .chain(self.payload_id.iter())
            .cloned()
            .collect()
    }

    pub fn belongs_to(&self, scope_id: &str) -> bool {
        self.scope_id.as_deref() == Some(scope_id)
    }
}

/// Job in the executable population: due, scheduled for later, or leased.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(flatten)]
    pub core: JobCore,
    pub lock_owner: Option<String>,
    pub lock_expiration_time: Option<DateTime<Utc>>,
    #[serde(skip)]
    pub revision: u64,
}

impl_entity!(Job, "job");

impl Job {
    pub(crate) fn new(id: String, core: JobCore) -> Self {
        Self {
            id,
            core,
            lock_owner: None,
            lock_expiration_time: None,
            revision: 0,
        }
    }

    /// A lease counts only while its expiration lies in the future. Expired
    /// leases are left in place and read as unlocked.
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_owner.is_some() && self.lock_expiration_time.is_some_and(|exp| exp > now)
    }

    pub fn is_locked_by(&self, owner: &str, now: DateTime<Utc>) -> bool {
        self.is_locked_at(now) && self.lock_owner.as_deref() == Some(owner)
    }

    pub fn is_due_at(&self, now: DateTime<Utc>) -> bool {
        self.core.due_date <= now
    }

    pub fn is_acquirable_at(&self, now: DateTime<Utc>) -> bool {
        self.is_due_at(now) && !self.is_locked_at(now)
    }

    pub fn state_at(&self, now: DateTime<Utc>) -> JobState {
        if self.is_locked_at(now) {
            JobState::Locked
        } else if self.core.exception_message.is_some() {
            JobState::FailedPendingRetry
        } else {
            JobState::Created
        }
    }

    pub fn clear_lock(&mut self) {
        self.lock_owner = None;
        self.lock_expiration_time = None;
    }

    pub fn into_suspended(self) -> SuspendedJob {
        SuspendedJob {
            id: self.id,
            core: self.core,
            revision: 0,
        }
    }

    pub fn into_dead_letter(self) -> DeadLetterJob {
        DeadLetterJob {
            id: self.id,
            core: self.core,
            revision: 0,
        }
    }
}

/// Job parked while its scope is suspended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SuspendedJob {
    pub id: String,
    #[serde(flatten)]
    pub core: JobCore,
    #[serde(skip)]
    pub revision: u64,
}

impl_entity!(SuspendedJob, "suspended_job");

impl SuspendedJob {
    pub fn state(&self) -> JobState {
        JobState::Suspended
    }

    pub fn into_executable(self) -> Job {
        Job::new(self.id, self.core)
    }
}

/// Job that ran out of retries. Kept for inspection until an operator
/// deletes it or moves it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterJob {
    pub id: String,
    #[serde(flatten)]
    pub core: JobCore,
    #[serde(skip)]
    pub revision: u64,
}

impl_entity!(DeadLetterJob, "dead_letter_job");

impl DeadLetterJob {
    pub fn state(&self) -> JobState {
        JobState::Dead
    }

    pub fn into_executable(self, retries: u32) -> Job {
        let mut core = self.core;
        core.retries = retries;
        Job::new(self.id, core)
    }
}

/// Description of a job to schedule.
#[derive(Debug, Clone, PartialEq)]
pub struct JobDefinition {
    pub job_type: JobType,
    pub handler_type: String,
    pub handler_configuration: Option<String>,
    pub scope_id: Option<String>,
    pub exclusive: bool,
    /// Defaults to "now" at scheduling time.
    pub due_date: Option<DateTime<Utc>>,
    /// Defaults to the configured retry count.
    pub retries: Option<u32>,
    pub tenant_id: Option<String>,
    pub search_key: Option<String>,
    pub payload: Option<Vec<u8>>,
}

impl JobDefinition {
    pub fn new(job_type: JobType, handler_type: &str) -> Self {
        Self {
            job_type,
            handler_type: handler_type.to_string(),
            handler_configuration: None,
            scope_id: None,
            exclusive: false,
            due_date: None,
            retries: None,
            tenant_id: None,
            search_key: None,
            payload: None,
        }
    }

    pub fn async_continuation(handler_type: &str) -> Self {
        Self::new(JobType::AsyncContinuation, handler_type)
    }

    pub fn timer(handler_type: &str, due_date: DateTime<Utc>) -> Self {
        Self::new(JobType::Timer, handler_type).due(due_date)
    }

    pub fn scope(mut self, scope_id: &str) -> Self {
        self.scope_id = Some(scope_id.to_string());
        self
    }

    pub fn exclusive(mut self) -> Self {
        self.exclusive = true;
        self
    }

    pub fn due(mut self, due_date: DateTime<Utc>) -> Self {
        self.due_date = Some(due_date);
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn tenant(mut self, tenant_id: &str) -> Self {
        self.tenant_id = Some(tenant_id.to_string());
        self
    }

    pub fn search_key(mut self, key: &str) -> Self {
        self.search_key = Some(key.to_string());
        self
    }

    pub fn handler_configuration(mut self, configuration: &str) -> Self {
        self.handler_configuration = Some(configuration.to_string());
        self
    }

    pub fn payload(mut self, bytes: Vec<u8>) -> Self {
        self.payload = Some(bytes);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn job(now: DateTime<Utc>) -> Job {
        Job::new(
            "j1".into(),
            JobCore {
                job_type: JobType::AsyncContinuation,
                handler_type: "noop".into(),
                handler_configuration: None,
                scope_id: Some("p1".into()),
                exclusive: false,
                due_date: now,
                retries: 3,
                exception_message: None,
                exception_detail_id: None,
                payload_id: Some("doc-1".into()),
                tenant_id: None,
                search_key: None,
                created_at: now,
            },
        )
    }

    #[test]
    fn test_expired_lease_reads_as_unlocked() {
        let now = Utc::now();
        let mut job = job(now);
        job.lock_owner = Some("node-1".into());
        job.lock_expiration_time = Some(now + Duration::seconds(30));

        assert_eq!(job.state_at(now), JobState::Locked);
        assert!(!job.is_acquirable_at(now));
        assert!(job.is_locked_by("node-1", now));

        let later = now + Duration::seconds(31);
        assert_eq!(job.state_at(later), JobState::Created);
        assert!(job.is_acquirable_at(later));
        assert_eq!(job.lock_owner.as_deref(), Some("node-1"));
    }

    #[test]
    fn test_owner_without_expiration_is_not_a_lease() {
        let now = Utc::now();
        let mut job = job(now);
        job.lock_owner = Some("node-7".into());
        assert!(!job.is_locked_at(now));
    }

    #[test]
    fn test_failed_job_is_pending_retry() {
        let now = Utc::now();
        let mut job = job(now);
        job.core.exception_message = Some("boom".into());
        assert_eq!(job.state_at(now), JobState::FailedPendingRetry);
    }

    #[test]
    fn test_population_moves_keep_attributes() {
        let now = Utc::now();
        let mut original = job(now);
        original.revision = 4;

        let parked = original.clone().into_suspended();
        assert_eq!(parked.revision, 0);
        let back = parked.into_executable();
        assert_eq!(back.core, original.core);
        assert!(back.lock_owner.is_none());

        let revived = original.clone().into_dead_letter().into_executable(5);
        assert_eq!(revived.core.retries, 5);
        assert_eq!(revived.core.payload_id.as_deref(), Some("doc-1"));
    }

    #[test]
    fn test_body_roundtrip_is_flat() {
        let now = Utc::now();
        let body = serde_json::to_value(job(now)).unwrap();
        assert_eq!(body["handler_type"], "noop");
        assert_eq!(body["scope_id"], "p1");
        assert!(body.get("revision").is_none());
    }
}
