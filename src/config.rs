use crate::core::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Engine configuration
///
/// Loaded from JSON or assembled with the builder-style setters. It reaches
/// commands through the execution context only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Name used in logs
    pub engine_name: String,

    /// Job acquisition and execution settings
    pub job_executor: JobExecutorConfig,

    /// Top-level retry of commands that lost an optimistic-concurrency race
    pub conflict_retry: ConflictRetryPolicy,

    /// Longest exception message stored on a job; the full text goes to the
    /// failure detail document
    pub max_exception_message_length: usize,
}

impl EngineConfig {
    pub fn new(engine_name: &str) -> Self {
        Self {
            engine_name: engine_name.to_string(),
            ..Self::default()
        }
    }

    pub fn job_executor(mut self, job_executor: JobExecutorConfig) -> Self {
        self.job_executor = job_executor;
        self
    }

    pub fn conflict_retry(mut self, policy: ConflictRetryPolicy) -> Self {
        self.conflict_retry = policy;
        self
    }

    pub fn max_exception_message_length(mut self, length: usize) -> Self {
        self.max_exception_message_length = length;
        self
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        Self::from_json_str(&text)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        self.job_executor.validate()?;

        if self.conflict_retry.max_attempts == 0 {
            return Err(EngineError::IllegalArgument(
                "conflict_retry.max_attempts must be > 0".into(),
            ));
        }

        if self.max_exception_message_length == 0 {
            return Err(EngineError::IllegalArgument(
                "max_exception_message_length must be > 0".into(),
            ));
        }

        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            engine_name: "procengine".to_string(),
            job_executor: JobExecutorConfig::default(),
            conflict_retry: ConflictRetryPolicy::default(),
            max_exception_message_length: 4000,
        }
    }
}

/// Job executor configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct JobExecutorConfig {
    /// Identifier written into the lock owner of every job this node leases
    pub lock_owner: String,

    /// Number of concurrent worker tasks
    pub worker_count: usize,

    /// Lease length for acquired jobs
    pub lease_duration_ms: u64,

    /// Maximum candidates taken by one acquisition scan
    pub acquire_batch_size: usize,

    /// Pause between scans that found nothing to do
    pub idle_wait_ms: u64,

    /// Delay added to the due date of a job that failed with retries left
    pub retry_wait_ms: u64,

    /// Retries given to jobs that do not set their own
    pub default_retries: u32,

    /// Restrict acquisition to some tenants
    pub tenant_filter: TenantFilter,
}

impl JobExecutorConfig {
    pub fn new(lock_owner: &str) -> Self {
        Self {
            lock_owner: lock_owner.to_string(),
            ..Self::default()
        }
    }

    pub fn worker_count(mut self, count: usize) -> Self {
        self.worker_count = count;
        self
    }

    pub fn lease_duration(mut self, lease: Duration) -> Self {
        self.lease_duration_ms = lease.as_millis() as u64;
        self
    }

    pub fn acquire_batch_size(mut self, size: usize) -> Self {
        self.acquire_batch_size = size;
        self
    }

    pub fn idle_wait(mut self, wait: Duration) -> Self {
        self.idle_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn retry_wait(mut self, wait: Duration) -> Self {
        self.retry_wait_ms = wait.as_millis() as u64;
        self
    }

    pub fn default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn tenant_filter(mut self, filter: TenantFilter) -> Self {
        self.tenant_filter = filter;
        self
    }

    pub fn lease_duration_value(&self) -> chrono::Duration {
        chrono_millis(self.lease_duration_ms)
    }

    pub fn retry_wait_value(&self) -> chrono::Duration {
        chrono_millis(self.retry_wait_ms)
    }

    pub fn idle_wait_value(&self) -> Duration {
        Duration::from_millis(self.idle_wait_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.lock_owner.is_empty() {
            return Err(EngineError::IllegalArgument(
                "job_executor.lock_owner cannot be empty".into(),
            ));
        }
        if self.worker_count == 0 {
            return Err(EngineError::IllegalArgument(
                "job_executor.worker_count must be > 0".into(),
            ));
        }
        if self.lease_duration_ms == 0 {
            return Err(EngineError::IllegalArgument(
                "job_executor.lease_duration_ms must be > 0".into(),
            ));
        }
        if self.lease_duration_ms > MAX_DURATION_MS {
            return Err(EngineError::IllegalArgument(format!(
                "job_executor.lease_duration_ms must be <= {MAX_DURATION_MS}"
            )));
        }
        if self.retry_wait_ms > MAX_DURATION_MS {
            return Err(EngineError::IllegalArgument(format!(
                "job_executor.retry_wait_ms must be <= {MAX_DURATION_MS}"
            )));
        }
        if self.acquire_batch_size == 0 {
            return Err(EngineError::IllegalArgument(
                "job_executor.acquire_batch_size must be > 0".into(),
            ));
        }
        Ok(())
    }
}

/// Upper bound for configured leases and retry waits: one year.
pub const MAX_DURATION_MS: u64 = 365 * 24 * 60 * 60 * 1000;

fn chrono_millis(ms: u64) -> chrono::Duration {
    i64::try_from(ms)
        .ok()
        .and_then(chrono::Duration::try_milliseconds)
        .unwrap_or(chrono::Duration::MAX)
}

impl Default for JobExecutorConfig {
    fn default() -> Self {
        Self {
            lock_owner: format!("node-{}", uuid::Uuid::new_v4().simple()),
            worker_count: 2,
            lease_duration_ms: 300_000, // 5 minutes
            acquire_batch_size: 3,
            idle_wait_ms: 5_000,
            retry_wait_ms: 10_000,
            default_retries: 3,
            tenant_filter: TenantFilter::Any,
        }
    }
}

/// Retry policy for commands that fail with a revision conflict
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictRetryPolicy {
    /// Total attempts, including the first one. 1 disables retry.
    pub max_attempts: u32,
    pub base_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl ConflictRetryPolicy {
    pub fn disabled() -> Self {
        Self::default()
    }

    pub fn attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            ..Self::default()
        }
    }

    /// Exponential backoff after the given (1-based) failed attempt.
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        let backoff = self.base_backoff_ms.saturating_mul(factor);
        Duration::from_millis(backoff.min(self.max_backoff_ms))
    }
}

impl Default for ConflictRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            base_backoff_ms: 5,
            max_backoff_ms: 200,
        }
    }
}

/// Which tenants an acquisition scan or bulk lock operation covers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", tag = "mode", content = "tenants")]
pub enum TenantFilter {
    /// Every job regardless of tenant
    #[default]
    Any,
    /// Only jobs without a tenant
    WithoutTenant,
    /// Only jobs of the listed tenants
    Tenants(Vec<String>),
}

impl TenantFilter {
    pub fn tenants<I, S>(tenants: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        TenantFilter::Tenants(tenants.into_iter().map(Into::into).collect())
    }

    pub fn matches(&self, tenant_id: Option<&str>) -> bool {
        match self {
            TenantFilter::Any => true,
            TenantFilter::WithoutTenant => tenant_id.is_none(),
            TenantFilter::Tenants(tenants) => {
                tenant_id.is_some_and(|t| tenants.iter().any(|candidate| candidate == t))
            }
        }
    }
}
