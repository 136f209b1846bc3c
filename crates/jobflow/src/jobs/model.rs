use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    pub job_type: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub payload: Value,
    pub result: Option<Value>,
    pub idempotency_key: Option<String>,

    pub attempt_count: i32,
    pub max_attempts: i32,
    pub run_after: DateTime<Utc>,

    pub locked_by: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,

    pub last_error: Option<String>,
    pub dead_reason: Option<String>,
    pub replay_of_job_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn attempts_remaining(&self) -> bool {
        self.attempt_count < self.max_attempts
    }
}

#[derive(Debug, Clone)]
pub struct NewJob {
    pub queue: String,
    pub job_type: String,
    pub payload: Value,
    pub idempotency_key: Option<String>,
    pub max_attempts: i32,
    pub run_after: DateTime<Utc>,
}

impl NewJob {
    /// A job runnable immediately on `queue` with the given attempt budget.
    pub fn now(queue: &str, job_type: &str, payload: Value, max_attempts: i32) -> Self {
        Self {
            queue: queue.to_string(),
            job_type: job_type.to_string(),
            payload,
            idempotency_key: None,
            max_attempts,
            run_after: Utc::now(),
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_run_after(mut self, run_after: DateTime<Utc>) -> Self {
        self.run_after = run_after;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Succeeded,
    /// Waiting for a retry; claimable again once `run_after` passes.
    Failed,
    Dead,
    Canceled,
}

impl JobStatus {
    /// Statuses a consumer may claim from.
    pub const CLAIMABLE: [JobStatus; 2] = [JobStatus::Queued, JobStatus::Failed];

    pub const ALL: [JobStatus; 6] = [
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Succeeded,
        JobStatus::Failed,
        JobStatus::Dead,
        JobStatus::Canceled,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Dead => "dead",
            JobStatus::Canceled => "canceled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Dead | JobStatus::Canceled
        )
    }

    pub fn is_cancelable(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Failed)
    }

    pub fn is_claimable(&self) -> bool {
        Self::CLAIMABLE.contains(self)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown job status {0:?}")]
pub struct ParseStatusError(pub String);

impl FromStr for JobStatus {
    type Err = ParseStatusError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|st| st.as_str() == s)
            .ok_or_else(|| ParseStatusError(s.to_string()))
    }
}

impl TryFrom<String> for JobStatus {
    type Error = ParseStatusError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Why a job ended up dead-lettered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeadReason {
    MaxAttemptsExceeded,
    NonRetryable,
    /// Lock expired while the job was on its final attempt.
    LeaseExpired,
}

impl DeadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeadReason::MaxAttemptsExceeded => "MAX_ATTEMPTS_EXCEEDED",
            DeadReason::NonRetryable => "NON_RETRYABLE",
            DeadReason::LeaseExpired => "LEASE_EXPIRED",
        }
    }
}

/// The store-level effect of a finished attempt, decided by the lifecycle engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Succeed { result: Option<Value> },
    Retry { run_after: DateTime<Utc>, error: String },
    Dead { reason: DeadReason, error: String },
}

impl Transition {
    pub fn target_status(&self) -> JobStatus {
        match self {
            Transition::Succeed { .. } => JobStatus::Succeeded,
            Transition::Retry { .. } => JobStatus::Failed,
            Transition::Dead { .. } => JobStatus::Dead,
        }
    }
}

/// Outcome of a reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReapReport {
    /// (job_id, queue) pairs put back to `queued`.
    pub requeued: Vec<(Uuid, String)>,
    pub dead: Vec<Uuid>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.dead.is_empty()
    }
}

#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub queue: Option<String>,
    pub status: Option<JobStatus>,
    pub limit: i64,
    pub cursor_created_at: Option<DateTime<Utc>>,
    pub cursor_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, sqlx::FromRow)]
pub struct StatusCount {
    pub queue: String,
    #[sqlx(try_from = "String")]
    pub status: JobStatus,
    pub count: i64,
}
