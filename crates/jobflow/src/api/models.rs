use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::jobs::model::{Job, JobStatus};

/// Public view of a job row. Lock ownership stays internal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: Uuid,
    pub job_type: String,
    pub queue: String,
    pub status: JobStatus,

    pub attempt_count: i32,
    pub max_attempts: i32,
    pub run_after: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dead_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub idempotency_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub replay_of_job_id: Option<Uuid>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<Job> for JobView {
    fn from(job: Job) -> Self {
        Self {
            job_id: job.id,
            job_type: job.job_type,
            queue: job.queue,
            status: job.status,
            attempt_count: job.attempt_count,
            max_attempts: job.max_attempts,
            run_after: job.run_after,
            result: job.result,
            last_error: job.last_error,
            dead_reason: job.dead_reason,
            idempotency_key: job.idempotency_key,
            replay_of_job_id: job.replay_of_job_id,
            created_at: job.created_at,
            updated_at: job.updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct ListJobsQuery {
    pub queue: Option<String>,
    pub status: Option<String>,
    pub limit: Option<i64>,
    pub cursor_created_at: Option<DateTime<Utc>>,
    pub cursor_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ListJobsResponse {
    pub items: Vec<JobView>,
    pub next_cursor_created_at: Option<DateTime<Utc>>,
    pub next_cursor_id: Option<Uuid>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CancelResponse {
    pub job_id: Uuid,
    pub status: JobStatus,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ReplayResponse {
    pub job_id: Uuid,
    pub replay_of_job_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub postgres_connected: bool,
}
