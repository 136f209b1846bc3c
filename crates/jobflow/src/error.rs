use thiserror::Error;
use uuid::Uuid;

use crate::jobs::model::JobStatus;

pub type Result<T> = std::result::Result<T, JobsError>;

/// Errors raised by the store, the lifecycle engine and the ingest boundary.
///
/// Handler failures are not represented here; they travel as
/// [`HandlerError`](crate::jobs::registry::HandlerError) and end up on the
/// job row.
#[derive(Debug, Error)]
pub enum JobsError {
    /// Bad input rejected at ingest. Nothing was persisted.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A live job already owns this idempotency key.
    #[error("idempotency key {key:?} already used by job {existing_id} ({existing_status})")]
    DuplicateIdempotencyKey {
        key: String,
        existing_id: Uuid,
        existing_status: JobStatus,
    },

    #[error("job {0} not found")]
    NotFound(Uuid),

    #[error("cannot {action} job {job_id} while it is {from}")]
    InvalidTransition {
        job_id: Uuid,
        from: JobStatus,
        action: &'static str,
    },

    /// The caller no longer owns the row (its claim was superseded).
    #[error("claim on job {job_id} is no longer held by {consumer_id}")]
    ClaimConflict { job_id: Uuid, consumer_id: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Database(#[from] sqlx::Error),

    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),
}

impl JobsError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }
}
