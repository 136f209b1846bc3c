//! Validate -> persist -> notify. The only way work enters the system.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobsError, Result};
use crate::jobs::model::{JobStatus, NewJob};
use crate::jobs::registry::HandlerRegistry;
use crate::jobs::store::JobStore;
use crate::transport::Notifier;

const MAX_JOB_TYPE_LEN: usize = 128;
/// Keeps `jobflow.<queue>` inside PostgreSQL's 63-byte identifier limit.
const MAX_QUEUE_LEN: usize = 48;
const MAX_IDEMPOTENCY_KEY_LEN: usize = 255;
const MAX_ATTEMPTS_RANGE: std::ops::RangeInclusive<i32> = 1..=100;

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub default_queue: String,
    pub default_max_attempts: i32,
    pub max_payload_bytes: usize,
    /// Reject job types with no registered handler.
    pub strict_job_types: bool,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            default_queue: "default".to_string(),
            default_max_attempts: 8,
            max_payload_bytes: 256 * 1024,
            strict_job_types: false,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Submission {
    pub job_type: String,
    #[serde(default)]
    pub payload: Value,
    #[serde(default)]
    pub idempotency_key: Option<String>,
    #[serde(default)]
    pub queue: Option<String>,
    #[serde(default)]
    pub run_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub max_attempts: Option<i32>,
}

impl Submission {
    pub fn new(job_type: impl Into<String>, payload: Value) -> Self {
        Self {
            job_type: job_type.into(),
            payload,
            ..Default::default()
        }
    }

    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = Some(key.into());
        self
    }

    pub fn with_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Accepted {
    pub job_id: Uuid,
    pub status: JobStatus,
    /// `false` when the idempotency key matched an existing job.
    pub created: bool,
}

#[derive(Clone)]
pub struct IngestService {
    store: Arc<dyn JobStore>,
    notifier: Arc<dyn Notifier>,
    registry: Arc<HandlerRegistry>,
    cfg: IngestConfig,
}

fn valid_name(s: &str) -> bool {
    s.chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | ':' | '-'))
}

impl IngestService {
    pub fn new(
        store: Arc<dyn JobStore>,
        notifier: Arc<dyn Notifier>,
        registry: Arc<HandlerRegistry>,
        cfg: IngestConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            registry,
            cfg,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn notifier(&self) -> &Arc<dyn Notifier> {
        &self.notifier
    }

    /// Checks a submission and turns it into an insertable job. Pure apart
    /// from reading the clock for a missing `run_after`.
    pub fn prepare(&self, sub: Submission) -> Result<NewJob> {
        let job_type = sub.job_type.trim();
        if job_type.is_empty() {
            return Err(JobsError::validation("job_type is required"));
        }
        if job_type.len() > MAX_JOB_TYPE_LEN || !valid_name(job_type) {
            return Err(JobsError::validation(format!(
                "job_type must be at most {MAX_JOB_TYPE_LEN} characters of [A-Za-z0-9._:-]"
            )));
        }
        if self.cfg.strict_job_types && !self.registry.contains(job_type) {
            return Err(JobsError::validation(format!(
                "no handler registered for job_type {job_type}"
            )));
        }

        let queue = match sub.queue.as_deref().map(str::trim) {
            Some(q) if !q.is_empty() => q.to_string(),
            _ => self.cfg.default_queue.clone(),
        };
        if queue.len() > MAX_QUEUE_LEN || !valid_name(&queue) {
            return Err(JobsError::validation(format!(
                "queue must be at most {MAX_QUEUE_LEN} characters of [A-Za-z0-9._:-]"
            )));
        }

        if !sub.payload.is_object() {
            return Err(JobsError::validation("payload must be a JSON object"));
        }
        let size = serde_json::to_vec(&sub.payload)
            .map_err(|e| JobsError::validation(e.to_string()))?
            .len();
        if size > self.cfg.max_payload_bytes {
            return Err(JobsError::validation(format!(
                "payload is {size} bytes, limit is {}",
                self.cfg.max_payload_bytes
            )));
        }
        if let Some(Err(reason)) = self.registry.validate(job_type, &sub.payload) {
            return Err(JobsError::validation(format!(
                "payload rejected for {job_type}: {reason}"
            )));
        }

        let idempotency_key = sub
            .idempotency_key
            .as_deref()
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .map(str::to_string);
        if let Some(key) = &idempotency_key {
            if key.len() > MAX_IDEMPOTENCY_KEY_LEN {
                return Err(JobsError::validation(format!(
                    "idempotency_key longer than {MAX_IDEMPOTENCY_KEY_LEN} characters"
                )));
            }
        }

        let max_attempts = sub.max_attempts.unwrap_or(self.cfg.default_max_attempts);
        if !MAX_ATTEMPTS_RANGE.contains(&max_attempts) {
            return Err(JobsError::validation(format!(
                "max_attempts must be within {}..={}",
                MAX_ATTEMPTS_RANGE.start(),
                MAX_ATTEMPTS_RANGE.end()
            )));
        }

        Ok(NewJob {
            queue,
            job_type: job_type.to_string(),
            payload: sub.payload,
            idempotency_key,
            max_attempts,
            run_after: sub.run_after.unwrap_or_else(Utc::now),
        })
    }

    pub async fn submit(&self, sub: Submission) -> Result<Accepted> {
        let job = self.prepare(sub)?;
        let queue = job.queue.clone();
        let job_type = job.job_type.clone();

        match self.store.insert(job, Utc::now()).await {
            Ok(job_id) => {
                info!(%job_id, job_type = %job_type, queue = %queue, "job accepted");
                if let Err(e) = self.notifier.publish(&queue, job_id).await {
                    // polling picks it up
                    warn!(%job_id, error = %e, "publish failed");
                }
                Ok(Accepted {
                    job_id,
                    status: JobStatus::Queued,
                    created: true,
                })
            }
            Err(JobsError::DuplicateIdempotencyKey {
                key,
                existing_id,
                existing_status,
            }) => {
                debug!(job_id = %existing_id, key = %key, "duplicate submission");
                Ok(Accepted {
                    job_id: existing_id,
                    status: existing_status,
                    created: false,
                })
            }
            Err(e) => Err(e),
        }
    }
}
