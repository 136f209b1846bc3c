use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde_json::Value;
use tracing::{info, warn};

use crate::error::Result;
use crate::jobs::model::{DeadReason, Job, ReapReport, Transition};
use crate::jobs::registry::HandlerError;
use crate::jobs::retry::{jittered_delay, RetryConfig};
use crate::jobs::store::JobStore;

/// What a handler execution produced.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Succeeded { result: Option<Value> },
    Failed(HandlerError),
}

/// Pure transition decision for a finished attempt of `job`.
///
/// `job.attempt_count` already includes the attempt that just ran.
pub fn decide(
    job: &Job,
    outcome: Outcome,
    retry: &RetryConfig,
    now: DateTime<Utc>,
    rng: &mut impl Rng,
) -> Transition {
    let err = match outcome {
        Outcome::Succeeded { result } => return Transition::Succeed { result },
        Outcome::Failed(err) => err,
    };

    let error = err.to_string();
    if !err.is_retryable() {
        return Transition::Dead {
            reason: DeadReason::NonRetryable,
            error,
        };
    }
    if !job.attempts_remaining() {
        return Transition::Dead {
            reason: DeadReason::MaxAttemptsExceeded,
            error,
        };
    }

    let delay = jittered_delay(job.attempt_count, retry, rng);
    let delay = chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(1));
    Transition::Retry {
        run_after: now + delay,
        error,
    }
}

#[derive(Clone)]
pub struct LifecycleEngine {
    store: Arc<dyn JobStore>,
    retry: RetryConfig,
    liveness_timeout: Duration,
}

impl LifecycleEngine {
    pub fn new(store: Arc<dyn JobStore>, retry: RetryConfig, liveness_timeout: Duration) -> Self {
        Self {
            store,
            retry,
            liveness_timeout,
        }
    }

    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    pub fn liveness_timeout(&self) -> Duration {
        self.liveness_timeout
    }

    pub fn decide(&self, job: &Job, outcome: Outcome, now: DateTime<Utc>) -> Transition {
        let mut rng = StdRng::from_entropy();
        decide(job, outcome, &self.retry, now, &mut rng)
    }

    /// Decides and persists the transition for an attempt `consumer_id`
    /// still owns. A superseded claim surfaces as `ClaimConflict` and nothing
    /// is written.
    pub async fn record_outcome(
        &self,
        job: &Job,
        consumer_id: &str,
        outcome: Outcome,
    ) -> Result<Transition> {
        let now = Utc::now();
        let transition = self.decide(job, outcome, now);

        self.store
            .complete(job.id, consumer_id, &transition, now)
            .await?;

        match &transition {
            Transition::Succeed { .. } => info!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempt_count,
                "job succeeded"
            ),
            Transition::Retry { run_after, error } => warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempt_count,
                max_attempts = job.max_attempts,
                %run_after,
                error = %error,
                "job failed, retry scheduled"
            ),
            Transition::Dead { reason, error } => warn!(
                job_id = %job.id,
                job_type = %job.job_type,
                attempt = job.attempt_count,
                reason = reason.as_str(),
                error = %error,
                "job dead-lettered"
            ),
        }

        Ok(transition)
    }

    /// Recovers jobs whose owner stopped making progress.
    pub async fn reap(&self, now: DateTime<Utc>) -> Result<ReapReport> {
        let report = self.store.reap_expired(self.liveness_timeout, now).await?;
        if !report.is_empty() {
            warn!(
                requeued = report.requeued.len(),
                dead = report.dead.len(),
                "reaped expired locks"
            );
        }
        Ok(report)
    }
}
