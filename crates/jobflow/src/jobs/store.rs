//! Storage contract for the job lifecycle.
//!
//! [`JobsRepo`](crate::jobs::JobsRepo) implements it on PostgreSQL;
//! [`MemoryJobStore`](crate::jobs::memory::MemoryJobStore) is an in-process
//! implementation with the same semantics for tests and embedding.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{JobsError, Result};
use crate::jobs::model::{
    Job, JobStatus, ListFilter, NewJob, ReapReport, StatusCount, Transition,
};

#[async_trait]
pub trait JobStore: Send + Sync + 'static {
    /// Persist a new `queued` job.
    ///
    /// Fails with `DuplicateIdempotencyKey` when a non-canceled job already
    /// holds the key.
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Uuid>;

    /// Atomically take ownership of one eligible job.
    ///
    /// Eligible means `status` in `eligible` (a subset of
    /// [`JobStatus::CLAIMABLE`]), `queue` in `queues`, `run_after <= now` and
    /// attempts remaining. Oldest `run_after` first, then creation order. The
    /// claimed row becomes `running`, is locked by `consumer_id` and has its
    /// `attempt_count` incremented. Concurrent callers never get the same row.
    async fn claim(
        &self,
        consumer_id: &str,
        eligible: &[JobStatus],
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// Apply a transition to a job this consumer still owns.
    ///
    /// Returns `ClaimConflict` when the row is no longer `running` under
    /// `consumer_id`; nothing is written in that case.
    async fn complete(
        &self,
        job_id: Uuid,
        consumer_id: &str,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<()>;

    async fn get(&self, job_id: Uuid) -> Result<Job>;

    /// `queued`/`failed` -> `canceled`.
    async fn cancel(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Job>;

    /// Give a claimed job back without charging the interrupted attempt.
    async fn release(&self, job_id: Uuid, consumer_id: &str, now: DateTime<Utc>) -> Result<()>;

    /// Recover `running` jobs whose lock is older than `liveness_timeout`.
    async fn reap_expired(
        &self,
        liveness_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReapReport>;

    /// Re-enqueue a dead job as a fresh copy. Returns the new job id.
    async fn replay(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Uuid>;

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Job>>;

    async fn status_counts(&self) -> Result<Vec<StatusCount>>;

    /// Cheap liveness probe of the backing store.
    async fn ping(&self) -> Result<()>;
}

pub(crate) fn check_eligible(eligible: &[JobStatus]) -> Result<()> {
    match eligible.iter().find(|st| !st.is_claimable()) {
        Some(st) => Err(JobsError::validation(format!(
            "jobs in status {st} cannot be claimed"
        ))),
        None => Ok(()),
    }
}

pub(crate) fn lease_cutoff(liveness_timeout: Duration, now: DateTime<Utc>) -> DateTime<Utc> {
    let timeout = chrono::Duration::from_std(liveness_timeout)
        .unwrap_or_else(|_| chrono::Duration::days(365));
    now - timeout
}

pub(crate) fn clamp_limit(limit: i64) -> i64 {
    if limit <= 0 {
        100
    } else {
        limit.min(500)
    }
}
