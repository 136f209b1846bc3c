//! In-process [`JobStore`] with the same transition rules as the Postgres
//! repo. A single mutex serializes every operation, which gives claim the
//! same exclusivity `SKIP LOCKED` gives the SQL version.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{JobsError, Result};
use crate::jobs::model::{
    DeadReason, Job, JobStatus, ListFilter, NewJob, ReapReport, StatusCount, Transition,
};
use crate::jobs::store::{check_eligible, clamp_limit, lease_cutoff, JobStore};

#[derive(Default)]
pub struct MemoryJobStore {
    jobs: Mutex<HashMap<Uuid, Job>>,
}

impl MemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn len(&self) -> usize {
        self.jobs.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.jobs.lock().await.is_empty()
    }
}

fn owned_by<'a>(
    jobs: &'a mut HashMap<Uuid, Job>,
    job_id: Uuid,
    consumer_id: &str,
) -> Result<&'a mut Job> {
    match jobs.get_mut(&job_id) {
        Some(job)
            if job.status == JobStatus::Running
                && job.locked_by.as_deref() == Some(consumer_id) =>
        {
            Ok(job)
        }
        _ => Err(JobsError::ClaimConflict {
            job_id,
            consumer_id: consumer_id.to_string(),
        }),
    }
}

fn unlock(job: &mut Job, status: JobStatus, now: DateTime<Utc>) {
    job.status = status;
    job.locked_by = None;
    job.locked_at = None;
    job.updated_at = now;
}

#[async_trait]
impl JobStore for MemoryJobStore {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Uuid> {
        let mut jobs = self.jobs.lock().await;

        if let Some(key) = job.idempotency_key.as_deref() {
            let holder = jobs.values().find(|j| {
                j.idempotency_key.as_deref() == Some(key) && j.status != JobStatus::Canceled
            });
            if let Some(existing) = holder {
                return Err(JobsError::DuplicateIdempotencyKey {
                    key: key.to_string(),
                    existing_id: existing.id,
                    existing_status: existing.status,
                });
            }
        }

        let id = Uuid::new_v4();
        jobs.insert(
            id,
            Job {
                id,
                queue: job.queue,
                job_type: job.job_type,
                status: JobStatus::Queued,
                payload: job.payload,
                result: None,
                idempotency_key: job.idempotency_key,
                attempt_count: 0,
                max_attempts: job.max_attempts,
                run_after: job.run_after,
                locked_by: None,
                locked_at: None,
                last_error: None,
                dead_reason: None,
                replay_of_job_id: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(id)
    }

    async fn claim(
        &self,
        consumer_id: &str,
        eligible: &[JobStatus],
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        check_eligible(eligible)?;
        let mut jobs = self.jobs.lock().await;

        let next = jobs
            .values()
            .filter(|j| {
                eligible.contains(&j.status)
                    && queues.contains(&j.queue)
                    && j.run_after <= now
                    && j.attempts_remaining()
            })
            .min_by_key(|j| (j.run_after, j.created_at, j.id))
            .map(|j| j.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(job) = jobs.get_mut(&id) else {
            return Ok(None);
        };

        job.status = JobStatus::Running;
        job.locked_by = Some(consumer_id.to_string());
        job.locked_at = Some(now);
        job.attempt_count += 1;
        job.updated_at = now;
        Ok(Some(job.clone()))
    }

    async fn complete(
        &self,
        job_id: Uuid,
        consumer_id: &str,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = owned_by(&mut jobs, job_id, consumer_id)?;

        match transition {
            Transition::Succeed { result } => {
                job.result = result.clone();
                job.last_error = None;
            }
            Transition::Retry { run_after, error } => {
                job.run_after = *run_after;
                job.last_error = Some(error.clone());
            }
            Transition::Dead { reason, error } => {
                job.dead_reason = Some(reason.as_str().to_string());
                job.last_error = Some(error.clone());
            }
        }
        unlock(job, transition.target_status(), now);
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Job> {
        self.jobs
            .lock()
            .await
            .get(&job_id)
            .cloned()
            .ok_or(JobsError::NotFound(job_id))
    }

    async fn cancel(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Job> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs.get_mut(&job_id).ok_or(JobsError::NotFound(job_id))?;

        if !job.status.is_cancelable() {
            return Err(JobsError::InvalidTransition {
                job_id,
                from: job.status,
                action: "cancel",
            });
        }
        job.status = JobStatus::Canceled;
        job.updated_at = now;
        Ok(job.clone())
    }

    async fn release(&self, job_id: Uuid, consumer_id: &str, now: DateTime<Utc>) -> Result<()> {
        let mut jobs = self.jobs.lock().await;
        let job = owned_by(&mut jobs, job_id, consumer_id)?;

        job.attempt_count = (job.attempt_count - 1).max(0);
        job.run_after = now;
        unlock(job, JobStatus::Queued, now);
        Ok(())
    }

    async fn reap_expired(
        &self,
        liveness_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReapReport> {
        let cutoff = lease_cutoff(liveness_timeout, now);
        let mut jobs = self.jobs.lock().await;
        let mut report = ReapReport::default();

        for job in jobs.values_mut() {
            let Some(locked_at) = job.locked_at else {
                continue;
            };
            if job.status != JobStatus::Running || locked_at >= cutoff {
                continue;
            }

            job.last_error = Some(format!(
                "LEASE_EXPIRED: lock held by {} since {}",
                job.locked_by.as_deref().unwrap_or("?"),
                locked_at
            ));
            job.run_after = now;

            if job.attempts_remaining() {
                unlock(job, JobStatus::Queued, now);
                report.requeued.push((job.id, job.queue.clone()));
            } else {
                job.dead_reason = Some(DeadReason::LeaseExpired.as_str().to_string());
                unlock(job, JobStatus::Dead, now);
                report.dead.push(job.id);
            }
        }
        Ok(report)
    }

    async fn replay(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Uuid> {
        let mut jobs = self.jobs.lock().await;
        let src = jobs.get(&job_id).ok_or(JobsError::NotFound(job_id))?;

        if src.status != JobStatus::Dead {
            return Err(JobsError::InvalidTransition {
                job_id,
                from: src.status,
                action: "replay",
            });
        }

        let id = Uuid::new_v4();
        let copy = Job {
            id,
            queue: src.queue.clone(),
            job_type: src.job_type.clone(),
            status: JobStatus::Queued,
            payload: src.payload.clone(),
            result: None,
            idempotency_key: None,
            attempt_count: 0,
            max_attempts: src.max_attempts,
            run_after: now,
            locked_by: None,
            locked_at: None,
            last_error: None,
            dead_reason: None,
            replay_of_job_id: Some(src.id),
            created_at: now,
            updated_at: now,
        };
        jobs.insert(id, copy);
        Ok(id)
    }

    async fn list(&self, filter: &ListFilter) -> Result<Vec<Job>> {
        let jobs = self.jobs.lock().await;
        let cursor = filter.cursor_created_at.zip(filter.cursor_id);

        let mut rows: Vec<Job> = jobs
            .values()
            .filter(|j| filter.queue.as_ref().map_or(true, |q| &j.queue == q))
            .filter(|j| filter.status.map_or(true, |st| j.status == st))
            .filter(|j| cursor.map_or(true, |c| (j.created_at, j.id) < c))
            .cloned()
            .collect();

        rows.sort_by(|a, b| (b.created_at, b.id).cmp(&(a.created_at, a.id)));
        rows.truncate(clamp_limit(filter.limit) as usize);
        Ok(rows)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let jobs = self.jobs.lock().await;
        let mut counts: HashMap<(String, JobStatus), i64> = HashMap::new();
        for job in jobs.values() {
            *counts.entry((job.queue.clone(), job.status)).or_default() += 1;
        }

        let mut rows: Vec<StatusCount> = counts
            .into_iter()
            .map(|((queue, status), count)| StatusCount {
                queue,
                status,
                count,
            })
            .collect();
        rows.sort_by(|a, b| (&a.queue, a.status.as_str()).cmp(&(&b.queue, b.status.as_str())));
        Ok(rows)
    }

    async fn ping(&self) -> Result<()> {
        Ok(())
    }
}
