use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Postgres, QueryBuilder};
use uuid::Uuid;

use crate::error::{JobsError, Result};
use crate::jobs::model::{
    DeadReason, Job, JobStatus, ListFilter, NewJob, ReapReport, StatusCount, Transition,
};
use crate::jobs::store::{check_eligible, clamp_limit, lease_cutoff, JobStore};

/// A canceled key holder can vanish between our failed insert and the lookup;
/// that race is retried a few times before giving up.
const INSERT_RACE_RETRIES: usize = 3;

#[derive(Clone)]
pub struct JobsRepo {
    pool: PgPool,
}

impl JobsRepo {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    async fn live_key_holder(&self, key: &str) -> Result<Option<(Uuid, JobStatus)>> {
        let row: Option<(Uuid, String)> = sqlx::query_as(
            r#"
            SELECT id, status
            FROM jobs
            WHERE idempotency_key = $1
              AND status <> 'canceled'
            "#,
        )
        .bind(key)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some((id, status)) => {
                let status = status
                    .parse::<JobStatus>()
                    .map_err(|e| JobsError::Database(sqlx::Error::Decode(Box::new(e))))?;
                Ok(Some((id, status)))
            }
            None => Ok(None),
        }
    }

    async fn require_status(&self, job_id: Uuid, action: &'static str) -> JobsError {
        match self.get(job_id).await {
            Ok(job) => JobsError::InvalidTransition {
                job_id,
                from: job.status,
                action,
            },
            Err(e) => e,
        }
    }
}

#[async_trait]
impl JobStore for JobsRepo {
    async fn insert(&self, job: NewJob, now: DateTime<Utc>) -> Result<Uuid> {
        for _ in 0..INSERT_RACE_RETRIES {
            let inserted: Option<Uuid> = sqlx::query_scalar(
                r#"
                INSERT INTO jobs (
                    id, queue, job_type, status, payload, idempotency_key,
                    attempt_count, max_attempts, run_after, created_at, updated_at
                )
                VALUES ($1, $2, $3, 'queued', $4, $5, 0, $6, $7, $8, $8)
                ON CONFLICT (idempotency_key)
                    WHERE idempotency_key IS NOT NULL AND status <> 'canceled'
                DO NOTHING
                RETURNING id
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(&job.queue)
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(&job.idempotency_key)
            .bind(job.max_attempts)
            .bind(job.run_after)
            .bind(now)
            .fetch_optional(&self.pool)
            .await?;

            if let Some(id) = inserted {
                return Ok(id);
            }

            let Some(key) = job.idempotency_key.as_deref() else {
                // only the idempotency index can swallow an insert
                return Err(JobsError::Database(sqlx::Error::RowNotFound));
            };

            if let Some((existing_id, existing_status)) = self.live_key_holder(key).await? {
                return Err(JobsError::DuplicateIdempotencyKey {
                    key: key.to_string(),
                    existing_id,
                    existing_status,
                });
            }
        }

        Err(JobsError::Database(sqlx::Error::Protocol(format!(
            "idempotency key {:?} kept changing hands during insert",
            job.idempotency_key.unwrap_or_default()
        ))))
    }

    async fn claim(
        &self,
        consumer_id: &str,
        eligible: &[JobStatus],
        queues: &[String],
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        check_eligible(eligible)?;
        if eligible.is_empty() || queues.is_empty() {
            return Ok(None);
        }

        let statuses: Vec<&'static str> = eligible.iter().map(|st| st.as_str()).collect();

        let job = sqlx::query_as::<_, Job>(
            r#"
            WITH candidate AS (
                SELECT id
                FROM jobs
                WHERE queue = ANY($1)
                  AND status = ANY($2)
                  AND run_after <= $3
                  AND attempt_count < max_attempts
                ORDER BY run_after ASC, created_at ASC, id ASC
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            UPDATE jobs j
            SET status = 'running',
                locked_by = $4,
                locked_at = $3,
                attempt_count = j.attempt_count + 1,
                updated_at = $3
            FROM candidate
            WHERE j.id = candidate.id
            RETURNING j.*
            "#,
        )
        .bind(queues)
        .bind(&statuses)
        .bind(now)
        .bind(consumer_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn complete(
        &self,
        job_id: Uuid,
        consumer_id: &str,
        transition: &Transition,
        now: DateTime<Utc>,
    ) -> Result<()> {
        let res = match transition {
            Transition::Succeed { result } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'succeeded',
                        result = $3,
                        last_error = NULL,
                        locked_by = NULL,
                        locked_at = NULL,
                        updated_at = $4
                    WHERE id = $1
                      AND status = 'running'
                      AND locked_by = $2
                    "#,
                )
                .bind(job_id)
                .bind(consumer_id)
                .bind(result)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            Transition::Retry { run_after, error } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'failed',
                        run_after = $3,
                        last_error = $4,
                        locked_by = NULL,
                        locked_at = NULL,
                        updated_at = $5
                    WHERE id = $1
                      AND status = 'running'
                      AND locked_by = $2
                    "#,
                )
                .bind(job_id)
                .bind(consumer_id)
                .bind(run_after)
                .bind(error)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
            Transition::Dead { reason, error } => {
                sqlx::query(
                    r#"
                    UPDATE jobs
                    SET status = 'dead',
                        dead_reason = $3,
                        last_error = $4,
                        locked_by = NULL,
                        locked_at = NULL,
                        updated_at = $5
                    WHERE id = $1
                      AND status = 'running'
                      AND locked_by = $2
                    "#,
                )
                .bind(job_id)
                .bind(consumer_id)
                .bind(reason.as_str())
                .bind(error)
                .bind(now)
                .execute(&self.pool)
                .await?
            }
        };

        if res.rows_affected() == 0 {
            return Err(JobsError::ClaimConflict {
                job_id,
                consumer_id: consumer_id.to_string(),
            });
        }
        Ok(())
    }

    async fn get(&self, job_id: Uuid) -> Result<Job> {
        sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?
            .ok_or(JobsError::NotFound(job_id))
    }

    async fn cancel(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Job> {
        let canceled = sqlx::query_as::<_, Job>(
            r#"
            UPDATE jobs
            SET status = 'canceled',
                updated_at = $2
            WHERE id = $1
              AND status IN ('queued', 'failed')
            RETURNING *
            "#,
        )
        .bind(job_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;

        match canceled {
            Some(job) => Ok(job),
            None => Err(self.require_status(job_id, "cancel").await),
        }
    }

    async fn release(&self, job_id: Uuid, consumer_id: &str, now: DateTime<Utc>) -> Result<()> {
        let res = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'queued',
                attempt_count = GREATEST(attempt_count - 1, 0),
                run_after = $3,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $3
            WHERE id = $1
              AND status = 'running'
              AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(consumer_id)
        .bind(now)
        .execute(&self.pool)
        .await?;

        if res.rows_affected() == 0 {
            return Err(JobsError::ClaimConflict {
                job_id,
                consumer_id: consumer_id.to_string(),
            });
        }
        Ok(())
    }

    async fn reap_expired(
        &self,
        liveness_timeout: Duration,
        now: DateTime<Utc>,
    ) -> Result<ReapReport> {
        let cutoff = lease_cutoff(liveness_timeout, now);

        // Old values on the right-hand side: last_error captures the lost owner.
        let rows: Vec<(Uuid, String, String)> = sqlx::query_as(
            r#"
            WITH expired AS (
                SELECT id
                FROM jobs
                WHERE status = 'running'
                  AND locked_at < $1
                ORDER BY locked_at ASC
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs j
            SET status = CASE WHEN j.attempt_count >= j.max_attempts THEN 'dead' ELSE 'queued' END,
                dead_reason = CASE WHEN j.attempt_count >= j.max_attempts THEN $3 ELSE j.dead_reason END,
                last_error = 'LEASE_EXPIRED: lock held by ' || COALESCE(j.locked_by, '?')
                             || ' since ' || j.locked_at::text,
                run_after = $2,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = $2
            FROM expired
            WHERE j.id = expired.id
            RETURNING j.id, j.queue, j.status
            "#,
        )
        .bind(cutoff)
        .bind(now)
        .bind(DeadReason::LeaseExpired.as_str())
        .fetch_all(&self.pool)
        .await?;

        let mut report = ReapReport::default();
        for (id, queue, status) in rows {
            if status == JobStatus::Dead.as_str() {
                report.dead.push(id);
            } else {
                report.requeued.push((id, queue));
            }
        }
        Ok(report)
    }

    async fn replay(&self, job_id: Uuid, now: DateTime<Utc>) -> Result<Uuid> {
        let mut tx = self.pool.begin().await?;

        let src = sqlx::query_as::<_, Job>("SELECT * FROM jobs WHERE id = $1 FOR UPDATE")
            .bind(job_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or(JobsError::NotFound(job_id))?;

        if src.status != JobStatus::Dead {
            return Err(JobsError::InvalidTransition {
                job_id,
                from: src.status,
                action: "replay",
            });
        }

        // The dead source keeps its idempotency key; the copy runs without one.
        let new_id: Uuid = sqlx::query_scalar(
            r#"
            INSERT INTO jobs (
                id, queue, job_type, status, payload,
                attempt_count, max_attempts, run_after,
                replay_of_job_id, created_at, updated_at
            )
            VALUES ($1, $2, $3, 'queued', $4, 0, $5, $6, $7, $6, $6)
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&src.queue)
        .bind(&src.job_type)
        .bind(&src.payload)
        .bind(src.max_attempts)
        .bind(now)
        .bind(src.id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(new_id)
    }

    /// Cursor-paginated, newest first. The cursor is `(created_at, id)` of
    /// the last row of the previous page.
    async fn list(&self, filter: &ListFilter) -> Result<Vec<Job>> {
        let mut qb = QueryBuilder::<Postgres>::new("SELECT * FROM jobs WHERE TRUE");

        if let Some(queue) = &filter.queue {
            qb.push(" AND queue = ").push_bind(queue.clone());
        }
        if let Some(status) = filter.status {
            qb.push(" AND status = ").push_bind(status.as_str());
        }
        if let (Some(ca), Some(cid)) = (filter.cursor_created_at, filter.cursor_id) {
            qb.push(" AND (created_at, id) < (")
                .push_bind(ca)
                .push(", ")
                .push_bind(cid)
                .push(")");
        }
        qb.push(" ORDER BY created_at DESC, id DESC LIMIT ")
            .push_bind(clamp_limit(filter.limit));

        let rows = qb.build_query_as::<Job>().fetch_all(&self.pool).await?;
        Ok(rows)
    }

    async fn status_counts(&self) -> Result<Vec<StatusCount>> {
        let rows = sqlx::query_as::<_, StatusCount>(
            r#"
            SELECT queue, status, COUNT(*) AS count
            FROM jobs
            GROUP BY queue, status
            ORDER BY queue, status
            "#,
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    async fn ping(&self) -> Result<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}
