//! Fixed-interval submissions.
//!
//! Each tick submits with idempotency key `<job_type>:<bucket>`, where the
//! bucket is unix time divided by the interval. Every process running the
//! same schedule therefore lands on one job per bucket.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::{JobsError, Result};
use crate::ingest::{IngestService, Submission};

#[derive(Debug, Clone, PartialEq)]
pub struct RecurringJob {
    pub job_type: String,
    pub every: Duration,
    pub payload: Value,
}

impl RecurringJob {
    pub fn new(job_type: impl Into<String>, every: Duration) -> Self {
        Self {
            job_type: job_type.into(),
            every,
            payload: json!({}),
        }
    }

    pub fn bucket_key(&self, now: DateTime<Utc>) -> String {
        let secs = self.every.as_secs().max(1) as i64;
        format!("{}:{}", self.job_type, now.timestamp().div_euclid(secs))
    }
}

/// Parses `type=secs,type=secs`.
pub fn parse_recurring(schedule: &str) -> Result<Vec<RecurringJob>> {
    schedule.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| {
            let (job_type, secs) = entry.split_once('=').ok_or_else(|| {
                JobsError::Config(format!("recurring entry {entry:?} is not type=seconds"))
            })?;
            let secs: u64 = secs.trim().parse().map_err(|_| {
                JobsError::Config(format!("recurring entry {entry:?} has a bad interval"))
            })?;
            if secs == 0 {
                return Err(JobsError::Config(format!(
                    "recurring entry {entry:?} must have a positive interval"
                )));
            }
            Ok(RecurringJob::new(job_type.trim(), Duration::from_secs(secs)))
        })
        .collect()
}

pub struct RecurringScheduler {
    ingest: IngestService,
    jobs: Vec<RecurringJob>,
}

impl RecurringScheduler {
    pub fn new(ingest: IngestService, jobs: Vec<RecurringJob>) -> Self {
        Self { ingest, jobs }
    }

    pub async fn submit_due(&self, job: &RecurringJob, now: DateTime<Utc>) -> Result<bool> {
        let sub = Submission::new(job.job_type.clone(), job.payload.clone())
            .with_idempotency_key(job.bucket_key(now));
        let accepted = self.ingest.submit(sub).await?;
        if accepted.created {
            info!(job_id = %accepted.job_id, job_type = %job.job_type, "recurring job submitted");
        } else {
            debug!(job_type = %job.job_type, "recurring bucket already submitted");
        }
        Ok(accepted.created)
    }

    /// Runs until `shutdown` is cancelled, even with no jobs configured.
    pub async fn run(self, shutdown: CancellationToken) {
        if self.jobs.is_empty() {
            debug!("no recurring jobs configured");
            shutdown.cancelled().await;
            return;
        }

        let this = Arc::new(self);
        let mut tasks = JoinSet::new();
        for job in this.jobs.clone() {
            let this = this.clone();
            let shutdown = shutdown.clone();
            tasks.spawn(async move {
                let mut ticker = tokio::time::interval(job.every);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = ticker.tick() => {
                            if let Err(e) = this.submit_due(&job, Utc::now()).await {
                                warn!(job_type = %job.job_type, error = %e, "recurring submit failed");
                            }
                        }
                    }
                }
            });
        }

        while tasks.join_next().await.is_some() {}
        info!("recurring scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ingest::IngestConfig;
    use crate::jobs::memory::MemoryJobStore;
    use crate::jobs::registry::HandlerRegistry;
    use crate::transport::LocalNotifier;
    use chrono::TimeZone;

    #[test]
    fn parses_entries() {
        let jobs = parse_recurring(" crm-people-sync=300, digest=86400 ,").unwrap();
        assert_eq!(
            jobs,
            vec![
                RecurringJob::new("crm-people-sync", Duration::from_secs(300)),
                RecurringJob::new("digest", Duration::from_secs(86400)),
            ]
        );
        assert!(parse_recurring("nope").is_err());
        assert!(parse_recurring("x=0").is_err());
        assert!(parse_recurring("x=soon").is_err());
    }

    #[test]
    fn bucket_key_is_stable_within_interval() {
        let job = RecurringJob::new("sync", Duration::from_secs(60));
        let a = Utc.timestamp_opt(120, 0).unwrap();
        let b = Utc.timestamp_opt(179, 0).unwrap();
        let c = Utc.timestamp_opt(180, 0).unwrap();
        assert_eq!(job.bucket_key(a), "sync:2");
        assert_eq!(job.bucket_key(a), job.bucket_key(b));
        assert_ne!(job.bucket_key(b), job.bucket_key(c));
    }

    fn ingest(store: Arc<MemoryJobStore>) -> IngestService {
        IngestService::new(
            store,
            Arc::new(LocalNotifier::new()),
            Arc::new(HandlerRegistry::new()),
            IngestConfig::default(),
        )
    }

    #[tokio::test]
    async fn empty_scheduler_runs_until_shutdown() {
        let token = CancellationToken::new();
        let sched = RecurringScheduler::new(ingest(Arc::new(MemoryJobStore::new())), vec![]);
        let handle = tokio::spawn(sched.run(token.clone()));

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!handle.is_finished());

        token.cancel();
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("scheduler did not stop after shutdown")
            .unwrap();
    }

    #[tokio::test]
    async fn two_schedulers_create_one_job_per_bucket() {
        let store = Arc::new(MemoryJobStore::new());
        let ingest = ingest(store.clone());
        let job = RecurringJob::new("sync", Duration::from_secs(3600));
        let a = RecurringScheduler::new(ingest.clone(), vec![job.clone()]);
        let b = RecurringScheduler::new(ingest, vec![job.clone()]);

        let now = Utc::now();
        let created_a = a.submit_due(&job, now).await.unwrap();
        let created_b = b.submit_due(&job, now).await.unwrap();

        assert!(created_a ^ created_b);
        assert_eq!(store.len().await, 1);
    }
}
