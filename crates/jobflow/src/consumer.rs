//! Wait -> claim -> execute -> record.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{JobsError, Result};
use crate::jobs::lifecycle::{LifecycleEngine, Outcome};
use crate::jobs::model::{Job, JobStatus, Transition};
use crate::jobs::registry::{HandlerError, HandlerRegistry, HandlerResult, JobContext};
use crate::transport::{publish_later, Notification, Notifier, Subscription};

#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub consumer_id: String,
    pub queues: Vec<String>,
    /// Statuses this consumer claims from; a subset of [`JobStatus::CLAIMABLE`].
    pub eligible: Vec<JobStatus>,
    pub poll_interval: Duration,
    pub execution_timeout: Duration,
    /// Grace period for an in-flight handler once shutdown is requested.
    pub shutdown_timeout: Duration,
}

impl ConsumerConfig {
    pub fn new(consumer_id: impl Into<String>, queues: Vec<String>) -> Self {
        Self {
            consumer_id: consumer_id.into(),
            queues,
            eligible: JobStatus::CLAIMABLE.to_vec(),
            poll_interval: Duration::from_secs(1),
            execution_timeout: Duration::from_secs(600),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

/// What a single cycle did with the job it claimed.
#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Executed { job_id: Uuid, transition: Transition },
    /// Shutdown interrupted the handler; the job went back to `queued`.
    Released { job_id: Uuid },
    /// Our claim was taken over (reaped and re-claimed); outcome discarded.
    Superseded { job_id: Uuid },
}

enum Wait {
    Done(std::result::Result<HandlerResult, JoinError>),
    Shutdown,
    Abandoned,
}

enum Wake {
    Shutdown,
    Notified(Option<Notification>),
    Tick,
}

#[derive(Clone)]
pub struct Consumer {
    cfg: ConsumerConfig,
    engine: LifecycleEngine,
    registry: Arc<HandlerRegistry>,
    notifier: Arc<dyn Notifier>,
}

impl Consumer {
    pub fn new(
        cfg: ConsumerConfig,
        engine: LifecycleEngine,
        registry: Arc<HandlerRegistry>,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            cfg,
            engine,
            registry,
            notifier,
        }
    }

    pub fn id(&self) -> &str {
        &self.cfg.consumer_id
    }

    /// Runs until `shutdown` is cancelled. Errors from a single cycle are
    /// logged and the loop carries on after the poll interval.
    pub async fn run(self, shutdown: CancellationToken) {
        let mut sub = match self.notifier.subscribe(&self.cfg.queues).await {
            Ok(s) => Some(s),
            Err(e) => {
                warn!(consumer_id = %self.cfg.consumer_id, error = %e, "subscribe failed, polling only");
                None
            }
        };
        info!(consumer_id = %self.cfg.consumer_id, queues = ?self.cfg.queues, "consumer started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            match self.run_once(&shutdown).await {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => warn!(consumer_id = %self.cfg.consumer_id, error = %e, "consumer cycle failed"),
            }

            let wake = tokio::select! {
                _ = shutdown.cancelled() => Wake::Shutdown,
                n = next_notification(&mut sub) => Wake::Notified(n),
                _ = tokio::time::sleep(self.cfg.poll_interval) => Wake::Tick,
            };
            match wake {
                Wake::Shutdown => break,
                Wake::Notified(Some(n)) => {
                    debug!(consumer_id = %self.cfg.consumer_id, job_id = %n.job_id, "woken by notification");
                }
                Wake::Notified(None) => {
                    warn!(consumer_id = %self.cfg.consumer_id, "notification stream closed, polling only");
                    sub = None;
                }
                Wake::Tick => {}
            }
        }

        info!(consumer_id = %self.cfg.consumer_id, "consumer stopped");
    }

    /// Claims and processes at most one job. `Ok(None)` when nothing was
    /// eligible.
    pub async fn run_once(&self, shutdown: &CancellationToken) -> Result<Option<Step>> {
        let claimed = self
            .engine
            .store()
            .claim(
                &self.cfg.consumer_id,
                &self.cfg.eligible,
                &self.cfg.queues,
                Utc::now(),
            )
            .await?;

        match claimed {
            Some(job) => self.execute(job, shutdown).await.map(Some),
            None => Ok(None),
        }
    }

    async fn execute(&self, job: Job, shutdown: &CancellationToken) -> Result<Step> {
        debug!(
            consumer_id = %self.cfg.consumer_id,
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempt_count,
            "claimed job"
        );

        let Some(entry) = self.registry.handler_for(&job.job_type) else {
            let err = HandlerError::non_retryable(
                "UNKNOWN_JOB_TYPE",
                format!("no handler registered for job type {}", job.job_type),
            );
            return self.record(&job, Outcome::Failed(err)).await;
        };

        let limit = entry
            .timeout()
            .map_or(self.cfg.execution_timeout, |t| t.min(self.cfg.execution_timeout));
        let ctx = JobContext {
            consumer_id: self.cfg.consumer_id.clone(),
            attempt: job.attempt_count,
            max_attempts: job.max_attempts,
        };

        // The handler's own deadline is enforced inside the task, after any
        // concurrency permit is acquired.
        let mut task = {
            let job = job.clone();
            tokio::spawn(async move { entry.run(job, ctx, limit).await })
        };

        let mut wait = tokio::select! {
            joined = &mut task => Wait::Done(joined),
            _ = shutdown.cancelled() => Wait::Shutdown,
        };

        if let Wait::Shutdown = wait {
            info!(
                consumer_id = %self.cfg.consumer_id,
                job_id = %job.id,
                grace_secs = self.cfg.shutdown_timeout.as_secs(),
                "shutdown requested, waiting for in-flight job"
            );
            wait = tokio::select! {
                joined = &mut task => Wait::Done(joined),
                _ = tokio::time::sleep(self.cfg.shutdown_timeout) => Wait::Abandoned,
            };
        }

        let outcome = match wait {
            Wait::Done(joined) => outcome_from_join(joined),
            Wait::Abandoned | Wait::Shutdown => {
                task.abort();
                return self.release(&job).await;
            }
        };

        self.record(&job, outcome).await
    }

    async fn record(&self, job: &Job, outcome: Outcome) -> Result<Step> {
        match self
            .engine
            .record_outcome(job, &self.cfg.consumer_id, outcome)
            .await
        {
            Ok(transition) => {
                if let Transition::Retry { run_after, .. } = &transition {
                    let delay = (*run_after - Utc::now()).to_std().unwrap_or(Duration::ZERO);
                    publish_later(self.notifier.clone(), job.queue.clone(), job.id, delay);
                }
                Ok(Step::Executed {
                    job_id: job.id,
                    transition,
                })
            }
            Err(JobsError::ClaimConflict { .. }) => {
                warn!(
                    consumer_id = %self.cfg.consumer_id,
                    job_id = %job.id,
                    "claim superseded, discarding outcome"
                );
                Ok(Step::Superseded { job_id: job.id })
            }
            Err(e) => Err(e),
        }
    }

    async fn release(&self, job: &Job) -> Result<Step> {
        match self
            .engine
            .store()
            .release(job.id, &self.cfg.consumer_id, Utc::now())
            .await
        {
            Ok(()) => {
                info!(consumer_id = %self.cfg.consumer_id, job_id = %job.id, "released in-flight job");
                if let Err(e) = self.notifier.publish(&job.queue, job.id).await {
                    debug!(job_id = %job.id, error = %e, "publish after release failed");
                }
                Ok(Step::Released { job_id: job.id })
            }
            Err(JobsError::ClaimConflict { .. }) => Ok(Step::Superseded { job_id: job.id }),
            Err(e) => Err(e),
        }
    }
}

async fn next_notification(sub: &mut Option<Subscription>) -> Option<Notification> {
    match sub {
        Some(s) => s.recv().await,
        None => std::future::pending().await,
    }
}

fn outcome_from_join(joined: std::result::Result<HandlerResult, JoinError>) -> Outcome {
    match joined {
        Ok(Ok(result)) => Outcome::Succeeded { result },
        Ok(Err(err)) => Outcome::Failed(err),
        Err(e) if e.is_panic() => Outcome::Failed(HandlerError::retryable(
            "PANIC",
            panic_message(e.into_panic()),
        )),
        Err(e) => Outcome::Failed(HandlerError::retryable("ABORTED", e.to_string())),
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}
