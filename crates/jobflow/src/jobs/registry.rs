//! `job_type` -> handler map, built once at startup.
//!
//! Delivery is at-least-once: a consumer that dies after its handler finished
//! but before the outcome was recorded leaves the job to the reaper, and the
//! handler runs again. Handlers must tolerate being re-executed for the same
//! job.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Semaphore;

use crate::jobs::model::Job;
use crate::jobs::retry::{classify_error, ErrorClass};

pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;

/// `Ok(Some(v))` stores `v` as the job result.
pub type HandlerResult = Result<Option<Value>, HandlerError>;

type HandlerFn = dyn Fn(Job, JobContext) -> BoxFuture<HandlerResult> + Send + Sync;
type ValidatorFn = dyn Fn(&Value) -> Result<(), String> + Send + Sync;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
    pub class: ErrorClass,
}

impl HandlerError {
    /// Classified from `code` (see [`classify_error`]).
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        let code = code.into();
        let class = classify_error(&code);
        Self {
            code,
            message: message.into(),
            class,
        }
    }

    pub fn retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            class: ErrorClass::Retryable,
        }
    }

    pub fn non_retryable(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            class: ErrorClass::NonRetryable,
        }
    }

    pub fn bad_payload(message: impl Into<String>) -> Self {
        Self::non_retryable("BAD_PAYLOAD", message)
    }

    pub fn is_retryable(&self) -> bool {
        self.class == ErrorClass::Retryable
    }
}

#[derive(Debug, Clone)]
pub struct JobContext {
    pub consumer_id: String,
    /// 1-based number of the attempt being executed.
    pub attempt: i32,
    pub max_attempts: i32,
}

impl JobContext {
    pub fn is_last_attempt(&self) -> bool {
        self.attempt >= self.max_attempts
    }
}

#[derive(Clone, Debug, Default)]
pub struct HandlerOptions {
    max_concurrency: Option<usize>,
    timeout: Option<Duration>,
}

impl HandlerOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cap on simultaneous executions of this job type within the process.
    pub fn max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = Some(n);
        self
    }

    /// Shorter execution timeout for this type. It can never extend the
    /// consumer's global execution timeout.
    pub fn timeout(mut self, dur: Duration) -> Self {
        self.timeout = Some(dur);
        self
    }
}

#[derive(Clone)]
pub struct HandlerEntry {
    handler: Arc<HandlerFn>,
    semaphore: Option<Arc<Semaphore>>,
    timeout: Option<Duration>,
}

impl HandlerEntry {
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Waits for a concurrency permit, then runs the handler under `limit`.
    /// The deadline starts once the permit is held.
    pub async fn run(&self, job: Job, ctx: JobContext, limit: Duration) -> HandlerResult {
        let _permit = match &self.semaphore {
            Some(sem) => Some(sem.clone().acquire_owned().await.map_err(|_| {
                HandlerError::retryable("WORKER_SHUTDOWN", "handler semaphore closed")
            })?),
            None => None,
        };

        match tokio::time::timeout(limit, (self.handler)(job, ctx)).await {
            Ok(res) => res,
            Err(_) => Err(HandlerError::retryable(
                "TIMEOUT",
                format!("handler exceeded {}ms", limit.as_millis()),
            )),
        }
    }
}

#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, HandlerEntry>,
    validators: HashMap<String, Arc<ValidatorFn>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, job_type: &str, handler: F)
    where
        F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.register_with_options(job_type, HandlerOptions::new(), handler);
    }

    pub fn register_with_options<F, Fut>(&mut self, job_type: &str, opts: HandlerOptions, handler: F)
    where
        F: Fn(Job, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let semaphore = opts
            .max_concurrency
            .map(|n| Arc::new(Semaphore::new(n.max(1))));
        let handler: Arc<HandlerFn> =
            Arc::new(move |job: Job, ctx: JobContext| -> BoxFuture<HandlerResult> {
                Box::pin(handler(job, ctx))
            });

        self.handlers.insert(
            job_type.to_string(),
            HandlerEntry {
                handler,
                semaphore,
                timeout: opts.timeout,
            },
        );
    }

    /// Registers a handler taking a deserialized payload. A payload that does
    /// not decode into `P` fails the job with non-retryable `BAD_PAYLOAD`, and
    /// the same check is installed as the ingest validator for `job_type`.
    pub fn register_typed<P, F, Fut>(&mut self, job_type: &str, opts: HandlerOptions, handler: F)
    where
        P: DeserializeOwned + Send + 'static,
        F: Fn(P, Job, JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.register_with_options(job_type, opts, move |job: Job, ctx: JobContext| {
            let handler = handler.clone();
            async move {
                let payload: P = serde_json::from_value(job.payload.clone())
                    .map_err(|e| HandlerError::bad_payload(e.to_string()))?;
                handler(payload, job, ctx).await
            }
        });

        self.validators.insert(
            job_type.to_string(),
            Arc::new(|payload: &Value| {
                serde_json::from_value::<P>(payload.clone())
                    .map(|_| ())
                    .map_err(|e| e.to_string())
            }),
        );
    }

    pub fn handler_for(&self, job_type: &str) -> Option<HandlerEntry> {
        self.handlers.get(job_type).cloned()
    }

    pub fn contains(&self, job_type: &str) -> bool {
        self.handlers.contains_key(job_type)
    }

    pub fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.handlers.keys().cloned().collect();
        types.sort();
        types
    }

    /// `None` when no validator is registered for `job_type`.
    pub fn validate(&self, job_type: &str, payload: &Value) -> Option<Result<(), String>> {
        self.validators.get(job_type).map(|check| check(payload))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde::Deserialize;
    use serde_json::json;
    use uuid::Uuid;

    use crate::jobs::model::JobStatus;

    fn job(job_type: &str, payload: Value) -> Job {
        let now = Utc::now();
        Job {
            id: Uuid::new_v4(),
            queue: "default".into(),
            job_type: job_type.into(),
            status: JobStatus::Running,
            payload,
            result: None,
            idempotency_key: None,
            attempt_count: 1,
            max_attempts: 3,
            run_after: now,
            locked_by: Some("c-1".into()),
            locked_at: Some(now),
            last_error: None,
            dead_reason: None,
            replay_of_job_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    const LIMIT: Duration = Duration::from_secs(5);

    fn ctx() -> JobContext {
        JobContext {
            consumer_id: "c-1".into(),
            attempt: 1,
            max_attempts: 3,
        }
    }

    #[derive(Deserialize)]
    struct Greet {
        name: String,
    }

    #[test]
    fn error_constructors_classify() {
        assert!(HandlerError::new("TIMEOUT", "slow").is_retryable());
        assert!(!HandlerError::new("BAD_PAYLOAD", "nope").is_retryable());
        assert!(!HandlerError::non_retryable("TIMEOUT", "forced").is_retryable());
        assert_eq!(HandlerError::new("X", "y").to_string(), "X: y");
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload() {
        let mut registry = HandlerRegistry::new();
        registry.register_typed("greet", HandlerOptions::new(), |p: Greet, _job, _ctx| async move {
            Ok(Some(json!({ "hello": p.name })))
        });

        let entry = registry.handler_for("greet").unwrap();
        let out = entry.run(job("greet", json!({"name": "ada"})), ctx(), LIMIT).await;
        assert_eq!(out, Ok(Some(json!({"hello": "ada"}))));

        let err = entry
            .run(job("greet", json!({"nom": "ada"})), ctx(), LIMIT)
            .await
            .unwrap_err();
        assert_eq!(err.code, "BAD_PAYLOAD");
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn deadline_starts_after_permit() {
        let mut registry = HandlerRegistry::new();
        registry.register_with_options(
            "serial",
            HandlerOptions::new().max_concurrency(1),
            |_job, _ctx| async {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok(None)
            },
        );
        let entry = registry.handler_for("serial").unwrap();
        let limit = Duration::from_millis(300);

        let (a, b) = tokio::join!(
            entry.run(job("serial", json!({})), ctx(), limit),
            entry.run(job("serial", json!({})), ctx(), limit),
        );
        assert_eq!(a, Ok(None));
        assert_eq!(b, Ok(None));

        let err = entry
            .run(job("serial", json!({})), ctx(), Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err.code, "TIMEOUT");
        assert!(err.is_retryable());
    }

    #[test]
    fn typed_registration_installs_validator() {
        let mut registry = HandlerRegistry::new();
        registry.register_typed("greet", HandlerOptions::new(), |_p: Greet, _job, _ctx| async {
            Ok(None)
        });
        registry.register("plain", |_job, _ctx| async { Ok(None) });

        assert_eq!(registry.validate("greet", &json!({"name": "x"})), Some(Ok(())));
        assert!(matches!(registry.validate("greet", &json!({})), Some(Err(_))));
        assert_eq!(registry.validate("plain", &json!({})), None);
        assert_eq!(registry.job_types(), vec!["greet".to_string(), "plain".to_string()]);
    }
}
