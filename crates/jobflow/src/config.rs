use std::time::Duration;

use crate::consumer::ConsumerConfig;
use crate::error::{JobsError, Result};
use crate::ingest::IngestConfig;
use crate::jobs::model::JobStatus;
use crate::jobs::recurring::{parse_recurring, RecurringJob};
use crate::jobs::retry::RetryConfig;

/// Runtime configuration, read once at startup from the environment (and a
/// `.env` file when present). `JOBFLOW_*` names win over the bare fallbacks.
#[derive(Clone, Debug)]
pub struct Config {
    pub database_url: String,
    pub worker_id: String,
    pub queues: Vec<String>,
    pub default_queue: String,
    pub consumers: usize,

    pub poll_interval: Duration,
    pub execution_timeout: Duration,
    pub liveness_timeout: Duration,
    pub reap_interval: Duration,
    pub shutdown_timeout: Duration,

    pub max_attempts: i32,
    pub retry_base: Duration,
    pub retry_max: Duration,
    pub retry_jitter_pct: f64,

    pub max_payload_bytes: usize,
    pub strict_job_types: bool,

    pub api_addr: Option<String>,
    pub api_secret: Option<String>,
    pub migrate_on_startup: bool,

    /// At least 2: the notification listener keeps one connection.
    pub db_max_connections: u32,
    pub db_acquire_timeout: Duration,

    pub recurring: Vec<RecurringJob>,

    pub log_filter: String,
    pub log_json: bool,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary key lookup (tests pass a map).
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let database_url = env
            .get("DATABASE_URL")
            .ok_or_else(|| JobsError::Config("DATABASE_URL is missing".into()))?;

        let worker_id = env
            .or_fallback("JOBFLOW_WORKER_ID", "WORKER_ID")
            .or_else(|| env.get("HOSTNAME"))
            .unwrap_or_else(|| "worker-1".to_string());

        let queues: Vec<String> = env
            .or_fallback("JOBFLOW_QUEUES", "QUEUES")
            .map(|s| {
                s.split(',')
                    .map(|q| q.trim().to_string())
                    .filter(|q| !q.is_empty())
                    .collect()
            })
            .unwrap_or_default();
        let queues = if queues.is_empty() {
            vec!["default".to_string()]
        } else {
            queues
        };
        let default_queue = env
            .get("JOBFLOW_DEFAULT_QUEUE")
            .unwrap_or_else(|| queues[0].clone());

        let consumers = env.parse("JOBFLOW_CONSUMERS", 2_usize)?;
        if consumers == 0 {
            return Err(JobsError::Config("JOBFLOW_CONSUMERS must be at least 1".into()));
        }

        let poll_interval = Duration::from_millis(env.parse("JOBFLOW_POLL_INTERVAL_MS", 1000)?);
        let execution_timeout =
            Duration::from_secs(env.parse("JOBFLOW_EXECUTION_TIMEOUT_SECS", 600)?);
        let liveness_timeout =
            Duration::from_secs(env.parse("JOBFLOW_LIVENESS_TIMEOUT_SECS", 900)?);
        let reap_interval = Duration::from_secs(env.parse("JOBFLOW_REAP_INTERVAL_SECS", 30)?);
        let shutdown_timeout =
            Duration::from_secs(env.parse("JOBFLOW_SHUTDOWN_TIMEOUT_SECS", 30)?);

        if execution_timeout >= liveness_timeout {
            return Err(JobsError::Config(format!(
                "execution timeout ({}s) must be shorter than liveness timeout ({}s)",
                execution_timeout.as_secs(),
                liveness_timeout.as_secs()
            )));
        }
        if poll_interval.is_zero() || reap_interval.is_zero() {
            return Err(JobsError::Config(
                "poll and reap intervals must be non-zero".into(),
            ));
        }

        let max_attempts = env.parse("JOBFLOW_MAX_ATTEMPTS", 8_i32)?;
        if !(1..=100).contains(&max_attempts) {
            return Err(JobsError::Config(
                "JOBFLOW_MAX_ATTEMPTS must be within 1..=100".into(),
            ));
        }

        let retry_base = Duration::from_secs(env.parse("JOBFLOW_RETRY_BASE_SECS", 2)?);
        let retry_max = Duration::from_secs(env.parse("JOBFLOW_RETRY_MAX_SECS", 900)?);
        if retry_base > retry_max {
            return Err(JobsError::Config(
                "JOBFLOW_RETRY_BASE_SECS exceeds JOBFLOW_RETRY_MAX_SECS".into(),
            ));
        }
        let retry_jitter_pct = env.parse("JOBFLOW_RETRY_JITTER_PCT", 0.0_f64)?;
        if !(0.0..=1.0).contains(&retry_jitter_pct) {
            return Err(JobsError::Config(
                "JOBFLOW_RETRY_JITTER_PCT must be within 0.0..=1.0".into(),
            ));
        }

        let max_payload_bytes = env
            .or_fallback("JOBFLOW_MAX_PAYLOAD_BYTES", "MAX_PAYLOAD_BYTES")
            .map(|s| parse_value("JOBFLOW_MAX_PAYLOAD_BYTES", &s))
            .transpose()?
            .unwrap_or(256 * 1024);
        let strict_job_types = env.bool("JOBFLOW_STRICT_JOB_TYPES").unwrap_or(false);

        let api_addr = match env.or_fallback("JOBFLOW_API_ADDR", "API_ADDR") {
            Some(v) => normalize_optional_addr(&v),
            None => Some("0.0.0.0:8090".to_string()),
        };
        let api_secret = env
            .or_fallback("JOBFLOW_API_SECRET", "API_SECRET")
            .map(|s| s.trim().to_string());
        let migrate_on_startup = env.bool("JOBFLOW_MIGRATE_ON_STARTUP").unwrap_or(true);

        let db_max_connections = env
            .parse("JOBFLOW_DB_MAX_CONNECTIONS", 8_u32)?
            .clamp(2, 64);
        let db_acquire_timeout =
            Duration::from_secs(env.parse("JOBFLOW_DB_ACQUIRE_TIMEOUT_SECS", 10_u64)?.clamp(1, 60));

        let recurring = match env.get("JOBFLOW_RECURRING") {
            Some(schedule) => parse_recurring(&schedule)?,
            None => Vec::new(),
        };

        let log_filter = env
            .or_fallback("JOBFLOW_LOG", "RUST_LOG")
            .unwrap_or_else(|| "info".to_string());
        let log_json = env.bool("JOBFLOW_LOG_JSON").unwrap_or(false);

        Ok(Self {
            database_url,
            worker_id,
            queues,
            default_queue,
            consumers,
            poll_interval,
            execution_timeout,
            liveness_timeout,
            reap_interval,
            shutdown_timeout,
            max_attempts,
            retry_base,
            retry_max,
            retry_jitter_pct,
            max_payload_bytes,
            strict_job_types,
            api_addr,
            api_secret,
            migrate_on_startup,
            db_max_connections,
            db_acquire_timeout,
            recurring,
            log_filter,
            log_json,
        })
    }

    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            base: self.retry_base,
            cap: self.retry_max,
            jitter_pct: self.retry_jitter_pct,
        }
    }

    /// Settings for the `index`-th consumer loop of this process.
    pub fn consumer(&self, index: usize) -> ConsumerConfig {
        ConsumerConfig {
            consumer_id: format!("{}-{}", self.worker_id, index),
            queues: self.queues.clone(),
            eligible: JobStatus::CLAIMABLE.to_vec(),
            poll_interval: self.poll_interval,
            execution_timeout: self.execution_timeout,
            shutdown_timeout: self.shutdown_timeout,
        }
    }

    pub fn ingest(&self) -> IngestConfig {
        IngestConfig {
            default_queue: self.default_queue.clone(),
            default_max_attempts: self.max_attempts,
            max_payload_bytes: self.max_payload_bytes,
            strict_job_types: self.strict_job_types,
        }
    }
}

struct Env<'a, F>(&'a F);

impl<F> Env<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn get(&self, key: &str) -> Option<String> {
        (self.0)(key).filter(|s| !s.trim().is_empty())
    }

    fn or_fallback(&self, primary: &str, fallback: &str) -> Option<String> {
        self.get(primary).or_else(|| self.get(fallback))
    }

    fn bool(&self, key: &str) -> Option<bool> {
        self.get(key)
            .map(|v| matches!(v.trim().to_lowercase().as_str(), "1" | "true" | "yes" | "on"))
    }

    fn parse<T: std::str::FromStr>(&self, key: &str, default: T) -> Result<T> {
        match self.get(key) {
            Some(v) => parse_value(key, &v),
            None => Ok(default),
        }
    }
}

fn parse_value<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| JobsError::Config(format!("{key}: cannot parse {value:?}")))
}

fn normalize_optional_addr(value: &str) -> Option<String> {
    let v = value.trim();
    if v.is_empty() {
        return None;
    }
    if matches!(v.to_lowercase().as_str(), "0" | "off" | "false" | "none") {
        return None;
    }
    Some(v.to_string())
}
