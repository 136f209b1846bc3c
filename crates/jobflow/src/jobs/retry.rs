use std::time::Duration;

use rand::Rng;

#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub base: Duration,
    pub cap: Duration,
    /// Symmetric jitter as a fraction of the nominal delay, 0.0 disables it.
    pub jitter_pct: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(2),
            cap: Duration::from_secs(15 * 60),
            jitter_pct: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    Retryable,
    NonRetryable,
}

pub fn classify_error(code: &str) -> ErrorClass {
    match code {
        "TIMEOUT" | "DEPENDENCY_DOWN" | "RATE_LIMIT" | "DB_DEADLOCK" | "SERIALIZATION"
        | "PANIC" => ErrorClass::Retryable,
        "BAD_PAYLOAD" | "UNKNOWN_JOB_TYPE" => ErrorClass::NonRetryable,
        _ => ErrorClass::Retryable,
    }
}

/// `min(base * 2^(attempt_count-1), cap)` without jitter.
pub fn backoff_delay(attempt_count: i32, cfg: &RetryConfig) -> Duration {
    let attempt = attempt_count.max(1) as u32;

    // 2^(attempt-1); past 63 bits the cap wins anyway
    let pow2 = 1_u64.checked_shl(attempt - 1).unwrap_or(u64::MAX);

    let base_ms = cfg.base.as_millis().min(u64::MAX as u128) as u64;
    let cap_ms = cfg.cap.as_millis().min(u64::MAX as u128) as u64;

    Duration::from_millis(base_ms.saturating_mul(pow2).min(cap_ms))
}

/// Backoff with jitter in `[-jitter_pct, +jitter_pct]`, clamped to `[0, cap]`.
pub fn jittered_delay(attempt_count: i32, cfg: &RetryConfig, rng: &mut impl Rng) -> Duration {
    let delay = backoff_delay(attempt_count, cfg);
    if cfg.jitter_pct <= 0.0 {
        return delay;
    }

    let delay_ms = delay.as_millis() as f64;
    let jitter_range = delay_ms * cfg.jitter_pct.min(1.0);
    let jitter = rng.gen_range(-jitter_range..=jitter_range);

    let jittered = (delay_ms + jitter).round().max(0.0) as u64;
    Duration::from_millis(jittered).min(cfg.cap)
}
