//! Tracing/logging initialization.

use tracing_subscriber::EnvFilter;

use crate::config::Config;

/// Installs the global subscriber. Later calls are no-ops.
pub fn init(cfg: &Config) {
    init_with(&cfg.log_filter, cfg.log_json);
}

pub fn init_with(filter: &str, json: bool) {
    let filter = EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);

    let _ = if json {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
}
