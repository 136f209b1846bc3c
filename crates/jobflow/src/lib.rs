pub mod api;
pub mod config;
pub mod consumer;
pub mod db;
pub mod error;
pub mod ingest;
pub mod jobs;
pub mod telemetry;
pub mod transport;

pub use config::Config;
pub use error::{JobsError, Result};
