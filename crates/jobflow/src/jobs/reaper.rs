use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::jobs::lifecycle::LifecycleEngine;
use crate::jobs::model::ReapReport;
use crate::transport::Notifier;

/// Periodic lock-expiry sweep, independent of the consumer loops.
pub struct Reaper {
    engine: LifecycleEngine,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
}

impl Reaper {
    pub fn new(engine: LifecycleEngine, notifier: Arc<dyn Notifier>, interval: Duration) -> Self {
        Self {
            engine,
            notifier,
            interval,
        }
    }

    /// One sweep; requeued jobs are re-published so idle consumers wake up.
    pub async fn run_once(&self) -> Result<ReapReport> {
        let report = self.engine.reap(Utc::now()).await?;
        for (job_id, queue) in &report.requeued {
            if let Err(e) = self.notifier.publish(queue, *job_id).await {
                debug!(%job_id, error = %e, "publish after reap failed");
            }
        }
        Ok(report)
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!(interval_secs = self.interval.as_secs(), "reaper started");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.run_once().await {
                        warn!(error = %e, "reap pass failed");
                    }
                }
            }
        }
        info!("reaper stopped");
    }
}
