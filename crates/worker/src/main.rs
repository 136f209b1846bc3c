use std::sync::Arc;

use jobflow::api::{self, ApiState};
use jobflow::config::Config;
use jobflow::consumer::Consumer;
use jobflow::db;
use jobflow::ingest::IngestService;
use jobflow::jobs::reaper::Reaper;
use jobflow::jobs::recurring::RecurringScheduler;
use jobflow::jobs::{JobStore, JobsRepo, LifecycleEngine};
use jobflow::telemetry;
use jobflow::transport::{Notifier, PgNotifier};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

mod handlers;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cfg = Config::from_env()?;
    telemetry::init(&cfg);

    info!(
        worker_id = %cfg.worker_id,
        queues = ?cfg.queues,
        consumers = cfg.consumers,
        api = cfg.api_addr.as_deref().unwrap_or("disabled"),
        auth = if cfg.api_secret.is_some() { "enabled" } else { "disabled" },
        migrate_on_startup = cfg.migrate_on_startup,
        "jobflow worker starting"
    );

    let pool = db::make_pool(&cfg).await?;
    if cfg.migrate_on_startup {
        db::run_migrations(&pool).await?;
    }

    let store: Arc<dyn JobStore> = Arc::new(JobsRepo::new(pool.clone()));
    let notifier: Arc<dyn Notifier> = Arc::new(PgNotifier::new(pool.clone()));
    let registry = handlers::build_registry();
    let engine = LifecycleEngine::new(store.clone(), cfg.retry(), cfg.liveness_timeout);
    let ingest = IngestService::new(
        store.clone(),
        notifier.clone(),
        registry.clone(),
        cfg.ingest(),
    );

    let shutdown = CancellationToken::new();
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    // ---- API ----
    if let Some(addr) = cfg.api_addr.clone() {
        let app = api::router(ApiState::new(ingest.clone(), cfg.api_secret.clone()));
        let listener = tokio::net::TcpListener::bind(&addr).await?;
        info!(%addr, "api listening");
        let token = shutdown.clone();
        tasks.spawn(async move {
            axum::serve(listener, app)
                .with_graceful_shutdown(async move { token.cancelled().await })
                .await?;
            Ok(())
        });
    }

    // ---- Reaper ----
    let reaper = Reaper::new(engine.clone(), notifier.clone(), cfg.reap_interval);
    let token = shutdown.clone();
    tasks.spawn(async move {
        reaper.run(token).await;
        Ok(())
    });

    // ---- Recurring submissions ----
    if !cfg.recurring.is_empty() {
        let scheduler = RecurringScheduler::new(ingest.clone(), cfg.recurring.clone());
        let token = shutdown.clone();
        tasks.spawn(async move {
            scheduler.run(token).await;
            Ok(())
        });
    }

    // ---- Consumers ----
    for index in 0..cfg.consumers {
        let consumer = Consumer::new(
            cfg.consumer(index),
            engine.clone(),
            registry.clone(),
            notifier.clone(),
        );
        let token = shutdown.clone();
        tasks.spawn(async move {
            consumer.run(token).await;
            Ok(())
        });
    }

    tokio::select! {
        _ = shutdown_signal() => info!("shutdown signal received"),
        Some(res) = tasks.join_next() => match res {
            Ok(Ok(())) => error!("background task exited early"),
            Ok(Err(e)) => error!(error = %e, "background task failed"),
            Err(e) => error!(error = %e, "background task panicked"),
        },
    }

    shutdown.cancel();
    while let Some(res) = tasks.join_next().await {
        match res {
            Ok(Ok(())) => {}
            Ok(Err(e)) => error!(error = %e, "task failed during shutdown"),
            Err(e) => error!(error = %e, "task panicked during shutdown"),
        }
    }

    pool.close().await;
    info!("jobflow worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "cannot listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!(error = %e, "cannot listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
