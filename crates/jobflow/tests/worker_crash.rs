mod common;

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use common::{age_lock, queues, setup_db, small_pool};
use jobflow::consumer::{Consumer, ConsumerConfig};
use jobflow::jobs::reaper::Reaper;
use jobflow::jobs::retry::RetryConfig;
use jobflow::jobs::{HandlerRegistry, JobStatus, JobStore, JobsRepo, LifecycleEngine, NewJob};
use jobflow::transport::{Notifier, PgNotifier};
use serde_json::json;
use serial_test::serial;
use tokio_util::sync::CancellationToken;

#[tokio::test]
#[serial]
async fn crashed_consumer_job_is_recovered_by_another() -> anyhow::Result<()> {
    let pool = setup_db().await;
    let repo = JobsRepo::new(pool.clone());
    let store: Arc<dyn JobStore> = Arc::new(repo.clone());
    let notifier: Arc<dyn Notifier> = Arc::new(PgNotifier::new(pool.clone()));

    let job_id = repo
        .insert(
            NewJob::now("default", "resume-extract", json!({"contact_id": "42"}), 3),
            Utc::now(),
        )
        .await?;

    // consumer A claims and "crashes" without reporting
    let claimed = repo
        .claim("consumer-a", &JobStatus::CLAIMABLE, &queues(&["default"]), Utc::now())
        .await?
        .expect("claimed by A");
    assert_eq!(claimed.id, job_id);
    age_lock(&pool, job_id, 600).await;

    let mut registry = HandlerRegistry::new();
    registry.register("resume-extract", |job, ctx| async move {
        Ok(Some(json!({
            "contact_id": job.payload["contact_id"],
            "consumer": ctx.consumer_id,
        })))
    });

    let engine = LifecycleEngine::new(store.clone(), RetryConfig::default(), Duration::from_secs(60));
    let mut cfg = ConsumerConfig::new("consumer-b", queues(&["default"]));
    // only the reaper's notification should wake B
    cfg.poll_interval = Duration::from_secs(60);
    let consumer_b = Consumer::new(cfg, engine.clone(), Arc::new(registry), notifier.clone());

    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(consumer_b.run(shutdown.clone()));
    tokio::time::sleep(Duration::from_millis(300)).await;

    let report = Reaper::new(engine, notifier, Duration::from_secs(5))
        .run_once()
        .await?;
    assert_eq!(report.requeued.len(), 1);

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    let job = loop {
        let job = repo.get(job_id).await?;
        if job.status == JobStatus::Succeeded {
            break job;
        }
        assert!(tokio::time::Instant::now() < deadline, "stuck in {}", job.status);
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    assert_eq!(job.attempt_count, 2);
    assert_eq!(
        job.result,
        Some(json!({"contact_id": "42", "consumer": "consumer-b"}))
    );

    shutdown.cancel();
    runner.await?;
    Ok(())
}

#[tokio::test]
#[serial]
async fn pg_notifier_delivers_to_matching_queue() -> anyhow::Result<()> {
    let pool = setup_db().await;
    let notifier = PgNotifier::new(pool.clone());

    let mut sub = notifier.subscribe(&queues(&["emails"])).await?;
    let id = uuid::Uuid::new_v4();
    notifier.publish("default", uuid::Uuid::new_v4()).await?;
    notifier.publish("emails", id).await?;

    let n = tokio::time::timeout(Duration::from_secs(5), sub.recv())
        .await?
        .expect("notification");
    assert_eq!(n.queue, "emails");
    assert_eq!(n.job_id, id);
    Ok(())
}

#[tokio::test]
#[serial]
async fn subscriptions_share_one_listener_connection() -> anyhow::Result<()> {
    let _ = setup_db().await;
    let pool = small_pool(2).await;
    let notifier = PgNotifier::new(pool.clone());

    // more subscribers than the pool has connections
    let mut subs = Vec::new();
    for _ in 0..4 {
        let sub = tokio::time::timeout(
            Duration::from_secs(5),
            notifier.subscribe(&queues(&["default"])),
        )
        .await??;
        subs.push(sub);
    }

    let (one,): (i32,) = sqlx::query_as("SELECT 1").fetch_one(&pool).await?;
    assert_eq!(one, 1);

    let id = uuid::Uuid::new_v4();
    notifier.publish("default", id).await?;
    for sub in &mut subs {
        let n = tokio::time::timeout(Duration::from_secs(5), sub.recv())
            .await?
            .expect("notification");
        assert_eq!(n.job_id, id);
    }
    Ok(())
}
