use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use jobflow::consumer::{Consumer, ConsumerConfig, Step};
use jobflow::ingest::{IngestConfig, IngestService, Submission};
use jobflow::jobs::retry::RetryConfig;
use jobflow::jobs::{
    DeadReason, HandlerError, HandlerOptions, HandlerRegistry, JobStatus, JobStore,
    LifecycleEngine, MemoryJobStore, Transition,
};
use jobflow::transport::{LocalNotifier, Notifier};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct Harness {
    store: Arc<MemoryJobStore>,
    ingest: IngestService,
    engine: LifecycleEngine,
    registry: Arc<HandlerRegistry>,
    notifier: Arc<dyn Notifier>,
    cfg: ConsumerConfig,
    consumer: Consumer,
}

fn harness(registry: HandlerRegistry, tweak: impl FnOnce(&mut ConsumerConfig)) -> Harness {
    let store = Arc::new(MemoryJobStore::new());
    let notifier: Arc<dyn Notifier> = Arc::new(LocalNotifier::new());
    let registry = Arc::new(registry);
    let retry = RetryConfig {
        base: Duration::from_millis(200),
        cap: Duration::from_secs(1),
        jitter_pct: 0.0,
    };
    let engine = LifecycleEngine::new(store.clone(), retry, Duration::from_secs(60));

    let mut cfg = ConsumerConfig::new("test-consumer", vec!["default".to_string()]);
    cfg.poll_interval = Duration::from_secs(60);
    cfg.execution_timeout = Duration::from_secs(5);
    cfg.shutdown_timeout = Duration::from_secs(5);
    tweak(&mut cfg);

    let ingest = IngestService::new(
        store.clone(),
        notifier.clone(),
        registry.clone(),
        IngestConfig::default(),
    );
    let consumer = Consumer::new(cfg.clone(), engine.clone(), registry.clone(), notifier.clone());
    Harness {
        store,
        ingest,
        engine,
        registry,
        notifier,
        cfg,
        consumer,
    }
}

impl Harness {
    /// Another consumer over the same store and registry, with its own id.
    fn consumer_named(&self, id: &str) -> Consumer {
        let mut cfg = self.cfg.clone();
        cfg.consumer_id = id.to_string();
        Consumer::new(
            cfg,
            self.engine.clone(),
            self.registry.clone(),
            self.notifier.clone(),
        )
    }

    async fn submit(&self, job_type: &str) -> Uuid {
        self.submit_with(Submission::new(job_type, json!({"n": 1})))
            .await
    }

    async fn submit_with(&self, sub: Submission) -> Uuid {
        self.ingest.submit(sub).await.unwrap().job_id
    }

    async fn wait_for(&self, id: Uuid, status: JobStatus) -> jobflow::jobs::Job {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            let job = self.store.get(id).await.unwrap();
            if job.status == status {
                return job;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "job {id} stuck in {} waiting for {status}",
                job.status
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test]
async fn success_stores_handler_result() {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", |job, ctx| async move {
        Ok(Some(json!({"echo": job.payload, "attempt": ctx.attempt})))
    });
    let h = harness(registry, |_| {});
    let id = h.submit("echo").await;

    let step = h
        .consumer
        .run_once(&CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(
        step,
        Step::Executed { job_id, transition: Transition::Succeed { .. } } if job_id == id
    ));

    let job = h.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Succeeded);
    assert_eq!(job.result, Some(json!({"echo": {"n": 1}, "attempt": 1})));

    // nothing left
    assert!(h
        .consumer
        .run_once(&CancellationToken::new())
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn retryable_failure_is_retried_until_success() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let calls = calls.clone();
        registry.register("flaky", move |_job, _ctx| {
            let calls = calls.clone();
            async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(HandlerError::new("DEPENDENCY_DOWN", "crm unreachable"))
                } else {
                    Ok(None)
                }
            }
        });
    }
    let h = harness(registry, |_| {});
    let id = h.submit("flaky").await;

    // first attempt parks the job in failed
    h.consumer
        .run_once(&CancellationToken::new())
        .await
        .unwrap()
        .unwrap();
    let parked = h.store.get(id).await.unwrap();
    assert_eq!(parked.status, JobStatus::Failed);
    assert_eq!(
        parked.last_error.as_deref(),
        Some("DEPENDENCY_DOWN: crm unreachable")
    );

    // the long poll interval means only the delayed publish can wake the loop
    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(h.consumer.clone().run(shutdown.clone()));

    let job = h.wait_for(id, JobStatus::Succeeded).await;
    assert_eq!(job.attempt_count, 2);
    assert!(job.last_error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);

    shutdown.cancel();
    runner.await.unwrap();
}

#[tokio::test]
async fn non_retryable_failure_goes_dead() {
    let mut registry = HandlerRegistry::new();
    registry.register("strict", |_job, _ctx| async {
        Err(HandlerError::bad_payload("contact_id missing"))
    });
    let h = harness(registry, |_| {});
    let id = h.submit("strict").await;

    h.consumer
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

    let job = h.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert_eq!(job.attempt_count, 1);
    assert_eq!(job.dead_reason.as_deref(), Some(DeadReason::NonRetryable.as_str()));
}

#[tokio::test]
async fn unknown_job_type_goes_dead() {
    let h = harness(HandlerRegistry::new(), |_| {});
    let id = h.submit("nobody-handles-this").await;

    h.consumer
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

    let job = h.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Dead);
    assert!(job
        .last_error
        .as_deref()
        .unwrap()
        .starts_with("UNKNOWN_JOB_TYPE"));
}

#[tokio::test]
async fn panicking_handler_is_a_retryable_failure() {
    let mut registry = HandlerRegistry::new();
    registry.register("boom", |_job, _ctx| async {
        if true {
            panic!("kaboom");
        }
        Ok(None)
    });
    let h = harness(registry, |_| {});
    let id = h.submit("boom").await;

    h.consumer
        .run_once(&CancellationToken::new())
        .await
        .unwrap();

    let job = h.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.last_error.as_deref(), Some("PANIC: kaboom"));
    assert!(job.locked_by.is_none());
}

#[tokio::test]
async fn slow_handler_times_out() {
    let mut registry = HandlerRegistry::new();
    registry.register("slow", |_job, _ctx| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(None)
    });
    let h = harness(registry, |cfg| {
        cfg.execution_timeout = Duration::from_millis(100)
    });
    let id = h.submit("slow").await;

    let started = tokio::time::Instant::now();
    h.consumer
        .run_once(&CancellationToken::new())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(5));

    let job = h.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert!(job.last_error.as_deref().unwrap().starts_with("TIMEOUT"));
}

#[tokio::test]
async fn handler_timeout_can_be_shorter_than_global() {
    let mut registry = HandlerRegistry::new();
    registry.register_with_options(
        "slow",
        HandlerOptions::new().timeout(Duration::from_millis(50)),
        |_job, _ctx| async {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        },
    );
    let h = harness(registry, |_| {});
    let id = h.submit("slow").await;

    let started = tokio::time::Instant::now();
    h.consumer
        .run_once(&CancellationToken::new())
        .await
        .unwrap();
    assert!(started.elapsed() < Duration::from_secs(2));
    assert_eq!(h.store.get(id).await.unwrap().status, JobStatus::Failed);
}

#[tokio::test]
async fn waiting_for_concurrency_slot_does_not_count_toward_timeout() {
    let mut registry = HandlerRegistry::new();
    registry.register_with_options(
        "serial",
        HandlerOptions::new()
            .max_concurrency(1)
            .timeout(Duration::from_millis(300)),
        |_job, _ctx| async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            Ok(None)
        },
    );
    let h = harness(registry, |_| {});
    let a = h.submit("serial").await;
    let b = h.submit("serial").await;

    let first = h.consumer_named("c-a");
    let second = h.consumer_named("c-b");
    let shutdown = CancellationToken::new();
    let (ra, rb) = tokio::join!(first.run_once(&shutdown), second.run_once(&shutdown));
    ra.unwrap().unwrap();
    rb.unwrap().unwrap();

    for id in [a, b] {
        let job = h.store.get(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Succeeded, "{:?}", job.last_error);
        assert_eq!(job.attempt_count, 1);
    }
}

#[tokio::test]
async fn transient_failures_exhaust_max_attempts() {
    let calls = Arc::new(AtomicUsize::new(0));
    let mut registry = HandlerRegistry::new();
    {
        let calls = calls.clone();
        registry.register("always-down", move |_job, _ctx| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(HandlerError::new("DEPENDENCY_DOWN", "crm unreachable")) }
        });
    }
    let h = harness(registry, |_| {});
    let mut sub = Submission::new("always-down", json!({}));
    sub.max_attempts = Some(3);
    let id = h.submit_with(sub).await;

    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(h.consumer.clone().run(shutdown.clone()));

    let job = h.wait_for(id, JobStatus::Dead).await;
    shutdown.cancel();
    runner.await.unwrap();

    assert_eq!(job.attempt_count, 3);
    assert_eq!(
        job.dead_reason.as_deref(),
        Some(DeadReason::MaxAttemptsExceeded.as_str())
    );
    assert_eq!(
        job.last_error.as_deref(),
        Some("DEPENDENCY_DOWN: crm unreachable")
    );
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let later = Utc::now() + chrono::Duration::hours(1);
    let again = h
        .store
        .claim("late-consumer", &JobStatus::CLAIMABLE, &["default".to_string()], later)
        .await
        .unwrap();
    assert!(again.is_none());
}

#[tokio::test]
async fn shutdown_releases_job_after_grace_period() {
    let mut registry = HandlerRegistry::new();
    registry.register("stuck", |_job, _ctx| async {
        tokio::time::sleep(Duration::from_secs(30)).await;
        Ok(None)
    });
    let h = harness(registry, |cfg| {
        cfg.shutdown_timeout = Duration::from_millis(100)
    });
    let id = h.submit("stuck").await;

    let shutdown = CancellationToken::new();
    let task = {
        let consumer = h.consumer.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run_once(&shutdown).await })
    };
    h.wait_for(id, JobStatus::Running).await;
    shutdown.cancel();

    let step = task.await.unwrap().unwrap().unwrap();
    assert_eq!(step, Step::Released { job_id: id });

    let job = h.store.get(id).await.unwrap();
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.attempt_count, 0, "interrupted attempt is not charged");
    assert!(job.locked_by.is_none());
}

#[tokio::test]
async fn shutdown_lets_in_flight_job_finish_within_grace() {
    let mut registry = HandlerRegistry::new();
    registry.register("quick", |_job, _ctx| async {
        tokio::time::sleep(Duration::from_millis(200)).await;
        Ok(Some(json!("done")))
    });
    let h = harness(registry, |_| {});
    let id = h.submit("quick").await;

    let shutdown = CancellationToken::new();
    let task = {
        let consumer = h.consumer.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { consumer.run_once(&shutdown).await })
    };
    h.wait_for(id, JobStatus::Running).await;
    shutdown.cancel();

    let step = task.await.unwrap().unwrap().unwrap();
    assert!(matches!(step, Step::Executed { transition: Transition::Succeed { .. }, .. }));
    assert_eq!(h.store.get(id).await.unwrap().result, Some(json!("done")));
}

#[tokio::test]
async fn idle_consumer_wakes_on_notification() {
    let mut registry = HandlerRegistry::new();
    registry.register("echo", |_job, _ctx| async { Ok(None) });
    let h = harness(registry, |_| {});

    let shutdown = CancellationToken::new();
    let runner = tokio::spawn(h.consumer.clone().run(shutdown.clone()));
    // let the consumer subscribe and go idle
    tokio::time::sleep(Duration::from_millis(100)).await;

    let submitted = Utc::now();
    let id = h.submit("echo").await;
    h.wait_for(id, JobStatus::Succeeded).await;
    assert!(Utc::now() - submitted < chrono::Duration::seconds(5));

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(2), runner)
        .await
        .expect("consumer stops on shutdown")
        .unwrap();
}

#[tokio::test]
async fn concurrent_consumers_run_each_job_once() {
    let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
    let mut registry = HandlerRegistry::new();
    {
        let seen = seen.clone();
        registry.register("count", move |job, _ctx| {
            let seen = seen.clone();
            async move {
                seen.lock().unwrap().push(job.id);
                Ok(None)
            }
        });
    }
    let h = harness(registry, |_| {});

    let mut ids = Vec::new();
    for _ in 0..20 {
        ids.push(h.submit("count").await);
    }

    let shutdown = CancellationToken::new();
    let mut runners = Vec::new();
    for i in 0..4 {
        let consumer = h.consumer_named(&format!("c-{i}"));
        runners.push(tokio::spawn(consumer.run(shutdown.clone())));
    }
    for id in &ids {
        h.wait_for(*id, JobStatus::Succeeded).await;
    }
    shutdown.cancel();
    for r in runners {
        r.await.unwrap();
    }

    let mut seen = seen.lock().unwrap().clone();
    seen.sort();
    ids.sort();
    assert_eq!(seen, ids);
}
