use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use uuid::Uuid;

use bulwark::batch::{BatchItem, BulkWriteOutcome, BulkWriter};
use bulwark::clock::ManualClock;
use bulwark::config::{Config, ScheduledTaskConfig};
use bulwark::engine::Engine;
use bulwark::error::ResilienceError;
use bulwark::handlers::handler_fn;
use bulwark::humanize::HumanDuration;
use bulwark::queue::JobStatus;

/// Poll until every tracked job is finished or the deadline passes
async fn wait_for_idle(engine: &Engine, timeout: Duration) {
    let deadline = tokio::time::Instant::now() + timeout;
    while engine.queue().stats().unfinished() > 0 {
        assert!(tokio::time::Instant::now() < deadline, "jobs did not finish in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

#[tokio::test]
async fn test_every_job_runs_exactly_once() {
    let mut config = Config::default();
    config.jobs.workers = 4;
    let engine = Engine::new(config).await.unwrap();

    let runs: Arc<Mutex<HashMap<Uuid, u32>>> = Arc::default();
    let seen = runs.clone();
    engine.handlers().register(
        "count",
        Arc::new(handler_fn(move |ctx, payload| {
            let seen = seen.clone();
            async move {
                *seen.lock().entry(ctx.job_id).or_default() += 1;
                tokio::time::sleep(Duration::from_millis(1)).await;
                Ok(payload)
            }
        })),
    );
    engine.start();

    let mut ids = Vec::new();
    for n in 0..100 {
        ids.push(engine.queue().submit("count", json!({ "n": n })).unwrap());
    }

    wait_for_idle(&engine, Duration::from_secs(10)).await;

    let runs = runs.lock();
    assert_eq!(runs.len(), 100);
    assert!(runs.values().all(|&count| count == 1));
    for id in &ids {
        let job = engine.queue().get_status(id).unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt, 1);
    }
    drop(runs);

    let report = engine.stop().await;
    assert!(report.abandoned.is_empty());
}

#[tokio::test]
async fn test_failing_job_retries_until_cap() {
    let mut config = Config::default();
    config.jobs.max_attempts = 3;
    config.jobs.retry_base_delay = HumanDuration::from_millis(10);
    let engine = Engine::new(config).await.unwrap();

    let calls = Arc::new(AtomicU32::new(0));
    let counter = calls.clone();
    engine.handlers().register(
        "flaky",
        Arc::new(handler_fn(move |_ctx, _payload| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Err::<Value, _>(ResilienceError::dependency("inventory", "connection refused"))
            }
        })),
    );
    engine.start();

    let id = engine.queue().submit("flaky", Value::Null).unwrap();
    wait_for_idle(&engine, Duration::from_secs(5)).await;

    let job = engine.queue().get_status(&id).unwrap();
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.attempt, 3);
    assert_eq!(job.error.unwrap().code, "RETRY_EXHAUSTED");
    assert_eq!(calls.load(Ordering::SeqCst), 3);

    let metrics = engine.render_metrics();
    assert!(metrics.contains("bulwark_jobs_retried_total 2"));
    assert!(metrics.contains("bulwark_jobs_failed_total 1"));

    engine.stop().await;
}

#[tokio::test]
async fn test_cache_entry_expires_with_clock() {
    let clock = ManualClock::new();
    let engine = Engine::with_clock(Config::default(), Arc::new(clock.clone()))
        .await
        .unwrap();
    let cache = engine.cache();

    cache.set("geo:lookup:1", "paris", Duration::from_secs(1)).await;
    assert_eq!(cache.get("geo:lookup:1").await.as_deref(), Some(&b"paris"[..]));

    clock.advance(Duration::from_millis(1100));
    assert!(cache.get("geo:lookup:1").await.is_none());

    let stats = cache.stats();
    assert_eq!(stats.local_hits, 1);
    assert_eq!(stats.misses, 1);
}

#[derive(Debug, Clone)]
struct Event {
    id: String,
}

impl BatchItem for Event {
    fn item_id(&self) -> String {
        self.id.clone()
    }
}

#[derive(Default)]
struct EventSink {
    batches: Mutex<Vec<Vec<String>>>,
}

#[async_trait]
impl BulkWriter<Event> for EventSink {
    async fn bulk_write(&self, items: &[Event]) -> Result<BulkWriteOutcome, ResilienceError> {
        self.batches
            .lock()
            .push(items.iter().map(|e| e.id.clone()).collect());

        let mut outcome = BulkWriteOutcome::default();
        for item in items {
            if item.id == "poison" {
                outcome
                    .failed
                    .push((item.id.clone(), ResilienceError::validation("rejected")));
            } else {
                outcome.succeeded.push(item.id.clone());
            }
        }
        Ok(outcome)
    }
}

fn event(id: &str) -> Event {
    Event { id: id.to_string() }
}

#[tokio::test]
async fn test_batch_buffer_flushes_on_size_and_stop() {
    let mut config = Config::default();
    config.batch.max_size = 3;
    config.batch.max_wait = HumanDuration::from_secs(60);
    let engine = Engine::new(config).await.unwrap();

    let sink = Arc::new(EventSink::default());
    let buffer = engine.batch_buffer("events", sink.clone());

    assert!(buffer.add(event("a")).await.unwrap().is_none());
    assert!(buffer.add(event("poison")).await.unwrap().is_none());
    let report = buffer.add(event("c")).await.unwrap().unwrap();

    assert_eq!(report.attempted, 3);
    assert_eq!(report.succeeded, vec!["a", "c"]);
    assert_eq!(report.failed_ids(), vec!["poison"]);
    assert!(matches!(
        report.ensure_complete(),
        Err(ResilienceError::PartialBatchFailure { total: 3, .. })
    ));

    // the remainder is written when the engine stops
    buffer.add(event("d")).await.unwrap();
    engine.stop().await;

    assert!(buffer.is_empty());
    assert_eq!(
        *sink.batches.lock(),
        vec![vec!["a".to_string(), "poison".into(), "c".into()], vec!["d".into()]]
    );
    assert!(buffer.add(event("e")).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn test_scheduled_task_submits_jobs() {
    let mut config = Config::default();
    config.scheduler.tick = HumanDuration::from_millis(100);
    config.scheduler.tasks.push(ScheduledTaskConfig {
        name: "heartbeat".into(),
        job: "echo".into(),
        payload: json!({ "beat": true }),
        interval: HumanDuration::from_secs(1),
        enabled: true,
        run_on_start: true,
    });
    let engine = Engine::new(config).await.unwrap();
    engine.start();

    tokio::time::sleep(Duration::from_millis(2550)).await;

    let info = engine
        .scheduler()
        .infos()
        .into_iter()
        .find(|task| task.name == "heartbeat")
        .unwrap();
    assert_eq!(info.runs, 3);
    assert_eq!(info.errors, 0);

    let echoed = engine.queue().list(Some(JobStatus::Completed), 10);
    assert_eq!(echoed.len(), 3);
    assert!(echoed.iter().all(|job| job.result == Some(json!({ "beat": true }))));

    engine.stop().await;
}

#[tokio::test]
async fn test_stop_rejects_new_jobs() {
    let engine = Engine::new(Config::default()).await.unwrap();
    engine.start();
    engine.stop().await;

    let err = engine.queue().submit("echo", Value::Null).unwrap_err();
    assert!(matches!(err, ResilienceError::CapacityExceeded(_)));
    assert_eq!(engine.health().status, "stopping");
}
