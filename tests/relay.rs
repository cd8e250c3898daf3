//! Relay chains: stage ordering, data threading, cancellation, retries.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use common::{assert_silent, config, dispatcher, recv};
use relayq::config::QueueConfig;
use relayq::scheduler::{Callbacks, HandlerRegistry, JobEvent, JobSpec, JobStatus, RelayStage};
use relayq::store::MemoryStore;
use serde_json::{json, Value};
use tokio::sync::mpsc;

type Trace = Arc<Mutex<Vec<(String, String, Value)>>>;

/// Registers `name` as a stage that records `(name, queue, data)` and
/// returns `{count: n}` where `n` is the incoming count plus one.
fn counting_stage(handlers: &mut HandlerRegistry, name: &'static str, trace: &Trace) {
    let trace = Arc::clone(trace);
    handlers.register_sync(name, move |ctx| {
        trace
            .lock()
            .expect("lock")
            .push((name.to_string(), ctx.queue().to_string(), ctx.data().clone()));
        let count = ctx.data().get("count").and_then(Value::as_i64).unwrap_or(0);
        Ok(json!({ "count": count + 1 }))
    });
}

fn relay_config() -> relayq::JobConfig {
    config([
        QueueConfig::new("ingest"),
        QueueConfig::new("transform"),
        QueueConfig::new("publish"),
    ])
}

#[tokio::test]
async fn test_relay_threads_data_across_queues() {
    let store = MemoryStore::new();
    let trace: Trace = Arc::default();
    let mut handlers = HandlerRegistry::new();
    counting_stage(&mut handlers, "first", &trace);
    counting_stage(&mut handlers, "second", &trace);
    counting_stage(&mut handlers, "third", &trace);

    let step_hooks = Arc::new(AtomicUsize::new(0));
    let callbacks = Callbacks::new().with_on_relay_step_success({
        let step_hooks = Arc::clone(&step_hooks);
        move |_job, _result| {
            step_hooks.fetch_add(1, Ordering::SeqCst);
        }
    });
    let dispatcher = dispatcher(&relay_config(), &store, handlers, callbacks);
    dispatcher.start().await.expect("start");

    let (step_tx, mut steps) = mpsc::unbounded_channel::<JobEvent>();
    let (done_tx, mut done) = mpsc::unbounded_channel::<JobEvent>();
    let receipt = dispatcher
        .create(
            "ingest",
            JobSpec::relay(vec![
                RelayStage::new("first"),
                RelayStage::new("second").on_queue("transform"),
                RelayStage::new("third").on_queue("publish"),
            ]),
        )
        .expect("create")
        .on_relay_step_success(move |event| {
            let _ = step_tx.send(event);
        })
        .on_success(move |event| {
            let _ = done_tx.send(event);
        })
        .await
        .expect("saved");
    assert!(receipt.notifications_active);

    let first_step = recv(&mut steps).await;
    assert_eq!(first_step.job.data, json!({"count": 1}));
    let second_step = recv(&mut steps).await;
    assert_eq!(second_step.job.data, json!({"count": 2}));

    let finished = recv(&mut done).await;
    assert_eq!(finished.job.status, JobStatus::Succeeded);
    assert_eq!(finished.job.data, json!({"count": 3}));
    assert!(finished.error.is_none());

    let trace = trace.lock().expect("lock").clone();
    assert_eq!(
        trace,
        vec![
            ("first".to_string(), "ingest".to_string(), Value::Null),
            ("second".to_string(), "transform".to_string(), json!({"count": 1})),
            ("third".to_string(), "publish".to_string(), json!({"count": 2})),
        ]
    );
    assert_eq!(step_hooks.load(Ordering::SeqCst), 2);
    assert_silent(&mut steps, Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_relay_stage_inherits_queue() {
    let store = MemoryStore::new();
    let trace: Trace = Arc::default();
    let mut handlers = HandlerRegistry::new();
    counting_stage(&mut handlers, "first", &trace);
    counting_stage(&mut handlers, "second", &trace);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callbacks = Callbacks::new().with_on_job_success(move |job, _| {
        let _ = tx.send(job.queue.clone());
    });
    let dispatcher = dispatcher(&relay_config(), &store, handlers, callbacks);
    dispatcher.start().await.expect("start");

    dispatcher
        .create(
            "transform",
            JobSpec::relay(vec![RelayStage::new("first"), RelayStage::new("second")]),
        )
        .expect("create")
        .await
        .expect("saved");

    assert_eq!(recv(&mut rx).await, "transform");
    let queues: Vec<String> = trace
        .lock()
        .expect("lock")
        .iter()
        .map(|(_, queue, _)| queue.clone())
        .collect();
    assert_eq!(queues, vec!["transform", "transform"]);
}

#[tokio::test]
async fn test_relay_cancel_stops_the_chain() {
    let store = MemoryStore::new();
    let trace: Trace = Arc::default();
    let mut handlers = HandlerRegistry::new();
    handlers.register_sync("gate", |_ctx| Ok(Value::Bool(false)));
    counting_stage(&mut handlers, "never", &trace);

    let cancelled_hooks = Arc::new(AtomicUsize::new(0));
    let callbacks = Callbacks::new().with_on_relay_step_cancelled({
        let cancelled_hooks = Arc::clone(&cancelled_hooks);
        move |job| {
            assert_eq!(job.status, JobStatus::Succeeded);
            cancelled_hooks.fetch_add(1, Ordering::SeqCst);
        }
    });
    let dispatcher = dispatcher(&relay_config(), &store, handlers, callbacks);
    dispatcher.start().await.expect("start");

    let (cancel_tx, mut cancelled) = mpsc::unbounded_channel::<JobEvent>();
    let (other_tx, mut others) = mpsc::unbounded_channel::<JobEvent>();
    let failure_tx = other_tx.clone();
    dispatcher
        .create(
            "ingest",
            JobSpec::relay(vec![
                RelayStage::new("gate"),
                RelayStage::new("never").on_queue("publish"),
            ]),
        )
        .expect("create")
        .on_relay_step_cancelled(move |event| {
            let _ = cancel_tx.send(event);
        })
        .on_success(move |event| {
            let _ = other_tx.send(event);
        })
        .on_failure(move |event| {
            let _ = failure_tx.send(event);
        })
        .await
        .expect("saved");

    let event = recv(&mut cancelled).await;
    assert_eq!(event.job.data, Value::Bool(false));
    assert!(event.error.is_none());

    assert_silent(&mut others, Duration::from_millis(200)).await;
    assert!(trace.lock().expect("lock").is_empty());
    assert_eq!(cancelled_hooks.load(Ordering::SeqCst), 1);

    let publish = dispatcher.queue("publish").expect("queue");
    assert_eq!(publish.status().await.expect("status").waiting, 0);
}

#[tokio::test]
async fn test_failed_stage_retries_before_moving_on() {
    let store = MemoryStore::new();
    let trace: Trace = Arc::default();
    let attempts = Arc::new(AtomicUsize::new(0));
    let mut handlers = HandlerRegistry::new();
    handlers.register_sync("flaky", {
        let attempts = Arc::clone(&attempts);
        move |_ctx| {
            if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                anyhow::bail!("first attempt fails");
            }
            Ok(json!({"count": 10}))
        }
    });
    counting_stage(&mut handlers, "after", &trace);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callbacks = Callbacks::new().with_on_job_success(move |job, result| {
        let _ = tx.send((job.options.retries, result.clone()));
    });
    let dispatcher = dispatcher(&relay_config(), &store, handlers, callbacks);
    dispatcher.start().await.expect("start");

    let (retry_tx, mut retries) = mpsc::unbounded_channel::<JobEvent>();
    dispatcher
        .create(
            "ingest",
            JobSpec::relay(vec![
                RelayStage::new("flaky"),
                RelayStage::new("after").on_queue("transform"),
            ])
            .with_retries(1),
        )
        .expect("create")
        .on_retry(move |event| {
            let _ = retry_tx.send(event);
        })
        .await
        .expect("saved");

    let retry = recv(&mut retries).await;
    assert_eq!(retry.job.status, JobStatus::Retrying);
    assert_eq!(retry.error.map(|e| e.message).as_deref(), Some("first attempt fails"));

    let (retries_left, result) = recv(&mut rx).await;
    assert_eq!(result, json!({"count": 11}));
    assert_eq!(retries_left, 0);
    assert_eq!(attempts.load(Ordering::SeqCst), 2);
    assert_eq!(trace.lock().expect("lock").len(), 1);
}

#[tokio::test]
async fn test_failed_stage_ends_the_relay() {
    let store = MemoryStore::new();
    let trace: Trace = Arc::default();
    let mut handlers = HandlerRegistry::new();
    handlers.register_sync("boom", |_ctx| Err(anyhow::anyhow!("stage exploded")));
    counting_stage(&mut handlers, "after", &trace);

    let (tx, mut rx) = mpsc::unbounded_channel();
    let callbacks = Callbacks::new().with_on_job_failure(move |job, failure| {
        let _ = tx.send((job.status, failure.message.clone()));
    });
    let dispatcher = dispatcher(&relay_config(), &store, handlers, callbacks);
    dispatcher.start().await.expect("start");

    dispatcher
        .create(
            "ingest",
            JobSpec::relay(vec![RelayStage::new("boom"), RelayStage::new("after")]),
        )
        .expect("create")
        .await
        .expect("saved");

    let (status, message) = recv(&mut rx).await;
    assert_eq!(status, JobStatus::Failed);
    assert_eq!(message, "stage exploded");
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(trace.lock().expect("lock").is_empty());
}

#[tokio::test]
async fn test_duplicate_next_stage_fails_the_relay() {
    let store = MemoryStore::new();
    let trace: Trace = Arc::default();
    let mut handlers = HandlerRegistry::new();
    counting_stage(&mut handlers, "first", &trace);
    counting_stage(&mut handlers, "second", &trace);

    let dispatcher = dispatcher(&relay_config(), &store, handlers, Callbacks::new());

    // Occupies the id the second stage will derive. Nothing here runs "held".
    dispatcher
        .create(
            "held",
            JobSpec::single("second").with_data(json!({"count": 1})).with_unique(true),
        )
        .expect("create")
        .await
        .expect("saved");
    dispatcher.start().await.expect("start");

    let (failure_tx, mut failures) = mpsc::unbounded_channel::<JobEvent>();
    let (step_tx, mut steps) = mpsc::unbounded_channel::<JobEvent>();
    dispatcher
        .create(
            "ingest",
            JobSpec::relay(vec![
                RelayStage::new("first"),
                RelayStage::new("second").on_queue("held"),
            ])
            .with_unique(true),
        )
        .expect("create")
        .on_failure(move |event| {
            let _ = failure_tx.send(event);
        })
        .on_relay_step_success(move |event| {
            let _ = step_tx.send(event);
        })
        .await
        .expect("saved");

    let failed = recv(&mut failures).await;
    assert_eq!(failed.job.status, JobStatus::Failed);
    assert!(failed
        .error
        .map(|e| e.message)
        .unwrap_or_default()
        .contains("held"));
    assert_silent(&mut steps, Duration::from_millis(100)).await;

    let ingest = dispatcher.queue("ingest").expect("queue");
    assert_eq!(ingest.status().await.expect("status").active, 0);
    assert_eq!(trace.lock().expect("lock").len(), 1);
}
