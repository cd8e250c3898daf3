//! Shared helpers for engine tests running against `MemoryStore`.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use relayq::config::{JobConfig, QueueConfig};
use relayq::scheduler::{Callbacks, Dispatcher, HandlerRegistry};
use relayq::store::MemoryStore;
use tokio::sync::mpsc;
use tokio::time::Instant;

pub const STALL_INTERVAL_MS: u64 = 200;

const WAIT: Duration = Duration::from_secs(5);

/// Config with no startup delay and a short stall interval.
pub fn config(queues: impl IntoIterator<Item = QueueConfig>) -> JobConfig {
    let mut config = JobConfig::default();
    config.startup_delay = 0;
    config.stall_interval = STALL_INTERVAL_MS;
    for queue in queues {
        config = config.with_queue(queue);
    }
    config
}

pub fn dispatcher(
    config: &JobConfig,
    store: &MemoryStore,
    handlers: HandlerRegistry,
    callbacks: Callbacks,
) -> Dispatcher {
    Dispatcher::new(config, Arc::new(store.clone()), handlers, callbacks).expect("valid config")
}

/// Receives the next value or panics after a few seconds.
pub async fn recv<T>(rx: &mut mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("channel closed")
}

/// Asserts that nothing arrives within `window`.
pub async fn assert_silent<T: std::fmt::Debug>(rx: &mut mpsc::UnboundedReceiver<T>, window: Duration) {
    if let Ok(Some(value)) = tokio::time::timeout(window, rx.recv()).await {
        panic!("unexpected message: {:?}", value);
    }
}

/// Polls `check` until it holds or panics after a few seconds.
pub async fn eventually(mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !check() {
        assert!(Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
