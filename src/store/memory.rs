//! In-process store with the same semantics as the Redis procedures.
//!
//! Every operation runs under a single mutex, which gives the same
//! all-or-nothing visibility the Lua scripts and `MULTI` batches give on
//! Redis. Blocking fetches park on a [`Notify`] that is woken whenever a
//! list receives ids. Expiring counters use [`tokio::time::Instant`] so
//! tests can drive them with a paused clock.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, mpsc, Notify};
use tokio::time::Instant;

use super::{
    Commit, CommitAction, Fetcher, PubSubMessage, QueueKeys, QueueStatus, Store, Subscription,
    ThrottleStatus,
};
use crate::error::{StoreError, StoreResult};

const EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy)]
struct Counter {
    value: i64,
    expires_at: Option<Instant>,
}

#[derive(Debug, Default)]
struct State {
    hashes: HashMap<String, HashMap<String, String>>,
    lists: HashMap<String, VecDeque<String>>,
    sets: HashMap<String, HashSet<String>>,
    counters: HashMap<String, Counter>,
}

impl State {
    fn list(&mut self, key: &str) -> &mut VecDeque<String> {
        self.lists.entry(key.to_string()).or_default()
    }

    fn set(&mut self, key: &str) -> &mut HashSet<String> {
        self.sets.entry(key.to_string()).or_default()
    }

    fn hash(&mut self, key: &str) -> &mut HashMap<String, String> {
        self.hashes.entry(key.to_string()).or_default()
    }

    fn lrem(&mut self, key: &str, value: &str) {
        if let Some(list) = self.lists.get_mut(key) {
            list.retain(|v| v != value);
        }
    }

    fn is_member(&self, key: &str, value: &str) -> bool {
        self.sets.get(key).is_some_and(|s| s.contains(value))
    }

    /// Returns the live counter under `key`, dropping it when expired.
    fn counter(&mut self, key: &str) -> Option<&mut Counter> {
        let now = Instant::now();
        if self
            .counters
            .get(key)
            .and_then(|c| c.expires_at)
            .is_some_and(|at| at <= now)
        {
            self.counters.remove(key);
        }
        self.counters.get_mut(key)
    }

    fn incr(&mut self, key: &str) -> i64 {
        match self.counter(key) {
            Some(counter) => {
                counter.value += 1;
                counter.value
            }
            None => {
                self.counters.insert(
                    key.to_string(),
                    Counter {
                        value: 1,
                        expires_at: None,
                    },
                );
                1
            }
        }
    }

    /// Remaining lifetime in ms, -1 without expiry, -2 when missing.
    fn pttl(&mut self, key: &str) -> i64 {
        match self.counter(key) {
            None => -2,
            Some(Counter {
                expires_at: None, ..
            }) => -1,
            Some(Counter {
                expires_at: Some(at),
                ..
            }) => at.saturating_duration_since(Instant::now()).as_millis() as i64,
        }
    }

    fn ttl(&mut self, key: &str) -> i64 {
        match self.pttl(key) {
            ms if ms < 0 => ms,
            ms => (ms + 500) / 1000,
        }
    }

    fn expire(&mut self, key: &str, after: Duration) {
        if let Some(counter) = self.counter(key) {
            counter.expires_at = Some(Instant::now() + after);
        }
    }

    fn throttle(&mut self, key: &str, limit: i64, window: Duration, pttl: bool) -> ThrottleStatus {
        let count = self.incr(key);
        let mut ttl = if pttl { self.pttl(key) } else { self.ttl(key) };
        let remaining = limit - count;

        if count == 1 || ttl == -1 {
            self.expire(key, window);
        }

        if ttl == -1 {
            ttl = if pttl {
                window.as_millis() as i64
            } else {
                window.as_secs() as i64
            };
        }

        if count > limit || remaining == 0 {
            return ThrottleStatus {
                blocked: true,
                remaining: 0,
                ttl,
            };
        }

        ThrottleStatus {
            blocked: false,
            remaining,
            ttl,
        }
    }
}

struct Inner {
    state: Mutex<State>,
    pushed: Notify,
    events: broadcast::Sender<PubSubMessage>,
    subscriber: bool,
}

impl Inner {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Store kept entirely in process memory.
///
/// Cloning is cheap and clones share state, so several dispatchers built on
/// clones of one `MemoryStore` behave like workers sharing one Redis.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for MemoryStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryStore")
            .field("subscriber", &self.inner.subscriber)
            .finish_non_exhaustive()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::build(true)
    }

    /// A store that refuses subscriptions, like a Redis store configured
    /// with `subscriber = false`.
    pub fn without_subscriber() -> Self {
        Self::build(false)
    }

    fn build(subscriber: bool) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State::default()),
                pushed: Notify::new(),
                events,
                subscriber,
            }),
        }
    }

    /// Number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.inner.events.receiver_count()
    }

    /// Snapshot of a list, head first.
    pub fn list(&self, key: &str) -> Vec<String> {
        self.inner
            .lock()
            .lists
            .get(key)
            .map(|l| l.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of a set, sorted.
    pub fn members(&self, key: &str) -> Vec<String> {
        let mut members: Vec<String> = self
            .inner
            .lock()
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default();
        members.sort();
        members
    }

    /// Reads one field of a hash.
    pub fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        self.inner
            .lock()
            .hashes
            .get(key)
            .and_then(|h| h.get(field).cloned())
    }
}

/// Blocking fetch handle on a [`MemoryStore`].
pub struct MemoryFetcher {
    inner: Arc<Inner>,
}

#[async_trait]
impl Fetcher for MemoryFetcher {
    async fn fetch(&mut self, keys: &QueueKeys) -> StoreResult<String> {
        loop {
            let notified = self.inner.pushed.notified();
            tokio::pin!(notified);
            // Register before looking so a push between the check and the
            // await still wakes us.
            notified.as_mut().enable();

            {
                let mut state = self.inner.lock();
                if let Some(id) = state.list(&keys.waiting).pop_back() {
                    state.list(&keys.active).push_front(id.clone());
                    return Ok(id);
                }
            }

            notified.await;
        }
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn enqueue(
        &self,
        keys: &QueueKeys,
        payload: &str,
        unique: bool,
        explicit_id: Option<&str>,
    ) -> StoreResult<Option<String>> {
        let id = {
            let mut state = self.inner.lock();
            let id = match explicit_id.filter(|id| !id.is_empty()) {
                Some(id) => id.to_string(),
                None => state.incr(&keys.id).to_string(),
            };

            let jobs = state.hash(&keys.jobs);
            if unique && jobs.contains_key(&id) {
                return Ok(None);
            }
            jobs.insert(id.clone(), payload.to_string());
            state.list(&keys.waiting).push_front(id.clone());
            id
        };

        self.inner.pushed.notify_waiters();
        Ok(Some(id))
    }

    async fn check_stalled(
        &self,
        keys: &QueueKeys,
        now_ms: i64,
        interval_ms: u64,
    ) -> StoreResult<Vec<String>> {
        let stalled = {
            let mut state = self.inner.lock();
            let stall_time = state.counter(&keys.stall_time).map_or(0, |c| c.value);
            if now_ms < stall_time {
                return Ok(Vec::new());
            }

            let mut stalled: Vec<String> = state
                .sets
                .remove(&keys.stalling)
                .map(|s| s.into_iter().collect())
                .unwrap_or_default();
            stalled.sort();

            for id in &stalled {
                state.list(&keys.waiting).push_back(id.clone());
                state.lrem(&keys.active, id);
            }

            let actives: Vec<String> = state.list(&keys.active).iter().cloned().collect();
            state.set(&keys.stalling).extend(actives);

            state.counters.insert(
                keys.stall_time.clone(),
                Counter {
                    value: now_ms + interval_ms as i64,
                    expires_at: None,
                },
            );
            stalled
        };

        if !stalled.is_empty() {
            self.inner.pushed.notify_waiters();
        }
        Ok(stalled)
    }

    async fn remove_job(&self, keys: &QueueKeys, id: &str) -> StoreResult<()> {
        let mut state = self.inner.lock();
        if !state.is_member(&keys.succeeded, id) && !state.is_member(&keys.failed, id) {
            state.lrem(&keys.waiting, id);
            state.lrem(&keys.active, id);
        }
        state.set(&keys.succeeded).remove(id);
        state.set(&keys.failed).remove(id);
        state.set(&keys.stalling).remove(id);
        state.hash(&keys.jobs).remove(id);
        Ok(())
    }

    async fn throttle(&self, key: &str, limit: i64, seconds: i64) -> StoreResult<ThrottleStatus> {
        let window = Duration::from_secs(seconds.max(0) as u64);
        Ok(self.inner.lock().throttle(key, limit, window, false))
    }

    async fn pthrottle(&self, key: &str, limit: i64, millis: i64) -> StoreResult<ThrottleStatus> {
        let window = Duration::from_millis(millis.max(0) as u64);
        Ok(self.inner.lock().throttle(key, limit, window, true))
    }

    async fn throttle_no_incr(&self, key: &str, limit: i64, seconds: i64) -> StoreResult<bool> {
        let mut state = self.inner.lock();
        if let Some(counter) = state.counter(key) {
            if counter.value >= limit {
                return Ok(true);
            }
            counter.value += 1;
            return Ok(false);
        }

        state.counters.insert(
            key.to_string(),
            Counter {
                value: 1,
                expires_at: Some(Instant::now() + Duration::from_secs(seconds.max(0) as u64)),
            },
        );
        Ok(false)
    }

    async fn throttle_decr(&self, key: &str) -> StoreResult<()> {
        if let Some(counter) = self.inner.lock().counter(key) {
            counter.value -= 1;
        }
        Ok(())
    }

    async fn open_fetcher(&self) -> StoreResult<Box<dyn Fetcher>> {
        Ok(Box::new(MemoryFetcher {
            inner: Arc::clone(&self.inner),
        }))
    }

    async fn get_job(&self, keys: &QueueKeys, id: &str) -> StoreResult<Option<String>> {
        Ok(self.hash_field(&keys.jobs, id))
    }

    async fn heartbeat(&self, keys: &QueueKeys, id: &str) -> StoreResult<()> {
        self.inner.lock().set(&keys.stalling).remove(id);
        Ok(())
    }

    async fn commit(&self, keys: &QueueKeys, commit: &Commit) -> StoreResult<()> {
        let requeued = {
            let mut state = self.inner.lock();
            let id = commit.id.as_str();
            state.lrem(&keys.active, id);
            state.set(&keys.stalling).remove(id);

            match &commit.action {
                CommitAction::Remove => {
                    state.hash(&keys.jobs).remove(id);
                    false
                }
                CommitAction::Requeue { payload } => {
                    state.hash(&keys.jobs).insert(id.to_string(), payload.clone());
                    state.list(&keys.waiting).push_front(id.to_string());
                    true
                }
                CommitAction::Record { payload, succeeded } => {
                    state.hash(&keys.jobs).insert(id.to_string(), payload.clone());
                    let set = if *succeeded {
                        &keys.succeeded
                    } else {
                        &keys.failed
                    };
                    state.set(set).insert(id.to_string());
                    false
                }
            }
        };

        if requeued {
            self.inner.pushed.notify_waiters();
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        // No receivers is not an error, same as PUBLISH returning 0.
        let _ = self.inner.events.send(PubSubMessage {
            channel: channel.to_string(),
            payload: payload.to_string(),
        });
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription> {
        if !self.inner.subscriber {
            return Err(StoreError::SubscriberDisabled);
        }

        let wanted: HashSet<String> = channels.iter().cloned().collect();
        let mut events = self.inner.events.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = events.recv() => match event {
                        Ok(message) => {
                            if wanted.contains(&message.channel) && tx.send(message).is_err() {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(_)) => continue,
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    async fn queue_status(&self, keys: &QueueKeys) -> StoreResult<QueueStatus> {
        let state = self.inner.lock();
        let list_len = |key: &str| state.lists.get(key).map_or(0, |l| l.len());
        let set_len = |key: &str| state.sets.get(key).map_or(0, |s| s.len());

        Ok(QueueStatus {
            waiting: list_len(&keys.waiting),
            active: list_len(&keys.active),
            stalling: set_len(&keys.stalling),
            succeeded: set_len(&keys.succeeded),
            failed: set_len(&keys.failed),
        })
    }

    async fn destroy(&self, keys: &QueueKeys) -> StoreResult<()> {
        let mut state = self.inner.lock();
        for key in keys.all() {
            state.hashes.remove(key);
            state.lists.remove(key);
            state.sets.remove(key);
            state.counters.remove(key);
        }
        Ok(())
    }
}
