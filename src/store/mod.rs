//! Shared key-value store used as the only coordination point between workers.
//!
//! Every cross-worker mutation goes through one of the atomic operations on
//! [`Store`]: the scripted procedures (`enqueue`, `check_stalled`,
//! `remove_job`, the throttle family) or the [`Commit`] batch issued when a
//! job finishes. Workers never lock anything in-process.
//!
//! # Key layout
//!
//! ```text
//! {prefix}:{queue}:jobs        hash   id -> serialized job
//! {prefix}:{queue}:waiting     list   ids waiting to be fetched (LPUSH in, RPOP out)
//! {prefix}:{queue}:active      list   ids fetched by a worker
//! {prefix}:{queue}:stalling    set    ids that must heartbeat before the next stall check
//! {prefix}:{queue}:stallTime   string next stall check timestamp (ms)
//! {prefix}:{queue}:succeeded   set    terminal records (only with recordTerminal)
//! {prefix}:{queue}:failed      set    terminal records (only with recordTerminal)
//! {prefix}:{queue}:throttle    string fixed window counter
//! {prefix}:{queue}:id          string legacy id counter
//! ```
//!
//! In clustered deployments the queue name is wrapped in a hash tag
//! (`{prefix}:{{queue}}:jobs`) so every key of one queue lives on the same slot.

pub mod memory;
pub mod redis_store;
pub mod scripts;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::StoreResult;

pub use self::memory::MemoryStore;
pub use self::redis_store::RedisStore;

/// Builds namespaced keys for queues.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Keyspace {
    prefix: String,
    clustered: bool,
}

impl Keyspace {
    pub fn new(prefix: impl Into<String>, clustered: bool) -> Self {
        Self {
            prefix: prefix.into(),
            clustered,
        }
    }

    /// Returns the key for `suffix` inside `queue`'s namespace.
    pub fn key(&self, queue: &str, suffix: &str) -> String {
        if self.clustered {
            format!("{}:{{{}}}:{}", self.prefix, queue, suffix)
        } else {
            format!("{}:{}:{}", self.prefix, queue, suffix)
        }
    }

    /// Returns every key used by `queue`.
    pub fn queue(&self, queue: &str) -> QueueKeys {
        QueueKeys {
            jobs: self.key(queue, "jobs"),
            waiting: self.key(queue, "waiting"),
            active: self.key(queue, "active"),
            stalling: self.key(queue, "stalling"),
            stall_time: self.key(queue, "stallTime"),
            succeeded: self.key(queue, "succeeded"),
            failed: self.key(queue, "failed"),
            throttle: self.key(queue, "throttle"),
            id: self.key(queue, "id"),
        }
    }
}

/// Fully resolved keys of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    pub jobs: String,
    pub waiting: String,
    pub active: String,
    pub stalling: String,
    pub stall_time: String,
    pub succeeded: String,
    pub failed: String,
    pub throttle: String,
    pub id: String,
}

impl QueueKeys {
    /// All keys, in the order used by `destroy`.
    pub fn all(&self) -> Vec<&str> {
        vec![
            &self.id,
            &self.jobs,
            &self.stall_time,
            &self.stalling,
            &self.waiting,
            &self.active,
            &self.succeeded,
            &self.failed,
            &self.throttle,
        ]
    }
}

/// Reply of the throttle procedures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleStatus {
    /// Whether the current window is exhausted.
    pub blocked: bool,
    /// How many more increments fit in the window.
    pub remaining: i64,
    /// Time until the window resets, in seconds (`throttle`) or ms (`pthrottle`).
    pub ttl: i64,
}

impl ThrottleStatus {
    pub(crate) fn from_reply(reply: &[i64]) -> StoreResult<Self> {
        match reply {
            [blocked, remaining, ttl] => Ok(Self {
                blocked: *blocked == 1,
                remaining: *remaining,
                ttl: *ttl,
            }),
            other => Err(crate::error::StoreError::UnexpectedReply(format!(
                "throttle returned {:?}",
                other
            ))),
        }
    }
}

/// What happens to a finished job's entry in the `jobs` hash.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommitAction {
    /// Terminal outcome, drop the entry.
    Remove,
    /// Retry: store the updated job and push the id back onto `waiting`.
    Requeue { payload: String },
    /// Terminal outcome kept for review in `succeeded` or `failed`.
    Record { payload: String, succeeded: bool },
}

/// Atomic batch applied when a job finishes.
///
/// The id is always removed from `active` and `stalling`; `action` decides
/// what else happens. Implementations must apply all of it as one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Commit {
    pub id: String,
    pub action: CommitAction,
}

/// Counts of each structure of a queue.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStatus {
    pub waiting: usize,
    pub active: usize,
    pub stalling: usize,
    pub succeeded: usize,
    pub failed: usize,
}

/// A message received on a subscribed channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: String,
}

/// Live subscription to one or more channels.
///
/// Dropping it ends the subscription.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::UnboundedReceiver<PubSubMessage>,
}

impl Subscription {
    pub(crate) fn new(rx: mpsc::UnboundedReceiver<PubSubMessage>) -> Self {
        Self { rx }
    }

    /// Waits for the next message; `None` once the subscription has closed.
    pub async fn next(&mut self) -> Option<PubSubMessage> {
        self.rx.recv().await
    }
}

/// Dedicated connection used for blocking fetches.
///
/// A blocking pop holds its connection until a job arrives, so every fetch
/// slot owns one.
#[async_trait]
pub trait Fetcher: Send {
    /// Atomically moves the oldest id from `waiting` to `active` and returns
    /// it, waiting as long as necessary.
    async fn fetch(&mut self, keys: &QueueKeys) -> StoreResult<String>;
}

/// Operations the queue engine needs from the shared store.
#[async_trait]
pub trait Store: Send + Sync {
    /// Stores a serialized job and pushes its id onto `waiting`.
    ///
    /// With `unique`, the write only happens when the id is absent. Returns
    /// `None` when the id already existed. An empty `explicit_id` falls back
    /// to the queue's id counter.
    async fn enqueue(
        &self,
        keys: &QueueKeys,
        payload: &str,
        unique: bool,
        explicit_id: Option<&str>,
    ) -> StoreResult<Option<String>>;

    /// Moves every id still in `stalling` from `active` back to `waiting`,
    /// then re-arms `stalling` with the current `active` ids. A no-op until
    /// `now_ms` reaches the stored stall time.
    async fn check_stalled(
        &self,
        keys: &QueueKeys,
        now_ms: i64,
        interval_ms: u64,
    ) -> StoreResult<Vec<String>>;

    /// Idempotently removes `id` from every structure of the queue.
    async fn remove_job(&self, keys: &QueueKeys, id: &str) -> StoreResult<()>;

    /// Fixed window counter with a window of `seconds`.
    async fn throttle(&self, key: &str, limit: i64, seconds: i64) -> StoreResult<ThrottleStatus>;

    /// Fixed window counter with a window of `millis`.
    async fn pthrottle(&self, key: &str, limit: i64, millis: i64) -> StoreResult<ThrottleStatus>;

    /// Takes one slot if fewer than `limit` are taken. Returns `true` when
    /// the caller must wait.
    async fn throttle_no_incr(&self, key: &str, limit: i64, seconds: i64) -> StoreResult<bool>;

    /// Releases a slot taken by `throttle_no_incr`.
    async fn throttle_decr(&self, key: &str) -> StoreResult<()>;

    /// Opens a dedicated blocking connection.
    async fn open_fetcher(&self) -> StoreResult<Box<dyn Fetcher>>;

    /// Loads the serialized job stored under `id`.
    async fn get_job(&self, keys: &QueueKeys, id: &str) -> StoreResult<Option<String>>;

    /// Removes `id` from `stalling`, marking it alive for this stall window.
    async fn heartbeat(&self, keys: &QueueKeys, id: &str) -> StoreResult<()>;

    /// Applies a finished job's bookkeeping atomically.
    async fn commit(&self, keys: &QueueKeys, commit: &Commit) -> StoreResult<()>;

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()>;

    /// Subscribes to `channels`. Returns once the subscription is confirmed,
    /// so messages published afterwards are never missed.
    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription>;

    async fn queue_status(&self, keys: &QueueKeys) -> StoreResult<QueueStatus>;

    /// Deletes every key of the queue.
    async fn destroy(&self, keys: &QueueKeys) -> StoreResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keyspace = Keyspace::new("job", false);
        assert_eq!(keyspace.key("queue1", "foo"), "job:queue1:foo");

        let keys = keyspace.queue("emails");
        assert_eq!(keys.jobs, "job:emails:jobs");
        assert_eq!(keys.stall_time, "job:emails:stallTime");
        assert_eq!(keys.all().len(), 9);
    }

    #[test]
    fn test_clustered_key_layout_uses_hash_tag() {
        let keyspace = Keyspace::new("job", true);
        assert_eq!(keyspace.key("emails", "waiting"), "job:{emails}:waiting");
    }

    #[test]
    fn test_throttle_status_from_reply() {
        let status = ThrottleStatus::from_reply(&[1, 0, 7]).expect("valid reply");
        assert!(status.blocked);
        assert_eq!(status.remaining, 0);
        assert_eq!(status.ttl, 7);

        assert!(ThrottleStatus::from_reply(&[1, 2]).is_err());
    }
}
