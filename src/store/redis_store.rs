//! Redis-backed store.
//!
//! Ordinary commands share one [`ConnectionManager`] (which reconnects on its
//! own). Blocking fetches and subscriptions each get a dedicated connection,
//! since both hold their connection for as long as they wait.

use async_trait::async_trait;
use futures::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Value};
use tokio::sync::mpsc;
use tracing::debug;

use super::scripts::scripts;
use super::{
    Commit, CommitAction, Fetcher, PubSubMessage, QueueKeys, QueueStatus, Store, Subscription,
    ThrottleStatus,
};
use crate::error::{StoreError, StoreResult};

/// Store backed by a Redis server (or cluster proxy).
#[derive(Clone)]
pub struct RedisStore {
    client: redis::Client,
    conn: ConnectionManager,
    subscriber: bool,
}

impl std::fmt::Debug for RedisStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisStore")
            .field("subscriber", &self.subscriber)
            .finish_non_exhaustive()
    }
}

impl RedisStore {
    /// Connects to Redis.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    pub async fn connect(redis_url: &str) -> StoreResult<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = ConnectionManager::new(client.clone()).await?;
        Ok(Self::from_connection(client, conn))
    }

    /// Creates a store from an existing client and connection manager.
    ///
    /// Useful when sharing a connection pool across multiple components.
    pub fn from_connection(client: redis::Client, conn: ConnectionManager) -> Self {
        Self {
            client,
            conn,
            subscriber: true,
        }
    }

    /// Enables or disables subscriptions. With subscriptions disabled,
    /// [`Store::subscribe`] fails with [`StoreError::SubscriberDisabled`].
    pub fn with_subscriber(mut self, enabled: bool) -> Self {
        self.subscriber = enabled;
        self
    }
}

/// Blocking fetch connection.
pub struct RedisFetcher {
    conn: redis::aio::Connection,
}

#[async_trait]
impl Fetcher for RedisFetcher {
    async fn fetch(&mut self, keys: &QueueKeys) -> StoreResult<String> {
        loop {
            // Timeout 0 blocks until an id is available.
            let id: Option<String> = redis::cmd("BRPOPLPUSH")
                .arg(&keys.waiting)
                .arg(&keys.active)
                .arg(0)
                .query_async(&mut self.conn)
                .await?;

            if let Some(id) = id {
                return Ok(id);
            }
        }
    }
}

fn value_to_string(value: &Value) -> Option<String> {
    match value {
        Value::Data(bytes) => Some(String::from_utf8_lossy(bytes).into_owned()),
        Value::Status(s) => Some(s.clone()),
        Value::Int(n) => Some(n.to_string()),
        _ => None,
    }
}

#[async_trait]
impl Store for RedisStore {
    async fn enqueue(
        &self,
        keys: &QueueKeys,
        payload: &str,
        unique: bool,
        explicit_id: Option<&str>,
    ) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let mut invocation = scripts().enqueue.prepare_invoke();
        invocation
            .key(&keys.jobs)
            .key(&keys.waiting)
            .key(&keys.id)
            .arg(payload)
            .arg(if unique { "true" } else { "false" })
            .arg(explicit_id.unwrap_or(""));

        let reply: Value = invocation.invoke_async(&mut conn).await?;
        match reply {
            Value::Int(0) => Ok(None),
            other => value_to_string(&other).map(Some).ok_or_else(|| {
                StoreError::UnexpectedReply(format!("enqueue returned {:?}", other))
            }),
        }
    }

    async fn check_stalled(
        &self,
        keys: &QueueKeys,
        now_ms: i64,
        interval_ms: u64,
    ) -> StoreResult<Vec<String>> {
        let mut conn = self.conn.clone();
        let mut invocation = scripts().check_stalled.prepare_invoke();
        invocation
            .key(&keys.stall_time)
            .key(&keys.stalling)
            .key(&keys.waiting)
            .key(&keys.active)
            .arg(now_ms)
            .arg(interval_ms);

        let reply: Value = invocation.invoke_async(&mut conn).await?;
        match reply {
            // Checked too early, nothing happened.
            Value::Int(_) => Ok(Vec::new()),
            bulk @ Value::Bulk(_) => Ok(redis::from_redis_value(&bulk)?),
            other => Err(StoreError::UnexpectedReply(format!(
                "check_stalled returned {:?}",
                other
            ))),
        }
    }

    async fn remove_job(&self, keys: &QueueKeys, id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut invocation = scripts().remove_job.prepare_invoke();
        invocation
            .key(&keys.succeeded)
            .key(&keys.failed)
            .key(&keys.waiting)
            .key(&keys.active)
            .key(&keys.stalling)
            .key(&keys.jobs)
            .arg(id);

        let _: Value = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn throttle(&self, key: &str, limit: i64, seconds: i64) -> StoreResult<ThrottleStatus> {
        let mut conn = self.conn.clone();
        let mut invocation = scripts().throttle.prepare_invoke();
        invocation.key(key).arg(limit).arg(seconds);

        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        ThrottleStatus::from_reply(&reply)
    }

    async fn pthrottle(&self, key: &str, limit: i64, millis: i64) -> StoreResult<ThrottleStatus> {
        let mut conn = self.conn.clone();
        let mut invocation = scripts().pthrottle.prepare_invoke();
        invocation.key(key).arg(limit).arg(millis);

        let reply: Vec<i64> = invocation.invoke_async(&mut conn).await?;
        ThrottleStatus::from_reply(&reply)
    }

    async fn throttle_no_incr(&self, key: &str, limit: i64, seconds: i64) -> StoreResult<bool> {
        let mut conn = self.conn.clone();
        let mut invocation = scripts().throttle_no_incr.prepare_invoke();
        invocation.key(key).arg(limit).arg(seconds);

        let reply: i64 = invocation.invoke_async(&mut conn).await?;
        Ok(reply == 1)
    }

    async fn throttle_decr(&self, key: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let mut invocation = scripts().throttle_decr.prepare_invoke();
        invocation.key(key);

        let _: Value = invocation.invoke_async(&mut conn).await?;
        Ok(())
    }

    async fn open_fetcher(&self) -> StoreResult<Box<dyn Fetcher>> {
        let conn = self.client.get_async_connection().await?;
        Ok(Box::new(RedisFetcher { conn }))
    }

    async fn get_job(&self, keys: &QueueKeys, id: &str) -> StoreResult<Option<String>> {
        let mut conn = self.conn.clone();
        let payload: Option<String> = conn.hget(&keys.jobs, id).await?;
        Ok(payload)
    }

    async fn heartbeat(&self, keys: &QueueKeys, id: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.srem::<_, _, ()>(&keys.stalling, id).await?;
        Ok(())
    }

    async fn commit(&self, keys: &QueueKeys, commit: &Commit) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        let id = commit.id.as_str();

        let mut pipe = redis::pipe();
        pipe.atomic()
            .lrem(&keys.active, 0, id)
            .ignore()
            .srem(&keys.stalling, id)
            .ignore();

        match &commit.action {
            CommitAction::Remove => {
                pipe.hdel(&keys.jobs, id).ignore();
            }
            CommitAction::Requeue { payload } => {
                pipe.hset(&keys.jobs, id, payload)
                    .ignore()
                    .lpush(&keys.waiting, id)
                    .ignore();
            }
            CommitAction::Record { payload, succeeded } => {
                let set = if *succeeded {
                    &keys.succeeded
                } else {
                    &keys.failed
                };
                pipe.hset(&keys.jobs, id, payload)
                    .ignore()
                    .sadd(set, id)
                    .ignore();
            }
        }

        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: &str) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.publish::<_, _, ()>(channel, payload).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[String]) -> StoreResult<Subscription> {
        if !self.subscriber {
            return Err(StoreError::SubscriberDisabled);
        }

        let mut pubsub = self.client.get_async_connection().await?.into_pubsub();
        for channel in channels {
            pubsub.subscribe(channel).await?;
        }
        debug!(channels = ?channels, "Subscribed to job channels");

        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            let mut messages = Box::pin(pubsub.into_on_message());
            loop {
                tokio::select! {
                    message = messages.next() => {
                        let Some(message) = message else { break };
                        let payload: String = match message.get_payload() {
                            Ok(p) => p,
                            Err(_) => continue,
                        };
                        let forwarded = PubSubMessage {
                            channel: message.get_channel_name().to_string(),
                            payload,
                        };
                        if tx.send(forwarded).is_err() {
                            break;
                        }
                    }
                    _ = tx.closed() => break,
                }
            }
        });

        Ok(Subscription::new(rx))
    }

    async fn queue_status(&self, keys: &QueueKeys) -> StoreResult<QueueStatus> {
        let mut conn = self.conn.clone();
        let (waiting, active, stalling, succeeded, failed): (usize, usize, usize, usize, usize) =
            redis::pipe()
                .llen(&keys.waiting)
                .llen(&keys.active)
                .scard(&keys.stalling)
                .scard(&keys.succeeded)
                .scard(&keys.failed)
                .query_async(&mut conn)
                .await?;

        Ok(QueueStatus {
            waiting,
            active,
            stalling,
            succeeded,
            failed,
        })
    }

    async fn destroy(&self, keys: &QueueKeys) -> StoreResult<()> {
        let mut conn = self.conn.clone();
        conn.del::<_, ()>(keys.all()).await?;
        Ok(())
    }
}
