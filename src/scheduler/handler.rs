//! Job handlers and the registry they are resolved from.
//!
//! Handlers are registered by name at startup. A job names its handler in
//! `runs` (or the first pending relay stage); jobs without one use their
//! queue's configured handler. Lookup failure is a typed
//! [`JobError::HandlerNotFound`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::warn;

use super::events::JobEvent;
use super::job::{EventKind, Job, JobStatus};
use crate::error::JobError;
use crate::store::Store;

/// A unit of work executed for a job.
///
/// The returned value becomes the job's result; for relay jobs it is the
/// next stage's `data`. Returning `Value::Bool(false)` from a relay stage
/// cancels the rest of the relay.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<Value>;
}

/// Adapts an async closure.
struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> JobHandler for FnHandler<F>
where
    F: Fn(JobContext) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
{
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<Value> {
        (self.0)(ctx).await
    }
}

/// Adapts a synchronous closure.
struct SyncHandler<F>(F);

#[async_trait]
impl<F> JobHandler for SyncHandler<F>
where
    F: Fn(JobContext) -> anyhow::Result<Value> + Send + Sync,
{
    async fn handle(&self, ctx: JobContext) -> anyhow::Result<Value> {
        (self.0)(ctx)
    }
}

/// Explicit table of named handlers.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<&str> = self.names().collect();
        names.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handlers", &names)
            .finish()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler, replacing any previous one with the same name.
    pub fn register(&mut self, name: impl Into<String>, handler: impl JobHandler + 'static) {
        let name = name.into();
        if self.handlers.insert(name.clone(), Arc::new(handler)).is_some() {
            warn!(handler = %name, "Replacing registered job handler");
        }
    }

    /// Registers an async closure.
    ///
    /// # Example
    ///
    /// ```ignore
    /// registry.register_fn("email.send", |ctx: JobContext| async move {
    ///     send(ctx.data()).await?;
    ///     Ok(json!({ "sent": true }))
    /// });
    /// ```
    pub fn register_fn<F, Fut>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.register(name, FnHandler(f));
    }

    /// Registers a synchronous closure.
    pub fn register_sync<F>(&mut self, name: impl Into<String>, f: F)
    where
        F: Fn(JobContext) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.register(name, SyncHandler(f));
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(name).cloned()
    }

    /// Resolves `name` or fails with `HandlerNotFound`.
    pub fn resolve(&self, name: Option<&str>) -> Result<Arc<dyn JobHandler>, JobError> {
        let name = name.ok_or_else(|| JobError::HandlerNotFound("No job handler specified".into()))?;
        self.get(name)
            .ok_or_else(|| JobError::HandlerNotFound(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// What a handler sees of the job it runs.
///
/// Cheap to clone; progress updates made through any clone are visible to
/// the queue when the run settles.
#[derive(Clone)]
pub struct JobContext {
    inner: Arc<ContextInner>,
}

struct ContextInner {
    job: Job,
    worker: String,
    bound: bool,
    progress: AtomicU64,
    retry: AtomicBool,
    store: Arc<dyn Store>,
}

impl std::fmt::Debug for JobContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobContext")
            .field("id", &self.id())
            .field("queue", &self.queue())
            .field("progress", &self.progress())
            .finish_non_exhaustive()
    }
}

impl JobContext {
    pub(crate) fn new(job: &Job, worker: &str, bound: bool, store: Arc<dyn Store>) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                progress: AtomicU64::new(job.progress.to_bits()),
                job: job.clone(),
                worker: worker.to_string(),
                bound,
                retry: AtomicBool::new(false),
                store,
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.job.id_str()
    }

    pub fn queue(&self) -> &str {
        &self.inner.job.queue
    }

    pub fn data(&self) -> &Value {
        &self.inner.job.data
    }

    /// Retries left after this attempt fails.
    pub fn retries_left(&self) -> u32 {
        self.inner.job.options.retries
    }

    /// The job as fetched, before this run.
    pub fn job(&self) -> &Job {
        &self.inner.job
    }

    /// False when the job or its queue set `noBind`.
    pub fn is_bound(&self) -> bool {
        self.inner.bound
    }

    /// Asks for this run to be treated as failed and requeued.
    ///
    /// Takes effect when the handler then returns `Ok`; its value is
    /// discarded. The job is requeued even with no retries left, in which
    /// case one is granted and consumed by this requeue. A handler error
    /// after `retry()` is handled as any other failure.
    pub fn retry(&self) {
        self.inner.retry.store(true, Ordering::SeqCst);
    }

    pub fn retry_requested(&self) -> bool {
        self.inner.retry.load(Ordering::SeqCst)
    }

    pub fn progress(&self) -> f64 {
        f64::from_bits(self.inner.progress.load(Ordering::SeqCst))
    }

    /// Records progress and publishes it when the job asked for progress
    /// events. `data` is sent along in the event.
    ///
    /// # Errors
    ///
    /// Returns `JobError::InvalidProgress` for NaN or infinite values; the
    /// stored progress is left unchanged.
    pub async fn set_progress(&self, value: f64, data: Option<Value>) -> Result<(), JobError> {
        if !value.is_finite() {
            return Err(JobError::InvalidProgress(self.id().to_string()));
        }
        self.inner.progress.store(value.to_bits(), Ordering::SeqCst);

        if let Some(channel) = self.inner.job.options.channel(EventKind::Progress) {
            let mut snapshot = self.inner.job.clone();
            snapshot.progress = value;
            snapshot.status = JobStatus::Saved;
            let event = JobEvent::new(&snapshot, &self.inner.worker, data.unwrap_or(Value::Null), None);
            let payload = serde_json::to_string(&event).map_err(crate::error::StoreError::from)?;
            self.inner.store.publish(channel, &payload).await?;
        }
        Ok(())
    }
}
