//! Dispatcher: owns the configured queues and creates jobs.
//!
//! Jobs come out of [`Dispatcher::create`] as a [`JobBuilder`]. A builder is
//! either submitted directly (`.submit().await` or just `.await`) or handed
//! to the auto-save buffer with [`JobBuilder::defer`]. Deferred jobs created
//! in the same burst are persisted together once the creating task yields,
//! at most `autoSave.concurrency` saves in flight. A buffer holding
//! `autoSave.maxJobs` jobs is flushed at once.

use std::future::{Future, IntoFuture};
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::task::{Context, Poll};
use std::time::Duration;

use futures::future::BoxFuture;
use futures::StreamExt;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::events::{Callbacks, EventCallback, JobCallbacks, JobEvent};
use super::handler::HandlerRegistry;
use super::job::{EventKind, Job, JobSpec, JobWriter, NotifyFlag, SaveReceipt};
use super::queue::{Queue, QueueStats};
use crate::config::{JobConfig, Settings};
use crate::error::{ConfigError, JobError, QueueError};
use crate::store::Store;

type SaveResult = Result<SaveReceipt, JobError>;

/// A deferred job waiting in the auto-save buffer.
struct PendingSave {
    job: Job,
    callbacks: JobCallbacks,
    reply: oneshot::Sender<SaveResult>,
}

#[derive(Default)]
struct AutoSaveBuffer {
    pending: Vec<PendingSave>,
    /// A deferred flush has been spawned and has not run yet.
    scheduled: bool,
}

/// Owns the configured queues of one process.
///
/// Cheap to clone; clones share queues and the auto-save buffer.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    settings: Settings,
    store: Arc<dyn Store>,
    callbacks: Arc<Callbacks>,
    writer: JobWriter,
    queues: Vec<Queue>,
    worker_id: String,
    buffer: Mutex<AutoSaveBuffer>,
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("worker_id", &self.inner.worker_id)
            .field("queues", &self.inner.queues)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Validates `config` and builds its queues. Nothing is fetched until
    /// [`start`](Self::start).
    ///
    /// # Errors
    ///
    /// Returns the first configuration problem found by
    /// [`JobConfig::validate`].
    pub fn new(
        config: &JobConfig,
        store: Arc<dyn Store>,
        handlers: HandlerRegistry,
        callbacks: Callbacks,
    ) -> Result<Self, ConfigError> {
        let settings = config.validate(&handlers)?;
        Ok(Self::from_settings(settings, store, handlers, callbacks))
    }

    /// Builds a dispatcher from already validated settings.
    pub fn from_settings(
        settings: Settings,
        store: Arc<dyn Store>,
        handlers: HandlerRegistry,
        callbacks: Callbacks,
    ) -> Self {
        let worker_id = uuid::Uuid::new_v4().simple().to_string();
        let handlers = Arc::new(handlers);
        let callbacks = Arc::new(callbacks);
        let writer = JobWriter::new(
            Arc::clone(&store),
            settings.keyspace.clone(),
            settings.separator.clone(),
        );

        let queues = settings
            .queues
            .iter()
            .map(|queue| {
                Queue::new(
                    queue.clone(),
                    Arc::clone(&store),
                    Arc::clone(&handlers),
                    writer.clone(),
                    Arc::clone(&callbacks),
                    worker_id.clone(),
                )
            })
            .collect();

        Self {
            inner: Arc::new(DispatcherInner {
                settings,
                store,
                callbacks,
                writer,
                queues,
                worker_id,
                buffer: Mutex::new(AutoSaveBuffer::default()),
            }),
        }
    }

    /// Waits out the startup delay, then starts every enabled queue.
    pub async fn start(&self) -> Result<(), QueueError> {
        let settings = &self.inner.settings;
        if !settings.enabled {
            info!("Job dispatcher is disabled, no queue will fetch");
            return Ok(());
        }

        if !settings.startup_delay.is_zero() {
            debug!(delay_ms = settings.startup_delay.as_millis() as u64, "Delaying queue startup");
            tokio::time::sleep(settings.startup_delay).await;
        }

        for queue in &self.inner.queues {
            match queue.start() {
                Ok(()) | Err(QueueError::Disabled(_)) => {}
                Err(e) => return Err(e),
            }
        }

        info!(
            worker_id = %self.inner.worker_id,
            queues = self.inner.queues.len(),
            "Job dispatcher started"
        );
        Ok(())
    }

    /// Persists buffered jobs, then shuts every queue down.
    pub async fn shutdown(&self, grace: Duration) {
        self.flush().await;
        for queue in &self.inner.queues {
            queue.shutdown(grace).await;
        }
        info!(worker_id = %self.inner.worker_id, "Job dispatcher stopped");
    }

    /// Starts building a job for `queue`.
    ///
    /// # Errors
    ///
    /// Returns `JobError::InvalidQueueName` for an empty name or one that
    /// contains the queue separator.
    pub fn create(&self, queue: &str, spec: JobSpec) -> Result<JobBuilder, JobError> {
        let separator = &self.inner.settings.separator;
        if queue.is_empty() || queue.contains(separator.as_str()) {
            return Err(JobError::InvalidQueueName(queue.to_string()));
        }

        self.inner.callbacks.before_job_create(queue, &spec);
        let job = Job::from_spec(queue, spec);
        self.inner.callbacks.after_job_create(&job);

        Ok(JobBuilder {
            dispatcher: self.clone(),
            job,
            callbacks: JobCallbacks::default(),
        })
    }

    /// Persists everything in the auto-save buffer now.
    pub async fn flush(&self) {
        self.inner.flush().await;
    }

    pub fn queue(&self, name: &str) -> Option<&Queue> {
        self.inner.queues.iter().find(|queue| queue.name() == name)
    }

    pub fn queues(&self) -> &[Queue] {
        &self.inner.queues
    }

    /// Stats of every queue, in configuration order.
    pub fn queue_stats(&self) -> Vec<QueueStats> {
        self.inner.queues.iter().map(Queue::stats).collect()
    }

    /// Random id published as `job.worker` in every event.
    pub fn worker_id(&self) -> &str {
        &self.inner.worker_id
    }

    pub fn settings(&self) -> &Settings {
        &self.inner.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.inner.store
    }

    fn defer(&self, job: Job, callbacks: JobCallbacks) -> PendingJob {
        let (reply, rx) = oneshot::channel();
        let max_jobs = self.inner.settings.auto_save.max_jobs;

        let (full, schedule) = {
            let mut buffer = self.inner.lock_buffer();
            buffer.pending.push(PendingSave {
                job,
                callbacks,
                reply,
            });
            if buffer.pending.len() >= max_jobs {
                (Some(std::mem::take(&mut buffer.pending)), false)
            } else if !buffer.scheduled {
                buffer.scheduled = true;
                (None, true)
            } else {
                (None, false)
            }
        };

        if let Some(batch) = full {
            debug!(jobs = batch.len(), "Auto-save buffer full, flushing");
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move { inner.save_batch(batch).await });
        } else if schedule {
            let inner = Arc::clone(&self.inner);
            tokio::spawn(async move {
                tokio::task::yield_now().await;
                inner.flush().await;
            });
        }

        PendingJob { rx }
    }
}

impl DispatcherInner {
    fn lock_buffer(&self) -> MutexGuard<'_, AutoSaveBuffer> {
        self.buffer.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    async fn flush(&self) {
        let batch = {
            let mut buffer = self.lock_buffer();
            buffer.scheduled = false;
            std::mem::take(&mut buffer.pending)
        };
        self.save_batch(batch).await;
    }

    async fn save_batch(&self, batch: Vec<PendingSave>) {
        if batch.is_empty() {
            return;
        }
        debug!(jobs = batch.len(), "Auto-saving buffered jobs");

        futures::stream::iter(batch)
            .for_each_concurrent(self.settings.auto_save.concurrency, |entry| async move {
                let PendingSave {
                    mut job,
                    callbacks,
                    reply,
                } = entry;
                let result = self.writer.save(&mut job, callbacks, true).await;
                if let Err(e) = &result {
                    warn!(queue = %job.queue, job_id = %job.id_str(), error = %e, "Auto-save failed");
                }
                // The producer may have dropped its handle.
                let _ = reply.send(result);
            })
            .await;
    }
}

/// A job being configured before it is saved.
///
/// Each `on_*` method asks for the matching event to be published and
/// registers the callback that receives it.
#[must_use = "a job is only saved once submitted, awaited or deferred"]
pub struct JobBuilder {
    dispatcher: Dispatcher,
    job: Job,
    callbacks: JobCallbacks,
}

impl std::fmt::Debug for JobBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobBuilder")
            .field("job", &self.job)
            .field("callbacks", &self.callbacks)
            .finish()
    }
}

impl JobBuilder {
    pub fn job(&self) -> &Job {
        &self.job
    }

    pub fn data(mut self, data: Value) -> Self {
        self.job.data = data;
        self
    }

    pub fn retries(mut self, retries: u32) -> Self {
        self.job.options.retries = retries;
        self
    }

    /// Timeout in milliseconds.
    pub fn timeout(mut self, ms: u64) -> Self {
        self.job.options.timeout = Some(ms);
        self
    }

    pub fn unique(mut self, unique: bool) -> Self {
        self.job.options.unique = unique;
        self
    }

    pub fn no_bind(mut self, no_bind: bool) -> Self {
        self.job.options.no_bind = no_bind;
        self
    }

    pub fn on_success<F>(self, f: F) -> Self
    where
        F: Fn(JobEvent) + Send + Sync + 'static,
    {
        self.notify(EventKind::Success, Arc::new(f))
    }

    /// Also receives subscription setup errors.
    pub fn on_failure<F>(self, f: F) -> Self
    where
        F: Fn(JobEvent) + Send + Sync + 'static,
    {
        self.notify(EventKind::Failure, Arc::new(f))
    }

    pub fn on_retry<F>(self, f: F) -> Self
    where
        F: Fn(JobEvent) + Send + Sync + 'static,
    {
        self.notify(EventKind::Retry, Arc::new(f))
    }

    pub fn on_relay_step_success<F>(self, f: F) -> Self
    where
        F: Fn(JobEvent) + Send + Sync + 'static,
    {
        self.notify(EventKind::RelayStepSuccess, Arc::new(f))
    }

    pub fn on_relay_step_cancelled<F>(self, f: F) -> Self
    where
        F: Fn(JobEvent) + Send + Sync + 'static,
    {
        self.notify(EventKind::RelayStepCancelled, Arc::new(f))
    }

    pub fn on_progress<F>(self, f: F) -> Self
    where
        F: Fn(JobEvent) + Send + Sync + 'static,
    {
        self.notify(EventKind::Progress, Arc::new(f))
    }

    fn notify(mut self, kind: EventKind, callback: EventCallback) -> Self {
        *self.job.options.notify_mut(kind) = Some(NotifyFlag::Flag(true));
        self.callbacks.set(kind, callback);
        self
    }

    /// Saves the job now.
    ///
    /// # Errors
    ///
    /// Returns `JobError::DuplicateJob` when a unique job with the same id is
    /// already queued, or the store error that prevented the save.
    pub async fn submit(self) -> Result<SaveReceipt, JobError> {
        let Self {
            dispatcher,
            mut job,
            callbacks,
        } = self;
        dispatcher.inner.writer.save(&mut job, callbacks, false).await
    }

    /// Hands the job to the auto-save buffer. The returned handle resolves
    /// once the batch holding the job has been persisted; dropping it does
    /// not cancel the save.
    ///
    /// The buffer is flushed by a spawned task after it yields once, or
    /// right away when it reaches `autoSave.maxJobs`. On a current-thread
    /// runtime that is after the creating task's next await point. On a
    /// multi-thread runtime the flush may run while the creating task is
    /// still deferring, so jobs deferred together can land in several
    /// batches. Every deferred job is saved either way, and no batch
    /// exceeds `maxJobs`. Call [`Dispatcher::flush`] to persist the buffer
    /// at a known point.
    pub fn defer(self) -> PendingJob {
        let Self {
            dispatcher,
            job,
            callbacks,
        } = self;
        dispatcher.defer(job, callbacks)
    }
}

impl IntoFuture for JobBuilder {
    type Output = Result<SaveReceipt, JobError>;
    type IntoFuture = BoxFuture<'static, Self::Output>;

    fn into_future(self) -> Self::IntoFuture {
        Box::pin(self.submit())
    }
}

/// Handle to a job waiting in the auto-save buffer.
#[derive(Debug)]
pub struct PendingJob {
    rx: oneshot::Receiver<SaveResult>,
}

impl Future for PendingJob {
    type Output = SaveResult;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or_else(|_| Err(JobError::AutoSaveDropped)))
    }
}
