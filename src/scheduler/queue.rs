//! Queue engine: fetch, execute, finalize.
//!
//! A started queue runs one task per fetch slot plus a stall-check task.
//! Each slot loops:
//!
//! 1. **Fetch**: blocking `waiting → active` pop on the slot's own connection.
//! 2. **Resolve** the handler (first relay stage, the job's `runs`, or the
//!    queue default). A missing handler fails the job without retrying.
//! 3. **Heartbeat**: remove the id from `stalling` now and every
//!    `stallInterval / 3` until the run settles.
//! 4. **Execute** the handler in its own task, raced against the job's
//!    timeout. First settlement wins; a timed-out handler is detached and
//!    its result discarded.
//! 5. **Finalize**: save the next relay stage, commit atomically, publish
//!    events, run lifecycle hooks.
//! 6. **Throttle**: when configured, count the completion and sleep out the
//!    window once it is full.
//!
//! The stall-check task runs every `stallInterval` and moves jobs whose
//! worker stopped heartbeating back to `waiting`.
//!
//! # State
//!
//! ```text
//! Idle ──start──▶ Started ◀──start── Paused
//!                   │  └────pause────▶ │
//!                   └──────destroy─────┴──▶ Destroyed
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde_json::Value;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, warn};

use super::events::{Callbacks, JobFailure};
use super::finalize::{self, Completion, HookCall, Outcome, PlanContext};
use super::handler::{HandlerRegistry, JobContext};
use super::job::{Job, JobStatus, JobWriter};
use crate::config::QueueSettings;
use crate::error::{JobError, QueueError, StoreError};
use crate::metrics::MetricsCollector;
use crate::store::{Commit, CommitAction, Fetcher, QueueKeys, QueueStatus, Store};

const RECONNECT_INITIAL: Duration = Duration::from_millis(100);
const RECONNECT_MAX: Duration = Duration::from_secs(5);

/// Lifecycle state of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueueState {
    Idle,
    Started,
    Paused,
    Destroyed,
}

impl std::fmt::Display for QueueState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::Started => write!(f, "started"),
            Self::Paused => write!(f, "paused"),
            Self::Destroyed => write!(f, "destroyed"),
        }
    }
}

/// In-process statistics of one queue.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueStats {
    pub name: String,
    pub state: QueueState,
    /// Fetch slots while started.
    pub concurrency: usize,
    /// Runs executing right now.
    pub running: usize,
    pub succeeded: u64,
    pub failed: u64,
    /// Failed runs that were requeued.
    pub retried: u64,
    pub average_duration: Duration,
    /// Whether the last throttle check found the window full.
    pub throttled: bool,
}

impl QueueStats {
    /// Returns the number of runs that reached a terminal status.
    pub fn total_processed(&self) -> u64 {
        self.succeeded + self.failed
    }

    /// Returns the success rate as a percentage.
    pub fn success_rate(&self) -> f64 {
        let total = self.total_processed();
        if total == 0 {
            return 0.0;
        }
        (self.succeeded as f64 / total as f64) * 100.0
    }
}

/// Shared state for tracking queue statistics.
struct SharedQueueStats {
    succeeded: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    total_duration_ms: AtomicU64,
    running: AtomicU64,
    throttled: AtomicBool,
}

impl SharedQueueStats {
    fn new() -> Self {
        Self {
            succeeded: AtomicU64::new(0),
            failed: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            running: AtomicU64::new(0),
            throttled: AtomicBool::new(false),
        }
    }

    fn record(&self, status: JobStatus, duration: Duration) {
        let counter = match status {
            JobStatus::Succeeded => &self.succeeded,
            JobStatus::Retrying => &self.retried,
            _ => &self.failed,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn run_started(&self) {
        self.running.fetch_add(1, Ordering::SeqCst);
    }

    fn run_finished(&self) {
        self.running.fetch_sub(1, Ordering::SeqCst);
    }

    fn snapshot(&self, name: &str, state: QueueState, concurrency: usize) -> QueueStats {
        let succeeded = self.succeeded.load(Ordering::SeqCst);
        let failed = self.failed.load(Ordering::SeqCst);
        let retried = self.retried.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);

        let runs = succeeded + failed + retried;
        let average_duration = if runs > 0 {
            Duration::from_millis(total_duration_ms / runs)
        } else {
            Duration::ZERO
        };

        QueueStats {
            name: name.to_string(),
            state,
            concurrency,
            running: self.running.load(Ordering::SeqCst) as usize,
            succeeded,
            failed,
            retried,
            average_duration,
            throttled: self.throttled.load(Ordering::SeqCst),
        }
    }
}

/// A named queue and its workers.
///
/// Cheap to clone; clones control the same queue.
#[derive(Clone)]
pub struct Queue {
    inner: Arc<QueueInner>,
}

struct QueueInner {
    settings: QueueSettings,
    keys: QueueKeys,
    store: Arc<dyn Store>,
    handlers: Arc<HandlerRegistry>,
    writer: JobWriter,
    callbacks: Arc<Callbacks>,
    worker_id: String,
    state: Mutex<QueueState>,
    /// Bumped on every start and pause; tasks exit once it moves past the
    /// value they were started with.
    epoch: watch::Sender<u64>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stats: SharedQueueStats,
    metrics: MetricsCollector,
}

impl std::fmt::Debug for Queue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Queue")
            .field("name", &self.name())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl Queue {
    /// Creates an idle queue.
    ///
    /// # Arguments
    ///
    /// * `settings` - Validated queue settings
    /// * `store` - Shared store
    /// * `handlers` - Handler table jobs are resolved against
    /// * `writer` - Saves next relay stages (its keyspace names this queue's keys)
    /// * `callbacks` - Lifecycle callbacks
    /// * `worker_id` - Published as `job.worker` in events
    pub fn new(
        settings: QueueSettings,
        store: Arc<dyn Store>,
        handlers: Arc<HandlerRegistry>,
        writer: JobWriter,
        callbacks: Arc<Callbacks>,
        worker_id: impl Into<String>,
    ) -> Self {
        let keys = writer.keyspace().queue(&settings.name);
        let (epoch, _) = watch::channel(0);

        debug!(queue = %settings.name, "Queue created");

        Self {
            inner: Arc::new(QueueInner {
                settings,
                keys,
                store,
                handlers,
                writer,
                callbacks,
                worker_id: worker_id.into(),
                state: Mutex::new(QueueState::Idle),
                epoch,
                tasks: Mutex::new(Vec::new()),
                stats: SharedQueueStats::new(),
                metrics: MetricsCollector::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.settings.name
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    pub fn keys(&self) -> &QueueKeys {
        &self.inner.keys
    }

    pub fn state(&self) -> QueueState {
        *self.inner.lock_state()
    }

    /// Starts (or resumes) fetching. A no-op if already started.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::Disabled` for disabled queues and
    /// `QueueError::Destroyed` after [`destroy`](Self::destroy).
    pub fn start(&self) -> Result<(), QueueError> {
        let inner = &self.inner;
        {
            let mut state = inner.lock_state();
            match *state {
                QueueState::Destroyed => return Err(QueueError::Destroyed(self.name().to_string())),
                QueueState::Started => return Ok(()),
                QueueState::Idle | QueueState::Paused => {}
            }
            if !inner.settings.enabled {
                info!(queue = %self.name(), "Queue is currently disabled");
                return Err(QueueError::Disabled(self.name().to_string()));
            }
            *state = QueueState::Started;
        }

        let epoch = inner.bump_epoch();
        let slots = inner.settings.fetch_slots();
        {
            let mut tasks = inner.lock_tasks();
            tasks.retain(|task| !task.is_finished());
            for slot in 0..slots {
                tasks.push(tokio::spawn(run_slot(Arc::clone(inner), slot, epoch)));
            }
            tasks.push(tokio::spawn(run_stall_checks(Arc::clone(inner), epoch)));
        }

        info!(
            queue = %self.name(),
            concurrency = slots,
            throttled = inner.settings.throttle.is_some(),
            "Queue started"
        );
        Ok(())
    }

    /// Stops fetching. Runs in progress finish normally.
    pub fn pause(&self) {
        {
            let mut state = self.inner.lock_state();
            if *state != QueueState::Started {
                return;
            }
            *state = QueueState::Paused;
        }
        self.inner.bump_epoch();
        info!(queue = %self.name(), "Queue paused");
    }

    /// Pauses and waits up to `grace` for runs in progress to finish;
    /// whatever is still running afterwards is aborted and left for the
    /// stall check.
    pub async fn shutdown(&self, grace: Duration) {
        self.pause();
        let tasks = std::mem::take(&mut *self.inner.lock_tasks());
        let aborts: Vec<_> = tasks.iter().map(JoinHandle::abort_handle).collect();

        let join_all = async {
            for task in tasks {
                if let Err(e) = task.await {
                    if e.is_panic() {
                        error!(queue = %self.name(), error = %e, "Queue task panicked");
                    }
                }
            }
        };

        if tokio::time::timeout(grace, join_all).await.is_err() {
            warn!(queue = %self.name(), grace_ms = grace.as_millis() as u64, "Queue shutdown timed out, aborting");
            for abort in aborts {
                abort.abort();
            }
        }
    }

    /// Stops the queue for good and deletes all of its keys.
    pub async fn destroy(&self) -> Result<(), QueueError> {
        self.pause();
        for task in std::mem::take(&mut *self.inner.lock_tasks()) {
            task.abort();
        }
        *self.inner.lock_state() = QueueState::Destroyed;

        self.inner.store.destroy(&self.inner.keys).await?;
        info!(queue = %self.name(), "Queue destroyed");
        Ok(())
    }

    /// Counts of the queue's lists and sets.
    pub async fn status(&self) -> Result<QueueStatus, QueueError> {
        Ok(self.inner.store.queue_status(&self.inner.keys).await?)
    }

    /// Loads a stored job.
    pub async fn job(&self, id: &str) -> Result<Option<Job>, QueueError> {
        match self.inner.store.get_job(&self.inner.keys, id).await? {
            Some(payload) => Ok(Some(Job::from_wire(&payload).map_err(StoreError::from)?)),
            None => Ok(None),
        }
    }

    /// Removes a job from every structure of the queue. Idempotent.
    pub async fn remove_job(&self, id: &str) -> Result<(), QueueError> {
        self.inner.store.remove_job(&self.inner.keys, id).await?;
        debug!(queue = %self.name(), job_id = %id, "Job removed");
        Ok(())
    }

    /// Runs one stall check now. Returns the recovered ids.
    pub async fn check_stalled(&self) -> Result<Vec<String>, QueueError> {
        Ok(self.inner.check_stalled().await?)
    }

    /// Key for `suffix` in this queue's namespace.
    pub fn to_key(&self, suffix: &str) -> String {
        self.inner.writer.keyspace().key(self.name(), suffix)
    }

    /// Queue-scoped event name: `queue:{name}:{event}`.
    pub fn to_event_name(&self, event: &str) -> String {
        format!("queue:{}:{}", self.name(), event)
    }

    pub fn stats(&self) -> QueueStats {
        self.inner
            .stats
            .snapshot(self.name(), self.state(), self.inner.settings.fetch_slots())
    }
}

impl QueueInner {
    fn name(&self) -> &str {
        &self.settings.name
    }

    fn lock_state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_tasks(&self) -> MutexGuard<'_, Vec<JoinHandle<()>>> {
        self.tasks.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn bump_epoch(&self) -> u64 {
        let mut current = 0;
        self.epoch.send_modify(|epoch| {
            *epoch += 1;
            current = *epoch;
        });
        current
    }

    async fn check_stalled(&self) -> Result<Vec<String>, StoreError> {
        let now = chrono::Utc::now().timestamp_millis();
        let interval = self.settings.stall_interval.as_millis() as u64;
        let recovered = self.store.check_stalled(&self.keys, now, interval).await?;

        if !recovered.is_empty() {
            info!(queue = %self.name(), recovered = recovered.len(), "Recovered stalled jobs");
            self.metrics.record_stalled(self.name(), recovered.len());
        }
        Ok(recovered)
    }

    /// Runs one fetched job through execute and finalize.
    async fn process(&self, id: &str) {
        let Some(job) = self.load(id).await else {
            return;
        };

        let started = Instant::now();
        self.stats.run_started();
        self.metrics.inc_jobs_in_progress(self.name());

        let (job, outcome, handler) = self.execute(job).await;

        self.stats.run_finished();
        self.metrics.dec_jobs_in_progress(self.name());

        self.complete(job, outcome, &handler, started.elapsed()).await;
    }

    async fn load(&self, id: &str) -> Option<Job> {
        match self.store.get_job(&self.keys, id).await {
            Ok(Some(payload)) => match Job::from_wire(&payload) {
                Ok(mut job) => {
                    if job.id.is_none() {
                        job.id = Some(id.to_string());
                    }
                    Some(job)
                }
                Err(e) => {
                    error!(queue = %self.name(), job_id = %id, error = %e, "Discarding unreadable job");
                    self.discard(id).await;
                    None
                }
            },
            Ok(None) => {
                warn!(queue = %self.name(), job_id = %id, "Fetched id has no stored job, discarding");
                self.discard(id).await;
                None
            }
            Err(e) => {
                // Left in `active`; the stall check hands it out again.
                error!(queue = %self.name(), job_id = %id, error = %e, "Failed to load job");
                None
            }
        }
    }

    async fn discard(&self, id: &str) {
        let commit = Commit {
            id: id.to_string(),
            action: CommitAction::Remove,
        };
        if let Err(e) = self.store.commit(&self.keys, &commit).await {
            error!(queue = %self.name(), job_id = %id, error = %e, "Failed to discard job");
        }
    }

    /// Runs the job's handler. Returns the job (with its final progress),
    /// the outcome and the handler label used in logs.
    async fn execute(&self, mut job: Job) -> (Job, Outcome, String) {
        let id = job.id_str().to_string();
        let name = job
            .handler_name()
            .map(str::to_string)
            .or_else(|| self.settings.handler.clone());
        let label = name.clone().unwrap_or_else(|| self.name().to_string());

        let handler = match self.handlers.resolve(name.as_deref()) {
            Ok(handler) => handler,
            Err(e) => return (job, Outcome::Fatal(JobFailure::from_job_error(&e)), label),
        };

        debug!(queue = %self.name(), job_id = %id, handler = %label, "Running job");

        let bound = !(job.options.no_bind || self.settings.no_bind);
        let ctx = JobContext::new(&job, &self.worker_id, bound, Arc::clone(&self.store));
        let heartbeat = self.spawn_heartbeat(&id);
        let mut run = tokio::spawn({
            let ctx = ctx.clone();
            async move { handler.handle(ctx).await }
        });

        let outcome = match job.options.timeout {
            Some(ms) => tokio::select! {
                joined = &mut run => settle(&id, joined),
                _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                    warn!(queue = %self.name(), job_id = %id, timeout_ms = ms, "Job timed out");
                    Outcome::Failure(JobFailure::timed_out(&id, ms))
                }
            },
            None => settle(&id, run.await),
        };

        heartbeat.abort();
        let outcome = match outcome {
            Outcome::Success(_) if ctx.retry_requested() => {
                debug!(queue = %self.name(), job_id = %id, "Handler requested a retry");
                Outcome::RetryRequested(JobFailure::retry_requested(&id))
            }
            other => other,
        };
        job.progress = ctx.progress();
        (job, outcome, label)
    }

    fn spawn_heartbeat(&self, id: &str) -> JoinHandle<()> {
        let store = Arc::clone(&self.store);
        let keys = self.keys.clone();
        let id = id.to_string();
        let every = (self.settings.stall_interval / 3).max(Duration::from_millis(1));

        tokio::spawn(async move {
            loop {
                if let Err(e) = store.heartbeat(&keys, &id).await {
                    warn!(job_id = %id, error = %e, "Heartbeat failed");
                }
                tokio::time::sleep(every).await;
            }
        })
    }

    /// Applies a finished run.
    async fn complete(&self, job: Job, outcome: Outcome, handler: &str, elapsed: Duration) {
        let id = job.id_str().to_string();
        let ctx = PlanContext {
            worker: &self.worker_id,
            record_terminal: self.settings.record_terminal,
        };
        let fetched = job.is_relay().then(|| job.clone());
        let mut completion = match finalize::plan(job, outcome, ctx) {
            Ok(completion) => completion,
            Err(e) => {
                error!(queue = %self.name(), job_id = %id, error = %e, "Failed to serialize finished job");
                return;
            }
        };

        // The next stage goes in first: a crash in between may repeat this
        // stage but never drops the relay.
        if let Some(mut next) = completion.next.take() {
            match self.writer.enqueue(&mut next).await {
                Ok(next_id) => {
                    debug!(queue = %self.name(), job_id = %id, next_queue = %next.queue, next_id = %next_id, "Queued next relay stage");
                }
                Err(e @ JobError::DuplicateJob(_)) => {
                    warn!(queue = %self.name(), job_id = %id, error = %e, "Next relay stage already exists, failing relay");
                    let failure = JobFailure::from_job_error(&e);
                    let replanned = fetched.map(|job| finalize::plan(job, Outcome::Fatal(failure), ctx));
                    completion = match replanned {
                        Some(Ok(failed)) => failed,
                        Some(Err(e)) => {
                            error!(queue = %self.name(), job_id = %id, error = %e, "Failed to serialize finished job");
                            return;
                        }
                        None => return,
                    };
                }
                Err(e) => {
                    error!(queue = %self.name(), job_id = %id, error = %e, "Failed to queue next relay stage");
                    return;
                }
            }
        }

        let Completion {
            job,
            commit,
            publish,
            hooks,
            ..
        } = completion;

        if let Err(e) = self.store.commit(&self.keys, &commit).await {
            error!(queue = %self.name(), job_id = %id, error = %e, "Failed to commit finished job");
            return;
        }

        for (channel, event) in publish {
            let published = match serde_json::to_string(&event) {
                Ok(payload) => self.store.publish(&channel, &payload).await,
                Err(e) => Err(StoreError::from(e)),
            };
            if let Err(e) = published {
                warn!(queue = %self.name(), job_id = %id, channel = %channel, error = %e, "Failed to publish job event");
            }
        }

        self.stats.record(job.status, elapsed);
        self.metrics
            .record_job(self.name(), &job.status.to_string(), elapsed);

        for hook in hooks {
            match hook {
                HookCall::Succeeded(result) => {
                    debug!(queue = %self.name(), job_id = %id, duration_ms = elapsed.as_millis() as u64, "Job succeeded");
                    self.callbacks.job_succeeded(&job, &result);
                }
                HookCall::Failed(failure) => {
                    self.callbacks
                        .job_failed(&job, &failure, handler, self.settings.mute);
                }
                HookCall::Retrying(failure) => {
                    warn!(
                        queue = %self.name(),
                        job_id = %id,
                        retries_left = job.options.retries,
                        error = %failure,
                        "Job failed, requeueing for retry"
                    );
                    self.callbacks.job_retrying(&job, &failure);
                }
                HookCall::RelayStepSucceeded(result) => {
                    self.callbacks.relay_step_succeeded(&job, &result);
                }
                HookCall::RelayStepCancelled => {
                    debug!(queue = %self.name(), job_id = %id, "Relay cancelled by handler");
                    self.callbacks.relay_step_cancelled(&job);
                }
            }
        }
    }

    /// Counts a completion against the throttle window. Returns how long to
    /// wait when the window is full.
    async fn throttle_delay(&self) -> Option<Duration> {
        let throttle = self.settings.throttle?;
        let status = match self
            .store
            .throttle(
                &self.keys.throttle,
                i64::from(throttle.limit),
                i64::from(throttle.seconds),
            )
            .await
        {
            Ok(status) => status,
            Err(e) => {
                error!(queue = %self.name(), error = %e, "Throttle check failed");
                return None;
            }
        };

        self.stats.throttled.store(status.blocked, Ordering::SeqCst);
        if !status.blocked {
            return None;
        }

        let seconds = if status.ttl <= 0 { 1 } else { status.ttl as u64 };
        info!(queue = %self.name(), resume_in_secs = seconds, "Queue reached its throttle limit");
        self.metrics.record_throttle_wait(self.name());
        Some(Duration::from_secs(seconds))
    }
}

fn settle(id: &str, joined: Result<anyhow::Result<Value>, JoinError>) -> Outcome {
    match joined {
        Ok(Ok(result)) => Outcome::Success(result),
        Ok(Err(e)) => Outcome::Failure(JobFailure::from_error(&e)),
        Err(e) => {
            error!(job_id = %id, error = %e, "Job handler panicked");
            Outcome::Failure(JobFailure::panicked(id))
        }
    }
}

/// Resolves once the queue's epoch moves past `epoch`.
async fn stopped(signal: &mut watch::Receiver<u64>, epoch: u64) {
    loop {
        if *signal.borrow_and_update() != epoch {
            return;
        }
        if signal.changed().await.is_err() {
            return;
        }
    }
}

/// Sleeps for `delay`. Returns false if the queue stopped meanwhile.
async fn pause_for(signal: &mut watch::Receiver<u64>, epoch: u64, delay: Duration) -> bool {
    let slept = tokio::select! {
        _ = tokio::time::sleep(delay) => true,
        _ = stopped(signal, epoch) => false,
    };
    slept && *signal.borrow() == epoch
}

async fn run_slot(inner: Arc<QueueInner>, slot: usize, epoch: u64) {
    let mut signal = inner.epoch.subscribe();
    let mut fetcher: Option<Box<dyn Fetcher>> = None;
    let mut backoff = RECONNECT_INITIAL;

    debug!(queue = %inner.name(), slot, "Fetch slot started");

    loop {
        if *signal.borrow() != epoch {
            break;
        }

        if fetcher.is_none() {
            match inner.store.open_fetcher().await {
                Ok(opened) => fetcher = Some(opened),
                Err(e) => {
                    error!(queue = %inner.name(), slot, error = %e, "Failed to open fetch connection");
                    if !pause_for(&mut signal, epoch, backoff).await {
                        break;
                    }
                    backoff = (backoff * 2).min(RECONNECT_MAX);
                    continue;
                }
            }
        }
        let Some(active) = fetcher.as_mut() else {
            continue;
        };

        let fetched = tokio::select! {
            fetched = active.fetch(&inner.keys) => fetched,
            _ = stopped(&mut signal, epoch) => break,
        };

        let id = match fetched {
            Ok(id) => {
                backoff = RECONNECT_INITIAL;
                id
            }
            Err(e) => {
                error!(queue = %inner.name(), slot, error = %e, "Fetch failed, reconnecting");
                fetcher = None;
                if !pause_for(&mut signal, epoch, backoff).await {
                    break;
                }
                backoff = (backoff * 2).min(RECONNECT_MAX);
                continue;
            }
        };

        debug!(queue = %inner.name(), slot, job_id = %id, "Fetched job");
        inner.process(&id).await;

        if let Some(delay) = inner.throttle_delay().await {
            if !pause_for(&mut signal, epoch, delay).await {
                break;
            }
        }
    }

    debug!(queue = %inner.name(), slot, "Fetch slot stopped");
}

async fn run_stall_checks(inner: Arc<QueueInner>, epoch: u64) {
    let mut signal = inner.epoch.subscribe();
    loop {
        if let Err(e) = inner.check_stalled().await {
            error!(queue = %inner.name(), error = %e, "Stall check failed");
        }
        if !pause_for(&mut signal, epoch, inner.settings.stall_interval).await {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{Keyspace, MemoryStore};

    fn queue(settings: QueueSettings) -> Queue {
        let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
        let writer = JobWriter::new(Arc::clone(&store), Keyspace::new("job", false), "-");
        Queue::new(
            settings,
            store,
            Arc::new(HandlerRegistry::new()),
            writer,
            Arc::new(Callbacks::new()),
            "worker-test",
        )
    }

    #[test]
    fn test_queue_stats_calculations() {
        let stats = QueueStats {
            name: "q".to_string(),
            state: QueueState::Started,
            concurrency: 2,
            running: 1,
            succeeded: 80,
            failed: 20,
            retried: 5,
            average_duration: Duration::from_secs(1),
            throttled: false,
        };

        assert_eq!(stats.total_processed(), 100);
        assert!((stats.success_rate() - 80.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_shared_queue_stats() {
        let stats = SharedQueueStats::new();

        stats.record(JobStatus::Succeeded, Duration::from_millis(10));
        stats.record(JobStatus::Succeeded, Duration::from_millis(20));
        stats.record(JobStatus::Retrying, Duration::from_millis(30));
        stats.record(JobStatus::Failed, Duration::from_millis(40));
        stats.run_started();

        let snapshot = stats.snapshot("q", QueueState::Started, 3);
        assert_eq!(snapshot.succeeded, 2);
        assert_eq!(snapshot.retried, 1);
        assert_eq!(snapshot.failed, 1);
        assert_eq!(snapshot.running, 1);
        assert_eq!(snapshot.average_duration, Duration::from_millis(25));
    }

    #[test]
    fn test_keys_and_event_names() {
        let queue = queue(QueueSettings::new("emails"));
        assert_eq!(queue.to_key("waiting"), "job:emails:waiting");
        assert_eq!(queue.keys().jobs, "job:emails:jobs");
        assert_eq!(queue.to_event_name("drained"), "queue:emails:drained");
    }

    #[tokio::test]
    async fn test_state_transitions() {
        let queue = queue(QueueSettings::new("emails"));
        assert_eq!(queue.state(), QueueState::Idle);

        queue.start().expect("start");
        assert_eq!(queue.state(), QueueState::Started);
        queue.start().expect("second start is a no-op");

        queue.pause();
        assert_eq!(queue.state(), QueueState::Paused);

        queue.start().expect("resume");
        assert_eq!(queue.state(), QueueState::Started);

        queue.destroy().await.expect("destroy");
        assert_eq!(queue.state(), QueueState::Destroyed);
        assert!(matches!(queue.start(), Err(QueueError::Destroyed(_))));
    }

    #[tokio::test]
    async fn test_disabled_queue_does_not_start() {
        let mut settings = QueueSettings::new("emails");
        settings.enabled = false;
        let queue = queue(settings);

        assert!(matches!(queue.start(), Err(QueueError::Disabled(_))));
        assert_eq!(queue.state(), QueueState::Idle);
    }

    #[tokio::test]
    async fn test_shutdown_stops_idle_slots() {
        let mut settings = QueueSettings::new("emails");
        settings.concurrency = 3;
        let queue = queue(settings);

        queue.start().expect("start");
        queue.shutdown(Duration::from_secs(1)).await;

        assert_eq!(queue.state(), QueueState::Paused);
        assert!(queue.inner.lock_tasks().is_empty());
    }

    #[test]
    fn test_settle() {
        assert_eq!(settle("j", Ok(Ok(Value::Bool(true)))), Outcome::Success(Value::Bool(true)));
        match settle("j", Ok(Err(anyhow::anyhow!("boom")))) {
            Outcome::Failure(failure) => assert_eq!(failure.message, "boom"),
            other => panic!("unexpected outcome {:?}", other),
        }
    }
}
