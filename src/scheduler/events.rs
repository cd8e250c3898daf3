//! Job events: published payloads, lifecycle callbacks and subscriptions.
//!
//! Workers publish a [`JobEvent`] on `job:{id}:{kind}` channels. A producer
//! that registered per-job callbacks holds one subscription covering all of
//! the job's activated channels; [`listen`] routes each message to the
//! matching callback and ends on the first terminal event or at the
//! deadline.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

use super::job::{EventKind, Job, JobSpec, JobStatus};
use crate::error::JobError;
use crate::store::Subscription;

/// Maximum number of cause lines in a logged failure.
const MAX_LOGGED_CAUSES: usize = 20;

/// Job section of a published event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventJob {
    pub id: String,
    pub worker: String,
    pub status: JobStatus,
    pub progress: f64,
    pub data: Value,
}

/// Error section of a published event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventError {
    pub message: String,
    /// True when the job never finished within its timeout.
    pub timeout: bool,
}

/// Payload published on a job channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub job: EventJob,
    pub error: Option<EventError>,
}

impl JobEvent {
    pub fn new(job: &Job, worker: &str, data: Value, failure: Option<&JobFailure>) -> Self {
        Self {
            job: EventJob {
                id: job.id_str().to_string(),
                worker: worker.to_string(),
                status: job.status,
                progress: job.progress,
                data,
            },
            error: failure.map(|f| EventError {
                message: f.message.clone(),
                timeout: f.timeout,
            }),
        }
    }

    /// Event delivered locally when a job's subscription could not be set up.
    pub fn setup_failure(job: &Job, err: &JobError) -> Self {
        Self::new(job, "", Value::Null, Some(&JobFailure::from_job_error(err)))
    }

    pub fn is_timeout(&self) -> bool {
        self.error.as_ref().is_some_and(|e| e.timeout)
    }
}

/// Why a run failed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    /// Full message, causes joined with `": "`.
    pub message: String,
    /// Outermost error first.
    pub causes: Vec<String>,
    pub timeout: bool,
}

impl JobFailure {
    pub fn from_error(err: &anyhow::Error) -> Self {
        Self {
            message: format!("{:#}", err),
            causes: err.chain().map(|c| c.to_string()).collect(),
            timeout: false,
        }
    }

    pub fn from_job_error(err: &JobError) -> Self {
        let mut causes = vec![err.to_string()];
        let mut source = std::error::Error::source(err);
        while let Some(cause) = source {
            causes.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: causes.join(": "),
            causes,
            timeout: false,
        }
    }

    pub fn timed_out(id: &str, ms: u64) -> Self {
        let message = format!("Job {} timed out ({}ms)", id, ms);
        Self {
            causes: vec![message.clone()],
            message,
            timeout: true,
        }
    }

    pub fn retry_requested(id: &str) -> Self {
        let message = format!("Job {} requested a retry", id);
        Self {
            causes: vec![message.clone()],
            message,
            timeout: false,
        }
    }

    pub fn panicked(id: &str) -> Self {
        let message = format!("Job {} handler panicked", id);
        Self {
            causes: vec![message.clone()],
            message,
            timeout: false,
        }
    }
}

impl std::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.message)
    }
}

/// Callback receiving a job's published events.
pub type EventCallback = Arc<dyn Fn(JobEvent) + Send + Sync>;

/// Per-job callbacks registered by the producer.
#[derive(Clone, Default)]
pub struct JobCallbacks {
    pub on_success: Option<EventCallback>,
    pub on_failure: Option<EventCallback>,
    pub on_retry: Option<EventCallback>,
    pub on_relay_step_success: Option<EventCallback>,
    pub on_relay_step_cancelled: Option<EventCallback>,
    pub on_progress: Option<EventCallback>,
}

impl std::fmt::Debug for JobCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let set: Vec<&str> = EventKind::ALL
            .into_iter()
            .filter(|k| self.get(*k).is_some())
            .map(|k| k.as_str())
            .collect();
        f.debug_struct("JobCallbacks").field("set", &set).finish()
    }
}

impl JobCallbacks {
    pub fn get(&self, kind: EventKind) -> Option<&EventCallback> {
        match kind {
            EventKind::Success => self.on_success.as_ref(),
            EventKind::Failure => self.on_failure.as_ref(),
            EventKind::Retry => self.on_retry.as_ref(),
            EventKind::RelayStepSuccess => self.on_relay_step_success.as_ref(),
            EventKind::RelayStepCancelled => self.on_relay_step_cancelled.as_ref(),
            EventKind::Progress => self.on_progress.as_ref(),
        }
    }

    pub fn set(&mut self, kind: EventKind, callback: EventCallback) {
        let slot = match kind {
            EventKind::Success => &mut self.on_success,
            EventKind::Failure => &mut self.on_failure,
            EventKind::Retry => &mut self.on_retry,
            EventKind::RelayStepSuccess => &mut self.on_relay_step_success,
            EventKind::RelayStepCancelled => &mut self.on_relay_step_cancelled,
            EventKind::Progress => &mut self.on_progress,
        };
        *slot = Some(callback);
    }

    pub fn is_empty(&self) -> bool {
        EventKind::ALL.into_iter().all(|k| self.get(k).is_none())
    }
}

/// Routes a job's subscription to its callbacks in a background task.
///
/// The task ends on the first success, failure or relay cancellation, when
/// `deadline` elapses, or when the subscription closes. Aborting the returned
/// handle drops the subscription.
pub fn listen(mut subscription: Subscription, callbacks: JobCallbacks, deadline: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let expiry = tokio::time::sleep(deadline);
        tokio::pin!(expiry);

        loop {
            let message = tokio::select! {
                message = subscription.next() => message,
                _ = &mut expiry => {
                    debug!("Job subscription deadline passed");
                    break;
                }
            };
            let Some(message) = message else { break };

            let Some(kind) = message.channel.rsplit(':').next().and_then(EventKind::parse) else {
                warn!(channel = %message.channel, "Event on unknown job channel");
                continue;
            };
            let event: JobEvent = match serde_json::from_str(&message.payload) {
                Ok(event) => event,
                Err(e) => {
                    warn!(channel = %message.channel, error = %e, "Malformed job event");
                    continue;
                }
            };

            // An error on the success channel is still a failure.
            let route = if kind == EventKind::Success && event.error.is_some() {
                EventKind::Failure
            } else {
                kind
            };
            if let Some(callback) = callbacks.get(route) {
                (**callback)(event);
            }

            if kind.is_terminal() {
                break;
            }
        }
    })
}

type CreateHook = Arc<dyn Fn(&str, &JobSpec) + Send + Sync>;
type JobHook = Arc<dyn Fn(&Job) + Send + Sync>;
type ResultHook = Arc<dyn Fn(&Job, &Value) + Send + Sync>;
type FailureHook = Arc<dyn Fn(&Job, &JobFailure) + Send + Sync>;

/// Dispatcher-wide lifecycle callbacks, run on the process that observes
/// the transition.
///
/// # Example
///
/// ```ignore
/// let callbacks = Callbacks::new()
///     .with_on_job_success(|job, result| println!("{} -> {}", job.id_str(), result))
///     .with_on_job_failure(|job, failure| eprintln!("{}: {}", job.id_str(), failure));
/// ```
#[derive(Clone, Default)]
pub struct Callbacks {
    before_job_create: Option<CreateHook>,
    after_job_create: Option<JobHook>,
    on_job_success: Option<ResultHook>,
    on_job_failure: Option<FailureHook>,
    on_job_retry: Option<FailureHook>,
    on_relay_step_success: Option<ResultHook>,
    on_relay_step_cancelled: Option<JobHook>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("before_job_create", &self.before_job_create.is_some())
            .field("after_job_create", &self.after_job_create.is_some())
            .field("on_job_success", &self.on_job_success.is_some())
            .field("on_job_failure", &self.on_job_failure.is_some())
            .field("on_job_retry", &self.on_job_retry.is_some())
            .field("on_relay_step_success", &self.on_relay_step_success.is_some())
            .field("on_relay_step_cancelled", &self.on_relay_step_cancelled.is_some())
            .finish()
    }
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Runs before a job is built, with the target queue and spec.
    pub fn with_before_job_create<F>(mut self, f: F) -> Self
    where
        F: Fn(&str, &JobSpec) + Send + Sync + 'static,
    {
        self.before_job_create = Some(Arc::new(f));
        self
    }

    pub fn with_after_job_create<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.after_job_create = Some(Arc::new(f));
        self
    }

    /// Runs when a single job or a whole relay succeeds.
    pub fn with_on_job_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job, &Value) + Send + Sync + 'static,
    {
        self.on_job_success = Some(Arc::new(f));
        self
    }

    /// Runs on terminal failure. Replaces the default error log.
    pub fn with_on_job_failure<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job, &JobFailure) + Send + Sync + 'static,
    {
        self.on_job_failure = Some(Arc::new(f));
        self
    }

    pub fn with_on_job_retry<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job, &JobFailure) + Send + Sync + 'static,
    {
        self.on_job_retry = Some(Arc::new(f));
        self
    }

    pub fn with_on_relay_step_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job, &Value) + Send + Sync + 'static,
    {
        self.on_relay_step_success = Some(Arc::new(f));
        self
    }

    pub fn with_on_relay_step_cancelled<F>(mut self, f: F) -> Self
    where
        F: Fn(&Job) + Send + Sync + 'static,
    {
        self.on_relay_step_cancelled = Some(Arc::new(f));
        self
    }

    pub(crate) fn before_job_create(&self, queue: &str, spec: &JobSpec) {
        if let Some(hook) = &self.before_job_create {
            hook(queue, spec);
        }
    }

    pub(crate) fn after_job_create(&self, job: &Job) {
        if let Some(hook) = &self.after_job_create {
            hook(job);
        }
    }

    pub(crate) fn job_succeeded(&self, job: &Job, result: &Value) {
        if let Some(hook) = &self.on_job_success {
            hook(job, result);
        }
    }

    /// Runs the failure callback, or logs the failure unless `mute`.
    pub(crate) fn job_failed(&self, job: &Job, failure: &JobFailure, handler: &str, mute: bool) {
        match &self.on_job_failure {
            Some(hook) => hook(job, failure),
            None if !mute => log_failure(job, failure, handler),
            None => {}
        }
    }

    pub(crate) fn job_retrying(&self, job: &Job, failure: &JobFailure) {
        if let Some(hook) = &self.on_job_retry {
            hook(job, failure);
        }
    }

    pub(crate) fn relay_step_succeeded(&self, job: &Job, result: &Value) {
        if let Some(hook) = &self.on_relay_step_success {
            hook(job, result);
        }
    }

    pub(crate) fn relay_step_cancelled(&self, job: &Job) {
        if let Some(hook) = &self.on_relay_step_cancelled {
            hook(job);
        }
    }
}

fn log_failure(job: &Job, failure: &JobFailure, handler: &str) {
    error!("--------------- JOB ERROR/FAILURE ---------------");
    error!(
        handler = %handler,
        queue = %job.queue,
        job_id = %job.id_str(),
        timeout = failure.timeout,
        "Job failed"
    );
    for (depth, cause) in failure.causes.iter().take(MAX_LOGGED_CAUSES).enumerate() {
        error!("  {}: {}", depth, cause);
    }
    error!("-------------------------------------------------");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::JobOptions;
    use serde_json::json;
    use std::sync::Mutex;

    fn saved_job() -> Job {
        let mut job = Job::new("q", json!({"n": 1}), JobOptions::default());
        job.id = Some("q-1".to_string());
        job.status = JobStatus::Succeeded;
        job
    }

    #[test]
    fn test_event_payload_shape() {
        let job = saved_job();
        let event = JobEvent::new(&job, "worker-1", json!({"ok": true}), None);
        let value = serde_json::to_value(&event).expect("serialize");

        assert_eq!(value["job"]["id"], "q-1");
        assert_eq!(value["job"]["worker"], "worker-1");
        assert_eq!(value["job"]["status"], "succeeded");
        assert_eq!(value["job"]["data"]["ok"], true);
        assert!(value["error"].is_null());
    }

    #[test]
    fn test_timeout_failure_is_flagged() {
        let job = saved_job();
        let failure = JobFailure::timed_out("q-1", 250);
        let event = JobEvent::new(&job, "w", Value::Null, Some(&failure));

        assert!(event.is_timeout());
        assert!(failure.message.contains("timed out (250ms)"));
    }

    #[test]
    fn test_failure_from_error_chain() {
        let err = anyhow::anyhow!("connection refused").context("sending email");
        let failure = JobFailure::from_error(&err);

        assert_eq!(failure.causes, vec!["sending email", "connection refused"]);
        assert_eq!(failure.message, "sending email: connection refused");
        assert!(!failure.timeout);
    }

    #[test]
    fn test_job_callbacks_is_empty() {
        let mut callbacks = JobCallbacks::default();
        assert!(callbacks.is_empty());
        callbacks.set(EventKind::Progress, Arc::new(|_| {}));
        assert!(!callbacks.is_empty());
        assert!(callbacks.get(EventKind::Progress).is_some());
    }

    #[test]
    fn test_failure_hook_replaces_log() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let callbacks = Callbacks::new().with_on_job_failure(move |job, failure| {
            sink.lock()
                .unwrap()
                .push(format!("{}: {}", job.id_str(), failure));
        });

        callbacks.job_failed(&saved_job(), &JobFailure::timed_out("q-1", 5), "h", false);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_listen_routes_and_stops_on_terminal() {
        use crate::store::{MemoryStore, Store};

        let store = MemoryStore::new();
        let channels = vec!["job:q-1:progress".to_string(), "job:q-1:success".to_string()];
        let subscription = store.subscribe(&channels).await.expect("subscribe");

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let mut callbacks = JobCallbacks::default();
        let progress_tx = tx.clone();
        callbacks.set(
            EventKind::Progress,
            Arc::new(move |e: JobEvent| {
                let _ = progress_tx.send(format!("progress {}", e.job.progress));
            }),
        );
        callbacks.set(
            EventKind::Success,
            Arc::new(move |_| {
                let _ = tx.send("success".to_string());
            }),
        );
        listen(subscription, callbacks, Duration::from_secs(5));

        let mut job = saved_job();
        job.progress = 50.0;
        let payload = serde_json::to_string(&JobEvent::new(&job, "w", Value::Null, None)).unwrap();
        store.publish("job:q-1:progress", &payload).await.unwrap();
        store.publish("job:q-1:success", &payload).await.unwrap();
        store.publish("job:q-1:progress", &payload).await.unwrap();

        assert_eq!(rx.recv().await.as_deref(), Some("progress 50"));
        assert_eq!(rx.recv().await.as_deref(), Some("success"));
        // Listener stopped after success and dropped its callbacks.
        assert_eq!(rx.recv().await, None);
    }

    #[tokio::test]
    async fn test_listen_ends_at_deadline() {
        use crate::store::{MemoryStore, Store};

        let store = MemoryStore::new();
        let subscription = store
            .subscribe(&["job:q-1:success".to_string()])
            .await
            .expect("subscribe");
        let mut callbacks = JobCallbacks::default();
        callbacks.set(EventKind::Success, Arc::new(|_| {}));

        let handle = listen(subscription, callbacks, Duration::from_millis(50));
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("listener should stop at its deadline")
            .expect("listener task");
    }
}
