//! Job definitions for the scheduler.
//!
//! This module defines the core job types:
//!
//! - `Job`: one unit of work, or one stage of a relay chain, as stored in the `jobs` hash
//! - `JobSpec`: what a producer asks for when creating a job
//! - `JobOptions`: retries, timeout, uniqueness and notification flags carried on the wire
//! - `Runs` / `RelayStage`: single handler reference or ordered relay stages
//! - `JobWriter`: saves jobs (id derivation, notification activation, atomic enqueue)

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use uuid::Uuid;

use super::events::{self, JobCallbacks, JobEvent};
use crate::error::JobError;
use crate::store::{Keyspace, Store};

/// Run timeout applied when the producer sets none, in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 60_000;

/// Extra time a subscription stays open past the job's own timeout budget.
const SUBSCRIPTION_GRACE: Duration = Duration::from_millis(1500);

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Built locally, not yet persisted.
    #[default]
    Created,
    /// Persisted and waiting (or running).
    Saved,
    /// Rejected because a unique job with the same id exists.
    Duplicate,
    /// Failed with retries left, pushed back onto `waiting`.
    Retrying,
    Succeeded,
    Failed,
}

impl JobStatus {
    /// Returns true if no further transition can happen.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Duplicate | Self::Succeeded | Self::Failed)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "created"),
            Self::Saved => write!(f, "saved"),
            Self::Duplicate => write!(f, "duplicate"),
            Self::Retrying => write!(f, "retrying"),
            Self::Succeeded => write!(f, "succeeded"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Kinds of events a job can publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Success,
    Failure,
    Retry,
    RelayStepSuccess,
    RelayStepCancelled,
    Progress,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        Self::Success,
        Self::Failure,
        Self::Retry,
        Self::RelayStepSuccess,
        Self::RelayStepCancelled,
        Self::Progress,
    ];

    /// Channel suffix for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Failure => "failure",
            Self::Retry => "retry",
            Self::RelayStepSuccess => "relayStepSuccess",
            Self::RelayStepCancelled => "relayStepCancelled",
            Self::Progress => "progress",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.as_str() == s)
    }

    /// Whether receiving this event ends a job's subscription.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Success | Self::Failure | Self::RelayStepCancelled
        )
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returns the pub/sub channel for `kind` events of job `id`.
pub fn channel_name(id: &str, kind: EventKind) -> String {
    format!("job:{}:{}", id, kind.as_str())
}

/// A notification request.
///
/// Starts as `Flag(true)` when a producer asks for the event, and is
/// rewritten to the concrete channel once the job has an id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum NotifyFlag {
    Flag(bool),
    Channel(String),
}

impl NotifyFlag {
    pub fn channel(&self) -> Option<&str> {
        match self {
            Self::Channel(c) => Some(c),
            Self::Flag(_) => None,
        }
    }
}

/// One stage of a relay job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "StageRepr")]
pub struct RelayStage {
    /// Handler name in the [`HandlerRegistry`](super::HandlerRegistry).
    pub runs: String,
    /// Queue the stage runs on. Defaults to the previous stage's queue.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue: Option<String>,
}

impl RelayStage {
    pub fn new(runs: impl Into<String>) -> Self {
        Self {
            runs: runs.into(),
            queue: None,
        }
    }

    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = Some(queue.into());
        self
    }
}

/// Stages may be written as a bare handler name.
#[derive(Deserialize)]
#[serde(untagged)]
enum StageRepr {
    Name(String),
    Full {
        runs: String,
        #[serde(default)]
        queue: Option<String>,
    },
}

impl From<StageRepr> for RelayStage {
    fn from(repr: StageRepr) -> Self {
        match repr {
            StageRepr::Name(runs) => Self { runs, queue: None },
            StageRepr::Full { runs, queue } => Self { runs, queue },
        }
    }
}

/// What a job runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Runs {
    Single(String),
    Relay(Vec<RelayStage>),
}

/// Options stored with every job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runs: Option<Runs>,
    #[serde(default)]
    pub unique: bool,
    /// Milliseconds before the run is failed as timed out.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<u64>,
    /// Retries left; decremented on every failed attempt.
    #[serde(default)]
    pub retries: u32,
    #[serde(default)]
    pub no_bind: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_success: Option<NotifyFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_failure: Option<NotifyFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_retry: Option<NotifyFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_relay_step_success: Option<NotifyFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_relay_step_cancelled: Option<NotifyFlag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub notify_progress: Option<NotifyFlag>,
}

impl JobOptions {
    pub fn notify(&self, kind: EventKind) -> Option<&NotifyFlag> {
        match kind {
            EventKind::Success => self.notify_success.as_ref(),
            EventKind::Failure => self.notify_failure.as_ref(),
            EventKind::Retry => self.notify_retry.as_ref(),
            EventKind::RelayStepSuccess => self.notify_relay_step_success.as_ref(),
            EventKind::RelayStepCancelled => self.notify_relay_step_cancelled.as_ref(),
            EventKind::Progress => self.notify_progress.as_ref(),
        }
    }

    pub fn notify_mut(&mut self, kind: EventKind) -> &mut Option<NotifyFlag> {
        match kind {
            EventKind::Success => &mut self.notify_success,
            EventKind::Failure => &mut self.notify_failure,
            EventKind::Retry => &mut self.notify_retry,
            EventKind::RelayStepSuccess => &mut self.notify_relay_step_success,
            EventKind::RelayStepCancelled => &mut self.notify_relay_step_cancelled,
            EventKind::Progress => &mut self.notify_progress,
        }
    }

    /// Concrete channel for `kind`, if the event was requested and activated.
    pub fn channel(&self, kind: EventKind) -> Option<&str> {
        self.notify(kind).and_then(NotifyFlag::channel)
    }
}

/// Producer-facing description of a job.
///
/// # Example
///
/// ```ignore
/// let spec = JobSpec::relay(vec![
///     RelayStage::new("resize"),
///     RelayStage::new("upload").on_queue("uploads"),
/// ])
/// .with_data(json!({ "path": "/tmp/a.png" }));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobSpec {
    #[serde(default)]
    pub runs: Option<Runs>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub retries: Option<u32>,
    #[serde(default)]
    pub timeout: Option<u64>,
    #[serde(default)]
    pub unique: Option<bool>,
    #[serde(default)]
    pub no_bind: Option<bool>,
}

impl JobSpec {
    /// A job handled by the queue's configured handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// A job handled by the named handler.
    pub fn single(handler: impl Into<String>) -> Self {
        Self {
            runs: Some(Runs::Single(handler.into())),
            ..Self::default()
        }
    }

    /// A relay job running `stages` in order.
    pub fn relay(stages: Vec<RelayStage>) -> Self {
        Self {
            runs: Some(Runs::Relay(stages)),
            ..Self::default()
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = data;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    pub fn with_timeout(mut self, ms: u64) -> Self {
        self.timeout = Some(ms);
        self
    }

    pub fn with_unique(mut self, unique: bool) -> Self {
        self.unique = Some(unique);
        self
    }
}

/// A job as stored in the `jobs` hash and handed to workers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    /// Assigned on save, never before.
    #[serde(default)]
    pub id: Option<String>,
    /// Queue of the current stage.
    pub queue: String,
    #[serde(default)]
    pub status: JobStatus,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub progress: f64,
    #[serde(default)]
    pub options: JobOptions,
    /// Set once a save has started; later non-auto saves are no-ops.
    #[serde(skip)]
    pub(crate) saved: bool,
}

impl Job {
    /// Creates a new unsaved job.
    pub fn new(queue: impl Into<String>, data: Value, options: JobOptions) -> Self {
        Self {
            id: None,
            queue: queue.into(),
            status: JobStatus::Created,
            data,
            progress: 0.0,
            options,
            saved: false,
        }
    }

    /// Builds a job for `queue` from a producer spec.
    pub fn from_spec(queue: impl Into<String>, spec: JobSpec) -> Self {
        let options = JobOptions {
            runs: spec.runs,
            unique: spec.unique.unwrap_or(false),
            timeout: Some(spec.timeout.unwrap_or(DEFAULT_TIMEOUT_MS)),
            retries: spec.retries.unwrap_or(0),
            no_bind: spec.no_bind.unwrap_or(false),
            ..JobOptions::default()
        };
        Self::new(queue, spec.data, options)
    }

    /// Parses the stored representation.
    pub fn from_wire(payload: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(payload)
    }

    /// Serializes to the stored representation.
    pub fn to_wire(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Id, or an empty string before the job is saved.
    pub fn id_str(&self) -> &str {
        self.id.as_deref().unwrap_or("")
    }

    pub fn is_relay(&self) -> bool {
        matches!(self.options.runs, Some(Runs::Relay(_)))
    }

    /// Stages still to run (empty for single jobs).
    pub fn stages(&self) -> &[RelayStage] {
        match &self.options.runs {
            Some(Runs::Relay(stages)) => stages,
            _ => &[],
        }
    }

    pub(crate) fn stages_mut(&mut self) -> Option<&mut Vec<RelayStage>> {
        match &mut self.options.runs {
            Some(Runs::Relay(stages)) => Some(stages),
            _ => None,
        }
    }

    /// Handler referenced by the job itself: the first pending stage for a
    /// relay, the `runs` name for a single job. `None` means the queue's
    /// default handler applies.
    pub fn handler_name(&self) -> Option<&str> {
        match &self.options.runs {
            Some(Runs::Single(name)) => Some(name),
            Some(Runs::Relay(stages)) => stages.first().map(|s| s.runs.as_str()),
            None => None,
        }
    }

    /// Derives the id: `queue + separator + suffix`, where the suffix is the
    /// sha256 of `data` for unique jobs and a random token otherwise.
    pub fn compute_id(&self, separator: &str) -> String {
        let suffix = if self.options.unique {
            let canonical = serde_json::to_vec(&self.data).unwrap_or_default();
            hex::encode(Sha256::digest(&canonical))
        } else {
            Uuid::new_v4().simple().to_string()
        };
        format!("{}{}{}", self.queue, separator, suffix)
    }

    /// Rewrites every requested notification flag into its channel name.
    ///
    /// Idempotent: already activated channels are kept as they are. Returns
    /// every active channel. Requires an id.
    pub fn activate_notifications(&mut self) -> Result<Vec<String>, JobError> {
        let id = self.id.clone().ok_or(JobError::MissingId)?;
        let mut channels = Vec::new();

        for kind in EventKind::ALL {
            let flag = self.options.notify_mut(kind);
            match flag {
                Some(NotifyFlag::Flag(true)) => {
                    let channel = channel_name(&id, kind);
                    *flag = Some(NotifyFlag::Channel(channel.clone()));
                    channels.push(channel);
                }
                Some(NotifyFlag::Channel(channel)) => channels.push(channel.clone()),
                _ => {}
            }
        }

        Ok(channels)
    }

    /// How long a subscriber should wait for this job's terminal event.
    ///
    /// Covers every stage and every retry of the job's timeout, plus a grace
    /// period. Jobs stored without a timeout are budgeted at
    /// [`DEFAULT_TIMEOUT_MS`] per run.
    pub fn subscription_deadline(&self) -> Duration {
        let timeout = self.options.timeout.unwrap_or(DEFAULT_TIMEOUT_MS);
        let stages = self.stages().len().max(1) as u64;
        let attempts = u64::from(self.options.retries) + 1;
        Duration::from_millis(timeout.saturating_mul(stages).saturating_mul(attempts)) + SUBSCRIPTION_GRACE
    }
}

/// Result of a save.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SaveReceipt {
    pub id: String,
    pub status: JobStatus,
    /// False when the job was saved but its events will not be delivered.
    pub notifications_active: bool,
}

/// Persists jobs into their queue.
///
/// Shared by the dispatcher (new jobs) and the queues (next relay stages).
#[derive(Clone)]
pub struct JobWriter {
    store: Arc<dyn Store>,
    keyspace: Keyspace,
    separator: String,
}

impl std::fmt::Debug for JobWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobWriter")
            .field("keyspace", &self.keyspace)
            .field("separator", &self.separator)
            .finish_non_exhaustive()
    }
}

impl JobWriter {
    pub fn new(store: Arc<dyn Store>, keyspace: Keyspace, separator: impl Into<String>) -> Self {
        Self {
            store,
            keyspace,
            separator: separator.into(),
        }
    }

    pub fn keyspace(&self) -> &Keyspace {
        &self.keyspace
    }

    /// Saves `job`, subscribing for its events first when `callbacks` wants any.
    ///
    /// Outside of auto-save, saving an already saved job is a no-op.
    ///
    /// # Errors
    ///
    /// Returns `JobError::DuplicateJob` when a unique job with the same id
    /// exists; the job's status is then `Duplicate`. A failed subscription
    /// does not abort the save: the error goes to the failure callback (or
    /// the log) and the receipt reports `notifications_active == false`.
    pub async fn save(
        &self,
        job: &mut Job,
        callbacks: JobCallbacks,
        auto: bool,
    ) -> Result<SaveReceipt, JobError> {
        if !auto && job.saved {
            return Ok(SaveReceipt {
                id: job.id_str().to_string(),
                status: job.status,
                notifications_active: false,
            });
        }
        job.saved = true;

        let id = job.compute_id(&self.separator);
        job.id = Some(id);
        let channels = job.activate_notifications()?;

        let mut listener = None;
        if !channels.is_empty() && !callbacks.is_empty() {
            match self.store.subscribe(&channels).await {
                Ok(subscription) => {
                    listener = Some(events::listen(subscription, callbacks, job.subscription_deadline()));
                }
                Err(e) => {
                    let err = JobError::SubscriptionSetup(e.to_string());
                    match callbacks.on_failure {
                        Some(on_failure) => (*on_failure)(JobEvent::setup_failure(job, &err)),
                        None => warn!(job_id = %job.id_str(), error = %err, "Job notifications lost"),
                    }
                }
            }
        }

        // The listener shares the id of any job this one collided with.
        let id = match self.enqueue(job).await {
            Ok(id) => id,
            Err(e) => {
                if let Some(listener) = listener {
                    listener.abort();
                }
                return Err(e);
            }
        };
        Ok(SaveReceipt {
            id,
            status: job.status,
            notifications_active: listener.is_some(),
        })
    }

    /// Assigns an id if needed, activates notifications and enqueues the
    /// job without subscribing.
    pub async fn enqueue(&self, job: &mut Job) -> Result<String, JobError> {
        if job.id.is_none() {
            job.id = Some(job.compute_id(&self.separator));
        }
        job.activate_notifications()?;
        job.saved = true;

        let keys = self.keyspace.queue(&job.queue);
        let mut stored = job.clone();
        stored.status = JobStatus::Saved;
        let payload = stored.to_wire().map_err(crate::error::StoreError::from)?;

        debug!(queue = %job.queue, job_id = %job.id_str(), "Saving job");
        match self
            .store
            .enqueue(&keys, &payload, job.options.unique, job.id.as_deref())
            .await?
        {
            Some(id) => {
                job.id = Some(id.clone());
                job.status = JobStatus::Saved;
                Ok(id)
            }
            None => {
                job.status = JobStatus::Duplicate;
                Err(JobError::DuplicateJob(job.id_str().to_string()))
            }
        }
    }
}
