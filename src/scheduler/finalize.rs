//! Completion planning for finished runs.
//!
//! [`plan`] turns a job and the outcome of its run into a [`Completion`]:
//! the new status, the atomic store commit, the events to publish, the next
//! relay stage to save and the lifecycle hooks to run. It performs no I/O,
//! so the single-job and relay state machines are tested here in isolation.

use serde_json::Value;

use super::events::{JobEvent, JobFailure};
use super::job::{EventKind, Job, JobOptions, JobStatus, Runs};
use crate::store::{Commit, CommitAction};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// The handler returned a value.
    Success(Value),
    /// The handler failed or timed out; retried while retries are left.
    Failure(JobFailure),
    /// The job cannot run at all (e.g. unknown handler); never retried.
    Fatal(JobFailure),
    /// The handler asked to run again; always requeued.
    RetryRequested(JobFailure),
}

/// Lifecycle hook to run once the completion is applied.
#[derive(Debug, Clone, PartialEq)]
pub enum HookCall {
    Succeeded(Value),
    Failed(JobFailure),
    Retrying(JobFailure),
    RelayStepSucceeded(Value),
    RelayStepCancelled,
}

/// Everything that must happen after a run.
#[derive(Debug, Clone)]
pub struct Completion {
    /// The job in its final state for this run.
    pub job: Job,
    pub commit: Commit,
    /// `(channel, event)` pairs to publish after the commit.
    pub publish: Vec<(String, JobEvent)>,
    /// Next relay stage, to be saved before the commit.
    pub next: Option<Job>,
    pub hooks: Vec<HookCall>,
}

impl Completion {
    pub fn status(&self) -> JobStatus {
        self.job.status
    }
}

/// Settings that shape a completion.
#[derive(Debug, Clone, Copy)]
pub struct PlanContext<'a> {
    /// Published as `job.worker`.
    pub worker: &'a str,
    /// Keep terminal jobs in `succeeded`/`failed` instead of deleting them.
    pub record_terminal: bool,
}

/// Plans the completion of `job`'s run.
///
/// # Errors
///
/// Fails only when the job cannot be serialized for the commit.
pub fn plan(job: Job, outcome: Outcome, ctx: PlanContext<'_>) -> Result<Completion, serde_json::Error> {
    let planner = Planner {
        ctx,
        job,
        publish: Vec::new(),
        hooks: Vec::new(),
    };

    if planner.job.is_relay() {
        planner.relay(outcome)
    } else {
        planner.single(outcome)
    }
}

struct Planner<'a> {
    ctx: PlanContext<'a>,
    job: Job,
    publish: Vec<(String, JobEvent)>,
    hooks: Vec<HookCall>,
}

impl Planner<'_> {
    fn single(mut self, outcome: Outcome) -> Result<Completion, serde_json::Error> {
        match outcome {
            Outcome::Success(result) => {
                self.job.status = JobStatus::Succeeded;
                self.emit(EventKind::Success, result.clone(), None);
                self.hooks.push(HookCall::Succeeded(result));
                self.terminal(None)
            }
            Outcome::RetryRequested(failure) => self.requested_retry(failure),
            Outcome::Failure(failure) if self.job.options.retries > 0 => self.retry(failure),
            Outcome::Failure(failure) | Outcome::Fatal(failure) => self.fail(failure),
        }
    }

    fn relay(mut self, outcome: Outcome) -> Result<Completion, serde_json::Error> {
        let result = match outcome {
            // The failed stage stays at the front and runs again.
            Outcome::RetryRequested(failure) => return self.requested_retry(failure),
            Outcome::Failure(failure) if self.job.options.retries > 0 => return self.retry(failure),
            Outcome::Failure(failure) | Outcome::Fatal(failure) => {
                self.pop_stage();
                return self.fail(failure);
            }
            Outcome::Success(result) => result,
        };

        self.pop_stage();
        self.job.status = JobStatus::Succeeded;

        if result == Value::Bool(false) {
            self.emit(EventKind::RelayStepCancelled, result, None);
            self.hooks.push(HookCall::RelayStepCancelled);
            return self.terminal(None);
        }

        if self.job.stages().is_empty() {
            self.emit(EventKind::Success, result.clone(), None);
            self.hooks.push(HookCall::Succeeded(result));
            return self.terminal(None);
        }

        self.emit(EventKind::RelayStepSuccess, result.clone(), None);
        self.hooks.push(HookCall::RelayStepSucceeded(result.clone()));
        let next = self.next_stage(result);
        self.terminal(Some(next))
    }

    fn retry(mut self, failure: JobFailure) -> Result<Completion, serde_json::Error> {
        self.job.options.retries -= 1;
        self.job.status = JobStatus::Retrying;
        self.emit(EventKind::Retry, Value::Null, Some(&failure));
        self.hooks.push(HookCall::Retrying(failure));

        let payload = self.job.to_wire()?;
        Ok(self.finish(CommitAction::Requeue { payload }, None))
    }

    /// Grants a retry when none is left, then retries.
    fn requested_retry(mut self, failure: JobFailure) -> Result<Completion, serde_json::Error> {
        self.job.options.retries = self.job.options.retries.max(1);
        self.retry(failure)
    }

    fn fail(mut self, failure: JobFailure) -> Result<Completion, serde_json::Error> {
        self.job.status = JobStatus::Failed;
        self.emit(EventKind::Failure, Value::Null, Some(&failure));
        self.hooks.push(HookCall::Failed(failure));
        self.terminal(None)
    }

    fn terminal(self, next: Option<Job>) -> Result<Completion, serde_json::Error> {
        let action = if self.ctx.record_terminal {
            CommitAction::Record {
                payload: self.job.to_wire()?,
                succeeded: self.job.status == JobStatus::Succeeded,
            }
        } else {
            CommitAction::Remove
        };
        Ok(self.finish(action, next))
    }

    fn finish(self, action: CommitAction, next: Option<Job>) -> Completion {
        Completion {
            commit: Commit {
                id: self.job.id_str().to_string(),
                action,
            },
            job: self.job,
            publish: self.publish,
            next,
            hooks: self.hooks,
        }
    }

    fn pop_stage(&mut self) {
        if let Some(stages) = self.job.stages_mut() {
            if !stages.is_empty() {
                stages.remove(0);
            }
        }
    }

    /// Fresh job for the next stage, carrying `result` as its data.
    ///
    /// Notification channels are already concrete, so every stage publishes
    /// to the channels of the relay's first job.
    fn next_stage(&self, result: Value) -> Job {
        let stages = self.job.stages().to_vec();
        let queue = stages
            .first()
            .and_then(|s| s.queue.clone())
            .unwrap_or_else(|| self.job.queue.clone());

        let options = JobOptions {
            runs: Some(Runs::Relay(stages)),
            ..self.job.options.clone()
        };
        Job::new(queue, result, options)
    }

    fn emit(&mut self, kind: EventKind, data: Value, failure: Option<&JobFailure>) {
        if let Some(channel) = self.job.options.channel(kind) {
            let event = JobEvent::new(&self.job, self.ctx.worker, data, failure);
            self.publish.push((channel.to_string(), event));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::job::{JobSpec, NotifyFlag, RelayStage};
    use serde_json::json;

    const CTX: PlanContext<'static> = PlanContext {
        worker: "w1",
        record_terminal: false,
    };

    fn saved(mut job: Job) -> Job {
        job.id = Some(format!("{}-1", job.queue));
        job.status = JobStatus::Saved;
        for kind in EventKind::ALL {
            *job.options.notify_mut(kind) = Some(NotifyFlag::Flag(true));
        }
        job.activate_notifications().expect("id set");
        job
    }

    fn channels(completion: &Completion) -> Vec<&str> {
        completion
            .publish
            .iter()
            .map(|(c, _)| c.rsplit(':').next().unwrap_or(""))
            .collect()
    }

    fn relay(stages: &[&str]) -> Job {
        saved(Job::from_spec(
            "images",
            JobSpec::relay(stages.iter().map(|s| RelayStage::new(*s)).collect()),
        ))
    }

    #[test]
    fn test_single_success() {
        let job = saved(Job::from_spec("q", JobSpec::single("a")));
        let completion = plan(job, Outcome::Success(json!(1)), CTX).expect("plan");

        assert_eq!(completion.status(), JobStatus::Succeeded);
        assert_eq!(completion.commit.action, CommitAction::Remove);
        assert_eq!(channels(&completion), vec!["success"]);
        assert_eq!(completion.hooks, vec![HookCall::Succeeded(json!(1))]);
        assert!(completion.next.is_none());
    }

    #[test]
    fn test_single_retry_then_terminal_failure() {
        let job = saved(Job::from_spec("q", JobSpec::single("a").with_retries(1)));
        let failure = JobFailure::timed_out("q-1", 10);

        let first = plan(job, Outcome::Failure(failure.clone()), CTX).expect("plan");
        assert_eq!(first.status(), JobStatus::Retrying);
        assert_eq!(first.job.options.retries, 0);
        assert_eq!(channels(&first), vec!["retry"]);
        let CommitAction::Requeue { payload } = &first.commit.action else {
            panic!("expected requeue, got {:?}", first.commit.action);
        };
        let stored = Job::from_wire(payload).expect("payload");
        assert_eq!(stored.status, JobStatus::Retrying);
        assert_eq!(stored.options.retries, 0);

        let second = plan(first.job, Outcome::Failure(failure), CTX).expect("plan");
        assert_eq!(second.status(), JobStatus::Failed);
        assert_eq!(second.commit.action, CommitAction::Remove);
        assert_eq!(channels(&second), vec!["failure"]);
        assert!(second.publish[0].1.is_timeout());
    }

    #[test]
    fn test_fatal_failure_ignores_retries() {
        let job = saved(Job::from_spec("q", JobSpec::single("missing").with_retries(5)));
        let failure = JobFailure::panicked("q-1");
        let completion = plan(job, Outcome::Fatal(failure), CTX).expect("plan");

        assert_eq!(completion.status(), JobStatus::Failed);
        assert_eq!(completion.job.options.retries, 5);
    }

    #[test]
    fn test_requested_retry_requeues_without_retries_left() {
        let job = saved(Job::from_spec("q", JobSpec::single("a")));
        let completion = plan(job, Outcome::RetryRequested(JobFailure::retry_requested("q-1")), CTX)
            .expect("plan");

        assert_eq!(completion.status(), JobStatus::Retrying);
        assert_eq!(completion.job.options.retries, 0);
        assert_eq!(channels(&completion), vec!["retry"]);
        assert!(matches!(completion.commit.action, CommitAction::Requeue { .. }));

        let job = saved(Job::from_spec("q", JobSpec::single("a").with_retries(3)));
        let completion = plan(job, Outcome::RetryRequested(JobFailure::retry_requested("q-1")), CTX)
            .expect("plan");
        assert_eq!(completion.job.options.retries, 2);
    }

    #[test]
    fn test_relay_requested_retry_keeps_stage() {
        let job = relay(&["a", "b"]);
        let completion = plan(job, Outcome::RetryRequested(JobFailure::retry_requested("images-1")), CTX)
            .expect("plan");

        assert_eq!(completion.status(), JobStatus::Retrying);
        assert_eq!(completion.job.handler_name(), Some("a"));
        assert!(completion.next.is_none());
    }

    #[test]
    fn test_relay_continues_to_next_stage() {
        let mut job = relay(&["a", "b", "c"]);
        if let Some(stages) = job.stages_mut() {
            stages[1].queue = Some("uploads".to_string());
        }

        let completion = plan(job, Outcome::Success(json!({"count": 1})), CTX).expect("plan");
        assert_eq!(completion.status(), JobStatus::Succeeded);
        assert_eq!(channels(&completion), vec!["relayStepSuccess"]);
        assert_eq!(completion.hooks, vec![HookCall::RelayStepSucceeded(json!({"count": 1}))]);

        let next = completion.next.expect("next stage");
        assert_eq!(next.queue, "uploads");
        assert_eq!(next.data, json!({"count": 1}));
        assert_eq!(next.handler_name(), Some("b"));
        assert_eq!(next.stages().len(), 2);
        assert!(next.id.is_none());
        // Channels stay those of the first stage.
        assert_eq!(next.options.channel(EventKind::Success), Some("job:images-1:success"));
    }

    #[test]
    fn test_relay_stage_inherits_queue() {
        let job = relay(&["a", "b"]);
        let completion = plan(job, Outcome::Success(json!(null)), CTX).expect("plan");
        assert_eq!(completion.next.expect("next").queue, "images");
    }

    #[test]
    fn test_relay_last_stage_succeeds() {
        let job = relay(&["only"]);
        let completion = plan(job, Outcome::Success(json!("done")), CTX).expect("plan");

        assert_eq!(completion.status(), JobStatus::Succeeded);
        assert!(completion.next.is_none());
        assert_eq!(channels(&completion), vec!["success"]);
        assert_eq!(completion.hooks, vec![HookCall::Succeeded(json!("done"))]);
    }

    #[test]
    fn test_relay_cancel_publishes_only_cancelled() {
        let job = relay(&["a", "b", "c"]);
        let completion = plan(job, Outcome::Success(Value::Bool(false)), CTX).expect("plan");

        assert_eq!(completion.status(), JobStatus::Succeeded);
        assert!(completion.next.is_none());
        assert_eq!(channels(&completion), vec!["relayStepCancelled"]);
        assert_eq!(completion.hooks, vec![HookCall::RelayStepCancelled]);
    }

    #[test]
    fn test_relay_failure_with_retries_keeps_stage() {
        let job = saved(Job::from_spec(
            "images",
            JobSpec::relay(vec![RelayStage::new("a"), RelayStage::new("b")]).with_retries(1),
        ));
        let failure = JobFailure::panicked("images-1");
        let completion = plan(job, Outcome::Failure(failure.clone()), CTX).expect("plan");

        assert_eq!(completion.status(), JobStatus::Retrying);
        assert_eq!(completion.job.handler_name(), Some("a"));
        assert!(completion.next.is_none());

        let completion = plan(completion.job, Outcome::Failure(failure), CTX).expect("plan");
        assert_eq!(completion.status(), JobStatus::Failed);
        assert_eq!(channels(&completion), vec!["failure"]);
        assert!(completion.next.is_none());
    }

    #[test]
    fn test_record_terminal_keeps_payload() {
        let ctx = PlanContext {
            worker: "w1",
            record_terminal: true,
        };
        let job = saved(Job::from_spec("q", JobSpec::single("a")));
        let completion = plan(job, Outcome::Fatal(JobFailure::panicked("q-1")), ctx).expect("plan");

        match completion.commit.action {
            CommitAction::Record { succeeded, payload } => {
                assert!(!succeeded);
                assert_eq!(Job::from_wire(&payload).expect("job").status, JobStatus::Failed);
            }
            other => panic!("expected record, got {:?}", other),
        }
    }

    #[test]
    fn test_no_publish_without_channels() {
        let mut job = Job::from_spec("q", JobSpec::single("a"));
        job.id = Some("q-1".to_string());
        let completion = plan(job, Outcome::Success(json!(1)), CTX).expect("plan");
        assert!(completion.publish.is_empty());
    }
}
