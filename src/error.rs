//! Error types for relayq operations.
//!
//! Defines the error types for each subsystem:
//! - Store access (Redis or in-memory)
//! - Job creation, saving and notification setup
//! - Configuration validation
//! - Queue lifecycle

use thiserror::Error;

/// Errors raised by a [`Store`](crate::store::Store) implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Subscriptions are disabled for this store (subscriber = false)")]
    SubscriberDisabled,

    #[error("Unexpected reply from store: {0}")]
    UnexpectedReply(String),

    #[error("Store connection closed")]
    Closed,
}

/// Errors that can occur while creating, saving or running a job.
#[derive(Debug, Error)]
pub enum JobError {
    #[error("ERR_DUPLICATE: Job {0} already exists, save has been aborted")]
    DuplicateJob(String),

    #[error("Error while subscribing to job events, the job is still queued but notifications will not be delivered: {0}")]
    SubscriptionSetup(String),

    #[error("Handler '{0}' was not found. Register it on the handler registry or configure a queue handler")]
    HandlerNotFound(String),

    #[error("Invalid progress value for job {0}: not a finite number")]
    InvalidProgress(String),

    #[error("A valid queue name must be supplied during job creation: '{0}'")]
    InvalidQueueName(String),

    #[error("Job has no id yet, it is assigned when the job is saved")]
    MissingId,

    #[error("Auto-save was dropped before the job was persisted")]
    AutoSaveDropped,

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

/// Errors detected while validating configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("startupDelay ({0}) must be an integer greater than or equal to zero")]
    InvalidStartupDelay(i64),

    #[error("The queue at position {0} requires a non-empty name")]
    MissingQueueName(usize),

    #[error("The queue '{name}' contains restricted characters ({separator}). Remove them or change 'queueSeparator'")]
    RestrictedQueueName { name: String, separator: String },

    #[error("The queue '{0}' is configured more than once")]
    DuplicateQueue(String),

    #[error("Invalid concurrency {concurrency} for queue '{queue}': must be at least 1")]
    InvalidConcurrency { queue: String, concurrency: usize },

    #[error("Invalid throttle for queue '{queue}': limit and seconds must both be at least 1")]
    InvalidThrottle { queue: String },

    #[error("stallInterval must be greater than zero")]
    InvalidStallInterval,

    #[error("queueSeparator must not be empty")]
    EmptySeparator,

    #[error("autoSave.maxJobs and autoSave.concurrency must be at least 1")]
    InvalidAutoSave,

    #[error("Queue '{queue}' uses handler '{handler}' which is not registered")]
    UnknownHandler { queue: String, handler: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors that can occur while controlling a queue.
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue '{0}' has been destroyed")]
    Destroyed(String),

    #[error("Queue '{0}' is disabled")]
    Disabled(String),

    #[error("Queue '{0}' is not configured")]
    UnknownQueue(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_error_display() {
        let err = JobError::DuplicateJob("email-abc".to_string());
        assert!(err.to_string().starts_with("ERR_DUPLICATE"));
        assert!(err.to_string().contains("email-abc"));
    }

    #[test]
    fn test_config_error_display() {
        let err = ConfigError::RestrictedQueueName {
            name: "a-b".to_string(),
            separator: "-".to_string(),
        };
        assert!(err.to_string().contains("a-b"));

        let err = ConfigError::InvalidStartupDelay(-5);
        assert!(err.to_string().contains("-5"));
    }

    #[test]
    fn test_store_error_converts_into_job_error() {
        let err: JobError = StoreError::Closed.into();
        assert!(matches!(err, JobError::Store(StoreError::Closed)));
    }
}
