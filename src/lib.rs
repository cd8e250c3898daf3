//! relayq: distributed job queue on Redis.
//!
//! Producers enqueue single jobs or multi-stage relay chains; workers fetch
//! them from named queues, run registered handlers, retry failures, recover
//! jobs from crashed workers and publish success, failure, retry and
//! progress events.

pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod store;

// Re-export commonly used types
pub use config::JobConfig;
pub use error::{ConfigError, JobError, QueueError, StoreError};
pub use scheduler::{Callbacks, Dispatcher, HandlerRegistry, JobContext, JobSpec};
