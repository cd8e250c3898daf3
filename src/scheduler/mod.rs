//! Distributed job processing on top of a [`Store`](crate::store::Store).
//!
//! - **Dispatcher**: builds queues from configuration, creates jobs, batches saves
//! - **Queue**: fetch/execute/finalize loop, heartbeats, stall recovery, throttle
//! - **Job**: single or relay job, its options, id and notification channels
//! - **HandlerRegistry**: explicit table of named job handlers
//!
//! # Architecture
//!
//! ```text
//!     ┌──────────────┐                 ┌──────────────┐
//!     │   Producer   │── subscribe ──▶ │   Pub/Sub    │
//!     │ (Dispatcher) │                 └──────▲───────┘
//!     └──────┬───────┘                        │ job:{id}:{event}
//!            │ enqueue                        │
//!     ┌──────▼───────┐  BRPOPLPUSH     ┌──────┴───────┐
//!     │   waiting    │ ──────────────▶ │    active    │
//!     └──────▲───────┘                 └──────┬───────┘
//!            │ retry / next stage /           │
//!            │ stall recovery          ┌──────▼───────┐
//!            └──────────────────────── │ Queue slots  │
//!                                      └──────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use relayq::config::{JobConfig, QueueConfig};
//! use relayq::scheduler::{Callbacks, Dispatcher, HandlerRegistry, JobSpec};
//! use relayq::store::RedisStore;
//! use std::sync::Arc;
//!
//! let mut handlers = HandlerRegistry::new();
//! handlers.register_fn("send", |ctx| async move {
//!     ctx.set_progress(50.0, None).await?;
//!     Ok(ctx.data().clone())
//! });
//!
//! let config = JobConfig::default().with_queue(QueueConfig::new("emails").with_handler("send"));
//! let store = Arc::new(RedisStore::connect(&config.redis_url).await?);
//! let dispatcher = Dispatcher::new(&config, store, handlers, Callbacks::new())?;
//! dispatcher.start().await?;
//!
//! let receipt = dispatcher
//!     .create("emails", JobSpec::new().with_data(serde_json::json!({ "to": "a@b.c" })))?
//!     .retries(2)
//!     .on_success(|event| println!("sent {}", event.job.id))
//!     .await?;
//! ```

pub mod dispatcher;
pub mod events;
pub mod finalize;
pub mod handler;
pub mod job;
pub mod queue;

pub use dispatcher::{Dispatcher, JobBuilder, PendingJob};
pub use events::{Callbacks, JobCallbacks, JobEvent, JobFailure};
pub use handler::{HandlerRegistry, JobContext, JobHandler};
pub use job::{EventKind, Job, JobOptions, JobSpec, JobStatus, RelayStage, Runs, SaveReceipt};
pub use queue::{Queue, QueueState, QueueStats};
