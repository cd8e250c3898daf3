//! Configuration for queues and the dispatcher.
//!
//! [`JobConfig`] is what users write (YAML or code); every field has a
//! default. [`JobConfig::validate`] is the single fail-fast check that turns
//! it into [`Settings`], the resolved form the rest of the crate runs on.
//!
//! ```yaml
//! keyPrefix: job
//! startupDelay: 0
//! queues:
//!   - emails
//!   - name: images
//!     handler: images.resize
//!     concurrency: 4
//!     throttle: { limit: 10, seconds: 1 }
//! ```

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::scheduler::HandlerRegistry;
use crate::store::Keyspace;

const DEFAULT_KEY_PREFIX: &str = "job";
const DEFAULT_STARTUP_DELAY_MS: i64 = 750;
const DEFAULT_STALL_INTERVAL_MS: u64 = 15_000;
const DEFAULT_SEPARATOR: &str = "-";
const DEFAULT_AUTO_SAVE_MAX_JOBS: usize = 1000;
const DEFAULT_AUTO_SAVE_CONCURRENCY: usize = 25;
const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";

/// Fixed-window completion rate limit of a queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Jobs allowed per window.
    pub limit: u32,
    /// Window length in seconds.
    pub seconds: u32,
}

/// Auto-save batching.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AutoSaveConfig {
    /// Buffer size that triggers an immediate flush.
    pub max_jobs: usize,
    /// Saves in flight during a flush.
    pub concurrency: usize,
}

impl Default for AutoSaveConfig {
    fn default() -> Self {
        Self {
            max_jobs: DEFAULT_AUTO_SAVE_MAX_JOBS,
            concurrency: DEFAULT_AUTO_SAVE_CONCURRENCY,
        }
    }
}

/// Per-queue configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueConfig {
    #[serde(default)]
    pub name: String,
    /// Handler for jobs that do not name one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handler: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub concurrency: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub throttle: Option<ThrottleConfig>,
    #[serde(default)]
    pub no_bind: bool,
    /// Overrides the global stall interval (ms).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stall_interval: Option<u64>,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_handler(mut self, handler: impl Into<String>) -> Self {
        self.handler = Some(handler.into());
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_throttle(mut self, limit: u32, seconds: u32) -> Self {
        self.throttle = Some(ThrottleConfig { limit, seconds });
        self
    }

    pub fn with_stall_interval(mut self, ms: u64) -> Self {
        self.stall_interval = Some(ms);
        self
    }
}

/// A queue entry: a bare name or a full configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum QueueEntry {
    Name(String),
    Config(QueueConfig),
}

impl QueueEntry {
    pub fn name(&self) -> &str {
        match self {
            Self::Name(name) => name,
            Self::Config(config) => &config.name,
        }
    }

    /// Drops the default handler, keeping every other setting.
    pub fn clear_handler(&mut self) {
        if let Self::Config(config) = self {
            config.handler = None;
        }
    }

    fn into_config(self) -> QueueConfig {
        match self {
            Self::Name(name) => QueueConfig::new(name),
            Self::Config(config) => config,
        }
    }
}

impl From<&str> for QueueEntry {
    fn from(name: &str) -> Self {
        Self::Name(name.to_string())
    }
}

impl From<QueueConfig> for QueueEntry {
    fn from(config: QueueConfig) -> Self {
        Self::Config(config)
    }
}

/// User-facing configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct JobConfig {
    pub queues: Vec<QueueEntry>,
    /// Disabled queues never fetch; producers can still create jobs.
    pub enabled: bool,
    pub key_prefix: String,
    /// Delay (ms) between `Dispatcher::start` and the queues starting.
    pub startup_delay: i64,
    /// Stall check interval (ms); heartbeats run every third of it.
    pub stall_interval: u64,
    /// Separates the queue name from the id suffix. Queue names must not
    /// contain it.
    pub queue_separator: String,
    pub auto_save: AutoSaveConfig,
    /// Silences the default log of unhandled job failures.
    pub mute: bool,
    /// Wrap queue names in hash tags for Redis Cluster.
    pub clustered: bool,
    /// Keep terminal jobs in the `succeeded`/`failed` sets.
    pub record_terminal: bool,
    pub redis_url: String,
    /// Whether this process may subscribe to job events.
    pub subscriber: bool,
}

impl Default for JobConfig {
    fn default() -> Self {
        Self {
            queues: Vec::new(),
            enabled: true,
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            startup_delay: DEFAULT_STARTUP_DELAY_MS,
            stall_interval: DEFAULT_STALL_INTERVAL_MS,
            queue_separator: DEFAULT_SEPARATOR.to_string(),
            auto_save: AutoSaveConfig::default(),
            mute: false,
            clustered: false,
            record_terminal: false,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            subscriber: true,
        }
    }
}

impl JobConfig {
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Adds a queue.
    pub fn with_queue(mut self, queue: impl Into<QueueEntry>) -> Self {
        self.queues.push(queue.into());
        self
    }

    /// Applies defaults and rejects invalid combinations.
    ///
    /// # Errors
    ///
    /// Returns the first problem found: a negative startup delay, an empty
    /// separator, a zero stall interval or auto-save setting, or a queue
    /// with a missing, duplicate or restricted name, zero concurrency, an
    /// empty throttle window or an unregistered handler.
    pub fn validate(&self, handlers: &HandlerRegistry) -> Result<Settings, ConfigError> {
        if self.startup_delay < 0 {
            return Err(ConfigError::InvalidStartupDelay(self.startup_delay));
        }
        if self.queue_separator.is_empty() {
            return Err(ConfigError::EmptySeparator);
        }
        if self.stall_interval == 0 {
            return Err(ConfigError::InvalidStallInterval);
        }
        if self.auto_save.max_jobs == 0 || self.auto_save.concurrency == 0 {
            return Err(ConfigError::InvalidAutoSave);
        }

        let mut seen = HashSet::new();
        let mut queues = Vec::with_capacity(self.queues.len());

        for (position, entry) in self.queues.iter().enumerate() {
            let queue = entry.clone().into_config();

            if queue.name.trim().is_empty() {
                return Err(ConfigError::MissingQueueName(position));
            }
            if queue.name.contains(&self.queue_separator) {
                return Err(ConfigError::RestrictedQueueName {
                    name: queue.name,
                    separator: self.queue_separator.clone(),
                });
            }
            if !seen.insert(queue.name.clone()) {
                return Err(ConfigError::DuplicateQueue(queue.name));
            }

            let concurrency = queue.concurrency.unwrap_or(1);
            if concurrency == 0 {
                return Err(ConfigError::InvalidConcurrency {
                    queue: queue.name,
                    concurrency,
                });
            }
            if let Some(throttle) = queue.throttle {
                if throttle.limit == 0 || throttle.seconds == 0 {
                    return Err(ConfigError::InvalidThrottle { queue: queue.name });
                }
            }
            let stall_interval = queue.stall_interval.unwrap_or(self.stall_interval);
            if stall_interval == 0 {
                return Err(ConfigError::InvalidStallInterval);
            }
            if let Some(handler) = &queue.handler {
                if !handlers.contains(handler) {
                    return Err(ConfigError::UnknownHandler {
                        queue: queue.name,
                        handler: handler.clone(),
                    });
                }
            }

            queues.push(QueueSettings {
                name: queue.name,
                handler: queue.handler,
                concurrency,
                throttle: queue.throttle,
                no_bind: queue.no_bind,
                stall_interval: Duration::from_millis(stall_interval),
                enabled: self.enabled,
                record_terminal: self.record_terminal,
                mute: self.mute,
            });
        }

        Ok(Settings {
            enabled: self.enabled,
            keyspace: Keyspace::new(self.key_prefix.clone(), self.clustered),
            startup_delay: Duration::from_millis(self.startup_delay as u64),
            separator: self.queue_separator.clone(),
            auto_save: self.auto_save,
            mute: self.mute,
            record_terminal: self.record_terminal,
            redis_url: self.redis_url.clone(),
            subscriber: self.subscriber,
            queues,
        })
    }
}

/// Resolved settings of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSettings {
    pub name: String,
    pub handler: Option<String>,
    pub concurrency: usize,
    pub throttle: Option<ThrottleConfig>,
    pub no_bind: bool,
    pub stall_interval: Duration,
    pub enabled: bool,
    pub record_terminal: bool,
    pub mute: bool,
}

impl QueueSettings {
    /// Settings with every default applied.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            handler: None,
            concurrency: 1,
            throttle: None,
            no_bind: false,
            stall_interval: Duration::from_millis(DEFAULT_STALL_INTERVAL_MS),
            enabled: true,
            record_terminal: false,
            mute: false,
        }
    }

    /// Number of fetch slots: one for throttled queues, `concurrency` otherwise.
    pub fn fetch_slots(&self) -> usize {
        if self.throttle.is_some() {
            1
        } else {
            self.concurrency
        }
    }
}

/// Validated configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub enabled: bool,
    pub keyspace: Keyspace,
    pub startup_delay: Duration,
    pub separator: String,
    pub auto_save: AutoSaveConfig,
    pub mute: bool,
    pub record_terminal: bool,
    pub redis_url: String,
    pub subscriber: bool,
    pub queues: Vec<QueueSettings>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn handlers() -> HandlerRegistry {
        let mut registry = HandlerRegistry::new();
        registry.register_sync("echo", |ctx| Ok(ctx.data().clone()));
        registry
    }

    #[test]
    fn test_defaults() {
        let config = JobConfig::default();
        assert!(config.enabled);
        assert_eq!(config.key_prefix, "job");
        assert_eq!(config.startup_delay, 750);
        assert_eq!(config.stall_interval, 15_000);
        assert_eq!(config.queue_separator, "-");
        assert_eq!(config.auto_save.max_jobs, 1000);
        assert_eq!(config.auto_save.concurrency, 25);
        assert!(config.subscriber);
    }

    #[test]
    fn test_parse_yaml_queue_forms() {
        let yaml = r#"
keyPrefix: jobs
startupDelay: 0
queues:
  - emails
  - name: images
    handler: echo
    concurrency: 4
    throttle: { limit: 2, seconds: 1 }
    noBind: true
autoSave:
  maxJobs: 10
"#;
        let config = JobConfig::from_yaml_str(yaml).expect("parse");
        assert_eq!(config.key_prefix, "jobs");
        assert_eq!(config.auto_save.max_jobs, 10);
        assert_eq!(config.auto_save.concurrency, 25);

        let settings = config.validate(&handlers()).expect("valid");
        assert_eq!(settings.queues.len(), 2);
        assert_eq!(settings.queues[0].name, "emails");
        assert_eq!(settings.queues[0].concurrency, 1);
        let images = &settings.queues[1];
        assert_eq!(images.handler.as_deref(), Some("echo"));
        assert_eq!(images.concurrency, 4);
        assert_eq!(images.fetch_slots(), 1);
        assert!(images.no_bind);
        assert_eq!(settings.startup_delay, Duration::ZERO);
    }

    #[test]
    fn test_load_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "queues: [a, b]\nstallInterval: 3000").expect("write");

        let config = JobConfig::from_yaml_file(file.path()).expect("load");
        let settings = config.validate(&HandlerRegistry::new()).expect("valid");
        assert_eq!(settings.queues[1].stall_interval, Duration::from_secs(3));
    }

    #[test]
    fn test_missing_file() {
        let err = JobConfig::from_yaml_file("/nonexistent/relayq.yaml").expect_err("missing");
        assert!(matches!(err, ConfigError::Io(_)));
    }

    #[test]
    fn test_rejects_negative_startup_delay() {
        let config = JobConfig {
            startup_delay: -1,
            ..JobConfig::default()
        };
        assert!(matches!(
            config.validate(&handlers()),
            Err(ConfigError::InvalidStartupDelay(-1))
        ));
    }

    #[test]
    fn test_rejects_separator_in_queue_name() {
        let config = JobConfig::default().with_queue("bad-name");
        assert!(matches!(
            config.validate(&handlers()),
            Err(ConfigError::RestrictedQueueName { .. })
        ));

        let config = JobConfig {
            queue_separator: ":".to_string(),
            ..JobConfig::default()
        }
        .with_queue("fine-name");
        assert!(config.validate(&handlers()).is_ok());
    }

    #[test]
    fn test_rejects_bad_queues() {
        let empty = JobConfig::default().with_queue("ok").with_queue("");
        assert!(matches!(
            empty.validate(&handlers()),
            Err(ConfigError::MissingQueueName(1))
        ));

        let duplicate = JobConfig::default().with_queue("a").with_queue("a");
        assert!(matches!(
            duplicate.validate(&handlers()),
            Err(ConfigError::DuplicateQueue(_))
        ));

        let zero = JobConfig::default().with_queue(QueueConfig::new("a").with_concurrency(0));
        assert!(matches!(
            zero.validate(&handlers()),
            Err(ConfigError::InvalidConcurrency { .. })
        ));

        let throttle = JobConfig::default().with_queue(QueueConfig::new("a").with_throttle(0, 1));
        assert!(matches!(
            throttle.validate(&handlers()),
            Err(ConfigError::InvalidThrottle { .. })
        ));

        let unknown = JobConfig::default().with_queue(QueueConfig::new("a").with_handler("nope"));
        assert!(matches!(
            unknown.validate(&handlers()),
            Err(ConfigError::UnknownHandler { .. })
        ));
    }

    #[test]
    fn test_clustered_keyspace() {
        let config = JobConfig {
            clustered: true,
            ..JobConfig::default()
        };
        let settings = config.validate(&handlers()).expect("valid");
        assert_eq!(settings.keyspace.key("q", "jobs"), "job:{q}:jobs");
    }
}
