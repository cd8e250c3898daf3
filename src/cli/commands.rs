//! CLI command definitions for relayq.
//!
//! `worker` runs the configured queues; the other commands administer a
//! single queue directly against Redis.

use crate::config::{JobConfig, QueueConfig};
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{Callbacks, Dispatcher, HandlerRegistry, JobContext, JobEvent, JobSpec, Queue};
use crate::store::{RedisStore, Store};
use anyhow::Context;
use clap::Parser;
use serde_json::{json, Value};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{info, warn};

/// Time given to running jobs when a worker shuts down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

/// Distributed job and relay-chain queue on Redis.
#[derive(Parser)]
#[command(name = "relayq")]
#[command(about = "Run and administer relayq job queues")]
#[command(version)]
#[command(
    long_about = "relayq runs job queues on Redis: workers fetch jobs, run named handlers, retry failures and recover jobs from crashed workers.\n\nExample usage:\n  relayq worker --config queues.yaml\n  relayq enqueue emails --handler echo --data '{\"to\":\"a@b.c\"}' --wait"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,

    /// Redis URL; overrides `redisUrl` from the config file.
    #[arg(long, env = "REDIS_URL", global = true)]
    pub redis_url: Option<String>,

    /// YAML configuration file.
    #[arg(short, long, global = true)]
    pub config: Option<String>,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the configured queues until interrupted.
    ///
    /// Registers the built-in `echo` and `sleep` handlers.
    Worker(WorkerArgs),

    /// Create a job.
    Enqueue(EnqueueArgs),

    /// Show a queue's counts.
    Status(StatusArgs),

    /// Remove a job from a queue.
    Remove(RemoveArgs),

    /// Move jobs of dead workers back to waiting.
    #[command(name = "check-stalled")]
    CheckStalled(CheckStalledArgs),

    /// Delete every key of a queue.
    Destroy(DestroyArgs),
}

/// Arguments for `relayq worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Print Prometheus metrics on shutdown.
    #[arg(long)]
    pub print_metrics: bool,
}

/// Arguments for `relayq enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    /// Target queue.
    pub queue: String,

    /// Handler name; the queue's default handler is used when omitted.
    #[arg(long)]
    pub handler: Option<String>,

    /// Relay stages as `handler` or `handler@queue`, comma-separated.
    #[arg(long, conflicts_with = "handler")]
    pub relay: Option<String>,

    /// JSON payload.
    #[arg(short, long, default_value = "null")]
    pub data: String,

    #[arg(short, long, default_value = "0")]
    pub retries: u32,

    /// Timeout in milliseconds.
    #[arg(short, long)]
    pub timeout: Option<u64>,

    /// Derive the id from the payload and reject duplicates.
    #[arg(long)]
    pub unique: bool,

    /// Wait for the job's success or failure event.
    #[arg(short, long)]
    pub wait: bool,
}

/// Arguments for `relayq status`.
#[derive(Parser, Debug)]
pub struct StatusArgs {
    pub queue: String,

    /// Output as JSON.
    #[arg(long)]
    pub json: bool,
}

/// Arguments for `relayq remove`.
#[derive(Parser, Debug)]
pub struct RemoveArgs {
    pub queue: String,
    pub id: String,
}

/// Arguments for `relayq check-stalled`.
#[derive(Parser, Debug)]
pub struct CheckStalledArgs {
    pub queue: String,
}

/// Arguments for `relayq destroy`.
#[derive(Parser, Debug)]
pub struct DestroyArgs {
    pub queue: String,

    /// Confirm deletion.
    #[arg(long)]
    pub yes: bool,
}

/// Parse CLI arguments without running any command.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    let mut config = match &cli.config {
        Some(path) => load_config(Path::new(path))?,
        None => JobConfig::default(),
    };
    if let Some(url) = cli.redis_url {
        config.redis_url = url;
    }

    match cli.command {
        Commands::Worker(args) => run_worker_command(config, args).await,
        Commands::Enqueue(args) => run_enqueue_command(config, args).await,
        Commands::Status(args) => run_status_command(config, args).await,
        Commands::Remove(args) => run_remove_command(config, args).await,
        Commands::CheckStalled(args) => run_check_stalled_command(config, args).await,
        Commands::Destroy(args) => run_destroy_command(config, args).await,
    }
}

fn load_config(path: &Path) -> anyhow::Result<JobConfig> {
    JobConfig::from_yaml_file(path)
        .with_context(|| format!("Failed to load config from {}", path.display()))
}

async fn connect(config: &JobConfig) -> anyhow::Result<Arc<dyn Store>> {
    let store = RedisStore::connect(&config.redis_url)
        .await
        .with_context(|| format!("Failed to connect to Redis at {}", config.redis_url))?
        .with_subscriber(config.subscriber);
    Ok(Arc::new(store))
}

/// Handlers available to CLI workers.
pub fn builtin_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register_sync("echo", |ctx: JobContext| Ok(ctx.data().clone()));
    handlers.register_fn("sleep", sleep_handler);
    handlers
}

/// Sleeps for `data.ms` milliseconds in ten steps, reporting progress.
async fn sleep_handler(ctx: JobContext) -> anyhow::Result<Value> {
    let total = ctx.data().get("ms").and_then(Value::as_u64).unwrap_or(1000);
    let step = Duration::from_millis(total / 10);

    for done in 1..=10u32 {
        tokio::time::sleep(step).await;
        ctx.set_progress(f64::from(done) * 10.0, None).await?;
    }
    Ok(ctx.data().clone())
}

async fn run_worker_command(config: JobConfig, args: WorkerArgs) -> anyhow::Result<()> {
    if config.queues.is_empty() {
        anyhow::bail!("No queues configured; pass --config with a `queues` list");
    }
    if let Err(e) = init_metrics() {
        warn!(error = %e, "Failed to initialize metrics");
    }

    let store = connect(&config).await?;
    let dispatcher = Dispatcher::new(&config, store, builtin_handlers(), Callbacks::new())?;
    dispatcher.start().await?;

    info!(worker_id = %dispatcher.worker_id(), "Worker running, press Ctrl-C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    info!("Shutting down");
    dispatcher.shutdown(SHUTDOWN_GRACE).await;

    for stats in dispatcher.queue_stats() {
        info!(
            queue = %stats.name,
            succeeded = stats.succeeded,
            failed = stats.failed,
            retried = stats.retried,
            average_ms = stats.average_duration.as_millis() as u64,
            "Queue summary"
        );
    }
    if args.print_metrics {
        print!("{}", export_metrics());
    }
    Ok(())
}

fn job_spec(args: &EnqueueArgs) -> anyhow::Result<JobSpec> {
    let data: Value = serde_json::from_str(&args.data).context("--data is not valid JSON")?;

    let mut spec = match (&args.handler, &args.relay) {
        (Some(handler), _) => JobSpec::single(handler.as_str()),
        (None, Some(relay)) => {
            let stages = relay
                .split(',')
                .map(str::trim)
                .filter(|stage| !stage.is_empty())
                .map(|stage| match stage.split_once('@') {
                    Some((runs, queue)) => crate::scheduler::RelayStage::new(runs).on_queue(queue),
                    None => crate::scheduler::RelayStage::new(stage),
                })
                .collect::<Vec<_>>();
            if stages.is_empty() {
                anyhow::bail!("--relay needs at least one stage");
            }
            JobSpec::relay(stages)
        }
        (None, None) => JobSpec::new(),
    };

    spec = spec.with_data(data).with_retries(args.retries).with_unique(args.unique);
    if let Some(ms) = args.timeout {
        spec = spec.with_timeout(ms);
    }
    Ok(spec)
}

async fn run_enqueue_command(config: JobConfig, args: EnqueueArgs) -> anyhow::Result<()> {
    let spec = job_spec(&args)?;
    let store = connect(&config).await?;
    let dispatcher = Dispatcher::new(&config, store, HandlerRegistry::new(), Callbacks::new())?;

    let builder = dispatcher.create(&args.queue, spec)?;
    if !args.wait {
        let receipt = builder.submit().await?;
        println!("{}", receipt.id);
        return Ok(());
    }

    let (tx, rx) = oneshot::channel::<JobEvent>();
    let tx = Arc::new(Mutex::new(Some(tx)));
    let deliver = move |event: JobEvent| {
        let sender = tx
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        if let Some(sender) = sender {
            let _ = sender.send(event);
        }
    };

    let receipt = builder
        .on_success(deliver.clone())
        .on_failure(deliver.clone())
        .on_relay_step_cancelled(deliver)
        .on_progress(|event: JobEvent| info!(job_id = %event.job.id, progress = event.job.progress, "Progress"))
        .submit()
        .await?;
    println!("{}", receipt.id);

    if !receipt.notifications_active {
        anyhow::bail!("Job {} was queued but its events cannot be received", receipt.id);
    }

    let event = rx.await.context("Job events ended before the job finished")?;
    match &event.error {
        Some(error) => anyhow::bail!("Job {} failed: {}", event.job.id, error.message),
        None => {
            println!("{}", serde_json::to_string_pretty(&event.job.data)?);
            Ok(())
        }
    }
}

/// Builds a queue handle for administration; nothing is started.
fn admin_queue(config: &JobConfig, store: Arc<dyn Store>, name: &str) -> anyhow::Result<Queue> {
    let mut config = config.clone();
    config.queues.retain(|entry| entry.name() == name);
    if config.queues.is_empty() {
        config = config.with_queue(QueueConfig::new(name));
    }
    // Handlers are irrelevant for administration.
    for entry in &mut config.queues {
        entry.clear_handler();
    }

    let dispatcher = Dispatcher::new(&config, store, HandlerRegistry::new(), Callbacks::new())?;
    dispatcher
        .queue(name)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("Queue '{}' is not configured", name))
}

async fn run_status_command(config: JobConfig, args: StatusArgs) -> anyhow::Result<()> {
    let store = connect(&config).await?;
    let queue = admin_queue(&config, store, &args.queue)?;
    let status = queue.status().await?;

    if args.json {
        let output = json!({ "queue": queue.name(), "status": status });
        println!("{}", serde_json::to_string_pretty(&output)?);
    } else {
        println!("Queue:     {}", queue.name());
        println!("Waiting:   {}", status.waiting);
        println!("Active:    {}", status.active);
        println!("Stalling:  {}", status.stalling);
        println!("Succeeded: {}", status.succeeded);
        println!("Failed:    {}", status.failed);
    }
    Ok(())
}

async fn run_remove_command(config: JobConfig, args: RemoveArgs) -> anyhow::Result<()> {
    let store = connect(&config).await?;
    let queue = admin_queue(&config, store, &args.queue)?;
    queue.remove_job(&args.id).await?;
    println!("Removed {}", args.id);
    Ok(())
}

async fn run_check_stalled_command(config: JobConfig, args: CheckStalledArgs) -> anyhow::Result<()> {
    let store = connect(&config).await?;
    let queue = admin_queue(&config, store, &args.queue)?;
    let recovered = queue.check_stalled().await?;

    println!("Recovered {} job(s)", recovered.len());
    for id in recovered {
        println!("  {}", id);
    }
    Ok(())
}

async fn run_destroy_command(config: JobConfig, args: DestroyArgs) -> anyhow::Result<()> {
    if !args.yes {
        anyhow::bail!("Refusing to destroy '{}' without --yes", args.queue);
    }
    let store = connect(&config).await?;
    let queue = admin_queue(&config, store, &args.queue)?;
    queue.destroy().await?;
    println!("Destroyed {}", args.queue);
    Ok(())
}
