//! # Queue Worker CLI
//!
//! Command-line interface for the queue worker.
//!
//! This module provides CLI commands for:
//! - Running a worker against a named connection
//! - Pushing jobs onto a queue
//! - Registering push subscribers with push-capable backends
//!
//! Applications that define their own job handlers embed the CLI through
//! [`run_cli_with`]; the stock binary runs with an empty handler registry.

use clap::{Parser, Subcommand};
use queue_worker_core::{
    FailedJobStore, FileFailedJobStore, HandlerRegistry, HandlerResolver, MemoryFailedJobStore,
    QueueConnection, QueueError, QueueManager, QueueSettings, ShutdownSignal, SubscribeOptions,
    Worker, WorkerOptions,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, error, info};

// ============================================================================
// CLI Structure
// ============================================================================

/// Queue worker CLI - run jobs from any configured queue backend
#[derive(Parser, Debug)]
#[command(name = "queue-worker")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Run jobs from in-memory, SQS, RabbitMQ and IronMQ queues")]
pub struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "QUEUE_WORKER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level
    #[arg(short, long, default_value = "info")]
    pub log_level: String,

    /// Enable JSON logging
    #[arg(long)]
    pub json_logs: bool,

    /// Subcommand to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Register a push subscriber URL for a queue
    Subscribe {
        /// Queue to subscribe to
        queue: String,

        /// URL the push service delivers to
        url: String,

        /// Delivery attempts before a message moves to the error queue
        #[arg(long, default_value_t = 3)]
        retries: u32,

        /// Queue receiving messages the subscriber kept rejecting
        #[arg(long)]
        errqueue: Option<String>,

        /// Extra queue settings as a JSON object
        #[arg(long)]
        advanced: Option<String>,

        /// Connection name, defaults to the configured default
        #[arg(short, long)]
        connection: Option<String>,
    },

    /// Process jobs from a queue
    Work {
        /// Connection name, defaults to the configured default
        connection: Option<String>,

        /// Queue to pop from, defaults to the connection's queue
        #[arg(short, long)]
        queue: Option<String>,

        /// Seconds before a failed job becomes visible again
        #[arg(long, default_value_t = 0)]
        delay: u32,

        /// Seconds to sleep when the queue is empty
        #[arg(long, default_value_t = 3)]
        sleep: u64,

        /// Attempts before a job is dead-lettered, 0 for unlimited
        #[arg(long, default_value_t = 0)]
        tries: u32,

        /// Process a single job and exit
        #[arg(long)]
        once: bool,

        /// Exit once the queue is empty
        #[arg(long)]
        stop_when_empty: bool,

        /// Append dead-lettered jobs to this JSON-lines file, required with --tries
        #[arg(long)]
        failed_log: Option<PathBuf>,
    },

    /// Push a job onto a queue
    Push {
        /// Handler identifier for the job
        handler: String,

        /// Job data as JSON
        #[arg(short, long)]
        data: Option<String>,

        /// Queue to push to, defaults to the connection's queue
        #[arg(short, long)]
        queue: Option<String>,

        /// Seconds before the job becomes visible
        #[arg(long, default_value_t = 0)]
        delay: u32,

        /// Connection name, defaults to the configured default
        #[arg(short, long)]
        connection: Option<String>,
    },
}

// ============================================================================
// CLI Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Queue(
                QueueError::ConfigurationError(_)
                | QueueError::ConnectionNotConfigured { .. }
                | QueueError::UnknownConnector { .. },
            ) => 1,
            Self::Queue(_) => 2,
            Self::InvalidArgument { .. } => 3,
            Self::Io(_) => 4,
        }
    }

    fn invalid_argument(arg: &str, message: impl Into<String>) -> Self {
        Self::InvalidArgument {
            arg: arg.to_string(),
            message: message.into(),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: PathBuf },

    #[error("Failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
}

// ============================================================================
// Configuration
// ============================================================================

/// Load queue settings
///
/// Sources, later ones overriding earlier ones:
/// 1. `/etc/queue-worker/queue.yaml`
/// 2. `./config/queue.yaml`
/// 3. `path`, which must exist when given
/// 4. environment variables prefixed `QW__`, e.g. `QW__DEFAULT=sqs` or
///    `QW__CONNECTIONS__SQS__REGION=eu-west-1`
///
/// With no connections configured at all the process-local `memory`
/// connection is used.
pub fn load_settings(path: Option<&Path>) -> Result<QueueSettings, ConfigError> {
    let mut builder = config::Config::builder()
        .add_source(
            config::File::with_name("/etc/queue-worker/queue")
                .required(false)
                .format(config::FileFormat::Yaml),
        )
        .add_source(
            config::File::with_name("config/queue")
                .required(false)
                .format(config::FileFormat::Yaml),
        );

    if let Some(path) = path {
        if !path.exists() {
            return Err(ConfigError::FileNotFound {
                path: path.to_path_buf(),
            });
        }
        debug!(path = %path.display(), "Loading configuration from explicit path");
        builder = builder.add_source(config::File::from(path).required(true));
    }

    let mut settings: QueueSettings = builder
        .add_source(config::Environment::with_prefix("QW").separator("__"))
        .build()?
        .try_deserialize()?;

    if settings.connections.is_empty() {
        debug!("No connections configured, using the memory connection");
        settings.connections = QueueSettings::default().connections;
    }

    Ok(settings)
}

/// Initialize logging based on CLI arguments
///
/// `RUST_LOG` takes precedence over `--log-level`.
pub fn init_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .or_else(|_| tracing_subscriber::EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::invalid_argument("log-level", e.to_string()))?;

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    let result = if cli.json_logs {
        builder.json().try_init()
    } else {
        builder.try_init()
    };

    result.map_err(|e| CliError::Io(std::io::Error::other(e.to_string())))
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point with no job handlers registered
pub async fn run_cli() -> Result<(), CliError> {
    run_cli_with(Arc::new(HandlerRegistry::new())).await
}

/// Main CLI entry point using `resolver` to find job handlers
pub async fn run_cli_with(resolver: Arc<dyn HandlerResolver>) -> Result<(), CliError> {
    let cli = Cli::parse();
    init_logging(&cli)?;
    execute(cli, resolver).await
}

/// Run a parsed command line
pub async fn execute(cli: Cli, resolver: Arc<dyn HandlerResolver>) -> Result<(), CliError> {
    let settings = load_settings(cli.config.as_deref())?;
    let manager = Arc::new(QueueManager::with_default_connectors(settings));

    match cli.command {
        Commands::Subscribe {
            queue,
            url,
            retries,
            errqueue,
            advanced,
            connection,
        } => {
            let options = SubscribeOptions {
                retries,
                error_queue: errqueue,
            };
            execute_subscribe_command(
                &manager,
                connection.as_deref(),
                &queue,
                &url,
                &options,
                advanced.as_deref(),
            )
            .await
        }
        Commands::Work {
            connection,
            queue,
            delay,
            sleep,
            tries,
            once,
            stop_when_empty,
            failed_log,
        } => {
            let options = WorkerOptions {
                delay: chrono::Duration::seconds(i64::from(delay)),
                sleep: std::time::Duration::from_secs(sleep),
                max_tries: tries,
                stop_on_empty: stop_when_empty,
            };
            let failed = failed_job_store(failed_log, tries)?;
            let worker = Worker::new(Arc::clone(&manager), failed, resolver);

            if once {
                execute_work_once(&worker, connection.as_deref(), queue.as_deref(), &options)
                    .await
            } else {
                execute_work_command(&worker, connection.as_deref(), queue.as_deref(), &options)
                    .await
            }
        }
        Commands::Push {
            handler,
            data,
            queue,
            delay,
            connection,
        } => {
            execute_push_command(
                &manager,
                connection.as_deref(),
                &handler,
                data.as_deref(),
                queue.as_deref(),
                delay,
            )
            .await
        }
    }
}

// ============================================================================
// Command Implementations
// ============================================================================

/// Store for dead-lettered jobs
///
/// A worker that can dead-letter (`tries > 0`) must be given a file, so the
/// record outlives the process. Without `tries` nothing is ever dead-lettered.
fn failed_job_store(
    path: Option<PathBuf>,
    tries: u32,
) -> Result<Arc<dyn FailedJobStore>, CliError> {
    match path {
        Some(path) => {
            info!(path = %path.display(), "Recording failed jobs to file");
            Ok(Arc::new(FileFailedJobStore::new(path)))
        }
        None if tries > 0 => Err(CliError::invalid_argument(
            "failed-log",
            "required when --tries is set, dead-lettered jobs would otherwise be lost on exit",
        )),
        None => {
            debug!("Retrying failed jobs without limit, no failed job store needed");
            Ok(Arc::new(MemoryFailedJobStore::new()))
        }
    }
}

/// Execute subscribe command
async fn execute_subscribe_command(
    manager: &QueueManager,
    connection: Option<&str>,
    queue: &str,
    url: &str,
    options: &SubscribeOptions,
    advanced: Option<&str>,
) -> Result<(), CliError> {
    let advanced = advanced
        .map(|raw| {
            serde_json::from_str::<serde_json::Value>(raw)
                .map_err(|e| CliError::invalid_argument("advanced", e.to_string()))
        })
        .transpose()?;

    info!(
        connection = ?connection,
        queue = %queue,
        url = %url,
        retries = options.retries,
        error_queue = ?options.error_queue,
        "Registering push subscriber"
    );

    manager
        .connection(connection)
        .await?
        .subscribe(queue, url, options, advanced.as_ref())
        .await?;

    println!("Queue subscriber added: {}", url);
    Ok(())
}

/// Execute work command for a single job
async fn execute_work_once(
    worker: &Worker,
    connection: Option<&str>,
    queue: Option<&str>,
    options: &WorkerOptions,
) -> Result<(), CliError> {
    match worker.run_next_job(connection, queue, options).await? {
        Some(outcome) => info!(outcome = ?outcome, "Processed one job"),
        None => info!("Queue is empty"),
    }
    Ok(())
}

/// Execute work command until stopped
async fn execute_work_command(
    worker: &Worker,
    connection: Option<&str>,
    queue: Option<&str>,
    options: &WorkerOptions,
) -> Result<(), CliError> {
    let (sender, shutdown) = ShutdownSignal::channel();

    let signals = tokio::spawn(async move {
        wait_for_shutdown_signal().await;
        // The worker may already have exited
        let _ = sender.send(true);
    });

    let result = worker.daemon(connection, queue, options, shutdown).await;
    signals.abort();

    result.map_err(CliError::from)
}

async fn wait_for_shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received SIGINT (Ctrl+C), finishing the current job"),
        _ = terminate => info!("Received SIGTERM, finishing the current job"),
    }
}

/// Execute push command
async fn execute_push_command(
    manager: &QueueManager,
    connection: Option<&str>,
    handler: &str,
    data: Option<&str>,
    queue: Option<&str>,
    delay: u32,
) -> Result<(), CliError> {
    let data = match data {
        Some(raw) => serde_json::from_str(raw)
            .map_err(|e| CliError::invalid_argument("data", e.to_string()))?,
        None => serde_json::json!({}),
    };

    let connection = manager.connection(connection).await?;
    if delay > 0 {
        connection
            .later(chrono::Duration::seconds(i64::from(delay)), handler, data, queue)
            .await?;
    } else {
        connection.push(handler, data, queue).await?;
    }

    info!(handler = %handler, queue = ?queue, delay_seconds = delay, "Job pushed");
    Ok(())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
