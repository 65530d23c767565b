//! # Background Queue CLI
//!
//! Command-line interface for inspecting and driving background queues.
//!
//! This module provides CLI commands for:
//! - Publishing JSON messages to a queue or broadcast topic
//! - Printing messages received from a queue or broadcast topic
//! - Provisioning durable queues ahead of their first use
//! - Showing the resolved configuration

use background_queue::{
    AwsCloud, ConfigurationError, DurableConfig, DurableQueue, LogicalName, Message, Payload,
    Queue, QueueError, QueueFactory, QueueSettings,
};
use clap::{Parser, Subcommand};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

// ============================================================================
// CLI Structure
// ============================================================================

/// bgq - publish, receive and provision background queues
#[derive(Debug, Parser)]
#[command(name = "bgq")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Publish, receive and provision background queues")]
pub struct Cli {
    /// Configuration file path (YAML, TOML or JSON)
    #[arg(short, long, env = "BGQ_CONFIG")]
    pub config: Option<PathBuf>,

    /// Logging level or filter directive
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
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Publish a JSON message to a queue
    Publish {
        /// Logical queue name
        queue: String,

        /// JSON message, read from stdin when omitted
        message: Option<String>,
    },

    /// Print messages received from a queue
    Subscribe {
        /// Logical queue name
        queue: String,

        #[command(flatten)]
        receive: ReceiveOptions,
    },

    /// Create a durable queue and its dead letter queue if they do not exist
    Provision {
        /// Logical queue name
        queue: String,
    },

    /// Show the resolved configuration
    Config {
        /// Output format
        #[arg(short, long, default_value = "yaml")]
        format: ConfigFormat,
    },

    /// Broadcast topic commands
    Broadcast {
        #[command(subcommand)]
        action: BroadcastCommands,
    },
}

/// Broadcast topic subcommands
#[derive(Debug, Subcommand)]
pub enum BroadcastCommands {
    /// Publish a JSON message to every subscriber of a topic
    Publish {
        /// Logical topic name
        topic: String,

        /// JSON message, read from stdin when omitted
        message: Option<String>,
    },

    /// Print messages broadcast on a topic, through this host's queue
    Subscribe {
        /// Logical topic name
        topic: String,

        #[command(flatten)]
        receive: ReceiveOptions,
    },
}

/// How received messages are handled
#[derive(Debug, Clone, PartialEq, Eq, clap::Args)]
pub struct ReceiveOptions {
    /// Stop after this many messages
    #[arg(short, long)]
    pub max: Option<usize>,

    /// Leave messages unacknowledged so they are delivered again
    #[arg(long)]
    pub no_ack: bool,
}

/// Configuration format options
#[derive(Clone, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ConfigFormat {
    /// YAML format
    Yaml,
    /// JSON format
    Json,
    /// TOML format
    Toml,
}

// ============================================================================
// Error Types
// ============================================================================

/// CLI-specific errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    #[error("Configuration error: {0}")]
    Configuration(#[from] ConfigurationError),

    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    #[error("Command failed: {message}")]
    CommandFailed { message: String },

    #[error("Invalid argument: {arg} - {message}")]
    InvalidArgument { arg: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl CliError {
    /// Process exit code for this error
    ///
    /// Queue errors that may succeed when the command is repeated exit with 6.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Configuration(_) => 1,
            Self::Queue(e) if e.is_transient() => 6,
            Self::Queue(_) => 2,
            Self::CommandFailed { .. } => 3,
            Self::InvalidArgument { .. } => 4,
            Self::Io(_) => 5,
        }
    }
}

// ============================================================================
// Main Entry Point
// ============================================================================

/// Main CLI entry point
pub async fn run_cli() -> Result<(), CliError> {
    let cli = Cli::parse();
    initialize_logging(&cli)?;

    let settings = QueueSettings::load(cli.config.as_deref())?;
    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
                cancel.cancel();
            }
        }
    });

    let mut stdout = std::io::stdout();
    execute(cli.command, &settings, cancel, &mut stdout).await
}

/// Run one command against `settings`, writing results to `out`
pub async fn execute<W: Write>(
    command: Commands,
    settings: &QueueSettings,
    cancel: CancellationToken,
    out: &mut W,
) -> Result<(), CliError> {
    match command {
        Commands::Publish { queue, message } => {
            let name = parse_name("queue", &queue)?;
            let payload = read_payload(message)?;
            let broker = QueueFactory::create(settings)?;
            broker.publish(&name, payload).await?;
            info!(queue = %name, broker = %broker.kind(), "Message published");
            Ok(())
        }
        Commands::Subscribe { queue, receive } => {
            let name = parse_name("queue", &queue)?;
            let broker = QueueFactory::create(settings)?;
            let (tx, rx) = mpsc::channel(16);
            let subscription = tokio::spawn({
                let cancel = cancel.clone();
                async move { broker.subscribe(&name, tx, cancel).await }
            });
            finish_receiving(rx, subscription, &receive, cancel, out).await
        }
        Commands::Provision { queue } => {
            let name = parse_name("queue", &queue)?;
            let durable = durable_queue(settings)?;
            let provisioned = durable.provision(&name).await?;
            let summary = serde_json::json!({
                "name": provisioned.name.as_str(),
                "url": provisioned.url,
                "arn": provisioned.arn,
            });
            writeln!(out, "{}", summary)?;
            Ok(())
        }
        Commands::Config { format } => {
            write!(out, "{}", render_settings(settings, &format)?)?;
            Ok(())
        }
        Commands::Broadcast { action } => execute_broadcast(action, settings, cancel, out).await,
    }
}

async fn execute_broadcast<W: Write>(
    action: BroadcastCommands,
    settings: &QueueSettings,
    cancel: CancellationToken,
    out: &mut W,
) -> Result<(), CliError> {
    match action {
        BroadcastCommands::Publish { topic, message } => {
            let name = parse_name("topic", &topic)?;
            let payload = read_payload(message)?;
            let durable = durable_queue(settings)?;
            let topic = durable.broadcaster().topic(&name).await?;
            let message_id = topic.publish(payload).await?;
            info!(topic = %topic.name(), message_id = %message_id, "Broadcast published");
            Ok(())
        }
        BroadcastCommands::Subscribe { topic, receive } => {
            let name = parse_name("topic", &topic)?;
            let durable = Arc::new(durable_queue(settings)?);
            let (tx, rx) = mpsc::channel(16);
            let subscription = tokio::spawn({
                let cancel = cancel.clone();
                async move { durable.subscribe_broadcast(&name, tx, cancel).await }
            });
            finish_receiving(rx, subscription, &receive, cancel, out).await
        }
    }
}

// ============================================================================
// Command Helpers
// ============================================================================

/// Initialize logging based on CLI arguments
///
/// `RUST_LOG` takes precedence over `--log-level`. Logs go to stderr so
/// stdout only carries command output.
fn initialize_logging(cli: &Cli) -> Result<(), CliError> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&cli.log_level))
        .map_err(|e| CliError::InvalidArgument {
            arg: "log-level".to_string(),
            message: e.to_string(),
        })?;

    let registry = tracing_subscriber::registry().with(filter);
    let result = if cli.json_logs {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_writer(std::io::stderr),
            )
            .try_init()
    } else {
        registry
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .try_init()
    };

    result.map_err(|e| CliError::CommandFailed {
        message: format!("failed to initialize logging: {}", e),
    })
}

fn parse_name(arg: &str, value: &str) -> Result<LogicalName, CliError> {
    LogicalName::new(value).map_err(|e| CliError::InvalidArgument {
        arg: arg.to_string(),
        message: e.to_string(),
    })
}

/// Payload from the argument, or from stdin when there is none
fn read_payload(message: Option<String>) -> Result<Payload, CliError> {
    let body = match message {
        Some(message) => message,
        None => {
            let mut body = String::new();
            std::io::stdin().read_to_string(&mut body)?;
            body
        }
    };

    parse_payload(&body)
}

pub fn parse_payload(body: &str) -> Result<Payload, CliError> {
    Payload::from_json_bytes(body.trim().as_bytes().to_vec()).map_err(|e| {
        CliError::InvalidArgument {
            arg: "message".to_string(),
            message: e.to_string(),
        }
    })
}

fn durable_queue(settings: &QueueSettings) -> Result<DurableQueue, CliError> {
    if settings.local {
        return Err(CliError::CommandFailed {
            message: "this command needs the durable broker, but local is set".to_string(),
        });
    }
    settings.validate()?;

    let cloud = AwsCloud::new(&settings.aws).map_err(|e| e.to_queue_error())?;
    Ok(DurableQueue::new(
        Arc::new(cloud),
        DurableConfig::from_settings(settings),
    ))
}

/// Render settings with secrets redacted
pub fn render_settings(settings: &QueueSettings, format: &ConfigFormat) -> Result<String, CliError> {
    let redacted = settings.redacted();
    let rendered = match format {
        ConfigFormat::Yaml => serde_yaml::to_string(&redacted).map_err(|e| e.to_string()),
        ConfigFormat::Json => serde_json::to_string_pretty(&redacted)
            .map(|json| json + "\n")
            .map_err(|e| e.to_string()),
        ConfigFormat::Toml => toml::to_string_pretty(&redacted).map_err(|e| e.to_string()),
    };

    rendered.map_err(|message| CliError::CommandFailed {
        message: format!("failed to render configuration: {}", message),
    })
}

/// Print received messages until `max` is reached or the subscription ends
///
/// Each message is written as one JSON line. Messages are acknowledged after
/// they are written unless `no_ack` is set. Messages that do not decode are
/// logged, skipped and left unacknowledged. Returns how many were printed.
pub async fn print_messages<W: Write>(
    rx: &mut mpsc::Receiver<Message>,
    options: &ReceiveOptions,
    out: &mut W,
) -> Result<usize, CliError> {
    let mut printed = 0;

    while options.max.map_or(true, |max| printed < max) {
        let Some(message) = rx.recv().await else {
            break;
        };

        let body = match message.decode::<serde_json::Value>() {
            Ok(body) => body,
            Err(e) => {
                warn!(
                    message_id = %message.id(),
                    error = %e,
                    "Failed to decode message, leaving it unacknowledged"
                );
                continue;
            }
        };
        writeln!(out, "{}", body)?;
        out.flush()?;
        printed += 1;

        if options.no_ack {
            debug!(message_id = %message.id(), "Leaving message unacknowledged");
        } else if let Err(e) = message.ack().await {
            warn!(message_id = %message.id(), error = %e, "Failed to acknowledge message");
        }
    }

    Ok(printed)
}

async fn finish_receiving<W: Write>(
    mut rx: mpsc::Receiver<Message>,
    subscription: tokio::task::JoinHandle<Result<(), QueueError>>,
    options: &ReceiveOptions,
    cancel: CancellationToken,
    out: &mut W,
) -> Result<(), CliError> {
    let printed = print_messages(&mut rx, options, out).await;
    cancel.cancel();
    drop(rx);

    let subscribed = subscription.await.map_err(|e| CliError::CommandFailed {
        message: format!("subscription task failed: {}", e),
    })?;

    let printed = printed?;
    subscribed?;
    info!(count = printed, "Finished receiving");
    Ok(())
}

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
