//! # Background Queue
//!
//! Pluggable publish/subscribe layer that decouples request handling from
//! background processing.
//!
//! This library provides:
//! - A single [`Queue`] contract with explicit, idempotent acknowledgement
//! - An in-process broker for single-process deployments
//! - A synchronous broker whose publish waits for every subscriber, for tests
//! - A durable broker with at-least-once delivery and dead lettering, which
//!   provisions its remote queues, key and policies on first use
//! - Broadcast topics delivering one event to every subscribing host
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all queue operations
//! - [`names`] - Logical, physical and topic names
//! - [`message`] - Payloads, delivered messages and acknowledgement
//! - [`codec`] - Self-describing wire envelope with compression
//! - [`config`] - Settings loaded from files and the environment
//! - [`queue`] - The queue facade and broker selection
//! - [`brokers`] - Broker implementations
//! - [`providers`] - Cloud service backends for the durable broker
//!
//! ## Usage
//!
//! ```rust
//! use background_queue::{LogicalName, QueueExt, QueueFactory, QueueSettings};
//!
//! # async fn example() -> Result<(), background_queue::QueueError> {
//! let settings = QueueSettings { local: true, ..Default::default() };
//! let queue = QueueFactory::create(&settings)?;
//!
//! let name = LogicalName::new("codebase-gc")?;
//! queue.publish_json(&name, &serde_json::json!({"codebase_id": "cb-1"})).await?;
//! # Ok(())
//! # }
//! ```

pub mod brokers;
pub mod codec;
pub mod config;
pub mod error;
pub mod message;
pub mod names;
pub mod providers;
pub mod queue;

// Re-export commonly used types at crate root for convenience
pub use brokers::{
    BroadcastTopic, Broadcaster, DurableConfig, DurableQueue, InProcessQueue, NoopQueue,
    ProvisionedQueue, SynchronousQueue,
};
pub use config::{AwsSettings, PollSettings, QueueSettings};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use message::{Acknowledger, Message, MessageId, Payload};
pub use names::{well_known, LogicalName, PhysicalName, TopicName};
pub use providers::{AwsCloud, CloudBackend, CloudError, InMemoryCloud};
pub use queue::{Queue, QueueExt, QueueFactory, QueueKind};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
