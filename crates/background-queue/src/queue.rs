//! The queue facade and broker selection.
//!
//! Every broker implements [`Queue`]. Callers hold an `Arc<dyn Queue>` built
//! by [`QueueFactory`] and never depend on a concrete broker.

use crate::brokers::{DurableConfig, DurableQueue, InProcessQueue, NoopQueue, SynchronousQueue};
use crate::config::QueueSettings;
use crate::error::QueueError;
use crate::message::{Message, Payload};
use crate::names::LogicalName;
use crate::providers::AwsCloud;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Broker implementations behind the facade
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueKind {
    InProcess,
    Synchronous,
    Durable,
    Noop,
}

impl std::fmt::Display for QueueKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProcess => write!(f, "in-process"),
            Self::Synchronous => write!(f, "synchronous"),
            Self::Durable => write!(f, "durable"),
            Self::Noop => write!(f, "noop"),
        }
    }
}

/// Publish/subscribe contract shared by every broker
#[async_trait]
pub trait Queue: Send + Sync {
    /// Deliver a payload to the queue named `name`
    ///
    /// Returns once the broker has accepted the payload. Brokers do not retry
    /// internally; a failure is returned to the caller.
    async fn publish(&self, name: &LogicalName, payload: Payload) -> Result<(), QueueError>;

    /// Deliver messages from the queue named `name` into `out`
    ///
    /// Runs until `cancel` is cancelled and then returns `Ok(())`. Errors are
    /// only returned when the subscription cannot be established.
    async fn subscribe(
        &self,
        name: &LogicalName,
        out: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError>;

    fn kind(&self) -> QueueKind;
}

/// Typed convenience methods available on every [`Queue`]
#[async_trait]
pub trait QueueExt: Queue {
    /// Serialize `value` as JSON and publish it
    async fn publish_json<T>(&self, name: &LogicalName, value: &T) -> Result<(), QueueError>
    where
        T: Serialize + Sync + ?Sized,
    {
        let payload = Payload::json(value)?;
        self.publish(name, payload).await
    }
}

impl<Q: Queue + ?Sized> QueueExt for Q {}

// ============================================================================
// Queue Factory
// ============================================================================

/// Factory for creating brokers from settings
pub struct QueueFactory;

impl QueueFactory {
    /// Create the broker selected by `settings`
    ///
    /// `local` selects the in-process broker; otherwise the durable broker is
    /// created against the configured cloud account.
    pub fn create(settings: &QueueSettings) -> Result<Arc<dyn Queue>, QueueError> {
        settings.validate()?;

        if settings.local {
            info!("Using in-process queue");
            return Ok(Arc::new(InProcessQueue::new()));
        }

        let cloud = AwsCloud::new(&settings.aws).map_err(|e| e.to_queue_error())?;
        let config = DurableConfig::from_settings(settings);
        info!(
            prefix = %config.prefix,
            hostname = %config.hostname,
            region = %config.region,
            "Using durable queue"
        );

        Ok(Arc::new(DurableQueue::new(Arc::new(cloud), config)))
    }

    /// Create a broker whose publish waits for every subscriber to acknowledge
    pub fn create_synchronous() -> Arc<dyn Queue> {
        Arc::new(SynchronousQueue::new())
    }

    /// Create a broker that discards everything
    pub fn create_noop() -> Arc<dyn Queue> {
        Arc::new(NoopQueue)
    }
}

#[cfg(test)]
#[path = "queue_tests.rs"]
mod tests;
