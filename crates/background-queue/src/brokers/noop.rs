//! Broker that discards everything.

use crate::error::QueueError;
use crate::message::{Message, Payload};
use crate::names::LogicalName;
use crate::queue::{Queue, QueueKind};
use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::trace;

/// Queue for code paths whose background work is irrelevant, e.g. tests
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopQueue;

#[async_trait]
impl Queue for NoopQueue {
    async fn publish(&self, name: &LogicalName, payload: Payload) -> Result<(), QueueError> {
        trace!(queue = %name, bytes = payload.len(), "Discarding message");
        Ok(())
    }

    async fn subscribe(
        &self,
        _name: &LogicalName,
        _out: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        cancel.cancelled().await;
        Ok(())
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Noop
    }
}

#[cfg(test)]
#[path = "noop_tests.rs"]
mod tests;
