//! Single-process broker with in-memory delivery lines.
//!
//! Each logical name owns one FIFO delivery line, created on first publish
//! or subscribe. Subscribers of the same name compete for messages, so each
//! message reaches exactly one of them. A single subscriber sees messages in
//! publish order.
//!
//! Messages are not redelivered: acknowledging is a no-op, and a message
//! whose handler fails is lost. Consumers needing redelivery use the durable
//! broker.
//!
//! Lines are unbounded and live as long as the broker. Messages published to
//! a name nobody subscribes to stay in memory until the broker is dropped;
//! [`InProcessQueue::pending`] reports how many are waiting.

use crate::error::QueueError;
use crate::message::{Message, MessageId, NoRedelivery, Payload};
use crate::names::LogicalName;
use crate::queue::{Queue, QueueKind};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Pending messages for one logical name
#[derive(Default)]
struct DeliveryLine {
    pending: Mutex<VecDeque<Message>>,
    available: Notify,
}

impl DeliveryLine {
    fn push(&self, message: Message) {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(message);
        self.available.notify_one();
    }

    fn pop(&self) -> Option<Message> {
        self.pending
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
    }

    fn len(&self) -> usize {
        self.pending.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// Broker delivering within the current process
#[derive(Default)]
pub struct InProcessQueue {
    lines: RwLock<HashMap<LogicalName, Arc<DeliveryLine>>>,
}

impl InProcessQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages published to `name` that no subscriber has taken yet
    pub fn pending(&self, name: &LogicalName) -> usize {
        self.lines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, |line| line.len())
    }

    fn line(&self, name: &LogicalName) -> Arc<DeliveryLine> {
        if let Some(line) = self
            .lines
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
        {
            return line.clone();
        }

        self.lines
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.clone())
            .or_default()
            .clone()
    }
}

#[async_trait]
impl Queue for InProcessQueue {
    async fn publish(&self, name: &LogicalName, payload: Payload) -> Result<(), QueueError> {
        let message = Message::new(
            MessageId::new(),
            payload.into_bytes(),
            1,
            Arc::new(NoRedelivery),
        );
        debug!(queue = %name, message_id = %message.id(), "Publishing in-process message");

        self.line(name).push(message);
        Ok(())
    }

    async fn subscribe(
        &self,
        name: &LogicalName,
        out: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        let line = self.line(name);
        info!(queue = %name, "New in-process subscription");

        loop {
            // Reserve capacity first so a taken message is never dropped
            let permit = tokio::select! {
                _ = cancel.cancelled() => break,
                permit = out.reserve() => match permit {
                    Ok(permit) => permit,
                    Err(_) => {
                        debug!(queue = %name, "Subscriber output closed");
                        break;
                    }
                },
            };

            let message = loop {
                if let Some(message) = line.pop() {
                    break Some(message);
                }
                tokio::select! {
                    _ = cancel.cancelled() => break None,
                    _ = out.closed() => break None,
                    _ = line.available.notified() => {}
                }
            };

            match message {
                Some(message) => permit.send(message),
                None => break,
            }
        }

        info!(queue = %name, "In-process subscription stopped");
        Ok(())
    }

    fn kind(&self) -> QueueKind {
        QueueKind::InProcess
    }
}

#[cfg(test)]
#[path = "in_process_tests.rs"]
mod tests;
