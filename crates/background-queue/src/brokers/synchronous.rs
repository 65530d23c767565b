//! Barrier broker for deterministic tests.
//!
//! `publish` hands the payload to every current subscriber of the name at
//! once and only returns after each of them has acknowledged its copy. Tests
//! can therefore assert on side effects right after publishing without
//! sleeping or polling.

use crate::error::QueueError;
use crate::message::{Acknowledger, Message, MessageId, Payload};
use crate::names::LogicalName;
use crate::queue::{Queue, QueueKind};
use async_trait::async_trait;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

/// Releases the publisher waiting on this delivery
struct BarrierReceipt {
    release: Mutex<Option<oneshot::Sender<()>>>,
}

#[async_trait]
impl Acknowledger for BarrierReceipt {
    async fn ack(&self) -> Result<(), QueueError> {
        let release = self
            .release
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(release) = release {
            // The publisher may have given up already
            let _ = release.send(());
        }
        Ok(())
    }
}

#[derive(Clone)]
struct Registration {
    id: Uuid,
    out: mpsc::Sender<Message>,
}

/// Broker whose publish completes only after every subscriber acknowledges
#[derive(Default)]
pub struct SynchronousQueue {
    subscribers: RwLock<HashMap<LogicalName, Vec<Registration>>>,
}

/// Removes a registration when the subscription ends, however it ends
struct Unregister<'a> {
    queue: &'a SynchronousQueue,
    name: &'a LogicalName,
    id: Uuid,
}

impl Drop for Unregister<'_> {
    fn drop(&mut self) {
        let mut subscribers = self
            .queue
            .subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner());
        if let Some(registrations) = subscribers.get_mut(self.name) {
            registrations.retain(|r| r.id != self.id);
            if registrations.is_empty() {
                subscribers.remove(self.name);
            }
        }
    }
}

impl SynchronousQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of subscriptions currently registered for `name`
    pub fn subscriber_count(&self, name: &LogicalName) -> usize {
        self.subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .map_or(0, Vec::len)
    }

    fn register(&self, name: &LogicalName, out: mpsc::Sender<Message>) -> Uuid {
        let id = Uuid::new_v4();
        self.subscribers
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(name.clone())
            .or_default()
            .push(Registration { id, out });
        id
    }
}

/// Deliver one copy to one subscriber and wait for its acknowledgement
async fn deliver(registration: Registration, payload: Payload) -> Result<(), String> {
    let (release, acknowledged) = oneshot::channel();
    let message = Message::new(
        MessageId::new(),
        payload.into_bytes(),
        1,
        Arc::new(BarrierReceipt {
            release: Mutex::new(Some(release)),
        }),
    );

    registration
        .out
        .send(message)
        .await
        .map_err(|_| format!("subscriber {} is no longer receiving", registration.id))?;

    acknowledged.await.map_err(|_| {
        format!(
            "subscriber {} dropped the message without acknowledging it",
            registration.id
        )
    })
}

#[async_trait]
impl Queue for SynchronousQueue {
    async fn publish(&self, name: &LogicalName, payload: Payload) -> Result<(), QueueError> {
        let registrations = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(name)
            .cloned()
            .unwrap_or_default();

        if registrations.is_empty() {
            debug!(queue = %name, "No subscribers, message discarded");
            return Ok(());
        }

        debug!(queue = %name, subscribers = registrations.len(), "Publishing to all subscribers");
        let results = join_all(
            registrations
                .into_iter()
                .map(|registration| deliver(registration, payload.clone())),
        )
        .await;

        let failures: Vec<String> = results.into_iter().filter_map(Result::err).collect();
        if failures.is_empty() {
            return Ok(());
        }

        warn!(queue = %name, failed = failures.len(), "Subscribers failed to process message");
        Err(QueueError::SubscribersFailed {
            queue_name: name.to_string(),
            failures,
        })
    }

    async fn subscribe(
        &self,
        name: &LogicalName,
        out: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        let id = self.register(name, out);
        let _registration = Unregister {
            queue: self,
            name,
            id,
        };
        debug!(queue = %name, subscriber = %id, "Subscriber registered");

        cancel.cancelled().await;

        debug!(queue = %name, subscriber = %id, "Subscriber unregistered");
        Ok(())
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Synchronous
    }
}

#[cfg(test)]
#[path = "synchronous_tests.rs"]
mod tests;
