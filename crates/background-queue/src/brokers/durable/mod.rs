//! Durable broker backed by a managed cloud queue service.
//!
//! Each logical name maps to a host-scoped physical queue with a dead letter
//! companion. Resources are provisioned lazily by the first publish or
//! subscribe of a name and never deleted.
//!
//! # Delivery
//!
//! Delivery is at-least-once. A received message stays hidden for the
//! service's visibility timeout; acknowledging deletes it. A message that is
//! not acknowledged becomes visible again, and after
//! [`MAX_RECEIVE_COUNT`] receives it moves to the dead letter queue.
//!
//! # Subscriptions
//!
//! Every subscription runs its own receive worker which long-polls the queue
//! and feeds the subscriber's channel. The worker stops once the subscription
//! ends. Messages it had received but not yet handed over reappear after the
//! visibility timeout.

pub mod broadcast;
pub mod provisioning;

pub use broadcast::{setup_queue_subscription, BroadcastTopic, Broadcaster};
pub use provisioning::{
    PolicyDocument, Principal, ProvisionedQueue, Provisioner, StatementEntry,
    ENCRYPTION_KEY_ALIAS, MAX_RECEIVE_COUNT,
};

use crate::codec;
use crate::config::{PollSettings, QueueSettings};
use crate::error::{QueueError, SerializationError};
use crate::message::{Acknowledger, Message, MessageId, Payload};
use crate::names::{LogicalName, PhysicalName};
use crate::providers::{CloudBackend, Delivery};
use crate::queue::{Queue, QueueKind};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, OnceCell, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

// ============================================================================
// Configuration
// ============================================================================

/// Settings the durable broker needs from [`QueueSettings`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DurableConfig {
    pub prefix: String,
    pub hostname: String,
    pub region: String,
    pub poll: PollSettings,
}

impl DurableConfig {
    pub fn new(
        prefix: impl Into<String>,
        hostname: impl Into<String>,
        region: impl Into<String>,
    ) -> Self {
        Self {
            prefix: prefix.into(),
            hostname: hostname.into(),
            region: region.into(),
            poll: PollSettings::default(),
        }
    }

    pub fn from_settings(settings: &QueueSettings) -> Self {
        Self {
            prefix: settings.prefix.clone(),
            hostname: settings.resolved_hostname(),
            region: settings.aws.region.clone(),
            poll: settings.poll.clone(),
        }
    }

    pub fn with_poll(mut self, poll: PollSettings) -> Self {
        self.poll = poll;
        self
    }
}

// ============================================================================
// Publisher
// ============================================================================

/// Sends to one provisioned queue
struct Publisher {
    cloud: Arc<dyn CloudBackend>,
    queue: ProvisionedQueue,
}

impl Publisher {
    async fn send(&self, payload: Payload) -> Result<String, QueueError> {
        let body = codec::encode_json(payload.into_bytes().to_vec())?;
        let body = String::from_utf8(body).map_err(|_| SerializationError::InvalidUtf8)?;

        self.cloud
            .send_message(&self.queue.url, &body)
            .await
            .map_err(|e| QueueError::Delivery {
                queue_name: self.queue.name.to_string(),
                message: e.to_string(),
            })
    }
}

// ============================================================================
// Acknowledgement
// ============================================================================

/// Deletes a received message from its queue
struct DeliveryReceipt {
    cloud: Arc<dyn CloudBackend>,
    queue_url: String,
    receipt_handle: String,
}

#[async_trait]
impl Acknowledger for DeliveryReceipt {
    async fn ack(&self) -> Result<(), QueueError> {
        self.cloud
            .delete_message(&self.queue_url, &self.receipt_handle)
            .await
            .map_err(|e| QueueError::AcknowledgementFailed {
                message: e.to_string(),
            })
    }
}

fn into_message(cloud: &Arc<dyn CloudBackend>, queue_url: &str, delivery: Delivery) -> Message {
    Message::new(
        MessageId::from(delivery.message_id),
        delivery.body.into(),
        delivery.receive_count,
        Arc::new(DeliveryReceipt {
            cloud: cloud.clone(),
            queue_url: queue_url.to_string(),
            receipt_handle: delivery.receipt_handle,
        }),
    )
}

// ============================================================================
// Receive Worker
// ============================================================================

/// Long-poll `queue` until cancelled or nobody listens on `tx`
async fn receive_loop(
    cloud: Arc<dyn CloudBackend>,
    queue: ProvisionedQueue,
    poll: PollSettings,
    tx: mpsc::Sender<Message>,
    cancel: CancellationToken,
) {
    debug!(queue = %queue.name, "Receive worker started");

    loop {
        let result = tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tx.closed() => break,
            result = cloud.receive_messages(&queue.url, poll.max_messages, poll.wait_time_seconds) => result,
        };

        match result {
            Ok(deliveries) => {
                for delivery in deliveries {
                    let message = into_message(&cloud, &queue.url, delivery);
                    if tx.send(message).await.is_err() {
                        debug!(queue = %queue.name, "Subscription gone, leaving messages to reappear");
                        return;
                    }
                }
            }
            Err(e) if e.is_transient() => {
                warn!(queue = %queue.name, error = %e, "Failed to receive messages, retrying");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll.error_backoff()) => {}
                }
            }
            Err(e) => {
                error!(queue = %queue.name, error = %e, "Failed to receive messages");
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(poll.error_backoff()) => {}
                }
            }
        }
    }

    debug!(queue = %queue.name, "Receive worker stopped");
}

// ============================================================================
// Durable Queue
// ============================================================================

/// Broker delivering through durable cloud queues
pub struct DurableQueue {
    cloud: Arc<dyn CloudBackend>,
    config: DurableConfig,
    provisioner: Arc<Provisioner>,
    broadcaster: Broadcaster,
    publishers: RwLock<HashMap<LogicalName, Arc<OnceCell<Arc<Publisher>>>>>,
}

impl DurableQueue {
    pub fn new(cloud: Arc<dyn CloudBackend>, config: DurableConfig) -> Self {
        let provisioner = Arc::new(Provisioner::new(cloud.clone(), config.region.clone()));
        let broadcaster = Broadcaster::new(cloud.clone(), provisioner.clone(), config.prefix.clone());

        Self {
            cloud,
            config,
            provisioner,
            broadcaster,
            publishers: RwLock::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &DurableConfig {
        &self.config
    }

    pub fn physical_name(&self, name: &LogicalName) -> Result<PhysicalName, QueueError> {
        Ok(PhysicalName::build(
            &self.config.prefix,
            &self.config.hostname,
            name,
        )?)
    }

    /// Find or create the queue backing `name`
    pub async fn provision(&self, name: &LogicalName) -> Result<ProvisionedQueue, QueueError> {
        let physical = self.physical_name(name)?;
        self.provisioner.get_or_create_queue(&physical, None).await
    }

    pub fn broadcaster(&self) -> &Broadcaster {
        &self.broadcaster
    }

    /// Publisher for `name`, provisioned at most once even under concurrent first use
    async fn publisher(&self, name: &LogicalName) -> Result<Arc<Publisher>, QueueError> {
        let existing = self.publishers.read().await.get(name).cloned();
        let cell = match existing {
            Some(cell) => cell,
            None => self
                .publishers
                .write()
                .await
                .entry(name.clone())
                .or_default()
                .clone(),
        };

        cell.get_or_try_init(|| async {
            let queue = self.provision(name).await?;
            Ok::<_, QueueError>(Arc::new(Publisher {
                cloud: self.cloud.clone(),
                queue,
            }))
        })
        .await
        .cloned()
    }

    /// Receive the broadcast topic of `name` on this host's subscriber queue
    ///
    /// Finds or creates the topic, provisions the host's queue with the
    /// topic's send grant and subscribes it before delivering like
    /// [`Queue::subscribe`].
    #[instrument(skip(self, out, cancel), fields(queue = %name))]
    pub async fn subscribe_broadcast(
        &self,
        name: &LogicalName,
        out: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        self.config.poll.validate()?;
        let topic = self.broadcaster.topic(name).await?;
        let physical =
            PhysicalName::broadcast_subscriber(&self.config.prefix, &self.config.hostname, name)?;
        let queue = self
            .provisioner
            .get_or_create_queue(&physical, Some(topic.arn()))
            .await?;
        setup_queue_subscription(self.cloud.as_ref(), topic.arn(), &queue.arn).await?;

        info!(topic = %topic.name(), subscriber = %queue.name, "New broadcast subscription");
        self.consume(queue, out, cancel).await
    }

    /// Run a receive worker for `queue` and forward its messages into `out`
    async fn consume(
        &self,
        queue: ProvisionedQueue,
        out: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        let queue_name = queue.name.clone();
        let (tx, mut rx) = mpsc::channel(self.config.poll.max_messages as usize);

        let worker_cancel = cancel.child_token();
        let _stop_worker = worker_cancel.clone().drop_guard();
        tokio::spawn(receive_loop(
            self.cloud.clone(),
            queue,
            self.config.poll.clone(),
            tx,
            worker_cancel,
        ));

        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                message = rx.recv() => match message {
                    Some(message) => message,
                    None => break,
                },
            };

            debug!(queue = %queue_name, message_id = %message.id(), "New message");
            tokio::select! {
                _ = cancel.cancelled() => break,
                sent = out.send(message) => {
                    if sent.is_err() {
                        debug!(queue = %queue_name, "Subscriber output closed");
                        break;
                    }
                }
            }
        }

        info!(queue = %queue_name, "Stopping subscription");
        Ok(())
    }
}

#[async_trait]
impl Queue for DurableQueue {
    #[instrument(skip(self, payload), fields(queue = %name, bytes = payload.len()))]
    async fn publish(&self, name: &LogicalName, payload: Payload) -> Result<(), QueueError> {
        let publisher = self.publisher(name).await?;
        let message_id = publisher.send(payload).await?;

        info!(message_id = %message_id, "Published message");
        Ok(())
    }

    #[instrument(skip(self, out, cancel), fields(queue = %name))]
    async fn subscribe(
        &self,
        name: &LogicalName,
        out: mpsc::Sender<Message>,
        cancel: CancellationToken,
    ) -> Result<(), QueueError> {
        self.config.poll.validate()?;
        let queue = self.provision(name).await?;
        info!(url = %queue.url, "New subscription");

        self.consume(queue, out, cancel).await
    }

    fn kind(&self) -> QueueKind {
        QueueKind::Durable
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
