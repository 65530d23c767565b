//! Broadcast fan-out over topics.
//!
//! A broadcast topic forwards every published message to each durable queue
//! subscribed to it. Each subscribing host gets its own queue, so every host
//! sees every event, while subscribers sharing a host still compete.

use super::provisioning::{Provisioner, ENCRYPTION_KEY_ALIAS};
use crate::codec;
use crate::error::{QueueError, SerializationError};
use crate::message::Payload;
use crate::names::{LogicalName, TopicName};
use crate::providers::{CloudBackend, CloudError, TopicService};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{OnceCell, RwLock};
use tracing::{debug, info};

/// Tag marking topics created for broadcast fan-out
pub const BROADCAST_TAG: &str = "Broadcast";

/// Subscription protocol delivering topic messages into a queue
pub const QUEUE_PROTOCOL: &str = "sqs";

fn topic_error(topic: &str, error: CloudError) -> QueueError {
    QueueError::Provisioning {
        resource: topic.to_string(),
        message: error.to_string(),
    }
}

/// Subscribe a queue to a topic with raw message delivery
///
/// The service deduplicates identical subscriptions, so repeating this for
/// the same pair succeeds.
pub async fn setup_queue_subscription<T>(
    topics: &T,
    topic_arn: &str,
    queue_arn: &str,
) -> Result<(), QueueError>
where
    T: TopicService + ?Sized,
{
    let attributes = HashMap::from([("RawMessageDelivery".to_string(), "true".to_string())]);
    let subscription_arn = topics
        .subscribe(topic_arn, QUEUE_PROTOCOL, queue_arn, &attributes)
        .await
        .map_err(|e| topic_error(topic_arn, e))?;

    debug!(topic = %topic_arn, queue = %queue_arn, subscription = %subscription_arn, "Queue subscribed to topic");
    Ok(())
}

// ============================================================================
// Broadcast Topic
// ============================================================================

/// Handle to one existing broadcast topic
#[derive(Clone)]
pub struct BroadcastTopic {
    cloud: Arc<dyn CloudBackend>,
    name: TopicName,
    arn: String,
}

impl std::fmt::Debug for BroadcastTopic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BroadcastTopic")
            .field("name", &self.name)
            .field("arn", &self.arn)
            .finish()
    }
}

impl BroadcastTopic {
    pub fn name(&self) -> &TopicName {
        &self.name
    }

    pub fn arn(&self) -> &str {
        &self.arn
    }

    /// Deliver a payload to every queue subscribed to the topic
    ///
    /// Returns the service-assigned message ID.
    pub async fn publish(&self, payload: Payload) -> Result<String, QueueError> {
        let body = codec::encode_json(payload.into_bytes().to_vec())?;
        let body = String::from_utf8(body).map_err(|_| SerializationError::InvalidUtf8)?;

        let message_id = self
            .cloud
            .publish(&self.arn, &body)
            .await
            .map_err(|e| QueueError::Delivery {
                queue_name: self.name.to_string(),
                message: e.to_string(),
            })?;

        debug!(topic = %self.name, message_id = %message_id, "Broadcast published");
        Ok(message_id)
    }

    pub async fn publish_json<T>(&self, value: &T) -> Result<String, QueueError>
    where
        T: Serialize + ?Sized,
    {
        self.publish(Payload::json(value)?).await
    }
}

// ============================================================================
// Broadcaster
// ============================================================================

/// Finds or creates broadcast topics, once per name
pub struct Broadcaster {
    cloud: Arc<dyn CloudBackend>,
    provisioner: Arc<Provisioner>,
    prefix: String,
    topics: RwLock<HashMap<LogicalName, Arc<OnceCell<BroadcastTopic>>>>,
}

impl Broadcaster {
    pub fn new(
        cloud: Arc<dyn CloudBackend>,
        provisioner: Arc<Provisioner>,
        prefix: impl Into<String>,
    ) -> Self {
        Self {
            cloud,
            provisioner,
            prefix: prefix.into(),
            topics: RwLock::new(HashMap::new()),
        }
    }

    /// Topic for the logical name `name`, created on first use
    pub async fn topic(&self, name: &LogicalName) -> Result<BroadcastTopic, QueueError> {
        let existing = self.topics.read().await.get(name).cloned();
        let cell = match existing {
            Some(cell) => cell,
            None => self
                .topics
                .write()
                .await
                .entry(name.clone())
                .or_default()
                .clone(),
        };

        cell.get_or_try_init(|| self.find_or_create(name))
            .await
            .cloned()
    }

    async fn find_or_create(&self, name: &LogicalName) -> Result<BroadcastTopic, QueueError> {
        let topic_name = TopicName::build(&self.prefix, name)?;

        let existing = self
            .cloud
            .list_topics()
            .await
            .map_err(|e| topic_error(topic_name.as_str(), e))?
            .into_iter()
            .find(|arn| topic_name.matches_arn(arn));

        self.provisioner.ensure_encryption_key().await?;

        let arn = match existing {
            Some(arn) => {
                debug!(topic = %topic_name, arn = %arn, "Using existing topic");
                arn
            }
            None => {
                let attributes = HashMap::from([(
                    "KmsMasterKeyId".to_string(),
                    ENCRYPTION_KEY_ALIAS.to_string(),
                )]);
                let tags = HashMap::from([(BROADCAST_TAG.to_string(), "true".to_string())]);
                let arn = self
                    .cloud
                    .create_topic(topic_name.as_str(), &attributes, &tags)
                    .await
                    .map_err(|e| topic_error(topic_name.as_str(), e))?;
                info!(topic = %topic_name, arn = %arn, "Created broadcast topic");
                arn
            }
        };

        Ok(BroadcastTopic {
            cloud: self.cloud.clone(),
            name: topic_name,
            arn,
        })
    }
}

#[cfg(test)]
#[path = "broadcast_tests.rs"]
mod tests;
