//! Message types shared by every broker.
//!
//! Producers hand a [`Payload`] to [`crate::Queue::publish`]. Consumers
//! receive [`Message`] handles which they decode and explicitly acknowledge.
//! An unacknowledged message is the only retry signal a broker sees.

use crate::codec;
use crate::error::{QueueError, SerializationError};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, IgnoredAny};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::debug;

// ============================================================================
// Identifiers
// ============================================================================

/// Unique identifier for a delivered message
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// ============================================================================
// Payload
// ============================================================================

/// JSON-encoded body handed to a broker for publishing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    body: Bytes,
}

impl Payload {
    /// Encode a serializable value as JSON
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, QueueError> {
        let body = serde_json::to_vec(value).map_err(SerializationError::from)?;
        Ok(Self { body: body.into() })
    }

    /// Accept bytes that already hold a JSON document
    pub fn from_json_bytes(body: impl Into<Bytes>) -> Result<Self, QueueError> {
        let body = body.into();
        serde_json::from_slice::<IgnoredAny>(&body).map_err(SerializationError::from)?;
        Ok(Self { body })
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.body
    }

    pub fn len(&self) -> usize {
        self.body.len()
    }

    pub fn is_empty(&self) -> bool {
        self.body.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.body
    }
}

// ============================================================================
// Acknowledgement
// ============================================================================

/// Broker-specific completion of a delivered message
///
/// Implementations must tolerate being called more than once.
#[async_trait]
pub trait Acknowledger: Send + Sync {
    async fn ack(&self) -> Result<(), QueueError>;
}

/// Acknowledger for brokers that never redeliver
#[derive(Debug, Default)]
pub struct NoRedelivery;

#[async_trait]
impl Acknowledger for NoRedelivery {
    async fn ack(&self) -> Result<(), QueueError> {
        Ok(())
    }
}

// ============================================================================
// Message
// ============================================================================

/// A single delivery handed to a subscriber
pub struct Message {
    id: MessageId,
    body: Bytes,
    delivery_count: u32,
    received_at: DateTime<Utc>,
    acknowledger: Arc<dyn Acknowledger>,
    acknowledged: AtomicBool,
}

impl Message {
    pub fn new(
        id: MessageId,
        body: Bytes,
        delivery_count: u32,
        acknowledger: Arc<dyn Acknowledger>,
    ) -> Self {
        Self {
            id,
            body,
            delivery_count,
            received_at: Utc::now(),
            acknowledger,
            acknowledged: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> &MessageId {
        &self.id
    }

    /// Raw body exactly as the broker delivered it
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// How many times this message has been delivered, including this one
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }

    pub fn is_acknowledged(&self) -> bool {
        self.acknowledged.load(Ordering::Acquire)
    }

    /// Decode the body into `T`
    ///
    /// Envelope-encoded bodies are tried first. Bodies written before the
    /// envelope format existed are plain JSON and decoded as such.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, QueueError> {
        match codec::unmarshal(&self.body) {
            Ok(value) => Ok(value),
            Err(envelope_error) => {
                debug!(
                    message_id = %self.id,
                    error = %envelope_error,
                    "Body is not an envelope, decoding as plain JSON"
                );
                serde_json::from_slice(&self.body)
                    .map_err(|e| QueueError::SerializationError(SerializationError::from(e)))
            }
        }
    }

    /// Mark the message as successfully processed
    ///
    /// Acknowledging an already acknowledged message succeeds.
    pub async fn ack(&self) -> Result<(), QueueError> {
        self.acknowledger.ack().await?;
        self.acknowledged.store(true, Ordering::Release);
        Ok(())
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("id", &self.id)
            .field("body_len", &self.body.len())
            .field("delivery_count", &self.delivery_count)
            .field("received_at", &self.received_at)
            .field("acknowledged", &self.is_acknowledged())
            .finish()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
