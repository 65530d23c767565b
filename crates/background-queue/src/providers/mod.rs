//! Cloud service backends for the durable broker.
//!
//! The durable broker talks to four managed services: a queue service, a
//! topic service for broadcast fan-out, a key service for at-rest encryption
//! and an identity service. Each is a trait so the broker can run against the
//! real HTTP APIs ([`AwsCloud`]) or an in-process fake ([`InMemoryCloud`]).

use crate::error::{ConfigurationError, QueueError, SerializationError};
use async_trait::async_trait;
use std::collections::HashMap;

pub mod aws;
pub mod memory;

pub use aws::AwsCloud;
pub use memory::InMemoryCloud;

// ============================================================================
// Error Types
// ============================================================================

/// Errors reported by a cloud backend
#[derive(Debug, thiserror::Error)]
pub enum CloudError {
    #[error("Authentication failed: {0}")]
    Authentication(String),

    #[error("Network error: {0}")]
    NetworkError(String),

    #[error("Service error: {0}")]
    ServiceError(String),

    #[error("Queue not found: {0}")]
    QueueNotFound(String),

    #[error("Invalid receipt handle: {0}")]
    InvalidReceipt(String),

    #[error("Resource already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid configuration: {0}")]
    ConfigurationError(String),

    #[error("Serialization error: {0}")]
    SerializationError(String),
}

impl CloudError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Authentication(_) => false,
            Self::NetworkError(_) => true,
            Self::ServiceError(_) => true,
            Self::QueueNotFound(_) => false,
            Self::InvalidReceipt(_) => false,
            Self::AlreadyExists(_) => false,
            Self::ConfigurationError(_) => false,
            Self::SerializationError(_) => false,
        }
    }

    /// Map cloud error to QueueError
    pub fn to_queue_error(self) -> QueueError {
        match self {
            Self::Authentication(msg) => QueueError::AuthenticationFailed { message: msg },
            Self::NetworkError(msg) => QueueError::ConnectionFailed { message: msg },
            Self::ServiceError(msg) => QueueError::ProviderError {
                provider: "Aws".to_string(),
                code: "ServiceError".to_string(),
                message: msg,
            },
            Self::QueueNotFound(queue) => QueueError::QueueNotFound { queue_name: queue },
            Self::InvalidReceipt(receipt) => QueueError::AcknowledgementFailed {
                message: format!("invalid receipt handle: {}", receipt),
            },
            Self::AlreadyExists(msg) => QueueError::ProviderError {
                provider: "Aws".to_string(),
                code: "AlreadyExists".to_string(),
                message: msg,
            },
            Self::ConfigurationError(msg) => {
                QueueError::ConfigurationError(ConfigurationError::Invalid { message: msg })
            }
            Self::SerializationError(msg) => QueueError::SerializationError(
                SerializationError::JsonError(serde_json::Error::io(std::io::Error::new(
                    std::io::ErrorKind::InvalidData,
                    msg,
                ))),
            ),
        }
    }
}

// ============================================================================
// Service Data
// ============================================================================

/// A message handed out by a receive call
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub message_id: String,
    pub receipt_handle: String,
    pub body: String,
    /// Receives so far, including this one
    pub receive_count: u32,
}

/// Account and principal the backend acts as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    pub account: String,
    pub arn: String,
}

// ============================================================================
// Service Traits
// ============================================================================

/// Managed queue operations
#[async_trait]
pub trait QueueService: Send + Sync {
    /// Resolve a queue name to its URL, `CloudError::QueueNotFound` when absent
    async fn get_queue_url(&self, name: &str) -> Result<String, CloudError>;

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String, CloudError>;

    /// Create a queue, returning the URL of the existing queue when it is already there
    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, CloudError>;

    /// Send a message body, returning the service-assigned message ID
    async fn send_message(&self, queue_url: &str, body: &str) -> Result<String, CloudError>;

    /// Long-poll for up to `max_messages` messages
    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: u32,
        wait_time_seconds: u32,
    ) -> Result<Vec<Delivery>, CloudError>;

    /// Delete a received message; deleting it again succeeds
    async fn delete_message(&self, queue_url: &str, receipt_handle: &str)
        -> Result<(), CloudError>;
}

/// Broadcast topic operations
#[async_trait]
pub trait TopicService: Send + Sync {
    /// ARNs of every topic in the account
    async fn list_topics(&self) -> Result<Vec<String>, CloudError>;

    /// Create a topic, returning the ARN of the existing topic when it is already there
    async fn create_topic(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
        tags: &HashMap<String, String>,
    ) -> Result<String, CloudError>;

    /// Subscribe an endpoint to a topic; repeating an identical subscription succeeds
    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, CloudError>;

    async fn publish(&self, topic_arn: &str, message: &str) -> Result<String, CloudError>;
}

/// Encryption key operations
#[async_trait]
pub trait KeyService: Send + Sync {
    /// Names of every key alias in the account
    async fn list_aliases(&self) -> Result<Vec<String>, CloudError>;

    /// Create a key with the given policy document, returning its key ID
    async fn create_key(&self, policy: &str) -> Result<String, CloudError>;

    async fn create_alias(&self, alias: &str, key_id: &str) -> Result<(), CloudError>;
}

#[async_trait]
pub trait IdentityService: Send + Sync {
    async fn caller_identity(&self) -> Result<CallerIdentity, CloudError>;
}

/// Everything the durable broker needs from a cloud account
pub trait CloudBackend: QueueService + TopicService + KeyService + IdentityService {}

impl<T> CloudBackend for T where T: QueueService + TopicService + KeyService + IdentityService {}
