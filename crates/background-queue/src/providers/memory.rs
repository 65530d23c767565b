//! In-memory cloud account for testing and development.
//!
//! [`InMemoryCloud`] implements every cloud service trait against shared
//! in-process state. It models the service behavior the durable broker
//! relies on:
//! - Idempotent queue and topic creation
//! - Visibility timeouts and receive counting
//! - Dead letter moves once a message exceeds its `maxReceiveCount`
//! - Topic fan-out honoring queue access policies and raw delivery
//! - Key aliases that must point at existing keys
//!
//! Clones share the same account, which lets several broker instances
//! provision against one set of resources.

use super::{
    CallerIdentity, CloudError, Delivery, IdentityService, KeyService, QueueService,
    TopicService,
};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::debug;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

pub const DEFAULT_ACCOUNT: &str = "123456789012";

const DEFAULT_VISIBILITY_TIMEOUT: Duration = Duration::from_secs(30);

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct CloudState {
    /// Queues by name
    queues: HashMap<String, SimQueue>,
    /// Topics by ARN
    topics: HashMap<String, SimTopic>,
    /// Key IDs by alias name
    aliases: HashMap<String, String>,
    /// Key policies by key ID
    keys: HashMap<String, String>,
}

impl CloudState {
    fn queue_mut(&mut self, queue_url: &str) -> Result<&mut SimQueue, CloudError> {
        let name = queue_name_from_url(queue_url);
        self.queues
            .get_mut(name)
            .ok_or_else(|| CloudError::QueueNotFound(name.to_string()))
    }

    fn queue_by_arn_mut(&mut self, arn: &str) -> Option<&mut SimQueue> {
        self.queues.values_mut().find(|q| q.arn == arn)
    }

    /// Reject key references to aliases that do not exist
    fn check_key_reference(&self, attributes: &HashMap<String, String>) -> Result<(), CloudError> {
        match attributes.get("KmsMasterKeyId") {
            Some(key) if key.starts_with("alias/") && !self.aliases.contains_key(key) => Err(
                CloudError::ServiceError(format!("KMS.NotFoundException: Alias {} is not found", key)),
            ),
            _ => Ok(()),
        }
    }
}

struct SimQueue {
    arn: String,
    attributes: HashMap<String, String>,
    redrive: Option<Redrive>,
    visible: VecDeque<SimMessage>,
    /// In-flight messages by receipt handle
    in_flight: HashMap<String, InFlight>,
}

struct Redrive {
    dead_letter_arn: String,
    max_receive_count: u32,
}

#[derive(Clone)]
struct SimMessage {
    id: String,
    body: String,
    receive_count: u32,
}

struct InFlight {
    message: SimMessage,
    visible_at: Instant,
}

struct SimTopic {
    tags: HashMap<String, String>,
    subscriptions: Vec<SimSubscription>,
}

struct SimSubscription {
    arn: String,
    queue_arn: String,
    raw: bool,
}

fn queue_name_from_url(queue_url: &str) -> &str {
    queue_url.rsplit('/').next().unwrap_or(queue_url)
}

fn parse_redrive(policy: &str) -> Result<Redrive, CloudError> {
    let invalid = |reason: &str| {
        CloudError::ServiceError(format!(
            "InvalidParameterValue: RedrivePolicy {}: {}",
            reason, policy
        ))
    };

    let value: Value = serde_json::from_str(policy).map_err(|_| invalid("is not JSON"))?;
    let dead_letter_arn = value["deadLetterTargetArn"]
        .as_str()
        .ok_or_else(|| invalid("has no deadLetterTargetArn"))?
        .to_string();
    let max_receive_count = match &value["maxReceiveCount"] {
        Value::Number(n) => n.as_u64().map(|n| n as u32),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
    .ok_or_else(|| invalid("has no valid maxReceiveCount"))?;

    Ok(Redrive {
        dead_letter_arn,
        max_receive_count,
    })
}

/// Whether a queue policy lets the broadcast service deliver from `topic_arn`
fn policy_allows_topic(policy: Option<&String>, topic_arn: &str) -> bool {
    let Some(document) = policy.and_then(|p| serde_json::from_str::<Value>(p).ok()) else {
        return false;
    };

    let grants_send = |action: &Value| match action {
        Value::String(a) => a == "SQS:SendMessage" || a == "SQS:*",
        Value::Array(actions) => actions
            .iter()
            .any(|a| a == "SQS:SendMessage" || a == "SQS:*"),
        _ => false,
    };

    document["Statement"]
        .as_array()
        .map(|statements| {
            statements.iter().any(|s| {
                s["Effect"] == "Allow"
                    && s["Principal"]["Service"] == "sns.amazonaws.com"
                    && grants_send(&s["Action"])
                    && s["Condition"]["ArnEquals"]["aws:SourceArn"] == topic_arn
            })
        })
        .unwrap_or(false)
}

// ============================================================================
// In-Memory Cloud
// ============================================================================

/// Cloud account simulated in process memory
#[derive(Clone)]
pub struct InMemoryCloud {
    state: Arc<Mutex<CloudState>>,
    arrivals: Arc<Notify>,
    failing_receives: Arc<AtomicUsize>,
    region: String,
    identity: CallerIdentity,
    visibility_timeout: Duration,
}

impl Default for InMemoryCloud {
    fn default() -> Self {
        Self::new("eu-north-1")
    }
}

impl InMemoryCloud {
    pub fn new(region: impl Into<String>) -> Self {
        Self {
            state: Arc::new(Mutex::new(CloudState::default())),
            arrivals: Arc::new(Notify::new()),
            failing_receives: Arc::new(AtomicUsize::new(0)),
            region: region.into(),
            identity: CallerIdentity {
                account: DEFAULT_ACCOUNT.to_string(),
                arn: format!("arn:aws:iam::{}:user/background-queue", DEFAULT_ACCOUNT),
            },
            visibility_timeout: DEFAULT_VISIBILITY_TIMEOUT,
        }
    }

    /// Time a received message stays hidden before it can be received again
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = timeout;
        self
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// Make the next `count` receive calls fail with a network error
    pub fn fail_next_receives(&self, count: usize) {
        self.failing_receives.store(count, Ordering::SeqCst);
    }

    fn lock(&self) -> MutexGuard<'_, CloudState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn queue_url(&self, name: &str) -> String {
        format!(
            "https://sqs.{}.amazonaws.com/{}/{}",
            self.region, self.identity.account, name
        )
    }

    fn arn(&self, service: &str, name: &str) -> String {
        format!(
            "arn:aws:{}:{}:{}:{}",
            service, self.region, self.identity.account, name
        )
    }

    // ------------------------------------------------------------------------
    // Inspection
    // ------------------------------------------------------------------------

    /// Names of all queues, sorted
    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn queue_attributes(&self, name: &str) -> Option<HashMap<String, String>> {
        self.lock().queues.get(name).map(|q| q.attributes.clone())
    }

    /// Messages waiting to be received
    pub fn visible_message_count(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.visible.len())
    }

    /// Messages received but neither deleted nor visible again
    pub fn in_flight_count(&self, name: &str) -> usize {
        self.lock().queues.get(name).map_or(0, |q| q.in_flight.len())
    }

    pub fn key_count(&self) -> usize {
        self.lock().keys.len()
    }

    pub fn topic_tags(&self, topic_arn: &str) -> Option<HashMap<String, String>> {
        self.lock().topics.get(topic_arn).map(|t| t.tags.clone())
    }

    pub fn subscription_count(&self, topic_arn: &str) -> usize {
        self.lock()
            .topics
            .get(topic_arn)
            .map_or(0, |t| t.subscriptions.len())
    }

    /// Hand out visible messages, returning when the next in-flight one reappears
    fn take_visible(
        &self,
        queue_url: &str,
        max_messages: u32,
    ) -> Result<(Vec<Delivery>, Option<Instant>), CloudError> {
        let now = Instant::now();
        let mut state = self.lock();

        let queue = state.queue_mut(queue_url)?;

        let expired: Vec<String> = queue
            .in_flight
            .iter()
            .filter(|(_, f)| f.visible_at <= now)
            .map(|(receipt, _)| receipt.clone())
            .collect();
        for receipt in expired {
            if let Some(flight) = queue.in_flight.remove(&receipt) {
                queue.visible.push_back(flight.message);
            }
        }

        let mut deliveries = Vec::new();
        let mut dead = Vec::new();
        while deliveries.len() < max_messages as usize {
            let Some(mut message) = queue.visible.pop_front() else {
                break;
            };

            if let Some(redrive) = &queue.redrive {
                if message.receive_count >= redrive.max_receive_count {
                    dead.push(message);
                    continue;
                }
            }

            message.receive_count += 1;
            let receipt_handle = uuid::Uuid::new_v4().to_string();
            deliveries.push(Delivery {
                message_id: message.id.clone(),
                receipt_handle: receipt_handle.clone(),
                body: message.body.clone(),
                receive_count: message.receive_count,
            });
            queue.in_flight.insert(
                receipt_handle,
                InFlight {
                    message,
                    visible_at: now + self.visibility_timeout,
                },
            );
        }

        let next_visible = queue.in_flight.values().map(|f| f.visible_at).min();
        let dead_letter_arn = queue.redrive.as_ref().map(|r| r.dead_letter_arn.clone());

        if let Some(arn) = dead_letter_arn.filter(|_| !dead.is_empty()) {
            match state.queue_by_arn_mut(&arn) {
                Some(dead_letter) => {
                    debug!(count = dead.len(), dead_letter = %arn, "Moving messages to dead letter queue");
                    dead_letter.visible.extend(dead);
                }
                None => debug!(dead_letter = %arn, "Dead letter queue is gone, dropping messages"),
            }
        }

        Ok((deliveries, next_visible))
    }

    fn enqueue(state: &mut CloudState, queue_arn: &str, body: String) {
        if let Some(queue) = state.queue_by_arn_mut(queue_arn) {
            queue.visible.push_back(SimMessage {
                id: uuid::Uuid::new_v4().to_string(),
                body,
                receive_count: 0,
            });
        }
    }
}

// ============================================================================
// Queue Service
// ============================================================================

#[async_trait]
impl QueueService for InMemoryCloud {
    async fn get_queue_url(&self, name: &str) -> Result<String, CloudError> {
        if self.lock().queues.contains_key(name) {
            Ok(self.queue_url(name))
        } else {
            Err(CloudError::QueueNotFound(name.to_string()))
        }
    }

    async fn get_queue_arn(&self, queue_url: &str) -> Result<String, CloudError> {
        let mut state = self.lock();
        Ok(state.queue_mut(queue_url)?.arn.clone())
    }

    async fn create_queue(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, CloudError> {
        let mut state = self.lock();

        if state.queues.contains_key(name) {
            return Ok(self.queue_url(name));
        }

        state.check_key_reference(attributes)?;

        let redrive = match attributes.get("RedrivePolicy") {
            Some(policy) => {
                let redrive = parse_redrive(policy)?;
                if state.queue_by_arn_mut(&redrive.dead_letter_arn).is_none() {
                    return Err(CloudError::ServiceError(format!(
                        "InvalidParameterValue: dead letter target {} does not exist",
                        redrive.dead_letter_arn
                    )));
                }
                Some(redrive)
            }
            None => None,
        };

        state.queues.insert(
            name.to_string(),
            SimQueue {
                arn: self.arn("sqs", name),
                attributes: attributes.clone(),
                redrive,
                visible: VecDeque::new(),
                in_flight: HashMap::new(),
            },
        );

        Ok(self.queue_url(name))
    }

    async fn send_message(&self, queue_url: &str, body: &str) -> Result<String, CloudError> {
        let id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.lock();
            state.queue_mut(queue_url)?.visible.push_back(SimMessage {
                id: id.clone(),
                body: body.to_string(),
                receive_count: 0,
            });
        }
        self.arrivals.notify_waiters();
        Ok(id)
    }

    async fn receive_messages(
        &self,
        queue_url: &str,
        max_messages: u32,
        wait_time_seconds: u32,
    ) -> Result<Vec<Delivery>, CloudError> {
        if self
            .failing_receives
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(CloudError::NetworkError(
                "simulated receive failure".to_string(),
            ));
        }

        let deadline = Instant::now() + Duration::from_secs(u64::from(wait_time_seconds));

        loop {
            let arrival = self.arrivals.notified();
            tokio::pin!(arrival);
            arrival.as_mut().enable();

            let (deliveries, next_visible) = self.take_visible(queue_url, max_messages)?;
            if !deliveries.is_empty() || Instant::now() >= deadline {
                return Ok(deliveries);
            }

            let wake_at = next_visible.map_or(deadline, |at| at.min(deadline));
            tokio::select! {
                _ = &mut arrival => {}
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    async fn delete_message(
        &self,
        queue_url: &str,
        receipt_handle: &str,
    ) -> Result<(), CloudError> {
        let mut state = self.lock();
        state.queue_mut(queue_url)?.in_flight.remove(receipt_handle);
        Ok(())
    }
}

// ============================================================================
// Topic Service
// ============================================================================

#[async_trait]
impl TopicService for InMemoryCloud {
    async fn list_topics(&self) -> Result<Vec<String>, CloudError> {
        let mut arns: Vec<String> = self.lock().topics.keys().cloned().collect();
        arns.sort();
        Ok(arns)
    }

    async fn create_topic(
        &self,
        name: &str,
        attributes: &HashMap<String, String>,
        tags: &HashMap<String, String>,
    ) -> Result<String, CloudError> {
        let arn = self.arn("sns", name);
        let mut state = self.lock();

        if !state.topics.contains_key(&arn) {
            state.check_key_reference(attributes)?;
            state.topics.insert(
                arn.clone(),
                SimTopic {
                    tags: tags.clone(),
                    subscriptions: Vec::new(),
                },
            );
        }

        Ok(arn)
    }

    async fn subscribe(
        &self,
        topic_arn: &str,
        protocol: &str,
        endpoint: &str,
        attributes: &HashMap<String, String>,
    ) -> Result<String, CloudError> {
        if protocol != "sqs" {
            return Err(CloudError::ServiceError(format!(
                "InvalidParameter: unsupported protocol {}",
                protocol
            )));
        }

        let mut state = self.lock();
        let topic = state.topics.get_mut(topic_arn).ok_or_else(|| {
            CloudError::ServiceError(format!("NotFound: Topic does not exist: {}", topic_arn))
        })?;

        if let Some(existing) = topic.subscriptions.iter().find(|s| s.queue_arn == endpoint) {
            return Ok(existing.arn.clone());
        }

        let arn = format!("{}:{}", topic_arn, uuid::Uuid::new_v4());
        topic.subscriptions.push(SimSubscription {
            arn: arn.clone(),
            queue_arn: endpoint.to_string(),
            raw: attributes.get("RawMessageDelivery").map(String::as_str) == Some("true"),
        });

        Ok(arn)
    }

    async fn publish(&self, topic_arn: &str, message: &str) -> Result<String, CloudError> {
        let message_id = uuid::Uuid::new_v4().to_string();
        {
            let mut state = self.lock();
            let targets: Vec<(String, bool)> = state
                .topics
                .get(topic_arn)
                .ok_or_else(|| {
                    CloudError::ServiceError(format!(
                        "NotFound: Topic does not exist: {}",
                        topic_arn
                    ))
                })?
                .subscriptions
                .iter()
                .map(|s| (s.queue_arn.clone(), s.raw))
                .collect();

            for (queue_arn, raw) in targets {
                let allowed = state
                    .queues
                    .values()
                    .find(|q| q.arn == queue_arn)
                    .is_some_and(|q| policy_allows_topic(q.attributes.get("Policy"), topic_arn));
                if !allowed {
                    debug!(queue = %queue_arn, topic = %topic_arn, "Queue policy denies topic delivery");
                    continue;
                }

                let body = if raw {
                    message.to_string()
                } else {
                    serde_json::json!({
                        "Type": "Notification",
                        "MessageId": message_id,
                        "TopicArn": topic_arn,
                        "Message": message,
                    })
                    .to_string()
                };
                Self::enqueue(&mut state, &queue_arn, body);
            }
        }
        self.arrivals.notify_waiters();
        Ok(message_id)
    }
}

// ============================================================================
// Key and Identity Services
// ============================================================================

#[async_trait]
impl KeyService for InMemoryCloud {
    async fn list_aliases(&self) -> Result<Vec<String>, CloudError> {
        let mut aliases: Vec<String> = self.lock().aliases.keys().cloned().collect();
        aliases.sort();
        Ok(aliases)
    }

    async fn create_key(&self, policy: &str) -> Result<String, CloudError> {
        serde_json::from_str::<Value>(policy).map_err(|e| {
            CloudError::ServiceError(format!("MalformedPolicyDocumentException: {}", e))
        })?;

        let key_id = uuid::Uuid::new_v4().to_string();
        self.lock().keys.insert(key_id.clone(), policy.to_string());
        Ok(key_id)
    }

    async fn create_alias(&self, alias: &str, key_id: &str) -> Result<(), CloudError> {
        if !alias.starts_with("alias/") {
            return Err(CloudError::ServiceError(format!(
                "ValidationException: alias {} must begin with alias/",
                alias
            )));
        }

        let mut state = self.lock();
        if !state.keys.contains_key(key_id) {
            return Err(CloudError::ServiceError(format!(
                "NotFoundException: key {} does not exist",
                key_id
            )));
        }
        if state.aliases.contains_key(alias) {
            return Err(CloudError::AlreadyExists(alias.to_string()));
        }

        state.aliases.insert(alias.to_string(), key_id.to_string());
        Ok(())
    }
}

#[async_trait]
impl IdentityService for InMemoryCloud {
    async fn caller_identity(&self) -> Result<CallerIdentity, CloudError> {
        Ok(self.identity.clone())
    }
}
