//! Common test utilities for background-queue integration tests
//!
//! This module provides:
//! - Job payloads resembling the background workers' messages
//! - Helpers for running subscriptions and collecting their messages
//! - Durable brokers wired to a shared in-memory cloud account

use background_queue::{
    DurableConfig, DurableQueue, InMemoryCloud, LogicalName, Message, PollSettings, Queue,
    QueueError,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

// ============================================================================
// Test Payloads
// ============================================================================

/// Payload of a build trigger job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BuildJob {
    pub sequence: u32,
    pub change_id: String,
}

#[allow(dead_code)]
impl BuildJob {
    pub fn new(sequence: u32) -> Self {
        Self {
            sequence,
            change_id: format!("change-{}", sequence),
        }
    }
}

#[allow(dead_code)]
pub fn logical(name: &str) -> LogicalName {
    LogicalName::new(name).expect("test queue names are valid")
}

// ============================================================================
// Subscriptions
// ============================================================================

/// A running subscription and the channel it delivers into
#[allow(dead_code)]
pub struct Subscription {
    pub messages: mpsc::Receiver<Message>,
    pub cancel: CancellationToken,
    pub handle: JoinHandle<Result<(), QueueError>>,
}

#[allow(dead_code)]
impl Subscription {
    /// Subscribe to `name` on a background task
    pub fn start(queue: Arc<dyn Queue>, name: LogicalName, capacity: usize) -> Self {
        let (tx, messages) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        let handle = tokio::spawn({
            let cancel = cancel.clone();
            async move { queue.subscribe(&name, tx, cancel).await }
        });

        Self {
            messages,
            cancel,
            handle,
        }
    }

    /// Next message, failing the test if none arrives in time
    pub async fn next(&mut self) -> Message {
        tokio::time::timeout(Duration::from_secs(5), self.messages.recv())
            .await
            .expect("a message should arrive within 5 seconds")
            .expect("the subscription should still be running")
    }

    /// Cancel the subscription and wait for it to return
    pub async fn stop(self) {
        self.cancel.cancel();
        drop(self.messages);
        self.handle
            .await
            .expect("subscription task should not panic")
            .expect("subscription should end cleanly");
    }
}

/// Poll `condition` until it holds, failing the test after 5 seconds
#[allow(dead_code)]
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("condition should hold within 5 seconds");
}

// ============================================================================
// Durable Brokers
// ============================================================================

/// Durable broker for `hostname` against the shared `cloud` account
#[allow(dead_code)]
pub fn durable_queue(cloud: &InMemoryCloud, hostname: &str) -> Arc<DurableQueue> {
    let config = DurableConfig::new("it", hostname, cloud.region()).with_poll(PollSettings {
        wait_time_seconds: 1,
        max_messages: 10,
        error_backoff_ms: 10,
    });
    Arc::new(DurableQueue::new(Arc::new(cloud.clone()), config))
}
