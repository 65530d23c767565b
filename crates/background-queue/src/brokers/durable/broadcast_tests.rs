//! Tests for broadcast topics.

use super::*;
use crate::names::PhysicalName;
use crate::providers::{InMemoryCloud, QueueService};
use serde::Deserialize;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct PushEvent {
    repository: String,
}

fn broadcaster(cloud: &InMemoryCloud, prefix: &str) -> Broadcaster {
    let shared: Arc<dyn CloudBackend> = Arc::new(cloud.clone());
    let provisioner = Arc::new(Provisioner::new(shared.clone(), cloud.region().to_string()));
    Broadcaster::new(shared, provisioner, prefix)
}

fn webhooks() -> LogicalName {
    LogicalName::new("github-webhooks").unwrap()
}

/// Verify a new topic is created encrypted and tagged
#[tokio::test]
async fn test_topic_created_once_with_tag() {
    let cloud = InMemoryCloud::default();
    let broadcaster = broadcaster(&cloud, "prod");

    let first = broadcaster.topic(&webhooks()).await.unwrap();
    let second = broadcaster.topic(&webhooks()).await.unwrap();

    assert_eq!(first.arn(), second.arn());
    assert!(first.arn().ends_with(":prod_github-webhooks"));
    assert_eq!(first.name().as_str(), "prod_github-webhooks");
    assert_eq!(cloud.list_topics().await.unwrap().len(), 1);
    assert_eq!(cloud.topic_tags(first.arn()).unwrap()[BROADCAST_TAG], "true");
    assert_eq!(cloud.key_count(), 1);
}

/// Verify a second broadcaster discovers the topic by ARN suffix
#[tokio::test]
async fn test_existing_topic_discovered() {
    let cloud = InMemoryCloud::default();

    let created = broadcaster(&cloud, "prod").topic(&webhooks()).await.unwrap();
    let found = broadcaster(&cloud, "prod").topic(&webhooks()).await.unwrap();
    let other_env = broadcaster(&cloud, "staging").topic(&webhooks()).await.unwrap();

    assert_eq!(created.arn(), found.arn());
    assert_ne!(created.arn(), other_env.arn());
    assert_eq!(cloud.list_topics().await.unwrap().len(), 2);
}

/// Verify repeating a subscription does not duplicate deliveries
#[tokio::test]
async fn test_queue_subscription_is_idempotent() {
    let cloud = InMemoryCloud::default();
    let shared: Arc<dyn CloudBackend> = Arc::new(cloud.clone());
    let provisioner = Provisioner::new(shared.clone(), cloud.region().to_string());
    let topic = broadcaster(&cloud, "prod").topic(&webhooks()).await.unwrap();

    let queue = provisioner
        .get_or_create_queue(
            &PhysicalName::broadcast_subscriber("prod", "worker", &webhooks()).unwrap(),
            Some(topic.arn()),
        )
        .await
        .unwrap();

    setup_queue_subscription(&cloud, topic.arn(), &queue.arn).await.unwrap();
    setup_queue_subscription(&cloud, topic.arn(), &queue.arn).await.unwrap();
    assert_eq!(cloud.subscription_count(topic.arn()), 1);

    topic
        .publish_json(&PushEvent {
            repository: "getsturdy/sturdy".to_string(),
        })
        .await
        .unwrap();

    let deliveries = cloud.receive_messages(&queue.url, 10, 0).await.unwrap();
    assert_eq!(deliveries.len(), 1);

    // Raw delivery keeps the envelope as the queue message body
    let event: PushEvent = codec::unmarshal(deliveries[0].body.as_bytes()).unwrap();
    assert_eq!(event.repository, "getsturdy/sturdy");
}

/// Verify every subscribed queue receives its own copy
#[tokio::test]
async fn test_publish_fans_out_to_all_queues() {
    let cloud = InMemoryCloud::default();
    let shared: Arc<dyn CloudBackend> = Arc::new(cloud.clone());
    let provisioner = Provisioner::new(shared, cloud.region().to_string());
    let topic = broadcaster(&cloud, "prod").topic(&webhooks()).await.unwrap();

    let mut urls = Vec::new();
    for host in ["worker-1", "worker-2", "worker-3"] {
        let queue = provisioner
            .get_or_create_queue(
                &PhysicalName::broadcast_subscriber("prod", host, &webhooks()).unwrap(),
                Some(topic.arn()),
            )
            .await
            .unwrap();
        setup_queue_subscription(&cloud, topic.arn(), &queue.arn).await.unwrap();
        urls.push(queue.url);
    }

    topic.publish(Payload::json(&"ping").unwrap()).await.unwrap();

    for url in urls {
        assert_eq!(cloud.receive_messages(&url, 10, 0).await.unwrap().len(), 1);
    }
}

/// Verify a queue without the topic grant receives nothing
#[tokio::test]
async fn test_queue_without_grant_is_skipped() {
    let cloud = InMemoryCloud::default();
    let shared: Arc<dyn CloudBackend> = Arc::new(cloud.clone());
    let provisioner = Provisioner::new(shared, cloud.region().to_string());
    let topic = broadcaster(&cloud, "prod").topic(&webhooks()).await.unwrap();

    let queue = provisioner
        .get_or_create_queue(&PhysicalName::from_raw("prod_worker_plain").unwrap(), None)
        .await
        .unwrap();
    setup_queue_subscription(&cloud, topic.arn(), &queue.arn).await.unwrap();

    topic.publish(Payload::json(&"ping").unwrap()).await.unwrap();

    assert_eq!(cloud.visible_message_count("prod_worker_plain"), 0);
}
