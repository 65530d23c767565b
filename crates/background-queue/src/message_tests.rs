//! Tests for message types.

use super::*;
use serde::Deserialize;
use std::sync::atomic::AtomicUsize;

#[derive(Debug, PartialEq, Deserialize, Serialize)]
struct TriggerBuild {
    repository: String,
    commit: String,
}

fn trigger() -> TriggerBuild {
    TriggerBuild {
        repository: "sturdy/api".to_string(),
        commit: "8c1f2e".to_string(),
    }
}

/// Counts acknowledgements so tests can see how often the broker was called
#[derive(Default)]
struct CountingAcknowledger {
    calls: AtomicUsize,
}

#[async_trait]
impl Acknowledger for CountingAcknowledger {
    async fn ack(&self) -> Result<(), QueueError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

struct FailingAcknowledger;

#[async_trait]
impl Acknowledger for FailingAcknowledger {
    async fn ack(&self) -> Result<(), QueueError> {
        Err(QueueError::AcknowledgementFailed {
            message: "receipt expired".to_string(),
        })
    }
}

fn message_with_body(body: Vec<u8>) -> Message {
    Message::new(MessageId::new(), body.into(), 1, Arc::new(NoRedelivery))
}

mod payload_tests {
    use super::*;

    #[test]
    fn test_payload_from_serializable_value() {
        let payload = Payload::json(&trigger()).unwrap();
        let value: serde_json::Value = serde_json::from_slice(payload.as_bytes()).unwrap();

        assert_eq!(value["repository"], "sturdy/api");
        assert_eq!(payload.len(), payload.as_bytes().len());
    }

    #[test]
    fn test_payload_from_json_bytes_rejects_invalid_json() {
        assert!(Payload::from_json_bytes(&b"{\"ok\":true}"[..]).is_ok());

        let result = Payload::from_json_bytes(&b"{not json"[..]);
        assert!(matches!(result, Err(QueueError::SerializationError(_))));
    }
}

mod decode_tests {
    use super::*;

    #[test]
    fn test_decode_envelope_body() {
        let body = codec::marshal(&trigger()).unwrap();
        let message = message_with_body(body);

        let decoded: TriggerBuild = message.decode().unwrap();
        assert_eq!(decoded, trigger());
    }

    #[test]
    fn test_decode_falls_back_to_plain_json() {
        let body = serde_json::to_vec(&trigger()).unwrap();
        let message = message_with_body(body);

        let decoded: TriggerBuild = message.decode().unwrap();
        assert_eq!(decoded, trigger());
    }

    #[test]
    fn test_decode_garbage_is_serialization_error() {
        let message = message_with_body(b"\x00\x01garbage".to_vec());
        let result: Result<TriggerBuild, _> = message.decode();

        assert!(matches!(result, Err(QueueError::SerializationError(_))));
    }
}

mod ack_tests {
    use super::*;

    #[tokio::test]
    async fn test_ack_calls_acknowledger_each_time() {
        let acknowledger = Arc::new(CountingAcknowledger::default());
        let message = Message::new(MessageId::new(), Bytes::from_static(b"{}"), 1, acknowledger.clone());

        assert!(!message.is_acknowledged());
        message.ack().await.unwrap();
        message.ack().await.unwrap();

        assert!(message.is_acknowledged());
        assert_eq!(acknowledger.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_ack_leaves_message_unacknowledged() {
        let message = Message::new(
            MessageId::new(),
            Bytes::from_static(b"{}"),
            3,
            Arc::new(FailingAcknowledger),
        );

        assert!(message.ack().await.is_err());
        assert!(!message.is_acknowledged());
        assert_eq!(message.delivery_count(), 3);
    }
}
