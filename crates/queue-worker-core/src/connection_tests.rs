//! Tests for the standard connection.

use super::*;
use crate::message::Envelope;
use serde_json::json;
use std::sync::Mutex;

/// Driver that records sends and reports a configurable type
struct RecordingDriver {
    driver_type: DriverType,
    sent: Mutex<Vec<(String, Bytes, Duration)>>,
}

impl RecordingDriver {
    fn new(driver_type: DriverType) -> Arc<Self> {
        Arc::new(Self {
            driver_type,
            sent: Mutex::new(Vec::new()),
        })
    }

    fn sent(&self) -> Vec<(String, Bytes, Duration)> {
        self.sent.lock().unwrap().clone()
    }
}

#[async_trait]
impl QueueDriver for RecordingDriver {
    async fn send(&self, queue: &str, body: Bytes, delay: Duration) -> Result<(), QueueError> {
        self.sent
            .lock()
            .unwrap()
            .push((queue.to_string(), body, delay));
        Ok(())
    }

    async fn receive(&self, _queue: &str) -> Result<Option<Envelope>, QueueError> {
        Ok(None)
    }

    async fn acknowledge(&self, _envelope: &Envelope) -> Result<(), QueueError> {
        Ok(())
    }

    fn driver_type(&self) -> DriverType {
        self.driver_type
    }
}

#[tokio::test]
async fn test_push_encodes_first_attempt_payload() {
    let driver = RecordingDriver::new(DriverType::Memory);
    let connection = StandardQueueConnection::new("main", "default", driver.clone());

    connection.push("foo", json!(["data"]), None).await.unwrap();

    let sent = driver.sent();
    assert_eq!(sent.len(), 1);
    assert_eq!(sent[0].0, "default");
    assert_eq!(
        std::str::from_utf8(&sent[0].1).unwrap(),
        r#"{"job":"foo","data":["data"],"attempts":1,"queue":"default"}"#
    );
    assert_eq!(sent[0].2, Duration::zero());
}

#[tokio::test]
async fn test_explicit_queue_overrides_default() {
    let driver = RecordingDriver::new(DriverType::Memory);
    let connection = StandardQueueConnection::new("main", "default", driver.clone());

    connection
        .later(Duration::seconds(10), "foo", json!({}), Some("mail"))
        .await
        .unwrap();

    let sent = driver.sent();
    assert_eq!(sent[0].0, "mail");
    assert_eq!(sent[0].2, Duration::seconds(10));

    let payload = crate::message::JobPayload::from_bytes(&sent[0].1).unwrap();
    assert_eq!(payload.queue, "mail");
}

#[tokio::test]
async fn test_empty_job_name_is_rejected() {
    let driver = RecordingDriver::new(DriverType::Memory);
    let connection = StandardQueueConnection::new("main", "default", driver.clone());

    let result = connection.push("", json!(null), None).await;

    assert!(matches!(result, Err(QueueError::ValidationError(_))));
    assert!(driver.sent().is_empty());
}

#[tokio::test]
async fn test_oversized_payload_is_rejected() {
    let driver = RecordingDriver::new(DriverType::Sqs);
    let connection = StandardQueueConnection::new("main", "default", driver.clone());

    let big = "x".repeat(DriverType::Sqs.max_payload_size() + 1);
    let result = connection.push("foo", json!(big), None).await;

    assert!(matches!(result, Err(QueueError::PayloadTooLarge { .. })));
    assert!(driver.sent().is_empty());
}

#[tokio::test]
async fn test_delay_dropped_when_driver_cannot_delay() {
    let driver = RecordingDriver::new(DriverType::Custom);
    let connection = StandardQueueConnection::new("main", "default", driver.clone());

    connection
        .later(Duration::seconds(30), "foo", json!(null), None)
        .await
        .unwrap();

    assert_eq!(driver.sent()[0].2, Duration::zero());
}

#[tokio::test]
async fn test_push_raw_sends_body_verbatim() {
    let driver = RecordingDriver::new(DriverType::Memory);
    let connection = StandardQueueConnection::new("main", "default", driver.clone());

    connection
        .push_raw(Bytes::from_static(b"raw"), Some(""))
        .await
        .unwrap();

    let sent = driver.sent();
    assert_eq!(sent[0].0, "default");
    assert_eq!(sent[0].1, Bytes::from_static(b"raw"));
}

#[tokio::test]
async fn test_pop_on_empty_queue_returns_none() {
    let driver = RecordingDriver::new(DriverType::Memory);
    let connection = StandardQueueConnection::new("main", "default", driver);

    assert!(connection.pop(None).await.unwrap().is_none());
    assert_eq!(connection.name(), "main");
    assert_eq!(connection.default_queue(), "default");
    assert_eq!(connection.driver_type(), DriverType::Memory);
}

#[test]
fn test_subscribe_options_default_to_three_retries() {
    let options = SubscribeOptions::default();
    assert_eq!(options.retries, 3);
    assert!(options.error_queue.is_none());
}
