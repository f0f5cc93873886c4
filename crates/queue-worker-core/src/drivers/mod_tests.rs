//! Tests for shared driver helpers and trait defaults.

use super::*;
use crate::message::{DeliveryHandle, Envelope};
use std::sync::Mutex;

#[test]
fn test_delay_seconds_rounds_up() {
    assert_eq!(delay_seconds(Duration::zero()), 0);
    assert_eq!(delay_seconds(Duration::seconds(-5)), 0);
    assert_eq!(delay_seconds(Duration::milliseconds(1)), 1);
    assert_eq!(delay_seconds(Duration::seconds(2)), 2);
    assert_eq!(delay_seconds(Duration::milliseconds(2500)), 3);
}

/// Driver that records the order of primitive calls
#[derive(Default)]
struct RecordingDriver {
    calls: Mutex<Vec<String>>,
}

#[async_trait]
impl QueueDriver for RecordingDriver {
    async fn send(&self, queue: &str, _body: Bytes, delay: Duration) -> Result<(), QueueError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("send:{}:{}", queue, delay.num_seconds()));
        Ok(())
    }

    async fn receive(&self, _queue: &str) -> Result<Option<Envelope>, QueueError> {
        Ok(None)
    }

    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), QueueError> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("ack:{}", envelope.handle.token()));
        Ok(())
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Custom
    }
}

#[tokio::test]
async fn test_default_requeue_publishes_before_acknowledging() {
    let driver = RecordingDriver::default();
    let envelope = Envelope::new(
        DeliveryHandle::new("abc", DriverType::Custom),
        "default",
        Bytes::from_static(b"{}"),
    );

    driver
        .requeue(&envelope, Bytes::from_static(b"{}"), "default", Duration::seconds(2))
        .await
        .unwrap();

    let calls = driver.calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["send:default:2", "ack:abc"]);
}

#[tokio::test]
async fn test_default_redeliver_publishes_before_acknowledging() {
    let driver = RecordingDriver::default();
    let envelope = Envelope::new(
        DeliveryHandle::new("abc", DriverType::Custom),
        "emails",
        Bytes::from_static(b"not json"),
    );

    driver
        .redeliver(&envelope, Duration::seconds(5))
        .await
        .unwrap();

    let calls = driver.calls.lock().unwrap().clone();
    assert_eq!(calls, vec!["send:emails:5", "ack:abc"]);
}

#[tokio::test]
async fn test_default_subscribe_is_unsupported() {
    let driver = RecordingDriver::default();

    let result = driver
        .subscribe("default", "http://example.com", &SubscribeOptions::default(), None)
        .await;

    assert!(matches!(result, Err(QueueError::Unsupported { .. })));
}
