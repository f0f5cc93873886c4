//! Tests for payload and envelope types.

use super::*;
use serde_json::json;

#[test]
fn test_payload_wire_shape_is_stable() {
    let raw = r#"{"job":"foo","data":["data"],"attempts":1,"queue":"default"}"#;

    let payload = JobPayload::from_bytes(raw.as_bytes()).unwrap();
    assert_eq!(payload.job, "foo");
    assert_eq!(payload.data, json!(["data"]));
    assert_eq!(payload.attempts, 1);

    let encoded = payload.to_bytes().unwrap();
    assert_eq!(std::str::from_utf8(&encoded).unwrap(), raw);
}

#[test]
fn test_next_attempt_only_changes_attempts() {
    let payload = JobPayload::new("foo", json!({"id": 7}), "emails");
    let next = payload.next_attempt();

    assert_eq!(next.attempts, 2);
    assert_eq!(next.job, payload.job);
    assert_eq!(next.data, payload.data);
    assert_eq!(next.queue, payload.queue);
    assert_eq!(next.next_attempt().attempts, 3);
}

#[test]
fn test_from_bytes_rejects_garbage_as_corrupt() {
    let error = JobPayload::from_bytes(b"not json at all").unwrap_err();
    assert!(error.is_corrupt_payload());

    let error = JobPayload::from_bytes(br#"{"job":"foo"}"#).unwrap_err();
    assert!(error.is_corrupt_payload());
}

#[test]
fn test_from_bytes_rejects_zero_attempts() {
    let raw = br#"{"job":"foo","data":null,"attempts":0,"queue":"default"}"#;
    let error = JobPayload::from_bytes(raw).unwrap_err();
    assert!(error.is_corrupt_payload());
}

#[test]
fn test_validate_requires_job_name() {
    let payload = JobPayload::new("", json!(null), "default");
    assert!(matches!(
        payload.validate(),
        Err(ValidationError::Required { .. })
    ));
}

#[test]
fn test_delivery_handle_display() {
    let handle = DeliveryHandle::new("42", DriverType::RabbitMq);
    assert_eq!(handle.to_string(), "rabbitmq:42");
    assert_eq!(handle.token(), "42");
    assert_eq!(handle.driver(), DriverType::RabbitMq);
}

#[test]
fn test_envelope_defaults() {
    let envelope = Envelope::new(
        DeliveryHandle::new("t", DriverType::Memory),
        "default",
        Bytes::from_static(b"\xffbody"),
    );

    assert_eq!(envelope.delivery_count, 1);
    assert_eq!(envelope.queue, "default");
    assert!(envelope.body_text().ends_with("body"));
    assert_eq!(envelope.with_delivery_count(4).delivery_count, 4);
}

#[test]
fn test_timestamp_parse_and_display() {
    let ts: Timestamp = "2024-01-02T03:04:05Z".parse().unwrap();
    assert_eq!(ts.to_string(), "2024-01-02 03:04:05 UTC");
}
