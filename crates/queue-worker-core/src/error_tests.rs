//! Tests for error types.

use super::*;

#[test]
fn test_error_transience() {
    assert!(QueueError::ConnectionFailed {
        message: "network error".to_string(),
    }
    .is_transient());

    assert!(!QueueError::QueueNotFound {
        queue_name: "test".to_string(),
    }
    .is_transient());

    assert!(!QueueError::PayloadTooLarge {
        size: 1000,
        max_size: 500
    }
    .is_transient());

    assert!(!QueueError::FailedJobStore {
        message: "disk full".to_string(),
    }
    .is_transient());

    assert!(!QueueError::UnknownConnector {
        driver: "beanstalkd".to_string(),
    }
    .is_transient());
}

#[test]
fn test_retry_suggestions() {
    let connection = QueueError::ConnectionFailed {
        message: "reset".to_string(),
    };
    assert_eq!(connection.retry_after(), Some(Duration::seconds(5)));

    let not_found = QueueError::QueueNotFound {
        queue_name: "test".to_string(),
    };
    assert_eq!(not_found.retry_after(), None);
}

#[test]
fn test_missing_config_names_the_key() {
    let error = QueueError::missing_config("region");
    assert_eq!(
        error.to_string(),
        "Configuration error: Missing required configuration: region"
    );
}

#[test]
fn test_handler_failure_keeps_source() {
    use std::error::Error as _;

    let error = QueueError::HandlerFailed {
        handler: "foo".to_string(),
        source: anyhow::anyhow!("boom").into(),
    };

    assert_eq!(error.to_string(), "Handler 'foo' failed: boom");
    assert!(error.source().is_some());
    assert!(!error.is_corrupt_payload());
}
