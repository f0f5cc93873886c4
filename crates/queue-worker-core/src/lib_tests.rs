//! Tests for the queue-worker-core library module.

use super::*;
use serde_json::json;
use std::sync::Arc;

#[tokio::test]
async fn test_push_and_work_through_default_connection() {
    let manager = Arc::new(QueueManager::with_default_connectors(QueueSettings::default()));
    let store = Arc::new(MemoryFailedJobStore::new());

    let mut registry = HandlerRegistry::new();
    registry.register_fn("greet", |job, data| {
        Box::pin(async move {
            assert_eq!(data, json!({"name": "world"}));
            job.delete().await?;
            Ok::<(), anyhow::Error>(())
        })
    });

    manager
        .push("greet", json!({"name": "world"}), None)
        .await
        .unwrap();

    let worker = Worker::new(Arc::clone(&manager), store.clone(), Arc::new(registry));
    let options = WorkerOptions {
        stop_on_empty: true,
        ..WorkerOptions::default()
    };

    worker
        .daemon(None, None, &options, ShutdownSignal::never())
        .await
        .unwrap();

    assert!(manager.pop(None).await.unwrap().is_none());
    assert!(store.is_empty());
}

#[test]
fn test_driver_capabilities() {
    assert!(DriverType::Sqs.supports_delay());
    assert!(DriverType::Iron.supports_push_subscriptions());
    assert!(!DriverType::RabbitMq.supports_push_subscriptions());
    assert_eq!(DriverType::Sqs.max_payload_size(), 256 * 1024);
}
