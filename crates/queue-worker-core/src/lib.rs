//! # Queue Worker Core
//!
//! Backend-agnostic job queue with pluggable drivers for in-memory, AWS SQS,
//! RabbitMQ and IronMQ queues.
//!
//! This library provides:
//! - A common job envelope shared by every backend
//! - Named connections built once and cached by a connection manager
//! - A worker that fires jobs and retries or dead-letters failures
//! - Push subscriptions for backends that deliver over HTTP
//!
//! ## Module Organization
//!
//! - [error] - Error types for all queue operations
//! - [message] - Job payloads and delivered envelopes
//! - [config] - Connection settings and driver types
//! - [drivers] - Backend drivers and their connectors
//! - [connection] - The queue connection and connector traits
//! - [job] - A reserved job and its lifecycle
//! - [handler] - Job handlers and handler lookup
//! - [manager] - Named connection resolution
//! - [worker] - The processing loop
//! - [failed] - Failed job stores
//! - [events] - Job failure notifications
//!
//! ## Usage
//!
//! ```rust,no_run
//! use queue_worker_core::{QueueConnection, QueueManager, QueueSettings};
//! use serde_json::json;
//!
//! # async fn example() -> Result<(), queue_worker_core::QueueError> {
//! let manager = QueueManager::with_default_connectors(QueueSettings::default());
//! manager.push("send-email", json!({"to": "someone@example.com"}), None).await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod drivers;
pub mod error;
pub mod events;
pub mod failed;
pub mod handler;
pub mod job;
pub mod manager;
pub mod message;
pub mod worker;

// Re-export commonly used types at crate root for convenience
pub use config::{ConnectionConfig, DriverType, QueueSettings};
pub use connection::{Connector, QueueConnection, StandardQueueConnection, SubscribeOptions};
pub use drivers::{
    IronConnector, IronDriver, MemoryConnector, MemoryDriver, QueueDriver, RabbitMqConnector,
    RabbitMqDriver, SqsConnector, SqsDriver,
};
pub use error::{ConfigurationError, QueueError, SerializationError, ValidationError};
pub use events::{EventDispatcher, JobFailedEvent};
pub use failed::{FailedJobRecord, FailedJobStore, FileFailedJobStore, MemoryFailedJobStore};
pub use handler::{HandlerRegistry, HandlerResolver, JobHandler};
pub use job::{Job, JobState};
pub use manager::{ConnectorFactory, QueueManager};
pub use message::{DeliveryHandle, Envelope, JobPayload, Timestamp};
pub use worker::{JobOutcome, ShutdownSignal, Worker, WorkerOptions};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
