//! Backend drivers.
//!
//! Every backend implements [`QueueDriver`], the small set of primitives the
//! rest of the crate builds on. Ack semantics, delay support and payload
//! limits live here and nowhere else.

use crate::config::DriverType;
use crate::connection::SubscribeOptions;
use crate::error::QueueError;
use crate::message::Envelope;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;

pub mod iron;
pub mod memory;
pub mod rabbitmq;
pub mod sqs;

pub use iron::{IronConnector, IronDriver};
pub use memory::{MemoryConnector, MemoryDriver};
pub use rabbitmq::{RabbitMqConnector, RabbitMqDriver};
pub use sqs::{SqsConnector, SqsDriver};

/// Backend primitives used by connections and jobs
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Publish a body onto a queue, hidden for `delay` when positive
    async fn send(&self, queue: &str, body: Bytes, delay: Duration) -> Result<(), QueueError>;

    /// Reserve the next visible delivery, if any
    async fn receive(&self, queue: &str) -> Result<Option<Envelope>, QueueError>;

    /// Permanently remove a delivery this process holds
    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), QueueError>;

    /// Replace a held delivery with a new body
    ///
    /// The default publishes first and acknowledges second, so a crash
    /// in between leaves a duplicate rather than losing the job.
    async fn requeue(
        &self,
        envelope: &Envelope,
        body: Bytes,
        queue: &str,
        delay: Duration,
    ) -> Result<(), QueueError> {
        self.send(queue, body, delay).await?;
        self.acknowledge(envelope).await
    }

    /// Make a held delivery visible again, body unchanged, after `delay`
    ///
    /// Used for bodies that cannot be rewritten. Backends override this so the
    /// next receive counts as another delivery of the same message. The
    /// default republishes the body, which restarts that count.
    async fn redeliver(&self, envelope: &Envelope, delay: Duration) -> Result<(), QueueError> {
        self.requeue(envelope, envelope.body.clone(), &envelope.queue, delay)
            .await
    }

    /// Register an HTTP endpoint that the backend pushes deliveries to
    async fn subscribe(
        &self,
        _queue: &str,
        _url: &str,
        _options: &SubscribeOptions,
        _advanced: Option<&serde_json::Value>,
    ) -> Result<(), QueueError> {
        Err(QueueError::Unsupported {
            driver: self.driver_type().to_string(),
            operation: "subscribe".to_string(),
        })
    }

    /// Get the backend type
    fn driver_type(&self) -> DriverType;
}

/// Whole seconds of a delay, rounding sub-second remainders up
pub(crate) fn delay_seconds(delay: Duration) -> u64 {
    if delay <= Duration::zero() {
        return 0;
    }

    let millis = delay.num_milliseconds() as u64;
    millis.div_ceil(1000)
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
