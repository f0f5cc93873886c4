//! Queue connections and the connectors that build them.

use crate::config::{ConnectionConfig, DriverType};
use crate::drivers::QueueDriver;
use crate::error::QueueError;
use crate::job::Job;
use crate::message::JobPayload;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, warn};

/// Options for registering a push subscriber
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeOptions {
    /// Delivery attempts the push service makes before giving up
    pub retries: u32,
    /// Queue that receives deliveries the subscriber kept rejecting
    pub error_queue: Option<String>,
}

impl Default for SubscribeOptions {
    fn default() -> Self {
        Self {
            retries: 3,
            error_queue: None,
        }
    }
}

/// Producer and consumer operations on one named connection
#[async_trait]
pub trait QueueConnection: Send + Sync {
    /// Enqueue a job for immediate processing
    async fn push(
        &self,
        job: &str,
        data: serde_json::Value,
        queue: Option<&str>,
    ) -> Result<(), QueueError>;

    /// Enqueue a job that must not be delivered before `now + delay`
    async fn later(
        &self,
        delay: Duration,
        job: &str,
        data: serde_json::Value,
        queue: Option<&str>,
    ) -> Result<(), QueueError>;

    /// Enqueue an already-encoded payload
    async fn push_raw(&self, body: Bytes, queue: Option<&str>) -> Result<(), QueueError>;

    /// Reserve the next job, or `None` when the queue is empty
    async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>, QueueError>;

    /// Register a push subscriber URL for a queue
    async fn subscribe(
        &self,
        queue: &str,
        url: &str,
        options: &SubscribeOptions,
        advanced: Option<&serde_json::Value>,
    ) -> Result<(), QueueError>;
}

/// Builds connections for one driver
#[async_trait]
pub trait Connector: Send + Sync {
    /// Validate `config` and build a ready connection named `name`
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn QueueConnection>, QueueError>;
}

/// Connection implementation shared by every driver
pub struct StandardQueueConnection {
    name: String,
    default_queue: String,
    driver: Arc<dyn QueueDriver>,
}

impl StandardQueueConnection {
    /// Create a connection over a driver
    pub fn new(
        name: impl Into<String>,
        default_queue: impl Into<String>,
        driver: Arc<dyn QueueDriver>,
    ) -> Self {
        Self {
            name: name.into(),
            default_queue: default_queue.into(),
            driver,
        }
    }

    /// Connection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Queue used when callers pass none
    pub fn default_queue(&self) -> &str {
        &self.default_queue
    }

    /// Backend type of the underlying driver
    pub fn driver_type(&self) -> DriverType {
        self.driver.driver_type()
    }

    fn resolve_queue<'a>(&'a self, queue: Option<&'a str>) -> &'a str {
        match queue {
            Some(q) if !q.is_empty() => q,
            _ => &self.default_queue,
        }
    }

    fn check_size(&self, body: &Bytes) -> Result<(), QueueError> {
        let max_size = self.driver.driver_type().max_payload_size();
        if body.len() > max_size {
            return Err(QueueError::PayloadTooLarge {
                size: body.len(),
                max_size,
            });
        }
        Ok(())
    }

    async fn enqueue(&self, body: Bytes, queue: &str, delay: Duration) -> Result<(), QueueError> {
        self.check_size(&body)?;

        let delay = if delay > Duration::zero() && !self.driver.driver_type().supports_delay() {
            warn!(
                connection = %self.name,
                queue = %queue,
                driver = %self.driver.driver_type(),
                "Driver cannot delay delivery, sending immediately"
            );
            Duration::zero()
        } else {
            delay
        };

        self.driver.send(queue, body, delay).await?;

        debug!(
            connection = %self.name,
            queue = %queue,
            delay_ms = delay.num_milliseconds(),
            "Job enqueued"
        );

        Ok(())
    }
}

#[async_trait]
impl QueueConnection for StandardQueueConnection {
    async fn push(
        &self,
        job: &str,
        data: serde_json::Value,
        queue: Option<&str>,
    ) -> Result<(), QueueError> {
        self.later(Duration::zero(), job, data, queue).await
    }

    async fn later(
        &self,
        delay: Duration,
        job: &str,
        data: serde_json::Value,
        queue: Option<&str>,
    ) -> Result<(), QueueError> {
        let queue = self.resolve_queue(queue);
        let payload = JobPayload::new(job, data, queue);
        payload.validate()?;

        self.enqueue(payload.to_bytes()?, queue, delay).await
    }

    async fn push_raw(&self, body: Bytes, queue: Option<&str>) -> Result<(), QueueError> {
        let queue = self.resolve_queue(queue);
        self.enqueue(body, queue, Duration::zero()).await
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>, QueueError> {
        let queue = self.resolve_queue(queue);

        let envelope = match self.driver.receive(queue).await? {
            Some(envelope) => envelope,
            None => return Ok(None),
        };

        debug!(
            connection = %self.name,
            queue = %queue,
            delivery = %envelope.handle,
            "Delivery reserved"
        );

        Ok(Some(Job::new(envelope, Arc::clone(&self.driver))))
    }

    async fn subscribe(
        &self,
        queue: &str,
        url: &str,
        options: &SubscribeOptions,
        advanced: Option<&serde_json::Value>,
    ) -> Result<(), QueueError> {
        self.driver.subscribe(queue, url, options, advanced).await
    }
}

#[cfg(test)]
#[path = "connection_tests.rs"]
mod tests;
