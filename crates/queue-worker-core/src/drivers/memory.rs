//! In-memory driver for tests, development and single-process deployments.
//!
//! Messages live in per-queue FIFO buffers behind a lock. A reservation hides
//! a message from other consumers until it is acknowledged, or until the
//! optional visibility timeout lapses and the message becomes visible again.

use crate::config::{ConnectionConfig, DriverType};
use crate::connection::{Connector, QueueConnection, StandardQueueConnection};
use crate::drivers::QueueDriver;
use crate::error::QueueError;
use crate::message::{DeliveryHandle, Envelope};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock, RwLockWriteGuard};

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

// ============================================================================
// Internal Storage Structures
// ============================================================================

#[derive(Default)]
struct QueueStorage {
    queues: HashMap<String, VecDeque<StoredMessage>>,
}

struct StoredMessage {
    body: Bytes,
    available_at: DateTime<Utc>,
    receive_count: u32,
    reservation: Option<Reservation>,
}

impl StoredMessage {
    fn new(body: Bytes, delay: Duration) -> Self {
        Self {
            body,
            available_at: visible_after(delay),
            receive_count: 0,
            reservation: None,
        }
    }

    fn is_available(&self, now: DateTime<Utc>) -> bool {
        if now < self.available_at {
            return false;
        }

        match &self.reservation {
            None => true,
            Some(reservation) => reservation.is_expired(now),
        }
    }
}

/// Instant a delay ends, saturating at the far future
fn visible_after(delay: Duration) -> DateTime<Utc> {
    Utc::now()
        .checked_add_signed(delay.max(Duration::zero()))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

struct Reservation {
    token: String,
    expires_at: Option<DateTime<Utc>>,
}

impl Reservation {
    fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expires_at.is_some_and(|expires_at| now >= expires_at)
    }
}

// ============================================================================
// MemoryDriver
// ============================================================================

/// Process-local queue driver
#[derive(Clone)]
pub struct MemoryDriver {
    storage: Arc<RwLock<QueueStorage>>,
    visibility_timeout: Option<Duration>,
}

impl MemoryDriver {
    /// Create a driver whose reservations never expire
    pub fn new() -> Self {
        Self {
            storage: Arc::new(RwLock::new(QueueStorage::default())),
            visibility_timeout: None,
        }
    }

    /// Make unacknowledged reservations visible again after `timeout`
    pub fn with_visibility_timeout(mut self, timeout: Duration) -> Self {
        self.visibility_timeout = Some(timeout);
        self
    }

    /// Number of messages in a queue, reserved or not
    pub fn len(&self, queue: &str) -> usize {
        self.storage
            .read()
            .map(|storage| storage.queues.get(queue).map_or(0, VecDeque::len))
            .unwrap_or(0)
    }

    /// Check if a queue holds no messages at all
    pub fn is_empty(&self, queue: &str) -> bool {
        self.len(queue) == 0
    }

    /// Number of messages currently held by a consumer
    pub fn reserved(&self, queue: &str) -> usize {
        let now = Utc::now();
        self.storage
            .read()
            .map(|storage| {
                storage.queues.get(queue).map_or(0, |messages| {
                    messages
                        .iter()
                        .filter(|m| m.reservation.as_ref().is_some_and(|r| !r.is_expired(now)))
                        .count()
                })
            })
            .unwrap_or(0)
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, QueueStorage>, QueueError> {
        self.storage.write().map_err(|_| QueueError::ProviderError {
            provider: "memory".to_string(),
            code: "LockPoisoned".to_string(),
            message: "queue storage lock was poisoned".to_string(),
        })
    }

    fn reserved_position<'a>(
        storage: &'a mut QueueStorage,
        envelope: &Envelope,
    ) -> Result<(&'a mut VecDeque<StoredMessage>, usize), QueueError> {
        let messages =
            storage
                .queues
                .get_mut(&envelope.queue)
                .ok_or_else(|| QueueError::QueueNotFound {
                    queue_name: envelope.queue.clone(),
                })?;

        let position = messages
            .iter()
            .position(|m| {
                m.reservation
                    .as_ref()
                    .is_some_and(|r| r.token == envelope.handle.token())
            })
            .ok_or_else(|| QueueError::MessageNotFound {
                handle: envelope.handle.to_string(),
            })?;

        Ok((messages, position))
    }

    fn take_reserved(
        storage: &mut QueueStorage,
        envelope: &Envelope,
    ) -> Result<StoredMessage, QueueError> {
        let (messages, position) = Self::reserved_position(storage, envelope)?;
        messages
            .remove(position)
            .ok_or_else(|| QueueError::MessageNotFound {
                handle: envelope.handle.to_string(),
            })
    }

    fn find_reserved<'a>(
        storage: &'a mut QueueStorage,
        envelope: &Envelope,
    ) -> Result<&'a mut StoredMessage, QueueError> {
        let (messages, position) = Self::reserved_position(storage, envelope)?;
        messages
            .get_mut(position)
            .ok_or_else(|| QueueError::MessageNotFound {
                handle: envelope.handle.to_string(),
            })
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    async fn send(&self, queue: &str, body: Bytes, delay: Duration) -> Result<(), QueueError> {
        let mut storage = self.write()?;
        storage
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage::new(body, delay));
        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Envelope>, QueueError> {
        let now = Utc::now();
        let mut storage = self.write()?;

        let Some(messages) = storage.queues.get_mut(queue) else {
            return Ok(None);
        };

        let Some(message) = messages.iter_mut().find(|m| m.is_available(now)) else {
            return Ok(None);
        };

        let token = uuid::Uuid::new_v4().to_string();
        message.receive_count += 1;
        message.reservation = Some(Reservation {
            token: token.clone(),
            expires_at: self
                .visibility_timeout
                .and_then(|timeout| now.checked_add_signed(timeout)),
        });

        let envelope = Envelope::new(
            DeliveryHandle::new(token, DriverType::Memory),
            queue,
            message.body.clone(),
        )
        .with_delivery_count(message.receive_count);

        Ok(Some(envelope))
    }

    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let mut storage = self.write()?;
        Self::take_reserved(&mut storage, envelope)?;
        Ok(())
    }

    /// Swaps the held message for the new body under a single lock.
    async fn requeue(
        &self,
        envelope: &Envelope,
        body: Bytes,
        queue: &str,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let mut storage = self.write()?;
        Self::take_reserved(&mut storage, envelope)?;
        storage
            .queues
            .entry(queue.to_string())
            .or_default()
            .push_back(StoredMessage::new(body, delay));
        Ok(())
    }

    /// Clears the reservation in place, keeping the receive count.
    async fn redeliver(&self, envelope: &Envelope, delay: Duration) -> Result<(), QueueError> {
        let mut storage = self.write()?;
        let message = Self::find_reserved(&mut storage, envelope)?;
        message.reservation = None;
        message.available_at = visible_after(delay);
        Ok(())
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Memory
    }
}

// ============================================================================
// MemoryConnector
// ============================================================================

/// Builds memory connections
///
/// Keys: `queue` (default `default`), `visibility_timeout` in seconds.
#[derive(Debug, Default, Clone)]
pub struct MemoryConnector;

impl MemoryConnector {
    /// Build the driver alone, for callers that want to inspect it
    pub fn driver(config: &ConnectionConfig) -> Result<MemoryDriver, QueueError> {
        let mut driver = MemoryDriver::new();
        if let Some(seconds) = config.optional_u64("visibility_timeout")? {
            let timeout = i64::try_from(seconds)
                .ok()
                .and_then(Duration::try_seconds)
                .ok_or_else(|| {
                    QueueError::invalid_config(format!(
                        "'visibility_timeout' of {} seconds is out of range",
                        seconds
                    ))
                })?;
            driver = driver.with_visibility_timeout(timeout);
        }
        Ok(driver)
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn QueueConnection>, QueueError> {
        let queue = config
            .optional_str("queue")?
            .unwrap_or_else(|| "default".to_string());
        let driver = Self::driver(config)?;

        Ok(Arc::new(StandardQueueConnection::new(
            name,
            queue,
            Arc::new(driver),
        )))
    }
}
