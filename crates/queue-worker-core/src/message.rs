//! Wire-level types: the job payload and the envelope a backend delivers it in.

use crate::config::DriverType;
use crate::error::{QueueError, SerializationError, ValidationError};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

// ============================================================================
// Timestamps
// ============================================================================

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Job Payload
// ============================================================================

/// The logical job carried in an envelope body
///
/// Field order is significant: it is the serialised order on the wire, so a
/// payload pushed by another producer in `job, data, attempts, queue` order
/// comes back out of `release` or dead-lettering with the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Identifier the handler resolver maps to code
    pub job: String,
    /// Opaque handler input
    pub data: serde_json::Value,
    /// Deliveries of this logical job so far, including the current one
    pub attempts: u32,
    /// Logical queue the job belongs to
    pub queue: String,
}

impl JobPayload {
    /// Create a first-attempt payload
    pub fn new(job: impl Into<String>, data: serde_json::Value, queue: impl Into<String>) -> Self {
        Self {
            job: job.into(),
            data,
            attempts: 1,
            queue: queue.into(),
        }
    }

    /// Validate the fields a handler relies on
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.job.is_empty() {
            return Err(ValidationError::Required {
                field: "job".to_string(),
            });
        }

        if self.attempts == 0 {
            return Err(ValidationError::OutOfRange {
                field: "attempts".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    /// Copy of this payload for the next delivery
    pub fn next_attempt(&self) -> Self {
        Self {
            attempts: self.attempts.saturating_add(1),
            ..self.clone()
        }
    }

    /// Serialise to the JSON wire format
    pub fn to_bytes(&self) -> Result<Bytes, QueueError> {
        let encoded = serde_json::to_vec(self).map_err(SerializationError::from)?;
        Ok(Bytes::from(encoded))
    }

    /// Decode an envelope body
    ///
    /// # Errors
    ///
    /// Any body that is not a JSON object with the four payload fields, or that
    /// fails validation, is reported as `QueueError::CorruptPayload`.
    pub fn from_bytes(body: &[u8]) -> Result<Self, QueueError> {
        let payload: Self =
            serde_json::from_slice(body).map_err(|e| QueueError::CorruptPayload {
                message: e.to_string(),
            })?;

        payload
            .validate()
            .map_err(|e| QueueError::CorruptPayload {
                message: e.to_string(),
            })?;

        Ok(payload)
    }
}

// ============================================================================
// Envelope
// ============================================================================

/// Opaque backend token used to acknowledge or requeue one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryHandle {
    token: String,
    driver: DriverType,
}

impl DeliveryHandle {
    /// Create new delivery handle
    pub fn new(token: impl Into<String>, driver: DriverType) -> Self {
        Self {
            token: token.into(),
            driver,
        }
    }

    /// Get handle token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Get the driver that issued the handle
    pub fn driver(&self) -> DriverType {
        self.driver
    }
}

impl std::fmt::Display for DeliveryHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.driver, self.token)
    }
}

/// One physical delivery taken off a queue
#[derive(Debug, Clone)]
pub struct Envelope {
    pub handle: DeliveryHandle,
    /// Physical queue the delivery came from
    pub queue: String,
    pub body: Bytes,
    /// Backend-reported receive count, when the backend tracks one
    pub delivery_count: u32,
    pub received_at: Timestamp,
}

impl Envelope {
    /// Create an envelope received now
    pub fn new(handle: DeliveryHandle, queue: impl Into<String>, body: Bytes) -> Self {
        Self {
            handle,
            queue: queue.into(),
            body,
            delivery_count: 1,
            received_at: Timestamp::now(),
        }
    }

    /// Set the backend receive count
    pub fn with_delivery_count(mut self, count: u32) -> Self {
        self.delivery_count = count;
        self
    }

    /// Body as UTF-8 text, lossy for diagnostics
    pub fn body_text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
