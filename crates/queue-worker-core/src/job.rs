//! A reserved delivery and the operations that settle it.

use crate::drivers::QueueDriver;
use crate::error::QueueError;
use crate::handler::HandlerResolver;
use crate::message::{Envelope, JobPayload};
use bytes::Bytes;
use chrono::Duration;
use std::sync::Arc;
use tracing::{debug, error, warn};

/// Lifecycle state of one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Reserved,
    Fired,
    Deleted,
    Released,
    Failed,
    /// The backend no longer knows the reservation, usually because it
    /// expired and the message went to another consumer
    Lost,
}

impl JobState {
    /// Check if the delivery has been settled or lost
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Deleted | Self::Released | Self::Failed | Self::Lost
        )
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Reserved => "reserved",
            Self::Fired => "fired",
            Self::Deleted => "deleted",
            Self::Released => "released",
            Self::Failed => "failed",
            Self::Lost => "lost",
        };
        f.write_str(name)
    }
}

/// One reserved delivery popped from a connection
///
/// Exactly one of `delete`, `release` or `fail` succeeds per instance. Any
/// later attempt returns `QueueError::AlreadyAcknowledged`. A settle call the
/// backend answers with `MessageNotFound` moves the job to [`JobState::Lost`],
/// after which nothing more can be done with it.
pub struct Job {
    envelope: Envelope,
    driver: Arc<dyn QueueDriver>,
    payload: Result<JobPayload, String>,
    state: JobState,
}

impl Job {
    /// Wrap a delivery, decoding its payload
    pub fn new(envelope: Envelope, driver: Arc<dyn QueueDriver>) -> Self {
        let payload = JobPayload::from_bytes(&envelope.body).map_err(|e| e.to_string());

        Self {
            envelope,
            driver,
            payload,
            state: JobState::Reserved,
        }
    }

    /// Resolve the handler named in the payload and invoke it once
    ///
    /// # Errors
    ///
    /// - `CorruptPayload` when the body could not be decoded
    /// - `HandlerNotFound` when nothing is registered for the job name
    /// - `HandlerFailed` wrapping whatever the handler returned
    pub async fn fire(&mut self, resolver: &dyn HandlerResolver) -> Result<(), QueueError> {
        if self.state != JobState::Reserved {
            return Err(self.already_settled("fire"));
        }

        let payload = self.payload()?.clone();
        let handler = resolver
            .resolve(&payload.job)
            .ok_or_else(|| QueueError::HandlerNotFound {
                handler: payload.job.clone(),
            })?;

        self.state = JobState::Fired;
        debug!(
            handler = %payload.job,
            attempts = payload.attempts,
            delivery = %self.envelope.handle,
            "Firing job"
        );

        handler
            .fire(self, payload.data)
            .await
            .map_err(|e| QueueError::HandlerFailed {
                handler: payload.job,
                source: e.into(),
            })
    }

    /// Acknowledge the delivery, removing it from the queue
    pub async fn delete(&mut self) -> Result<(), QueueError> {
        self.ensure_open("delete")?;

        let acknowledged = self.driver.acknowledge(&self.envelope).await;
        if let Err(e) = acknowledged {
            return Err(self.settle_failed(e));
        }
        self.state = JobState::Deleted;

        debug!(delivery = %self.envelope.handle, queue = %self.envelope.queue, "Job deleted");
        Ok(())
    }

    /// Put the job back with its attempt count incremented
    ///
    /// The new delivery is not visible before `delay` has passed. A body that
    /// did not decode is put back unchanged and its attempts are counted by
    /// the backend instead.
    pub async fn release(&mut self, delay: Duration) -> Result<(), QueueError> {
        self.ensure_open("release")?;

        let (result, attempts) = match &self.payload {
            Ok(payload) => {
                let next = payload.next_attempt();
                let body = next.to_bytes()?;
                let result = self
                    .driver
                    .requeue(&self.envelope, body, &self.envelope.queue, delay)
                    .await;
                (result, next.attempts)
            }
            Err(_) => {
                let result = self.driver.redeliver(&self.envelope, delay).await;
                (result, self.envelope.delivery_count.saturating_add(1))
            }
        };

        if let Err(e) = result {
            return Err(self.settle_failed(e));
        }
        self.state = JobState::Released;

        debug!(
            delivery = %self.envelope.handle,
            queue = %self.envelope.queue,
            attempts,
            delay_ms = delay.num_milliseconds(),
            "Job released"
        );
        Ok(())
    }

    /// Acknowledge the delivery after it has been dead-lettered
    pub async fn fail(&mut self) -> Result<(), QueueError> {
        self.ensure_open("fail")?;

        let acknowledged = self.driver.acknowledge(&self.envelope).await;
        if let Err(e) = acknowledged {
            return Err(self.settle_failed(e));
        }
        self.state = JobState::Failed;
        Ok(())
    }

    /// Deliveries of this job so far, including this one
    ///
    /// Falls back to the backend receive count when the payload is corrupt.
    pub fn attempts(&self) -> u32 {
        match &self.payload {
            Ok(payload) => payload.attempts,
            Err(_) => self.envelope.delivery_count,
        }
    }

    /// Decoded payload
    pub fn payload(&self) -> Result<&JobPayload, QueueError> {
        self.payload
            .as_ref()
            .map_err(|message| QueueError::CorruptPayload {
                message: message.clone(),
            })
    }

    /// Job identifier, when the payload decoded
    pub fn name(&self) -> Option<&str> {
        self.payload.as_ref().ok().map(|p| p.job.as_str())
    }

    /// Undecoded body, for diagnostics and dead-lettering
    pub fn raw_body(&self) -> &Bytes {
        &self.envelope.body
    }

    /// Physical queue the delivery came from
    pub fn queue(&self) -> &str {
        &self.envelope.queue
    }

    /// Logical queue named in the payload, else the physical one
    pub fn payload_queue(&self) -> &str {
        match &self.payload {
            Ok(payload) if !payload.queue.is_empty() => &payload.queue,
            _ => &self.envelope.queue,
        }
    }

    /// Envelope this job wraps
    pub fn envelope(&self) -> &Envelope {
        &self.envelope
    }

    /// Current lifecycle state
    pub fn state(&self) -> JobState {
        self.state
    }

    /// Check if the delivery has been deleted, released or failed
    pub fn is_acknowledged(&self) -> bool {
        self.state.is_terminal()
    }

    /// Check if the backend dropped the reservation under this job
    pub fn is_lost(&self) -> bool {
        self.state == JobState::Lost
    }

    fn settle_failed(&mut self, error: QueueError) -> QueueError {
        if matches!(error, QueueError::MessageNotFound { .. }) {
            warn!(
                delivery = %self.envelope.handle,
                queue = %self.envelope.queue,
                "Reservation lost before the job was settled"
            );
            self.state = JobState::Lost;
        }
        error
    }

    fn ensure_open(&self, operation: &str) -> Result<(), QueueError> {
        if self.state.is_terminal() {
            return Err(self.already_settled(operation));
        }
        Ok(())
    }

    fn already_settled(&self, operation: &str) -> QueueError {
        error!(
            delivery = %self.envelope.handle,
            state = %self.state,
            operation = operation,
            "Job operation on a settled delivery"
        );

        QueueError::AlreadyAcknowledged {
            handle: self.envelope.handle.to_string(),
            state: self.state.to_string(),
        }
    }
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("handle", &self.envelope.handle)
            .field("queue", &self.envelope.queue)
            .field("name", &self.name())
            .field("attempts", &self.attempts())
            .field("state", &self.state)
            .finish()
    }
}

#[cfg(test)]
#[path = "job_tests.rs"]
mod tests;
