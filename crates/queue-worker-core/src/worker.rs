//! The job processing loop.
//!
//! One worker runs one job at a time: pop, fire, then settle the delivery.
//! A handler failure never escapes [`Worker::process`]. It becomes either a
//! release with an incremented attempt count or a dead-letter record followed
//! by deleting the delivery. A delivery whose reservation the backend no
//! longer knows is reported as [`JobOutcome::Lost`]. Errors that do escape
//! come from the queue backend or the failed job store.

use crate::error::QueueError;
use crate::events::JobFailedEvent;
use crate::failed::FailedJobStore;
use crate::handler::HandlerResolver;
use crate::job::{Job, JobState};
use crate::manager::QueueManager;
use chrono::Duration;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Settings for one worker run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerOptions {
    /// Delay before a released job becomes visible again
    pub delay: Duration,
    /// Pause after finding the queue empty
    pub sleep: std::time::Duration,
    /// Attempts before a job is dead-lettered; 0 retries forever
    pub max_tries: u32,
    /// End the daemon loop once the queue is drained
    pub stop_on_empty: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            delay: Duration::zero(),
            sleep: std::time::Duration::from_secs(3),
            max_tries: 0,
            stop_on_empty: false,
        }
    }
}

/// What processing did with a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Deleted,
    Released,
    /// Dead-lettered and deleted
    Failed,
    /// The handler returned without deleting or releasing
    Unacknowledged,
    /// The reservation expired before the delivery could be settled
    Lost,
}

impl JobOutcome {
    fn from_state(state: JobState) -> Self {
        match state {
            JobState::Deleted => Self::Deleted,
            JobState::Released => Self::Released,
            JobState::Failed => Self::Failed,
            JobState::Lost => Self::Lost,
            JobState::Reserved | JobState::Fired => Self::Unacknowledged,
        }
    }
}

/// Cooperative stop request for [`Worker::daemon`]
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    receiver: watch::Receiver<bool>,
}

impl ShutdownSignal {
    pub fn new(receiver: watch::Receiver<bool>) -> Self {
        Self { receiver }
    }

    /// Create a signal and the sender that triggers it by sending `true`
    pub fn channel() -> (watch::Sender<bool>, Self) {
        let (sender, receiver) = watch::channel(false);
        (sender, Self::new(receiver))
    }

    /// A signal that never fires
    pub fn never() -> Self {
        let (_sender, receiver) = watch::channel(false);
        Self::new(receiver)
    }

    pub fn is_stop_requested(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Resolve once a stop has been requested
    ///
    /// Never resolves if the sender is dropped without requesting a stop.
    pub async fn stopped(&mut self) {
        loop {
            if *self.receiver.borrow_and_update() {
                return;
            }
            if self.receiver.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Pulls jobs from a named connection and runs them
pub struct Worker {
    manager: Arc<QueueManager>,
    failed: Arc<dyn FailedJobStore>,
    resolver: Arc<dyn HandlerResolver>,
}

impl Worker {
    pub fn new(
        manager: Arc<QueueManager>,
        failed: Arc<dyn FailedJobStore>,
        resolver: Arc<dyn HandlerResolver>,
    ) -> Self {
        Self {
            manager,
            failed,
            resolver,
        }
    }

    /// Process jobs until stopped, drained (with `stop_on_empty`) or a permanent error
    ///
    /// The stop signal is checked between jobs and interrupts the empty-queue
    /// sleep. A job that is running always finishes first.
    pub async fn daemon(
        &self,
        connection: Option<&str>,
        queue: Option<&str>,
        options: &WorkerOptions,
        mut shutdown: ShutdownSignal,
    ) -> Result<(), QueueError> {
        let name = self.manager.get_name(connection);
        info!(
            connection = %name,
            queue = ?queue,
            max_tries = options.max_tries,
            "Worker started"
        );

        let mut processed: u64 = 0;

        loop {
            if shutdown.is_stop_requested() {
                info!(connection = %name, processed, "Worker stopping on request");
                return Ok(());
            }

            match self.run_next_job(Some(&name), queue, options).await {
                Ok(Some(outcome)) => {
                    processed += 1;
                    debug!(connection = %name, outcome = ?outcome, "Job processed");
                }
                Ok(None) => {
                    if options.stop_on_empty {
                        info!(connection = %name, processed, "Queue drained, worker stopping");
                        return Ok(());
                    }
                    Self::pause(options.sleep, &mut shutdown).await;
                }
                Err(e) if e.is_transient() => {
                    let pause = e
                        .retry_after()
                        .and_then(|d| d.to_std().ok())
                        .unwrap_or(options.sleep);
                    warn!(
                        connection = %name,
                        error = %e,
                        pause_ms = pause.as_millis() as u64,
                        "Transient queue error, backing off"
                    );
                    Self::pause(pause, &mut shutdown).await;
                }
                Err(e) => {
                    error!(connection = %name, error = %e, processed, "Worker stopped on error");
                    return Err(e);
                }
            }
        }
    }

    async fn pause(duration: std::time::Duration, shutdown: &mut ShutdownSignal) {
        tokio::select! {
            _ = tokio::time::sleep(duration) => {}
            _ = shutdown.stopped() => {}
        }
    }

    /// Pop and process one job, returning `None` when the queue is empty
    pub async fn run_next_job(
        &self,
        connection: Option<&str>,
        queue: Option<&str>,
        options: &WorkerOptions,
    ) -> Result<Option<JobOutcome>, QueueError> {
        let name = self.manager.get_name(connection);
        let connection = self.manager.connection(Some(&name)).await?;

        let Some(job) = connection.pop(queue).await? else {
            return Ok(None);
        };

        self.process(&name, job, options.max_tries, options.delay)
            .await
            .map(Some)
    }

    /// Fire one job and settle its delivery
    pub async fn process(
        &self,
        connection: &str,
        mut job: Job,
        max_tries: u32,
        delay: Duration,
    ) -> Result<JobOutcome, QueueError> {
        // A delivery already past the limit is not fired again
        if max_tries > 0 && job.attempts() > max_tries {
            warn!(
                connection = %connection,
                queue = %job.queue(),
                attempts = job.attempts(),
                max_tries,
                "Job exceeded maximum attempts before firing"
            );
            return self.log_failed_job(connection, &mut job).await;
        }

        match job.fire(self.resolver.as_ref()).await {
            Ok(()) => {
                let outcome = JobOutcome::from_state(job.state());
                match outcome {
                    JobOutcome::Unacknowledged => warn!(
                        connection = %connection,
                        queue = %job.queue(),
                        handler = ?job.name(),
                        "Handler returned without deleting or releasing the job"
                    ),
                    JobOutcome::Lost => warn!(
                        connection = %connection,
                        queue = %job.queue(),
                        handler = ?job.name(),
                        "Job reservation lost while the handler ran"
                    ),
                    _ => {}
                }
                Ok(outcome)
            }
            Err(e) => {
                self.handle_job_failure(connection, &mut job, max_tries, delay, e)
                    .await
            }
        }
    }

    async fn handle_job_failure(
        &self,
        connection: &str,
        job: &mut Job,
        max_tries: u32,
        delay: Duration,
        failure: QueueError,
    ) -> Result<JobOutcome, QueueError> {
        warn!(
            connection = %connection,
            queue = %job.queue(),
            handler = ?job.name(),
            attempts = job.attempts(),
            error = %failure,
            "Job failed"
        );

        if job.is_acknowledged() {
            // The handler settled or lost the delivery before failing
            return Ok(JobOutcome::from_state(job.state()));
        }

        if max_tries > 0 && job.attempts() >= max_tries {
            return self.log_failed_job(connection, job).await;
        }

        match job.release(delay).await {
            Ok(()) => Ok(JobOutcome::Released),
            Err(_) if job.is_lost() => Ok(JobOutcome::Lost),
            Err(e) => Err(e),
        }
    }

    /// Record a job in the failed job store and delete its delivery
    ///
    /// The delivery is deleted even when the store write fails, so a broken
    /// store cannot cause endless redelivery. The store error is returned
    /// afterwards and no failure event is raised. A delivery lost before the
    /// delete keeps its record but raises no event either.
    async fn log_failed_job(
        &self,
        connection: &str,
        job: &mut Job,
    ) -> Result<JobOutcome, QueueError> {
        let payload = String::from_utf8_lossy(job.raw_body()).into_owned();
        let queue = job.queue().to_string();

        error!(
            connection = %connection,
            queue = %queue,
            attempts = job.attempts(),
            payload = %payload,
            "Dead-lettering job"
        );

        let logged = self.failed.log(connection, &queue, &payload).await;
        if let Err(e) = &logged {
            error!(connection = %connection, queue = %queue, error = %e, "Failed to record failed job");
        }

        match job.fail().await {
            Ok(()) => {}
            Err(_) if job.is_lost() => {
                logged?;
                return Ok(JobOutcome::Lost);
            }
            Err(e) => return Err(e),
        }
        logged?;

        self.manager.events().dispatch(&JobFailedEvent {
            connection: connection.to_string(),
            queue,
            payload,
        });

        Ok(JobOutcome::Failed)
    }
}

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;
