//! Notifications raised while processing jobs.

use std::sync::{Arc, RwLock};
use tracing::warn;

/// Raised after a job has been dead-lettered
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailedEvent {
    pub connection: String,
    pub queue: String,
    pub payload: String,
}

type Listener = Arc<dyn Fn(&JobFailedEvent) + Send + Sync>;

/// Synchronous fan-out of job events to registered listeners
#[derive(Clone, Default)]
pub struct EventDispatcher {
    listeners: Arc<RwLock<Vec<Listener>>>,
}

impl EventDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for failed jobs
    pub fn listen<F>(&self, listener: F)
    where
        F: Fn(&JobFailedEvent) + Send + Sync + 'static,
    {
        match self.listeners.write() {
            Ok(mut listeners) => listeners.push(Arc::new(listener)),
            Err(_) => warn!("Event listener registry is poisoned, listener dropped"),
        }
    }

    /// Call every listener with the event, in registration order
    pub fn dispatch(&self, event: &JobFailedEvent) {
        // Listeners run outside the lock so they may register further listeners
        let listeners = match self.listeners.read() {
            Ok(listeners) => listeners.clone(),
            Err(_) => {
                warn!("Event listener registry is poisoned, event not dispatched");
                return;
            }
        };

        for listener in listeners {
            listener(event);
        }
    }

    /// Number of registered listeners
    pub fn listener_count(&self) -> usize {
        self.listeners.read().map(|l| l.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for EventDispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventDispatcher")
            .field("listeners", &self.listener_count())
            .finish()
    }
}

#[cfg(test)]
#[path = "events_tests.rs"]
mod tests;
