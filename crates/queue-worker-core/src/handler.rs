//! Job handlers and the registry that resolves them by name.

use crate::job::Job;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

/// Code invoked for one job type
///
/// A handler owns the outcome of its delivery: it calls `job.delete()` or
/// `job.release(delay)` before returning `Ok`, or returns an error and lets
/// the worker decide between retrying and dead-lettering. Returning `Ok`
/// without doing either leaves the delivery reserved until the backend's own
/// redelivery timeout.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn fire(&self, job: &mut Job, data: serde_json::Value) -> anyhow::Result<()>;
}

/// Maps job identifiers to handlers
pub trait HandlerResolver: Send + Sync {
    fn resolve(&self, job: &str) -> Option<Arc<dyn JobHandler>>;
}

type BoxedHandlerFn = dyn for<'a> Fn(
        &'a mut Job,
        serde_json::Value,
    ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>
    + Send
    + Sync;

/// Handler backed by a closure returning a boxed future
struct FnHandler {
    func: Box<BoxedHandlerFn>,
}

#[async_trait]
impl JobHandler for FnHandler {
    async fn fire(&self, job: &mut Job, data: serde_json::Value) -> anyhow::Result<()> {
        (self.func)(job, data).await
    }
}

/// In-memory handler registry
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same job
    pub fn register(&mut self, job: impl Into<String>, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(job.into(), handler);
    }

    /// Register a closure as a handler
    ///
    /// ```ignore
    /// registry.register_fn("send-email", |job, data| {
    ///     Box::pin(async move {
    ///         deliver(data).await?;
    ///         job.delete().await?;
    ///         Ok(())
    ///     })
    /// });
    /// ```
    pub fn register_fn<F>(&mut self, job: impl Into<String>, func: F)
    where
        F: for<'a> Fn(
                &'a mut Job,
                serde_json::Value,
            ) -> Pin<Box<dyn Future<Output = anyhow::Result<()>> + Send + 'a>>
            + Send
            + Sync
            + 'static,
    {
        self.register(
            job,
            Arc::new(FnHandler {
                func: Box::new(func),
            }),
        );
    }

    /// Check if a handler is registered for a job
    pub fn contains(&self, job: &str) -> bool {
        self.handlers.contains_key(job)
    }

    /// Registered job identifiers
    pub fn jobs(&self) -> Vec<String> {
        self.handlers.keys().cloned().collect()
    }

    /// Number of registered handlers
    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    /// Check if no handlers are registered
    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl HandlerResolver for HandlerRegistry {
    fn resolve(&self, job: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job).cloned()
    }
}

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;
