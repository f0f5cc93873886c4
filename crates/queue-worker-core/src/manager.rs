//! Named connection resolution and caching.
//!
//! The manager owns the connection cache for its lifetime. Each name is built
//! at most once: concurrent first calls for the same name wait on a shared
//! cell while a single connector call runs. A failed build leaves the cell
//! empty so the next call tries again.

use crate::config::{ConnectionConfig, QueueSettings};
use crate::connection::{Connector, QueueConnection, SubscribeOptions};
use crate::drivers::{IronConnector, MemoryConnector, RabbitMqConnector, SqsConnector};
use crate::error::QueueError;
use crate::events::{EventDispatcher, JobFailedEvent};
use crate::job::Job;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, info, warn};

/// Lazily invoked connector constructor
pub type ConnectorFactory = Arc<dyn Fn() -> Box<dyn Connector> + Send + Sync>;

type ConnectionCell = Arc<OnceCell<Arc<dyn QueueConnection>>>;

/// Resolves connection names to cached connections
pub struct QueueManager {
    settings: QueueSettings,
    default_name: RwLock<String>,
    connectors: RwLock<HashMap<String, ConnectorFactory>>,
    connections: Mutex<HashMap<String, ConnectionCell>>,
    events: EventDispatcher,
}

impl QueueManager {
    /// Create a manager with no connectors registered
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            default_name: RwLock::new(settings.default.clone()),
            settings,
            connectors: RwLock::new(HashMap::new()),
            connections: Mutex::new(HashMap::new()),
            events: EventDispatcher::new(),
        }
    }

    /// Create a manager with the built-in memory, sqs, rabbitmq and iron connectors
    pub fn with_default_connectors(settings: QueueSettings) -> Self {
        let manager = Self::new(settings);
        manager.extend("memory", || Box::new(MemoryConnector));
        manager.extend("sqs", || Box::new(SqsConnector));
        manager.extend("rabbitmq", || Box::new(RabbitMqConnector));
        manager.extend("iron", || Box::new(IronConnector));
        manager
    }

    /// Get a connection, building and caching it on first use
    ///
    /// `None` resolves the default connection name.
    ///
    /// # Errors
    ///
    /// - `ConnectionNotConfigured` when the name has no configuration entry
    /// - `UnknownConnector` when no connector is registered for its driver
    /// - whatever the connector returns, e.g. a missing configuration key
    pub async fn connection(
        &self,
        name: Option<&str>,
    ) -> Result<Arc<dyn QueueConnection>, QueueError> {
        let name = self.get_name(name);

        let cell = {
            let mut connections = self
                .connections
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            Arc::clone(connections.entry(name.clone()).or_default())
        };

        let connection = cell.get_or_try_init(|| self.resolve(&name)).await?;
        Ok(Arc::clone(connection))
    }

    async fn resolve(&self, name: &str) -> Result<Arc<dyn QueueConnection>, QueueError> {
        let config = self.configuration(name)?;
        let connector = self.connector(&config.driver)?;

        info!(connection = %name, driver = %config.driver, "Resolving queue connection");

        connector.connect(name, config).await.map_err(|e| {
            warn!(connection = %name, driver = %config.driver, error = %e, "Failed to build queue connection");
            e
        })
    }

    fn configuration(&self, name: &str) -> Result<&ConnectionConfig, QueueError> {
        self.settings
            .connection(name)
            .ok_or_else(|| QueueError::ConnectionNotConfigured {
                name: name.to_string(),
            })
    }

    fn connector(&self, driver: &str) -> Result<Box<dyn Connector>, QueueError> {
        let factory = self
            .connectors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(driver)
            .cloned()
            .ok_or_else(|| QueueError::UnknownConnector {
                driver: driver.to_string(),
            })?;

        Ok(factory())
    }

    /// Register a connector factory for a driver, replacing any previous one
    pub fn extend<F>(&self, driver: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Connector> + Send + Sync + 'static,
    {
        let driver = driver.into();
        debug!(driver = %driver, "Registering queue connector");

        self.connectors
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(driver, Arc::new(factory));
    }

    /// Same as [`extend`](Self::extend)
    pub fn add_connector<F>(&self, driver: impl Into<String>, factory: F)
    where
        F: Fn() -> Box<dyn Connector> + Send + Sync + 'static,
    {
        self.extend(driver, factory);
    }

    /// Check if a connector is registered for a driver
    pub fn has_connector(&self, driver: &str) -> bool {
        self.connectors
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .contains_key(driver)
    }

    /// Check if a connection has already been built
    pub fn connected(&self, name: Option<&str>) -> bool {
        let name = self.get_name(name);
        self.connections
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(&name)
            .is_some_and(|cell| cell.initialized())
    }

    /// The given name, or the default connection name when none is given
    pub fn get_name(&self, name: Option<&str>) -> String {
        match name {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => self.default_name(),
        }
    }

    /// Default connection name
    pub fn default_name(&self) -> String {
        self.default_name
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Replace the default connection name
    pub fn set_default_name(&self, name: impl Into<String>) {
        *self
            .default_name
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = name.into();
    }

    /// Register a listener for dead-lettered jobs
    pub fn failing<F>(&self, listener: F)
    where
        F: Fn(&JobFailedEvent) + Send + Sync + 'static,
    {
        self.events.listen(listener);
    }

    /// Event dispatcher shared with workers
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// Configuration the manager was built with
    pub fn settings(&self) -> &QueueSettings {
        &self.settings
    }
}

impl std::fmt::Debug for QueueManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueueManager")
            .field("default", &self.default_name())
            .field("configured", &self.settings.connections.len())
            .field("events", &self.events)
            .finish()
    }
}

/// The manager stands in for its default connection
#[async_trait]
impl QueueConnection for QueueManager {
    async fn push(
        &self,
        job: &str,
        data: serde_json::Value,
        queue: Option<&str>,
    ) -> Result<(), QueueError> {
        self.connection(None).await?.push(job, data, queue).await
    }

    async fn later(
        &self,
        delay: Duration,
        job: &str,
        data: serde_json::Value,
        queue: Option<&str>,
    ) -> Result<(), QueueError> {
        self.connection(None)
            .await?
            .later(delay, job, data, queue)
            .await
    }

    async fn push_raw(&self, body: Bytes, queue: Option<&str>) -> Result<(), QueueError> {
        self.connection(None).await?.push_raw(body, queue).await
    }

    async fn pop(&self, queue: Option<&str>) -> Result<Option<Job>, QueueError> {
        self.connection(None).await?.pop(queue).await
    }

    async fn subscribe(
        &self,
        queue: &str,
        url: &str,
        options: &SubscribeOptions,
        advanced: Option<&serde_json::Value>,
    ) -> Result<(), QueueError> {
        self.connection(None)
            .await?
            .subscribe(queue, url, options, advanced)
            .await
    }
}

#[cfg(test)]
#[path = "manager_tests.rs"]
mod tests;
