//! Driver types and connection configuration.

use crate::error::QueueError;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Enumeration of supported queue drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverType {
    Memory,
    Sqs,
    RabbitMq,
    Iron,
    /// Driver registered by the application through `QueueManager::extend`
    Custom,
}

impl DriverType {
    /// Driver name as used in the `driver` configuration key
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Sqs => "sqs",
            Self::RabbitMq => "rabbitmq",
            Self::Iron => "iron",
            Self::Custom => "custom",
        }
    }

    /// Check if the backend can hold a message back until a later time
    pub fn supports_delay(&self) -> bool {
        match self {
            Self::Memory => true,
            Self::Sqs => true,
            Self::RabbitMq => true, // Via TTL'd deferred queues
            Self::Iron => true,
            Self::Custom => false,
        }
    }

    /// Longest delay the backend accepts natively
    pub fn max_delay(&self) -> Option<Duration> {
        match self {
            Self::Sqs => Some(Duration::seconds(900)),
            Self::Iron => Some(Duration::days(7)),
            _ => None,
        }
    }

    /// Get maximum payload size for the backend
    pub fn max_payload_size(&self) -> usize {
        match self {
            Self::Memory => 10 * 1024 * 1024, // 10MB
            Self::Sqs => 256 * 1024,          // 256KB
            Self::RabbitMq => 16 * 1024 * 1024,
            Self::Iron => 64 * 1024, // 64KB
            Self::Custom => usize::MAX,
        }
    }

    /// Check if the backend can push deliveries to an HTTP endpoint
    pub fn supports_push_subscriptions(&self) -> bool {
        matches!(self, Self::Iron)
    }
}

impl std::fmt::Display for DriverType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Queue configuration: the default connection name plus every named connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSettings {
    /// Name of the connection used when none is given
    #[serde(default = "default_connection_name")]
    pub default: String,

    /// Named connections
    #[serde(default)]
    pub connections: HashMap<String, ConnectionConfig>,
}

fn default_connection_name() -> String {
    "memory".to_string()
}

impl Default for QueueSettings {
    fn default() -> Self {
        let mut connections = HashMap::new();
        connections.insert("memory".to_string(), ConnectionConfig::new("memory"));

        Self {
            default: default_connection_name(),
            connections,
        }
    }
}

impl QueueSettings {
    /// Create settings with a default connection name and no connections
    pub fn new(default: impl Into<String>) -> Self {
        Self {
            default: default.into(),
            connections: HashMap::new(),
        }
    }

    /// Add a named connection
    pub fn with_connection(mut self, name: impl Into<String>, config: ConnectionConfig) -> Self {
        self.connections.insert(name.into(), config);
        self
    }

    /// Look up the configuration for a connection name
    pub fn connection(&self, name: &str) -> Option<&ConnectionConfig> {
        self.connections.get(name)
    }
}

/// Configuration for one named connection
///
/// Everything except `driver` is driver-specific and kept as raw JSON values
/// so each connector can validate the keys it needs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConnectionConfig {
    pub driver: String,

    #[serde(flatten)]
    pub options: HashMap<String, serde_json::Value>,
}

impl ConnectionConfig {
    /// Create an empty configuration for a driver
    pub fn new(driver: impl Into<String>) -> Self {
        Self {
            driver: driver.into(),
            options: HashMap::new(),
        }
    }

    /// Add a driver option
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<serde_json::Value>) -> Self {
        self.options.insert(key.into(), value.into());
        self
    }

    /// Get a required string option
    ///
    /// # Errors
    ///
    /// Returns a missing-configuration error naming `key` when the option is
    /// absent or empty.
    pub fn required_str(&self, key: &str) -> Result<String, QueueError> {
        match self.optional_str(key)? {
            Some(value) if !value.is_empty() => Ok(value),
            _ => Err(QueueError::missing_config(key)),
        }
    }

    /// Get an optional string option
    ///
    /// Numbers and booleans are accepted and rendered as strings since
    /// environment-sourced configuration does not carry types.
    pub fn optional_str(&self, key: &str) -> Result<Option<String>, QueueError> {
        match self.options.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::String(s)) => Ok(Some(s.clone())),
            Some(serde_json::Value::Number(n)) => Ok(Some(n.to_string())),
            Some(serde_json::Value::Bool(b)) => Ok(Some(b.to_string())),
            Some(_) => Err(QueueError::invalid_config(format!(
                "'{}' must be a string",
                key
            ))),
        }
    }

    /// Get an optional unsigned integer option
    pub fn optional_u64(&self, key: &str) -> Result<Option<u64>, QueueError> {
        match self.options.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Number(n)) => n.as_u64().map(Some).ok_or_else(|| {
                QueueError::invalid_config(format!("'{}' must be a non-negative integer", key))
            }),
            Some(serde_json::Value::String(s)) => s.parse::<u64>().map(Some).map_err(|_| {
                QueueError::invalid_config(format!("'{}' must be a non-negative integer", key))
            }),
            Some(_) => Err(QueueError::invalid_config(format!(
                "'{}' must be a non-negative integer",
                key
            ))),
        }
    }

    /// Get an optional boolean option
    pub fn optional_bool(&self, key: &str) -> Result<Option<bool>, QueueError> {
        match self.options.get(key) {
            None | Some(serde_json::Value::Null) => Ok(None),
            Some(serde_json::Value::Bool(b)) => Ok(Some(*b)),
            Some(serde_json::Value::String(s)) => match s.as_str() {
                "true" | "1" => Ok(Some(true)),
                "false" | "0" => Ok(Some(false)),
                _ => Err(QueueError::invalid_config(format!(
                    "'{}' must be a boolean",
                    key
                ))),
            },
            Some(_) => Err(QueueError::invalid_config(format!(
                "'{}' must be a boolean",
                key
            ))),
        }
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
