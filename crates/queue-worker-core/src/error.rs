//! Error types for queue operations.

use chrono::Duration;
use thiserror::Error;

/// Comprehensive error type for all queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message not found or reservation expired: {handle}")]
    MessageNotFound { handle: String },

    #[error("Delivery '{handle}' was already acknowledged (job is {state})")]
    AlreadyAcknowledged { handle: String, state: String },

    #[error("Payload could not be decoded: {message}")]
    CorruptPayload { message: String },

    #[error("No connector registered for driver [{driver}]")]
    UnknownConnector { driver: String },

    #[error("Queue connection [{name}] is not configured")]
    ConnectionNotConfigured { name: String },

    #[error("No handler registered for job '{handler}'")]
    HandlerNotFound { handler: String },

    #[error("Handler '{handler}' failed: {source}")]
    HandlerFailed {
        handler: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Failed job store error: {message}")]
    FailedJobStore { message: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Authentication failed: {message}")]
    AuthenticationFailed { message: String },

    #[error("Payload too large: {size} bytes (max: {max_size})")]
    PayloadTooLarge { size: usize, max_size: usize },

    #[error("Operation '{operation}' is not supported by the {driver} driver")]
    Unsupported { driver: String, operation: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::AlreadyAcknowledged { .. } => false,
            Self::CorruptPayload { .. } => false,
            Self::UnknownConnector { .. } => false,
            Self::ConnectionNotConfigured { .. } => false,
            Self::HandlerNotFound { .. } => false,
            Self::HandlerFailed { .. } => false,
            Self::FailedJobStore { .. } => false,
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::AuthenticationFailed { .. } => false,
            Self::PayloadTooLarge { .. } => false,
            Self::Unsupported { .. } => false,
            Self::ProviderError { .. } => true, // Provider-specific errors are usually transient
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Check if error should be retried
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Timeout { .. } => Some(Duration::seconds(1)),
            Self::ConnectionFailed { .. } => Some(Duration::seconds(5)),
            Self::ProviderError { .. } => Some(Duration::seconds(5)),
            _ => None,
        }
    }

    /// Whether this error came from an undecodable envelope body
    pub fn is_corrupt_payload(&self) -> bool {
        matches!(self, Self::CorruptPayload { .. })
    }

    pub(crate) fn missing_config(key: impl Into<String>) -> Self {
        Self::ConfigurationError(ConfigurationError::Missing { key: key.into() })
    }

    pub(crate) fn invalid_config(message: impl Into<String>) -> Self {
        Self::ConfigurationError(ConfigurationError::Invalid {
            message: message.into(),
        })
    }
}

/// Errors during payload serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Response could not be parsed: {message}")]
    InvalidResponse { message: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
