//! RabbitMQ driver over AMQP 0-9-1.
//!
//! Jobs are published persistently through the default exchange with the
//! queue name as routing key, and fetched with `basic.get` without auto-ack so
//! the delivery tag can be acknowledged once the job is settled.
//!
//! Delayed jobs go to a per-delay holding queue named
//! `{queue}.deferred.{milliseconds}`. The holding queue has a message TTL equal
//! to the delay and dead-letters expired messages back to the target queue.
//!
//! The channel runs in confirm mode and every publish is mandatory, so a
//! publish only succeeds once the broker has routed and accepted it.

use crate::config::{ConnectionConfig, DriverType};
use crate::connection::{Connector, QueueConnection, StandardQueueConnection};
use crate::drivers::QueueDriver;
use crate::error::{QueueError, ValidationError};
use crate::message::{DeliveryHandle, Envelope};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicPublishOptions, ConfirmSelectOptions,
    QueueDeclareOptions,
};
use lapin::publisher_confirm::Confirmation;
use lapin::types::{AMQPValue, FieldTable, ShortString};
use lapin::{BasicProperties, Channel, Connection, ConnectionProperties};
use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

#[cfg(test)]
#[path = "rabbitmq_tests.rs"]
mod tests;

/// Persistent delivery mode
const PERSISTENT: u8 = 2;

/// Header holding the delivery count of a republished message
const DELIVERIES_HEADER: &str = "x-queue-worker-deliveries";

/// Connection parameters for a broker
#[derive(Clone, PartialEq, Eq)]
pub struct RabbitMqConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub vhost: String,
}

impl RabbitMqConfig {
    /// Read and validate broker settings
    pub fn from_config(config: &ConnectionConfig) -> Result<Self, QueueError> {
        let host = config.required_str("host")?;

        let port = config.optional_u64("port")?.unwrap_or(5672);
        let port = u16::try_from(port)
            .ok()
            .filter(|p| *p != 0)
            .ok_or_else(|| QueueError::invalid_config("'port' must be between 1 and 65535"))?;

        Ok(Self {
            host,
            port,
            username: config
                .optional_str("username")?
                .unwrap_or_else(|| "guest".to_string()),
            password: config
                .optional_str("password")?
                .unwrap_or_else(|| "guest".to_string()),
            vhost: config
                .optional_str("vhost")?
                .unwrap_or_else(|| "/".to_string()),
        })
    }

    /// AMQP URI for the broker
    pub fn uri(&self) -> String {
        format!(
            "amqp://{}:{}@{}:{}/{}",
            urlencoding::encode(&self.username),
            urlencoding::encode(&self.password),
            self.host,
            self.port,
            urlencoding::encode(&self.vhost)
        )
    }
}

impl fmt::Debug for RabbitMqConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("vhost", &self.vhost)
            .finish()
    }
}

/// Whole milliseconds of a positive delay, rounding sub-millisecond remainders up
///
/// The result is both the holding queue's message TTL and part of its name.
pub(crate) fn deferred_ttl(delay: Duration) -> Result<u32, QueueError> {
    let out_of_range = || {
        QueueError::ValidationError(ValidationError::OutOfRange {
            field: "delay".to_string(),
            message: "too long for a RabbitMQ message TTL".to_string(),
        })
    };

    if delay <= Duration::zero() {
        return Ok(0);
    }

    let micros = delay.num_microseconds().ok_or_else(out_of_range)?;
    let millis = micros / 1000 + i64::from(micros % 1000 != 0);
    u32::try_from(millis).map_err(|_| out_of_range())
}

/// Name of the holding queue for a delay
pub fn deferred_queue_name(queue: &str, delay: Duration) -> Result<String, QueueError> {
    Ok(format!("{}.deferred.{}", queue, deferred_ttl(delay)?))
}

/// Declaration arguments of the holding queue for a delay
///
/// Holding queues never expire. An expiring queue is deleted together with
/// the messages still waiting in it.
pub(crate) fn deferred_queue_arguments(
    queue: &str,
    delay: Duration,
) -> Result<FieldTable, QueueError> {
    let ttl = deferred_ttl(delay)?;

    let mut arguments = FieldTable::default();
    arguments.insert("x-dead-letter-exchange".into(), AMQPValue::LongString("".into()));
    arguments.insert(
        "x-dead-letter-routing-key".into(),
        AMQPValue::LongString(queue.into()),
    );
    arguments.insert("x-message-ttl".into(), AMQPValue::LongUInt(ttl));
    Ok(arguments)
}

/// Map a publisher confirm to the publish result
///
/// Publishes are mandatory, so a message the broker could not route comes
/// back attached to the confirmation.
pub(crate) fn confirmation_result(
    confirmation: Confirmation,
    routing_key: &str,
) -> Result<(), QueueError> {
    match confirmation {
        Confirmation::Ack(None) => Ok(()),
        Confirmation::Ack(Some(_)) | Confirmation::Nack(Some(_)) => Err(QueueError::QueueNotFound {
            queue_name: routing_key.to_string(),
        }),
        Confirmation::Nack(None) => Err(QueueError::ProviderError {
            provider: "rabbitmq".to_string(),
            code: "nack".to_string(),
            message: format!("Broker rejected a publish to '{}'", routing_key),
        }),
        Confirmation::NotRequested => Err(QueueError::ProviderError {
            provider: "rabbitmq".to_string(),
            code: "unconfirmed".to_string(),
            message: "Channel is not in confirm mode".to_string(),
        }),
    }
}

/// Headers carrying the delivery count of a redelivered message
fn redelivery_headers(delivery_count: u32) -> FieldTable {
    let mut headers = FieldTable::default();
    headers.insert(DELIVERIES_HEADER.into(), AMQPValue::LongUInt(delivery_count));
    headers
}

/// Deliveries so far, including the current one
pub(crate) fn delivery_count(redelivered: bool, headers: Option<&FieldTable>) -> u32 {
    let previous = headers
        .and_then(|headers| headers.inner().get(&ShortString::from(DELIVERIES_HEADER)))
        .and_then(|value| match value {
            AMQPValue::LongUInt(n) => Some(*n),
            AMQPValue::LongInt(n) => u32::try_from(*n).ok(),
            AMQPValue::LongLongInt(n) => u32::try_from(*n).ok(),
            _ => None,
        })
        .unwrap_or(0);

    previous
        .saturating_add(1)
        .saturating_add(u32::from(redelivered))
}

fn amqp_error(context: &str, e: lapin::Error) -> QueueError {
    QueueError::ConnectionFailed {
        message: format!("{}: {}", context, e),
    }
}

/// An open broker connection and the channel used on it
struct AmqpSession {
    _connection: Connection,
    channel: Channel,
}

// ============================================================================
// RabbitMqDriver
// ============================================================================

/// RabbitMQ queue driver
///
/// The broker connection is opened on first use and reopened after the
/// channel is closed by an error.
pub struct RabbitMqDriver {
    config: RabbitMqConfig,
    session: tokio::sync::Mutex<Option<AmqpSession>>,
    declared: Mutex<HashSet<String>>,
}

impl RabbitMqDriver {
    /// Create a driver; no connection is made until the first operation
    pub fn new(config: RabbitMqConfig) -> Self {
        Self {
            config,
            session: tokio::sync::Mutex::new(None),
            declared: Mutex::new(HashSet::new()),
        }
    }

    /// Broker settings
    pub fn config(&self) -> &RabbitMqConfig {
        &self.config
    }

    async fn channel(&self) -> Result<Channel, QueueError> {
        let mut session = self.session.lock().await;

        if let Some(existing) = session.as_ref() {
            if existing.channel.status().connected() {
                return Ok(existing.channel.clone());
            }
        }

        let connection = Connection::connect(&self.config.uri(), ConnectionProperties::default())
            .await
            .map_err(|e| amqp_error("Failed to connect to RabbitMQ", e))?;
        let channel = connection
            .create_channel()
            .await
            .map_err(|e| amqp_error("Failed to open channel", e))?;
        channel
            .confirm_select(ConfirmSelectOptions::default())
            .await
            .map_err(|e| amqp_error("Failed to enable publisher confirms", e))?;

        info!(
            host = %self.config.host,
            port = self.config.port,
            vhost = %self.config.vhost,
            "Connected to RabbitMQ"
        );

        // Queues are redeclared on the new channel
        if let Ok(mut declared) = self.declared.lock() {
            declared.clear();
        }

        *session = Some(AmqpSession {
            _connection: connection,
            channel: channel.clone(),
        });

        Ok(channel)
    }

    fn is_declared(&self, queue: &str) -> bool {
        self.declared
            .lock()
            .map(|declared| declared.contains(queue))
            .unwrap_or(false)
    }

    fn mark_declared(&self, queue: &str) {
        if let Ok(mut declared) = self.declared.lock() {
            declared.insert(queue.to_string());
        }
    }

    fn forget_declared(&self, queue: &str) {
        if let Ok(mut declared) = self.declared.lock() {
            declared.remove(queue);
        }
    }

    async fn declare_queue(&self, channel: &Channel, queue: &str) -> Result<(), QueueError> {
        if self.is_declared(queue) {
            return Ok(());
        }

        channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| amqp_error("Failed to declare queue", e))?;

        self.mark_declared(queue);
        Ok(())
    }

    async fn declare_deferred_queue(
        &self,
        channel: &Channel,
        queue: &str,
        delay: Duration,
    ) -> Result<String, QueueError> {
        let name = deferred_queue_name(queue, delay)?;
        if self.is_declared(&name) {
            return Ok(name);
        }

        channel
            .queue_declare(
                &name,
                QueueDeclareOptions {
                    durable: true,
                    ..QueueDeclareOptions::default()
                },
                deferred_queue_arguments(queue, delay)?,
            )
            .await
            .map_err(|e| amqp_error("Failed to declare deferred queue", e))?;

        self.mark_declared(&name);
        Ok(name)
    }

    /// Declare what a publish to `queue` after `delay` needs and return the routing key
    async fn declare_route(
        &self,
        channel: &Channel,
        queue: &str,
        delay: Duration,
    ) -> Result<String, QueueError> {
        self.declare_queue(channel, queue).await?;

        if delay > Duration::zero() {
            self.declare_deferred_queue(channel, queue, delay).await
        } else {
            Ok(queue.to_string())
        }
    }

    async fn publish(
        &self,
        channel: &Channel,
        routing_key: &str,
        body: &[u8],
        headers: Option<FieldTable>,
    ) -> Result<(), QueueError> {
        let mut properties = BasicProperties::default()
            .with_delivery_mode(PERSISTENT)
            .with_content_type("application/json".into());
        if let Some(headers) = headers {
            properties = properties.with_headers(headers);
        }

        let confirmation = channel
            .basic_publish(
                "",
                routing_key,
                BasicPublishOptions {
                    mandatory: true,
                    ..BasicPublishOptions::default()
                },
                body,
                properties,
            )
            .await
            .map_err(|e| amqp_error("Failed to publish", e))?
            .await
            .map_err(|e| amqp_error("Publish was not confirmed", e))?;

        confirmation_result(confirmation, routing_key)
    }

    /// Publish onto `queue` after `delay`, redeclaring once if the route is gone
    async fn publish_to(
        &self,
        queue: &str,
        body: &[u8],
        delay: Duration,
        headers: Option<FieldTable>,
    ) -> Result<(), QueueError> {
        let channel = self.channel().await?;
        let routing_key = self.declare_route(&channel, queue, delay).await?;

        match self
            .publish(&channel, &routing_key, body, headers.clone())
            .await
        {
            Err(QueueError::QueueNotFound { .. }) => {
                warn!(queue = %queue, routing_key = %routing_key, "Publish was unroutable, redeclaring");
                self.forget_declared(queue);
                self.forget_declared(&routing_key);

                let routing_key = self.declare_route(&channel, queue, delay).await?;
                self.publish(&channel, &routing_key, body, headers).await
            }
            Ok(()) => {
                if routing_key != queue {
                    debug!(queue = %queue, deferred = %routing_key, "Published delayed message");
                }
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn delivery_tag(envelope: &Envelope) -> Result<u64, QueueError> {
        envelope
            .handle
            .token()
            .parse::<u64>()
            .map_err(|_| QueueError::MessageNotFound {
                handle: envelope.handle.to_string(),
            })
    }
}

impl fmt::Debug for RabbitMqDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RabbitMqDriver")
            .field("config", &self.config)
            .finish()
    }
}

#[async_trait]
impl QueueDriver for RabbitMqDriver {
    async fn send(&self, queue: &str, body: Bytes, delay: Duration) -> Result<(), QueueError> {
        self.publish_to(queue, &body, delay, None).await
    }

    async fn receive(&self, queue: &str) -> Result<Option<Envelope>, QueueError> {
        let channel = self.channel().await?;
        self.declare_queue(&channel, queue).await?;

        let message = channel
            .basic_get(queue, BasicGetOptions { no_ack: false })
            .await
            .map_err(|e| amqp_error("Failed to get message", e))?;

        let Some(message) = message else {
            return Ok(None);
        };

        let delivery = message.delivery;
        let count = delivery_count(delivery.redelivered, delivery.properties.headers().as_ref());

        Ok(Some(
            Envelope::new(
                DeliveryHandle::new(delivery.delivery_tag.to_string(), DriverType::RabbitMq),
                queue,
                Bytes::from(delivery.data),
            )
            .with_delivery_count(count),
        ))
    }

    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let tag = Self::delivery_tag(envelope)?;
        let channel = self.channel().await?;

        channel
            .basic_ack(tag, BasicAckOptions::default())
            .await
            .map_err(|e| amqp_error("Failed to acknowledge", e))
    }

    /// Republishes the body with its delivery count in a header, then acks.
    async fn redeliver(&self, envelope: &Envelope, delay: Duration) -> Result<(), QueueError> {
        self.publish_to(
            &envelope.queue,
            &envelope.body,
            delay,
            Some(redelivery_headers(envelope.delivery_count)),
        )
        .await?;
        self.acknowledge(envelope).await
    }

    fn driver_type(&self) -> DriverType {
        DriverType::RabbitMq
    }
}

// ============================================================================
// RabbitMqConnector
// ============================================================================

/// Builds RabbitMQ connections
///
/// Keys: `host`, `queue` (required); `port` (5672), `username` and
/// `password` (`guest`), `vhost` (`/`).
#[derive(Debug, Default, Clone)]
pub struct RabbitMqConnector;

#[async_trait]
impl Connector for RabbitMqConnector {
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn QueueConnection>, QueueError> {
        let broker = RabbitMqConfig::from_config(config)?;
        let queue = config.required_str("queue")?;

        debug!(connection = %name, config = ?broker, "RabbitMQ connection configured");

        Ok(Arc::new(StandardQueueConnection::new(
            name,
            queue,
            Arc::new(RabbitMqDriver::new(broker)),
        )))
    }
}
