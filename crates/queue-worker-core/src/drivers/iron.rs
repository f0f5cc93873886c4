//! IronMQ v3 driver over the HTTP/JSON API.
//!
//! Reservations return a message id plus a reservation id, both of which the
//! delete call needs, so the delivery token is `{message_id}:{reservation_id}`.
//! IronMQ is also the one backend that supports push queues: `subscribe`
//! turns the queue into a multicast push queue posting to the given URL.

use crate::config::{ConnectionConfig, DriverType};
use crate::connection::{Connector, QueueConnection, StandardQueueConnection, SubscribeOptions};
use crate::drivers::{delay_seconds, QueueDriver};
use crate::error::{QueueError, SerializationError};
use crate::message::{DeliveryHandle, Envelope};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Duration;
use reqwest::{Client as HttpClient, Method, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::sync::Arc;
use tracing::{debug, info};

#[cfg(test)]
#[path = "iron_tests.rs"]
mod tests;

const DEFAULT_HOST: &str = "mq-aws-us-east-1-1.iron.io";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct PostMessages<'a> {
    messages: Vec<PostMessage<'a>>,
}

#[derive(Debug, Serialize)]
struct PostMessage<'a> {
    body: &'a str,
    #[serde(skip_serializing_if = "is_zero")]
    delay: u64,
}

fn is_zero(value: &u64) -> bool {
    *value == 0
}

#[derive(Debug, Serialize)]
struct ReserveRequest {
    n: u32,
    timeout: u64,
    wait: u64,
}

#[derive(Debug, Deserialize)]
struct ReserveResponse {
    #[serde(default)]
    messages: Vec<ReservedMessage>,
}

#[derive(Debug, Deserialize)]
struct ReservedMessage {
    id: String,
    body: String,
    reservation_id: String,
    #[serde(default = "first_reservation")]
    reserved_count: u32,
}

fn first_reservation() -> u32 {
    1
}

#[derive(Debug, Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    msg: String,
}

/// Split a delivery token into message id and reservation id
fn split_token(handle: &DeliveryHandle) -> Result<(&str, &str), QueueError> {
    handle
        .token()
        .split_once(':')
        .filter(|(id, reservation)| !id.is_empty() && !reservation.is_empty())
        .ok_or_else(|| QueueError::MessageNotFound {
            handle: handle.to_string(),
        })
}

/// A 404 on a held message means its reservation is gone
fn lost_reservation(handle: &DeliveryHandle, error: QueueError) -> QueueError {
    match error {
        QueueError::ProviderError { code, .. } if code == "404" => QueueError::MessageNotFound {
            handle: handle.to_string(),
        },
        other => other,
    }
}

/// Recursively merge `overlay` into `base`, overlay values winning
fn merge_json(base: &mut serde_json::Value, overlay: &serde_json::Value) {
    match (base, overlay) {
        (serde_json::Value::Object(base), serde_json::Value::Object(overlay)) => {
            for (key, value) in overlay {
                merge_json(
                    base.entry(key.clone()).or_insert(serde_json::Value::Null),
                    value,
                );
            }
        }
        (base, overlay) => *base = overlay.clone(),
    }
}

/// Queue update body registering a push subscriber
fn subscription_body(
    url: &str,
    options: &SubscribeOptions,
    advanced: Option<&serde_json::Value>,
) -> serde_json::Value {
    let mut push = json!({
        "subscribers": [{ "name": url, "url": url }],
        "retries": options.retries,
    });
    if let Some(error_queue) = &options.error_queue {
        push["error_queue"] = json!(error_queue);
    }

    let mut queue = json!({
        "type": "multicast",
        "push": push,
    });
    if let Some(advanced) = advanced {
        merge_json(&mut queue, advanced);
    }

    json!({ "queue": queue })
}

// ============================================================================
// IronDriver
// ============================================================================

/// IronMQ queue driver
pub struct IronDriver {
    http_client: HttpClient,
    base_url: String,
    project: String,
    token: String,
    timeout: u64,
    wait: u64,
}

impl IronDriver {
    /// Create a driver from connection configuration
    pub fn from_config(config: &ConnectionConfig) -> Result<Self, QueueError> {
        let project = config.required_str("project")?;
        let token = config.required_str("token")?;

        let base_url = match config.optional_str("endpoint")? {
            Some(endpoint) => endpoint.trim_end_matches('/').to_string(),
            None => {
                let host = config
                    .optional_str("host")?
                    .unwrap_or_else(|| DEFAULT_HOST.to_string());
                format!("https://{}", host)
            }
        };
        url::Url::parse(&base_url).map_err(|e| {
            QueueError::invalid_config(format!("IronMQ endpoint is not a valid URL: {}", e))
        })?;

        let wait = config.optional_u64("wait")?.unwrap_or(0);
        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(30 + wait))
            .build()
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            base_url,
            project,
            token,
            timeout: config.optional_u64("timeout")?.unwrap_or(60),
            wait,
        })
    }

    fn queue_url(&self, queue: &str) -> String {
        format!(
            "{}/3/projects/{}/queues/{}",
            self.base_url,
            urlencoding::encode(&self.project),
            urlencoding::encode(queue)
        )
    }

    async fn call(
        &self,
        method: Method,
        url: String,
        body: &serde_json::Value,
    ) -> Result<String, QueueError> {
        let response = self
            .http_client
            .request(method, &url)
            .header("Authorization", format!("OAuth {}", self.token))
            .json(body)
            .send()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("IronMQ request failed: {}", e),
            })?;

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to read response body: {}", e),
            })?;

        if status.is_success() {
            return Ok(text);
        }

        let message = serde_json::from_str::<ErrorResponse>(&text)
            .map(|e| e.msg)
            .unwrap_or(text);

        Err(match status {
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
                QueueError::AuthenticationFailed { message }
            }
            _ => QueueError::ProviderError {
                provider: "iron".to_string(),
                code: status.as_u16().to_string(),
                message,
            },
        })
    }
}

impl fmt::Debug for IronDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IronDriver")
            .field("base_url", &self.base_url)
            .field("project", &self.project)
            .field("token", &"<redacted>")
            .field("timeout", &self.timeout)
            .field("wait", &self.wait)
            .finish()
    }
}

#[async_trait]
impl QueueDriver for IronDriver {
    async fn send(&self, queue: &str, body: Bytes, delay: Duration) -> Result<(), QueueError> {
        let body = std::str::from_utf8(&body)
            .map_err(|_| QueueError::SerializationError(SerializationError::InvalidUtf8))?;

        let request = PostMessages {
            messages: vec![PostMessage {
                body,
                delay: delay_seconds(delay),
            }],
        };
        let request = serde_json::to_value(&request).map_err(SerializationError::from)?;

        self.call(
            Method::POST,
            format!("{}/messages", self.queue_url(queue)),
            &request,
        )
        .await?;

        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Envelope>, QueueError> {
        let request = serde_json::to_value(ReserveRequest {
            n: 1,
            timeout: self.timeout,
            wait: self.wait,
        })
        .map_err(SerializationError::from)?;

        let text = self
            .call(
                Method::POST,
                format!("{}/reservations", self.queue_url(queue)),
                &request,
            )
            .await?;

        let response: ReserveResponse =
            serde_json::from_str(&text).map_err(SerializationError::from)?;

        let Some(message) = response.messages.into_iter().next() else {
            return Ok(None);
        };

        let token = format!("{}:{}", message.id, message.reservation_id);
        Ok(Some(
            Envelope::new(
                DeliveryHandle::new(token, DriverType::Iron),
                queue,
                Bytes::from(message.body),
            )
            .with_delivery_count(message.reserved_count),
        ))
    }

    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let (id, reservation_id) = split_token(&envelope.handle)?;

        self.call(
            Method::DELETE,
            format!(
                "{}/messages/{}",
                self.queue_url(&envelope.queue),
                urlencoding::encode(id)
            ),
            &json!({ "reservation_id": reservation_id }),
        )
        .await
        .map_err(|e| lost_reservation(&envelope.handle, e))?;

        Ok(())
    }

    /// Releases the reservation; IronMQ counts the next reservation.
    async fn redeliver(&self, envelope: &Envelope, delay: Duration) -> Result<(), QueueError> {
        let (id, reservation_id) = split_token(&envelope.handle)?;

        let mut body = json!({ "reservation_id": reservation_id });
        let delay = delay_seconds(delay);
        if delay > 0 {
            body["delay"] = json!(delay);
        }

        self.call(
            Method::POST,
            format!(
                "{}/messages/{}/release",
                self.queue_url(&envelope.queue),
                urlencoding::encode(id)
            ),
            &body,
        )
        .await
        .map_err(|e| lost_reservation(&envelope.handle, e))?;

        Ok(())
    }

    async fn subscribe(
        &self,
        queue: &str,
        url: &str,
        options: &SubscribeOptions,
        advanced: Option<&serde_json::Value>,
    ) -> Result<(), QueueError> {
        if let Some(advanced) = advanced {
            if !advanced.is_object() {
                return Err(QueueError::ValidationError(
                    crate::error::ValidationError::InvalidFormat {
                        field: "advanced".to_string(),
                        message: "must be a JSON object".to_string(),
                    },
                ));
            }
        }

        let body = subscription_body(url, options, advanced);
        self.call(Method::PATCH, self.queue_url(queue), &body).await?;

        info!(queue = %queue, url = %url, retries = options.retries, "IronMQ push subscriber added");
        Ok(())
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Iron
    }
}

// ============================================================================
// IronConnector
// ============================================================================

/// Builds IronMQ connections
///
/// Keys: `project`, `token`, `queue` (required); `host`, `endpoint`,
/// `timeout` (reservation seconds, 60), `wait` (long-poll seconds, 0).
#[derive(Debug, Default, Clone)]
pub struct IronConnector;

#[async_trait]
impl Connector for IronConnector {
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn QueueConnection>, QueueError> {
        let driver = IronDriver::from_config(config)?;
        let queue = config.required_str("queue")?;

        debug!(connection = %name, driver = ?driver, "IronMQ connection configured");

        Ok(Arc::new(StandardQueueConnection::new(
            name,
            queue,
            Arc::new(driver),
        )))
    }
}
