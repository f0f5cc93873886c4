//! Amazon SQS driver over the HTTP query API.
//!
//! Requests are signed with AWS Signature Version 4 and responses are parsed
//! from XML. Queue URLs are looked up once per queue name and cached.
//!
//! ## Configuration keys
//!
//! | key        | required | meaning                                        |
//! |------------|----------|------------------------------------------------|
//! | `key`      | yes      | access key id                                  |
//! | `secret`   | yes      | secret access key                              |
//! | `region`   | yes      | e.g. `us-east-1`                               |
//! | `queue`    | yes      | default queue name                             |
//! | `prefix`   | no       | queue URL prefix, skips `GetQueueUrl` lookups  |
//! | `endpoint` | no       | service endpoint override (LocalStack, tests)  |
//! | `wait`     | no       | long-poll seconds for `ReceiveMessage` (0-20)  |

use crate::config::{ConnectionConfig, DriverType};
use crate::connection::{Connector, QueueConnection, StandardQueueConnection};
use crate::drivers::{delay_seconds, QueueDriver};
use crate::error::{QueueError, SerializationError};
use crate::message::{DeliveryHandle, Envelope};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::Client as HttpClient;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "sqs_tests.rs"]
mod tests;

const API_VERSION: &str = "2012-11-05";
const MAX_WAIT_SECONDS: u64 = 20;
const MAX_VISIBILITY_SECONDS: u64 = 43_200;

// ============================================================================
// AWS Signature V4 Signing
// ============================================================================

type HmacSha256 = Hmac<Sha256>;

/// AWS Signature Version 4 signer
///
/// 1. Canonical request (method, URI, sorted query, headers, payload hash)
/// 2. String to sign (algorithm, timestamp, scope, request hash)
/// 3. Signing key from the HMAC chain date → region → service → `aws4_request`
/// 4. Authorization header
#[derive(Clone)]
struct SigV4Signer {
    access_key: String,
    secret_key: String,
    region: String,
    service: &'static str,
}

impl SigV4Signer {
    fn new(access_key: String, secret_key: String, region: String) -> Self {
        Self {
            access_key,
            secret_key,
            region,
            service: "sqs",
        }
    }

    /// Headers to attach to a signed request
    fn sign(
        &self,
        method: &str,
        host: &str,
        path: &str,
        query: &str,
        body: &str,
        timestamp: &DateTime<Utc>,
    ) -> Result<Vec<(&'static str, String)>, QueueError> {
        let date_stamp = timestamp.format("%Y%m%d").to_string();
        let amz_date = timestamp.format("%Y%m%dT%H%M%SZ").to_string();

        let canonical_headers = format!("host:{}\nx-amz-date:{}\n", host, amz_date);
        let signed_headers = "host;x-amz-date";
        let payload_hash = hex::encode(Sha256::digest(body.as_bytes()));

        let canonical_request = format!(
            "{}\n{}\n{}\n{}\n{}\n{}",
            method, path, query, canonical_headers, signed_headers, payload_hash
        );

        let algorithm = "AWS4-HMAC-SHA256";
        let credential_scope = format!(
            "{}/{}/{}/aws4_request",
            date_stamp, self.region, self.service
        );
        let string_to_sign = format!(
            "{}\n{}\n{}\n{}",
            algorithm,
            amz_date,
            credential_scope,
            hex::encode(Sha256::digest(canonical_request.as_bytes()))
        );

        let signature = self.signature(&string_to_sign, &date_stamp)?;
        let authorization = format!(
            "{} Credential={}/{}, SignedHeaders={}, Signature={}",
            algorithm, self.access_key, credential_scope, signed_headers, signature
        );

        Ok(vec![
            ("Authorization", authorization),
            ("x-amz-date", amz_date),
        ])
    }

    fn signature(&self, string_to_sign: &str, date_stamp: &str) -> Result<String, QueueError> {
        let k_secret = format!("AWS4{}", self.secret_key);
        let k_date = hmac_sha256(k_secret.as_bytes(), date_stamp.as_bytes())?;
        let k_region = hmac_sha256(&k_date, self.region.as_bytes())?;
        let k_service = hmac_sha256(&k_region, self.service.as_bytes())?;
        let k_signing = hmac_sha256(&k_service, b"aws4_request")?;

        Ok(hex::encode(hmac_sha256(
            &k_signing,
            string_to_sign.as_bytes(),
        )?))
    }
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>, QueueError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|e| QueueError::AuthenticationFailed {
        message: format!("Invalid signing key: {}", e),
    })?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Sorted, percent-encoded query string as SigV4 expects it
fn canonical_query(params: &[(&str, String)]) -> String {
    let mut pairs = params
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>();
    pairs.sort();
    pairs.join("&")
}

// ============================================================================
// SqsDriver
// ============================================================================

/// Amazon SQS queue driver
pub struct SqsDriver {
    http_client: HttpClient,
    signer: SigV4Signer,
    endpoint: url::Url,
    prefix: Option<String>,
    wait_seconds: u64,
    queue_url_cache: Arc<RwLock<HashMap<String, String>>>,
}

impl SqsDriver {
    /// Create a driver from connection configuration
    pub fn from_config(config: &ConnectionConfig) -> Result<Self, QueueError> {
        let key = config.required_str("key")?;
        let secret = config.required_str("secret")?;
        let region = config.required_str("region")?;

        let endpoint = config
            .optional_str("endpoint")?
            .unwrap_or_else(|| format!("https://sqs.{}.amazonaws.com", region));
        let endpoint = url::Url::parse(&endpoint).map_err(|e| {
            QueueError::invalid_config(format!("'endpoint' is not a valid URL: {}", e))
        })?;
        if endpoint.host_str().is_none() {
            return Err(QueueError::invalid_config("'endpoint' has no host"));
        }

        let wait_seconds = config.optional_u64("wait")?.unwrap_or(0);
        if wait_seconds > MAX_WAIT_SECONDS {
            return Err(QueueError::invalid_config(format!(
                "'wait' must be at most {} seconds",
                MAX_WAIT_SECONDS
            )));
        }

        let http_client = HttpClient::builder()
            .timeout(std::time::Duration::from_secs(30 + wait_seconds))
            .build()
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to create HTTP client: {}", e),
            })?;

        Ok(Self {
            http_client,
            signer: SigV4Signer::new(key, secret, region),
            endpoint,
            prefix: config
                .optional_str("prefix")?
                .map(|p| p.trim_end_matches('/').to_string()),
            wait_seconds,
            queue_url_cache: Arc::new(RwLock::new(HashMap::new())),
        })
    }

    /// Resolve a queue name to its URL, with caching
    async fn queue_url(&self, queue: &str) -> Result<String, QueueError> {
        if let Some(prefix) = &self.prefix {
            return Ok(format!("{}/{}", prefix, queue));
        }

        {
            let cache = self.queue_url_cache.read().await;
            if let Some(url) = cache.get(queue) {
                return Ok(url.clone());
            }
        }

        let response = self
            .call(&[
                ("Action", "GetQueueUrl".to_string()),
                ("QueueName", queue.to_string()),
            ])
            .await?;
        let url = parse_single_element(&response, b"QueueUrl")?.ok_or_else(|| {
            QueueError::SerializationError(SerializationError::InvalidResponse {
                message: "QueueUrl not found in response".to_string(),
            })
        })?;

        self.queue_url_cache
            .write()
            .await
            .insert(queue.to_string(), url.clone());

        Ok(url)
    }

    /// Make a signed query API call and return the response body
    async fn call(&self, params: &[(&str, String)]) -> Result<String, QueueError> {
        let mut params = params.to_vec();
        params.push(("Version", API_VERSION.to_string()));

        let host = match (self.endpoint.host_str(), self.endpoint.port()) {
            (Some(host), Some(port)) => format!("{}:{}", host, port),
            (Some(host), None) => host.to_string(),
            (None, _) => return Err(QueueError::invalid_config("'endpoint' has no host")),
        };
        let path = self.endpoint.path();
        let query = canonical_query(&params);

        let headers = self
            .signer
            .sign("POST", &host, path, &query, "", &Utc::now())?;

        let mut url = self.endpoint.clone();
        url.set_query(Some(&query));

        let mut request = self.http_client.post(url);
        for (name, value) in headers {
            request = request.header(name, value);
        }

        let response = request.send().await.map_err(|e| {
            if e.is_timeout() {
                QueueError::ConnectionFailed {
                    message: format!("Request timeout: {}", e),
                }
            } else {
                QueueError::ConnectionFailed {
                    message: format!("HTTP request failed: {}", e),
                }
            }
        })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| QueueError::ConnectionFailed {
                message: format!("Failed to read response body: {}", e),
            })?;

        if !status.is_success() {
            return Err(parse_error_response(&body, status.as_u16()));
        }

        Ok(body)
    }
}

impl fmt::Debug for SqsDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SqsDriver")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.signer.region)
            .field("prefix", &self.prefix)
            .field("wait_seconds", &self.wait_seconds)
            .finish()
    }
}

#[async_trait]
impl QueueDriver for SqsDriver {
    async fn send(&self, queue: &str, body: Bytes, delay: Duration) -> Result<(), QueueError> {
        let queue_url = self.queue_url(queue).await?;
        let body = String::from_utf8(body.to_vec())
            .map_err(|_| QueueError::SerializationError(SerializationError::InvalidUtf8))?;

        let max_delay = DriverType::Sqs.max_delay().map_or(u64::MAX, delay_seconds);
        let mut delay = delay_seconds(delay);
        if delay > max_delay {
            warn!(
                queue = %queue,
                requested_seconds = delay,
                max_seconds = max_delay,
                "SQS delay exceeds the service maximum, clamping"
            );
            delay = max_delay;
        }

        let mut params = vec![
            ("Action", "SendMessage".to_string()),
            ("QueueUrl", queue_url),
            ("MessageBody", body),
        ];
        if delay > 0 {
            params.push(("DelaySeconds", delay.to_string()));
        }

        let response = self.call(&params).await?;
        let message_id = parse_single_element(&response, b"MessageId")?;
        debug!(queue = %queue, message_id = ?message_id, "SQS message sent");

        Ok(())
    }

    async fn receive(&self, queue: &str) -> Result<Option<Envelope>, QueueError> {
        let queue_url = self.queue_url(queue).await?;

        let response = self
            .call(&[
                ("Action", "ReceiveMessage".to_string()),
                ("QueueUrl", queue_url),
                ("MaxNumberOfMessages", "1".to_string()),
                ("WaitTimeSeconds", self.wait_seconds.to_string()),
                ("AttributeName.1", "ApproximateReceiveCount".to_string()),
            ])
            .await?;

        let Some(message) = parse_receive_response(&response)?.into_iter().next() else {
            return Ok(None);
        };

        Ok(Some(
            Envelope::new(
                DeliveryHandle::new(message.receipt_handle, DriverType::Sqs),
                queue,
                Bytes::from(message.body),
            )
            .with_delivery_count(message.receive_count),
        ))
    }

    async fn acknowledge(&self, envelope: &Envelope) -> Result<(), QueueError> {
        let queue_url = self.queue_url(&envelope.queue).await?;

        self.call(&[
            ("Action", "DeleteMessage".to_string()),
            ("QueueUrl", queue_url),
            ("ReceiptHandle", envelope.handle.token().to_string()),
        ])
        .await?;

        Ok(())
    }

    /// Shortens the visibility timeout so SQS redelivers the same message.
    async fn redeliver(&self, envelope: &Envelope, delay: Duration) -> Result<(), QueueError> {
        let queue_url = self.queue_url(&envelope.queue).await?;
        let timeout = delay_seconds(delay).min(MAX_VISIBILITY_SECONDS);

        self.call(&[
            ("Action", "ChangeMessageVisibility".to_string()),
            ("QueueUrl", queue_url),
            ("ReceiptHandle", envelope.handle.token().to_string()),
            ("VisibilityTimeout", timeout.to_string()),
        ])
        .await?;

        Ok(())
    }

    fn driver_type(&self) -> DriverType {
        DriverType::Sqs
    }
}

// ============================================================================
// XML parsing
// ============================================================================

/// One message from a `ReceiveMessage` response
#[derive(Debug, Clone, PartialEq, Eq)]
struct ReceivedSqsMessage {
    receipt_handle: String,
    body: String,
    receive_count: u32,
}

fn xml_error(e: impl fmt::Display) -> QueueError {
    QueueError::SerializationError(SerializationError::InvalidResponse {
        message: format!("XML parsing error: {}", e),
    })
}

/// Text of the first element named `name`
fn parse_single_element(xml: &str, name: &[u8]) -> Result<Option<String>, QueueError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut inside = false;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) if e.name().as_ref() == name => inside = true,
            Ok(Event::Text(e)) if inside => {
                return e.unescape().map(|s| Some(s.into_owned())).map_err(xml_error);
            }
            Ok(Event::End(ref e)) if e.name().as_ref() == name => inside = false,
            Ok(Event::Eof) => return Ok(None),
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }
}

fn parse_receive_response(xml: &str) -> Result<Vec<ReceivedSqsMessage>, QueueError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut messages = Vec::new();
    let mut in_message = false;
    let mut current_element: Option<Vec<u8>> = None;
    let mut receipt_handle = None;
    let mut body = None;
    let mut receive_count = 1;
    let mut attribute_name: Option<String> = None;
    let mut buf = Vec::new();

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(Event::Start(ref e)) => {
                let name = e.name().as_ref().to_vec();
                if name == b"Message" {
                    in_message = true;
                    receipt_handle = None;
                    body = None;
                    receive_count = 1;
                } else if in_message {
                    current_element = Some(name);
                }
            }
            Ok(Event::Text(e)) if in_message => {
                let text = e.unescape().map_err(xml_error)?.into_owned();
                match current_element.as_deref() {
                    Some(b"ReceiptHandle") => receipt_handle = Some(text),
                    Some(b"Body") => body = Some(text),
                    Some(b"Name") => attribute_name = Some(text),
                    Some(b"Value") => {
                        if attribute_name.as_deref() == Some("ApproximateReceiveCount") {
                            receive_count = text.parse().unwrap_or(1);
                        }
                        attribute_name = None;
                    }
                    _ => {}
                }
            }
            Ok(Event::Empty(ref e)) if in_message && e.name().as_ref() == b"Body" => {
                body = Some(String::new());
            }
            Ok(Event::End(ref e)) => {
                if e.name().as_ref() == b"Message" {
                    in_message = false;
                    if let (Some(handle), Some(text)) = (receipt_handle.take(), body.take()) {
                        messages.push(ReceivedSqsMessage {
                            receipt_handle: handle,
                            body: text,
                            receive_count,
                        });
                    }
                }
                current_element = None;
            }
            Ok(Event::Eof) => break,
            Err(e) => return Err(xml_error(e)),
            _ => {}
        }
        buf.clear();
    }

    Ok(messages)
}

/// Map an SQS error document to a queue error
fn parse_error_response(xml: &str, status_code: u16) -> QueueError {
    let code = parse_single_element(xml, b"Code")
        .ok()
        .flatten()
        .unwrap_or_else(|| "Unknown".to_string());
    let message = parse_single_element(xml, b"Message")
        .ok()
        .flatten()
        .unwrap_or_else(|| "Unknown error".to_string());

    match code.as_str() {
        "AWS.SimpleQueueService.NonExistentQueue" | "QueueDoesNotExist" => {
            QueueError::QueueNotFound {
                queue_name: message,
            }
        }
        "InvalidClientTokenId" | "UnrecognizedClientException" | "SignatureDoesNotMatch" => {
            QueueError::AuthenticationFailed {
                message: format!("{}: {}", code, message),
            }
        }
        "InvalidReceiptHandle" | "ReceiptHandleIsInvalid" => {
            QueueError::MessageNotFound { handle: message }
        }
        _ if status_code == 401 || status_code == 403 => QueueError::AuthenticationFailed {
            message: format!("{}: {}", code, message),
        },
        _ => QueueError::ProviderError {
            provider: "sqs".to_string(),
            code,
            message,
        },
    }
}

// ============================================================================
// SqsConnector
// ============================================================================

/// Builds SQS connections
#[derive(Debug, Default, Clone)]
pub struct SqsConnector;

#[async_trait]
impl Connector for SqsConnector {
    async fn connect(
        &self,
        name: &str,
        config: &ConnectionConfig,
    ) -> Result<Arc<dyn QueueConnection>, QueueError> {
        let driver = SqsDriver::from_config(config)?;
        let queue = config.required_str("queue")?;

        debug!(connection = %name, driver = ?driver, "SQS connection configured");

        Ok(Arc::new(StandardQueueConnection::new(
            name,
            queue,
            Arc::new(driver),
        )))
    }
}
