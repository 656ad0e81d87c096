//! HTTP dispatcher factory
//!
//! Each dispatcher owns a `reqwest::Client` bound to one endpoint key.
//! Response classification:
//! - 2xx -> Delivered
//! - 429, 5xx -> Retryable
//! - other 4xx -> Rejected (endpoint configuration problem)
//! - transport failure -> ConnectionFailed (dispatcher marked broken)

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use kd_common::EndpointKey;

use crate::error::FactoryError;
use crate::factory::DispatcherFactory;

/// Key property holding a bearer token for the endpoint
pub const AUTH_PROPERTY: &str = "auth";

#[derive(Debug, Clone)]
pub struct HttpDispatcherConfig {
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    /// Dispatchers older than this fail validation and are replaced
    pub max_lifetime: Option<Duration>,
    pub http1_only: bool,
}

impl Default for HttpDispatcherConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            max_lifetime: Some(Duration::from_secs(3600)),
            http1_only: false,
        }
    }
}

/// A message to deliver to an endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub id: String,
    pub payload: serde_json::Value,
}

impl OutboundMessage {
    pub fn new(payload: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            payload,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchOutcome {
    Delivered { status: u16 },
    Rejected { status: u16 },
    Retryable { status: u16 },
    ConnectionFailed { reason: String },
}

impl DispatchOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DispatchOutcome::Delivered { .. })
    }

    fn from_status(status: reqwest::StatusCode) -> Self {
        let code = status.as_u16();
        if status.is_success() {
            DispatchOutcome::Delivered { status: code }
        } else if code == 429 || status.is_server_error() {
            DispatchOutcome::Retryable { status: code }
        } else if status.is_client_error() {
            DispatchOutcome::Rejected { status: code }
        } else {
            DispatchOutcome::Retryable { status: code }
        }
    }
}

/// A live HTTP sender bound to one endpoint
pub struct HttpDispatcher {
    id: Uuid,
    client: Client,
    uri: String,
    auth_token: Option<String>,
    created_at: Instant,
    broken: bool,
    sent: u64,
}

impl HttpDispatcher {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Messages sent since creation
    pub fn sent(&self) -> u64 {
        self.sent
    }

    pub async fn dispatch(&mut self, message: &OutboundMessage) -> DispatchOutcome {
        self.sent += 1;

        let mut request = self
            .client
            .post(&self.uri)
            .header("Accept", "application/json")
            .header("X-Message-Id", &message.id)
            .json(&message.payload);
        if let Some(token) = &self.auth_token {
            request = request.bearer_auth(token);
        }

        match request.send().await {
            Ok(response) => {
                let outcome = DispatchOutcome::from_status(response.status());
                match &outcome {
                    DispatchOutcome::Delivered { status } => {
                        debug!(message_id = %message.id, endpoint = %self.uri, status, "Message delivered");
                    }
                    DispatchOutcome::Rejected { status } => {
                        warn!(message_id = %message.id, endpoint = %self.uri, status, "Endpoint rejected message");
                    }
                    DispatchOutcome::Retryable { status } => {
                        warn!(message_id = %message.id, endpoint = %self.uri, status, "Endpoint returned retryable status");
                    }
                    DispatchOutcome::ConnectionFailed { .. } => {}
                }
                outcome
            }
            Err(e) => {
                self.broken = true;
                warn!(
                    message_id = %message.id,
                    endpoint = %self.uri,
                    error = %e,
                    is_timeout = e.is_timeout(),
                    is_connect = e.is_connect(),
                    "Dispatch failed"
                );
                DispatchOutcome::ConnectionFailed {
                    reason: e.to_string(),
                }
            }
        }
    }
}

/// Creates one `HttpDispatcher` per endpoint key
pub struct HttpDispatcherFactory {
    config: HttpDispatcherConfig,
}

impl HttpDispatcherFactory {
    pub fn new(config: HttpDispatcherConfig) -> Self {
        info!(
            request_timeout_ms = config.request_timeout.as_millis() as u64,
            connect_timeout_ms = config.connect_timeout.as_millis() as u64,
            http1_only = config.http1_only,
            "HTTP dispatcher factory initialized"
        );
        Self { config }
    }

    pub fn config(&self) -> &HttpDispatcherConfig {
        &self.config
    }
}

#[async_trait]
impl DispatcherFactory for HttpDispatcherFactory {
    type Key = EndpointKey;
    type Dispatcher = HttpDispatcher;

    async fn create(&self, key: &EndpointKey) -> Result<HttpDispatcher, FactoryError> {
        let url = reqwest::Url::parse(key.uri())
            .map_err(|e| FactoryError::Config(format!("invalid endpoint URI {}: {}", key.uri(), e)))?;
        if !matches!(url.scheme(), "http" | "https") {
            return Err(FactoryError::Config(format!(
                "unsupported scheme {} for {}",
                url.scheme(),
                key.uri()
            )));
        }

        let mut builder = Client::builder()
            .timeout(self.config.request_timeout)
            .connect_timeout(self.config.connect_timeout)
            .pool_max_idle_per_host(1);
        if self.config.http1_only {
            builder = builder.http1_only();
        }
        let client = builder.build()?;

        let dispatcher = HttpDispatcher {
            id: Uuid::new_v4(),
            client,
            uri: url.to_string(),
            auth_token: key.property(AUTH_PROPERTY).map(str::to_string),
            created_at: Instant::now(),
            broken: false,
            sent: 0,
        };
        debug!(endpoint = %key, dispatcher_id = %dispatcher.id, "HTTP dispatcher created");
        Ok(dispatcher)
    }

    async fn destroy(&self, key: &EndpointKey, dispatcher: HttpDispatcher) -> Result<(), FactoryError> {
        debug!(
            endpoint = %key,
            dispatcher_id = %dispatcher.id,
            sent = dispatcher.sent,
            "HTTP dispatcher destroyed"
        );
        Ok(())
    }

    async fn validate(&self, _key: &EndpointKey, dispatcher: &HttpDispatcher) -> bool {
        if dispatcher.broken {
            return false;
        }
        match self.config.max_lifetime {
            Some(max) => dispatcher.created_at.elapsed() < max,
            None => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::StatusCode;

    #[test]
    fn test_status_classification() {
        assert_eq!(
            DispatchOutcome::from_status(StatusCode::OK),
            DispatchOutcome::Delivered { status: 200 }
        );
        assert_eq!(
            DispatchOutcome::from_status(StatusCode::NOT_FOUND),
            DispatchOutcome::Rejected { status: 404 }
        );
        assert_eq!(
            DispatchOutcome::from_status(StatusCode::TOO_MANY_REQUESTS),
            DispatchOutcome::Retryable { status: 429 }
        );
        assert_eq!(
            DispatchOutcome::from_status(StatusCode::BAD_GATEWAY),
            DispatchOutcome::Retryable { status: 502 }
        );
    }

    #[tokio::test]
    async fn test_create_rejects_bad_uri() {
        let factory = HttpDispatcherFactory::new(HttpDispatcherConfig::default());
        let result = factory.create(&EndpointKey::new("ftp://example.com/in")).await;
        assert!(matches!(result, Err(FactoryError::Config(_))));

        let result = factory.create(&EndpointKey::new("not a uri")).await;
        assert!(matches!(result, Err(FactoryError::Config(_))));
    }

    #[tokio::test]
    async fn test_validate_lifetime() {
        let factory = HttpDispatcherFactory::new(HttpDispatcherConfig {
            max_lifetime: Some(Duration::ZERO),
            ..Default::default()
        });
        let key = EndpointKey::new("http://localhost:1/hook");
        let dispatcher = factory.create(&key).await.unwrap();
        assert!(!factory.validate(&key, &dispatcher).await);
    }

    #[tokio::test]
    async fn test_auth_property_becomes_token() {
        let factory = HttpDispatcherFactory::new(HttpDispatcherConfig::default());
        let key = EndpointKey::with_properties("http://localhost:1/hook", [(AUTH_PROPERTY, "secret")]);
        let dispatcher = factory.create(&key).await.unwrap();
        assert_eq!(dispatcher.auth_token.as_deref(), Some("secret"));
        assert!(factory.validate(&key, &dispatcher).await);
    }
}
