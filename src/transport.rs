//! Transport collaborator: session setup and snapshot publishing.
//!
//! The delivery loop only needs `connect()`, `publish()` and `disconnect()`.
//! [`HttpTransport`] provides them over HTTP using a pooled `reqwest` client.
//! The transport performs no retries of its own; it only classifies each
//! failure as transient (try again later) or fatal (never retry).

use std::time::Duration;

use reqwest::{header, Client, StatusCode};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::identity::DeviceIdentity;

/// Errors that can occur while establishing a session.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportError {
    /// The endpoint could not be reached
    Unreachable(String),

    /// The endpoint answered but refused the session
    Refused(String),

    /// The attempt did not finish before its deadline
    Timeout,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportError::Unreachable(e) => write!(f, "Endpoint unreachable: {}", e),
            TransportError::Refused(e) => write!(f, "Connection refused by endpoint: {}", e),
            TransportError::Timeout => write!(f, "Connection attempt timed out"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Outcome classification for a failed publish.
#[derive(Debug, Clone, PartialEq)]
pub enum DeliveryError {
    /// Network or broker unavailable; the payload may succeed later
    Transient(String),

    /// The payload itself is unacceptable; retrying cannot help
    Fatal(String),
}

impl DeliveryError {
    pub fn is_transient(&self) -> bool {
        matches!(self, DeliveryError::Transient(_))
    }
}

impl std::fmt::Display for DeliveryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryError::Transient(e) => write!(f, "Transient delivery failure: {}", e),
            DeliveryError::Fatal(e) => write!(f, "Fatal delivery failure: {}", e),
        }
    }
}

impl std::error::Error for DeliveryError {}

impl From<TransportError> for DeliveryError {
    fn from(err: TransportError) -> Self {
        DeliveryError::Transient(err.to_string())
    }
}

/// Session-oriented delivery channel to the remote endpoint.
#[allow(async_fn_in_trait)]
pub trait Transport {
    /// Establish (or re-establish) the session.
    async fn connect(&mut self) -> Result<(), TransportError>;

    /// Send one encoded snapshot.
    async fn publish(&mut self, payload: &[u8]) -> Result<(), DeliveryError>;

    /// Tear the session down. Never fails.
    async fn disconnect(&mut self);
}

/// Classify an HTTP status returned for a publish.
///
/// Server errors and rate limiting are transient; any other client error
/// means the payload was refused and is fatal.
pub fn classify_status(status: StatusCode, body: &str) -> Result<(), DeliveryError> {
    if status.is_success() {
        return Ok(());
    }

    let message = format!("{}: {}", status, body);
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        Err(DeliveryError::Transient(message))
    } else if status.is_client_error() {
        Err(DeliveryError::Fatal(message))
    } else {
        // Redirects and informational answers: the endpoint is misbehaving,
        // not the payload.
        Err(DeliveryError::Transient(message))
    }
}

/// Classify a request-level error. All of them are transient.
fn classify_request_error(err: &reqwest::Error) -> DeliveryError {
    if err.is_timeout() {
        DeliveryError::Transient("request timed out".to_string())
    } else if err.is_connect() {
        DeliveryError::Transient(format!("connection failed: {}", err))
    } else {
        DeliveryError::Transient(err.to_string())
    }
}

/// HTTP transport publishing each snapshot to `{api_url}/devices/plants/{device_id}`.
///
/// The underlying client is reused across calls for connection pooling.
pub struct HttpTransport {
    /// The underlying HTTP client (reused for connection pooling)
    client: Client,

    /// URL snapshots are posted to
    publish_url: String,

    /// URL probed to establish the session
    health_url: String,

    /// Whether the last `connect()` succeeded and nothing failed since
    connected: bool,
}

impl HttpTransport {
    /// Create a transport for the given device.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Refused` if the HTTP client cannot be built.
    pub fn new(config: &Config, identity: &DeviceIdentity) -> Result<Self, TransportError> {
        Self::with_settings(
            config.publish_url(identity.as_str()),
            config.health_url.clone(),
            config.request_timeout,
        )
    }

    /// Create a transport with explicit endpoints.
    pub fn with_settings(
        publish_url: impl Into<String>,
        health_url: impl Into<String>,
        timeout: Duration,
    ) -> Result<Self, TransportError> {
        let client = Client::builder()
            .timeout(timeout)
            .pool_max_idle_per_host(2)
            .pool_idle_timeout(Duration::from_secs(90))
            .build()
            .map_err(|e| TransportError::Refused(e.to_string()))?;

        Ok(Self {
            client,
            publish_url: publish_url.into(),
            health_url: health_url.into(),
            connected: false,
        })
    }

    pub fn publish_url(&self) -> &str {
        &self.publish_url
    }

    pub fn health_url(&self) -> &str {
        &self.health_url
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Transport for HttpTransport {
    async fn connect(&mut self) -> Result<(), TransportError> {
        debug!(url = %self.health_url, "Connecting to endpoint");

        let response = self.client.get(&self.health_url).send().await.map_err(|e| {
            self.connected = false;
            if e.is_timeout() {
                TransportError::Timeout
            } else {
                TransportError::Unreachable(e.to_string())
            }
        })?;

        let status = response.status();
        if status.is_success() {
            self.connected = true;
            info!(url = %self.health_url, "Connected to endpoint");
            Ok(())
        } else {
            self.connected = false;
            Err(TransportError::Refused(status.to_string()))
        }
    }

    async fn publish(&mut self, payload: &[u8]) -> Result<(), DeliveryError> {
        if !self.connected {
            return Err(DeliveryError::Transient("not connected".to_string()));
        }

        debug!(bytes = payload.len(), url = %self.publish_url, "Publishing snapshot");

        let response = self
            .client
            .post(&self.publish_url)
            .header(header::CONTENT_TYPE, "application/json")
            .body(payload.to_vec())
            .send()
            .await
            .map_err(|e| {
                self.connected = false;
                classify_request_error(&e)
            })?;

        let status = response.status();
        let body = if status.is_success() {
            String::new()
        } else {
            response
                .text()
                .await
                .unwrap_or_else(|_| "Unknown error".to_string())
        };

        let result = classify_status(status, &body);
        match &result {
            Ok(()) => debug!(status = %status, "Snapshot accepted"),
            Err(e) => {
                if e.is_transient() {
                    self.connected = false;
                }
                warn!(status = %status, error = %e, "Snapshot not accepted");
            }
        }
        result
    }

    async fn disconnect(&mut self) {
        if self.connected {
            info!(url = %self.publish_url, "Disconnecting from endpoint");
        }
        self.connected = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_error_display() {
        assert_eq!(TransportError::Timeout.to_string(), "Connection attempt timed out");
        let err = TransportError::Unreachable("dns failure".to_string());
        assert!(err.to_string().contains("dns failure"));
    }

    #[test]
    fn test_delivery_error_display_and_kind() {
        let err = DeliveryError::Transient("broker down".to_string());
        assert!(err.is_transient());
        assert!(err.to_string().starts_with("Transient"));

        let err = DeliveryError::Fatal("bad json".to_string());
        assert!(!err.is_transient());
        assert!(err.to_string().contains("bad json"));
    }

    #[test]
    fn test_transport_error_converts_to_transient() {
        let err: DeliveryError = TransportError::Timeout.into();
        assert!(err.is_transient());
    }

    #[test]
    fn test_status_classification() {
        assert_eq!(classify_status(StatusCode::OK, ""), Ok(()));
        assert_eq!(classify_status(StatusCode::ACCEPTED, ""), Ok(()));

        // Server errors and rate limiting are transient
        assert!(classify_status(StatusCode::INTERNAL_SERVER_ERROR, "")
            .unwrap_err()
            .is_transient());
        assert!(classify_status(StatusCode::SERVICE_UNAVAILABLE, "")
            .unwrap_err()
            .is_transient());
        assert!(classify_status(StatusCode::TOO_MANY_REQUESTS, "slow down")
            .unwrap_err()
            .is_transient());

        // Payload rejections are fatal
        let err = classify_status(StatusCode::BAD_REQUEST, "Invalid JSON").unwrap_err();
        assert!(matches!(err, DeliveryError::Fatal(_)));
        assert!(err.to_string().contains("Invalid JSON"));
        assert!(matches!(
            classify_status(StatusCode::PAYLOAD_TOO_LARGE, "").unwrap_err(),
            DeliveryError::Fatal(_)
        ));
        assert!(matches!(
            classify_status(StatusCode::UNPROCESSABLE_ENTITY, "").unwrap_err(),
            DeliveryError::Fatal(_)
        ));
    }

    #[test]
    fn test_transport_creation() {
        let config = Config::default();
        let identity = DeviceIdentity::parse("67e55044-10b1-426f-9247-bb680e5fe0c8").unwrap();
        let transport = HttpTransport::new(&config, &identity).unwrap();

        assert_eq!(
            transport.publish_url(),
            "http://localhost:8000/devices/plants/67e55044-10b1-426f-9247-bb680e5fe0c8"
        );
        assert_eq!(transport.health_url(), "http://localhost:8000/health");
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_publish_without_session_is_transient() {
        let mut transport = HttpTransport::with_settings(
            "http://127.0.0.1:9/devices/plants/x",
            "http://127.0.0.1:9/health",
            Duration::from_millis(200),
        )
        .unwrap();

        let err = transport.publish(b"{}").await.unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let mut transport = HttpTransport::with_settings(
            "http://127.0.0.1:9/devices/plants/x",
            "http://127.0.0.1:9/health",
            Duration::from_millis(500),
        )
        .unwrap();

        assert!(transport.connect().await.is_err());
        assert!(!transport.is_connected());
        transport.disconnect().await;
    }
}
