//! Byte stream acquisition for the events endpoint.
//!
//! The stream client consumes transports through [`EventTransport`] so tests
//! can script chunk sequences without a network. [`HttpEventSource`] is the
//! production implementation: an HTTP GET holding the response body open as a
//! chunked byte stream.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::stream::BoxStream;
use futures_util::{StreamExt, TryStreamExt};
use reqwest::header::ACCEPT;
use reqwest::Client;
use secrecy::{ExposeSecret, SecretString};

use crate::stream::client::StreamClientError;

/// Production events-stream endpoint.
pub const EVENTS_ENDPOINT: &str = "https://api.chatterhq.io/v1/events/stream";
/// Local development events-stream endpoint.
pub const LOCAL_EVENTS_ENDPOINT: &str = "http://localhost:8000/v1/events/stream";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Cancellable chunk stream; dropping it releases the underlying connection.
pub type ByteChunkStream = BoxStream<'static, Result<Bytes, StreamClientError>>;

/// Source of raw event stream bytes.
#[async_trait]
pub trait EventTransport: Send + Sync {
    /// Opens one byte stream authorized by `token`.
    ///
    /// HTTP-level rejection (non-2xx) surfaces as
    /// [`StreamClientError::HttpStatus`], distinct from mid-stream transport
    /// failure, so both can route into the reconnect path.
    async fn open(&self, token: &SecretString) -> Result<ByteChunkStream, StreamClientError>;
}

/// HTTP GET transport for the events-stream endpoint.
#[derive(Clone, Debug)]
pub struct HttpEventSource {
    http: Client,
    local: bool,
    endpoint_override: Option<String>,
}

impl HttpEventSource {
    /// Creates a transport for production mode.
    pub fn new() -> Result<Self, StreamClientError> {
        let http = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(StreamClientError::Transport)?;

        Ok(Self {
            http,
            local: false,
            endpoint_override: None,
        })
    }

    /// Enables or disables local mode endpoint routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit stream endpoint override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_endpoint(mut self, endpoint: impl Into<String>) -> Self {
        let endpoint = endpoint.into();
        self.endpoint_override = Some(endpoint.trim_end().to_string());
        self
    }

    fn endpoint(&self) -> &str {
        if let Some(endpoint) = self.endpoint_override.as_deref() {
            return endpoint;
        }
        if self.local {
            LOCAL_EVENTS_ENDPOINT
        } else {
            EVENTS_ENDPOINT
        }
    }
}

#[async_trait]
impl EventTransport for HttpEventSource {
    async fn open(&self, token: &SecretString) -> Result<ByteChunkStream, StreamClientError> {
        let response = self
            .http
            .get(self.endpoint())
            .header(ACCEPT, "text/event-stream")
            .bearer_auth(token.expose_secret())
            .send()
            .await
            .map_err(StreamClientError::Transport)?;

        let status = response.status();
        if !status.is_success() {
            return Err(StreamClientError::HttpStatus(status));
        }

        Ok(response
            .bytes_stream()
            .map_err(StreamClientError::Transport)
            .boxed())
    }
}
