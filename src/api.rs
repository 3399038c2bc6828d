//! HTTP client for the Chatter REST API.
//!
//! Only the hand-written convenience surface lives here (server configuration
//! and health); the bulk of the REST API is covered by generated bindings and
//! stays out of this crate.

use std::sync::Arc;
use std::time::Duration;

use reqwest::{Client, StatusCode};
use secrecy::ExposeSecret;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::AuthProvider;
use crate::retry::{retry_async, RetryPolicy};

const ERROR_BODY_SNIPPET_LEN: usize = 220;
/// Production REST base URL.
pub const API_BASE_URL: &str = "https://api.chatterhq.io";
/// Local development REST base URL.
pub const LOCAL_API_BASE_URL: &str = "http://localhost:8000";

/// Default timeouts and retry behavior for API requests.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ApiDefaults;

impl ApiDefaults {
    pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
    pub const ATTEMPT_TIMEOUT: Duration = Duration::from_secs(5);
}

/// Tunable options for [`ChatterApiClient`].
#[derive(Clone, Debug)]
pub struct ChatterApiClientOptions {
    pub connect_timeout: Duration,
    pub attempt_timeout: Duration,
    pub retry_policy: RetryPolicy,
}

impl Default for ChatterApiClientOptions {
    fn default() -> Self {
        Self {
            connect_timeout: ApiDefaults::CONNECT_TIMEOUT,
            attempt_timeout: ApiDefaults::ATTEMPT_TIMEOUT,
            retry_policy: RetryPolicy::low_latency(),
        }
    }
}

/// Authenticated client for the convenience REST endpoints.
#[derive(Clone)]
pub struct ChatterApiClient {
    http: Client,
    auth: Arc<dyn AuthProvider>,
    attempt_timeout: Duration,
    retry_policy: RetryPolicy,
    local: bool,
    base_override: Option<String>,
}

impl ChatterApiClient {
    /// Creates a client with default options.
    pub fn new(auth: Arc<dyn AuthProvider>) -> Result<Self, ApiError> {
        Self::with_options(auth, ChatterApiClientOptions::default())
    }

    /// Creates a client with explicit options.
    pub fn with_options(
        auth: Arc<dyn AuthProvider>,
        options: ChatterApiClientOptions,
    ) -> Result<Self, ApiError> {
        let http = Client::builder()
            .connect_timeout(options.connect_timeout)
            .build()
            .map_err(ApiError::Transport)?;

        Ok(Self {
            http,
            auth,
            attempt_timeout: options.attempt_timeout,
            retry_policy: options.retry_policy,
            local: false,
            base_override: None,
        })
    }

    /// Enables or disables local mode base URL routing.
    pub fn with_local_mode(mut self, local: bool) -> Self {
        self.local = local;
        self
    }

    /// Sets an explicit base URL override.
    ///
    /// The override takes precedence over local mode when set.
    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        let base_url = base_url.into();
        self.base_override = Some(base_url.trim_end_matches('/').to_string());
        self
    }

    /// Fetches the server's feature configuration.
    pub async fn server_config(&self) -> Result<ServerConfig, ApiError> {
        let endpoint = self.endpoint("/v1/config");
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |_| {
                let endpoint = endpoint.clone();
                async move {
                    let body = self.get_attempt(&endpoint).await?;
                    serde_json::from_str(&body)
                        .map_err(|err| ApiError::Parse(err.to_string()))
                }
            },
            ApiError::is_retryable,
        )
        .await
    }

    /// Checks service liveness.
    pub async fn health(&self) -> Result<(), ApiError> {
        let endpoint = self.endpoint("/v1/health");
        let policy = self.retry_policy.clone();

        retry_async(
            &policy,
            |_| {
                let endpoint = endpoint.clone();
                async move { self.get_attempt(&endpoint).await.map(|_| ()) }
            },
            ApiError::is_retryable,
        )
        .await
    }

    fn endpoint(&self, path: &str) -> String {
        format!("{}{}", self.base_url(), path)
    }

    fn base_url(&self) -> &str {
        if let Some(base) = self.base_override.as_deref() {
            return base;
        }
        if self.local {
            LOCAL_API_BASE_URL
        } else {
            API_BASE_URL
        }
    }

    async fn get_attempt(&self, endpoint: &str) -> Result<String, ApiError> {
        let mut builder = self.http.get(endpoint).timeout(self.attempt_timeout);

        if let Some(token) = self.auth.bearer_token() {
            builder = builder.bearer_auth(token.expose_secret());
        }

        let response = builder.send().await.map_err(ApiError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(ApiError::Transport)?;

        if !status.is_success() {
            return Err(ApiError::HttpStatus {
                status,
                body: summarize_error_body(&body),
            });
        }

        Ok(body)
    }
}

/// Server feature configuration returned by `/v1/config`.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct ServerConfig {
    /// Server build version.
    pub version: String,
    /// Enabled feature flags.
    #[serde(default)]
    pub features: Vec<String>,
    /// Events-stream path override advertised by the server.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub events_stream_path: Option<String>,
}

/// Errors produced by REST transport and response handling.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Request failed before a response arrived.
    #[error("request failed: {0}")]
    Transport(reqwest::Error),

    /// Server answered with a non-success status.
    #[error("http status {status}: {body}")]
    HttpStatus { status: StatusCode, body: String },

    /// Response body did not match the expected schema.
    #[error("failed to parse response: {0}")]
    Parse(String),
}

impl ApiError {
    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::HttpStatus { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Parse(_) => false,
        }
    }
}

fn summarize_error_body(body: &str) -> String {
    #[derive(Debug, Deserialize)]
    struct ErrorBody {
        #[serde(default)]
        error: Option<String>,
        #[serde(default)]
        message: Option<String>,
        #[serde(default)]
        reason: Option<String>,
    }

    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        if let Some(message) = parsed.error.or(parsed.message).or(parsed.reason) {
            return message;
        }
    }

    body.chars().take(ERROR_BODY_SNIPPET_LEN).collect()
}

#[cfg(test)]
mod tests {
    use reqwest::StatusCode;

    use super::{summarize_error_body, ApiError, ServerConfig, API_BASE_URL, LOCAL_API_BASE_URL};

    #[test]
    fn base_urls_point_at_known_hosts() {
        assert_eq!(API_BASE_URL, "https://api.chatterhq.io");
        assert_eq!(LOCAL_API_BASE_URL, "http://localhost:8000");
    }

    #[test]
    fn server_config_parses_with_optional_fields_missing() {
        let config: ServerConfig =
            serde_json::from_str(r#"{"version":"1.4.2"}"#).expect("parse minimal config");
        assert_eq!(config.version, "1.4.2");
        assert!(config.features.is_empty());
        assert!(config.events_stream_path.is_none());
    }

    #[test]
    fn server_config_parses_full_payload() {
        let config: ServerConfig = serde_json::from_str(
            r#"{"version":"1.4.2","features":["chat","workflows"],"events_stream_path":"/v1/events/stream"}"#,
        )
        .expect("parse full config");
        assert_eq!(config.features, vec!["chat", "workflows"]);
        assert_eq!(
            config.events_stream_path.as_deref(),
            Some("/v1/events/stream")
        );
    }

    #[test]
    fn server_errors_and_rate_limits_are_retryable() {
        let server_error = ApiError::HttpStatus {
            status: StatusCode::BAD_GATEWAY,
            body: "upstream".to_string(),
        };
        assert!(server_error.is_retryable());

        let rate_limited = ApiError::HttpStatus {
            status: StatusCode::TOO_MANY_REQUESTS,
            body: "slow down".to_string(),
        };
        assert!(rate_limited.is_retryable());

        let unauthorized = ApiError::HttpStatus {
            status: StatusCode::UNAUTHORIZED,
            body: "nope".to_string(),
        };
        assert!(!unauthorized.is_retryable());

        assert!(!ApiError::Parse("bad".to_string()).is_retryable());
    }

    #[test]
    fn error_body_summary_prefers_structured_message() {
        assert_eq!(
            summarize_error_body(r#"{"error":"token expired"}"#),
            "token expired"
        );
        assert_eq!(summarize_error_body("plain text failure"), "plain text failure");
    }
}
