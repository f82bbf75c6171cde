//! Application status API client
//!
//! Implements the HTTP transport for the token-auth, app-status and
//! availability endpoints. Retry and token caching live in `publisher` and
//! `token`; this client performs exactly one request per call.

use crate::error::ClientError;
use crate::models::{ApiResponse, Credentials, StatusUpdateRequest, TokenRequest, TokenResponse};
use crate::status_api::AppStatusApi;
use reqwest::Client;
use std::time::Duration;
use tracing::debug;

/// Default path of the token-auth endpoint
pub const DEFAULT_TOKEN_PATH: &str = "/api/v1/token-auth/";
/// Default path of the app-status endpoint
pub const DEFAULT_STATUS_PATH: &str = "/api/v1/app-status/";
/// Default path of the availability endpoint
pub const DEFAULT_PING_PATH: &str = "/openapi/v1/are-you-there";

/// Fully resolved endpoint URLs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    /// Root of the API, without a trailing slash
    pub base_url: String,
    /// Token-auth endpoint
    pub token_url: String,
    /// App-status update endpoint
    pub status_url: String,
    /// Availability endpoint
    pub ping_url: String,
}

impl Endpoints {
    /// Build the default endpoint set under `base_url`
    ///
    /// # Arguments
    /// * `base_url` - API base URL (e.g., "http://studio.example:8080")
    pub fn from_base(base_url: &str) -> Self {
        let base_url = base_url.trim_end_matches('/').to_string();
        Self {
            token_url: format!("{}{}", base_url, DEFAULT_TOKEN_PATH),
            status_url: format!("{}{}", base_url, DEFAULT_STATUS_PATH),
            ping_url: format!("{}{}", base_url, DEFAULT_PING_PATH),
            base_url,
        }
    }

    /// Replace the token URL when an override is given
    #[must_use]
    pub fn with_token_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url {
            self.token_url = url;
        }
        self
    }

    /// Replace the status URL when an override is given
    #[must_use]
    pub fn with_status_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url {
            self.status_url = url;
        }
        self
    }

    /// Replace the ping URL when an override is given
    #[must_use]
    pub fn with_ping_url(mut self, url: Option<String>) -> Self {
        if let Some(url) = url {
            self.ping_url = url;
        }
        self
    }
}

/// Transport settings for the HTTP client
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Total request timeout
    pub timeout: Duration,
    /// TCP connect timeout
    pub connect_timeout: Duration,
    /// Skip TLS certificate verification (development clusters only)
    pub accept_invalid_certs: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            connect_timeout: Duration::from_secs(3),
            accept_invalid_certs: false,
        }
    }
}

/// Application status API client
#[derive(Debug, Clone)]
pub struct AppStatusClient {
    client: Client,
    endpoints: Endpoints,
}

impl AppStatusClient {
    /// Create a new client
    ///
    /// # Arguments
    /// * `endpoints` - Resolved endpoint URLs
    /// * `options` - Timeouts and TLS settings
    pub fn new(endpoints: Endpoints, options: &ClientOptions) -> Result<Self, ClientError> {
        for url in [&endpoints.token_url, &endpoints.status_url, &endpoints.ping_url] {
            reqwest::Url::parse(url)
                .map_err(|e| ClientError::InvalidConfig(format!("invalid endpoint URL {}: {}", url, e)))?;
        }

        let client = Client::builder()
            .timeout(options.timeout)
            .connect_timeout(options.connect_timeout)
            .danger_accept_invalid_certs(options.accept_invalid_certs)
            .build()
            .map_err(ClientError::Http)?;

        Ok(Self { client, endpoints })
    }
}

#[async_trait::async_trait]
impl AppStatusApi for AppStatusClient {
    fn base_url(&self) -> &str {
        &self.endpoints.base_url
    }

    async fn ping(&self) -> Result<bool, ClientError> {
        debug!("Verifying that the API is available via {}", self.endpoints.ping_url);

        let response = self.client
            .get(&self.endpoints.ping_url)
            .header("Accept", "application/json")
            .send()
            .await?;

        Ok(response.status() == 200)
    }

    async fn authenticate(&self, credentials: &Credentials) -> Result<String, ClientError> {
        debug!("Requesting API token for user {}", credentials.username);

        let response = self.client
            .post(&self.endpoints.token_url)
            .header("Accept", "application/json")
            .json(&TokenRequest {
                username: &credentials.username,
                password: &credentials.password,
            })
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await.unwrap_or_default();

        if status == 400 || status == 401 || status == 403 {
            return Err(ClientError::Authentication(format!(
                "token endpoint rejected credentials: {} - {}",
                status,
                preview(&body)
            )));
        }

        if !status.is_success() {
            return Err(ClientError::Api {
                status: status.as_u16(),
                body: preview(&body),
            });
        }

        let parsed: TokenResponse = serde_json::from_str(&body).map_err(|e| {
            ClientError::Authentication(format!("token endpoint returned non-JSON body: {}", e))
        })?;

        match parsed.token {
            Some(token) if !token.is_empty() => {
                debug!("Token fetched successfully");
                Ok(token)
            }
            _ => Err(ClientError::Authentication(
                "no token in response, check credentials or server response format".to_string(),
            )),
        }
    }

    async fn send_status(
        &self,
        token: &str,
        request: &StatusUpdateRequest,
    ) -> Result<ApiResponse, ClientError> {
        debug!(
            "POST {} for {} with status {}",
            self.endpoints.status_url, request.app_instance_id, request.status
        );

        let response = self.client
            .post(&self.endpoints.status_url)
            .header("Authorization", format!("Token {}", token))
            .header("Accept", "application/json")
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await?;

        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();

        Ok(ApiResponse::new(status, body))
    }
}

/// First 200 characters of a response body, for diagnostics
fn preview(body: &str) -> String {
    body.chars().take(200).collect()
}
