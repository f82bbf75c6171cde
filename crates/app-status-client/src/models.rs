//! Application status API models
//!
//! Request/response bodies for the token and app-status endpoints, plus the
//! `AppStatus` domain enum shared with the controller.

use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::time::Instant;

/// Maximum length of pod/container messages forwarded to the API
pub const MAX_MESSAGE_LEN: usize = 512;

/// Lifecycle state of an application instance as understood by the remote API
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AppStatus {
    /// Scheduled or starting, not serving yet
    Pending,
    /// Serving traffic
    Running,
    /// Exited unsuccessfully
    Failed,
    /// Stuck in a container error such as a crash loop or image pull failure
    Error,
    /// Gone or going away
    Deleted,
    /// State could not be determined
    Unknown,
}

impl AppStatus {
    /// Every status the remote API accepts
    pub const ALL: [AppStatus; 6] = [
        AppStatus::Pending,
        AppStatus::Running,
        AppStatus::Failed,
        AppStatus::Error,
        AppStatus::Deleted,
        AppStatus::Unknown,
    ];

    /// Wire name of the status
    pub fn as_str(&self) -> &'static str {
        match self {
            AppStatus::Pending => "Pending",
            AppStatus::Running => "Running",
            AppStatus::Failed => "Failed",
            AppStatus::Error => "Error",
            AppStatus::Deleted => "Deleted",
            AppStatus::Unknown => "Unknown",
        }
    }
}

impl fmt::Display for AppStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for AppStatus {
    type Err = String;

    /// Case-insensitive parse, so `running` and `Running` are both accepted.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let needle = s.trim();
        AppStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(needle))
            .ok_or_else(|| format!("unknown app status '{}'", s))
    }
}

/// Diagnostic messages attached to a status update
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventMessages {
    /// Pod-level status message
    pub pod_msg: Option<String>,
    /// Message of the container that explains the status
    pub container_msg: Option<String>,
}

/// Status update sent to the app-status endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusUpdateRequest {
    /// Release the status belongs to
    pub app_instance_id: String,
    /// Status to record
    pub status: AppStatus,
    /// Where the app is served; only sent with `Running`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// UTC timestamp of when the status was derived (RFC 3339, milliseconds)
    pub event_ts: String,
    /// Truncated diagnostics, possibly empty
    #[serde(default)]
    pub event_msg: EventMessages,
}

impl StatusUpdateRequest {
    /// Create a request stamped with the current time
    pub fn new(app_instance_id: impl Into<String>, status: AppStatus) -> Self {
        Self {
            app_instance_id: app_instance_id.into(),
            status,
            url: None,
            event_ts: timestamp_now(),
            event_msg: EventMessages::default(),
        }
    }

    /// Attach the resolved access URL
    #[must_use]
    pub fn with_url(mut self, url: Option<String>) -> Self {
        self.url = url;
        self
    }

    /// Attach pod/container messages, truncated to `MAX_MESSAGE_LEN`
    #[must_use]
    pub fn with_messages(mut self, pod_msg: Option<&str>, container_msg: Option<&str>) -> Self {
        self.event_msg = EventMessages {
            pod_msg: pod_msg.map(truncate_message),
            container_msg: container_msg.map(truncate_message),
        };
        self
    }
}

/// Current UTC time formatted as `2025-01-01T00:00:00.000Z`
pub fn timestamp_now() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn truncate_message(msg: &str) -> String {
    msg.chars().take(MAX_MESSAGE_LEN).collect()
}

/// Username/password pair exchanged for an API token
#[derive(Clone)]
pub struct Credentials {
    /// Service account name
    pub username: String,
    /// Never logged
    pub password: String,
}

impl Credentials {
    /// Credentials for the token endpoint
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Body of the token-auth request
#[derive(Debug, Serialize)]
pub struct TokenRequest<'a> {
    /// Service account name
    pub username: &'a str,
    /// Service account password
    pub password: &'a str,
}

/// Body of the token-auth response
#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    /// Missing when the server answers without issuing a token
    #[serde(default)]
    pub token: Option<String>,
}

/// Cached API credential
#[derive(Clone)]
pub struct AuthToken {
    value: String,
    obtained_at: Instant,
    ttl_estimate: Duration,
}

impl AuthToken {
    /// Token obtained now, expected to stay valid for `ttl_estimate`
    pub fn new(value: impl Into<String>, ttl_estimate: Duration) -> Self {
        Self {
            value: value.into(),
            obtained_at: Instant::now(),
            ttl_estimate,
        }
    }

    /// Raw token value for the `Authorization` header
    pub fn value(&self) -> &str {
        &self.value
    }

    /// Whether the ttl estimate has elapsed
    pub fn is_expired(&self) -> bool {
        self.obtained_at.elapsed() >= self.ttl_estimate
    }
}

impl fmt::Debug for AuthToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthToken")
            .field("value", &"<redacted>")
            .field("obtained_at", &self.obtained_at)
            .field("ttl_estimate", &self.ttl_estimate)
            .finish()
    }
}

/// Raw status/body pair returned by the app-status endpoint.
///
/// Classification (success, auth, rejection, transient) is left to the publisher.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiResponse {
    /// HTTP status code
    pub status: u16,
    /// Response body as text
    pub body: String,
}

impl ApiResponse {
    /// Response with `status` and `body`
    pub fn new(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            body: body.into(),
        }
    }

    /// Any 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 401 or 403
    pub fn is_auth_failure(&self) -> bool {
        self.status == 401 || self.status == 403
    }
}
