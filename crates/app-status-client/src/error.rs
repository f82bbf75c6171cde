//! App status client errors

use thiserror::Error;

/// Errors that can occur when interacting with the application status API
#[derive(Debug, Error)]
pub enum ClientError {
    /// HTTP request/response error (connect failure, timeout, broken body)
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// The API could not be reached for a reason other than an HTTP client error
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The API answered with an unexpected status code
    #[error("API error: {status} - {body}")]
    Api {
        /// HTTP status code
        status: u16,
        /// Response body (possibly truncated)
        body: String,
    },

    /// Authentication failed (bad credentials, malformed token response)
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// JSON serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Invalid client configuration (bad URL, TLS setup)
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl ClientError {
    /// Whether retrying the same call later may succeed.
    ///
    /// Network failures, timeouts, 5xx and 429 are transient. Everything else
    /// (credentials, malformed payloads, configuration) will fail again.
    pub fn is_transient(&self) -> bool {
        match self {
            ClientError::Http(_) | ClientError::Unavailable(_) => true,
            ClientError::Api { status, .. } => *status >= 500 || *status == 429,
            ClientError::Authentication(_)
            | ClientError::Serialization(_)
            | ClientError::InvalidConfig(_) => false,
        }
    }
}

/// Why a status update was given up on without a fatal error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// Network errors, timeouts or 5xx responses outlasted the retry budget
    Transient,
    /// The API refused this particular update (4xx other than auth)
    ClientRejection,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::ClientRejection => write!(f, "client-rejection"),
        }
    }
}

/// Errors that must stop the publisher's caller
#[derive(Debug, Error)]
pub enum PublishError {
    /// Credentials were rejected even after a fresh token was fetched
    #[error("Fatal authentication failure while publishing {app_instance_id}: {reason}")]
    Fatal {
        /// Instance whose update triggered the failure
        app_instance_id: String,
        /// Diagnostic from the last rejection
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(ClientError::Unavailable("refused".to_string()).is_transient());
        assert!(ClientError::Api { status: 503, body: String::new() }.is_transient());
        assert!(ClientError::Api { status: 429, body: String::new() }.is_transient());
        assert!(!ClientError::Api { status: 400, body: String::new() }.is_transient());
        assert!(!ClientError::Authentication("bad password".to_string()).is_transient());
        assert!(!ClientError::InvalidConfig("no scheme".to_string()).is_transient());
    }
}
