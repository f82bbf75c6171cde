//! Status publisher with bounded retry
//!
//! Delivers one `StatusUpdateRequest` to the app-status endpoint:
//!
//! - 2xx: published
//! - 404 carrying `OBJECT_NOT_FOUND`: the instance no longer exists upstream, ignored
//! - 401/403: token invalidated and the update re-sent once; a second rejection is fatal
//! - 5xx, 429 and network errors: retried with exponential backoff, then abandoned
//! - any other 4xx: abandoned immediately as a client rejection

use crate::backoff::ExponentialBackoff;
use crate::error::{FailureKind, PublishError};
use crate::models::{ApiResponse, StatusUpdateRequest};
use crate::status_api::AppStatusApi;
use crate::token::TokenManager;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, warn};

/// Marker body the API returns when the instance is unknown to it
const OBJECT_NOT_FOUND: &str = "OBJECT_NOT_FOUND";

/// Retry budget for a single update
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts spent on transient failures before giving up
    pub max_attempts: u32,
    /// Delay before the first retry
    pub base_delay: Duration,
    /// Cap for any single delay
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Non-fatal result of a publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the API
    Published {
        /// Number of requests sent, including auth retries
        attempts: u32,
    },
    /// The API does not know this instance; nothing to do
    Ignored {
        /// HTTP status of the response
        status: u16,
    },
    /// Given up without affecting other updates
    Abandoned {
        /// Why the update was given up
        kind: FailureKind,
        /// Number of requests sent before giving up
        attempts: u32,
        /// Last error or response seen
        reason: String,
    },
}

/// Sends status updates through a shared token cache
pub struct StatusPublisher {
    api: Arc<dyn AppStatusApi>,
    tokens: Arc<TokenManager>,
    policy: RetryPolicy,
}

impl std::fmt::Debug for StatusPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StatusPublisher")
            .field("base_url", &self.api.base_url())
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

/// How a single send attempt ended
enum Attempt {
    Done(PublishOutcome),
    AuthRejected(String),
    Transient(String),
}

impl StatusPublisher {
    /// Publisher sharing `tokens` with every other publisher of the same API
    pub fn new(api: Arc<dyn AppStatusApi>, tokens: Arc<TokenManager>, policy: RetryPolicy) -> Self {
        Self { api, tokens, policy }
    }

    /// Deliver `request`, retrying per the policy.
    ///
    /// # Errors
    ///
    /// `PublishError::Fatal` when credentials are rejected by the token
    /// endpoint, or when the status endpoint rejects a freshly fetched token.
    pub async fn publish(&self, request: &StatusUpdateRequest) -> Result<PublishOutcome, PublishError> {
        let mut backoff =
            ExponentialBackoff::new(self.policy.base_delay, self.policy.max_delay);
        let mut sends: u32 = 0;
        let mut transient_failures: u32 = 0;
        let mut auth_retried = false;

        loop {
            let (token, attempt) = match self.tokens.get_token().await {
                Ok(token) => {
                    sends += 1;
                    let attempt = self.send_once(&token, request, sends).await;
                    (Some(token), attempt)
                }
                Err(e) if e.is_transient() => {
                    (None, Attempt::Transient(format!("token endpoint: {}", e)))
                }
                Err(e) => {
                    error!("Cannot obtain API token while publishing {}: {}", request.app_instance_id, e);
                    return Err(PublishError::Fatal {
                        app_instance_id: request.app_instance_id.clone(),
                        reason: e.to_string(),
                    });
                }
            };

            match attempt {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::AuthRejected(reason) if !auth_retried => {
                    warn!(
                        "Status API rejected token for {} ({}), refreshing token and retrying once",
                        request.app_instance_id, reason
                    );
                    auth_retried = true;
                    if let Some(token) = &token {
                        self.tokens.invalidate(token).await;
                    }
                }
                Attempt::AuthRejected(reason) => {
                    error!(
                        "Status API rejected a fresh token for {}: {}",
                        request.app_instance_id, reason
                    );
                    return Err(PublishError::Fatal {
                        app_instance_id: request.app_instance_id.clone(),
                        reason,
                    });
                }
                Attempt::Transient(reason) => {
                    transient_failures += 1;
                    if transient_failures >= self.policy.max_attempts {
                        return Ok(PublishOutcome::Abandoned {
                            kind: FailureKind::Transient,
                            attempts: sends,
                            reason,
                        });
                    }
                    let delay = backoff.next_backoff();
                    warn!(
                        "Transient failure publishing {} (attempt {}/{}): {}. Retrying in {:?}",
                        request.app_instance_id,
                        transient_failures,
                        self.policy.max_attempts,
                        reason,
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }

    async fn send_once(&self, token: &str, request: &StatusUpdateRequest, sends: u32) -> Attempt {
        match self.api.send_status(token, request).await {
            Ok(response) => classify(response, sends),
            Err(e) if e.is_transient() => Attempt::Transient(e.to_string()),
            Err(e) => Attempt::Done(PublishOutcome::Abandoned {
                kind: FailureKind::ClientRejection,
                attempts: sends,
                reason: e.to_string(),
            }),
        }
    }
}

fn classify(response: ApiResponse, sends: u32) -> Attempt {
    if response.is_success() {
        debug!("Status update accepted with {}", response.status);
        return Attempt::Done(PublishOutcome::Published { attempts: sends });
    }

    if response.status == 404 && response.body.contains(OBJECT_NOT_FOUND) {
        debug!("Status API reports instance not found, ignoring: {}", response.body.trim());
        return Attempt::Done(PublishOutcome::Ignored { status: response.status });
    }

    let reason = format!("HTTP {}: {}", response.status, response.body.chars().take(200).collect::<String>());

    if response.is_auth_failure() {
        return Attempt::AuthRejected(reason);
    }

    if response.status >= 500 || response.status == 429 {
        return Attempt::Transient(reason);
    }

    Attempt::Done(PublishOutcome::Abandoned {
        kind: FailureKind::ClientRejection,
        attempts: sends,
        reason,
    })
}
