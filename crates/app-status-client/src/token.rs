//! API token cache
//!
//! `TokenManager` hands out a cached token to concurrent publishers and
//! refreshes it at most once at a time. Readers take the `RwLock` read side;
//! a refresh serializes on a separate mutex and re-checks the cache after
//! acquiring it, so callers that queued behind an in-flight refresh reuse its
//! result instead of hitting the token endpoint again.

use crate::error::ClientError;
use crate::models::{AuthToken, Credentials};
use crate::status_api::AppStatusApi;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};

/// Default token lifetime estimate (the server does not report one)
pub const DEFAULT_TOKEN_TTL: Duration = Duration::from_secs(12 * 60 * 60);

/// Shared, refreshable API token
pub struct TokenManager {
    api: Arc<dyn AppStatusApi>,
    credentials: Credentials,
    ttl: Duration,
    current: RwLock<Option<AuthToken>>,
    refresh: Mutex<()>,
}

impl std::fmt::Debug for TokenManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenManager")
            .field("base_url", &self.api.base_url())
            .field("credentials", &self.credentials)
            .field("ttl", &self.ttl)
            .finish_non_exhaustive()
    }
}

impl TokenManager {
    /// Create a token manager with an empty cache
    pub fn new(api: Arc<dyn AppStatusApi>, credentials: Credentials, ttl: Duration) -> Self {
        Self {
            api,
            credentials,
            ttl,
            current: RwLock::new(None),
            refresh: Mutex::new(()),
        }
    }

    /// Return a valid token, fetching one if the cache is empty or expired.
    ///
    /// Concurrent callers that find the cache empty share a single fetch.
    ///
    /// # Errors
    ///
    /// `ClientError::Authentication` when the credentials are rejected;
    /// transport errors are passed through unchanged.
    pub async fn get_token(&self) -> Result<String, ClientError> {
        if let Some(token) = self.cached().await {
            return Ok(token);
        }

        let _guard = self.refresh.lock().await;

        // Another caller may have refreshed while we waited
        if let Some(token) = self.cached().await {
            return Ok(token);
        }

        debug!("Fetching new API token from {}", self.api.base_url());
        let value = self.api.authenticate(&self.credentials).await?;
        let token = AuthToken::new(value, self.ttl);
        let result = token.value().to_string();
        *self.current.write().await = Some(token);
        info!("Obtained API token");

        Ok(result)
    }

    /// Drop the cached token if it is still `rejected`, so the next
    /// `get_token` fetches a fresh one.
    ///
    /// A token that another caller already replaced is left alone.
    pub async fn invalidate(&self, rejected: &str) {
        let mut current = self.current.write().await;
        if current.as_ref().is_some_and(|token| token.value() == rejected) {
            *current = None;
            debug!("Invalidated cached API token");
        } else {
            debug!("Rejected API token was already replaced");
        }
    }

    async fn cached(&self) -> Option<String> {
        self.current
            .read()
            .await
            .as_ref()
            .filter(|token| !token.is_expired())
            .map(|token| token.value().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockAppStatusApi, TokenReply};

    fn manager(mock: &MockAppStatusApi, ttl: Duration) -> TokenManager {
        TokenManager::new(
            Arc::new(mock.clone()),
            Credentials::new("svc", "secret"),
            ttl,
        )
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let mock = MockAppStatusApi::new("http://api.test");
        let tokens = manager(&mock, DEFAULT_TOKEN_TTL);

        let first = tokens.get_token().await.unwrap();
        let second = tokens.get_token().await.unwrap();

        assert_eq!(first, second);
        assert_eq!(mock.auth_calls(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refresh() {
        let mock = MockAppStatusApi::new("http://api.test");
        mock.push_token_reply(TokenReply::Token("first".to_string()));
        mock.push_token_reply(TokenReply::Token("second".to_string()));
        let tokens = manager(&mock, DEFAULT_TOKEN_TTL);

        assert_eq!(tokens.get_token().await.unwrap(), "first");
        tokens.invalidate("first").await;
        assert_eq!(tokens.get_token().await.unwrap(), "second");
        assert_eq!(mock.auth_calls(), 2);
    }

    #[tokio::test]
    async fn test_stale_invalidate_keeps_newer_token() {
        let mock = MockAppStatusApi::new("http://api.test");
        mock.push_token_reply(TokenReply::Token("first".to_string()));
        mock.push_token_reply(TokenReply::Token("second".to_string()));
        let tokens = manager(&mock, DEFAULT_TOKEN_TTL);

        assert_eq!(tokens.get_token().await.unwrap(), "first");
        tokens.invalidate("first").await;
        assert_eq!(tokens.get_token().await.unwrap(), "second");

        // A late rejection of "first" must not throw away "second"
        tokens.invalidate("first").await;
        assert_eq!(tokens.get_token().await.unwrap(), "second");
        assert_eq!(mock.auth_calls(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_token_is_refreshed() {
        let mock = MockAppStatusApi::new("http://api.test");
        let tokens = manager(&mock, Duration::from_secs(60));

        tokens.get_token().await.unwrap();
        tokio::time::advance(Duration::from_secs(61)).await;
        tokens.get_token().await.unwrap();

        assert_eq!(mock.auth_calls(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_fetch() {
        let mock = MockAppStatusApi::new("http://api.test");
        let tokens = Arc::new(manager(&mock, DEFAULT_TOKEN_TTL));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let tokens = Arc::clone(&tokens);
            handles.push(tokio::spawn(async move { tokens.get_token().await }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(mock.auth_calls(), 1);
    }

    #[tokio::test]
    async fn test_rejected_credentials_surface_as_authentication() {
        let mock = MockAppStatusApi::new("http://api.test");
        mock.push_token_reply(TokenReply::Rejected);
        let tokens = manager(&mock, DEFAULT_TOKEN_TTL);

        let result = tokens.get_token().await;
        assert!(matches!(result, Err(ClientError::Authentication(_))));
    }
}
