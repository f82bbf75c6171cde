//! AppStatusApi trait for mocking
//!
//! This trait abstracts the HTTP transport to the application status API so the
//! token manager and publisher can be unit tested without a running server.
//! The concrete `AppStatusClient` implements this trait, and tests use
//! `MockAppStatusApi`.

use crate::error::ClientError;
use crate::models::{ApiResponse, Credentials, StatusUpdateRequest};

/// Transport-level operations against the application status API
///
/// All async methods must be `Send` to work with Tokio's work-stealing runtime.
#[async_trait::async_trait]
pub trait AppStatusApi: Send + Sync {
    /// Get the base URL
    fn base_url(&self) -> &str;

    /// Check that the API answers its availability endpoint with 200
    async fn ping(&self) -> Result<bool, ClientError>;

    /// Exchange credentials for a token.
    ///
    /// Rejected credentials surface as `ClientError::Authentication`.
    async fn authenticate(&self, credentials: &Credentials) -> Result<String, ClientError>;

    /// Send one status update with the given token and return the raw response.
    ///
    /// Only transport failures are errors; every HTTP status is returned as-is.
    async fn send_status(
        &self,
        token: &str,
        request: &StatusUpdateRequest,
    ) -> Result<ApiResponse, ClientError>;
}
