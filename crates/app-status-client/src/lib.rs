//! Application Status API Client
//!
//! A Rust client library for the application status API used by the
//! app-status controller. Handles token authentication, token caching and
//! retrying status delivery.
//!
//! # Example
//!
//! ```no_run
//! use app_status_client::{
//!     AppStatus, AppStatusClient, ClientOptions, Credentials, Endpoints, RetryPolicy,
//!     StatusPublisher, StatusUpdateRequest, TokenManager, DEFAULT_TOKEN_TTL,
//! };
//! use std::sync::Arc;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = AppStatusClient::new(
//!     Endpoints::from_base("http://studio.127.0.0.1.nip.io:8080"),
//!     &ClientOptions::default(),
//! )?;
//! let api: Arc<dyn app_status_client::AppStatusApi> = Arc::new(client);
//!
//! let tokens = Arc::new(TokenManager::new(
//!     Arc::clone(&api),
//!     Credentials::new("service-account", "password"),
//!     DEFAULT_TOKEN_TTL,
//! ));
//! let publisher = StatusPublisher::new(api, tokens, RetryPolicy::default());
//!
//! let request = StatusUpdateRequest::new("my-release", AppStatus::Running);
//! let outcome = publisher.publish(&request).await?;
//! println!("{:?}", outcome);
//! # Ok(())
//! # }
//! ```
//!
//! # Features
//!
//! - **Token Auth**: Single-flight token fetch shared by concurrent publishers
//! - **Retry Logic**: Exponential backoff for 5xx, 429 and network errors
//! - **Auth Recovery**: One token refresh on 401/403 before failing hard

pub mod backoff;
pub mod client;
pub mod error;
pub mod models;
pub mod publisher;
#[path = "trait.rs"]
pub mod status_api;
pub mod token;
#[cfg(any(test, feature = "test-util"))]
pub mod mock;

pub use backoff::ExponentialBackoff;
pub use client::{AppStatusClient, ClientOptions, Endpoints};
pub use error::{ClientError, FailureKind, PublishError};
pub use models::*;
pub use publisher::{PublishOutcome, RetryPolicy, StatusPublisher};
pub use status_api::AppStatusApi;
pub use token::{TokenManager, DEFAULT_TOKEN_TTL};
#[cfg(any(test, feature = "test-util"))]
pub use mock::{MockAppStatusApi, StatusReply, TokenReply};
