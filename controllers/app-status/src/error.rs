//! Errors that end the controller process.
//!
//! Per-event failures never surface here: the reconciler turns them into
//! abandoned or skipped outcomes and the worker moves on.

use app_status_client::{ClientError, PublishError};
use kube::Error as KubeError;
use thiserror::Error;

/// Startup, watch and authentication failures, plus wrapped library errors
#[derive(Debug, Error)]
pub enum ControllerError {
    /// Cluster client could not be created
    #[error("Kubernetes error: {0}")]
    Kube(#[from] KubeError),

    /// Application status API error
    #[error("App status API error: {0}")]
    Client(#[from] ClientError),

    /// Credentials rejected by the application status API
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Rejected flag or environment value
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// Pods could not be listed at all
    #[error("Resource watch failed: {0}")]
    Watch(String),

    /// Startup checks did not pass
    #[error("Startup failed: {0}")]
    Startup(String),
}

impl From<PublishError> for ControllerError {
    fn from(err: PublishError) -> Self {
        ControllerError::Authentication(err.to_string())
    }
}
