//! Errors raised at the boundary of consumed services.

use std::future::Future;
use std::time::Duration;

use thiserror::Error;

/// Failure of an external service call (store, group lifecycle, policy, identity resolution).
#[derive(Debug, Clone, Error)]
pub enum ServiceError {
    /// The service is not reachable or not supported in this environment.
    #[error("Service unavailable: {0}")]
    Unavailable(String),

    /// The backend refused the request.
    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("Backend error: {0}")]
    Backend(String),
}

impl ServiceError {
    /// Await a service call, turning expiry of `timeout` into [`ServiceError::Timeout`].
    pub async fn within<T, F>(timeout: Duration, call: F) -> Result<T, ServiceError>
    where
        F: Future<Output = Result<T, ServiceError>>,
    {
        tokio::time::timeout(timeout, call)
            .await
            .unwrap_or(Err(ServiceError::Timeout(timeout)))
    }
}
