//! Centralized error types for the DabCast core library.
//!
//! This module provides a unified error handling system that:
//! - Defines structured error types using `thiserror`
//! - Maps errors to appropriate HTTP status codes
//! - Implements `IntoResponse` for automatic error responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Application-wide error type for the DabCast server.
#[derive(Debug, Error)]
pub enum DabcastError {
    /// The requested resource exists as a route but is unknown right now
    /// (service not subscribed, song image never cached, channel malformed).
    #[error("Not found: {0}")]
    NotFound(String),

    /// A long-poll waiter lost its subscription mid-wait.
    ///
    /// Distinguished from [`Self::NotFound`] so clients can tell "controller
    /// torn down under me" (400) from "never existed" (404).
    #[error("Subscription released while waiting")]
    SubscriptionLost,

    /// The tuner is owned by the other subsystem or tuned elsewhere.
    #[error("Tuner busy: {0}")]
    TunerBusy(String),

    /// The DAB subsystem is disabled (no usable driver) or shutting down.
    #[error("DAB service unavailable: {0}")]
    Unavailable(String),

    /// Internal server error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl DabcastError {
    /// Maps the error to an appropriate HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::SubscriptionLost => StatusCode::BAD_REQUEST,
            Self::TunerBusy(_) | Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Convenient Result alias for application-wide operations.
pub type DabcastResult<T> = Result<T, DabcastError>;

impl IntoResponse for DabcastError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        match self {
            // The long-poll protocol expects an empty 400 body on teardown.
            Self::SubscriptionLost => status.into_response(),
            other => (status, other.to_string()).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn subscription_lost_maps_to_bad_request() {
        assert_eq!(
            DabcastError::SubscriptionLost.status_code(),
            StatusCode::BAD_REQUEST
        );
    }

    #[test]
    fn tuner_busy_maps_to_service_unavailable() {
        let err = DabcastError::TunerBusy("scanner holds the lease".into());
        assert_eq!(err.status_code(), StatusCode::SERVICE_UNAVAILABLE);
    }
}
