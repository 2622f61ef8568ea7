//! Application-wide error handling.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Error response structure for consistent API responses
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub error_code: String,
    pub message: String,
    pub correlation_id: String,
    pub timestamp: String,
}

/// Main application error type.
///
/// The kinds mirror how the rest of the system reacts to a failure: caller
/// mistakes are surfaced and never retried, transient I/O feeds circuit
/// breakers and the queue's retry path, and `NeedsReauthentication` is a
/// distinct state the UI turns into a re-login banner.
#[derive(Debug, Error)]
pub enum AppError {
    // Caller input violates a contract
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Resource not found: {resource}")]
    NotFound { resource: String },

    // Transition forbidden by the download/work-item state machines
    #[error("Invalid state transition from '{from}' to '{to}'")]
    InvalidTransition { from: String, to: String },

    // External service errors (transient; counted by circuit breakers)
    #[error("External service unavailable: {service}")]
    ServiceUnavailable { service: String },

    #[error("External service error: {service}: {message}")]
    ExternalService { service: String, message: String },

    #[error("Rate limit exceeded")]
    RateLimited { retry_after: Option<u64> },

    // Token refresh saw an invalid_grant-like signal; background workers
    // skip quietly instead of crash-looping on this
    #[error("Re-authentication required for {service}")]
    NeedsReauthentication { service: String },

    // Database errors
    #[error("Database query failed")]
    Database(#[from] sqlx::Error),

    // System errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AppError>;

impl AppError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) | AppError::InvalidTransition { .. } => StatusCode::BAD_REQUEST,
            AppError::NotFound { .. } => StatusCode::NOT_FOUND,
            AppError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            AppError::NeedsReauthentication { .. } => StatusCode::UNAUTHORIZED,
            AppError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            AppError::ExternalService { .. } => StatusCode::BAD_GATEWAY,
            AppError::Database(_) | AppError::Configuration(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Machine-readable error code for API responses
    pub fn error_code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_FAILED",
            AppError::NotFound { .. } => "NOT_FOUND",
            AppError::InvalidTransition { .. } => "INVALID_STATE",
            AppError::ServiceUnavailable { .. } => "SERVICE_UNAVAILABLE",
            AppError::ExternalService { .. } => "EXTERNAL_SERVICE_ERROR",
            AppError::RateLimited { .. } => "RATE_LIMITED",
            AppError::NeedsReauthentication { .. } => "NEEDS_REAUTH",
            AppError::Database(_) => "DATABASE_ERROR",
            AppError::Configuration(_) => "CONFIGURATION_ERROR",
            AppError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Whether this failure should count against a circuit breaker and is
    /// worth retrying through the queue's backoff path.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            AppError::ServiceUnavailable { .. }
                | AppError::ExternalService { .. }
                | AppError::RateLimited { .. }
        )
    }
}

impl From<reqwest::Error> for AppError {
    fn from(err: reqwest::Error) -> Self {
        let service = err
            .url()
            .and_then(|u| u.host_str().map(String::from))
            .unwrap_or_else(|| "unknown".to_string());

        if err.is_timeout() || err.is_connect() {
            AppError::ServiceUnavailable { service }
        } else {
            AppError::ExternalService {
                service,
                message: err.to_string(),
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let correlation_id = Uuid::new_v4().to_string();
        let status = self.status_code();

        // Client errors are expected; everything else deserves a log line
        if status.is_server_error() {
            tracing::error!(correlation_id = %correlation_id, error = %self, "Request failed");
        } else {
            tracing::debug!(correlation_id = %correlation_id, error = %self, "Request rejected");
        }

        let body = ErrorResponse {
            error: self.error_code().to_string(),
            error_code: self.error_code().to_string(),
            message: self.to_string(),
            correlation_id,
            timestamp: chrono::Utc::now().to_rfc3339(),
        };

        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AppError::Validation("bad id".into()).status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            AppError::NotFound {
                resource: "download".into()
            }
            .status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            AppError::NeedsReauthentication {
                service: "spotify".into()
            }
            .status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            AppError::ServiceUnavailable {
                service: "slskd".into()
            }
            .status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_transient_classification() {
        assert!(AppError::ServiceUnavailable {
            service: "slskd".into()
        }
        .is_transient());
        assert!(AppError::RateLimited { retry_after: None }.is_transient());
        assert!(!AppError::Validation("nope".into()).is_transient());
        assert!(!AppError::NeedsReauthentication {
            service: "spotify".into()
        }
        .is_transient());
    }
}
