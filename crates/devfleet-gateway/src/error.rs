//! API error types and responses.
//!
//! Errors use the same body as a cold reset reply,
//! `{"success": false, "description": ...}`, so registry-side callers
//! need to understand only one shape.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use devfleet_agent::{AgentError, ColdResetOutcome};
use thiserror::Error;

/// API error type that implements `IntoResponse`.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Invalid request parameters or unknown device.
    #[error("{0}")]
    BadRequest(String),

    /// The request conflicts with the device's current state.
    #[error("{0}")]
    Conflict(String),

    /// A collaborator (registry) is not available.
    #[error("{0}")]
    Unavailable(String),

    /// Internal server error.
    #[error("{0}")]
    Internal(String),
}

impl ApiError {
    /// Get the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::BadRequest(_) => StatusCode::BAD_REQUEST,
            Self::Conflict(_) => StatusCode::CONFLICT,
            Self::Unavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ColdResetOutcome {
            success: false,
            description: self.to_string(),
        };

        (status, Json(body)).into_response()
    }
}

impl From<AgentError> for ApiError {
    fn from(err: AgentError) -> Self {
        match err {
            AgentError::DeviceNotFound(_) => Self::BadRequest(err.to_string()),
            AgentError::InvalidTransition { .. } | AgentError::Cancelled(_) => {
                Self::Conflict(err.to_string())
            }
            AgentError::Registry(ref registry_err) => {
                tracing::warn!(error = %registry_err, "Registry unavailable");
                Self::Unavailable(err.to_string())
            }
            AgentError::ResourceExhausted { .. }
            | AgentError::StartupTimeout { .. }
            | AgentError::StartupFailed { .. }
            | AgentError::HealthcheckFailed { .. } => {
                tracing::error!(error = %err, "Unexpected device failure");
                Self::Internal(err.to_string())
            }
        }
    }
}
