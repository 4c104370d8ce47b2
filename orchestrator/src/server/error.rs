//! Mapping of orchestrator errors onto HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use openapi_server::models::ErrorResponse;
use tracing::error;

use crate::errors::OrchestratorError;

/// Error returned by every handler
#[derive(Debug)]
pub struct ApiError(pub OrchestratorError);

impl From<OrchestratorError> for ApiError {
    fn from(e: OrchestratorError) -> Self {
        Self(e)
    }
}

impl ApiError {
    pub fn status_code(&self) -> StatusCode {
        match &self.0 {
            OrchestratorError::ValidationError(_) | OrchestratorError::JsonError(_) => {
                StatusCode::BAD_REQUEST
            }
            OrchestratorError::NotFound(_) => StatusCode::NOT_FOUND,
            OrchestratorError::InvalidTransition(_) => StatusCode::CONFLICT,
            OrchestratorError::ConnectionError(_)
            | OrchestratorError::ExecutionError { .. }
            | OrchestratorError::PartialFailure { .. }
            | OrchestratorError::MissingCapabilities(_)
            | OrchestratorError::Timeout(_)
            | OrchestratorError::HttpError(_) => StatusCode::BAD_GATEWAY,
            OrchestratorError::IoError(_)
            | OrchestratorError::StorageError(_)
            | OrchestratorError::CryptoError(_)
            | OrchestratorError::ConfigError(_)
            | OrchestratorError::ServerError(_)
            | OrchestratorError::ShutdownError(_)
            | OrchestratorError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn kind(&self) -> &'static str {
        match &self.0 {
            OrchestratorError::IoError(_) => "io",
            OrchestratorError::JsonError(_) => "json",
            OrchestratorError::HttpError(_) => "http",
            OrchestratorError::ConnectionError(_) => "connection",
            OrchestratorError::ValidationError(_) => "validation",
            OrchestratorError::ExecutionError { .. } => "execution",
            OrchestratorError::NotFound(_) => "not_found",
            OrchestratorError::PartialFailure { .. } => "partial_failure",
            OrchestratorError::MissingCapabilities(_) => "missing_capabilities",
            OrchestratorError::InvalidTransition(_) => "invalid_transition",
            OrchestratorError::Timeout(_) => "timeout",
            OrchestratorError::StorageError(_) => "storage",
            OrchestratorError::CryptoError(_) => "crypto",
            OrchestratorError::ConfigError(_) => "config",
            OrchestratorError::ServerError(_) => "server",
            OrchestratorError::ShutdownError(_) => "shutdown",
            OrchestratorError::Internal(_) => "internal",
        }
    }

    fn body(&self) -> ErrorResponse {
        let status = self.status_code();
        // Vault and store internals stay in the server log
        let error = if status == StatusCode::INTERNAL_SERVER_ERROR {
            "Internal server error".to_string()
        } else {
            self.0.to_string()
        };
        let rollback = match &self.0 {
            OrchestratorError::PartialFailure { rollback, .. } => Some(rollback.clone()),
            _ => None,
        };
        ErrorResponse {
            error,
            kind: self.kind().to_string(),
            rollback,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("Request failed: {}", self.0);
        }
        (status, Json(self.body())).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        let cases = [
            (OrchestratorError::ValidationError("x".into()), StatusCode::BAD_REQUEST),
            (OrchestratorError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (OrchestratorError::InvalidTransition("x".into()), StatusCode::CONFLICT),
            (OrchestratorError::Timeout("x".into()), StatusCode::BAD_GATEWAY),
            (OrchestratorError::StorageError("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, expected) in cases {
            assert_eq!(ApiError(error).status_code(), expected);
        }
    }

    #[test]
    fn test_partial_failure_carries_rollback() {
        let error = ApiError(OrchestratorError::PartialFailure {
            cause: "build failed".into(),
            rollback: "restarted previous instance web-1".into(),
        });
        let body = error.body();
        assert_eq!(body.kind, "partial_failure");
        assert_eq!(body.rollback.as_deref(), Some("restarted previous instance web-1"));
    }

    #[test]
    fn test_internal_details_hidden() {
        let body = ApiError(OrchestratorError::CryptoError("bad tag".into())).body();
        assert_eq!(body.error, "Internal server error");
    }
}
