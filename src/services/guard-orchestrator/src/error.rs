//! Error handling for the guard orchestrator
//!
//! Provides the orchestrator error taxonomy and its HTTP response mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::error;

use crate::models::DispatchErrorKind;

pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Main error type for the orchestrator
#[derive(Error, Debug)]
pub enum OrchestratorError {
    #[error("Invalid service configuration: {field}: {message}")]
    InvalidConfig { field: String, message: String },

    #[error("Invalid service type: {value}")]
    InvalidServiceType { value: String },

    #[error("No service available for type: {service_type}")]
    ServiceUnavailable { service_type: String },

    #[error("Circuit breaker open for service: {service}")]
    CircuitOpen { service: String },

    #[error("Service not found: {name}")]
    NotFound { name: String },

    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Internal error: {message}")]
    Internal { message: String },
}

/// Failure of a single dispatch attempt against one candidate
#[derive(Error, Debug, Clone, PartialEq)]
pub enum DispatchError {
    #[error("request timed out after {}ms", .0.as_millis())]
    Timeout(Duration),

    #[error("connection failed: {0}")]
    Connection(String),

    #[error("service returned status {status}: {body}")]
    Status { status: u16, body: String },

    #[error("service reported failure: {0}")]
    ServiceReported(String),

    #[error("invalid response body: {0}")]
    InvalidResponse(String),

    #[error("circuit breaker open")]
    CircuitOpen,
}

impl DispatchError {
    /// Classify this failure for reporting and HTTP mapping
    pub fn kind(&self) -> DispatchErrorKind {
        match self {
            DispatchError::Timeout(_) => DispatchErrorKind::Timeout,
            DispatchError::Connection(_) => DispatchErrorKind::Connection,
            DispatchError::Status { .. } => DispatchErrorKind::Status,
            DispatchError::ServiceReported(_) => DispatchErrorKind::ServiceReported,
            DispatchError::InvalidResponse(_) => DispatchErrorKind::InvalidResponse,
            DispatchError::CircuitOpen => DispatchErrorKind::CircuitOpen,
        }
    }
}

impl From<reqwest::Error> for DispatchError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            DispatchError::InvalidResponse(err.to_string())
        } else {
            DispatchError::Connection(err.to_string())
        }
    }
}

/// Standardized error response structure
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
    pub request_id: Option<String>,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl OrchestratorError {
    /// Create a new invalid configuration error
    pub fn invalid_config(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create a new invalid service type error
    pub fn invalid_service_type(value: impl Into<String>) -> Self {
        Self::InvalidServiceType {
            value: value.into(),
        }
    }

    /// Create a new service unavailable error
    pub fn service_unavailable(service_type: impl Into<String>) -> Self {
        Self::ServiceUnavailable {
            service_type: service_type.into(),
        }
    }

    /// Create a new circuit open error
    pub fn circuit_open(service: impl Into<String>) -> Self {
        Self::CircuitOpen {
            service: service.into(),
        }
    }

    /// Create a new not found error
    pub fn not_found(name: impl Into<String>) -> Self {
        Self::NotFound { name: name.into() }
    }

    /// Create configuration error
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create a new internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            OrchestratorError::InvalidConfig { .. } => StatusCode::BAD_REQUEST,
            OrchestratorError::InvalidServiceType { .. } => StatusCode::BAD_REQUEST,
            OrchestratorError::NotFound { .. } => StatusCode::NOT_FOUND,
            OrchestratorError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::CircuitOpen { .. } => StatusCode::SERVICE_UNAVAILABLE,
            OrchestratorError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            OrchestratorError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error type string for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            OrchestratorError::InvalidConfig { .. } => "invalid_config_error",
            OrchestratorError::InvalidServiceType { .. } => "invalid_service_type_error",
            OrchestratorError::NotFound { .. } => "not_found_error",
            OrchestratorError::ServiceUnavailable { .. } => "service_unavailable_error",
            OrchestratorError::CircuitOpen { .. } => "circuit_breaker_error",
            OrchestratorError::Configuration(_) => "configuration_error",
            OrchestratorError::Internal { .. } => "internal_error",
        }
    }

    /// Check if this error should be logged
    pub fn should_log(&self) -> bool {
        match self {
            // Client errors
            OrchestratorError::InvalidConfig { .. }
            | OrchestratorError::InvalidServiceType { .. }
            | OrchestratorError::NotFound { .. } => false,

            _ => true,
        }
    }
}

impl DispatchErrorKind {
    /// HTTP status for a request whose final attempt failed with this kind
    pub fn status_code(&self) -> StatusCode {
        if self.is_unavailability() {
            StatusCode::SERVICE_UNAVAILABLE
        } else {
            StatusCode::BAD_GATEWAY
        }
    }
}

impl IntoResponse for OrchestratorError {
    fn into_response(self) -> Response {
        let status_code = self.status_code();
        let error_type = self.error_type();
        let message = self.to_string();

        if self.should_log() {
            error!(
                error = %self,
                status_code = %status_code,
                error_type = error_type,
                "Orchestrator error occurred"
            );
        }

        let error_response = ErrorResponse {
            error: error_type.to_string(),
            message,
            request_id: None,
            timestamp: chrono::Utc::now(),
        };

        (status_code, Json(error_response)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_codes() {
        assert_eq!(
            OrchestratorError::invalid_config("name", "bad").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OrchestratorError::invalid_service_type("nope").status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            OrchestratorError::not_found("svc-a").status_code(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            OrchestratorError::service_unavailable("token").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            OrchestratorError::circuit_open("svc-a").status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_dispatch_failure_status_codes() {
        let status = DispatchError::Status {
            status: 500,
            body: String::new(),
        };
        assert_eq!(status.kind().status_code(), StatusCode::BAD_GATEWAY);
        assert_eq!(
            DispatchError::Connection("refused".into()).kind().status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            DispatchError::InvalidResponse("eof".into()).kind().status_code(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(
            DispatchError::Timeout(Duration::from_secs(1)).kind().status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn test_dispatch_error_kinds() {
        assert_eq!(
            DispatchError::Timeout(Duration::from_millis(10)).kind(),
            DispatchErrorKind::Timeout
        );
        assert_eq!(
            DispatchError::ServiceReported("bias model offline".into()).kind(),
            DispatchErrorKind::ServiceReported
        );
        assert_eq!(DispatchError::CircuitOpen.kind(), DispatchErrorKind::CircuitOpen);
        assert_eq!(
            DispatchError::Timeout(Duration::from_millis(250)).to_string(),
            "request timed out after 250ms"
        );
    }

    #[test]
    fn test_should_log() {
        assert!(!OrchestratorError::invalid_config("name", "bad").should_log());
        assert!(!OrchestratorError::not_found("svc").should_log());
        assert!(OrchestratorError::service_unavailable("token").should_log());
        assert!(OrchestratorError::internal("boom").should_log());
    }
}
