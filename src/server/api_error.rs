//! Standardized error responses for the administrative endpoints.
//!
//! # Response Format
//!
//! ```json
//! {
//!   "error": {
//!     "code": "INVALID_REQUEST",
//!     "message": "count: must be between 1 and 1000",
//!     "details": { "field": "count" }
//!   }
//! }
//! ```
//!
//! The verification endpoint does not use this envelope; it always answers
//! with a `VerificationResponse` so clients parse a single shape.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use tracing::error;

use crate::errors::ActivationError;
use crate::server::validation::ValidationError;

/// Machine-readable error codes for API responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    /// Request payload or query is malformed
    InvalidRequest,
    /// `X-API-Key` missing or wrong
    InvalidApiKey,
    /// No admin key configured on this server
    AdminDisabled,
    /// Activation code does not exist in the app
    CodeNotFound,
    /// Device was never bound in the app
    DeviceNotFound,
    /// Store operation failed
    DatabaseError,
    /// Unexpected internal server error
    InternalError,
}

impl ErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ErrorCode::InvalidRequest => StatusCode::BAD_REQUEST,
            ErrorCode::InvalidApiKey => StatusCode::UNAUTHORIZED,
            ErrorCode::CodeNotFound | ErrorCode::DeviceNotFound => StatusCode::NOT_FOUND,
            ErrorCode::AdminDisabled => StatusCode::SERVICE_UNAVAILABLE,
            ErrorCode::DatabaseError | ErrorCode::InternalError => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn default_message(&self) -> &'static str {
        match self {
            ErrorCode::InvalidRequest => "Request payload is invalid",
            ErrorCode::InvalidApiKey => "API key is missing or invalid",
            ErrorCode::AdminDisabled => "Administrative API is not configured on this server",
            ErrorCode::CodeNotFound => "Activation code not found",
            ErrorCode::DeviceNotFound => "Device not found",
            ErrorCode::DatabaseError => "Database operation failed",
            ErrorCode::InternalError => "An unexpected error occurred",
        }
    }
}

/// The inner error object.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

/// Standardized API error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ErrorBody,
}

impl ApiError {
    /// Error with the code's default message.
    pub fn new(code: ErrorCode) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: code.default_message().to_string(),
                details: None,
            },
        }
    }

    pub fn with_message(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(
        code: ErrorCode,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ErrorBody {
                code,
                message: message.into(),
                details: Some(details),
            },
        }
    }

    pub fn status_code(&self) -> StatusCode {
        self.error.code.status_code()
    }

    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::with_message(ErrorCode::InvalidRequest, message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        (status, Json(self)).into_response()
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{}: {}",
            self.error.code.default_message(),
            self.error.message
        )
    }
}

impl std::error::Error for ApiError {}

impl From<ValidationError> for ApiError {
    fn from(err: ValidationError) -> Self {
        ApiError::with_details(
            ErrorCode::InvalidRequest,
            err.to_string(),
            serde_json::json!({ "field": err.field }),
        )
    }
}

/// Storage text never reaches the client.
impl From<ActivationError> for ApiError {
    fn from(err: ActivationError) -> Self {
        match err {
            ActivationError::Validation(msg) => ApiError::invalid_request(msg),
            ActivationError::Storage(_) | ActivationError::Conflict(_) => {
                error!("Store failure in admin request: {err}");
                ApiError::new(ErrorCode::DatabaseError)
            }
            other => {
                error!("Internal failure in admin request: {other}");
                ApiError::new(ErrorCode::InternalError)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_code_status_mapping() {
        assert_eq!(
            ErrorCode::InvalidRequest.status_code(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ErrorCode::InvalidApiKey.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            ErrorCode::AdminDisabled.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(ErrorCode::CodeNotFound.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn api_error_serialization() {
        let json = serde_json::to_string(&ApiError::new(ErrorCode::InvalidApiKey)).unwrap();
        assert!(json.contains("INVALID_API_KEY"));
        assert!(!json.contains("details"));
    }

    #[test]
    fn storage_errors_are_masked() {
        let api_err: ApiError =
            ActivationError::Storage("relation activation_keys does not exist".to_string()).into();
        assert_eq!(api_err.error.code, ErrorCode::DatabaseError);
        assert!(!api_err.error.message.contains("activation_keys"));
    }

    #[test]
    fn validation_error_conversion_keeps_field() {
        let api_err: ApiError = ValidationError {
            field: "count".to_string(),
            message: "must be between 1 and 1000".to_string(),
        }
        .into();
        assert_eq!(api_err.error.code, ErrorCode::InvalidRequest);
        assert_eq!(api_err.error.details.unwrap()["field"], "count");
    }
}
