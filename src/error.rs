//! # Error Handling
//!
//! Custom error types and their conversion to HTTP responses.
//!
//! Admission failures (`MissingToken`, `SessionLimit`) are rejected before
//! the WebSocket upgrade, so clients see a plain HTTP status instead of a
//! half-open socket.
//!
//! ## JSON Response Format:
//! All errors return JSON with a consistent structure:
//! ```json
//! {
//!   "error": {
//!     "type": "too_many_sessions",
//!     "message": "too many active sessions (3 of 3)",
//!     "timestamp": "2025-01-01T12:00:00Z"
//!   }
//! }
//! ```

use actix_web::{HttpResponse, ResponseError};
use serde_json::json;
use std::fmt;

/// Custom error types for the application.
#[derive(Debug)]
pub enum AppError {
    /// Connection attempt without a bearer token.
    MissingToken,

    /// User already holds the maximum number of concurrent sessions.
    SessionLimit(String),

    /// Client sent invalid or malformed data.
    BadRequest(String),

    /// Configuration file or environment variable problems.
    ConfigError(String),

    /// Internal server errors.
    Internal(String),
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::MissingToken => write!(f, "Missing authentication token"),
            AppError::SessionLimit(msg) => write!(f, "Session limit reached: {}", msg),
            AppError::BadRequest(msg) => write!(f, "Bad request: {}", msg),
            AppError::ConfigError(msg) => write!(f, "Configuration error: {}", msg),
            AppError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

/// HTTP status mapping:
/// - MissingToken → 401 (Unauthorized)
/// - SessionLimit → 429 (Too Many Requests)
/// - BadRequest → 400 (Bad Request)
/// - ConfigError / Internal → 500 (Internal Server Error)
impl ResponseError for AppError {
    fn error_response(&self) -> HttpResponse {
        let (status, error_type, message) = match self {
            AppError::MissingToken => (
                actix_web::http::StatusCode::UNAUTHORIZED,
                "missing_token",
                "A token query parameter is required".to_string(),
            ),
            AppError::SessionLimit(msg) => (
                actix_web::http::StatusCode::TOO_MANY_REQUESTS,
                "too_many_sessions",
                msg.clone(),
            ),
            AppError::BadRequest(msg) => (
                actix_web::http::StatusCode::BAD_REQUEST,
                "bad_request",
                msg.clone(),
            ),
            AppError::ConfigError(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "config_error",
                msg.clone(),
            ),
            AppError::Internal(msg) => (
                actix_web::http::StatusCode::INTERNAL_SERVER_ERROR,
                "internal_error",
                msg.clone(),
            ),
        };

        HttpResponse::build(status).json(json!({
            "error": {
                "type": error_type,
                "message": message,
                "timestamp": chrono::Utc::now().to_rfc3339()
            }
        }))
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::BadRequest(format!("JSON parsing error: {}", err))
    }
}

impl From<config::ConfigError> for AppError {
    fn from(err: config::ConfigError) -> Self {
        AppError::ConfigError(err.to_string())
    }
}

impl From<crate::voice::AdmissionDenied> for AppError {
    fn from(err: crate::voice::AdmissionDenied) -> Self {
        AppError::SessionLimit(err.to_string())
    }
}

/// Shorthand for `Result<T, AppError>`.
pub type AppResult<T> = Result<T, AppError>;
