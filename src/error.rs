//! Error taxonomy for lifecycle operations and JSON error responses for the proxy

use crate::registry::RegistryError;
use crate::runtime::RuntimeError;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the app lifecycle manager to its callers
#[derive(Debug, Error)]
pub enum AppError {
    /// Bad manifest, unsafe id, missing required field
    #[error("{0}")]
    Validation(String),

    /// An app with the same id already exists
    #[error("{0}")]
    Conflict(String),

    /// Unknown app id
    #[error("{0}")]
    NotFound(String),

    /// The operation does not apply to the app in its current state
    #[error("{0}")]
    BadRequest(String),

    /// Neither runtime strategy could reach the container daemon
    #[error("container runtime unavailable: {0}")]
    RuntimeUnavailable(String),

    /// Unexpected failure in a primary lifecycle step
    #[error("{0}")]
    Server(String),
}

impl AppError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            AppError::Validation(_) => StatusCode::BAD_REQUEST,
            AppError::Conflict(_) => StatusCode::CONFLICT,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::RuntimeUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::Server(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable machine-readable code for API clients
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Validation(_) => "VALIDATION_ERROR",
            AppError::Conflict(_) => "CONFLICT",
            AppError::NotFound(_) => "NOT_FOUND",
            AppError::BadRequest(_) => "BAD_REQUEST",
            AppError::RuntimeUnavailable(_) => "RUNTIME_UNAVAILABLE",
            AppError::Server(_) => "SERVER_ERROR",
        }
    }

    pub fn not_found(id: &str) -> Self {
        AppError::NotFound(format!("App not found: {}", id))
    }
}

impl From<RuntimeError> for AppError {
    fn from(err: RuntimeError) -> Self {
        match err {
            RuntimeError::Unavailable(msg) => AppError::RuntimeUnavailable(msg),
            RuntimeError::NotFound(what) => AppError::NotFound(format!("Container not found: {}", what)),
            other => AppError::Server(other.to_string()),
        }
    }
}

impl From<RegistryError> for AppError {
    fn from(err: RegistryError) -> Self {
        AppError::Server(format!("Registry error: {}", err))
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// Path does not name an app under the mount prefix
    InvalidPath,
    /// No app with this id is registered
    UnknownApp,
    /// App exists but is not running
    AppNotRunning,
    /// Request timed out waiting for the container
    RequestTimeout,
    /// Failed to connect to the container
    ConnectionFailed,
    /// Internal proxy error
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::InvalidPath => StatusCode::NOT_FOUND,
            ProxyErrorCode::UnknownApp => StatusCode::NOT_FOUND,
            ProxyErrorCode::AppNotRunning => StatusCode::SERVICE_UNAVAILABLE,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::InvalidPath => "INVALID_PATH",
            ProxyErrorCode::UnknownApp => "UNKNOWN_APP",
            ProxyErrorCode::AppNotRunning => "APP_NOT_RUNNING",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(
    code: ProxyErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers")
}
