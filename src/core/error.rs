//! Typed error handling for the chassis
//!
//! Every failure surfaced by the framework is a [`ChassisError`]. Each category
//! maps to an HTTP status and renders the wire envelope:
//!
//! ```json
//! { "_type": "ErrorMessage", "code": 404, "message": "...", "upstream_service": "..." }
//! ```
//!
//! # Error Categories
//!
//! - [`ValidationError`]: missing required fields and validator failures
//! - [`RepositoryError`]: not found, unique-index conflicts, schema rejection, stale versions
//! - [`AuthError`]: missing, malformed, expired or insufficient credentials
//! - [`RequestError`]: malformed parameters and bodies
//! - [`UpstreamError`]: failures of a downstream service called through the proxy
//! - [`ConfigError`]: configuration and key loading

use crate::core::validation::ValidationFailure;
use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::fmt;

/// The main error type of the chassis
#[derive(Debug)]
pub enum ChassisError {
    /// Model validation errors
    Validation(ValidationError),

    /// Persistence errors
    Repository(RepositoryError),

    /// Authentication and authorization errors
    Auth(AuthError),

    /// HTTP request errors
    Request(RequestError),

    /// Errors of a called upstream service
    Upstream(UpstreamError),

    /// Configuration errors
    Config(ConfigError),

    /// Anything else
    Internal(String),
}

impl fmt::Display for ChassisError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChassisError::Validation(e) => write!(f, "{}", e),
            ChassisError::Repository(e) => write!(f, "{}", e),
            ChassisError::Auth(e) => write!(f, "{}", e),
            ChassisError::Request(e) => write!(f, "{}", e),
            ChassisError::Upstream(e) => write!(f, "{}", e),
            ChassisError::Config(e) => write!(f, "{}", e),
            ChassisError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for ChassisError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ChassisError::Validation(e) => Some(e),
            ChassisError::Repository(e) => Some(e),
            ChassisError::Auth(e) => Some(e),
            ChassisError::Request(e) => Some(e),
            ChassisError::Upstream(e) => Some(e),
            ChassisError::Config(e) => Some(e),
            ChassisError::Internal(_) => None,
        }
    }
}

/// Error envelope written on the wire
#[derive(Debug, Serialize)]
pub struct ErrorMessage {
    #[serde(rename = "_type")]
    pub type_name: &'static str,
    pub code: u16,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub upstream_service: Option<String>,
}

impl ChassisError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ChassisError::Validation(_) => StatusCode::BAD_REQUEST,
            ChassisError::Repository(e) => e.status_code(),
            ChassisError::Auth(e) => e.status_code(),
            ChassisError::Request(e) => e.status_code(),
            ChassisError::Upstream(e) => e.status_code(),
            ChassisError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ChassisError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the machine-readable error code
    pub fn error_code(&self) -> &'static str {
        match self {
            ChassisError::Validation(e) => e.error_code(),
            ChassisError::Repository(e) => e.error_code(),
            ChassisError::Auth(e) => e.error_code(),
            ChassisError::Request(e) => e.error_code(),
            ChassisError::Upstream(_) => "UPSTREAM_FAILURE",
            ChassisError::Config(_) => "CONFIG_ERROR",
            ChassisError::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Convert to the wire envelope
    pub fn to_message(&self) -> ErrorMessage {
        let upstream_service = match self {
            ChassisError::Upstream(e) => Some(e.service.clone()),
            _ => None,
        };
        ErrorMessage {
            type_name: "ErrorMessage",
            code: self.status_code().as_u16(),
            message: self.to_string(),
            upstream_service,
        }
    }

    /// Shorthand for an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        ChassisError::Internal(message.into())
    }

    /// The i18n message key carried by validator failures
    pub fn message_key(&self) -> Option<&str> {
        match self {
            ChassisError::Validation(ValidationError::Failure(failure)) => {
                Some(&failure.message_key)
            }
            _ => None,
        }
    }
}

impl IntoResponse for ChassisError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::error!(code = self.error_code(), "{}", self);
        } else {
            tracing::debug!(code = self.error_code(), "{}", self);
        }
        (status, Json(self.to_message())).into_response()
    }
}

// =============================================================================
// Validation Errors
// =============================================================================

/// Errors raised while finalising and validating a model
#[derive(Debug, thiserror::Error)]
pub enum ValidationError {
    /// A required field is absent or null
    #[error("The field '{field}' is required")]
    MissingRequiredField { field: String },

    /// A validator primitive rejected a value
    #[error("{0}")]
    Failure(ValidationFailure),

    /// A value has the wrong shape for its declared kind
    #[error("Invalid value for field '{field}': {message}")]
    InvalidValue { field: String, message: String },

    /// The payload is not valid JSON or not an object
    #[error("Invalid JSON: {message}")]
    InvalidJson { message: String },
}

impl ValidationError {
    pub fn error_code(&self) -> &'static str {
        match self {
            ValidationError::MissingRequiredField { .. } => "MISSING_REQUIRED_FIELD",
            ValidationError::Failure(_) => "VALIDATION_FAILURE",
            ValidationError::InvalidValue { .. } => "INVALID_VALUE",
            ValidationError::InvalidJson { .. } => "INVALID_JSON",
        }
    }
}

impl From<ValidationError> for ChassisError {
    fn from(err: ValidationError) -> Self {
        ChassisError::Validation(err)
    }
}

impl From<ValidationFailure> for ChassisError {
    fn from(failure: ValidationFailure) -> Self {
        ChassisError::Validation(ValidationError::Failure(failure))
    }
}

// =============================================================================
// Repository Errors
// =============================================================================

/// Errors produced by the repository and the document store
#[derive(Debug, thiserror::Error)]
pub enum RepositoryError {
    /// No document matched
    #[error("No document with id '{id}' found in '{collection}'")]
    NotFound { collection: String, id: String },

    /// A unique index rejected the write
    #[error("Unique constraint violated on '{collection}': {message}")]
    Conflict { collection: String, message: String },

    /// The collection schema validator rejected the document
    #[error("Document rejected by the schema of '{collection}': {message}")]
    Invalid { collection: String, message: String },

    /// The caller's version does not match the stored one
    #[error("Document '{id}' in '{collection}' was modified concurrently (expected version {expected})")]
    Stale {
        collection: String,
        id: String,
        expected: i64,
    },

    /// Driver level failure
    #[error("Store error: {message}")]
    Store { message: String },
}

impl RepositoryError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RepositoryError::NotFound { .. } => StatusCode::NOT_FOUND,
            RepositoryError::Conflict { .. } => StatusCode::CONFLICT,
            RepositoryError::Invalid { .. } => StatusCode::BAD_REQUEST,
            RepositoryError::Stale { .. } => StatusCode::CONFLICT,
            RepositoryError::Store { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            RepositoryError::NotFound { .. } => "NOT_FOUND",
            RepositoryError::Conflict { .. } => "CONFLICT",
            RepositoryError::Invalid { .. } => "INVALID_DOCUMENT",
            RepositoryError::Stale { .. } => "STALE_VERSION",
            RepositoryError::Store { .. } => "STORE_ERROR",
        }
    }
}

impl From<RepositoryError> for ChassisError {
    fn from(err: RepositoryError) -> Self {
        ChassisError::Repository(err)
    }
}

// =============================================================================
// Auth Errors
// =============================================================================

/// Authentication and authorization failures
#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    /// No credentials were presented
    #[error("Unauthorized: {message}")]
    Unauthorized { message: String },

    /// Credentials were presented but rejected
    #[error("Forbidden: {message}")]
    Forbidden { message: String },
}

impl AuthError {
    pub fn unauthorized(message: impl Into<String>) -> Self {
        AuthError::Unauthorized {
            message: message.into(),
        }
    }

    pub fn forbidden(message: impl Into<String>) -> Self {
        AuthError::Forbidden {
            message: message.into(),
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::Unauthorized { .. } => StatusCode::UNAUTHORIZED,
            AuthError::Forbidden { .. } => StatusCode::FORBIDDEN,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::Unauthorized { .. } => "UNAUTHORIZED",
            AuthError::Forbidden { .. } => "FORBIDDEN",
        }
    }
}

impl From<AuthError> for ChassisError {
    fn from(err: AuthError) -> Self {
        ChassisError::Auth(err)
    }
}

// =============================================================================
// Request Errors
// =============================================================================

/// Errors related to the shape of an HTTP request
#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    /// A parameter could not be coerced to its declared kind
    #[error("Invalid parameter '{name}': {message}")]
    InvalidParameter { name: String, message: String },

    /// A required handler argument is missing
    #[error("Missing required argument: {name}")]
    MissingParameter { name: String },

    /// The request body could not be decoded
    #[error("Invalid request body: {message}")]
    InvalidBody { message: String },

    /// The method is not served by the endpoint
    #[error("Method {method} not allowed on {path}")]
    MethodNotAllowed { method: String, path: String },
}

impl RequestError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RequestError::InvalidParameter { .. } => StatusCode::BAD_REQUEST,
            RequestError::MissingParameter { .. } => StatusCode::BAD_REQUEST,
            RequestError::InvalidBody { .. } => StatusCode::BAD_REQUEST,
            RequestError::MethodNotAllowed { .. } => StatusCode::METHOD_NOT_ALLOWED,
        }
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            RequestError::InvalidParameter { .. } => "INVALID_PARAMETER",
            RequestError::MissingParameter { .. } => "MISSING_PARAMETER",
            RequestError::InvalidBody { .. } => "INVALID_BODY",
            RequestError::MethodNotAllowed { .. } => "METHOD_NOT_ALLOWED",
        }
    }
}

impl From<RequestError> for ChassisError {
    fn from(err: RequestError) -> Self {
        ChassisError::Request(err)
    }
}

// =============================================================================
// Upstream Errors
// =============================================================================

/// Failure of a downstream service reached through [`crate::client::ServiceProxy`]
#[derive(Debug, thiserror::Error)]
#[error("Upstream service '{service}' failed: {message}")]
pub struct UpstreamError {
    /// The service that originated the failure; preserved across hops
    pub service: String,
    /// Status reported by the upstream, if it answered at all
    pub status: Option<u16>,
    pub message: String,
}

impl UpstreamError {
    /// Upstream statuses pass through; timeouts and connection errors become 502/504
    pub fn status_code(&self) -> StatusCode {
        match self.status {
            Some(code) => StatusCode::from_u16(code).unwrap_or(StatusCode::BAD_GATEWAY),
            None if self.message.contains("timed out") => StatusCode::GATEWAY_TIMEOUT,
            None => StatusCode::BAD_GATEWAY,
        }
    }
}

impl From<UpstreamError> for ChassisError {
    fn from(err: UpstreamError) -> Self {
        ChassisError::Upstream(err)
    }
}

// =============================================================================
// Config Errors
// =============================================================================

/// Errors related to configuration and key material
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to parse configuration
    #[error("Failed to parse config{}: {message}", .file.as_ref().map(|f| format!(" file '{}'", f)).unwrap_or_default())]
    ParseError {
        file: Option<String>,
        message: String,
    },

    /// A key file could not be read or decoded
    #[error("Invalid key material '{path}': {message}")]
    InvalidKey { path: String, message: String },

    /// A model or service was registered inconsistently
    #[error("Invalid registration of '{model}': {message}")]
    Registration { model: String, message: String },
}

impl From<ConfigError> for ChassisError {
    fn from(err: ConfigError) -> Self {
        ChassisError::Config(err)
    }
}

// =============================================================================
// Conversions from external errors
// =============================================================================

impl From<serde_json::Error> for ChassisError {
    fn from(err: serde_json::Error) -> Self {
        ChassisError::Validation(ValidationError::InvalidJson {
            message: err.to_string(),
        })
    }
}

impl From<serde_yaml::Error> for ChassisError {
    fn from(err: serde_yaml::Error) -> Self {
        ChassisError::Config(ConfigError::ParseError {
            file: None,
            message: err.to_string(),
        })
    }
}

/// Store drivers report through `anyhow`; typed repository errors survive the trip
impl From<anyhow::Error> for ChassisError {
    fn from(err: anyhow::Error) -> Self {
        match err.downcast::<RepositoryError>() {
            Ok(repo) => ChassisError::Repository(repo),
            Err(err) => match err.downcast::<ChassisError>() {
                Ok(chassis) => chassis,
                Err(err) => ChassisError::Repository(RepositoryError::Store {
                    message: err.to_string(),
                }),
            },
        }
    }
}

// =============================================================================
// Result type alias
// =============================================================================

/// A specialized Result type for chassis operations
pub type ChassisResult<T> = Result<T, ChassisError>;
