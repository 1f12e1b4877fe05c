//! # Service Error Handling
//!
//! Process-level errors for the response cache service, built with `thiserror`.
//!
//! Two error types exist in this crate:
//! - [`crate::caching::CacheError`] covers everything the cache itself can hit while
//!   serving a request. Those failures are always soft: the controller logs them and
//!   falls back to serving without the cache.
//! - [`ServiceError`] (this module) covers failures around the cache: loading
//!   configuration, wiring up a store, binding the listener. These are the errors
//!   that can legitimately stop the process or surface to an HTTP client.
//!
//! `ServiceError` implements axum's `IntoResponse`, so handlers in the demo server can
//! return `ServiceResult<T>` and let the framework render a JSON error body.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

use crate::caching::CacheError;

/// Result alias used by configuration loading and server wiring.
pub type ServiceResult<T> = Result<T, ServiceError>;

/// Errors raised outside the request-serving hot path
#[derive(Debug, Error, Clone)]
pub enum ServiceError {
    /// Invalid or unreadable configuration
    #[error("Configuration error: {message}")]
    Configuration { message: String },

    /// A cache store could not be constructed or reached
    #[error("Cache error: {message}")]
    Cache { message: String },

    /// I/O errors (config files, listener sockets)
    #[error("I/O error: {message}")]
    Io { message: String },

    /// YAML parsing errors for configuration files
    #[error("YAML error: {message}")]
    Yaml { message: String },

    /// Observability setup failed (subscriber or exporter already installed, bad filter)
    #[error("Observability error: {message}")]
    Observability { message: String },
}

impl ServiceError {
    /// Create a configuration error with a custom message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create an observability setup error
    pub fn observability<S: Into<String>>(message: S) -> Self {
        Self::Observability {
            message: message.into(),
        }
    }

    /// HTTP status code to report for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Cache { .. } => StatusCode::SERVICE_UNAVAILABLE,
            Self::Configuration { .. }
            | Self::Io { .. }
            | Self::Yaml { .. }
            | Self::Observability { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable, machine-readable error type for API responses
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Configuration { .. } => "configuration_error",
            Self::Cache { .. } => "cache_error",
            Self::Io { .. } => "io_error",
            Self::Yaml { .. } => "yaml_error",
            Self::Observability { .. } => "observability_error",
        }
    }
}

impl From<CacheError> for ServiceError {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Configuration { message } => Self::Configuration { message },
            other => Self::Cache {
                message: other.to_string(),
            },
        }
    }
}

impl From<std::io::Error> for ServiceError {
    fn from(err: std::io::Error) -> Self {
        Self::Io {
            message: err.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for ServiceError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Yaml {
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = self.status_code();

        let body = json!({
            "error": {
                "code": status.as_u16(),
                "message": self.to_string(),
                "type": self.error_type(),
            }
        });

        (status, Json(body)).into_response()
    }
}
