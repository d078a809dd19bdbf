//! Error types for the guild gateway

use axum::Json;
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;
use tracing::{error, warn};

/// Result type alias for the guild gateway
pub type Result<T> = std::result::Result<T, Error>;

/// Maximum number of bytes of an upstream response body kept for diagnostics
const UPSTREAM_BODY_LIMIT: usize = 256;

/// Guild gateway errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal, prevents startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed callback parameters or request body
    #[error("Validation error: {0}")]
    Validation(String),

    /// Missing, expired, or unknown session
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Guild not allow-listed, or bot not installed where required
    #[error("Forbidden: {0}")]
    Forbidden(String),

    /// Login entry point rate limit exceeded
    #[error("Rate limit exceeded")]
    RateLimited,

    /// Non-2xx response from the identity provider
    #[error("Upstream error: HTTP {status}")]
    Upstream {
        /// HTTP status returned by the provider
        status: u16,
        /// Truncated response body (logged, never sent to clients)
        body: String,
    },

    /// Shared or in-process store failure
    #[error("Store error: {0}")]
    Store(String),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Build an upstream error, truncating the body for diagnostics
    pub fn upstream(status: u16, body: impl Into<String>) -> Self {
        let mut body = body.into();
        if body.len() > UPSTREAM_BODY_LIMIT {
            let mut end = UPSTREAM_BODY_LIMIT;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            body.truncate(end);
        }
        Self::Upstream { status, body }
    }

    /// HTTP status this error maps to
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Upstream { .. } | Self::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Client-safe message. Upstream bodies and internal detail stay in the logs.
    fn client_message(&self) -> String {
        match self {
            Self::Validation(msg) | Self::Unauthorized(msg) | Self::Forbidden(msg) => msg.clone(),
            Self::RateLimited => "Too many requests, try again later".to_string(),
            Self::Upstream { .. } | Self::Http(_) => "Upstream service error".to_string(),
            _ => "Internal server error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        match &self {
            Error::Upstream { status, body } => {
                warn!(status = *status, body = %body, "Upstream request failed");
            }
            Error::Store(msg) => error!(error = %msg, "Store operation failed"),
            Error::Internal(msg) => error!(error = %msg, "Internal error"),
            Error::Http(e) => warn!(error = %e, "HTTP client error"),
            _ => {}
        }

        let status = self.status_code();
        let mut response = (status, Json(json!({ "error": self.client_message() }))).into_response();
        if matches!(self, Error::RateLimited) {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, header::HeaderValue::from_static("60"));
        }
        response
    }
}
