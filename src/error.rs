//! Gateway error taxonomy and its HTTP rendering.

use axum::{
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;

/// Errors surfaced by gateway handlers and components.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    /// Missing, expired, or invalid credentials
    #[error("Authentication required")]
    Unauthorized,

    /// Too many attempts from one client address
    #[error("Too many requests. Try again later.")]
    RateLimited {
        /// Seconds until the client may retry
        retry_after_secs: u64,
    },

    /// Malformed payload or a reference to something that does not exist on disk
    #[error("{message}")]
    Validation {
        /// Machine-readable reason
        code: &'static str,
        /// Human-readable message
        message: String,
    },

    /// Unknown session, folder, tool, or route
    #[error("{0}")]
    NotFound(String),

    /// No free port left in a backend range
    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Backend could not be reached
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),

    /// Request body over the configured cap
    #[error("Request body too large")]
    BodyTooLarge,

    /// Filesystem or socket failure
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Anything else
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result alias used across the crate.
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    pub fn validation(code: &'static str, message: impl Into<String>) -> Self {
        Self::Validation {
            code,
            message: message.into(),
        }
    }

    pub fn status(&self) -> StatusCode {
        match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            Self::Validation { .. } => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::UpstreamUnavailable(_) => StatusCode::BAD_GATEWAY,
            Self::BodyTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ResourceExhausted(_) | Self::Io(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn code(&self) -> &'static str {
        match self {
            Self::Unauthorized => "UNAUTHORIZED",
            Self::RateLimited { .. } => "RATE_LIMITED",
            Self::Validation { code, .. } => code,
            Self::NotFound(_) => "NOT_FOUND",
            Self::ResourceExhausted(_) => "RESOURCE_EXHAUSTED",
            Self::UpstreamUnavailable(_) => "UPSTREAM_UNAVAILABLE",
            Self::BodyTooLarge => "BODY_TOO_LARGE",
            Self::Io(_) | Self::Internal(_) => "INTERNAL_ERROR",
        }
    }

    /// Message safe to hand to a client. Server-side failures are logged, not echoed.
    fn public_message(&self) -> String {
        match self {
            Self::ResourceExhausted(_) | Self::Io(_) | Self::Internal(_) => {
                "Internal server error".to_string()
            }
            Self::UpstreamUnavailable(_) => "Backend unavailable".to_string(),
            other => other.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
    code: &'static str,
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() || status == StatusCode::BAD_GATEWAY {
            error!(error = %self, "request failed");
        }
        let body = Json(ErrorBody {
            error: self.public_message(),
            code: self.code(),
        });
        match self {
            Self::RateLimited { retry_after_secs } => (
                status,
                [(header::RETRY_AFTER, retry_after_secs.to_string())],
                body,
            )
                .into_response(),
            _ => (status, body).into_response(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_mapping() {
        assert_eq!(GatewayError::Unauthorized.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(
            GatewayError::RateLimited { retry_after_secs: 1 }.status(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            GatewayError::validation("INVALID_FOLDER", "nope").status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            GatewayError::ResourceExhausted("ports".into()).status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            GatewayError::UpstreamUnavailable("dial".into()).status(),
            StatusCode::BAD_GATEWAY
        );
        assert_eq!(GatewayError::BodyTooLarge.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }

    #[test]
    fn test_rate_limited_sets_retry_after() {
        let resp = GatewayError::RateLimited { retry_after_secs: 60 }.into_response();
        assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(resp.headers().get(header::RETRY_AFTER).unwrap(), "60");
    }

    #[test]
    fn test_internal_details_not_exposed() {
        let err = GatewayError::ResourceExhausted("no free port in 7681-7780".into());
        assert_eq!(err.public_message(), "Internal server error");
        assert_eq!(err.code(), "RESOURCE_EXHAUSTED");
    }
}
