//! Errors surfaced to clients while handling a single request.
//!
//! None of these ever terminate a listener; each one becomes a small JSON
//! response on the connection that produced it.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Message sent with every gateway failure. Upstream details stay in the logs.
pub const BAD_GATEWAY_MESSAGE: &str = "Failed to connect to upstream server";

/// Error produced while forwarding a request or opening a tunnel.
#[derive(Debug)]
pub enum ProxyError {
    /// The upstream could not be reached or the exchange failed midway.
    UpstreamUnavailable(String),
    /// The upstream did not answer within the request deadline.
    UpstreamTimeout,
    /// The proxy itself failed to build or relay something.
    Internal(String),
}

impl std::fmt::Display for ProxyError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UpstreamUnavailable(reason) => write!(f, "upstream unavailable: {reason}"),
            Self::UpstreamTimeout => write!(f, "upstream timed out"),
            Self::Internal(reason) => write!(f, "internal error: {reason}"),
        }
    }
}

impl std::error::Error for ProxyError {}

impl ProxyError {
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::UpstreamUnavailable(_) | Self::UpstreamTimeout => StatusCode::BAD_GATEWAY,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = match self {
            Self::UpstreamUnavailable(_) | Self::UpstreamTimeout => json!({
                "error": "Bad Gateway",
                "message": BAD_GATEWAY_MESSAGE,
            }),
            Self::Internal(_) => json!({ "error": "Internal Server Error" }),
        };
        (status, Json(body)).into_response()
    }
}
