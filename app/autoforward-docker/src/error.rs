//! Error types for the proxy.

use autoforward_net::NetError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::io;
use thiserror::Error;

/// Result type alias for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Errors that can occur while proxying the engine API.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Malformed upgrade frame or no response handler matched.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Remote refused, timed out or reset the connection.
    #[error("connectivity error: {0}")]
    Connectivity(#[from] io::Error),

    /// No local port could be bound.
    #[error("resource exhaustion: {0}")]
    ResourceExhaustion(String),

    /// The request asks for something the proxy does not support.
    #[error("unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// A frame declared more payload than the remote delivered.
    #[error("framing error: expected {expected} bytes but received {received}")]
    Framing {
        /// Declared byte count.
        expected: u64,
        /// Bytes actually received before the remote closed.
        received: u64,
    },

    /// Port forwarding failure.
    #[error("forwarding error: {0}")]
    Forward(String),

    /// Invalid JSON payload.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),

    /// TLS setup failure.
    #[error("TLS error: {0}")]
    Tls(String),
}

impl ProxyError {
    /// Wraps any transport-level failure as a connectivity error.
    pub fn connectivity(err: impl std::fmt::Display) -> Self {
        Self::Connectivity(io::Error::other(err.to_string()))
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub const fn status_code(&self) -> StatusCode {
        match self {
            Self::Connectivity(_) => StatusCode::BAD_GATEWAY,
            Self::UnsupportedOperation(_) => StatusCode::NOT_IMPLEMENTED,
            Self::Protocol(_)
            | Self::ResourceExhaustion(_)
            | Self::Framing { .. }
            | Self::Forward(_)
            | Self::Json(_)
            | Self::Config(_)
            | Self::Tls(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Connection refused, reset or timed out.
    #[must_use]
    pub fn is_disconnect(&self) -> bool {
        matches!(
            self,
            Self::Connectivity(e) if matches!(
                e.kind(),
                io::ErrorKind::ConnectionRefused
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
                    | io::ErrorKind::BrokenPipe
                    | io::ErrorKind::TimedOut
                    | io::ErrorKind::UnexpectedEof
            )
        )
    }
}

impl From<NetError> for ProxyError {
    fn from(err: NetError) -> Self {
        match err {
            NetError::ResourceExhaustion(msg) => Self::ResourceExhaustion(msg),
            other => Self::Forward(other.to_string()),
        }
    }
}

/// Engine-style error body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error message.
    pub message: String,
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            message: self.to_string(),
        };

        (status, axum::Json(body)).into_response()
    }
}
