//! Error types for port forwarding.

use thiserror::Error;

/// Result type alias for port forwarding operations.
pub type Result<T> = std::result::Result<T, NetError>;

/// Errors that can occur while reserving ports or supervising tunnels.
#[derive(Debug, Error)]
pub enum NetError {
    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Neither the preferred nor an OS-assigned local port could be bound.
    #[error("no local port available: {0}")]
    ResourceExhaustion(String),

    /// The tunnel process could not be started or exited immediately.
    #[error("tunnel error: {0}")]
    Tunnel(String),

    /// The remote listening state could not be determined.
    #[error("probe error: {0}")]
    Probe(String),
}
