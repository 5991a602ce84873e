//! Placeholder sockets that keep a local port reserved.

use crate::error::{NetError, Result};
use std::io;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpSocket;

/// A socket bound to a loopback port without listening on it.
///
/// While it is alive no other process can bind the same port, so the port
/// stays available for the tunnel process that later replaces it. Dropping
/// the placeholder releases the port.
#[derive(Debug)]
pub struct Placeholder {
    socket: TcpSocket,
    port: u16,
}

impl Placeholder {
    /// Binds `127.0.0.1:port`. Port `0` asks the OS for an ephemeral port.
    ///
    /// # Errors
    ///
    /// Returns the bind error if the port is already taken.
    pub fn bind(port: u16) -> io::Result<Self> {
        let socket = TcpSocket::new_v4()?;
        socket.bind(SocketAddr::from((Ipv4Addr::LOCALHOST, port)))?;
        let port = socket.local_addr()?.port();
        Ok(Self { socket, port })
    }

    /// Reserves `preferred`, falling back to an OS-assigned port.
    ///
    /// # Errors
    ///
    /// Returns [`NetError::ResourceExhaustion`] if neither bind succeeds.
    pub fn reserve(preferred: u16) -> Result<Self> {
        for candidate in [preferred, 0] {
            match Self::bind(candidate) {
                Ok(placeholder) => return Ok(placeholder),
                Err(e) => tracing::debug!("Port {} is in use, reason: {}", candidate, e),
            }
        }

        Err(NetError::ResourceExhaustion(format!(
            "cannot bind port {preferred} or an ephemeral port on 127.0.0.1"
        )))
    }

    /// Returns the reserved port.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns the bound address.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket address cannot be queried.
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn bind_ephemeral_port() {
        let placeholder = Placeholder::bind(0).unwrap();
        assert_ne!(placeholder.port(), 0);
        assert_eq!(
            placeholder.local_addr().unwrap().ip(),
            std::net::IpAddr::V4(Ipv4Addr::LOCALHOST)
        );
    }

    #[test]
    fn reserve_prefers_requested_port() {
        let free = Placeholder::bind(0).unwrap().port();
        let placeholder = Placeholder::reserve(free).unwrap();
        assert_eq!(placeholder.port(), free);
    }

    #[test]
    fn reserve_falls_back_when_port_taken() {
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let taken_port = taken.local_addr().unwrap().port();

        let placeholder = Placeholder::reserve(taken_port).unwrap();
        assert_ne!(placeholder.port(), taken_port);
        assert_ne!(placeholder.port(), 0);
    }

    #[test]
    fn placeholder_blocks_other_binds_until_dropped() {
        let placeholder = Placeholder::bind(0).unwrap();
        let port = placeholder.port();
        assert!(Placeholder::bind(port).is_err());

        drop(placeholder);
        assert!(Placeholder::bind(port).is_ok());
    }
}
