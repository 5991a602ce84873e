//! Connections to the remote engine API.
//!
//! The remote is reached over TCP (optionally mutually authenticated TLS) or
//! a UNIX domain socket. Every request opens its own connection.

use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::tls;
use axum::body::Body;
use axum::http::{Request, Response, Uri};
use hyper::body::Incoming;
use hyper::client::conn::http1;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use std::future::Future;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpStream, UnixStream};
use tokio_rustls::TlsConnector;
use url::{Host, Url};

/// Default plain-text engine port.
pub const DEFAULT_PORT: u16 = 2375;

/// Default TLS engine port.
pub const DEFAULT_TLS_PORT: u16 = 2376;

/// Byte stream to the remote engine.
pub trait RemoteIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> RemoteIo for T {}

/// Boxed connection to the remote engine.
pub type RemoteStream = Box<dyn RemoteIo>;

/// Where the remote engine listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteEndpoint {
    /// `tcp://`, `http://` or `https://` endpoint.
    Tcp {
        /// Host name or IP address.
        host: String,
        /// TCP port.
        port: u16,
    },
    /// `unix://` socket path.
    Unix {
        /// Socket path.
        path: PathBuf,
    },
}

impl RemoteEndpoint {
    /// Parses a remote URL such as `tcp://10.0.0.5:2375` or
    /// `unix:///var/run/docker.sock`.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] for unsupported schemes or missing hosts.
    pub fn parse(remote: &str) -> Result<Self> {
        let url = Url::parse(remote)
            .map_err(|e| ProxyError::Config(format!("invalid remote {remote:?}: {e}")))?;

        match url.scheme() {
            "unix" => Ok(Self::Unix {
                path: PathBuf::from(url.path()),
            }),
            scheme @ ("tcp" | "http" | "https") => {
                let host = match url.host() {
                    Some(Host::Domain(domain)) => domain.to_string(),
                    Some(Host::Ipv4(addr)) => addr.to_string(),
                    Some(Host::Ipv6(addr)) => addr.to_string(),
                    None => {
                        return Err(ProxyError::Config(format!(
                            "remote {remote:?} has no host"
                        )))
                    }
                };
                let default_port = if scheme == "https" {
                    DEFAULT_TLS_PORT
                } else {
                    DEFAULT_PORT
                };
                Ok(Self::Tcp {
                    host,
                    port: url.port().unwrap_or(default_port),
                })
            }
            other => Err(ProxyError::Config(format!(
                "unsupported remote scheme {other:?}"
            ))),
        }
    }

    /// Value for the `Host` header of forwarded requests.
    #[must_use]
    pub fn host_header(&self) -> String {
        match self {
            Self::Tcp { host, port } if host.contains(':') => format!("[{host}]:{port}"),
            Self::Tcp { host, port } => format!("{host}:{port}"),
            Self::Unix { .. } => "localhost".to_string(),
        }
    }
}

/// Opens connections to the remote engine.
#[derive(Clone)]
pub struct RemoteConnector {
    endpoint: RemoteEndpoint,
    tls: Option<TlsConnector>,
    connect_timeout: Duration,
}

impl RemoteConnector {
    /// Creates a connector. `tls` enables TLS for TCP endpoints.
    #[must_use]
    pub fn new(
        endpoint: RemoteEndpoint,
        tls: Option<Arc<rustls::ClientConfig>>,
        connect_timeout: Duration,
    ) -> Self {
        Self {
            endpoint,
            tls: tls.map(TlsConnector::from),
            connect_timeout,
        }
    }

    /// Builds the connector described by the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote is missing or invalid, or the TLS
    /// material cannot be loaded.
    pub fn from_config(config: &ProxyConfig) -> Result<Self> {
        let remote = config
            .remote
            .as_deref()
            .ok_or_else(|| ProxyError::Config("remote is required".to_string()))?;
        let endpoint = RemoteEndpoint::parse(remote)?;

        let tls = if config.secure {
            match (&config.remote_ca, &config.remote_cert, &config.remote_key) {
                (Some(ca), Some(cert), Some(key)) => Some(tls::client_config(ca, cert, key)?),
                _ => {
                    return Err(ProxyError::Config(
                        "secure mode needs --remote-ca, --remote-cert and --remote-key".to_string(),
                    ))
                }
            }
        } else if remote.starts_with("https://") {
            return Err(ProxyError::Config(
                "https remotes require --secure with client certificates".to_string(),
            ));
        } else {
            None
        };

        Ok(Self::new(endpoint, tls, config.connect_timeout()))
    }

    /// The remote endpoint.
    #[must_use]
    pub const fn endpoint(&self) -> &RemoteEndpoint {
        &self.endpoint
    }

    /// Connect / handshake timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }

    /// Whether connections use TLS.
    #[must_use]
    pub const fn is_secure(&self) -> bool {
        self.tls.is_some()
    }

    /// Base URL of the remote engine.
    #[must_use]
    pub fn base_url(&self) -> String {
        match &self.endpoint {
            RemoteEndpoint::Tcp { .. } => {
                let scheme = if self.is_secure() { "https" } else { "http" };
                format!("{scheme}://{}", self.endpoint.host_header())
            }
            RemoteEndpoint::Unix { path } => {
                format!("http+unix://{}", path.display().to_string().replace('/', "%2F"))
            }
        }
    }

    /// Full remote URL for a client request: base URL, path (unless `/`)
    /// and query string.
    #[must_use]
    pub fn resolve_target(&self, uri: &Uri) -> String {
        let mut url = self.base_url();
        if uri.path() != "/" {
            url.push_str(uri.path());
        }
        if let Some(query) = uri.query().filter(|q| !q.is_empty()) {
            url.push('?');
            url.push_str(query);
        }
        url
    }

    /// Opens a new connection, bounded by the connect timeout.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Connectivity`] if the remote refuses, times out
    /// or fails the TLS handshake.
    pub async fn connect(&self) -> Result<RemoteStream> {
        match &self.endpoint {
            RemoteEndpoint::Unix { path } => {
                let stream = self.bounded(UnixStream::connect(path)).await?;
                Ok(Box::new(stream))
            }
            RemoteEndpoint::Tcp { host, port } => {
                let stream = self
                    .bounded(TcpStream::connect((host.as_str(), *port)))
                    .await?;
                stream.set_nodelay(true)?;

                let Some(connector) = &self.tls else {
                    return Ok(Box::new(stream));
                };
                let server_name = ServerName::try_from(host.clone())
                    .map_err(|e| ProxyError::Tls(format!("invalid server name {host}: {e}")))?;
                let stream = self.bounded(connector.connect(server_name, stream)).await?;
                Ok(Box::new(stream))
            }
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = io::Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.connect_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ProxyError::Connectivity(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connection to {} timed out", self.base_url()),
            ))),
        }
    }

    /// Sends one request over a fresh HTTP/1.1 connection.
    ///
    /// The response body is streamed lazily, so this works for both
    /// fixed-length and chunked (streaming) responses.
    ///
    /// # Errors
    ///
    /// Returns an error if the connection, handshake or request fails.
    pub async fn send(&self, req: Request<Body>) -> Result<Response<Incoming>> {
        let io = TokioIo::new(self.connect().await?);

        let (mut sender, conn) = http1::Builder::new()
            .handshake(io)
            .await
            .map_err(ProxyError::connectivity)?;

        tokio::spawn(async move {
            if let Err(e) = conn.await {
                let msg = e.to_string().to_lowercase();
                if !msg.contains("canceled") && !msg.contains("incomplete") {
                    tracing::debug!("remote connection ended: {}", e);
                }
            }
        });

        sender
            .send_request(req)
            .await
            .map_err(ProxyError::connectivity)
    }
}

impl std::fmt::Debug for RemoteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnector")
            .field("endpoint", &self.endpoint)
            .field("secure", &self.is_secure())
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
