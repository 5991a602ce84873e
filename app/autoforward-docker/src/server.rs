//! Proxy server.

use crate::api::{create_router, AppState};
use crate::config::ProxyConfig;
use crate::error::{ProxyError, Result};
use crate::orchestrator::ProxyOrchestrator;
use crate::remote::RemoteConnector;
use crate::tls;
use autoforward_net::ForwardDriver;
use axum::body::Body;
use axum::Router;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper_util::rt::TokioIo;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tokio_util::sync::CancellationToken;
use tower::Service;
use tower_http::trace::TraceLayer;

/// Engine API proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    state: AppState,
    tls: Option<TlsAcceptor>,
    shutdown: CancellationToken,
}

impl ProxyServer {
    /// Creates a server for a validated configuration, forwarding through
    /// SSH to the configured gateway.
    ///
    /// # Errors
    ///
    /// Returns an error if the remote or TLS settings are invalid.
    pub fn new(config: ProxyConfig) -> Result<Self> {
        let connector = RemoteConnector::from_config(&config)?;
        let driver = ForwardDriver::ssh(
            &config.forward_host,
            &config.tunnel_command,
            &config.probe_command,
        );
        Self::with_parts(config, connector, driver)
    }

    /// Creates a server from explicit collaborators.
    ///
    /// # Errors
    ///
    /// Returns an error if secure mode is enabled and the server certificate
    /// cannot be loaded.
    pub fn with_parts(
        config: ProxyConfig,
        connector: RemoteConnector,
        driver: ForwardDriver,
    ) -> Result<Self> {
        let tls = if config.secure {
            match (&config.server_cert, &config.server_key) {
                (Some(cert), Some(key)) => {
                    Some(TlsAcceptor::from(tls::server_config(cert, key)?))
                }
                _ => {
                    return Err(ProxyError::Config(
                        "secure mode needs --server-cert and --server-key".to_string(),
                    ))
                }
            }
        } else {
            None
        };

        let orchestrator = Arc::new(ProxyOrchestrator::new(driver));
        Ok(Self {
            state: AppState::new(connector, orchestrator),
            config,
            tls,
            shutdown: CancellationToken::new(),
        })
    }

    /// The forward orchestrator.
    #[must_use]
    pub const fn orchestrator(&self) -> &Arc<ProxyOrchestrator> {
        &self.state.orchestrator
    }

    /// Address the server listens on.
    #[must_use]
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::from((Ipv4Addr::LOCALHOST, self.config.local_port))
    }

    /// Binds the configured port and serves until shutdown.
    ///
    /// # Errors
    ///
    /// Returns an error if the port cannot be bound.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(self.listen_addr()).await?;
        self.serve(listener).await
    }

    /// Serves connections from `listener` until shutdown. The forward
    /// supervisor runs alongside.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener address cannot be read.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        let addr = listener.local_addr()?;
        tracing::info!(
            "Proxy listening on {}://{} -> {}",
            if self.tls.is_some() { "https" } else { "http" },
            addr,
            self.state.connector.base_url()
        );
        tracing::info!("Forwarding published ports through {}", self.config.forward_host);

        let supervisor = {
            let orchestrator = Arc::clone(&self.state.orchestrator);
            let period = self.config.tick_interval();
            tokio::spawn(async move { orchestrator.run_supervisor(period).await })
        };

        let app = create_router(self.state.clone()).layer(TraceLayer::new_for_http().make_span_with(
            |request: &axum::http::Request<Body>| {
                tracing::debug_span!(
                    "request",
                    method = %request.method(),
                    uri = %request.uri(),
                    request_id = tracing::field::Empty,
                )
            },
        ));

        loop {
            tokio::select! {
                biased;

                () = self.shutdown.cancelled() => break,

                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::warn!("Failed to accept connection: {}", e);
                            continue;
                        }
                    };
                    let _ = stream.set_nodelay(true);

                    let app = app.clone();
                    match self.tls.clone() {
                        Some(acceptor) => {
                            tokio::spawn(async move {
                                match acceptor.accept(stream).await {
                                    Ok(stream) => serve_connection(stream, app).await,
                                    Err(e) => tracing::debug!("TLS handshake with {} failed: {}", peer, e),
                                }
                            });
                        }
                        None => {
                            tokio::spawn(serve_connection(stream, app));
                        }
                    }
                }
            }
        }

        supervisor.abort();
        tracing::info!("Proxy stopped");
        Ok(())
    }

    /// Stops the supervisor, closes every forward and stops accepting
    /// connections. In-flight requests are not drained.
    pub async fn shutdown(&self) {
        self.state.orchestrator.shutdown().await;
        self.shutdown.cancel();
    }
}

async fn serve_connection<S>(stream: S, app: Router)
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let hyper_service = hyper::service::service_fn(move |request: hyper::Request<Incoming>| {
        app.clone().call(request)
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(stream), hyper_service)
        .with_upgrades()
        .await
    {
        let err_str = err.to_string().to_lowercase();
        if !err_str.contains("shutting down")
            && !err_str.contains("connection reset")
            && !err_str.contains("broken pipe")
        {
            tracing::error!("Error serving connection: {}", err);
        }
    }
}

impl std::fmt::Debug for ProxyServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyServer")
            .field("listen_addr", &self.listen_addr())
            .field("remote", &self.state.connector)
            .field("secure", &self.tls.is_some())
            .finish_non_exhaustive()
    }
}
