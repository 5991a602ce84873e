use anyhow::{Context, Result};
use autoforward_docker::{ProxyConfig, ProxyServer};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Debug, Parser)]
#[command(name = "autoforward")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Local port to listen on.
    #[arg(short = 'p', long)]
    pub port: Option<u16>,

    /// Remote engine (e.g. tcp://0.0.0.0:2375, unix:///var/run/docker.sock).
    #[arg(short = 'r', long)]
    pub remote: Option<String>,

    /// Gateway host for SSH forwards.
    #[arg(short = 'f', long = "forward")]
    pub forward_host: Option<String>,

    /// Enable TLS on the listener and the remote connection.
    #[arg(long)]
    pub secure: bool,

    /// Server key.
    #[arg(long = "server-key", visible_alias = "sk")]
    pub server_key: Option<PathBuf>,

    /// Server certificate.
    #[arg(long = "server-cert", visible_alias = "sc")]
    pub server_cert: Option<PathBuf>,

    /// Remote client key.
    #[arg(long = "remote-key", visible_alias = "rk")]
    pub remote_key: Option<PathBuf>,

    /// Remote client certificate.
    #[arg(long = "remote-cert", visible_alias = "rc")]
    pub remote_cert: Option<PathBuf>,

    /// Remote CA.
    #[arg(long = "remote-ca", visible_alias = "rca")]
    pub remote_ca: Option<PathBuf>,

    /// Debug logging.
    #[arg(short = 'v', long)]
    pub verbose: bool,

    /// Configuration file (default: /etc/autoforward/config.toml and
    /// ~/.config/autoforward/config.toml).
    #[arg(long)]
    pub config: Option<PathBuf>,
}

impl Args {
    /// Applies command-line overrides on top of loaded configuration.
    fn apply(self, config: &mut ProxyConfig) {
        if let Some(port) = self.port {
            config.local_port = port;
        }
        if let Some(remote) = self.remote {
            config.remote = Some(remote);
        }
        if let Some(forward_host) = self.forward_host {
            config.forward_host = forward_host;
        }
        config.secure |= self.secure;
        config.verbose |= self.verbose;
        for (value, slot) in [
            (self.server_key, &mut config.server_key),
            (self.server_cert, &mut config.server_cert),
            (self.remote_key, &mut config.remote_key),
            (self.remote_cert, &mut config.remote_cert),
            (self.remote_ca, &mut config.remote_ca),
        ] {
            if value.is_some() {
                *slot = value;
            }
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => ProxyConfig::load_from(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => ProxyConfig::load().context("Failed to load config")?,
    };
    args.apply(&mut config);

    let default_filter = if config.verbose {
        "autoforward=debug,tower_http=debug"
    } else {
        "autoforward=info"
    };
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| default_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer().with_target(false))
        .init();

    if let Err(e) = config.validate() {
        error!("{}", e);
        std::process::exit(1);
    }

    run(config).await
}

async fn run(config: ProxyConfig) -> Result<()> {
    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    info!("Starting autoforward proxy...");
    let server = Arc::new(ProxyServer::new(config).context("Failed to create proxy server")?);

    let mut server_handle = {
        let server = Arc::clone(&server);
        tokio::spawn(async move { server.run().await })
    };

    tokio::select! {
        result = shutdown_signal() => {
            result?;
            info!("Shutdown signal received");
        }
        result = &mut server_handle => {
            result
                .context("Proxy task panicked")?
                .context("Proxy server error")?;
            return Ok(());
        }
    }

    info!("Shutting down...");
    server.shutdown().await;
    server_handle
        .await
        .context("Proxy task panicked")?
        .context("Proxy server error")?;

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_signal() -> Result<()> {
    let ctrl_c = async { signal::ctrl_c().await.context("Failed to install Ctrl+C handler") };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .context("Failed to install SIGTERM handler")?
            .recv()
            .await;
        Ok(())
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<Result<()>>();

    tokio::select! {
        result = ctrl_c => result,
        result = terminate => result,
    }
}
