//! Configuration management.
//!
//! Configuration is loaded from multiple sources with the following priority:
//!
//! 1. Command-line flags (applied by the daemon)
//! 2. Environment variables (`AUTOFORWARD_*`)
//! 3. Configuration file (`~/.config/autoforward/config.toml`)
//! 4. System configuration file (`/etc/autoforward/config.toml`)
//! 5. Default values
//!
//! ## Example Configuration File
//!
//! ```toml
//! local_port = 8080
//! remote = "tcp://10.0.0.5:2376"
//! forward_host = "remote-docker"
//! secure = true
//! server_cert = "/etc/autoforward/server.pem"
//! server_key = "/etc/autoforward/server-key.pem"
//! remote_cert = "/etc/autoforward/cert.pem"
//! remote_key = "/etc/autoforward/key.pem"
//! remote_ca = "/etc/autoforward/ca.pem"
//! ```

use crate::error::{ProxyError, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Schemes accepted for the remote engine endpoint.
pub const REMOTE_SCHEMES: [&str; 4] = ["unix", "tcp", "http", "https"];

/// Proxy configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProxyConfig {
    /// Local listen port.
    pub local_port: u16,
    /// Remote engine URL (`tcp://host:2375`, `unix:///var/run/docker.sock`).
    pub remote: Option<String>,
    /// Gateway host used for tunnels and liveness probes.
    pub forward_host: String,
    /// Enables TLS on both the local listener and the remote connection.
    pub secure: bool,
    /// Key for the local server endpoint.
    pub server_key: Option<PathBuf>,
    /// Certificate for the local server endpoint.
    pub server_cert: Option<PathBuf>,
    /// Client key for the remote endpoint.
    pub remote_key: Option<PathBuf>,
    /// Client certificate for the remote endpoint.
    pub remote_cert: Option<PathBuf>,
    /// CA for the remote endpoint.
    pub remote_ca: Option<PathBuf>,
    /// Debug logging.
    pub verbose: bool,
    /// Tunnel program.
    pub tunnel_command: String,
    /// Remote probe program.
    pub probe_command: String,
    /// Supervisory loop period in milliseconds.
    pub tick_interval_ms: u64,
    /// Connect / handshake timeout for hijacked sessions in milliseconds.
    pub connect_timeout_ms: u64,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            local_port: 8080,
            remote: None,
            forward_host: "remote-docker".to_string(),
            secure: false,
            server_key: None,
            server_cert: None,
            remote_key: None,
            remote_cert: None,
            remote_ca: None,
            verbose: false,
            tunnel_command: "autossh".to_string(),
            probe_command: "ssh".to_string(),
            tick_interval_ms: 1000,
            connect_timeout_ms: 2000,
        }
    }
}

impl ProxyConfig {
    /// Loads configuration from files and environment.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration cannot be loaded.
    pub fn load() -> std::result::Result<Self, figment::Error> {
        let mut figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(system_config_path()));
        if let Some(user) = user_config_path() {
            figment = figment.merge(Toml::file(user));
        }
        figment.merge(Env::prefixed("AUTOFORWARD_")).extract()
    }

    /// Loads configuration from a specific file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn load_from(path: impl AsRef<Path>) -> std::result::Result<Self, figment::Error> {
        Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(path))
            .merge(Env::prefixed("AUTOFORWARD_"))
            .extract()
    }

    /// Supervisory loop period.
    #[must_use]
    pub const fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    /// Connect / handshake timeout.
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    /// Checks required values and, in secure mode, certificate files.
    ///
    /// # Errors
    ///
    /// Returns [`ProxyError::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        let Some(remote) = self.remote.as_deref() else {
            return Err(ProxyError::Config(
                "Remote is required (e.g. tcp://0.0.0.0:2375, unix:///var/run/docker.sock): --remote"
                    .to_string(),
            ));
        };

        let scheme = remote.split_once("://").map_or("", |(scheme, _)| scheme);
        if !REMOTE_SCHEMES.contains(&scheme) {
            return Err(ProxyError::Config(format!(
                "Remote not valid, only \"unix\", \"tcp\", \"http\" and \"https\" schemes supported, received \"{scheme}\""
            )));
        }

        if self.secure {
            if !is_file(self.server_cert.as_deref()) || !is_file(self.server_key.as_deref()) {
                return Err(ProxyError::Config(
                    "Server certificates are required when secure is enabled: --server-cert --server-key"
                        .to_string(),
                ));
            }
            if !is_file(self.remote_cert.as_deref())
                || !is_file(self.remote_key.as_deref())
                || !is_file(self.remote_ca.as_deref())
            {
                return Err(ProxyError::Config(
                    "Remote certificates are required when secure is enabled: --remote-ca --remote-cert --remote-key"
                        .to_string(),
                ));
            }
        }

        Ok(())
    }
}

fn is_file(path: Option<&Path>) -> bool {
    path.is_some_and(Path::is_file)
}

fn system_config_path() -> PathBuf {
    PathBuf::from("/etc/autoforward/config.toml")
}

fn user_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|dir| dir.join("autoforward").join("config.toml"))
}
