//! Remote listening-state probes.

use crate::error::{NetError, Result};
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;

/// Upper bound for one probe round trip through the gateway.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Reports whether a port has a listener on the remote engine host.
#[async_trait]
pub trait RemoteProbe: Send + Sync {
    /// Checks whether `port` is listening on the remote host.
    async fn is_listening(&self, port: u16) -> Result<bool>;
}

/// Probes the remote host by running `lsof` over `ssh` through the gateway.
#[derive(Debug, Clone)]
pub struct SshProbe {
    program: String,
    gateway: String,
    timeout: Duration,
}

impl SshProbe {
    /// Creates a probe running `program` (normally `ssh`) against `gateway`.
    pub fn new(program: impl Into<String>, gateway: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            gateway: gateway.into(),
            timeout: DEFAULT_PROBE_TIMEOUT,
        }
    }

    /// Overrides the probe timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// The command executed on the remote host.
    #[must_use]
    pub fn remote_command(port: u16) -> String {
        format!("/bin/sh -c \"sudo lsof -i:{port} | grep 'LISTEN'\"")
    }
}

#[async_trait]
impl RemoteProbe for SshProbe {
    async fn is_listening(&self, port: u16) -> Result<bool> {
        let output = Command::new(&self.program)
            .arg(&self.gateway)
            .arg(Self::remote_command(port))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, output)
            .await
            .map_err(|_| NetError::Probe(format!("probe for port {port} timed out")))?
            .map_err(|e| NetError::Probe(format!("failed to run {}: {e}", self.program)))?;

        let stdout = String::from_utf8_lossy(&output.stdout);
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::Probe(format!(
                "check remote port failed with {}\noutput:\n{stdout}\nerror:\n{stderr}",
                output.status
            )));
        }

        Ok(stdout.contains("LISTEN"))
    }
}
