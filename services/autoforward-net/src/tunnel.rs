//! External tunnel processes.
//!
//! A tunnel is a persistent `autossh` child forwarding a loopback port to a
//! port on the remote engine host through the gateway. It runs with
//! `ExitOnForwardFailure=yes`, so a running process means a working forward
//! and its exit code is the liveness signal.

use crate::error::{NetError, Result};
use async_trait::async_trait;
use nix::errno::Errno;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};

/// Delay before checking whether a freshly spawned tunnel exited.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(250);

/// The ports a tunnel connects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TunnelSpec {
    /// Loopback port CI clients connect to.
    pub local_port: u16,
    /// Port on the remote engine host.
    pub remote_port: u16,
}

/// Handle to a running tunnel child process.
///
/// The child is killed when the handle is dropped. A child spawned as a
/// process group leader takes its whole group down with it, so an `ssh`
/// started by `autossh` cannot keep holding the local port.
#[derive(Debug)]
pub struct TunnelProcess {
    child: Child,
    pid: Option<u32>,
    group_leader: bool,
}

impl TunnelProcess {
    /// Wraps a spawned child.
    #[must_use]
    pub fn new(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            group_leader: false,
        }
    }

    /// Wraps a child spawned with `process_group(0)`.
    #[must_use]
    pub fn group_leader(child: Child) -> Self {
        let pid = child.id();
        Self {
            child,
            pid,
            group_leader: true,
        }
    }

    /// OS process id, captured at spawn time.
    #[must_use]
    pub const fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Polls the exit status without blocking.
    ///
    /// # Errors
    ///
    /// Returns an error if the process status cannot be queried.
    pub fn try_exit_status(&mut self) -> Result<Option<ExitStatus>> {
        Ok(self.child.try_wait()?)
    }

    /// Returns `true` while the process has not exited.
    ///
    /// # Errors
    ///
    /// Returns an error if the process status cannot be queried.
    pub fn is_alive(&mut self) -> Result<bool> {
        Ok(self.try_exit_status()?.is_none())
    }

    /// Kills the process and reaps it.
    ///
    /// # Errors
    ///
    /// Returns an error if the kill signal cannot be delivered.
    pub async fn kill(&mut self) -> Result<()> {
        self.kill_group();
        if self.try_exit_status()?.is_some() {
            return Ok(());
        }
        self.child.kill().await?;
        Ok(())
    }

    /// Sends SIGKILL to the process group. Descendants may outlive the
    /// leader, so this runs even when the leader already exited.
    fn kill_group(&self) {
        if let Some(pid) = self.pid.filter(|_| self.group_leader) {
            signal_group(pid);
        }
    }
}

impl Drop for TunnelProcess {
    fn drop(&mut self) {
        self.kill_group();
    }
}

/// Starts tunnel processes.
#[async_trait]
pub trait TunnelLauncher: Send + Sync {
    /// Launches a tunnel for `spec`.
    ///
    /// Implementations must fail if the process exits right after start.
    async fn launch(&self, spec: TunnelSpec) -> Result<TunnelProcess>;
}

/// Launches `autossh` port forwards through a gateway host.
#[derive(Debug, Clone)]
pub struct SshTunnelLauncher {
    program: String,
    gateway: String,
    settle_delay: Duration,
}

impl SshTunnelLauncher {
    /// Creates a launcher running `program` (normally `autossh`) against `gateway`.
    pub fn new(program: impl Into<String>, gateway: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            gateway: gateway.into(),
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }

    /// Overrides the delay before the exit code is checked.
    #[must_use]
    pub const fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Arguments passed to the tunnel program.
    #[must_use]
    pub fn args(&self, spec: TunnelSpec) -> Vec<String> {
        vec![
            "-M".to_string(),
            "0".to_string(),
            "-gNC".to_string(),
            "-o".to_string(),
            "ExitOnForwardFailure=yes".to_string(),
            "-o".to_string(),
            "ServerAliveInterval=10".to_string(),
            "-o".to_string(),
            "ServerAliveCountMax=3".to_string(),
            "-L".to_string(),
            format!("127.0.0.1:{}:localhost:{}", spec.local_port, spec.remote_port),
            self.gateway.clone(),
        ]
    }
}

#[async_trait]
impl TunnelLauncher for SshTunnelLauncher {
    async fn launch(&self, spec: TunnelSpec) -> Result<TunnelProcess> {
        let mut command = Command::new(&self.program);
        command
            .args(self.args(spec))
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);
        let mut child = command
            .spawn()
            .map_err(|e| NetError::Tunnel(format!("failed to spawn {}: {e}", self.program)))?;
        let pid = child.id();

        tokio::time::sleep(self.settle_delay).await;

        if let Some(status) = child.try_wait()? {
            // Reap anything autossh left behind before draining stderr.
            if let Some(pid) = pid {
                signal_group(pid);
            }
            let output = child.wait_with_output().await?;
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(NetError::Tunnel(format!(
                "SSH forward exited with {status}\nerr:\n{stderr}"
            )));
        }

        // Keep draining stderr so a chatty tunnel never blocks on a full pipe.
        if let Some(stderr) = child.stderr.take() {
            let local_port = spec.local_port;
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    tracing::debug!(local_port, "tunnel: {}", line);
                }
            });
        }

        Ok(TunnelProcess::group_leader(child))
    }
}

/// Sends SIGKILL to the process group led by `pid`.
fn signal_group(pid: u32) {
    let Ok(pgid) = i32::try_from(pid) else {
        return;
    };
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => tracing::warn!(pgid, "Failed to kill tunnel process group: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPEC: TunnelSpec = TunnelSpec {
        local_port: 40001,
        remote_port: 32768,
    };

    #[test]
    fn args_bind_loopback_to_remote_port() {
        let launcher = SshTunnelLauncher::new("autossh", "remote-docker");
        let args = launcher.args(SPEC);

        assert_eq!(args[..3], ["-M", "0", "-gNC"]);
        assert!(args.contains(&"ExitOnForwardFailure=yes".to_string()));
        assert_eq!(args[args.len() - 2], "127.0.0.1:40001:localhost:32768");
        assert_eq!(args[args.len() - 1], "remote-docker");
    }

    #[tokio::test]
    async fn launch_fails_when_process_exits_immediately() {
        let launcher = SshTunnelLauncher::new("false", "remote-docker")
            .with_settle_delay(Duration::from_millis(500));

        let err = launcher.launch(SPEC).await.unwrap_err();
        assert!(matches!(err, NetError::Tunnel(_)));
    }

    #[tokio::test]
    async fn launch_fails_for_missing_program() {
        let launcher = SshTunnelLauncher::new("/nonexistent/autossh", "remote-docker");

        let err = launcher.launch(SPEC).await.unwrap_err();
        assert!(err.to_string().contains("failed to spawn"));
    }

    #[tokio::test]
    async fn tunnel_process_reports_liveness_and_kills() {
        let child = Command::new("sleep")
            .arg("30")
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut tunnel = TunnelProcess::new(child);

        assert!(tunnel.pid().is_some());
        assert!(tunnel.is_alive().unwrap());

        tunnel.kill().await.unwrap();
        assert!(!tunnel.is_alive().unwrap());

        // Killing an exited process is a no-op.
        tunnel.kill().await.unwrap();
    }

    #[tokio::test]
    async fn kill_takes_down_the_process_group() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");

        // The background subshell stands in for the ssh child of autossh.
        let child = Command::new("sh")
            .arg("-c")
            .arg(format!("(sleep 1; touch '{}') & wait", marker.display()))
            .process_group(0)
            .kill_on_drop(true)
            .spawn()
            .unwrap();
        let mut tunnel = TunnelProcess::group_leader(child);
        tokio::time::sleep(Duration::from_millis(100)).await;

        tunnel.kill().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!marker.exists());
    }

    #[tokio::test]
    async fn dropping_a_group_leader_kills_its_descendants() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("survived");

        let child = Command::new("sh")
            .arg("-c")
            .arg(format!("(sleep 1; touch '{}') & exit 0", marker.display()))
            .process_group(0)
            .spawn()
            .unwrap();
        let mut tunnel = TunnelProcess::group_leader(child);
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!tunnel.is_alive().unwrap());

        drop(tunnel);
        tokio::time::sleep(Duration::from_millis(1500)).await;

        assert!(!marker.exists());
    }
}
