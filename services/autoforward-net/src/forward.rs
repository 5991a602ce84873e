//! Forward state machine.
//!
//! ```text
//!            reserve()              remote listening + tunnel up
//!  Unbound ────────────► Bound ─────────────────────────────► Forwarding
//!                          ▲                                     │
//!                          └──── tunnel failed / exited ─────────┘
//!
//!  any state ── close() ──► Closed
//! ```

use crate::error::Result;
use crate::placeholder::Placeholder;
use crate::probe::{RemoteProbe, SshProbe};
use crate::tunnel::{SshTunnelLauncher, TunnelLauncher, TunnelProcess, TunnelSpec};
use std::fmt;
use std::sync::Arc;

/// Observable lifecycle state of a [`Forward`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardState {
    /// No local resource held (only between releasing the placeholder and
    /// starting the tunnel, or when the port could not be re-acquired).
    Unbound,
    /// Local port reserved by a placeholder socket.
    Bound,
    /// Tunnel process running.
    Forwarding,
    /// Torn down, never used again.
    Closed,
}

impl fmt::Display for ForwardState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unbound => "unbound",
            Self::Bound => "bound",
            Self::Forwarding => "forwarding",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// The resource a forward owns. Exactly one per state.
#[derive(Debug)]
enum Slot {
    Unbound,
    Bound(Placeholder),
    Forwarding(TunnelProcess),
    Closed,
}

/// Probe and launcher used to drive forwards.
#[derive(Clone)]
pub struct ForwardDriver {
    launcher: Arc<dyn TunnelLauncher>,
    probe: Arc<dyn RemoteProbe>,
}

impl ForwardDriver {
    /// Creates a driver from explicit collaborators.
    pub fn new(launcher: Arc<dyn TunnelLauncher>, probe: Arc<dyn RemoteProbe>) -> Self {
        Self { launcher, probe }
    }

    /// Creates the default driver: `tunnel_program` forwards and
    /// `probe_program` checks, both through `gateway`.
    pub fn ssh(gateway: &str, tunnel_program: &str, probe_program: &str) -> Self {
        Self::new(
            Arc::new(SshTunnelLauncher::new(tunnel_program, gateway)),
            Arc::new(SshProbe::new(probe_program, gateway)),
        )
    }

    /// Probe failures count as "not listening yet".
    async fn remote_listening(&self, port: u16) -> bool {
        match self.probe.is_listening(port).await {
            Ok(listening) => listening,
            Err(e) => {
                tracing::debug!("Check remote port failed, reason: {}", e);
                false
            }
        }
    }
}

impl fmt::Debug for ForwardDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ForwardDriver").finish_non_exhaustive()
    }
}

/// One tunnel for one (container, published port) pair.
#[derive(Debug)]
pub struct Forward {
    container_id: String,
    remote_port: u16,
    local_port: u16,
    slot: Slot,
}

impl Forward {
    /// Creates a forward and reserves its local port, preferring `remote_port`.
    ///
    /// # Errors
    ///
    /// Returns [`crate::NetError::ResourceExhaustion`] when no local port can
    /// be bound.
    pub fn reserve(container_id: impl Into<String>, remote_port: u16) -> Result<Self> {
        let placeholder = Placeholder::reserve(remote_port)?;
        Ok(Self {
            container_id: container_id.into(),
            remote_port,
            local_port: placeholder.port(),
            slot: Slot::Bound(placeholder),
        })
    }

    /// Container owning the published port.
    #[must_use]
    pub fn container_id(&self) -> &str {
        &self.container_id
    }

    /// Port on the remote engine host.
    #[must_use]
    pub const fn remote_port(&self) -> u16 {
        self.remote_port
    }

    /// Port CI clients connect to.
    #[must_use]
    pub const fn local_port(&self) -> u16 {
        self.local_port
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ForwardState {
        match self.slot {
            Slot::Unbound => ForwardState::Unbound,
            Slot::Bound(_) => ForwardState::Bound,
            Slot::Forwarding(_) => ForwardState::Forwarding,
            Slot::Closed => ForwardState::Closed,
        }
    }

    /// PID of the tunnel process, if one is running.
    #[must_use]
    pub fn tunnel_pid(&self) -> Option<u32> {
        match &self.slot {
            Slot::Forwarding(tunnel) => tunnel.pid(),
            _ => None,
        }
    }

    const fn spec(&self) -> TunnelSpec {
        TunnelSpec {
            local_port: self.local_port,
            remote_port: self.remote_port,
        }
    }

    /// Advances the forward one step. Safe to call repeatedly.
    ///
    /// A live tunnel is left alone. A dead one is rolled back to `Bound`.
    /// When the remote port is listening the placeholder is released and a
    /// tunnel launched; a failed launch re-acquires the placeholder so the
    /// next tick can retry.
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel process status cannot be queried.
    pub async fn tick(&mut self, driver: &ForwardDriver) -> Result<()> {
        let tunnel_exited = match &mut self.slot {
            Slot::Closed => return Ok(()),
            Slot::Forwarding(tunnel) => {
                if tunnel.is_alive()? {
                    return Ok(());
                }
                true
            }
            Slot::Unbound | Slot::Bound(_) => false,
        };

        if tunnel_exited {
            tracing::warn!(
                container_id = %self.container_id,
                "SSH_FORWARD {} -> {} exited, rolling back",
                self.remote_port,
                self.local_port
            );
            self.roll_back();
        }

        if !driver.remote_listening(self.remote_port).await {
            return Ok(());
        }

        // Free the port for the tunnel.
        self.slot = Slot::Unbound;

        match driver.launcher.launch(self.spec()).await {
            Ok(tunnel) => {
                tracing::info!(
                    container_id = %self.container_id,
                    pid = tunnel.pid(),
                    "SSH_FORWARD {} -> {} established",
                    self.remote_port,
                    self.local_port
                );
                self.slot = Slot::Forwarding(tunnel);
            }
            Err(e) => {
                tracing::debug!(
                    container_id = %self.container_id,
                    "FAILED_FORWARD {} -> {}, reason: {}",
                    self.remote_port,
                    self.local_port,
                    e
                );
                self.roll_back();
            }
        }

        Ok(())
    }

    /// Drops any tunnel and re-reserves the local port.
    fn roll_back(&mut self) {
        self.slot = Slot::Unbound;
        match Placeholder::bind(self.local_port) {
            Ok(placeholder) => self.slot = Slot::Bound(placeholder),
            Err(e) => tracing::warn!(
                container_id = %self.container_id,
                "Cannot re-acquire local port {}, reason: {}",
                self.local_port,
                e
            ),
        }
    }

    /// Kills the tunnel or releases the placeholder. Idempotent.
    ///
    /// The forward is `Closed` afterwards even when this returns an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the tunnel process could not be killed.
    pub async fn close(&mut self) -> Result<()> {
        match std::mem::replace(&mut self.slot, Slot::Closed) {
            Slot::Forwarding(mut tunnel) => tunnel.kill().await,
            Slot::Bound(_) | Slot::Unbound | Slot::Closed => Ok(()),
        }
    }
}
