//! Forward registry and supervisory loop.
//!
//! Inspect responses create forwards through [`ProxyOrchestrator::get_or_create_forward`],
//! delete responses close them, and [`ProxyOrchestrator::run_supervisor`]
//! ticks every registered forward on a fixed period.

use autoforward_net::{Forward, ForwardDriver, ForwardState};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Registry entry: the forward plus the ports it was created with.
#[derive(Debug, Clone)]
pub struct ForwardHandle {
    /// Owning container, as named in the request path.
    pub container_id: String,
    /// Published port on the remote engine host.
    pub remote_port: u16,
    /// Reserved local port.
    pub local_port: u16,
    forward: Arc<tokio::sync::Mutex<Forward>>,
}

impl ForwardHandle {
    fn new(forward: Forward) -> Self {
        Self {
            container_id: forward.container_id().to_string(),
            remote_port: forward.remote_port(),
            local_port: forward.local_port(),
            forward: Arc::new(tokio::sync::Mutex::new(forward)),
        }
    }

    /// Current state of the forward.
    pub async fn state(&self) -> ForwardState {
        self.forward.lock().await.state()
    }

    /// Ticks the forward.
    ///
    /// # Errors
    ///
    /// See [`Forward::tick`].
    pub async fn tick(&self, driver: &ForwardDriver) -> autoforward_net::Result<()> {
        self.forward.lock().await.tick(driver).await
    }

    /// Closes the forward.
    ///
    /// # Errors
    ///
    /// See [`Forward::close`].
    pub async fn close(&self) -> autoforward_net::Result<()> {
        self.forward.lock().await.close().await
    }
}

/// Container id → remote port → forward.
///
/// Insertions happen under one lock so concurrent inspects of the same
/// container never create duplicate forwards.
#[derive(Debug, Default)]
pub struct ForwardRegistry {
    containers: Mutex<HashMap<String, HashMap<u16, ForwardHandle>>>,
}

impl ForwardRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, HashMap<u16, ForwardHandle>>> {
        self.containers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns the existing entry for the pair or inserts the one built by
    /// `create`. The boolean is `true` when a new forward was inserted.
    ///
    /// # Errors
    ///
    /// Propagates the error of `create`; nothing is inserted then.
    pub fn get_or_insert_with<F>(
        &self,
        container_id: &str,
        remote_port: u16,
        create: F,
    ) -> autoforward_net::Result<(ForwardHandle, bool)>
    where
        F: FnOnce() -> autoforward_net::Result<Forward>,
    {
        let mut containers = self.lock();
        if let Some(handle) = containers
            .get(container_id)
            .and_then(|ports| ports.get(&remote_port))
        {
            return Ok((handle.clone(), false));
        }

        let handle = ForwardHandle::new(create()?);
        containers
            .entry(container_id.to_string())
            .or_default()
            .insert(remote_port, handle.clone());
        Ok((handle, true))
    }

    /// Looks up a forward.
    #[must_use]
    pub fn get(&self, container_id: &str, remote_port: u16) -> Option<ForwardHandle> {
        self.lock()
            .get(container_id)
            .and_then(|ports| ports.get(&remote_port))
            .cloned()
    }

    /// Removes and returns every forward of a container.
    pub fn remove_container(&self, container_id: &str) -> Vec<ForwardHandle> {
        self.lock()
            .remove(container_id)
            .map(|ports| ports.into_values().collect())
            .unwrap_or_default()
    }

    /// Removes and returns every forward.
    pub fn drain(&self) -> Vec<ForwardHandle> {
        self.lock()
            .drain()
            .flat_map(|(_, ports)| ports.into_values())
            .collect()
    }

    /// Every forward currently registered.
    #[must_use]
    pub fn snapshot(&self) -> Vec<ForwardHandle> {
        self.lock()
            .values()
            .flat_map(|ports| ports.values().cloned())
            .collect()
    }

    /// Whether the container has any forward.
    #[must_use]
    pub fn contains_container(&self, container_id: &str) -> bool {
        self.lock().contains_key(container_id)
    }

    /// Number of forwards.
    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().values().map(HashMap::len).sum()
    }

    /// Whether no forward is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Owns the registry and drives every forward.
#[derive(Debug)]
pub struct ProxyOrchestrator {
    registry: ForwardRegistry,
    driver: ForwardDriver,
    running: CancellationToken,
}

impl ProxyOrchestrator {
    /// Creates an orchestrator using `driver` for probes and tunnels.
    #[must_use]
    pub fn new(driver: ForwardDriver) -> Self {
        Self {
            registry: ForwardRegistry::new(),
            driver,
            running: CancellationToken::new(),
        }
    }

    /// The forward registry.
    #[must_use]
    pub const fn registry(&self) -> &ForwardRegistry {
        &self.registry
    }

    /// Token cancelled on shutdown.
    #[must_use]
    pub fn running_token(&self) -> CancellationToken {
        self.running.clone()
    }

    /// Whether shutdown has not started.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.running.is_cancelled()
    }

    /// Returns the local port forwarding `remote_port` of a container,
    /// creating the forward on first use.
    ///
    /// Falls back to `remote_port` when no local port can be reserved.
    pub fn get_or_create_forward(&self, container_id: &str, image: &str, remote_port: u16) -> u16 {
        let result = self.registry.get_or_insert_with(container_id, remote_port, || {
            Forward::reserve(container_id, remote_port)
        });

        match result {
            Ok((handle, created)) => {
                if created {
                    tracing::info!(
                        container_id = %container_id,
                        image = %image,
                        "ADD_FORWARD {} -> {}",
                        remote_port,
                        handle.local_port
                    );
                }
                handle.local_port
            }
            Err(e) => {
                tracing::warn!(
                    container_id = %container_id,
                    image = %image,
                    "FAIL_FORWARD {}, reason: {}",
                    remote_port,
                    e
                );
                remote_port
            }
        }
    }

    /// Rewrites every `HostPort` under `NetworkSettings.Ports` of a container
    /// inspect document to its forwarded local port. Returns how many
    /// bindings were rewritten.
    pub fn rewrite_published_ports(&self, container_id: &str, inspect: &mut Value) -> usize {
        let image = inspect
            .pointer("/Config/Image")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();

        let Some(ports) = inspect
            .pointer_mut("/NetworkSettings/Ports")
            .and_then(Value::as_object_mut)
        else {
            return 0;
        };

        let mut rewritten = 0;
        for binding in ports
            .values_mut()
            .filter_map(Value::as_array_mut)
            .flatten()
        {
            let Some(host_port) = binding
                .get("HostPort")
                .and_then(Value::as_str)
                .and_then(|p| p.parse::<u16>().ok())
            else {
                continue;
            };

            let local_port = self.get_or_create_forward(container_id, &image, host_port);
            if let Some(obj) = binding.as_object_mut() {
                obj.insert("HostPort".to_string(), Value::String(local_port.to_string()));
                rewritten += 1;
            }
        }
        rewritten
    }

    /// Closes and removes every forward of a deleted container.
    ///
    /// A failure closing one forward does not stop the others.
    pub async fn on_container_deleted(&self, container_id: &str) {
        for handle in self.registry.remove_container(container_id) {
            match handle.close().await {
                Ok(()) => tracing::info!(
                    container_id = %container_id,
                    "DEL_FORWARD {} -> {}",
                    handle.remote_port,
                    handle.local_port
                ),
                Err(e) => tracing::warn!(
                    container_id = %container_id,
                    "DEL_FORWARD {} -> {} failed: {}",
                    handle.remote_port,
                    handle.local_port,
                    e
                ),
            }
        }
    }

    /// Ticks every registered forward once.
    pub async fn tick_all(&self) {
        for handle in self.registry.snapshot() {
            if let Err(e) = handle.tick(&self.driver).await {
                tracing::warn!(
                    container_id = %handle.container_id,
                    "Forward {} -> {} tick failed: {}",
                    handle.remote_port,
                    handle.local_port,
                    e
                );
            }
        }
    }

    /// Ticks all forwards every `period` until shutdown.
    pub async fn run_supervisor(&self, period: Duration) {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::debug!("Forward supervisor started ({:?} period)", period);
        loop {
            tokio::select! {
                biased;

                () = self.running.cancelled() => {
                    tracing::debug!("Forward supervisor stopped");
                    break;
                }

                _ = ticker.tick() => self.tick_all().await,
            }
        }
    }

    /// Stops the supervisor and closes every forward.
    pub async fn shutdown(&self) {
        self.running.cancel();
        for handle in self.registry.drain() {
            if let Err(e) = handle.close().await {
                tracing::warn!(
                    container_id = %handle.container_id,
                    "Failed to close forward {} -> {}: {}",
                    handle.remote_port,
                    handle.local_port,
                    e
                );
            }
        }
    }
}

impl Drop for ProxyOrchestrator {
    fn drop(&mut self) {
        self.running.cancel();
    }
}

/// Shared orchestrator.
pub type SharedOrchestrator = Arc<ProxyOrchestrator>;
