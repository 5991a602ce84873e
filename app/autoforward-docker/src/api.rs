//! Proxy router.

use crate::dispatch::ResponseDispatcher;
use crate::hijack::ConnectionHijacker;
use crate::orchestrator::ProxyOrchestrator;
use crate::remote::RemoteConnector;
use crate::router;
use crate::trace::request_id_middleware;
use axum::{middleware, Router};
use std::sync::Arc;

/// Application state shared with the proxy handler.
#[derive(Debug, Clone)]
pub struct AppState {
    /// Remote engine connector for passthrough requests.
    pub connector: RemoteConnector,
    /// Opens hijacked sessions.
    pub hijacker: ConnectionHijacker,
    /// Response handlers.
    pub dispatcher: Arc<ResponseDispatcher>,
    /// Forward registry owner.
    pub orchestrator: Arc<ProxyOrchestrator>,
}

impl AppState {
    /// Builds the state; hijacked sessions use `connector` as well.
    #[must_use]
    pub fn new(connector: RemoteConnector, orchestrator: Arc<ProxyOrchestrator>) -> Self {
        let read_timeout = connector.connect_timeout();
        Self {
            hijacker: ConnectionHijacker::new(connector.clone(), read_timeout),
            connector,
            dispatcher: Arc::new(ResponseDispatcher::default()),
            orchestrator,
        }
    }
}

/// Creates the proxy router. Every request goes through the fallback
/// handler so any engine API version and endpoint is relayed.
#[must_use]
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .fallback(router::proxy_fallback)
        .layer(middleware::from_fn(request_id_middleware))
        .with_state(state)
}
