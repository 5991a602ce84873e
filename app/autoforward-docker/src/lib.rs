//! # autoforward-docker
//!
//! Transparent Docker Engine API proxy for CI jobs running against a remote
//! engine.
//!
//! Every request is relayed to the remote engine unchanged, except:
//!
//! - attach and exec start calls, which are hijacked onto a dedicated socket
//!   so the multiplexed raw stream reaches the client byte for byte;
//! - container inspect responses, whose published `HostPort`s are replaced by
//!   local ports forwarded to the remote host over SSH;
//! - container deletes, which close the forwards of that container.
//!
//! ## Architecture
//!
//! ```text
//! docker CLI ──► autoforward-docker ──► remote dockerd
//!   (CI job)          │    │
//!                     │    └── hijack ── raw frames ──► client
//!                     ▼
//!            ProxyOrchestrator ── tick ──► autoforward-net::Forward
//!                                             (autossh / ssh probe)
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod config;
pub mod dispatch;
pub mod error;
pub mod frame;
pub mod hijack;
pub mod orchestrator;
pub mod remote;
pub mod router;
pub mod routes;
pub mod scanner;
pub mod server;
pub mod tls;
pub mod trace;

pub use config::ProxyConfig;
pub use error::{ProxyError, Result};
pub use orchestrator::{ForwardRegistry, ProxyOrchestrator};
pub use remote::{RemoteConnector, RemoteEndpoint};
pub use server::ProxyServer;
