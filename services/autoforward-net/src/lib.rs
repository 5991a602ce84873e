//! # autoforward-net
//!
//! Local port reservation and SSH tunnel supervision for autoforward.
//!
//! Every container port published by the remote engine gets a [`Forward`]:
//! a local port reserved with a bound (not listening) placeholder socket that
//! is swapped for an external tunnel process once the remote side is
//! listening.
//!
//! ## Architecture
//!
//! ```text
//!  ┌──────────────────────────────────────────────────┐
//!  │                 autoforward-net                  │
//!  │  ┌────────────┐   tick()   ┌──────────────────┐  │
//!  │  │  Forward   │──────────► │  ForwardDriver   │  │
//!  │  │  (state)   │            │  probe + launch  │  │
//!  │  └────────────┘            └──────────────────┘  │
//!  │        │                      │            │     │
//!  │        ▼                      ▼            ▼     │
//!  │  Placeholder            RemoteProbe  TunnelLauncher
//!  │  (bound socket)         (ssh lsof)   (autossh -L)│
//!  └──────────────────────────────────────────────────┘
//! ```

#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(clippy::module_name_repetitions)]

pub mod error;
pub mod forward;
pub mod placeholder;
pub mod probe;
pub mod tunnel;

pub use error::{NetError, Result};
pub use forward::{Forward, ForwardDriver, ForwardState};
pub use placeholder::Placeholder;
pub use probe::{RemoteProbe, SshProbe};
pub use tunnel::{SshTunnelLauncher, TunnelLauncher, TunnelProcess, TunnelSpec};
