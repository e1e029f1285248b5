//! # wsnet
//!
//! Workspace network daemon. It joins the workspace to an overlay network and
//! serves, on that network:
//!
//! - SSH forwarding to the local SSH server
//! - HTTP port forwarding to workspace-local ports
//! - a rendezvous Unix socket multiplexing a gRPC director and an HTTP
//!   tunnel proxy, including the git credential relay
//!
//! while it reports presence to the control plane and persists the overlay
//! topology.
//!
//! ## Architecture
//!
//! - [`wsnet-common`] - configuration, constants and errors
//! - [`wsnet-core`] - trackers, the overlay network boundary, topology and client transports
//! - [`wsnet-http`] - the multiplexer and the protocol servers on top of it
//! - [`wsnet-observability`] - logging and metrics

pub mod config;
pub mod heartbeat;
pub mod server;
pub mod ssh;

pub use wsnet_common as common;
pub use wsnet_core as core;
pub use wsnet_http as http;

pub use config::{ServerConfig, WorkspaceIdentity};
pub use heartbeat::HeartbeatService;
pub use server::Server;
pub use ssh::SshService;

pub use common::{NetError, Result};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::common::{NetError, Result};
    pub use crate::config::{ServerConfig, WorkspaceIdentity};
    pub use crate::core::mesh::{DirectJoiner, JoinOptions, NetworkJoiner};
    pub use crate::server::Server;
}
