//! Boundary to the mesh overlay network.
//!
//! The mesh-VPN client is an external collaborator. Everything the daemon
//! needs from it is expressed by the traits in this module: dialing peers,
//! listening on overlay ports, reading peer status and following netmap
//! changes. [`DirectNetwork`] implements them on plain loopback TCP.

use crate::stream::BoxedStream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::watch;
use wsnet_common::Result;

mod direct;

pub use direct::{DirectJoiner, DirectNetwork};

/// Anything that can open a byte stream to `host:port`
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream>;
}

/// Accept side of an overlay port
#[async_trait]
pub trait MeshListener: Send {
    /// Wait for the next inbound stream and its remote address
    async fn accept(&mut self) -> io::Result<(BoxedStream, String)>;

    fn local_addr(&self) -> String;
}

/// Handle to a joined overlay network
#[async_trait]
pub trait MeshClient: Dialer {
    async fn listen(&self, port: u16) -> io::Result<Box<dyn MeshListener>>;

    /// Current membership as seen by this node
    async fn status(&self) -> Result<NetMap>;

    /// Follow membership changes
    fn subscribe(&self) -> watch::Receiver<NetMap>;

    /// DNS suffix of overlay node names (e.g. `ts.loft`)
    fn domain(&self) -> &str;

    async fn close(&self);
}

/// Parameters for joining the overlay network
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOptions {
    /// Advertised node name
    pub hostname: String,
    /// Coordination server URL
    pub control_url: String,
    /// Pre-authorized access key
    pub auth_key: String,
    /// Node is removed from the network once it goes offline
    pub ephemeral: bool,
    /// Directory for node state
    pub state_dir: PathBuf,
}

/// The opaque network-join primitive
#[async_trait]
pub trait NetworkJoiner: Send + Sync {
    async fn join(&self, opts: JoinOptions) -> Result<Arc<dyn MeshClient>>;
}

/// Status of one overlay node
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerStatus {
    pub id: String,
    pub hostname: String,
    pub dns_name: String,
    pub addrs: Vec<String>,
    pub online: bool,
    pub last_seen: Option<DateTime<Utc>>,
}

impl PeerStatus {
    pub fn new(id: impl Into<String>, hostname: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            hostname: hostname.into(),
            online: true,
            last_seen: Some(Utc::now()),
            ..Self::default()
        }
    }
}

/// Membership snapshot of the overlay network
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NetMap {
    pub self_node: Option<PeerStatus>,
    pub peers: Vec<PeerStatus>,
}

/// First online peer whose hostname carries the runner suffix
pub fn find_runner<'a>(peers: &'a [PeerStatus], suffix: &str) -> Option<&'a PeerStatus> {
    peers
        .iter()
        .find(|p| p.online && p.hostname.ends_with(suffix))
}

/// Fully qualified overlay name of a peer
pub fn peer_fqdn(peer: &PeerStatus, domain: &str) -> String {
    format!("{}.{}", peer.hostname, domain)
}

/// Plain TCP dialing, used when no overlay client is configured
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpDialer;

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(addr).await?;
        let _ = stream.set_nodelay(true);
        Ok(Box::pin(stream))
    }
}
