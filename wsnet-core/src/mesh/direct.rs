//! Loopback stand-in for the overlay network.
//!
//! Peers are registered by hand and resolved to socket addresses; overlay
//! ports are bound on a local interface. Used for local runs and tests.

use super::{Dialer, JoinOptions, MeshClient, MeshListener, NetMap, NetworkJoiner, PeerStatus};
use crate::stream::BoxedStream;
use async_trait::async_trait;
use dashmap::DashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use wsnet_common::{NetError, Result, DEFAULT_OVERLAY_DOMAIN};

pub struct DirectNetwork {
    domain: String,
    listen_host: IpAddr,
    /// "host" or "host:port" -> real address
    routes: DashMap<String, SocketAddr>,
    netmap: watch::Sender<NetMap>,
    closed: CancellationToken,
}

impl DirectNetwork {
    pub fn new(hostname: impl Into<String>, domain: impl Into<String>) -> Self {
        let hostname = hostname.into();
        let self_node = PeerStatus::new(format!("self-{hostname}"), hostname);
        let (netmap, _) = watch::channel(NetMap {
            self_node: Some(self_node),
            peers: Vec::new(),
        });
        Self {
            domain: domain.into(),
            listen_host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            routes: DashMap::new(),
            netmap,
            closed: CancellationToken::new(),
        }
    }

    #[must_use]
    pub fn with_listen_host(mut self, host: IpAddr) -> Self {
        self.listen_host = host;
        self
    }

    /// Route dials for `name` (a hostname, or `hostname:port`) to `addr`.
    pub fn route(&self, name: impl Into<String>, addr: SocketAddr) {
        self.routes.insert(name.into(), addr);
    }

    /// Add or replace a peer and publish the new netmap.
    pub fn upsert_peer(&self, peer: PeerStatus, addr: Option<SocketAddr>) {
        if let Some(addr) = addr {
            self.route(peer.hostname.clone(), addr);
        }
        self.netmap.send_modify(|map| {
            map.peers.retain(|p| p.id != peer.id);
            map.peers.push(peer);
        });
    }

    pub fn remove_peer(&self, id: &str) {
        self.netmap.send_modify(|map| {
            map.peers.retain(|p| {
                let keep = p.id != id;
                if !keep {
                    self.routes.remove(&p.hostname);
                }
                keep
            });
        });
    }

    fn resolve(&self, addr: &str) -> io::Result<String> {
        let (host, port) = addr
            .rsplit_once(':')
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "missing port"))?;
        let short = host
            .strip_suffix(&format!(".{}", self.domain))
            .unwrap_or(host);

        if let Some(target) = self.routes.get(&format!("{short}:{port}")) {
            return Ok(target.to_string());
        }
        if let Some(target) = self.routes.get(short) {
            return Ok(target.to_string());
        }
        Ok(format!("{host}:{port}"))
    }
}

impl Default for DirectNetwork {
    fn default() -> Self {
        Self::new("localhost", DEFAULT_OVERLAY_DOMAIN)
    }
}

#[async_trait]
impl Dialer for DirectNetwork {
    async fn dial(&self, addr: &str) -> io::Result<BoxedStream> {
        if self.closed.is_cancelled() {
            return Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "overlay network closed",
            ));
        }
        let target = self.resolve(addr)?;
        debug!(addr = %addr, target = %target, "Direct dial");
        let stream = TcpStream::connect(&target).await?;
        let _ = stream.set_nodelay(true);
        Ok(Box::pin(stream))
    }
}

struct DirectListener {
    listener: TcpListener,
    closed: CancellationToken,
}

#[async_trait]
impl MeshListener for DirectListener {
    async fn accept(&mut self) -> io::Result<(BoxedStream, String)> {
        tokio::select! {
            () = self.closed.cancelled() => Err(io::Error::new(
                io::ErrorKind::NotConnected,
                "overlay network closed",
            )),
            res = self.listener.accept() => {
                let (stream, peer) = res?;
                let _ = stream.set_nodelay(true);
                Ok((Box::pin(stream) as BoxedStream, peer.to_string()))
            }
        }
    }

    fn local_addr(&self) -> String {
        self.listener
            .local_addr()
            .map(|a| a.to_string())
            .unwrap_or_default()
    }
}

#[async_trait]
impl MeshClient for DirectNetwork {
    async fn listen(&self, port: u16) -> io::Result<Box<dyn MeshListener>> {
        let listener = TcpListener::bind((self.listen_host, port)).await?;
        Ok(Box::new(DirectListener {
            listener,
            closed: self.closed.clone(),
        }))
    }

    async fn status(&self) -> Result<NetMap> {
        if self.closed.is_cancelled() {
            return Err(NetError::InvalidState("overlay network closed".into()));
        }
        Ok(self.netmap.borrow().clone())
    }

    fn subscribe(&self) -> watch::Receiver<NetMap> {
        self.netmap.subscribe()
    }

    fn domain(&self) -> &str {
        &self.domain
    }

    async fn close(&self) {
        self.closed.cancel();
    }
}

/// Joins a [`DirectNetwork`] pre-populated with a fixed peer table
#[derive(Default)]
pub struct DirectJoiner {
    domain: Option<String>,
    peers: Vec<(PeerStatus, Option<SocketAddr>)>,
    routes: Vec<(String, SocketAddr)>,
    last_join: Mutex<Option<JoinOptions>>,
}

impl DirectJoiner {
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_domain(mut self, domain: impl Into<String>) -> Self {
        self.domain = Some(domain.into());
        self
    }

    #[must_use]
    pub fn with_peer(mut self, peer: PeerStatus, addr: Option<SocketAddr>) -> Self {
        self.peers.push((peer, addr));
        self
    }

    #[must_use]
    pub fn with_route(mut self, name: impl Into<String>, addr: SocketAddr) -> Self {
        self.routes.push((name.into(), addr));
        self
    }

    /// Options passed to the most recent `join`
    pub fn last_join(&self) -> Option<JoinOptions> {
        self.last_join.lock().ok().and_then(|j| j.clone())
    }
}

#[async_trait]
impl NetworkJoiner for DirectJoiner {
    async fn join(&self, opts: JoinOptions) -> Result<Arc<dyn MeshClient>> {
        if opts.auth_key.is_empty() {
            return Err(NetError::Join("auth key is required".into()));
        }
        let domain = self
            .domain
            .clone()
            .unwrap_or_else(|| DEFAULT_OVERLAY_DOMAIN.to_string());
        let network = DirectNetwork::new(opts.hostname.clone(), domain);
        for (name, addr) in &self.routes {
            network.route(name.clone(), *addr);
        }
        for (peer, addr) in &self.peers {
            network.upsert_peer(peer.clone(), *addr);
        }
        info!(hostname = %opts.hostname, control_url = %opts.control_url, "Joined direct network");
        if let Ok(mut last) = self.last_join.lock() {
            *last = Some(opts);
        }
        Ok(Arc::new(network))
    }
}
