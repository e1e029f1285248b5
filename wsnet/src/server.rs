//! The daemon orchestrator.
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//! use wsnet::{Server, ServerConfig};
//! use wsnet_core::mesh::DirectJoiner;
//!
//! # async fn example() -> wsnet::Result<()> {
//! let config = ServerConfig {
//!     access_key: "key".into(),
//!     platform_host: "platform.example.com".into(),
//!     workspace_host: "node.ws.proj.ts.loft".into(),
//!     ..ServerConfig::default()
//! };
//! let server = Server::new(config, Arc::new(DirectJoiner::new()))?;
//! let cancel = CancellationToken::new();
//! server.start(cancel).await?;
//! server.stop().await;
//! # Ok(())
//! # }
//! ```

use crate::config::{ServerConfig, WorkspaceIdentity};
use crate::heartbeat::HeartbeatService;
use crate::ssh::SshService;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};
use wsnet_common::constants::DEFAULT_REQUEST_TIMEOUT;
use wsnet_common::{NetError, Result};
use wsnet_core::mesh::JoinOptions;
use wsnet_core::topology::PeerInfo;
use wsnet_core::{
    BoxedStream, ConnectionMonitor, ConnectionTracker, Dialer, MeshClient, NetworkJoiner,
    ServiceTracker, TopologyWatcher,
};
use wsnet_http::{
    ControlPlane, CredentialRelay, Director, GrpcProxyServer, HttpProxyServer,
    NetworkProxyService, PortForwardService, ProxyHandler,
};
use wsnet_observability::ProxyMetrics;

/// Services owning a listener, torn down by [`Server::stop`]
struct Components {
    ssh: Arc<SshService>,
    port_forward: Arc<PortForwardService>,
    network_proxy: Arc<NetworkProxyService>,
    topology: Arc<TopologyWatcher>,
}

pub struct Server {
    config: ServerConfig,
    identity: WorkspaceIdentity,
    joiner: Arc<dyn NetworkJoiner>,
    mesh: OnceLock<Arc<dyn MeshClient>>,
    components: OnceLock<Components>,
    connections: ConnectionTracker,
    services: ServiceTracker,
    metrics: ProxyMetrics,
    started: AtomicBool,
    shutdown: CancellationToken,
    tasks: TaskTracker,
}

impl Server {
    /// Validate `config` and parse the workspace identity.
    pub fn new(config: ServerConfig, joiner: Arc<dyn NetworkJoiner>) -> Result<Self> {
        config.validate()?;
        let identity = WorkspaceIdentity::parse(&config.workspace_host)?;
        Ok(Self {
            config,
            identity,
            joiner,
            mesh: OnceLock::new(),
            components: OnceLock::new(),
            connections: ConnectionTracker::new(),
            services: ServiceTracker::new(),
            metrics: ProxyMetrics::new(),
            started: AtomicBool::new(false),
            shutdown: CancellationToken::new(),
            tasks: TaskTracker::new(),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn identity(&self) -> &WorkspaceIdentity {
        &self.identity
    }

    pub fn connections(&self) -> &ConnectionTracker {
        &self.connections
    }

    pub fn services(&self) -> &ServiceTracker {
        &self.services
    }

    pub fn metrics(&self) -> &ProxyMetrics {
        &self.metrics
    }

    /// Path of the rendezvous socket
    pub fn socket_path(&self) -> PathBuf {
        self.config.proxy_config().socket_path()
    }

    /// Last known overlay peers
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.components
            .get()
            .map(|c| c.topology.peers())
            .unwrap_or_default()
    }

    /// Overlay address of the SSH listener, once bound
    pub fn ssh_addr(&self) -> Option<&str> {
        self.components.get().and_then(|c| c.ssh.local_addr())
    }

    /// Overlay address of the port-forward listener, once bound
    pub fn port_forward_addr(&self) -> Option<&str> {
        self.components.get().and_then(|c| c.port_forward.local_addr())
    }

    /// Join the overlay network, start every service and run until `cancel` fires.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(NetError::InvalidState("server already started".into()));
        }
        self.config.validate()?;

        info!("Starting workspace network daemon");
        info!("  Workspace: {}/{}", self.identity.project, self.identity.workspace);
        info!("  Control URL: {}", self.config.control_url());
        info!("  Root dir: {}", self.config.root_dir.display());

        if self.config.relay_check {
            self.check_relay().await?;
        }

        let mesh = self
            .joiner
            .join(JoinOptions {
                hostname: self.config.workspace_host.clone(),
                control_url: self.config.control_url(),
                auth_key: self.config.access_key.clone(),
                ephemeral: true,
                state_dir: self.config.state_dir(),
            })
            .await?;
        let _ = self.mesh.set(mesh.clone());
        info!(hostname = %self.config.workspace_host, "Joined overlay network");

        let control = ControlPlane::new(
            mesh.clone(),
            self.config.access_key.clone(),
            self.identity.project.clone(),
            self.identity.workspace.clone(),
        );
        let components = self.build_components(&mesh, control.clone());
        let heartbeat = Arc::new(HeartbeatService::new(
            control,
            self.services.clone(),
            self.config.presence.clone(),
        ));
        let monitor = Arc::new(ConnectionMonitor::new(
            self.connections.clone(),
            self.config.heartbeat,
        )?);

        let run = self.shutdown.child_token();
        {
            let ssh = components.ssh.clone();
            let token = run.clone();
            self.spawn_service("ssh", async move { ssh.start(token).await });
        }
        {
            let port_forward = components.port_forward.clone();
            let token = run.clone();
            self.spawn_service("port-forward", async move { port_forward.start(token).await });
        }
        {
            let network_proxy = components.network_proxy.clone();
            let token = run.clone();
            self.spawn_service("network-proxy", async move { network_proxy.start(token).await });
        }
        {
            let token = run.clone();
            self.spawn_service("heartbeat", async move {
                heartbeat.run(token).await;
                Ok(())
            });
        }
        {
            let token = run.clone();
            self.spawn_service("connection-monitor", async move {
                monitor.run(token).await;
                Ok(())
            });
        }
        {
            let topology = components.topology.clone();
            let token = run.clone();
            self.spawn_service("topology", async move {
                topology.run(token).await;
                Ok(())
            });
        }
        let _ = self.components.set(components);

        info!("Daemon started");
        tokio::select! {
            () = cancel.cancelled() => info!("Daemon shutdown requested"),
            () = self.shutdown.cancelled() => debug!("Daemon stopped before cancellation"),
        }
        run.cancel();
        Ok(())
    }

    fn build_components(&self, mesh: &Arc<dyn MeshClient>, control: ControlPlane) -> Components {
        let proxy_config = self.config.proxy_config();
        let dialer: Arc<dyn Dialer> = mesh.clone();

        let director = Director::new(dialer.clone(), self.metrics.clone())
            .with_dial_timeout(proxy_config.dial_timeout);
        let handler = ProxyHandler::new(Some(dialer), self.metrics.clone())
            .with_credential_relay(CredentialRelay::new(control))
            .with_dial_timeout(proxy_config.dial_timeout);
        let network_proxy = NetworkProxyService::new(
            proxy_config,
            Arc::new(GrpcProxyServer::new(director)),
            Arc::new(HttpProxyServer::new(handler)),
        )
        .with_trackers(self.connections.clone(), self.services.clone());

        Components {
            ssh: Arc::new(SshService::new(
                mesh.clone(),
                self.config.ssh.clone(),
                self.connections.clone(),
                self.services.clone(),
            )),
            port_forward: Arc::new(PortForwardService::new(
                mesh.clone(),
                self.config.port_forward.clone(),
                self.connections.clone(),
                self.services.clone(),
                self.metrics.clone(),
            )),
            network_proxy: Arc::new(network_proxy),
            topology: Arc::new(TopologyWatcher::new(
                mesh.clone(),
                &self.config.root_dir,
                self.config.topology.clone(),
            )),
        }
    }

    fn spawn_service<F>(&self, name: &'static str, fut: F)
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        self.tasks.spawn(async move {
            match fut.await {
                Ok(()) => debug!(service = name, "Service exited"),
                Err(e) => error!(service = name, "Service failed: {}", e),
            }
        });
    }

    async fn check_relay(&self) -> Result<()> {
        let url = self.config.relay_probe_url();
        let client = match &self.config.client {
            Some(client) => client.clone(),
            None => reqwest::Client::builder()
                .timeout(DEFAULT_REQUEST_TIMEOUT)
                .build()
                .map_err(|e| NetError::Http(e.to_string()))?,
        };

        let res = client
            .get(&url)
            .send()
            .await
            .map_err(|e| NetError::RelayUnreachable {
                url: url.clone(),
                reason: e.to_string(),
            })?;
        if !res.status().is_success() {
            return Err(NetError::RelayUnreachable {
                url,
                reason: format!("status {}", res.status()),
            });
        }
        debug!(url = %url, "Relay reachable");
        Ok(())
    }

    /// Stop the listening services, then close the overlay network.
    ///
    /// Safe to call more than once and before [`start`](Self::start).
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(components) = self.components.get() {
            components.ssh.stop().await;
            components.port_forward.stop().await;
            components.network_proxy.stop().await;
        }
        if let Some(mesh) = self.mesh.get() {
            mesh.close().await;
        }

        self.tasks.close();
        let graceful = self.config.proxy.graceful_timeout;
        if tokio::time::timeout(graceful, self.tasks.wait()).await.is_err() {
            warn!(timeout = ?graceful, "Background tasks did not finish in time");
        }
        info!("Daemon stopped");
    }

    /// Healthy once the overlay network has been joined
    pub fn health(&self) -> Result<()> {
        match self.mesh.get() {
            Some(_) => Ok(()),
            None => Err(NetError::InvalidState("overlay network not joined".into())),
        }
    }

    /// Dial `addr` over the overlay network.
    pub async fn dial(&self, addr: &str) -> Result<BoxedStream> {
        let mesh = self
            .mesh
            .get()
            .ok_or_else(|| NetError::InvalidState("overlay network not joined".into()))?;
        mesh.dial(addr).await.map_err(|source| NetError::Dial {
            addr: addr.to_string(),
            source,
        })
    }
}
