//! Daemon subcommand implementation

use anyhow::{Context, Result};
use clap::Args;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use wsnet::{Server, ServerConfig};
use wsnet_common::{
    HeartbeatConfig, PortForwardConfig, PresenceConfig, ProxyConfig, SshConfig, TopologyConfig,
    DEFAULT_OVERLAY_DOMAIN, DEFAULT_PORT_FORWARD_PORT, DEFAULT_SSH_PORT, DEFAULT_SSH_TARGET,
};
use wsnet_core::mesh::{DirectJoiner, PeerStatus};
use wsnet_observability::{init_tracing, shutdown_tracing, LogFormat, TracingConfig};

#[derive(Args, Debug)]
pub struct DaemonArgs {
    /// Workspace access key
    #[arg(long, env = "WSNET_ACCESS_KEY", hide_env_values = true)]
    access_key: String,

    /// Control-plane host
    #[arg(long, env = "WSNET_PLATFORM_HOST")]
    platform_host: String,

    /// Scheme used to reach the control plane
    #[arg(long, default_value = "https", env = "WSNET_PLATFORM_SCHEME")]
    platform_scheme: String,

    /// Overlay hostname of this workspace
    #[arg(long, env = "WSNET_WORKSPACE_HOST")]
    workspace_host: String,

    /// Directory for the rendezvous socket and state
    #[arg(long, default_value = "/var/run/devpod", env = "WSNET_ROOT_DIR")]
    root_dir: PathBuf,

    /// Log format (text or json)
    #[arg(long, default_value = "text", env = "WSNET_LOG_FORMAT")]
    log_format: LogFormat,

    /// OTLP endpoint for span export
    #[arg(long, env = "WSNET_OTLP_ENDPOINT")]
    otlp_endpoint: Option<String>,

    /// Skip the relay reachability probe
    #[arg(long, env = "WSNET_SKIP_RELAY_CHECK")]
    skip_relay_check: bool,

    /// Overlay port of the SSH forwarder
    #[arg(long, default_value_t = DEFAULT_SSH_PORT, env = "WSNET_SSH_PORT")]
    ssh_port: u16,

    /// Local SSH server
    #[arg(long, default_value = DEFAULT_SSH_TARGET, env = "WSNET_SSH_TARGET")]
    ssh_target: String,

    /// Overlay port of the HTTP port forwarder
    #[arg(long, default_value_t = DEFAULT_PORT_FORWARD_PORT, env = "WSNET_PORT_FORWARD_PORT")]
    port_forward_port: u16,

    /// Seconds between heartbeat ticks
    #[arg(long, default_value_t = 10, env = "WSNET_HEARTBEAT_INTERVAL")]
    heartbeat_interval: u64,

    /// Seconds an idle connection is kept in the tracker
    #[arg(long, default_value_t = 90, env = "WSNET_STALE_TIMEOUT")]
    stale_timeout: u64,

    /// Seconds allowed for graceful shutdown
    #[arg(long, default_value_t = 15, env = "WSNET_GRACEFUL_TIMEOUT")]
    graceful_timeout: u64,

    /// Overlay DNS domain
    #[arg(long, default_value = DEFAULT_OVERLAY_DOMAIN, env = "WSNET_DOMAIN")]
    domain: String,

    /// Static peer of the direct network, as `hostname=addr` (repeatable)
    #[arg(long = "runner", value_parser = parse_peer)]
    peers: Vec<(String, SocketAddr)>,
}

fn parse_peer(s: &str) -> std::result::Result<(String, SocketAddr), String> {
    let (host, addr) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid peer '{s}', expected hostname=addr"))?;
    if host.is_empty() {
        return Err(format!("invalid peer '{s}', hostname is empty"));
    }
    let addr = addr
        .parse()
        .map_err(|e| format!("invalid peer address '{addr}': {e}"))?;
    Ok((host.to_string(), addr))
}

impl DaemonArgs {
    fn into_config(self) -> ServerConfig {
        let defaults = HeartbeatConfig::default();
        ServerConfig {
            access_key: self.access_key,
            platform_host: self.platform_host,
            platform_scheme: self.platform_scheme,
            workspace_host: self.workspace_host,
            proxy: ProxyConfig {
                graceful_timeout: Duration::from_secs(self.graceful_timeout),
                ..ProxyConfig::new(&self.root_dir)
            },
            root_dir: self.root_dir,
            log_format: self.log_format,
            client: None,
            relay_check: !self.skip_relay_check,
            ssh: SshConfig {
                listen_port: self.ssh_port,
                target_addr: self.ssh_target,
            },
            port_forward: PortForwardConfig {
                listen_port: self.port_forward_port,
                ..PortForwardConfig::default()
            },
            presence: PresenceConfig {
                interval: Duration::from_secs(self.heartbeat_interval),
                ..PresenceConfig::default()
            },
            heartbeat: HeartbeatConfig {
                timeout: Duration::from_secs(self.stale_timeout),
                ..defaults
            },
            topology: TopologyConfig::default(),
        }
    }
}

pub async fn run(args: DaemonArgs) -> Result<()> {
    init_tracing(TracingConfig {
        service_name: "wsnet".to_string(),
        format: args.log_format,
        otlp_endpoint: args.otlp_endpoint.clone(),
    })?;

    info!("Starting wsnet daemon v{}", env!("CARGO_PKG_VERSION"));

    let mut joiner = DirectJoiner::new().with_domain(args.domain.clone());
    for (host, addr) in &args.peers {
        info!(peer = %host, addr = %addr, "Static peer");
        joiner = joiner.with_peer(PeerStatus::new(host.clone(), host.clone()), Some(*addr));
    }

    let server = Arc::new(
        Server::new(args.into_config(), Arc::new(joiner)).context("invalid daemon configuration")?,
    );

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            cancel.cancel();
        });
    }

    let result = server.start(cancel).await;
    server.stop().await;
    shutdown_tracing();

    if let Err(e) = &result {
        error!("Daemon failed: {}", e);
    }
    result.context("daemon failed")
}

/// Wait for SIGINT or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received Ctrl+C"),
        () = terminate => info!("Received SIGTERM"),
    }
}
