//! SSH forwarding from the overlay to the local SSH server.

use std::sync::{Arc, OnceLock};
use tokio::io::copy_bidirectional;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};
use wsnet_common::constants::SERVICE_SSH;
use wsnet_common::{Result, SshConfig};
use wsnet_core::{ConnectionTracker, MeshClient, ServiceTracker, TrackedStream};

pub struct SshService {
    mesh: Arc<dyn MeshClient>,
    config: SshConfig,
    connections: ConnectionTracker,
    services: ServiceTracker,
    cancel: CancellationToken,
    sessions: TaskTracker,
    local_addr: OnceLock<String>,
}

impl SshService {
    pub fn new(
        mesh: Arc<dyn MeshClient>,
        config: SshConfig,
        connections: ConnectionTracker,
        services: ServiceTracker,
    ) -> Self {
        Self {
            mesh,
            config,
            connections,
            services,
            cancel: CancellationToken::new(),
            sessions: TaskTracker::new(),
            local_addr: OnceLock::new(),
        }
    }

    pub fn local_addr(&self) -> Option<&str> {
        self.local_addr.get().map(String::as_str)
    }

    /// Accept overlay SSH connections until `cancel` fires or [`stop`](Self::stop) is called.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let mut listener = self.mesh.listen(self.config.listen_port).await?;
        let _ = self.local_addr.set(listener.local_addr());
        info!(
            addr = %listener.local_addr(),
            target = %self.config.target_addr,
            "SSH forwarding listening"
        );

        loop {
            let (stream, remote) = tokio::select! {
                () = cancel.cancelled() => break,
                () = self.cancel.cancelled() => break,
                res = listener.accept() => match res {
                    Ok(accepted) => accepted,
                    Err(e) => {
                        if self.cancel.is_cancelled() || cancel.is_cancelled() {
                            break;
                        }
                        warn!("SSH accept failed: {}", e);
                        return Err(e.into());
                    }
                },
            };

            let mut inbound = TrackedStream::new(
                stream,
                remote.clone(),
                SERVICE_SSH,
                self.connections.clone(),
                self.services.clone(),
            );
            let evicted = inbound.eviction();
            let target = self.config.target_addr.clone();
            let stop = self.cancel.clone();
            self.sessions.spawn(async move {
                let mut outbound = match TcpStream::connect(&target).await {
                    Ok(stream) => stream,
                    Err(e) => {
                        warn!(remote = %remote, target = %target, "SSH target unreachable: {}", e);
                        return;
                    }
                };
                tokio::select! {
                    res = copy_bidirectional(&mut inbound, &mut outbound) => match res {
                        Ok((up, down)) => debug!(remote = %remote, up, down, "SSH session closed"),
                        Err(e) => debug!(remote = %remote, "SSH session error: {}", e),
                    },
                    () = stop.cancelled() => debug!(remote = %remote, "SSH session aborted"),
                    () = evicted.cancelled() => info!(remote = %remote, "Idle SSH session evicted"),
                }
            });
        }
        debug!("SSH accept loop stopped");
        Ok(())
    }

    /// Stop accepting and close open sessions.
    pub async fn stop(&self) {
        self.cancel.cancel();
        self.sessions.close();
        self.sessions.wait().await;
        info!("SSH forwarding stopped");
    }
}
