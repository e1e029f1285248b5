//! The rendezvous socket service.
//!
//! One Unix socket carries both gRPC and HTTP. The [`Mux`] classifies each
//! connection and feeds one of two [`MuxServer`]s. Startup and shutdown of
//! all three are coordinated here.

use crate::sniff::{Mux, RouteListener};
use async_trait::async_trait;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::UnixListener;
use tokio::sync::{mpsc, OnceCell};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use wsnet_common::{NetError, ProxyConfig, Result};
use wsnet_core::{ConnectionTracker, ServiceTracker};

/// A server fed by one route of the multiplexer
#[async_trait]
pub trait MuxServer: Send + Sync {
    fn name(&self) -> &'static str;

    /// Serve connections from `listener` until it closes or the server is shut down.
    async fn serve(&self, listener: RouteListener) -> Result<()>;

    /// Stop accepting and let open connections finish.
    async fn shutdown(&self);
}

pub struct NetworkProxyService {
    config: ProxyConfig,
    grpc: Arc<dyn MuxServer>,
    http: Arc<dyn MuxServer>,
    trackers: Option<(ConnectionTracker, ServiceTracker)>,
    mux_cancel: CancellationToken,
    stopped: OnceCell<()>,
}

impl NetworkProxyService {
    pub fn new(config: ProxyConfig, grpc: Arc<dyn MuxServer>, http: Arc<dyn MuxServer>) -> Self {
        Self {
            config,
            grpc,
            http,
            trackers: None,
            mux_cancel: CancellationToken::new(),
            stopped: OnceCell::new(),
        }
    }

    #[must_use]
    pub fn with_trackers(mut self, connections: ConnectionTracker, services: ServiceTracker) -> Self {
        self.trackers = Some((connections, services));
        self
    }

    pub fn socket_path(&self) -> PathBuf {
        self.config.socket_path()
    }

    fn bind(&self) -> Result<UnixListener> {
        let path = self.socket_path();
        match std::fs::remove_file(&path) {
            Ok(()) => debug!(path = %path.display(), "Removed stale socket"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let listener = UnixListener::bind(&path)?;
        set_world_accessible(&path)?;
        Ok(listener)
    }

    /// Serve the rendezvous socket until `cancel` fires or a server fails.
    ///
    /// Always stops every component before returning.
    pub async fn start(&self, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind()?;
        info!(path = %self.socket_path().display(), "Network proxy listening");

        let (mux, grpc_listener, http_listener) = Mux::new(listener, &self.config);
        let mux = match &self.trackers {
            Some((connections, services)) => mux.with_trackers(connections.clone(), services.clone()),
            None => mux,
        };

        // Best effort: only the first failure matters
        let (err_tx, mut err_rx) = mpsc::channel::<NetError>(3);
        let mut tasks = Vec::with_capacity(3);
        for (server, route_listener) in [
            (self.grpc.clone(), grpc_listener),
            (self.http.clone(), http_listener),
        ] {
            let err_tx = err_tx.clone();
            tasks.push(tokio::spawn(async move {
                match server.serve(route_listener).await {
                    Ok(()) => debug!(server = server.name(), "Server exited"),
                    Err(e) if e.is_closed() => debug!(server = server.name(), "Server closed"),
                    Err(e) => {
                        error!(server = server.name(), "Server failed: {}", e);
                        let _ = err_tx.try_send(e);
                    }
                }
            }));
        }
        {
            let err_tx = err_tx.clone();
            let mux_cancel = self.mux_cancel.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = mux.serve(mux_cancel).await {
                    let e = NetError::from(e);
                    if !e.is_closed() {
                        error!("Multiplexer failed: {}", e);
                        let _ = err_tx.try_send(e);
                    }
                }
            }));
        }
        drop(err_tx);

        let failure = tokio::select! {
            () = cancel.cancelled() => None,
            err = err_rx.recv() => err,
        };

        self.stop().await;
        for task in tasks {
            let _ = task.await;
        }

        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Stop both servers, then close the listener and remove the socket file.
    ///
    /// Graceful shutdown is bounded by the configured timeout. Concurrent and
    /// repeated calls wait for the same single shutdown.
    pub async fn stop(&self) {
        self.stopped
            .get_or_init(|| async {
                let graceful = async {
                    tokio::join!(self.grpc.shutdown(), self.http.shutdown());
                };
                if tokio::time::timeout(self.config.graceful_timeout, graceful)
                    .await
                    .is_err()
                {
                    warn!(
                        timeout = ?self.config.graceful_timeout,
                        "Graceful shutdown timed out, forcing close"
                    );
                }

                self.mux_cancel.cancel();
                match std::fs::remove_file(self.socket_path()) {
                    Ok(()) => {}
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => warn!("Failed to remove socket file: {}", e),
                }
                info!("Network proxy stopped");
            })
            .await;
    }
}

#[cfg(unix)]
fn set_world_accessible(path: &std::path::Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o777))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    /// Serves nothing; shutdown blocks unless configured otherwise
    struct FakeServer {
        name: &'static str,
        hang_on_shutdown: bool,
        stop: CancellationToken,
    }

    impl FakeServer {
        fn new(name: &'static str, hang_on_shutdown: bool) -> Arc<Self> {
            Arc::new(Self {
                name,
                hang_on_shutdown,
                stop: CancellationToken::new(),
            })
        }
    }

    #[async_trait]
    impl MuxServer for FakeServer {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn serve(&self, mut listener: RouteListener) -> Result<()> {
            loop {
                tokio::select! {
                    () = self.stop.cancelled() => return Ok(()),
                    res = listener.accept() => if res.is_err() { return Ok(()) },
                }
            }
        }

        async fn shutdown(&self) {
            if self.hang_on_shutdown {
                std::future::pending::<()>().await;
            }
            self.stop.cancel();
        }
    }

    #[tokio::test]
    async fn test_socket_is_world_accessible_and_removed() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(NetworkProxyService::new(
            ProxyConfig::new(dir.path()),
            FakeServer::new("grpc", false),
            FakeServer::new("http", false),
        ));
        // Stale file from a previous run
        std::fs::write(service.socket_path(), b"").unwrap();

        let cancel = CancellationToken::new();
        let task = {
            let service = service.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { service.start(cancel).await })
        };

        let path = service.socket_path();
        for _ in 0..100 {
            if tokio::net::UnixStream::connect(&path).await.is_ok() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o777);

        cancel.cancel();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_is_bounded_when_shutdown_hangs() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProxyConfig::new(dir.path());
        let service = Arc::new(NetworkProxyService::new(
            config,
            FakeServer::new("grpc", false),
            FakeServer::new("http", true),
        ));
        let listener = service.bind().unwrap();
        drop(listener);
        assert!(service.socket_path().exists());

        let started = tokio::time::Instant::now();
        service.stop().await;
        assert!(started.elapsed() <= Duration::from_secs(16));
        assert!(!service.socket_path().exists());

        // Second call returns immediately
        service.stop().await;
    }

    #[tokio::test]
    async fn test_concurrent_stops() {
        let dir = tempfile::tempdir().unwrap();
        let service = Arc::new(NetworkProxyService::new(
            ProxyConfig::new(dir.path()),
            FakeServer::new("grpc", false),
            FakeServer::new("http", false),
        ));
        let a = tokio::spawn({
            let service = service.clone();
            async move { service.stop().await }
        });
        let b = tokio::spawn({
            let service = service.clone();
            async move { service.stop().await }
        });
        a.await.unwrap();
        b.await.unwrap();
    }
}
