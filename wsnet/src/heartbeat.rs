//! Presence notifications to the control plane.
//!
//! While any gated service has open connections the daemon tells the runner
//! that the workspace is in use. Idle workspaces send nothing.

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{HeaderMap, Method, StatusCode};
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use wsnet_common::{NetError, PresenceConfig, Result};
use wsnet_core::ServiceTracker;
use wsnet_http::ControlPlane;

/// Runner endpoint receiving heartbeats
const HEARTBEAT_LEAF: &str = "heartbeat";

pub struct HeartbeatService {
    control: ControlPlane,
    services: ServiceTracker,
    config: PresenceConfig,
}

impl HeartbeatService {
    pub fn new(control: ControlPlane, services: ServiceTracker, config: PresenceConfig) -> Self {
        let control = control.with_request_timeout(config.request_timeout);
        Self {
            control,
            services,
            config,
        }
    }

    /// Open connections across the gated services
    pub fn active_connections(&self) -> usize {
        self.config
            .services
            .iter()
            .map(|service| self.services.count(service))
            .sum()
    }

    /// Send one heartbeat. Anything but `200 OK` is a failure.
    pub async fn send_heartbeat(&self) -> Result<()> {
        let res = self
            .control
            .send(Method::GET, HEARTBEAT_LEAF, &HeaderMap::new(), Empty::<Bytes>::new())
            .await?;
        if res.status() != StatusCode::OK {
            return Err(NetError::Http(format!(
                "heartbeat rejected with status {}",
                res.status()
            )));
        }
        Ok(())
    }

    /// One tick: send a heartbeat unless the workspace is idle.
    ///
    /// Returns whether a heartbeat was attempted.
    pub async fn tick(&self) -> bool {
        let active = self.active_connections();
        if active == 0 {
            debug!("No active connections, skipping heartbeat");
            return false;
        }
        match self.send_heartbeat().await {
            Ok(()) => debug!(active, "Heartbeat sent"),
            Err(e) => warn!(active, "Heartbeat failed: {}", e),
        }
        true
    }

    /// Tick every `interval` until cancelled, also mid-request.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut ticker = interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = ticker.tick() => {}
            }
            tokio::select! {
                () = cancel.cancelled() => break,
                _ = self.tick() => {}
            }
        }
        debug!("Heartbeat service stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::body::Incoming;
    use hyper::server::conn::http1;
    use hyper::service::service_fn;
    use hyper::{Request, Response};
    use hyper_util::rt::TokioIo;
    use std::convert::Infallible;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::net::TcpListener;
    use wsnet_common::constants::SERVICE_SSH;
    use wsnet_core::mesh::PeerStatus;
    use wsnet_core::DirectNetwork;

    /// Runner stub answering every request with `status`
    async fn runner(status: StatusCode) -> (std::net::SocketAddr, Arc<AtomicUsize>, Arc<std::sync::Mutex<Vec<String>>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let seen = Arc::new(std::sync::Mutex::new(Vec::new()));
        let (hits_task, seen_task) = (hits.clone(), seen.clone());
        tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else { return };
                let hits = hits_task.clone();
                let seen = seen_task.clone();
                tokio::spawn(async move {
                    let service = service_fn(move |req: Request<Incoming>| {
                        hits.fetch_add(1, Ordering::SeqCst);
                        let auth = req
                            .headers()
                            .get("authorization")
                            .and_then(|v| v.to_str().ok())
                            .unwrap_or_default()
                            .to_string();
                        seen.lock().unwrap().push(format!("{} {}", req.uri().path(), auth));
                        async move {
                            let mut res = Response::new(Empty::<Bytes>::new());
                            *res.status_mut() = status;
                            Ok::<_, Infallible>(res)
                        }
                    });
                    let _ = http1::Builder::new()
                        .serve_connection(TokioIo::new(stream), service)
                        .await;
                });
            }
        });
        (addr, hits, seen)
    }

    fn service(addr: std::net::SocketAddr, services: ServiceTracker) -> HeartbeatService {
        let mesh = Arc::new(DirectNetwork::new("node", "ts.loft"));
        mesh.upsert_peer(PeerStatus::new("r1", "eu-runner"), Some(addr));
        let control = ControlPlane::new(mesh, "secret", "proj", "ws");
        HeartbeatService::new(control, services, PresenceConfig::default())
    }

    #[tokio::test]
    async fn test_idle_workspace_sends_nothing() {
        let (addr, hits, _) = runner(StatusCode::OK).await;
        let heartbeat = service(addr, ServiceTracker::new());

        assert!(!heartbeat.tick().await);
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_active_workspace_sends_heartbeat() {
        let (addr, hits, seen) = runner(StatusCode::OK).await;
        let services = ServiceTracker::new();
        services.add(SERVICE_SSH);
        let heartbeat = service(addr, services);

        assert!(heartbeat.tick().await);
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(
            seen.lock().unwrap().as_slice(),
            ["/devpod/proj/ws/heartbeat Bearer secret"]
        );
    }

    #[tokio::test]
    async fn test_non_ok_status_is_failure() {
        let (addr, _, _) = runner(StatusCode::NO_CONTENT).await;
        let heartbeat = service(addr, ServiceTracker::new());
        assert!(matches!(heartbeat.send_heartbeat().await, Err(NetError::Http(_))));
    }

    #[tokio::test]
    async fn test_ungated_services_do_not_count() {
        let (addr, _, _) = runner(StatusCode::OK).await;
        let services = ServiceTracker::new();
        services.add("network-proxy");
        let heartbeat = service(addr, services);
        assert_eq!(heartbeat.active_connections(), 0);
    }

    #[tokio::test]
    async fn test_run_exits_on_cancel() {
        let (addr, _, _) = runner(StatusCode::OK).await;
        let heartbeat = Arc::new(service(addr, ServiceTracker::new()));
        let cancel = CancellationToken::new();
        let task = {
            let heartbeat = heartbeat.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { heartbeat.run(cancel).await })
        };
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
