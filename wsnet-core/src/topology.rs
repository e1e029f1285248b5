//! Overlay membership tracking with throttled snapshot persistence.
//!
//! Netmap updates arrive in bursts. The watcher keeps an in-memory peer
//! table current on every update but writes `netmap.json` at most once per
//! cooldown; consumers poll the file.

use crate::mesh::{MeshClient, NetMap};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use wsnet_common::{NetError, Result, TopologyConfig};

/// Snapshot entry for one overlay peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub addr: String,
    pub last_seen: Option<DateTime<Utc>>,
}

pub struct TopologyWatcher {
    client: Arc<dyn MeshClient>,
    snapshot_path: PathBuf,
    config: TopologyConfig,
    peers: RwLock<HashMap<String, PeerInfo>>,
}

impl TopologyWatcher {
    pub fn new(client: Arc<dyn MeshClient>, root_dir: &Path, config: TopologyConfig) -> Self {
        Self {
            client,
            snapshot_path: config.snapshot_path(root_dir),
            config,
            peers: RwLock::new(HashMap::new()),
        }
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    /// Copy of the current peer table
    pub fn peers(&self) -> Vec<PeerInfo> {
        self.peers
            .read()
            .map(|p| p.values().cloned().collect())
            .unwrap_or_default()
    }

    fn apply(&self, netmap: &NetMap) {
        let table: HashMap<String, PeerInfo> = netmap
            .peers
            .iter()
            .map(|p| {
                let addr = p
                    .addrs
                    .first()
                    .cloned()
                    .unwrap_or_else(|| p.dns_name.clone());
                (
                    p.id.clone(),
                    PeerInfo {
                        id: p.id.clone(),
                        addr,
                        last_seen: p.last_seen,
                    },
                )
            })
            .collect();
        if let Ok(mut peers) = self.peers.write() {
            *peers = table;
        }
    }

    /// Serialize the netmap next to a temp file and rename it into place.
    pub async fn persist(&self, netmap: &NetMap) -> Result<()> {
        let data = serde_json::to_vec_pretty(netmap)
            .map_err(|e| NetError::Serialization(e.to_string()))?;
        let tmp = self.snapshot_path.with_extension("json.tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.snapshot_path).await?;
        Ok(())
    }

    /// Follow netmap changes until cancelled.
    pub async fn run(&self, cancel: CancellationToken) {
        let mut rx: watch::Receiver<NetMap> = self.client.subscribe();
        let mut last_write: Option<Instant> = None;
        info!(path = %self.snapshot_path.display(), "Topology watcher started");

        loop {
            let netmap = rx.borrow_and_update().clone();
            self.apply(&netmap);

            let due = last_write.is_none_or(|t| t.elapsed() >= self.config.cooldown);
            if due {
                match self.persist(&netmap).await {
                    Ok(()) => {
                        last_write = Some(Instant::now());
                        debug!(peers = netmap.peers.len(), "Persisted topology snapshot");
                    }
                    Err(e) => warn!("Failed to persist topology snapshot: {}", e),
                }
            }

            tokio::select! {
                () = cancel.cancelled() => break,
                changed = rx.changed() => {
                    if changed.is_err() {
                        debug!("Netmap stream closed");
                        break;
                    }
                }
            }
        }
        info!("Topology watcher stopped");
    }
}
