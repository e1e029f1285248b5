//! Connection trackers shared by every inbound service.
//!
//! [`ConnectionTracker`] records individual connections by caller-supplied ID
//! and supports staleness sweeps. [`ServiceTracker`] only counts open
//! connections per service name, which is all the heartbeat gate needs.
//! Readers always get owned copies, never references into the maps.
//!
//! A connection registered with [`ConnectionTracker::track`] holds one count
//! in a [`ServiceTracker`]. The count is released by whichever call removes
//! the entry, so an eviction by the sweep stops gating the heartbeat at once.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// One logical inbound connection
#[derive(Debug, Clone)]
pub struct Connection {
    pub id: String,
    pub remote_addr: String,
    pub service: Option<String>,
    pub start_time: Instant,
    pub last_seen: Instant,
    evicted: CancellationToken,
    services: Option<ServiceTracker>,
}

impl Connection {
    pub fn new(id: impl Into<String>, remote_addr: impl Into<String>) -> Self {
        let now = Instant::now();
        Self {
            id: id.into(),
            remote_addr: remote_addr.into(),
            service: None,
            start_time: now,
            last_seen: now,
            evicted: CancellationToken::new(),
            services: None,
        }
    }

    /// Fires when the sweep drops this connection as stale
    pub fn eviction(&self) -> CancellationToken {
        self.evicted.clone()
    }

    fn release(&self) {
        if let (Some(services), Some(service)) = (&self.services, &self.service) {
            services.remove(service);
        }
    }
}

/// Thread-safe keyed connection store
#[derive(Debug, Clone, Default)]
pub struct ConnectionTracker {
    connections: Arc<DashMap<String, Connection>>,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection. Returns false if the ID is already live.
    pub fn add(&self, id: impl Into<String>, remote_addr: impl Into<String>) -> bool {
        let id = id.into();
        self.insert(Connection::new(id, remote_addr))
    }

    /// Register a connection counted under `service` in `services` until it
    /// is removed or evicted. Returns its eviction token.
    pub fn track(
        &self,
        id: impl Into<String>,
        remote_addr: impl Into<String>,
        service: &str,
        services: &ServiceTracker,
    ) -> CancellationToken {
        let mut conn = Connection::new(id, remote_addr);
        conn.service = Some(service.to_string());
        conn.services = Some(services.clone());
        let evicted = conn.eviction();
        if self.insert(conn) {
            services.add(service);
        }
        evicted
    }

    fn insert(&self, conn: Connection) -> bool {
        match self.connections.entry(conn.id.clone()) {
            Entry::Occupied(_) => false,
            Entry::Vacant(entry) => {
                entry.insert(conn);
                true
            }
        }
    }

    pub fn remove(&self, id: &str) -> Option<Connection> {
        let (_, conn) = self.connections.remove(id)?;
        conn.release();
        Some(conn)
    }

    /// Refresh `last_seen`. Returns false for unknown IDs.
    pub fn update(&self, id: &str) -> bool {
        match self.connections.get_mut(id) {
            Some(mut conn) => {
                conn.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, id: &str) -> Option<Connection> {
        self.connections.get(id).map(|r| r.value().clone())
    }

    /// Snapshot of all live connections
    pub fn list(&self) -> Vec<Connection> {
        self.connections.iter().map(|r| r.value().clone()).collect()
    }

    pub fn count(&self) -> usize {
        self.connections.len()
    }

    /// Remove connections idle for longer than `timeout` and signal their
    /// owners. Returns the number of removed connections.
    pub fn remove_stale(&self, timeout: Duration) -> usize {
        let now = Instant::now();
        let stale: Vec<String> = self
            .list()
            .into_iter()
            .filter(|c| now.duration_since(c.last_seen) > timeout)
            .map(|c| c.id)
            .collect();

        let mut removed = 0;
        for id in stale {
            // Re-check under the shard lock: an update may have landed since the snapshot
            if let Some((_, conn)) = self
                .connections
                .remove_if(&id, |_, c| now.duration_since(c.last_seen) > timeout)
            {
                conn.release();
                conn.evicted.cancel();
                removed += 1;
            }
        }
        removed
    }
}

/// Counts open connections per service name
#[derive(Debug, Clone, Default)]
pub struct ServiceTracker {
    counts: Arc<DashMap<String, usize>>,
}

impl ServiceTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, service: &str) {
        *self.counts.entry(service.to_string()).or_insert(0) += 1;
    }

    pub fn remove(&self, service: &str) {
        if let Entry::Occupied(mut entry) = self.counts.entry(service.to_string()) {
            let count = entry.get_mut();
            *count = count.saturating_sub(1);
            if *count == 0 {
                entry.remove();
            }
        }
    }

    pub fn count(&self, service: &str) -> usize {
        self.counts.get(service).map_or(0, |c| *c)
    }

    /// Sum of open connections across all services
    pub fn total(&self) -> usize {
        self.counts.iter().map(|r| *r.value()).sum()
    }
}
