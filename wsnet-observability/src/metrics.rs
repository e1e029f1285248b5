//! Proxy counters backed by Prometheus primitives.
//!
//! Every counter update is a single atomic operation. Each [`ProxyMetrics`]
//! owns its own registry so independent daemons never share counters.

use prometheus::{Encoder, IntCounter, IntGauge, Registry, TextEncoder};
use std::time::Instant;

#[derive(Clone)]
pub struct ProxyMetrics {
    registry: Registry,
    active_connections: IntGauge,
    total_requests: IntCounter,
    failed_requests: IntCounter,
    total_latency_ns: IntCounter,
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub active_connections: i64,
    pub total_requests: u64,
    pub failed_requests: u64,
    pub total_latency_ns: u64,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("wsnet".to_string()), None)
            .expect("static metric prefix is valid");

        let active_connections = IntGauge::new(
            "proxy_active_connections",
            "Tunnels and proxied calls currently open",
        )
        .expect("metric can be created");
        let total_requests =
            IntCounter::new("proxy_requests_total", "Proxied requests and calls")
                .expect("metric can be created");
        let failed_requests = IntCounter::new(
            "proxy_requests_failed_total",
            "Proxied requests and calls that failed",
        )
        .expect("metric can be created");
        let total_latency_ns = IntCounter::new(
            "proxy_latency_nanoseconds_total",
            "Accumulated time spent establishing backend connections",
        )
        .expect("metric can be created");

        registry
            .register(Box::new(active_connections.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(total_requests.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(failed_requests.clone()))
            .expect("metric can be registered");
        registry
            .register(Box::new(total_latency_ns.clone()))
            .expect("metric can be registered");

        Self {
            registry,
            active_connections,
            total_requests,
            failed_requests,
            total_latency_ns,
        }
    }

    /// Record the start of a request; the returned timer tracks its lifetime.
    pub fn start_request(&self) -> RequestTimer {
        self.total_requests.inc();
        self.active_connections.inc();
        RequestTimer {
            metrics: self.clone(),
            started: Instant::now(),
            recorded: false,
        }
    }

    pub fn record_failure(&self) {
        self.failed_requests.inc();
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            active_connections: self.active_connections.get(),
            total_requests: self.total_requests.get(),
            failed_requests: self.failed_requests.get(),
            total_latency_ns: self.total_latency_ns.get(),
        }
    }

    /// Render all counters in Prometheus text format
    pub fn gather(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            tracing::error!("Failed to encode metrics: {}", e);
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}

impl Default for ProxyMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ProxyMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyMetrics")
            .field("snapshot", &self.snapshot())
            .finish()
    }
}

/// Keeps a request counted as active until dropped
pub struct RequestTimer {
    metrics: ProxyMetrics,
    started: Instant,
    recorded: bool,
}

impl RequestTimer {
    /// Add the elapsed time since the request started to the latency total.
    pub fn record_latency(&mut self) {
        if !self.recorded {
            let ns = u64::try_from(self.started.elapsed().as_nanos()).unwrap_or(u64::MAX);
            self.metrics.total_latency_ns.inc_by(ns);
            self.recorded = true;
        }
    }

    pub fn fail(&self) {
        self.metrics.record_failure();
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        self.metrics.active_connections.dec();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_lifecycle() {
        let metrics = ProxyMetrics::new();
        {
            let mut timer = metrics.start_request();
            assert_eq!(metrics.snapshot().active_connections, 1);
            timer.record_latency();
            timer.fail();
        }
        let snap = metrics.snapshot();
        assert_eq!(snap.active_connections, 0);
        assert_eq!(snap.total_requests, 1);
        assert_eq!(snap.failed_requests, 1);
    }

    #[test]
    fn test_instances_are_independent() {
        let a = ProxyMetrics::new();
        let b = ProxyMetrics::new();
        let _t = a.start_request();
        assert_eq!(a.snapshot().total_requests, 1);
        assert_eq!(b.snapshot().total_requests, 0);
    }

    #[test]
    fn test_gather_text_format() {
        let metrics = ProxyMetrics::new();
        drop(metrics.start_request());
        let text = metrics.gather();
        assert!(text.contains("wsnet_proxy_requests_total 1"));
        assert!(text.contains("wsnet_proxy_active_connections 0"));
    }
}
