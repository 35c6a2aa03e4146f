//! Observability and Metrics
//!
//! Atomic counters for protocol activity. Every connection carries its own
//! [`Metrics`]; server-wide connection counts go to the global instance.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tracing::{debug, info};

#[derive(Debug)]
pub struct Metrics {
    /// Total connections established
    pub connections_total: AtomicU64,
    /// Currently active connections
    pub connections_active: AtomicU64,
    /// Requests answered by this side
    pub requests_served: AtomicU64,
    /// Requests issued by this side
    pub requests_sent: AtomicU64,
    /// Requests answered with a fault
    pub faults_returned: AtomicU64,
    /// Proxies constructed for remote references
    pub proxies_created: AtomicU64,
    /// Identities released towards the peer
    pub decrefs_sent: AtomicU64,
    /// Identities released by the peer
    pub decrefs_received: AtomicU64,
    /// Outermost stream redirections installed on the peer
    pub redirections_installed: AtomicU64,
    /// Total bytes sent
    pub bytes_sent: AtomicU64,
    /// Total bytes received
    pub bytes_received: AtomicU64,
    /// Payloads sent compressed
    pub compression_total: AtomicU64,
    /// Connection errors
    pub connection_errors: AtomicU64,
    /// Protocol errors
    pub protocol_errors: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            requests_served: AtomicU64::new(0),
            requests_sent: AtomicU64::new(0),
            faults_returned: AtomicU64::new(0),
            proxies_created: AtomicU64::new(0),
            decrefs_sent: AtomicU64::new(0),
            decrefs_received: AtomicU64::new(0),
            redirections_installed: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            compression_total: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    pub fn connection_established(&self) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_active.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn request_served(&self) {
        self.requests_served.fetch_add(1, Ordering::Relaxed);
    }

    pub fn request_sent(&self) {
        self.requests_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn fault_returned(&self) {
        self.faults_returned.fetch_add(1, Ordering::Relaxed);
    }

    pub fn proxy_created(&self) {
        self.proxies_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decrefs_sent(&self, count: u64) {
        self.decrefs_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn decrefs_received(&self, count: u64) {
        self.decrefs_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn redirection_installed(&self) {
        self.redirections_installed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self, count: u64) {
        self.bytes_sent.fetch_add(count, Ordering::Relaxed);
    }

    pub fn bytes_received(&self, count: u64) {
        self.bytes_received.fetch_add(count, Ordering::Relaxed);
    }

    pub fn compression_applied(&self) {
        self.compression_total.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            connections_total: self.connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            requests_served: self.requests_served.load(Ordering::Relaxed),
            requests_sent: self.requests_sent.load(Ordering::Relaxed),
            faults_returned: self.faults_returned.load(Ordering::Relaxed),
            proxies_created: self.proxies_created.load(Ordering::Relaxed),
            decrefs_sent: self.decrefs_sent.load(Ordering::Relaxed),
            decrefs_received: self.decrefs_received.load(Ordering::Relaxed),
            redirections_installed: self.redirections_installed.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            compression_total: self.compression_total.load(Ordering::Relaxed),
            connection_errors: self.connection_errors.load(Ordering::Relaxed),
            protocol_errors: self.protocol_errors.load(Ordering::Relaxed),
            uptime_seconds: self.start_time.elapsed().as_secs(),
        }
    }

    pub fn log_metrics(&self) {
        let snapshot = self.snapshot();
        info!(
            connections_total = snapshot.connections_total,
            connections_active = snapshot.connections_active,
            requests_served = snapshot.requests_served,
            requests_sent = snapshot.requests_sent,
            faults_returned = snapshot.faults_returned,
            proxies_created = snapshot.proxies_created,
            decrefs_sent = snapshot.decrefs_sent,
            decrefs_received = snapshot.decrefs_received,
            redirections_installed = snapshot.redirections_installed,
            bytes_sent = snapshot.bytes_sent,
            bytes_received = snapshot.bytes_received,
            connection_errors = snapshot.connection_errors,
            protocol_errors = snapshot.protocol_errors,
            uptime_seconds = snapshot.uptime_seconds,
            "Protocol metrics snapshot"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_total: u64,
    pub connections_active: u64,
    pub requests_served: u64,
    pub requests_sent: u64,
    pub faults_returned: u64,
    pub proxies_created: u64,
    pub decrefs_sent: u64,
    pub decrefs_received: u64,
    pub redirections_installed: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub compression_total: u64,
    pub connection_errors: u64,
    pub protocol_errors: u64,
    pub uptime_seconds: u64,
}

static METRICS: once_cell::sync::Lazy<Metrics> = once_cell::sync::Lazy::new(Metrics::new);

/// Process-wide metrics instance
pub fn global_metrics() -> &'static Metrics {
    &METRICS
}

/// Logs the duration of a request when dropped.
pub struct Timer {
    start: Instant,
    operation: &'static str,
}

impl Timer {
    pub fn start(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        debug!(
            operation = self.operation,
            duration_us = self.start.elapsed().as_micros() as u64,
            "Request completed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_snapshot() {
        let metrics = Metrics::new();
        metrics.connection_established();
        metrics.request_sent();
        metrics.decrefs_sent(3);
        metrics.connection_closed();
        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_total, 1);
        assert_eq!(snapshot.connections_active, 0);
        assert_eq!(snapshot.requests_sent, 1);
        assert_eq!(snapshot.decrefs_sent, 3);
    }
}
