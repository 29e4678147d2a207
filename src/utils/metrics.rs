//! Observability and Metrics
//!
//! Session counters: connections, authentication, pool queueing, packets and
//! keep-alives. Every server and client owns its own [`Metrics`]; read them
//! through [`Metrics::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tracing::info;

#[derive(Debug)]
pub struct Metrics {
    connections_accepted: AtomicU64,
    connections_open: AtomicU64,
    auth_attempts: AtomicU64,
    auth_accepted: AtomicU64,
    auth_failed: AtomicU64,
    /// Sessions waiting for a free worker
    sessions_waiting: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    pings: AtomicU64,
    connection_errors: AtomicU64,
    protocol_errors: AtomicU64,
    started: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            connections_accepted: AtomicU64::new(0),
            connections_open: AtomicU64::new(0),
            auth_attempts: AtomicU64::new(0),
            auth_accepted: AtomicU64::new(0),
            auth_failed: AtomicU64::new(0),
            sessions_waiting: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            packets_received: AtomicU64::new(0),
            pings: AtomicU64::new(0),
            connection_errors: AtomicU64::new(0),
            protocol_errors: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn connection_opened(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
        self.connections_open.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_closed(&self) {
        self.connections_open.fetch_sub(1, Ordering::Relaxed);
    }

    /// A token check started; follow with [`auth_accepted`](Self::auth_accepted)
    /// or [`auth_failed`](Self::auth_failed)
    pub fn auth_attempt(&self) {
        self.auth_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_accepted(&self) {
        self.auth_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn auth_failed(&self) {
        self.auth_failed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_queued(&self) {
        self.sessions_waiting.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_dequeued(&self) {
        self.sessions_waiting.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn packet_sent(&self) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn packet_received(&self) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    /// A keep-alive was sent (client) or echoed (server)
    pub fn ping(&self) {
        self.pings.fetch_add(1, Ordering::Relaxed);
    }

    /// Accept or TLS failure before a session could start
    pub fn connection_error(&self) {
        self.connection_errors.fetch_add(1, Ordering::Relaxed);
    }

    /// Session ended by a protocol violation or a rejected token
    pub fn protocol_error(&self) {
        self.protocol_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let load = |counter: &AtomicU64| counter.load(Ordering::Relaxed);
        MetricsSnapshot {
            connections_accepted: load(&self.connections_accepted),
            connections_open: load(&self.connections_open),
            auth_attempts: load(&self.auth_attempts),
            auth_accepted: load(&self.auth_accepted),
            auth_failed: load(&self.auth_failed),
            sessions_waiting: load(&self.sessions_waiting),
            packets_sent: load(&self.packets_sent),
            packets_received: load(&self.packets_received),
            pings: load(&self.pings),
            connection_errors: load(&self.connection_errors),
            protocol_errors: load(&self.protocol_errors),
            uptime: self.started.elapsed(),
        }
    }

    /// Emit the current counters as one `info` event
    pub fn log_summary(&self) {
        let s = self.snapshot();
        info!(
            connections_accepted = s.connections_accepted,
            connections_open = s.connections_open,
            auth_accepted = s.auth_accepted,
            auth_failed = s.auth_failed,
            sessions_waiting = s.sessions_waiting,
            packets_sent = s.packets_sent,
            packets_received = s.packets_received,
            pings = s.pings,
            connection_errors = s.connection_errors,
            protocol_errors = s.protocol_errors,
            uptime_secs = s.uptime.as_secs(),
            "Session metrics"
        );
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Counter values at one point in time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub connections_accepted: u64,
    pub connections_open: u64,
    pub auth_attempts: u64,
    pub auth_accepted: u64,
    pub auth_failed: u64,
    pub sessions_waiting: u64,
    pub packets_sent: u64,
    pub packets_received: u64,
    pub pings: u64,
    pub connection_errors: u64,
    pub protocol_errors: u64,
    pub uptime: Duration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_connections_and_waiting_sessions_are_gauges() {
        let metrics = Metrics::new();
        metrics.connection_opened();
        metrics.connection_opened();
        metrics.session_queued();
        metrics.connection_closed();
        metrics.session_dequeued();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.connections_accepted, 2);
        assert_eq!(snapshot.connections_open, 1);
        assert_eq!(snapshot.sessions_waiting, 0);
    }

    #[test]
    fn auth_outcomes_are_counted_separately() {
        let metrics = Metrics::new();
        for _ in 0..3 {
            metrics.auth_attempt();
        }
        metrics.auth_accepted();
        metrics.auth_failed();

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.auth_attempts, 3);
        assert_eq!(snapshot.auth_accepted, 1);
        assert_eq!(snapshot.auth_failed, 1);
    }
}
