//! Relay statistics

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Engine-wide counters
#[derive(Debug)]
pub struct RelayStats {
    start_time: Instant,

    pub packets_to_client: AtomicU64,
    pub bytes_to_client: AtomicU64,
    pub bytes_to_upstream: AtomicU64,

    pub flows_opened: AtomicU64,
    pub flows_closed: AtomicU64,

    pub fins_sent: AtomicU64,
    pub rsts_sent: AtomicU64,
    pub echo_replies: AtomicU64,
    pub poll_errors: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            packets_to_client: AtomicU64::new(0),
            bytes_to_client: AtomicU64::new(0),
            bytes_to_upstream: AtomicU64::new(0),
            flows_opened: AtomicU64::new(0),
            flows_closed: AtomicU64::new(0),
            fins_sent: AtomicU64::new(0),
            rsts_sent: AtomicU64::new(0),
            echo_replies: AtomicU64::new(0),
            poll_errors: AtomicU64::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn record_to_client(&self, bytes: usize) {
        self.packets_to_client.fetch_add(1, Ordering::Relaxed);
        self.bytes_to_client.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_to_upstream(&self, bytes: usize) {
        self.bytes_to_upstream.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_flow_opened(&self) {
        self.flows_opened.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_flow_closed(&self) {
        self.flows_closed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_fin(&self) {
        self.fins_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_rst(&self) {
        self.rsts_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_echo_reply(&self) {
        self.echo_replies.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_poll_error(&self) {
        self.poll_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime: self.uptime(),
            packets_to_client: self.packets_to_client.load(Ordering::Relaxed),
            bytes_to_client: self.bytes_to_client.load(Ordering::Relaxed),
            bytes_to_upstream: self.bytes_to_upstream.load(Ordering::Relaxed),
            flows_opened: self.flows_opened.load(Ordering::Relaxed),
            flows_closed: self.flows_closed.load(Ordering::Relaxed),
            fins_sent: self.fins_sent.load(Ordering::Relaxed),
            rsts_sent: self.rsts_sent.load(Ordering::Relaxed),
            echo_replies: self.echo_replies.load(Ordering::Relaxed),
            poll_errors: self.poll_errors.load(Ordering::Relaxed),
        }
    }
}

impl Default for RelayStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Point-in-time copy of the counters
#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub uptime: Duration,
    pub packets_to_client: u64,
    pub bytes_to_client: u64,
    pub bytes_to_upstream: u64,
    pub flows_opened: u64,
    pub flows_closed: u64,
    pub fins_sent: u64,
    pub rsts_sent: u64,
    pub echo_replies: u64,
    pub poll_errors: u64,
}

impl StatsSnapshot {
    pub fn active_flows(&self) -> u64 {
        self.flows_opened.saturating_sub(self.flows_closed)
    }
}
