//! In-process counters included in the debug-info snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Value that can move both ways.
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn set(&self, value: u64) {
        self.0.store(value, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Default)]
pub struct PeerMetrics {
    pub connections_opened: Counter,
    pub connections_closed: Counter,
    pub dials_failed: Counter,
    pub messages_sent: Counter,
    pub messages_received: Counter,
    pub pubsub_published: Counter,
    pub pubsub_received: Counter,
    pub pubsub_rejected: Counter,
    pub heartbeat_failures: Counter,
    pub relay_connections: Gauge,
}

impl PeerMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current values keyed by exported name.
    pub fn snapshot(&self) -> BTreeMap<String, u64> {
        [
            ("connections_opened_total", self.connections_opened.get()),
            ("connections_closed_total", self.connections_closed.get()),
            ("dials_failed_total", self.dials_failed.get()),
            ("messages_sent_total", self.messages_sent.get()),
            ("messages_received_total", self.messages_received.get()),
            ("pubsub_published_total", self.pubsub_published.get()),
            ("pubsub_received_total", self.pubsub_received.get()),
            ("pubsub_rejected_total", self.pubsub_rejected.get()),
            ("heartbeat_failures_total", self.heartbeat_failures.get()),
            ("relay_connections", self.relay_connections.get()),
        ]
        .into_iter()
        .map(|(name, value)| (name.to_string(), value))
        .collect()
    }
}
