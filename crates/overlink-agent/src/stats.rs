//! Traffic counters reported in heartbeats

use overlink_proto::TrafficStats;
use std::sync::atomic::{AtomicU64, Ordering};

/// Lock-free counters shared between the relay loop and the heartbeat.
#[derive(Debug, Default)]
pub struct TrafficCounters {
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    errors: AtomicU64,
    drops: AtomicU64,
}

impl TrafficCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
        self.packets_received.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_error(&self) {
        self.errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_drop(&self) {
        self.drops.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> TrafficStats {
        TrafficStats {
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            drops: self.drops.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_reflects_counts() {
        let counters = TrafficCounters::new();

        counters.record_sent(100);
        counters.record_sent(50);
        counters.record_received(30);
        counters.record_drop();

        let stats = counters.snapshot();
        assert_eq!(stats.bytes_sent, 150);
        assert_eq!(stats.packets_sent, 2);
        assert_eq!(stats.bytes_received, 30);
        assert_eq!(stats.packets_received, 1);
        assert_eq!(stats.drops, 1);
        assert_eq!(stats.errors, 0);
    }
}
