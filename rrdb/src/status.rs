//! Server status counters.
//!
//! Counters are plain atomics bumped by the listeners and read by
//! `SHOW STATUS`. Relaxed ordering is enough: each counter is independent
//! and readers only need an eventually consistent snapshot.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// A status counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Counter {
    /// Accepted TCP connections.
    TcpConnections,
    /// TCP statements executed.
    TcpRequests,
    /// TCP statements that failed.
    TcpErrors,
    /// TCP connections closed by the read timeout.
    TcpTimeouts,
    /// UDP packets received.
    UdpRequests,
    /// UDP packets that failed to parse or execute.
    UdpErrors,
    /// Completed registry flushes.
    Flushes,
    /// Registry flushes that reported an error.
    FlushErrors,
}

impl Counter {
    /// Every counter, in snapshot order.
    pub const ALL: [Self; 8] = [
        Self::TcpConnections,
        Self::TcpRequests,
        Self::TcpErrors,
        Self::TcpTimeouts,
        Self::UdpRequests,
        Self::UdpErrors,
        Self::Flushes,
        Self::FlushErrors,
    ];

    /// Name reported by `SHOW STATUS`.
    pub const fn name(self) -> &'static str {
        match self {
            Self::TcpConnections => "tcp.connections",
            Self::TcpRequests => "tcp.requests",
            Self::TcpErrors => "tcp.errors",
            Self::TcpTimeouts => "tcp.timeouts",
            Self::UdpRequests => "udp.requests",
            Self::UdpErrors => "udp.errors",
            Self::Flushes => "rrdb.flushes",
            Self::FlushErrors => "rrdb.flush_errors",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

/// Name of the uptime entry in a snapshot.
pub const UPTIME: &str = "uptime";

/// Name of the metric count entry in a snapshot.
pub const METRIC_COUNT: &str = "rrdb.metrics";

/// Process-wide status counters.
#[derive(Debug)]
pub struct ServerStatus {
    started: Instant,
    counters: [AtomicU64; Counter::ALL.len()],
}

impl Default for ServerStatus {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerStatus {
    /// Creates zeroed counters; uptime starts now.
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
            counters: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Increments a counter by one.
    pub fn increment(&self, counter: Counter) {
        self.counters[counter.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Current value of a counter.
    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    /// Seconds since the counters were created.
    pub fn uptime_secs(&self) -> u64 {
        self.started.elapsed().as_secs()
    }

    /// All counters plus uptime, keyed by name, restricted to names
    /// containing `like`.
    pub fn snapshot(&self, like: Option<&str>) -> BTreeMap<String, u64> {
        let mut values = BTreeMap::new();
        values.insert(UPTIME.to_string(), self.uptime_secs());
        for counter in Counter::ALL {
            values.insert(counter.name().to_string(), self.get(counter));
        }
        filter_like(values, like)
    }
}

/// Keeps the entries whose name contains `like` (case-insensitive).
pub fn filter_like(mut values: BTreeMap<String, u64>, like: Option<&str>) -> BTreeMap<String, u64> {
    if let Some(pattern) = like {
        let pattern = pattern.to_ascii_lowercase();
        values.retain(|name, _| name.contains(&pattern));
    }
    values
}
