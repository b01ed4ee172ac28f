//! Passive counters shared by the relay, host, and client.
//!
//! Everything here is lock-free: plain atomic counters plus a fixed-bucket
//! round-trip histogram. Components bump counters from their loop task;
//! observers pull a [`MetricsSnapshot`] whenever they like.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use serde::Serialize;

/// Why a packet was dropped or an operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorReason {
    Malformed,
    BadMagic,
    RateLimited,
    RoutingUnknown,
    Transport,
}

impl ErrorReason {
    const ALL: [ErrorReason; 5] = [
        ErrorReason::Malformed,
        ErrorReason::BadMagic,
        ErrorReason::RateLimited,
        ErrorReason::RoutingUnknown,
        ErrorReason::Transport,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            ErrorReason::Malformed => "malformed",
            ErrorReason::BadMagic => "bad_magic",
            ErrorReason::RateLimited => "rate_limited",
            ErrorReason::RoutingUnknown => "routing_unknown",
            ErrorReason::Transport => "transport",
        }
    }

    fn index(self) -> usize {
        match self {
            ErrorReason::Malformed => 0,
            ErrorReason::BadMagic => 1,
            ErrorReason::RateLimited => 2,
            ErrorReason::RoutingUnknown => 3,
            ErrorReason::Transport => 4,
        }
    }
}

/// Upper bounds of the RTT histogram buckets, in milliseconds. The final
/// bucket is unbounded.
const RTT_BUCKET_BOUNDS_MS: [u64; 8] = [1, 5, 10, 25, 50, 100, 500, 1_000];

/// Atomic metrics registry.
#[derive(Debug, Default)]
pub struct Metrics {
    packets_sent: AtomicU64,
    packets_received: AtomicU64,
    packets_dropped: AtomicU64,
    packets_retried: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: [AtomicU64; 5],
    connections_accepted: AtomicU64,
    connections_denied: AtomicU64,
    connections_disconnected: AtomicU64,
    sessions_created: AtomicU64,
    sessions_destroyed: AtomicU64,
    rtt_buckets: [AtomicU64; 9],
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn packet_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packet_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received
            .fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn packet_retried(&self) {
        self.packets_retried.fetch_add(1, Ordering::Relaxed);
    }

    /// Count a drop and its reason.
    pub fn packet_dropped(&self, reason: ErrorReason) {
        self.packets_dropped.fetch_add(1, Ordering::Relaxed);
        self.errors[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_accepted(&self) {
        self.connections_accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_denied(&self) {
        self.connections_denied.fetch_add(1, Ordering::Relaxed);
    }

    pub fn connection_disconnected(&self) {
        self.connections_disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_created(&self) {
        self.sessions_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn session_destroyed(&self) {
        self.sessions_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one round-trip sample.
    pub fn observe_rtt(&self, rtt: Duration) {
        let ms = rtt.as_millis() as u64;
        let bucket = RTT_BUCKET_BOUNDS_MS
            .iter()
            .position(|bound| ms <= *bound)
            .unwrap_or(RTT_BUCKET_BOUNDS_MS.len());
        self.rtt_buckets[bucket].fetch_add(1, Ordering::Relaxed);
    }

    /// Pull a plain-data snapshot of every counter.
    pub fn snapshot(&self) -> MetricsSnapshot {
        let errors = ErrorReason::ALL
            .iter()
            .map(|reason| ErrorCount {
                reason: reason.as_str(),
                count: self.errors[reason.index()].load(Ordering::Relaxed),
            })
            .collect();

        MetricsSnapshot {
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_dropped: self.packets_dropped.load(Ordering::Relaxed),
            packets_retried: self.packets_retried.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            errors,
            connections_accepted: self.connections_accepted.load(Ordering::Relaxed),
            connections_denied: self.connections_denied.load(Ordering::Relaxed),
            connections_disconnected: self.connections_disconnected.load(Ordering::Relaxed),
            sessions_created: self.sessions_created.load(Ordering::Relaxed),
            sessions_destroyed: self.sessions_destroyed.load(Ordering::Relaxed),
            rtt_buckets: self
                .rtt_buckets
                .iter()
                .map(|b| b.load(Ordering::Relaxed))
                .collect(),
        }
    }
}

/// One error counter in a snapshot.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ErrorCount {
    pub reason: &'static str,
    pub count: u64,
}

/// Point-in-time copy of the metrics registry.
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub packets_dropped: u64,
    pub packets_retried: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: Vec<ErrorCount>,
    pub connections_accepted: u64,
    pub connections_denied: u64,
    pub connections_disconnected: u64,
    pub sessions_created: u64,
    pub sessions_destroyed: u64,
    /// Bucket counts; bounds are 1/5/10/25/50/100/500/1000 ms plus overflow.
    pub rtt_buckets: Vec<u64>,
}
