//! Relay traffic counters.
//!
//! Lock-free counters updated from circuit workers; an external exporter
//! reads the snapshots. Sinks and transports for these numbers live outside
//! this crate.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// A monotonically increasing byte/event counter
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn inc(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// An up/down gauge of live objects
#[derive(Debug, Default)]
pub struct Gauge(AtomicU64);

impl Gauge {
    pub fn alloc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    pub fn free(&self) {
        // Saturate rather than wrap if a double-free slips through.
        self.0
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| {
                Some(v.saturating_sub(1))
            })
            .ok();
    }

    pub fn value(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Counters for the circuit relay core
#[derive(Debug, Default)]
pub struct Metrics {
    /// Live circuits on this relay
    pub circuits: Gauge,

    /// Bytes relayed away from circuit origins
    pub relay_forward: Counter,

    /// Bytes relayed toward circuit origins
    pub relay_backward: Counter,
}

impl Metrics {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }
}
