//! Observability counters for the price feed
//!
//! Shared between the producer and the registry; read by the gateway's
//! stats endpoint.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-lifetime counters. All updates are relaxed atomics.
#[derive(Debug, Default)]
pub struct FeedMetrics {
    // Production
    pub ticks_produced: AtomicU64,
    pub tick_failures: AtomicU64,
    pub persistence_failures: AtomicU64,
    pub calendar_failures: AtomicU64,
    /// Bit pattern of the last produced price (`f64::to_bits`).
    last_price_bits: AtomicU64,

    // Broadcasting
    pub messages_delivered: AtomicU64,
    pub connections_dropped: AtomicU64,
    pub connected_clients: AtomicU64,
}

impl FeedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self, price: f64) {
        self.ticks_produced.fetch_add(1, Ordering::Relaxed);
        self.last_price_bits.store(price.to_bits(), Ordering::Relaxed);
    }

    pub fn record_tick_failure(&self) {
        self.tick_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_persistence_failure(&self) {
        self.persistence_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_calendar_failure(&self) {
        self.calendar_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_delivered(&self, count: u64) {
        self.messages_delivered.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_dropped(&self, count: u64) {
        self.connections_dropped.fetch_add(count, Ordering::Relaxed);
    }

    pub fn set_connected_clients(&self, count: u64) {
        self.connected_clients.store(count, Ordering::Relaxed);
    }

    pub fn last_price(&self) -> Option<f64> {
        if self.ticks_produced.load(Ordering::Relaxed) == 0 {
            return None;
        }
        Some(f64::from_bits(self.last_price_bits.load(Ordering::Relaxed)))
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            ticks_produced: self.ticks_produced.load(Ordering::Relaxed),
            tick_failures: self.tick_failures.load(Ordering::Relaxed),
            persistence_failures: self.persistence_failures.load(Ordering::Relaxed),
            calendar_failures: self.calendar_failures.load(Ordering::Relaxed),
            last_price: self.last_price(),
            messages_delivered: self.messages_delivered.load(Ordering::Relaxed),
            connections_dropped: self.connections_dropped.load(Ordering::Relaxed),
            connected_clients: self.connected_clients.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of [`FeedMetrics`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MetricsSnapshot {
    pub ticks_produced: u64,
    pub tick_failures: u64,
    pub persistence_failures: u64,
    pub calendar_failures: u64,
    pub last_price: Option<f64>,
    pub messages_delivered: u64,
    pub connections_dropped: u64,
    pub connected_clients: u64,
}
