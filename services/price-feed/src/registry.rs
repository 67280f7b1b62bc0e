//! Connection registry and fan-out broadcaster
//!
//! Tracks live subscribers and pushes every produced point to each of them.
//!
//! Flow: subscribe → receive one message per tick → unsubscribe or get
//! pruned on the first failed send.
//!
//! Broadcast iterates a snapshot taken before the first send. Connections
//! that subscribe mid-broadcast wait for the next round; failed connections
//! are removed only after the round has finished.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::{debug, warn};
use types::ids::ConnectionId;
use types::point::PointValue;

use crate::metrics::FeedMetrics;

/// Outcome of a single send attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Failed(DeliveryFailure),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryFailure {
    /// The subscriber went away.
    Closed,
    /// The subscriber's outbound queue is full; lagging clients are disconnected.
    Lagging,
}

/// Transport handle of one subscriber.
///
/// `deliver` must not block: it either hands the payload over or reports
/// why it could not.
pub trait MessageSink: Send + Sync {
    fn deliver(&self, payload: &Arc<str>) -> Delivery;
}

/// Bounded per-connection queue drained by the connection's own task.
impl MessageSink for mpsc::Sender<Arc<str>> {
    fn deliver(&self, payload: &Arc<str>) -> Delivery {
        match self.try_send(Arc::clone(payload)) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => Delivery::Failed(DeliveryFailure::Lagging),
            Err(TrySendError::Closed(_)) => Delivery::Failed(DeliveryFailure::Closed),
        }
    }
}

/// One live subscriber.
pub struct Connection {
    id: ConnectionId,
    sink: Box<dyn MessageSink>,
    alive: AtomicBool,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// `None` if the connection is already dead; it is never sent to again.
    fn send(&self, payload: &Arc<str>) -> Option<Delivery> {
        if !self.is_alive() {
            return None;
        }
        let outcome = self.sink.deliver(payload);
        if let Delivery::Failed(_) = outcome {
            self.mark_dead();
        }
        Some(outcome)
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("alive", &self.is_alive())
            .finish()
    }
}

/// Result of one broadcast round.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections still live when their turn came.
    pub attempted: usize,
    pub delivered: usize,
    /// Connections removed because their send failed.
    pub dropped: Vec<ConnectionId>,
}

struct RegistryInner {
    connections: DashMap<ConnectionId, Arc<Connection>>,
    next_id: AtomicU64,
    metrics: Arc<FeedMetrics>,
}

/// Registry of live connections. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<RegistryInner>,
}

impl ConnectionRegistry {
    pub fn new(metrics: Arc<FeedMetrics>) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                connections: DashMap::new(),
                next_id: AtomicU64::new(1),
                metrics,
            }),
        }
    }

    /// Register a new subscriber.
    pub fn subscribe(&self, sink: impl MessageSink + 'static) -> Arc<Connection> {
        let id = ConnectionId::new(self.inner.next_id.fetch_add(1, Ordering::Relaxed));
        let connection = Arc::new(Connection {
            id,
            sink: Box::new(sink),
            alive: AtomicBool::new(true),
        });
        self.inner.connections.insert(id, Arc::clone(&connection));
        self.publish_count();
        debug!(connection_id = %id, "Connection subscribed");
        connection
    }

    /// Remove a subscriber. Returns whether it was still registered.
    pub fn unsubscribe(&self, connection: &Connection) -> bool {
        connection.mark_dead();
        let removed = self.inner.connections.remove(&connection.id).is_some();
        if removed {
            self.publish_count();
            debug!(connection_id = %connection.id, "Connection unsubscribed");
        }
        removed
    }

    /// Drop every connection, e.g. at shutdown. Returns how many were removed.
    pub fn clear(&self) -> usize {
        let ids = self.connection_ids();
        let mut removed = 0;
        for id in ids {
            if let Some((_, connection)) = self.inner.connections.remove(&id) {
                connection.mark_dead();
                removed += 1;
            }
        }
        self.publish_count();
        removed
    }

    /// Serialize `point` once and deliver it to every registered connection.
    pub fn broadcast(&self, point: &PointValue) -> Result<BroadcastReport, serde_json::Error> {
        let payload: Arc<str> = serde_json::to_string(&point.to_message())?.into();
        Ok(self.broadcast_payload(&payload))
    }

    /// Deliver a pre-serialized payload to every registered connection.
    pub fn broadcast_payload(&self, payload: &Arc<str>) -> BroadcastReport {
        let snapshot = self.snapshot();
        let mut report = BroadcastReport::default();

        for connection in &snapshot {
            // Unsubscribed since the snapshot was taken.
            let Some(outcome) = connection.send(payload) else {
                continue;
            };
            report.attempted += 1;
            match outcome {
                Delivery::Delivered => report.delivered += 1,
                Delivery::Failed(reason) => {
                    warn!(
                        connection_id = %connection.id,
                        reason = ?reason,
                        "Send failed, dropping connection"
                    );
                    report.dropped.push(connection.id);
                }
            }
        }

        for id in &report.dropped {
            self.inner.connections.remove(id);
        }

        let metrics = &self.inner.metrics;
        metrics.record_delivered(report.delivered as u64);
        if !report.dropped.is_empty() {
            metrics.record_dropped(report.dropped.len() as u64);
            self.publish_count();
        }

        report
    }

    /// Registered connections ordered by id.
    pub fn snapshot(&self) -> Vec<Arc<Connection>> {
        let mut connections: Vec<Arc<Connection>> = self
            .inner
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        connections.sort_by_key(|c| c.id);
        connections
    }

    pub fn connection_count(&self) -> usize {
        self.inner.connections.len()
    }

    pub fn connection_ids(&self) -> Vec<ConnectionId> {
        self.snapshot().iter().map(|c| c.id).collect()
    }

    pub fn metrics(&self) -> &Arc<FeedMetrics> {
        &self.inner.metrics
    }

    fn publish_count(&self) {
        self.inner
            .metrics
            .set_connected_clients(self.inner.connections.len() as u64);
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new(Arc::new(FeedMetrics::new()))
    }
}
