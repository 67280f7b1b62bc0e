use persistence::PriceStore;
use price_feed::{ConnectionRegistry, FeedMetrics};
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub registry: ConnectionRegistry,
    pub store: Arc<dyn PriceStore>,
    pub metrics: Arc<FeedMetrics>,
    pub client_queue: usize,
}

impl AppState {
    pub fn new(registry: ConnectionRegistry, store: Arc<dyn PriceStore>, client_queue: usize) -> Self {
        let metrics = Arc::clone(registry.metrics());
        Self {
            registry,
            store,
            metrics,
            client_queue,
        }
    }
}
