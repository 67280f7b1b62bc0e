//! Price Feed
//!
//! Produces one calendar-weighted price per tick and pushes it to every
//! live subscriber:
//! - Calendar coefficient engine (event-count and active-lesson multipliers)
//! - Calendar sources re-read on every tick
//! - Value producer loop with backoff on failure
//! - Connection registry with snapshot fan-out and disconnect-on-failure
//! - Feed counters for the stats endpoint
//!
//! # Architecture
//!
//! ```text
//!   CalendarSource
//!        │
//!  ┌─────▼──────┐
//!  │Coefficients│
//!  └─────┬──────┘
//!        │
//!  ┌─────▼──────┐
//!  │  Producer  │── jitter
//!  └──┬──────┬──┘
//!     │      │
//! ┌───▼──┐ ┌─▼────────┐
//! │Store │ │ Registry │──► connections
//! └──────┘ └──────────┘
//! ```

pub mod calendar;
pub mod metrics;
pub mod producer;
pub mod registry;
pub mod source;

pub use calendar::{CalendarEvent, Coefficients};
pub use metrics::{FeedMetrics, MetricsSnapshot};
pub use producer::{
    ProducerConfig, ProducerHandle, ProducerPhase, TickError, TickReport, ValueProducer,
};
pub use registry::{
    BroadcastReport, Connection, ConnectionRegistry, Delivery, DeliveryFailure, MessageSink,
};
pub use source::{CalendarSource, FileCalendar, StaticCalendar};
