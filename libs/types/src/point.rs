//! Point values
//!
//! A `PointValue` is produced once per tick, persisted, and broadcast.
//! It is never mutated after creation.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

/// One synthesized price sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointValue {
    pub timestamp: DateTime<Utc>,
    pub price: f64,
}

impl PointValue {
    pub fn new(timestamp: DateTime<Utc>, price: f64) -> Self {
        Self { timestamp, price }
    }

    /// Unix nanosecond timestamp, saturating outside the representable range.
    pub fn timestamp_nanos(&self) -> i64 {
        self.timestamp
            .timestamp_nanos_opt()
            .unwrap_or(if self.timestamp.timestamp() < 0 { i64::MIN } else { i64::MAX })
    }

    /// The message pushed to live subscribers for this value.
    pub fn to_message(&self) -> PriceMessage {
        PriceMessage {
            timestamp: self.timestamp.to_rfc3339_opts(SecondsFormat::Micros, true),
            price: self.price,
        }
    }
}

/// Wire shape of a broadcast value: `{ "timestamp": "<ISO-8601>", "price": <number> }`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceMessage {
    pub timestamp: String,
    pub price: f64,
}
