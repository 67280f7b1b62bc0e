//! Identifier types
//!
//! Connection ids are allocated by the registry from a monotonic counter,
//! so ordering by id is ordering by subscription time.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Identifier of one live subscriber connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_id_ordering() {
        assert!(ConnectionId::new(1) < ConnectionId::new(2));
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(7).to_string(), "conn-7");
    }

    #[test]
    fn test_connection_id_serializes_as_number() {
        let json = serde_json::to_string(&ConnectionId::new(42)).unwrap();
        assert_eq!(json, "42");
    }
}
