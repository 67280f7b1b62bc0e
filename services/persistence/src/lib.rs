//! Persistence for produced point values
//!
//! Provides the `PriceStore` port the producer appends to, an in-memory
//! implementation, and a durable implementation on top of an append-only
//! checksummed journal.
//!
//! # Guarantees
//! - Entries are append-only and CRC32C-checked
//! - A corrupted tail never hides entries written before it
//! - Persistence is best-effort relative to broadcast; readers tolerate gaps

pub mod journal;
pub mod reader;
pub mod store;

pub use journal::{JournalConfig, JournalError, SyncPolicy};
pub use store::{JournalStore, MemoryStore, PriceStore, RangeQuery};
