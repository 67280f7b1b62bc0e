//! Types library for the live price feed
//!
//! Shared definitions used by the producer, the persistence layer and the
//! gateway, so every crate agrees on what a point value looks like on disk
//! and on the wire.
//!
//! # Modules
//! - `ids`: Identifiers handed out by the connection registry
//! - `point`: Point values and their wire message
//! - `errors`: Error taxonomy shared across crates

pub mod errors;
pub mod ids;
pub mod point;

