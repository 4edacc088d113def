//! silt-testkit: property-based test generators and reference models.
//!
//! Provides proptest strategies for:
//! - Raw keys and values
//! - Internal keys (user key + sequence trailer)
//! - Memtable operation sequences
//!
//! and a `ReferenceMemtable` — a sorted-set model the randomized memtable
//! fuzz compares against.

pub mod generators;
pub mod reference;

pub use generators::*;
pub use reference::ReferenceMemtable;
