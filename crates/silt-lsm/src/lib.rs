//! silt-lsm: core runtime of an embedded LSM storage engine.
//!
//! Three load-bearing subsystems, plus two small edges:
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Memtable (hash + sorted vectors)                           │
//! │  - Concurrent inserts, O(1) point lookup                    │
//! │  - Background sort thread yields ordered iteration          │
//! └──────────────┬──────────────────────────────────────────────┘
//!                │ every insert charges
//!                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Write Buffer Manager (cross-DB)                            │
//! │  - used / inactive / being_freed accounting                 │
//! │  - Flush initiation thread, write delays, stall queue       │
//! └──────────────┬──────────────────────────────────────────────┘
//!                │ flushes produce L0 runs
//!                ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │  Hybrid Compaction Picker                                   │
//! │  - Hyper-level shape, rearranges as trivial moves           │
//! │  - Bounded read- and space-amplification                    │
//! └─────────────────────────────────────────────────────────────┘
//!   edges: scoped table pinning · adaptive table-format dispatch
//! ```
//!
//! The engine around this crate owns WAL durability, MVCC, the table
//! formats and the block cache; this crate only sees their interfaces
//! ([`write_buffer::CacheReservationManager`], [`table::RandomAccessSource`],
//! the flush-initiator callbacks).

pub mod compaction;
pub mod compare;
pub mod config;
pub mod error;
pub mod memtable;
pub mod pinning;
pub mod table;
pub mod version;
pub mod write_buffer;

pub use compaction::HybridCompactionPicker;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use memtable::Memtable;
pub use write_buffer::WriteBufferManager;

// Re-export key types from dependencies
pub use bytes::Bytes;
pub use silt_observe::{Meter, NoopMeter};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }
}
