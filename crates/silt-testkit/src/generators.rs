//! Proptest strategies for engine tests.
//!
//! # Example
//!
//! ```ignore
//! use silt_testkit::generators::*;
//! use proptest::prelude::*;
//!
//! proptest! {
//!     #[test]
//!     fn fuzz_memtable(ops in insert_sequence(256, 64)) {
//!         // Run ops through the memtable, compare against the model
//!     }
//! }
//! ```

use bytes::Bytes;
use proptest::prelude::*;

/// Generate a random user key (1-64 bytes).
pub fn user_key() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 1..=64).prop_map(Bytes::from)
}

/// Generate a random value (0-256 bytes).
pub fn value() -> impl Strategy<Value = Bytes> {
    prop::collection::vec(any::<u8>(), 0..=256).prop_map(Bytes::from)
}

/// Generate a key from a fixed set (key_00000, key_00001, ...).
///
/// Keys from a small set overlap often, which is what exercises the
/// duplicate-insert path.
pub fn key_from_set(n: usize) -> impl Strategy<Value = Bytes> {
    (0..n).prop_map(move |i| Bytes::from(format!("key_{:05}", i)))
}

/// A single memtable write: user key plus the sequence number the engine
/// would stamp it with.
#[derive(Debug, Clone)]
pub struct InsertOp {
    pub user_key: Bytes,
    pub sequence: u64,
}

/// Generate a sequence of inserts over a bounded key set.
///
/// Sequence numbers repeat within a small window, so duplicate internal keys
/// (same user key, same sequence) occur naturally and exercise the
/// duplicate-insert path.
pub fn insert_sequence(max_ops: usize, key_space: usize) -> impl Strategy<Value = Vec<InsertOp>> {
    prop::collection::vec((key_from_set(key_space), 1u64..=8), 1..=max_ops).prop_map(|pairs| {
        pairs
            .into_iter()
            .map(|(user_key, sequence)| InsertOp { user_key, sequence })
            .collect()
    })
}

/// Encodes an internal key the way the engine does: user key followed by an
/// 8-byte little-endian trailer `(sequence << 8) | kind`.
pub fn encode_internal_key(user_key: &[u8], sequence: u64, kind: u8) -> Bytes {
    let mut buf = Vec::with_capacity(user_key.len() + 8);
    buf.extend_from_slice(user_key);
    buf.extend_from_slice(&((sequence << 8) | kind as u64).to_le_bytes());
    Bytes::from(buf)
}
