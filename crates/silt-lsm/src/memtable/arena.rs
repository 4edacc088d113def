//! Bump allocator backing the memtable's key storage.
//!
//! Keys are carved out of shared `BytesMut` chunks; freezing a carved slice
//! keeps the chunk alive through `Bytes` refcounts, so every key handed to
//! the hash table or an iterator outlives the view that uses it.

use crate::error::{Error, Result};
use bytes::BytesMut;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

pub struct Arena {
    block_bytes: usize,
    /// Hard cap on total charged bytes; `usize::MAX` means uncapped.
    max_bytes: usize,
    tail: Mutex<BytesMut>,
    allocated: AtomicUsize,
}

impl Arena {
    pub fn new(block_bytes: usize) -> Self {
        Self::with_capacity_limit(block_bytes, usize::MAX)
    }

    pub fn with_capacity_limit(block_bytes: usize, max_bytes: usize) -> Self {
        Self {
            block_bytes,
            max_bytes,
            tail: Mutex::new(BytesMut::new()),
            allocated: AtomicUsize::new(0),
        }
    }

    /// Reserves `len` writable bytes.
    ///
    /// Large requests get a dedicated chunk; everything else is carved from
    /// the current block.
    pub fn allocate(&self, len: usize) -> Result<BytesMut> {
        let mut tail = self.tail.lock();
        if tail.len() < len {
            let block = len.max(self.block_bytes);
            if self.allocated.load(Ordering::Relaxed) + block > self.max_bytes {
                return Err(Error::ArenaExhausted { requested: len });
            }
            *tail = BytesMut::zeroed(block);
            self.allocated.fetch_add(block, Ordering::Relaxed);
        }
        Ok(tail.split_to(len))
    }

    /// Total bytes charged against this arena, block-granular.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn carves_from_one_block() {
        let arena = Arena::new(1024);
        let a = arena.allocate(100).unwrap();
        let b = arena.allocate(100).unwrap();
        assert_eq!(a.len(), 100);
        assert_eq!(b.len(), 100);
        assert_eq!(arena.allocated_bytes(), 1024);
    }

    #[test]
    fn oversized_request_gets_own_block() {
        let arena = Arena::new(1024);
        let big = arena.allocate(4096).unwrap();
        assert_eq!(big.len(), 4096);
        assert_eq!(arena.allocated_bytes(), 4096);
    }

    #[test]
    fn capacity_limit_propagates() {
        let arena = Arena::with_capacity_limit(1024, 2048);
        assert!(arena.allocate(1000).is_ok());
        assert!(arena.allocate(1000).is_ok());
        let err = arena.allocate(1000).unwrap_err();
        assert!(matches!(err, Error::ArenaExhausted { requested: 1000 }));
    }

    #[test]
    fn frozen_keys_outlive_the_tail() {
        let arena = Arena::new(64);
        let mut buf = arena.allocate(3).unwrap();
        buf.copy_from_slice(b"abc");
        let key = buf.freeze();
        // force a new block
        let _ = arena.allocate(64).unwrap();
        assert_eq!(&key[..], b"abc");
    }
}
