//! Concurrent hash + sorted-vector memtable.
//!
//! Writes land in hash buckets for O(1) point lookup and are appended, in
//! arrival order, to the tail of a vector container. A dedicated sort thread
//! seals and merges those vectors in the background so that an ordered
//! iterator is cheap by the time anyone asks for one.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  insert(key)                                                 │
//! │     │                                                        │
//! │     ├──► hash bucket (striped mutex, sorted, dedups)         │
//! │     │                                                        │
//! │     └──► tail append vector ──► [sealed][sealed][tail]       │
//! │                                     ▲                        │
//! │                              sort thread: seal + k-way merge │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The sorted view is deliberately *not* maintained on every insert; the
//! background thread amortizes ordering cost across many writes.

mod arena;
mod iter;
mod vector;

pub use iter::MemtableIterator;

use crate::compare::KeyComparator;
use crate::config::MemtableConfig;
use crate::error::Result;
use arena::Arena;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use silt_observe::{Meter, NoopMeter};
use std::sync::Arc;
use std::thread::JoinHandle;
use twox_hash::XxHash64;
use vector::VectorContainer;

/// Smallest slot the arena hands out for a key.
const INLINE_KEY_BYTES: usize = 8;

/// A reserved, writable key slot. Fill `buf_mut()` with the encoded internal
/// key, then hand the writer back through [`Memtable::insert`].
pub struct KeyWriter {
    buf: BytesMut,
}

impl KeyWriter {
    pub fn buf_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }
}

/// One hash bucket: keys in full-comparator order.
type Bucket = Vec<Bytes>;

/// Buckets behind striped mutexes. `bucket_count` and `stripe_count` are
/// independent; bucket `b` lives in stripe `b % stripe_count`, so keys that
/// share a stripe mutex need not share a bucket.
struct BucketTable {
    bucket_count: usize,
    stripes: Box<[Mutex<Vec<Bucket>>]>,
}

impl BucketTable {
    fn new(bucket_count: usize, stripe_count: usize) -> Self {
        let stripes = (0..stripe_count)
            .map(|stripe| {
                // ceil of buckets owned by this stripe
                let owned = (bucket_count + stripe_count - 1 - stripe) / stripe_count;
                Mutex::new(vec![Vec::new(); owned])
            })
            .collect();
        Self {
            bucket_count,
            stripes,
        }
    }

    fn locate(&self, user_key: &[u8]) -> (usize, usize) {
        let hash = XxHash64::oneshot(0, user_key) as usize;
        let bucket = hash % self.bucket_count;
        (bucket % self.stripes.len(), bucket / self.stripes.len())
    }

    /// Installs the key in sorted position; false on a comparator-equal
    /// duplicate.
    fn add(&self, key: Bytes, comparator: &dyn KeyComparator) -> bool {
        let (stripe, slot) = self.locate(comparator.user_key(&key));
        let mut buckets = self.stripes[stripe].lock();
        let bucket = &mut buckets[slot];
        match bucket.binary_search_by(|entry| comparator.compare(entry, &key)) {
            Ok(_) => false,
            Err(pos) => {
                bucket.insert(pos, key);
                true
            }
        }
    }

    fn contains(&self, key: &[u8], comparator: &dyn KeyComparator) -> bool {
        let (stripe, slot) = self.locate(comparator.user_key(key));
        let buckets = self.stripes[stripe].lock();
        buckets[slot]
            .binary_search_by(|entry| comparator.compare(entry, key))
            .is_ok()
    }

    /// Walks the bucket from the first entry ≥ `key`, handing each entry to
    /// `visitor` until it returns false. The lock is held for the walk only.
    fn get(&self, key: &[u8], comparator: &dyn KeyComparator, mut visitor: impl FnMut(&[u8]) -> bool) {
        let (stripe, slot) = self.locate(comparator.user_key(key));
        let buckets = self.stripes[stripe].lock();
        let bucket = &buckets[slot];
        let start = bucket
            .partition_point(|entry| comparator.compare(entry, key) == std::cmp::Ordering::Less);
        for entry in &bucket[start..] {
            if !visitor(entry) {
                break;
            }
        }
    }
}

/// The memtable. See the module docs for the write/read paths.
pub struct Memtable {
    table: BucketTable,
    comparator: Arc<dyn KeyComparator>,
    container: Arc<VectorContainer>,
    arena: Arena,
    sort_thread: Mutex<Option<JoinHandle<()>>>,
}

impl Memtable {
    pub fn new(config: &MemtableConfig, comparator: Arc<dyn KeyComparator>) -> Self {
        Self::with_meter(config, comparator, Arc::new(NoopMeter))
    }

    pub fn with_meter(
        config: &MemtableConfig,
        comparator: Arc<dyn KeyComparator>,
        meter: Arc<dyn Meter>,
    ) -> Self {
        let container = Arc::new(VectorContainer::new(
            Arc::clone(&comparator),
            config.switch_vector_limit,
            meter,
        ));

        let sort_container = Arc::clone(&container);
        let handle = std::thread::Builder::new()
            .name("silt-memtable-sort".to_string())
            .spawn(move || sort_container.run_sort_loop())
            .expect("failed to spawn memtable sort thread");

        Self {
            table: BucketTable::new(config.bucket_count, config.stripe_count),
            comparator,
            container,
            arena: Arena::new(config.arena_block_bytes),
            sort_thread: Mutex::new(Some(handle)),
        }
    }

    /// Reserves a key slot of `max(len, inline)` bytes; the writable window
    /// is exactly `len`.
    pub fn allocate(&self, len: usize) -> Result<KeyWriter> {
        let mut buf = self.arena.allocate(len.max(INLINE_KEY_BYTES))?;
        buf.truncate(len);
        Ok(KeyWriter { buf })
    }

    /// Installs an allocated key. Returns false when a comparator-equal key
    /// is already present; the container is not touched in that case.
    pub fn insert(&self, writer: KeyWriter) -> bool {
        let key = writer.buf.freeze();
        if !self.table.add(key.clone(), self.comparator.as_ref()) {
            return false;
        }
        self.container.insert(key);
        true
    }

    pub fn contains(&self, key: &[u8]) -> bool {
        self.table.contains(key, self.comparator.as_ref())
    }

    /// Point lookup: enumerates bucket entries from the first ≥ `lookup_key`
    /// in ascending order until `visitor` returns false.
    pub fn get(&self, lookup_key: &[u8], visitor: impl FnMut(&[u8]) -> bool) {
        self.table.get(lookup_key, self.comparator.as_ref(), visitor)
    }

    /// An ordered iterator over a snapshot of the current contents.
    pub fn iter(&self) -> MemtableIterator {
        if self.container.is_empty() {
            MemtableIterator::empty(Arc::clone(&self.comparator))
        } else {
            MemtableIterator::new(
                self.container.snapshot_for_iter(),
                Arc::clone(&self.comparator),
            )
        }
    }

    /// Freezes the memtable and joins the sort thread after it drains.
    pub fn mark_read_only(&self) {
        self.container.mark_read_only();
        if let Some(handle) = self.sort_thread.lock().take() {
            let _ = handle.join();
        }
    }

    pub fn is_read_only(&self) -> bool {
        self.container.is_read_only()
    }

    pub fn num_entries(&self) -> usize {
        self.container.num_elements()
    }

    pub fn is_empty(&self) -> bool {
        self.container.is_empty()
    }

    /// Arena charge, block-granular.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.allocated_bytes()
    }
}

impl Drop for Memtable {
    fn drop(&mut self) {
        self.mark_read_only();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{
        decode_internal_key, encode_internal_key, write_internal_key, InternalKeyComparator,
        ValueKind, INTERNAL_KEY_TRAILER,
    };
    use crate::config::MemtableConfig;

    fn small_config() -> MemtableConfig {
        MemtableConfig {
            bucket_count: 64,
            stripe_count: 8,
            switch_vector_limit: 16,
            arena_block_bytes: 4096,
        }
    }

    fn memtable() -> Memtable {
        Memtable::new(&small_config(), Arc::new(InternalKeyComparator::default()))
    }

    fn insert_key(mt: &Memtable, user: &[u8], seq: u64) -> bool {
        let len = user.len() + INTERNAL_KEY_TRAILER;
        let mut writer = mt.allocate(len).unwrap();
        write_internal_key(writer.buf_mut(), user, seq, ValueKind::Value);
        mt.insert(writer)
    }

    #[test]
    fn insert_and_contains() {
        let mt = memtable();
        assert!(insert_key(&mt, b"hello", 1));
        let key = encode_internal_key(b"hello", 1, ValueKind::Value);
        assert!(mt.contains(&key));
        assert!(!mt.contains(&encode_internal_key(b"other", 1, ValueKind::Value)));
    }

    #[test]
    fn duplicate_insert_returns_false() {
        let mt = memtable();
        assert!(insert_key(&mt, b"a", 7));
        assert!(!insert_key(&mt, b"a", 7));
        assert_eq!(mt.num_entries(), 1);

        // Same user key, different sequence, is a distinct internal key.
        assert!(insert_key(&mt, b"a", 8));
        assert_eq!(mt.num_entries(), 2);
    }

    #[test]
    fn get_visits_from_lower_bound_in_order() {
        let mt = memtable();
        insert_key(&mt, b"k", 5);
        insert_key(&mt, b"k", 9);
        insert_key(&mt, b"k", 2);

        // Lookup with the max sequence sees all versions, newest first.
        let lookup = encode_internal_key(b"k", u64::MAX >> 8, ValueKind::Value);
        let mut seqs = Vec::new();
        mt.get(&lookup, |entry| {
            let (user, seq, _) = decode_internal_key(entry);
            if user != b"k" {
                return false;
            }
            seqs.push(seq);
            true
        });
        assert_eq!(seqs, vec![9, 5, 2]);
    }

    #[test]
    fn get_stops_when_visitor_declines() {
        let mt = memtable();
        insert_key(&mt, b"k", 5);
        insert_key(&mt, b"k", 9);

        let lookup = encode_internal_key(b"k", u64::MAX >> 8, ValueKind::Value);
        let mut visited = 0;
        mt.get(&lookup, |_| {
            visited += 1;
            false
        });
        assert_eq!(visited, 1);
    }

    #[test]
    fn iterator_yields_sorted_snapshot() {
        let mt = memtable();
        for user in ["d", "a", "c", "b"] {
            insert_key(&mt, user.as_bytes(), 1);
        }

        let mut iter = mt.iter();
        iter.seek_to_first();
        let mut seen = Vec::new();
        while iter.valid() {
            seen.push(decode_internal_key(iter.key()).0.to_vec());
            iter.next();
        }
        assert_eq!(seen, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);
    }

    #[test]
    fn iterator_on_empty_memtable() {
        let mt = memtable();
        let mut iter = mt.iter();
        iter.seek_to_first();
        assert!(!iter.valid());
    }

    #[test]
    fn mark_read_only_joins_sort_thread() {
        let mt = memtable();
        for i in 0..100u64 {
            insert_key(&mt, format!("key{:03}", i).as_bytes(), i + 1);
        }
        mt.mark_read_only();
        assert!(mt.is_read_only());

        // Iteration after freeze sees everything.
        let mut iter = mt.iter();
        iter.seek_to_first();
        let mut count = 0;
        while iter.valid() {
            count += 1;
            iter.next();
        }
        assert_eq!(count, 100);
    }

    #[test]
    fn memory_usage_tracks_arena_blocks() {
        let mt = memtable();
        assert_eq!(mt.approximate_memory_usage(), 0);
        insert_key(&mt, b"some-key", 1);
        assert!(mt.approximate_memory_usage() >= 4096);
    }
}
