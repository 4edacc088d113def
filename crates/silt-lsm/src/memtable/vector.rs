//! Append vectors and the container the sort thread works over.
//!
//! Writers append key pointers to the tail vector through an atomic slot
//! claim; the sort thread seals everything behind the tail, and occasionally
//! k-way merges runs of small sealed vectors to keep the container short.

use crate::compare::KeyComparator;
use bytes::Bytes;
use parking_lot::{Condvar, Mutex, RwLock};
use silt_observe::{EngineEvent, MemEvt, MemKind, Meter};
use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Ceiling on how many vectors a single merge may consume, and the container
/// length that makes the sort thread look for merge candidates.
pub(crate) const MERGED_VECTORS_MAX: usize = 8;

/// A fixed-capacity append vector.
///
/// Lives in two phases: unsealed (writers claim slots through `add`) and
/// sealed (`sorted` published with release semantics, after which
/// `sorted_items` serves binary searches). The container guarantees that
/// `sort` only runs once no writer can still be inside `add`.
pub(crate) struct SortedVector {
    slots: Box<[OnceLock<Bytes>]>,
    claimed: AtomicUsize,
    sorted: AtomicBool,
    seal: Mutex<()>,
    items: OnceLock<Vec<Bytes>>,
}

impl SortedVector {
    pub(crate) fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| OnceLock::new()).collect(),
            claimed: AtomicUsize::new(0),
            sorted: AtomicBool::new(false),
            seal: Mutex::new(()),
            items: OnceLock::new(),
        }
    }

    /// Builds an already-sealed vector from comparator-ordered keys.
    pub(crate) fn from_sorted(items: Vec<Bytes>) -> Self {
        let claimed = items.len();
        let sealed = Self {
            slots: Box::new([]),
            claimed: AtomicUsize::new(claimed),
            sorted: AtomicBool::new(true),
            seal: Mutex::new(()),
            items: OnceLock::new(),
        };
        let _ = sealed.items.set(items);
        sealed
    }

    /// Claims a slot and writes the key into it. Fails when the vector is
    /// full; the caller then appends a fresh tail and retries there.
    pub(crate) fn add(&self, key: Bytes) -> bool {
        let location = self.claimed.fetch_add(1, Ordering::Relaxed);
        if location < self.slots.len() {
            let _ = self.slots[location].set(key);
            true
        } else {
            false
        }
    }

    pub(crate) fn len(&self) -> usize {
        if let Some(items) = self.items.get() {
            items.len()
        } else {
            self.claimed.load(Ordering::Relaxed).min(self.slots.len())
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn is_sorted(&self) -> bool {
        self.sorted.load(Ordering::Acquire)
    }

    /// Seals the vector: truncates to the claimed count, sorts in place under
    /// the vector's own mutex, and publishes `sorted`. Re-entrant safe; both
    /// the sort thread and iterators may call it. Returns false only for an
    /// empty vector.
    pub(crate) fn sort(&self, comparator: &dyn KeyComparator) -> bool {
        if self.len() == 0 {
            return false;
        }
        if self.sorted.load(Ordering::Relaxed) {
            return true;
        }

        let _guard = self.seal.lock();
        if !self.sorted.load(Ordering::Acquire) {
            let count = self.claimed.load(Ordering::Relaxed).min(self.slots.len());
            let mut items: Vec<Bytes> = self.slots[..count]
                .iter()
                .filter_map(|slot| slot.get().cloned())
                .collect();
            debug_assert_eq!(items.len(), count);
            items.sort_by(|a, b| comparator.compare(a, b));
            let _ = self.items.set(items);
            self.sorted.store(true, Ordering::Release);
        }
        true
    }

    /// The sealed, comparator-ordered view. Empty until `sort` published.
    pub(crate) fn sorted_items(&self) -> &[Bytes] {
        debug_assert!(self.is_sorted() || self.is_empty());
        self.items.get().map(Vec::as_slice).unwrap_or(&[])
    }

    /// True when this vector is below the merge threshold (75% of the
    /// configured capacity).
    fn is_small(&self, switch_limit: usize) -> bool {
        self.len() <= switch_limit * 75 / 100
    }
}

/// Heap entry for the k-way merge; min-heap by comparator order.
struct MergeEntry {
    key: Bytes,
    source: usize,
    pos: usize,
    comparator: Arc<dyn KeyComparator>,
}

impl PartialEq for MergeEntry {
    fn eq(&self, other: &Self) -> bool {
        self.comparator.compare(&self.key, &other.key) == std::cmp::Ordering::Equal
    }
}
impl Eq for MergeEntry {}
impl PartialOrd for MergeEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for MergeEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Reversed: BinaryHeap is a max-heap, we pop the smallest key.
        self.comparator.compare(&other.key, &self.key)
    }
}

/// The ordered list of append vectors plus the sort-thread rendezvous state.
///
/// Invariant: at most one vector is unsealed and it is the tail. Once
/// `mark_read_only` runs the list is immutable and every vector is sealed
/// (eagerly by the drain, or lazily by the first iterator that touches it).
pub(crate) struct VectorContainer {
    comparator: Arc<dyn KeyComparator>,
    switch_limit: usize,
    vectors: RwLock<Vec<Arc<SortedVector>>>,
    num_elements: AtomicUsize,
    read_only: AtomicBool,
    wakeup: Mutex<bool>,
    sort_cv: Condvar,
    meter: Arc<dyn Meter>,
}

impl VectorContainer {
    pub(crate) fn new(
        comparator: Arc<dyn KeyComparator>,
        switch_limit: usize,
        meter: Arc<dyn Meter>,
    ) -> Self {
        Self {
            comparator,
            switch_limit,
            vectors: RwLock::new(vec![Arc::new(SortedVector::new(switch_limit))]),
            num_elements: AtomicUsize::new(0),
            read_only: AtomicBool::new(false),
            wakeup: Mutex::new(false),
            sort_cv: Condvar::new(),
            meter,
        }
    }

    pub(crate) fn comparator(&self) -> &Arc<dyn KeyComparator> {
        &self.comparator
    }

    pub(crate) fn num_elements(&self) -> usize {
        self.num_elements.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.num_elements() == 0
    }

    pub(crate) fn is_read_only(&self) -> bool {
        self.read_only.load(Ordering::Acquire)
    }

    /// Appends a key to the tail vector.
    ///
    /// Fast path: read lock, atomic slot claim. When the tail overflows the
    /// writer upgrades to the write lock, re-checks (exactly one writer wins
    /// the append), pushes a fresh tail and retries there.
    pub(crate) fn insert(&self, key: Bytes) {
        self.num_elements.fetch_add(1, Ordering::Relaxed);
        {
            let vectors = self.vectors.read();
            if vectors.last().expect("container never empty").add(key.clone()) {
                return;
            }
        }

        let mut notify_sort_thread = false;
        {
            let mut vectors = self.vectors.write();
            let retried = vectors.last().expect("container never empty").add(key.clone());
            if !retried {
                let fresh = Arc::new(SortedVector::new(self.switch_limit));
                let added = fresh.add(key);
                debug_assert!(added);
                vectors.push(fresh);
                notify_sort_thread = true;
            }
        }
        if notify_sort_thread {
            self.notify_sort_thread();
        }
    }

    /// Freezes the container. Subsequent inserts are a contract violation;
    /// the sort thread drains remaining unsealed vectors and terminates.
    pub(crate) fn mark_read_only(&self) {
        if !self.read_only.swap(true, Ordering::AcqRel) {
            self.meter.emit(EngineEvent::Memtable(MemEvt {
                kind: MemKind::MarkedReadOnly {
                    elements: self.num_elements(),
                },
            }));
            self.notify_sort_thread();
        }
    }

    fn notify_sort_thread(&self) {
        let mut pending = self.wakeup.lock();
        *pending = true;
        self.sort_cv.notify_one();
    }

    /// The vector set an iterator should observe.
    ///
    /// On a still-mutable container a fresh empty tail is appended first (so
    /// concurrent writers cannot mutate anything the iterator sees) and
    /// every returned vector is therefore stable. A pre-existing empty tail
    /// is reused instead of appending another.
    pub(crate) fn snapshot_for_iter(&self) -> Vec<Arc<SortedVector>> {
        if self.is_read_only() {
            return self.vectors.read().clone();
        }

        let mut notify_sort_thread = false;
        let snapshot = {
            let mut vectors = self.vectors.write();
            if !vectors.last().expect("container never empty").is_empty() {
                vectors.push(Arc::new(SortedVector::new(self.switch_limit)));
                notify_sort_thread = true;
            }
            vectors[..vectors.len() - 1].to_vec()
        };
        if notify_sort_thread {
            self.notify_sort_thread();
        }
        snapshot
    }

    /// Body of the dedicated sort thread.
    ///
    /// Walks vectors from a cursor up to the current penultimate tail and
    /// seals each; once the container grows past `MERGED_VECTORS_MAX`, looks
    /// for a run of small vectors to merge. Exits after `mark_read_only`,
    /// draining whatever is left.
    pub(crate) fn run_sort_loop(self: &Arc<Self>) {
        let mut cursor = 0usize;

        loop {
            {
                let mut pending = self.wakeup.lock();
                while !*pending && !self.is_read_only() {
                    self.sort_cv.wait(&mut pending);
                }
                *pending = false;
            }
            if self.is_read_only() {
                break;
            }

            let snapshot = self.vectors.read().clone();
            let tail = snapshot.len() - 1;
            if cursor == tail {
                continue;
            }

            for vector in &snapshot[cursor..tail] {
                if vector.sort(self.comparator.as_ref()) {
                    self.meter.emit(EngineEvent::Memtable(MemEvt {
                        kind: MemKind::VectorSealed {
                            elements: vector.len(),
                        },
                    }));
                }
            }
            cursor = tail;

            if snapshot.len() > MERGED_VECTORS_MAX && self.try_merge_vectors(&snapshot, tail) {
                cursor = 0;
            }
        }

        // Drain: everything is stable now, seal the stragglers.
        for vector in self.vectors.read().iter() {
            vector.sort(self.comparator.as_ref());
        }
    }

    /// Finds a run of ≥2 small vectors within `snapshot[..upto]` and merges
    /// it. A vector above the 75% fill threshold breaks a run; runs are
    /// capped at `MERGED_VECTORS_MAX`. Returns true when a merge happened.
    fn try_merge_vectors(&self, snapshot: &[Arc<SortedVector>], upto: usize) -> bool {
        let mut start = 0usize;
        let mut end = upto;
        let mut count = 0usize;

        for (idx, vector) in snapshot[..upto].iter().enumerate() {
            if !vector.is_small(self.switch_limit) {
                if count > 1 {
                    end = idx;
                    break;
                }
                count = 0;
                start = idx + 1;
            } else {
                count += 1;
                if count == MERGED_VECTORS_MAX {
                    end = idx + 1;
                    break;
                }
            }
        }

        if count > 1 {
            self.merge_range(snapshot, start, end);
            true
        } else {
            false
        }
    }

    /// K-way merges `snapshot[start..end]` into one sealed vector and swaps
    /// it into the container in their place. Only the sort thread splices,
    /// so the indices are stable against concurrent tail appends.
    fn merge_range(&self, snapshot: &[Arc<SortedVector>], start: usize, end: usize) {
        let sources = &snapshot[start..end];
        let total: usize = sources.iter().map(|v| v.len()).sum();
        if total == 0 {
            return;
        }

        let mut heap = BinaryHeap::with_capacity(sources.len());
        for (idx, vector) in sources.iter().enumerate() {
            vector.sort(self.comparator.as_ref());
            let items = vector.sorted_items();
            if let Some(first) = items.first() {
                heap.push(MergeEntry {
                    key: first.clone(),
                    source: idx,
                    pos: 0,
                    comparator: Arc::clone(&self.comparator),
                });
            }
        }

        let mut merged = Vec::with_capacity(total);
        while let Some(entry) = heap.pop() {
            merged.push(entry.key);
            let items = sources[entry.source].sorted_items();
            let next = entry.pos + 1;
            if next < items.len() {
                heap.push(MergeEntry {
                    key: items[next].clone(),
                    source: entry.source,
                    pos: next,
                    comparator: Arc::clone(&self.comparator),
                });
            }
        }

        let elements = merged.len();
        let replacement = Arc::new(SortedVector::from_sorted(merged));
        {
            let mut vectors = self.vectors.write();
            let _removed: Vec<_> = vectors
                .splice(start..end, std::iter::once(replacement))
                .collect();
        }
        self.meter.emit(EngineEvent::Memtable(MemEvt {
            kind: MemKind::VectorsMerged {
                merged: end - start,
                elements,
            },
        }));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compare::{encode_internal_key, InternalKeyComparator, ValueKind};
    use silt_observe::NoopMeter;

    fn cmp() -> Arc<dyn KeyComparator> {
        Arc::new(InternalKeyComparator::default())
    }

    fn key(user: &str, seq: u64) -> Bytes {
        encode_internal_key(user.as_bytes(), seq, ValueKind::Value)
    }

    #[test]
    fn add_overflows_at_capacity() {
        let v = SortedVector::new(2);
        assert!(v.add(key("a", 1)));
        assert!(v.add(key("b", 2)));
        assert!(!v.add(key("c", 3)));
        assert_eq!(v.len(), 2);
    }

    #[test]
    fn sort_publishes_ordered_view() {
        let v = SortedVector::new(8);
        v.add(key("c", 1));
        v.add(key("a", 2));
        v.add(key("b", 3));

        assert!(!v.is_sorted());
        assert!(v.sort(cmp().as_ref()));
        assert!(v.is_sorted());

        let items = v.sorted_items();
        let users: Vec<_> = items
            .iter()
            .map(|k| crate::compare::decode_internal_key(k).0.to_vec())
            .collect();
        assert_eq!(users, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[test]
    fn sort_of_empty_vector_returns_false() {
        let v = SortedVector::new(4);
        assert!(!v.sort(cmp().as_ref()));
    }

    #[test]
    fn container_appends_fresh_tail_on_overflow() {
        let container = Arc::new(VectorContainer::new(cmp(), 2, Arc::new(NoopMeter)));
        for i in 0..5u64 {
            container.insert(key(&format!("k{}", i), i + 1));
        }
        assert_eq!(container.num_elements(), 5);
        assert!(container.vectors.read().len() >= 3);
    }

    #[test]
    fn iterator_snapshot_excludes_live_tail() {
        let container = Arc::new(VectorContainer::new(cmp(), 4, Arc::new(NoopMeter)));
        container.insert(key("a", 1));
        let snapshot = container.snapshot_for_iter();
        // one non-empty vector captured; a fresh empty tail was appended
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].len(), 1);
        assert!(container.vectors.read().last().unwrap().is_empty());

        // an empty tail is reused, not stacked
        let again = container.snapshot_for_iter();
        assert_eq!(again.len(), 1);
        assert_eq!(container.vectors.read().len(), 2);
    }

    #[test]
    fn merge_collapses_small_runs() {
        let container = Arc::new(VectorContainer::new(cmp(), 100, Arc::new(NoopMeter)));
        // Ten sealed vectors of one element each, plus an empty tail.
        let mut vectors: Vec<Arc<SortedVector>> = (0..10u64)
            .map(|i| {
                let v = SortedVector::new(100);
                v.add(key(&format!("k{:02}", i), i + 1));
                v.sort(container.comparator().as_ref());
                Arc::new(v)
            })
            .collect();
        vectors.push(Arc::new(SortedVector::new(100)));
        *container.vectors.write() = vectors;

        let snapshot = container.vectors.read().clone();
        let tail = snapshot.len() - 1;
        assert!(container.try_merge_vectors(&snapshot, tail));

        let after = container.vectors.read();
        // A run of MERGED_VECTORS_MAX vectors collapsed into one.
        assert_eq!(after.len(), 11 - MERGED_VECTORS_MAX + 1);
        assert_eq!(after[0].len(), MERGED_VECTORS_MAX);
        assert!(after[0].is_sorted());
    }
}
