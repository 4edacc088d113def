//! Ordered iteration over a memtable snapshot.
//!
//! Each captured vector contributes one cursor; the cursors sit in a
//! comparator-ordered heap (min-heap going forward, max-heap going
//! backward). Seeks binary-search every sealed vector; direction switches
//! re-seek around the current key, which is exact because the hash table
//! guarantees no duplicate internal keys across vectors.

use super::vector::SortedVector;
use crate::compare::KeyComparator;
use bytes::Bytes;
use std::collections::BinaryHeap;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Backward,
}

struct Cursor {
    vector: Arc<SortedVector>,
    pos: usize,
}

struct HeapEntry {
    key: Bytes,
    cursor: usize,
    reverse: bool,
    comparator: Arc<dyn KeyComparator>,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.comparator.compare(&self.key, &other.key) == std::cmp::Ordering::Equal
    }
}
impl Eq for HeapEntry {}
impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // BinaryHeap pops the maximum. Forward iteration (`reverse`) flips
        // the key comparison so the smallest key surfaces; backward keeps
        // the natural order.
        if self.reverse {
            self.comparator.compare(&other.key, &self.key)
        } else {
            self.comparator.compare(&self.key, &other.key)
        }
    }
}

pub struct MemtableIterator {
    comparator: Arc<dyn KeyComparator>,
    cursors: Vec<Cursor>,
    heap: BinaryHeap<HeapEntry>,
    direction: Direction,
}

impl MemtableIterator {
    pub(crate) fn new(
        vectors: Vec<Arc<SortedVector>>,
        comparator: Arc<dyn KeyComparator>,
    ) -> Self {
        let cursors = vectors
            .into_iter()
            .filter(|v| !v.is_empty())
            .map(|vector| Cursor { vector, pos: 0 })
            .collect();
        Self {
            comparator,
            cursors,
            heap: BinaryHeap::new(),
            direction: Direction::Forward,
        }
    }

    /// An iterator over nothing.
    pub(crate) fn empty(comparator: Arc<dyn KeyComparator>) -> Self {
        Self::new(Vec::new(), comparator)
    }

    pub fn valid(&self) -> bool {
        !self.heap.is_empty()
    }

    /// The internal key at the current position. Panics when not `valid`.
    pub fn key(&self) -> &[u8] {
        &self.heap.peek().expect("iterator not valid").key
    }

    pub fn seek_to_first(&mut self) {
        self.rebuild(None, Direction::Forward);
    }

    pub fn seek_to_last(&mut self) {
        self.rebuild(None, Direction::Backward);
    }

    /// Positions at the first key ≥ `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.rebuild(Some(target), Direction::Forward);
    }

    /// Positions at the last key ≤ `target`.
    pub fn seek_for_prev(&mut self, target: &[u8]) {
        self.rebuild(Some(target), Direction::Backward);
    }

    pub fn next(&mut self) {
        debug_assert!(self.valid());
        if self.direction == Direction::Backward {
            let current = Bytes::copy_from_slice(self.key());
            // Re-seek lands exactly on the current key, then step over it.
            self.seek(&current);
        }
        self.advance_top_forward();
    }

    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        if self.direction == Direction::Forward {
            let current = Bytes::copy_from_slice(self.key());
            self.seek_for_prev(&current);
        }
        self.advance_top_backward();
    }

    fn advance_top_forward(&mut self) {
        if let Some(entry) = self.heap.pop() {
            let cursor = &mut self.cursors[entry.cursor];
            cursor.pos += 1;
            let items = cursor.vector.sorted_items();
            if cursor.pos < items.len() {
                self.heap.push(HeapEntry {
                    key: items[cursor.pos].clone(),
                    cursor: entry.cursor,
                    reverse: true,
                    comparator: Arc::clone(&self.comparator),
                });
            }
        }
    }

    fn advance_top_backward(&mut self) {
        if let Some(entry) = self.heap.pop() {
            let cursor = &mut self.cursors[entry.cursor];
            if cursor.pos > 0 {
                cursor.pos -= 1;
                let items = cursor.vector.sorted_items();
                self.heap.push(HeapEntry {
                    key: items[cursor.pos].clone(),
                    cursor: entry.cursor,
                    reverse: false,
                    comparator: Arc::clone(&self.comparator),
                });
            }
        }
    }

    fn rebuild(&mut self, target: Option<&[u8]>, direction: Direction) {
        self.direction = direction;
        self.heap.clear();

        for idx in 0..self.cursors.len() {
            // Lazily seal anything the sort thread has not reached yet.
            self.cursors[idx].vector.sort(self.comparator.as_ref());
            let positioned = {
                let items = self.cursors[idx].vector.sorted_items();
                if items.is_empty() {
                    continue;
                }
                let pos = match (direction, target) {
                    (Direction::Forward, None) => Some(0),
                    (Direction::Forward, Some(t)) => {
                        let at = items.partition_point(|k| {
                            self.comparator.compare(k, t) == std::cmp::Ordering::Less
                        });
                        (at < items.len()).then_some(at)
                    }
                    (Direction::Backward, None) => Some(items.len() - 1),
                    (Direction::Backward, Some(t)) => {
                        let after = items.partition_point(|k| {
                            self.comparator.compare(k, t) != std::cmp::Ordering::Greater
                        });
                        after.checked_sub(1)
                    }
                };
                pos.map(|pos| (pos, items[pos].clone()))
            };

            if let Some((pos, key)) = positioned {
                self.cursors[idx].pos = pos;
                self.heap.push(HeapEntry {
                    key,
                    cursor: idx,
                    reverse: direction == Direction::Forward,
                    comparator: Arc::clone(&self.comparator),
                });
            }
        }
    }
}
