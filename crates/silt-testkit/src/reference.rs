//! A sorted-set reference model for memtable fuzzing.

use bytes::Bytes;
use std::collections::BTreeSet;

/// The model the real memtable is checked against: a `BTreeSet` of internal
/// keys ordered by `(user_key asc, sequence desc)` — the same order the
/// engine's internal-key comparator produces for distinct sequence numbers.
#[derive(Debug, Default)]
pub struct ReferenceMemtable {
    keys: BTreeSet<(Bytes, std::cmp::Reverse<u64>)>,
}

impl ReferenceMemtable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirrors `Memtable::insert`: returns false on an exact duplicate.
    pub fn insert(&mut self, user_key: Bytes, sequence: u64) -> bool {
        self.keys.insert((user_key, std::cmp::Reverse(sequence)))
    }

    pub fn contains(&self, user_key: &[u8], sequence: u64) -> bool {
        self.keys
            .contains(&(Bytes::copy_from_slice(user_key), std::cmp::Reverse(sequence)))
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    /// All (user_key, sequence) pairs in comparator order.
    pub fn ordered(&self) -> Vec<(Bytes, u64)> {
        self.keys.iter().map(|(k, s)| (k.clone(), s.0)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn duplicate_insert_rejected() {
        let mut model = ReferenceMemtable::new();
        assert!(model.insert(Bytes::from("a"), 1));
        assert!(!model.insert(Bytes::from("a"), 1));
        assert!(model.insert(Bytes::from("a"), 2));
        assert_eq!(model.len(), 2);
    }

    #[test]
    fn ordering_is_user_key_then_sequence_desc() {
        let mut model = ReferenceMemtable::new();
        model.insert(Bytes::from("b"), 5);
        model.insert(Bytes::from("a"), 1);
        model.insert(Bytes::from("a"), 9);

        let ordered = model.ordered();
        assert_eq!(
            ordered,
            vec![
                (Bytes::from("a"), 9),
                (Bytes::from("a"), 1),
                (Bytes::from("b"), 5),
            ]
        );
    }
}
