//! Table pinning policies: decide which metadata blocks may stay pinned in
//! the block cache, under a budget.
//!
//! Policies answer `check_pin`; the [`RecordingPinningPolicy`] wrapper owns
//! the usage counter and the pinned-entry ledger around an inner policy.

use crate::config::PinningConfig;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

/// Where in the metadata hierarchy a block sits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HierarchyCategory {
    TopLevel,
    Partition,
    Other,
}

impl HierarchyCategory {
    pub fn name(&self) -> &'static str {
        match self {
            HierarchyCategory::TopLevel => "top-level",
            HierarchyCategory::Partition => "partition",
            HierarchyCategory::Other => "other",
        }
    }
}

/// What the pinned block holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockRole {
    Index,
    Filter,
    Data,
}

/// Per-file context handed to a policy.
#[derive(Debug, Clone)]
pub struct TablePinningInfo {
    pub level: i32,
    pub is_last_level_with_data: bool,
    pub item_owner_id: u64,
    pub file_size: usize,
    pub max_file_size_for_l0_meta_pin: usize,
}

impl TablePinningInfo {
    pub fn new(
        level: i32,
        is_last_level_with_data: bool,
        item_owner_id: u64,
        file_size: usize,
        max_file_size_for_l0_meta_pin: usize,
    ) -> Self {
        // L0 (or an invalid level) can never be the last level holding data.
        let is_last_level_with_data = if is_last_level_with_data && level <= 0 {
            debug_assert!(level > 0);
            false
        } else {
            is_last_level_with_data
        };
        Self {
            level,
            is_last_level_with_data,
            item_owner_id,
            file_size,
            max_file_size_for_l0_meta_pin,
        }
    }
}

/// An admitted pin.
#[derive(Debug, Clone)]
pub struct PinnedEntry {
    pub level: i32,
    pub is_last_level_with_data: bool,
    pub category: HierarchyCategory,
    pub item_owner_id: u64,
    pub role: BlockRole,
    pub size: usize,
}

/// Pinning tiers, lowest to highest. `Fallback` defers to a configured
/// secondary tier exactly once; it is an enum value, not a nested policy, so
/// fallback-to-fallback cannot be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinningTier {
    Fallback,
    None,
    FlushedAndSimilar,
    All,
}

pub trait TablePinningPolicy: Send + Sync + 'static {
    fn name(&self) -> &'static str;

    /// May `size` more bytes be pinned, given `usage` bytes already pinned?
    fn check_pin(
        &self,
        tpi: &TablePinningInfo,
        category: HierarchyCategory,
        role: BlockRole,
        size: usize,
        usage: usize,
    ) -> bool;
}

/// The tiered default policy.
pub struct DefaultPinningPolicy {
    top_level_index_pinning: PinningTier,
    partition_pinning: PinningTier,
    unpartitioned_pinning: PinningTier,
    pin_top_level_index_and_filter: bool,
    pin_l0_index_and_filter: bool,
}

impl Default for DefaultPinningPolicy {
    fn default() -> Self {
        Self::new(
            PinningTier::Fallback,
            PinningTier::Fallback,
            PinningTier::Fallback,
            true,
            false,
        )
    }
}

impl DefaultPinningPolicy {
    pub fn new(
        top_level_index_pinning: PinningTier,
        partition_pinning: PinningTier,
        unpartitioned_pinning: PinningTier,
        pin_top_level_index_and_filter: bool,
        pin_l0_index_and_filter: bool,
    ) -> Self {
        Self {
            top_level_index_pinning,
            partition_pinning,
            unpartitioned_pinning,
            pin_top_level_index_and_filter,
            pin_l0_index_and_filter,
        }
    }

    fn is_pinned(
        &self,
        tpi: &TablePinningInfo,
        tier: PinningTier,
        fallback_tier: PinningTier,
    ) -> bool {
        debug_assert!(fallback_tier != PinningTier::Fallback);
        let effective = if tier == PinningTier::Fallback {
            fallback_tier
        } else {
            tier
        };
        match effective {
            PinningTier::None => false,
            PinningTier::FlushedAndSimilar => {
                tpi.level == 0 && tpi.file_size <= tpi.max_file_size_for_l0_meta_pin
            }
            PinningTier::All => true,
            PinningTier::Fallback => false,
        }
    }
}

impl TablePinningPolicy for DefaultPinningPolicy {
    fn name(&self) -> &'static str {
        "DefaultPinningPolicy"
    }

    fn check_pin(
        &self,
        tpi: &TablePinningInfo,
        category: HierarchyCategory,
        _role: BlockRole,
        _size: usize,
        _usage: usize,
    ) -> bool {
        if tpi.level < 0 {
            return false;
        }
        match category {
            HierarchyCategory::TopLevel => self.is_pinned(
                tpi,
                self.top_level_index_pinning,
                if self.pin_top_level_index_and_filter {
                    PinningTier::All
                } else {
                    PinningTier::None
                },
            ),
            HierarchyCategory::Partition => self.is_pinned(
                tpi,
                self.partition_pinning,
                if self.pin_l0_index_and_filter {
                    PinningTier::FlushedAndSimilar
                } else {
                    PinningTier::None
                },
            ),
            HierarchyCategory::Other => self.is_pinned(
                tpi,
                self.unpartitioned_pinning,
                if self.pin_l0_index_and_filter {
                    PinningTier::FlushedAndSimilar
                } else {
                    PinningTier::None
                },
            ),
        }
    }
}

/// Budgeted policy: the last level holding data and the mid levels each get
/// a percentage bucket of the capacity, everything else the whole of it.
pub struct ScopedPinningPolicy {
    options: PinningConfig,
}

impl ScopedPinningPolicy {
    pub fn new(options: PinningConfig) -> Self {
        Self { options }
    }
}

impl Default for ScopedPinningPolicy {
    fn default() -> Self {
        Self::new(PinningConfig::default())
    }
}

impl TablePinningPolicy for ScopedPinningPolicy {
    fn name(&self) -> &'static str {
        "ScopedPinningPolicy"
    }

    fn check_pin(
        &self,
        tpi: &TablePinningInfo,
        _category: HierarchyCategory,
        _role: BlockRole,
        size: usize,
        usage: usize,
    ) -> bool {
        let proposed = usage + size;

        if tpi.is_last_level_with_data && self.options.last_level_with_data_percent > 0 {
            proposed
                <= self.options.capacity * self.options.last_level_with_data_percent as usize / 100
        } else if tpi.level > 0 && self.options.mid_percent > 0 {
            proposed <= self.options.capacity * self.options.mid_percent as usize / 100
        } else {
            proposed <= self.options.capacity
        }
    }
}

/// Wraps a policy with usage accounting and a ledger of admitted pins.
pub struct RecordingPinningPolicy {
    inner: Arc<dyn TablePinningPolicy>,
    usage: AtomicUsize,
    pinned: Mutex<Vec<PinnedEntry>>,
}

impl RecordingPinningPolicy {
    pub fn new(inner: Arc<dyn TablePinningPolicy>) -> Self {
        Self {
            inner,
            usage: AtomicUsize::new(0),
            pinned: Mutex::new(Vec::new()),
        }
    }

    pub fn usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    pub fn pinned_entries(&self) -> Vec<PinnedEntry> {
        self.pinned.lock().clone()
    }

    /// Consults the inner policy and, on admit, records the pin.
    pub fn pin(
        &self,
        tpi: &TablePinningInfo,
        category: HierarchyCategory,
        role: BlockRole,
        size: usize,
    ) -> Option<PinnedEntry> {
        let usage = self.usage();
        if !self.inner.check_pin(tpi, category, role, size, usage) {
            return None;
        }
        self.usage.fetch_add(size, Ordering::Relaxed);
        let entry = PinnedEntry {
            level: tpi.level,
            is_last_level_with_data: tpi.is_last_level_with_data,
            category,
            item_owner_id: tpi.item_owner_id,
            role,
            size,
        };
        self.pinned.lock().push(entry.clone());
        Some(entry)
    }

    pub fn unpin(&self, entry: &PinnedEntry) {
        self.usage.fetch_sub(entry.size, Ordering::Relaxed);
        let mut pinned = self.pinned.lock();
        if let Some(pos) = pinned.iter().position(|candidate| {
            candidate.item_owner_id == entry.item_owner_id
                && candidate.level == entry.level
                && candidate.size == entry.size
                && candidate.category == entry.category
                && candidate.role == entry.role
        }) {
            pinned.remove(pos);
        }
    }
}

type PolicyFactory = fn() -> Arc<dyn TablePinningPolicy>;

/// Builtin policy factories. Process-wide: initialized once on first use,
/// never freed.
fn builtin_policies() -> &'static [(&'static str, PolicyFactory)] {
    static REGISTRY: OnceLock<Vec<(&'static str, PolicyFactory)>> = OnceLock::new();
    REGISTRY.get_or_init(|| {
        vec![
            ("DefaultPinningPolicy", || {
                Arc::new(DefaultPinningPolicy::default())
            }),
            ("ScopedPinningPolicy", || {
                Arc::new(ScopedPinningPolicy::default())
            }),
        ]
    })
}

/// Looks a builtin policy up by name.
pub fn create_pinning_policy(name: &str) -> Option<Arc<dyn TablePinningPolicy>> {
    builtin_policies()
        .iter()
        .find(|(candidate, _)| *candidate == name)
        .map(|(_, factory)| factory())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scoped() -> ScopedPinningPolicy {
        ScopedPinningPolicy::new(PinningConfig {
            capacity: 1000,
            last_level_with_data_percent: 10,
            mid_percent: 50,
        })
    }

    fn info(level: i32, last: bool) -> TablePinningInfo {
        TablePinningInfo::new(level, last, 7, 4096, 8192)
    }

    #[test]
    fn scoped_last_level_bucket() {
        let policy = scoped();
        let tpi = info(5, true);
        // 10% of 1000
        assert!(policy.check_pin(&tpi, HierarchyCategory::Other, BlockRole::Index, 100, 0));
        assert!(!policy.check_pin(&tpi, HierarchyCategory::Other, BlockRole::Index, 101, 0));
        assert!(!policy.check_pin(&tpi, HierarchyCategory::Other, BlockRole::Index, 50, 60));
    }

    #[test]
    fn scoped_mid_level_bucket() {
        let policy = scoped();
        let tpi = info(3, false);
        assert!(policy.check_pin(&tpi, HierarchyCategory::Other, BlockRole::Index, 500, 0));
        assert!(!policy.check_pin(&tpi, HierarchyCategory::Other, BlockRole::Index, 501, 0));
    }

    #[test]
    fn scoped_level0_uses_global_capacity() {
        let policy = scoped();
        let tpi = info(0, false);
        assert!(policy.check_pin(&tpi, HierarchyCategory::Other, BlockRole::Index, 1000, 0));
        assert!(!policy.check_pin(&tpi, HierarchyCategory::Other, BlockRole::Index, 1001, 0));
    }

    #[test]
    fn scoped_disabled_bucket_falls_through() {
        let policy = ScopedPinningPolicy::new(PinningConfig {
            capacity: 1000,
            last_level_with_data_percent: 0,
            mid_percent: 0,
        });
        let tpi = info(5, true);
        // both buckets disabled: the global capacity applies
        assert!(policy.check_pin(&tpi, HierarchyCategory::Other, BlockRole::Index, 900, 0));
    }

    #[test]
    fn sanitize_rejects_l0_as_last_level_with_data() {
        let tpi = TablePinningInfo::new(0, true, 1, 10, 10);
        assert!(!tpi.is_last_level_with_data);
    }

    #[test]
    fn default_policy_pins_top_level_via_fallback() {
        let policy = DefaultPinningPolicy::default();
        let tpi = info(2, false);
        assert!(policy.check_pin(&tpi, HierarchyCategory::TopLevel, BlockRole::Index, 1, 0));
        // partition fallback is kNone when pin_l0 is off
        assert!(!policy.check_pin(&tpi, HierarchyCategory::Partition, BlockRole::Index, 1, 0));
    }

    #[test]
    fn flushed_and_similar_admits_small_l0_only() {
        let policy = DefaultPinningPolicy::new(
            PinningTier::FlushedAndSimilar,
            PinningTier::FlushedAndSimilar,
            PinningTier::FlushedAndSimilar,
            false,
            false,
        );
        let small_l0 = TablePinningInfo::new(0, false, 1, 4096, 8192);
        let big_l0 = TablePinningInfo::new(0, false, 1, 16384, 8192);
        let mid = TablePinningInfo::new(2, false, 1, 4096, 8192);

        assert!(policy.check_pin(&small_l0, HierarchyCategory::Other, BlockRole::Filter, 1, 0));
        assert!(!policy.check_pin(&big_l0, HierarchyCategory::Other, BlockRole::Filter, 1, 0));
        assert!(!policy.check_pin(&mid, HierarchyCategory::Other, BlockRole::Filter, 1, 0));
    }

    #[test]
    fn negative_level_never_pins() {
        let policy = DefaultPinningPolicy::default();
        let tpi = TablePinningInfo::new(-1, false, 1, 10, 10);
        assert!(!policy.check_pin(&tpi, HierarchyCategory::TopLevel, BlockRole::Index, 1, 0));
    }

    #[test]
    fn recorder_tracks_usage_and_ledger() {
        let recorder = RecordingPinningPolicy::new(Arc::new(scoped()));
        let tpi = info(3, false);

        let entry = recorder
            .pin(&tpi, HierarchyCategory::Partition, BlockRole::Filter, 400)
            .expect("within the mid bucket");
        assert_eq!(recorder.usage(), 400);
        assert_eq!(recorder.pinned_entries().len(), 1);

        // bucket exhausted
        assert!(recorder
            .pin(&tpi, HierarchyCategory::Partition, BlockRole::Filter, 200)
            .is_none());

        recorder.unpin(&entry);
        assert_eq!(recorder.usage(), 0);
        assert!(recorder.pinned_entries().is_empty());
    }

    #[test]
    fn registry_resolves_builtins() {
        assert!(create_pinning_policy("ScopedPinningPolicy").is_some());
        assert!(create_pinning_policy("DefaultPinningPolicy").is_some());
        assert!(create_pinning_policy("nope").is_none());
    }
}
