use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

/// Top-level configuration for the engine core.
///
/// Each subsystem gets its own sub-struct; `validate()` rejects combinations
/// the runtime cannot honor.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Concurrent memtable settings
    pub memtable: MemtableConfig,

    /// Write buffer manager settings
    pub write_buffer: WriteBufferConfig,

    /// Hybrid compaction picker settings
    pub compaction: CompactionConfig,

    /// Table pinning budget
    pub pinning: PinningConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemtableConfig {
    /// Number of hash buckets (default: 1_000_000)
    pub bucket_count: usize,

    /// Number of lock stripes guarding the buckets (default: 1024).
    /// Independent of `bucket_count`; several buckets share a stripe.
    pub stripe_count: usize,

    /// Capacity of each append vector; a full vector is sealed and a fresh
    /// one becomes the tail (default: 10_000)
    pub switch_vector_limit: usize,

    /// Arena chunk size in bytes (default: 256 KiB)
    pub arena_block_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteBufferConfig {
    /// Total memory budget across all registered DBs, in bytes.
    /// 0 disables the manager: usage is not capped and `should_flush()` is
    /// always true (default: 512 MiB)
    pub buffer_bytes: usize,

    /// Park writers on a stall queue once usage reaches `buffer_bytes`
    /// (default: false)
    pub allow_stall: bool,

    /// Run the flush initiation thread (default: true)
    pub initiate_flushes: bool,

    /// Upper bound on concurrently running + pending initiated flushes
    /// (default: 4)
    pub max_parallel_flushes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Size of one full write buffer in bytes; the base unit of
    /// `size_to_compact` per hyper-level (default: 64 MiB)
    pub write_buffer_size: usize,

    /// Physical level count, including L0 and the sink (default: 64)
    pub num_levels: usize,

    /// Lower clamp for the hyper-level merge width (default: 4)
    pub min_merge_width: usize,

    /// Upper clamp for the hyper-level merge width (default: 8)
    pub max_merge_width: usize,

    /// L0 file count that triggers an L0 compaction (default: 4)
    pub level0_file_num_compaction_trigger: usize,

    /// Space amplification bound, percent of logical data size.
    /// Must be within [110, 200] (default: 200)
    pub max_size_amplification_percent: u32,

    /// Open-file budget; the picker coalesces last-level files once their
    /// count exceeds half of this (default: 10_000)
    pub max_open_files: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PinningConfig {
    /// Total pinning budget in bytes (default: 1 GiB)
    pub capacity: usize,

    /// Percent of `capacity` available to the last level holding data;
    /// 0 disables the scoped bucket (default: 10)
    pub last_level_with_data_percent: u32,

    /// Percent of `capacity` available to mid levels (level > 0);
    /// 0 disables the scoped bucket (default: 80)
    pub mid_percent: u32,
}

impl Default for MemtableConfig {
    fn default() -> Self {
        Self {
            bucket_count: 1_000_000,
            stripe_count: 1024,
            switch_vector_limit: 10_000,
            arena_block_bytes: 256 * 1024,
        }
    }
}

impl Default for WriteBufferConfig {
    fn default() -> Self {
        Self {
            buffer_bytes: 512 * 1024 * 1024,
            allow_stall: false,
            initiate_flushes: true,
            max_parallel_flushes: 4,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            write_buffer_size: 64 * 1024 * 1024,
            num_levels: 64,
            min_merge_width: 4,
            max_merge_width: 8,
            level0_file_num_compaction_trigger: 4,
            max_size_amplification_percent: 200,
            max_open_files: 10_000,
        }
    }
}

impl Default for PinningConfig {
    fn default() -> Self {
        Self {
            capacity: 1024 * 1024 * 1024,
            last_level_with_data_percent: 10,
            mid_percent: 80,
        }
    }
}

impl EngineConfig {
    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.memtable.bucket_count == 0 {
            return Err(Error::Config("bucket_count must be > 0".to_string()));
        }
        if self.memtable.stripe_count == 0 {
            return Err(Error::Config("stripe_count must be > 0".to_string()));
        }
        if self.memtable.switch_vector_limit == 0 {
            return Err(Error::Config(
                "switch_vector_limit must be > 0".to_string(),
            ));
        }
        if self.memtable.arena_block_bytes == 0 {
            return Err(Error::Config("arena_block_bytes must be > 0".to_string()));
        }

        if self.write_buffer.max_parallel_flushes == 0 {
            return Err(Error::Config(
                "max_parallel_flushes must be > 0".to_string(),
            ));
        }

        self.compaction.validate()?;

        if self.pinning.last_level_with_data_percent > 100 || self.pinning.mid_percent > 100 {
            return Err(Error::Config(
                "pinning percents must be in [0, 100]".to_string(),
            ));
        }

        Ok(())
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.write_buffer_size == 0 {
            return Err(Error::Config("write_buffer_size must be > 0".to_string()));
        }
        if self.min_merge_width < 2 || self.max_merge_width < self.min_merge_width {
            return Err(Error::Config(format!(
                "merge width bounds invalid: min {} max {}",
                self.min_merge_width, self.max_merge_width
            )));
        }
        if self.max_size_amplification_percent < 110 || self.max_size_amplification_percent > 200 {
            return Err(Error::Config(format!(
                "max_size_amplification_percent ({}) must be in [110, 200]",
                self.max_size_amplification_percent
            )));
        }
        if self.level0_file_num_compaction_trigger == 0 {
            return Err(Error::Config(
                "level0_file_num_compaction_trigger must be > 0".to_string(),
            ));
        }
        if self.num_levels < 8 {
            return Err(Error::Config("num_levels must be >= 8".to_string()));
        }
        Ok(())
    }

    /// The merge width actually used, clamped to the configured bounds.
    pub fn clamped_merge_width(&self, requested: usize) -> usize {
        if requested < self.min_merge_width || requested > self.max_merge_width {
            self.max_merge_width
        } else {
            requested
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        let config = EngineConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn zero_buckets_rejected() {
        let mut config = EngineConfig::default();
        config.memtable.bucket_count = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn space_amp_bounds_enforced() {
        let mut config = EngineConfig::default();
        config.compaction.max_size_amplification_percent = 100;
        assert!(config.validate().is_err());
        config.compaction.max_size_amplification_percent = 250;
        assert!(config.validate().is_err());
        config.compaction.max_size_amplification_percent = 150;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn merge_width_clamped_to_max_when_out_of_range() {
        let config = CompactionConfig::default();
        assert_eq!(config.clamped_merge_width(1), 8);
        assert_eq!(config.clamped_merge_width(4), 4);
        assert_eq!(config.clamped_merge_width(6), 6);
        assert_eq!(config.clamped_merge_width(20), 8);
    }

    #[test]
    fn pinning_percent_bounds() {
        let mut config = EngineConfig::default();
        config.pinning.mid_percent = 101;
        assert!(config.validate().is_err());
    }
}
