//! LSM shape metadata the compaction picker observes and the compaction
//! descriptions it produces.

use bytes::Bytes;
use std::sync::Arc;

/// One sorted run on disk, as the picker sees it. Key bounds are user keys.
#[derive(Debug, Clone)]
pub struct FileMetadata {
    pub file_number: u64,
    pub size: u64,
    pub smallest: Bytes,
    pub largest: Bytes,
}

/// Per-level file lists.
///
/// Levels ≥ 1 keep files sorted by smallest key and non-overlapping. L0 is
/// append-ordered, oldest first, and files may overlap.
#[derive(Debug, Default)]
pub struct VersionStorage {
    levels: Vec<Vec<Arc<FileMetadata>>>,
}

impl VersionStorage {
    pub fn new(num_levels: usize) -> Self {
        Self {
            levels: vec![Vec::new(); num_levels],
        }
    }

    pub fn num_levels(&self) -> usize {
        self.levels.len()
    }

    pub fn last_level(&self) -> usize {
        self.levels.len() - 1
    }

    /// Files at `level`; out-of-range levels read as empty.
    pub fn level_files(&self, level: usize) -> &[Arc<FileMetadata>] {
        self.levels.get(level).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn level_bytes(&self, level: usize) -> u64 {
        self.level_files(level).iter().map(|f| f.size).sum()
    }

    /// Adds a file. L0 appends; deeper levels insert in smallest-key order.
    pub fn add_file(&mut self, level: usize, file: FileMetadata) {
        let file = Arc::new(file);
        let files = &mut self.levels[level];
        if level == 0 {
            files.push(file);
            return;
        }
        let pos = files.partition_point(|f| f.smallest < file.smallest);
        files.insert(pos, file);
    }

    pub fn remove_file(&mut self, level: usize, file_number: u64) {
        self.levels[level].retain(|f| f.file_number != file_number);
    }
}

/// Why a compaction was picked; the scheduler treats some reasons specially
/// (rearranges are trivial moves and exclude each other globally).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionReason {
    LevelL0FilesNum,
    LevelMaxLevelSize,
    Rearrange,
    ReduceNumFiles,
    Manual,
}

#[derive(Debug, Clone, Default)]
pub struct CompactionInputFiles {
    pub level: usize,
    pub files: Vec<Arc<FileMetadata>>,
}

impl CompactionInputFiles {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}

/// A unit of work for the compaction worker pool.
#[derive(Debug)]
pub struct Compaction {
    pub inputs: Vec<CompactionInputFiles>,
    pub output_level: usize,
    pub reason: CompactionReason,
    pub max_subcompactions: usize,
    /// Target output file size; `None` leaves output sizing to the writer.
    pub output_file_size: Option<u64>,
    /// Last-level files used to align output file cuts.
    pub grandparents: Vec<Arc<FileMetadata>>,
    pub trivial_move: bool,
}

impl Compaction {
    pub fn start_level(&self) -> usize {
        self.inputs.first().map(|input| input.level).unwrap_or(0)
    }

    pub fn is_trivial_move(&self) -> bool {
        self.trivial_move
    }

    pub fn input_file_count(&self) -> usize {
        self.inputs.iter().map(|input| input.files.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(number: u64, smallest: &str, largest: &str, size: u64) -> FileMetadata {
        FileMetadata {
            file_number: number,
            size,
            smallest: Bytes::copy_from_slice(smallest.as_bytes()),
            largest: Bytes::copy_from_slice(largest.as_bytes()),
        }
    }

    #[test]
    fn deep_levels_stay_sorted_by_smallest() {
        let mut storage = VersionStorage::new(4);
        storage.add_file(2, file(1, "m", "p", 100));
        storage.add_file(2, file(2, "a", "c", 100));
        storage.add_file(2, file(3, "f", "h", 100));

        let smallests: Vec<_> = storage
            .level_files(2)
            .iter()
            .map(|f| f.smallest.clone())
            .collect();
        assert_eq!(smallests, vec![Bytes::from("a"), Bytes::from("f"), Bytes::from("m")]);
    }

    #[test]
    fn l0_keeps_arrival_order() {
        let mut storage = VersionStorage::new(4);
        storage.add_file(0, file(1, "m", "p", 100));
        storage.add_file(0, file(2, "a", "c", 100));
        let numbers: Vec<_> = storage.level_files(0).iter().map(|f| f.file_number).collect();
        assert_eq!(numbers, vec![1, 2]);
    }

    #[test]
    fn level_bytes_sums_files() {
        let mut storage = VersionStorage::new(4);
        storage.add_file(1, file(1, "a", "c", 100));
        storage.add_file(1, file(2, "d", "f", 250));
        assert_eq!(storage.level_bytes(1), 350);
        assert_eq!(storage.level_bytes(3), 0);
        // out of range reads as empty
        assert!(storage.level_files(17).is_empty());
    }
}
