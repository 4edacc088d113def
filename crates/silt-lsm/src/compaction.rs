//! Hybrid compaction picker.
//!
//! Physical levels are grouped into *hyper-levels*: H=0 is L0, every H≥1 is a
//! fixed band of levels. Inside a band, data always sits in the
//! highest-numbered (deepest) levels; a *rearrange* trivially moves files
//! down to restore that shape after a compaction consumed the deep levels.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │ H=0   L0 (flush target, overlapping files)                   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ H=1   L1 .. L1+k      ── mostly empty, data at the bottom    │
//! ├──────────────────────────────────────────────────────────────┤
//! │ H=2   ...             ── each band is `multiplier`× bigger   │
//! ├──────────────────────────────────────────────────────────────┤
//! │ last  sink level      ── bounded by space-amp factor         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Per tick the picker emits at most one compaction, in priority order:
//! rearranges, hyper-level promotion when the DB outgrew its shape, large-SST
//! relocation, L0 intake, in-band level compactions via `select_n_buffers`,
//! and last-level small-file coalescing.

use crate::compare::{BytewiseComparator, Comparator};
use crate::config::CompactionConfig;
use crate::version::{
    Compaction, CompactionInputFiles, CompactionReason, FileMetadata, VersionStorage,
};
use bytes::Bytes;
use parking_lot::Mutex;
use silt_observe::{CompEvt, CompKind, EngineEvent, Meter, NoopMeter};
use std::cmp::Ordering;
use std::sync::Arc;

const MIN_NUM_HYPER_LEVELS: usize = 1;
const MAX_NUM_HYPER_LEVELS: usize = 5;

/// Physical levels per hyper-level beyond the merge width. Leaves headroom
/// for the forced-depth probe (`last − multiplier − 6`) and the rush probes
/// at `first + 3` / `first + 4`.
const HYPER_LEVEL_PADDING: usize = 10;

/// Upper bound on files consumed by one small-file coalescing compaction.
const REDUCE_NUM_FILES_MAX: usize = 200;

/// Cursor for resuming a partial range sweep of a hyper-level.
#[derive(Debug, Clone, Default)]
struct SubCompaction {
    output_level: usize,
    last_key: Bytes,
}

impl SubCompaction {
    fn set_empty(&mut self) {
        self.output_level = 0;
        self.last_key = Bytes::new();
    }

    fn is_empty(&self) -> bool {
        self.output_level == 0
    }
}

#[derive(Debug, Clone, Default)]
struct RunningLevel {
    n_compactions: usize,
    has_rearrange: bool,
}

/// Snapshot of the compactions currently in progress, bucketed per
/// hyper-level.
#[derive(Debug, Default)]
struct RunningDescriptor {
    levels: Vec<RunningLevel>,
    rearrange_running: bool,
    manual_running: bool,
}

struct PickerState {
    cur_num_hyper_levels: usize,
    max_num_hyper_levels: usize,
    multiplier: Vec<usize>,
    size_to_compact: Vec<u64>,
    prev_sub_compaction: Vec<SubCompaction>,
    level0_compaction_trigger: usize,
    space_amp_factor: f64,
}

/// Selection bounds threaded through `select_n_buffers`.
///
/// `[smallest, largest]` is the closed key range of the files picked so far;
/// `(lower, upper)` is the open range every further pick must stay inside.
struct SelectionBounds {
    smallest: Bytes,
    largest: Bytes,
    lower: Option<Bytes>,
    upper: Option<Bytes>,
    last_file_selected: bool,
}

pub struct HybridCompactionPicker {
    config: CompactionConfig,
    ucmp: Arc<dyn Comparator>,
    meter: Arc<dyn Meter>,
    levels_per_hyper: usize,
    state: Mutex<PickerState>,
    running: Mutex<Vec<Arc<Compaction>>>,
}

impl HybridCompactionPicker {
    pub fn new(config: CompactionConfig) -> Self {
        Self::with_comparator_and_meter(config, Arc::new(BytewiseComparator), Arc::new(NoopMeter))
    }

    pub fn with_comparator_and_meter(
        config: CompactionConfig,
        ucmp: Arc<dyn Comparator>,
        meter: Arc<dyn Meter>,
    ) -> Self {
        let width = config.clamped_merge_width(config.min_merge_width);
        let slots = MAX_NUM_HYPER_LEVELS + 2;
        Self {
            levels_per_hyper: width + HYPER_LEVEL_PADDING,
            config,
            ucmp,
            meter,
            state: Mutex::new(PickerState {
                cur_num_hyper_levels: 0,
                max_num_hyper_levels: MIN_NUM_HYPER_LEVELS,
                multiplier: vec![width; slots],
                size_to_compact: vec![0; slots],
                prev_sub_compaction: vec![SubCompaction::default(); slots],
                level0_compaction_trigger: width,
                space_amp_factor: 0.0,
            }),
            running: Mutex::new(Vec::new()),
        }
    }

    // ---------------------------------------------------------------------
    // Hyper-level geometry (pure functions of the configured width)
    // ---------------------------------------------------------------------

    pub fn first_level_in_hyper(&self, hyper_level: usize) -> usize {
        if hyper_level == 0 {
            0
        } else {
            1 + (hyper_level - 1) * self.levels_per_hyper
        }
    }

    pub fn last_level_in_hyper(&self, hyper_level: usize) -> usize {
        if hyper_level == 0 {
            0
        } else {
            self.first_level_in_hyper(hyper_level) + self.levels_per_hyper - 1
        }
    }

    pub fn hyper_level_of(&self, level: usize) -> usize {
        if level == 0 {
            0
        } else {
            1 + (level - 1) / self.levels_per_hyper
        }
    }

    /// The sink: one level below the tail band. Moves down whenever a
    /// promotion raises the hyper-level count; the tail band compacts into
    /// it, and its byte size is the DB size every space-amp bound is checked
    /// against.
    fn last_level(&self, state: &PickerState) -> usize {
        self.last_level_in_hyper(state.cur_num_hyper_levels) + 1
    }

    /// The currently active sink level (for the engine and tests).
    pub fn current_last_level(&self) -> usize {
        let state = self.state.lock();
        self.last_level(&state)
    }

    fn hyper_level_size(&self, hyper_level: usize, vstorage: &VersionStorage) -> u64 {
        let first = self.first_level_in_hyper(hyper_level);
        let last = self.last_level_in_hyper(hyper_level);
        (first..=last).map(|level| vstorage.level_bytes(level)).sum()
    }

    // ---------------------------------------------------------------------
    // Running-compaction registry
    // ---------------------------------------------------------------------

    /// Snapshot of in-progress compactions (for the engine and tests).
    pub fn compactions_in_progress(&self) -> Vec<Arc<Compaction>> {
        self.running.lock().clone()
    }

    /// Registers an externally created compaction (e.g. a manual one) so the
    /// picker's concurrency predicates observe it.
    pub fn register_compaction(&self, compaction: Arc<Compaction>) {
        self.running.lock().push(compaction);
    }

    /// The engine reports a compaction finished or aborted.
    pub fn release_compaction(&self, compaction: &Arc<Compaction>) {
        self.running
            .lock()
            .retain(|running| !Arc::ptr_eq(running, compaction));
    }

    fn build_compaction_descriptors(&self, state: &PickerState) -> RunningDescriptor {
        let mut desc = RunningDescriptor {
            levels: vec![RunningLevel::default(); state.cur_num_hyper_levels + 2],
            rearrange_running: false,
            manual_running: false,
        };

        for compaction in self.running.lock().iter() {
            if compaction.reason == CompactionReason::Manual {
                desc.manual_running = true;
            }

            let start_level = compaction.start_level();
            if start_level == 0 {
                desc.levels[0].n_compactions += 1;
                continue;
            }
            let mut hyper_level = self.hyper_level_of(start_level);
            if start_level >= self.last_level(state)
                || hyper_level > state.cur_num_hyper_levels
            {
                hyper_level = state.cur_num_hyper_levels;
            }
            desc.levels[hyper_level].n_compactions += 1;
            if compaction.reason == CompactionReason::Rearrange {
                desc.levels[hyper_level].has_rearrange = true;
                desc.rearrange_running = true;
            }
        }

        desc
    }

    // ---------------------------------------------------------------------
    // Signals
    // ---------------------------------------------------------------------

    pub fn needs_compaction(&self, vstorage: &VersionStorage) -> bool {
        let state = self.state.lock();
        if state.cur_num_hyper_levels == 0 {
            return true; // init
        }

        let running = self.build_compaction_descriptors(&state);
        if running.manual_running {
            return false;
        }

        for hyper_level in 0..=state.cur_num_hyper_levels {
            let rearrange_needed = self.level_needs_rearrange(
                hyper_level,
                vstorage,
                self.first_level_in_hyper(hyper_level),
            );
            if self.may_run_rearrange(hyper_level, &running) && rearrange_needed {
                return true;
            }
            if !rearrange_needed
                && self.may_start_level_compaction(hyper_level, &state, &running, vstorage)
                && self.need_to_run_level_compaction(hyper_level, &state, vstorage)
            {
                return true;
            }
        }

        vstorage.level_files(self.last_level(&state)).len() > self.config.max_open_files / 2
    }

    fn may_run_rearrange(&self, hyper_level: usize, running: &RunningDescriptor) -> bool {
        hyper_level > 0
            && !running.rearrange_running
            && running.levels[hyper_level].n_compactions == 0
    }

    fn may_run_compaction(
        &self,
        hyper_level: usize,
        state: &PickerState,
        running: &RunningDescriptor,
    ) -> bool {
        running.levels[hyper_level].n_compactions == 0
            && (hyper_level == state.cur_num_hyper_levels
                || !running.levels[hyper_level + 1].has_rearrange)
    }

    fn may_start_level_compaction(
        &self,
        hyper_level: usize,
        state: &PickerState,
        running: &RunningDescriptor,
        vstorage: &VersionStorage,
    ) -> bool {
        if running.levels[hyper_level].n_compactions > 0 {
            return false;
        }
        // There must be a free target below the band, unless the cursor is
        // mid-sweep or this is the tail.
        if hyper_level != state.cur_num_hyper_levels
            && state.prev_sub_compaction[hyper_level].is_empty()
            && !vstorage
                .level_files(self.last_level_in_hyper(hyper_level) + 1)
                .is_empty()
        {
            return false;
        }
        true
    }

    /// A hyper-level needs rearranging when a non-empty level is followed by
    /// an empty one inside the band.
    fn level_needs_rearrange(
        &self,
        hyper_level: usize,
        vstorage: &VersionStorage,
        first_level: usize,
    ) -> bool {
        if hyper_level == 0 {
            return false;
        }
        let last_level = self.last_level_in_hyper(hyper_level);
        let mut found_non_empty = false;
        for level in first_level..=last_level {
            let is_empty = vstorage.level_files(level).is_empty();
            if !found_non_empty {
                found_non_empty = !is_empty;
            } else if is_empty {
                return true;
            }
        }
        false
    }

    fn need_to_run_level_compaction(
        &self,
        hyper_level: usize,
        state: &PickerState,
        vstorage: &VersionStorage,
    ) -> bool {
        if hyper_level == 0 {
            return vstorage.level_files(0).len() >= state.level0_compaction_trigger;
        }

        let last_level_in_hyper = self.last_level_in_hyper(hyper_level);
        if vstorage.level_files(last_level_in_hyper).is_empty() {
            return false;
        }

        let force_compact_level = last_level_in_hyper - state.multiplier[hyper_level] - 6;
        let mut max_size = state.size_to_compact[hyper_level];
        if hyper_level == state.cur_num_hyper_levels {
            // take 10% extra before touching the tail
            max_size = (vstorage.level_bytes(self.last_level(state)) as f64
                / (state.space_amp_factor * 1.1)) as u64;
        }

        !vstorage.level_files(force_compact_level).is_empty()
            || self.hyper_level_size(hyper_level, vstorage) > max_size
    }

    // ---------------------------------------------------------------------
    // Picking
    // ---------------------------------------------------------------------

    /// Picks at most one compaction. Returns `None` when nothing is eligible
    /// or a manual compaction is in flight.
    pub fn pick_compaction(
        &self,
        cf_name: &str,
        vstorage: &VersionStorage,
    ) -> Option<Arc<Compaction>> {
        let mut state = self.state.lock();

        if state.cur_num_hyper_levels == 0 {
            self.init_cf(&mut state, vstorage);
            tracing::debug!(
                cf = cf_name,
                cur = state.cur_num_hyper_levels,
                max = state.max_num_hyper_levels,
                "hybrid: init"
            );
        }

        let running = self.build_compaction_descriptors(&state);
        if running.manual_running {
            return None;
        }

        // rearrange first
        for hyper_level in 1..=state.cur_num_hyper_levels {
            if running.levels[hyper_level - 1].n_compactions == 0
                && state.prev_sub_compaction[hyper_level - 1].last_key.is_empty()
            {
                state.prev_sub_compaction[hyper_level - 1].set_empty();
            }

            let mut start_level = self.first_level_in_hyper(hyper_level);
            if self.may_run_rearrange(hyper_level, &running)
                && self.level_needs_rearrange(hyper_level, vstorage, start_level)
            {
                if running.levels[hyper_level - 1].n_compactions == 0 {
                    state.prev_sub_compaction[hyper_level - 1].set_empty();
                } else {
                    start_level = state.prev_sub_compaction[hyper_level - 1].output_level + 1;
                }
                if self.level_needs_rearrange(hyper_level, vstorage, start_level) {
                    if let Some(compaction) =
                        self.rearrange_level(hyper_level, &mut state, vstorage)
                    {
                        tracing::debug!(
                            cf = cf_name,
                            hyper_level,
                            start = compaction.start_level(),
                            output = compaction.output_level,
                            "hybrid: rearranging"
                        );
                        self.meter.emit(EngineEvent::Compaction(CompEvt {
                            output_level: compaction.output_level as u32,
                            kind: CompKind::Rearrange {
                                hyper_level: hyper_level as u32,
                                start_level: compaction.start_level() as u32,
                            },
                        }));
                        return Some(self.register_picked(compaction));
                    }
                    tracing::debug!(cf = cf_name, hyper_level, "hybrid: build rearrange failed");
                }
            }
        }

        // check db size to see if we need to grow the hyper-level count
        if self.may_run_compaction(state.cur_num_hyper_levels, &state, &running)
            && !running.rearrange_running
        {
            if let Some(compaction) = self.check_db_size(cf_name, &mut state, vstorage) {
                self.meter.emit(EngineEvent::Compaction(CompEvt {
                    output_level: compaction.output_level as u32,
                    kind: CompKind::Promote {
                        new_hyper_levels: state.cur_num_hyper_levels as u32,
                    },
                }));
                return Some(self.register_picked(compaction));
            }
            if state.cur_num_hyper_levels > 1
                && self.may_run_compaction(state.cur_num_hyper_levels - 1, &state, &running)
            {
                let last_in_prev = self.last_level_in_hyper(state.cur_num_hyper_levels - 1);
                let db_size = vstorage.level_bytes(self.last_level(&state));
                let level_size = vstorage.level_bytes(last_in_prev);
                let pressure = level_size as f64
                    * state.multiplier[state.cur_num_hyper_levels] as f64
                    * state.space_amp_factor;
                if pressure > db_size as f64 {
                    if let Some(compaction) = self.move_sst_to_last_level(&state, vstorage) {
                        tracing::debug!(
                            cf = cf_name,
                            level_mib = level_size / 1024 / 1024,
                            db_mib = db_size / 1024 / 1024,
                            from = last_in_prev,
                            to = compaction.output_level,
                            "hybrid: moving large sst"
                        );
                        return Some(self.register_picked(compaction));
                    }
                }
            }
        }

        // normal compaction, starting with L0
        if self.may_start_level_compaction(0, &state, &running, vstorage) {
            let l0_threshold = state
                .level0_compaction_trigger
                .min(self.config.level0_file_num_compaction_trigger);
            if vstorage.level_files(0).len() >= l0_threshold {
                if let Some(compaction) =
                    self.pick_level0_compaction(&mut state, vstorage, l0_threshold)
                {
                    tracing::debug!(
                        cf = cf_name,
                        output = compaction.output_level,
                        files = compaction.input_file_count(),
                        "hybrid: compacting L0"
                    );
                    self.meter.emit(EngineEvent::Compaction(CompEvt {
                        output_level: compaction.output_level as u32,
                        kind: CompKind::Level0 {
                            files: compaction.input_file_count(),
                        },
                    }));
                    return Some(self.register_picked(compaction));
                }
            }
        }

        for hyper_level in 1..=state.cur_num_hyper_levels {
            if self.may_start_level_compaction(hyper_level, &state, &running, vstorage)
                && self.need_to_run_level_compaction(hyper_level, &state, vstorage)
            {
                if let Some(compaction) =
                    self.pick_level_compaction(hyper_level, &mut state, vstorage)
                {
                    tracing::debug!(
                        cf = cf_name,
                        hyper_level,
                        start = compaction.start_level(),
                        output = compaction.output_level,
                        "hybrid: compacting hyper level"
                    );
                    self.meter.emit(EngineEvent::Compaction(CompEvt {
                        output_level: compaction.output_level as u32,
                        kind: CompKind::Level {
                            hyper_level: hyper_level as u32,
                            start_level: compaction.start_level() as u32,
                            files: compaction.input_file_count(),
                        },
                    }));
                    return Some(self.register_picked(compaction));
                }
                tracing::debug!(cf = cf_name, hyper_level, "hybrid: build compact failed");
            }
        }

        if self.may_start_level_compaction(state.cur_num_hyper_levels, &state, &running, vstorage)
        {
            let last_level = self.last_level(&state);
            if vstorage.level_files(last_level).len() > self.config.max_open_files / 2 {
                let db_size = vstorage.level_bytes(last_level);
                let min_file_size = (db_size / 1024).min(1 << 28);
                if let Some(compaction) =
                    self.pick_reduce_num_files(vstorage, last_level, min_file_size)
                {
                    tracing::debug!(
                        cf = cf_name,
                        output = compaction.output_level,
                        files = compaction.input_file_count(),
                        "hybrid: coalescing small files"
                    );
                    self.meter.emit(EngineEvent::Compaction(CompEvt {
                        output_level: compaction.output_level as u32,
                        kind: CompKind::ReduceNumFiles {
                            files: compaction.input_file_count(),
                        },
                    }));
                    return Some(self.register_picked(compaction));
                }
            }
        }

        tracing::trace!(cf = cf_name, "hybrid: nothing to do");
        None
    }

    fn register_picked(&self, compaction: Compaction) -> Arc<Compaction> {
        let compaction = Arc::new(compaction);
        self.running.lock().push(Arc::clone(&compaction));
        compaction
    }

    fn init_cf(&self, state: &mut PickerState, vstorage: &VersionStorage) {
        let space_amp = self.config.max_size_amplification_percent;
        debug_assert!((110..=200).contains(&space_amp));
        state.space_amp_factor = 100.0 / (space_amp as f64 - 100.0);

        // the deepest structure whose band and sink both fit the level space
        state.max_num_hyper_levels = MIN_NUM_HYPER_LEVELS
            .max((vstorage.num_levels() - 2) / self.levels_per_hyper)
            .min(MAX_NUM_HYPER_LEVELS);

        let mut last_non_empty = 0;
        for level in 0..vstorage.num_levels() {
            if !vstorage.level_files(level).is_empty() {
                last_non_empty = level;
            }
        }
        state.cur_num_hyper_levels = if last_non_empty == 0 {
            MIN_NUM_HYPER_LEVELS
        } else {
            // assume the data is in the last level
            MIN_NUM_HYPER_LEVELS
                .max(self.hyper_level_of(last_non_empty - 1))
                .min(state.max_num_hyper_levels)
        };

        let width = self.config.clamped_merge_width(self.config.min_merge_width);
        let mut size_to_compact = self.config.write_buffer_size as u64;
        for hyper_level in 0..state.multiplier.len() {
            state.multiplier[hyper_level] = width;
            size_to_compact = size_to_compact.saturating_mul(width as u64);
            state.size_to_compact[hyper_level] = size_to_compact;
        }

        state.level0_compaction_trigger =
            width.min(self.config.level0_file_num_compaction_trigger);
    }

    // ---------------------------------------------------------------------
    // Individual pickers
    // ---------------------------------------------------------------------

    /// Moves every non-empty level of the band onto the deepest empty level,
    /// as a trivial move.
    fn rearrange_level(
        &self,
        hyper_level: usize,
        state: &mut PickerState,
        vstorage: &VersionStorage,
    ) -> Option<Compaction> {
        let mut first_level = self.first_level_in_hyper(hyper_level);
        let last_level = self.last_level_in_hyper(hyper_level);
        if !state.prev_sub_compaction[hyper_level - 1].is_empty() {
            first_level = state.prev_sub_compaction[hyper_level - 1].output_level + 1;
            if first_level >= last_level {
                return None;
            }
        }

        for output_level in (first_level..=last_level).rev() {
            if !vstorage.level_files(output_level).is_empty() {
                continue;
            }
            let mut inputs = Vec::new();
            for input_level in first_level..output_level {
                if !vstorage.level_files(input_level).is_empty() {
                    inputs.push(CompactionInputFiles {
                        level: input_level,
                        files: vstorage.level_files(input_level).to_vec(),
                    });
                }
            }
            if inputs.is_empty() {
                return None;
            }
            return Some(Compaction {
                inputs,
                output_level,
                reason: CompactionReason::Rearrange,
                max_subcompactions: 1,
                output_file_size: None,
                grandparents: Vec::new(),
                trivial_move: true,
            });
        }
        None
    }

    /// When the sink outgrew the current shape, grow the hyper-level count
    /// and rewrite the sink's data into the new, deeper sink.
    fn check_db_size(
        &self,
        cf_name: &str,
        state: &mut PickerState,
        vstorage: &VersionStorage,
    ) -> Option<Compaction> {
        let last_level = self.last_level(state);
        let actual_db_size = vstorage.level_bytes(last_level);
        if actual_db_size == 0 {
            return None;
        }

        let space_amp = state.space_amp_factor.max(1.3);
        let threshold = state.size_to_compact[state.cur_num_hyper_levels] as f64 * space_amp;
        if actual_db_size as f64 <= threshold {
            return None;
        }
        if state.cur_num_hyper_levels + 1 > state.max_num_hyper_levels {
            return None;
        }

        let last_hyper_size = self.hyper_level_size(state.cur_num_hyper_levels, vstorage);
        let first_level = self.first_level_in_hyper(state.cur_num_hyper_levels);

        let grow = actual_db_size as f64 > threshold * 1.2
            || ((last_hyper_size as f64 * space_amp) < actual_db_size as f64
                && !vstorage.level_files(first_level + 3).is_empty())
            || !vstorage.level_files(first_level + 1).is_empty();
        if !grow {
            return None;
        }

        state.cur_num_hyper_levels += 1;
        // the sink moved down with the grown structure
        let output_level = self.last_level(state);
        tracing::debug!(
            cf = cf_name,
            db_mib = actual_db_size / 1024 / 1024,
            hyper_mib = last_hyper_size / 1024 / 1024,
            cur = state.cur_num_hyper_levels,
            "hybrid: increasing supported db size"
        );
        state.prev_sub_compaction[state.cur_num_hyper_levels - 1].set_empty();

        Some(Compaction {
            inputs: vec![CompactionInputFiles {
                level: last_level,
                files: vstorage.level_files(last_level).to_vec(),
            }],
            output_level,
            reason: CompactionReason::Rearrange,
            max_subcompactions: 1,
            output_file_size: None,
            grandparents: Vec::new(),
            trivial_move: false,
        })
    }

    /// Relocates the pre-last band's bottom level into the first empty
    /// level below it, staying inside the tail band (above the sink).
    fn move_sst_to_last_level(
        &self,
        state: &PickerState,
        vstorage: &VersionStorage,
    ) -> Option<Compaction> {
        let source_level = self.last_level_in_hyper(state.cur_num_hyper_levels - 1);
        let last_level = self.last_level(state);
        let output_level = (source_level + 1..last_level)
            .find(|&level| vstorage.level_files(level).is_empty())?;

        Some(Compaction {
            inputs: vec![CompactionInputFiles {
                level: source_level,
                files: vstorage.level_files(source_level).to_vec(),
            }],
            output_level,
            reason: CompactionReason::Rearrange,
            max_subcompactions: 1,
            output_file_size: None,
            grandparents: Vec::new(),
            trivial_move: true,
        })
    }

    /// L0 intake: newest files into the deepest empty level of H=1.
    fn pick_level0_compaction(
        &self,
        state: &mut PickerState,
        vstorage: &VersionStorage,
        merge_width: usize,
    ) -> Option<Compaction> {
        let l0_files = vstorage.level_files(0);
        if l0_files.len() < merge_width {
            return None;
        }

        // the band must have room at its top
        let first_level = self.first_level_in_hyper(1);
        if !vstorage.level_files(first_level).is_empty() {
            return None;
        }
        let last_level = self.last_level_in_hyper(1);
        let mut output_level = first_level;
        for level in first_level + 1..=last_level {
            if !vstorage.level_files(level).is_empty() {
                break;
            }
            output_level = level;
        }

        let max_width = state.multiplier[0] * 3 / 2;
        let files: Vec<Arc<FileMetadata>> = if l0_files.len() < max_width {
            l0_files.to_vec()
        } else {
            l0_files[l0_files.len() - max_width..].to_vec()
        };
        let selected = files.len();

        let grandparents = if state.cur_num_hyper_levels <= 2 {
            vstorage.level_files(self.last_level(state)).to_vec()
        } else {
            Vec::new()
        };

        state.prev_sub_compaction[0].output_level = output_level;
        Some(Compaction {
            inputs: vec![CompactionInputFiles {
                level: 0,
                files,
            }],
            output_level,
            reason: CompactionReason::LevelL0FilesNum,
            max_subcompactions: if l0_files.len() > selected { 2 } else { 1 },
            output_file_size: None,
            grandparents,
            trivial_move: false,
        })
    }

    fn pick_level_compaction(
        &self,
        hyper_level: usize,
        state: &mut PickerState,
        vstorage: &VersionStorage,
    ) -> Option<Compaction> {
        let last_level_in_hyper = self.last_level_in_hyper(hyper_level);
        if vstorage.level_files(last_level_in_hyper).is_empty() {
            return None;
        }

        let mut output_level = last_level_in_hyper + 1;
        let mut n_subcompactions = 1usize;
        let mut output_file_size: u64 = 1 << 30;
        let mut grandparents: Vec<Arc<FileMetadata>> = Vec::new();
        let first_level_in_hyper = self.first_level_in_hyper(hyper_level);

        if hyper_level != state.cur_num_hyper_levels {
            // find the deepest free output below the band
            let next_band_end = self.last_level_in_hyper(hyper_level + 1);
            while output_level < next_band_end
                && vstorage.level_files(output_level + 1).is_empty()
            {
                output_level += 1;
            }
            if !state.prev_sub_compaction[hyper_level].is_empty() {
                let bottom = vstorage
                    .level_files(last_level_in_hyper)
                    .last()
                    .expect("bottom level non-empty");
                if self
                    .ucmp
                    .compare(&bottom.largest, &state.prev_sub_compaction[hyper_level].last_key)
                    == Ordering::Greater
                {
                    output_level = state.prev_sub_compaction[hyper_level].output_level;
                }
            }

            grandparents = vstorage.level_files(self.last_level(state)).to_vec();
            // rush the compaction to prevent a stall
            if !vstorage.level_files(first_level_in_hyper + 4).is_empty() {
                n_subcompactions += 1;
            }
        } else {
            let last_hyper_size =
                state.space_amp_factor * self.hyper_level_size(hyper_level, vstorage) as f64;
            let db_size = vstorage
                .level_bytes(self.last_level(state))
                .max(self.config.write_buffer_size as u64 * 8);
            output_file_size = output_file_size.min(db_size / 8);
            if last_hyper_size > db_size as f64 {
                n_subcompactions += ((last_hyper_size * 10.0 / db_size as f64) as usize)
                    .saturating_sub(10);
                n_subcompactions = n_subcompactions.min(4);
            }
            if !vstorage.level_files(first_level_in_hyper + 4).is_empty() {
                n_subcompactions += 1;
            }
        }

        let mut inputs = Vec::new();
        if !self.select_n_buffers(
            &mut inputs,
            n_subcompactions * 4,
            output_level,
            hyper_level,
            state,
            vstorage,
        ) {
            return None;
        }

        let mut trivial_compaction = false;
        let mut final_output_size = Some(output_file_size);
        if inputs.len() == 1 {
            // inputs do not intersect the output, this is a move
            grandparents.clear();
            final_output_size = None;
            trivial_compaction = true;
        } else if hyper_level == state.cur_num_hyper_levels {
            let output_layer = inputs.last().expect("selection never empty");
            grandparents = if output_layer.level == output_level {
                build_grandparents(&output_layer.files, output_file_size)
            } else {
                Vec::new()
            };
        }

        Some(Compaction {
            inputs,
            output_level,
            reason: CompactionReason::LevelMaxLevelSize,
            max_subcompactions: n_subcompactions,
            output_file_size: final_output_size,
            grandparents,
            trivial_move: trivial_compaction,
        })
    }

    /// Coalesces the longest run of small adjacent files in the sink.
    fn pick_reduce_num_files(
        &self,
        vstorage: &VersionStorage,
        last_level: usize,
        min_file_size: u64,
    ) -> Option<Compaction> {
        let files = vstorage.level_files(last_level);

        let mut best_len = 0usize;
        let mut best_start = 0usize;
        let mut first = 0usize;
        while first < files.len() {
            if files[first].size >= min_file_size {
                first += 1;
                continue;
            }
            let mut total = files[first].size;
            let mut end = first + 1;
            while end < files.len() {
                let next = &files[end];
                if next.size > min_file_size {
                    break;
                }
                total += next.size;
                if total > (1 << 30) {
                    break;
                }
                end += 1;
            }
            if end - first > best_len {
                best_len = end - first;
                best_start = first;
            }
            first = end;
        }

        if best_len <= 1 {
            return None;
        }
        let best_len = best_len.min(REDUCE_NUM_FILES_MAX);

        Some(Compaction {
            inputs: vec![CompactionInputFiles {
                level: last_level,
                files: files[best_start..best_start + best_len].to_vec(),
            }],
            output_level: last_level,
            reason: CompactionReason::ReduceNumFiles,
            max_subcompactions: 1,
            output_file_size: None,
            grandparents: Vec::new(),
            trivial_move: false,
        })
    }

    // ---------------------------------------------------------------------
    // Buffer selection
    // ---------------------------------------------------------------------

    /// First file at or after `key` by largest-key order; `None` keys locate
    /// the start.
    fn locate_file(
        &self,
        files: &[Arc<FileMetadata>],
        key: Option<&Bytes>,
        start: usize,
    ) -> usize {
        let Some(key) = key else { return start };
        if key.is_empty() {
            return start;
        }
        let mut idx = start;
        while idx < files.len() {
            if self.ucmp.compare(&files[idx].largest, key) != Ordering::Less {
                break;
            }
            idx += 1;
        }
        idx
    }

    fn lt(&self, a: &[u8], b: &[u8]) -> bool {
        self.ucmp.compare(a, b) == Ordering::Less
    }

    fn gt(&self, a: &[u8], b: &[u8]) -> bool {
        self.ucmp.compare(a, b) == Ordering::Greater
    }

    /// Greedy selection from the band's bottom level, respecting the target
    /// level's file boundaries, the write-amp guard and the 1 GiB target cap.
    #[allow(clippy::too_many_arguments)]
    fn select_from_lowest_level(
        &self,
        level_files: &[Arc<FileMetadata>],
        target_files: &[Arc<FileMetadata>],
        max_buffers: usize,
        out_files: &mut Vec<Arc<FileMetadata>>,
        bounds: &mut SelectionBounds,
    ) {
        if level_files.is_empty() {
            return;
        }
        let mut level_idx = 0usize;
        bounds.smallest = level_files[0].smallest.clone();
        bounds.largest = level_files[0].largest.clone();

        let target_begin = self.locate_file(target_files, Some(&bounds.smallest), 0);
        if target_begin == target_files.len()
            || self.lt(&bounds.largest, &target_files[target_begin].smallest)
        {
            // No intersection with the target: insist on zero intersection so
            // the move stays cheap and parallel.
            if target_begin < target_files.len() {
                bounds.upper = Some(target_files[target_begin].smallest.clone());
                if target_begin > 0 {
                    bounds.lower = Some(target_files[target_begin - 1].largest.clone());
                }
            } else if let Some(last) = target_files.last() {
                bounds.lower = Some(last.largest.clone());
            }
        } else if target_begin > 0 {
            bounds.lower = Some(target_files[target_begin - 1].largest.clone());
        }

        let mut current_target_size = 0u64;
        let mut current_level_size = level_files[0].size;

        // first target file that does not intersect the first selected file
        let mut target_end = target_begin;
        while target_end < target_files.len() {
            if self.gt(
                &target_files[target_end].smallest,
                &level_files[level_idx].largest,
            ) {
                break;
            }
            current_target_size += target_files[target_end].size;
            target_end += 1;
        }

        let mut expand = true;
        out_files.push(level_files[level_idx].clone());
        level_idx += 1;

        while level_idx < level_files.len() && expand {
            let candidate = &level_files[level_idx];
            if bounds
                .upper
                .as_ref()
                .is_some_and(|upper| self.lt(upper, &candidate.largest))
            {
                // would expand over the upper bound
                break;
            } else if target_end == target_files.len()
                || self.gt(&target_files[target_end].smallest, &candidate.largest)
            {
                // "free" file; still watch the compaction size and write amp
                if out_files.len() > max_buffers
                    && current_level_size < (1 << 26)
                    && current_level_size > 0
                    && current_target_size / current_level_size > 2
                {
                    expand = false;
                }
            } else {
                // the target starts inside this file: expand only while the
                // compaction stays small and the file is not fully excluded
                let new_size = current_target_size + target_files[target_end].size;
                if out_files.len() >= max_buffers
                    || new_size > (1 << 30)
                    || self.lt(&target_files[target_end].largest, &candidate.smallest)
                {
                    expand = false;
                } else {
                    current_target_size = new_size;
                    target_end += 1;
                }
            }
            if expand {
                current_level_size += candidate.size;
                out_files.push(candidate.clone());
                level_idx += 1;
            }
        }
        bounds.largest = out_files.last().expect("at least one file selected").largest.clone();

        if target_end < target_files.len() {
            bounds.upper = Some(target_files[target_end].smallest.clone());
        }
        if level_idx < level_files.len() {
            bounds.last_file_selected = false;
            let next_smallest = &level_files[level_idx].smallest;
            if bounds
                .upper
                .as_ref()
                .is_none_or(|upper| self.gt(upper, next_smallest))
            {
                bounds.upper = Some(next_smallest.clone());
            }
        }
    }

    /// Pulls files of a higher level into the selection: everything inside
    /// `[smallest, largest]` and strictly between the open bounds.
    fn expand_selection(
        &self,
        level_files: &[Arc<FileMetadata>],
        out_files: &mut Vec<Arc<FileMetadata>>,
        bounds: &mut SelectionBounds,
    ) {
        if level_files.is_empty() {
            return;
        }

        let mut idx = self.locate_file(level_files, Some(&bounds.smallest), 0);
        if let Some(lower) = bounds.lower.clone() {
            while idx < level_files.len()
                && !self.lt(&lower, &level_files[idx].smallest)
            {
                idx += 1;
            }
        }

        if idx == level_files.len() {
            let last = level_files.last().expect("non-empty");
            if bounds
                .lower
                .as_ref()
                .is_none_or(|lower| self.gt(&last.largest, lower))
            {
                bounds.lower = Some(last.largest.clone());
            }
            return;
        }

        if idx > 0 {
            let prev = &level_files[idx - 1];
            if bounds
                .lower
                .as_ref()
                .is_none_or(|lower| self.gt(&prev.largest, lower))
            {
                bounds.lower = Some(prev.largest.clone());
            }
        }

        while idx < level_files.len() {
            let file = &level_files[idx];
            let past_largest =
                !bounds.largest.is_empty() && self.gt(&file.smallest, &bounds.largest);
            let hits_upper = bounds
                .upper
                .as_ref()
                .is_some_and(|upper| !self.lt(&file.largest, upper));
            if past_largest || hits_upper {
                break;
            }
            out_files.push(file.clone());
            idx += 1;
        }

        if idx < level_files.len() {
            let file = &level_files[idx];
            if bounds
                .upper
                .as_ref()
                .is_none_or(|upper| self.lt(&file.smallest, upper))
            {
                bounds.upper = Some(file.smallest.clone());
            }
            if bounds
                .upper
                .as_ref()
                .is_none_or(|upper| self.gt(&file.largest, upper))
            {
                bounds.last_file_selected = false;
            }
        }
    }

    /// Builds the input layers for a level compaction and updates the
    /// sub-compaction cursor so the next tick resumes where this one stopped.
    fn select_n_buffers(
        &self,
        inputs: &mut Vec<CompactionInputFiles>,
        n_buffers: usize,
        output_level: usize,
        hyper_level: usize,
        state: &mut PickerState,
        vstorage: &VersionStorage,
    ) -> bool {
        let lowest_level = self.last_level_in_hyper(hyper_level);
        if vstorage.level_files(lowest_level).is_empty() {
            return false;
        }

        let mut upper_level = self.first_level_in_hyper(hyper_level) + 3;
        if !state.prev_sub_compaction[hyper_level - 1].is_empty()
            && upper_level <= state.prev_sub_compaction[hyper_level - 1].output_level
        {
            upper_level = state.prev_sub_compaction[hyper_level - 1].output_level + 1;
            if upper_level > lowest_level {
                return false;
            }
        }

        let mut bounds = SelectionBounds {
            smallest: Bytes::new(),
            largest: Bytes::new(),
            lower: None,
            upper: None,
            last_file_selected: true,
        };

        let mut lowest_selection = CompactionInputFiles {
            level: lowest_level,
            files: Vec::new(),
        };
        self.select_from_lowest_level(
            vstorage.level_files(lowest_level),
            vstorage.level_files(self.last_level(state)),
            n_buffers,
            &mut lowest_selection.files,
            &mut bounds,
        );

        let prev_place = state.prev_sub_compaction[hyper_level].last_key.clone();
        if !prev_place.is_empty()
            && self.lt(&prev_place, &bounds.smallest)
            && bounds
                .lower
                .as_ref()
                .is_none_or(|lower| self.gt(&prev_place, lower))
        {
            bounds.lower = Some(prev_place);
        }

        // expand upward through the band, then collect the output layer
        let mut upper_selections: Vec<CompactionInputFiles> = Vec::new();
        for level in (upper_level..lowest_level).rev() {
            if vstorage.level_files(level).is_empty() {
                continue;
            }
            let mut selection = CompactionInputFiles {
                level,
                files: Vec::new(),
            };
            self.expand_selection(vstorage.level_files(level), &mut selection.files, &mut bounds);
            if let (Some(first), Some(last)) = (selection.files.first(), selection.files.last()) {
                if self.lt(&first.smallest, &bounds.smallest) {
                    bounds.smallest = first.smallest.clone();
                }
                if self.gt(&last.largest, &bounds.largest) {
                    bounds.largest = last.largest.clone();
                }
            }
            upper_selections.push(selection);
        }

        let mut output_selection = CompactionInputFiles {
            level: output_level,
            files: Vec::new(),
        };
        let output_files = vstorage.level_files(output_level);
        let mut idx = self.locate_file(output_files, Some(&bounds.smallest), 0);
        while idx < output_files.len() {
            if self.gt(&output_files[idx].smallest, &bounds.largest) {
                break;
            }
            output_selection.files.push(output_files[idx].clone());
            idx += 1;
        }

        // ordered top-down: higher levels first, the band's bottom, then the
        // output layer
        upper_selections.reverse();
        let only_source_is_lowest = upper_selections.iter().all(CompactionInputFiles::is_empty);
        if output_selection.is_empty() && only_source_is_lowest {
            // trivial move: the target layer is dropped from the inputs
            inputs.push(lowest_selection);
        } else {
            for selection in upper_selections {
                if !selection.is_empty() {
                    inputs.push(selection);
                }
            }
            inputs.push(lowest_selection);
            if !output_selection.is_empty() {
                inputs.push(output_selection);
            }
        }

        state.prev_sub_compaction[hyper_level].output_level = output_level;
        if !bounds.last_file_selected {
            state.prev_sub_compaction[hyper_level].last_key =
                bounds.upper.clone().unwrap_or_default();
        } else {
            state.prev_sub_compaction[hyper_level].last_key = Bytes::new();
        }

        true
    }

    // ---------------------------------------------------------------------
    // Introspection for the engine and tests
    // ---------------------------------------------------------------------

    pub fn cur_num_hyper_levels(&self) -> usize {
        self.state.lock().cur_num_hyper_levels
    }

    pub fn level0_compaction_trigger(&self) -> usize {
        self.state.lock().level0_compaction_trigger
    }

    pub fn multiplier(&self, hyper_level: usize) -> usize {
        self.state.lock().multiplier[hyper_level]
    }

    pub fn size_to_compact(&self, hyper_level: usize) -> u64 {
        self.state.lock().size_to_compact[hyper_level]
    }
}

/// Output file cut hints from the last-level files: one grandparent roughly
/// every 3/5 of the desired output size.
fn build_grandparents(
    last_level_files: &[Arc<FileMetadata>],
    desired_size: u64,
) -> Vec<Arc<FileMetadata>> {
    let mut grandparents = Vec::new();
    let min_size = desired_size * 3 / 5;
    let mut acc_size = 0u64;
    for file in last_level_files {
        acc_size += file.size;
        if acc_size > min_size {
            grandparents.push(file.clone());
            acc_size = 0;
        }
    }
    grandparents
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CompactionConfig {
        CompactionConfig {
            write_buffer_size: 1024 * 1024,
            num_levels: 64,
            min_merge_width: 4,
            max_merge_width: 8,
            level0_file_num_compaction_trigger: 4,
            max_size_amplification_percent: 200,
            max_open_files: 10_000,
        }
    }

    fn file(number: u64, smallest: &str, largest: &str, size: u64) -> FileMetadata {
        FileMetadata {
            file_number: number,
            size,
            smallest: Bytes::copy_from_slice(smallest.as_bytes()),
            largest: Bytes::copy_from_slice(largest.as_bytes()),
        }
    }

    #[test]
    fn hyper_level_geometry_roundtrips() {
        let picker = HybridCompactionPicker::new(config());
        assert_eq!(picker.first_level_in_hyper(0), 0);
        assert_eq!(picker.last_level_in_hyper(0), 0);

        for hyper_level in 1..=4 {
            let first = picker.first_level_in_hyper(hyper_level);
            let last = picker.last_level_in_hyper(hyper_level);
            assert!(first <= last);
            for level in first..=last {
                assert_eq!(picker.hyper_level_of(level), hyper_level);
            }
        }
        assert_eq!(
            picker.first_level_in_hyper(2),
            picker.last_level_in_hyper(1) + 1
        );
    }

    #[test]
    fn empty_tree_needs_init_only() {
        let picker = HybridCompactionPicker::new(config());
        let vstorage = VersionStorage::new(64);
        // uninitialized picker always reports work
        assert!(picker.needs_compaction(&vstorage));
        // after init on an empty tree there is nothing to do
        assert!(picker.pick_compaction("default", &vstorage).is_none());
        assert!(!picker.needs_compaction(&vstorage));
        assert_eq!(picker.cur_num_hyper_levels(), 1);
    }

    #[test]
    fn init_derives_sizes_from_merge_width() {
        let picker = HybridCompactionPicker::new(config());
        let vstorage = VersionStorage::new(64);
        let _ = picker.pick_compaction("default", &vstorage);

        assert_eq!(picker.multiplier(0), 4);
        assert_eq!(picker.size_to_compact(0), 4 * 1024 * 1024);
        assert_eq!(picker.size_to_compact(1), 16 * 1024 * 1024);
        assert_eq!(picker.level0_compaction_trigger(), 4);
    }

    #[test]
    fn l0_compaction_targets_deepest_empty_level_in_h1() {
        let picker = HybridCompactionPicker::new(config());
        let mut vstorage = VersionStorage::new(64);
        for i in 0..4u64 {
            vstorage.add_file(0, file(i, "a", "z", 1024));
        }

        let compaction = picker
            .pick_compaction("default", &vstorage)
            .expect("l0 compaction expected");
        assert_eq!(compaction.reason, CompactionReason::LevelL0FilesNum);
        assert_eq!(compaction.start_level(), 0);
        assert_eq!(compaction.output_level, picker.last_level_in_hyper(1));
        assert_eq!(compaction.input_file_count(), 4);
    }

    #[test]
    fn l0_compaction_caps_width_at_1_5x_and_takes_newest() {
        let picker = HybridCompactionPicker::new(config());
        let mut vstorage = VersionStorage::new(64);
        for i in 0..10u64 {
            vstorage.add_file(0, file(i, "a", "z", 1024));
        }

        let compaction = picker
            .pick_compaction("default", &vstorage)
            .expect("l0 compaction expected");
        // multiplier[0] * 1.5 = 6 newest files
        assert_eq!(compaction.input_file_count(), 6);
        let numbers: Vec<u64> = compaction.inputs[0]
            .files
            .iter()
            .map(|f| f.file_number)
            .collect();
        assert_eq!(numbers, vec![4, 5, 6, 7, 8, 9]);
        assert_eq!(compaction.max_subcompactions, 2);
    }

    #[test]
    fn rearrange_moves_files_to_band_bottom() {
        let picker = HybridCompactionPicker::new(config());
        let mut vstorage = VersionStorage::new(64);
        let first = picker.first_level_in_hyper(1);
        // data at the band's top with holes below it
        vstorage.add_file(first, file(1, "a", "c", 1024));
        vstorage.add_file(first + 2, file(2, "d", "f", 1024));

        assert!(picker.needs_compaction(&vstorage));
        let compaction = picker
            .pick_compaction("default", &vstorage)
            .expect("rearrange expected");
        assert_eq!(compaction.reason, CompactionReason::Rearrange);
        assert!(compaction.is_trivial_move());
        assert_eq!(compaction.output_level, picker.last_level_in_hyper(1));
        assert_eq!(compaction.input_file_count(), 2);
        let levels: Vec<usize> = compaction.inputs.iter().map(|i| i.level).collect();
        assert_eq!(levels, vec![first, first + 2]);
    }

    #[test]
    fn no_second_compaction_while_band_is_busy() {
        let picker = HybridCompactionPicker::new(config());
        let mut vstorage = VersionStorage::new(64);
        let first = picker.first_level_in_hyper(1);
        vstorage.add_file(first, file(1, "a", "c", 1024));
        vstorage.add_file(first + 2, file(2, "d", "f", 1024));

        let held = picker.pick_compaction("default", &vstorage).expect("first pick");
        // same shape, but a rearrange is already running in the band
        assert!(picker.pick_compaction("default", &vstorage).is_none());
        picker.release_compaction(&held);
        assert!(picker.pick_compaction("default", &vstorage).is_some());
    }

    #[test]
    fn manual_compaction_blocks_picking() {
        let picker = HybridCompactionPicker::new(config());
        // initialize on an empty tree, then inject a manual compaction
        let empty = VersionStorage::new(64);
        assert!(picker.pick_compaction("default", &empty).is_none());

        let mut vstorage = VersionStorage::new(64);
        for i in 0..4u64 {
            vstorage.add_file(0, file(i, "a", "z", 1024));
        }
        let manual = Arc::new(Compaction {
            inputs: vec![CompactionInputFiles {
                level: 1,
                files: Vec::new(),
            }],
            output_level: 2,
            reason: CompactionReason::Manual,
            max_subcompactions: 1,
            output_file_size: None,
            grandparents: Vec::new(),
            trivial_move: false,
        });
        picker.register_compaction(Arc::clone(&manual));

        assert!(!picker.needs_compaction(&vstorage));
        assert!(picker.pick_compaction("default", &vstorage).is_none());

        picker.release_compaction(&manual);
        assert!(picker.pick_compaction("default", &vstorage).is_some());
    }

    #[test]
    fn small_file_coalescing_caps_at_200() {
        let picker = HybridCompactionPicker::new(config());
        let empty = VersionStorage::new(64);
        let _ = picker.pick_compaction("default", &empty); // init

        let mut vstorage = VersionStorage::new(64);
        let last = picker.current_last_level();
        for i in 0..300u64 {
            let name = format!("k{:04}", i);
            let next = format!("k{:04}x", i);
            vstorage.add_file(last, file(i, &name, &next, 10));
        }
        let compaction = picker
            .pick_reduce_num_files(&vstorage, last, 1024)
            .expect("coalescing expected");
        assert_eq!(compaction.reason, CompactionReason::ReduceNumFiles);
        assert_eq!(compaction.output_level, last);
        assert_eq!(compaction.input_file_count(), 200);
    }
}
