//! Write buffer manager: memory accounting, flush initiation, delays and
//! stalls shared by every DB registered against it.
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  reserve / schedule_free / free_begin / free_abort / free    │
//! │        │  (atomic counters: used ≥ inactive ≥ being_freed)   │
//! │        ▼                                                     │
//! │  threshold evaluation ──► initiation thread ──► initiator cb │
//! │        │                                                     │
//! │        └──► stall queue (used ≥ buffer_size, opt-in)         │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! Counters are atomics and never take a lock; the stall queue, the cache
//! reservation handle, the initiator registry and the initiation thread's
//! rendezvous each have their own mutex.

use crate::config::WriteBufferConfig;
use parking_lot::{Condvar, Mutex};
use silt_observe::{EngineEvent, Meter, NoopMeter, WbEvt, WbKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

/// Usage percent of the buffer at which delays and flush initiation start.
pub const START_FLUSH_PERCENT_THRESHOLD: usize = 80;

/// Cache charges move in steps of this many bytes so that reservation
/// resizes stay rare.
pub const CACHE_RESERVATION_STEP: usize = 256 * 1024;

/// Blocking contract a DB parks itself on while stalled.
/// `block` must not return until a matching `signal`.
pub trait StallHandle: Send + Sync {
    fn block(&self);
    fn signal(&self);
}

/// Permit-based stall handle; an early `signal` lets a later `block` pass.
#[derive(Default)]
pub struct CondvarStallHandle {
    permits: Mutex<usize>,
    cv: Condvar,
}

impl CondvarStallHandle {
    pub fn new() -> Self {
        Self::default()
    }
}

impl StallHandle for CondvarStallHandle {
    fn block(&self) {
        let mut permits = self.permits.lock();
        while *permits == 0 {
            self.cv.wait(&mut permits);
        }
        *permits -= 1;
    }

    fn signal(&self) {
        let mut permits = self.permits.lock();
        *permits += 1;
        self.cv.notify_all();
    }
}

/// The cache-charging contract: the manager mirrors its usage into a shared
/// block cache as opaque dummy reservations. The cache itself is someone
/// else's problem.
pub trait CacheReservationManager: Send + Sync {
    /// Sets the total reservation to `target` bytes.
    fn update_reservation(&self, target: usize);

    /// Currently reserved bytes.
    fn reserved(&self) -> usize;
}

/// Callback a column family registers to accept flush requests.
/// Returns true when the client accepted and will eventually call
/// `flush_started`/`flush_ended`; false declines this turn.
pub type InitiateFlushRequest = Arc<dyn Fn(usize) -> bool + Send + Sync>;

struct InitiatorInfo {
    owner: u64,
    request: InitiateFlushRequest,
}

#[derive(Default)]
struct InitiatorRegistry {
    initiators: Vec<InitiatorInfo>,
    next_candidate_idx: usize,
}

impl InitiatorRegistry {
    fn position(&self, owner: u64) -> Option<usize> {
        self.initiators.iter().position(|info| info.owner == owner)
    }
}

struct FlushState {
    num_flushes_to_initiate: usize,
    num_running_flushes: usize,
    wakeup: bool,
    terminate: bool,
}

struct CacheHandle {
    manager: Arc<dyn CacheReservationManager>,
    /// Serializes reservation resizes; counters never take this.
    mu: Mutex<()>,
}

pub struct WriteBufferManager {
    buffer_size: AtomicUsize,
    mutable_limit: AtomicUsize,
    memory_used: AtomicUsize,
    /// Memory scheduled to be freed.
    memory_inactive: AtomicUsize,
    /// Memory whose reclamation is in progress.
    memory_being_freed: AtomicUsize,

    cache: Option<CacheHandle>,

    allow_stall: bool,
    stall_active: AtomicBool,
    queue: Mutex<Vec<Arc<dyn StallHandle>>>,

    initiate_flushes: bool,
    max_parallel_flushes: usize,
    flushes: Mutex<FlushState>,
    flushes_cv: Condvar,
    initiators: Mutex<InitiatorRegistry>,

    // Read outside the flushes lock by the mem-only threshold test.
    flush_initiation_start_size: AtomicUsize,
    additional_flush_step_size: AtomicUsize,
    additional_flush_initiation_size: AtomicUsize,
    min_flush_size: AtomicUsize,

    thread: Mutex<Option<JoinHandle<()>>>,
    meter: Arc<dyn Meter>,
}

impl WriteBufferManager {
    pub fn new(config: WriteBufferConfig) -> Arc<Self> {
        Self::with_cache_and_meter(config, None, Arc::new(NoopMeter))
    }

    pub fn with_cache(
        config: WriteBufferConfig,
        cache: Arc<dyn CacheReservationManager>,
    ) -> Arc<Self> {
        Self::with_cache_and_meter(config, Some(cache), Arc::new(NoopMeter))
    }

    pub fn with_cache_and_meter(
        config: WriteBufferConfig,
        cache: Option<Arc<dyn CacheReservationManager>>,
        meter: Arc<dyn Meter>,
    ) -> Arc<Self> {
        let wbm = Arc::new(Self {
            buffer_size: AtomicUsize::new(config.buffer_bytes),
            mutable_limit: AtomicUsize::new(config.buffer_bytes * 7 / 8),
            memory_used: AtomicUsize::new(0),
            memory_inactive: AtomicUsize::new(0),
            memory_being_freed: AtomicUsize::new(0),
            cache: cache.map(|manager| CacheHandle {
                manager,
                mu: Mutex::new(()),
            }),
            allow_stall: config.allow_stall,
            stall_active: AtomicBool::new(false),
            queue: Mutex::new(Vec::new()),
            initiate_flushes: config.initiate_flushes,
            max_parallel_flushes: config.max_parallel_flushes,
            flushes: Mutex::new(FlushState {
                num_flushes_to_initiate: 0,
                num_running_flushes: 0,
                wakeup: false,
                terminate: false,
            }),
            flushes_cv: Condvar::new(),
            initiators: Mutex::new(InitiatorRegistry::default()),
            flush_initiation_start_size: AtomicUsize::new(0),
            additional_flush_step_size: AtomicUsize::new(0),
            additional_flush_initiation_size: AtomicUsize::new(0),
            min_flush_size: AtomicUsize::new(0),
            thread: Mutex::new(None),
            meter,
        });

        if wbm.initiate_flushes {
            wbm.init_flush_initiation_vars(wbm.buffer_size());
            let worker = Arc::clone(&wbm);
            let handle = std::thread::Builder::new()
                .name("silt-wbm-initiate".to_string())
                .spawn(move || worker.initiate_flushes_loop())
                .expect("failed to spawn flush initiation thread");
            *wbm.thread.lock() = Some(handle);
        }

        wbm
    }

    // ---------------------------------------------------------------------
    // Accounting surface
    // ---------------------------------------------------------------------

    /// True when a non-zero budget caps the total memory usage.
    pub fn enabled(&self) -> bool {
        self.buffer_size() > 0
    }

    /// True when usage is mirrored into a shared cache.
    pub fn cost_to_cache(&self) -> bool {
        self.cache.is_some()
    }

    /// Total memory charged by memtables. Only meaningful if `enabled`.
    pub fn memory_usage(&self) -> usize {
        self.memory_used.load(Ordering::Relaxed)
    }

    /// Memory still belonging to active (mutable) memtables.
    pub fn mutable_memtable_memory_usage(&self) -> usize {
        let total = self.memory_usage();
        let inactive = self.memory_inactive.load(Ordering::Acquire);
        total.saturating_sub(inactive)
    }

    pub fn immutable_memtable_memory_usage(&self) -> usize {
        self.memory_inactive.load(Ordering::Relaxed)
    }

    /// Memory marked to be freed whose reclamation has begun.
    pub fn memtable_memory_being_freed_usage(&self) -> usize {
        self.memory_being_freed.load(Ordering::Relaxed)
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size.load(Ordering::Relaxed)
    }

    /// Bytes currently held as dummy entries in the attached cache.
    pub fn dummy_entries_in_cache_usage(&self) -> usize {
        self.cache
            .as_ref()
            .map(|cache| cache.manager.reserved())
            .unwrap_or(0)
    }

    /// Retunes the budget. Note: `memory_inactive`/`memory_being_freed` are
    /// not maintained while disabled, and `memory_used` only with a cache
    /// attached, so counters may be invalid for one transition when flipping
    /// between disabled and enabled at runtime.
    pub fn set_buffer_size(&self, new_size: usize) {
        self.buffer_size.store(new_size, Ordering::Relaxed);
        self.mutable_limit.store(new_size * 7 / 8, Ordering::Relaxed);

        self.maybe_end_write_stall();
        if new_size > 0 && self.initiate_flushes {
            self.init_flush_initiation_vars(new_size);
        }
    }

    pub fn reserve(&self, mem: usize) {
        let new_used = if self.cache.is_some() {
            self.reserve_with_cache(mem)
        } else if self.enabled() {
            self.memory_used.fetch_add(mem, Ordering::Relaxed) + mem
        } else {
            return;
        };

        if self.enabled() && self.initiate_flushes {
            self.reevaluate_need_for_more_flushes(new_used);
        }
    }

    /// Marks `mem` bytes as scheduled to be freed. Never decreases `used`.
    pub fn schedule_free_mem(&self, mem: usize) {
        if self.enabled() {
            self.memory_inactive.fetch_add(mem, Ordering::Relaxed);
        }
    }

    /// Reclamation of `mem` previously scheduled bytes has started.
    pub fn free_mem_begin(&self, mem: usize) {
        if self.enabled() {
            let prev = self.memory_being_freed.fetch_add(mem, Ordering::Relaxed);
            debug_assert!(prev + mem <= self.memory_inactive.load(Ordering::Relaxed));
        }
    }

    /// Reclamation was aborted; the bytes count as live again.
    pub fn free_mem_aborted(&self, mem: usize) {
        if self.enabled() {
            saturating_counter_sub(&self.memory_inactive, mem);
            saturating_counter_sub(&self.memory_being_freed, mem);
        }
    }

    /// Reclamation completed: `mem` leaves all three counters.
    pub fn free_mem(&self, mem: usize) {
        let new_used = if self.cache.is_some() {
            Some(self.free_with_cache(mem))
        } else if self.enabled() {
            Some(self.memory_used.fetch_sub(mem, Ordering::Relaxed) - mem)
        } else {
            None
        };
        if self.enabled() {
            // A free may arrive without a matching schedule (e.g. a flush
            // raced an enable/disable transition); the counters floor at 0.
            saturating_counter_sub(&self.memory_inactive, mem);
            saturating_counter_sub(&self.memory_being_freed, mem);
        }

        self.maybe_end_write_stall();

        if let Some(new_used) = new_used {
            if self.enabled() && self.initiate_flushes {
                self.reevaluate_need_for_more_flushes(new_used);
            }
        }
    }

    fn reserve_with_cache(&self, mem: usize) -> usize {
        let cache = self.cache.as_ref().expect("checked by caller");
        let _guard = cache.mu.lock();
        let new_used = self.memory_used.fetch_add(mem, Ordering::Relaxed) + mem;
        self.update_cache_reservation(cache, new_used);
        new_used
    }

    fn free_with_cache(&self, mem: usize) -> usize {
        let cache = self.cache.as_ref().expect("checked by caller");
        let _guard = cache.mu.lock();
        let new_used = self.memory_used.fetch_sub(mem, Ordering::Relaxed) - mem;
        self.update_cache_reservation(cache, new_used);
        new_used
    }

    fn update_cache_reservation(&self, cache: &CacheHandle, used: usize) {
        let target = used.div_ceil(CACHE_RESERVATION_STEP) * CACHE_RESERVATION_STEP;
        if target != cache.manager.reserved() {
            cache.manager.update_reservation(target);
        }
    }

    // ---------------------------------------------------------------------
    // Flush heuristics
    // ---------------------------------------------------------------------

    /// Heuristic for engines that switch memtables themselves (flush
    /// initiation off). A disabled manager always says yes.
    pub fn should_flush(&self) -> bool {
        if !self.enabled() {
            return true;
        }
        if self.initiate_flushes {
            return false;
        }

        if self.mutable_memtable_memory_usage() > self.mutable_limit.load(Ordering::Relaxed) {
            return true;
        }
        let local_size = self.buffer_size();
        // Over budget but more than half the memory is already on its way
        // out: triggering yet another flush would not help.
        self.memory_usage() >= local_size
            && self.mutable_memtable_memory_usage() >= local_size / 2
    }

    pub fn is_initiating_flushes(&self) -> bool {
        self.initiate_flushes
    }

    /// Delay factor in [0, 1]: zero below the start threshold, growing
    /// linearly to 1 as usage approaches `buffer_size`. Advisory only; each
    /// client translates it to a local write-rate cap.
    pub fn delay_factor(&self) -> f64 {
        if !self.enabled() {
            return 0.0;
        }
        let used = self.memory_usage() as f64;
        let buffer = self.buffer_size() as f64;
        let start = buffer * START_FLUSH_PERCENT_THRESHOLD as f64 / 100.0;
        if used < start || buffer <= start {
            0.0
        } else {
            ((used - start) / (buffer - start)).min(1.0)
        }
    }

    // ---------------------------------------------------------------------
    // Stalls
    // ---------------------------------------------------------------------

    pub fn is_stall_active(&self) -> bool {
        self.stall_active.load(Ordering::Relaxed)
    }

    pub fn is_stall_threshold_exceeded(&self) -> bool {
        self.memory_usage() >= self.buffer_size()
    }

    /// True when the caller should park itself on a stall handle.
    pub fn should_stall(&self) -> bool {
        if !self.allow_stall || !self.enabled() {
            return false;
        }
        self.is_stall_active() || self.is_stall_threshold_exceeded()
    }

    /// Enqueues the handle and blocks the caller on it.
    pub fn begin_write_stall(&self, handle: Arc<dyn StallHandle>) {
        debug_assert!(self.allow_stall);
        let queued = {
            let mut queue = self.queue.lock();
            queue.push(Arc::clone(&handle));
            self.stall_active.store(true, Ordering::Relaxed);
            queue.len()
        };
        tracing::debug!(queued, "write stall: parking a DB");
        self.meter.emit(EngineEvent::WriteBuffer(WbEvt {
            kind: WbKind::StallBegin { queued },
        }));
        handle.block();
    }

    /// Drains the stall queue if usage dropped below the budget (or the
    /// manager is disabled). Handles are signalled outside the lock.
    pub fn maybe_end_write_stall(&self) {
        if !self.allow_stall {
            return;
        }

        let released: Vec<Arc<dyn StallHandle>> = {
            let mut queue = self.queue.lock();
            if !self.stall_active.load(Ordering::Relaxed) {
                return;
            }
            if self.enabled() && self.is_stall_threshold_exceeded() {
                return;
            }
            self.stall_active.store(false, Ordering::Relaxed);
            std::mem::take(&mut *queue)
        };

        if !released.is_empty() {
            tracing::debug!(released = released.len(), "write stall: releasing DBs");
            self.meter.emit(EngineEvent::WriteBuffer(WbEvt {
                kind: WbKind::StallEnd {
                    released: released.len(),
                },
            }));
        }
        for handle in released {
            handle.signal();
        }
    }

    /// Removes a specific DB's handle (shutdown path) and signals it.
    pub fn remove_db(&self, handle: &Arc<dyn StallHandle>) {
        let found = {
            let mut queue = self.queue.lock();
            let before = queue.len();
            queue.retain(|queued| !Arc::ptr_eq(queued, handle));
            before != queue.len()
        };
        if found {
            handle.signal();
        }
    }

    // ---------------------------------------------------------------------
    // Flush initiation
    // ---------------------------------------------------------------------

    /// Registers a flush initiator under an opaque owner id issued by the
    /// engine. Ids, not pointers, identify initiators.
    pub fn register_flush_initiator(&self, owner: u64, request: InitiateFlushRequest) {
        let mut registry = self.initiators.lock();
        debug_assert!(registry.position(owner).is_none());
        registry.initiators.push(InitiatorInfo { owner, request });
    }

    pub fn deregister_flush_initiator(&self, owner: u64) {
        let mut registry = self.initiators.lock();
        if let Some(pos) = registry.position(owner) {
            registry.initiators.remove(pos);
            if registry.initiators.is_empty() {
                registry.next_candidate_idx = 0;
            } else if registry.next_candidate_idx > pos {
                registry.next_candidate_idx -= 1;
            } else {
                registry.next_candidate_idx %= registry.initiators.len();
            }
        }
    }

    /// A flush began. A WBM-initiated flush was already committed to the
    /// running count when its initiator accepted, so only externally
    /// initiated flushes are counted here.
    pub fn flush_started(&self, wbm_initiated: bool) {
        if !self.enabled() {
            return;
        }
        let running = {
            let mut state = self.flushes.lock();
            if !wbm_initiated {
                state.num_running_flushes += 1;
            }
            self.recalc_flush_initiation_size(&state);
            state.num_running_flushes
        };
        self.meter.emit(EngineEvent::WriteBuffer(WbEvt {
            kind: WbKind::FlushStarted {
                wbm_initiated,
                running,
            },
        }));
        self.reevaluate_need_for_more_flushes(self.memory_usage());
    }

    pub fn flush_ended(&self, wbm_initiated: bool) {
        if !self.enabled() {
            return;
        }
        let running = {
            let mut state = self.flushes.lock();
            debug_assert!(state.num_running_flushes > 0);
            state.num_running_flushes = state.num_running_flushes.saturating_sub(1);
            self.recalc_flush_initiation_size(&state);
            state.num_running_flushes
        };
        self.meter.emit(EngineEvent::WriteBuffer(WbEvt {
            kind: WbKind::FlushEnded {
                wbm_initiated,
                running,
            },
        }));
        self.reevaluate_need_for_more_flushes(self.memory_usage());
    }

    /// Pending initiations not yet accepted by any initiator.
    pub fn num_flushes_to_initiate(&self) -> usize {
        self.flushes.lock().num_flushes_to_initiate
    }

    pub fn num_running_flushes(&self) -> usize {
        self.flushes.lock().num_running_flushes
    }

    pub fn next_candidate_initiator_idx(&self) -> usize {
        self.initiators.lock().next_candidate_idx
    }

    fn init_flush_initiation_vars(&self, quota: usize) {
        let start = quota * START_FLUSH_PERCENT_THRESHOLD / 100;
        let step = quota / self.max_parallel_flushes;
        self.flush_initiation_start_size
            .store(start, Ordering::Relaxed);
        self.additional_flush_step_size
            .store(step, Ordering::Relaxed);
        self.min_flush_size.store(step / 2, Ordering::Relaxed);

        let state = self.flushes.lock();
        self.recalc_flush_initiation_size(&state);
    }

    fn recalc_flush_initiation_size(&self, state: &FlushState) {
        let start = self.flush_initiation_start_size.load(Ordering::Relaxed);
        let step = self.additional_flush_step_size.load(Ordering::Relaxed);
        let occupied = state.num_running_flushes + state.num_flushes_to_initiate;
        self.additional_flush_initiation_size
            .store(start + step * occupied, Ordering::Relaxed);
    }

    /// The memory-only half of the initiation test. Runs outside the flushes
    /// lock, so only the atomics are consulted. The step/2 fraction is the
    /// tunable knob here.
    fn should_initiate_another_flush_mem_only(&self, curr_used: usize) -> bool {
        let being_freed = self.memory_being_freed.load(Ordering::Relaxed);
        let step = self.additional_flush_step_size.load(Ordering::Relaxed);
        let initiation_size = self.additional_flush_initiation_size.load(Ordering::Relaxed);
        curr_used.saturating_sub(being_freed) >= step / 2 && curr_used >= initiation_size
    }

    fn should_initiate_another_flush(&self, state: &FlushState, curr_used: usize) -> bool {
        state.num_running_flushes + state.num_flushes_to_initiate < self.max_parallel_flushes
            && self.should_initiate_another_flush_mem_only(curr_used)
    }

    fn reevaluate_need_for_more_flushes(&self, curr_used: usize) {
        if !self.initiate_flushes || !self.enabled() {
            return;
        }

        let mut state = self.flushes.lock();
        if self.should_initiate_another_flush(&state, curr_used) {
            state.num_flushes_to_initiate += 1;
            self.recalc_flush_initiation_size(&state);
            state.wakeup = true;
            self.flushes_cv.notify_one();
        }
    }

    /// Body of the initiation thread: sleep, then drain pending initiations
    /// through the round-robin cursor. A full declined cycle leaves the
    /// pending count in place and goes back to sleep.
    fn initiate_flushes_loop(&self) {
        loop {
            {
                let mut state = self.flushes.lock();
                while !state.wakeup && !state.terminate {
                    self.flushes_cv.wait(&mut state);
                }
                state.wakeup = false;
                if state.terminate {
                    return;
                }
            }

            loop {
                if self.flushes.lock().num_flushes_to_initiate == 0 {
                    break;
                }
                if !self.initiate_additional_flush() {
                    break;
                }
            }
        }
    }

    /// One round-robin pass over the initiators. True when someone accepted.
    fn initiate_additional_flush(&self) -> bool {
        let (candidates, cursor) = {
            let registry = self.initiators.lock();
            let candidates: Vec<(u64, InitiateFlushRequest)> = registry
                .initiators
                .iter()
                .map(|info| (info.owner, Arc::clone(&info.request)))
                .collect();
            (candidates, registry.next_candidate_idx)
        };
        if candidates.is_empty() {
            return false;
        }

        let min_size = self.min_flush_size.load(Ordering::Relaxed);
        for offset in 0..candidates.len() {
            let idx = (cursor + offset) % candidates.len();
            let (owner, request) = &candidates[idx];
            let accepted = request(min_size);
            self.meter.emit(EngineEvent::WriteBuffer(WbEvt {
                kind: WbKind::FlushRequested {
                    min_size,
                    accepted,
                },
            }));
            tracing::trace!(owner, accepted, min_size, "flush initiation request");

            if accepted {
                {
                    let mut registry = self.initiators.lock();
                    if !registry.initiators.is_empty() {
                        registry.next_candidate_idx = (idx + 1) % registry.initiators.len();
                    }
                }
                // The client committed to flushing: move the pending
                // initiation to the running count right away so the next
                // threshold stays raised until flush_ended.
                let mut state = self.flushes.lock();
                state.num_flushes_to_initiate = state.num_flushes_to_initiate.saturating_sub(1);
                state.num_running_flushes += 1;
                self.recalc_flush_initiation_size(&state);
                return true;
            }
        }

        false
    }

    fn terminate_flushes_thread(&self) {
        {
            let mut state = self.flushes.lock();
            state.terminate = true;
            self.flushes_cv.notify_one();
        }
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

fn saturating_counter_sub(counter: &AtomicUsize, mem: usize) {
    let _ = counter.fetch_update(Ordering::Relaxed, Ordering::Relaxed, |value| {
        Some(value.saturating_sub(mem))
    });
}

impl Drop for WriteBufferManager {
    fn drop(&mut self) {
        self.terminate_flushes_thread();
        // Nobody may stay parked on a dying manager.
        let remaining = std::mem::take(&mut *self.queue.lock());
        for handle in remaining {
            handle.signal();
        }
    }
}
