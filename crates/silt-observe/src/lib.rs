//! silt-observe: vendor-neutral observability ABI.
//!
//! Core crates depend only on these traits and event types. Backends live
//! elsewhere.

pub trait Counter: Send + Sync {
    fn inc(&self, v: u64);
}
pub trait Gauge: Send + Sync {
    fn set(&self, v: i64);
}
pub trait Histogram: Send + Sync {
    fn observe(&self, v: f64);
}

pub trait Meter: Send + Sync + 'static {
    fn counter(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter>;
    fn gauge(
        &self,
        name: &'static str,
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge>;
    fn histo(
        &self,
        name: &'static str,
        _buckets: &'static [f64],
        labels: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram>;
    fn emit(&self, evt: EngineEvent);
}

/// A do-nothing meter for tests and users who don't care about telemetry.
#[derive(Clone, Default)]
pub struct NoopMeter;
struct NoopC;
impl Counter for NoopC {
    fn inc(&self, _v: u64) {}
}
struct NoopG;
impl Gauge for NoopG {
    fn set(&self, _v: i64) {}
}
struct NoopH;
impl Histogram for NoopH {
    fn observe(&self, _v: f64) {}
}
impl Meter for NoopMeter {
    fn counter(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Counter> {
        Box::new(NoopC)
    }
    fn gauge(
        &self,
        _n: &'static str,
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Gauge> {
        Box::new(NoopG)
    }
    fn histo(
        &self,
        _n: &'static str,
        _b: &'static [f64],
        _l: &'static [(&'static str, &'static str)],
    ) -> Box<dyn Histogram> {
        Box::new(NoopH)
    }
    fn emit(&self, _e: EngineEvent) {}
}

/// Typed engine events for live visualization (keys/values never included).
#[non_exhaustive]
#[derive(Clone, Debug)]
pub enum EngineEvent {
    Memtable(MemEvt),
    WriteBuffer(WbEvt),
    Compaction(CompEvt),
}

#[derive(Clone, Debug)]
pub struct MemEvt {
    pub kind: MemKind,
}
#[derive(Clone, Debug)]
pub enum MemKind {
    /// A sorted vector was sealed by the sort thread.
    VectorSealed { elements: usize },
    /// A run of small vectors was merged into one.
    VectorsMerged { merged: usize, elements: usize },
    /// The memtable was frozen for flush.
    MarkedReadOnly { elements: usize },
}

#[derive(Clone, Debug)]
pub struct WbEvt {
    pub kind: WbKind,
}
#[derive(Clone, Debug)]
pub enum WbKind {
    /// The initiation thread asked a client to flush.
    FlushRequested { min_size: usize, accepted: bool },
    /// A flush began (wbm_initiated tells who triggered it).
    FlushStarted { wbm_initiated: bool, running: usize },
    /// A flush completed.
    FlushEnded { wbm_initiated: bool, running: usize },
    /// A DB parked on the stall queue.
    StallBegin { queued: usize },
    /// The stall queue was drained.
    StallEnd { released: usize },
    /// Memory usage crossed the delay threshold.
    DelayFactor { factor_pct: u8 },
}

#[derive(Clone, Debug)]
pub struct CompEvt {
    pub output_level: u32,
    pub kind: CompKind,
}
#[derive(Clone, Debug)]
pub enum CompKind {
    /// A rearrange (trivial move inside a hyper-level) was picked.
    Rearrange { hyper_level: u32, start_level: u32 },
    /// The LSM grew a hyper-level; the last level is being rebuilt.
    Promote { new_hyper_levels: u32 },
    /// L0 files are being merged down into hyper-level 1.
    Level0 { files: usize },
    /// A level compaction was picked inside a hyper-level.
    Level { hyper_level: u32, start_level: u32, files: usize },
    /// Small last-level files are being coalesced.
    ReduceNumFiles { files: usize },
}

/// Macros (simple versions). Can be feature-gated if desired.
#[macro_export]
macro_rules! obs_count {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.counter($name, $labels).inc($v as u64);
    }};
}
#[macro_export]
macro_rules! obs_gauge {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.gauge($name, $labels).set($v as i64);
    }};
}
#[macro_export]
macro_rules! obs_hist {
    ($m:expr, $name:expr, $labels:expr, $v:expr) => {{
        $m.histo($name, &[], $labels).observe($v as f64);
    }};
}
