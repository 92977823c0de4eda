//! Collector driver
//!
//! ## Design
//!
//! - One collection runs at a time (the cycle lock). A requester that finds
//!   a concurrent trace in progress asks it to escalate, then waits
//! - Minor: scavenge the young generation at a safepoint. A failed promotion
//!   escalates to mark, sweep and compact within the same pause
//! - Major: initial mark (safepoint), concurrent trace, then final mark,
//!   sweep and optional compaction in one more safepoint
//! - Full: scavenge, stop-the-world mark, sweep and compaction in one pause
//! - A request with no mutation since the last collection of the same
//!   kind does no work

use crate::compact;
use crate::error::{GcResult, fatal};
use crate::generation;
use crate::heap::HeapCore;
use crate::marker::MarkPhase;
use crate::safepoint::SafepointToken;
use crate::sweep;
use crossbeam_channel::{Receiver, Sender};
use parking_lot::{Mutex, MutexGuard};
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

/// Phase transitions kept for telemetry
const PHASE_LOG_CAPACITY: usize = 256;

/// Collector state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectorState {
    /// No collection in progress
    Idle = 0,
    /// Scavenging the young generation
    MinorCollect = 1,
    /// Snapshotting roots
    InitialMark = 2,
    /// Tracing alongside mutators
    ConcurrentTrace = 3,
    /// Finishing the trace
    FinalMark = 4,
    /// Rebuilding old free lists
    Sweep = 5,
    /// Sliding old objects together
    Compact = 6,
}

impl CollectorState {
    /// Name used in logs
    pub fn name(self) -> &'static str {
        match self {
            CollectorState::Idle => "idle",
            CollectorState::MinorCollect => "minor-collect",
            CollectorState::InitialMark => "initial-mark",
            CollectorState::ConcurrentTrace => "concurrent-trace",
            CollectorState::FinalMark => "final-mark",
            CollectorState::Sweep => "sweep",
            CollectorState::Compact => "compact",
        }
    }
}

impl From<u8> for CollectorState {
    fn from(v: u8) -> Self {
        match v {
            1 => CollectorState::MinorCollect,
            2 => CollectorState::InitialMark,
            3 => CollectorState::ConcurrentTrace,
            4 => CollectorState::FinalMark,
            5 => CollectorState::Sweep,
            6 => CollectorState::Compact,
            _ => CollectorState::Idle,
        }
    }
}

/// What to collect
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CollectionKind {
    /// Young generation only
    Minor,
    /// Concurrent mark and sweep of the old generation
    Major,
    /// Everything, stop-the-world, with compaction
    Full,
}

impl CollectionKind {
    /// Name used in logs
    pub fn name(self) -> &'static str {
        match self {
            CollectionKind::Minor => "Minor",
            CollectionKind::Major => "Major",
            CollectionKind::Full => "Full",
        }
    }
}

/// Why a collection ran
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GcCause {
    /// A space could not satisfy a request
    AllocationFailure,
    /// Requested through the API
    Explicit,
    /// Old occupancy crossed the initiating threshold
    OccupancyThreshold,
    /// The old generation could not absorb the young generation
    PromotionGuarantee,
    /// A scavenge could not promote every survivor
    EvacuationFailure,
}

impl GcCause {
    /// Name used in logs
    pub fn name(self) -> &'static str {
        match self {
            GcCause::AllocationFailure => "allocation failure",
            GcCause::Explicit => "explicit",
            GcCause::OccupancyThreshold => "occupancy threshold",
            GcCause::PromotionGuarantee => "promotion guarantee",
            GcCause::EvacuationFailure => "evacuation failure",
        }
    }
}

/// One collector state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseTransition {
    /// Time since the heap was created
    pub at: Duration,
    /// State left
    pub from: CollectorState,
    /// State entered
    pub to: CollectorState,
}

struct PhaseLog {
    origin: Instant,
    entries: VecDeque<PhaseTransition>,
}

impl PhaseLog {
    fn new(origin: Instant) -> Self {
        Self {
            origin,
            entries: VecDeque::with_capacity(PHASE_LOG_CAPACITY),
        }
    }

    fn record(&mut self, from: CollectorState, to: CollectorState) {
        if self.entries.len() == PHASE_LOG_CAPACITY {
            self.entries.pop_front();
        }
        self.entries.push_back(PhaseTransition {
            at: self.origin.elapsed(),
            from,
            to,
        });
    }

    fn snapshot(&self) -> Vec<PhaseTransition> {
        self.entries.iter().copied().collect()
    }
}

/// Outcome of one collection request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CollectionReport {
    /// What ran; differs from the request after an escalation
    pub kind: CollectionKind,
    /// Why it ran
    pub cause: GcCause,
    /// False when the request was redundant and skipped
    pub performed: bool,
    /// Time mutators were stopped
    pub pause: Duration,
    /// Wall time of the whole collection
    pub duration: Duration,
    /// Bytes returned to free lists or free regions
    pub reclaimed_bytes: usize,
    /// Bytes promoted to the old generation
    pub promoted_bytes: usize,
    /// Bytes found live by marking
    pub marked_bytes: usize,
    /// Whether the old generation was compacted
    pub compacted: bool,
    /// Whether the concurrent trace or the minor collection escalated
    pub escalated: bool,
    /// Bytes in use before
    pub heap_before: usize,
    /// Bytes in use after
    pub heap_after: usize,
}

impl CollectionReport {
    fn new(kind: CollectionKind, cause: GcCause, heap_before: usize) -> Self {
        Self {
            kind,
            cause,
            performed: true,
            pause: Duration::ZERO,
            duration: Duration::ZERO,
            reclaimed_bytes: 0,
            promoted_bytes: 0,
            marked_bytes: 0,
            compacted: false,
            escalated: false,
            heap_before,
            heap_after: heap_before,
        }
    }

    fn skipped(kind: CollectionKind, cause: GcCause, heap_used: usize) -> Self {
        Self {
            performed: false,
            ..Self::new(kind, cause, heap_used)
        }
    }
}

impl fmt::Display for CollectionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[GC ({}, {})", self.kind.name(), self.cause.name())?;
        if !self.performed {
            return write!(f, " skipped]");
        }
        write!(
            f,
            " {}K->{}K, reclaimed {}K, promoted {}K",
            self.heap_before / 1024,
            self.heap_after / 1024,
            self.reclaimed_bytes / 1024,
            self.promoted_bytes / 1024
        )?;
        if self.compacted {
            write!(f, ", compacted")?;
        }
        if self.escalated {
            write!(f, ", escalated")?;
        }
        write!(
            f,
            ", pause {:.6} secs, total {:.6} secs]",
            self.pause.as_secs_f64(),
            self.duration.as_secs_f64()
        )
    }
}

/// GC statistics
#[derive(Debug, Default, Clone)]
pub struct GcStats {
    /// Number of collections
    pub collections: u64,
    /// Minor collections
    pub minor_collections: u64,
    /// Major collections
    pub major_collections: u64,
    /// Full collections, including escalated minors
    pub full_collections: u64,
    /// Requests skipped as redundant
    pub skipped: u64,
    /// Compactions
    pub compactions: u64,
    /// Escalations (trace cut short, promotion failure, guarantee failure)
    pub escalations: u64,
    /// Total time spent in GC (nanoseconds)
    pub total_time_ns: u64,
    /// Total time mutators were stopped (nanoseconds)
    pub total_pause_ns: u64,
    /// Longest pause (nanoseconds)
    pub max_pause_ns: u64,
    /// Bytes reclaimed in last collection
    pub last_reclaimed: usize,
    /// Bytes reclaimed overall
    pub total_reclaimed: usize,
    /// Bytes promoted overall
    pub total_promoted: usize,
    /// Live bytes found by the last marking
    pub last_marked: usize,
    /// Recent phase transitions, oldest first
    pub phases: Vec<PhaseTransition>,
}

#[derive(Debug, Default)]
struct Epochs {
    minor: Option<u64>,
    major: Option<u64>,
    full: Option<u64>,
}

impl Epochs {
    fn is_redundant(&self, kind: CollectionKind, epoch: Option<u64>) -> bool {
        let last = match kind {
            CollectionKind::Minor => self.minor,
            CollectionKind::Major => self.major,
            CollectionKind::Full => self.full,
        };
        epoch.is_some() && last == epoch
    }

    fn record(&mut self, kind: CollectionKind, epoch: Option<u64>) {
        match kind {
            CollectionKind::Minor => self.minor = epoch,
            CollectionKind::Major => self.major = epoch,
            CollectionKind::Full => {
                self.minor = epoch;
                self.major = epoch;
                self.full = epoch;
            }
        }
    }
}

/// Runs collections against a heap
pub(crate) struct CollectorDriver {
    state: AtomicU8,
    cycle: Mutex<()>,
    epochs: Mutex<Epochs>,
    stats: Mutex<GcStats>,
    phases: Mutex<PhaseLog>,
}

impl CollectorDriver {
    pub(crate) fn new() -> Self {
        Self {
            state: AtomicU8::new(CollectorState::Idle as u8),
            cycle: Mutex::new(()),
            epochs: Mutex::new(Epochs::default()),
            stats: Mutex::new(GcStats::default()),
            phases: Mutex::new(PhaseLog::new(Instant::now())),
        }
    }

    /// Current state
    pub(crate) fn state(&self) -> CollectorState {
        CollectorState::from(self.state.load(Ordering::Acquire))
    }

    /// Statistics so far
    pub(crate) fn stats(&self) -> GcStats {
        let mut stats = self.stats.lock().clone();
        stats.phases = self.phases.lock().snapshot();
        stats
    }

    fn transition(&self, to: CollectorState) {
        let from = CollectorState::from(self.state.swap(to as u8, Ordering::AcqRel));
        if from == to {
            return;
        }
        self.phases.lock().record(from, to);
        tracing::debug!(target: "otter::heap", from = from.name(), to = to.name(), "collector phase");
    }

    fn acquire_cycle(&self, core: &HeapCore, kind: CollectionKind) -> MutexGuard<'_, ()> {
        if let Some(guard) = self.cycle.try_lock() {
            return guard;
        }
        let mut escalated = false;
        loop {
            if !escalated && core.marker.phase() == MarkPhase::ConcurrentTrace {
                tracing::warn!(
                    target: "otter::heap",
                    requested = kind.name(),
                    "collection requested during concurrent trace; escalating"
                );
                core.marker.request_escalation();
                escalated = true;
            }
            if let Some(guard) = self.cycle.try_lock_for(Duration::from_millis(1)) {
                return guard;
            }
        }
    }

    /// Run a collection of `kind`. The caller must not be a running mutator.
    pub(crate) fn collect(
        &self,
        core: &HeapCore,
        kind: CollectionKind,
        cause: GcCause,
    ) -> GcResult<CollectionReport> {
        let _cycle = self.acquire_cycle(core, kind);

        let epoch = core.mutation_epoch();
        if self.epochs.lock().is_redundant(kind, epoch) {
            self.stats.lock().skipped += 1;
            let report = CollectionReport::skipped(kind, cause, core.heap_used());
            tracing::debug!(target: "otter::heap", "{report}");
            return Ok(report);
        }

        let started = Instant::now();
        let mut report = CollectionReport::new(kind, cause, core.heap_used());
        let result = match kind {
            CollectionKind::Minor => self.run_minor(core, &mut report),
            CollectionKind::Major => self.run_major(core, &mut report),
            CollectionKind::Full => self.run_full(core, &mut report),
        };
        self.transition(CollectorState::Idle);
        if let Err(err) = result {
            if err.is_fatal() {
                fatal(err);
            }
            tracing::warn!(target: "otter::heap", kind = kind.name(), error = %err, "collection failed");
            return Err(err);
        }

        report.duration = started.elapsed();
        report.heap_after = core.heap_used();
        self.epochs.lock().record(report.kind, epoch);
        self.record(&report);
        tracing::info!(
            target: "otter::heap",
            kind = report.kind.name(),
            cause = report.cause.name(),
            pause_us = report.pause.as_micros() as u64,
            reclaimed = report.reclaimed_bytes,
            live = report.heap_after,
            promoted = report.promoted_bytes,
            "{report}"
        );
        Ok(report)
    }

    fn record(&self, report: &CollectionReport) {
        let mut stats = self.stats.lock();
        stats.collections += 1;
        match report.kind {
            CollectionKind::Minor => stats.minor_collections += 1,
            CollectionKind::Major => stats.major_collections += 1,
            CollectionKind::Full => stats.full_collections += 1,
        }
        if report.compacted {
            stats.compactions += 1;
        }
        if report.escalated {
            stats.escalations += 1;
        }
        let pause = report.pause.as_nanos() as u64;
        stats.total_time_ns += report.duration.as_nanos() as u64;
        stats.total_pause_ns += pause;
        stats.max_pause_ns = stats.max_pause_ns.max(pause);
        stats.last_reclaimed = report.reclaimed_bytes;
        stats.total_reclaimed += report.reclaimed_bytes;
        stats.total_promoted += report.promoted_bytes;
        if report.kind != CollectionKind::Minor {
            stats.last_marked = report.marked_bytes;
        }
    }

    fn run_minor(&self, core: &HeapCore, report: &mut CollectionReport) -> GcResult<()> {
        if !core.generations.promotion_guarantee(&core.regions) {
            tracing::debug!(target: "otter::heap", "promotion guarantee failed; collecting everything");
            report.kind = CollectionKind::Full;
            report.cause = GcCause::PromotionGuarantee;
            report.escalated = true;
            return self.run_full(core, report);
        }

        let token = core.safepoints.request_safepoint()?;
        self.scavenge(core, &token, report)?;
        if report.escalated {
            tracing::warn!(target: "otter::heap", "evacuation failed; escalating to a full collection");
            report.kind = CollectionKind::Full;
            report.cause = GcCause::EvacuationFailure;
            self.mark_sweep_compact(core, &token, report, true)?;
        }
        report.pause += token.elapsed();
        Ok(())
    }

    fn run_major(&self, core: &HeapCore, report: &mut CollectionReport) -> GcResult<()> {
        {
            let token = core.safepoints.request_safepoint()?;
            self.transition(CollectorState::InitialMark);
            core.marker.initial_mark(core, &token);
            report.pause += token.elapsed();
        }

        self.transition(CollectorState::ConcurrentTrace);
        if !core.marker.concurrent_trace(core) {
            tracing::warn!(
                target: "otter::heap",
                "allocation outpaced concurrent marking; finishing the trace at a safepoint"
            );
            report.escalated = true;
        }

        let token = core.safepoints.request_safepoint()?;
        self.transition(CollectorState::FinalMark);
        let mark = core.marker.final_mark(core, &token)?;
        report.marked_bytes = mark.marked_bytes;
        let force = report.escalated;
        self.sweep_and_compact(core, &token, report, force)?;
        report.pause += token.elapsed();
        Ok(())
    }

    fn run_full(&self, core: &HeapCore, report: &mut CollectionReport) -> GcResult<()> {
        let token = core.safepoints.request_safepoint()?;
        self.scavenge(core, &token, report)?;
        self.mark_sweep_compact(core, &token, report, true)?;
        report.pause += token.elapsed();
        Ok(())
    }

    fn scavenge(
        &self,
        core: &HeapCore,
        token: &SafepointToken<'_>,
        report: &mut CollectionReport,
    ) -> GcResult<()> {
        self.transition(CollectorState::MinorCollect);
        let outcome = generation::scavenge(core, token)?;
        report.reclaimed_bytes += outcome.reclaimed_bytes;
        report.promoted_bytes += outcome.promoted_bytes;
        if outcome.evacuation_failed() {
            report.escalated = true;
        }
        tracing::debug!(
            target: "otter::heap",
            copied = outcome.objects_copied,
            survived = outcome.survived_bytes,
            promoted = outcome.promoted_bytes,
            "scavenge done"
        );
        Ok(())
    }

    fn mark_sweep_compact(
        &self,
        core: &HeapCore,
        token: &SafepointToken<'_>,
        report: &mut CollectionReport,
        force_compact: bool,
    ) -> GcResult<()> {
        self.transition(CollectorState::InitialMark);
        core.marker.initial_mark(core, token);
        self.transition(CollectorState::FinalMark);
        let mark = core.marker.final_mark(core, token)?;
        report.marked_bytes = mark.marked_bytes;
        self.sweep_and_compact(core, token, report, force_compact)
    }

    fn sweep_and_compact(
        &self,
        core: &HeapCore,
        token: &SafepointToken<'_>,
        report: &mut CollectionReport,
        force_compact: bool,
    ) -> GcResult<()> {
        self.transition(CollectorState::Sweep);
        let swept = sweep::sweep_old(core, token);
        report.reclaimed_bytes += swept.reclaimed_bytes;
        tracing::debug!(
            target: "otter::heap",
            regions = swept.regions,
            live = swept.live_bytes,
            reclaimed = swept.reclaimed_bytes,
            chunks = swept.chunks,
            "sweep done"
        );

        if force_compact || needs_compaction(core) {
            self.transition(CollectorState::Compact);
            compact::compact_old(core, token)?;
            report.compacted = true;
        }
        Ok(())
    }
}

impl fmt::Debug for CollectorDriver {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectorDriver")
            .field("state", &self.state())
            .finish()
    }
}

/// Whether the old generation is too fragmented to serve its requests
fn needs_compaction(core: &HeapCore) -> bool {
    let old = core.generations.old();
    let failed = old.largest_failed_request();
    (failed > 0 && failed > old.largest_free_chunk())
        || old.fragmentation() > core.config.compaction_fragmentation_threshold
}

enum MarkRequest {
    Start(GcCause),
    Shutdown,
}

/// Background thread running concurrent major collections
pub(crate) struct ConcurrentMarkThread {
    sender: Sender<MarkRequest>,
    pending: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl ConcurrentMarkThread {
    /// Spawn the thread; it holds the heap weakly and exits once it is gone
    pub(crate) fn spawn(core: Weak<HeapCore>) -> std::io::Result<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        let pending = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&pending);
        let handle = thread::Builder::new()
            .name("otter-heap-marker".to_string())
            .spawn(move || run_mark_thread(core, receiver, flag))?;
        Ok(Self {
            sender,
            pending,
            handle: Some(handle),
        })
    }

    /// Ask for a concurrent cycle. Returns false if one is already queued.
    pub(crate) fn request(&self, cause: GcCause) -> bool {
        if self.pending.swap(true, Ordering::AcqRel) {
            return false;
        }
        if self.sender.send(MarkRequest::Start(cause)).is_err() {
            self.pending.store(false, Ordering::Release);
            return false;
        }
        true
    }

    /// Whether a requested cycle has not finished yet
    pub(crate) fn is_pending(&self) -> bool {
        self.pending.load(Ordering::Acquire)
    }
}

fn run_mark_thread(core: Weak<HeapCore>, receiver: Receiver<MarkRequest>, pending: Arc<AtomicBool>) {
    for request in receiver {
        let MarkRequest::Start(cause) = request else {
            break;
        };
        let Some(core) = core.upgrade() else {
            break;
        };
        if let Err(err) = core.collect(CollectionKind::Major, cause) {
            tracing::warn!(target: "otter::heap", error = %err, "background collection failed");
        }
        pending.store(false, Ordering::Release);
    }
    tracing::debug!(target: "otter::heap", "marker thread exiting");
}

impl Drop for ConcurrentMarkThread {
    fn drop(&mut self) {
        let _ = self.sender.send(MarkRequest::Shutdown);
        if let Some(handle) = self.handle.take() {
            // The last heap reference may be dropped by the marker thread itself.
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }
}

impl fmt::Debug for ConcurrentMarkThread {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConcurrentMarkThread")
            .field("pending", &self.is_pending())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::Address;
    use crate::config::GcConfig;
    use crate::heap::Heap;

    #[test]
    fn test_state_round_trip_from_u8() {
        for state in [
            CollectorState::Idle,
            CollectorState::MinorCollect,
            CollectorState::InitialMark,
            CollectorState::ConcurrentTrace,
            CollectorState::FinalMark,
            CollectorState::Sweep,
            CollectorState::Compact,
        ] {
            assert_eq!(CollectorState::from(state as u8), state);
        }
        assert_eq!(CollectorState::from(200), CollectorState::Idle);
    }

    #[test]
    fn test_epochs_per_kind() {
        let mut epochs = Epochs::default();
        assert!(!epochs.is_redundant(CollectionKind::Minor, Some(3)));
        epochs.record(CollectionKind::Minor, Some(3));
        assert!(epochs.is_redundant(CollectionKind::Minor, Some(3)));
        assert!(!epochs.is_redundant(CollectionKind::Major, Some(3)));
        assert!(!epochs.is_redundant(CollectionKind::Minor, Some(4)));

        epochs.record(CollectionKind::Full, Some(7));
        assert!(epochs.is_redundant(CollectionKind::Minor, Some(7)));
        assert!(epochs.is_redundant(CollectionKind::Major, Some(7)));
        assert!(epochs.is_redundant(CollectionKind::Full, Some(7)));
    }

    #[test]
    fn test_untracked_roots_never_redundant() {
        let mut epochs = Epochs::default();
        epochs.record(CollectionKind::Major, None);
        assert!(!epochs.is_redundant(CollectionKind::Major, None));
    }

    #[test]
    fn test_phase_log_is_bounded() {
        let mut log = PhaseLog::new(Instant::now());
        for _ in 0..PHASE_LOG_CAPACITY {
            log.record(CollectorState::Idle, CollectorState::MinorCollect);
        }
        log.record(CollectorState::MinorCollect, CollectorState::Idle);
        let entries = log.snapshot();
        assert_eq!(entries.len(), PHASE_LOG_CAPACITY);
        assert_eq!(entries.last().map(|t| t.to), Some(CollectorState::Idle));
    }

    #[test]
    fn test_report_display() {
        let mut report = CollectionReport::new(CollectionKind::Minor, GcCause::AllocationFailure, 8192);
        report.heap_after = 2048;
        report.reclaimed_bytes = 6144;
        report.compacted = true;
        let line = report.to_string();
        assert!(line.starts_with("[GC (Minor, allocation failure) 8K->2K, reclaimed 6K"));
        assert!(line.contains("compacted"));

        let skipped = CollectionReport::skipped(CollectionKind::Full, GcCause::Explicit, 0);
        assert_eq!(skipped.to_string(), "[GC (Full, explicit) skipped]");
    }

    #[test]
    fn test_collection_requested_during_trace_escalates() {
        let heap = Heap::new(GcConfig::small()).unwrap();
        let m = heap.attach();
        let head = heap.root(Address::NULL);
        for i in 0..200 {
            let node = m.allocate_tenured(32, 1).unwrap();
            m.write_ref(node, 0, head.get()).unwrap();
            m.write_payload(node, 0, i).unwrap();
            head.set(node);
        }
        drop(m);

        let core = heap.core();
        let driver = &core.driver;
        let cycle = driver.cycle.lock();
        {
            let token = core.safepoints.request_safepoint().unwrap();
            core.marker.initial_mark(core, &token);
        }
        driver.transition(CollectorState::ConcurrentTrace);

        let report = thread::scope(|s| {
            let full = s.spawn(|| driver.collect(core, CollectionKind::Full, GcCause::Explicit));
            while !core.marker.is_escalated() {
                thread::yield_now();
            }
            assert!(!core.marker.concurrent_trace(core));
            {
                let token = core.safepoints.request_safepoint().unwrap();
                core.marker.final_mark(core, &token).unwrap();
            }
            core.marker.verify(core).unwrap();
            driver.transition(CollectorState::Idle);
            drop(cycle);
            full.join().unwrap().unwrap()
        });

        assert_eq!(report.kind, CollectionKind::Full);
        assert!(report.compacted);
        assert_eq!(core.marker.stats().escalations, 1);
        heap.verify().unwrap();
        heap.verify_marking().unwrap();

        let (mut node, mut expected) = (head.get(), 200);
        while !node.is_null() {
            expected -= 1;
            assert_eq!(heap.read_payload(node, 0).unwrap(), expected);
            node = heap.read_ref(node, 0).unwrap();
        }
        assert_eq!(expected, 0);
    }
}
