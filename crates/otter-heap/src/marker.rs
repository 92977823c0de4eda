//! Concurrent marker
//!
//! ## Design
//!
//! - `InitialMark` (safepoint): clear bitmaps, retire active regions, gray
//!   the root referents, arm the barrier; allocation turns black from here on
//! - `ConcurrentTrace`: GC workers drain gray objects with work-stealing
//!   deques while mutators run; barrier output is fed back into the queue
//! - `FinalMark` (safepoint): rescan roots, drain the barrier buffer, finish
//!   the trace, disarm the barrier
//!
//! An object is blackened (scanned bit set) before its fields are read, so
//! a store racing with the scan is seen either by the scanner or by the
//! insertion barrier.

use crate::address::{Address, WORD_SIZE};
use crate::error::{GcError, GcResult};
use crate::heap::HeapCore;
use crate::object::MarkColor;
use crate::region::GenerationTag;
use crate::safepoint::SafepointToken;
use crossbeam_deque::{Injector, Steal, Stealer, Worker};
use crossbeam_utils::Backoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering, fence};
use std::thread;
use std::time::{Duration, Instant};

/// Marking phase
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MarkPhase {
    /// No cycle in progress
    Idle = 0,
    /// Root snapshot (safepoint)
    InitialMark = 1,
    /// Tracing alongside mutators
    ConcurrentTrace = 2,
    /// Finishing the trace (safepoint)
    FinalMark = 3,
}

impl From<u8> for MarkPhase {
    fn from(v: u8) -> Self {
        match v {
            1 => MarkPhase::InitialMark,
            2 => MarkPhase::ConcurrentTrace,
            3 => MarkPhase::FinalMark,
            _ => MarkPhase::Idle,
        }
    }
}

/// How many GC workers to run for a phase
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerPolicy {
    /// Upper bound
    pub max_workers: usize,
    /// Scale with the number of mutators
    pub dynamic: bool,
}

impl WorkerPolicy {
    /// Workers for a phase with `mutators` registered mutators
    pub fn workers_for(&self, mutators: usize) -> usize {
        if self.dynamic {
            (2 * mutators).clamp(1, self.max_workers.max(1))
        } else {
            self.max_workers.max(1)
        }
    }
}

/// Marking statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MarkStats {
    /// Completed marking cycles
    pub cycles: u64,
    /// Objects blackened in the last cycle
    pub marked_objects: usize,
    /// Bytes blackened in the last cycle
    pub marked_bytes: usize,
    /// Workers used by the last concurrent trace
    pub workers: usize,
    /// Concurrent traces cut short by escalation
    pub escalations: u64,
    /// Time spent in the last concurrent trace
    pub concurrent_time: Duration,
}

/// Tri-color marker shared by the driver and GC workers
pub struct ConcurrentMarker {
    phase: AtomicU8,
    escalate: AtomicBool,
    policy: WorkerPolicy,
    verify_after_mark: bool,
    injector: Injector<Address>,
    marked_objects: AtomicUsize,
    marked_bytes: AtomicUsize,
    stats: Mutex<MarkStats>,
}

impl ConcurrentMarker {
    /// Marker using `policy` for worker counts; `verify` checks the
    /// black-to-white invariant after final mark
    pub fn new(policy: WorkerPolicy, verify: bool) -> Self {
        Self {
            phase: AtomicU8::new(MarkPhase::Idle as u8),
            escalate: AtomicBool::new(false),
            policy,
            verify_after_mark: verify,
            injector: Injector::new(),
            marked_objects: AtomicUsize::new(0),
            marked_bytes: AtomicUsize::new(0),
            stats: Mutex::new(MarkStats::default()),
        }
    }

    /// Current phase
    pub fn phase(&self) -> MarkPhase {
        MarkPhase::from(self.phase.load(Ordering::Acquire))
    }

    fn set_phase(&self, phase: MarkPhase) {
        self.phase.store(phase as u8, Ordering::Release);
    }

    /// Worker policy
    pub fn policy(&self) -> WorkerPolicy {
        self.policy
    }

    /// Ask the concurrent trace to stop; the rest is finished at final mark
    pub fn request_escalation(&self) {
        self.escalate.store(true, Ordering::Release);
    }

    /// Whether escalation was requested this cycle
    pub fn is_escalated(&self) -> bool {
        self.escalate.load(Ordering::Acquire)
    }

    /// Statistics
    pub fn stats(&self) -> MarkStats {
        self.stats.lock().clone()
    }

    fn shade(&self, core: &HeapCore, addr: Address) {
        if addr.is_null() {
            return;
        }
        if let Some(region) = core.regions.region_for(addr) {
            if region.tag() != GenerationTag::Free && region.bitmap.mark(region.offset_of(addr)) {
                self.injector.push(addr);
            }
        }
    }

    fn shade_roots(&self, core: &HeapCore) {
        core.for_each_root(|slot| self.shade(core, slot.load()));
    }

    fn drain_barrier(&self, core: &HeapCore) -> usize {
        let entries = core.barrier.buffer().drain();
        let n = entries.len();
        for addr in entries {
            self.injector.push(addr);
        }
        n
    }

    /// Snapshot roots and arm barriers. Requires a safepoint.
    pub(crate) fn initial_mark(&self, core: &HeapCore, _token: &SafepointToken<'_>) {
        self.set_phase(MarkPhase::InitialMark);
        self.escalate.store(false, Ordering::Release);
        self.marked_objects.store(0, Ordering::Relaxed);
        self.marked_bytes.store(0, Ordering::Relaxed);

        let generations = &core.generations;
        generations.eden().retire_active();
        generations.survivor().retire_active();
        generations.old().retire_active();
        for region in core.regions.regions() {
            region.bitmap.clear();
        }
        core.barrier.buffer().drain();

        self.shade_roots(core);
        core.barrier.set_marking(true);
        tracing::debug!(
            target: "otter::heap",
            gray = self.injector.len(),
            "initial mark done"
        );
        self.set_phase(MarkPhase::ConcurrentTrace);
    }

    /// Trace alongside mutators. Returns false if escalation cut it short.
    pub(crate) fn concurrent_trace(&self, core: &HeapCore) -> bool {
        let workers = self.policy.workers_for(core.safepoints.mutator_count());
        let started = Instant::now();
        let finished = self.trace(core, workers, true);
        let mut stats = self.stats.lock();
        stats.workers = workers;
        stats.concurrent_time = started.elapsed();
        if !finished {
            stats.escalations += 1;
        }
        finished
    }

    /// Finish marking and disarm barriers. Requires a safepoint.
    pub(crate) fn final_mark(&self, core: &HeapCore, _token: &SafepointToken<'_>) -> GcResult<MarkStats> {
        self.set_phase(MarkPhase::FinalMark);
        self.shade_roots(core);
        self.drain_barrier(core);
        let workers = self.policy.max_workers.max(1);
        self.trace(core, workers, false);
        core.barrier.set_marking(false);
        // The trace itself never shades through the barrier, and mutators
        // are stopped, so the buffer must be empty.
        debug_assert!(core.barrier.buffer().is_empty());

        let result = if self.verify_after_mark { self.verify(core) } else { Ok(()) };
        self.set_phase(MarkPhase::Idle);

        let mut stats = self.stats.lock();
        stats.cycles += 1;
        stats.marked_objects = self.marked_objects.load(Ordering::Relaxed);
        stats.marked_bytes = self.marked_bytes.load(Ordering::Relaxed);
        tracing::debug!(
            target: "otter::heap",
            objects = stats.marked_objects,
            bytes = stats.marked_bytes,
            "final mark done"
        );
        let stats = stats.clone();
        result.map(|()| stats)
    }

    fn trace(&self, core: &HeapCore, workers: usize, interruptible: bool) -> bool {
        let idle = AtomicUsize::new(0);
        let aborted = AtomicBool::new(false);
        let locals: Vec<Worker<Address>> = (0..workers).map(|_| Worker::new_lifo()).collect();
        let stealers: Vec<Stealer<Address>> = locals.iter().map(|w| w.stealer()).collect();

        let run = |local: Worker<Address>| {
            self.mark_worker(core, &local, &stealers, &idle, workers, interruptible, &aborted)
        };
        if workers == 1 {
            for local in locals {
                run(local);
            }
        } else {
            let failed = AtomicUsize::new(0);
            thread::scope(|scope| {
                for (id, local) in locals.into_iter().enumerate() {
                    let run = &run;
                    let spawned = thread::Builder::new()
                        .name(format!("otter-heap-mark-{id}"))
                        .spawn_scoped(scope, move || run(local));
                    if let Err(err) = spawned {
                        // A missing worker counts as idle so the others can terminate.
                        idle.fetch_add(1, Ordering::SeqCst);
                        failed.fetch_add(1, Ordering::Relaxed);
                        tracing::warn!(target: "otter::heap", error = %err, "mark worker spawn failed");
                    }
                }
            });
            if failed.load(Ordering::Relaxed) > 0 && !aborted.load(Ordering::Acquire) {
                let local = Worker::new_lifo();
                let idle = AtomicUsize::new(0);
                self.mark_worker(core, &local, &[], &idle, 1, interruptible, &aborted);
            }
        }
        !aborted.load(Ordering::Acquire)
    }

    #[allow(clippy::too_many_arguments)]
    fn mark_worker(
        &self,
        core: &HeapCore,
        local: &Worker<Address>,
        stealers: &[Stealer<Address>],
        idle: &AtomicUsize,
        workers: usize,
        interruptible: bool,
        aborted: &AtomicBool,
    ) {
        let backoff = Backoff::new();
        loop {
            if interruptible && self.is_escalated() {
                self.abandon(local, aborted);
                return;
            }
            if let Some(object) = self.find_work(local, stealers) {
                self.scan_object(core, object, local);
                continue;
            }
            if self.drain_barrier(core) > 0 {
                continue;
            }

            idle.fetch_add(1, Ordering::SeqCst);
            loop {
                if interruptible && self.is_escalated() {
                    self.abandon(local, aborted);
                    return;
                }
                let visible = !self.injector.is_empty()
                    || stealers.iter().any(|s| !s.is_empty())
                    || !core.barrier.buffer().is_empty();
                if visible {
                    idle.fetch_sub(1, Ordering::SeqCst);
                    backoff.reset();
                    break;
                }
                if idle.load(Ordering::SeqCst) >= workers {
                    return;
                }
                backoff.snooze();
            }
        }
    }

    /// Hand gray objects back to the shared queue so final mark finds them
    fn abandon(&self, local: &Worker<Address>, aborted: &AtomicBool) {
        while let Some(object) = local.pop() {
            self.injector.push(object);
        }
        aborted.store(true, Ordering::Release);
    }

    fn find_work(&self, local: &Worker<Address>, stealers: &[Stealer<Address>]) -> Option<Address> {
        local.pop().or_else(|| {
            std::iter::repeat_with(|| {
                self.injector
                    .steal_batch_and_pop(local)
                    .or_else(|| stealers.iter().map(|s| s.steal()).collect::<Steal<_>>())
            })
            .find(|s| !s.is_retry())
            .and_then(|s| s.success())
        })
    }

    fn scan_object(&self, core: &HeapCore, object: Address, local: &Worker<Address>) {
        let Some(region) = core.regions.region_for(object) else {
            return;
        };
        let offset = region.offset_of(object);
        let Some(meta) = region.objects.read().get(offset) else {
            return;
        };
        region.bitmap.set_scanned(offset);
        fence(Ordering::SeqCst);

        for i in 0..meta.ref_slots() {
            let value = Address::from_word(region.load_word(object.offset(i * WORD_SIZE)));
            if value.is_null() {
                continue;
            }
            if let Some(child) = core.regions.region_for(value) {
                if child.bitmap.mark(child.offset_of(value)) {
                    local.push(value);
                }
            }
        }
        self.marked_objects.fetch_add(1, Ordering::Relaxed);
        self.marked_bytes.fetch_add(meta.size(), Ordering::Relaxed);
    }

    /// Check that no black object refers to a white one
    pub(crate) fn verify(&self, core: &HeapCore) -> GcResult<()> {
        for region in core.regions.regions() {
            if region.tag() == GenerationTag::Free {
                continue;
            }
            let objects: Vec<_> = region.objects.read().iter().collect();
            for (offset, meta) in objects {
                if region.bitmap.color(offset) != MarkColor::Black {
                    continue;
                }
                let object = region.start().offset(offset);
                for field in 0..meta.ref_slots() {
                    let target = Address::from_word(region.load_word(object.offset(field * WORD_SIZE)));
                    if target.is_null() {
                        continue;
                    }
                    let white = core
                        .regions
                        .region_for(target)
                        .is_some_and(|r| r.bitmap.color(r.offset_of(target)) == MarkColor::White);
                    if white {
                        return Err(GcError::MarkInvariantViolation { object, field, target });
                    }
                }
            }
        }
        Ok(())
    }
}

impl std::fmt::Debug for ConcurrentMarker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConcurrentMarker")
            .field("phase", &self.phase())
            .field("escalate", &self.is_escalated())
            .field("policy", &self.policy)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GcConfig;
    use crate::heap::Heap;

    #[test]
    fn test_dynamic_worker_count() {
        let policy = WorkerPolicy { max_workers: 4, dynamic: true };
        assert_eq!(policy.workers_for(0), 1);
        assert_eq!(policy.workers_for(1), 2);
        assert_eq!(policy.workers_for(8), 4);

        let fixed = WorkerPolicy { max_workers: 3, dynamic: false };
        assert_eq!(fixed.workers_for(0), 3);
    }

    #[test]
    fn test_phase_round_trip_from_u8() {
        assert_eq!(MarkPhase::from(2), MarkPhase::ConcurrentTrace);
        assert_eq!(MarkPhase::from(9), MarkPhase::Idle);
    }

    #[test]
    fn test_verify_reports_black_to_white_edge() {
        let heap = Heap::new(GcConfig::small()).unwrap();
        let m = heap.attach();
        let holder = m.allocate_tenured(32, 2).unwrap();
        let target = m.allocate_tenured(32, 0).unwrap();
        m.write_ref(holder, 1, target).unwrap();
        drop(m);

        let core = heap.core();
        assert!(core.marker.verify(core).is_ok());

        let region = core.regions.region_for(holder).unwrap();
        region.bitmap.blacken(region.offset_of(holder));
        assert_eq!(
            core.marker.verify(core),
            Err(GcError::MarkInvariantViolation { object: holder, field: 1, target })
        );

        let region = core.regions.region_for(target).unwrap();
        region.bitmap.blacken(region.offset_of(target));
        assert!(core.marker.verify(core).is_ok());
    }
}
