//! Safepoint coordination
//!
//! ## Design
//!
//! - Every mutator thread registers a [`MutatorState`]
//! - A requester raises the safepoint flag and waits until every registered
//!   mutator is parked (at a poll) or blocked (in a safe region)
//! - [`SafepointToken`] is the proof that the world is stopped; dropping it
//!   resumes the mutators
//! - Requesters are serialized: at most one token exists at a time

use crate::error::{GcError, GcResult};
use crossbeam_utils::CachePadded;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

/// Safepoint status of a mutator
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutatorStatus {
    /// Executing mutator code
    Running = 0,
    /// Parked at a poll while a safepoint is active
    Parked = 1,
    /// In a safe region (waiting, blocked in the collector)
    Blocked = 2,
    /// Unregistered
    Detached = 3,
}

impl MutatorStatus {
    /// Name used in logs and errors
    pub fn name(self) -> &'static str {
        match self {
            MutatorStatus::Running => "running",
            MutatorStatus::Parked => "parked",
            MutatorStatus::Blocked => "blocked",
            MutatorStatus::Detached => "detached",
        }
    }

    fn is_safe(self) -> bool {
        !matches!(self, MutatorStatus::Running)
    }
}

impl From<u8> for MutatorStatus {
    fn from(v: u8) -> Self {
        match v {
            0 => MutatorStatus::Running,
            1 => MutatorStatus::Parked,
            2 => MutatorStatus::Blocked,
            _ => MutatorStatus::Detached,
        }
    }
}

/// Per-mutator safepoint state
#[derive(Debug)]
pub struct MutatorState {
    id: usize,
    status: AtomicU8,
    parks: AtomicU64,
}

impl MutatorState {
    /// Mutator id
    pub fn id(&self) -> usize {
        self.id
    }

    /// Current status
    pub fn status(&self) -> MutatorStatus {
        MutatorStatus::from(self.status.load(Ordering::Acquire))
    }

    /// Times this mutator parked at a poll
    pub fn parks(&self) -> u64 {
        self.parks.load(Ordering::Relaxed)
    }

    fn set(&self, status: MutatorStatus) {
        self.status.store(status as u8, Ordering::Release);
    }
}

/// Safepoint statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SafepointStats {
    /// Safepoints reached
    pub safepoints: u64,
    /// Requests that timed out
    pub timeouts: u64,
    /// Total time spent waiting for mutators
    pub total_sync_time: Duration,
    /// Longest wait for mutators
    pub max_sync_time: Duration,
    /// Total time the world was stopped
    pub total_stopped_time: Duration,
}

#[derive(Default)]
struct Registry {
    mutators: Vec<Arc<MutatorState>>,
}

/// Stops and resumes mutators
pub struct SafepointCoordinator {
    requested: CachePadded<AtomicBool>,
    active: AtomicBool,
    owner: Mutex<()>,
    registry: Mutex<Registry>,
    parked: Condvar,
    resumed: Condvar,
    next_id: AtomicUsize,
    timeout: Option<Duration>,
    stats: Mutex<SafepointStats>,
}

impl SafepointCoordinator {
    /// Coordinator whose requests fail after `timeout`
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            requested: CachePadded::new(AtomicBool::new(false)),
            active: AtomicBool::new(false),
            owner: Mutex::new(()),
            registry: Mutex::new(Registry::default()),
            parked: Condvar::new(),
            resumed: Condvar::new(),
            next_id: AtomicUsize::new(1),
            timeout,
            stats: Mutex::new(SafepointStats::default()),
        }
    }

    /// Register the calling thread as a mutator.
    ///
    /// The mutator starts `Running`, after waiting out any safepoint in progress.
    pub fn register(&self) -> Arc<MutatorState> {
        let state = Arc::new(MutatorState {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            status: AtomicU8::new(MutatorStatus::Blocked as u8),
            parks: AtomicU64::new(0),
        });
        self.registry.lock().mutators.push(Arc::clone(&state));
        self.leave_blocked(&state);
        state
    }

    /// Remove a mutator
    pub fn unregister(&self, state: &MutatorState) {
        let mut registry = self.registry.lock();
        state.set(MutatorStatus::Detached);
        registry.mutators.retain(|m| m.id != state.id);
        self.parked.notify_all();
    }

    /// Registered mutators
    pub fn mutator_count(&self) -> usize {
        self.registry.lock().mutators.len()
    }

    /// Whether a safepoint has been requested or is active
    #[inline]
    pub fn is_requested(&self) -> bool {
        self.requested.load(Ordering::Acquire)
    }

    /// Whether a token is currently held
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Park the mutator if a safepoint is requested
    #[inline]
    pub fn poll(&self, state: &MutatorState) {
        if self.is_requested() {
            self.park(state);
        }
    }

    #[cold]
    fn park(&self, state: &MutatorState) {
        let mut registry = self.registry.lock();
        if !self.is_requested() {
            return;
        }
        state.set(MutatorStatus::Parked);
        state.parks.fetch_add(1, Ordering::Relaxed);
        self.parked.notify_all();
        while self.is_requested() {
            self.resumed.wait(&mut registry);
        }
        state.set(MutatorStatus::Running);
    }

    /// Enter a safe region; the collector may run while the mutator is inside
    pub fn enter_blocked(&self, state: &MutatorState) {
        let _registry = self.registry.lock();
        state.set(MutatorStatus::Blocked);
        self.parked.notify_all();
    }

    /// Leave a safe region, waiting out any safepoint in progress
    pub fn leave_blocked(&self, state: &MutatorState) {
        let mut registry = self.registry.lock();
        while self.is_requested() {
            self.resumed.wait(&mut registry);
        }
        state.set(MutatorStatus::Running);
    }

    /// Safe region bound to a scope
    pub fn blocked<'a>(&'a self, state: &'a MutatorState) -> BlockedScope<'a> {
        self.enter_blocked(state);
        BlockedScope {
            coordinator: self,
            state,
        }
    }

    /// Stop every mutator.
    ///
    /// Requesters are serialized. The calling thread must not be a running
    /// mutator (enter a [`BlockedScope`] first).
    pub fn request_safepoint(&self) -> GcResult<SafepointToken<'_>> {
        let owner = self.owner.lock();
        let requested_at = Instant::now();
        let mut registry = self.registry.lock();
        self.requested.store(true, Ordering::Release);

        loop {
            let running = registry
                .mutators
                .iter()
                .find(|m| !m.status().is_safe())
                .cloned();
            let Some(running) = running else { break };

            let waited = requested_at.elapsed();
            let timed_out = match self.timeout {
                Some(limit) if waited >= limit => true,
                Some(limit) => self.parked.wait_for(&mut registry, limit - waited).timed_out()
                    && registry.mutators.iter().any(|m| !m.status().is_safe()),
                None => {
                    self.parked.wait(&mut registry);
                    false
                }
            };
            if timed_out {
                self.requested.store(false, Ordering::Release);
                self.resumed.notify_all();
                drop(registry);
                self.stats.lock().timeouts += 1;
                let err = GcError::SafepointTimeout {
                    mutator: running.id(),
                    state: running.status().name(),
                    waited: requested_at.elapsed(),
                };
                tracing::error!(
                    target: "otter::heap",
                    mutator = running.id(),
                    state = running.status().name(),
                    "safepoint timed out"
                );
                return Err(err);
            }
        }
        drop(registry);

        let was_active = self.active.swap(true, Ordering::AcqRel);
        debug_assert!(!was_active, "two safepoint tokens alive");
        let sync_time = requested_at.elapsed();
        {
            let mut stats = self.stats.lock();
            stats.safepoints += 1;
            stats.total_sync_time += sync_time;
            stats.max_sync_time = stats.max_sync_time.max(sync_time);
        }
        tracing::trace!(target: "otter::heap", sync_us = sync_time.as_micros() as u64, "safepoint reached");
        Ok(SafepointToken {
            coordinator: self,
            reached_at: Instant::now(),
            _owner: owner,
        })
    }

    /// Resume mutators
    pub fn release_safepoint(&self, token: SafepointToken<'_>) {
        drop(token);
    }

    /// Statistics so far
    pub fn stats(&self) -> SafepointStats {
        self.stats.lock().clone()
    }

    fn release(&self, reached_at: Instant) {
        self.active.store(false, Ordering::Release);
        {
            let _registry = self.registry.lock();
            self.requested.store(false, Ordering::Release);
            self.resumed.notify_all();
        }
        self.stats.lock().total_stopped_time += reached_at.elapsed();
    }
}

impl std::fmt::Debug for SafepointCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafepointCoordinator")
            .field("requested", &self.is_requested())
            .field("active", &self.is_active())
            .field("timeout", &self.timeout)
            .finish()
    }
}

/// Proof that all mutators are stopped. Dropping it resumes them.
#[must_use = "dropping the token immediately resumes mutators"]
pub struct SafepointToken<'a> {
    coordinator: &'a SafepointCoordinator,
    reached_at: Instant,
    _owner: MutexGuard<'a, ()>,
}

impl SafepointToken<'_> {
    /// How long the world has been stopped
    pub fn elapsed(&self) -> Duration {
        self.reached_at.elapsed()
    }
}

impl Drop for SafepointToken<'_> {
    fn drop(&mut self) {
        self.coordinator.release(self.reached_at);
    }
}

impl std::fmt::Debug for SafepointToken<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SafepointToken")
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

/// Safe region guard; leaving it waits out any active safepoint
pub struct BlockedScope<'a> {
    coordinator: &'a SafepointCoordinator,
    state: &'a MutatorState,
}

impl Drop for BlockedScope<'_> {
    fn drop(&mut self) {
        self.coordinator.leave_blocked(self.state);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_safepoint_without_mutators() {
        let coordinator = SafepointCoordinator::new(None);
        let token = coordinator.request_safepoint().unwrap();
        assert!(coordinator.is_active());
        coordinator.release_safepoint(token);
        assert!(!coordinator.is_active());
        assert!(!coordinator.is_requested());
        assert_eq!(coordinator.stats().safepoints, 1);
    }

    #[test]
    fn test_running_mutator_parks_at_poll() {
        let coordinator = Arc::new(SafepointCoordinator::new(Some(Duration::from_secs(5))));
        let stop = Arc::new(AtomicBool::new(false));
        let ready = Arc::new(std::sync::Barrier::new(2));

        let worker = {
            let coordinator = Arc::clone(&coordinator);
            let stop = Arc::clone(&stop);
            let ready = Arc::clone(&ready);
            thread::spawn(move || {
                let state = coordinator.register();
                ready.wait();
                while !stop.load(Ordering::Acquire) {
                    coordinator.poll(&state);
                    thread::yield_now();
                }
                let parks = state.parks();
                coordinator.unregister(&state);
                parks
            })
        };

        ready.wait();
        let token = coordinator.request_safepoint().unwrap();
        drop(token);
        stop.store(true, Ordering::Release);
        assert!(worker.join().unwrap() >= 1);
    }

    #[test]
    fn test_blocked_mutator_does_not_delay_safepoint() {
        let coordinator = SafepointCoordinator::new(Some(Duration::from_millis(500)));
        let state = coordinator.register();
        {
            let _scope = coordinator.blocked(&state);
            let token = coordinator.request_safepoint().unwrap();
            drop(token);
        }
        assert_eq!(state.status(), MutatorStatus::Running);
    }

    #[test]
    fn test_timeout_names_offender() {
        let coordinator = SafepointCoordinator::new(Some(Duration::from_millis(20)));
        let state = coordinator.register();
        let err = coordinator.request_safepoint().unwrap_err();
        assert!(matches!(
            err,
            GcError::SafepointTimeout { mutator, state: "running", .. } if mutator == state.id()
        ));
        assert!(!coordinator.is_requested());
        assert_eq!(coordinator.stats().timeouts, 1);
    }
}
