//! Safepoint rendezvous
//!
//! A safepoint is a point at which every registered thread is known to be
//! outside any region sensitive to concurrent structural change, such as the
//! body of a transition stub. Operations that need that guarantee, stub
//! reclamation in particular, run inside [`Safepoint::synchronize`].
//!
//! # Protocol
//!
//! Three shared counters drive the rendezvous:
//!
//! - `active`: registered participants
//! - `safe`: participants currently parked or blocked
//! - `requested`: a synchronizer wants the world stopped
//!
//! A synchronizer sets `requested` and waits until `safe == active`. A
//! participant leaving the safe state decrements `safe` and then re-checks
//! `requested`; if a request raced in, it counts itself safe again and waits.
//! All accesses are `SeqCst`, which makes the decrement-then-check and the
//! synchronizer's set-then-read a Dekker pair: at least one side sees the other.
//!
//! # Thread Safety
//!
//! Every wait goes through [`spin_wait`], which neither allocates nor takes a
//! lock. It is the one blocking primitive that may be used from a signal
//! handler. The mutex that serializes synchronizers is only ever taken outside
//! signal context.

use std::{
    marker::PhantomData,
    sync::{
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Instant,
};

use crossbeam_utils::Backoff;

/// Spin, then yield, until `done` returns `true`
///
/// Async-signal-safe: only atomics and `sched_yield`.
pub fn spin_wait(mut done: impl FnMut() -> bool) {
    let backoff = Backoff::new();
    while !done() {
        backoff.snooze();
    }
}

struct Shared {
    active: AtomicUsize,
    safe: AtomicUsize,
    requested: AtomicBool,
    synchronized: AtomicBool,
    epoch: AtomicU64,
    operation: Mutex<()>,
}

/// Handle to a safepoint domain; clones share state
#[derive(Clone)]
pub struct Safepoint(Arc<Shared>);

impl Default for Safepoint {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Safepoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Safepoint")
            .field("participants", &self.participants())
            .field("requested", &self.is_requested())
            .field("epoch", &self.epoch())
            .finish()
    }
}

impl Safepoint {
    pub fn new() -> Self {
        Self(Arc::new(Shared {
            active: AtomicUsize::new(0),
            safe: AtomicUsize::new(0),
            requested: AtomicBool::new(false),
            synchronized: AtomicBool::new(false),
            epoch: AtomicU64::new(0),
            operation: Mutex::new(()),
        }))
    }

    /// Register the calling thread as a participant
    ///
    /// Waits out any safepoint already in progress. The participant starts in
    /// the running (unsafe) state.
    pub fn register(&self) -> SafepointParticipant {
        let shared = &self.0;
        loop {
            spin_wait(|| !shared.requested.load(Ordering::SeqCst));
            shared.active.fetch_add(1, Ordering::SeqCst);
            if !shared.requested.load(Ordering::SeqCst) {
                break;
            }
            shared.active.fetch_sub(1, Ordering::SeqCst);
        }
        SafepointParticipant {
            shared: Arc::clone(shared),
            _not_send: PhantomData,
        }
    }

    /// Stop every participant, run `op`, then release them
    ///
    /// Must not be called by a thread holding a running participant of this
    /// safepoint; such a thread never becomes safe and the call never returns.
    /// Use [`SafepointParticipant::synchronize`] instead.
    pub fn synchronize<R>(&self, op: impl FnOnce() -> R) -> R {
        let shared = &self.0;
        let _serialized = shared
            .operation
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let started = Instant::now();
        shared.requested.store(true, Ordering::SeqCst);
        let _release = ReleaseOnDrop(shared);
        spin_wait(|| shared.safe.load(Ordering::SeqCst) == shared.active.load(Ordering::SeqCst));
        let stopped = started.elapsed();

        shared.synchronized.store(true, Ordering::SeqCst);
        let result = op();

        tracing::debug!(
            epoch = shared.epoch.load(Ordering::SeqCst) + 1,
            participants = shared.active.load(Ordering::SeqCst),
            rendezvous_us = stopped.as_micros() as u64,
            total_us = started.elapsed().as_micros() as u64,
            "safepoint operation complete"
        );
        result
    }

    /// Whether a safepoint operation is running right now
    pub fn is_synchronized(&self) -> bool {
        self.0.synchronized.load(Ordering::SeqCst)
    }

    /// Whether a synchronizer is waiting for, or holding, a safepoint
    pub fn is_requested(&self) -> bool {
        self.0.requested.load(Ordering::SeqCst)
    }

    /// Number of completed safepoint operations
    pub fn epoch(&self) -> u64 {
        self.0.epoch.load(Ordering::SeqCst)
    }

    /// Number of registered participants
    pub fn participants(&self) -> usize {
        self.0.active.load(Ordering::SeqCst)
    }
}

/// Ends a safepoint operation even if `op` panicked
struct ReleaseOnDrop<'a>(&'a Shared);

impl Drop for ReleaseOnDrop<'_> {
    fn drop(&mut self) {
        if self.0.synchronized.swap(false, Ordering::SeqCst) {
            self.0.epoch.fetch_add(1, Ordering::SeqCst);
        }
        self.0.requested.store(false, Ordering::SeqCst);
    }
}

/// A thread's membership in a [`Safepoint`]
///
/// Owned by one thread. Dropping it unregisters the thread.
pub struct SafepointParticipant {
    shared: Arc<Shared>,
    _not_send: PhantomData<*const ()>,
}

impl SafepointParticipant {
    /// Park here if a safepoint is requested
    #[inline]
    pub fn poll(&self) {
        if self.shared.requested.load(Ordering::SeqCst) {
            self.enter_safe();
            self.leave_safe();
        }
    }

    /// Run `f` while counted as safe
    ///
    /// `f` must not touch anything a safepoint operation may change.
    pub fn blocked<R>(&self, f: impl FnOnce() -> R) -> R {
        self.enter_safe();
        let _leave = LeaveOnDrop(self);
        f()
    }

    /// Run `op` at a safepoint from a participating thread
    ///
    /// The caller is counted as safe while it waits and while `op` runs.
    pub fn synchronize<R>(&self, op: impl FnOnce() -> R) -> R {
        let safepoint = Safepoint(Arc::clone(&self.shared));
        self.blocked(|| safepoint.synchronize(op))
    }

    /// The safepoint this participant belongs to
    pub fn safepoint(&self) -> Safepoint {
        Safepoint(Arc::clone(&self.shared))
    }

    fn enter_safe(&self) {
        self.shared.safe.fetch_add(1, Ordering::SeqCst);
    }

    fn leave_safe(&self) {
        let shared = &self.shared;
        loop {
            spin_wait(|| !shared.requested.load(Ordering::SeqCst));
            shared.safe.fetch_sub(1, Ordering::SeqCst);
            if !shared.requested.load(Ordering::SeqCst) {
                return;
            }
            shared.safe.fetch_add(1, Ordering::SeqCst);
        }
    }
}

impl Drop for SafepointParticipant {
    fn drop(&mut self) {
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct LeaveOnDrop<'a>(&'a SafepointParticipant);

impl Drop for LeaveOnDrop<'_> {
    fn drop(&mut self) {
        self.0.leave_safe();
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{atomic::AtomicUsize, Barrier},
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn test_synchronize_without_participants() {
        let safepoint = Safepoint::new();
        assert!(!safepoint.is_synchronized());
        let seen = safepoint.synchronize(|| safepoint.is_synchronized());
        assert!(seen);
        assert!(!safepoint.is_synchronized());
        assert!(!safepoint.is_requested());
        assert_eq!(safepoint.epoch(), 1);
    }

    #[test]
    fn test_participant_count() {
        let safepoint = Safepoint::new();
        let a = safepoint.register();
        let b = safepoint.register();
        assert_eq!(safepoint.participants(), 2);
        drop(a);
        assert_eq!(safepoint.participants(), 1);
        drop(b);
        assert_eq!(safepoint.participants(), 0);
    }

    #[test]
    fn test_participant_synchronize_counts_caller_safe() {
        let safepoint = Safepoint::new();
        let participant = safepoint.register();
        let value = participant.synchronize(|| 7);
        assert_eq!(value, 7);
        assert_eq!(safepoint.epoch(), 1);
    }

    #[test]
    fn test_operation_waits_for_polling_workers() {
        let safepoint = Safepoint::new();
        let stop = Arc::new(AtomicBool::new(false));
        // Number of workers currently outside a poll, between two polls
        let running = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(5));

        let workers: Vec<_> = (0..4)
            .map(|_| {
                let safepoint = safepoint.clone();
                let stop = Arc::clone(&stop);
                let running = Arc::clone(&running);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    let participant = safepoint.register();
                    barrier.wait();
                    while !stop.load(Ordering::SeqCst) {
                        running.fetch_add(1, Ordering::SeqCst);
                        std::hint::spin_loop();
                        running.fetch_sub(1, Ordering::SeqCst);
                        participant.poll();
                    }
                })
            })
            .collect();

        barrier.wait();
        for _ in 0..20 {
            let inside = safepoint.synchronize(|| {
                let before = running.load(Ordering::SeqCst);
                thread::sleep(Duration::from_micros(200));
                before + running.load(Ordering::SeqCst)
            });
            assert_eq!(inside, 0, "no worker may run during a safepoint operation");
        }
        stop.store(true, Ordering::SeqCst);
        for worker in workers {
            worker.join().expect("worker panicked");
        }
        assert_eq!(safepoint.epoch(), 20);
    }

    #[test]
    fn test_blocked_participant_does_not_delay_safepoint() {
        let safepoint = Safepoint::new();
        let participant = safepoint.register();
        let other = safepoint.clone();
        participant.blocked(|| {
            thread::spawn(move || other.synchronize(|| ()))
                .join()
                .expect("synchronizer panicked");
        });
        assert_eq!(safepoint.epoch(), 1);
    }

    #[test]
    fn test_spin_wait_returns_once_condition_holds() {
        let mut calls = 0;
        spin_wait(|| {
            calls += 1;
            calls == 5
        });
        assert_eq!(calls, 5);
    }
}
