//! Preemption-monitor interface (4.G): shared state a kernel observer (or,
//! absent one, nobody) writes to steer the hybrid locks between spinning
//! and parking.
//!
//! Two arrays, grown lazily like every other per-thread/per-lock table in
//! this crate: a per-lock `blocking_count` (read by the hybrids, written by
//! the external observer) and a per-thread qnode record `{running,
//! locking_lock_id, holder_preempted}` (written by the library on its own
//! thread's entry/exit, read-mostly by the observer). Lock and thread IDs
//! are dense integers from the same counters used elsewhere
//! ([`crate::threadctx::current_thread_id`], [`next_lock_id`]).
//!
//! Grounded in `hybridv2.c`'s `lock_info_t`/`preempted_count_t` and
//! `hybridv2.h`'s qnode `is_running`/`locking_id` fields — generalized here
//! into one shared facility instead of being duplicated per algorithm, per
//! `spec.md` §4.G. With no observer attached (the only mode this crate can
//! support without a BPF skeleton, out of scope per `DESIGN.md`),
//! `blocking_count` simply stays at zero and every hybrid lock degrades to
//! its pure-spin phase — "the fallback" the spec names explicitly.

use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Mutex;

static NEXT_LOCK_ID: AtomicUsize = AtomicUsize::new(0);

/// Assigns a dense, unique, never-reused ID to a newly constructed hybrid
/// lock, mirroring [`crate::threadctx::current_thread_id`] but for locks
/// rather than threads.
pub fn next_lock_id() -> usize {
    NEXT_LOCK_ID.fetch_add(1, Ordering::Relaxed)
}

/// A per-lock blocking-count record.
#[repr(C)]
struct LockRecord {
    blocking_count: AtomicU64,
}

impl LockRecord {
    fn new() -> Self {
        Self {
            blocking_count: AtomicU64::new(0),
        }
    }
}

/// A per-thread qnode record, as read by the external observer for
/// preemption classification.
#[repr(C)]
pub struct ThreadRecord {
    /// Whether this thread is currently scheduled on a CPU.
    pub running: AtomicBool,
    /// The ID of the lock this thread is currently trying to acquire, or
    /// `-1` if none.
    pub locking_lock_id: AtomicI32,
    /// Whether the thread holding the lock this thread waits on was last
    /// observed preempted.
    pub holder_preempted: AtomicBool,
}

impl ThreadRecord {
    fn new() -> Self {
        Self {
            running: AtomicBool::new(true),
            locking_lock_id: AtomicI32::new(-1),
            holder_preempted: AtomicBool::new(false),
        }
    }
}

struct Monitor {
    locks: Mutex<Vec<LockRecord>>,
    threads: Mutex<Vec<ThreadRecord>>,
}

impl Monitor {
    const fn new() -> Self {
        Self {
            locks: Mutex::new(Vec::new()),
            threads: Mutex::new(Vec::new()),
        }
    }
}

static MONITOR: Monitor = Monitor::new();

fn with_lock_record<R>(id: usize, f: impl FnOnce(&LockRecord) -> R) -> R {
    let mut guard = MONITOR.locks.lock().unwrap();
    if guard.len() <= id {
        guard.resize_with(id + 1, LockRecord::new);
    }
    f(&guard[id])
}

fn with_thread_record<R>(id: usize, f: impl FnOnce(&ThreadRecord) -> R) -> R {
    let mut guard = MONITOR.threads.lock().unwrap();
    if guard.len() <= id {
        guard.resize_with(id + 1, ThreadRecord::new);
    }
    f(&guard[id])
}

/// Read lock `id`'s blocking count. Zero (the only value this crate's
/// local-only fallback ever produces) means "no preempted holder/waiter
/// observed".
pub fn blocking_count(lock_id: usize) -> u64 {
    with_lock_record(lock_id, |r| r.blocking_count.load(Ordering::SeqCst))
}

/// Raise or lower lock `id`'s blocking count by one. Exposed so a local
/// stand-in driver (tests, or a future non-BPF heuristic) can exercise the
/// hybrids' parking path without a real kernel observer.
pub fn adjust_blocking_count(lock_id: usize, delta: i64) {
    with_lock_record(lock_id, |r| {
        if delta >= 0 {
            r.blocking_count.fetch_add(delta as u64, Ordering::SeqCst);
        } else {
            r.blocking_count.fetch_sub((-delta) as u64, Ordering::SeqCst);
        }
    });
}

/// Record that the calling thread is attempting to enter `lock_id`. Called
/// at the well-known enqueue program point (4.G's "enqueue" label).
#[inline(never)]
pub fn lock_enter(thread_id: usize, lock_id: usize) {
    with_thread_record(thread_id, |r| {
        r.locking_lock_id.store(lock_id as i32, Ordering::SeqCst);
    });
}

/// Record that the calling thread has joined the queue (the "post-enqueue"
/// label), distinct from [`lock_enter`] so an observer can tell "about to
/// enqueue" from "enqueued and now spinning" apart.
#[inline(never)]
pub fn lock_post_enqueue(_thread_id: usize, _lock_id: usize) {}

/// Record that the calling thread has finished acquiring (the "end of
/// acquire" label) and is no longer waiting on any lock.
#[inline(never)]
pub fn lock_end(thread_id: usize) {
    with_thread_record(thread_id, |r| {
        r.locking_lock_id.store(-1, Ordering::SeqCst);
    });
}

/// Mark the calling thread as running or descheduled. A local stand-in for
/// what a real scheduler-tracepoint observer would otherwise write.
pub fn set_running(thread_id: usize, running: bool) {
    with_thread_record(thread_id, |r| r.running.store(running, Ordering::SeqCst));
}

/// Whether thread `id` was last recorded as running.
pub fn is_running(thread_id: usize) -> bool {
    with_thread_record(thread_id, |r| r.running.load(Ordering::SeqCst))
}

/// A table of well-known function addresses an external observer can use to
/// classify where in a lock's acquire path a sample landed. Populated with
/// real addresses (not zero) so the table is meaningful even though nothing
/// in this crate calls through it; a kernel-side observer is expected to
/// resolve these symbols itself rather than read this table at runtime.
pub struct MarkerAddresses {
    /// Address of [`lock_enter`].
    pub lock_enter: usize,
    /// Address of [`lock_post_enqueue`].
    pub lock_post_enqueue: usize,
    /// Address of [`lock_end`].
    pub lock_end: usize,
}

/// Returns the current process's marker addresses.
pub fn marker_addresses() -> MarkerAddresses {
    MarkerAddresses {
        lock_enter: lock_enter as usize,
        lock_post_enqueue: lock_post_enqueue as usize,
        lock_end: lock_end as usize,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_lock_id_has_zero_blocking_count() {
        let id = next_lock_id();
        assert_eq!(blocking_count(id), 0);
    }

    #[test]
    fn adjust_blocking_count_round_trips() {
        let id = next_lock_id();
        adjust_blocking_count(id, 1);
        assert_eq!(blocking_count(id), 1);
        adjust_blocking_count(id, -1);
        assert_eq!(blocking_count(id), 0);
    }

    #[test]
    fn lock_ids_are_dense_and_unique() {
        let a = next_lock_id();
        let b = next_lock_id();
        assert_ne!(a, b);
    }

    #[test]
    fn thread_record_defaults_to_running_and_unlocked() {
        let id = crate::threadctx::current_thread_id();
        assert!(is_running(id));
    }

    #[test]
    fn lock_enter_then_lock_end_clears_locking_id() {
        let thread_id = crate::threadctx::current_thread_id();
        let lock_id = next_lock_id();
        lock_enter(thread_id, lock_id);
        with_thread_record(thread_id, |r| {
            assert_eq!(r.locking_lock_id.load(Ordering::SeqCst), lock_id as i32);
        });
        lock_end(thread_id);
        with_thread_record(thread_id, |r| {
            assert_eq!(r.locking_lock_id.load(Ordering::SeqCst), -1);
        });
    }

    #[test]
    fn marker_addresses_are_nonzero() {
        let addrs = marker_addresses();
        assert_ne!(addrs.lock_enter, 0);
        assert_ne!(addrs.lock_post_enqueue, 0);
        assert_ne!(addrs.lock_end, 0);
    }
}
