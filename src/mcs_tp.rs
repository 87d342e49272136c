//! MCS-TP, time-published MCS (4.C.9).
//!
//! Extends plain MCS ([`crate::mcs`]) with a patience/staleness escape: each
//! waiter publishes when it *last checked in* and the lock publishes when the
//! current holder's critical section began. A waiter that has spun past its
//! patience budget, or that sees the holder's published start-tick older
//! than `max_cs_time`, abandons its queue position and retries from scratch
//! rather than spinning indefinitely behind a possibly-stalled holder.
//!
//! `src/mcstp.c` is empty in the retrieved source (only `include/mcstp.h`'s
//! data layout survived); the acquire/abandon logic below is reconstructed
//! from `spec.md` §4.C.9's prose rather than transliterated. The abandon
//! path is deliberately conservative: a waiter only detaches itself from the
//! queue when it can prove (via a tail CAS) that no successor has queued
//! behind it yet, since detaching with a live successor would strand that
//! successor's wakeup. If a successor has already arrived, the waiter just
//! resets its patience counter and keeps waiting — documented as a known
//! divergence from a hypothetical "true" mid-queue unlink, which the
//! original source never shipped a body for either.

use crate::config::Limits;
use crate::error::{LockError, TryAcquireOutcome};
use crate::pr;
use crate::threadctx::current_thread_id;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU64, Ordering};
use std::sync::Mutex;

struct Qnode {
    waiting: AtomicBool,
    next: AtomicPtr<Qnode>,
}

impl Qnode {
    const fn new() -> Self {
        Self {
            waiting: AtomicBool::new(false),
            next: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

struct Arena {
    nodes: Mutex<Vec<Box<Qnode>>>,
}

impl Arena {
    fn new() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
        }
    }

    fn node_for(&self, id: usize) -> *mut Qnode {
        let mut guard = self.nodes.lock().unwrap();
        if guard.len() <= id {
            guard.resize_with(id + 1, || Box::new(Qnode::new()));
        }
        &mut *guard[id] as *mut Qnode
    }
}

/// Algorithm bookkeeping state; see [`crate::tas::TasRaw`] for the
/// raw/typed split rationale.
pub struct McsTpRaw {
    tail: AtomicPtr<Qnode>,
    arena: Arena,
    /// Tick at which the current holder entered its critical section.
    cs_start_time: AtomicU64,
    /// Abandon-check retries before a waiter gives up its queue slot (design
    /// note 3: promoted from a global constant to an instance field).
    patience: u32,
    /// "Holder looks stalled" threshold, in `pr::rdtsc` ticks.
    max_cs_time: u64,
}

impl McsTpRaw {
    /// A new, unheld instance using the default patience/staleness bounds.
    pub fn new() -> Self {
        Self::with_limits(&Limits::default_const())
    }

    /// A new, unheld instance with explicit patience/staleness bounds.
    pub fn with_limits(limits: &Limits) -> Self {
        Self {
            tail: AtomicPtr::new(core::ptr::null_mut()),
            arena: Arena::new(),
            cs_start_time: AtomicU64::new(0),
            patience: limits.mcs_tp_patience,
            max_cs_time: limits.mcs_tp_max_cs_time,
        }
    }

    fn my_node(&self) -> *mut Qnode {
        self.arena.node_for(current_thread_id())
    }

    fn enqueue(&self, me: *mut Qnode) -> *mut Qnode {
        unsafe {
            (*me).next.store(core::ptr::null_mut(), Ordering::Relaxed);
            (*me).waiting.store(true, Ordering::Relaxed);
        }
        self.tail.swap(me, Ordering::AcqRel)
    }

    /// Block until acquired, abandoning and retrying the queue slot if the
    /// holder appears stalled past the configured patience/staleness bounds.
    pub fn acquire(&self) {
        let me = self.my_node();
        let mut pred = self.enqueue(me);
        if pred.is_null() {
            self.cs_start_time.store(pr::rdtsc(), Ordering::SeqCst);
            return;
        }
        unsafe { (*pred).next.store(me, Ordering::Release) };

        let mut retries: u32 = 0;
        loop {
            if !unsafe { (*me).waiting.load(Ordering::Acquire) } {
                self.cs_start_time.store(pr::rdtsc(), Ordering::SeqCst);
                return;
            }
            retries += 1;
            let stalled = pr::rdtsc().saturating_sub(self.cs_start_time.load(Ordering::SeqCst))
                > self.max_cs_time;
            if retries >= self.patience || stalled {
                if self
                    .tail
                    .compare_exchange(me, core::ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    // No successor queued behind us yet: safe to abandon and
                    // re-enter as a fresh contender (the "one-shot
                    // try-acquire" of spec.md §4.C.9).
                    retries = 0;
                    pred = self.enqueue(me);
                    if pred.is_null() {
                        self.cs_start_time.store(pr::rdtsc(), Ordering::SeqCst);
                        return;
                    }
                    unsafe { (*pred).next.store(me, Ordering::Release) };
                    continue;
                }
                // A successor is already enqueued behind us; abandoning now
                // would strand its wakeup, so just renew our patience.
                retries = 0;
            }
            pr::stall();
        }
    }

    /// Attempt to acquire without blocking: succeeds only if the queue is
    /// currently empty.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        let me = self.my_node();
        unsafe {
            (*me).next.store(core::ptr::null_mut(), Ordering::Relaxed);
            (*me).waiting.store(true, Ordering::Relaxed);
        }
        match self.tail.compare_exchange(
            core::ptr::null_mut(),
            me,
            Ordering::AcqRel,
            Ordering::Relaxed,
        ) {
            Ok(_) => {
                self.cs_start_time.store(pr::rdtsc(), Ordering::SeqCst);
                Ok(())
            }
            Err(_) => Err(LockError::Busy),
        }
    }

    /// As [`McsTpRaw::try_acquire`], in the plain outcome enum.
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        match self.try_acquire() {
            Ok(()) => TryAcquireOutcome::Acquired,
            Err(_) => TryAcquireOutcome::Busy,
        }
    }

    /// Release: hand off to the successor, if any arrived, else clear the
    /// queue tail.
    pub fn release(&self) {
        let me = self.my_node();
        let next = unsafe { (*me).next.load(Ordering::Acquire) };
        if next.is_null() {
            if self
                .tail
                .compare_exchange(me, core::ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
            {
                return;
            }
            loop {
                let n = unsafe { (*me).next.load(Ordering::Acquire) };
                if !n.is_null() {
                    unsafe { (*n).waiting.store(false, Ordering::Release) };
                    return;
                }
                pr::stall();
            }
        }
        unsafe { (*next).waiting.store(false, Ordering::Release) };
    }
}

impl Default for McsTpRaw {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for McsTpRaw {}
unsafe impl Sync for McsTpRaw {}

/// A mutex protecting `T` using the MCS-TP algorithm.
pub struct McsTpLock<T> {
    raw: McsTpRaw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`McsTpLock::lock`].
pub struct McsTpLockGuard<'a, T> {
    lock: &'a McsTpLock<T>,
}

impl<T> McsTpLock<T> {
    /// Wrap `data` behind a new, unheld MCS-TP mutex.
    pub fn new(data: T) -> Self {
        Self {
            raw: McsTpRaw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until acquired.
    pub fn lock(&self) -> McsTpLockGuard<'_, T> {
        self.raw.acquire();
        McsTpLockGuard { lock: self }
    }

    /// Attempt to acquire only if the queue is currently empty.
    pub fn try_lock(&self) -> Option<McsTpLockGuard<'_, T>> {
        self.raw
            .try_acquire()
            .ok()
            .map(|()| McsTpLockGuard { lock: self })
    }
}

impl<T> Deref for McsTpLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for McsTpLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for McsTpLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<T: Send> Send for McsTpLock<T> {}
unsafe impl<T: Send> Sync for McsTpLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = McsTpLock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_succeeds_on_empty_queue() {
        let lock = McsTpLock::new(());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn with_limits_honors_custom_patience() {
        let limits = Limits {
            mcs_tp_patience: 3,
            ..Limits::default()
        };
        let raw = McsTpRaw::with_limits(&limits);
        assert_eq!(raw.patience, 3);
    }

    #[test]
    fn two_thread_handoff_preserves_order() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let lock = Arc::new(McsTpLock::new(Vec::<&'static str>::new()));
        let g = lock.lock();
        let lock2 = lock.clone();
        let handle = thread::spawn(move || {
            lock2.lock().push("t2-acquired");
        });
        thread::sleep(Duration::from_millis(20));
        drop(g);
        handle.join().unwrap();
        assert_eq!(*lock.lock(), vec!["t2-acquired"]);
    }

    #[test]
    fn many_threads_increment_exact_count() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(McsTpLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..500 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 4000);
    }
}
