//! MCS queue lock (4.C.6): strictly FIFO via a linked list of per-thread
//! queue nodes.
//!
//! Each thread uses a qnode indexed by its dense thread ID (see
//! [`crate::threadctx`]), owned by the lock's own arena rather than by
//! thread-local storage (per the "per-thread context without
//! thread-locals" design note). Acquire swaps into `tail`; if there was a
//! predecessor, the waiter publishes itself into the predecessor's `next`
//! and spins on its own `waiting` flag. Release hands off to the recorded
//! successor, or clears `tail` if there was none. Grounded in `mcs.c` /
//! `include/mcs.h`.

use crate::error::{LockError, TryAcquireOutcome};
use crate::pr;
use crate::threadctx::current_thread_id;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Mutex;

/// One thread's position in the queue.
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

/// Per-lock arena of qnodes, one per thread that has ever contended on this
/// specific lock. Growing it is a cold path (only happens once per thread
/// per lock), so a plain mutex-guarded `Vec` is sufficient.
struct Arena {
    nodes: Mutex<Vec<Box<Qnode>>>,
}

impl Arena {
    fn new() -> Self {
        Self {
            nodes: Mutex::new(Vec::new()),
        }
    }

    /// Returns a stable raw pointer to this thread's qnode, allocating it
    /// on first use. The pointer remains valid for the arena's lifetime.
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
pub struct McsRaw {
    tail: AtomicPtr<Qnode>,
    arena: Arena,
}

impl McsRaw {
    /// A new, unheld instance.
    pub fn new() -> Self {
        Self {
            tail: AtomicPtr::new(core::ptr::null_mut()),
            arena: Arena::new(),
        }
    }

    fn my_node(&self) -> *mut Qnode {
        self.arena.node_for(current_thread_id())
    }

    /// Block until acquired.
    pub fn acquire(&self) {
        let me = self.my_node();
        // SAFETY: `me` is a stable pointer into this lock's own arena.
        unsafe {
            (*me).next.store(core::ptr::null_mut(), Ordering::Relaxed);
            (*me).waiting.store(true, Ordering::Relaxed);
        }
        let pred = self.tail.swap(me, Ordering::AcqRel);
        if pred.is_null() {
            return;
        }
        // SAFETY: `pred` was a live qnode swapped out of `tail`; it remains
        // valid because the arena never frees nodes.
        unsafe {
            (*pred).next.store(me, Ordering::Release);
        }
        while unsafe { (*me).waiting.load(Ordering::Acquire) } {
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
        self.tail
            .compare_exchange(
                core::ptr::null_mut(),
                me,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .map(|_| ())
            .map_err(|_| LockError::Busy)
    }

    /// As [`McsRaw::try_acquire`], in the plain outcome enum.
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
            // A successor is mid-enqueue: it has swapped into `tail` but
            // hasn't published itself into our `next` yet. Wait for it.
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

impl Default for McsRaw {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for McsRaw {}
unsafe impl Sync for McsRaw {}

/// A mutex protecting `T` using the MCS algorithm.
pub struct McsLock<T> {
    raw: McsRaw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`McsLock::lock`] / [`McsLock::try_lock`].
pub struct McsLockGuard<'a, T> {
    lock: &'a McsLock<T>,
}

impl<T> McsLock<T> {
    /// Wrap `data` behind a new, unheld MCS mutex.
    pub fn new(data: T) -> Self {
        Self {
            raw: McsRaw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until acquired.
    pub fn lock(&self) -> McsLockGuard<'_, T> {
        self.raw.acquire();
        McsLockGuard { lock: self }
    }

    /// Attempt to acquire only if the queue is currently empty.
    pub fn try_lock(&self) -> Option<McsLockGuard<'_, T>> {
        self.raw
            .try_acquire()
            .ok()
            .map(|()| McsLockGuard { lock: self })
    }
}

impl<T> Deref for McsLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for McsLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for McsLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<T: Send> Send for McsLock<T> {}
unsafe impl<T: Send> Sync for McsLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = McsLock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_succeeds_on_empty_queue() {
        let lock = McsLock::new(());
        assert!(lock.try_lock().is_some());
    }

    #[cfg(feature = "std")]
    #[test]
    fn two_thread_handoff_preserves_order() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let lock = Arc::new(McsLock::new(Vec::<&'static str>::new()));
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

    #[cfg(feature = "std")]
    #[test]
    fn many_threads_increment_exact_count() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(McsLock::new(0u64));
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
