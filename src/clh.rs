//! CLH queue lock and its atomic-head variant (4.C.8).
//!
//! Each thread owns a qnode with a `done` flag. Acquire marks its own node
//! not-done, swaps itself into the queue head, and spins on the
//! predecessor's `done`; release marks `done` and adopts the predecessor as
//! the thread's next qnode (the node it just released becomes its
//! successor's new predecessor). `ClhLock` keeps the head as a plain
//! `AtomicPtr`; `AtomicClhLock` keeps it as a pointer-to-pointer heap cell,
//! enqueuing via a CAS loop instead of a plain swap, matching `clh.c` vs.
//! `atomicclh.c`.
//!
//! Both variants' `try_acquire` unconditionally report [`LockError::Busy`]:
//! the original sources' `clh_trylock`/`atomicclh_trylock` always return
//! failure, a faithfully-preserved limitation rather than an oversight (see
//! `DESIGN.md`).

use crate::error::{LockError, TryAcquireOutcome};
use crate::pr;
use crate::threadctx::current_thread_id;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};
use std::sync::Mutex;

struct Qnode {
    done: AtomicBool,
}

impl Qnode {
    fn new(done: bool) -> Box<Self> {
        Box::new(Self {
            done: AtomicBool::new(done),
        })
    }
}

/// Per-thread current qnode pointer, swapped on each acquire/release so a
/// thread always owns exactly one live qnode (the one it's spinning on, or
/// the sentinel it hasn't used yet).
struct OwnedNodes {
    /// Indexed by thread ID: the qnode this thread currently holds.
    current: Mutex<Vec<Option<Box<Qnode>>>>,
}

impl OwnedNodes {
    fn new() -> Self {
        Self {
            current: Mutex::new(Vec::new()),
        }
    }

    fn take_or_init(&self, id: usize) -> Box<Qnode> {
        let mut guard = self.current.lock().unwrap();
        if guard.len() <= id {
            guard.resize_with(id + 1, || None);
        }
        guard[id].take().unwrap_or_else(|| Qnode::new(false))
    }

    fn put_back(&self, id: usize, node: Box<Qnode>) {
        let mut guard = self.current.lock().unwrap();
        guard[id] = Some(node);
    }
}

/// CLH with a plain `AtomicPtr` head, enqueued via `swap`.
pub struct ClhRaw {
    head: AtomicPtr<Qnode>,
    owned: OwnedNodes,
}

impl ClhRaw {
    /// A new, unheld instance, with a sentinel (`done = true`) node
    /// pre-installed as the head.
    pub fn new() -> Self {
        let sentinel = Box::into_raw(Qnode::new(true));
        Self {
            head: AtomicPtr::new(sentinel),
            owned: OwnedNodes::new(),
        }
    }

    /// Block until acquired.
    pub fn acquire(&self) {
        let id = current_thread_id();
        let mut my_node = self.owned.take_or_init(id);
        my_node.done.store(false, Ordering::Relaxed);
        let my_ptr = Box::into_raw(my_node);
        let pred = self.head.swap(my_ptr, Ordering::AcqRel);
        // SAFETY: `pred` is either the initial sentinel or a node a prior
        // holder released (and therefore will not free until its successor
        // has observed `done`).
        while unsafe { !(*pred).done.load(Ordering::Acquire) } {
            pr::stall();
        }
        // SAFETY: no other thread reads `pred` again; it becomes this
        // thread's adopted node on release.
        let pred_box = unsafe { Box::from_raw(pred) };
        self.owned.put_back(id, pred_box);
    }

    /// Always busy: CLH's original `trylock` has no real implementation.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        Err(LockError::Busy)
    }

    /// As [`ClhRaw::try_acquire`]: always [`TryAcquireOutcome::Busy`].
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        TryAcquireOutcome::Busy
    }

    /// Release: mark the adopted predecessor node as done, signaling any
    /// successor spinning on it.
    pub fn release(&self) {
        let id = current_thread_id();
        let mut guard = self.owned.current.lock().unwrap();
        let node = guard[id].as_mut().expect("release without acquire");
        node.done.store(true, Ordering::Release);
    }
}

impl Default for ClhRaw {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for ClhRaw {}
unsafe impl Sync for ClhRaw {}

/// Atomic-CLH: head is a pointer-to-pointer heap cell, enqueued via a CAS
/// loop rather than a plain swap (`atomicclh.c`). Same acquire/release
/// discipline otherwise.
pub struct AtomicClhRaw {
    head: AtomicPtr<AtomicPtr<Qnode>>,
    owned: OwnedNodes,
}

impl AtomicClhRaw {
    /// A new, unheld instance.
    pub fn new() -> Self {
        let sentinel = Box::into_raw(Qnode::new(true));
        let cell = Box::into_raw(Box::new(AtomicPtr::new(sentinel)));
        Self {
            head: AtomicPtr::new(cell),
            owned: OwnedNodes::new(),
        }
    }

    /// Block until acquired.
    pub fn acquire(&self) {
        let id = current_thread_id();
        let mut my_node = self.owned.take_or_init(id);
        my_node.done.store(false, Ordering::Relaxed);
        let my_ptr = Box::into_raw(my_node);
        let cell = self.head.load(Ordering::Acquire);
        let pred = loop {
            // SAFETY: `cell` is a stable heap allocation owned by this lock
            // for its entire lifetime.
            let current = unsafe { (*cell).load(Ordering::Acquire) };
            if unsafe { (*cell).compare_exchange(current, my_ptr, Ordering::AcqRel, Ordering::Relaxed) }
                .is_ok()
            {
                break current;
            }
            pr::stall();
        };
        while unsafe { !(*pred).done.load(Ordering::Acquire) } {
            pr::stall();
        }
        let pred_box = unsafe { Box::from_raw(pred) };
        self.owned.put_back(id, pred_box);
    }

    /// Always busy, matching `atomicclh_trylock`'s always-fail behavior.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        Err(LockError::Busy)
    }

    /// As [`AtomicClhRaw::try_acquire`]: always [`TryAcquireOutcome::Busy`].
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        TryAcquireOutcome::Busy
    }

    /// Release: mark the adopted predecessor node as done.
    pub fn release(&self) {
        let id = current_thread_id();
        let mut guard = self.owned.current.lock().unwrap();
        let node = guard[id].as_mut().expect("release without acquire");
        node.done.store(true, Ordering::Release);
    }
}

impl Default for AtomicClhRaw {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for AtomicClhRaw {}
unsafe impl Sync for AtomicClhRaw {}

/// A mutex protecting `T` using the CLH algorithm.
pub struct ClhLock<T> {
    raw: ClhRaw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`ClhLock::lock`].
pub struct ClhLockGuard<'a, T> {
    lock: &'a ClhLock<T>,
}

impl<T> ClhLock<T> {
    /// Wrap `data` behind a new, unheld CLH mutex.
    pub fn new(data: T) -> Self {
        Self {
            raw: ClhRaw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until acquired.
    pub fn lock(&self) -> ClhLockGuard<'_, T> {
        self.raw.acquire();
        ClhLockGuard { lock: self }
    }

    /// Always returns `None`: see [`ClhRaw::try_acquire`].
    pub fn try_lock(&self) -> Option<ClhLockGuard<'_, T>> {
        None
    }
}

impl<T> Deref for ClhLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for ClhLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for ClhLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<T: Send> Send for ClhLock<T> {}
unsafe impl<T: Send> Sync for ClhLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = ClhLock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_always_busy() {
        let lock = ClhLock::new(());
        assert!(lock.try_lock().is_none());
        let _g = lock.lock();
        assert!(lock.try_lock().is_none());
    }

    #[test]
    fn atomic_clh_lock_unlock_roundtrip() {
        let raw = AtomicClhRaw::new();
        raw.acquire();
        raw.release();
        raw.acquire();
        raw.release();
    }

    #[cfg(feature = "std")]
    #[test]
    fn two_thread_handoff() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let lock = Arc::new(ClhLock::new(0u32));
        let g = lock.lock();
        let lock2 = lock.clone();
        let handle = thread::spawn(move || {
            *lock2.lock() += 1;
        });
        thread::sleep(Duration::from_millis(20));
        drop(g);
        handle.join().unwrap();
        assert_eq!(*lock.lock(), 1);
    }
}
