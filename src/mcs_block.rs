//! Blocking MCS (4.C.7): identical queue discipline to plain MCS, but a
//! waiter parks on its own `waiting` word via the wait-address primitives
//! instead of spinning, and the releaser wakes it explicitly. Grounded in
//! `mcsblock.c` / `include/mcsblock.h`.

use crate::error::{LockError, TryAcquireOutcome};
use crate::threadctx::current_thread_id;
use crate::wait;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicPtr, AtomicU32, Ordering};
use std::sync::Mutex;

const WAITING: u32 = 1;
const NOT_WAITING: u32 = 0;

struct Qnode {
    waiting: AtomicU32,
    next: AtomicPtr<Qnode>,
}

impl Qnode {
    const fn new() -> Self {
        Self {
            waiting: AtomicU32::new(NOT_WAITING),
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
pub struct McsBlockRaw {
    tail: AtomicPtr<Qnode>,
    arena: Arena,
}

impl McsBlockRaw {
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

    /// Block until acquired, parking via the wait-address primitives
    /// instead of spinning while enqueued.
    pub fn acquire(&self) {
        let me = self.my_node();
        unsafe {
            (*me).next.store(core::ptr::null_mut(), Ordering::Relaxed);
            (*me).waiting.store(WAITING, Ordering::Relaxed);
        }
        let pred = self.tail.swap(me, Ordering::AcqRel);
        if pred.is_null() {
            return;
        }
        unsafe {
            (*pred).next.store(me, Ordering::Release);
        }
        loop {
            let w = unsafe { (*me).waiting.load(Ordering::Acquire) };
            if w == NOT_WAITING {
                return;
            }
            wait::wait(unsafe { &(*me).waiting }, WAITING);
        }
    }

    /// Attempt to acquire without blocking: succeeds only on an empty queue.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        let me = self.my_node();
        unsafe {
            (*me).next.store(core::ptr::null_mut(), Ordering::Relaxed);
            (*me).waiting.store(WAITING, Ordering::Relaxed);
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

    /// As [`McsBlockRaw::try_acquire`], in the plain outcome enum.
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        match self.try_acquire() {
            Ok(()) => TryAcquireOutcome::Acquired,
            Err(_) => TryAcquireOutcome::Busy,
        }
    }

    /// Release: wake the successor if one has arrived, else clear `tail`.
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
                    unsafe {
                        (*n).waiting.store(NOT_WAITING, Ordering::Release);
                        wait::wake(&(*n).waiting, 1);
                    }
                    return;
                }
                core::hint::spin_loop();
            }
        }
        unsafe {
            (*next).waiting.store(NOT_WAITING, Ordering::Release);
            wait::wake(&(*next).waiting, 1);
        }
    }
}

impl Default for McsBlockRaw {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for McsBlockRaw {}
unsafe impl Sync for McsBlockRaw {}

/// A mutex protecting `T` using the blocking MCS algorithm.
pub struct McsBlockLock<T> {
    raw: McsBlockRaw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`McsBlockLock::lock`] / [`McsBlockLock::try_lock`].
pub struct McsBlockLockGuard<'a, T> {
    lock: &'a McsBlockLock<T>,
}

impl<T> McsBlockLock<T> {
    /// Wrap `data` behind a new, unheld blocking-MCS mutex.
    pub fn new(data: T) -> Self {
        Self {
            raw: McsBlockRaw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until acquired.
    pub fn lock(&self) -> McsBlockLockGuard<'_, T> {
        self.raw.acquire();
        McsBlockLockGuard { lock: self }
    }

    /// Attempt to acquire only if the queue is currently empty.
    pub fn try_lock(&self) -> Option<McsBlockLockGuard<'_, T>> {
        self.raw
            .try_acquire()
            .ok()
            .map(|()| McsBlockLockGuard { lock: self })
    }
}

impl<T> Deref for McsBlockLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for McsBlockLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for McsBlockLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<T: Send> Send for McsBlockLock<T> {}
unsafe impl<T: Send> Sync for McsBlockLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = McsBlockLock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[cfg(feature = "std")]
    #[test]
    fn two_thread_handoff() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let lock = Arc::new(McsBlockLock::new(0u32));
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
