//! MCS+TAS (4.C.10): an MCS queue admits one contender at a time to a
//! following test-and-set acquisition of a byte flag.
//!
//! Grounded in `mcstas.c`/`include/mcstas.h`, which diverges from
//! `mcs.c`/`mcsblock.c` in one notable way: each thread keeps a single
//! `static __thread volatile mcstas_qnode local`, not an entry in a
//! thread-ID-indexed arena. `mcs_tas.rs` mirrors that with a `thread_local!`
//! qnode instead of reusing [`crate::threadctx::ThreadSlots`].
//!
//! The MCS queue here only serializes *who gets to attempt the TAS byte
//! next* — it does not stay held for the duration of the critical section.
//! `acquire` spins for the byte first, then immediately hands the MCS token
//! to the next queued thread (so the next thread starts spinning on the
//! byte too, in FIFO order relative to MCS admission); `release` only
//! clears the byte.

use crate::error::{LockError, TryAcquireOutcome};
use crate::pr;
use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, Ordering};

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

thread_local! {
    static LOCAL_NODE: Box<Qnode> = Box::new(Qnode::new());
}

fn local_node_ptr() -> *mut Qnode {
    thread_local! {
        static CACHED: Cell<*mut Qnode> = const { Cell::new(core::ptr::null_mut()) };
    }
    CACHED.with(|cached| {
        let p = cached.get();
        if !p.is_null() {
            return p;
        }
        let p = LOCAL_NODE.with(|node| &**node as *const Qnode as *mut Qnode);
        cached.set(p);
        p
    })
}

/// Algorithm bookkeeping state; see [`crate::tas::TasRaw`] for the
/// raw/typed split rationale.
pub struct McsTasRaw {
    tail: AtomicPtr<Qnode>,
    tas: AtomicBool,
}

impl McsTasRaw {
    /// A new, unheld instance.
    pub const fn new() -> Self {
        Self {
            tail: AtomicPtr::new(core::ptr::null_mut()),
            tas: AtomicBool::new(false),
        }
    }

    /// Block until the TAS byte is held. Admission to attempt the byte is
    /// strictly FIFO (via the MCS queue); holding the byte is not.
    pub fn acquire(&self) {
        let me = local_node_ptr();
        unsafe {
            (*me).next.store(core::ptr::null_mut(), Ordering::Relaxed);
            (*me).waiting.store(true, Ordering::Relaxed);
        }
        let pred = self.tail.swap(me, Ordering::AcqRel);
        if !pred.is_null() {
            unsafe { (*pred).next.store(me, Ordering::Release) };
            while unsafe { (*me).waiting.load(Ordering::Acquire) } {
                pr::stall();
            }
        }

        while self.tas.swap(true, Ordering::Acquire) {
            pr::stall();
        }

        self.unlock_mcs(me);
    }

    /// Attempt to acquire without blocking: admitted only on an empty MCS
    /// queue and only if the byte is currently clear.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        let me = local_node_ptr();
        unsafe {
            (*me).next.store(core::ptr::null_mut(), Ordering::Relaxed);
            (*me).waiting.store(true, Ordering::Relaxed);
        }
        if self
            .tail
            .compare_exchange(core::ptr::null_mut(), me, Ordering::AcqRel, Ordering::Relaxed)
            .is_err()
        {
            return Err(LockError::Busy);
        }
        if self.tas.swap(true, Ordering::Acquire) {
            self.unlock_mcs(me);
            return Err(LockError::Busy);
        }
        self.unlock_mcs(me);
        Ok(())
    }

    /// As [`McsTasRaw::try_acquire`], in the plain outcome enum.
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        match self.try_acquire() {
            Ok(()) => TryAcquireOutcome::Acquired,
            Err(_) => TryAcquireOutcome::Busy,
        }
    }

    /// Release: clear the TAS byte. The MCS token was already handed off
    /// inside `acquire`.
    pub fn release(&self) {
        self.tas.store(false, Ordering::Release);
    }

    fn unlock_mcs(&self, me: *mut Qnode) {
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

impl Default for McsTasRaw {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for McsTasRaw {}
unsafe impl Sync for McsTasRaw {}

/// A mutex protecting `T` using the MCS+TAS algorithm.
pub struct McsTasLock<T> {
    raw: McsTasRaw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`McsTasLock::lock`].
pub struct McsTasLockGuard<'a, T> {
    lock: &'a McsTasLock<T>,
}

impl<T> McsTasLock<T> {
    /// Wrap `data` behind a new, unheld MCS+TAS mutex.
    pub const fn new(data: T) -> Self {
        Self {
            raw: McsTasRaw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until acquired.
    pub fn lock(&self) -> McsTasLockGuard<'_, T> {
        self.raw.acquire();
        McsTasLockGuard { lock: self }
    }

    /// Attempt to acquire without blocking.
    pub fn try_lock(&self) -> Option<McsTasLockGuard<'_, T>> {
        self.raw
            .try_acquire()
            .ok()
            .map(|()| McsTasLockGuard { lock: self })
    }
}

impl<T> Deref for McsTasLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for McsTasLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for McsTasLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<T: Send> Send for McsTasLock<T> {}
unsafe impl<T: Send> Sync for McsTasLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = McsTasLock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_succeeds_on_free_lock() {
        let lock = McsTasLock::new(());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = McsTasLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn two_thread_handoff() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let lock = Arc::new(McsTasLock::new(0u32));
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

    #[test]
    fn many_threads_increment_exact_count() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(McsTasLock::new(0u64));
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
