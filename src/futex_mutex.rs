//! Wait-address ("futex") mutex (4.C.4).
//!
//! A single 32-bit word with three states: 0 free, 1 held with no known
//! waiters, 2 held with at least one waiter. Acquire CASes 0→1; on failure
//! it swaps in 2 (if not already 2) and parks on the word until a swap
//! finally observes 0. State 2 is sticky while any waiter may still remain,
//! which is conservative (it can cause an extra wake) but never loses one.
//! Grounded in `futex.c`.

use crate::error::{LockError, TryAcquireOutcome};
use crate::wait;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

const FREE: u32 = 0;
const HELD_NO_WAITERS: u32 = 1;
const HELD_WITH_WAITERS: u32 = 2;

/// Algorithm bookkeeping state; see [`crate::tas::TasRaw`] for the
/// raw/typed split rationale.
#[repr(C)]
pub struct FutexRaw {
    state: AtomicU32,
}

impl FutexRaw {
    /// A new, free instance.
    pub const fn new() -> Self {
        Self {
            state: AtomicU32::new(FREE),
        }
    }

    /// Block until acquired.
    pub fn acquire(&self) {
        if self
            .state
            .compare_exchange(FREE, HELD_NO_WAITERS, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            return;
        }
        loop {
            let mut c = self.state.load(Ordering::Relaxed);
            if c != HELD_WITH_WAITERS {
                c = self.state.swap(HELD_WITH_WAITERS, Ordering::Acquire);
                if c == FREE {
                    return;
                }
            }
            wait::wait(&self.state, HELD_WITH_WAITERS);
        }
    }

    /// Attempt to acquire without blocking.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        self.state
            .compare_exchange(FREE, HELD_NO_WAITERS, Ordering::Acquire, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| LockError::Busy)
    }

    /// As [`FutexRaw::try_acquire`], in the plain outcome enum.
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        match self.try_acquire() {
            Ok(()) => TryAcquireOutcome::Acquired,
            Err(_) => TryAcquireOutcome::Busy,
        }
    }

    /// Release. If a waiter might remain (state wasn't plain
    /// held-no-waiters), store free and wake one.
    pub fn release(&self) {
        if self.state.fetch_sub(1, Ordering::Release) != HELD_NO_WAITERS {
            self.state.store(FREE, Ordering::Release);
            wait::wake(&self.state, 1);
        }
    }
}

impl Default for FutexRaw {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for FutexRaw {}
unsafe impl Sync for FutexRaw {}

/// A mutex protecting `T` using the wait-address algorithm.
pub struct FutexLock<T> {
    raw: FutexRaw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`FutexLock::lock`] / [`FutexLock::try_lock`].
pub struct FutexLockGuard<'a, T> {
    lock: &'a FutexLock<T>,
}

impl<T> FutexLock<T> {
    /// Wrap `data` behind a new, free futex mutex.
    pub const fn new(data: T) -> Self {
        Self {
            raw: FutexRaw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until acquired.
    pub fn lock(&self) -> FutexLockGuard<'_, T> {
        self.raw.acquire();
        FutexLockGuard { lock: self }
    }

    /// Attempt to acquire without blocking.
    pub fn try_lock(&self) -> Option<FutexLockGuard<'_, T>> {
        self.raw
            .try_acquire()
            .ok()
            .map(|()| FutexLockGuard { lock: self })
    }
}

impl<T> Deref for FutexLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for FutexLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for FutexLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<T: Send> Send for FutexLock<T> {}
unsafe impl<T: Send> Sync for FutexLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_free() {
        assert_eq!(FutexRaw::new().state.load(Ordering::Relaxed), FREE);
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = FutexLock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = FutexLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[cfg(feature = "std")]
    #[test]
    fn two_threads_handoff() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let lock = Arc::new(FutexLock::new(0u32));
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
