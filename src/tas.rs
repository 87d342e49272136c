//! Test-and-set spinlock (4.C.2).
//!
//! The simplest algorithm in this crate: one byte, no fairness, release
//! just clears it. Adapted from the teacher crate's `FasLock`, generalized
//! behind the shared [`RawLock`](crate::facade::RawLock) trait so the
//! facade can select it at build time like every other algorithm.

use crate::error::{LockError, TryAcquireOutcome};
use crate::pr;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, Ordering};

/// The algorithm's bookkeeping state, with no associated user data. Used by
/// the facade and interposition layer, which overlay an opaque platform
/// object and have no typed payload to wrap.
#[repr(C)]
pub struct TasRaw {
    locked: AtomicBool,
}

impl TasRaw {
    /// A new, unlocked instance.
    pub const fn new() -> Self {
        Self {
            locked: AtomicBool::new(false),
        }
    }

    /// Block until the lock is acquired. No ordering guarantee among
    /// contending threads.
    pub fn acquire(&self) {
        loop {
            if !self.locked.swap(true, Ordering::Acquire) {
                return;
            }
            while self.locked.load(Ordering::Relaxed) {
                pr::stall();
            }
        }
    }

    /// Attempt to acquire without blocking.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        if self.locked.swap(true, Ordering::Acquire) {
            Err(LockError::Busy)
        } else {
            Ok(())
        }
    }

    /// Attempt to acquire without blocking, returning a plain outcome enum
    /// for callers that don't need the full error type.
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        match self.try_acquire() {
            Ok(()) => TryAcquireOutcome::Acquired,
            Err(_) => TryAcquireOutcome::Busy,
        }
    }

    /// Release. Caller must currently hold the lock.
    pub fn release(&self) {
        self.locked.store(false, Ordering::Release);
    }

    /// True if currently held by some thread.
    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::Relaxed)
    }
}

impl Default for TasRaw {
    fn default() -> Self {
        Self::new()
    }
}

// SAFETY: TasRaw has no interior data beyond the atomic flag; sharing it
// across threads is exactly what it's for.
unsafe impl Send for TasRaw {}
unsafe impl Sync for TasRaw {}

/// A mutex protecting `T` using the test-and-set algorithm.
pub struct TasLock<T> {
    raw: TasRaw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`TasLock::lock`] / [`TasLock::try_lock`].
pub struct TasLockGuard<'a, T> {
    lock: &'a TasLock<T>,
}

impl<T> TasLock<T> {
    /// Wrap `data` behind a new, unlocked test-and-set mutex.
    pub const fn new(data: T) -> Self {
        Self {
            raw: TasRaw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until acquired, returning a guard that releases on drop.
    pub fn lock(&self) -> TasLockGuard<'_, T> {
        self.raw.acquire();
        TasLockGuard { lock: self }
    }

    /// Attempt to acquire without blocking.
    pub fn try_lock(&self) -> Option<TasLockGuard<'_, T>> {
        self.raw.try_acquire().ok().map(|()| TasLockGuard { lock: self })
    }
}

impl<T> Deref for TasLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        // SAFETY: holding the guard implies holding `raw`.
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for TasLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        // SAFETY: holding the guard implies holding `raw`.
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for TasLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

// SAFETY: access to `data` is always mediated by `raw`, which enforces
// exclusion; `T: Send` is enough for the lock to be `Sync`.
unsafe impl<T: Send> Send for TasLock<T> {}
unsafe impl<T: Send> Sync for TasLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_unlocked() {
        let raw = TasRaw::new();
        assert!(!raw.is_locked());
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = TasLock::new(0u32);
        {
            let mut g = lock.lock();
            *g += 1;
        }
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = TasLock::new(());
        let g1 = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g1);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn modify_through_guard() {
        let lock = TasLock::new(vec![1, 2, 3]);
        lock.lock().push(4);
        assert_eq!(*lock.lock(), vec![1, 2, 3, 4]);
    }
}
