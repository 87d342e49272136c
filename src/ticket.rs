//! Ticket lock (4.C.3): strict FIFO via two monotone counters.
//!
//! Acquire atomically takes the next ticket and spins on `head` with
//! proportional backoff (`distance <= 1` uses a short pause, otherwise
//! `distance * base` cycles) until it is served. Adapted from the teacher
//! crate's `TicketLock`, with the distance-proportional backoff from
//! `ticket.c` added (the teacher's version backs off uniformly, not
//! proportionally to queue depth).

use crate::backoff;
use crate::error::{LockError, TryAcquireOutcome};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicU32, Ordering};

/// Cycles of backoff per unit of queue distance.
const BACKOFF_BASE: u32 = 16;

/// Algorithm bookkeeping state, no associated data (see [`crate::tas::TasRaw`]
/// for why the raw/typed split exists).
#[repr(C)]
pub struct TicketRaw {
    head: AtomicU32,
    tail: AtomicU32,
}

impl TicketRaw {
    /// A new, unheld instance.
    pub const fn new() -> Self {
        Self {
            head: AtomicU32::new(0),
            tail: AtomicU32::new(0),
        }
    }

    /// Block until served. Strictly FIFO: threads are served in the order
    /// they called `acquire`.
    pub fn acquire(&self) {
        let ticket = self.tail.fetch_add(1, Ordering::Relaxed);
        loop {
            let head = self.head.load(Ordering::Acquire);
            if head == ticket {
                return;
            }
            let distance = ticket.wrapping_sub(head);
            backoff::spin_proportional(distance, BACKOFF_BASE);
        }
    }

    /// Attempt to acquire only if this call would be served immediately,
    /// i.e. the lock is currently free.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        let head = self.head.load(Ordering::Acquire);
        let tail = self.tail.load(Ordering::Acquire);
        if head != tail {
            return Err(LockError::Busy);
        }
        self.tail
            .compare_exchange(tail, tail + 1, Ordering::AcqRel, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| LockError::Busy)
    }

    /// As [`TicketRaw::try_acquire`], wrapped in the plain outcome enum.
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        match self.try_acquire() {
            Ok(()) => TryAcquireOutcome::Acquired,
            Err(_) => TryAcquireOutcome::Busy,
        }
    }

    /// Release: admit the next ticket in line.
    pub fn release(&self) {
        self.head.fetch_add(1, Ordering::Release);
    }
}

impl Default for TicketRaw {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for TicketRaw {}
unsafe impl Sync for TicketRaw {}

/// A mutex protecting `T` using the ticket algorithm.
pub struct TicketLock<T> {
    raw: TicketRaw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`TicketLock::lock`] / [`TicketLock::try_lock`].
pub struct TicketLockGuard<'a, T> {
    lock: &'a TicketLock<T>,
}

impl<T> TicketLock<T> {
    /// Wrap `data` behind a new, unheld ticket lock.
    pub const fn new(data: T) -> Self {
        Self {
            raw: TicketRaw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until served.
    pub fn lock(&self) -> TicketLockGuard<'_, T> {
        self.raw.acquire();
        TicketLockGuard { lock: self }
    }

    /// Acquire only if immediately free.
    pub fn try_lock(&self) -> Option<TicketLockGuard<'_, T>> {
        self.raw
            .try_acquire()
            .ok()
            .map(|()| TicketLockGuard { lock: self })
    }
}

impl<T> Deref for TicketLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for TicketLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for TicketLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<T: Send> Send for TicketLock<T> {}
unsafe impl<T: Send> Sync for TicketLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_is_free() {
        let raw = TicketRaw::new();
        assert_eq!(raw.head.load(Ordering::Relaxed), raw.tail.load(Ordering::Relaxed));
    }

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = TicketLock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_fails_when_held() {
        let lock = TicketLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[cfg(feature = "std")]
    #[test]
    fn eight_threads_fifo_enqueue_order_preserved_per_thread() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(TicketLock::new(Vec::<(usize, u32)>::new()));
        let mut handles = Vec::new();
        for t in 0..8usize {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for i in 0..200u32 {
                    let mut g = lock.lock();
                    g.push((t, i));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        let log = lock.lock();
        // Each thread's own subsequence must appear in submission order.
        let mut last_seen = [None; 8];
        for &(t, i) in log.iter() {
            if let Some(prev) = last_seen[t] {
                assert!(i > prev, "thread {t} out of order: {prev} then {i}");
            }
            last_seen[t] = Some(i);
        }
    }
}
