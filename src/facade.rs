//! Uniform lock façade (4.D): a single `Lock`/`Cond` pair whose concrete
//! representation is chosen at build time by exactly one `algo-*` Cargo
//! feature, mirroring the original's build-time `-D` preprocessor selection.
//!
//! Each algorithm's `XxxRaw` type already carries whatever per-thread state
//! it needs (a qnode arena indexed by [`crate::threadctx::current_thread_id`],
//! or nothing at all for the non-queueing algorithms); the façade does not
//! duplicate a second per-thread array as the original's single C
//! translation unit effectively did; it generalizes that translation unit's
//! dispatch-by-`#ifdef` into one [`RawLock`] trait object-free generic
//! parameter instead, resolved entirely at compile time.
//!
//! Condvar support defaults to the common "always park, unconditionally"
//! behavior shared by `mcs.c`'s pattern and nearly every other original's
//! condvar functions. Algorithms with a different park predicate
//! ([`crate::flex::FlexguardRaw`], [`crate::flex::HybridV2Raw`]) override it;
//! `hybridlock`, whose original source exposes no condvar entry points at
//! all, overrides it to report [`LockError::Unsupported`] deterministically,
//! per §4.D's closing sentence.

use crate::condvar::CondVar;
use crate::error::{LockError, TimedWaitOutcome, TryAcquireOutcome};
use crate::wait::AbsDeadline;
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};

/// The operations every algorithm exposes uniformly (4.C.1), plus condvar
/// support with a default park-unconditionally behavior overridable by
/// algorithms that need a different predicate or that support none.
pub trait RawLock: Default + Send + Sync {
    /// Block until the caller holds the lock.
    fn acquire(&self);
    /// Attempt to acquire without blocking.
    fn try_acquire_outcome(&self) -> TryAcquireOutcome;
    /// Release; caller must hold the lock.
    fn release(&self);

    /// Park on `cond` until signaled, releasing and reacquiring the lock
    /// around the wait.
    fn cond_wait(&self, cond: &CondVar) -> Result<(), LockError> {
        cond.wait(|| self.release(), || self.acquire(), || true);
        Ok(())
    }

    /// As [`RawLock::cond_wait`], with an absolute deadline.
    fn cond_timedwait(
        &self,
        cond: &CondVar,
        deadline: AbsDeadline,
    ) -> Result<TimedWaitOutcome, LockError> {
        Ok(cond.timedwait(|| self.release(), || self.acquire(), || true, deadline))
    }
}

macro_rules! impl_raw_lock_default_cond {
    ($ty:ty) => {
        impl RawLock for $ty {
            fn acquire(&self) {
                self.acquire()
            }
            fn try_acquire_outcome(&self) -> TryAcquireOutcome {
                self.try_acquire_outcome()
            }
            fn release(&self) {
                self.release()
            }
        }
    };
}

impl_raw_lock_default_cond!(crate::tas::TasRaw);
impl_raw_lock_default_cond!(crate::ticket::TicketRaw);
impl_raw_lock_default_cond!(crate::futex_mutex::FutexRaw);
impl_raw_lock_default_cond!(crate::spin_park::SpinParkRaw);
#[cfg(feature = "std")]
impl_raw_lock_default_cond!(crate::mcs::McsRaw);
#[cfg(feature = "std")]
impl_raw_lock_default_cond!(crate::mcs_block::McsBlockRaw);
#[cfg(feature = "std")]
impl_raw_lock_default_cond!(crate::clh::ClhRaw);
#[cfg(feature = "std")]
impl_raw_lock_default_cond!(crate::clh::AtomicClhRaw);
#[cfg(feature = "std")]
impl_raw_lock_default_cond!(crate::mcs_tp::McsTpRaw);
#[cfg(feature = "std")]
impl_raw_lock_default_cond!(crate::mcs_tas::McsTasRaw);
#[cfg(feature = "std")]
impl_raw_lock_default_cond!(crate::uscl::UsclRaw);

#[cfg(feature = "std")]
impl<S: crate::hybridlock::SpinSubLock + Send + Sync> RawLock for crate::hybridlock::HybridLockRaw<S> {
    fn acquire(&self) {
        self.acquire()
    }
    fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        self.try_acquire_outcome()
    }
    fn release(&self) {
        self.release()
    }
    fn cond_wait(&self, _cond: &CondVar) -> Result<(), LockError> {
        Err(LockError::Unsupported("condvar on hybridlock"))
    }
    fn cond_timedwait(
        &self,
        _cond: &CondVar,
        _deadline: AbsDeadline,
    ) -> Result<TimedWaitOutcome, LockError> {
        Err(LockError::Unsupported("condvar on hybridlock"))
    }
}

#[cfg(feature = "std")]
impl RawLock for crate::flex::FlexguardRaw {
    fn acquire(&self) {
        self.acquire()
    }
    fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        self.try_acquire_outcome()
    }
    fn release(&self) {
        self.release()
    }
    fn cond_wait(&self, cond: &CondVar) -> Result<(), LockError> {
        self.cond_wait(cond);
        Ok(())
    }
    fn cond_timedwait(
        &self,
        cond: &CondVar,
        deadline: AbsDeadline,
    ) -> Result<TimedWaitOutcome, LockError> {
        Ok(self.cond_timedwait(cond, deadline))
    }
}

#[cfg(feature = "std")]
impl RawLock for crate::flex::HybridV2Raw {
    fn acquire(&self) {
        self.acquire()
    }
    fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        self.try_acquire_outcome()
    }
    fn release(&self) {
        self.release()
    }
    fn cond_wait(&self, cond: &CondVar) -> Result<(), LockError> {
        self.cond_wait(cond);
        Ok(())
    }
    fn cond_timedwait(
        &self,
        cond: &CondVar,
        deadline: AbsDeadline,
    ) -> Result<TimedWaitOutcome, LockError> {
        Ok(self.cond_timedwait(cond, deadline))
    }
}

cfg_if::cfg_if! {
    if #[cfg(feature = "algo-tas")] {
        /// The algorithm selected at build time.
        pub type SelectedRaw = crate::tas::TasRaw;
    } else if #[cfg(feature = "algo-ticket")] {
        pub type SelectedRaw = crate::ticket::TicketRaw;
    } else if #[cfg(feature = "algo-futex")] {
        pub type SelectedRaw = crate::futex_mutex::FutexRaw;
    } else if #[cfg(feature = "algo-spin-park")] {
        pub type SelectedRaw = crate::spin_park::SpinParkRaw;
    } else if #[cfg(feature = "algo-mcs-block")] {
        pub type SelectedRaw = crate::mcs_block::McsBlockRaw;
    } else if #[cfg(feature = "algo-clh")] {
        pub type SelectedRaw = crate::clh::ClhRaw;
    } else if #[cfg(feature = "algo-clh-atomic")] {
        pub type SelectedRaw = crate::clh::AtomicClhRaw;
    } else if #[cfg(feature = "algo-mcs-tp")] {
        pub type SelectedRaw = crate::mcs_tp::McsTpRaw;
    } else if #[cfg(feature = "algo-mcs-tas")] {
        pub type SelectedRaw = crate::mcs_tas::McsTasRaw;
    } else if #[cfg(feature = "algo-hybridlock")] {
        pub type SelectedRaw = crate::hybridlock::HybridLockRaw<crate::hybridlock::HybridMcs>;
    } else if #[cfg(feature = "algo-hybridv2")] {
        pub type SelectedRaw = crate::flex::HybridV2Raw;
    } else if #[cfg(feature = "algo-flexguard")] {
        pub type SelectedRaw = crate::flex::FlexguardRaw;
    } else if #[cfg(feature = "algo-uscl")] {
        pub type SelectedRaw = crate::uscl::UsclRaw;
    } else if #[cfg(feature = "std")] {
        // No algorithm feature selected: default to MCS, matching the
        // Cargo.toml feature comment.
        pub type SelectedRaw = crate::mcs::McsRaw;
    } else {
        // `std` disabled and no algorithm feature selected: MCS needs an
        // arena behind a `Mutex`, so fall back to the spin-only default.
        pub type SelectedRaw = crate::tas::TasRaw;
    }
}

/// The build-time-selected lock, wrapping user data `T`.
///
/// `init`/`destroy` are provided for parity with the language-neutral API
/// (§6); in this Rust expression construction and drop already perform
/// them, so both are cheap, idempotent no-ops kept only so callers porting
/// from the C-shaped API have a direct equivalent to call.
pub struct Lock<T = ()> {
    raw: SelectedRaw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`Lock::lock`].
pub struct LockGuard<'a, T> {
    lock: &'a Lock<T>,
}

impl<T> Lock<T> {
    /// Construct a new, unheld lock wrapping `data`.
    pub fn new(data: T) -> Self {
        Self {
            raw: SelectedRaw::default(),
            data: UnsafeCell::new(data),
        }
    }

    /// No-op; construction already initialized the lock. Provided for API
    /// parity with `lock_init(L)`.
    pub fn init(&self) -> Result<(), LockError> {
        Ok(())
    }

    /// No-op; dropping the lock already releases its resources. Provided
    /// for API parity with `lock_destroy(L)`. Calling this while the lock
    /// is held or contended is undefined, per 4.C.14, same as the original.
    pub fn destroy(&self) {}

    /// Block until the caller holds the lock.
    pub fn lock(&self) -> LockGuard<'_, T> {
        self.raw.acquire();
        LockGuard { lock: self }
    }

    /// Attempt to acquire without blocking.
    pub fn try_lock(&self) -> Result<LockGuard<'_, T>, TryAcquireOutcome> {
        match self.raw.try_acquire_outcome() {
            TryAcquireOutcome::Acquired => Ok(LockGuard { lock: self }),
            busy @ TryAcquireOutcome::Busy => Err(busy),
        }
    }

    /// Release without going through a [`LockGuard`]. Only meant for the
    /// interposition shim (4.F), whose platform entry points hand out no
    /// Rust-visible guard to the C caller and must release explicitly on
    /// `pthread_*_unlock`.
    #[cfg(feature = "interpose")]
    pub fn raw_release_for_interpose(&self) {
        self.raw.release();
    }
}

impl<T> Deref for LockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for LockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<T: Send> Send for Lock<T> {}
unsafe impl<T: Send> Sync for Lock<T> {}

/// The build-time-selected condition variable, used with a [`Lock`] of the
/// same algorithm.
pub struct Cond {
    inner: CondVar,
}

impl Cond {
    /// A condvar with no waiters enqueued or released.
    pub fn new() -> Self {
        Self {
            inner: CondVar::new(),
        }
    }

    /// No-op; construction already initialized the condvar. API parity
    /// with `cond_init(C)`.
    pub fn init(&self) -> Result<(), LockError> {
        Ok(())
    }

    /// No-op; API parity with `cond_destroy(C)`.
    pub fn destroy(&self) {}

    /// Wait for a signal, releasing and reacquiring `lock` around the wait.
    pub fn wait<T>(&self, lock: &Lock<T>) -> Result<(), LockError> {
        lock.raw.cond_wait(&self.inner)
    }

    /// As [`Cond::wait`], giving up at `deadline`.
    pub fn timedwait<T>(
        &self,
        lock: &Lock<T>,
        deadline: AbsDeadline,
    ) -> Result<TimedWaitOutcome, LockError> {
        lock.raw.cond_timedwait(&self.inner, deadline)
    }

    /// Wake exactly one waiter.
    pub fn signal(&self) {
        self.inner.signal();
    }

    /// Wake every waiter.
    pub fn broadcast(&self) {
        self.inner.broadcast();
    }
}

impl Default for Cond {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = Lock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn init_and_destroy_are_harmless_no_ops() {
        let lock = Lock::new(());
        lock.init().unwrap();
        lock.destroy();
        let _ = lock.lock();
    }

    #[test]
    fn try_lock_reports_busy_while_held() {
        let lock = Lock::new(());
        let g = lock.try_lock();
        assert!(g.is_ok());
        assert_eq!(lock.try_lock().unwrap_err(), TryAcquireOutcome::Busy);
    }

    #[test]
    fn cond_signal_wakes_a_waiter() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let lock = Arc::new(Lock::new(0u32));
        let cond = Arc::new(Cond::new());

        let lock2 = lock.clone();
        let cond2 = cond.clone();
        let handle = thread::spawn(move || {
            let _g = lock2.lock();
            let _ = cond2.wait(&lock2);
        });

        thread::sleep(Duration::from_millis(20));
        {
            let _g = lock.lock();
        }
        cond.signal();
        handle.join().unwrap();
    }

    #[test]
    fn cond_timedwait_reports_timeout_with_no_signal() {
        let lock = Lock::new(());
        let cond = Cond::new();
        let _g = lock.lock();
        let deadline = crate::wait::now_ns() + 10_000_000;
        drop(_g);
        let _g2 = lock.lock();
        let outcome = cond.timedwait(&lock, deadline).unwrap();
        assert_eq!(outcome, TimedWaitOutcome::TimedOut);
    }
}
