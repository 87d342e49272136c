//! `u-scl`, the proportional-share fair lock (4.C.13).
//!
//! A single-linked queue of per-call qnodes cycling through states
//! `INIT → NEXT → RUNNABLE → RUNNING`. Each thread carries a side record
//! (weight, ban deadline, current slice) created lazily on its first
//! acquisition, mirroring the original's `pthread_key_t`-backed
//! `flthread_info_t`. On release, the holder's critical-section length is
//! multiplied by `total_weight / own_weight` and added to its ban deadline,
//! so heavier (lower-niceness) threads tolerate shorter bans and
//! reacquire sooner — the proportional-share part of "proportional-share
//! fair lock". A short (~2 ms) slice is published on every acquire; while
//! it is still valid, the current holder can skip the queue's tail
//! entirely and reenter from the front, because it knows no one else can
//! be mid-acquire ahead of it. Banned threads sleep in coarse increments
//! and spin out the remainder.
//!
//! The qnode for a given acquisition is heap-allocated for the duration of
//! that call and freed right before `acquire` returns (mirroring the
//! original's stack-allocated `uscl_qnode_t n`, which is "freed" by the
//! stack popping on return): by the time a holder has recorded its
//! successor in `qnext` and handed it the RUNNABLE token, no other thread
//! can still be dereferencing the outgoing node.
//!
//! Grounded in `uscl.c`/`include/uscl.h` (itself the upstream
//! scheduler-cooperative-locks `u-scl` fairlock). `try_acquire` has no
//! counterpart in the original; this crate's approximation only succeeds
//! when the queue is provably empty, busy otherwise (see `DESIGN.md`).

use crate::condvar::CondVar;
use crate::config::Limits;
use crate::error::{LockError, TimedWaitOutcome, TryAcquireOutcome};
use crate::pr;
use crate::threadctx::current_thread_id;
use crate::wait::{self, AbsDeadline};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

const INIT: u32 = 0;
const NEXT: u32 = 1;
const RUNNABLE: u32 = 2;
const RUNNING: u32 = 3;

const SPIN_LIMIT: u32 = 20;

/// Niceness (-20..19) to scheduling weight, lifted verbatim from the Linux
/// CFS table the original borrows (`uscl.h`'s `prio_to_weight`).
const PRIO_TO_WEIGHT: [u64; 40] = [
    88761, 71755, 56483, 46273, 36291, 29154, 23254, 18705, 14949, 11916, 9548, 7620, 6100, 4904,
    3906, 3121, 2501, 1991, 1586, 1277, 1024, 820, 655, 526, 423, 335, 272, 215, 172, 137, 110,
    87, 70, 56, 45, 36, 29, 23, 18, 15,
];

fn default_weight() -> u64 {
    #[cfg(feature = "std")]
    {
        let nice = unsafe { libc::getpriority(libc::PRIO_PROCESS, 0) };
        let idx = (nice + 20).clamp(0, 39) as usize;
        PRIO_TO_WEIGHT[idx]
    }
    #[cfg(not(feature = "std"))]
    {
        PRIO_TO_WEIGHT[20]
    }
}

struct Qnode {
    state: AtomicU32,
    next: AtomicPtr<Qnode>,
}

impl Qnode {
    fn new(state: u32) -> Self {
        Self {
            state: AtomicU32::new(state),
            next: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

/// Per-thread fairness bookkeeping, created on a thread's first acquisition
/// (or explicitly via [`UsclRaw::set_thread_weight`]).
struct ThreadInfo {
    banned_until: AtomicU64,
    weight: u64,
    banned: AtomicBool,
    slice: AtomicU64,
    start_ticks: AtomicU64,
}

impl ThreadInfo {
    fn new(weight: u64, now: u64) -> Self {
        Self {
            banned_until: AtomicU64::new(now),
            weight,
            banned: AtomicBool::new(false),
            slice: AtomicU64::new(0),
            start_ticks: AtomicU64::new(0),
        }
    }
}

struct ThreadArena {
    infos: Mutex<Vec<Option<Box<ThreadInfo>>>>,
}

impl ThreadArena {
    fn new() -> Self {
        Self {
            infos: Mutex::new(Vec::new()),
        }
    }

    fn get_or_init(&self, id: usize, total_weight: &AtomicU64, weight: u64) -> *const ThreadInfo {
        let mut guard = self.infos.lock().unwrap();
        if guard.len() <= id {
            guard.resize_with(id + 1, || None);
        }
        if guard[id].is_none() {
            let w = if weight == 0 { default_weight() } else { weight };
            total_weight.fetch_add(w, Ordering::SeqCst);
            guard[id] = Some(Box::new(ThreadInfo::new(w, wait::now_ns())));
        }
        &**guard[id].as_ref().unwrap() as *const ThreadInfo
    }

    fn set(&self, id: usize, total_weight: &AtomicU64, weight: u64) {
        let mut guard = self.infos.lock().unwrap();
        if guard.len() <= id {
            guard.resize_with(id + 1, || None);
        }
        let w = if weight == 0 { default_weight() } else { weight };
        total_weight.fetch_add(w, Ordering::SeqCst);
        guard[id] = Some(Box::new(ThreadInfo::new(w, wait::now_ns())));
    }
}

fn spin_then_yield(mut expr: impl FnMut() -> bool) {
    loop {
        let mut counter = 0u32;
        let mut val = expr();
        while val && counter < SPIN_LIMIT {
            pr::stall();
            counter += 1;
            val = expr();
        }
        if !val {
            return;
        }
        #[cfg(feature = "std")]
        std::thread::yield_now();
    }
}

/// `u-scl`'s bookkeeping state.
pub struct UsclRaw {
    qtail: AtomicPtr<Qnode>,
    qnext: AtomicPtr<Qnode>,
    slice: AtomicU64,
    slice_valid: AtomicU32,
    total_weight: AtomicU64,
    /// Sentinel marking "the queue is in direct-handoff state": the
    /// equivalent of the original's `flqnode(lock)` self-referential
    /// pointer trick, expressed as an explicit node instead of pointer
    /// arithmetic off `&lock->qnext`.
    sentinel: Box<Qnode>,
    threads: ThreadArena,
    slice_granularity_ns: u64,
    sleep_granularity_ns: u64,
}

impl UsclRaw {
    /// A new, unheld instance using the default slice/sleep granularity.
    pub fn new() -> Self {
        Self::with_limits(&Limits::default_const())
    }

    /// A new, unheld instance with explicit slice/sleep granularity.
    pub fn with_limits(limits: &Limits) -> Self {
        Self {
            qtail: AtomicPtr::new(core::ptr::null_mut()),
            qnext: AtomicPtr::new(core::ptr::null_mut()),
            slice: AtomicU64::new(0),
            slice_valid: AtomicU32::new(0),
            total_weight: AtomicU64::new(0),
            sentinel: Box::new(Qnode::new(INIT)),
            threads: ThreadArena::new(),
            slice_granularity_ns: limits.uscl_slice_ns,
            sleep_granularity_ns: limits.uscl_sleep_granularity_us * 1_000,
        }
    }

    fn sentinel_ptr(&self) -> *mut Qnode {
        &*self.sentinel as *const Qnode as *mut Qnode
    }

    fn my_info(&self) -> *const ThreadInfo {
        self.threads
            .get_or_init(current_thread_id(), &self.total_weight, 0)
    }

    /// Explicitly set the calling thread's weight (`uscl_lock_thread_init`);
    /// a weight of `0` falls back to the process niceness-derived default.
    pub fn set_thread_weight(&self, weight: u64) {
        self.threads
            .set(current_thread_id(), &self.total_weight, weight);
    }

    /// Block until acquired.
    pub fn acquire(&self) {
        let info = unsafe { &*self.my_info() };

        if self.slice_valid.load(Ordering::SeqCst) != 0 {
            let curr_slice = self.slice.load(Ordering::SeqCst);
            let now = wait::now_ns();
            if info.slice.load(Ordering::SeqCst) == curr_slice && now < curr_slice {
                let succ = self.qnext.load(Ordering::SeqCst);
                if succ.is_null() {
                    if self
                        .qtail
                        .compare_exchange(
                            core::ptr::null_mut(),
                            self.sentinel_ptr(),
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        info.start_ticks.store(now, Ordering::SeqCst);
                        return;
                    }
                    let mut reentered_empty = false;
                    spin_then_yield(|| {
                        let now = wait::now_ns();
                        if now >= curr_slice {
                            return false;
                        }
                        let s = self.qnext.load(Ordering::SeqCst);
                        if !s.is_null() {
                            reentered_empty = true;
                            return false;
                        }
                        true
                    });
                    if wait::now_ns() >= curr_slice {
                        // Slice expired naturally; fall through to the slow
                        // path below.
                    } else if reentered_empty {
                        let succ2 = self.qnext.load(Ordering::SeqCst);
                        if self.try_reenter(succ2, info, now) {
                            return;
                        }
                    }
                } else if self.try_reenter(succ, info, now) {
                    return;
                }
            }
        }

        self.acquire_slow(info);
    }

    /// Attempt the fast "I still own the slice, steal the front of the
    /// queue" path. Returns `true` if the caller now holds the lock.
    fn try_reenter(&self, succ: *mut Qnode, info: &ThreadInfo, now: u64) -> bool {
        if succ.is_null() {
            return false;
        }
        let state = unsafe { (*succ).state.load(Ordering::SeqCst) };
        if state < RUNNABLE
            || unsafe {
                (*succ)
                    .state
                    .compare_exchange(RUNNABLE, NEXT, Ordering::SeqCst, Ordering::SeqCst)
            }
            .is_ok()
        {
            info.start_ticks.store(now, Ordering::SeqCst);
            return true;
        }
        false
    }

    fn acquire_slow(&self, info: &ThreadInfo) {
        if info.banned.load(Ordering::SeqCst) {
            let mut now = wait::now_ns();
            let banned_until = info.banned_until.load(Ordering::SeqCst);
            if now < banned_until {
                let mut remaining = banned_until - now;
                #[cfg(feature = "std")]
                while remaining > self.sleep_granularity_ns {
                    std::thread::sleep(Duration::from_nanos(remaining.min(self.sleep_granularity_ns * 4)));
                    now = wait::now_ns();
                    if now >= banned_until {
                        remaining = 0;
                        break;
                    }
                    remaining = banned_until - now;
                }
                let _ = remaining;
                spin_then_yield(|| wait::now_ns() < banned_until);
            }
        }

        let n = Box::into_raw(Box::new(Qnode::new(INIT)));
        loop {
            let prev = self.qtail.load(Ordering::SeqCst);
            if self
                .qtail
                .compare_exchange(prev, n, Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                continue;
            }

            if prev.is_null() {
                unsafe { (*n).state.store(RUNNABLE, Ordering::SeqCst) };
                self.qnext.store(n, Ordering::SeqCst);
            } else if prev == self.sentinel_ptr() {
                unsafe { (*n).state.store(NEXT, Ordering::SeqCst) };
                unsafe { (*self.sentinel).next.store(n, Ordering::SeqCst) };
            } else {
                unsafe { (*prev).next.store(n, Ordering::SeqCst) };
                loop {
                    wait::wait(unsafe { &(*n).state }, INIT);
                    if unsafe { (*n).state.load(Ordering::SeqCst) } != INIT {
                        break;
                    }
                }
            }

            loop {
                let slice_valid = self.slice_valid.load(Ordering::SeqCst) != 0;
                if !slice_valid {
                    break;
                }
                let curr_slice = self.slice.load(Ordering::SeqCst);
                let now = wait::now_ns();
                if now + self.sleep_granularity_ns >= curr_slice {
                    break;
                }
                let slice_left = curr_slice - now;
                wait::wait_timeout(&self.slice_valid, 1, Duration::from_nanos(slice_left));
            }
            if self.slice_valid.load(Ordering::SeqCst) != 0 {
                spin_then_yield(|| {
                    self.slice_valid.load(Ordering::SeqCst) != 0 && wait::now_ns() < self.slice.load(Ordering::SeqCst)
                });
                self.slice_valid.store(0, Ordering::SeqCst);
            }

            spin_then_yield(|| {
                let state = unsafe { (*n).state.load(Ordering::SeqCst) };
                state != RUNNABLE
                    || unsafe {
                        (*n)
                            .state
                            .compare_exchange(RUNNABLE, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
                    }
                    .is_err()
            });

            let mut succ = unsafe { (*n).next.load(Ordering::SeqCst) };
            if succ.is_null() {
                self.qnext.store(core::ptr::null_mut(), Ordering::SeqCst);
                if self
                    .qtail
                    .compare_exchange(n, self.sentinel_ptr(), Ordering::SeqCst, Ordering::SeqCst)
                    .is_err()
                {
                    spin_then_yield(|| {
                        succ = unsafe { (*n).next.load(Ordering::SeqCst) };
                        succ.is_null()
                    });
                    self.qnext.store(succ, Ordering::SeqCst);
                }
            } else {
                self.qnext.store(succ, Ordering::SeqCst);
            }

            let now = wait::now_ns();
            info.start_ticks.store(now, Ordering::SeqCst);
            let new_slice = now + self.slice_granularity_ns;
            info.slice.store(new_slice, Ordering::SeqCst);
            self.slice.store(new_slice, Ordering::SeqCst);
            self.slice_valid.store(1, Ordering::SeqCst);

            if !succ.is_null() {
                unsafe { (*succ).state.store(NEXT, Ordering::SeqCst) };
                wait::wake(unsafe { &(*succ).state }, 1);
            }

            // Safe to reclaim: `succ` (if any) now tracks its own state, and
            // no earlier predecessor still references `n`.
            drop(unsafe { Box::from_raw(n) });
            return;
        }
    }

    /// Attempt to acquire without blocking. Succeeds only on a fully empty
    /// queue; the original ships no `trylock` at all, so this is a
    /// conservative approximation rather than a transliteration.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        if self
            .qtail
            .compare_exchange(
                core::ptr::null_mut(),
                self.sentinel_ptr(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
        {
            let info = unsafe { &*self.my_info() };
            let now = wait::now_ns();
            info.start_ticks.store(now, Ordering::SeqCst);
            let new_slice = now + self.slice_granularity_ns;
            info.slice.store(new_slice, Ordering::SeqCst);
            self.slice.store(new_slice, Ordering::SeqCst);
            self.slice_valid.store(1, Ordering::SeqCst);
            return Ok(());
        }
        Err(LockError::Busy)
    }

    /// As [`UsclRaw::try_acquire`], in the plain outcome enum.
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        match self.try_acquire() {
            Ok(()) => TryAcquireOutcome::Acquired,
            Err(_) => TryAcquireOutcome::Busy,
        }
    }

    /// Release: hand off to the successor (if any) and update the ban
    /// deadline proportionally to the critical section's length.
    pub fn release(&self) {
        let mut succ = self.qnext.load(Ordering::SeqCst);
        if succ.is_null() {
            if self
                .qtail
                .compare_exchange(self.sentinel_ptr(), core::ptr::null_mut(), Ordering::SeqCst, Ordering::SeqCst)
                .is_err()
            {
                spin_then_yield(|| {
                    succ = self.qnext.load(Ordering::SeqCst);
                    succ.is_null()
                });
            }
        }
        if !succ.is_null() {
            unsafe { (*succ).state.store(RUNNABLE, Ordering::SeqCst) };
        }

        let info = unsafe { &*self.my_info() };
        let now = wait::now_ns();
        let cs = now.saturating_sub(info.start_ticks.load(Ordering::SeqCst));
        let total = self.total_weight.load(Ordering::SeqCst).max(1);
        let banned_delta = cs.saturating_mul(total) / info.weight.max(1);
        let banned_until = info.banned_until.fetch_add(banned_delta, Ordering::SeqCst) + banned_delta;
        let banned = now < banned_until;
        info.banned.store(banned, Ordering::SeqCst);

        if banned
            && self
                .slice_valid
                .compare_exchange(1, 0, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            wait::wake(&self.slice_valid, 1);
        }
    }

    /// Wait on `cond`, always parking (u-scl's condvar never consults a
    /// blocking signal — there is none for this algorithm).
    pub fn cond_wait(&self, cond: &CondVar) {
        cond.wait(|| self.release(), || self.acquire(), || true);
    }

    /// As [`UsclRaw::cond_wait`], with an absolute deadline.
    pub fn cond_timedwait(&self, cond: &CondVar, deadline: AbsDeadline) -> TimedWaitOutcome {
        cond.timedwait(|| self.release(), || self.acquire(), || true, deadline)
    }
}

impl Default for UsclRaw {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for UsclRaw {}
unsafe impl Sync for UsclRaw {}

/// A mutex protecting `T` using `u-scl`.
pub struct UsclLock<T> {
    raw: UsclRaw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`UsclLock::lock`].
pub struct UsclLockGuard<'a, T> {
    lock: &'a UsclLock<T>,
}

impl<T> UsclLock<T> {
    /// Wrap `data` behind a new, unheld `u-scl` mutex.
    pub fn new(data: T) -> Self {
        Self {
            raw: UsclRaw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until acquired.
    pub fn lock(&self) -> UsclLockGuard<'_, T> {
        self.raw.acquire();
        UsclLockGuard { lock: self }
    }

    /// Attempt to acquire only if the queue is currently empty.
    pub fn try_lock(&self) -> Option<UsclLockGuard<'_, T>> {
        self.raw
            .try_acquire()
            .ok()
            .map(|()| UsclLockGuard { lock: self })
    }
}

impl<T> Deref for UsclLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for UsclLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for UsclLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<T: Send> Send for UsclLock<T> {}
unsafe impl<T: Send> Sync for UsclLock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_unlock_roundtrip() {
        let lock = UsclLock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn try_lock_succeeds_on_empty_queue() {
        let lock = UsclLock::new(());
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn set_thread_weight_is_reflected_in_total_weight() {
        let lock = UsclLock::new(());
        lock.raw.set_thread_weight(500);
        assert!(lock.raw.total_weight.load(Ordering::SeqCst) >= 500);
    }

    #[test]
    fn two_thread_handoff() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration as StdDuration;

        let lock = Arc::new(UsclLock::new(0u32));
        let g = lock.lock();
        let lock2 = lock.clone();
        let handle = thread::spawn(move || {
            *lock2.lock() += 1;
        });
        thread::sleep(StdDuration::from_millis(20));
        drop(g);
        handle.join().unwrap();
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn many_threads_increment_exact_count() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(UsclLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..6 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 600);
    }
}
