//! `flexguard` and `hybridv2` (4.C.12): an MCS queue guarding admission to a
//! single wait-address word with three states — 0 free, 1 held with no
//! known waiters, 2 held with waiters parked on the word. A blocking-count
//! signal picks, per attempt, whether a contender joins the MCS queue at
//! all or skips straight to the park loop; queued waiters re-check the
//! signal on every spin and can abandon the spin loop into the park loop
//! mid-wait.
//!
//! The two originals differ only in where the blocking count lives:
//! `flexguard.c` keeps one counter for the whole process, `hybridv2.c` keeps
//! one per lock plus a waiter count (to skip the wake syscall when nobody
//! parked) and a "next waiter preempted" slot used to bump its counter when
//! a releaser's successor looks preempted. [`FlexguardRaw`] and
//! [`HybridV2Raw`] share the MCS enqueue/unlock helpers below; each wires up
//! its own blocking-signal plumbing around them.
//!
//! Grounded in `flexguard.c`/`include/flexguard.h` and
//! `hybridv2.c`/`include/hybridv2.h`. BPF tracing labels and the kernel
//! skeleton loader in both originals are out of scope (component G's
//! local-only fallback; see `DESIGN.md`).

use crate::condvar::CondVar;
use crate::error::{LockError, TimedWaitOutcome, TryAcquireOutcome};
use crate::pr;
use crate::threadctx::current_thread_id;
use crate::wait::{self, AbsDeadline};
use core::cell::UnsafeCell;
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

const FREE: u32 = 0;
const HELD: u32 = 1;
const HELD_WITH_WAITERS: u32 = 2;

struct Qnode {
    waiting: AtomicBool,
    next: AtomicPtr<Qnode>,
    /// Set true by the owning thread while it is running (component G); read
    /// by a releaser deciding whether its successor looks preempted.
    running: AtomicBool,
}

impl Qnode {
    fn new() -> Self {
        Self {
            waiting: AtomicBool::new(false),
            next: AtomicPtr::new(core::ptr::null_mut()),
            running: AtomicBool::new(true),
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

/// Enqueue `me` onto `queue`'s MCS tail. Returns `true` if `me` became the
/// sole occupant (lock was free from the MCS queue's perspective).
fn mcs_enqueue(queue: &AtomicPtr<Qnode>, me: *mut Qnode) -> bool {
    unsafe {
        (*me).next.store(core::ptr::null_mut(), Ordering::Relaxed);
        (*me).waiting.store(true, Ordering::Relaxed);
    }
    let pred = queue.swap(me, Ordering::AcqRel);
    if pred.is_null() {
        return true;
    }
    unsafe { (*pred).next.store(me, Ordering::Release) };
    false
}

/// Hand the MCS token to the successor, if any is already enqueued; else
/// clear the tail. Returns the (possibly still-null) successor pointer so
/// callers needing its `running` flag (`hybridv2`) don't have to re-walk.
fn mcs_unlock(queue: &AtomicPtr<Qnode>, me: *mut Qnode) -> *mut Qnode {
    let next = unsafe { (*me).next.load(Ordering::Acquire) };
    if next.is_null() {
        if queue
            .compare_exchange(me, core::ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
        {
            return core::ptr::null_mut();
        }
        loop {
            let n = unsafe { (*me).next.load(Ordering::Acquire) };
            if !n.is_null() {
                unsafe { (*n).waiting.store(false, Ordering::Release) };
                return n;
            }
            pr::stall();
        }
    }
    unsafe { (*next).waiting.store(false, Ordering::Release) };
    next
}

/// `flexguard`: one blocking-count signal shared by every instance in the
/// process (`static preempted_count` in the original).
pub struct FlexguardRaw {
    lock_value: AtomicU32,
    queue: AtomicPtr<Qnode>,
    arena: Arena,
    cond: CondVar,
}

static FLEXGUARD_PROCESS_BLOCKING_COUNT: AtomicU64 = AtomicU64::new(0);

/// Raise or lower the process-wide blocking-count signal read by every
/// [`FlexguardRaw`] instance. A local stand-in for the preemption-monitor
/// interface's external writer (4.G) when no kernel observer is attached.
pub fn flexguard_set_blocking(blocking: bool) {
    if blocking {
        FLEXGUARD_PROCESS_BLOCKING_COUNT.fetch_add(1, Ordering::SeqCst);
    } else {
        FLEXGUARD_PROCESS_BLOCKING_COUNT.fetch_sub(1, Ordering::SeqCst);
    }
}

fn flexguard_is_blocking() -> bool {
    FLEXGUARD_PROCESS_BLOCKING_COUNT.load(Ordering::SeqCst) != 0
}

impl FlexguardRaw {
    /// A new, unheld instance.
    pub fn new() -> Self {
        Self {
            lock_value: AtomicU32::new(FREE),
            queue: AtomicPtr::new(core::ptr::null_mut()),
            arena: Arena::new(),
            cond: CondVar::new(),
        }
    }

    fn my_node(&self) -> *mut Qnode {
        self.arena.node_for(current_thread_id())
    }

    /// Block until acquired.
    pub fn acquire(&self) {
        if self.lock_value.load(Ordering::Acquire) == FREE
            && self
                .lock_value
                .compare_exchange(FREE, HELD, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }

        'enqueue: loop {
            let me = self.my_node();
            let mut enqueued = false;
            if !flexguard_is_blocking() {
                enqueued = true;
                let became_head = mcs_enqueue(&self.queue, me);
                if !became_head {
                    while unsafe { (*me).waiting.load(Ordering::Acquire) } && !flexguard_is_blocking() {
                        pr::stall();
                    }
                }
            }

            let mut state = self.lock_value.load(Ordering::Acquire);
            if state == FREE {
                state = self
                    .lock_value
                    .compare_exchange(FREE, HELD, Ordering::AcqRel, Ordering::Relaxed)
                    .unwrap_or_else(|prev| prev);
            }
            while state != FREE {
                if flexguard_is_blocking() {
                    if enqueued {
                        mcs_unlock(&self.queue, me);
                        enqueued = false;
                    }
                    if self.lock_value.load(Ordering::Acquire) != HELD_WITH_WAITERS {
                        state = self.lock_value.swap(HELD_WITH_WAITERS, Ordering::AcqRel);
                    }
                    if state != FREE {
                        wait::wait(&self.lock_value, HELD_WITH_WAITERS);
                        state = self.lock_value.swap(HELD_WITH_WAITERS, Ordering::AcqRel);
                        if state != FREE && !flexguard_is_blocking() {
                            continue 'enqueue;
                        }
                    }
                } else {
                    pr::stall();
                    if self.lock_value.load(Ordering::Acquire) == FREE {
                        state = self
                            .lock_value
                            .compare_exchange(FREE, HELD, Ordering::AcqRel, Ordering::Relaxed)
                            .unwrap_or_else(|prev| prev);
                    }
                }
            }

            if enqueued {
                mcs_unlock(&self.queue, me);
            }
            return;
        }
    }

    /// Attempt to acquire without blocking.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        self.lock_value
            .compare_exchange(FREE, HELD, Ordering::AcqRel, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| LockError::Busy)
    }

    /// As [`FlexguardRaw::try_acquire`], in the plain outcome enum.
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        match self.try_acquire() {
            Ok(()) => TryAcquireOutcome::Acquired,
            Err(_) => TryAcquireOutcome::Busy,
        }
    }

    /// Release: clear the word; wake a parked waiter if the word had
    /// recorded any.
    pub fn release(&self) {
        if self.lock_value.swap(FREE, Ordering::Release) != HELD {
            wait::wake(&self.lock_value, 1);
        }
    }

    /// Wait on `cond`, parking (rather than spinning) while the process-wide
    /// blocking signal is set.
    pub fn cond_wait(&self, cond: &CondVar) {
        cond.wait(|| self.release(), || self.acquire(), flexguard_is_blocking);
    }

    /// As [`FlexguardRaw::cond_wait`], with an absolute deadline.
    pub fn cond_timedwait(&self, cond: &CondVar, deadline: AbsDeadline) -> TimedWaitOutcome {
        cond.timedwait(
            || self.release(),
            || self.acquire(),
            flexguard_is_blocking,
            deadline,
        )
    }
}

impl Default for FlexguardRaw {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for FlexguardRaw {}
unsafe impl Sync for FlexguardRaw {}

/// `hybridv2`: a per-lock blocking-count plus a waiter count (to skip the
/// wake syscall) and a "next waiter preempted" bookkeeping slot.
pub struct HybridV2Raw {
    lock_value: AtomicU32,
    queue: AtomicPtr<Qnode>,
    arena: Arena,
    waiter_count: AtomicU32,
    blocking_count: AtomicU64,
    next_waiter_preempted: AtomicPtr<Qnode>,
    cond: CondVar,
}

impl HybridV2Raw {
    /// A new, unheld instance with its own blocking-count signal.
    pub fn new() -> Self {
        Self {
            lock_value: AtomicU32::new(FREE),
            queue: AtomicPtr::new(core::ptr::null_mut()),
            arena: Arena::new(),
            waiter_count: AtomicU32::new(0),
            blocking_count: AtomicU64::new(0),
            next_waiter_preempted: AtomicPtr::new(core::ptr::null_mut()),
            cond: CondVar::new(),
        }
    }

    /// This instance's `blocking_count`, as read by the preemption-monitor
    /// interface (4.G). Non-zero means "prefer parking".
    pub fn blocking_count(&self) -> u64 {
        self.blocking_count.load(Ordering::SeqCst)
    }

    fn is_blocking(&self) -> bool {
        self.blocking_count() != 0
    }

    fn my_node(&self) -> *mut Qnode {
        self.arena.node_for(current_thread_id())
    }

    /// Mark the calling thread's qnode as currently running (or not),
    /// written by the local stand-in for the external preemption observer.
    pub fn set_running(&self, running: bool) {
        let me = self.my_node();
        unsafe { (*me).running.store(running, Ordering::SeqCst) };
    }

    /// Block until acquired.
    pub fn acquire(&self) {
        if self.lock_value.load(Ordering::Acquire) == FREE
            && self
                .lock_value
                .compare_exchange(FREE, HELD, Ordering::AcqRel, Ordering::Relaxed)
                .is_ok()
        {
            return;
        }

        let me = self.my_node();
        let mut enqueued = false;
        if !self.is_blocking() {
            enqueued = true;
            let became_head = mcs_enqueue(&self.queue, me);
            if !became_head {
                while unsafe { (*me).waiting.load(Ordering::Acquire) } && !self.is_blocking() {
                    pr::stall();
                }
            }
        }

        while self.lock_value.load(Ordering::Acquire) != FREE
            || self
                .lock_value
                .compare_exchange(FREE, HELD, Ordering::AcqRel, Ordering::Relaxed)
                .is_err()
        {
            if self.is_blocking() {
                self.waiter_count.fetch_add(1, Ordering::SeqCst);
                wait::wait_timeout(&self.lock_value, HELD, core::time::Duration::from_millis(1));
                self.waiter_count.fetch_sub(1, Ordering::SeqCst);
            } else {
                pr::stall();
            }
        }

        if enqueued {
            let successor = mcs_unlock(&self.queue, me);
            if !successor.is_null() && !unsafe { (*successor).running.load(Ordering::SeqCst) } {
                let prev_marked = self.next_waiter_preempted.load(Ordering::SeqCst);
                if prev_marked.is_null() {
                    self.blocking_count.fetch_add(1, Ordering::SeqCst);
                }
                self.next_waiter_preempted.store(successor, Ordering::SeqCst);
            }
        }

        if self.next_waiter_preempted.load(Ordering::SeqCst) == me {
            self.blocking_count.fetch_sub(1, Ordering::SeqCst);
            self.next_waiter_preempted
                .store(core::ptr::null_mut(), Ordering::SeqCst);
        }
    }

    /// Attempt to acquire without blocking.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        self.lock_value
            .compare_exchange(FREE, HELD, Ordering::AcqRel, Ordering::Relaxed)
            .map(|_| ())
            .map_err(|_| LockError::Busy)
    }

    /// As [`HybridV2Raw::try_acquire`], in the plain outcome enum.
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        match self.try_acquire() {
            Ok(()) => TryAcquireOutcome::Acquired,
            Err(_) => TryAcquireOutcome::Busy,
        }
    }

    /// Release: clear the word; wake a parked waiter only if the waiter
    /// count is positive (skipping the wake syscall otherwise).
    pub fn release(&self) {
        self.lock_value.store(FREE, Ordering::Release);
        if self.waiter_count.load(Ordering::SeqCst) > 0 {
            wait::wake(&self.lock_value, 1);
        }
    }

    /// Wait on `cond`, parking while this lock's own blocking signal is set.
    pub fn cond_wait(&self, cond: &CondVar) {
        cond.wait(|| self.release(), || self.acquire(), || self.is_blocking());
    }

    /// As [`HybridV2Raw::cond_wait`], with an absolute deadline.
    pub fn cond_timedwait(&self, cond: &CondVar, deadline: AbsDeadline) -> TimedWaitOutcome {
        cond.timedwait(
            || self.release(),
            || self.acquire(),
            || self.is_blocking(),
            deadline,
        )
    }
}

impl Default for HybridV2Raw {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl Send for HybridV2Raw {}
unsafe impl Sync for HybridV2Raw {}

/// A mutex protecting `T` using `flexguard`.
pub struct FlexguardLock<T> {
    raw: FlexguardRaw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`FlexguardLock::lock`].
pub struct FlexguardLockGuard<'a, T> {
    lock: &'a FlexguardLock<T>,
}

impl<T> FlexguardLock<T> {
    /// Wrap `data` behind a new, unheld `flexguard` mutex.
    pub fn new(data: T) -> Self {
        Self {
            raw: FlexguardRaw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until acquired.
    pub fn lock(&self) -> FlexguardLockGuard<'_, T> {
        self.raw.acquire();
        FlexguardLockGuard { lock: self }
    }

    /// Attempt to acquire without blocking.
    pub fn try_lock(&self) -> Option<FlexguardLockGuard<'_, T>> {
        self.raw
            .try_acquire()
            .ok()
            .map(|()| FlexguardLockGuard { lock: self })
    }
}

impl<T> Deref for FlexguardLockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for FlexguardLockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for FlexguardLockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<T: Send> Send for FlexguardLock<T> {}
unsafe impl<T: Send> Sync for FlexguardLock<T> {}

/// A mutex protecting `T` using `hybridv2`.
pub struct HybridV2Lock<T> {
    raw: HybridV2Raw,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`HybridV2Lock::lock`].
pub struct HybridV2LockGuard<'a, T> {
    lock: &'a HybridV2Lock<T>,
}

impl<T> HybridV2Lock<T> {
    /// Wrap `data` behind a new, unheld `hybridv2` mutex.
    pub fn new(data: T) -> Self {
        Self {
            raw: HybridV2Raw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until acquired.
    pub fn lock(&self) -> HybridV2LockGuard<'_, T> {
        self.raw.acquire();
        HybridV2LockGuard { lock: self }
    }

    /// Attempt to acquire without blocking.
    pub fn try_lock(&self) -> Option<HybridV2LockGuard<'_, T>> {
        self.raw
            .try_acquire()
            .ok()
            .map(|()| HybridV2LockGuard { lock: self })
    }
}

impl<T> Deref for HybridV2LockGuard<'_, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<T> DerefMut for HybridV2LockGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<T> Drop for HybridV2LockGuard<'_, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<T: Send> Send for HybridV2Lock<T> {}
unsafe impl<T: Send> Sync for HybridV2Lock<T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flexguard_lock_unlock_roundtrip() {
        let lock = FlexguardLock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn flexguard_try_lock_fails_when_held() {
        let lock = FlexguardLock::new(());
        let g = lock.lock();
        assert!(lock.try_lock().is_none());
        drop(g);
        assert!(lock.try_lock().is_some());
    }

    #[test]
    fn flexguard_two_thread_handoff() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let lock = Arc::new(FlexguardLock::new(0u32));
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
    fn flexguard_many_threads_increment_exact_count() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(FlexguardLock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..300 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 2400);
    }

    #[test]
    fn hybridv2_lock_unlock_roundtrip() {
        let lock = HybridV2Lock::new(0u32);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn hybridv2_blocking_count_starts_zero() {
        let lock = HybridV2Lock::new(());
        assert_eq!(lock.raw.blocking_count(), 0);
    }

    #[test]
    fn hybridv2_two_thread_handoff() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let lock = Arc::new(HybridV2Lock::new(0u32));
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
    fn hybridv2_many_threads_increment_exact_count() {
        use std::sync::Arc;
        use std::thread;

        let lock = Arc::new(HybridV2Lock::new(0u64));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let lock = lock.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..300 {
                    *lock.lock() += 1;
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(*lock.lock(), 2400);
    }
}
