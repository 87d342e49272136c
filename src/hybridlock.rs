//! `hybridlock` (4.C.11): two independent sub-locks — a spinning one
//! (MCS, CLH, or ticket, chosen as a type parameter rather than the
//! original's `#ifdef HYBRID_{MCS,CLH,TICKET}` branch) and a wait-address
//! one — behind a single 64-bit `(last, current)` state word.
//!
//! Acquire samples the state, acquires the sub-lock named by `current`; if
//! the state hasn't moved on in the meantime and `current != last`, it
//! drains the `last` sub-lock (spins until it reports free) before
//! stabilizing the state to `(current, current)`. If the state *did* move
//! on, the sub-lock just acquired is released and the whole loop retries.
//! External code can request a switch by CASing a fresh `(last, current)`
//! pair into the state; this crate exposes that as
//! [`HybridLockRaw::request_transition`] rather than reproducing the
//! original's timer-driven CLH abort path (which correlates with the
//! preemption-monitor interface, out of scope for the local-only fallback
//! — see `DESIGN.md`).
//!
//! Grounded in `hybridlock.c` / `include/hybridlock.h`.

use crate::error::{LockError, TryAcquireOutcome};
use crate::pr;
use core::cell::{Cell, UnsafeCell};
use core::ops::{Deref, DerefMut};
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicU32, AtomicU64, Ordering};

/// Which sub-lock a `(last, current)` state byte names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    /// The spinning sub-lock (MCS, CLH, or ticket).
    Spin,
    /// The wait-address sub-lock.
    Futex,
}

impl Phase {
    fn to_byte(self) -> u64 {
        match self {
            Phase::Spin => 0,
            Phase::Futex => 1,
        }
    }

    fn from_byte(b: u64) -> Self {
        if b == 0 {
            Phase::Spin
        } else {
            Phase::Futex
        }
    }
}

fn stable(p: Phase) -> u64 {
    let b = p.to_byte();
    b | (b << 8)
}

fn transition(from: Phase, to: Phase) -> u64 {
    to.to_byte() | (from.to_byte() << 8)
}

fn curr_phase(state: u64) -> Phase {
    Phase::from_byte(state & 0xff)
}

fn last_phase(state: u64) -> Phase {
    Phase::from_byte((state >> 8) & 0xff)
}

/// The spinning half of `hybridlock`: a sub-lock that supports aborting its
/// wait when the outer state moves on mid-spin.
pub trait SpinSubLock: Send + Sync {
    /// A new, unheld instance.
    fn new() -> Self;
    /// True if currently free (no holder, no committed waiter).
    fn is_free(&self) -> bool;
    /// Attempt to join/acquire. Spins while `state.load() == expected`;
    /// returns `true` on success, `false` if it gave up because `state`
    /// changed mid-wait (the caller must retry from the top).
    fn acquire_abortable(&self, state: &AtomicU64, expected: u64) -> bool;
    /// Release: caller must currently hold (or have aborted out of) this
    /// sub-lock per `acquire_abortable`'s contract.
    fn release(&self);
}

struct McsNode {
    waiting: AtomicU32,
    next: AtomicPtr<McsNode>,
}

impl McsNode {
    const fn new() -> Self {
        Self {
            waiting: AtomicU32::new(0),
            next: AtomicPtr::new(core::ptr::null_mut()),
        }
    }
}

thread_local! {
    static MCS_NODE: Box<McsNode> = Box::new(McsNode::new());
}

fn mcs_node_ptr() -> *mut McsNode {
    thread_local! {
        static CACHED: Cell<*mut McsNode> = const { Cell::new(core::ptr::null_mut()) };
    }
    CACHED.with(|c| {
        let p = c.get();
        if !p.is_null() {
            return p;
        }
        let p = MCS_NODE.with(|n| &**n as *const McsNode as *mut McsNode);
        c.set(p);
        p
    })
}

/// MCS-backed spinning sub-lock (`HYBRID_MCS`).
pub struct HybridMcs {
    tail: AtomicPtr<McsNode>,
}

unsafe impl Send for HybridMcs {}
unsafe impl Sync for HybridMcs {}

impl SpinSubLock for HybridMcs {
    fn new() -> Self {
        Self {
            tail: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    fn is_free(&self) -> bool {
        self.tail.load(Ordering::Acquire).is_null()
    }

    fn acquire_abortable(&self, state: &AtomicU64, expected: u64) -> bool {
        let me = mcs_node_ptr();
        unsafe {
            (*me).next.store(core::ptr::null_mut(), Ordering::Relaxed);
            (*me).waiting.store(0, Ordering::Relaxed);
        }
        let pred = self.tail.swap(me, Ordering::AcqRel);
        if pred.is_null() {
            return true;
        }
        unsafe {
            (*me).waiting.store(1, Ordering::SeqCst);
            (*pred).next.store(me, Ordering::Release);
        }
        while unsafe { (*me).waiting.load(Ordering::Acquire) } != 0
            && state.load(Ordering::SeqCst) == expected
        {
            pr::stall();
        }
        if unsafe { (*me).waiting.load(Ordering::Acquire) } != 0 {
            // Phase moved on before we were signaled: try to claim our own
            // abort. Racing with a genuine signal from the releaser, so
            // only one of the two wins the CAS.
            if unsafe {
                (*me)
                    .waiting
                    .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            }
            .is_ok()
            {
                return false;
            }
        }
        true
    }

    fn release(&self) {
        let me = mcs_node_ptr();
        let mut curr = me;
        loop {
            let succ = unsafe { (*curr).next.load(Ordering::Acquire) };
            if succ.is_null() {
                if self
                    .tail
                    .compare_exchange(curr, core::ptr::null_mut(), Ordering::AcqRel, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                loop {
                    let s = unsafe { (*curr).next.load(Ordering::Acquire) };
                    if !s.is_null() {
                        break;
                    }
                    pr::stall();
                }
                continue;
            }
            curr = succ;
            // SAFETY: `succ` is a live, stable per-thread qnode.
            if unsafe {
                (*succ)
                    .waiting
                    .compare_exchange(1, 0, Ordering::AcqRel, Ordering::Relaxed)
            }
            .is_ok()
            {
                return;
            }
            // `succ` already aborted on its own; keep walking to find a
            // live waiter to hand off to.
        }
    }
}

struct ClhNode {
    done: AtomicBool,
}

impl ClhNode {
    const fn new(done: bool) -> Self {
        Self {
            done: AtomicBool::new(done),
        }
    }
}

thread_local! {
    static CLH_PRED: Cell<*mut ClhNode> = const { Cell::new(core::ptr::null_mut()) };
}

/// CLH-backed spinning sub-lock (`HYBRID_CLH`).
pub struct HybridClh {
    head: AtomicPtr<ClhNode>,
}

unsafe impl Send for HybridClh {}
unsafe impl Sync for HybridClh {}

impl SpinSubLock for HybridClh {
    fn new() -> Self {
        let sentinel = Box::into_raw(Box::new(ClhNode::new(true)));
        Self {
            head: AtomicPtr::new(sentinel),
        }
    }

    fn is_free(&self) -> bool {
        let h = self.head.load(Ordering::Acquire);
        unsafe { (*h).done.load(Ordering::Acquire) }
    }

    fn acquire_abortable(&self, state: &AtomicU64, expected: u64) -> bool {
        let my_node = Box::into_raw(Box::new(ClhNode::new(false)));
        let pred = self.head.swap(my_node, Ordering::AcqRel);
        while !unsafe { (*pred).done.load(Ordering::Acquire) } && state.load(Ordering::SeqCst) == expected {
            pr::stall();
        }
        if !unsafe { (*pred).done.load(Ordering::Acquire) } {
            // Per the original's own caveat: this can only correctly abort
            // when every waiter aborts at once, since predecessor chains
            // are not unlinked here. Preserved verbatim rather than fixed.
            unsafe { (*my_node).done.store(true, Ordering::Release) };
            CLH_PRED.with(|c| c.set(pred));
            return false;
        }
        // SAFETY: predecessor is no longer referenced by any other thread.
        drop(unsafe { Box::from_raw(pred) });
        CLH_PRED.with(|c| c.set(my_node));
        true
    }

    fn release(&self) {
        let node = CLH_PRED.with(|c| c.get());
        unsafe { (*node).done.store(true, Ordering::Release) };
    }
}

struct TicketState {
    calling: AtomicU32,
    next: AtomicU32,
}

/// Ticket-backed spinning sub-lock (`HYBRID_TICKET`). Does not support
/// abort: a ticket holder cannot cut the queue without breaking FIFO, so
/// `acquire_abortable` always blocks to completion (see `spec.md`
/// §4.C.11: "ticket does not abort").
pub struct HybridTicket {
    inner: TicketState,
}

unsafe impl Send for HybridTicket {}
unsafe impl Sync for HybridTicket {}

impl SpinSubLock for HybridTicket {
    fn new() -> Self {
        Self {
            inner: TicketState {
                calling: AtomicU32::new(1),
                next: AtomicU32::new(0),
            },
        }
    }

    fn is_free(&self) -> bool {
        self.inner.calling.load(Ordering::Acquire) == self.inner.next.load(Ordering::Acquire) + 1
    }

    fn acquire_abortable(&self, _state: &AtomicU64, _expected: u64) -> bool {
        let ticket = self.inner.next.fetch_add(1, Ordering::AcqRel) + 1;
        loop {
            let curr = self.inner.calling.load(Ordering::Acquire);
            if curr == ticket {
                return true;
            }
            let distance = curr.abs_diff(ticket);
            if distance <= 1 {
                pr::stall();
            } else {
                crate::backoff::spin_proportional(distance, 512);
            }
        }
    }

    fn release(&self) {
        self.inner.calling.fetch_add(1, Ordering::AcqRel);
    }
}

/// `hybridlock`'s bookkeeping state, generic over the spinning sub-lock
/// implementation selected at build time.
pub struct HybridLockRaw<S: SpinSubLock> {
    state: AtomicU64,
    futex: AtomicU32,
    futex_debouncer: AtomicU32,
    spin: S,
}

const FUTEX_DEBOUNCE_CALLS: u32 = 40;

impl<S: SpinSubLock> HybridLockRaw<S> {
    /// A new instance stable in the spinning phase (the original's default
    /// start state).
    pub fn new() -> Self {
        Self {
            state: AtomicU64::new(stable(Phase::Spin)),
            futex: AtomicU32::new(0),
            futex_debouncer: AtomicU32::new(0),
            spin: S::new(),
        }
    }

    fn is_free(&self, phase: Phase) -> bool {
        match phase {
            Phase::Spin => self.spin.is_free(),
            Phase::Futex => self.futex.load(Ordering::Acquire) == 0,
        }
    }

    fn futex_acquire(&self) {
        let prev = self.futex.compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed);
        if prev.is_ok() {
            return;
        }
        let mut c = prev.unwrap_err();
        if c != 2 {
            c = self.futex.swap(2, Ordering::Acquire);
        }
        while c != 0 {
            crate::wait::wait(&self.futex, 2);
            c = self.futex.swap(2, Ordering::Acquire);
        }
    }

    fn futex_release(&self) {
        let mut switched = false;
        if self.futex.fetch_sub(1, Ordering::Release) != 1 {
            self.futex.store(0, Ordering::Release);
            crate::wait::wake(&self.futex, 1);
            switched = true;
        }
        if self.futex_debouncer.fetch_add(1, Ordering::Relaxed) + 1 >= FUTEX_DEBOUNCE_CALLS && !switched {
            self.futex_debouncer.store(0, Ordering::Relaxed);
            let _ = self.state.compare_exchange(
                stable(Phase::Futex),
                transition(Phase::Futex, Phase::Spin),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// Request a switch to `to`, provided the lock is currently stable at
    /// some phase (a transition already in progress is left alone). Used
    /// by external policy (timers, a preemption signal) rather than by the
    /// acquire/release fast paths themselves.
    pub fn request_transition(&self, to: Phase) {
        let state = self.state.load(Ordering::SeqCst);
        let curr = curr_phase(state);
        if curr == last_phase(state) && curr != to {
            let _ = self.state.compare_exchange(
                state,
                transition(curr, to),
                Ordering::AcqRel,
                Ordering::Relaxed,
            );
        }
    }

    /// Block until acquired.
    pub fn acquire(&self) {
        loop {
            let state = self.state.load(Ordering::SeqCst);
            let curr = curr_phase(state);
            let acquired = match curr {
                Phase::Spin => self.spin.acquire_abortable(&self.state, state),
                Phase::Futex => {
                    self.futex_acquire();
                    true
                }
            };
            if !acquired {
                continue;
            }
            if self.state.load(Ordering::SeqCst) == state {
                let last = last_phase(state);
                if curr != last {
                    while !self.is_free(last) {
                        pr::stall();
                    }
                    self.state.store(stable(curr), Ordering::SeqCst);
                }
                return;
            }
            match curr {
                Phase::Spin => self.spin.release(),
                Phase::Futex => self.futex_release(),
            }
        }
    }

    /// Always busy: `hybridlock_trylock` has no real implementation in the
    /// original either.
    pub fn try_acquire(&self) -> Result<(), LockError> {
        Err(LockError::Busy)
    }

    /// As [`HybridLockRaw::try_acquire`]: always [`TryAcquireOutcome::Busy`].
    pub fn try_acquire_outcome(&self) -> TryAcquireOutcome {
        TryAcquireOutcome::Busy
    }

    /// Release whichever sub-lock the (stable) state currently names.
    pub fn release(&self) {
        let state = self.state.load(Ordering::SeqCst);
        match last_phase(state) {
            Phase::Spin => self.spin.release(),
            Phase::Futex => self.futex_release(),
        }
    }
}

impl<S: SpinSubLock> Default for HybridLockRaw<S> {
    fn default() -> Self {
        Self::new()
    }
}

unsafe impl<S: SpinSubLock> Send for HybridLockRaw<S> {}
unsafe impl<S: SpinSubLock> Sync for HybridLockRaw<S> {}

/// A mutex protecting `T` using `hybridlock`, parameterized by its
/// spinning sub-lock.
pub struct HybridLock<S: SpinSubLock, T> {
    raw: HybridLockRaw<S>,
    data: UnsafeCell<T>,
}

/// RAII guard returned by [`HybridLock::lock`].
pub struct HybridLockGuard<'a, S: SpinSubLock, T> {
    lock: &'a HybridLock<S, T>,
}

impl<S: SpinSubLock, T> HybridLock<S, T> {
    /// Wrap `data` behind a new, unheld `hybridlock`.
    pub fn new(data: T) -> Self {
        Self {
            raw: HybridLockRaw::new(),
            data: UnsafeCell::new(data),
        }
    }

    /// Block until acquired.
    pub fn lock(&self) -> HybridLockGuard<'_, S, T> {
        self.raw.acquire();
        HybridLockGuard { lock: self }
    }
}

impl<S: SpinSubLock, T> Deref for HybridLockGuard<'_, S, T> {
    type Target = T;
    fn deref(&self) -> &T {
        unsafe { &*self.lock.data.get() }
    }
}

impl<S: SpinSubLock, T> DerefMut for HybridLockGuard<'_, S, T> {
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.lock.data.get() }
    }
}

impl<S: SpinSubLock, T> Drop for HybridLockGuard<'_, S, T> {
    fn drop(&mut self) {
        self.lock.raw.release();
    }
}

unsafe impl<S: SpinSubLock, T: Send> Send for HybridLock<S, T> {}
unsafe impl<S: SpinSubLock, T: Send> Sync for HybridLock<S, T> {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mcs_backed_lock_unlock_roundtrip() {
        let lock: HybridLock<HybridMcs, u32> = HybridLock::new(0);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn clh_backed_lock_unlock_roundtrip() {
        let lock: HybridLock<HybridClh, u32> = HybridLock::new(0);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn ticket_backed_lock_unlock_roundtrip() {
        let lock: HybridLock<HybridTicket, u32> = HybridLock::new(0);
        *lock.lock() += 1;
        assert_eq!(*lock.lock(), 1);
    }

    #[test]
    fn request_transition_moves_to_futex_and_back() {
        let raw: HybridLockRaw<HybridMcs> = HybridLockRaw::new();
        raw.acquire();
        raw.release();
        raw.request_transition(Phase::Futex);
        raw.acquire();
        raw.release();
        assert_eq!(curr_phase(raw.state.load(Ordering::SeqCst)), Phase::Futex);
    }

    #[test]
    fn two_thread_handoff_mcs_backed() {
        use std::sync::Arc;
        use std::thread;
        use std::time::Duration;

        let lock: Arc<HybridLock<HybridMcs, u32>> = Arc::new(HybridLock::new(0));
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
    fn many_threads_increment_exact_count_ticket_backed() {
        use std::sync::Arc;
        use std::thread;

        let lock: Arc<HybridLock<HybridTicket, u64>> = Arc::new(HybridLock::new(0));
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
