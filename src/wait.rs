//! Address-based wait/wake primitives (futex wrappers).
//!
//! `wait(addr, val)` blocks the caller iff `*addr == val` at the time of the
//! call and returns on wake or spuriously; `wake(addr, n)` wakes up to `n`
//! waiters on `addr`. These are private to the process (no cross-process
//! futex support is needed here, mirroring `FUTEX_WAIT_PRIVATE`/
//! `FUTEX_WAKE_PRIVATE` in the original's `futex.c`).
//!
//! Without the `std` feature there is no syscall available, so `wait`
//! degenerates to a pure spin (never actually blocking) and `wake` is a
//! no-op; algorithms built this way rely entirely on their own spin loop for
//! progress. This is a documented degradation, not a silent one.

use core::sync::atomic::AtomicU32;
use core::time::Duration;

/// An absolute deadline, expressed in the same units `pr::rdtsc`-adjacent
/// callers use: nanoseconds since an arbitrary but fixed process epoch. The
/// interposition layer and the facade translate wall-clock deadlines to this
/// form once, at the call boundary, using [`now_ns`].
pub type AbsDeadline = u64;

/// Wait while `*addr == val`. Returns once the value changes, a wake is
/// delivered, or (always permitted) spuriously.
#[inline]
pub fn wait(addr: &AtomicU32, val: u32) {
    imp::wait(addr, val);
}

/// As [`wait`], but gives up after `timeout` elapses even if the value never
/// changes and no wake arrives.
#[inline]
pub fn wait_timeout(addr: &AtomicU32, val: u32, timeout: Duration) -> WaitResult {
    imp::wait_timeout(addr, val, timeout)
}

/// As [`wait_timeout`], but the deadline is absolute rather than relative.
#[inline]
pub fn wait_timeout_abs(addr: &AtomicU32, val: u32, deadline: AbsDeadline) -> WaitResult {
    let now = now_ns();
    if deadline <= now {
        if addr.load(core::sync::atomic::Ordering::SeqCst) != val {
            return WaitResult::Woken;
        }
        return WaitResult::TimedOut;
    }
    wait_timeout(addr, val, Duration::from_nanos(deadline - now))
}

/// Wake up to `n` threads waiting on `addr`.
#[inline]
pub fn wake(addr: &AtomicU32, n: i32) {
    imp::wake(addr, n);
}

/// Outcome of a bounded wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitResult {
    /// Returned because the value changed, a wake arrived, or spuriously.
    Woken,
    /// Returned because the deadline elapsed.
    TimedOut,
}

/// Current time in nanoseconds since a fixed (but otherwise unspecified)
/// process epoch, suitable for building absolute deadlines.
#[cfg(feature = "std")]
pub fn now_ns() -> u64 {
    use std::sync::OnceLock;
    use std::time::Instant;
    static EPOCH: OnceLock<Instant> = OnceLock::new();
    let epoch = EPOCH.get_or_init(Instant::now);
    epoch.elapsed().as_nanos() as u64
}

#[cfg(not(feature = "std"))]
pub fn now_ns() -> u64 {
    crate::pr::rdtsc()
}

#[cfg(feature = "std")]
mod imp {
    use super::WaitResult;
    use core::sync::atomic::AtomicU32;
    use core::time::Duration;

    /// Linux futex syscall wrapper. Grounded directly in the original's
    /// `futex.c`, which calls the raw syscall rather than going through a
    /// libc wrapper (glibc has never exposed one).
    fn futex(
        addr: &AtomicU32,
        futex_op: libc::c_int,
        val: u32,
        timeout: *const libc::timespec,
    ) -> libc::c_long {
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                addr as *const AtomicU32 as *const u32,
                futex_op,
                val,
                timeout,
                core::ptr::null::<u32>(),
                0u32,
            )
        }
    }

    pub fn wait(addr: &AtomicU32, val: u32) {
        loop {
            if addr.load(core::sync::atomic::Ordering::SeqCst) != val {
                return;
            }
            let ret = futex(
                addr,
                libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
                val,
                core::ptr::null(),
            );
            if ret == 0 {
                return;
            }
            let errno = std::io::Error::last_os_error()
                .raw_os_error()
                .unwrap_or(0);
            // EAGAIN means *addr != val by the time the kernel looked; EINTR
            // is a spurious interruption. Both are simply retried or treated
            // as a return, matching "spurious wakes are tolerated by design".
            if errno == libc::EAGAIN {
                return;
            }
            // EINTR and anything else: loop and re-check the predicate.
        }
    }

    pub fn wait_timeout(addr: &AtomicU32, val: u32, timeout: Duration) -> WaitResult {
        if addr.load(core::sync::atomic::Ordering::SeqCst) != val {
            return WaitResult::Woken;
        }
        let ts = libc::timespec {
            tv_sec: timeout.as_secs() as libc::time_t,
            tv_nsec: timeout.subsec_nanos() as libc::c_long,
        };
        let ret = futex(
            addr,
            libc::FUTEX_WAIT | libc::FUTEX_PRIVATE_FLAG,
            val,
            &ts as *const _,
        );
        if ret == 0 {
            return WaitResult::Woken;
        }
        let errno = std::io::Error::last_os_error()
            .raw_os_error()
            .unwrap_or(0);
        if errno == libc::ETIMEDOUT {
            WaitResult::TimedOut
        } else {
            // EAGAIN, EINTR, or other: treat as a (possibly spurious) wake,
            // consistent with wait()'s no-timeout handling.
            WaitResult::Woken
        }
    }

    pub fn wake(addr: &AtomicU32, n: i32) {
        let _ = futex(
            addr,
            libc::FUTEX_WAKE | libc::FUTEX_PRIVATE_FLAG,
            n as u32,
            core::ptr::null(),
        );
    }
}

#[cfg(not(feature = "std"))]
mod imp {
    use super::WaitResult;
    use core::sync::atomic::{AtomicU32, Ordering};
    use core::time::Duration;

    /// No syscall available: spin until the predicate no longer holds. Never
    /// actually parks the thread, so callers still make progress, just
    /// without the OS's help.
    pub fn wait(addr: &AtomicU32, val: u32) {
        while addr.load(Ordering::SeqCst) == val {
            crate::pr::stall();
        }
    }

    pub fn wait_timeout(addr: &AtomicU32, val: u32, _timeout: Duration) -> WaitResult {
        // No clock source without std; degrade to an unbounded spin-wait.
        // Algorithms that rely on real timeouts (condvar timedwait) require
        // the `std` feature.
        wait(addr, val);
        WaitResult::Woken
    }

    pub fn wake(_addr: &AtomicU32, _n: i32) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::Ordering;

    #[test]
    fn wait_returns_immediately_if_value_already_differs() {
        let a = AtomicU32::new(5);
        wait(&a, 1);
    }

    #[cfg(feature = "std")]
    #[test]
    fn wait_timeout_elapses_without_a_wake() {
        let a = AtomicU32::new(1);
        let result = wait_timeout(&a, 1, Duration::from_millis(20));
        assert_eq!(result, WaitResult::TimedOut);
    }

    #[cfg(feature = "std")]
    #[test]
    fn wake_after_store_unblocks_waiter() {
        use std::sync::Arc;
        use std::thread;

        let a = Arc::new(AtomicU32::new(1));
        let a2 = a.clone();
        let handle = thread::spawn(move || {
            wait(&a2, 1);
        });
        thread::sleep(Duration::from_millis(10));
        a.store(0, Ordering::SeqCst);
        wake(&a, 1);
        handle.join().unwrap();
    }

    #[test]
    fn now_ns_is_monotonic() {
        let a = now_ns();
        let b = now_ns();
        assert!(b >= a);
    }
}
