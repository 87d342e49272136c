//! Error taxonomy for lock and condvar operations.
//!
//! Every fallible entry point in this crate returns [`LockError`] rather than
//! panicking, with two exceptions the interposition layer itself enforces by
//! process exit: a descriptor that doesn't fit in the platform's opaque lock
//! object, and a thread-ID space that has been exhausted. Both indicate the
//! binary was built with the wrong limits for its workload rather than a
//! per-call failure, so they are not worth recovering from.

use core::fmt;

/// Kinds of failure a lock or condvar operation can report.
#[derive(Debug)]
pub enum LockError {
    /// The in-band descriptor this crate wants to embed in a platform lock
    /// object does not fit inside it. Fatal; raised only from the
    /// interposition layer's init path.
    BuildMismatch {
        /// Size of the descriptor this crate needed to embed.
        needed: usize,
        /// Size of the platform object it was asked to embed into.
        available: usize,
    },
    /// The process-global thread-ID counter has exceeded the build-time
    /// maximum thread count. Fatal.
    ResourceExhausted {
        /// The configured maximum number of threads.
        limit: usize,
    },
    /// The entry point called does not exist for the algorithm selected at
    /// build time (for example, a condvar operation against an algorithm
    /// with no condvar support, or a timed lock against any algorithm).
    Unsupported(&'static str),
    /// `try_acquire` observed a held lock.
    Busy,
    /// `cond_timedwait` reached its deadline without being signaled.
    Timeout,
    /// An underlying wait-primitive call reported an error other than a
    /// spurious wake (e.g. an interrupted syscall). Algorithms retry these
    /// internally; this variant exists for paths that choose to surface it.
    External(&'static str),
}

impl fmt::Display for LockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockError::BuildMismatch { needed, available } => write!(
                f,
                "lock descriptor of {needed} bytes does not fit in {available}-byte platform object"
            ),
            LockError::ResourceExhausted { limit } => {
                write!(f, "thread-ID space exhausted (limit {limit})")
            }
            LockError::Unsupported(what) => write!(f, "unsupported: {what}"),
            LockError::Busy => write!(f, "lock is busy"),
            LockError::Timeout => write!(f, "timed out waiting on condition variable"),
            LockError::External(what) => write!(f, "external wait error: {what}"),
        }
    }
}

impl core::error::Error for LockError {}

/// Result of `try_acquire`: distinguishes "acquired" from "busy" without
/// forcing callers who don't care about the reason to match on `LockError`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryAcquireOutcome {
    /// The lock was free and is now held by the caller.
    Acquired,
    /// The lock was held by someone else; the caller holds nothing.
    Busy,
}

/// Result of `cond_timedwait`: distinguishes "woke due to signal" from
/// "woke due to deadline".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimedWaitOutcome {
    /// The condition variable was signaled before the deadline.
    Signaled,
    /// The deadline elapsed with no signal observed.
    TimedOut,
}

/// A [`Result`] alias fixing the error type to [`LockError`].
pub type LockResult<T> = Result<T, LockError>;

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::ToString;

    #[test]
    fn display_messages_are_non_empty() {
        let errs = [
            LockError::BuildMismatch {
                needed: 40,
                available: 32,
            },
            LockError::ResourceExhausted { limit: 1024 },
            LockError::Unsupported("timed mutex lock"),
            LockError::Busy,
            LockError::Timeout,
            LockError::External("interrupted"),
        ];
        for e in errs {
            assert!(!e.to_string().is_empty());
        }
    }

    #[test]
    fn outcomes_are_plain_copy_enums() {
        let a = TryAcquireOutcome::Acquired;
        let b = a;
        assert_eq!(a, b);
        let t = TimedWaitOutcome::TimedOut;
        assert_ne!(t, TimedWaitOutcome::Signaled);
    }
}
