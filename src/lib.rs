//! # uslock
//!
//! A userspace mutual-exclusion library offering a family of interchangeable
//! lock algorithms behind one uniform contract ([`facade::Lock`]/
//! [`facade::Cond`]), together with a companion condition-variable primitive
//! and, on `unix` with the `interpose` feature, a shim that transparently
//! substitutes these locks in place of the platform's pthread mutex/condvar/
//! spinlock/rwlock entry points in unmodified applications.
//!
//! ## Module organization
//!
//! ### Foundation
//! - [`error`] - the shared `LockError` taxonomy
//! - [`config`] - build-time tuning knobs (`Limits`)
//!
//! ### Core primitives
//! - [`pr`] - atomic operations, memory barriers, and the TSC/Instant clock
//! - [`backoff`] - exponential and proportional back-off for spin loops
//! - [`wait`] - address-based futex wait/wake primitives
//! - [`threadctx`] - dense per-thread IDs and per-thread slot registries
//! - [`condvar`] - the shared seq/target condition-variable pattern
//!
//! ### Lock algorithms
//! - [`tas`] - test-and-set spinlock
//! - [`ticket`] - ticket lock with proportional back-off
//! - [`futex_mutex`] - wait-address ("futex") mutex
//! - [`spin_park`] - spin-then-park mutex
//! - [`mcs`] - MCS queue lock
//! - [`mcs_block`] - blocking MCS (parks instead of spinning)
//! - [`clh`] - CLH lock and its atomic-head variant
//! - [`mcs_tp`] - time-published MCS with patience-based abandonment
//! - [`mcs_tas`] - MCS queue gating a test-and-set byte
//! - [`hybridlock`] - MCS/CLH/ticket × wait-address phase-switching hybrid
//! - [`flex`] - `flexguard` and `hybridv2`, blocking-signal-gated MCS hybrids
//! - [`uscl`] - proportional-share fair lock
//! - [`extend`] - timeslice-extension hook and the `spin-extend` build variant
//!
//! ### Ambient / cross-cutting
//! - [`preempt`] - preemption-monitor interface consumed by the hybrids
//! - [`facade`] - the uniform `Lock`/`Cond` façade selecting one algorithm
//!   at build time
//! - [`interpose`] - the pthread interposition shim (`interpose` feature,
//!   `unix` only)

#![cfg_attr(not(feature = "std"), no_std)]
#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![allow(clippy::module_inception)]

extern crate alloc;

// =============================================================================
// Foundation
// =============================================================================

/// Error taxonomy for lock and condvar operations.
pub mod error;

/// Build-time configuration (`Limits`) shared by the façade and the
/// algorithms that need instance-sized arenas or per-instance tuning.
pub mod config;

// =============================================================================
// Core primitives
// =============================================================================

/// Atomic primitives, memory barriers, and the cycle/wall-clock timestamp
/// read.
pub mod pr;

/// Exponential and proportional back-off for contention management.
pub mod backoff;

/// Address-based wait/wake primitives (futex wrappers).
pub mod wait;

/// Per-thread identity and per-thread slot registries.
#[cfg(feature = "std")]
pub mod threadctx;

/// The seq/target condition-variable pattern shared by nearly every
/// algorithm in this crate.
pub mod condvar;

// =============================================================================
// Lock algorithms
// =============================================================================

/// Test-and-set spinlock.
pub mod tas;

/// Ticket lock.
pub mod ticket;

/// Wait-address ("futex") mutex.
pub mod futex_mutex;

/// Spin-then-park mutex.
pub mod spin_park;

/// MCS queue lock.
#[cfg(feature = "std")]
pub mod mcs;

/// Blocking MCS queue lock.
#[cfg(feature = "std")]
pub mod mcs_block;

/// CLH lock and its atomic-head variant.
#[cfg(feature = "std")]
pub mod clh;

/// Time-published MCS with patience-based abandonment.
#[cfg(feature = "std")]
pub mod mcs_tp;

/// MCS queue gating a test-and-set byte.
#[cfg(feature = "std")]
pub mod mcs_tas;

/// `hybridlock`: MCS/CLH/ticket × wait-address phase-switching hybrid.
#[cfg(feature = "std")]
pub mod hybridlock;

/// `flexguard` and `hybridv2`: blocking-signal-gated MCS hybrids.
#[cfg(feature = "std")]
pub mod flex;

/// `u-scl`: proportional-share fair lock.
#[cfg(feature = "std")]
pub mod uscl;

/// Timeslice-extension hook and the `spin-extend` build variant.
pub mod extend;

// =============================================================================
// Ambient / cross-cutting
// =============================================================================

/// Preemption-monitor interface consumed by the hybrid lock algorithms.
#[cfg(feature = "std")]
pub mod preempt;

/// The uniform lock façade: one `Lock`/`Cond` pair selected at build time.
pub mod facade;

/// The pthread interposition shim.
#[cfg(all(feature = "interpose", unix))]
pub mod interpose;

// =============================================================================
// Re-exports for convenience
// =============================================================================

pub use error::{LockError, LockResult, TimedWaitOutcome, TryAcquireOutcome};
pub use facade::{Cond, Lock, LockGuard};
