//! Build-time configuration shared by the facade and the algorithms that
//! need compile-time-sized arenas or per-instance tuning.
//!
//! The original library expresses these as preprocessor constants
//! (`MAX_NUMBER_THREADS`, `PATIENCE`, `FAIRLOCK_GRANULARITY`, ...). Most
//! carry over unchanged as `const` defaults; the ones flagged by an open
//! design question (MCS-TP's patience and max critical-section time) are
//! promoted to per-instance fields instead of being baked in globally.

/// Process-wide and per-algorithm tuning knobs.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    /// Maximum number of distinct threads that may ever call into a lock.
    /// Bounds the thread-ID space and the size of any per-thread arena.
    pub max_threads: usize,
    /// Maximum number of distinct locks the interposition layer will track
    /// simultaneously.
    pub max_locks: usize,
    /// Spin-then-park's pre-park spin bound (4.C.5).
    pub spin_then_park_bound: u32,
    /// MCS-TP's default patience, in abandon-check retries (4.C.9).
    pub mcs_tp_patience: u32,
    /// MCS-TP's default "holder looks stalled" threshold, in TSC ticks.
    pub mcs_tp_max_cs_time: u64,
    /// u-scl's published slice length, in nanoseconds.
    pub uscl_slice_ns: u64,
    /// u-scl's ban-sleep granularity, in microseconds.
    pub uscl_sleep_granularity_us: u64,
}

impl Limits {
    /// The defaults matching the original headers' constants.
    pub const fn default_const() -> Self {
        Self {
            max_threads: 1024,
            max_locks: 1 << 16,
            spin_then_park_bound: 2700,
            mcs_tp_patience: 50,
            mcs_tp_max_cs_time: 10_000,
            uscl_slice_ns: 2_000_000,
            uscl_sleep_granularity_us: 8,
        }
    }
}

impl Default for Limits {
    fn default() -> Self {
        Self::default_const()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_original_constants() {
        let l = Limits::default();
        assert_eq!(l.max_threads, 1024);
        assert_eq!(l.spin_then_park_bound, 2700);
        assert_eq!(l.mcs_tp_patience, 50);
    }

    #[test]
    fn can_override_per_instance() {
        let l = Limits {
            mcs_tp_patience: 8,
            ..Limits::default()
        };
        assert_eq!(l.mcs_tp_patience, 8);
        assert_eq!(l.max_threads, 1024);
    }
}
