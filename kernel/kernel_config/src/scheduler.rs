//! Multilevel ready-queue parameters.

/// The number of priority levels per core. Level 0 is the highest.
pub const QUEUE_COUNT: usize = 5;

/// The level a newly created thread is queued at.
pub const DEFAULT_QUEUE: usize = 0;

/// The time slice of the highest level, in milliseconds.
pub const BASE_TIME_SLICE_MS: usize = 10;

/// Every level below the top adds this much to the time slice.
pub const TIME_SLICE_STEP_MS: usize = 5;

/// How many times a thread may be picked on one level before it is demoted,
/// indexed by level.
pub const TOKENS_PER_LEVEL: [usize; QUEUE_COUNT] = [8, 6, 4, 2, 1];

/// The number of `schedule` calls on a core between two priority boosts.
pub const BOOST_INTERVAL: usize = 200;

/// Returns the time slice given to a thread running at the given `level`.
pub const fn time_slice_ms(level: usize) -> usize {
    BASE_TIME_SLICE_MS + level * TIME_SLICE_STEP_MS
}
