//! Thread lifecycle parameters.

/// Capacity class of the pipe created for each thread: `1 << 6` = 64 entries.
pub const PIPE_CAPACITY_CLASS: usize = 6;

/// The value `join` returns when the target thread does not exist.
pub const JOIN_FAILED: i32 = -1;

/// Thread names longer than this are truncated.
pub const MAX_THREAD_NAME_LEN: usize = 64;

/// The name of every per-core idle thread.
pub const IDLE_THREAD_NAME: &str = "idle";
