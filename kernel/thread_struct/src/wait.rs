//! Correlation keys for parking threads.

use super::ThreadId;

/// An opaque, comparable key that threads park on and wakers wake.
///
/// Tokens are derived from the stable identity of the object being
/// waited for, never from its address.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WaitToken(u64);

impl WaitToken {
    const KIND_SHIFT: u32 = 56;
    const THREAD: u64 = 1;
    const TRANSFER: u64 = 2;
    const GENERIC: u64 = 3;

    /// The token joiners of the given thread park on.
    pub const fn for_thread(id: ThreadId) -> WaitToken {
        WaitToken((Self::THREAD << Self::KIND_SHIFT) | (id.0 as u64 & 0x00FF_FFFF_FFFF_FFFF))
    }

    /// The token a submitter parks on until the given transfer of a host
    /// controller completes.
    pub const fn for_transfer(controller: u32, transfer: u32) -> WaitToken {
        WaitToken((Self::TRANSFER << Self::KIND_SHIFT) | ((controller as u64 & 0xFF_FFFF) << 32) | transfer as u64)
    }

    /// A token for anything else, keyed by a caller-chosen value.
    pub const fn generic(key: u32) -> WaitToken {
        WaitToken((Self::GENERIC << Self::KIND_SHIFT) | key as u64)
    }
}

/// Why a parked thread was made ready again.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WakeReason {
    /// Somebody woke the token it was parked on.
    Woken,
    /// Its timeout expired first.
    Timeout,
    /// It was forced awake, e.g. by a signal or a kill; its wait condition must be rechecked.
    Interrupted,
}
