//! This crate contains the basic [`Thread`] structure, which holds the
//! contextual execution states of one kernel thread.
//!
//! Creating, scheduling and destroying threads is the job of the
//! `threading` and `scheduler_priority` crates; this crate only defines
//! what a thread *is*, so that both of them can share it without
//! depending on each other.

#![no_std]

extern crate alloc;

mod signal;
mod space;
mod wait;

#[cfg(test)]
mod test;

use alloc::{string::String, sync::Arc, vec::Vec};
use bitflags::bitflags;
use core::fmt;
use sync_irq::{IrqSafeMutex, IrqSafeMutexGuard};

pub use signal::*;
pub use space::{AddressSpaceManager, MemorySpace, SpaceId, SpaceKind};
pub use wait::{WaitToken, WakeReason};

/// A unique, never reused thread identifier.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ThreadId(pub usize);

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies the process ("Ash") a thread is bound to.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ProcessId(pub usize);

impl fmt::Display for ProcessId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The id of a CPU core.
pub type CoreId = u8;

/// A handle to the IPC pipe owned by a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PipeHandle(pub usize);

/// The entry point of a thread. The returned value becomes its exit code.
pub type ThreadFunc = fn(usize) -> i32;

/// The privilege level a thread executes at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunMode {
    Kernel,
    Driver,
    User,
}

bitflags! {
    /// Attributes given to a thread at creation, plus the transient
    /// mode-transition markers set during its life.
    pub struct ThreadFlags: u32 {
        /// The per-core idle thread; never queued, never killed.
        const IDLE                = 1 << 0;
        /// Must only ever run on the core it was created on.
        const CPUBOUND            = 1 << 1;
        /// Shares the address space of its creator.
        const INHERIT             = 1 << 2;
        /// Runs its function through the kernel entry first, then switches level.
        const SWITCHMODE          = 1 << 3;
        /// The next switch to this thread must enter its user-level context.
        const TRANSITION_USERMODE = 1 << 4;
    }
}

/// The set of possible runstates that a [`Thread`] can be in.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Alive: running, ready, or parked.
    Runnable,
    /// Exited or killed; its return code is final but it may still be on a queue.
    Exited,
    /// Handed to the garbage collector; it will never be picked again.
    Reaped,
}

/// Where a thread currently sits in the scheduler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SchedState {
    /// Not known to any run queue.
    Unqueued,
    /// Waiting in a ready queue.
    Ready,
    /// Executing on the given core.
    Running(CoreId),
    /// Blocked until woken through a [`WaitToken`].
    Parked,
}

/// The context slots of a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextLevel {
    /// Kernel entry; starts at the thread entry trampoline.
    Level0,
    /// User entry; starts at the thread function in its own address space.
    Level1,
    /// Kernel signal delivery.
    Signal0,
    /// User signal delivery.
    Signal1,
}

impl ContextLevel {
    pub const COUNT: usize = 4;

    pub const fn index(self) -> usize {
        match self {
            ContextLevel::Level0 => 0,
            ContextLevel::Level1 => 1,
            ContextLevel::Signal0 => 2,
            ContextLevel::Signal1 => 3,
        }
    }
}

/// An architecture register context.
///
/// The threading core never looks inside a context; `frame` is whatever
/// the platform layer uses to find the saved state (usually the address
/// of the interrupt frame on the thread's stack).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Context {
    pub level: ContextLevel,
    pub frame: usize,
}

/// The mutable parts of a [`Thread`], guarded by its lock.
pub struct ThreadInner {
    pub parent_id: Option<ThreadId>,
    pub process_id: Option<ProcessId>,
    pub mode: RunMode,
    pub flags: ThreadFlags,
    pub runstate: RunState,
    pub sched: SchedState,
    /// The ready-queue level this thread is placed on; 0 is the highest.
    pub queue: usize,
    /// The time slice granted the last time this thread was picked.
    pub time_slice_ms: usize,
    pub return_code: i32,
    pub func: ThreadFunc,
    pub argument: usize,
    pub contexts: [Option<Context>; ContextLevel::COUNT],
    /// The context the thread resumes from; `None` if it never ran.
    pub active_context: Option<Context>,
    pub signals: SignalState,
    pub memory_space: Option<Arc<MemorySpace>>,
    pub pipe: Option<PipeHandle>,
    /// Set by whoever moved this thread out of the parked state.
    pub wake_reason: Option<WakeReason>,
}

impl ThreadInner {
    /// Returns the state of a freshly created thread that has not been queued yet.
    pub fn new(mode: RunMode, flags: ThreadFlags, func: ThreadFunc, argument: usize) -> ThreadInner {
        ThreadInner {
            parent_id: None,
            process_id: None,
            mode,
            flags,
            runstate: RunState::Runnable,
            sched: SchedState::Unqueued,
            queue: 0,
            time_slice_ms: 0,
            return_code: 0,
            func,
            argument,
            contexts: [None; ContextLevel::COUNT],
            active_context: None,
            signals: SignalState::default(),
            memory_space: None,
            pipe: None,
            wake_reason: None,
        }
    }

    pub fn context(&self, level: ContextLevel) -> Option<Context> {
        self.contexts[level.index()]
    }

    pub fn set_context(&mut self, context: Context) {
        self.contexts[context.level.index()] = Some(context);
    }

    /// Removes every context slot and returns what was installed.
    pub fn take_contexts(&mut self) -> Vec<Context> {
        self.contexts.iter_mut().filter_map(Option::take).collect()
    }

    /// Whether this thread has exited, whether or not it was reaped yet.
    pub fn is_finished(&self) -> bool {
        self.runstate != RunState::Runnable
    }

    pub fn is_idle(&self) -> bool {
        self.flags.contains(ThreadFlags::IDLE)
    }
}

/// A kernel thread.
///
/// The identity fields never change after creation and are readable
/// without locking; everything else lives in [`ThreadInner`].
pub struct Thread {
    id: ThreadId,
    name: String,
    core: CoreId,
    inner: IrqSafeMutex<ThreadInner>,
}

/// A shared reference to a [`Thread`].
pub type ThreadRef = Arc<Thread>;

impl Thread {
    pub fn new(id: ThreadId, name: String, core: CoreId, inner: ThreadInner) -> Thread {
        Thread { id, name, core, inner: IrqSafeMutex::new(inner) }
    }

    pub fn id(&self) -> ThreadId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The core whose run queue this thread lives on.
    pub fn core(&self) -> CoreId {
        self.core
    }

    /// Locks this thread's mutable state.
    pub fn lock(&self) -> IrqSafeMutexGuard<'_, ThreadInner> {
        self.inner.lock()
    }

    pub fn is_idle(&self) -> bool {
        self.inner.lock().is_idle()
    }

    pub fn is_finished(&self) -> bool {
        self.inner.lock().is_finished()
    }
}

impl fmt::Debug for Thread {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{thread \"{}\" ({})}}", self.name, self.id)
    }
}
