//! The services the threading core consumes from the rest of the kernel.
//!
//! None of these are implemented here; the architecture layer, the IPC
//! layer and the process manager hand implementations to [`Threading::new()`].
//!
//! [`Threading::new()`]: crate::Threading::new

use thread_struct::{Context, ContextLevel, CoreId, PipeHandle, ProcessId, RunMode};

/// Where a freshly created context starts executing.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ContextEntry {
    /// The common kernel entry of every thread, which ends up in
    /// [`Threading::entry_trampoline()`](crate::Threading::entry_trampoline).
    Trampoline,
    /// An arbitrary code address, e.g. a user entry point or a signal handler.
    Address(usize),
    /// Nothing yet; the slot is reserved for later use.
    Dormant,
}

/// Architecture hooks.
pub trait Platform: Send + Sync {
    /// The id of the core the caller is executing on.
    fn current_core(&self) -> CoreId;

    /// Allocates a register context at the given level. `argument` is passed
    /// to the entry in the first argument register.
    fn create_context(&self, mode: RunMode, level: ContextLevel, entry: ContextEntry, argument: usize) -> Context;

    /// Frees a context created by [`create_context()`](Self::create_context).
    fn destroy_context(&self, context: Context);

    /// Enters the context switch path, which eventually calls
    /// [`Threading::switch()`](crate::Threading::switch).
    fn yield_now(&self);

    /// Sends an inter-processor interrupt to make `core` reschedule.
    fn wake_core(&self, core: CoreId);
}

/// The IPC layer.
pub trait PipeManager: Send + Sync {
    /// Creates a pipe holding `1 << capacity_class` entries.
    fn create_pipe(&self, capacity_class: usize) -> PipeHandle;
    fn destroy_pipe(&self, pipe: PipeHandle);
}

/// What the threading core needs to know about a process.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProcessInfo {
    /// The user signal handler, if the process installed one.
    pub signal_handler: Option<usize>,
    /// The address its main thread starts at.
    pub entry_point: usize,
}

/// The process manager.
pub trait ProcessTable: Send + Sync {
    fn get(&self, process: ProcessId) -> Option<ProcessInfo>;

    /// Tears the process down with the given exit code. The threading core
    /// terminates the process's threads itself.
    fn terminate(&self, process: ProcessId, code: i32);
}
