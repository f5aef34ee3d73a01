//! Thread lifecycle management: creation, exit, kill, join and the deferred
//! cleanup of finished threads.
//!
//! A [`Threading`] instance owns the [`ThreadRegistry`], the [`Scheduler`]
//! and the per-core bookkeeping (idle thread and current thread). There is no
//! global state; the architecture layer keeps the `Arc<Threading>` it got from
//! [`Threading::new()`] and calls [`Threading::switch()`] from its timer and
//! yield paths.
//!
//! Every lock here is also taken from the timer interrupt, so they are all
//! [`sync_irq::IrqSafeMutex`]es. The architecture layer registers its
//! interrupt masking with [`sync_irq::register_interrupt_control()`] before
//! the first switch.
//!
//! Finished threads are never cleaned up on their own stack or in interrupt
//! context. The context switch hands them to a [`GarbageCollector`] and a
//! collector thread reaps them in [`Threading::collect_garbage()`].

#![no_std]

extern crate alloc;

mod gc;
mod platform;
mod registry;
mod signal;
mod switch;

#[cfg(test)]
mod test;

use alloc::{
    collections::BTreeMap,
    format,
    string::{String, ToString},
    sync::{Arc, Weak},
    vec::Vec,
};
use core::{
    fmt,
    sync::atomic::{AtomicUsize, Ordering},
};
use kernel_config::threading::{IDLE_THREAD_NAME, JOIN_FAILED, MAX_THREAD_NAME_LEN, PIPE_CAPACITY_CLASS};
use log::{debug, error, info, trace, warn};
use scheduler_priority::{AlreadyRunning, Parker, Scheduler};
use sync_irq::IrqSafeMutex;
use thread_struct::{
    AddressSpaceManager, Context, ContextLevel, CoreId, MemorySpace, ProcessId, RunMode, RunState, SpaceKind,
    Thread, ThreadFlags, ThreadFunc, ThreadId, ThreadInner, ThreadRef, WaitToken, WakeReason,
};

pub use gc::{GarbageCollector, GcId};
pub use platform::{ContextEntry, PipeManager, Platform, ProcessInfo, ProcessTable};
pub use registry::{RegistryError, ThreadRegistry};
pub use signal::SignalError;
pub use switch::SwitchOutcome;

/// Errors returned by the lifecycle operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadError {
    /// No thread with that id exists (or it was already cleaned up).
    NotFound,
    /// The operation is not allowed on an idle thread.
    IsIdle,
    /// The caller and the target belong to different processes.
    PermissionDenied,
    /// The calling core has no current thread, i.e. it was never enabled.
    NoCurrentThread,
}

impl fmt::Display for ThreadError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            ThreadError::NotFound => "no such thread",
            ThreadError::IsIdle => "idle threads cannot be modified",
            ThreadError::PermissionDenied => "target thread belongs to another process",
            ThreadError::NoCurrentThread => "this core has no current thread",
        };
        f.write_str(msg)
    }
}

struct CoreThreads {
    idle: ThreadRef,
    current: ThreadRef,
}

/// The threading core of the kernel.
pub struct Threading {
    platform: Arc<dyn Platform>,
    spaces: Arc<dyn AddressSpaceManager>,
    pipes: Arc<dyn PipeManager>,
    processes: Arc<dyn ProcessTable>,
    scheduler: Scheduler,
    registry: ThreadRegistry,
    cores: IrqSafeMutex<BTreeMap<CoreId, CoreThreads>>,
    /// The space shared by every kernel-mode thread.
    system_space: Arc<MemorySpace>,
    next_id: AtomicUsize,
    gc: GarbageCollector<ThreadRef>,
    reaper: GcId,
}

impl Threading {
    pub fn new(
        platform: Arc<dyn Platform>,
        spaces: Arc<dyn AddressSpaceManager>,
        pipes: Arc<dyn PipeManager>,
        processes: Arc<dyn ProcessTable>,
    ) -> Arc<Threading> {
        Arc::new_cyclic(|this: &Weak<Threading>| {
            let gc = GarbageCollector::new();
            let this = this.clone();
            let reaper = gc.register(move |thread: ThreadRef| {
                if let Some(threading) = this.upgrade() {
                    threading.cleanup(thread);
                }
            });
            let system_space = MemorySpace::create(spaces.clone(), SpaceKind::System);
            Threading {
                platform,
                spaces,
                pipes,
                processes,
                scheduler: Scheduler::new(),
                registry: ThreadRegistry::new(),
                cores: IrqSafeMutex::new(BTreeMap::new()),
                system_space,
                next_id: AtomicUsize::new(1),
                gc,
                reaper,
            }
        })
    }

    fn allocate_id(&self) -> ThreadId {
        ThreadId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register(&self, thread: &ThreadRef) {
        if let Err(e) = self.registry.register(thread.clone()) {
            // ids come from a monotonic counter, so this cannot happen
            panic!("BUG: failed to register thread {:?}: {}", thread, e);
        }
    }

    /// Brings up threading on `core`: creates its idle thread, which becomes
    /// the core's current thread (the boot flow of that core turns into it).
    pub fn enable_core(&self, core: CoreId) -> ThreadId {
        if let Some(existing) = self.cores.lock().get(&core) {
            warn!("enable_core(): core {} is already enabled", core);
            return existing.idle.id();
        }

        let mut inner = ThreadInner::new(RunMode::Kernel, ThreadFlags::IDLE | ThreadFlags::CPUBOUND, idle_loop, 0);
        inner.memory_space = Some(self.system_space.clone());
        let idle: ThreadRef = Arc::new(Thread::new(self.allocate_id(), IDLE_THREAD_NAME.to_string(), core, inner));
        self.register(&idle);
        self.scheduler.init_core(core);
        self.cores.lock().insert(core, CoreThreads { idle: idle.clone(), current: idle.clone() });
        info!("threading enabled on core {} (idle thread {})", core, idle.id());
        idle.id()
    }

    /// Creates a thread running `func(argument)` and queues it on the
    /// caller's core.
    ///
    /// Kernel threads share the system address space. Driver and user threads
    /// get a fresh service or application space, or share the creator's one
    /// when `flags` contains [`ThreadFlags::INHERIT`]; a thread with a fresh
    /// space also gets [`ThreadFlags::SWITCHMODE`].
    pub fn create(
        &self,
        name: Option<&str>,
        func: ThreadFunc,
        argument: usize,
        mode: RunMode,
        mut flags: ThreadFlags,
    ) -> ThreadId {
        let id = self.allocate_id();
        let name: String = match name {
            Some(name) => name.chars().take(MAX_THREAD_NAME_LEN).collect(),
            None => format!("Thread {}", id),
        };
        let creator = self.current_thread();
        let core = self.platform.current_core();

        if mode != RunMode::Kernel && !flags.contains(ThreadFlags::INHERIT) {
            flags |= ThreadFlags::SWITCHMODE;
        }
        // threads are never created idle
        flags.remove(ThreadFlags::IDLE);

        let mut inner = ThreadInner::new(mode, flags, func, argument);
        inner.queue = Scheduler::default_queue();
        let creator_space = match &creator {
            Some(creator) => {
                let c = creator.lock();
                inner.parent_id = Some(creator.id());
                inner.process_id = c.process_id;
                c.memory_space.clone()
            }
            None => None,
        };
        inner.memory_space = Some(match mode {
            RunMode::Kernel => self.system_space.clone(),
            _ if flags.contains(ThreadFlags::INHERIT) => creator_space.unwrap_or_else(|| self.system_space.clone()),
            RunMode::Driver => MemorySpace::create(self.spaces.clone(), SpaceKind::Service),
            RunMode::User => MemorySpace::create(self.spaces.clone(), SpaceKind::Application),
        });
        inner.set_context(self.platform.create_context(mode, ContextLevel::Level0, ContextEntry::Trampoline, 0));
        inner.set_context(self.platform.create_context(mode, ContextLevel::Signal0, ContextEntry::Dormant, 0));
        inner.pipe = Some(self.pipes.create_pipe(PIPE_CAPACITY_CLASS));

        let thread: ThreadRef = Arc::new(Thread::new(id, name, core, inner));
        debug!("created {:?} ({:?}, {:?}) on core {}", thread, mode, flags, core);
        self.register(&thread);
        self.scheduler.enqueue(&thread, None);
        id
    }

    /// The first code every created thread runs, entered through its
    /// [`ContextLevel::Level0`] context.
    ///
    /// Kernel threads (and threads that switch level on their own) run their
    /// function here and exit with its result. Other threads get their user
    /// contexts built and yield; the next switch to them enters user mode.
    pub fn entry_trampoline(&self) -> Result<(), ThreadError> {
        let thread = self.current_thread().ok_or(ThreadError::NoCurrentThread)?;
        let (mode, flags, func, argument) = {
            let t = thread.lock();
            (t.mode, t.flags, t.func, t.argument)
        };
        trace!("entry_trampoline(): {:?}", thread);

        if mode == RunMode::Kernel || flags.contains(ThreadFlags::SWITCHMODE) {
            let code = func(argument);
            return self.exit(code);
        }

        self.prepare_user_entry(&thread, ContextEntry::Address(func as usize), argument);
        self.platform.yield_now();
        Ok(())
    }

    /// Installs the user entry and user signal contexts and marks the thread
    /// for a level transition at its next switch.
    fn prepare_user_entry(&self, thread: &ThreadRef, entry: ContextEntry, argument: usize) {
        let mut t = thread.lock();
        let mode = t.mode;
        let level1 = self.platform.create_context(mode, ContextLevel::Level1, entry, argument);
        let signal1 = self.platform.create_context(mode, ContextLevel::Signal1, ContextEntry::Dormant, 0);
        self.install_context(&mut t, level1);
        self.install_context(&mut t, signal1);
        t.flags |= ThreadFlags::TRANSITION_USERMODE;
    }

    /// Puts `context` in its slot, freeing whatever was there before.
    fn install_context(&self, t: &mut ThreadInner, context: Context) {
        if let Some(old) = t.contexts[context.level.index()].replace(context) {
            if t.active_context == Some(old) {
                t.active_context = Some(context);
            }
            self.platform.destroy_context(old);
        }
    }

    /// Binds the calling thread to `process` and moves it to user level at
    /// the process's entry point.
    ///
    /// On hardware the caller never comes back from the yield at the end.
    pub fn switch_level(&self, process: ProcessId) -> Result<(), ThreadError> {
        let thread = self.current_thread().ok_or(ThreadError::NoCurrentThread)?;
        if thread.is_idle() {
            return Err(ThreadError::IsIdle);
        }
        let info = self.processes.get(process).ok_or(ThreadError::NotFound)?;
        thread.lock().process_id = Some(process);
        self.prepare_user_entry(&thread, ContextEntry::Address(info.entry_point), 0);
        self.platform.yield_now();
        Ok(())
    }

    /// Finishes the calling thread with `code`.
    ///
    /// Direct children of the caller are killed with the same code, joiners
    /// are woken, and the thread yields. The switch then hands it to the
    /// garbage collector; on hardware this call does not return.
    pub fn exit(&self, code: i32) -> Result<(), ThreadError> {
        let thread = self.current_thread().ok_or(ThreadError::NoCurrentThread)?;
        if thread.is_idle() {
            error!("BUG: exit() called on the idle thread of core {}", thread.core());
            return Err(ThreadError::IsIdle);
        }

        let children = self.collect_threads(|inner| inner.parent_id == Some(thread.id()) && !inner.is_idle());
        for child in children {
            if let Err(e) = self.kill(child, code, false) {
                warn!("exit(): failed to kill child {} of thread {}: {}", child, thread.id(), e);
            }
        }

        {
            let mut t = thread.lock();
            t.return_code = code;
            t.runstate = RunState::Exited;
        }
        debug!("{:?} exited with code {}", thread, code);
        self.scheduler.wake_all(WaitToken::for_thread(thread.id()));
        self.platform.yield_now();
        Ok(())
    }

    /// Marks thread `id` finished with `code` and wakes its joiners.
    ///
    /// With `terminate_instantly`, the target is also forced off the CPU: the
    /// caller yields if it killed itself, a parked target is interrupted, and
    /// a target running on another core gets that core kicked.
    pub fn kill(&self, id: ThreadId, code: i32, terminate_instantly: bool) -> Result<(), ThreadError> {
        let target = self.registry.find(id).ok_or(ThreadError::NotFound)?;
        {
            let mut t = target.lock();
            if t.is_idle() {
                return Err(ThreadError::IsIdle);
            }
            if t.runstate == RunState::Runnable {
                t.runstate = RunState::Exited;
                t.return_code = code;
            }
        }
        self.scheduler.wake_all(WaitToken::for_thread(id));

        if terminate_instantly {
            if self.current_thread_id() == Some(id) {
                self.platform.yield_now();
            } else if let Err(AlreadyRunning(core)) = self.scheduler.signal_thread(&target) {
                trace!("kill(): thread {} is running on core {}, kicking it", id, core);
                self.platform.wake_core(core);
            }
        }
        Ok(())
    }

    /// Makes thread `id` detached: it no longer dies with its parent.
    /// Only threads of the caller's own process can be detached.
    pub fn detach(&self, id: ThreadId) -> Result<(), ThreadError> {
        let caller = self.current_thread().ok_or(ThreadError::NoCurrentThread)?;
        let process = caller.lock().process_id;
        let target = self.registry.find(id).ok_or(ThreadError::NotFound)?;
        let mut t = target.lock();
        if t.process_id != process {
            return Err(ThreadError::PermissionDenied);
        }
        t.parent_id = None;
        Ok(())
    }

    /// Waits until thread `id` has finished and returns its exit code, or
    /// [`JOIN_FAILED`] if there is no such thread.
    pub fn join(&self, id: ThreadId) -> i32 {
        self.join_timeout(id, 0)
    }

    /// Like [`join()`](Self::join), but gives up with [`JOIN_FAILED`] after
    /// `timeout_ms`. A timeout of 0 waits forever.
    pub fn join_timeout(&self, id: ThreadId, timeout_ms: u64) -> i32 {
        let Some(target) = self.registry.find(id) else {
            return JOIN_FAILED;
        };
        let token = WaitToken::for_thread(id);
        while !target.is_finished() {
            match self.park_current(token, timeout_ms, &|| target.is_finished()) {
                Ok(WakeReason::Timeout) => return JOIN_FAILED,
                Ok(_) => {}
                Err(e) => {
                    warn!("join(): cannot wait for thread {}: {}", id, e);
                    return JOIN_FAILED;
                }
            }
        }
        let code = target.lock().return_code;
        code
    }

    /// Kills every thread of `process`, except detached ones unless
    /// `terminate_detached` is set.
    ///
    /// Returns how many threads were left alive, not counting the caller.
    pub fn terminate_all_for_process(&self, process: ProcessId, terminate_detached: bool, terminate_instantly: bool) -> usize {
        self.terminate_threads(process, 0, terminate_detached, terminate_instantly)
    }

    fn terminate_threads(&self, process: ProcessId, code: i32, terminate_detached: bool, terminate_instantly: bool) -> usize {
        let current = self.current_thread_id();
        let mut members: Vec<(ThreadId, bool)> = Vec::new();
        self.registry.for_each(|t| {
            let inner = t.lock();
            if inner.process_id == Some(process) && !inner.is_finished() {
                members.push((t.id(), inner.parent_id.is_none()));
            }
        });
        // the caller goes last, killing it instantly does not come back
        members.sort_by_key(|(id, _)| Some(*id) == current);

        let mut not_killed = 0;
        for (id, detached) in members {
            if detached && !terminate_detached {
                if Some(id) != current {
                    not_killed += 1;
                }
            } else if let Err(e) = self.kill(id, code, terminate_instantly) {
                warn!("terminate_all_for_process(): failed to kill thread {}: {}", id, e);
            }
        }
        not_killed
    }

    /// Releases everything a finished thread owns. Runs only from the
    /// garbage collector, never on the thread's own stack.
    fn cleanup(&self, thread: ThreadRef) {
        trace!("cleaning up {:?}", thread);
        self.scheduler.wake_all(WaitToken::for_thread(thread.id()));
        self.scheduler.dequeue(&thread);
        self.registry.unregister(thread.id());

        let (contexts, space, pipe) = {
            let mut t = thread.lock();
            t.signals.clear();
            t.active_context = None;
            (t.take_contexts(), t.memory_space.take(), t.pipe.take())
        };
        for context in contexts {
            self.platform.destroy_context(context);
        }
        // the space itself is released when its last sharer lets go
        drop(space);
        if let Some(pipe) = pipe {
            self.pipes.destroy_pipe(pipe);
        }
    }

    /// Reaps the threads handed to the garbage collector so far. Called by
    /// the collector thread; returns how many threads were cleaned up.
    pub fn collect_garbage(&self) -> usize {
        self.gc.process_pending()
    }

    /// Advances the scheduler clock of the calling core, waking timed-out waiters.
    pub fn tick(&self, elapsed_ms: u64) -> usize {
        self.scheduler.tick(self.platform.current_core(), elapsed_ms)
    }

    pub fn current_thread(&self) -> Option<ThreadRef> {
        let core = self.platform.current_core();
        self.cores.lock().get(&core).map(|c| c.current.clone())
    }

    pub fn current_thread_id(&self) -> Option<ThreadId> {
        self.current_thread().map(|t| t.id())
    }

    /// Whether `core` is running its idle thread.
    pub fn is_current_idle(&self, core: CoreId) -> bool {
        self.cores.lock().get(&core).map_or(false, |c| Arc::ptr_eq(&c.idle, &c.current))
    }

    /// The run mode of the calling thread; kernel mode before threading is enabled.
    pub fn current_mode(&self) -> RunMode {
        self.current_thread().map_or(RunMode::Kernel, |t| t.lock().mode)
    }

    pub fn get_thread(&self, id: ThreadId) -> Option<ThreadRef> {
        self.registry.find(id)
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Logs every thread that has not finished.
    pub fn debug_dump(&self) {
        self.registry.for_each(|thread| {
            let t = thread.lock();
            if !t.is_finished() {
                info!(
                    "Thread {} ({}) - Flags {:?}, Queue {}, Timeslice {}, Cpu: {}",
                    thread.id(),
                    thread.name(),
                    t.flags,
                    t.queue,
                    t.time_slice_ms,
                    thread.core()
                );
            }
        });
    }

    /// Returns the ids of the registered threads matching `filter`.
    fn collect_threads<F: Fn(&ThreadInner) -> bool>(&self, filter: F) -> Vec<ThreadId> {
        let mut ids = Vec::new();
        self.registry.for_each(|t| {
            if filter(&t.lock()) {
                ids.push(t.id());
            }
        });
        ids
    }

    fn idle_thread(&self, core: CoreId) -> Option<ThreadRef> {
        self.cores.lock().get(&core).map(|c| c.idle.clone())
    }

    fn set_current(&self, core: CoreId, thread: ThreadRef) {
        if let Some(c) = self.cores.lock().get_mut(&core) {
            c.current = thread;
        }
    }

    /// Parks the calling thread on `token` unless `done()` holds, then yields.
    fn park_current(&self, token: WaitToken, timeout_ms: u64, done: &dyn Fn() -> bool) -> Result<WakeReason, ThreadError> {
        let thread = self.current_thread().ok_or(ThreadError::NoCurrentThread)?;
        if thread.is_idle() {
            return Err(ThreadError::IsIdle);
        }
        if !self.scheduler.sleep_unless(&thread, token, timeout_ms, done) {
            return Ok(WakeReason::Woken);
        }
        self.platform.yield_now();
        // still parked means we were resumed without a wake; treat it as spurious
        let reason = thread.lock().wake_reason.take();
        Ok(reason.unwrap_or(WakeReason::Interrupted))
    }
}

impl Parker for Threading {
    fn park_until(&self, token: WaitToken, timeout_ms: u64, done: &dyn Fn() -> bool) -> WakeReason {
        match self.park_current(token, timeout_ms, done) {
            Ok(reason) => reason,
            Err(e) => {
                error!("BUG: park_until({:?}) outside of a parkable thread: {}", token, e);
                WakeReason::Interrupted
            }
        }
    }

    fn wake_one(&self, token: WaitToken) -> bool {
        self.scheduler.wake_one(token)
    }

    fn wake_all(&self, token: WaitToken) -> usize {
        self.scheduler.wake_all(token)
    }
}

/// The function of every idle thread; never actually called, the idle
/// thread runs the boot flow of its core.
fn idle_loop(_: usize) -> i32 {
    0
}
