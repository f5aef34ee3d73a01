//! Lifecycle, switch and signal tests against a scripted platform.

extern crate std;

use super::*;
use alloc::{boxed::Box, format, string::ToString};
use core::{cell::Cell, sync::atomic::AtomicU8};
use spin::Mutex;
use thread_struct::{PipeHandle, SchedState, SignalClass, SpaceId, NUM_SIGNALS, SIGKILL, SIGSTOP, SIGUSR1, SIGUSR2};

type Hook = Box<dyn FnOnce() + Send>;

#[derive(Default)]
struct MockPlatform {
    core: AtomicU8,
    next_frame: AtomicUsize,
    created: Mutex<Vec<(Context, ContextEntry, usize)>>,
    destroyed: Mutex<Vec<Context>>,
    yields: AtomicUsize,
    kicked: Mutex<Vec<CoreId>>,
    hook: Mutex<Option<Hook>>,
}

impl MockPlatform {
    /// Runs `hook` the next time a thread yields.
    fn on_yield<F: FnOnce() + Send + 'static>(&self, hook: F) {
        *self.hook.lock() = Some(Box::new(hook));
    }

    fn set_core(&self, core: CoreId) {
        self.core.store(core, Ordering::SeqCst);
    }

    fn entry_of(&self, context: Context) -> Option<(ContextEntry, usize)> {
        self.created.lock().iter().find(|(c, ..)| *c == context).map(|(_, e, a)| (*e, *a))
    }
}

impl Platform for MockPlatform {
    fn current_core(&self) -> CoreId {
        self.core.load(Ordering::SeqCst)
    }

    fn create_context(&self, _mode: RunMode, level: ContextLevel, entry: ContextEntry, argument: usize) -> Context {
        let frame = 0x1000 * (self.next_frame.fetch_add(1, Ordering::SeqCst) + 1);
        let context = Context { level, frame };
        self.created.lock().push((context, entry, argument));
        context
    }

    fn destroy_context(&self, context: Context) {
        self.destroyed.lock().push(context);
    }

    fn yield_now(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
        let hook = self.hook.lock().take();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn wake_core(&self, core: CoreId) {
        self.kicked.lock().push(core);
    }
}

#[derive(Default)]
struct MockSpaces {
    created: Mutex<Vec<(SpaceId, SpaceKind)>>,
    released: Mutex<Vec<SpaceId>>,
}

impl AddressSpaceManager for MockSpaces {
    fn create_space(&self, kind: SpaceKind) -> SpaceId {
        let mut created = self.created.lock();
        let id = SpaceId(created.len() + 1);
        created.push((id, kind));
        id
    }

    fn release_space(&self, space: SpaceId) {
        self.released.lock().push(space);
    }
}

#[derive(Default)]
struct MockPipes {
    next: AtomicUsize,
    destroyed: Mutex<Vec<PipeHandle>>,
}

impl PipeManager for MockPipes {
    fn create_pipe(&self, capacity_class: usize) -> PipeHandle {
        assert_eq!(capacity_class, PIPE_CAPACITY_CLASS);
        PipeHandle(self.next.fetch_add(1, Ordering::SeqCst) + 1)
    }

    fn destroy_pipe(&self, pipe: PipeHandle) {
        self.destroyed.lock().push(pipe);
    }
}

#[derive(Default)]
struct MockProcesses {
    processes: Mutex<BTreeMap<ProcessId, ProcessInfo>>,
    terminated: Mutex<Vec<(ProcessId, i32)>>,
}

impl ProcessTable for MockProcesses {
    fn get(&self, process: ProcessId) -> Option<ProcessInfo> {
        self.processes.lock().get(&process).copied()
    }

    fn terminate(&self, process: ProcessId, code: i32) {
        self.terminated.lock().push((process, code));
    }
}

struct Harness {
    threading: Arc<Threading>,
    platform: Arc<MockPlatform>,
    spaces: Arc<MockSpaces>,
    pipes: Arc<MockPipes>,
    processes: Arc<MockProcesses>,
    idle: ThreadId,
}

fn harness() -> Harness {
    let platform = Arc::new(MockPlatform::default());
    let spaces = Arc::new(MockSpaces::default());
    let pipes = Arc::new(MockPipes::default());
    let processes = Arc::new(MockProcesses::default());
    let threading = Threading::new(platform.clone(), spaces.clone(), pipes.clone(), processes.clone());
    let idle = threading.enable_core(0);
    Harness { threading, platform, spaces, pipes, processes, idle }
}

fn returns_zero(_: usize) -> i32 {
    0
}

fn returns_argument(argument: usize) -> i32 {
    argument as i32
}

fn kernel_thread(h: &Harness, name: &str) -> ThreadId {
    h.threading.create(Some(name), returns_zero, 0, RunMode::Kernel, ThreadFlags::empty())
}

/// Switches until `id` is the current thread of the harness core.
fn run(h: &Harness, id: ThreadId) {
    for _ in 0..16 {
        if h.threading.current_thread_id() == Some(id) {
            return;
        }
        h.threading.switch(Context { level: ContextLevel::Level0, frame: 0 }, false).unwrap();
    }
    panic!("thread {} never got scheduled", id);
}

fn preempt(h: &Harness) -> SwitchOutcome {
    h.threading.switch(Context { level: ContextLevel::Level0, frame: 0xAAAA }, true).unwrap()
}

#[test]
fn create_registers_queues_and_names() {
    let h = harness();
    let a = h.threading.create(None, returns_zero, 0, RunMode::Kernel, ThreadFlags::empty());
    let b = kernel_thread(&h, "worker");
    assert!(b.0 > a.0 && a.0 > h.idle.0);

    let thread = h.threading.get_thread(a).unwrap();
    assert_eq!(thread.name(), format!("Thread {}", a.0));
    assert_eq!(h.threading.get_thread(b).unwrap().name(), "worker");

    let t = thread.lock();
    assert_eq!(t.sched, SchedState::Ready);
    assert_eq!(t.parent_id, Some(h.idle));
    assert!(t.context(ContextLevel::Level0).is_some());
    assert!(t.context(ContextLevel::Signal0).is_some());
    assert!(t.context(ContextLevel::Level1).is_none());
    assert!(t.pipe.is_some());
    assert_eq!(t.memory_space.as_ref().unwrap().kind(), SpaceKind::System);
    assert!(!t.flags.contains(ThreadFlags::SWITCHMODE));
    let level0 = t.context(ContextLevel::Level0).unwrap();
    assert_eq!(h.platform.entry_of(level0), Some((ContextEntry::Trampoline, 0)));
    drop(t);

    assert_eq!(h.threading.scheduler().ready_count(0), 2);
    // only the system space exists so far
    assert_eq!(h.spaces.created.lock().len(), 1);
}

#[test]
fn address_space_policy_follows_mode_and_inherit() {
    let h = harness();
    let driver = h.threading.create(Some("drv"), returns_zero, 0, RunMode::Driver, ThreadFlags::empty());
    let user = h.threading.create(Some("app"), returns_zero, 0, RunMode::User, ThreadFlags::empty());

    let space_of = |id: ThreadId| h.threading.get_thread(id).unwrap().lock().memory_space.clone().unwrap();
    assert_eq!(space_of(driver).kind(), SpaceKind::Service);
    assert_eq!(space_of(user).kind(), SpaceKind::Application);
    assert!(h.threading.get_thread(user).unwrap().lock().flags.contains(ThreadFlags::SWITCHMODE));

    // a thread created by the user thread with INHERIT shares its space
    run(&h, user);
    let child = h.threading.create(None, returns_zero, 0, RunMode::User, ThreadFlags::INHERIT);
    assert!(Arc::ptr_eq(&space_of(child), &space_of(user)));
    let c = h.threading.get_thread(child).unwrap();
    assert!(!c.lock().flags.contains(ThreadFlags::SWITCHMODE));
    assert_eq!(c.lock().parent_id, Some(user));
}

#[test]
fn exited_thread_is_joined_then_reaped() {
    let h = harness();
    let a = h.threading.create(Some("a"), returns_argument, 42, RunMode::Kernel, ThreadFlags::empty());
    run(&h, a);
    assert!(!h.threading.is_current_idle(0));

    h.threading.entry_trampoline().unwrap();
    let thread = h.threading.get_thread(a).unwrap();
    assert!(thread.is_finished());
    assert_eq!(h.platform.yields.load(Ordering::SeqCst), 1);

    // the switch away from the finished thread lands on idle and queues the reap
    let outcome = preempt(&h);
    assert!(outcome.idle);
    assert_eq!(outcome.thread, h.idle);
    assert_eq!(outcome.time_slice_ms, 0);
    assert!(h.threading.is_current_idle(0));
    assert_eq!(thread.lock().runstate, RunState::Reaped);

    // finished but not yet collected: join does not block
    assert_eq!(h.threading.join(a), 42);
    assert!(h.threading.get_thread(a).is_some());

    assert_eq!(h.threading.collect_garbage(), 1);
    assert!(h.threading.get_thread(a).is_none());
    assert_eq!(h.threading.join(a), JOIN_FAILED);
    assert_eq!(h.pipes.destroyed.lock().len(), 1);
    assert!(thread.lock().contexts.iter().all(Option::is_none));
    assert_eq!(h.platform.destroyed.lock().len(), 2);
}

#[test]
fn reaping_the_last_sharer_releases_its_space() {
    let h = harness();
    let driver = h.threading.create(Some("drv"), returns_zero, 0, RunMode::Driver, ThreadFlags::empty());
    h.threading.kill(driver, 0, false).unwrap();
    assert!(preempt(&h).idle);
    assert!(h.spaces.released.lock().is_empty());

    assert_eq!(h.threading.collect_garbage(), 1);
    assert_eq!(*h.spaces.released.lock(), [SpaceId(2)]);
}

#[test]
fn join_blocks_until_the_target_finishes() {
    let h = harness();
    let joiner = kernel_thread(&h, "joiner");
    let target = kernel_thread(&h, "target");
    run(&h, joiner);

    let threading = h.threading.clone();
    h.platform.on_yield(move || {
        threading.kill(target, 7, false).unwrap();
    });
    assert_eq!(h.threading.join(target), 7);

    let j = h.threading.get_thread(joiner).unwrap();
    assert_eq!(j.lock().sched, SchedState::Ready);
    // woken from a blocking wait, so it rose from the default level
    assert_eq!(j.lock().queue, 0);
    assert_eq!(h.threading.scheduler().parked_on(joiner), None);
}

#[test]
fn join_times_out() {
    let h = harness();
    let joiner = kernel_thread(&h, "joiner");
    let target = kernel_thread(&h, "target");
    run(&h, joiner);

    let threading = h.threading.clone();
    h.platform.on_yield(move || {
        threading.tick(50);
    });
    assert_eq!(h.threading.join_timeout(target, 30), JOIN_FAILED);
    assert!(!h.threading.get_thread(target).unwrap().is_finished());
}

#[test]
fn kill_reports_errors_and_kicks_remote_cores() {
    let h = harness();
    assert_eq!(h.threading.kill(ThreadId(999), 1, false), Err(ThreadError::NotFound));
    assert_eq!(h.threading.kill(h.idle, 1, true), Err(ThreadError::IsIdle));

    let remote = kernel_thread(&h, "remote");
    run(&h, remote);

    // now look at it from core 1, where it is not the current thread
    h.threading.enable_core(1);
    h.platform.set_core(1);
    h.threading.kill(remote, 5, true).unwrap();
    assert_eq!(*h.platform.kicked.lock(), [0]);
    let t = h.threading.get_thread(remote).unwrap();
    assert!(t.is_finished());
    assert_eq!(t.lock().return_code, 5);

    // a second kill keeps the first code
    h.threading.kill(remote, 6, false).unwrap();
    assert_eq!(t.lock().return_code, 5);
}

#[test]
fn killing_a_parked_thread_interrupts_its_wait() {
    let h = harness();
    h.threading.enable_core(1);
    let sleeper = kernel_thread(&h, "sleeper");
    let other = kernel_thread(&h, "other");
    run(&h, sleeper);

    // the kill comes from core 1 while the sleeper is parked
    let threading = h.threading.clone();
    let platform = h.platform.clone();
    h.platform.on_yield(move || {
        platform.set_core(1);
        threading.kill(sleeper, 3, true).unwrap();
        platform.set_core(0);
    });
    let reason = h.threading.park_until(WaitToken::generic(11), 0, &|| false);
    assert_eq!(reason, WakeReason::Interrupted);
    let t = h.threading.get_thread(sleeper).unwrap();
    assert_eq!(t.lock().sched, SchedState::Ready);
    assert!(t.is_finished());
    assert!(h.platform.kicked.lock().is_empty());

    // the killed thread is skipped and reaped by the next switches
    assert_eq!(preempt(&h).thread, other);
    h.threading.kill(other, 0, false).unwrap();
    assert!(preempt(&h).idle);
    assert_eq!(h.threading.collect_garbage(), 2);
    assert!(h.threading.get_thread(sleeper).is_none());
    assert!(h.threading.get_thread(other).is_none());
}

#[test]
fn exit_kills_direct_children_only() {
    let h = harness();
    let parent = kernel_thread(&h, "parent");
    let unrelated = kernel_thread(&h, "unrelated");
    run(&h, parent);
    let child = kernel_thread(&h, "child");

    h.threading.exit(3).unwrap();
    let child = h.threading.get_thread(child).unwrap();
    assert!(child.is_finished());
    assert_eq!(child.lock().return_code, 3);
    assert!(h.threading.get_thread(parent).unwrap().is_finished());
    assert!(!h.threading.get_thread(unrelated).unwrap().is_finished());
}

#[test]
fn detach_requires_the_same_process() {
    let h = harness();
    let a = kernel_thread(&h, "a");
    let b = kernel_thread(&h, "b");
    let foreign = kernel_thread(&h, "foreign");
    for (id, pid) in [(a, 1), (b, 1), (foreign, 2)] {
        h.threading.get_thread(id).unwrap().lock().process_id = Some(ProcessId(pid));
    }
    run(&h, a);

    assert_eq!(h.threading.detach(foreign), Err(ThreadError::PermissionDenied));
    assert_eq!(h.threading.detach(ThreadId(999)), Err(ThreadError::NotFound));
    h.threading.detach(b).unwrap();
    assert_eq!(h.threading.get_thread(b).unwrap().lock().parent_id, None);
}

#[test]
fn terminating_a_process_spares_detached_threads_unless_asked() {
    let h = harness();
    let pid = ProcessId(5);
    let attached = kernel_thread(&h, "attached");
    let detached = kernel_thread(&h, "detached");
    let outsider = kernel_thread(&h, "outsider");
    for id in [attached, detached] {
        h.threading.get_thread(id).unwrap().lock().process_id = Some(pid);
    }
    h.threading.get_thread(detached).unwrap().lock().parent_id = None;

    assert_eq!(h.threading.terminate_all_for_process(pid, false, false), 1);
    assert!(h.threading.get_thread(attached).unwrap().is_finished());
    assert!(!h.threading.get_thread(detached).unwrap().is_finished());

    assert_eq!(h.threading.terminate_all_for_process(pid, true, false), 0);
    assert!(h.threading.get_thread(detached).unwrap().is_finished());
    assert!(!h.threading.get_thread(outsider).unwrap().is_finished());
}

#[test]
fn switch_skips_finished_threads_and_saves_the_outgoing_context() {
    let h = harness();
    let doomed = kernel_thread(&h, "doomed");
    let survivor = kernel_thread(&h, "survivor");
    h.threading.kill(doomed, 1, false).unwrap();

    let outcome = preempt(&h);
    assert_eq!(outcome.thread, survivor);
    assert!(!outcome.idle);
    assert_eq!(outcome.time_slice_ms, kernel_config::scheduler::time_slice_ms(0));
    // first run: the trampoline context is installed
    let t = h.threading.get_thread(survivor).unwrap();
    assert_eq!(outcome.context, t.lock().context(ContextLevel::Level0));
    assert_eq!(h.threading.get_thread(doomed).unwrap().lock().runstate, RunState::Reaped);

    // the idle thread's context was saved on the way out
    let idle = h.threading.get_thread(h.idle).unwrap();
    assert_eq!(idle.lock().active_context.map(|c| c.frame), Some(0xAAAA));

    // a lone runnable thread is picked again and resumes where it stopped
    let again = preempt(&h);
    assert_eq!(again.thread, survivor);
    assert_eq!(again.context.map(|c| c.frame), Some(0xAAAA));
}

#[test]
fn user_threads_transition_through_the_trampoline() {
    let h = harness();
    let user = h.threading.create(Some("app"), returns_argument, 9, RunMode::User, ThreadFlags::INHERIT);
    run(&h, user);
    h.threading.entry_trampoline().unwrap();

    let t = h.threading.get_thread(user).unwrap();
    assert!(t.lock().flags.contains(ThreadFlags::TRANSITION_USERMODE));
    assert!(!t.is_finished());
    let level1 = t.lock().context(ContextLevel::Level1).unwrap();
    assert!(t.lock().context(ContextLevel::Signal1).is_some());
    assert_eq!(h.platform.entry_of(level1), Some((ContextEntry::Address(returns_argument as usize), 9)));

    let outcome = preempt(&h);
    assert_eq!(outcome.thread, user);
    assert_eq!(outcome.context, Some(level1));
    assert!(!t.lock().flags.intersects(ThreadFlags::TRANSITION_USERMODE | ThreadFlags::SWITCHMODE));
}

#[test]
fn switch_level_binds_the_process_entry() {
    let h = harness();
    h.processes.processes.lock().insert(ProcessId(3), ProcessInfo { signal_handler: None, entry_point: 0x40_0000 });
    let service = h.threading.create(Some("svc"), returns_zero, 0, RunMode::Driver, ThreadFlags::empty());
    run(&h, service);

    assert_eq!(h.threading.switch_level(ProcessId(4)), Err(ThreadError::NotFound));
    h.threading.switch_level(ProcessId(3)).unwrap();
    let t = h.threading.get_thread(service).unwrap();
    assert_eq!(t.lock().process_id, Some(ProcessId(3)));
    let level1 = t.lock().context(ContextLevel::Level1).unwrap();
    assert_eq!(h.platform.entry_of(level1), Some((ContextEntry::Address(0x40_0000), 0)));
    assert_eq!(preempt(&h).context, Some(level1));
}

#[test]
fn signal_create_validates_its_input() {
    let h = harness();
    let t = kernel_thread(&h, "t");
    assert_eq!(h.threading.signal_create(t, NUM_SIGNALS), Err(SignalError::InvalidSignal));
    assert_eq!(h.threading.signal_create(ThreadId(999), SIGUSR1), Err(SignalError::NoThread));

    h.threading.block_signal(t, SIGUSR1).unwrap();
    assert_eq!(h.threading.signal_create(t, SIGUSR1), Err(SignalError::Blocked));
    h.threading.unblock_signal(t, SIGUSR1).unwrap();
    h.threading.signal_create(t, SIGUSR1).unwrap();
    assert_eq!(h.threading.get_thread(t).unwrap().lock().signals.queue.len(), 1);
}

#[test]
fn default_actions_terminate_only_on_fatal_signals() {
    let h = harness();
    for number in 0..NUM_SIGNALS {
        let id = kernel_thread(&h, "victim");
        h.threading.signal_create(id, number).unwrap();
        h.threading.signal_handle(id).unwrap();

        let t = h.threading.get_thread(id).unwrap();
        let class = thread_struct::signal_class(number).unwrap();
        assert_eq!(t.is_finished(), class.is_fatal(), "signal {}", number);
        if class.is_fatal() {
            assert_eq!(t.lock().return_code, number as i32);
        }
        assert!(t.lock().signals.queue.is_empty());
        assert!(t.lock().signals.active.is_none());
    }
    assert_eq!(thread_struct::signal_class(SIGSTOP), Some(SignalClass::Stop));
}

#[test]
fn fatal_signal_without_handler_terminates_the_process() {
    let h = harness();
    let pid = ProcessId(4);
    h.processes.processes.lock().insert(pid, ProcessInfo { signal_handler: None, entry_point: 0 });
    let a = kernel_thread(&h, "a");
    let b = kernel_thread(&h, "b");
    h.threading.get_thread(b).unwrap().lock().parent_id = None;
    for id in [a, b] {
        h.threading.get_thread(id).unwrap().lock().process_id = Some(pid);
    }

    h.threading.signal_create(a, SIGKILL).unwrap();
    h.threading.signal_handle(a).unwrap();
    assert_eq!(*h.processes.terminated.lock(), [(pid, SIGKILL as i32)]);
    assert!(h.threading.get_thread(a).unwrap().is_finished());
    // detached threads die with the process too
    assert!(h.threading.get_thread(b).unwrap().is_finished());
}

#[test]
fn handlers_run_one_signal_at_a_time_in_order() {
    let h = harness();
    let pid = ProcessId(9);
    h.processes.processes.lock().insert(pid, ProcessInfo { signal_handler: Some(0xDEAD), entry_point: 0 });
    let id = kernel_thread(&h, "handled");
    let thread = h.threading.get_thread(id).unwrap();
    thread.lock().process_id = Some(pid);
    run(&h, id);
    let interrupted = Some(Context { level: ContextLevel::Level0, frame: 0xAAAA });

    h.threading.signal_create(id, SIGUSR1).unwrap();
    h.threading.signal_create(id, SIGUSR2).unwrap();
    h.threading.signal_handle(id).unwrap();
    assert_eq!(h.threading.signal_handle(id), Err(SignalError::AlreadyDispatching));

    let first = preempt(&h);
    assert_eq!(first.thread, id);
    let handler = first.context.unwrap();
    assert_eq!(handler.level, ContextLevel::Signal0);
    assert_eq!(h.platform.entry_of(handler), Some((ContextEntry::Address(0xDEAD), SIGUSR1)));
    let active = thread.lock().signals.active.unwrap();
    assert_eq!(active.signal.number, SIGUSR1);
    assert_eq!(active.saved_context, interrupted);

    // returning dispatches the next queued signal straight away
    h.threading.signal_return().unwrap();
    {
        let t = thread.lock();
        assert_eq!(t.signals.active.unwrap().signal.number, SIGUSR2);
        assert_eq!(t.signals.active.unwrap().saved_context, interrupted);
        assert!(t.signals.queue.is_empty());
    }
    let second = preempt(&h).context.unwrap();
    assert_eq!(h.platform.entry_of(second), Some((ContextEntry::Address(0xDEAD), SIGUSR2)));

    h.threading.signal_return().unwrap();
    assert_eq!(h.threading.signal_return(), Err(SignalError::NotDispatching));
    assert_eq!(preempt(&h).context, interrupted);
    assert!(thread.lock().signals.active.is_none());
}

#[test]
fn running_thread_enters_its_handler_at_the_next_switch() {
    let h = harness();
    let pid = ProcessId(4);
    h.processes.processes.lock().insert(pid, ProcessInfo { signal_handler: Some(0xBEEF), entry_point: 0 });
    let id = kernel_thread(&h, "busy");
    h.threading.get_thread(id).unwrap().lock().process_id = Some(pid);
    run(&h, id);

    h.threading.signal_create(id, SIGUSR1).unwrap();
    h.threading.signal_handle(id).unwrap();
    let outcome = preempt(&h);
    assert_eq!(outcome.thread, id);
    let handler = outcome.context.unwrap();
    assert_eq!(handler.level, ContextLevel::Signal0);
    assert_eq!(h.platform.entry_of(handler), Some((ContextEntry::Address(0xBEEF), SIGUSR1)));

    // the handler keeps running across further switches until it returns
    assert_eq!(preempt(&h).context, Some(Context { level: ContextLevel::Level0, frame: 0xAAAA }));
    h.threading.signal_return().unwrap();
    h.threading.signal_create(id, SIGUSR2).unwrap();
    h.threading.signal_handle(id).unwrap();
    assert_eq!(preempt(&h).context.map(|c| c.level), Some(ContextLevel::Signal0));
}

#[test]
fn signal_to_a_waiting_thread_replaces_its_saved_context() {
    let h = harness();
    let pid = ProcessId(5);
    h.processes.processes.lock().insert(pid, ProcessInfo { signal_handler: Some(0xF00D), entry_point: 0 });
    let id = kernel_thread(&h, "queued");
    let thread = h.threading.get_thread(id).unwrap();
    thread.lock().process_id = Some(pid);
    let before = thread.lock().active_context;

    h.threading.signal_create(id, SIGUSR1).unwrap();
    h.threading.signal_handle(id).unwrap();
    let t = thread.lock();
    assert_eq!(t.signals.active.unwrap().saved_context, before);
    assert_eq!(t.signals.redirect, None);
    assert_eq!(t.active_context.map(|c| c.level), Some(ContextLevel::Signal0));
}

#[test]
fn signals_interrupt_parked_threads() {
    let h = harness();
    let id = kernel_thread(&h, "waiter");
    run(&h, id);

    let threading = h.threading.clone();
    h.platform.on_yield(move || {
        threading.signal_create(id, SIGUSR1).unwrap();
    });
    assert_eq!(h.threading.park_until(WaitToken::generic(1), 0, &|| false), WakeReason::Interrupted);
    assert_eq!(h.threading.get_thread(id).unwrap().lock().sched, SchedState::Ready);
}

#[test]
fn registry_rejects_duplicates() {
    let registry = ThreadRegistry::new();
    let inner = ThreadInner::new(RunMode::Kernel, ThreadFlags::empty(), returns_zero, 0);
    let thread: ThreadRef = Arc::new(Thread::new(ThreadId(1), "t".to_string(), 0, inner));
    registry.register(thread.clone()).unwrap();
    assert_eq!(registry.register(thread), Err(RegistryError::DuplicateId));
    assert_eq!(registry.len(), 1);
    assert!(registry.unregister(ThreadId(1)).is_some());
    assert!(registry.find(ThreadId(1)).is_none());
    assert!(registry.is_empty());
}

#[test]
fn garbage_collector_runs_handlers_in_order() {
    let gc: GarbageCollector<u32> = GarbageCollector::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let first = {
        let seen = seen.clone();
        gc.register(move |x| seen.lock().push(("first", x)))
    };
    let second = {
        let seen = seen.clone();
        gc.register(move |x| seen.lock().push(("second", x)))
    };
    gc.signal(second, 1);
    gc.signal(first, 2);
    assert_eq!(gc.pending_count(), 2);
    assert!(seen.lock().is_empty());

    assert_eq!(gc.process_pending(), 2);
    assert_eq!(*seen.lock(), [("second", 1), ("first", 2)]);
    assert_eq!(gc.process_pending(), 0);
}

std::thread_local! {
    static INTERRUPTS_ON: Cell<bool> = Cell::new(true);
    static INTERRUPTS_OFF_COUNT: Cell<usize> = Cell::new(0);
}

struct FakeInterrupts;

impl sync_irq::InterruptControl for FakeInterrupts {
    fn disable(&self) -> bool {
        INTERRUPTS_OFF_COUNT.with(|c| c.set(c.get() + 1));
        INTERRUPTS_ON.with(|on| on.replace(false))
    }

    fn restore(&self, was_enabled: bool) {
        if was_enabled {
            INTERRUPTS_ON.with(|on| on.set(true));
        }
    }
}

static FAKE_INTERRUPTS: FakeInterrupts = FakeInterrupts;

#[test]
fn thread_and_scheduler_locks_keep_interrupts_off() {
    sync_irq::register_interrupt_control(&FAKE_INTERRUPTS);
    let h = harness();
    let id = kernel_thread(&h, "masked");
    let thread = h.threading.get_thread(id).unwrap();
    {
        let _t = thread.lock();
        assert!(!INTERRUPTS_ON.with(Cell::get));
    }
    assert!(INTERRUPTS_ON.with(Cell::get));

    let before = INTERRUPTS_OFF_COUNT.with(Cell::get);
    run(&h, id);
    h.threading.signal_create(id, SIGUSR1).unwrap();
    assert!(INTERRUPTS_OFF_COUNT.with(Cell::get) > before);
    assert!(INTERRUPTS_ON.with(Cell::get));
}
