//! Tests for the thread control block and signal state.

extern crate std;

use super::*;
use core::sync::atomic::{AtomicUsize, Ordering};

fn noop(_: usize) -> i32 { 0 }

#[test]
fn signal_table_classes() {
    assert_eq!(SIGNAL_CLASSES.len(), NUM_SIGNALS);
    assert_eq!(signal_class(SIGKILL), Some(SignalClass::KillProcess));
    assert_eq!(signal_class(SIGSEGV), Some(SignalClass::KillThread));
    assert_eq!(signal_class(SIGSTOP), Some(SignalClass::Stop));
    assert_eq!(signal_class(SIGUSR1), Some(SignalClass::Ignore));
    assert_eq!(signal_class(SIGDIAF), Some(SignalClass::KillProcess));
    assert_eq!(signal_class(NUM_SIGNALS), None);

    let fatal = SIGNAL_CLASSES.iter().filter(|c| c.is_fatal()).count();
    assert_eq!(fatal, 20);
}

#[test]
fn blocking_only_affects_known_signals() {
    let mut state = SignalState::default();
    state.block(SIGUSR2);
    state.block(NUM_SIGNALS + 3);
    assert!(state.is_blocked(SIGUSR2));
    assert!(!state.is_blocked(SIGUSR1));
    assert!(!state.is_blocked(NUM_SIGNALS + 3));
    state.unblock(SIGUSR2);
    assert!(!state.is_blocked(SIGUSR2));
}

struct CountingManager {
    created: AtomicUsize,
    released: AtomicUsize,
}

impl AddressSpaceManager for CountingManager {
    fn create_space(&self, _kind: SpaceKind) -> SpaceId {
        SpaceId(self.created.fetch_add(1, Ordering::SeqCst))
    }
    fn release_space(&self, _space: SpaceId) {
        self.released.fetch_add(1, Ordering::SeqCst);
    }
}

#[test]
fn memory_space_released_by_last_owner() {
    let manager = Arc::new(CountingManager { created: AtomicUsize::new(0), released: AtomicUsize::new(0) });
    let space = MemorySpace::create(manager.clone(), SpaceKind::Application);

    let mut first = ThreadInner::new(RunMode::User, ThreadFlags::empty(), noop, 0);
    let mut second = ThreadInner::new(RunMode::User, ThreadFlags::INHERIT, noop, 0);
    first.memory_space = Some(space.clone());
    second.memory_space = Some(space);

    first.memory_space = None;
    assert_eq!(manager.released.load(Ordering::SeqCst), 0);
    drop(second);
    assert_eq!(manager.released.load(Ordering::SeqCst), 1);
}

#[test]
fn contexts_by_level() {
    let mut inner = ThreadInner::new(RunMode::Kernel, ThreadFlags::empty(), noop, 7);
    inner.set_context(Context { level: ContextLevel::Level0, frame: 0x1000 });
    inner.set_context(Context { level: ContextLevel::Signal0, frame: 0x2000 });
    assert_eq!(inner.context(ContextLevel::Level0).map(|c| c.frame), Some(0x1000));
    assert_eq!(inner.context(ContextLevel::Level1), None);

    let taken = inner.take_contexts();
    assert_eq!(taken.len(), 2);
    assert!(inner.contexts.iter().all(Option::is_none));
}

#[test]
fn wait_tokens_do_not_collide_across_kinds() {
    assert_ne!(WaitToken::for_thread(ThreadId(5)), WaitToken::for_transfer(0, 5));
    assert_ne!(WaitToken::for_transfer(1, 5), WaitToken::for_transfer(0, 5));
    assert_eq!(WaitToken::for_thread(ThreadId(5)), WaitToken::for_thread(ThreadId(5)));
}
