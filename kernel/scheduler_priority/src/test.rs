//! Tests for the multilevel run queues and token parking.

extern crate std;

use super::*;
use alloc::{string::ToString, sync::Arc};
use kernel_config::scheduler::TOKENS_PER_LEVEL;
use thread_struct::{RunMode, RunState, Thread, ThreadFlags, ThreadInner};

fn noop(_: usize) -> i32 { 0 }

fn thread(id: usize, core: CoreId) -> ThreadRef {
    let inner = ThreadInner::new(RunMode::Kernel, ThreadFlags::empty(), noop, 0);
    Arc::new(Thread::new(ThreadId(id), id.to_string(), core, inner))
}

#[test]
fn higher_levels_run_first_and_fifo_within_a_level() {
    let scheduler = Scheduler::new();
    let low = thread(1, 0);
    let high_a = thread(2, 0);
    let high_b = thread(3, 0);
    scheduler.enqueue(&low, Some(3));
    scheduler.enqueue(&high_a, Some(0));
    scheduler.enqueue(&high_b, Some(0));
    // queueing twice must not create a second position
    scheduler.enqueue(&high_a, Some(0));
    assert_eq!(scheduler.ready_count(0), 3);

    let first = scheduler.schedule(0, None, false).unwrap();
    assert_eq!(first.id(), ThreadId(2));
    assert_eq!(first.lock().sched, SchedState::Running(0));
    assert_eq!(first.lock().time_slice_ms, time_slice_ms(0));

    let second = scheduler.schedule(0, Some(&first), false).unwrap();
    assert_eq!(second.id(), ThreadId(3));
    let third = scheduler.schedule(0, Some(&second), false).unwrap();
    assert_eq!(third.id(), ThreadId(2));
}

#[test]
fn exhausting_quanta_demotes() {
    let scheduler = Scheduler::new();
    let hog = thread(1, 0);
    scheduler.enqueue(&hog, None);

    let mut current = scheduler.schedule(0, None, true).unwrap();
    for _ in 0..TOKENS_PER_LEVEL[0] {
        current = scheduler.schedule(0, Some(&current), true).unwrap();
    }
    assert_eq!(current.id(), ThreadId(1));
    assert_eq!(current.lock().queue, 1);
    assert_eq!(current.lock().time_slice_ms, time_slice_ms(1));

    // cooperative yields do not cost tokens
    for _ in 0..20 {
        current = scheduler.schedule(0, Some(&current), false).unwrap();
    }
    assert_eq!(current.lock().queue, 1);
}

#[test]
fn empty_or_finished_current_is_not_requeued() {
    let scheduler = Scheduler::new();
    assert!(scheduler.schedule(0, None, true).is_none());

    let t = thread(1, 0);
    scheduler.enqueue(&t, None);
    let running = scheduler.schedule(0, None, true).unwrap();
    running.lock().runstate = RunState::Exited;
    assert!(scheduler.schedule(0, Some(&running), true).is_none());
}

#[test]
fn parking_checks_condition_under_lock() {
    let scheduler = Scheduler::new();
    let t = thread(1, 0);
    scheduler.enqueue(&t, Some(2));
    let running = scheduler.schedule(0, None, false).unwrap();
    let token = WaitToken::generic(7);

    assert!(!scheduler.sleep_unless(&running, token, 0, &|| true));
    assert!(scheduler.sleep_unless(&running, token, 0, &|| false));
    assert_eq!(running.lock().sched, SchedState::Parked);
    assert_eq!(scheduler.parked_on(ThreadId(1)), Some(token));

    // a parked thread is not picked, nor requeued as the outgoing thread
    assert!(scheduler.schedule(0, Some(&running), true).is_none());

    assert!(scheduler.wake_one(token));
    assert!(!scheduler.wake_one(token));
    let t = running.lock();
    assert_eq!(t.sched, SchedState::Ready);
    assert_eq!(t.wake_reason, Some(WakeReason::Woken));
    // woken threads are promoted one level
    assert_eq!(t.queue, 1);
}

#[test]
fn wake_one_is_fifo_and_wake_all_wakes_everyone() {
    let scheduler = Scheduler::new();
    let token = WaitToken::generic(1);
    let threads: Vec<ThreadRef> = (1..=3).map(|i| thread(i, 0)).collect();
    for t in &threads {
        assert!(scheduler.sleep_unless(t, token, 0, &|| false));
    }

    assert!(scheduler.wake_one(token));
    assert_eq!(threads[0].lock().sched, SchedState::Ready);
    assert_eq!(threads[1].lock().sched, SchedState::Parked);

    assert_eq!(scheduler.wake_all(token), 2);
    assert_eq!(scheduler.wake_all(token), 0);
    assert_eq!(scheduler.ready_count(0), 3);
}

#[test]
fn signal_thread_interrupts_waits_but_not_running_threads() {
    let scheduler = Scheduler::new();
    let runner = thread(1, 2);
    let sleeper = thread(2, 2);
    scheduler.enqueue(&runner, None);
    let runner = scheduler.schedule(2, None, false).unwrap();
    assert_eq!(scheduler.signal_thread(&runner), Err(AlreadyRunning(2)));

    assert!(scheduler.sleep_unless(&sleeper, WaitToken::generic(3), 0, &|| false));
    assert_eq!(scheduler.signal_thread(&sleeper), Ok(()));
    assert_eq!(sleeper.lock().wake_reason, Some(WakeReason::Interrupted));
    assert_eq!(scheduler.parked_on(ThreadId(2)), None);

    // already ready: nothing to do
    assert_eq!(scheduler.signal_thread(&sleeper), Ok(()));
    assert_eq!(scheduler.ready_count(2), 1);
}

#[test]
fn timeouts_expire_on_tick() {
    let scheduler = Scheduler::new();
    let short = thread(1, 0);
    let forever = thread(2, 0);
    let other_core = thread(3, 1);
    let token = WaitToken::generic(9);
    scheduler.sleep_unless(&short, token, 15, &|| false);
    scheduler.sleep_unless(&forever, token, 0, &|| false);
    scheduler.sleep_unless(&other_core, token, 5, &|| false);

    assert_eq!(scheduler.tick(0, 10), 0);
    assert_eq!(scheduler.tick(0, 10), 1);
    assert_eq!(short.lock().wake_reason, Some(WakeReason::Timeout));
    assert_eq!(other_core.lock().sched, SchedState::Parked);
    assert_eq!(forever.lock().sched, SchedState::Parked);

    assert_eq!(scheduler.tick(1, 5), 1);
}

#[test]
fn dequeue_forgets_the_thread() {
    let scheduler = Scheduler::new();
    let a = thread(1, 0);
    let b = thread(2, 0);
    scheduler.enqueue(&a, None);
    scheduler.sleep_unless(&b, WaitToken::generic(1), 0, &|| false);

    scheduler.dequeue(&a);
    scheduler.dequeue(&b);
    assert_eq!(a.lock().sched, SchedState::Unqueued);
    assert_eq!(scheduler.ready_count(0), 0);
    assert_eq!(scheduler.wake_all(WaitToken::generic(1)), 0);
    assert!(scheduler.schedule(0, None, false).is_none());
}

#[test]
fn periodic_boost_lifts_starved_threads() {
    let scheduler = Scheduler::new();
    let starved = thread(1, 0);
    let busy = thread(2, 0);
    scheduler.enqueue(&starved, Some(QUEUE_COUNT - 1));
    scheduler.enqueue(&busy, Some(0));

    let mut current = scheduler.schedule(0, None, false).unwrap();
    let mut saw_starved = false;
    for _ in 0..BOOST_INTERVAL + 1 {
        // the busy thread keeps yielding, so it never sinks on its own
        current = scheduler.schedule(0, Some(&current), false).unwrap();
        if current.id() == ThreadId(1) {
            saw_starved = true;
            break;
        }
    }
    assert!(saw_starved);
    assert_eq!(current.lock().queue, 0);
}

#[test]
fn idle_threads_are_never_queued() {
    let scheduler = Scheduler::new();
    let inner = ThreadInner::new(RunMode::Kernel, ThreadFlags::IDLE | ThreadFlags::CPUBOUND, noop, 0);
    let idle = Arc::new(Thread::new(ThreadId(1), "idle".to_string(), 0, inner));
    scheduler.enqueue(&idle, None);
    assert_eq!(scheduler.ready_count(0), 0);
}
