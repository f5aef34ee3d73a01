//! This crate picks the next thread to run on a core using multilevel feedback queues.
//!
//! Every core owns a run queue with [`QUEUE_COUNT`] levels; level 0 has the highest
//! priority and the shortest time slice. A thread that keeps exhausting its
//! quantum spends the tokens of its level and then sinks one level. A thread that
//! wakes up from a blocking wait rises one level. Every [`BOOST_INTERVAL`] scheduling
//! decisions, all ready threads of a core are moved back to the top level, so
//! nothing starves.
//!
//! Threads that block are parked on an opaque [`WaitToken`] and are made
//! ready again by [`Scheduler::wake_one()`], [`Scheduler::wake_all()`],
//! [`Scheduler::signal_thread()`] or by their timeout expiring in [`Scheduler::tick()`].

#![no_std]

extern crate alloc;

mod runqueue;

#[cfg(test)]
mod test;

use alloc::{collections::BTreeMap, vec::Vec};
use core::fmt;
use kernel_config::scheduler::{time_slice_ms, BOOST_INTERVAL, DEFAULT_QUEUE};
use log::{error, trace, warn};
use runqueue::{clamp_level, PriorityThreadRef, RunQueue};
use sync_irq::IrqSafeMutex;
use thread_struct::{CoreId, SchedState, ThreadId, ThreadRef};

pub use kernel_config::scheduler::QUEUE_COUNT;
pub use thread_struct::{WaitToken, WakeReason};

/// Returned by [`Scheduler::signal_thread()`] when the target is executing on a
/// core right now and therefore cannot be made ready; the caller has to notify
/// that core instead.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AlreadyRunning(pub CoreId);

impl fmt::Display for AlreadyRunning {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "thread is already running on core {}", self.0)
    }
}

/// Blocks the calling thread until a token is woken.
///
/// Implemented by the threading layer; drivers use it to wait for hardware.
pub trait Parker: Send + Sync {
    /// Parks the calling thread on `token` unless `done()` is already true.
    ///
    /// `done` is evaluated with the scheduler locked, so a wake issued after the
    /// waker made `done` true can never be lost. A `timeout_ms` of 0 waits forever.
    /// Returns [`WakeReason::Woken`] immediately if `done()` held.
    fn park_until(&self, token: WaitToken, timeout_ms: u64, done: &dyn Fn() -> bool) -> WakeReason;

    /// Wakes the longest-parked thread waiting on `token`.
    fn wake_one(&self, token: WaitToken) -> bool;

    /// Wakes every thread waiting on `token` and returns how many there were.
    fn wake_all(&self, token: WaitToken) -> usize;
}

#[derive(Debug)]
struct ParkedThread {
    entry: PriorityThreadRef,
    token: WaitToken,
    /// Expiry on the clock of the thread's core.
    deadline_ms: Option<u64>,
}

struct SchedulerInner {
    runqueues: BTreeMap<CoreId, RunQueue>,
    /// Parked threads in the order they went to sleep.
    parked: Vec<ParkedThread>,
}

impl SchedulerInner {
    fn runqueue(&mut self, core: CoreId) -> &mut RunQueue {
        self.runqueues.entry(core).or_insert_with(|| RunQueue::new(core))
    }

    /// Moves the parked thread at `index` to the ready queue of its core.
    fn unpark(&mut self, index: usize, reason: WakeReason) -> ThreadId {
        let ParkedThread { mut entry, token, .. } = self.parked.remove(index);
        let id = entry.id();
        trace!("waking thread {} parked on {:?}: {:?}", id, token, reason);
        if reason == WakeReason::Woken {
            // threads returning from a blocking wait are promoted
            entry.move_to_level(entry.level.saturating_sub(1));
        }
        {
            let mut inner = entry.lock();
            inner.sched = SchedState::Ready;
            inner.queue = entry.level;
            inner.wake_reason = Some(reason);
        }
        self.runqueue(entry.core()).push(entry);
        id
    }

    fn parked_position(&self, id: ThreadId) -> Option<usize> {
        self.parked.iter().position(|p| p.entry.id() == id)
    }
}

/// The scheduler queues of every core, behind one lock.
///
/// Lock ordering: the scheduler lock is taken before any thread lock; code that
/// holds a thread lock must never call into the scheduler.
pub struct Scheduler {
    inner: IrqSafeMutex<SchedulerInner>,
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Scheduler {
    pub const fn new() -> Scheduler {
        Scheduler {
            inner: IrqSafeMutex::new(SchedulerInner { runqueues: BTreeMap::new(), parked: Vec::new() }),
        }
    }

    /// Creates the run queue of the given core.
    pub fn init_core(&self, core: CoreId) {
        self.inner.lock().runqueue(core);
    }

    /// Makes `thread` eligible for [`schedule()`](Self::schedule) on its core.
    ///
    /// `priority_hint` selects the level; `None` keeps the thread's current one.
    /// A thread that is already ready stays where it is, a parked one is woken.
    pub fn enqueue(&self, thread: &ThreadRef, priority_hint: Option<usize>) {
        let mut inner = self.inner.lock();
        let level = {
            let t = thread.lock();
            if t.is_idle() {
                warn!("enqueue(): refusing to queue idle thread {:?}", thread);
                return;
            }
            clamp_level(priority_hint.unwrap_or(t.queue))
        };
        if let Some(index) = inner.parked_position(thread.id()) {
            inner.parked.remove(index);
        }

        let rq = inner.runqueue(thread.core());
        if rq.contains(thread.id()) {
            return;
        }
        if rq.running.as_ref().map_or(false, |r| r.id() == thread.id()) {
            rq.running = None;
        }
        {
            let mut t = thread.lock();
            t.sched = SchedState::Ready;
            t.queue = level;
        }
        rq.push(PriorityThreadRef::new(thread.clone(), level));
    }

    /// Picks the next thread to run on `core`.
    ///
    /// `current` is the thread that was running, if it should stay runnable;
    /// it is put back at the tail of its level, one quantum poorer when the
    /// switch is `preemptive`. Returns `None` if nothing is ready.
    pub fn schedule(&self, core: CoreId, current: Option<&ThreadRef>, preemptive: bool) -> Option<ThreadRef> {
        let mut inner = self.inner.lock();
        let rq = inner.runqueue(core);

        let previous = rq.running.take();
        if let Some(current) = current {
            let requeue = {
                let t = current.lock();
                !t.is_idle() && !t.is_finished() && t.sched == SchedState::Running(core)
            };
            if requeue {
                let mut entry = match previous {
                    Some(entry) if entry.id() == current.id() => entry,
                    _ => {
                        let level = current.lock().queue;
                        PriorityThreadRef::new(current.clone(), level)
                    }
                };
                if preemptive {
                    entry.charge_quantum();
                }
                {
                    let mut t = current.lock();
                    t.sched = SchedState::Ready;
                    t.queue = entry.level;
                }
                rq.push(entry);
            }
        }

        rq.schedules_since_boost += 1;
        if rq.schedules_since_boost >= BOOST_INTERVAL {
            trace!("core {}: boosting {} ready threads", core, rq.ready.len());
            rq.boost();
        }

        let next = rq.pop_highest()?;
        {
            let mut t = next.lock();
            t.sched = SchedState::Running(core);
            t.queue = next.level;
            t.time_slice_ms = time_slice_ms(next.level);
        }
        let threadref = (*next).clone();
        rq.running = Some(next);
        Some(threadref)
    }

    /// Parks `thread` on `token` unless `condition()` already holds.
    ///
    /// Returns `true` if the thread was parked; the caller must then yield.
    /// `condition` runs with the scheduler locked, which serializes it against
    /// every wake. A `timeout_ms` of 0 parks without a deadline.
    pub fn sleep_unless(
        &self,
        thread: &ThreadRef,
        token: WaitToken,
        timeout_ms: u64,
        condition: &dyn Fn() -> bool,
    ) -> bool {
        let mut inner = self.inner.lock();
        if condition() {
            return false;
        }

        let rq = inner.runqueue(thread.core());
        rq.remove(thread.id());
        let entry = match rq.running.take() {
            Some(entry) if entry.id() == thread.id() => entry,
            other => {
                rq.running = other;
                PriorityThreadRef::new(thread.clone(), thread.lock().queue)
            }
        };
        let deadline_ms = (timeout_ms != 0).then(|| rq.clock_ms + timeout_ms);
        {
            let mut t = thread.lock();
            t.sched = SchedState::Parked;
            t.wake_reason = None;
        }
        trace!("thread {} parks on {:?} (deadline {:?})", thread.id(), token, deadline_ms);
        inner.parked.push(ParkedThread { entry, token, deadline_ms });
        true
    }

    /// Makes the thread that parked first on `token` ready. Returns whether there was one.
    pub fn wake_one(&self, token: WaitToken) -> bool {
        let mut inner = self.inner.lock();
        match inner.parked.iter().position(|p| p.token == token) {
            Some(index) => {
                inner.unpark(index, WakeReason::Woken);
                true
            }
            None => false,
        }
    }

    /// Makes every thread parked on `token` ready and returns how many were woken.
    pub fn wake_all(&self, token: WaitToken) -> usize {
        let mut inner = self.inner.lock();
        let mut woken = 0;
        while let Some(index) = inner.parked.iter().position(|p| p.token == token) {
            inner.unpark(index, WakeReason::Woken);
            woken += 1;
        }
        woken
    }

    /// Forces `thread` back to the ready state, interrupting any wait it is in.
    ///
    /// Fails if the thread is executing on a core right now.
    pub fn signal_thread(&self, thread: &ThreadRef) -> Result<(), AlreadyRunning> {
        let mut inner = self.inner.lock();
        let state = thread.lock().sched;
        match state {
            SchedState::Running(core) => Err(AlreadyRunning(core)),
            SchedState::Parked => {
                match inner.parked_position(thread.id()) {
                    Some(index) => {
                        inner.unpark(index, WakeReason::Interrupted);
                    }
                    None => error!("BUG: signal_thread(): thread {:?} is parked but not in the parked set", thread),
                }
                Ok(())
            }
            SchedState::Ready | SchedState::Unqueued => Ok(()),
        }
    }

    /// Removes `thread` from every ready queue and from the parked set.
    pub fn dequeue(&self, thread: &ThreadRef) {
        let mut inner = self.inner.lock();
        if let Some(index) = inner.parked_position(thread.id()) {
            inner.parked.remove(index);
        }
        let rq = inner.runqueue(thread.core());
        rq.remove(thread.id());
        if rq.running.as_ref().map_or(false, |r| r.id() == thread.id()) {
            rq.running = None;
        }
        thread.lock().sched = SchedState::Unqueued;
    }

    /// Advances the clock of `core` and wakes the threads on that core whose
    /// timeout expired. Returns how many timed out.
    pub fn tick(&self, core: CoreId, elapsed_ms: u64) -> usize {
        let mut inner = self.inner.lock();
        let now = {
            let rq = inner.runqueue(core);
            rq.clock_ms += elapsed_ms;
            rq.clock_ms
        };
        let mut expired = 0;
        while let Some(index) = inner.parked.iter().position(|p| {
            p.entry.core() == core && p.deadline_ms.map_or(false, |deadline| deadline <= now)
        }) {
            inner.unpark(index, WakeReason::Timeout);
            expired += 1;
        }
        expired
    }

    /// Returns the number of ready threads on `core`.
    pub fn ready_count(&self, core: CoreId) -> usize {
        self.inner.lock().runqueues.get(&core).map_or(0, |rq| rq.ready.len())
    }

    /// Returns whether `id` is parked, and on which token.
    pub fn parked_on(&self, id: ThreadId) -> Option<WaitToken> {
        let inner = self.inner.lock();
        inner.parked.iter().find(|p| p.entry.id() == id).map(|p| p.token)
    }

    /// Returns the level a newly created thread starts on.
    pub const fn default_queue() -> usize {
        DEFAULT_QUEUE
    }
}
