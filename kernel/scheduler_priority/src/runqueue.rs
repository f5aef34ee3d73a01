//! The per-core `RunQueue`: one FIFO of ready threads per priority level.

use alloc::collections::VecDeque;
use core::ops::Deref;
use kernel_config::scheduler::{QUEUE_COUNT, TOKENS_PER_LEVEL};
use thread_struct::{CoreId, ThreadId, ThreadRef};

/// A `ThreadRef` plus the scheduling data that only the run queue cares about.
///
/// Dereferences to the wrapped `ThreadRef`.
#[derive(Debug, Clone)]
pub(crate) struct PriorityThreadRef {
    threadref: ThreadRef,
    /// The level this thread is queued at; 0 is the highest.
    pub level: usize,
    /// How many more quanta it may exhaust before being demoted.
    pub tokens_remaining: usize,
}

impl Deref for PriorityThreadRef {
    type Target = ThreadRef;
    fn deref(&self) -> &ThreadRef {
        &self.threadref
    }
}

impl PriorityThreadRef {
    pub fn new(threadref: ThreadRef, level: usize) -> PriorityThreadRef {
        let level = clamp_level(level);
        PriorityThreadRef { threadref, level, tokens_remaining: TOKENS_PER_LEVEL[level] }
    }

    /// Charges one exhausted quantum, demoting the thread once its tokens run out.
    pub fn charge_quantum(&mut self) {
        self.tokens_remaining = self.tokens_remaining.saturating_sub(1);
        if self.tokens_remaining == 0 {
            self.move_to_level(self.level + 1);
        }
    }

    pub fn move_to_level(&mut self, level: usize) {
        self.level = clamp_level(level);
        self.tokens_remaining = TOKENS_PER_LEVEL[self.level];
    }
}

pub(crate) fn clamp_level(level: usize) -> usize {
    core::cmp::min(level, QUEUE_COUNT - 1)
}

#[derive(Debug)]
pub(crate) struct PriorityQueues<T> {
    pub queue: [VecDeque<T>; QUEUE_COUNT],
}

impl<T> PriorityQueues<T> {
    pub fn new() -> PriorityQueues<T> {
        PriorityQueues { queue: core::array::from_fn(|_| VecDeque::new()) }
    }

    pub fn len(&self) -> usize {
        self.queue.iter().map(VecDeque::len).sum()
    }
}

/// The ready threads of one core, plus the thread it is currently running.
#[derive(Debug)]
pub(crate) struct RunQueue {
    pub core: CoreId,
    pub ready: PriorityQueues<PriorityThreadRef>,
    /// The entry of the thread picked last; it keeps its tokens while running.
    pub running: Option<PriorityThreadRef>,
    pub schedules_since_boost: usize,
    /// Milliseconds of scheduler time seen by this core.
    pub clock_ms: u64,
}

impl RunQueue {
    pub fn new(core: CoreId) -> RunQueue {
        RunQueue {
            core,
            ready: PriorityQueues::new(),
            running: None,
            schedules_since_boost: 0,
            clock_ms: 0,
        }
    }

    pub fn push(&mut self, entry: PriorityThreadRef) {
        let level = entry.level;
        self.ready.queue[level].push_back(entry);
    }

    /// Pops the front of the highest non-empty level.
    pub fn pop_highest(&mut self) -> Option<PriorityThreadRef> {
        self.ready.queue.iter_mut().find_map(VecDeque::pop_front)
    }

    pub fn contains(&self, id: ThreadId) -> bool {
        self.ready.queue.iter().flatten().any(|t| t.id() == id)
    }

    /// Removes the given thread from every level; returns whether it was queued.
    pub fn remove(&mut self, id: ThreadId) -> bool {
        let mut found = false;
        for queue in self.ready.queue.iter_mut() {
            let before = queue.len();
            queue.retain(|t| t.id() != id);
            found |= queue.len() != before;
        }
        found
    }

    /// Moves every ready thread back to the top level with a fresh set of tokens.
    pub fn boost(&mut self) {
        for level in 1..QUEUE_COUNT {
            while let Some(mut entry) = self.ready.queue[level].pop_front() {
                entry.move_to_level(0);
                self.ready.queue[0].push_back(entry);
            }
        }
        for entry in self.ready.queue[0].iter_mut() {
            entry.tokens_remaining = TOKENS_PER_LEVEL[0];
        }
        if let Some(running) = self.running.as_mut() {
            running.move_to_level(0);
        }
        self.schedules_since_boost = 0;
    }
}
