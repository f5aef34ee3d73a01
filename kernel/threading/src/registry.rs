//! The set of all threads known to the system, keyed by id.

use alloc::collections::BTreeMap;
use core::fmt;
use sync_irq::IrqSafeMutex;
use thread_struct::{ThreadId, ThreadRef};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryError {
    /// A thread with the same id is already registered.
    DuplicateId,
}

impl fmt::Display for RegistryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            RegistryError::DuplicateId => write!(f, "a thread with that id is already registered"),
        }
    }
}

#[derive(Default)]
pub struct ThreadRegistry {
    threads: IrqSafeMutex<BTreeMap<ThreadId, ThreadRef>>,
}

impl ThreadRegistry {
    pub const fn new() -> ThreadRegistry {
        ThreadRegistry { threads: IrqSafeMutex::new(BTreeMap::new()) }
    }

    pub fn register(&self, thread: ThreadRef) -> Result<(), RegistryError> {
        let mut threads = self.threads.lock();
        if threads.contains_key(&thread.id()) {
            return Err(RegistryError::DuplicateId);
        }
        threads.insert(thread.id(), thread);
        Ok(())
    }

    pub fn unregister(&self, id: ThreadId) -> Option<ThreadRef> {
        self.threads.lock().remove(&id)
    }

    pub fn find(&self, id: ThreadId) -> Option<ThreadRef> {
        self.threads.lock().get(&id).cloned()
    }

    /// Calls `f` on every registered thread in id order.
    ///
    /// The registry is locked for the duration, so `f` must not call back into it.
    pub fn for_each<F: FnMut(&ThreadRef)>(&self, mut f: F) {
        for thread in self.threads.lock().values() {
            f(thread);
        }
    }

    pub fn len(&self) -> usize {
        self.threads.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
