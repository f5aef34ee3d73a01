//! A deferred-work queue for tearing objects down outside the context that
//! finished them.
//!
//! Interrupt handlers and exiting threads cannot free their own resources, so
//! they [`signal()`](GarbageCollector::signal) the collector with a payload and
//! a collector thread later runs the registered handler in
//! [`process_pending()`](GarbageCollector::process_pending).

use alloc::{collections::VecDeque, sync::Arc, vec::Vec};
use log::warn;
use sync_irq::IrqSafeMutex;

/// Identifies a handler registered with a [`GarbageCollector`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GcId(usize);

type Handler<T> = Arc<dyn Fn(T) + Send + Sync>;

pub struct GarbageCollector<T> {
    handlers: IrqSafeMutex<Vec<Handler<T>>>,
    pending: IrqSafeMutex<VecDeque<(GcId, T)>>,
}

impl<T> Default for GarbageCollector<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> GarbageCollector<T> {
    pub const fn new() -> GarbageCollector<T> {
        GarbageCollector { handlers: IrqSafeMutex::new(Vec::new()), pending: IrqSafeMutex::new(VecDeque::new()) }
    }

    pub fn register<F: Fn(T) + Send + Sync + 'static>(&self, handler: F) -> GcId {
        let mut handlers = self.handlers.lock();
        handlers.push(Arc::new(handler));
        GcId(handlers.len() - 1)
    }

    /// Queues `payload` for the handler `id`. Never blocks on the handlers.
    pub fn signal(&self, id: GcId, payload: T) {
        self.pending.lock().push_back((id, payload));
    }

    /// Runs the handlers of everything queued so far, in order.
    /// Returns how many payloads were handled.
    pub fn process_pending(&self) -> usize {
        let mut handled = 0;
        loop {
            // neither lock is held while a handler runs, so handlers may signal again
            let Some((id, payload)) = self.pending.lock().pop_front() else {
                break;
            };
            let handler = self.handlers.lock().get(id.0).cloned();
            match handler {
                Some(handler) => {
                    handler(payload);
                    handled += 1;
                }
                None => warn!("garbage collector: dropping payload for unknown handler {:?}", id),
            }
        }
        handled
    }

    pub fn pending_count(&self) -> usize {
        self.pending.lock().len()
    }
}
