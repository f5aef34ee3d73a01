//! Signal delivery.
//!
//! Each thread has a FIFO of pending signals and at most one signal being
//! dispatched. Dispatching either runs the process's handler in a signal
//! context or, without a handler, applies the default action of the signal.

use super::*;
use thread_struct::{signal_class, ActiveSignal, Redirect, SchedState, Signal, SignalNumber};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalError {
    /// The signal number is outside the signal table.
    InvalidSignal,
    /// The target thread blocked this signal.
    Blocked,
    NoThread,
    /// The thread is already running a signal handler.
    AlreadyDispatching,
    /// A return from a signal was requested while none was dispatching.
    NotDispatching,
}

impl fmt::Display for SignalError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let msg = match self {
            SignalError::InvalidSignal => "signal number out of range",
            SignalError::Blocked => "signal is blocked by the target thread",
            SignalError::NoThread => "no such thread",
            SignalError::AlreadyDispatching => "a signal is already being dispatched",
            SignalError::NotDispatching => "no signal is being dispatched",
        };
        f.write_str(msg)
    }
}

impl Threading {
    /// Queues signal `number` for thread `id`. A thread that is not running
    /// is forced awake so it notices.
    pub fn signal_create(&self, id: ThreadId, number: SignalNumber) -> Result<(), SignalError> {
        let class = signal_class(number).ok_or(SignalError::InvalidSignal)?;
        let target = self.registry.find(id).ok_or(SignalError::NoThread)?;
        trace!("signal_create(thread {}, signal {})", id, number);

        let running = {
            let mut t = target.lock();
            if t.signals.is_blocked(number) {
                debug!("signal {} is blocked by thread {}", number, id);
                return Err(SignalError::Blocked);
            }
            t.signals.queue.push_back(Signal { thread: id, number, class });
            matches!(t.sched, SchedState::Running(_))
        };
        if !running {
            // losing the race against the target starting to run is fine,
            // it handles its queue on the way out of the kernel
            let _ = self.scheduler.signal_thread(&target);
        }
        Ok(())
    }

    /// Dispatches the oldest pending signal of thread `id`, if any.
    pub fn signal_handle(&self, id: ThreadId) -> Result<(), SignalError> {
        let thread = self.registry.find(id).ok_or(SignalError::NoThread)?;
        let signal = {
            let mut t = thread.lock();
            if t.signals.active.is_some() {
                return Err(SignalError::AlreadyDispatching);
            }
            t.signals.queue.pop_front()
        };
        if let Some(signal) = signal {
            self.signal_execute(&thread, signal);
        }
        Ok(())
    }

    /// Carries out `signal` on `thread`.
    ///
    /// Without a process handler, fatal signals terminate the owning process
    /// and all of its threads (or just the thread, if it has no process) and
    /// everything else is dropped. With a handler, the thread's active context
    /// is saved and replaced by a signal context entering the handler. A thread
    /// that is running makes that change at its next context switch.
    pub fn signal_execute(&self, thread: &ThreadRef, signal: Signal) {
        trace!("signal_execute(thread {}, signal {})", thread.id(), signal.number);
        let process = thread.lock().process_id;
        let info = process.and_then(|pid| self.processes.get(pid));
        let code = signal.number as i32;

        let handler = match info.and_then(|i| i.signal_handler) {
            Some(handler) => handler,
            None => {
                if !signal.class.is_fatal() {
                    trace!("signal {} ignored by thread {}", signal.number, thread.id());
                    return;
                }
                match (process, info) {
                    (Some(pid), Some(_)) => {
                        debug!("signal {} terminates process {}", signal.number, pid);
                        self.processes.terminate(pid, code);
                        self.terminate_threads(pid, code, true, true);
                    }
                    _ => {
                        debug!("signal {} terminates thread {}", signal.number, thread.id());
                        if let Err(e) = self.kill(thread.id(), code, true) {
                            warn!("failed to terminate thread {} on signal {}: {}", thread.id(), signal.number, e);
                        }
                    }
                }
                return;
            }
        };

        let mut t = thread.lock();
        let level = match t.mode {
            RunMode::Kernel => ContextLevel::Signal0,
            _ => ContextLevel::Signal1,
        };
        let interrupted = t.active_context;
        let context = self.platform.create_context(t.mode, level, ContextEntry::Address(handler), signal.number);
        self.install_context(&mut t, context);
        let saved_context = if matches!(t.sched, SchedState::Running(_)) {
            // the frame to save is only known once the thread leaves the CPU
            match t.signals.redirect.take() {
                Some(Redirect::Resume(saved)) => {
                    t.signals.redirect = Some(Redirect::Resume(Some(context)));
                    saved
                }
                _ => {
                    t.signals.redirect = Some(Redirect::Enter(context));
                    None
                }
            }
        } else {
            t.active_context = Some(context);
            interrupted
        };
        t.signals.active = Some(ActiveSignal { signal, saved_context });
    }

    /// Finishes the signal the calling thread is dispatching and dispatches the
    /// next pending signal right away. The context the first handler interrupted
    /// is resumed once no handler is left.
    pub fn signal_return(&self) -> Result<(), SignalError> {
        let thread = self.current_thread().ok_or(SignalError::NoThread)?;
        {
            let mut t = thread.lock();
            let active = t.signals.active.take().ok_or(SignalError::NotDispatching)?;
            match t.signals.redirect.take() {
                // the handler was never entered, the interrupted frame is still live
                Some(Redirect::Enter(_)) => {}
                _ => t.signals.redirect = Some(Redirect::Resume(active.saved_context)),
            }
        }
        self.signal_handle(thread.id())
    }

    /// Makes thread `id` refuse signal `number` from now on.
    pub fn block_signal(&self, id: ThreadId, number: SignalNumber) -> Result<(), SignalError> {
        signal_class(number).ok_or(SignalError::InvalidSignal)?;
        let thread = self.registry.find(id).ok_or(SignalError::NoThread)?;
        thread.lock().signals.block(number);
        Ok(())
    }

    pub fn unblock_signal(&self, id: ThreadId, number: SignalNumber) -> Result<(), SignalError> {
        signal_class(number).ok_or(SignalError::InvalidSignal)?;
        let thread = self.registry.find(id).ok_or(SignalError::NoThread)?;
        thread.lock().signals.unblock(number);
        Ok(())
    }
}
