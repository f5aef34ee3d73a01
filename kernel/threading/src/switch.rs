//! The context switch entry point used by the timer interrupt and by yields.

use super::*;
use thread_struct::Redirect;

/// The result of a context switch.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SwitchOutcome {
    pub thread: ThreadId,
    /// The context to resume; `None` only for an idle thread that never saved one.
    pub context: Option<Context>,
    /// How long the timer should run before preempting; 0 for the idle thread.
    pub time_slice_ms: usize,
    /// The queue level the thread was picked from.
    pub priority: usize,
    pub idle: bool,
}

impl Threading {
    /// Stores `context` as the saved state of the outgoing thread, unless a
    /// signal dispatch or return redirected it while it ran, then picks the
    /// next thread for the calling core and makes it current.
    ///
    /// A finished outgoing thread is handed to the garbage collector. The idle
    /// thread runs when nothing else is ready.
    pub fn switch(&self, context: Context, preemptive: bool) -> Result<SwitchOutcome, ThreadError> {
        let core = self.platform.current_core();
        let idle = self.idle_thread(core).ok_or(ThreadError::NoCurrentThread)?;
        let mut outgoing = self.current_thread().ok_or(ThreadError::NoCurrentThread)?;
        {
            let mut t = outgoing.lock();
            t.active_context = Some(context);
            match t.signals.redirect.take() {
                Some(Redirect::Enter(handler)) => {
                    if let Some(active) = t.signals.active.as_mut() {
                        active.saved_context = Some(context);
                    }
                    t.active_context = Some(handler);
                }
                Some(Redirect::Resume(resume)) => t.active_context = resume,
                None => {}
            }
        }

        // Every pass consumes one finished thread from the ready queue, so this ends.
        let next = loop {
            let (requeue, reap) = {
                let mut t = outgoing.lock();
                let reap = t.runstate == RunState::Exited;
                if reap {
                    t.runstate = RunState::Reaped;
                }
                (!t.is_finished() && !t.is_idle(), reap)
            };
            if reap {
                trace!("switch(): {:?} finished, handing it to the collector", outgoing);
                self.gc.signal(self.reaper, outgoing.clone());
            }

            let candidate = self.scheduler.schedule(core, requeue.then_some(&outgoing), preemptive);
            match candidate {
                None => break idle.clone(),
                Some(candidate) if candidate.is_finished() => outgoing = candidate,
                Some(candidate) => break candidate,
            }
        };

        let is_idle = Arc::ptr_eq(&next, &idle);
        let outcome = {
            let mut t = next.lock();
            if t.flags.contains(ThreadFlags::TRANSITION_USERMODE) {
                t.flags.remove(ThreadFlags::SWITCHMODE | ThreadFlags::TRANSITION_USERMODE);
                t.active_context = t.context(ContextLevel::Level1);
            }
            if t.active_context.is_none() {
                t.active_context = t.context(ContextLevel::Level0);
            }
            SwitchOutcome {
                thread: next.id(),
                context: t.active_context,
                time_slice_ms: if is_idle { 0 } else { t.time_slice_ms },
                priority: t.queue,
                idle: is_idle,
            }
        };
        self.set_current(core, next);
        Ok(outcome)
    }
}
