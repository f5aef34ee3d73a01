//! Signal numbers, their default consequences, and per-thread signal state.

use alloc::collections::VecDeque;
use super::{Context, ThreadId};

/// A signal number; valid numbers are below [`NUM_SIGNALS`].
pub type SignalNumber = usize;

/// The number of well-known signals.
pub const NUM_SIGNALS: usize = 38;

pub const SIGHUP: SignalNumber = 1;
pub const SIGINT: SignalNumber = 2;
pub const SIGQUIT: SignalNumber = 3;
pub const SIGILL: SignalNumber = 4;
pub const SIGTRAP: SignalNumber = 5;
pub const SIGABRT: SignalNumber = 6;
pub const SIGEMT: SignalNumber = 7;
pub const SIGFPE: SignalNumber = 8;
pub const SIGKILL: SignalNumber = 9;
pub const SIGBUS: SignalNumber = 10;
pub const SIGSEGV: SignalNumber = 11;
pub const SIGSYS: SignalNumber = 12;
pub const SIGPIPE: SignalNumber = 13;
pub const SIGALRM: SignalNumber = 14;
pub const SIGTERM: SignalNumber = 15;
pub const SIGUSR1: SignalNumber = 16;
pub const SIGUSR2: SignalNumber = 17;
pub const SIGCHLD: SignalNumber = 18;
pub const SIGPWR: SignalNumber = 19;
pub const SIGWINCH: SignalNumber = 20;
pub const SIGURG: SignalNumber = 21;
pub const SIGPOLL: SignalNumber = 22;
pub const SIGSTOP: SignalNumber = 23;
pub const SIGTSTP: SignalNumber = 24;
pub const SIGCONT: SignalNumber = 25;
pub const SIGTTIN: SignalNumber = 26;
pub const SIGTTOUT: SignalNumber = 27;
pub const SIGVTALRM: SignalNumber = 28;
pub const SIGPROF: SignalNumber = 29;
pub const SIGXCPU: SignalNumber = 30;
pub const SIGXFSZ: SignalNumber = 31;
pub const SIGWAITING: SignalNumber = 32;
pub const SIGDIAF: SignalNumber = 33;
pub const SIGHATE: SignalNumber = 34;
pub const SIGWINEVENT: SignalNumber = 35;
pub const SIGCAT: SignalNumber = 36;
pub const SIGEND: SignalNumber = 37;

/// What happens when a signal reaches a thread whose process installed no handler.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SignalClass {
    Ignore,
    KillProcess,
    KillThread,
    Stop,
}

impl SignalClass {
    /// Whether the default action terminates the receiver.
    pub fn is_fatal(self) -> bool {
        matches!(self, SignalClass::KillProcess | SignalClass::KillThread)
    }
}

use self::SignalClass::{Ignore as I, KillProcess as P, KillThread as T, Stop as S};

/// The default consequence of every signal, indexed by signal number.
pub static SIGNAL_CLASSES: [SignalClass; NUM_SIGNALS] = [
    I,                      // 0
    P, P, T, T, T, T, T, T, // SIGHUP ..= SIGFPE
    P, T, T, T,             // SIGKILL, SIGBUS, SIGSEGV, SIGSYS
    P, P, P,                // SIGPIPE, SIGALRM, SIGTERM
    I, I, I, I, I, I, I,    // SIGUSR1 ..= SIGPOLL
    S, S, I, S, S,          // SIGSTOP, SIGTSTP, SIGCONT, SIGTTIN, SIGTTOUT
    P, P, T, T,             // SIGVTALRM, SIGPROF, SIGXCPU, SIGXFSZ
    I, P, I, I, I, I,       // SIGWAITING, SIGDIAF, SIGHATE, SIGWINEVENT, SIGCAT, SIGEND
];

/// Returns the class of `number`, or `None` if it is not a known signal.
pub fn signal_class(number: SignalNumber) -> Option<SignalClass> {
    SIGNAL_CLASSES.get(number).copied()
}

/// A signal waiting to be delivered to a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Signal {
    pub thread: ThreadId,
    pub number: SignalNumber,
    pub class: SignalClass,
}

/// The signal whose handler is currently installed on a thread.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ActiveSignal {
    pub signal: Signal,
    /// The context that was active when the handler was dispatched. For a
    /// thread dispatched while it ran, this is filled in when it next leaves the CPU.
    pub saved_context: Option<Context>,
}

/// A change to the context a running thread resumes, applied by the next
/// context switch away from it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Redirect {
    /// Keep the interrupted frame as the active signal's saved context and
    /// resume the handler context instead.
    Enter(Context),
    /// Drop the interrupted frame and resume this context.
    Resume(Option<Context>),
}

/// The signal state of one thread.
#[derive(Debug, Default)]
pub struct SignalState {
    /// Pending signals in arrival order.
    pub queue: VecDeque<Signal>,
    /// At most one signal is being dispatched at a time.
    pub active: Option<ActiveSignal>,
    /// Set while the thread runs and its signal context changed under it.
    pub redirect: Option<Redirect>,
    blocked: u64,
}

impl SignalState {
    pub fn is_blocked(&self, number: SignalNumber) -> bool {
        number < NUM_SIGNALS && self.blocked & (1 << number) != 0
    }

    pub fn block(&mut self, number: SignalNumber) {
        if number < NUM_SIGNALS {
            self.blocked |= 1 << number;
        }
    }

    pub fn unblock(&mut self, number: SignalNumber) {
        if number < NUM_SIGNALS {
            self.blocked &= !(1 << number);
        }
    }

    /// Drops every pending and active signal.
    pub fn clear(&mut self) {
        self.queue.clear();
        self.active = None;
        self.redirect = None;
    }
}
