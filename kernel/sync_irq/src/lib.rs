//! Interrupt-safe spin locks.
//!
//! A lock that is taken both from thread context and from an interrupt
//! handler must keep interrupts off on the local core while it is held.
//! Otherwise the handler can spin forever on a lock its own core holds.
//!
//! Masking interrupts is architecture specific, so the kernel registers an
//! [`InterruptControl`] once at boot. Until then, holding interrupts does nothing.

#![no_std]


use core::ops::{Deref, DerefMut};
use spin::Once;

/// Masks and unmasks interrupts on the calling core.
pub trait InterruptControl: Sync {
    /// Disables interrupts and returns whether they were enabled before.
    fn disable(&self) -> bool;

    /// Re-enables interrupts if `was_enabled` says they were on.
    fn restore(&self, was_enabled: bool);
}

static CONTROL: Once<&'static dyn InterruptControl> = Once::new();

/// Installs the interrupt control used by every lock in this crate.
///
/// Only the first registration takes effect; returns whether this call installed `control`.
pub fn register_interrupt_control(control: &'static dyn InterruptControl) -> bool {
    let mut installed = false;
    CONTROL.call_once(|| {
        installed = true;
        control
    });
    installed
}

/// Keeps interrupts disabled until dropped, then restores the previous state.
#[must_use = "interrupts are restored as soon as this is dropped"]
pub struct HeldInterrupts {
    was_enabled: bool,
}

/// Disables interrupts on the calling core until the returned guard is dropped.
pub fn hold_interrupts() -> HeldInterrupts {
    let was_enabled = CONTROL.get().map_or(false, |control| control.disable());
    HeldInterrupts { was_enabled }
}

impl Drop for HeldInterrupts {
    fn drop(&mut self) {
        if let Some(control) = CONTROL.get() {
            control.restore(self.was_enabled);
        }
    }
}

/// A spin mutex that holds interrupts for as long as it is locked.
pub struct IrqSafeMutex<T: ?Sized> {
    inner: spin::Mutex<T>,
}

impl<T> IrqSafeMutex<T> {
    pub const fn new(data: T) -> Self {
        IrqSafeMutex { inner: spin::Mutex::new(data) }
    }
}

impl<T: ?Sized> IrqSafeMutex<T> {
    pub fn lock(&self) -> IrqSafeMutexGuard<'_, T> {
        // interrupts go off before spinning, so a handler on this core cannot
        // preempt the holder once the lock is taken
        let held = hold_interrupts();
        IrqSafeMutexGuard { guard: self.inner.lock(), _held: held }
    }

    pub fn try_lock(&self) -> Option<IrqSafeMutexGuard<'_, T>> {
        let held = hold_interrupts();
        self.inner.try_lock().map(|guard| IrqSafeMutexGuard { guard, _held: held })
    }

    pub fn is_locked(&self) -> bool {
        self.inner.is_locked()
    }
}

impl<T: Default> Default for IrqSafeMutex<T> {
    fn default() -> Self {
        IrqSafeMutex::new(T::default())
    }
}

/// The guard of an [`IrqSafeMutex`].
pub struct IrqSafeMutexGuard<'a, T: ?Sized> {
    guard: spin::MutexGuard<'a, T>,
    // Dropped after the lock is released.
    _held: HeldInterrupts,
}

impl<T: ?Sized> Deref for IrqSafeMutexGuard<'_, T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.guard
    }
}

impl<T: ?Sized> DerefMut for IrqSafeMutexGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut T {
        &mut self.guard
    }
}
