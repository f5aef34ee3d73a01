//! Compile-time tunables shared by the kernel crates.
//!
//! Every value here is a plain `const`; nothing is read at runtime.

#![no_std]

pub mod scheduler;
pub mod threading;
pub mod usb;
