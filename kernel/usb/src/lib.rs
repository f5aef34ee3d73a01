//! USB host controller support
//!
//! Current support:
//! - OHCI controllers:
//!    * control and bulk transfers: full support, synchronous
//!    * interrupt transfers: full support, recurring with a completion callback
//!    * isochronous transfers: up to 8 frames per descriptor
//!    * root hub: port power, reset, status and connection events
//!
//! The driver does not own any global state. Everything it needs from the rest
//! of the kernel is handed to [`OhciController::new`]: a [`DmaAllocator`] for
//! memory the controller reads, a [`RegisterIo`] for its registers, a [`Timer`]
//! for the delays mandated by the hardware, a [`UsbEventSink`] that forwards
//! port events to the USB core, and a [`Parker`] used to block submitters
//! until their transfer completes.

#![no_std]

extern crate alloc;

use alloc::boxed::Box;
use core::fmt;

/// Polls `$cond` every `$poll_ms` milliseconds until it holds or `$timeout_ms`
/// elapsed, in which case it logs the call site and evaluates to `Err(UsbError::Timeout)`.
macro_rules! try_wait_until {
    ($timer:expr, $poll_ms:expr, $timeout_ms:expr, $cond:expr) => {{
        let mut elapsed = 0;

        while !($cond) && elapsed < $timeout_ms {
            $timer.delay_ms($poll_ms);
            elapsed += $poll_ms;
        }

        if $cond {
            Ok(())
        } else {
            log::error!("[USB-OHCI] line {}: Timeout expiry", line!());
            Err($crate::UsbError::Timeout)
        }
    }};
}
pub(crate) use try_wait_until;

mod allocators;
mod controllers;
mod request;


pub use allocators::{DmaAllocator, DmaRegion, UsbPointer};
pub use controllers::{
    ohci::{MmioRegisters, OhciController, OperationalRegisters, Register, RegisterIo},
    Controller, HostController,
};
pub use request::{Direction, Recipient, Request, RequestType, SetupPacket, Transaction, TransactionKind, std_req};
pub use scheduler_priority::Parker;

/// A device address on the bus; 0 until the device was assigned one.
pub type DeviceAddress = u8;

pub type MaxPacketSize = u16;

/// Identifies the descriptor pools set up for one endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct EndpointId(pub(crate) u32);

/// Endpoint transfer types, numbered as in endpoint descriptors.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferKind {
    Control = 0,
    Isochronous = 1,
    Bulk = 2,
    Interrupt = 3,
}

impl TransferKind {
    /// Control and bulk transfers run on the asynchronous lists.
    pub fn is_periodic(self) -> bool {
        matches!(self, TransferKind::Interrupt | TransferKind::Isochronous)
    }
}

/// The outcome of a transfer, as reported by the controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    NotProcessed,
    Finished,
    Stalled,
    InvalidToggles,
    NotResponding,
    InvalidData,
}

/// What the host controller driver knows about an endpoint of a device.
///
/// The data toggle is owned by the endpoint: building transactions consumes it
/// and copying the endpoint back after a transfer carries it to the next one.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UsbEndpoint {
    pub number: u8,
    pub kind: TransferKind,
    pub max_packet_size: MaxPacketSize,
    /// Polling interval in frames, for periodic endpoints.
    pub interval: u8,
    pub toggle: bool,
    pub(crate) id: Option<EndpointId>,
}

impl UsbEndpoint {
    pub fn new(number: u8, kind: TransferKind, max_packet_size: MaxPacketSize, interval: u8) -> UsbEndpoint {
        UsbEndpoint { number, kind, max_packet_size, interval, toggle: false, id: None }
    }

    /// The default control endpoint every device answers on before configuration.
    pub fn default_control(max_packet_size: MaxPacketSize) -> UsbEndpoint {
        UsbEndpoint::new(0, TransferKind::Control, max_packet_size, 0)
    }

    pub fn id(&self) -> Option<EndpointId> {
        self.id
    }
}

/// A root hub port as seen by the USB core after [`HostController::port_status`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PortStatus {
    pub connected: bool,
    pub enabled: bool,
    pub full_speed: bool,
}

/// Events a host controller raises towards the USB core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HcdEvent {
    /// A device appeared on a root hub port.
    Connected(usize),
    Disconnected(usize),
    /// The root hub reported a status change; the core should run
    /// [`HostController::ports_check`].
    RootHub,
    /// The controller hit an unrecoverable error and stopped.
    Fatal,
}

/// Receives the events of every host controller.
pub trait UsbEventSink: Send + Sync {
    fn hcd_event(&self, controller: u32, event: HcdEvent);
}

/// Busy waits mandated by the hardware.
pub trait Timer: Send + Sync {
    fn delay_ms(&self, milliseconds: u64);
}

/// Invoked from the interrupt handler every time a periodic transfer completes,
/// with the status and the data received by its IN transactions.
///
/// It runs with the controller locked and must not call back into it.
pub type TransferCallback = Box<dyn FnMut(TransferStatus, &[u8]) + Send>;

/// Whether an interrupt on a possibly shared line came from this controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IrqReturn {
    Handled,
    NotHandled,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum UsbError {
    /// The endpoint or transfer descriptor pool is exhausted.
    OutOfDescriptors,
    /// A handle did not designate a live descriptor, endpoint or request.
    UnknownHandle,
    /// The operation does not apply to the current state of the request or controller.
    InvalidState,
    /// The hardware did not reach the expected state in time.
    Timeout,
    /// Firmware refused to hand the controller over.
    OwnershipRefused,
    /// The controller does not implement OHCI 1.0 or 1.1.
    BadRevision(u8),
    /// The data does not fit the descriptors of the endpoint.
    TransferTooLarge,
    DmaAllocation,
}

impl fmt::Display for UsbError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            UsbError::OutOfDescriptors => f.write_str("out of transfer descriptors"),
            UsbError::UnknownHandle => f.write_str("unknown descriptor handle"),
            UsbError::InvalidState => f.write_str("invalid state for this operation"),
            UsbError::Timeout => f.write_str("hardware timeout"),
            UsbError::OwnershipRefused => f.write_str("firmware refused to release the controller"),
            UsbError::BadRevision(rev) => write!(f, "unsupported OHCI revision {:#x}", rev),
            UsbError::TransferTooLarge => f.write_str("transfer too large for its descriptors"),
            UsbError::DmaAllocation => f.write_str("failed to allocate DMA memory"),
        }
    }
}
