/// Drivers for USB host controllers

use super::*;
use core::ops::Deref;

pub mod ohci;

/// A host controller of any supported kind.
///
/// Currently, only OHCI is supported
pub enum Controller {
    Ohci(ohci::OhciController),
}

/// The API implemented by controller drivers, driven by the USB core.
///
/// Every method takes `&self`: drivers lock their own state, so a thread
/// blocked in [`submit_transfer`](HostController::submit_transfer) does not
/// keep the interrupt handler out.
pub trait HostController: Send + Sync {
    /// Identifies this controller in events and wait tokens.
    fn id(&self) -> u32;

    fn port_count(&self) -> usize;

    /// Waits for port power, resets `port` and reports what is attached to it.
    fn port_status(&self, port: usize) -> Result<PortStatus, UsbError>;

    /// Looks for connection changes on every root hub port and reports them as events.
    fn ports_check(&self) -> Result<(), UsbError>;

    /// Resets the controller back into the operational state.
    fn reset(&self) -> Result<(), UsbError>;

    /// Allocates the transfer descriptors `endpoint` will use.
    fn endpoint_setup(&self, endpoint: &mut UsbEndpoint) -> Result<(), UsbError>;

    fn endpoint_destroy(&self, endpoint: &mut UsbEndpoint) -> Result<(), UsbError>;

    /// Allocates the endpoint descriptor of `request`.
    fn transaction_init(&self, request: &mut Request) -> Result<(), UsbError>;

    fn transaction_setup(&self, request: &mut Request, packet: SetupPacket) -> Result<(), UsbError>;

    fn transaction_in(&self, request: &mut Request, length: usize) -> Result<(), UsbError>;

    fn transaction_out(&self, request: &mut Request, data: &[u8]) -> Result<(), UsbError>;

    /// Hands `request` to the hardware. Control and bulk transfers block until
    /// they complete and return their status; periodic transfers return at once
    /// and report every completion through their callback.
    fn submit_transfer(&self, request: &mut Request) -> Result<TransferStatus, UsbError>;

    /// Unschedules `request` and frees its descriptors.
    fn teardown_transfer(&self, request: &mut Request) -> Result<(), UsbError>;

    /// Handles an interrupt on the controller's (possibly shared) line.
    fn handle_interrupt(&self) -> IrqReturn;
}

impl Deref for Controller {
    type Target = dyn HostController;

    fn deref(&self) -> &Self::Target {
        match self {
            Self::Ohci(ohci) => ohci,
        }
    }
}
