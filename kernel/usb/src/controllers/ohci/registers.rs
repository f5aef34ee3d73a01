//! OHCI operational registers: their memory-mapped layout and typed access.

use alloc::boxed::Box;
use bilge::prelude::*;
use bitflags::bitflags;
use core::ptr::NonNull;
use static_assertions::assert_eq_size;
use volatile::{ReadOnly, Volatile};

/// The root hub has at most this many downstream ports.
pub const MAX_PORTS: usize = 15;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Register {
    Revision,
    Control,
    CommandStatus,
    InterruptStatus,
    InterruptEnable,
    InterruptDisable,
    Hcca,
    PeriodCurrentEd,
    ControlHeadEd,
    ControlCurrentEd,
    BulkHeadEd,
    BulkCurrentEd,
    DoneHead,
    FmInterval,
    FmRemaining,
    FmNumber,
    PeriodicStart,
    LsThreshold,
    RhDescriptorA,
    RhDescriptorB,
    RhStatus,
    PortStatus(usize),
}

impl Register {
    /// Byte offset from the start of the register space.
    pub fn offset(self) -> usize {
        match self {
            Register::Revision => 0x00,
            Register::Control => 0x04,
            Register::CommandStatus => 0x08,
            Register::InterruptStatus => 0x0C,
            Register::InterruptEnable => 0x10,
            Register::InterruptDisable => 0x14,
            Register::Hcca => 0x18,
            Register::PeriodCurrentEd => 0x1C,
            Register::ControlHeadEd => 0x20,
            Register::ControlCurrentEd => 0x24,
            Register::BulkHeadEd => 0x28,
            Register::BulkCurrentEd => 0x2C,
            Register::DoneHead => 0x30,
            Register::FmInterval => 0x34,
            Register::FmRemaining => 0x38,
            Register::FmNumber => 0x3C,
            Register::PeriodicStart => 0x40,
            Register::LsThreshold => 0x44,
            Register::RhDescriptorA => 0x48,
            Register::RhDescriptorB => 0x4C,
            Register::RhStatus => 0x50,
            Register::PortStatus(port) => 0x54 + 4 * port,
        }
    }
}

/// Raw 32-bit access to the registers of one controller.
pub trait RegisterIo: Send {
    fn read(&self, register: Register) -> u32;
    fn write(&mut self, register: Register, value: u32);
}

/// Memory-Mapped OHCI Operational Registers
#[derive(Debug)]
#[repr(C)]
pub struct OperationalRegisters {
    revision: ReadOnly<u32>,
    control: Volatile<u32>,
    command_status: Volatile<u32>,
    interrupt_status: Volatile<u32>,
    interrupt_enable: Volatile<u32>,
    interrupt_disable: Volatile<u32>,
    hcca: Volatile<u32>,
    period_current_ed: ReadOnly<u32>,
    control_head_ed: Volatile<u32>,
    control_current_ed: Volatile<u32>,
    bulk_head_ed: Volatile<u32>,
    bulk_current_ed: Volatile<u32>,
    done_head: ReadOnly<u32>,
    fm_interval: Volatile<u32>,
    fm_remaining: ReadOnly<u32>,
    fm_number: ReadOnly<u32>,
    periodic_start: Volatile<u32>,
    ls_threshold: Volatile<u32>,
    rh_descriptor_a: Volatile<u32>,
    rh_descriptor_b: Volatile<u32>,
    rh_status: Volatile<u32>,
    // 15 is a maximum, there may actually be less ports
    rh_port_status: [Volatile<u32>; MAX_PORTS],
}

assert_eq_size!(OperationalRegisters, [u8; 0x90]);

/// [`RegisterIo`] over the mapped register space of a real controller.
pub struct MmioRegisters {
    regs: NonNull<OperationalRegisters>,
}

unsafe impl Send for MmioRegisters {}

impl MmioRegisters {
    /// # Safety
    /// `regs` must map the controller's register space, uncached, for as long
    /// as the returned value lives.
    pub unsafe fn new(regs: NonNull<OperationalRegisters>) -> MmioRegisters {
        MmioRegisters { regs }
    }
}

impl RegisterIo for MmioRegisters {
    fn read(&self, register: Register) -> u32 {
        let regs = unsafe { self.regs.as_ref() };
        match register {
            Register::Revision => regs.revision.read(),
            Register::Control => regs.control.read(),
            Register::CommandStatus => regs.command_status.read(),
            Register::InterruptStatus => regs.interrupt_status.read(),
            Register::InterruptEnable => regs.interrupt_enable.read(),
            Register::InterruptDisable => regs.interrupt_disable.read(),
            Register::Hcca => regs.hcca.read(),
            Register::PeriodCurrentEd => regs.period_current_ed.read(),
            Register::ControlHeadEd => regs.control_head_ed.read(),
            Register::ControlCurrentEd => regs.control_current_ed.read(),
            Register::BulkHeadEd => regs.bulk_head_ed.read(),
            Register::BulkCurrentEd => regs.bulk_current_ed.read(),
            Register::DoneHead => regs.done_head.read(),
            Register::FmInterval => regs.fm_interval.read(),
            Register::FmRemaining => regs.fm_remaining.read(),
            Register::FmNumber => regs.fm_number.read(),
            Register::PeriodicStart => regs.periodic_start.read(),
            Register::LsThreshold => regs.ls_threshold.read(),
            Register::RhDescriptorA => regs.rh_descriptor_a.read(),
            Register::RhDescriptorB => regs.rh_descriptor_b.read(),
            Register::RhStatus => regs.rh_status.read(),
            Register::PortStatus(port) => regs.rh_port_status.get(port).map_or(0, |p| p.read()),
        }
    }

    fn write(&mut self, register: Register, value: u32) {
        let regs = unsafe { self.regs.as_mut() };
        let target = match register {
            Register::Control => &mut regs.control,
            Register::CommandStatus => &mut regs.command_status,
            Register::InterruptStatus => &mut regs.interrupt_status,
            Register::InterruptEnable => &mut regs.interrupt_enable,
            Register::InterruptDisable => &mut regs.interrupt_disable,
            Register::Hcca => &mut regs.hcca,
            Register::ControlHeadEd => &mut regs.control_head_ed,
            Register::ControlCurrentEd => &mut regs.control_current_ed,
            Register::BulkHeadEd => &mut regs.bulk_head_ed,
            Register::BulkCurrentEd => &mut regs.bulk_current_ed,
            Register::FmInterval => &mut regs.fm_interval,
            Register::PeriodicStart => &mut regs.periodic_start,
            Register::LsThreshold => &mut regs.ls_threshold,
            Register::RhDescriptorA => &mut regs.rh_descriptor_a,
            Register::RhDescriptorB => &mut regs.rh_descriptor_b,
            Register::RhStatus => &mut regs.rh_status,
            Register::PortStatus(port) => match regs.rh_port_status.get_mut(port) {
                Some(port) => port,
                None => return,
            },
            Register::Revision
            | Register::PeriodCurrentEd
            | Register::DoneHead
            | Register::FmRemaining
            | Register::FmNumber => {
                log::error!("BUG: write to read-only OHCI register {:?}", register);
                return;
            }
        };
        target.write(value);
    }
}

#[bitsize(2)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBits)]
pub enum FunctionalState {
    Reset = 0,
    Resume = 1,
    Operational = 2,
    Suspend = 3,
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub struct HcControl {
    /// Control to bulk service ratio, minus one.
    pub control_bulk_ratio: u2,
    pub periodic_list: bool,
    pub isochronous: bool,
    pub control_list: bool,
    pub bulk_list: bool,
    pub state: FunctionalState,
    /// Interrupts are routed to SMM rather than to us.
    pub interrupt_routing: bool,
    pub remote_wakeup_connected: bool,
    pub remote_wakeup_enable: bool,
    reserved: u21,
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub struct FmInterval {
    /// Bit times in a frame, minus one.
    pub frame_interval: u14,
    reserved: u2,
    /// FSMP: the largest data packet that fits a frame.
    pub largest_data_packet: u15,
    /// Must be flipped whenever the frame interval is written.
    pub toggle: bool,
}

impl FmInterval {
    /// The frame interval mandated for full-speed operation.
    pub const DEFAULT_FRAME_INTERVAL: u16 = 0x2EDF;

    /// FSMP for a frame interval: what is left after bit stuffing and overhead.
    pub fn largest_data_packet_for(frame_interval: u16) -> u16 {
        ((frame_interval.saturating_sub(210) as u32 * 6) / 7) as u16
    }
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub struct RhDescriptorA {
    pub downstream_ports: u8,
    /// Ports are powered individually rather than all at once.
    pub power_switching_mode: bool,
    /// Ports are always powered.
    pub no_power_switching: bool,
    pub device_type: bool,
    pub overcurrent_protection_mode: bool,
    pub no_overcurrent_protection: bool,
    reserved: u11,
    /// Power-on to power-good time, in units of 2 ms.
    pub power_on_to_good: u8,
}

bitflags! {
    /// Command bits; writing 1 sets them, writing 0 has no effect.
    pub struct CommandStatus: u32 {
        const HOST_CONTROLLER_RESET    = 1 << 0;
        const CONTROL_LIST_FILLED      = 1 << 1;
        const BULK_LIST_FILLED         = 1 << 2;
        const OWNERSHIP_CHANGE_REQUEST = 1 << 3;
    }
}

bitflags! {
    /// Shared layout of the interrupt status, enable and disable registers.
    pub struct Interrupts: u32 {
        const SCHEDULING_OVERRUN     = 1 << 0;
        const WRITEBACK_DONE_HEAD    = 1 << 1;
        const START_OF_FRAME         = 1 << 2;
        const RESUME_DETECTED        = 1 << 3;
        const UNRECOVERABLE_ERROR    = 1 << 4;
        const FRAME_NUMBER_OVERFLOW  = 1 << 5;
        const ROOT_HUB_STATUS_CHANGE = 1 << 6;
        const OWNERSHIP_CHANGE       = 1 << 30;
        const MASTER_INTERRUPT       = 1 << 31;
    }
}

bitflags! {
    /// Root hub status. Some bits mean something else when written.
    pub struct RhStatus: u32 {
        /// Read: local power status. Write: clear global power.
        const LOCAL_POWER_STATUS           = 1 << 0;
        const OVERCURRENT_INDICATOR        = 1 << 1;
        const DEVICE_REMOTE_WAKEUP_ENABLE  = 1 << 15;
        /// Write: set global power.
        const LOCAL_POWER_STATUS_CHANGE    = 1 << 16;
        const OVERCURRENT_INDICATOR_CHANGE = 1 << 17;
        const CLEAR_REMOTE_WAKEUP_ENABLE   = 1 << 31;
    }
}

bitflags! {
    /// Root hub port status. Writing a status bit triggers the matching
    /// command; writing a change bit clears it.
    pub struct PortFlags: u32 {
        /// Read: a device is attached. Write: disable the port.
        const CURRENT_CONNECT_STATUS       = 1 << 0;
        /// Write: enable the port.
        const PORT_ENABLE_STATUS           = 1 << 1;
        const PORT_SUSPEND_STATUS          = 1 << 2;
        const PORT_OVERCURRENT_INDICATOR   = 1 << 3;
        /// Write: start a port reset. Reads as set until the reset is over.
        const PORT_RESET_STATUS            = 1 << 4;
        /// Write: power the port.
        const PORT_POWER_STATUS            = 1 << 8;
        /// Read: the attached device is low speed. Write: unpower the port.
        const LOW_SPEED_DEVICE_ATTACHED    = 1 << 9;
        const CONNECT_STATUS_CHANGE        = 1 << 16;
        const PORT_ENABLE_STATUS_CHANGE    = 1 << 17;
        const PORT_SUSPEND_STATUS_CHANGE   = 1 << 18;
        const OVERCURRENT_INDICATOR_CHANGE = 1 << 19;
        const PORT_RESET_STATUS_CHANGE     = 1 << 20;

        const CHANGE_BITS = Self::CONNECT_STATUS_CHANGE.bits
            | Self::PORT_ENABLE_STATUS_CHANGE.bits
            | Self::PORT_SUSPEND_STATUS_CHANGE.bits
            | Self::OVERCURRENT_INDICATOR_CHANGE.bits
            | Self::PORT_RESET_STATUS_CHANGE.bits;
    }
}

/// Typed access on top of a [`RegisterIo`].
pub(crate) struct Registers(Box<dyn RegisterIo>);

impl Registers {
    pub fn new(io: Box<dyn RegisterIo>) -> Registers {
        Registers(io)
    }

    pub fn read(&self, register: Register) -> u32 {
        self.0.read(register)
    }

    pub fn write(&mut self, register: Register, value: u32) {
        self.0.write(register, value)
    }

    pub fn revision(&self) -> u8 {
        self.read(Register::Revision) as u8
    }

    pub fn control(&self) -> HcControl {
        HcControl::from(self.read(Register::Control))
    }

    pub fn set_control(&mut self, control: HcControl) {
        self.write(Register::Control, control.into())
    }

    pub fn update_control<F: FnOnce(&mut HcControl)>(&mut self, f: F) {
        let mut control = self.control();
        f(&mut control);
        self.set_control(control);
    }

    pub fn command_status(&self) -> CommandStatus {
        CommandStatus::from_bits_truncate(self.read(Register::CommandStatus))
    }

    /// Sets the given command bits; the others are left alone by the hardware.
    pub fn command(&mut self, command: CommandStatus) {
        self.write(Register::CommandStatus, command.bits())
    }

    pub fn interrupt_status(&self) -> Interrupts {
        Interrupts::from_bits_truncate(self.read(Register::InterruptStatus))
    }

    pub fn enabled_interrupts(&self) -> Interrupts {
        Interrupts::from_bits_truncate(self.read(Register::InterruptEnable))
    }

    pub fn acknowledge(&mut self, interrupts: Interrupts) {
        self.write(Register::InterruptStatus, interrupts.bits())
    }

    pub fn enable_interrupts(&mut self, interrupts: Interrupts) {
        self.write(Register::InterruptEnable, interrupts.bits())
    }

    pub fn disable_interrupts(&mut self, interrupts: Interrupts) {
        self.write(Register::InterruptDisable, interrupts.bits())
    }

    pub fn fm_interval(&self) -> FmInterval {
        FmInterval::from(self.read(Register::FmInterval))
    }

    pub fn set_fm_interval(&mut self, interval: FmInterval) {
        self.write(Register::FmInterval, interval.into())
    }

    pub fn descriptor_a(&self) -> RhDescriptorA {
        RhDescriptorA::from(self.read(Register::RhDescriptorA))
    }

    pub fn set_descriptor_a(&mut self, descriptor: RhDescriptorA) {
        self.write(Register::RhDescriptorA, descriptor.into())
    }

    pub fn set_rh_status(&mut self, status: RhStatus) {
        self.write(Register::RhStatus, status.bits())
    }

    pub fn port(&self, port: usize) -> PortFlags {
        PortFlags::from_bits_truncate(self.read(Register::PortStatus(port)))
    }

    pub fn write_port(&mut self, port: usize, flags: PortFlags) {
        self.write(Register::PortStatus(port), flags.bits())
    }
}
