//! Structures the controller reads from (and writes to) memory.
//!
//! Every link between them is a physical address; the driver finds its way
//! back from such an address through the DMA arrays the structures live in.

use crate::allocators::DmaCell;
use bilge::prelude::*;
use static_assertions::{assert_eq_size, const_assert_eq};
use zerocopy::{FromBytes, FromZeroes};

/// Number of endpoint descriptors forming the interrupt tree: 16 + 8 + 4 + 2 + 1.
pub const TREE_SIZE: usize = 31;

/// Number of entries of the interrupt table in the HCCA, one per 32 ms slot.
pub const INTERRUPT_TABLE_SIZE: usize = 32;

/// Condition code of a descriptor the controller has not processed yet.
pub const CC_NOT_ACCESSED: u8 = 0xF;

/// Delay interrupt value meaning "no interrupt for this TD".
pub const NO_INTERRUPT: u8 = 7;

/// Head pointer flag: the endpoint halted on an error.
pub const HEAD_HALTED: u32 = 1 << 0;
/// Descriptor links are 16-byte aligned; the low bits hold flags.
pub const LINK_MASK: u32 = !0xF;

/// Condition code bits of an isochronous offset word before the controller used it.
pub const OFFSET_NOT_ACCESSED: u32 = 0b111 << 13;

/// Condition code of a packet shorter than the endpoint's maximum.
pub const CC_DATA_UNDERRUN: u8 = 9;

#[bitsize(2)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBits)]
pub enum EdDirection {
    FromTd = 0,
    Out = 1,
    In = 2,
    AlsoFromTd = 3,
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub struct EdControl {
    pub address: u7,
    pub endpoint: u4,
    pub direction: EdDirection,
    pub low_speed: bool,
    /// The controller passes over the endpoint while this is set.
    pub skip: bool,
    /// TDs are isochronous ones.
    pub isochronous: bool,
    pub max_packet_size: u11,
    reserved: u5,
}

#[derive(FromZeroes, FromBytes)]
#[repr(C, align(16))]
pub struct EndpointDescriptor {
    pub control: DmaCell<u32>,
    /// Physical address of the last TD; the controller stops when head reaches it.
    pub tail: DmaCell<u32>,
    /// Physical address of the next TD to process, plus the halted and toggle flags.
    pub head: DmaCell<u32>,
    pub next: DmaCell<u32>,
}

assert_eq_size!(EndpointDescriptor, [u8; 16]);

impl EndpointDescriptor {
    pub fn control(&self) -> EdControl {
        EdControl::from(self.control.read())
    }

    pub fn set_control(&mut self, control: EdControl) {
        self.control.write(control.into())
    }

    pub fn set_skip(&mut self, skip: bool) {
        let mut control = self.control();
        control.set_skip(skip);
        self.set_control(control);
    }

    pub fn is_halted(&self) -> bool {
        self.head.read() & HEAD_HALTED != 0
    }
}

#[bitsize(2)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBits)]
pub enum Pid {
    Setup = 0,
    Out = 1,
    In = 2,
    Reserved = 3,
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub struct TdControl {
    reserved: u18,
    /// A short last packet is not an error.
    pub rounding: bool,
    pub pid: Pid,
    pub delay_interrupt: u3,
    pub toggle: bool,
    /// Take the toggle from this TD rather than from the endpoint.
    pub toggle_from_td: bool,
    pub error_count: u2,
    pub condition: u4,
}

/// General transfer descriptor, for control, bulk and interrupt endpoints.
#[derive(FromZeroes, FromBytes)]
#[repr(C, align(16))]
pub struct GeneralTd {
    pub control: DmaCell<u32>,
    /// Current buffer pointer; zero once every byte was transferred.
    pub cbp: DmaCell<u32>,
    pub next: DmaCell<u32>,
    /// Physical address of the last byte of the buffer.
    pub buffer_end: DmaCell<u32>,
}

assert_eq_size!(GeneralTd, [u8; 16]);

impl GeneralTd {
    pub fn control(&self) -> TdControl {
        TdControl::from(self.control.read())
    }

    pub fn set_control(&mut self, control: TdControl) {
        self.control.write(control.into())
    }

    pub fn condition(&self) -> u8 {
        self.control().condition().value()
    }
}

#[bitsize(32)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub struct ItdControl {
    pub start_frame: u16,
    reserved: u5,
    pub delay_interrupt: u3,
    /// Number of frames, minus one.
    pub frame_count: u3,
    reserved2: u1,
    pub condition: u4,
}

/// Isochronous transfer descriptor: up to 8 consecutive frames of one buffer.
#[derive(FromZeroes, FromBytes)]
#[repr(C, align(32))]
pub struct IsochronousTd {
    pub control: DmaCell<u32>,
    /// Page of the buffer start; the low 12 bits are ignored.
    pub buffer_page: DmaCell<u32>,
    pub next: DmaCell<u32>,
    pub buffer_end: DmaCell<u32>,
    pub offsets: [DmaCell<u16>; 8],
}

assert_eq_size!(IsochronousTd, [u8; 32]);

impl IsochronousTd {
    pub fn control(&self) -> ItdControl {
        ItdControl::from(self.control.read())
    }

    pub fn set_control(&mut self, control: ItdControl) {
        self.control.write(control.into())
    }

    pub fn condition(&self) -> u8 {
        self.control().condition().value()
    }
}

/// What the controller writes over an isochronous offset word once the frame is over.
#[bitsize(16)]
#[derive(DebugBits, Copy, Clone, FromBits)]
pub struct PacketStatus {
    /// Bytes received; zero for OUT packets.
    pub size: u11,
    reserved: u1,
    pub condition: u4,
}

/// Host Controller Communication Area
#[derive(FromZeroes, FromBytes)]
#[repr(C, align(256))]
pub struct Hcca {
    /// Heads of the 32 interrupt lists, one visited per frame.
    pub interrupt_table: [DmaCell<u32>; INTERRUPT_TABLE_SIZE],
    pub frame_number: DmaCell<u16>,
    pad: u16,
    /// Physical address of the last completed TD, bit 0 set if other
    /// interrupts are pending too.
    pub done_head: DmaCell<u32>,
    reserved: [u8; 116],
}

const_assert_eq!(core::mem::size_of::<Hcca>(), 256);

/// The HCCA followed by the interrupt tree and the TD every idle endpoint points at.
#[derive(FromZeroes, FromBytes)]
#[repr(C, align(256))]
pub struct CommunicationArea {
    pub hcca: Hcca,
    pub tree: [EndpointDescriptor; TREE_SIZE],
    pub null_td: GeneralTd,
}

/// A transfer descriptor as it was before the controller first processed it.
///
/// Periodic transfers are restarted from this copy after every completion.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TdImage {
    words: [u32; 4],
    offsets: [u16; 8],
}

impl TdImage {
    pub fn of_general(td: &GeneralTd) -> TdImage {
        TdImage {
            words: [td.control.read(), td.cbp.read(), td.next.read(), td.buffer_end.read()],
            offsets: [0; 8],
        }
    }

    pub fn of_isochronous(td: &IsochronousTd) -> TdImage {
        let mut offsets = [0; 8];
        for (saved, offset) in offsets.iter_mut().zip(td.offsets.iter()) {
            *saved = offset.read();
        }
        TdImage {
            words: [td.control.read(), td.buffer_page.read(), td.next.read(), td.buffer_end.read()],
            offsets,
        }
    }

    pub fn restore_general(&self, td: &mut GeneralTd) {
        td.control.write(self.words[0]);
        td.cbp.write(self.words[1]);
        td.next.write(self.words[2]);
        td.buffer_end.write(self.words[3]);
    }

    pub fn restore_isochronous(&self, td: &mut IsochronousTd) {
        td.control.write(self.words[0]);
        td.buffer_page.write(self.words[1]);
        td.next.write(self.words[2]);
        td.buffer_end.write(self.words[3]);
        for (offset, saved) in td.offsets.iter_mut().zip(self.offsets.iter()) {
            offset.write(*saved);
        }
    }

    /// Where in the buffer frame `frame` of a saved isochronous TD starts.
    pub fn frame_offset(&self, frame: usize) -> usize {
        // page-crossing bit and offset within the page
        self.offsets.get(frame).map_or(0, |offset| (offset & 0x1FFF) as usize)
    }

    /// Flips the data toggle of a saved general TD.
    pub fn flip_toggle(&mut self) {
        let mut control = TdControl::from(self.words[0]);
        control.set_toggle(!control.toggle());
        self.words[0] = control.into();
    }
}
