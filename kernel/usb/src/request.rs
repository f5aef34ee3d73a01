//! Transfers as a device driver hands them to a host controller.
//!
//! A [`Request`] is built in steps against one controller:
//! [`transaction_init`](HostController::transaction_init) prepares it, each of
//! [`transaction_setup`](HostController::transaction_setup),
//! [`transaction_in`](HostController::transaction_in) and
//! [`transaction_out`](HostController::transaction_out) appends transactions,
//! then [`submit_transfer`](HostController::submit_transfer) runs it and
//! [`teardown_transfer`](HostController::teardown_transfer) releases what it used.

use super::*;
use crate::controllers::ohci::{ScheduledRequest, TdHandle};
use alloc::vec::Vec;
use bilge::prelude::*;

pub struct Request {
    pub kind: TransferKind,
    pub device: DeviceAddress,
    pub low_speed: bool,
    /// Copy of the target endpoint; its toggle advances as transactions are added.
    pub endpoint: UsbEndpoint,
    pub status: TransferStatus,
    pub(crate) transactions: Vec<Transaction>,
    pub(crate) callback: Option<TransferCallback>,
    pub(crate) scheduled: Option<ScheduledRequest>,
}

impl Request {
    pub fn new(device: DeviceAddress, low_speed: bool, endpoint: UsbEndpoint) -> Request {
        Request {
            kind: endpoint.kind,
            device,
            low_speed,
            endpoint,
            status: TransferStatus::NotProcessed,
            transactions: Vec::new(),
            callback: None,
            scheduled: None,
        }
    }

    /// Sets the function run on every completion of a periodic transfer.
    pub fn with_callback(mut self, callback: TransferCallback) -> Request {
        self.callback = Some(callback);
        self
    }

    pub fn transactions(&self) -> &[Transaction] {
        &self.transactions
    }

    /// The bytes received by the IN transactions, in order.
    pub fn received(&self) -> Vec<u8> {
        self.transactions
            .iter()
            .filter(|t| t.kind == TransactionKind::In)
            .flat_map(|t| t.data.iter().copied())
            .collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransactionKind {
    Setup,
    In,
    Out,
}

/// One transfer descriptor's worth of a request.
#[derive(Debug)]
pub struct Transaction {
    pub kind: TransactionKind,
    pub length: usize,
    /// OUT: the bytes sent. IN: the bytes received, filled once the request finished.
    pub data: Vec<u8>,
    pub(crate) td: TdHandle,
}

/// The 8-byte packet that starts every control transfer.
#[bitsize(64)]
#[derive(DebugBits, Copy, Clone, FromBits, PartialEq)]
pub struct SetupPacket {
    pub recipient: Recipient,
    pub req_type: RequestType,
    pub direction: Direction,

    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub len: u16,
}

impl SetupPacket {
    pub fn get_descriptor(descriptor_type: u8, descriptor_index: u8, len: u16) -> SetupPacket {
        SetupPacket::new(
            Recipient::Device,
            RequestType::Standard,
            Direction::In,
            std_req::GET_DESCRIPTOR,
            ((descriptor_type as u16) << 8) | (descriptor_index as u16),
            0u16,
            len,
        )
    }

    pub fn set_address(address: DeviceAddress) -> SetupPacket {
        SetupPacket::new(
            Recipient::Device,
            RequestType::Standard,
            Direction::Out,
            std_req::SET_ADDRESS,
            address as u16,
            0u16,
            0u16,
        )
    }

    pub fn set_configuration(configuration: u8) -> SetupPacket {
        SetupPacket::new(
            Recipient::Device,
            RequestType::Standard,
            Direction::Out,
            std_req::SET_CONFIGURATION,
            configuration as u16,
            0u16,
            0u16,
        )
    }

    /// The packet as it goes on the wire.
    pub fn to_bytes(self) -> [u8; 8] {
        u64::from(self).to_le_bytes()
    }
}

#[bitsize(1)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBits)]
pub enum Direction {
    /// Host to function
    Out = 0,
    /// Function to host
    In = 1,
}

#[bitsize(5)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBits)]
pub enum Recipient {
    Device = 0x0,
    Interface = 0x1,
    Endpoint = 0x2,
    Other = 0x3,
    #[fallback]
    Reserved = 0x4,
}

#[bitsize(2)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, FromBits)]
pub enum RequestType {
    Standard = 0x0,
    Class = 0x1,
    Vendor = 0x2,
    Reserved = 0x3,
}

pub mod std_req {
    pub const GET_STATUS: u8 = 0x00;
    pub const CLEAR_FEATURE: u8 = 0x01;
    pub const SET_FEATURE: u8 = 0x03;
    pub const SET_ADDRESS: u8 = 0x05;
    pub const GET_DESCRIPTOR: u8 = 0x06;
    pub const SET_DESCRIPTOR: u8 = 0x07;
    pub const GET_CONFIGURATION: u8 = 0x08;
    pub const SET_CONFIGURATION: u8 = 0x09;
}
