/// OHCI Controller support

use super::*;
use crate::allocators::{AllocSlot, DmaArray, DmaBox, SlotPool};
use alloc::{
    collections::{BTreeMap, BTreeSet},
    sync::Arc,
    vec::Vec,
};
use bilge::prelude::*;
use core::mem::size_of;
use kernel_config::usb::*;
use log::{debug, info, warn};
use scheduler_priority::{WaitToken, WakeReason};
use sync_irq::IrqSafeMutex;

mod descriptors;
mod interrupt;
mod registers;
mod root_hub;
mod schedule;

use descriptors::*;
pub(crate) use interrupt::transfer_status;
use registers::*;
pub use registers::{MmioRegisters, OperationalRegisters, Register, RegisterIo};

/// Identifies a submitted request until it is torn down.
pub(crate) type RequestId = u32;

/// An endpoint descriptor, wherever it lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EdHandle {
    /// Control and bulk endpoints, from the fixed pool.
    Pooled(AllocSlot),
    /// Interrupt and isochronous endpoints, allocated one by one.
    Periodic(usize),
    /// A node of the interrupt tree.
    Tree(usize),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TdHandle {
    /// From the TD pool of a control or bulk endpoint.
    Pooled { endpoint: EndpointId, slot: AllocSlot },
    /// Interrupt and isochronous TDs.
    Dynamic(usize),
}

/// Where a periodic endpoint descriptor was linked into the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Bucket {
    /// Polling period in frames, a power of two up to 32.
    pub period: usize,
    /// Which of the `period` lists of that period.
    pub index: usize,
}

/// The controller resources held by a [`Request`] between
/// `transaction_init` and `teardown_transfer`.
#[derive(Debug)]
pub(crate) struct ScheduledRequest {
    pub ed: EdHandle,
    /// Terminates the TD chain once the request was submitted.
    pub dummy: Option<TdHandle>,
    /// Set from submission until completion (control, bulk) or teardown (periodic).
    pub id: Option<RequestId>,
    pub bucket: Option<Bucket>,
}

/// A request the controller may be working on.
pub(crate) struct InFlight {
    pub id: RequestId,
    pub kind: TransferKind,
    pub ed: EdHandle,
    pub tds: Vec<(TdHandle, TransactionKind, usize)>,
    pub callback: Option<TransferCallback>,
}

/// Software state of the control or bulk list.
#[derive(Debug, Default)]
pub(crate) struct AsyncList {
    /// Requests on the hardware list that did not complete yet.
    pub pending: usize,
    /// Submitted while the list was busy, linked to each other but not to the hardware yet.
    pub queued: Vec<EdHandle>,
}

/// TD pool of a control or bulk endpoint, each TD with a buffer of `stride` bytes.
pub(crate) struct EndpointPool {
    pub stride: usize,
    pub tds: SlotPool<GeneralTd>,
    pub buffers: DmaArray<u8>,
}

impl EndpointPool {
    fn buffer_range(&self, slot: AllocSlot, length: usize) -> core::ops::Range<usize> {
        let start = slot.index() * self.stride;
        start..start + length
    }
}

pub(crate) enum DynamicDescriptor {
    General(DmaBox<GeneralTd>),
    Isochronous(DmaBox<IsochronousTd>),
}

/// An interrupt or isochronous TD with its buffer and its restart copy.
pub(crate) struct DynamicTd {
    pub descriptor: DynamicDescriptor,
    pub buffer: Option<DmaArray<u8>>,
    pub saved: TdImage,
}

impl DynamicTd {
    fn address(&self) -> UsbPointer {
        match &self.descriptor {
            DynamicDescriptor::General(td) => td.address(),
            DynamicDescriptor::Isochronous(td) => td.address(),
        }
    }

    fn next(&self) -> u32 {
        match &self.descriptor {
            DynamicDescriptor::General(td) => td.next.read(),
            DynamicDescriptor::Isochronous(td) => td.next.read(),
        }
    }

    fn set_next(&mut self, next: UsbPointer) {
        match &mut self.descriptor {
            DynamicDescriptor::General(td) => td.next.write(next.0),
            DynamicDescriptor::Isochronous(td) => td.next.write(next.0),
        }
    }

    fn condition(&self) -> u8 {
        match &self.descriptor {
            DynamicDescriptor::General(td) => td.condition(),
            DynamicDescriptor::Isochronous(td) => td.condition(),
        }
    }

    fn set_delay_interrupt(&mut self, delay: u8) {
        match &mut self.descriptor {
            DynamicDescriptor::General(td) => {
                let mut control = td.control();
                control.set_delay_interrupt(u3::new(delay));
                td.set_control(control);
            }
            DynamicDescriptor::Isochronous(td) => {
                let mut control = td.control();
                control.set_delay_interrupt(u3::new(delay));
                td.set_control(control);
            }
        }
    }

    /// Isochronous TDs only: the frame their first packet goes out in.
    fn set_start_frame(&mut self, frame: u16) {
        if let DynamicDescriptor::Isochronous(td) = &mut self.descriptor {
            let mut control = td.control();
            control.set_start_frame(frame);
            td.set_control(control);
        }
    }

    fn save(&mut self) {
        self.saved = match &self.descriptor {
            DynamicDescriptor::General(td) => TdImage::of_general(td),
            DynamicDescriptor::Isochronous(td) => TdImage::of_isochronous(td),
        };
    }

    fn restore(&mut self) {
        match &mut self.descriptor {
            DynamicDescriptor::General(td) => self.saved.restore_general(td),
            DynamicDescriptor::Isochronous(td) => self.saved.restore_isochronous(td),
        }
    }

    /// Appends what the controller received into this TD's buffer, at most `length` bytes.
    fn received(&self, length: usize, data: &mut Vec<u8>) {
        let Some(buffer) = &self.buffer else { return };
        let bytes = buffer.as_slice();
        let length = length.min(bytes.len());
        match &self.descriptor {
            DynamicDescriptor::General(td) => {
                let cbp = td.cbp.read();
                let received = match cbp {
                    0 => length,
                    cbp => (cbp.saturating_sub(buffer.address().0) as usize).min(length),
                };
                data.extend_from_slice(&bytes[..received]);
            }
            DynamicDescriptor::Isochronous(td) => {
                // the controller replaced every offset word with the status of its packet
                let frames = td.control().frame_count().value() as usize + 1;
                for (frame, word) in td.offsets.iter().take(frames).enumerate() {
                    let packet = PacketStatus::from(word.read());
                    if !matches!(packet.condition().value(), 0 | CC_DATA_UNDERRUN) {
                        continue;
                    }
                    let start = self.saved.frame_offset(frame).min(length);
                    let end = (start + packet.size().value() as usize).min(length);
                    data.extend_from_slice(&bytes[start..end]);
                }
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PowerMode {
    /// Ports are always powered.
    AlwaysOn,
    PerPort,
    Global,
}

/// Everything behind the controller lock.
pub(crate) struct OhciState {
    pub id: u32,
    pub regs: Registers,
    pub dma: Arc<dyn DmaAllocator>,
    pub timer: Arc<dyn Timer>,
    pub area: DmaBox<CommunicationArea>,
    pub eds: SlotPool<EndpointDescriptor>,
    pub periodic_eds: Vec<Option<DmaBox<EndpointDescriptor>>>,
    pub endpoints: BTreeMap<EndpointId, EndpointPool>,
    pub next_endpoint: u32,
    pub dynamic_tds: Vec<Option<DynamicTd>>,
    pub control: AsyncList,
    pub bulk: AsyncList,
    /// Round-robin bucket cursor per period: 1, 2, 4, 8, 16 and 32 frames.
    pub cursors: [usize; 6],
    pub in_flight: Vec<InFlight>,
    /// Control and bulk requests completed but not collected by their submitter yet.
    pub finished: BTreeSet<RequestId>,
    pub next_request: RequestId,
    pub ports: usize,
    pub power_mode: PowerMode,
    pub power_on_delay_ms: u64,
}

/// A periodic completion waiting to be reported to its request's callback.
#[derive(Debug)]
pub(crate) struct Completion {
    pub id: RequestId,
    pub status: TransferStatus,
    pub data: Vec<u8>,
}

/// What the interrupt handler leaves to be done once the controller is unlocked.
#[derive(Debug, Default)]
pub(crate) struct Deferred {
    pub wake: Vec<WaitToken>,
    pub completions: Vec<Completion>,
    pub events: Vec<HcdEvent>,
}

pub struct OhciController {
    id: u32,
    events: Arc<dyn UsbEventSink>,
    parker: Arc<dyn Parker>,
    pub(crate) state: IrqSafeMutex<OhciState>,
}

impl OhciController {
    /// Takes the controller from firmware, resets it, powers the root hub ports
    /// and reports the devices already attached.
    pub fn new(
        id: u32,
        registers: Box<dyn RegisterIo>,
        dma: Arc<dyn DmaAllocator>,
        timer: Arc<dyn Timer>,
        events: Arc<dyn UsbEventSink>,
        parker: Arc<dyn Parker>,
    ) -> Result<OhciController, UsbError> {
        let regs = Registers::new(registers);

        let revision = regs.revision();
        if revision != 0x10 && revision != 0x11 {
            log::error!("[USB-OHCI] Unsupported revision {:#x}", revision);
            return Err(UsbError::BadRevision(revision));
        }

        let mut state = OhciState {
            id,
            regs,
            area: DmaBox::new(&dma)?,
            eds: SlotPool::new("OhciEdPool", &dma, OHCI_ED_POOL_SIZE)?,
            periodic_eds: Vec::new(),
            endpoints: BTreeMap::new(),
            next_endpoint: 0,
            dynamic_tds: Vec::new(),
            control: AsyncList::default(),
            bulk: AsyncList::default(),
            cursors: [0; 6],
            in_flight: Vec::new(),
            finished: BTreeSet::new(),
            next_request: 0,
            ports: 0,
            power_mode: PowerMode::AlwaysOn,
            power_on_delay_ms: MIN_POWER_ON_DELAY_MS,
            dma,
            timer,
        };

        state.init_queues()?;
        state.take_ownership()?;
        state.reset()?;
        let connected = state.setup_root_hub();

        let controller = OhciController { id, events, parker, state: IrqSafeMutex::new(state) };
        for port in connected {
            controller.events.hcd_event(id, HcdEvent::Connected(port));
        }

        info!("[USB-OHCI] Controller {} is operational (revision {:#x})", id, revision);
        Ok(controller)
    }

    /// Carries out what the interrupt handler deferred. Runs unlocked, so
    /// callbacks may call back into the controller.
    fn emit(&self, deferred: Deferred) {
        for token in deferred.wake {
            if !self.parker.wake_one(token) {
                debug!("[USB-OHCI] nobody waits on {:?}", token);
            }
        }
        for completion in deferred.completions {
            let callback = self.state.lock().take_callback(completion.id);
            let Some(mut callback) = callback else { continue };
            callback(completion.status, &completion.data);
            // a callback that tore its request down is dropped here
            self.state.lock().return_callback(completion.id, callback);
        }
        for event in deferred.events {
            self.events.hcd_event(self.id, event);
        }
    }

    /// Logs the interrupt tree and the periodic endpoints hanging off it.
    pub fn dump_periodic_schedule(&self) {
        self.state.lock().dump_periodic_schedule()
    }
}

impl OhciState {
    fn take_callback(&mut self, id: RequestId) -> Option<TransferCallback> {
        self.in_flight.iter_mut().find(|request| request.id == id).and_then(|request| request.callback.take())
    }

    fn return_callback(&mut self, id: RequestId, callback: TransferCallback) {
        if let Some(request) = self.in_flight.iter_mut().find(|request| request.id == id) {
            request.callback = Some(callback);
        }
    }

    pub fn ed_address(&self, handle: EdHandle) -> Result<UsbPointer, UsbError> {
        match handle {
            EdHandle::Pooled(slot) => self.eds.address_of(slot),
            EdHandle::Periodic(index) => self
                .periodic_eds
                .get(index)
                .and_then(Option::as_ref)
                .map(|ed| ed.address())
                .ok_or(UsbError::UnknownHandle),
            EdHandle::Tree(index) => match index < TREE_SIZE {
                true => Ok(self.tree_address(index)),
                false => Err(UsbError::UnknownHandle),
            },
        }
    }

    pub fn ed_mut(&mut self, handle: EdHandle) -> Result<&mut EndpointDescriptor, UsbError> {
        match handle {
            EdHandle::Pooled(slot) => self.eds.get_mut(slot),
            EdHandle::Periodic(index) => self
                .periodic_eds
                .get_mut(index)
                .and_then(Option::as_mut)
                .map(|ed| &mut **ed)
                .ok_or(UsbError::UnknownHandle),
            EdHandle::Tree(index) => self.area.tree.get_mut(index).ok_or(UsbError::UnknownHandle),
        }
    }

    /// The endpoint descriptor the controller knows as `addr`.
    pub fn resolve_ed(&self, addr: UsbPointer) -> Option<EdHandle> {
        if let Ok(slot) = self.eds.find(addr) {
            return Some(EdHandle::Pooled(slot));
        }

        let tree_start = self.tree_address(0).0;
        if let Some(offset) = addr.0.checked_sub(tree_start) {
            let index = offset as usize / size_of::<EndpointDescriptor>();
            if offset as usize % size_of::<EndpointDescriptor>() == 0 && index < TREE_SIZE {
                return Some(EdHandle::Tree(index));
            }
        }

        self.periodic_eds
            .iter()
            .position(|ed| ed.as_ref().map_or(false, |ed| ed.address() == addr))
            .map(EdHandle::Periodic)
    }

    pub fn tree_address(&self, index: usize) -> UsbPointer {
        self.area.address().offset(size_of::<Hcca>() + index * size_of::<EndpointDescriptor>())
    }

    pub fn null_td_address(&self) -> UsbPointer {
        self.area.address().offset(size_of::<Hcca>() + TREE_SIZE * size_of::<EndpointDescriptor>())
    }

    pub fn td_address(&self, handle: TdHandle) -> Result<UsbPointer, UsbError> {
        match handle {
            TdHandle::Pooled { endpoint, slot } => {
                self.endpoints.get(&endpoint).ok_or(UsbError::UnknownHandle)?.tds.address_of(slot)
            }
            TdHandle::Dynamic(index) => self.dynamic_td(index).map(DynamicTd::address),
        }
    }

    pub fn dynamic_td(&self, index: usize) -> Result<&DynamicTd, UsbError> {
        self.dynamic_tds.get(index).and_then(Option::as_ref).ok_or(UsbError::UnknownHandle)
    }

    pub fn dynamic_td_mut(&mut self, index: usize) -> Result<&mut DynamicTd, UsbError> {
        self.dynamic_tds.get_mut(index).and_then(Option::as_mut).ok_or(UsbError::UnknownHandle)
    }

    pub fn pooled_td_mut(&mut self, endpoint: EndpointId, slot: AllocSlot) -> Result<&mut GeneralTd, UsbError> {
        self.endpoints.get_mut(&endpoint).ok_or(UsbError::UnknownHandle)?.tds.get_mut(slot)
    }

    pub fn td_next(&self, handle: TdHandle) -> Result<u32, UsbError> {
        match handle {
            TdHandle::Pooled { endpoint, slot } => {
                Ok(self.endpoints.get(&endpoint).ok_or(UsbError::UnknownHandle)?.tds.get(slot)?.next.read())
            }
            TdHandle::Dynamic(index) => self.dynamic_td(index).map(DynamicTd::next),
        }
    }

    pub fn td_set_next(&mut self, handle: TdHandle, next: UsbPointer) -> Result<(), UsbError> {
        match handle {
            TdHandle::Pooled { endpoint, slot } => self.pooled_td_mut(endpoint, slot)?.next.write(next.0),
            TdHandle::Dynamic(index) => self.dynamic_td_mut(index)?.set_next(next),
        }
        Ok(())
    }

    pub fn td_condition(&self, handle: TdHandle) -> Result<u8, UsbError> {
        match handle {
            TdHandle::Pooled { endpoint, slot } => {
                Ok(self.endpoints.get(&endpoint).ok_or(UsbError::UnknownHandle)?.tds.get(slot)?.condition())
            }
            TdHandle::Dynamic(index) => self.dynamic_td(index).map(DynamicTd::condition),
        }
    }

    pub fn td_set_delay_interrupt(&mut self, handle: TdHandle, delay: u8) -> Result<(), UsbError> {
        match handle {
            TdHandle::Pooled { endpoint, slot } => {
                let td = self.pooled_td_mut(endpoint, slot)?;
                let mut control = td.control();
                control.set_delay_interrupt(u3::new(delay));
                td.set_control(control);
            }
            TdHandle::Dynamic(index) => self.dynamic_td_mut(index)?.set_delay_interrupt(delay),
        }
        Ok(())
    }

    pub fn free_td(&mut self, handle: TdHandle) -> Result<(), UsbError> {
        match handle {
            TdHandle::Pooled { endpoint, slot } => {
                self.endpoints.get_mut(&endpoint).ok_or(UsbError::UnknownHandle)?.tds.free(slot)
            }
            TdHandle::Dynamic(index) => match self.dynamic_tds.get_mut(index).and_then(Option::take) {
                Some(_) => Ok(()),
                None => Err(UsbError::UnknownHandle),
            },
        }
    }

    pub fn free_ed(&mut self, handle: EdHandle) -> Result<(), UsbError> {
        match handle {
            EdHandle::Pooled(slot) => self.eds.free(slot),
            EdHandle::Periodic(index) => match self.periodic_eds.get_mut(index).and_then(Option::take) {
                Some(_) => Ok(()),
                None => Err(UsbError::UnknownHandle),
            },
            EdHandle::Tree(_) => Err(UsbError::InvalidState),
        }
    }

    pub fn list(&mut self, kind: TransferKind) -> &mut AsyncList {
        match kind {
            TransferKind::Bulk => &mut self.bulk,
            _ => &mut self.control,
        }
    }

    /// Takes the controller away from SMM or BIOS firmware.
    pub fn take_ownership(&mut self) -> Result<(), UsbError> {
        let control = self.regs.control();

        if control.interrupt_routing() {
            info!("[USB-OHCI] Controller owned by SMM, requesting ownership change");
            self.regs.command(CommandStatus::OWNERSHIP_CHANGE_REQUEST);
            let regs = &self.regs;
            let handoff = try_wait_until!(
                self.timer,
                OWNERSHIP_POLL_MS,
                OWNERSHIP_TIMEOUT_MS,
                !regs.control().interrupt_routing()
            );

            if handoff.is_err() {
                warn!("[USB-OHCI] SMM did not release the controller, clearing interrupt routing");
                self.regs.update_control(|c| c.set_interrupt_routing(false));
                let regs = &self.regs;
                try_wait_until!(
                    self.timer,
                    OWNERSHIP_POLL_MS,
                    OWNERSHIP_TIMEOUT_MS,
                    !regs.control().interrupt_routing()
                )
                .map_err(|_| {
                    log::error!("[USB-OHCI] Failed to take ownership of controller {}", self.id);
                    UsbError::OwnershipRefused
                })?;
            }
        } else if control.state() != FunctionalState::Reset {
            // BIOS driver
            if control.state() != FunctionalState::Operational {
                self.regs.update_control(|c| c.set_state(FunctionalState::Resume));
            }
            self.timer.delay_ms(CONTROLLER_SETTLE_MS);
        } else {
            // cold boot, nobody touched the controller
            self.timer.delay_ms(CONTROLLER_SETTLE_MS);
        }

        Ok(())
    }

    /// Resets the controller and brings it back to the operational state.
    ///
    /// Between installing the HCCA and going operational the controller must
    /// not wait more than 2 ms, so nothing in that stretch sleeps.
    pub fn reset(&mut self) -> Result<(), UsbError> {
        let mut interval = self.regs.fm_interval();
        let mut frame_interval = interval.frame_interval().value();
        if frame_interval == 0 {
            warn!("[USB-OHCI] Frame interval is zero, using {:#x}", FmInterval::DEFAULT_FRAME_INTERVAL);
            frame_interval = FmInterval::DEFAULT_FRAME_INTERVAL;
            interval.set_frame_interval(u14::new(frame_interval));
        }
        if interval.largest_data_packet().value() == 0 {
            let largest = FmInterval::largest_data_packet_for(frame_interval);
            warn!("[USB-OHCI] Largest data packet is zero, using {:#x}", largest);
            interval.set_largest_data_packet(u15::new(largest));
        }

        self.regs.disable_interrupts(Interrupts::MASTER_INTERRUPT);
        self.regs.update_control(|c| c.set_state(FunctionalState::Suspend));
        self.timer.delay_ms(CONTROLLER_SETTLE_MS);

        self.regs.command(CommandStatus::HOST_CONTROLLER_RESET);
        let regs = &self.regs;
        try_wait_until!(
            self.timer,
            RESET_POLL_MS,
            RESET_TIMEOUT_MS,
            !regs.command_status().contains(CommandStatus::HOST_CONTROLLER_RESET)
        )?;

        // the controller is now suspended with the frame interval reset
        interval.set_toggle(!interval.toggle());
        self.regs.set_fm_interval(interval);

        let hcca = self.area.address();
        self.regs.write(Register::Hcca, hcca.0);
        self.area.hcca.frame_number.write(0);
        self.area.hcca.done_head.write(0);

        self.regs.write(Register::ControlHeadEd, 0);
        self.regs.write(Register::ControlCurrentEd, 0);
        self.regs.write(Register::BulkHeadEd, 0);
        self.regs.write(Register::BulkCurrentEd, 0);
        self.control = AsyncList::default();
        self.bulk = AsyncList::default();

        self.regs.disable_interrupts(
            Interrupts::START_OF_FRAME | Interrupts::ROOT_HUB_STATUS_CHANGE | Interrupts::OWNERSHIP_CHANGE,
        );
        self.regs.acknowledge(Interrupts::all());
        self.regs.enable_interrupts(
            Interrupts::SCHEDULING_OVERRUN
                | Interrupts::WRITEBACK_DONE_HEAD
                | Interrupts::RESUME_DETECTED
                | Interrupts::UNRECOVERABLE_ERROR
                | Interrupts::FRAME_NUMBER_OVERFLOW
                | Interrupts::MASTER_INTERRUPT,
        );

        // start periodic processing at 90% of the frame
        self.regs.write(Register::PeriodicStart, (frame_interval as u32 / 10) * 9);

        let mut control = self.regs.control();
        control.set_control_bulk_ratio(u2::new(3));
        control.set_periodic_list(true);
        control.set_isochronous(true);
        control.set_control_list(true);
        control.set_bulk_list(true);
        control.set_remote_wakeup_enable(true);
        control.set_interrupt_routing(false);
        control.set_state(FunctionalState::Operational);
        self.regs.set_control(control);

        debug!("[USB-OHCI] Controller {} reset, frame interval {:#x}", self.id, frame_interval);
        Ok(())
    }

    /// Stops processing of the asynchronous lists.
    pub fn stop(&mut self) {
        self.regs.update_control(|c| {
            c.set_control_list(false);
            c.set_bulk_list(false);
        });
    }
}

impl HostController for OhciController {
    fn id(&self) -> u32 {
        self.id
    }

    fn port_count(&self) -> usize {
        self.state.lock().ports
    }

    fn port_status(&self, port: usize) -> Result<PortStatus, UsbError> {
        self.state.lock().port_status(port)
    }

    fn ports_check(&self) -> Result<(), UsbError> {
        let events = self.state.lock().ports_check()?;
        self.emit(Deferred { events, ..Deferred::default() });
        Ok(())
    }

    fn reset(&self) -> Result<(), UsbError> {
        self.state.lock().reset()
    }

    fn endpoint_setup(&self, endpoint: &mut UsbEndpoint) -> Result<(), UsbError> {
        self.state.lock().endpoint_setup(endpoint)
    }

    fn endpoint_destroy(&self, endpoint: &mut UsbEndpoint) -> Result<(), UsbError> {
        self.state.lock().endpoint_destroy(endpoint)
    }

    fn transaction_init(&self, request: &mut Request) -> Result<(), UsbError> {
        self.state.lock().transaction_init(request)
    }

    fn transaction_setup(&self, request: &mut Request, packet: SetupPacket) -> Result<(), UsbError> {
        self.state.lock().transaction_setup(request, packet)
    }

    fn transaction_in(&self, request: &mut Request, length: usize) -> Result<(), UsbError> {
        self.state.lock().transaction(request, TransactionKind::In, None, length)
    }

    fn transaction_out(&self, request: &mut Request, data: &[u8]) -> Result<(), UsbError> {
        self.state.lock().transaction(request, TransactionKind::Out, Some(data), data.len())
    }

    fn submit_transfer(&self, request: &mut Request) -> Result<TransferStatus, UsbError> {
        let id = match self.state.lock().submit(request)? {
            schedule::Submitted::Periodic => return Ok(TransferStatus::NotProcessed),
            schedule::Submitted::Async { id } => id,
        };

        let token = WaitToken::for_transfer(self.id, id);
        loop {
            let reason = self.parker.park_until(token, 0, &|| self.state.lock().finished.contains(&id));
            if self.state.lock().finished.contains(&id) {
                break;
            }
            if reason != WakeReason::Woken {
                warn!("[USB-OHCI] wait for request {} ended early: {:?}", id, reason);
                return Ok(TransferStatus::NotProcessed);
            }
        }

        Ok(self.state.lock().collect(request, id))
    }

    fn teardown_transfer(&self, request: &mut Request) -> Result<(), UsbError> {
        self.state.lock().teardown(request)
    }

    fn handle_interrupt(&self) -> IrqReturn {
        let deferred = self.state.lock().interrupt();
        match deferred {
            Some(deferred) => {
                self.emit(deferred);
                IrqReturn::Handled
            }
            None => IrqReturn::NotHandled,
        }
    }
}
