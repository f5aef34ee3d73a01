//! Building requests and putting them on (and off) the hardware lists.
//!
//! Control and bulk endpoints go on two singly linked lists the controller
//! walks as frame time allows. A request submitted while its list is busy
//! waits on a software queue and is handed to the hardware in one go once the
//! list drained.
//!
//! Interrupt and isochronous endpoints hang off a binary tree of placeholder
//! descriptors: 16 leaves visited every 16 ms, then 8, 4, 2 and a root visited
//! every frame. Each of the 32 entries of the HCCA interrupt table points at a
//! leaf, so that every leaf is reached from two slots 16 frames apart.

use super::*;
use core::fmt::Write;
use log::{error, trace};

/// Leaf of the interrupt tree for each slot of the interrupt table, spreading
/// consecutive frames over distant branches.
const BALANCE: [usize; 16] = [0, 8, 4, 12, 2, 10, 6, 14, 1, 9, 5, 13, 3, 11, 7, 15];

/// First tree node of each period below 32 frames.
const fn tree_level_start(period: usize) -> usize {
    match period {
        16 => 0,
        8 => 16,
        4 => 24,
        2 => 28,
        _ => 30,
    }
}

/// The schedule period for a polling interval: the largest power of two not
/// above it, from 1 to 32 frames.
pub(crate) fn period_for_interval(interval: u8) -> usize {
    let interval = (interval as usize).clamp(1, 32);
    1 << (usize::BITS - 1 - interval.leading_zeros())
}

pub(crate) enum Submitted {
    /// The caller must wait for `id` to finish.
    Async { id: RequestId },
    Periodic,
}

impl OhciState {
    /// Links the interrupt tree and fills the interrupt table. Pooled
    /// endpoint descriptors are parked on the null TD as they are handed out.
    pub(super) fn init_queues(&mut self) -> Result<(), UsbError> {
        let null_td = self.null_td_address().0;

        for index in 0..TREE_SIZE {
            let parent = match index {
                0..=15 => Some(16 + index / 2),
                16..=23 => Some(24 + (index - 16) / 2),
                24..=27 => Some(28 + (index - 24) / 2),
                28..=29 => Some(30),
                _ => None,
            };
            let next = parent.map_or(0, |parent| self.tree_address(parent).0);

            let ed = &mut self.area.tree[index];
            park_ed(ed, null_td);
            ed.next.write(next);
        }

        for (slot, entry) in BALANCE.iter().cycle().take(INTERRUPT_TABLE_SIZE).enumerate() {
            let leaf = self.tree_address(*entry).0;
            self.area.hcca.interrupt_table[slot].write(leaf);
        }

        let null = &mut self.area.null_td;
        null.control.write(0);
        null.cbp.write(0);
        null.next.write(0);
        null.buffer_end.write(0);
        Ok(())
    }

    pub(super) fn endpoint_setup(&mut self, endpoint: &mut UsbEndpoint) -> Result<(), UsbError> {
        if endpoint.id.is_some() || endpoint.max_packet_size == 0 {
            return Err(UsbError::InvalidState);
        }

        let stride = endpoint.max_packet_size as usize;
        let count = match endpoint.kind {
            TransferKind::Control => OHCI_ENDPOINT_MIN_ALLOCATED,
            TransferKind::Bulk => DEVICE_MAX_IO_SIZE / stride + OHCI_ENDPOINT_MIN_ALLOCATED,
            // periodic TDs are allocated with their request
            TransferKind::Interrupt | TransferKind::Isochronous => return Ok(()),
        };
        // setup packets need 8 bytes whatever the packet size
        let stride = stride.max(8);

        let pool = EndpointPool {
            stride,
            tds: SlotPool::new("OhciTdPool", &self.dma, count)?,
            buffers: DmaArray::new(&self.dma, count * stride)?,
        };

        let id = EndpointId(self.next_endpoint);
        self.next_endpoint = self.next_endpoint.wrapping_add(1);
        self.endpoints.insert(id, pool);
        endpoint.id = Some(id);

        trace!("[USB-OHCI] endpoint {} set up with {} TDs", endpoint.number, count);
        Ok(())
    }

    pub(super) fn endpoint_destroy(&mut self, endpoint: &mut UsbEndpoint) -> Result<(), UsbError> {
        let Some(id) = endpoint.id else {
            return Ok(());
        };

        let pool = self.endpoints.get(&id).ok_or(UsbError::UnknownHandle)?;
        if pool.tds.in_use() != 0 {
            warn!("[USB-OHCI] endpoint {} still has {} TDs in use", endpoint.number, pool.tds.in_use());
            return Err(UsbError::InvalidState);
        }

        self.endpoints.remove(&id);
        endpoint.id = None;
        Ok(())
    }

    pub(super) fn transaction_init(&mut self, request: &mut Request) -> Result<(), UsbError> {
        if request.scheduled.is_some() {
            return Err(UsbError::InvalidState);
        }
        if !request.kind.is_periodic() && request.endpoint.id.is_none() {
            return Err(UsbError::InvalidState);
        }

        let null_td = self.null_td_address().0;
        let ed = if request.kind.is_periodic() {
            let ed = DmaBox::<EndpointDescriptor>::new(&self.dma)?;
            let index = match self.periodic_eds.iter().position(Option::is_none) {
                Some(index) => {
                    self.periodic_eds[index] = Some(ed);
                    index
                }
                None => {
                    self.periodic_eds.push(Some(ed));
                    self.periodic_eds.len() - 1
                }
            };
            EdHandle::Periodic(index)
        } else {
            EdHandle::Pooled(self.eds.allocate()?.0)
        };

        park_ed(self.ed_mut(ed)?, null_td);
        request.transactions.clear();
        request.scheduled = Some(ScheduledRequest { ed, dummy: None, id: None, bucket: None });
        Ok(())
    }

    /// Fails unless `request` was initialized and not submitted yet.
    fn check_building(request: &Request) -> Result<(), UsbError> {
        match &request.scheduled {
            Some(scheduled) if scheduled.dummy.is_none() => Ok(()),
            _ => Err(UsbError::InvalidState),
        }
    }

    pub(super) fn transaction_setup(&mut self, request: &mut Request, packet: SetupPacket) -> Result<(), UsbError> {
        Self::check_building(request)?;
        if request.kind != TransferKind::Control {
            return Err(UsbError::InvalidState);
        }

        let bytes = packet.to_bytes();
        let td = self.pooled_td(request, Pid::Setup, false, Some(&bytes), bytes.len())?;
        // the data stage starts with DATA1
        request.endpoint.toggle = true;

        self.push_transaction(request, Transaction {
            kind: TransactionKind::Setup,
            length: bytes.len(),
            data: bytes.to_vec(),
            td,
        })
    }

    /// Appends an IN or OUT stage of `length` bytes, `data` holding them for OUT.
    pub(super) fn transaction(
        &mut self,
        request: &mut Request,
        kind: TransactionKind,
        data: Option<&[u8]>,
        length: usize,
    ) -> Result<(), UsbError> {
        Self::check_building(request)?;
        let pid = match kind {
            TransactionKind::In => Pid::In,
            TransactionKind::Out => Pid::Out,
            TransactionKind::Setup => return Err(UsbError::InvalidState),
        };

        match request.kind {
            TransferKind::Control | TransferKind::Bulk => {
                let max_packet = request.endpoint.max_packet_size.max(1) as usize;
                let mut offset = 0;
                loop {
                    let chunk = (length - offset).min(max_packet);
                    let bytes = data.map(|data| &data[offset..offset + chunk]);
                    let toggle = request.endpoint.toggle;
                    let td = self.pooled_td(request, pid, toggle, bytes, chunk)?;
                    request.endpoint.toggle = !toggle;

                    self.push_transaction(request, Transaction {
                        kind,
                        length: chunk,
                        data: bytes.map(<[u8]>::to_vec).unwrap_or_default(),
                        td,
                    })?;

                    offset += chunk;
                    if offset >= length {
                        break;
                    }
                }
                Ok(())
            }
            TransferKind::Interrupt => {
                if length > OHCI_TD_BUFFER_SIZE {
                    return Err(UsbError::TransferTooLarge);
                }
                let td = self.interrupt_td(pid, request.endpoint.toggle, data, length)?;
                self.push_transaction(request, Transaction {
                    kind,
                    length,
                    data: data.map(<[u8]>::to_vec).unwrap_or_default(),
                    td,
                })
            }
            TransferKind::Isochronous => {
                let td = self.isochronous_td(request.endpoint.max_packet_size as usize, data, length)?;
                self.push_transaction(request, Transaction {
                    kind,
                    length,
                    data: data.map(<[u8]>::to_vec).unwrap_or_default(),
                    td,
                })
            }
        }
    }

    fn push_transaction(&mut self, request: &mut Request, transaction: Transaction) -> Result<(), UsbError> {
        if let Some(last) = request.transactions.last() {
            let next = self.td_address(transaction.td)?;
            self.td_set_next(last.td, next)?;
        }
        request.transactions.push(transaction);
        Ok(())
    }

    /// A TD from the pool of the request's endpoint, its buffer filled with `data`.
    fn pooled_td(
        &mut self,
        request: &Request,
        pid: Pid,
        toggle: bool,
        data: Option<&[u8]>,
        length: usize,
    ) -> Result<TdHandle, UsbError> {
        let endpoint = request.endpoint.id.ok_or(UsbError::InvalidState)?;
        let pool = self.endpoints.get_mut(&endpoint).ok_or(UsbError::UnknownHandle)?;
        if length > pool.stride {
            return Err(UsbError::TransferTooLarge);
        }

        let (slot, _) = pool.tds.allocate()?;
        let range = pool.buffer_range(slot, length);
        let buffer = pool.buffers.address_of(range.start).ok_or(UsbError::UnknownHandle)?;
        if let Some(data) = data {
            pool.buffers.as_mut_slice()[range].copy_from_slice(data);
        }

        let td = pool.tds.get_mut(slot)?;
        init_general_td(td, pid, toggle, buffer, length);
        Ok(TdHandle::Pooled { endpoint, slot })
    }

    fn interrupt_td(&mut self, pid: Pid, toggle: bool, data: Option<&[u8]>, length: usize) -> Result<TdHandle, UsbError> {
        let mut buffer = DmaArray::<u8>::new(&self.dma, OHCI_TD_BUFFER_SIZE)?;
        if let Some(data) = data {
            buffer.as_mut_slice()[..length].copy_from_slice(data);
        }

        let mut td = DmaBox::<GeneralTd>::new(&self.dma)?;
        init_general_td(&mut td, pid, toggle, buffer.address(), length);

        Ok(self.insert_dynamic(DynamicTd {
            descriptor: DynamicDescriptor::General(td),
            buffer: Some(buffer),
            saved: TdImage::default(),
        }))
    }

    /// One isochronous TD covering a frame per `max_packet` bytes, 8 frames at most.
    fn isochronous_td(&mut self, max_packet: usize, data: Option<&[u8]>, length: usize) -> Result<TdHandle, UsbError> {
        let max_packet = max_packet.max(1);
        let frames = length.div_ceil(max_packet).max(1);
        if frames > 8 {
            return Err(UsbError::TransferTooLarge);
        }

        let mut buffer = DmaArray::<u8>::with_align(&self.dma, length.max(1), 4096)?;
        if let Some(data) = data {
            buffer.as_mut_slice()[..length].copy_from_slice(data);
        }
        let start = buffer.address().0;
        let page = start & !0xFFF;

        let mut td = DmaBox::<IsochronousTd>::new(&self.dma)?;
        let mut control = ItdControl::from(0u32);
        control.set_delay_interrupt(u3::new(NO_INTERRUPT));
        control.set_frame_count(u3::new(frames as u8 - 1));
        control.set_condition(u4::new(CC_NOT_ACCESSED));
        td.set_control(control);
        td.buffer_page.write(page);
        td.buffer_end.write(start + length.max(1) as u32 - 1);
        td.next.write(0);

        for frame in 0..frames {
            let addr = start + (frame * max_packet) as u32;
            let crossed = ((addr & !0xFFF) != page) as u32;
            // the top bits read as "not accessed" until the frame went out
            td.offsets[frame].write((OFFSET_NOT_ACCESSED | (crossed << 12) | (addr & 0xFFF)) as u16);
        }

        Ok(self.insert_dynamic(DynamicTd {
            descriptor: DynamicDescriptor::Isochronous(td),
            buffer: Some(buffer),
            saved: TdImage::default(),
        }))
    }

    fn insert_dynamic(&mut self, td: DynamicTd) -> TdHandle {
        match self.dynamic_tds.iter().position(Option::is_none) {
            Some(index) => {
                self.dynamic_tds[index] = Some(td);
                TdHandle::Dynamic(index)
            }
            None => {
                self.dynamic_tds.push(Some(td));
                TdHandle::Dynamic(self.dynamic_tds.len() - 1)
            }
        }
    }

    /// The TD that ends the chain of a submitted request; never processed.
    fn dummy_td(&mut self, request: &Request) -> Result<TdHandle, UsbError> {
        match request.kind {
            TransferKind::Control | TransferKind::Bulk => {
                let endpoint = request.endpoint.id.ok_or(UsbError::InvalidState)?;
                let pool = self.endpoints.get_mut(&endpoint).ok_or(UsbError::UnknownHandle)?;
                let (slot, _) = pool.tds.allocate()?;
                Ok(TdHandle::Pooled { endpoint, slot })
            }
            TransferKind::Interrupt => {
                let td = DmaBox::<GeneralTd>::new(&self.dma)?;
                Ok(self.insert_dynamic(DynamicTd {
                    descriptor: DynamicDescriptor::General(td),
                    buffer: None,
                    saved: TdImage::default(),
                }))
            }
            TransferKind::Isochronous => {
                let td = DmaBox::<IsochronousTd>::new(&self.dma)?;
                Ok(self.insert_dynamic(DynamicTd {
                    descriptor: DynamicDescriptor::Isochronous(td),
                    buffer: None,
                    saved: TdImage::default(),
                }))
            }
        }
    }

    /// Puts `request` on the hardware.
    pub(super) fn submit(&mut self, request: &mut Request) -> Result<Submitted, UsbError> {
        let ed = match &request.scheduled {
            Some(scheduled) if scheduled.dummy.is_none() && !request.transactions.is_empty() => scheduled.ed,
            _ => return Err(UsbError::InvalidState),
        };

        let dummy = self.dummy_td(request)?;
        let dummy_address = self.td_address(dummy)?;
        let first = self.td_address(request.transactions[0].td)?;
        let last = request.transactions.last().map(|t| t.td).ok_or(UsbError::InvalidState)?;
        self.td_set_next(last, dummy_address)?;
        self.td_set_delay_interrupt(last, 0)?;

        let mut control = EdControl::from(0u32);
        control.set_address(u7::new(request.device & 0x7F));
        control.set_endpoint(u4::new(request.endpoint.number & 0xF));
        control.set_direction(EdDirection::FromTd);
        control.set_low_speed(request.low_speed);
        control.set_skip(true);
        control.set_isochronous(request.kind == TransferKind::Isochronous);
        control.set_max_packet_size(u11::new(request.endpoint.max_packet_size & 0x7FF));

        let ed_address = self.ed_address(ed)?;
        let descriptor = self.ed_mut(ed)?;
        descriptor.set_control(control);
        descriptor.tail.write(dummy_address.0);
        descriptor.head.write(first.0);
        descriptor.next.write(0);

        let id = self.next_request;
        self.next_request = self.next_request.wrapping_add(1);

        let tds = request.transactions.iter().map(|t| (t.td, t.kind, t.length)).collect();
        let callback = request.callback.take();
        if let Some(scheduled) = request.scheduled.as_mut() {
            scheduled.dummy = Some(dummy);
            scheduled.id = Some(id);
        }
        request.status = TransferStatus::NotProcessed;

        if request.kind.is_periodic() {
            let frame = self.area.hcca.frame_number.read().wrapping_add(1);
            for transaction in request.transactions.iter() {
                if let TdHandle::Dynamic(index) = transaction.td {
                    let td = self.dynamic_td_mut(index)?;
                    td.set_start_frame(frame);
                    td.save();
                }
            }
            self.in_flight.push(InFlight { id, kind: request.kind, ed, tds, callback });

            let bucket = self.link_periodic(ed, request.endpoint.interval)?;
            if let Some(scheduled) = request.scheduled.as_mut() {
                scheduled.bucket = Some(bucket);
            }
            trace!("[USB-OHCI] periodic request {} in bucket {:?}", id, bucket);
            return Ok(Submitted::Periodic);
        }

        self.in_flight.push(InFlight { id, kind: request.kind, ed, tds, callback });
        self.ed_mut(ed)?.set_skip(false);

        let (head, current, filled) = match request.kind {
            TransferKind::Bulk => (Register::BulkHeadEd, Register::BulkCurrentEd, CommandStatus::BULK_LIST_FILLED),
            _ => (Register::ControlHeadEd, Register::ControlCurrentEd, CommandStatus::CONTROL_LIST_FILLED),
        };

        if self.list(request.kind).pending > 0 {
            // the list is busy, wait for it to drain
            if let Some(&last) = self.list(request.kind).queued.last() {
                self.ed_mut(last)?.next.write(ed_address.0);
            }
            self.list(request.kind).queued.push(ed);
            trace!("[USB-OHCI] request {} queued", id);
        } else {
            self.regs.write(head, ed_address.0);
            self.regs.write(current, ed_address.0);
            self.list(request.kind).pending = 1;
            self.regs.command(filled);
            trace!("[USB-OHCI] request {} started", id);
        }

        Ok(Submitted::Async { id })
    }

    /// Splices a periodic ED into the next bucket of its period, with
    /// periodic processing off while the links change.
    fn link_periodic(&mut self, ed: EdHandle, interval: u8) -> Result<Bucket, UsbError> {
        let period = period_for_interval(interval);
        let level = period.trailing_zeros() as usize;
        let index = self.cursors[level] % period;
        self.cursors[level] = self.cursors[level].wrapping_add(1);

        let ed_address = self.ed_address(ed)?;
        self.set_periodic_enabled(false);

        if period == INTERRUPT_TABLE_SIZE {
            let head = self.area.hcca.interrupt_table[index].read();
            let descriptor = self.ed_mut(ed)?;
            descriptor.next.write(head);
            descriptor.set_skip(false);
            self.area.hcca.interrupt_table[index].write(ed_address.0);
        } else {
            let node = EdHandle::Tree(tree_level_start(period) + index);
            let after = self.ed_mut(node)?.next.read();
            let descriptor = self.ed_mut(ed)?;
            descriptor.next.write(after);
            descriptor.set_skip(false);
            self.ed_mut(node)?.next.write(ed_address.0);
        }

        self.set_periodic_enabled(true);
        Ok(Bucket { period, index })
    }

    fn set_periodic_enabled(&mut self, enabled: bool) {
        self.regs.update_control(|c| {
            c.set_periodic_list(enabled);
            c.set_isochronous(enabled);
        });
    }

    /// Hands the queued control or bulk EDs to the hardware once the list drained.
    pub(super) fn reload(&mut self, kind: TransferKind) {
        let list = self.list(kind);
        list.pending = list.pending.saturating_sub(1);
        if list.pending != 0 || list.queued.is_empty() {
            return;
        }

        let queued = core::mem::take(&mut list.queued);
        list.pending = queued.len();
        let Ok(first) = self.ed_address(queued[0]) else {
            error!("BUG: queued ED {:?} vanished", queued[0]);
            return;
        };

        let (head, current, filled) = match kind {
            TransferKind::Bulk => (Register::BulkHeadEd, Register::BulkCurrentEd, CommandStatus::BULK_LIST_FILLED),
            _ => (Register::ControlHeadEd, Register::ControlCurrentEd, CommandStatus::CONTROL_LIST_FILLED),
        };
        self.regs.write(head, first.0);
        self.regs.write(current, first.0);
        self.regs.command(filled);
        trace!("[USB-OHCI] reloaded {} queued EDs", queued.len());
    }

    /// Reads back the outcome of a finished control or bulk request.
    pub(super) fn collect(&mut self, request: &mut Request, id: RequestId) -> TransferStatus {
        self.finished.remove(&id);
        if let Some(scheduled) = request.scheduled.as_mut() {
            scheduled.id = None;
        }

        let mut status = TransferStatus::Finished;
        for transaction in request.transactions.iter() {
            let condition = self.td_condition(transaction.td).unwrap_or(CC_NOT_ACCESSED);
            if condition != 0 {
                status = interrupt::transfer_status(condition);
                break;
            }
        }

        if status == TransferStatus::Finished {
            for transaction in request.transactions.iter_mut() {
                if transaction.kind != TransactionKind::In {
                    continue;
                }
                if let TdHandle::Pooled { endpoint, slot } = transaction.td {
                    let Some(pool) = self.endpoints.get(&endpoint) else { continue };
                    let Ok(td) = pool.tds.get(slot) else { continue };
                    let range = pool.buffer_range(slot, transaction.length);
                    let cbp = td.cbp.read();
                    let received = match (cbp, pool.buffers.address_of(range.start)) {
                        (0, _) | (_, None) => transaction.length,
                        (cbp, Some(start)) => (cbp.saturating_sub(start.0) as usize).min(transaction.length),
                    };
                    transaction.data = pool.buffers.as_slice()[range.start..range.start + received].to_vec();
                }
            }
        }

        if status != TransferStatus::Finished {
            let halted = request
                .scheduled
                .as_ref()
                .and_then(|scheduled| self.ed_mut(scheduled.ed).ok())
                .map_or(false, |ed| ed.is_halted());
            if halted {
                debug!("[USB-OHCI] endpoint {} of device {} halted: {:?}", request.endpoint.number, request.device, status);
            }
        }

        request.status = status;
        status
    }

    /// Takes `request` off the hardware and frees everything it holds.
    /// Does nothing for a request that holds nothing.
    pub(super) fn teardown(&mut self, request: &mut Request) -> Result<(), UsbError> {
        let Some(scheduled) = request.scheduled.take() else {
            return Ok(());
        };

        let ed_address = self.ed_address(scheduled.ed)?;
        self.ed_mut(scheduled.ed)?.set_skip(true);

        if request.kind.is_periodic() {
            if let Some(bucket) = scheduled.bucket {
                self.set_periodic_enabled(false);
                self.unlink_periodic(ed_address, bucket)?;
                self.set_periodic_enabled(true);
            }
        } else if scheduled.dummy.is_some() {
            let pending = scheduled.id.map_or(false, |id| self.in_flight.iter().any(|r| r.id == id));
            self.unlink_async(request.kind, scheduled.ed, ed_address, pending)?;
        }

        if let Some(id) = scheduled.id {
            self.in_flight.retain(|r| r.id != id);
            self.finished.remove(&id);
        }

        for transaction in request.transactions.drain(..) {
            self.free_td(transaction.td)?;
        }
        if let Some(dummy) = scheduled.dummy {
            self.free_td(dummy)?;
        }
        self.free_ed(scheduled.ed)?;
        Ok(())
    }

    fn unlink_async(
        &mut self,
        kind: TransferKind,
        ed: EdHandle,
        ed_address: UsbPointer,
        pending: bool,
    ) -> Result<(), UsbError> {
        let (head, current) = match kind {
            TransferKind::Bulk => (Register::BulkHeadEd, Register::BulkCurrentEd),
            _ => (Register::ControlHeadEd, Register::ControlCurrentEd),
        };
        let next = self.ed_mut(ed)?.next.read();

        self.regs.update_control(|c| match kind {
            TransferKind::Bulk => c.set_bulk_list(false),
            _ => c.set_control_list(false),
        });

        if let Some(position) = self.list(kind).queued.iter().position(|queued| *queued == ed) {
            self.list(kind).queued.remove(position);
            if position > 0 {
                let previous = self.list(kind).queued[position - 1];
                self.ed_mut(previous)?.next.write(next);
            }
        } else {
            if self.regs.read(head) & LINK_MASK == ed_address.0 {
                self.regs.write(head, next);
            } else {
                let mut cursor = self.regs.read(head) & LINK_MASK;
                let mut hops = 0;
                while cursor != 0 && hops < OHCI_ED_POOL_SIZE {
                    let Some(handle) = self.resolve_ed(UsbPointer(cursor)) else { break };
                    let descriptor = self.ed_mut(handle)?;
                    let following = descriptor.next.read() & LINK_MASK;
                    if following == ed_address.0 {
                        descriptor.next.write(next);
                        break;
                    }
                    cursor = following;
                    hops += 1;
                }
            }
            if self.regs.read(current) & LINK_MASK == ed_address.0 {
                self.regs.write(current, next);
            }

            // an ED torn down before completion never decrements the list
            if pending {
                self.reload(kind);
            }
        }

        self.regs.update_control(|c| match kind {
            TransferKind::Bulk => c.set_bulk_list(true),
            _ => c.set_control_list(true),
        });
        Ok(())
    }

    fn unlink_periodic(&mut self, ed_address: UsbPointer, bucket: Bucket) -> Result<(), UsbError> {
        let next = match self.resolve_ed(ed_address) {
            Some(handle) => self.ed_mut(handle)?.next.read(),
            None => return Err(UsbError::UnknownHandle),
        };

        let mut cursor = if bucket.period == INTERRUPT_TABLE_SIZE {
            let entry = &mut self.area.hcca.interrupt_table[bucket.index % INTERRUPT_TABLE_SIZE];
            if entry.read() == ed_address.0 {
                entry.write(next);
                return Ok(());
            }
            entry.read()
        } else {
            self.tree_address(tree_level_start(bucket.period) + bucket.index).0
        };

        let mut hops = 0;
        while cursor != 0 && hops < OHCI_ED_POOL_SIZE + TREE_SIZE + self.periodic_eds.len() {
            let Some(handle) = self.resolve_ed(UsbPointer(cursor)) else { break };
            let descriptor = self.ed_mut(handle)?;
            let following = descriptor.next.read() & LINK_MASK;
            if following == ed_address.0 {
                descriptor.next.write(next);
                return Ok(());
            }
            cursor = following;
            hops += 1;
        }

        error!("BUG: periodic ED {:#x} not found in bucket {:?}", ed_address.0, bucket);
        Err(UsbError::UnknownHandle)
    }

    pub(super) fn dump_periodic_schedule(&self) {
        for (slot, entry) in self.area.hcca.interrupt_table.iter().enumerate() {
            let mut line = alloc::string::String::new();
            let mut cursor = entry.read() & LINK_MASK;
            let mut hops = 0;
            while cursor != 0 && hops < 64 {
                let _ = write!(line, " -> {:#x}", cursor);
                let next = match self.resolve_ed(UsbPointer(cursor)) {
                    Some(EdHandle::Pooled(slot)) => self.eds.get(slot).map(|ed| ed.next.read()).unwrap_or(0),
                    Some(EdHandle::Periodic(index)) => self
                        .periodic_eds
                        .get(index)
                        .and_then(Option::as_ref)
                        .map_or(0, |ed| ed.next.read()),
                    Some(EdHandle::Tree(index)) => self.area.tree[index].next.read(),
                    None => 0,
                };
                cursor = next & LINK_MASK;
                hops += 1;
            }
            info!("[USB-OHCI] frame {:2}:{}", slot, line);
        }
    }
}

fn park_ed(ed: &mut EndpointDescriptor, null_td: u32) {
    let mut control = EdControl::from(0u32);
    control.set_skip(true);
    ed.set_control(control);
    ed.tail.write(null_td);
    ed.head.write(null_td | HEAD_HALTED);
    ed.next.write(0);
}

fn init_general_td(td: &mut GeneralTd, pid: Pid, toggle: bool, buffer: UsbPointer, length: usize) {
    let mut control = TdControl::from(0u32);
    control.set_rounding(true);
    control.set_pid(pid);
    control.set_delay_interrupt(u3::new(NO_INTERRUPT));
    control.set_toggle(toggle);
    control.set_toggle_from_td(true);
    control.set_condition(u4::new(CC_NOT_ACCESSED));
    td.set_control(control);

    if length == 0 {
        td.cbp.write(0);
        td.buffer_end.write(0);
    } else {
        td.cbp.write(buffer.0);
        td.buffer_end.write(buffer.0 + length as u32 - 1);
    }
    td.next.write(0);
}
