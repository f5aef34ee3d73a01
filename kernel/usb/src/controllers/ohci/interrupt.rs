//! Interrupt handling and transfer completion.

use super::*;
use log::{error, trace};

/// What each TD condition code means, for diagnostics.
const CONDITION_CODES: [&str; 16] = [
    "No Error",
    "CRC Error",
    "Bit Stuffing Violation",
    "Data Toggle Mismatch",
    "Stall PID received",
    "Device Not Responding",
    "PID Check Failure",
    "Unexpected PID",
    "Data Overrun",
    "Data Underrun",
    "Reserved",
    "Reserved",
    "Buffer Overrun",
    "Buffer Underrun",
    "Not Accessed",
    "Not Accessed",
];

/// Maps the condition code of a retired TD to the status of its transfer.
pub(crate) fn transfer_status(condition: u8) -> TransferStatus {
    match condition {
        0 => TransferStatus::Finished,
        3 => TransferStatus::InvalidToggles,
        4 => TransferStatus::Stalled,
        5 => TransferStatus::NotResponding,
        0xE | 0xF => TransferStatus::NotProcessed,
        code => {
            error!("[USB-OHCI] Transfer error: {}", CONDITION_CODES[(code & 0xF) as usize]);
            TransferStatus::InvalidData
        }
    }
}

impl OhciState {
    /// Handles whatever this controller signalled. Returns `None` if the
    /// interrupt came from another device on the line.
    pub(super) fn interrupt(&mut self) -> Option<Deferred> {
        let done_head = self.area.hcca.done_head.read();
        let mut status = if done_head != 0 {
            let mut status = Interrupts::WRITEBACK_DONE_HEAD;
            // bit 0: other interrupts are pending as well
            if done_head & 1 != 0 {
                status |= self.regs.interrupt_status() & self.regs.enabled_interrupts();
            }
            status
        } else {
            self.regs.interrupt_status() & self.regs.enabled_interrupts()
        };
        status.remove(Interrupts::MASTER_INTERRUPT);

        if status.is_empty() {
            return None;
        }

        self.regs.disable_interrupts(Interrupts::MASTER_INTERRUPT);
        let mut deferred = Deferred::default();

        if status.contains(Interrupts::UNRECOVERABLE_ERROR) {
            error!("[USB-OHCI] Controller {}: unrecoverable error, stopping", self.id);
            self.stop();
            self.regs.acknowledge(Interrupts::UNRECOVERABLE_ERROR);
            deferred.events.push(HcdEvent::Fatal);
            return Some(deferred);
        }

        if status.contains(Interrupts::SCHEDULING_OVERRUN) {
            debug!("[USB-OHCI] Controller {}: scheduling overrun", self.id);
            self.regs.acknowledge(Interrupts::SCHEDULING_OVERRUN);
        }

        if status.contains(Interrupts::RESUME_DETECTED) {
            // resume signaling has to last 20 ms before going operational
            self.timer.delay_ms(RESUME_DELAY_MS);
            self.regs.update_control(|c| c.set_state(FunctionalState::Operational));
            self.regs.acknowledge(Interrupts::RESUME_DETECTED);
        }

        if status.contains(Interrupts::FRAME_NUMBER_OVERFLOW) {
            trace!("[USB-OHCI] Controller {}: frame number overflow", self.id);
            self.regs.acknowledge(Interrupts::FRAME_NUMBER_OVERFLOW);
        }

        if status.contains(Interrupts::WRITEBACK_DONE_HEAD) {
            self.process_done_queue(done_head & LINK_MASK, &mut deferred);
            self.area.hcca.done_head.write(0);
            self.regs.acknowledge(Interrupts::WRITEBACK_DONE_HEAD);
        }

        if status.contains(Interrupts::ROOT_HUB_STATUS_CHANGE) {
            deferred.events.push(HcdEvent::RootHub);
            self.regs.acknowledge(Interrupts::ROOT_HUB_STATUS_CHANGE);
        }

        if status.contains(Interrupts::START_OF_FRAME) {
            self.regs.acknowledge(Interrupts::START_OF_FRAME);
        }

        let unhandled = status
            - (Interrupts::SCHEDULING_OVERRUN
                | Interrupts::RESUME_DETECTED
                | Interrupts::FRAME_NUMBER_OVERFLOW
                | Interrupts::WRITEBACK_DONE_HEAD
                | Interrupts::ROOT_HUB_STATUS_CHANGE
                | Interrupts::START_OF_FRAME);
        if !unhandled.is_empty() {
            warn!("[USB-OHCI] Controller {}: disabling unhandled interrupts {:?}", self.id, unhandled);
            self.regs.disable_interrupts(unhandled);
            self.regs.acknowledge(unhandled);
        }

        self.regs.enable_interrupts(Interrupts::MASTER_INTERRUPT);
        Some(deferred)
    }

    /// Walks the TDs the controller retired since the last interrupt and
    /// completes the requests that are done with.
    ///
    /// The controller writes the done queue back whenever any TD with an
    /// interrupt delay retires, so a long request can show up with only some
    /// of its TDs retired. It is done once its last TD retired, or once one of
    /// its TDs failed and halted the endpoint.
    fn process_done_queue(&mut self, head: u32, deferred: &mut Deferred) {
        let mut owners = Vec::new();
        for (index, request) in self.in_flight.iter().enumerate() {
            for (position, (td, _, _)) in request.tds.iter().enumerate() {
                if let Ok(address) = self.td_address(*td) {
                    owners.push((address.0, index, position, *td));
                }
            }
        }

        let mut completed: Vec<usize> = Vec::new();
        let mut cursor = head;
        let mut hops = 0;
        while cursor != 0 && hops <= owners.len() {
            let Some(&(_, index, position, td)) = owners.iter().find(|(address, ..)| *address == cursor) else {
                warn!("[USB-OHCI] Unknown TD {:#x} on the done queue", cursor);
                break;
            };
            if !completed.contains(&index) && self.retires_request(index, position, td) {
                completed.push(index);
            }
            // the controller links retired TDs through their next field
            cursor = self.td_next(td).unwrap_or(0) & LINK_MASK;
            hops += 1;
        }

        let mut finished = Vec::new();
        for index in completed {
            let (id, kind) = (self.in_flight[index].id, self.in_flight[index].kind);

            if kind.is_periodic() {
                if let Some(completion) = self.restart_periodic(index) {
                    deferred.completions.push(completion);
                }
                continue;
            }

            trace!("[USB-OHCI] request {} completed", id);
            self.finished.insert(id);
            deferred.wake.push(WaitToken::for_transfer(self.id, id));
            self.reload(kind);
            finished.push(id);
        }

        self.in_flight.retain(|request| !finished.contains(&request.id));
    }

    /// Whether retiring the TD at `position` of in-flight request `index` ends that request.
    fn retires_request(&mut self, index: usize, position: usize, td: TdHandle) -> bool {
        let (last, ed) = {
            let request = &self.in_flight[index];
            (position + 1 == request.tds.len(), request.ed)
        };
        if last {
            return true;
        }
        let failed = self.td_condition(td).map_or(false, |condition| condition != 0);
        failed || self.ed_mut(ed).map_or(false, |descriptor| descriptor.is_halted())
    }

    /// Rearms the TDs of a periodic request. Returns what its callback has to
    /// be told once the controller is unlocked.
    fn restart_periodic(&mut self, index: usize) -> Option<Completion> {
        let frame = self.area.hcca.frame_number.read().wrapping_add(1);
        let kind = self.in_flight[index].kind;
        let tds = self.in_flight[index].tds.clone();

        let mut status = TransferStatus::Finished;
        let mut data = Vec::new();
        for (td, transaction, length) in tds.iter() {
            let TdHandle::Dynamic(td_index) = *td else { continue };
            let Ok(dynamic) = self.dynamic_td_mut(td_index) else { continue };

            let condition = dynamic.condition();
            if status == TransferStatus::Finished && condition != 0 {
                status = transfer_status(condition);
            }
            if condition == 0 {
                if *transaction == TransactionKind::In {
                    dynamic.received(*length, &mut data);
                }
                if kind == TransferKind::Interrupt {
                    dynamic.saved.flip_toggle();
                }
            }

            dynamic.restore();
            dynamic.set_start_frame(frame);
        }

        let first = tds.first().and_then(|(td, _, _)| self.td_address(*td).ok());
        let (id, ed) = (self.in_flight[index].id, self.in_flight[index].ed);
        match (first, self.ed_mut(ed)) {
            // also clears the halted flag
            (Some(first), Ok(descriptor)) => descriptor.head.write(first.0),
            _ => error!("BUG: periodic request {} cannot be restarted", id),
        }

        self.in_flight[index].callback.is_some().then_some(Completion { id, status, data })
    }
}
