//! # Transceiver
//!
//! Purpose: Bridge one attached session and one inverter: pull items into
//! 64-byte cells, push staged replies back, and carry request/reply payloads
//! through a preallocated buffer arena.
//!
//! The cell array and the arena are the in-process analogue of the shared
//! mapping a kernel-resident engine would expose; the `#[repr(C)]` cell
//! records in `ubd-common` remain the ABI an out-of-process transport would
//! use. Payloads always travel through preallocated buffers here: a raw
//! process pointer has no meaning without an address-space boundary.
//!
//! The abort discipline matters: a payload copy that fails must return the
//! slot (or re-arm the one-shot pseudo-item) so nothing is lost; see
//! `receive_item` and `send_reply`.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;

use ubd_common::cell::{
    ioctl_has_reply_payload, ioctl_has_request_payload, Item, ItemType, Reply, NULL_HANDLE_INDEX,
};
use ubd_common::cmd::ioc;
use ubd_common::config::{DeviceAndFdConfig, PAGE_SIZE};
use ubd_common::{UbdError, UbdResult};

use crate::inverter::{CompletionTicket, Inverter, ItemTicket};

/// One cell of the shared area: vacant, an item awaiting the session, or a
/// reply staged by it.
#[derive(Debug, Clone, Copy)]
enum Cell {
    Vacant,
    Item(Item),
    Reply(Reply),
}

#[derive(Debug)]
struct SharedArea {
    cells: Box<[Cell]>,
    buffers: Box<[u8]>,
}

/// Per-session payload and cell transport over one inverter.
#[derive(Debug)]
pub struct Transceiver {
    inverter: Arc<Inverter>,
    num_cells: u32,
    num_buffers: u32,
    buffer_size: usize,
    shared: Mutex<SharedArea>,
}

fn page_align(size: u32) -> usize {
    let page = PAGE_SIZE as usize;
    let size = size as usize;
    (size + page - 1) / page * page
}

/// Largest payload any single request on this device can carry.
fn max_request_size(config: &DeviceAndFdConfig) -> u32 {
    let device = &config.device;
    let mut size = device.max_read_write_size;
    if device.supports_write_same != 0 {
        size = size.max(device.logical_block_size);
    }
    if device.supports_ioctl != 0 {
        size = size.max(ioc::MAX_ARG_SIZE);
    }
    size
}

/// Validates the session half of a combined configuration and adjusts it.
///
/// The buffer count is clamped to the adjusted `max_outstanding_reqs`;
/// 0 selects that maximum.
pub fn validate_and_adjust_fd_config(config: &mut DeviceAndFdConfig) -> UbdResult<()> {
    if !config.fd.reserved.iter().all(|&byte| byte == 0) {
        return Err(UbdError::InvalidArgument);
    }

    let max = config.device.max_outstanding_reqs;
    config.fd.num_preallocated_buffers = if config.fd.num_preallocated_buffers == 0 {
        max
    } else {
        config.fd.num_preallocated_buffers.min(max)
    };

    Ok(())
}

impl Transceiver {
    /// Builds a transceiver from an adjusted configuration.
    pub fn new(config: &DeviceAndFdConfig, inverter: Arc<Inverter>) -> Transceiver {
        let num_cells = config.device.max_outstanding_reqs;
        let num_buffers = config.fd.num_preallocated_buffers;
        let buffer_size = page_align(max_request_size(config));

        Transceiver {
            inverter,
            num_cells,
            num_buffers,
            buffer_size,
            shared: Mutex::new(SharedArea {
                cells: vec![Cell::Vacant; num_cells as usize].into_boxed_slice(),
                buffers: vec![0u8; num_buffers as usize * buffer_size].into_boxed_slice(),
            }),
        }
    }

    /// Number of cells (equals the device's `max_outstanding_reqs`).
    pub fn num_cells(&self) -> u32 {
        self.num_cells
    }

    /// Number of preallocated payload buffers.
    pub fn num_buffers(&self) -> u32 {
        self.num_buffers
    }

    /// Size of each payload buffer, in bytes.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    fn check_cell(&self, cell_index: u64) -> UbdResult<usize> {
        if cell_index < self.num_cells as u64 {
            Ok(cell_index as usize)
        } else {
            Err(UbdError::InvalidArgument)
        }
    }

    fn check_buffer(&self, buffer_index: u64, len: usize) -> UbdResult<usize> {
        if buffer_index < self.num_buffers as u64 && len <= self.buffer_size {
            Ok(buffer_index as usize * self.buffer_size)
        } else {
            Err(UbdError::InvalidArgument)
        }
    }

    /// Payload the engine must hand to the session along with this item.
    fn request_payload(ticket: &ItemTicket) -> Option<&Bytes> {
        match ticket.item_type {
            ItemType::Write | ItemType::WriteSame | ItemType::FuaWrite => ticket.payload.as_ref(),
            ItemType::Ioctl if ioctl_has_request_payload(ticket.arg32) => ticket.payload.as_ref(),
            _ => None,
        }
    }

    /// Reply payload length owed for this request, if any.
    fn reply_payload_len(ticket: &CompletionTicket) -> Option<usize> {
        match ticket.item_type {
            ItemType::Read => Some(ticket.arg32 as usize),
            ItemType::Ioctl if ioctl_has_reply_payload(ticket.arg32) => {
                Some(ioc::size(ticket.arg32) as usize)
            }
            _ => None,
        }
    }

    fn deliver_ticket(&self, ticket: ItemTicket, cell: usize, buffer_index: u64) -> UbdResult<()> {
        let item = Item {
            buffer_index,
            handle_seqnum: ticket.handle_seqnum,
            handle_index: ticket.handle_index,
            item_type: ticket.item_type.as_u8(),
            arg32: ticket.arg32,
            arg64: ticket.arg64,
            ..Default::default()
        };

        let mut shared = self.shared.lock();

        if let Some(payload) = Self::request_payload(&ticket) {
            let start = match self.check_buffer(buffer_index, payload.len()) {
                Ok(start) => start,
                Err(error) => {
                    drop(shared);
                    self.inverter.abort_item_get(&ticket);
                    return Err(error);
                }
            };
            shared.buffers[start..start + payload.len()].copy_from_slice(payload);
        }

        shared.cells[cell] = Cell::Item(item);
        drop(shared);

        self.inverter.commit_item_get(&ticket);
        Ok(())
    }

    /// Blocks for the next item and writes it into the addressed cell.
    ///
    /// Request payloads (writes, write-same blocks, ioctl-in arguments) are
    /// copied into the addressed buffer before the item becomes visible.
    pub fn receive_item(&self, cell_index: u64, buffer_index: u64) -> UbdResult<()> {
        let cell = self.check_cell(cell_index)?;
        let ticket = self.inverter.begin_item_get();
        self.deliver_ticket(ticket, cell, buffer_index)
    }

    /// Like `receive_item`, but gives up after `timeout`.
    pub fn receive_item_timeout(
        &self,
        cell_index: u64,
        buffer_index: u64,
        timeout: Duration,
    ) -> UbdResult<()> {
        let cell = self.check_cell(cell_index)?;
        let ticket = self.inverter.begin_item_get_timeout(timeout)?;
        self.deliver_ticket(ticket, cell, buffer_index)
    }

    /// Consumes the reply staged in the addressed cell.
    ///
    /// A reply with a null handle index is a no-op; a reply whose seqnum no
    /// longer matches is silently dropped. On success the reply payload
    /// (reads, ioctl-out arguments) is copied out of the staged buffer and
    /// the originating request completes with the sanitised errno.
    pub fn send_reply(&self, cell_index: u64) -> UbdResult<()> {
        let cell = self.check_cell(cell_index)?;

        let reply = {
            let shared = self.shared.lock();
            match shared.cells[cell] {
                Cell::Reply(reply) => reply,
                Cell::Vacant | Cell::Item(_) => return Err(UbdError::InvalidArgument),
            }
        };

        if reply.handle_index == NULL_HANDLE_INDEX {
            return Ok(());
        }
        if reply.use_preallocated_buffer == 0 {
            return Err(UbdError::InvalidArgument);
        }

        let ticket = match self
            .inverter
            .begin_item_completion(reply.handle_index, reply.handle_seqnum)?
        {
            Some(ticket) => ticket,
            // Timed out, cancelled, or already completed; drop silently.
            None => return Ok(()),
        };

        let mut data = None;
        if reply.error == 0 {
            if let Some(len) = Self::reply_payload_len(&ticket) {
                let shared = self.shared.lock();
                let start = match self.check_buffer(reply.buffer_index, len) {
                    Ok(start) => start,
                    Err(error) => {
                        drop(shared);
                        self.inverter.abort_item_completion(&ticket);
                        return Err(error);
                    }
                };
                data = Some(Bytes::copy_from_slice(&shared.buffers[start..start + len]));
            }
        }

        self.inverter.commit_item_completion(&ticket, reply.error, data);
        Ok(())
    }

    /// Fused step: send the staged reply, then receive the next item.
    pub fn send_reply_and_receive_item(&self, cell_index: u64, buffer_index: u64) -> UbdResult<()> {
        self.send_reply(cell_index)?;
        self.receive_item(cell_index, buffer_index)
    }

    // ------------------------------------------------------------------
    // Session-facing accessors (the in-process shared mapping)
    // ------------------------------------------------------------------

    /// Reads the item last delivered into a cell.
    pub fn read_item(&self, cell_index: u64) -> UbdResult<Item> {
        let cell = self.check_cell(cell_index)?;
        let shared = self.shared.lock();
        match shared.cells[cell] {
            Cell::Item(item) => Ok(item),
            Cell::Vacant | Cell::Reply(_) => Err(UbdError::InvalidArgument),
        }
    }

    /// Stages a reply into a cell.
    pub fn write_reply(&self, cell_index: u64, reply: Reply) -> UbdResult<()> {
        let cell = self.check_cell(cell_index)?;
        self.shared.lock().cells[cell] = Cell::Reply(reply);
        Ok(())
    }

    /// Copies session data into a payload buffer.
    pub fn write_buffer(&self, buffer_index: u64, offset: usize, data: &[u8]) -> UbdResult<()> {
        let end = offset.checked_add(data.len()).ok_or(UbdError::InvalidArgument)?;
        let start = self.check_buffer(buffer_index, end)?;
        let mut shared = self.shared.lock();
        shared.buffers[start + offset..start + end].copy_from_slice(data);
        Ok(())
    }

    /// Copies payload-buffer contents out for the session.
    pub fn read_buffer(&self, buffer_index: u64, offset: usize, len: usize) -> UbdResult<Vec<u8>> {
        let end = offset.checked_add(len).ok_or(UbdError::InvalidArgument)?;
        let start = self.check_buffer(buffer_index, end)?;
        let shared = self.shared.lock();
        Ok(shared.buffers[start + offset..start + end].to_vec())
    }
}
