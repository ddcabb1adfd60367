//! # Request Inverter
//!
//! Purpose: Turn the callee-driver pattern inside out. Producers push block
//! requests into a bounded slot table; the attached consumer pulls them as
//! items, and replies complete the originating requests exactly once.
//!
//! ## Design Principles
//!
//! 1. **Bounded Slots**: The table never grows; the producer side is sized
//!    so a free slot always exists when a request arrives.
//! 2. **Two-Phase Handoff**: `begin_*` reserves a slot against every other
//!    consumer operation until the matching `commit_*` or `abort_*`; timeouts
//!    are suppressed while a slot is reserved.
//! 3. **ABA-Free Handles**: A slot's seqnum bumps on every return to FREE, so
//!    a stale reply names a dead incarnation and is silently dropped.
//! 4. **Pseudo-Items Over The Same Pipe**: Device-available, terminate, and
//!    flush-and-terminate flow through the same pull path as real requests,
//!    so the consumer needs exactly one wait.
//!
//! ## Structure Overview
//!
//! ```text
//! Inverter
//!   ├── item_ready: Completion        (one wakeup per ready item)
//!   └── table: Mutex<SlotTable>
//!         ├── slots: Box<[Slot]>      (cache-line sized, index-linked)
//!         ├── free: Vec<u16>          (slot recycler)
//!         ├── ready_head/ready_tail   (FIFO of slots awaiting get)
//!         └── one-shot flags          (deactivated, terminated, ...)
//! ```
//!
//! Slot life cycle:
//!
//! ```text
//! FREE -> AWAITING_GET -> BEING_GOTTEN -> AWAITING_COMPLETION
//!   ^                                          |
//!   +---- complete / timeout / cancel <- BEING_COMPLETED
//! ```

use std::time::{Duration, Instant};

use bytes::Bytes;

use parking_lot::Mutex;

use ubd_common::cell::ItemType;
use ubd_common::config::DeviceConfig;
use ubd_common::errno;
use ubd_common::{UbdError, UbdResult};

use crate::completion::Completion;
use crate::request::{BlockRequest, ReqOp, RequestHandle};

/// Per-slot request state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SlotState {
    /// Not holding a request.
    Free,
    /// Holding a request, waiting to be pulled by `begin_item_get`.
    AwaitingGet,
    /// Between `begin_item_get` and its commit/abort.
    BeingGotten,
    /// Pulled and waiting for `begin_item_completion`.
    AwaitingCompletion,
    /// Between `begin_item_completion` and its commit/abort.
    BeingCompleted,
}

/// One request slot. Sized to a cache line so neighbouring slots do not
/// false-share under producer/consumer traffic.
#[derive(Debug)]
#[repr(align(64))]
struct Slot {
    state: SlotState,
    handle_seqnum: u64,
    item_type: ItemType,
    req: Option<BlockRequest>,
    // Index links for the awaiting-get FIFO.
    prev: Option<u16>,
    next: Option<u16>,
}

impl Slot {
    fn new() -> Self {
        Slot {
            state: SlotState::Free,
            handle_seqnum: 0,
            item_type: ItemType::Read,
            req: None,
            prev: None,
            next: None,
        }
    }
}

/// Which request types the device accepts.
#[derive(Debug, Clone, Copy)]
struct Supported {
    read: bool,
    write: bool,
    write_same: bool,
    write_zeros: bool,
    fua_write: bool,
    flush: bool,
    discard: bool,
    secure_erase: bool,
    ioctl: bool,
}

impl Supported {
    fn from_config(config: &DeviceConfig) -> Self {
        Supported {
            read: config.supports_read != 0,
            write: config.supports_write != 0,
            write_same: config.supports_write_same != 0,
            write_zeros: config.supports_write_zeros != 0,
            fua_write: config.supports_fua_write != 0,
            flush: config.supports_flush != 0,
            discard: config.supports_discard != 0,
            secure_erase: config.supports_secure_erase != 0,
            ioctl: config.supports_ioctl != 0,
        }
    }

    fn allows(&self, item_type: ItemType) -> bool {
        match item_type {
            ItemType::Read => self.read,
            ItemType::Write => self.write,
            ItemType::WriteSame => self.write_same,
            ItemType::WriteZerosNoUnmap | ItemType::WriteZerosMayUnmap => self.write_zeros,
            ItemType::FuaWrite => self.fua_write,
            ItemType::Flush => self.flush,
            ItemType::Discard => self.discard,
            ItemType::SecureErase => self.secure_erase,
            ItemType::Ioctl => self.ioctl,
            ItemType::DeviceAvailable | ItemType::Terminate | ItemType::FlushAndTerminate => {
                debug_assert!(false, "pseudo-item submitted as request");
                false
            }
        }
    }
}

#[derive(Debug)]
struct SlotTable {
    slots: Box<[Slot]>,
    /// Free-list for recycling slots.
    free: Vec<u16>,
    /// FIFO of slots in `AwaitingGet` (head is pulled first).
    ready_head: Option<u16>,
    ready_tail: Option<u16>,

    deactivated: bool,
    deactivated_not_flushed: bool,
    terminated: bool,
    send_device_available: bool,
}

impl SlotTable {
    fn ready_push_back(&mut self, pos: u16) {
        let tail = self.ready_tail;
        {
            let slot = &mut self.slots[pos as usize];
            slot.prev = tail;
            slot.next = None;
        }
        match tail {
            Some(tail_pos) => self.slots[tail_pos as usize].next = Some(pos),
            None => self.ready_head = Some(pos),
        }
        self.ready_tail = Some(pos);
    }

    fn ready_push_front(&mut self, pos: u16) {
        let head = self.ready_head;
        {
            let slot = &mut self.slots[pos as usize];
            slot.prev = None;
            slot.next = head;
        }
        match head {
            Some(head_pos) => self.slots[head_pos as usize].prev = Some(pos),
            None => self.ready_tail = Some(pos),
        }
        self.ready_head = Some(pos);
    }

    fn ready_remove(&mut self, pos: u16) {
        let (prev, next) = {
            let slot = &self.slots[pos as usize];
            (slot.prev, slot.next)
        };

        match prev {
            Some(prev_pos) => self.slots[prev_pos as usize].next = next,
            None => self.ready_head = next,
        }
        match next {
            Some(next_pos) => self.slots[next_pos as usize].prev = prev,
            None => self.ready_tail = prev,
        }

        let slot = &mut self.slots[pos as usize];
        slot.prev = None;
        slot.next = None;
    }
}

/// Decision returned by [`Inverter::timeout_request`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    /// The request was (or already had been) completed; stop the timer.
    Done,
    /// The request is mid-handoff and cannot time out; re-arm the timer.
    ResetTimer,
}

/// A pulled item, alive between `begin_item_get` and its commit/abort.
#[derive(Debug, Clone)]
pub struct ItemTicket {
    /// Slot ordinal (1-based); 0 for pseudo-items.
    pub handle_index: u16,
    /// Slot generation at pull time.
    pub handle_seqnum: u64,
    /// The item's type.
    pub item_type: ItemType,
    /// Byte offset, or 0 for flush/ioctl.
    pub arg64: u64,
    /// Byte length, or the ioctl command word.
    pub arg32: u32,
    /// Request payload (write data, write-same block, ioctl argument).
    pub payload: Option<Bytes>,
}

impl ItemTicket {
    fn pseudo(item_type: ItemType) -> Self {
        ItemTicket {
            handle_index: 0,
            handle_seqnum: 0,
            item_type,
            arg64: 0,
            arg32: 0,
            payload: None,
        }
    }

    /// Whether the item is a real request (reply expected).
    pub fn is_request(&self) -> bool {
        self.item_type.is_request()
    }
}

/// A reply target, alive between `begin_item_completion` and its
/// commit/abort.
#[derive(Debug, Clone, PartialEq)]
pub struct CompletionTicket {
    /// Slot ordinal (1-based).
    pub handle_index: u16,
    /// Slot generation at reservation time.
    pub handle_seqnum: u64,
    /// The item's type.
    pub item_type: ItemType,
    /// Byte offset, or 0 for flush/ioctl.
    pub arg64: u64,
    /// Byte length, or the ioctl command word.
    pub arg32: u32,
}

/// Per-state slot counts, for observability and invariant checks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotCounts {
    /// Slots not holding a request.
    pub free: u32,
    /// Slots awaiting `begin_item_get`.
    pub awaiting_get: u32,
    /// Slots mid get-handoff.
    pub being_gotten: u32,
    /// Slots awaiting `begin_item_completion`.
    pub awaiting_completion: u32,
    /// Slots mid completion-handoff.
    pub being_completed: u32,
}

impl SlotCounts {
    /// Sum over all states; always equals the table capacity.
    pub fn total(&self) -> u32 {
        self.free
            + self.awaiting_get
            + self.being_gotten
            + self.awaiting_completion
            + self.being_completed
    }
}

/// The per-device request registry and state machine.
#[derive(Debug)]
pub struct Inverter {
    supported: Supported,
    capacity: u32,
    /// One wakeup per item made ready; sticky after deactivate/terminate.
    item_ready: Completion,
    table: Mutex<SlotTable>,
}

impl Inverter {
    /// Creates an inverter sized by the adjusted device configuration.
    pub fn new(config: &DeviceConfig) -> Self {
        let capacity = config.max_outstanding_reqs;
        let mut slots = Vec::with_capacity(capacity as usize);
        for _ in 0..capacity {
            slots.push(Slot::new());
        }

        // Lowest index first, so handles start at 1 and climb.
        let free: Vec<u16> = (0..capacity as u16).rev().collect();

        Inverter {
            supported: Supported::from_config(config),
            capacity,
            item_ready: Completion::new(),
            table: Mutex::new(SlotTable {
                slots: slots.into_boxed_slice(),
                free,
                ready_head: None,
                ready_tail: None,
                deactivated: false,
                deactivated_not_flushed: false,
                terminated: false,
                send_device_available: false,
            }),
        }
    }

    /// The slot table capacity (`max_outstanding_reqs`).
    pub fn capacity(&self) -> u32 {
        self.capacity
    }

    fn pos_of_index(&self, handle_index: u16) -> Option<u16> {
        let pos = handle_index.checked_sub(1)?;
        if (pos as u32) < self.capacity {
            Some(pos)
        } else {
            None
        }
    }

    /// Moves a slot into `AwaitingGet` and wakes one consumer.
    ///
    /// Fresh submissions queue at the back; aborted gets and re-activated
    /// slots go to the front so they are re-pulled first.
    fn make_ready(&self, table: &mut SlotTable, pos: u16, front: bool) {
        debug_assert!(matches!(
            table.slots[pos as usize].state,
            SlotState::Free | SlotState::BeingGotten | SlotState::AwaitingCompletion
        ));

        if front {
            table.ready_push_front(pos);
        } else {
            table.ready_push_back(pos);
        }
        table.slots[pos as usize].state = SlotState::AwaitingGet;
        self.item_ready.complete_one();
    }

    /// Returns a slot to `FREE`, completing the underlying request.
    ///
    /// The seqnum bump is what invalidates every handle still naming this
    /// slot incarnation.
    fn release_slot(
        &self,
        table: &mut SlotTable,
        pos: u16,
        error: i32,
        error_ioctl: i32,
        data: Option<Bytes>,
    ) {
        let state = table.slots[pos as usize].state;
        debug_assert!(state != SlotState::Free);

        if state == SlotState::AwaitingGet {
            table.ready_remove(pos);
        }

        let slot = &mut table.slots[pos as usize];
        slot.handle_seqnum += 1;
        slot.state = SlotState::Free;
        let req = slot.req.take();
        table.free.push(pos);

        debug_assert!(req.is_some());
        if let Some(req) = req {
            req.finish(error, error_ioctl, data);
        }
    }

    fn cancel_due_to_termination(&self, table: &mut SlotTable, pos: u16) {
        self.release_slot(table, pos, errno::EIO, errno::ENODEV, None);
    }

    fn ticket_from_slot(slot: &Slot, pos: u16) -> ItemTicket {
        let req = slot.req.as_ref().expect("slot holds a request");
        let (arg64, arg32) = match req.op() {
            ReqOp::Ioctl { command } => (0, command),
            _ => (req.offset(), req.len()),
        };
        ItemTicket {
            handle_index: pos + 1,
            handle_seqnum: slot.handle_seqnum,
            item_type: slot.item_type,
            arg64,
            arg32,
            payload: req.data().cloned(),
        }
    }

    // ------------------------------------------------------------------
    // Producer side
    // ------------------------------------------------------------------

    /// Submits a request. Never blocks; callable from any context.
    ///
    /// On a terminated inverter the request is failed immediately with EIO
    /// (ENODEV for ioctls); unsupported types fail with EOPNOTSUPP (ENOTTY
    /// for ioctls). Either way the producer observes the failure through its
    /// request handle as well as through the returned error.
    pub fn submit(&self, req: BlockRequest) -> UbdResult<()> {
        let item_type = req.op().item_type();

        let mut table = self.table.lock();

        if table.terminated {
            drop(table);
            req.set_handle(0, 0);
            req.finish(errno::EIO, errno::ENODEV, None);
            return Err(UbdError::Io);
        }

        if !self.supported.allows(item_type) {
            drop(table);
            req.set_handle(0, 0);
            req.finish(errno::EOPNOTSUPP, errno::ENOTTY, None);
            return Err(UbdError::Unsupported);
        }

        // The producer-side queue is sized to the slot count, so a free slot
        // exists by construction.
        debug_assert!(!table.free.is_empty());
        let pos = match table.free.pop() {
            Some(pos) => pos,
            None => {
                drop(table);
                req.set_handle(0, 0);
                req.finish(errno::EIO, errno::ENODEV, None);
                return Err(UbdError::Io);
            }
        };

        let slot = &mut table.slots[pos as usize];
        slot.item_type = item_type;
        req.set_handle(pos + 1, slot.handle_seqnum);
        slot.req = Some(req);

        self.make_ready(&mut table, pos, false);
        Ok(())
    }

    /// Handles a producer-side timeout for the request behind `handle`.
    pub fn timeout_request(&self, handle: &RequestHandle) -> TimeoutDecision {
        let (index, seqnum) = handle.stored_handle();
        let pos = match self.pos_of_index(index) {
            Some(pos) => pos,
            None => return TimeoutDecision::Done,
        };

        let mut table = self.table.lock();

        if table.slots[pos as usize].handle_seqnum != seqnum {
            // Already completed; this handle names a dead incarnation.
            return TimeoutDecision::Done;
        }

        match table.slots[pos as usize].state {
            SlotState::BeingGotten | SlotState::BeingCompleted => TimeoutDecision::ResetTimer,
            SlotState::AwaitingGet | SlotState::AwaitingCompletion => {
                self.release_slot(&mut table, pos, errno::ETIMEDOUT, errno::ETIMEDOUT, None);
                TimeoutDecision::Done
            }
            SlotState::Free => {
                debug_assert!(false, "matching seqnum on a free slot");
                TimeoutDecision::Done
            }
        }
    }

    // ------------------------------------------------------------------
    // Pseudo-event producers
    // ------------------------------------------------------------------

    /// Arms the one-shot device-available pseudo-item.
    pub fn submit_device_available(&self) {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        if !table.send_device_available {
            table.send_device_available = true;
            self.item_ready.complete_one();
        }
    }

    /// Deactivates the inverter: consumers see only termination items until
    /// re-activation, while producers keep queueing.
    ///
    /// With `flush` true on a flush-capable device, a single
    /// flush-and-terminate item is armed ahead of the terminate stream.
    pub fn deactivate(&self, flush: bool) {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        debug_assert!(!table.terminated);

        if !table.deactivated {
            table.deactivated = true;
            if flush && self.supported.flush {
                table.deactivated_not_flushed = true;
            }
        }

        self.item_ready.complete_all();
    }

    /// Re-activates a deactivated inverter for a new consumer.
    ///
    /// Requests a previous consumer pulled but never completed go back to the
    /// front of the ready queue so the new consumer re-handles them.
    pub fn activate(&self) {
        let mut guard = self.table.lock();
        let table = &mut *guard;
        debug_assert!(!table.terminated);

        if !table.deactivated {
            return;
        }

        table.deactivated = false;
        table.deactivated_not_flushed = false;
        self.item_ready.reinit();

        for pos in 0..self.capacity as u16 {
            match table.slots[pos as usize].state {
                SlotState::AwaitingGet => self.item_ready.complete_one(),
                SlotState::AwaitingCompletion => self.make_ready(table, pos, true),
                SlotState::Free => {}
                SlotState::BeingGotten | SlotState::BeingCompleted => {
                    debug_assert!(false, "slot mid-handoff across activation");
                }
            }
        }

        if table.send_device_available {
            self.item_ready.complete_one();
        }
    }

    /// Terminates the inverter. Idempotent.
    ///
    /// Every slot awaiting get or completion is cancelled with EIO and every
    /// future `begin_item_get` returns a terminate item.
    pub fn terminate(&self) {
        let mut guard = self.table.lock();
        let table = &mut *guard;

        if !table.terminated {
            table.terminated = true;

            for pos in 0..self.capacity as u16 {
                match table.slots[pos as usize].state {
                    SlotState::AwaitingGet | SlotState::AwaitingCompletion => {
                        self.cancel_due_to_termination(table, pos);
                    }
                    _ => {}
                }
            }

            self.item_ready.complete_all();
        }
    }

    // ------------------------------------------------------------------
    // Consumer side
    // ------------------------------------------------------------------

    fn try_take_item(&self) -> Option<ItemTicket> {
        let mut guard = self.table.lock();
        let table = &mut *guard;

        if table.deactivated_not_flushed {
            table.deactivated_not_flushed = false;
            return Some(ItemTicket::pseudo(ItemType::FlushAndTerminate));
        }

        if table.deactivated || table.terminated {
            return Some(ItemTicket::pseudo(ItemType::Terminate));
        }

        if table.send_device_available {
            table.send_device_available = false;
            return Some(ItemTicket::pseudo(ItemType::DeviceAvailable));
        }

        // A wakeup may outlive its item (cancellation, timeout); re-check.
        let pos = table.ready_head?;
        table.ready_remove(pos);
        table.slots[pos as usize].state = SlotState::BeingGotten;
        Some(Self::ticket_from_slot(&table.slots[pos as usize], pos))
    }

    /// Blocks until an item is available and reserves it.
    pub fn begin_item_get(&self) -> ItemTicket {
        loop {
            self.item_ready.wait();
            if let Some(ticket) = self.try_take_item() {
                return ticket;
            }
        }
    }

    /// Like `begin_item_get`, but gives up after `timeout`.
    pub fn begin_item_get_timeout(&self, timeout: Duration) -> UbdResult<ItemTicket> {
        let deadline = Instant::now() + timeout;
        loop {
            let now = Instant::now();
            if now >= deadline || !self.item_ready.wait_timeout(deadline - now) {
                return Err(UbdError::Interrupted);
            }
            if let Some(ticket) = self.try_take_item() {
                return Ok(ticket);
            }
        }
    }

    /// Commits a pulled item: the consumer now owes a reply.
    ///
    /// No-op for pseudo-items. If the inverter terminated since the pull,
    /// the request is cancelled instead.
    pub fn commit_item_get(&self, ticket: &ItemTicket) {
        if !ticket.is_request() {
            return;
        }

        let pos = match self.pos_of_index(ticket.handle_index) {
            Some(pos) => pos,
            None => {
                debug_assert!(false, "committing an invalid handle");
                return;
            }
        };

        let mut guard = self.table.lock();
        let table = &mut *guard;
        debug_assert_eq!(table.slots[pos as usize].state, SlotState::BeingGotten);
        debug_assert_eq!(table.slots[pos as usize].handle_seqnum, ticket.handle_seqnum);

        if table.terminated {
            self.cancel_due_to_termination(table, pos);
        } else {
            table.slots[pos as usize].state = SlotState::AwaitingCompletion;
        }
    }

    /// Aborts a pulled item (the consumer failed to transport it).
    ///
    /// Real slots return to the front of the ready queue; one-shot
    /// pseudo-items are re-armed.
    pub fn abort_item_get(&self, ticket: &ItemTicket) {
        match ticket.item_type {
            ItemType::DeviceAvailable => {
                self.submit_device_available();
                return;
            }
            ItemType::Terminate => return,
            ItemType::FlushAndTerminate => {
                self.table.lock().deactivated_not_flushed = true;
                return;
            }
            _ => {}
        }

        let pos = match self.pos_of_index(ticket.handle_index) {
            Some(pos) => pos,
            None => {
                debug_assert!(false, "aborting an invalid handle");
                return;
            }
        };

        let mut guard = self.table.lock();
        let table = &mut *guard;
        debug_assert_eq!(table.slots[pos as usize].state, SlotState::BeingGotten);

        if table.terminated {
            self.cancel_due_to_termination(table, pos);
        } else {
            self.make_ready(table, pos, true);
        }
    }

    /// Reserves a request for completion by its handle.
    ///
    /// Returns `Ok(None)` when the seqnum no longer matches: the request was
    /// timed out, cancelled, or already completed, and the reply is to be
    /// silently dropped. A bad index or a slot not awaiting completion is an
    /// error.
    pub fn begin_item_completion(
        &self,
        handle_index: u16,
        handle_seqnum: u64,
    ) -> UbdResult<Option<CompletionTicket>> {
        let pos = self
            .pos_of_index(handle_index)
            .ok_or(UbdError::InvalidArgument)?;

        let mut guard = self.table.lock();
        let table = &mut *guard;
        let slot = &mut table.slots[pos as usize];

        if slot.handle_seqnum != handle_seqnum {
            return Ok(None);
        }

        if slot.state != SlotState::AwaitingCompletion {
            return Err(UbdError::InvalidArgument);
        }

        slot.state = SlotState::BeingCompleted;

        let req = slot.req.as_ref().expect("slot holds a request");
        let (arg64, arg32) = match req.op() {
            ReqOp::Ioctl { command } => (0, command),
            _ => (req.offset(), req.len()),
        };

        Ok(Some(CompletionTicket {
            handle_index,
            handle_seqnum,
            item_type: slot.item_type,
            arg64,
            arg32,
        }))
    }

    /// Commits a completion, finishing the underlying request.
    ///
    /// The reply errno goes through the sanitisation allow-lists; `data` is
    /// the reply payload for reads and ioctl-out arguments. On a termination
    /// race the request is cancelled with EIO/ENODEV instead.
    pub fn commit_item_completion(&self, ticket: &CompletionTicket, error: i32, data: Option<Bytes>) {
        let pos = match self.pos_of_index(ticket.handle_index) {
            Some(pos) => pos,
            None => {
                debug_assert!(false, "committing an invalid handle");
                return;
            }
        };

        let mut guard = self.table.lock();
        let table = &mut *guard;
        debug_assert_eq!(table.slots[pos as usize].state, SlotState::BeingCompleted);
        debug_assert!(ticket.item_type.is_request());

        if table.terminated {
            self.cancel_due_to_termination(table, pos);
        } else {
            let error_ioctl = errno::sanitize_ioctl_reply_error(error);
            let error = errno::sanitize_reply_error(error);
            self.release_slot(table, pos, error, error_ioctl, data);
        }
    }

    /// Aborts a completion, returning the slot to awaiting-completion.
    pub fn abort_item_completion(&self, ticket: &CompletionTicket) {
        let pos = match self.pos_of_index(ticket.handle_index) {
            Some(pos) => pos,
            None => {
                debug_assert!(false, "aborting an invalid handle");
                return;
            }
        };

        let mut guard = self.table.lock();
        let table = &mut *guard;
        debug_assert_eq!(table.slots[pos as usize].state, SlotState::BeingCompleted);

        if table.terminated {
            self.cancel_due_to_termination(table, pos);
        } else {
            table.slots[pos as usize].state = SlotState::AwaitingCompletion;
        }
    }

    // ------------------------------------------------------------------
    // Observability
    // ------------------------------------------------------------------

    /// Snapshot of per-state slot counts.
    pub fn slot_counts(&self) -> SlotCounts {
        let table = self.table.lock();
        let mut counts = SlotCounts {
            free: 0,
            awaiting_get: 0,
            being_gotten: 0,
            awaiting_completion: 0,
            being_completed: 0,
        };
        for slot in table.slots.iter() {
            match slot.state {
                SlotState::Free => counts.free += 1,
                SlotState::AwaitingGet => counts.awaiting_get += 1,
                SlotState::BeingGotten => counts.being_gotten += 1,
                SlotState::AwaitingCompletion => counts.awaiting_completion += 1,
                SlotState::BeingCompleted => counts.being_completed += 1,
            }
        }
        counts
    }

    /// Seqnum of the slot behind a 1-based handle index, for diagnostics.
    pub fn slot_seqnum(&self, handle_index: u16) -> Option<u64> {
        let pos = self.pos_of_index(handle_index)?;
        Some(self.table.lock().slots[pos as usize].handle_seqnum)
    }

    /// Sanity checks before teardown: terminated, every slot free.
    pub(crate) fn debug_check_quiesced(&self) {
        let table = self.table.lock();
        debug_assert!(table.terminated);
        debug_assert!(table.ready_head.is_none());
        debug_assert_eq!(table.free.len() as u32, self.capacity);
        for slot in table.slots.iter() {
            debug_assert_eq!(slot.state, SlotState::Free);
        }
    }
}
