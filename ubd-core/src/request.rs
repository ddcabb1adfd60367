//! Block requests and producer-side completion handles.
//!
//! A `BlockRequest` is what a producer submits against a device: the
//! operation, its byte range, and any payload. Submission stores the slot
//! handle into the request's shared state and the producer blocks on the
//! matching `RequestHandle` for the final sanitised status and, for reads
//! and ioctls, the reply payload.

use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};

use ubd_common::cell::ItemType;
use ubd_common::cell::NULL_HANDLE_INDEX;

/// A block-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqOp {
    /// Read `len` bytes from `offset`.
    Read,
    /// Write the payload at `offset`; `fua` forces it to stable storage.
    Write {
        /// Whether the write must reach persistent storage before completing.
        fua: bool,
    },
    /// Write one logical block of payload repeatedly across the range.
    WriteSame,
    /// Zero the range.
    WriteZeros {
        /// Whether the device may deallocate instead of writing zeros.
        may_unmap: bool,
    },
    /// Flush the write cache.
    Flush,
    /// Discard the range.
    Discard,
    /// Securely erase the range.
    SecureErase,
    /// Device-level ioctl with the given command word.
    Ioctl {
        /// The encoded ioctl command word.
        command: u32,
    },
}

impl ReqOp {
    /// Maps the operation onto the item type delivered to the consumer.
    pub const fn item_type(self) -> ItemType {
        match self {
            ReqOp::Read => ItemType::Read,
            ReqOp::Write { fua: false } => ItemType::Write,
            ReqOp::Write { fua: true } => ItemType::FuaWrite,
            ReqOp::WriteSame => ItemType::WriteSame,
            ReqOp::WriteZeros { may_unmap: false } => ItemType::WriteZerosNoUnmap,
            ReqOp::WriteZeros { may_unmap: true } => ItemType::WriteZerosMayUnmap,
            ReqOp::Flush => ItemType::Flush,
            ReqOp::Discard => ItemType::Discard,
            ReqOp::SecureErase => ItemType::SecureErase,
            ReqOp::Ioctl { .. } => ItemType::Ioctl,
        }
    }

    /// Whether the operation is an ioctl (selects the ioctl errno flavour).
    pub const fn is_ioctl(self) -> bool {
        matches!(self, ReqOp::Ioctl { .. })
    }
}

/// Final outcome of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestResult {
    /// 0 on success, sanitised errno value otherwise.
    pub error: i32,
    /// Reply payload for reads and ioctl-out arguments, on success only.
    pub data: Option<Bytes>,
}

#[derive(Debug)]
struct RequestState {
    handle_index: u16,
    handle_seqnum: u64,
    result: Option<RequestResult>,
}

#[derive(Debug)]
struct RequestShared {
    state: Mutex<RequestState>,
    done: Condvar,
}

/// A request submitted by a producer.
#[derive(Debug)]
pub struct BlockRequest {
    op: ReqOp,
    offset: u64,
    len: u32,
    data: Option<Bytes>,
    shared: Arc<RequestShared>,
}

impl BlockRequest {
    fn new(op: ReqOp, offset: u64, len: u32, data: Option<Bytes>) -> Self {
        BlockRequest {
            op,
            offset,
            len,
            data,
            shared: Arc::new(RequestShared {
                state: Mutex::new(RequestState {
                    handle_index: NULL_HANDLE_INDEX,
                    handle_seqnum: 0,
                    result: None,
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Builds a read request.
    pub fn read(offset: u64, len: u32) -> Self {
        BlockRequest::new(ReqOp::Read, offset, len, None)
    }

    /// Builds a write request over the payload's length.
    pub fn write(offset: u64, data: Bytes) -> Self {
        let len = data.len() as u32;
        BlockRequest::new(ReqOp::Write { fua: false }, offset, len, Some(data))
    }

    /// Builds a FUA write request over the payload's length.
    pub fn write_fua(offset: u64, data: Bytes) -> Self {
        let len = data.len() as u32;
        BlockRequest::new(ReqOp::Write { fua: true }, offset, len, Some(data))
    }

    /// Builds a write-same request; `block` is one logical block.
    pub fn write_same(offset: u64, len: u32, block: Bytes) -> Self {
        BlockRequest::new(ReqOp::WriteSame, offset, len, Some(block))
    }

    /// Builds a write-zeros request.
    pub fn write_zeros(offset: u64, len: u32, may_unmap: bool) -> Self {
        BlockRequest::new(ReqOp::WriteZeros { may_unmap }, offset, len, None)
    }

    /// Builds a flush request.
    pub fn flush() -> Self {
        BlockRequest::new(ReqOp::Flush, 0, 0, None)
    }

    /// Builds a discard request.
    pub fn discard(offset: u64, len: u32) -> Self {
        BlockRequest::new(ReqOp::Discard, offset, len, None)
    }

    /// Builds a secure-erase request.
    pub fn secure_erase(offset: u64, len: u32) -> Self {
        BlockRequest::new(ReqOp::SecureErase, offset, len, None)
    }

    /// Builds an ioctl request; `arg` is the raw argument buffer.
    pub fn ioctl(command: u32, arg: Bytes) -> Self {
        BlockRequest::new(ReqOp::Ioctl { command }, 0, 0, Some(arg))
    }

    /// The request's operation.
    pub fn op(&self) -> ReqOp {
        self.op
    }

    /// Byte offset of the request.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Byte length of the request.
    pub fn len(&self) -> u32 {
        self.len
    }

    /// Whether the request covers no bytes.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The request payload (write data, write-same block, or ioctl argument).
    pub fn data(&self) -> Option<&Bytes> {
        self.data.as_ref()
    }

    /// A completion handle for this request.
    pub fn handle(&self) -> RequestHandle {
        RequestHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Records the slot handle assigned at submission.
    pub(crate) fn set_handle(&self, index: u16, seqnum: u64) {
        let mut state = self.shared.state.lock();
        state.handle_index = index;
        state.handle_seqnum = seqnum;
    }

    /// Completes the request, picking the errno flavour by operation.
    ///
    /// The payload is delivered only on success.
    pub(crate) fn finish(self, error: i32, error_ioctl: i32, data: Option<Bytes>) {
        let status = if self.op.is_ioctl() { error_ioctl } else { error };
        let result = RequestResult {
            error: status,
            data: if status == 0 { data } else { None },
        };

        let mut state = self.shared.state.lock();
        debug_assert!(state.result.is_none());
        state.result = Some(result);
        self.shared.done.notify_all();
    }
}

/// Producer-side handle for awaiting a request's completion.
#[derive(Debug, Clone)]
pub struct RequestHandle {
    shared: Arc<RequestShared>,
}

impl RequestHandle {
    /// Blocks until the request completes and returns its outcome.
    pub fn wait(&self) -> RequestResult {
        let mut state = self.shared.state.lock();
        while state.result.is_none() {
            self.shared.done.wait(&mut state);
        }
        state.result.clone().expect("request completed")
    }

    /// Like `wait`, but gives up after `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<RequestResult> {
        let deadline = Instant::now() + timeout;
        let mut state = self.shared.state.lock();
        while state.result.is_none() {
            if self.shared.done.wait_until(&mut state, deadline).timed_out() {
                return None;
            }
        }
        state.result.clone()
    }

    /// Returns the outcome if the request already completed.
    pub fn try_result(&self) -> Option<RequestResult> {
        self.shared.state.lock().result.clone()
    }

    /// The slot handle recorded at submission (0 before, or on early failure).
    pub(crate) fn stored_handle(&self) -> (u16, u64) {
        let state = self.shared.state.lock();
        (state.handle_index, state.handle_seqnum)
    }
}
