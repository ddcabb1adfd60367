//! # Item and Reply Cells
//!
//! Purpose: Define the 64-byte cells through which requests flow to an
//! attached session and replies flow back.
//!
//! ## Design Principles
//!
//! 1. **One Cell, Two Faces**: An `Item` and a `Reply` share a common header
//!    (buffer selector, handle) so a session can overwrite a received item
//!    with its reply in place.
//! 2. **Cache-Line Cells**: Every cell is exactly 64 bytes so a cell array
//!    never straddles lines and indexes translate to plain offsets.
//! 3. **ABA-Safe Handles**: The `(handle_index, handle_seqnum)` pair names a
//!    request uniquely across slot reuse; stale replies are detectable.
//!
//! ## Memory Layout
//!
//! ```text
//! Item (64 bytes):
//! +----------------+-----------------+---------+------+------+--------+
//! | buffer_index:8 | handle_seqnum:8 | index:2 | pb:1 | ty:1 | arg32:4|
//! +----------------+-----------------+---------+------+------+--------+
//! | arg64:8        | padding:32                                       |
//! +----------------+--------------------------------------------------+
//!
//! Reply (64 bytes):
//! +----------------+-----------------+---------+------+-------+--------+
//! | buffer_index:8 | handle_seqnum:8 | index:2 | pb:1 | pad:1 | error:4|
//! +----------------+-----------------+---------+------+-------+--------+
//! | padding:40                                                         |
//! +--------------------------------------------------------------------+
//! ```

use crate::cmd::ioc;

/// Size of every cell, in bytes.
pub const CELL_SIZE: usize = 64;

/// Handle index value meaning "no request" (pseudo-items, empty replies).
pub const NULL_HANDLE_INDEX: u16 = 0;

// ============================================================================
// ITEM TYPES
// ============================================================================

/// The kinds of items a session can receive.
///
/// The first three are pseudo-items produced by the engine itself; they are
/// not requests and must not be replied to. The rest carry an offset/length
/// pair in `arg64`/`arg32` (or an ioctl command word in `arg32`).
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    /// The device has become available to block-level clients.
    DeviceAvailable = 0,
    /// The session should close.
    Terminate = 1,
    /// The session should perform one flush, then close.
    FlushAndTerminate = 2,
    /// Read request. Reply payload: `arg32` bytes.
    Read = 3,
    /// Write request. Request payload: `arg32` bytes.
    Write = 4,
    /// Write-same request. Request payload: one logical block.
    WriteSame = 5,
    /// Write-zeros request that must not deallocate space.
    WriteZerosNoUnmap = 6,
    /// Write-zeros request that may deallocate space.
    WriteZerosMayUnmap = 7,
    /// FUA write request. Request payload: `arg32` bytes.
    FuaWrite = 8,
    /// Flush request.
    Flush = 9,
    /// Discard request.
    Discard = 10,
    /// Secure-erase request.
    SecureErase = 11,
    /// Ioctl request. `arg32` is the command word; payloads per direction.
    Ioctl = 12,
}

impl ItemType {
    /// Convert the item type to its u8 wire value.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to create an item type from a u8 wire value.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::DeviceAvailable),
            1 => Some(Self::Terminate),
            2 => Some(Self::FlushAndTerminate),
            3 => Some(Self::Read),
            4 => Some(Self::Write),
            5 => Some(Self::WriteSame),
            6 => Some(Self::WriteZerosNoUnmap),
            7 => Some(Self::WriteZerosMayUnmap),
            8 => Some(Self::FuaWrite),
            9 => Some(Self::Flush),
            10 => Some(Self::Discard),
            11 => Some(Self::SecureErase),
            12 => Some(Self::Ioctl),
            _ => None,
        }
    }

    /// Get the human-readable item type name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::DeviceAvailable => "DEVICE_AVAILABLE",
            Self::Terminate => "TERMINATE",
            Self::FlushAndTerminate => "FLUSH_AND_TERMINATE",
            Self::Read => "READ",
            Self::Write => "WRITE",
            Self::WriteSame => "WRITE_SAME",
            Self::WriteZerosNoUnmap => "WRITE_ZEROS_NO_UNMAP",
            Self::WriteZerosMayUnmap => "WRITE_ZEROS_MAY_UNMAP",
            Self::FuaWrite => "FUA_WRITE",
            Self::Flush => "FLUSH",
            Self::Discard => "DISCARD",
            Self::SecureErase => "SECURE_ERASE",
            Self::Ioctl => "IOCTL",
        }
    }

    /// Check if the item is a real request (reply expected).
    pub const fn is_request(self) -> bool {
        !matches!(
            self,
            Self::DeviceAvailable | Self::Terminate | Self::FlushAndTerminate
        )
    }

    /// Check if the item carries payload from the engine to the session.
    ///
    /// Ioctl payloads depend on the command word; see `ioctl_has_*_payload`.
    pub const fn has_request_payload(self) -> bool {
        matches!(self, Self::Write | Self::WriteSame | Self::FuaWrite)
    }

    /// Check if the reply to the item carries payload back to the engine.
    pub const fn has_reply_payload(self) -> bool {
        matches!(self, Self::Read)
    }
}

impl std::fmt::Display for ItemType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Whether an ioctl command word implies a request payload (engine→session).
pub const fn ioctl_has_request_payload(command: u32) -> bool {
    ioc::dir(command) & ioc::DIR_READ != 0
}

/// Whether an ioctl command word implies a reply payload (session→engine).
pub const fn ioctl_has_reply_payload(command: u32) -> bool {
    ioc::dir(command) & ioc::DIR_WRITE != 0
}

// ============================================================================
// CELLS
// ============================================================================

/// An item, as written into a cell by the engine.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Item {
    /// Index of the preallocated payload buffer for this item, if any.
    pub buffer_index: u64,
    /// The seqnum portion of the handle identifying this item.
    pub handle_seqnum: u64,
    /// The index portion of the handle; 0 for pseudo-items.
    pub handle_index: u16,
    /// Whether the payload lives in a preallocated buffer; always 1 here.
    pub use_preallocated_buffer: u8,
    /// The wire value of this item's `ItemType`.
    pub item_type: u8,
    /// The 32-bit argument (length, or ioctl command word).
    pub arg32: u32,
    /// The 64-bit argument (byte offset).
    pub arg64: u64,
    /// Reserved; must be zero.
    pub padding: [u8; 32],
}

impl Item {
    /// Builds a pseudo-item of the given type (null handle, no arguments).
    pub fn pseudo(item_type: ItemType) -> Self {
        Item {
            item_type: item_type.as_u8(),
            ..Default::default()
        }
    }

    /// Decodes the item type, if the wire value is known.
    pub fn item_type(&self) -> Option<ItemType> {
        ItemType::from_u8(self.item_type)
    }
}

impl Default for Item {
    fn default() -> Self {
        Item {
            buffer_index: 0,
            handle_seqnum: 0,
            handle_index: NULL_HANDLE_INDEX,
            use_preallocated_buffer: 1,
            item_type: ItemType::DeviceAvailable.as_u8(),
            arg32: 0,
            arg64: 0,
            padding: [0u8; 32],
        }
    }
}

/// A reply to a request item, as staged into a cell by the session.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reply {
    /// Index of the preallocated buffer holding the reply payload, if any.
    pub buffer_index: u64,
    /// The seqnum portion of the handle being replied to.
    pub handle_seqnum: u64,
    /// The index portion of the handle; 0 means "no reply" and is ignored.
    pub handle_index: u16,
    /// Whether the payload lives in a preallocated buffer; must be 1.
    pub use_preallocated_buffer: u8,
    /// Reserved; must be zero.
    pub padding1: [u8; 1],
    /// 0 on success, errno value otherwise.
    ///
    /// Non-ioctl requests: values other than 0, ENOLINK, ENOSPC, and
    /// ETIMEDOUT are converted into EIO. Ioctl requests: values outside
    /// `[1, 133]`, and ENOSYS, are converted into EIO.
    pub error: i32,
    /// Reserved; must be zero.
    pub padding2: [u8; 40],
}

impl Reply {
    /// Builds a reply for the given handle.
    pub fn new(handle_index: u16, handle_seqnum: u64, error: i32, buffer_index: u64) -> Self {
        Reply {
            buffer_index,
            handle_seqnum,
            handle_index,
            use_preallocated_buffer: 1,
            padding1: [0u8; 1],
            error,
            padding2: [0u8; 40],
        }
    }

    /// Builds a reply to an item, reusing its handle and buffer.
    pub fn to_item(item: &Item, error: i32) -> Self {
        Reply::new(item.handle_index, item.handle_seqnum, error, item.buffer_index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cell_sizes() {
        assert_eq!(std::mem::size_of::<Item>(), CELL_SIZE);
        assert_eq!(std::mem::size_of::<Reply>(), CELL_SIZE);
    }

    #[test]
    fn test_item_type_conversion() {
        for value in 0u8..=12 {
            let ty = ItemType::from_u8(value).unwrap();
            assert_eq!(ty.as_u8(), value);
        }
        assert_eq!(ItemType::from_u8(13), None);
        assert_eq!(ItemType::from_u8(255), None);
    }

    #[test]
    fn test_item_type_classification() {
        assert!(!ItemType::DeviceAvailable.is_request());
        assert!(!ItemType::Terminate.is_request());
        assert!(!ItemType::FlushAndTerminate.is_request());
        assert!(ItemType::Read.is_request());
        assert!(ItemType::Ioctl.is_request());

        assert!(ItemType::Write.has_request_payload());
        assert!(ItemType::WriteSame.has_request_payload());
        assert!(ItemType::FuaWrite.has_request_payload());
        assert!(!ItemType::Read.has_request_payload());

        assert!(ItemType::Read.has_reply_payload());
        assert!(!ItemType::Write.has_reply_payload());
    }

    #[test]
    fn test_ioctl_payload_direction() {
        use crate::cmd::ioc;

        let read_cmd = ioc::ioc(ioc::DIR_READ, b'x', 1, 64);
        let write_cmd = ioc::ioc(ioc::DIR_WRITE, b'x', 2, 64);
        let none_cmd = ioc::ioc(ioc::DIR_NONE, b'x', 3, 0);

        assert!(ioctl_has_request_payload(read_cmd));
        assert!(!ioctl_has_reply_payload(read_cmd));
        assert!(ioctl_has_reply_payload(write_cmd));
        assert!(!ioctl_has_request_payload(write_cmd));
        assert!(!ioctl_has_request_payload(none_cmd));
        assert!(!ioctl_has_reply_payload(none_cmd));
    }

    #[test]
    fn test_pseudo_item() {
        let item = Item::pseudo(ItemType::Terminate);
        assert_eq!(item.handle_index, NULL_HANDLE_INDEX);
        assert_eq!(item.handle_seqnum, 0);
        assert_eq!(item.item_type(), Some(ItemType::Terminate));
    }

    #[test]
    fn test_reply_to_item() {
        let mut item = Item::pseudo(ItemType::Read);
        item.handle_index = 3;
        item.handle_seqnum = 9;
        item.buffer_index = 2;

        let reply = Reply::to_item(&item, 0);
        assert_eq!(reply.handle_index, 3);
        assert_eq!(reply.handle_seqnum, 9);
        assert_eq!(reply.buffer_index, 2);
        assert_eq!(reply.error, 0);
        assert_eq!(reply.use_preallocated_buffer, 1);
    }
}
