// cmd.rs - control command definitions for the ubd mediation engine
//
// This module defines the commands issued against the ubd control device.
//
// ============================================================================
// COMMAND MODEL
// ============================================================================
//
// All engine operations go through a single control surface, keyed by a small
// command number under a per-driver magic byte. The split mirrors the two
// roles a control session can play:
//
// 1. **Session commands** (0-9): device lifecycle and queries. These either
//    act on the caller's session (create/attach/terminate/mark-successful) or
//    address a device by id (config, flush, destruction, wait). They are
//    valid whether or not the session is attached, except where documented.
//
// 2. **Transceiver commands** (10-12): the item/reply pump. These require an
//    attached session and operate on one 64-byte cell identified by its
//    index, plus a preallocated payload buffer.
//
// Each command's payload layout is bit-stable; see `config` and `cell` for
// the records involved. Commands are deliberately coarse: one RECEIVE_ITEM
// hands over one request, one SEND_REPLY completes one, and the fused
// SEND_REPLY_AND_RECEIVE_ITEM saves a round trip on the steady-state path.
//
// Embedded ioctl requests (forwarded from clients of the block device itself)
// carry their own command word, encoded with the usual direction/size/nr bits;
// the `ioc` module below provides the helpers to decode and validate those.

use std::fmt;

/// Magic byte identifying ubd control commands.
pub const CMD_MAGIC: u8 = b'U';

/// Control device path.
pub const CONTROL_PATH: &str = "/dev/ubd-control";

/// Control device name.
pub const CONTROL_NAME: &str = "ubd-control";

// ============================================================================
// COMMAND NUMBERS
// ============================================================================

/// Returns the engine's ABI version triple.
pub const CMD_GET_VERSION: u8 = 0;

/// Creates a device from a `DeviceAndFdConfig` and attaches the caller.
///
/// The configuration is validated, adjusted, and written back so the caller
/// observes the effective values (assigned id included).
pub const CMD_CREATE_DEVICE: u8 = 1;

/// Attaches the caller to an existing device by id.
///
/// If another session is attached, a driver handover is performed: the
/// incumbent is deactivated (with flush when supported) and the command
/// blocks until it detaches. The live device configuration is written back.
pub const CMD_ATTACH_TO_DEVICE: u8 = 2;

/// Terminates the caller's device.
///
/// After this, every received item is TERMINATE, forever.
pub const CMD_TERMINATE: u8 = 3;

/// Latches the caller's per-session success flag, consulted at release time.
pub const CMD_MARK_AS_SUCCESSFUL: u8 = 4;

/// Resolves a block special node path to a device id.
pub const CMD_DEVICE_PATH_TO_ID: u8 = 5;

/// Returns the live (adjusted) configuration of a device by id.
pub const CMD_GET_DEVICE_CONFIG: u8 = 6;

/// Synchronously flushes a device by id. A no-op for read-only devices.
pub const CMD_FLUSH_DEVICE: u8 = 7;

/// Fire-and-forget destruction of a device by id.
///
/// Attached sessions start receiving perpetual TERMINATE items; the device
/// is destroyed once the last session detaches (immediately if clientless).
pub const CMD_TRIGGER_DEVICE_DESTRUCTION: u8 = 8;

/// Blocks until the device with the given id has been destroyed.
pub const CMD_WAIT_UNTIL_DEVICE_IS_DESTROYED: u8 = 9;

/// Consumer step: populate the addressed cell with the next item.
pub const CMD_RECEIVE_ITEM: u8 = 10;

/// Consumer step: consume the reply staged in the addressed cell.
pub const CMD_SEND_REPLY: u8 = 11;

/// Fused consumer step: SEND_REPLY then RECEIVE_ITEM on the same cell.
pub const CMD_SEND_REPLY_AND_RECEIVE_ITEM: u8 = 12;

// ============================================================================
// COMMAND ENUMERATION
// ============================================================================

/// All control commands, as a type-safe view over the command numbers.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlCommand {
    /// Query the engine ABI version.
    GetVersion = CMD_GET_VERSION,

    /// Create a device and attach the caller.
    CreateDevice = CMD_CREATE_DEVICE,

    /// Attach the caller to an existing device (driver handover).
    AttachToDevice = CMD_ATTACH_TO_DEVICE,

    /// Terminate the caller's device.
    Terminate = CMD_TERMINATE,

    /// Latch the caller's success flag.
    MarkAsSuccessful = CMD_MARK_AS_SUCCESSFUL,

    /// Resolve a block node path to a device id.
    DevicePathToId = CMD_DEVICE_PATH_TO_ID,

    /// Fetch a device's live configuration.
    GetDeviceConfig = CMD_GET_DEVICE_CONFIG,

    /// Flush a device.
    FlushDevice = CMD_FLUSH_DEVICE,

    /// Trigger destruction of a device.
    TriggerDeviceDestruction = CMD_TRIGGER_DEVICE_DESTRUCTION,

    /// Wait until a device has been destroyed.
    WaitUntilDeviceIsDestroyed = CMD_WAIT_UNTIL_DEVICE_IS_DESTROYED,

    /// Pull the next item into a cell.
    ReceiveItem = CMD_RECEIVE_ITEM,

    /// Push the reply staged in a cell.
    SendReply = CMD_SEND_REPLY,

    /// Push a reply and pull the next item in one step.
    SendReplyAndReceiveItem = CMD_SEND_REPLY_AND_RECEIVE_ITEM,
}

impl ControlCommand {
    /// Convert command to its u8 number.
    pub const fn as_u8(self) -> u8 {
        self as u8
    }

    /// Try to create a command from a u8 number.
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            CMD_GET_VERSION => Some(Self::GetVersion),
            CMD_CREATE_DEVICE => Some(Self::CreateDevice),
            CMD_ATTACH_TO_DEVICE => Some(Self::AttachToDevice),
            CMD_TERMINATE => Some(Self::Terminate),
            CMD_MARK_AS_SUCCESSFUL => Some(Self::MarkAsSuccessful),
            CMD_DEVICE_PATH_TO_ID => Some(Self::DevicePathToId),
            CMD_GET_DEVICE_CONFIG => Some(Self::GetDeviceConfig),
            CMD_FLUSH_DEVICE => Some(Self::FlushDevice),
            CMD_TRIGGER_DEVICE_DESTRUCTION => Some(Self::TriggerDeviceDestruction),
            CMD_WAIT_UNTIL_DEVICE_IS_DESTROYED => Some(Self::WaitUntilDeviceIsDestroyed),
            CMD_RECEIVE_ITEM => Some(Self::ReceiveItem),
            CMD_SEND_REPLY => Some(Self::SendReply),
            CMD_SEND_REPLY_AND_RECEIVE_ITEM => Some(Self::SendReplyAndReceiveItem),
            _ => None,
        }
    }

    /// Get the human-readable command name.
    pub const fn name(self) -> &'static str {
        match self {
            Self::GetVersion => "GET_VERSION",
            Self::CreateDevice => "CREATE_DEVICE",
            Self::AttachToDevice => "ATTACH_TO_DEVICE",
            Self::Terminate => "TERMINATE",
            Self::MarkAsSuccessful => "MARK_AS_SUCCESSFUL",
            Self::DevicePathToId => "DEVICE_PATH_TO_ID",
            Self::GetDeviceConfig => "GET_DEVICE_CONFIG",
            Self::FlushDevice => "FLUSH_DEVICE",
            Self::TriggerDeviceDestruction => "TRIGGER_DEVICE_DESTRUCTION",
            Self::WaitUntilDeviceIsDestroyed => "WAIT_UNTIL_DEVICE_IS_DESTROYED",
            Self::ReceiveItem => "RECEIVE_ITEM",
            Self::SendReply => "SEND_REPLY",
            Self::SendReplyAndReceiveItem => "SEND_REPLY_AND_RECEIVE_ITEM",
        }
    }

    /// Check if the command is a lifecycle/query command.
    pub const fn is_session_command(self) -> bool {
        (self as u8) < CMD_RECEIVE_ITEM
    }

    /// Check if the command drives the item/reply pump (attached only).
    pub const fn is_transceiver_command(self) -> bool {
        (self as u8) >= CMD_RECEIVE_ITEM
    }
}

impl fmt::Display for ControlCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ============================================================================
// EMBEDDED IOCTL COMMAND WORDS
// ============================================================================

/// Helpers for the ioctl command words embedded in IOCTL items.
///
/// These follow the classic encoding: 8 bits of command number, 8 bits of
/// type, 14 bits of argument size, 2 bits of direction.
pub mod ioc {
    /// No argument transfer.
    pub const DIR_NONE: u32 = 0;
    /// Argument is copied from the caller into the handler.
    pub const DIR_WRITE: u32 = 1;
    /// Argument is copied from the handler back to the caller.
    pub const DIR_READ: u32 = 2;

    const NR_BITS: u32 = 8;
    const TYPE_BITS: u32 = 8;
    const SIZE_BITS: u32 = 14;

    const NR_SHIFT: u32 = 0;
    const TYPE_SHIFT: u32 = NR_SHIFT + NR_BITS;
    const SIZE_SHIFT: u32 = TYPE_SHIFT + TYPE_BITS;
    const DIR_SHIFT: u32 = SIZE_SHIFT + SIZE_BITS;

    /// Maximum argument size an embedded ioctl command may declare.
    pub const MAX_ARG_SIZE: u32 = 1 << SIZE_BITS;

    /// Encodes an ioctl command word.
    pub const fn ioc(dir: u32, ty: u8, nr: u8, size: u32) -> u32 {
        (dir << DIR_SHIFT)
            | ((ty as u32) << TYPE_SHIFT)
            | ((nr as u32) << NR_SHIFT)
            | (size << SIZE_SHIFT)
    }

    /// Extracts the direction bits of a command word.
    pub const fn dir(command: u32) -> u32 {
        (command >> DIR_SHIFT) & ((1 << 2) - 1)
    }

    /// Extracts the argument size of a command word.
    pub const fn size(command: u32) -> u32 {
        (command >> SIZE_SHIFT) & ((1 << SIZE_BITS) - 1)
    }

    /// Extracts the type byte of a command word.
    pub const fn ty(command: u32) -> u8 {
        ((command >> TYPE_SHIFT) & ((1 << TYPE_BITS) - 1)) as u8
    }

    /// Extracts the command number of a command word.
    pub const fn nr(command: u32) -> u8 {
        ((command >> NR_SHIFT) & ((1 << NR_BITS) - 1)) as u8
    }

    /// Checks that a command word is structurally valid.
    ///
    /// Direction NONE requires a zero size; any transfer direction requires a
    /// positive size below `MAX_ARG_SIZE`.
    pub const fn is_valid(command: u32) -> bool {
        let size = size(command);
        match dir(command) {
            DIR_NONE => size == 0,
            DIR_READ | DIR_WRITE => size > 0,
            _ => size > 0, // DIR_READ | DIR_WRITE combined
        }
    }
}

// ============================================================================
// TESTS
// ============================================================================
