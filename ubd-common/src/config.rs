//! # Configuration Records
//!
//! Purpose: Define the bit-stable device and session configuration records
//! exchanged over the control surface.
//!
//! ## Design Principles
//!
//! 1. **FFI Stability**: `#[repr(C)]` with explicit reserved space keeps the
//!    layouts identical on both sides of the control boundary.
//! 2. **Adjust-And-Echo**: The engine validates a configuration, adjusts it
//!    to effective values, and writes it back; callers always observe what
//!    the device actually does.
//! 3. **Zeroed Reserved Space**: Reserved bytes must be zero on input so new
//!    fields can be added without a version bump.
//!
//! ## Memory Layout
//!
//! ```text
//! Version (16 bytes):
//! +---------+---------+---------+---------+
//! | major:4 | minor:4 | patch:4 | pad:4   |
//! +---------+---------+---------+---------+
//!
//! DeviceConfig (128 bytes):
//! +------+--------+--------------- 4-byte fields ---------------+
//! | id:8 | size:8 | logical:4 physical:4 max_rw:4 max_ws:4      |
//! |      |        | max_wz:4 max_de:4 max_reqs:4                |
//! +------+--------+---------------------------------------------+
//! | 13 support/behavior flags (1 byte each) | reserved:71       |
//! +-----------------------------------------+-------------------+
//!
//! FdConfig (128 bytes):
//! +----------------------+--------------+
//! | num_prealloc_bufs:4  | reserved:124 |
//! +----------------------+--------------+
//!
//! DeviceAndFdConfig (256 bytes) = DeviceConfig + FdConfig
//! ```

/// Engine ABI version, major component.
pub const VERSION_MAJOR: u32 = 0;
/// Engine ABI version, minor component.
pub const VERSION_MINOR: u32 = 1;
/// Engine ABI version, patch component.
pub const VERSION_PATCH: u32 = 0;

/// System page size assumed by the engine, in bytes.
pub const PAGE_SIZE: u32 = 4096;

/// Hard maximum number of simultaneously existing devices.
pub const HARD_MAX_DEVICES: u32 = 4096;

/// Minor numbers reserved per device (room for partitions).
pub const MINORS_PER_DEVICE: u32 = 256;

/// Default for `max_read_write_size` when the caller passes 0.
pub const DEFAULT_MAX_READ_WRITE_SIZE: u32 = 256 * 1024;

/// Hard maximum for `max_read_write_size`.
pub const HARD_MAX_READ_WRITE_SIZE: u32 = 1024 * 1024;

/// Hard maximum for `max_outstanding_reqs`.
pub const HARD_MAX_OUTSTANDING_REQS: u32 = 256;

/// A version number triple.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version {
    /// The major version.
    pub major: u32,
    /// The minor version.
    pub minor: u32,
    /// The patch version.
    pub patch: u32,
    /// Reserved for alignment; must be zero.
    pub padding: u32,
}

impl Version {
    /// The engine's own ABI version.
    pub const CURRENT: Version = Version {
        major: VERSION_MAJOR,
        minor: VERSION_MINOR,
        patch: VERSION_PATCH,
        padding: 0,
    };
}

/// Configuration for a device.
///
/// On create, `id` is assigned by the engine and the `max_*` fields are
/// adjusted (never increased) to effective values; everything else is taken
/// as given after validation. On attach, only `id` is read and the whole
/// record is overwritten with the live device's configuration.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Numerical identifier, unique for the process lifetime, never reused.
    pub id: u64,

    /// Device size in bytes.
    ///
    /// Must be a positive multiple of `physical_block_size`, or of
    /// `logical_block_size` if the former is 0.
    pub size: u64,

    /// Logical block size in bytes.
    ///
    /// Must be a power of two in `[512, PAGE_SIZE]`.
    pub logical_block_size: u32,

    /// Physical block size in bytes.
    ///
    /// Must be 0 (adjusted to `logical_block_size`) or a power of two in
    /// `[logical_block_size, PAGE_SIZE]`.
    pub physical_block_size: u32,

    /// Maximum size for read, write, and FUA write requests, in bytes.
    ///
    /// Must be 0 or at least `PAGE_SIZE`. Adjusted to 0 when none of those
    /// request types is supported, defaulted when 0, and always rounded down
    /// to a multiple of `logical_block_size`.
    pub max_read_write_size: u32,

    /// Maximum size for write-same requests, in bytes.
    ///
    /// Must be 0 or at least `logical_block_size`; adjusted like the other
    /// `max_*` fields.
    pub max_write_same_size: u32,

    /// Maximum size for write-zeros requests, in bytes.
    pub max_write_zeros_size: u32,

    /// Maximum size for discard and secure-erase requests, in bytes.
    pub max_discard_erase_size: u32,

    /// Maximum number of simultaneously outstanding requests.
    ///
    /// Must be positive; capped at `HARD_MAX_OUTSTANDING_REQS`, and forced
    /// to 1 when the device supports no request type at all.
    pub max_outstanding_reqs: u32,

    /// Whether the device supports read requests.
    pub supports_read: u8,
    /// Whether the device supports write requests.
    pub supports_write: u8,
    /// Whether the device supports write-same requests.
    pub supports_write_same: u8,
    /// Whether the device supports write-zeros requests.
    pub supports_write_zeros: u8,
    /// Whether the device supports FUA write requests (implies flush).
    pub supports_fua_write: u8,
    /// Whether the device supports flush requests.
    pub supports_flush: u8,
    /// Whether the device supports discard requests.
    pub supports_discard: u8,
    /// Whether the device supports secure-erase requests.
    pub supports_secure_erase: u8,
    /// Whether the device supports ioctl requests.
    pub supports_ioctl: u8,

    /// Whether to expose the device as rotational.
    pub rotational: u8,
    /// Whether request merging should occur.
    pub merge_requests: u8,
    /// Whether partition scanning is enabled for the device.
    pub enable_partition_scanning: u8,

    /// Whether the device persists without an attached session.
    pub recoverable: u8,

    /// Reserved; must be zero.
    pub reserved: [u8; 71],
}

impl DeviceConfig {
    /// Builds a minimal configuration for a device of the given geometry.
    ///
    /// No request type is supported until the caller sets the corresponding
    /// flags.
    pub fn new(size: u64, logical_block_size: u32) -> Self {
        DeviceConfig {
            size,
            logical_block_size,
            ..Default::default()
        }
    }

    /// Returns true when every write-family support flag is false.
    ///
    /// Such a device is exposed read-only at the block level.
    pub fn is_read_only(&self) -> bool {
        self.supports_write == 0
            && self.supports_write_same == 0
            && self.supports_write_zeros == 0
            && self.supports_fua_write == 0
            && self.supports_discard == 0
            && self.supports_secure_erase == 0
    }

    /// Returns true when no request type at all is supported.
    pub fn supports_nothing(&self) -> bool {
        self.supports_read == 0
            && self.supports_write == 0
            && self.supports_write_same == 0
            && self.supports_write_zeros == 0
            && self.supports_fua_write == 0
            && self.supports_flush == 0
            && self.supports_discard == 0
            && self.supports_secure_erase == 0
            && self.supports_ioctl == 0
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            id: 0,
            size: 0,
            logical_block_size: 0,
            physical_block_size: 0,
            max_read_write_size: 0,
            max_write_same_size: 0,
            max_write_zeros_size: 0,
            max_discard_erase_size: 0,
            max_outstanding_reqs: 0,
            supports_read: 0,
            supports_write: 0,
            supports_write_same: 0,
            supports_write_zeros: 0,
            supports_fua_write: 0,
            supports_flush: 0,
            supports_discard: 0,
            supports_secure_erase: 0,
            supports_ioctl: 0,
            rotational: 0,
            merge_requests: 0,
            enable_partition_scanning: 0,
            recoverable: 0,
            reserved: [0u8; 71],
        }
    }
}

/// Configuration for a control session attachment.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdConfig {
    /// How many payload buffers to preallocate for the session.
    ///
    /// Clamped to the adjusted `max_outstanding_reqs`; 0 selects that
    /// maximum.
    pub num_preallocated_buffers: u32,

    /// Reserved; must be zero.
    pub reserved: [u8; 124],
}

impl FdConfig {
    /// Builds a session configuration with an explicit buffer count.
    pub fn new(num_preallocated_buffers: u32) -> Self {
        FdConfig {
            num_preallocated_buffers,
            reserved: [0u8; 124],
        }
    }
}

impl Default for FdConfig {
    fn default() -> Self {
        FdConfig::new(0)
    }
}

/// Configuration for both a device and a control session.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceAndFdConfig {
    /// Configuration for the device.
    pub device: DeviceConfig,
    /// Configuration for the session.
    pub fd: FdConfig,
}

impl DeviceAndFdConfig {
    /// Builds a combined configuration from its two halves.
    pub fn new(device: DeviceConfig, fd: FdConfig) -> Self {
        DeviceAndFdConfig { device, fd }
    }
}
