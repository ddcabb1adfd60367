// ubd-common - Shared ABI types and protocol definitions for ubd
//
// This crate defines the control-command surface, the device and session
// configuration records, the 64-byte item/reply cells, and the errno policy
// shared by the mediation engine and user-space driver libraries.

pub mod cell;
pub mod cmd;
pub mod config;
pub mod errno;
pub mod error;

// Re-export for convenience
pub use cell::{Item, ItemType, Reply, CELL_SIZE};
pub use config::{DeviceAndFdConfig, DeviceConfig, FdConfig, Version};
pub use error::{UbdError, UbdResult};
