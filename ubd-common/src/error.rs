//! The process-wide error type for the ubd engine.

use std::fmt;

use crate::errno;

/// Result type used across the engine.
pub type UbdResult<T> = Result<T, UbdError>;

/// Errors surfaced by the engine and the control surface.
///
/// Every variant maps onto one errno value via [`UbdError::errno`]; that
/// mapping is the external contract and does not change between releases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UbdError {
    /// Bad field value, bad combination, stale handle index, or misuse of
    /// the control surface.
    InvalidArgument,
    /// The maximum number of devices already exists.
    NoSpace,
    /// The device existed but does not any more.
    NoDevice,
    /// The named node does not exist.
    NotFound,
    /// The device is not yet available to clients.
    Busy,
    /// Another session is already attaching to the device.
    InProgress,
    /// A blocking wait was interrupted.
    Interrupted,
    /// The session is not attached to a device.
    NotAttached,
    /// The session is already attached to a device.
    AlreadyAttached,
    /// The named node is not a block special node.
    NotBlockDevice,
    /// The minor addresses a partition rather than the whole device.
    PartitionMinor,
    /// The request type is not supported by the device.
    Unsupported,
    /// The ioctl command word is not valid for the device.
    NotTty,
    /// The request timed out.
    TimedOut,
    /// Input/output error (termination races included).
    Io,
}

impl UbdError {
    /// Returns the errno value this error surfaces as.
    pub const fn errno(self) -> i32 {
        match self {
            UbdError::InvalidArgument => errno::EINVAL,
            UbdError::NoSpace => errno::ENOSPC,
            UbdError::NoDevice => errno::ENODEV,
            UbdError::NotFound => errno::ENOENT,
            UbdError::Busy => errno::EBUSY,
            UbdError::InProgress => errno::EINPROGRESS,
            UbdError::Interrupted => errno::EINTR,
            UbdError::NotAttached => errno::EINVAL,
            UbdError::AlreadyAttached => errno::EINVAL,
            UbdError::NotBlockDevice => errno::ENOTBLK,
            UbdError::PartitionMinor => errno::ECHILD,
            UbdError::Unsupported => errno::EOPNOTSUPP,
            UbdError::NotTty => errno::ENOTTY,
            UbdError::TimedOut => errno::ETIMEDOUT,
            UbdError::Io => errno::EIO,
        }
    }
}

impl fmt::Display for UbdError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let message = match self {
            UbdError::InvalidArgument => "invalid argument",
            UbdError::NoSpace => "too many devices",
            UbdError::NoDevice => "device no longer exists",
            UbdError::NotFound => "no such node",
            UbdError::Busy => "device not yet available",
            UbdError::InProgress => "attach already in progress",
            UbdError::Interrupted => "interrupted",
            UbdError::NotAttached => "session not attached to a device",
            UbdError::AlreadyAttached => "session already attached to a device",
            UbdError::NotBlockDevice => "not a block special node",
            UbdError::PartitionMinor => "minor addresses a partition",
            UbdError::Unsupported => "request type not supported",
            UbdError::NotTty => "invalid ioctl command",
            UbdError::TimedOut => "request timed out",
            UbdError::Io => "input/output error",
        };
        write!(f, "{} (errno {})", message, self.errno())
    }
}

impl std::error::Error for UbdError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_errno_mapping() {
        assert_eq!(UbdError::InvalidArgument.errno(), errno::EINVAL);
        assert_eq!(UbdError::NoSpace.errno(), errno::ENOSPC);
        assert_eq!(UbdError::NoDevice.errno(), errno::ENODEV);
        assert_eq!(UbdError::Busy.errno(), errno::EBUSY);
        assert_eq!(UbdError::InProgress.errno(), errno::EINPROGRESS);
        assert_eq!(UbdError::Interrupted.errno(), errno::EINTR);
        assert_eq!(UbdError::NotBlockDevice.errno(), errno::ENOTBLK);
        assert_eq!(UbdError::PartitionMinor.errno(), errno::ECHILD);
        assert_eq!(UbdError::Unsupported.errno(), errno::EOPNOTSUPP);
        assert_eq!(UbdError::TimedOut.errno(), errno::ETIMEDOUT);
        assert_eq!(UbdError::Io.errno(), errno::EIO);
    }

    #[test]
    fn test_display_mentions_errno() {
        let rendered = format!("{}", UbdError::NoDevice);
        assert!(rendered.contains("19"));
    }
}
