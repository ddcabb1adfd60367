//! Errno values and reply-status sanitisation.
//!
//! The engine speaks errno: every failure surfaced to a block-level client
//! or a control session is one of these positive values. The two sanitisers
//! below are part of the external contract; their allow-lists shape exactly
//! which statuses user programs can ever observe.

/// Operation not permitted.
pub const EPERM: i32 = 1;
/// No such file or directory.
pub const ENOENT: i32 = 2;
/// Interrupted system call.
pub const EINTR: i32 = 4;
/// Input/output error.
pub const EIO: i32 = 5;
/// No child processes (reused here for "partition, not whole device").
pub const ECHILD: i32 = 10;
/// Out of memory.
pub const ENOMEM: i32 = 12;
/// Bad address.
pub const EFAULT: i32 = 14;
/// Block device required.
pub const ENOTBLK: i32 = 15;
/// Device or resource busy.
pub const EBUSY: i32 = 16;
/// No such device.
pub const ENODEV: i32 = 19;
/// Invalid argument.
pub const EINVAL: i32 = 22;
/// Inappropriate ioctl for device.
pub const ENOTTY: i32 = 25;
/// No space left on device.
pub const ENOSPC: i32 = 28;
/// Function not implemented.
pub const ENOSYS: i32 = 38;
/// Link has been severed.
pub const ENOLINK: i32 = 67;
/// Operation not supported.
pub const EOPNOTSUPP: i32 = 95;
/// Connection timed out.
pub const ETIMEDOUT: i32 = 110;
/// Operation now in progress.
pub const EINPROGRESS: i32 = 115;

/// Highest errno value a reply to an ioctl request may carry.
///
/// Kept as a policy constant rather than tracking any particular host's
/// errno ceiling.
pub const ERRNO_CEILING: i32 = 133;

/// Sanitises the errno of a reply to a non-ioctl request.
///
/// Allow-list: 0, ENOLINK, ENOSPC, ETIMEDOUT. Every other value becomes EIO.
pub const fn sanitize_reply_error(error: i32) -> i32 {
    match error {
        0 | ENOLINK | ENOSPC | ETIMEDOUT => error,
        _ => EIO,
    }
}

/// Sanitises the errno of a reply to an ioctl request.
///
/// Allow-list: 0, and every value in [1, ERRNO_CEILING] except ENOSYS.
/// Every other value becomes EIO.
pub const fn sanitize_ioctl_reply_error(error: i32) -> i32 {
    if error == 0 {
        0
    } else if error >= 1 && error <= ERRNO_CEILING && error != ENOSYS {
        error
    } else {
        EIO
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reply_error_allow_list() {
        assert_eq!(sanitize_reply_error(0), 0);
        assert_eq!(sanitize_reply_error(ENOLINK), ENOLINK);
        assert_eq!(sanitize_reply_error(ENOSPC), ENOSPC);
        assert_eq!(sanitize_reply_error(ETIMEDOUT), ETIMEDOUT);
    }

    #[test]
    fn test_reply_error_collapses_to_eio() {
        assert_eq!(sanitize_reply_error(EPERM), EIO);
        assert_eq!(sanitize_reply_error(EINVAL), EIO);
        assert_eq!(sanitize_reply_error(-1), EIO);
        assert_eq!(sanitize_reply_error(9999), EIO);
        assert_eq!(sanitize_reply_error(EIO), EIO);
    }

    #[test]
    fn test_ioctl_reply_error_allow_list() {
        assert_eq!(sanitize_ioctl_reply_error(0), 0);
        assert_eq!(sanitize_ioctl_reply_error(EPERM), EPERM);
        assert_eq!(sanitize_ioctl_reply_error(ENOTTY), ENOTTY);
        assert_eq!(sanitize_ioctl_reply_error(ERRNO_CEILING), ERRNO_CEILING);
    }

    #[test]
    fn test_ioctl_reply_error_collapses_to_eio() {
        assert_eq!(sanitize_ioctl_reply_error(ENOSYS), EIO);
        assert_eq!(sanitize_ioctl_reply_error(-EINVAL), EIO);
        assert_eq!(sanitize_ioctl_reply_error(ERRNO_CEILING + 1), EIO);
    }
}
