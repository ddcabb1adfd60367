//! # Device State Machine
//!
//! Purpose: Own one inverter and one published block disk, translate block
//! operations into items, and walk the lifecycle
//! `UNAVAILABLE -> ACTIVE <-> INACTIVE -> TERMINATED` on behalf of the
//! coordinator.
//!
//! Disk registration is asynchronous, as the block layer's is: `spawn_disk_add`
//! starts a short-lived thread that publishes the node, arms the
//! device-available notification, and flips the state to ACTIVE unless a
//! termination won the race.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use log::debug;
use parking_lot::Mutex;

use ubd_common::cmd::ioc;
use ubd_common::config::{
    DeviceConfig, DEFAULT_MAX_READ_WRITE_SIZE, HARD_MAX_OUTSTANDING_REQS,
    HARD_MAX_READ_WRITE_SIZE, PAGE_SIZE,
};
use ubd_common::{UbdError, UbdResult};

use crate::completion::Completion;
use crate::disk::{DevNum, DiskRegistry};
use crate::inverter::{Inverter, TimeoutDecision};
use crate::request::{BlockRequest, ReqOp, RequestHandle};

/// Lifecycle states of a device.
#[repr(u32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Initial state; disk registration still pending.
    Unavailable = 0,
    /// Normal operation: requests flow to the attached consumer.
    Active = 1,
    /// Consumer detached; requests queue but are not delivered.
    Inactive = 2,
    /// Terminal: new and pending requests fail immediately.
    Terminated = 3,
}

impl DeviceState {
    fn from_u32(value: u32) -> DeviceState {
        match value {
            0 => DeviceState::Unavailable,
            1 => DeviceState::Active,
            2 => DeviceState::Inactive,
            _ => DeviceState::Terminated,
        }
    }
}

// ----------------------------------------------------------------------
// Configuration validation and adjustment
// ----------------------------------------------------------------------

fn is_positive_multiple_of(value: u64, divisor: u32) -> bool {
    divisor != 0 && value > 0 && value % (divisor as u64) == 0
}

fn round_down(value: u32, multiple: u32) -> u32 {
    value - value % multiple
}

fn min_not_zero(value: u32, fallback: u32) -> u32 {
    if value == 0 {
        fallback
    } else {
        value.min(fallback)
    }
}

fn validate_config(config: &DeviceConfig) -> bool {
    let mut valid = config.reserved.iter().all(|&byte| byte == 0);

    // supports_fua_write implies supports_flush
    valid = valid && (config.supports_fua_write == 0 || config.supports_flush != 0);

    valid = valid
        && config.logical_block_size.is_power_of_two()
        && config.logical_block_size >= 512
        && config.logical_block_size <= PAGE_SIZE;

    valid = valid
        && (config.physical_block_size == 0
            || (config.physical_block_size.is_power_of_two()
                && config.physical_block_size >= config.logical_block_size
                && config.physical_block_size <= PAGE_SIZE));

    valid = valid
        && is_positive_multiple_of(
            config.size,
            config.physical_block_size.max(config.logical_block_size),
        );

    valid = valid
        && (config.max_read_write_size == 0 || config.max_read_write_size >= PAGE_SIZE);

    valid = valid
        && (config.max_write_same_size == 0
            || config.max_write_same_size >= config.logical_block_size);

    valid = valid
        && (config.max_write_zeros_size == 0
            || config.max_write_zeros_size >= config.logical_block_size);

    valid = valid
        && (config.max_discard_erase_size == 0
            || config.max_discard_erase_size >= config.logical_block_size);

    valid && config.max_outstanding_reqs > 0
}

/// Adjusts a previously validated configuration to effective values.
fn adjust_config(config: &mut DeviceConfig) {
    if config.physical_block_size == 0 {
        config.physical_block_size = config.logical_block_size;
    }

    if config.supports_read == 0 && config.supports_write == 0 && config.supports_fua_write == 0 {
        config.max_read_write_size = 0;
    } else if config.max_read_write_size == 0 {
        config.max_read_write_size = DEFAULT_MAX_READ_WRITE_SIZE
            .clamp(
                PAGE_SIZE,
                round_down(HARD_MAX_READ_WRITE_SIZE, config.logical_block_size),
            );
    } else {
        config.max_read_write_size = round_down(
            config.max_read_write_size.min(HARD_MAX_READ_WRITE_SIZE),
            config.logical_block_size,
        );
    }

    if config.supports_write_same == 0 {
        config.max_write_same_size = 0;
    } else {
        config.max_write_same_size = round_down(
            min_not_zero(config.max_write_same_size, u32::MAX),
            config.logical_block_size,
        );
    }

    if config.supports_write_zeros == 0 {
        config.max_write_zeros_size = 0;
    } else {
        config.max_write_zeros_size = round_down(
            min_not_zero(config.max_write_zeros_size, u32::MAX),
            config.logical_block_size,
        );
    }

    if config.supports_discard == 0 && config.supports_secure_erase == 0 {
        config.max_discard_erase_size = 0;
    } else {
        config.max_discard_erase_size = round_down(
            min_not_zero(config.max_discard_erase_size, u32::MAX),
            config.logical_block_size,
        );
    }

    if config.supports_nothing() {
        config.max_outstanding_reqs = 1;
    } else {
        config.max_outstanding_reqs = config
            .max_outstanding_reqs
            .min(HARD_MAX_OUTSTANDING_REQS);
    }
}

/// Validates a device configuration and, if valid, adjusts it in place.
pub fn validate_and_adjust_config(config: &mut DeviceConfig) -> UbdResult<()> {
    if !validate_config(config) {
        return Err(UbdError::InvalidArgument);
    }
    adjust_config(config);
    Ok(())
}

// ----------------------------------------------------------------------
// Device
// ----------------------------------------------------------------------

/// A block device: one inverter, one published disk node, one state word.
#[derive(Debug)]
pub struct Device {
    config: DeviceConfig,
    state: AtomicU32,
    inverter: Arc<Inverter>,

    registry: Arc<DiskRegistry>,
    disk_name: String,
    devnum: DevNum,

    added: Completion,
    adder: Mutex<Option<JoinHandle<()>>>,
}

impl Device {
    /// Builds a device from an adjusted configuration.
    ///
    /// The disk is not published until [`Device::spawn_disk_add`] runs; the
    /// device stays `Unavailable` until then.
    pub fn new(config: DeviceConfig, registry: Arc<DiskRegistry>, first_minor: u32) -> Device {
        let disk_name = format!("ubd-{}", config.id);
        let devnum = DevNum {
            major: registry.major(),
            minor: first_minor,
        };

        Device {
            inverter: Arc::new(Inverter::new(&config)),
            config,
            state: AtomicU32::new(DeviceState::Unavailable as u32),
            registry,
            disk_name,
            devnum,
            added: Completion::new(),
            adder: Mutex::new(None),
        }
    }

    /// Starts the asynchronous disk-adder.
    ///
    /// The adder publishes the node, arms the device-available notification,
    /// and moves `UNAVAILABLE -> ACTIVE` unless the device terminated first.
    pub fn spawn_disk_add(self: &Arc<Self>) {
        let device = Arc::clone(self);
        let join = std::thread::spawn(move || {
            device
                .registry
                .insert_block(&device.disk_name, device.devnum);

            device.inverter.submit_device_available();

            let _ = device.state.compare_exchange(
                DeviceState::Unavailable as u32,
                DeviceState::Active as u32,
                Ordering::AcqRel,
                Ordering::Acquire,
            );

            device.added.complete_all();
            debug!("disk {} added", device.disk_name);
        });

        *self.adder.lock() = Some(join);
    }

    /// Blocks until the disk-adder has finished (in either outcome).
    pub fn wait_until_added(&self) {
        self.added.wait();
    }

    /// The device's adjusted configuration.
    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> DeviceState {
        DeviceState::from_u32(self.state.load(Ordering::Acquire))
    }

    /// Whether the device is exposed read-only.
    pub fn is_read_only(&self) -> bool {
        self.config.is_read_only()
    }

    /// The device's inverter (owned by the device for its whole life).
    pub fn inverter(&self) -> &Arc<Inverter> {
        &self.inverter
    }

    /// The published node name, `ubd-<id>`.
    pub fn disk_name(&self) -> &str {
        &self.disk_name
    }

    /// The device number of the whole-device node.
    pub fn devnum(&self) -> DevNum {
        self.devnum
    }

    /// Queue-limit admission for a request.
    ///
    /// Range requests must be logical-block aligned, inside the device, and
    /// within the per-family size limit; ioctl command words must be
    /// structurally valid with a matching argument buffer. A zero family
    /// limit means the family is unsupported, which the inverter reports as
    /// such.
    fn admit(&self, req: &BlockRequest) -> UbdResult<()> {
        let config = &self.config;

        let family_max = match req.op() {
            ReqOp::Flush => return Ok(()),
            ReqOp::Ioctl { command } => {
                if !ioc::is_valid(command) {
                    return Err(UbdError::NotTty);
                }
                let arg_len = req.data().map(|data| data.len()).unwrap_or(0);
                if arg_len != ioc::size(command) as usize {
                    return Err(UbdError::InvalidArgument);
                }
                return Ok(());
            }
            ReqOp::Read | ReqOp::Write { .. } => config.max_read_write_size,
            ReqOp::WriteSame => config.max_write_same_size,
            ReqOp::WriteZeros { .. } => config.max_write_zeros_size,
            ReqOp::Discard | ReqOp::SecureErase => config.max_discard_erase_size,
        };

        let logical = config.logical_block_size as u64;
        let offset = req.offset();
        let len = req.len() as u64;

        if len == 0 || offset % logical != 0 || len % logical != 0 {
            return Err(UbdError::InvalidArgument);
        }
        if offset.checked_add(len).map_or(true, |end| end > config.size) {
            return Err(UbdError::InvalidArgument);
        }
        if family_max != 0 && len > family_max as u64 {
            return Err(UbdError::InvalidArgument);
        }

        if req.op() == ReqOp::WriteSame {
            let block_len = req.data().map(|data| data.len()).unwrap_or(0);
            if block_len != config.logical_block_size as usize {
                return Err(UbdError::InvalidArgument);
            }
        }

        Ok(())
    }

    /// Submits a block request against the device. Never blocks.
    ///
    /// The producer observes the outcome through the request's handle; the
    /// returned error mirrors immediate failures (admission, unsupported
    /// type, terminated device).
    pub fn submit(&self, req: BlockRequest) -> UbdResult<()> {
        if let Err(error) = self.admit(&req) {
            req.finish(error.errno(), error.errno(), None);
            return Err(error);
        }
        self.inverter.submit(req)
    }

    /// Delegates a block-layer timeout to the inverter.
    pub fn timeout_request(&self, handle: &RequestHandle) -> TimeoutDecision {
        self.inverter.timeout_request(handle)
    }

    /// Terminates the device. Idempotent; pending requests fail with EIO.
    pub fn terminate(&self) {
        self.state
            .store(DeviceState::Terminated as u32, Ordering::Release);
        self.inverter.terminate();
    }

    /// Moves `ACTIVE -> INACTIVE`, optionally arming flush-and-terminate.
    ///
    /// A no-op on an already inactive device.
    pub fn deactivate(&self, flush: bool) {
        let old = self
            .state
            .swap(DeviceState::Inactive as u32, Ordering::AcqRel);
        debug_assert!(matches!(
            DeviceState::from_u32(old),
            DeviceState::Active | DeviceState::Inactive
        ));

        self.inverter.deactivate(flush);
    }

    /// Moves `INACTIVE -> ACTIVE` for a newly attached consumer.
    ///
    /// In-flight requests return to the ready queue and the availability
    /// notification is re-armed.
    pub fn activate(&self) {
        let old = self
            .state
            .swap(DeviceState::Active as u32, Ordering::AcqRel);
        debug_assert_eq!(DeviceState::from_u32(old), DeviceState::Inactive);

        self.inverter.activate();
        self.inverter.submit_device_available();
    }

    /// Tears the device down: fails everything pending, joins the adder,
    /// unpublishes the node.
    pub fn shutdown(&self) {
        self.inverter.terminate();

        if let Some(join) = self.adder.lock().take() {
            let _ = join.join();
        }

        self.registry.remove(&self.disk_name);
        self.inverter.debug_check_quiesced();
        debug!("disk {} removed", self.disk_name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use ubd_common::cell::ItemType;
    use ubd_common::errno;

    fn base_config() -> DeviceConfig {
        let mut config = DeviceConfig::new(1 << 30, 512);
        config.supports_read = 1;
        config.supports_write = 1;
        config.max_outstanding_reqs = 8;
        config
    }

    fn adjusted(mut config: DeviceConfig) -> DeviceConfig {
        validate_and_adjust_config(&mut config).unwrap();
        config
    }

    fn make_device(config: DeviceConfig) -> Arc<Device> {
        Arc::new(Device::new(
            adjusted(config),
            Arc::new(DiskRegistry::new()),
            0,
        ))
    }

    #[test]
    fn rejects_bad_logical_block_size() {
        for logical in [0u32, 256, 768, 8192] {
            let mut config = base_config();
            config.logical_block_size = logical;
            assert_eq!(
                validate_and_adjust_config(&mut config),
                Err(UbdError::InvalidArgument),
                "logical_block_size {}",
                logical
            );
        }
    }

    #[test]
    fn rejects_fua_without_flush() {
        let mut config = base_config();
        config.supports_fua_write = 1;
        assert_eq!(
            validate_and_adjust_config(&mut config),
            Err(UbdError::InvalidArgument)
        );

        config.supports_flush = 1;
        assert!(validate_and_adjust_config(&mut config).is_ok());
    }

    #[test]
    fn rejects_unaligned_size() {
        let mut config = base_config();
        config.size = 1000;
        assert_eq!(
            validate_and_adjust_config(&mut config),
            Err(UbdError::InvalidArgument)
        );
    }

    #[test]
    fn rejects_nonzero_reserved_bytes() {
        let mut config = base_config();
        config.reserved[3] = 1;
        assert_eq!(
            validate_and_adjust_config(&mut config),
            Err(UbdError::InvalidArgument)
        );
    }

    #[test]
    fn adjusts_physical_block_size_and_rw_default() {
        let config = adjusted(base_config());
        assert_eq!(config.physical_block_size, 512);
        assert_eq!(config.max_read_write_size, DEFAULT_MAX_READ_WRITE_SIZE);
    }

    #[test]
    fn zeroes_limits_for_unsupported_families() {
        let mut config = base_config();
        config.max_write_same_size = 4096;
        config.max_discard_erase_size = 4096;
        let config = adjusted(config);

        assert_eq!(config.max_write_same_size, 0);
        assert_eq!(config.max_write_zeros_size, 0);
        assert_eq!(config.max_discard_erase_size, 0);
    }

    #[test]
    fn caps_and_rounds_limits() {
        let mut config = base_config();
        config.logical_block_size = 4096;
        config.size = 1 << 30;
        config.max_read_write_size = HARD_MAX_READ_WRITE_SIZE + 4096;
        config.supports_discard = 1;
        config.max_discard_erase_size = 10000;
        config.max_outstanding_reqs = 100_000;
        let config = adjusted(config);

        assert_eq!(config.max_read_write_size, HARD_MAX_READ_WRITE_SIZE);
        assert_eq!(config.max_discard_erase_size, 8192);
        assert_eq!(config.max_outstanding_reqs, HARD_MAX_OUTSTANDING_REQS);
    }

    #[test]
    fn inert_device_gets_one_slot() {
        let mut config = DeviceConfig::new(1 << 20, 512);
        config.max_outstanding_reqs = 64;
        let config = adjusted(config);
        assert_eq!(config.max_outstanding_reqs, 1);
        assert_eq!(config.max_read_write_size, 0);
    }

    #[test]
    fn disk_add_publishes_node_and_activates() {
        let registry = Arc::new(DiskRegistry::new());
        let mut config = adjusted(base_config());
        config.id = 7;
        let device = Arc::new(Device::new(config, Arc::clone(&registry), 512));

        assert_eq!(device.state(), DeviceState::Unavailable);
        device.spawn_disk_add();
        device.wait_until_added();

        assert_eq!(device.state(), DeviceState::Active);
        let (devnum, is_block) = registry.resolve("/dev/ubd-7").unwrap();
        assert!(is_block);
        assert_eq!(devnum, DevNum { major: registry.major(), minor: 512 });

        assert_eq!(
            device.inverter().begin_item_get().item_type,
            ItemType::DeviceAvailable
        );

        device.shutdown();
        assert_eq!(registry.resolve("ubd-7"), None);
    }

    #[test]
    fn terminate_wins_race_with_disk_add() {
        let device = make_device(base_config());
        device.terminate();
        device.spawn_disk_add();
        device.wait_until_added();

        assert_eq!(device.state(), DeviceState::Terminated);
        device.shutdown();
    }

    #[test]
    fn admission_rejects_misaligned_and_oversized_requests() {
        let device = make_device(base_config());

        let misaligned = BlockRequest::read(100, 512);
        assert_eq!(device.submit(misaligned), Err(UbdError::InvalidArgument));

        let past_end = BlockRequest::read(1 << 30, 512);
        assert_eq!(device.submit(past_end), Err(UbdError::InvalidArgument));

        let oversized = BlockRequest::read(0, 2 * HARD_MAX_READ_WRITE_SIZE);
        assert_eq!(device.submit(oversized), Err(UbdError::InvalidArgument));

        let handle_probe = BlockRequest::read(100, 512);
        let handle = handle_probe.handle();
        let _ = device.submit(handle_probe);
        assert_eq!(handle.wait().error, errno::EINVAL);

        device.terminate();
        device.shutdown();
    }

    #[test]
    fn admission_rejects_bad_ioctl_commands() {
        let mut config = base_config();
        config.supports_ioctl = 1;
        let device = make_device(config);

        // Direction NONE with a declared size is structurally invalid.
        let bad = BlockRequest::ioctl(ioc::ioc(ioc::DIR_NONE, b'x', 0, 0) | (64 << 16), Bytes::new());
        assert_eq!(device.submit(bad), Err(UbdError::NotTty));

        // Argument buffer must match the declared size.
        let mismatched = BlockRequest::ioctl(ioc::ioc(ioc::DIR_WRITE, b'x', 1, 64), Bytes::new());
        assert_eq!(device.submit(mismatched), Err(UbdError::InvalidArgument));

        device.terminate();
        device.shutdown();
    }

    #[test]
    fn unsupported_write_is_reported_as_such() {
        let mut config = DeviceConfig::new(1 << 20, 512);
        config.supports_read = 1;
        config.max_outstanding_reqs = 4;
        let device = make_device(config);

        let write = BlockRequest::write(0, Bytes::from(vec![0u8; 512]));
        let handle = write.handle();
        assert_eq!(device.submit(write), Err(UbdError::Unsupported));
        assert_eq!(handle.wait().error, errno::EOPNOTSUPP);

        device.terminate();
        device.shutdown();
    }

    #[test]
    fn deactivate_activate_roundtrip() {
        let device = make_device(base_config());
        device.spawn_disk_add();
        device.wait_until_added();

        device.deactivate(false);
        assert_eq!(device.state(), DeviceState::Inactive);

        device.activate();
        assert_eq!(device.state(), DeviceState::Active);

        device.terminate();
        assert_eq!(device.state(), DeviceState::Terminated);
        device.shutdown();
    }
}
