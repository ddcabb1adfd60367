//! # Control Coordinator
//!
//! Purpose: The process-wide serialisation point for device creation, session
//! attachment, driver handover, and destruction.
//!
//! ## Design Principles
//!
//! 1. **One Table, One Mutex**: Every lifecycle decision happens under the
//!    device table mutex; the per-request hot path never touches it.
//! 2. **Split Destroy Ledger**: The `(next_id, live ids)` pair lives under
//!    its own lock with a condvar, so `wait_until_destroyed` can decide
//!    "never existed" versus "already gone" without the table mutex.
//! 3. **RAII Release**: Dropping a `ClientSession` is the detach path; the
//!    release table below decides whether the device survives it.
//! 4. **Ids Forever, Indices Recycled**: Ids increase strictly and are never
//!    reused; compact indices (one 256-minor window each) are allocated
//!    cyclically and recycled after destruction.
//!
//! ## Release semantics
//!
//! When an attached session closes, the action depends on device state, the
//! `recoverable` flag, and whether the session was marked successful:
//!
//! ```text
//! state        recoverable  successful  action
//! UNAVAILABLE  any          any         destroy
//! ACTIVE       no           no          terminate; wake waiter, else destroy
//! ACTIVE       yes          any         deactivate; wake waiter if any
//! ACTIVE       no           yes         deactivate; wake waiter if any
//! INACTIVE     no           no          terminate; wake waiter, else destroy
//! INACTIVE     otherwise                wake waiter if any
//! TERMINATED   any          any         wake waiter, else destroy
//! ```

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use ahash::RandomState;
use hashbrown::{HashMap, HashSet};
use log::{debug, info};
use parking_lot::{Condvar, Mutex};

use ubd_common::cell::{Item, Reply};
use ubd_common::config::{
    DeviceAndFdConfig, DeviceConfig, Version, HARD_MAX_DEVICES, MINORS_PER_DEVICE,
};
use ubd_common::errno;
use ubd_common::{UbdError, UbdResult};

use crate::completion::Completion;
use crate::device::{self, Device, DeviceState};
use crate::disk::DiskRegistry;
use crate::request::BlockRequest;
use crate::transceiver::{self, Transceiver};

/// Process-wide engine configuration.
#[derive(Debug, Clone, Copy)]
pub struct CoreConfig {
    /// Maximum number of simultaneously existing devices.
    pub max_devices: u32,
}

impl Default for CoreConfig {
    fn default() -> Self {
        CoreConfig {
            max_devices: HARD_MAX_DEVICES,
        }
    }
}

#[derive(Debug)]
struct DeviceEntry {
    device: Arc<Device>,
    /// Session currently attached, if any.
    client_session: Option<u64>,
    /// Completion a prospective attacher is blocked on, if any.
    on_detach: Option<Arc<Completion>>,
}

#[derive(Debug)]
struct CoreTable {
    /// Device entries by compact index.
    entries: HashMap<u32, DeviceEntry, RandomState>,
    /// Cyclic allocation cursor over the index space.
    next_index: u32,
}

#[derive(Debug)]
struct DestroyLedger {
    /// Id for the next device; ids below this were issued at some point.
    next_id: u64,
    /// Ids of devices still in the table.
    live: HashSet<u64, RandomState>,
}

struct Attachment {
    index: u32,
    id: u64,
    device: Arc<Device>,
    transceiver: Arc<Transceiver>,
}

/// The process-wide coordinator.
#[derive(Debug)]
pub struct Core {
    config: CoreConfig,
    registry: Arc<DiskRegistry>,

    table: Mutex<CoreTable>,
    ledger: Mutex<DestroyLedger>,
    /// Notified every time a device leaves the table.
    destroyed: Condvar,

    next_session: AtomicU64,
}

fn errno_to_error(value: i32) -> UbdError {
    match value {
        errno::ETIMEDOUT => UbdError::TimedOut,
        errno::ENOSPC => UbdError::NoSpace,
        errno::ENODEV => UbdError::NoDevice,
        _ => UbdError::Io,
    }
}

impl Core {
    /// Creates a coordinator. `max_devices` must be in `[1, HARD_MAX_DEVICES]`.
    pub fn new(config: CoreConfig) -> UbdResult<Core> {
        if config.max_devices == 0 || config.max_devices > HARD_MAX_DEVICES {
            return Err(UbdError::InvalidArgument);
        }

        Ok(Core {
            config,
            registry: Arc::new(DiskRegistry::new()),
            table: Mutex::new(CoreTable {
                entries: HashMap::with_hasher(RandomState::new()),
                next_index: 0,
            }),
            ledger: Mutex::new(DestroyLedger {
                next_id: 0,
                live: HashSet::with_hasher(RandomState::new()),
            }),
            destroyed: Condvar::new(),
            next_session: AtomicU64::new(0),
        })
    }

    /// The engine's ABI version.
    pub fn version(&self) -> Version {
        Version::CURRENT
    }

    /// The node registry devices publish into.
    pub fn registry(&self) -> &Arc<DiskRegistry> {
        &self.registry
    }

    /// Opens a control session.
    pub fn open(self: &Arc<Self>) -> ClientSession {
        ClientSession {
            core: Arc::clone(self),
            session_id: self.next_session.fetch_add(1, Ordering::Relaxed),
            successful: AtomicBool::new(false),
            attachment: Mutex::new(None),
        }
    }

    /// Number of devices currently in the table.
    pub fn device_count(&self) -> u32 {
        self.table.lock().entries.len() as u32
    }

    /// The device with the given id, for block-level producers.
    pub fn device(&self, id: u64) -> UbdResult<Arc<Device>> {
        let table = self.table.lock();
        let index = self.find_index_by_id(&table, id)?;
        Ok(Arc::clone(&table.entries[&index].device))
    }

    /// The live (adjusted) configuration of the device with the given id.
    pub fn get_device_config(&self, id: u64) -> UbdResult<DeviceConfig> {
        let table = self.table.lock();
        let index = self.find_index_by_id(&table, id)?;
        Ok(*table.entries[&index].device.config())
    }

    /// Resolves a block special node path to a device id.
    pub fn path_to_id(&self, path: &str) -> UbdResult<u64> {
        let table = self.table.lock();

        let (devnum, is_block) = self.registry.resolve(path).ok_or(UbdError::NotFound)?;
        if !is_block {
            return Err(UbdError::NotBlockDevice);
        }
        if devnum.major != self.registry.major() {
            return Err(UbdError::InvalidArgument);
        }

        let index = devnum.minor / MINORS_PER_DEVICE;
        let entry = table.entries.get(&index).ok_or(UbdError::NoDevice)?;

        // Read the id before releasing the table; the device may be
        // destroyed afterwards.
        let id = entry.device.config().id;
        drop(table);

        if devnum.minor % MINORS_PER_DEVICE != 0 {
            return Err(UbdError::PartitionMinor);
        }

        Ok(id)
    }

    /// Synchronously flushes the device with the given id.
    ///
    /// A no-op for read-only devices; a device without flush support is
    /// treated as flushed.
    pub fn flush_device(&self, id: u64) -> UbdResult<()> {
        let device = {
            let table = self.table.lock();
            let index = self.find_index_by_id(&table, id)?;
            Arc::clone(&table.entries[&index].device)
        };

        if device.is_read_only() {
            return Ok(());
        }

        let request = BlockRequest::flush();
        let handle = request.handle();
        match device.submit(request) {
            Ok(()) => {}
            Err(UbdError::Unsupported) => return Ok(()),
            Err(error) => return Err(error),
        }

        match handle.wait().error {
            0 => Ok(()),
            value => Err(errno_to_error(value)),
        }
    }

    /// Triggers destruction of the device with the given id.
    ///
    /// With a session attached the device is terminated and destruction
    /// happens at release; clientless devices are destroyed immediately. A
    /// no-op when the id is already gone.
    pub fn trigger_destruction(&self, id: u64) -> UbdResult<()> {
        let mut table = self.table.lock();

        let index = match self.find_index_by_id(&table, id) {
            Ok(index) => index,
            Err(UbdError::NoDevice) => return Ok(()),
            Err(error) => return Err(error),
        };

        if table.entries[&index].client_session.is_some() {
            table.entries[&index].device.terminate();
        } else {
            self.destroy_entry_locked(&mut table, index);
        }

        Ok(())
    }

    /// Blocks until the device with the given id has been destroyed.
    ///
    /// Returns immediately when the id is already gone; an id that was never
    /// issued is an error.
    pub fn wait_until_destroyed(&self, id: u64) -> UbdResult<()> {
        let mut ledger = self.ledger.lock();
        if id >= ledger.next_id {
            return Err(UbdError::InvalidArgument);
        }
        while ledger.live.contains(&id) {
            self.destroyed.wait(&mut ledger);
        }
        Ok(())
    }

    /// Like `wait_until_destroyed`, but gives up after `timeout`.
    pub fn wait_until_destroyed_timeout(&self, id: u64, timeout: Duration) -> UbdResult<()> {
        let deadline = Instant::now() + timeout;
        let mut ledger = self.ledger.lock();
        if id >= ledger.next_id {
            return Err(UbdError::InvalidArgument);
        }
        while ledger.live.contains(&id) {
            if self.destroyed.wait_until(&mut ledger, deadline).timed_out() {
                return Err(UbdError::Interrupted);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    /// Index of the live device with the given id.
    ///
    /// Ids at or above the ledger's `next_id` were never issued.
    fn find_index_by_id(&self, table: &CoreTable, id: u64) -> UbdResult<u32> {
        for (&index, entry) in table.entries.iter() {
            if entry.device.config().id == id {
                return Ok(index);
            }
        }

        if id >= self.ledger.lock().next_id {
            Err(UbdError::InvalidArgument)
        } else {
            Err(UbdError::NoDevice)
        }
    }

    fn alloc_index(table: &mut CoreTable) -> Option<u32> {
        for step in 0..HARD_MAX_DEVICES {
            let index = (table.next_index + step) % HARD_MAX_DEVICES;
            if !table.entries.contains_key(&index) {
                table.next_index = (index + 1) % HARD_MAX_DEVICES;
                return Some(index);
            }
        }
        None
    }

    /// Removes an entry, notifies destroy waiters, and tears the device down.
    fn destroy_entry_locked(&self, table: &mut CoreTable, index: u32) {
        let entry = table.entries.remove(&index).expect("entry exists");
        let id = entry.device.config().id;

        {
            let mut ledger = self.ledger.lock();
            ledger.live.remove(&id);
            self.destroyed.notify_all();
        }

        // A handover blocked on this device must not sleep forever.
        if let Some(waiter) = entry.on_detach {
            waiter.complete_all();
        }

        entry.device.shutdown();
        info!("destroyed device {}", id);
    }

    fn create_device_impl(
        &self,
        session_id: u64,
        config: &mut DeviceAndFdConfig,
    ) -> UbdResult<Attachment> {
        device::validate_and_adjust_config(&mut config.device)?;
        transceiver::validate_and_adjust_fd_config(config)?;

        let mut table = self.table.lock();

        if table.entries.len() as u32 >= self.config.max_devices {
            return Err(UbdError::NoSpace);
        }
        let index = Self::alloc_index(&mut table).ok_or(UbdError::NoSpace)?;

        config.device.id = self.ledger.lock().next_id;

        let device = Arc::new(Device::new(
            config.device,
            Arc::clone(&self.registry),
            index * MINORS_PER_DEVICE,
        ));
        let transceiver = Arc::new(Transceiver::new(config, Arc::clone(device.inverter())));

        {
            let mut ledger = self.ledger.lock();
            debug_assert_eq!(ledger.next_id, config.device.id);
            ledger.next_id += 1;
            ledger.live.insert(config.device.id);
        }

        table.entries.insert(
            index,
            DeviceEntry {
                device: Arc::clone(&device),
                client_session: Some(session_id),
                on_detach: None,
            },
        );
        drop(table);

        device.spawn_disk_add();
        info!("created device {} at index {}", config.device.id, index);

        Ok(Attachment {
            index,
            id: config.device.id,
            device,
            transceiver,
        })
    }

    fn attach_impl(
        &self,
        session_id: u64,
        config: &mut DeviceAndFdConfig,
        timeout: Option<Duration>,
    ) -> UbdResult<Attachment> {
        let id = config.device.id;
        let mut table = self.table.lock();

        let index = self.find_index_by_id(&table, id)?;
        let device = Arc::clone(&table.entries[&index].device);

        config.device = *device.config();
        transceiver::validate_and_adjust_fd_config(config)?;

        if device.state() == DeviceState::Unavailable {
            return Err(UbdError::Busy);
        }

        let entry = table.entries.get_mut(&index).expect("entry exists");
        if entry.on_detach.is_some() {
            return Err(UbdError::InProgress);
        }

        if entry.client_session.is_some() {
            // Hand the device over: push the incumbent out (flushing if the
            // device can) and wait for it to detach.
            if device.state() != DeviceState::Terminated {
                device.deactivate(true);
            }

            let waiter = Arc::new(Completion::new());
            entry.on_detach = Some(Arc::clone(&waiter));
            drop(table);

            debug!("handover: waiting for detach from device {}", id);
            let completed = match timeout {
                None => {
                    waiter.wait();
                    true
                }
                Some(timeout) => waiter.wait_timeout(timeout),
            };

            table = self.table.lock();
            let entry = match table.entries.get_mut(&index) {
                Some(entry) if entry.device.config().id == id => entry,
                // Destroyed while we slept (trigger on a clientless device).
                _ => return Err(UbdError::NoDevice),
            };
            entry.on_detach = None;

            if !completed && entry.client_session.is_some() {
                // Interrupted; the incumbent is still attached.
                return Err(UbdError::Interrupted);
            }
            debug_assert!(entry.client_session.is_none());

            if device.state() == DeviceState::Terminated {
                self.destroy_entry_locked(&mut table, index);
                return Err(UbdError::NoDevice);
            }
        }

        debug_assert_eq!(device.state(), DeviceState::Inactive);

        let transceiver = Arc::new(Transceiver::new(config, Arc::clone(device.inverter())));
        device.activate();

        let entry = table.entries.get_mut(&index).expect("entry exists");
        entry.client_session = Some(session_id);
        info!("session attached to device {}", id);

        Ok(Attachment {
            index,
            id,
            device,
            transceiver,
        })
    }

    fn terminate_impl(&self, attachment: &Attachment) {
        let _table = self.table.lock();
        let device = &attachment.device;
        let recoverable = device.config().recoverable != 0;

        match device.state() {
            DeviceState::Unavailable => device.terminate(),
            DeviceState::Active => {
                if recoverable {
                    device.deactivate(false);
                } else {
                    device.terminate();
                }
            }
            DeviceState::Inactive => {
                if !recoverable {
                    device.terminate();
                }
            }
            DeviceState::Terminated => {}
        }
    }

    fn release(&self, session: &ClientSession) {
        let attachment = session.attachment.lock().take();
        let attachment = match attachment {
            Some(attachment) => attachment,
            None => return,
        };

        let successful = session.successful.load(Ordering::Acquire);
        let recoverable = attachment.device.config().recoverable != 0;
        let doomed = !recoverable && !successful;

        let mut table = self.table.lock();
        let entry = match table.entries.get_mut(&attachment.index) {
            Some(entry) => entry,
            None => {
                debug_assert!(false, "released session had no device entry");
                return;
            }
        };
        debug_assert_eq!(entry.client_session, Some(session.session_id));
        entry.client_session = None;
        let waiter = entry.on_detach.clone();

        match attachment.device.state() {
            DeviceState::Unavailable => {
                debug_assert!(waiter.is_none());
                self.destroy_entry_locked(&mut table, attachment.index);
            }
            DeviceState::Active => {
                if doomed {
                    attachment.device.terminate();
                } else {
                    attachment.device.deactivate(false);
                }
                match waiter {
                    Some(waiter) => waiter.complete_one(),
                    None if doomed => self.destroy_entry_locked(&mut table, attachment.index),
                    None => {}
                }
            }
            DeviceState::Inactive => {
                if doomed {
                    attachment.device.terminate();
                }
                match waiter {
                    Some(waiter) => waiter.complete_one(),
                    None if doomed => self.destroy_entry_locked(&mut table, attachment.index),
                    None => {}
                }
            }
            DeviceState::Terminated => match waiter {
                Some(waiter) => waiter.complete_one(),
                None => self.destroy_entry_locked(&mut table, attachment.index),
            },
        }

        debug!("session {} detached from device {}", session.session_id, attachment.id);
    }
}

impl Drop for Core {
    fn drop(&mut self) {
        // Sessions hold the coordinator alive, so nothing is attached by the
        // time this runs; surviving (recoverable) devices are torn down.
        let entries: Vec<DeviceEntry> = self.table.get_mut().entries.drain().map(|(_, e)| e).collect();
        for entry in entries {
            debug_assert!(entry.client_session.is_none());
            entry.device.shutdown();
        }
    }
}

// ----------------------------------------------------------------------
// Client sessions
// ----------------------------------------------------------------------

/// One control session (the analogue of an open control-file description).
///
/// Dropping the session is the detach path; see the release table above.
pub struct ClientSession {
    core: Arc<Core>,
    session_id: u64,
    successful: AtomicBool,
    attachment: Mutex<Option<Attachment>>,
}

impl ClientSession {
    /// Creates a device from `config` and attaches this session to it.
    ///
    /// On success the configuration holds the adjusted values, id included.
    pub fn create_device(&self, config: &mut DeviceAndFdConfig) -> UbdResult<()> {
        let mut attachment = self.attachment.lock();
        if attachment.is_some() {
            return Err(UbdError::AlreadyAttached);
        }

        *attachment = Some(self.core.create_device_impl(self.session_id, config)?);
        Ok(())
    }

    /// Attaches this session to the device named by `config.device.id`.
    ///
    /// On success `config.device` holds the live device's configuration.
    pub fn attach(&self, config: &mut DeviceAndFdConfig) -> UbdResult<()> {
        self.attach_inner(config, None)
    }

    /// Like `attach`, but gives up on the handover wait after `timeout`.
    pub fn attach_timeout(
        &self,
        config: &mut DeviceAndFdConfig,
        timeout: Duration,
    ) -> UbdResult<()> {
        self.attach_inner(config, Some(timeout))
    }

    fn attach_inner(
        &self,
        config: &mut DeviceAndFdConfig,
        timeout: Option<Duration>,
    ) -> UbdResult<()> {
        let mut attachment = self.attachment.lock();
        if attachment.is_some() {
            return Err(UbdError::AlreadyAttached);
        }

        *attachment = Some(self.core.attach_impl(self.session_id, config, timeout)?);
        Ok(())
    }

    /// Terminates this session's device per its state and recoverability.
    pub fn terminate(&self) -> UbdResult<()> {
        let attachment = self.attachment.lock();
        let attachment = attachment.as_ref().ok_or(UbdError::NotAttached)?;
        self.core.terminate_impl(attachment);
        Ok(())
    }

    /// Latches the success flag consulted at release time.
    pub fn mark_successful(&self) {
        self.successful.store(true, Ordering::Release);
    }

    /// The coordinator this session belongs to.
    pub fn core(&self) -> &Arc<Core> {
        &self.core
    }

    /// Whether the session is attached to a device.
    pub fn is_attached(&self) -> bool {
        self.attachment.lock().is_some()
    }

    /// Id of the attached device.
    pub fn attached_device_id(&self) -> UbdResult<u64> {
        let attachment = self.attachment.lock();
        attachment
            .as_ref()
            .map(|attachment| attachment.id)
            .ok_or(UbdError::NotAttached)
    }

    fn transceiver(&self) -> UbdResult<Arc<Transceiver>> {
        let attachment = self.attachment.lock();
        attachment
            .as_ref()
            .map(|attachment| Arc::clone(&attachment.transceiver))
            .ok_or(UbdError::NotAttached)
    }

    /// Blocks for the next item and writes it into the addressed cell.
    pub fn receive_item(&self, cell_index: u64, buffer_index: u64) -> UbdResult<()> {
        self.transceiver()?.receive_item(cell_index, buffer_index)
    }

    /// Like `receive_item`, but gives up after `timeout`.
    pub fn receive_item_timeout(
        &self,
        cell_index: u64,
        buffer_index: u64,
        timeout: Duration,
    ) -> UbdResult<()> {
        self.transceiver()?
            .receive_item_timeout(cell_index, buffer_index, timeout)
    }

    /// Consumes the reply staged in the addressed cell.
    pub fn send_reply(&self, cell_index: u64) -> UbdResult<()> {
        self.transceiver()?.send_reply(cell_index)
    }

    /// Fused step: send the staged reply, then receive the next item.
    pub fn send_reply_and_receive_item(&self, cell_index: u64, buffer_index: u64) -> UbdResult<()> {
        self.transceiver()?
            .send_reply_and_receive_item(cell_index, buffer_index)
    }

    /// Reads the item last delivered into a cell.
    pub fn read_item(&self, cell_index: u64) -> UbdResult<Item> {
        self.transceiver()?.read_item(cell_index)
    }

    /// Stages a reply into a cell.
    pub fn write_reply(&self, cell_index: u64, reply: Reply) -> UbdResult<()> {
        self.transceiver()?.write_reply(cell_index, reply)
    }

    /// Copies session data into a payload buffer.
    pub fn write_buffer(&self, buffer_index: u64, offset: usize, data: &[u8]) -> UbdResult<()> {
        self.transceiver()?.write_buffer(buffer_index, offset, data)
    }

    /// Copies payload-buffer contents out for the session.
    pub fn read_buffer(&self, buffer_index: u64, offset: usize, len: usize) -> UbdResult<Vec<u8>> {
        self.transceiver()?.read_buffer(buffer_index, offset, len)
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.core.release(self);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk::DevNum;

    fn writable_config() -> DeviceAndFdConfig {
        let mut config = DeviceAndFdConfig::default();
        config.device.size = 1 << 20;
        config.device.logical_block_size = 512;
        config.device.supports_read = 1;
        config.device.supports_write = 1;
        config.device.max_outstanding_reqs = 4;
        config
    }

    fn new_core() -> Arc<Core> {
        Arc::new(Core::new(CoreConfig::default()).unwrap())
    }

    #[test]
    fn create_assigns_increasing_ids() {
        let core = new_core();
        let first = core.open();
        let second = core.open();

        let mut config_a = writable_config();
        first.create_device(&mut config_a).unwrap();
        let mut config_b = writable_config();
        second.create_device(&mut config_b).unwrap();

        assert_eq!(config_a.device.id, 0);
        assert_eq!(config_b.device.id, 1);
        assert_eq!(core.device_count(), 2);

        // Echoed configurations are the adjusted ones, and stay stable.
        assert!(config_a.device.max_read_write_size > 0);
        assert_eq!(
            core.get_device_config(0).unwrap(),
            config_a.device
        );
        assert_eq!(
            core.get_device_config(0).unwrap(),
            config_a.device
        );
    }

    #[test]
    fn create_respects_device_limit() {
        let core = Arc::new(Core::new(CoreConfig { max_devices: 1 }).unwrap());
        let first = core.open();
        first.create_device(&mut writable_config()).unwrap();

        let second = core.open();
        assert_eq!(
            second.create_device(&mut writable_config()),
            Err(UbdError::NoSpace)
        );
    }

    #[test]
    fn create_twice_on_one_session_is_rejected() {
        let core = new_core();
        let session = core.open();
        session.create_device(&mut writable_config()).unwrap();
        assert_eq!(
            session.create_device(&mut writable_config()),
            Err(UbdError::AlreadyAttached)
        );
    }

    #[test]
    fn invalid_config_is_rejected_before_allocation() {
        let core = new_core();
        let session = core.open();

        let mut config = writable_config();
        config.device.logical_block_size = 100;
        assert_eq!(
            session.create_device(&mut config),
            Err(UbdError::InvalidArgument)
        );
        assert_eq!(core.device_count(), 0);
    }

    #[test]
    fn attach_to_unknown_ids() {
        let core = new_core();
        let session = core.open();

        let mut config = DeviceAndFdConfig::default();
        config.device.id = 99;
        // Never issued.
        assert_eq!(session.attach(&mut config), Err(UbdError::InvalidArgument));

        // Issued, then destroyed.
        let owner = core.open();
        let mut owned = writable_config();
        owner.create_device(&mut owned).unwrap();
        let id = owned.device.id;
        drop(owner);
        core.wait_until_destroyed(id).unwrap();

        config.device.id = id;
        assert_eq!(session.attach(&mut config), Err(UbdError::NoDevice));
    }

    #[test]
    fn attach_to_unavailable_device_is_busy() {
        let core = new_core();

        // Hand-build an entry whose disk-adder never ran.
        let mut device_config = writable_config().device;
        device::validate_and_adjust_config(&mut device_config).unwrap();
        device_config.id = 0;
        let device = Arc::new(Device::new(device_config, Arc::clone(core.registry()), 0));
        {
            let mut table = core.table.lock();
            table.entries.insert(
                0,
                DeviceEntry {
                    device: Arc::clone(&device),
                    client_session: None,
                    on_detach: None,
                },
            );
            core.ledger.lock().next_id = 1;
            core.ledger.lock().live.insert(0);
        }

        let session = core.open();
        let mut config = DeviceAndFdConfig::default();
        config.device.id = 0;
        assert_eq!(session.attach(&mut config), Err(UbdError::Busy));

        let mut table = core.table.lock();
        core.destroy_entry_locked(&mut table, 0);
    }

    #[test]
    fn path_resolution_arms() {
        let core = new_core();
        let session = core.open();
        let mut config = writable_config();
        session.create_device(&mut config).unwrap();
        let id = config.device.id;
        core.device(id).unwrap().wait_until_added();

        assert_eq!(core.path_to_id("/dev/ubd-0"), Ok(id));
        assert_eq!(core.path_to_id("ubd-0"), Ok(id));

        assert_eq!(core.path_to_id("/dev/nope"), Err(UbdError::NotFound));

        core.registry().insert_char("notblock", DevNum { major: 1, minor: 3 });
        assert_eq!(
            core.path_to_id("/dev/notblock"),
            Err(UbdError::NotBlockDevice)
        );

        core.registry()
            .insert_block("foreign", DevNum { major: 8, minor: 0 });
        assert_eq!(core.path_to_id("foreign"), Err(UbdError::InvalidArgument));

        // A partition minor inside this device's window.
        core.registry().insert_block(
            "ubd-0p1",
            DevNum {
                major: core.registry().major(),
                minor: 1,
            },
        );
        assert_eq!(core.path_to_id("ubd-0p1"), Err(UbdError::PartitionMinor));

        // A whole-device minor in a window no device occupies.
        core.registry().insert_block(
            "stale",
            DevNum {
                major: core.registry().major(),
                minor: 5 * MINORS_PER_DEVICE,
            },
        );
        assert_eq!(core.path_to_id("stale"), Err(UbdError::NoDevice));
    }

    #[test]
    fn wait_until_destroyed_semantics() {
        let core = new_core();
        assert_eq!(
            core.wait_until_destroyed(0),
            Err(UbdError::InvalidArgument)
        );

        let session = core.open();
        let mut config = writable_config();
        session.create_device(&mut config).unwrap();
        let id = config.device.id;

        assert_eq!(
            core.wait_until_destroyed_timeout(id, Duration::from_millis(5)),
            Err(UbdError::Interrupted)
        );

        drop(session);
        core.wait_until_destroyed(id).unwrap();
        core.wait_until_destroyed(id).unwrap();
    }

    #[test]
    fn trigger_destruction_is_idempotent() {
        let core = new_core();
        let session = core.open();
        let mut config = writable_config();
        config.device.recoverable = 1;
        session.create_device(&mut config).unwrap();
        let id = config.device.id;
        core.device(id).unwrap().wait_until_added();
        session.mark_successful();
        drop(session);

        // Recoverable and clientless: still present.
        assert_eq!(core.device_count(), 1);

        core.trigger_destruction(id).unwrap();
        core.wait_until_destroyed(id).unwrap();
        assert_eq!(core.device_count(), 0);

        // Second trigger is a no-op.
        core.trigger_destruction(id).unwrap();
        assert_eq!(
            core.trigger_destruction(id + 10),
            Err(UbdError::InvalidArgument)
        );
    }

    #[test]
    fn index_reuse_after_destruction() {
        let core = new_core();

        let first = core.open();
        let mut config_a = writable_config();
        first.create_device(&mut config_a).unwrap();
        drop(first);
        core.wait_until_destroyed(config_a.device.id).unwrap();

        // The freed index is eventually recycled, the id never is.
        let second = core.open();
        let mut config_b = writable_config();
        second.create_device(&mut config_b).unwrap();
        assert!(config_b.device.id > config_a.device.id);
        assert_eq!(core.device(config_b.device.id).unwrap().devnum().minor, MINORS_PER_DEVICE);
    }

    #[test]
    fn release_of_nonrecoverable_device_destroys_it() {
        let core = new_core();
        let session = core.open();
        let mut config = writable_config();
        session.create_device(&mut config).unwrap();
        let id = config.device.id;
        core.device(id).unwrap().wait_until_added();

        drop(session);
        assert_eq!(core.device_count(), 0);
        assert_eq!(core.device(id).err(), Some(UbdError::NoDevice));
    }

    #[test]
    fn marked_successful_nonrecoverable_device_survives_release() {
        let core = new_core();
        let session = core.open();
        let mut config = writable_config();
        session.create_device(&mut config).unwrap();
        let id = config.device.id;
        core.device(id).unwrap().wait_until_added();
        session.mark_successful();
        drop(session);

        assert_eq!(core.device_count(), 1);
        let device = core.device(id).unwrap();
        assert_eq!(device.state(), DeviceState::Inactive);
    }

    #[test]
    fn mark_successful_is_sticky_per_session_only() {
        let core = new_core();
        let session = core.open();
        session.mark_successful();

        let mut config = writable_config();
        session.create_device(&mut config).unwrap();
        let id = config.device.id;
        core.device(id).unwrap().wait_until_added();
        drop(session);

        // Marked before attach still counts for this session.
        assert_eq!(core.device_count(), 1);
        core.trigger_destruction(id).unwrap();
    }
}
