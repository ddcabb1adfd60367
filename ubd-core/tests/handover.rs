//! Driver handover: attach/reattach across sessions, flush-before-terminate.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use bytes::Bytes;

use ubd_common::cell::{ItemType, Reply};
use ubd_common::config::DeviceAndFdConfig;
use ubd_common::UbdError;
use ubd_core::{BlockRequest, ClientSession, Core, CoreConfig, DeviceState};

fn new_core() -> Arc<Core> {
    Arc::new(Core::new(CoreConfig::default()).unwrap())
}

fn recoverable_config(supports_flush: bool) -> DeviceAndFdConfig {
    let mut config = DeviceAndFdConfig::default();
    config.device.size = 1 << 24;
    config.device.logical_block_size = 512;
    config.device.supports_read = 1;
    config.device.supports_write = 1;
    config.device.supports_flush = if supports_flush { 1 } else { 0 };
    config.device.recoverable = 1;
    config.device.max_outstanding_reqs = 8;
    config
}

fn expect_item(session: &ClientSession, item_type: ItemType) {
    session.receive_item(0, 0).unwrap();
    assert_eq!(session.read_item(0).unwrap().item_type, item_type.as_u8());
}

#[test]
fn reattach_preserves_queued_requests() {
    let core = new_core();
    let first = core.open();

    let mut config = recoverable_config(false);
    first.create_device(&mut config).unwrap();
    let id = config.device.id;
    let device = core.device(id).unwrap();
    device.wait_until_added();

    expect_item(&first, ItemType::DeviceAvailable);

    // One request queued while the first session is attached but idle.
    let early = BlockRequest::write(0, Bytes::from(vec![1u8; 512]));
    let early_handle = early.handle();
    device.submit(early).unwrap();

    first.mark_successful();
    drop(first);

    // Clientless but recoverable: the device waits, inactive.
    assert_eq!(core.device_count(), 1);
    assert_eq!(device.state(), DeviceState::Inactive);

    // Another request arrives while no one is attached.
    let parked = BlockRequest::write(512, Bytes::from(vec![2u8; 512]));
    let parked_handle = parked.handle();
    device.submit(parked).unwrap();

    let second = core.open();
    let mut reattach = DeviceAndFdConfig::default();
    reattach.device.id = id;
    second.attach(&mut reattach).unwrap();

    // The attach echoed the live configuration.
    assert_eq!(reattach.device.size, config.device.size);
    assert_eq!(reattach.device.max_outstanding_reqs, config.device.max_outstanding_reqs);

    // Availability first, then both queued requests in submission order.
    expect_item(&second, ItemType::DeviceAvailable);

    for (expected_offset, expected_byte, handle) in [
        (0u64, 1u8, early_handle),
        (512u64, 2u8, parked_handle),
    ] {
        second.receive_item(0, 0).unwrap();
        let item = second.read_item(0).unwrap();
        assert_eq!(item.item_type, ItemType::Write.as_u8());
        assert_eq!(item.arg64, expected_offset);
        assert_eq!(
            second.read_buffer(0, 0, 512).unwrap(),
            vec![expected_byte; 512]
        );
        second.write_reply(0, Reply::to_item(&item, 0)).unwrap();
        second.send_reply(0).unwrap();
        assert_eq!(handle.wait().error, 0);
    }
}

#[test]
fn handover_flushes_then_terminates_the_incumbent() {
    let core = new_core();
    let first = core.open();

    let mut config = recoverable_config(true);
    first.create_device(&mut config).unwrap();
    let id = config.device.id;
    core.device(id).unwrap().wait_until_added();

    expect_item(&first, ItemType::DeviceAvailable);

    // A second session starts a handover and blocks until we detach.
    let attacher = thread::spawn({
        let core = Arc::clone(&core);
        move || {
            let second = core.open();
            let mut reattach = DeviceAndFdConfig::default();
            reattach.device.id = id;
            second.attach(&mut reattach).unwrap();
            expect_item(&second, ItemType::DeviceAvailable);
            second
        }
    });

    // Exactly one flush-and-terminate, then terminate forever.
    expect_item(&first, ItemType::FlushAndTerminate);
    expect_item(&first, ItemType::Terminate);
    expect_item(&first, ItemType::Terminate);

    drop(first);

    let second = attacher.join().unwrap();
    assert!(second.is_attached());
    assert_eq!(second.attached_device_id().unwrap(), id);
}

#[test]
fn handover_without_flush_support_skips_the_flush_item() {
    let core = new_core();
    let first = core.open();

    let mut config = recoverable_config(false);
    first.create_device(&mut config).unwrap();
    let id = config.device.id;
    core.device(id).unwrap().wait_until_added();

    expect_item(&first, ItemType::DeviceAvailable);

    let attacher = thread::spawn({
        let core = Arc::clone(&core);
        move || {
            let second = core.open();
            let mut reattach = DeviceAndFdConfig::default();
            reattach.device.id = id;
            second.attach(&mut reattach).unwrap();
            second
        }
    });

    expect_item(&first, ItemType::Terminate);
    drop(first);
    attacher.join().unwrap();
}

#[test]
fn concurrent_handover_is_in_progress() {
    let core = new_core();
    let first = core.open();

    let mut config = recoverable_config(true);
    first.create_device(&mut config).unwrap();
    let id = config.device.id;
    core.device(id).unwrap().wait_until_added();

    let attacher = thread::spawn({
        let core = Arc::clone(&core);
        move || {
            let second = core.open();
            let mut reattach = DeviceAndFdConfig::default();
            reattach.device.id = id;
            second.attach(&mut reattach).unwrap();
            second
        }
    });

    // Give the first attacher time to park on the detach wait.
    thread::sleep(Duration::from_millis(100));

    let third = core.open();
    let mut config_third = DeviceAndFdConfig::default();
    config_third.device.id = id;
    assert_eq!(
        third.attach_timeout(&mut config_third, Duration::from_millis(50)),
        Err(UbdError::InProgress)
    );

    drop(first);
    attacher.join().unwrap();
}

#[test]
fn interrupted_handover_leaves_the_incumbent_attached() {
    let core = new_core();
    let first = core.open();

    let mut config = recoverable_config(true);
    first.create_device(&mut config).unwrap();
    let id = config.device.id;
    core.device(id).unwrap().wait_until_added();

    // The incumbent never detaches, so the handover wait expires.
    let second = core.open();
    let mut reattach = DeviceAndFdConfig::default();
    reattach.device.id = id;
    assert_eq!(
        second.attach_timeout(&mut reattach, Duration::from_millis(50)),
        Err(UbdError::Interrupted)
    );

    assert!(first.is_attached());
    assert!(!second.is_attached());

    // The deactivation already happened; the incumbent is being pushed out.
    expect_item(&first, ItemType::FlushAndTerminate);
    expect_item(&first, ItemType::Terminate);

    // Once the incumbent leaves, a retry succeeds immediately.
    drop(first);
    reattach = DeviceAndFdConfig::default();
    reattach.device.id = id;
    second.attach(&mut reattach).unwrap();
    expect_item(&second, ItemType::DeviceAvailable);
}

#[test]
fn handover_to_terminated_device_reports_no_device() {
    let core = new_core();
    let first = core.open();

    // Non-recoverable and never marked successful: releasing the incumbent
    // mid-handover terminates and destroys the device.
    let mut config = recoverable_config(true);
    config.device.recoverable = 0;
    first.create_device(&mut config).unwrap();
    let id = config.device.id;
    core.device(id).unwrap().wait_until_added();

    expect_item(&first, ItemType::DeviceAvailable);

    let attacher = thread::spawn({
        let core = Arc::clone(&core);
        move || {
            let second = core.open();
            let mut reattach = DeviceAndFdConfig::default();
            reattach.device.id = id;
            second.attach(&mut reattach)
        }
    });

    expect_item(&first, ItemType::FlushAndTerminate);
    drop(first);

    assert_eq!(attacher.join().unwrap(), Err(UbdError::NoDevice));
    core.wait_until_destroyed(id).unwrap();
}
