//! Detach/re-attach across a live migration, driven through the manager.

use libavp::loopback::{CollectingStack, LoopbackConfig, LoopbackHost, Responder};
use libavp::{
    AvpConfig, AvpDevice, AvpError, DeviceManager, DeviceStatus, Features, HostAddr,
    InterruptStatus, MigrationStatus, Packet, RequestKind, TxDrop, TxOutcome,
};
use std::sync::Arc;
use std::time::{Duration, Instant};

struct Setup {
    _responder: Responder,
    manager: Arc<DeviceManager>,
    host: Arc<LoopbackHost>,
    stack: Arc<CollectingStack>,
    device: Arc<AvpDevice>,
}

fn setup() -> Setup {
    setup_with(LoopbackConfig::default())
}

fn setup_with(host_config: LoopbackConfig) -> Setup {
    let mut config = AvpConfig::default();
    config.control.timeout_ms = 50;
    config.cpus.eligible = vec![0];

    let host = Arc::new(LoopbackHost::new(host_config).unwrap());
    let stack = Arc::new(CollectingStack::new());
    let manager = Arc::new(DeviceManager::new(config, stack.clone()).unwrap());

    let responder = {
        let manager = Arc::downgrade(&manager);
        let id = host.device_id();
        host.spawn_responder(move || {
            if let Some(manager) = manager.upgrade() {
                let _ = manager.handle_interrupt(id, InterruptStatus::RESPONSE);
            }
        })
    };
    let device = manager.create_device(host.resources()).unwrap();
    Setup {
        _responder: responder,
        manager,
        host,
        stack,
        device,
    }
}

fn wait_until(what: &str, cond: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while !cond() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}

fn migrate_out(s: &Setup) {
    let status = s.host.begin_migration().unwrap();
    s.manager.handle_interrupt(s.device.id(), status).unwrap();
}

fn assigned_queues(s: &Setup) -> usize {
    s.manager.pool().loads().iter().map(|(_, n)| n).sum::<usize>() + s.manager.pool().parked()
}

#[test]
fn test_migration_round_trip() {
    let s = setup();
    s.device.open().unwrap();
    assert_eq!(assigned_queues(&s), 2);

    for _ in 0..3 {
        assert!(s.device.transmit(0, Packet::from_bytes(vec![0xab; 100])).is_queued());
    }
    let cached = s.device.tx_cache_len(0).unwrap();
    let alloc_before = s.host.alloc_count(0).unwrap();
    assert_eq!(cached, 29);

    migrate_out(&s);
    assert_eq!(s.device.status(), DeviceStatus::Detached);
    assert_eq!(s.host.migration_ack().unwrap(), Some(MigrationStatus::Detached));
    assert_eq!(s.stack.link(s.device.id()), Some(false));
    assert_eq!(assigned_queues(&s), 0);
    // Cached buffers went back to the host exactly once
    let alloc_after = s.host.alloc_count(0).unwrap();
    assert_eq!(alloc_after, alloc_before + cached as u32);

    assert!(!s.device.detach(s.manager.pool()));
    assert_eq!(s.host.alloc_count(0).unwrap(), alloc_after);
    assert_eq!(
        s.device.transmit(0, Packet::from_bytes(vec![1; 64])),
        TxOutcome::Dropped(TxDrop::Detached)
    );
    assert!(matches!(s.device.change_mtu(1400), Err(AvpError::Detached)));

    let status = s.host.end_migration().unwrap();
    s.manager.handle_interrupt(s.device.id(), status).unwrap();
    assert_eq!(s.device.status(), DeviceStatus::Ok);
    assert_eq!(s.host.migration_ack().unwrap(), Some(MigrationStatus::Attached));
    assert_eq!(s.stack.link(s.device.id()), Some(true));
    assert_eq!(assigned_queues(&s), 2);

    // Traffic flows over the relocated layout
    assert!(s.host.inject(1, &Packet::from_bytes(vec![7; 300])).unwrap());
    wait_until("delivery", || s.stack.delivered_count() == 1);
    assert_eq!(s.stack.take()[0].data(), vec![7; 300].as_slice());

    assert!(s.device.transmit(0, Packet::from_bytes(vec![9; 100])).is_queued());
    let frames = s.host.drain_tx(0).unwrap();
    assert_eq!(frames.len(), 1);
    assert!(frames[0].segments[0].self_addr >= s.host.buffer_addr(0));
}

#[test]
fn test_failed_reattach_stays_detached() {
    let s = setup();
    migrate_out(&s);

    s.host.set_result(RequestKind::Configure, -5);
    let status = s.host.end_migration().unwrap();
    let err = s.manager.handle_interrupt(s.device.id(), status).unwrap_err();
    assert!(matches!(
        err,
        AvpError::Rejected {
            kind: RequestKind::Configure,
            code: -5
        }
    ));
    assert_eq!(s.device.status(), DeviceStatus::Detached);
    assert_eq!(s.host.migration_ack().unwrap(), Some(MigrationStatus::Error));
    assert_eq!(s.device.rx_queue_count(), 0);
    assert_eq!(assigned_queues(&s), 0);

    // The host retries and the guest comes back
    s.host.set_result(RequestKind::Configure, 0);
    let status = s.host.end_migration().unwrap();
    s.manager.handle_interrupt(s.device.id(), status).unwrap();
    assert_eq!(s.device.status(), DeviceStatus::Ok);
    assert_eq!(s.host.migration_ack().unwrap(), Some(MigrationStatus::Attached));
}

#[test]
fn test_reattach_with_fewer_features() {
    let s = setup();
    assert_eq!(
        s.manager.query_config(s.device.id()).unwrap().features,
        Features::VLAN_OFFLOAD.bits()
    );

    migrate_out(&s);
    s.host.set_features(Features::empty());
    let status = s.host.end_migration().unwrap();
    s.manager.handle_interrupt(s.device.id(), status).unwrap();

    let config = s.manager.query_config(s.device.id()).unwrap();
    assert_eq!(config.status, DeviceStatus::Ok);
    assert_eq!(config.features, 0);
    assert_eq!(config.host_features, 0);
}

#[test]
fn test_reattach_clears_fault() {
    let s = setup();
    assert!(s.host.inject_raw(0, HostAddr::new(0xdead_0000)).unwrap());
    wait_until("fault latch", || s.device.is_faulted());

    migrate_out(&s);
    let status = s.host.end_migration().unwrap();
    s.manager.handle_interrupt(s.device.id(), status).unwrap();
    assert!(!s.device.is_faulted());
    assert!(s.device.transmit(0, Packet::from_bytes(vec![3; 80])).is_queued());
}

#[test]
fn test_device_registry() {
    let s = setup();
    let id = s.device.id();
    assert_eq!(s.manager.devices(), vec![id]);
    assert!(matches!(
        s.manager.create_device(s.host.resources()),
        Err(AvpError::DeviceExists(_))
    ));

    let config = s.manager.query_config(id).unwrap();
    assert_eq!(config.ifname, "avp0");
    assert_eq!(config.mac, "02:00:5e:00:00:01");
    assert_eq!(config.num_rx_queues, 2);

    let json = serde_json::to_value(&config).unwrap();
    assert_eq!(json["device_id"], 1);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["mode"], "guest");

    s.manager.release_device(id).unwrap();
    assert_eq!(s.device.status(), DeviceStatus::Detached);
    assert!(s.manager.devices().is_empty());
    assert_eq!(assigned_queues(&s), 0);
    assert!(matches!(
        s.manager.release_device(id),
        Err(AvpError::DeviceNotFound(_))
    ));
    assert!(s.manager.query_config(id).is_err());
}

#[test]
fn test_cpu_hotplug_parks_and_restores_queues() {
    let s = setup();
    assert_eq!(s.manager.pool().loads(), vec![(0, 2)]);

    assert!(s.manager.cpu_offline(0));
    assert_eq!(s.manager.pool().parked(), 2);
    assert!(!s.manager.pool().is_running(0));

    assert!(s.manager.cpu_online(0));
    assert_eq!(s.manager.pool().parked(), 0);
    assert_eq!(s.manager.pool().loads(), vec![(0, 2)]);

    assert!(s.host.inject(0, &Packet::from_bytes(vec![5; 64])).unwrap());
    wait_until("delivery", || s.stack.delivered_count() == 1);
}
