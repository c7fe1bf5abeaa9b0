//! Receive and transmit engines against the loopback host.

mod common;

use common::{frame, Harness};
use libavp::loopback::LoopbackConfig;
use libavp::{BufferFlags, HostAddr, Packet, TxDrop, TxOutcome};

#[test]
fn test_rx_burst_capped_by_free_ring_room() {
    let h = Harness::attached();
    for i in 0..5 {
        assert!(h.host.inject(0, &Packet::from_bytes(frame(100 + i))).unwrap());
    }
    // Leave room for only three returned buffers
    h.host.stall_free_ring(0, 3).unwrap();

    assert_eq!(h.device.poll_rx(0, 64).unwrap(), 3);
    assert_eq!(h.host.rx_backlog(0).unwrap(), 2);
    assert_eq!(h.stack.delivered_count(), 3);

    let stats = h.device.stats64();
    assert_eq!(stats.rx_packets, 3);
    assert_eq!(stats.rx_dropped, 0);
    assert_eq!(stats.rx_fifo_errors, 0);
}

#[test]
fn test_rx_full_free_ring_counts_fifo_error() {
    let h = Harness::attached();
    assert!(h.host.inject(0, &Packet::from_bytes(frame(64))).unwrap());
    h.host.stall_free_ring(0, 0).unwrap();

    assert_eq!(h.device.poll_rx(0, 64).unwrap(), 0);
    assert_eq!(h.host.rx_backlog(0).unwrap(), 1);
    assert_eq!(h.device.stats64().rx_fifo_errors, 1);
}

#[test]
fn test_rx_delivers_payload_and_origin() {
    let h = Harness::attached();
    let sent = Packet::from_bytes(frame(1400));
    assert!(h.host.inject(1, &sent).unwrap());

    assert_eq!(h.drain_rx(1), 1);
    let delivered = h.stack.take_with_origin();
    assert_eq!(delivered.len(), 1);
    let (device, queue, packet) = &delivered[0];
    assert_eq!(*device, h.device.id());
    assert_eq!(*queue, 1);
    assert_eq!(packet.data(), sent.data());
    assert_eq!(packet.vlan(), None);

    // Buffer went straight back to the host
    assert_eq!(h.host.free_ring_count(1).unwrap(), 1);
    assert_eq!(h.device.stats64().rx_bytes, 1400);
}

#[test]
fn test_rx_multi_segment_with_vlan() {
    let h = Harness::attached();
    let sent = Packet::from_bytes(frame(5000)).with_vlan(0x0123);
    assert!(h.host.inject(0, &sent).unwrap());

    assert_eq!(h.drain_rx(0), 1);
    let packets = h.stack.take();
    assert_eq!(packets[0].data(), sent.data());
    assert_eq!(packets[0].vlan(), Some(0x0123));
    // Only the chain head goes back on the free ring
    assert_eq!(h.host.free_ring_count(0).unwrap(), 1);
}

#[test]
fn test_rx_alloc_failure_drops_rest_of_burst() {
    let h = Harness::attached();
    for _ in 0..5 {
        assert!(h.host.inject(0, &Packet::from_bytes(frame(200))).unwrap());
    }
    h.stack.fail_allocs_after(2);

    assert_eq!(h.device.poll_rx(0, 64).unwrap(), 5);
    assert_eq!(h.stack.delivered_count(), 2);
    let stats = h.device.stats64();
    assert_eq!(stats.rx_packets, 2);
    assert_eq!(stats.rx_dropped, 3);
    // Every buffer is returned regardless
    assert_eq!(h.host.free_ring_count(0).unwrap(), 5);
}

#[test]
fn test_rx_bad_chains_do_not_stop_the_burst() {
    let h = Harness::attached();
    let reserve = h.host.free_buffers();

    let good: Vec<Packet> = [300, 400, 600]
        .iter()
        .map(|&len| Packet::from_bytes(frame(len)))
        .collect();
    assert!(h.host.inject(0, &good[0]).unwrap());
    // Segments hold more than the head claims
    assert!(h
        .host
        .inject_mislabeled(0, &Packet::from_bytes(frame(3000)), 1000)
        .unwrap());
    assert!(h.host.inject(0, &good[1]).unwrap());
    // Segments hold less than the head claims
    assert!(h
        .host
        .inject_mislabeled(0, &Packet::from_bytes(frame(500)), 2000)
        .unwrap());
    assert!(h.host.inject(0, &good[2]).unwrap());

    assert_eq!(h.device.poll_rx(0, 64).unwrap(), 5);
    assert!(!h.device.is_faulted());
    let delivered = h.stack.take();
    assert_eq!(delivered.len(), 3);
    for (got, sent) in delivered.iter().zip(&good) {
        assert_eq!(got.data(), sent.data());
    }

    let stats = h.device.stats64();
    assert_eq!(stats.rx_packets, 3);
    assert_eq!(stats.rx_dropped, 1);
    assert_eq!(stats.rx_errors, 1);
    assert_eq!(stats.rx_bytes, 1300);
    assert_eq!(h.host.free_ring_count(0).unwrap(), 5);

    // Every segment of every chain is back in the host's reserve
    assert!(h.host.inject(0, &Packet::from_bytes(frame(64))).unwrap());
    assert_eq!(h.host.free_buffers(), reserve - 1);
}

#[test]
fn test_rx_sustained_jumbo_traffic_recycles_every_segment() {
    let h = Harness::attached_with(LoopbackConfig {
        rx_queues: 1,
        tx_queues: 1,
        ring_capacity: 16,
        buffers: 96,
        ..Default::default()
    });
    let reserve = h.host.free_buffers();
    let sent = Packet::from_bytes(frame(5000));
    let segments = 3;

    // Far more segments than the pool holds pass through one queue
    let rounds = 4 * reserve;
    for i in 0..rounds {
        assert!(h.host.inject(0, &sent).unwrap(), "inject refused at packet {i}");
        assert_eq!(h.drain_rx(0), 1);
    }
    let delivered = h.stack.take();
    assert_eq!(delivered.len(), rounds);
    assert!(delivered.iter().all(|p| p.data() == sent.data()));
    assert_eq!(h.host.free_buffers(), reserve - segments);
}

#[test]
fn test_tx_two_segments() {
    let h = Harness::attached();
    assert_eq!(h.host.alloc_count(0).unwrap(), 64);

    let outcome = h.device.transmit(0, Packet::from_bytes(frame(3000)));
    assert_eq!(outcome, TxOutcome::Queued { segments: 2 });

    // One refill of the cache, two buffers used from it
    assert_eq!(h.host.alloc_count(0).unwrap(), 32);
    assert_eq!(h.device.tx_cache_len(0), Some(30));

    let frames = h.host.drain_tx(0).unwrap();
    assert_eq!(frames.len(), 1);
    let segs = &frames[0].segments;
    assert_eq!(segs.len(), 2);
    assert_eq!(segs[0].data_len, 2048);
    assert_eq!(segs[1].data_len, 952);
    assert_eq!(segs[0].pkt_len, 3000);
    assert_eq!(segs[0].nb_segs, 2);
    assert_eq!(segs[0].next, segs[1].self_addr);
    assert!(segs[1].next.is_null());
    assert_eq!(frames[0].packet.data(), frame(3000).as_slice());

    let stats = h.device.stats64();
    assert_eq!(stats.tx_packets, 1);
    assert_eq!(stats.tx_bytes, 3000);
}

#[test]
fn test_tx_short_frame_is_padded() {
    let h = Harness::attached();
    assert!(h.device.transmit(0, Packet::from_bytes(frame(10))).is_queued());

    let frames = h.host.drain_tx(0).unwrap();
    let seg = &frames[0].segments[0];
    assert_eq!(seg.data_len, 60);
    assert_eq!(seg.pkt_len, 60);
    assert_eq!(seg.nb_segs, 1);

    let data = frames[0].packet.data();
    assert_eq!(&data[..10], frame(10).as_slice());
    assert!(data[10..].iter().all(|&b| b == 0));
    assert_eq!(h.device.stats64().tx_bytes, 60);
}

#[test]
fn test_tx_vlan_tag_carried_in_descriptor() {
    let h = Harness::attached();
    let packet = Packet::from_bytes(frame(128)).with_vlan(0x0abc);
    assert!(h.device.transmit(1, packet).is_queued());

    let frames = h.host.drain_tx(1).unwrap();
    let seg = &frames[0].segments[0];
    assert!(seg.flags.contains(BufferFlags::VLAN_PKT));
    assert_eq!(seg.vlan_tci, 0x0abc);
    assert_eq!(frames[0].packet.vlan(), Some(0x0abc));
}

#[test]
fn test_tx_bad_lengths() {
    let h = Harness::attached();
    let too_long = 5 * 2048 + 1;
    assert_eq!(
        h.device.transmit(0, Packet::from_bytes(frame(too_long))),
        TxOutcome::Dropped(TxDrop::BadLength)
    );
    assert_eq!(
        h.device.transmit(0, Packet::default()),
        TxOutcome::Dropped(TxDrop::BadLength)
    );
    // Five full segments is the limit
    assert!(h.device.transmit(0, Packet::from_bytes(frame(5 * 2048))).is_queued());

    let stats = h.device.stats64();
    assert_eq!(stats.tx_errors, 2);
    assert_eq!(stats.tx_dropped, 2);
    assert_eq!(stats.tx_packets, 1);
}

#[test]
fn test_tx_ring_full() {
    let h = Harness::attached();
    for _ in 0..64 {
        assert!(h.device.transmit(0, Packet::from_bytes(frame(64))).is_queued());
    }
    assert_eq!(
        h.device.transmit(0, Packet::from_bytes(frame(64))),
        TxOutcome::Dropped(TxDrop::RingFull)
    );
    let stats = h.device.stats64();
    assert_eq!(stats.tx_dropped, 1);
    assert_eq!(stats.tx_fifo_errors, 0);

    // Draining recycles buffers onto the alloc ring
    assert_eq!(h.host.drain_tx(0).unwrap().len(), 64);
    assert!(h.device.transmit(0, Packet::from_bytes(frame(64))).is_queued());
}

#[test]
fn test_tx_without_buffers() {
    let h = Harness::attached();
    assert_eq!(h.host.drain_alloc(0).unwrap(), 64);
    assert_eq!(
        h.device.transmit(0, Packet::from_bytes(frame(64))),
        TxOutcome::Dropped(TxDrop::NoBuffers)
    );
    let stats = h.device.stats64();
    assert_eq!(stats.tx_fifo_errors, 1);
    assert_eq!(stats.tx_dropped, 1);
}

#[test]
fn test_untranslatable_entry_latches_fault() {
    let h = Harness::attached();
    assert!(h.host.inject_raw(0, HostAddr::new(0xdead_0000)).unwrap());

    let err = h.device.poll_rx(0, 64).unwrap_err();
    assert!(err.is_protocol_violation());
    assert!(h.device.is_faulted());
    // The entry still went back to the host
    assert_eq!(h.host.free_ring_count(0).unwrap(), 1);

    assert!(h.host.inject(1, &Packet::from_bytes(frame(64))).unwrap());
    assert_eq!(h.device.poll_rx(1, 64).unwrap(), 0);
    assert_eq!(h.host.rx_backlog(1).unwrap(), 1);
    assert_eq!(
        h.device.transmit(0, Packet::from_bytes(frame(64))),
        TxOutcome::Dropped(TxDrop::Faulted)
    );
    assert!(h.device.config().unwrap().faulted);
}

#[test]
fn test_corrupt_tx_descriptor_keeps_cache_intact() {
    let h = Harness::attached();
    assert_eq!(
        h.host
            .corrupt_alloc_ring(0, HostAddr::new(0xdead_0000))
            .unwrap(),
        64
    );

    assert_eq!(
        h.device.transmit(0, Packet::from_bytes(frame(100))),
        TxOutcome::Dropped(TxDrop::ProtocolViolation)
    );
    assert!(h.device.is_faulted());
    // The chain went back into the cache, nothing reached the ring
    assert_eq!(h.device.tx_cache_len(0), Some(32));
    assert_eq!(h.host.tx_backlog(0).unwrap(), 0);
    assert_eq!(h.device.stats64().tx_dropped, 1);
}

#[test]
fn test_detached_device_moves_nothing() {
    let h = Harness::new(LoopbackConfig::default());
    assert_eq!(
        h.device.transmit(0, Packet::from_bytes(frame(64))),
        TxOutcome::Dropped(TxDrop::Detached)
    );
    assert_eq!(h.device.poll_rx(0, 64).unwrap(), 0);
    assert_eq!(h.host.tx_backlog(0).unwrap(), 0);
}

#[test]
fn test_queue_counts_follow_host_limits() {
    let h = Harness::attached_with(LoopbackConfig {
        rx_queues: 3,
        tx_queues: 1,
        ..Default::default()
    });
    assert_eq!(h.device.rx_queue_count(), 3);
    assert_eq!(h.device.tx_queue_count(), 1);
    assert!(h.device.poll_rx(3, 64).is_err());
    assert_eq!(
        h.device.transmit(1, Packet::from_bytes(frame(64))),
        TxOutcome::Dropped(TxDrop::BadQueue)
    );
    let stats = h.device.stats64();
    assert_eq!(stats.tx_dropped, 1);
    assert_eq!(stats.tx_errors, 1);
}
