// Author: Lukas Bower
// Purpose: Interface-level tests for ring capacity, backpressure, and ordering.

mod common;

use common::{frame_of, pump, rig};
use etsec_core::{EngineConfig, TxError};

fn small_ring_config() -> EngineConfig {
    EngineConfig {
        tx_ring_size: 8,
        rx_ring_size: 8,
        ..EngineConfig::default()
    }
}

/// Capacity 8: a 3-slot frame leaves 5 free, so a 6-slot frame must bounce;
/// after the first frame completes, the 6-slot frame fits.
#[test]
fn oversubscribed_ring_bounces_then_recovers() {
    let r = rig(small_ring_config());

    let mut three = frame_of(120, 0x11);
    three.push_fragment(vec![0x22; 40].into_boxed_slice());
    three.push_fragment(vec![0x33; 40].into_boxed_slice());
    r.iface.transmit(0, three).expect("3 slots out of 8");
    assert_eq!(r.iface.tx_free_slots(0), 5);

    let mut six = frame_of(120, 0x44);
    for _ in 0..5 {
        six.push_fragment(vec![0x55; 16].into_boxed_slice());
    }
    assert_eq!(r.iface.transmit(0, six), Err(TxError::Busy));
    assert!(r.iface.queue_stopped(0), "refusal must stop the queue");
    assert_eq!(r.iface.tx_free_slots(0), 5, "failed submit must not leak slots");

    pump(&r);
    assert!(!r.iface.queue_stopped(0), "reclaim must wake the queue");
    assert_eq!(r.iface.tx_free_slots(0), 8);

    let mut six = frame_of(120, 0x44);
    for _ in 0..5 {
        six.push_fragment(vec![0x55; 16].into_boxed_slice());
    }
    r.iface.transmit(0, six).expect("6 slots fit after reclaim");
    assert_eq!(r.iface.tx_free_slots(0), 2);
}

/// Wire order matches submission order on a single queue, across enough
/// traffic to wrap the ring several times.
#[test]
fn completions_are_fifo_across_wraps() {
    let r = rig(small_ring_config());

    let mut expected = Vec::new();
    for round in 0u8..40 {
        r.iface
            .transmit(0, frame_of(64 + usize::from(round), round))
            .expect("transmit");
        expected.push(64 + usize::from(round));
        pump(&r);
    }

    let mut seen = Vec::new();
    while let Some((queue, wire)) = r.mac.pop_tx() {
        assert_eq!(queue, 0);
        seen.push(wire.len());
    }
    assert_eq!(seen, expected);
    assert_eq!(r.iface.tx_in_flight(), 0);
    assert_eq!(r.arena.mapped_regions(), r.iface.stats().rx_packets as usize + 8,
        "only receive-ring buffers stay mapped");
}

/// Conservation: free slots plus in-flight slot usage always equals ring
/// capacity, before and after traffic.
#[test]
fn slot_accounting_is_conserved() {
    let r = rig(small_ring_config());
    assert_eq!(r.iface.tx_free_slots(0), 8);

    r.iface.transmit(0, frame_of(100, 1)).expect("transmit");
    let mut two = frame_of(100, 2);
    two.push_fragment(vec![0; 10].into_boxed_slice());
    r.iface.transmit(0, two).expect("transmit");
    assert_eq!(r.iface.tx_free_slots(0), 8 - 1 - 2);
    assert_eq!(r.iface.tx_in_flight(), 2);

    pump(&r);
    assert_eq!(r.iface.tx_free_slots(0), 8);
    assert_eq!(r.iface.tx_in_flight(), 0);

    let snap = r.iface.stats();
    assert_eq!(snap.tx_packets, 2);
}

/// Queues spread across two interrupt groups work independently.
#[test]
fn multi_queue_groups_carry_independent_traffic() {
    let config = EngineConfig {
        tx_queues: 2,
        rx_queues: 2,
        groups: 2,
        tx_ring_size: 16,
        rx_ring_size: 16,
        ..EngineConfig::default()
    };
    let r = rig(config);

    r.iface.transmit(0, frame_of(100, 0xA0)).expect("queue 0");
    r.iface.transmit(1, frame_of(200, 0xB1)).expect("queue 1");
    r.mac.inject_rx(0, &[0xC0; 80]);
    r.mac.inject_rx(1, &[0xD1; 90]);

    for _ in 0..8 {
        pump(&r);
    }

    let mut wires: Vec<(usize, usize)> = Vec::new();
    while let Some((queue, wire)) = r.mac.pop_tx() {
        wires.push((queue, wire.len()));
    }
    wires.sort_unstable();
    assert_eq!(wires, vec![(0, 100), (1, 200)]);

    let delivered = r.delivered.lock().expect("sink");
    assert_eq!(delivered.len(), 2);
    let mut got: Vec<(Option<usize>, usize)> = delivered
        .iter()
        .map(|f| (f.meta.rx_queue, f.len()))
        .collect();
    got.sort_unstable();
    assert_eq!(got, vec![(Some(0), 80), (Some(1), 90)]);

    assert_eq!(r.iface.tx_queue_stats(0), (1, 100));
    assert_eq!(r.iface.tx_queue_stats(1), (1, 200));
}

/// Two receive queues in one group split the poll budget and both drain.
#[test]
fn shared_group_budget_drains_all_queues() {
    let config = EngineConfig {
        rx_queues: 2,
        tx_queues: 1,
        groups: 1,
        rx_ring_size: 64,
        tx_ring_size: 16,
        ..EngineConfig::default()
    };
    let r = rig(config);

    for _ in 0..40 {
        r.mac.inject_rx(0, &[1; 64]);
        r.mac.inject_rx(1, &[2; 64]);
    }
    for _ in 0..16 {
        pump(&r);
    }

    let delivered = r.delivered.lock().expect("sink");
    assert_eq!(delivered.len(), 80, "both queues fully drained");
}
