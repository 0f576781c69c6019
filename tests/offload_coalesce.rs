// Author: Lukas Bower
// Purpose: Coalescing configuration and receive offload metadata behavior.

mod common;

use common::{frame_of, pump, rig};
use etsec_core::{CsumVerdict, EngineConfig, Features, IcPair, LinkSpeed};

/// A zero in either threshold leaves coalescing disabled, regardless of the
/// other field.
#[test]
fn zero_usecs_disables_coalescing() {
    let r = rig(EngineConfig::default());

    r.iface
        .set_rx_coalesce(0, IcPair { usecs: 0, frames: 5 })
        .expect("in range");
    assert!(!r.iface.rx_coalesce(0).enabled());
    assert_eq!(r.mac.rx_coalesce_value(0), 0, "timer must stay parked");

    r.iface
        .set_rx_coalesce(0, IcPair { usecs: 10, frames: 5 })
        .expect("in range");
    assert!(r.iface.rx_coalesce(0).enabled());
    assert_ne!(r.mac.rx_coalesce_value(0), 0);
}

/// Out-of-range thresholds are refused outright.
#[test]
fn coalesce_bounds_are_enforced() {
    let r = rig(EngineConfig::default());
    assert!(r
        .iface
        .set_tx_coalesce(0, IcPair { usecs: 100_000, frames: 1 })
        .is_err());
    assert!(r
        .iface
        .set_tx_coalesce(0, IcPair { usecs: 10, frames: 1_000 })
        .is_err());
}

/// The microsecond threshold converts through the link-speed tick length,
/// so a speed change must reprogram the register.
#[test]
fn link_speed_change_rescales_ticks() {
    let r = rig(EngineConfig::default());

    r.iface
        .set_rx_coalesce(0, IcPair { usecs: 10, frames: 4 })
        .expect("in range");
    let gigabit = r.mac.rx_coalesce_value(0);
    assert_eq!(gigabit & 0xffff, 20, "10 usecs is 20 ticks at gigabit");

    r.mac.set_link_speed(LinkSpeed::Mbps100);
    r.iface.refresh_link();
    let fast_ethernet = r.mac.rx_coalesce_value(0);
    assert_eq!(fast_ethernet & 0xffff, 4, "10 usecs is 4 ticks at 100M");
    assert_ne!(gigabit, fast_ethernet);
}

/// VLAN tag and checksum verdict ride the metadata prefix and are stripped
/// before delivery.
#[test]
fn rx_offload_metadata_reaches_the_sink() {
    let r = rig(EngineConfig::default());

    // A frame the model's checksum parser cannot validate arrives with the
    // verdict left to upstream.
    r.mac.inject_rx(0, &[0x99; 100]);
    pump(&r);
    {
        let delivered = r.delivered.lock().expect("sink");
        assert_eq!(delivered.len(), 1);
        assert_eq!(delivered[0].meta.csum_verdict, CsumVerdict::Unknown);
        assert_eq!(delivered[0].data(), &[0x99; 100][..]);
    }

    // A tagged frame surfaces its VLAN id.
    r.mac.inject_rx_with_status(
        0,
        &[0x77; 64],
        etsec_core::bd::BdFlags::empty(),
        Some(0x0123),
    );
    pump(&r);
    let delivered = r.delivered.lock().expect("sink");
    assert_eq!(delivered.len(), 2);
    assert_eq!(delivered[1].meta.vlan, Some(0x0123));
}

/// Receive timestamps are stripped from the payload and surfaced in the
/// frame metadata.
#[test]
fn rx_timestamp_is_extracted() {
    let config = EngineConfig {
        features: Features::TX_CSUM | Features::RX_CSUM | Features::VLAN | Features::TIMESTAMP,
        rx_buffer_len: 2_048,
        ..EngineConfig::default()
    };
    let r = rig(config);

    r.mac.inject_rx(0, &[0x10; 120]);
    pump(&r);

    let delivered = r.delivered.lock().expect("sink");
    assert_eq!(delivered.len(), 1);
    assert!(delivered[0].meta.timestamp.is_some());
    assert_eq!(delivered[0].len(), 120, "prefix fully stripped");
}

/// Transmit timestamping reserves its extra descriptor and reports the
/// latched value after reclaim.
#[test]
fn tx_timestamp_round_trip() {
    let config = EngineConfig {
        features: Features::TX_CSUM | Features::RX_CSUM | Features::VLAN | Features::TIMESTAMP,
        rx_buffer_len: 2_048,
        tx_ring_size: 8,
        ..EngineConfig::default()
    };
    let r = rig(config);

    let mut frame = frame_of(80, 0x42);
    frame.meta.timestamp_req = true;
    r.iface.transmit(0, frame).expect("transmit");
    assert_eq!(r.iface.tx_free_slots(0), 6, "timestamp takes a second slot");

    pump(&r);
    assert_eq!(r.iface.last_tx_timestamp(0), Some(1));
    assert_eq!(r.mac.pop_tx().map(|(_, w)| w.len()), Some(80));
}
