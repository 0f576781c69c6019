// Author: Lukas Bower
// Purpose: Shared harness for the interface-level test suites.

use std::sync::{Arc, Mutex};

use etsec_core::dma::DmaArena;
use etsec_core::sim::{CollectSink, SimMac};
use etsec_core::{EngineConfig, EtsecIface, Frame};

pub struct Rig {
    pub mac: Arc<SimMac>,
    pub arena: Arc<DmaArena>,
    pub iface: EtsecIface,
    pub delivered: Arc<Mutex<Vec<Frame>>>,
}

/// Build an interface over the software MAC and bring it up.
pub fn rig(config: EngineConfig) -> Rig {
    let _ = env_logger::builder().is_test(true).try_init();
    let arena = Arc::new(DmaArena::new());
    let mac = Arc::new(SimMac::new(Arc::clone(&arena), config.groups));
    let sink = CollectSink::new();
    let delivered = sink.handle();
    let iface = EtsecIface::new(
        config,
        Arc::clone(&mac) as Arc<dyn etsec_core::MacRegisters>,
        Arc::clone(&arena),
        Box::new(sink),
    )
    .expect("valid config");
    iface.up();
    Rig {
        mac,
        arena,
        iface,
        delivered,
    }
}

/// Let the device move frames, dispatch the resulting interrupts, and run
/// the poll loop until it goes idle.
pub fn pump(r: &Rig) {
    for _ in 0..32 {
        r.mac.process();
        r.iface.poll_interrupts();
        if !r.iface.service() {
            break;
        }
    }
}

/// A frame of `len` identical bytes with default headroom.
pub fn frame_of(len: usize, fill: u8) -> Frame {
    Frame::with_headroom(16, &vec![fill; len])
}
