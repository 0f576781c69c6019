// Author: Lukas Bower
// Purpose: Software MAC model: consumes armed descriptors like the real DMA engine.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, trace};
use smoltcp::wire::{EthernetFrame, EthernetProtocol, IpProtocol, Ipv4Packet, TcpPacket, UdpPacket};

use crate::bd::{Bd, BdFlags};
use crate::coalesce::LinkSpeed;
use crate::dma::{BusAddr, DmaArena};
use crate::frame::{RxFcb, RxFcbFlags, TxFcb, TxFcbFlags, FCB_LEN, FCS_LEN, TIMESTAMP_LEN};
use crate::mac::{Events, MacRegisters, MAX_GROUPS, MAX_QUEUES};

/// Frame queued for injection into a receive ring.
#[derive(Debug)]
struct Inbound {
    queue: usize,
    bytes: Vec<u8>,
    status: BdFlags,
    vlan: Option<u16>,
}

#[derive(Debug, Default)]
struct DevRing {
    slots: Option<Arc<[Bd]>>,
    head: usize,
}

impl DevRing {
    fn advance(&mut self, status: BdFlags) {
        // The engine follows the explicit wrap marker, not index arithmetic.
        self.head = if status.contains(BdFlags::WRAP) {
            0
        } else {
            self.head + 1
        };
    }
}

#[derive(Debug)]
struct SimState {
    tx: Vec<DevRing>,
    rx: Vec<DevRing>,
    inbound: VecDeque<Inbound>,
    outbound: VecDeque<(usize, Vec<u8>)>,
    rx_fcb: bool,
    rx_tstamp: bool,
    tstamp_clock: u64,
    tx_stalled: [bool; MAX_QUEUES],
}

/// Software model of the MAC and its descriptor DMA engine.
///
/// `process` performs one DMA sweep: transmit chains whose head descriptor
/// has been published are drained to the outbound queue, and injected
/// inbound frames are written into empty receive descriptors. Completion
/// events accumulate per interrupt group exactly as the hardware's event
/// registers do. Tests and self-tests drive it explicitly, which keeps every
/// interleaving reproducible.
pub struct SimMac {
    arena: Arc<DmaArena>,
    groups: usize,
    state: Mutex<SimState>,
    events: [AtomicU32; MAX_GROUPS],
    masks: [AtomicU32; MAX_GROUPS],
    tx_coalesce: [AtomicU32; MAX_QUEUES],
    rx_coalesce: [AtomicU32; MAX_QUEUES],
    halt_requested: AtomicBool,
    halted: AtomicBool,
    enabled: AtomicBool,
    halt_stuck: AtomicBool,
    link: AtomicU8,
    tx_tstamp: AtomicU64,
}

impl SimMac {
    /// Build a model with `groups` interrupt groups sharing `arena`.
    #[must_use]
    pub fn new(arena: Arc<DmaArena>, groups: usize) -> Self {
        Self {
            arena,
            groups: groups.clamp(1, MAX_GROUPS),
            state: Mutex::new(SimState {
                tx: (0..MAX_QUEUES).map(|_| DevRing::default()).collect(),
                rx: (0..MAX_QUEUES).map(|_| DevRing::default()).collect(),
                inbound: VecDeque::new(),
                outbound: VecDeque::new(),
                rx_fcb: false,
                rx_tstamp: false,
                tstamp_clock: 0,
                tx_stalled: [false; MAX_QUEUES],
            }),
            events: Default::default(),
            masks: Default::default(),
            tx_coalesce: Default::default(),
            rx_coalesce: Default::default(),
            halt_requested: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            enabled: AtomicBool::new(false),
            halt_stuck: AtomicBool::new(false),
            link: AtomicU8::new(2),
            tx_tstamp: AtomicU64::new(0),
        }
    }

    fn group_of(&self, queue: usize) -> usize {
        queue % self.groups
    }

    fn raise(&self, group: usize, events: Events) {
        self.events[group % MAX_GROUPS].fetch_or(events.bits(), Ordering::AcqRel);
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue a frame for a receive ring, with a clean status word.
    pub fn inject_rx(&self, queue: usize, bytes: &[u8]) {
        self.inject_rx_with_status(queue, bytes, BdFlags::empty(), None);
    }

    /// Queue a frame and force extra status bits into its completion (error
    /// injection) and/or a VLAN tag for extraction.
    pub fn inject_rx_with_status(
        &self,
        queue: usize,
        bytes: &[u8],
        status: BdFlags,
        vlan: Option<u16>,
    ) {
        self.lock().inbound.push_back(Inbound {
            queue,
            bytes: bytes.to_vec(),
            status,
            vlan,
        });
    }

    /// Take the oldest transmitted frame off the wire side.
    pub fn pop_tx(&self) -> Option<(usize, Vec<u8>)> {
        self.lock().outbound.pop_front()
    }

    /// Transmitted frames waiting on the wire side.
    #[must_use]
    pub fn outbound_len(&self) -> usize {
        self.lock().outbound.len()
    }

    /// Stall a transmit queue as a FIFO underrun would, raising the error
    /// event. The queue stays stalled until its doorbell is rung again.
    pub fn force_tx_underrun(&self, queue: usize) {
        self.lock().tx_stalled[queue] = true;
        self.raise(self.group_of(queue), Events::UNDERRUN);
    }

    /// Raise an arbitrary error event on a group (bus error injection).
    pub fn force_error(&self, group: usize, events: Events) {
        self.raise(group, events & Events::ERR_ALL);
    }

    /// Make the graceful-stop handshake hang, as the errata'd revisions do.
    pub fn set_halt_stuck(&self, stuck: bool) {
        self.halt_stuck.store(stuck, Ordering::Release);
    }

    /// Change the modeled link speed.
    pub fn set_link_speed(&self, speed: LinkSpeed) {
        let raw = match speed {
            LinkSpeed::Mbps10 => 0,
            LinkSpeed::Mbps100 => 1,
            LinkSpeed::Mbps1000 => 2,
        };
        self.link.store(raw, Ordering::Release);
    }

    /// Last value programmed into a transmit coalescing register.
    #[must_use]
    pub fn tx_coalesce_value(&self, queue: usize) -> u32 {
        self.tx_coalesce[queue].load(Ordering::Acquire)
    }

    /// Last value programmed into a receive coalescing register.
    #[must_use]
    pub fn rx_coalesce_value(&self, queue: usize) -> u32 {
        self.rx_coalesce[queue].load(Ordering::Acquire)
    }

    /// One DMA sweep. Returns the number of frames moved in either
    /// direction.
    pub fn process(&self) -> usize {
        if self.halt_requested.load(Ordering::Acquire) {
            // A stop request parks the engine; in-flight state is frozen.
            if !self.halt_stuck.load(Ordering::Acquire) {
                self.halted.store(true, Ordering::Release);
            }
            return 0;
        }
        if (!self.enabled.load(Ordering::Acquire)) || self.halted.load(Ordering::Acquire) {
            return 0;
        }

        let mut moved = 0;
        moved += self.sweep_tx();
        moved += self.sweep_rx();
        moved
    }

    fn sweep_tx(&self) -> usize {
        let mut state = self.lock();
        let mut moved = 0;

        for queue in 0..MAX_QUEUES {
            if state.tx_stalled[queue] {
                continue;
            }
            loop {
                let Some(slots) = state.tx[queue].slots.clone() else {
                    break;
                };
                let head = state.tx[queue].head;
                let head_status = slots[head].hw_status();
                if !head_status.contains(BdFlags::HW) {
                    break;
                }

                // Collect the frame's descriptor chain up to LAST. The
                // producer publishes the head last, so the tail is always
                // armed by the time we get here.
                let mut chain = Vec::new();
                let mut idx = head;
                loop {
                    let status = slots[idx].hw_status();
                    debug_assert!(status.contains(BdFlags::HW), "chain with unarmed tail");
                    chain.push((idx, status, slots[idx].addr(), slots[idx].len()));
                    if status.contains(BdFlags::LAST) {
                        break;
                    }
                    idx = if status.contains(BdFlags::WRAP) { 0 } else { idx + 1 };
                }

                let mut assembled = Vec::new();
                for &(_, _, addr, len) in &chain {
                    if let Some(bytes) = self.arena.read(BusAddr::from_raw(addr), len as usize) {
                        assembled.extend_from_slice(&bytes);
                    }
                }

                // Strip the offload control block the way the transmitter
                // consumes it, latching a timestamp when asked for one.
                let wire = if chain[0].1.contains(BdFlags::TOE) && assembled.len() >= FCB_LEN {
                    let mut raw = [0u8; FCB_LEN];
                    raw.copy_from_slice(&assembled[..FCB_LEN]);
                    let fcb = TxFcb::decode(&raw);
                    if TxFcbFlags::from_bits_retain(fcb.flags).contains(TxFcbFlags::PTP) {
                        state.tstamp_clock += 1;
                        self.tx_tstamp.store(state.tstamp_clock, Ordering::Release);
                    }
                    assembled[FCB_LEN..].to_vec()
                } else {
                    assembled
                };

                trace!("sim: tx queue {queue} frame of {} bytes", wire.len());
                state.outbound.push_back((queue, wire));
                moved += 1;

                let mut last_status = BdFlags::empty();
                for &(i, status, _, len) in &chain {
                    slots[i].hw_complete(len, status);
                    last_status = status;
                }
                state.tx[queue].head = idx;
                state.tx[queue].advance(last_status);
                self.raise(self.group_of(queue), Events::txf(queue));
            }
        }
        moved
    }

    fn sweep_rx(&self) -> usize {
        let mut state = self.lock();
        let mut moved = 0;

        while let Some(inbound) = state.inbound.pop_front() {
            let queue = inbound.queue;
            let Some(slots) = state.rx[queue].slots.clone() else {
                debug!("sim: rx frame for unprogrammed queue {queue}, dropped");
                continue;
            };
            let head = state.rx[queue].head;
            let status = slots[head].hw_status();
            if !status.contains(BdFlags::HW) {
                // No empty descriptor: the frame is lost and the busy error
                // is raised, exactly as the controller reports starvation.
                debug!("sim: rx queue {queue} starved, frame dropped");
                self.raise(self.group_of(queue), Events::RX_BUSY);
                continue;
            }

            let mut prefix = Vec::new();
            if state.rx_fcb {
                let mut flags = classify_checksums(&inbound.bytes);
                let mut vlan = 0;
                if let Some(tag) = inbound.vlan {
                    flags |= RxFcbFlags::VLN;
                    vlan = tag;
                }
                prefix.extend_from_slice(
                    &RxFcb {
                        flags: flags.bits(),
                        queue: queue as u8,
                        vlan,
                    }
                    .encode(),
                );
            }
            if state.rx_tstamp {
                state.tstamp_clock += 1;
                prefix.extend_from_slice(&state.tstamp_clock.to_be_bytes());
                debug_assert_eq!(prefix.len() % TIMESTAMP_LEN, 0);
            }

            let total = prefix.len() + inbound.bytes.len();
            let addr = BusAddr::from_raw(slots[head].addr());
            let mut written = self.arena.write(addr, &prefix);
            written += self.arena.write(addr.offset(written), &inbound.bytes);

            let mut completion = status
                .difference(BdFlags::HW)
                .union(BdFlags::LAST)
                .union(inbound.status);
            if written < total {
                completion |= BdFlags::TRUNCATED;
            }

            trace!("sim: rx queue {queue} frame of {written} bytes written");
            slots[head].hw_complete((written + FCS_LEN) as u16, completion);
            state.rx[queue].advance(completion);
            self.raise(self.group_of(queue), Events::rxf(queue));
            moved += 1;
        }
        moved
    }
}

/// Validate the checksums of an injected frame the way the receive parser
/// does, producing the control-block verdict bits.
fn classify_checksums(bytes: &[u8]) -> RxFcbFlags {
    let mut flags = RxFcbFlags::empty();
    let Ok(eth) = EthernetFrame::new_checked(bytes) else {
        return flags;
    };
    if eth.ethertype() != EthernetProtocol::Ipv4 {
        return flags;
    }
    let Ok(ip) = Ipv4Packet::new_checked(eth.payload()) else {
        return flags;
    };
    flags |= RxFcbFlags::CIP;
    if !ip.verify_checksum() {
        flags |= RxFcbFlags::EIP;
        return flags;
    }
    let src = ip.src_addr().into();
    let dst = ip.dst_addr().into();
    let l4_start = usize::from(ip.header_len());
    let l4_end = usize::from(ip.total_len()).min(eth.payload().len());
    if l4_end <= l4_start {
        return flags;
    }
    let l4 = &eth.payload()[l4_start..l4_end];
    match ip.next_header() {
        IpProtocol::Tcp => {
            if let Ok(tcp) = TcpPacket::new_checked(l4) {
                flags |= RxFcbFlags::CTU;
                if !tcp.verify_checksum(&src, &dst) {
                    flags |= RxFcbFlags::ETU;
                }
            }
        }
        IpProtocol::Udp => {
            if let Ok(udp) = UdpPacket::new_checked(l4) {
                flags |= RxFcbFlags::CTU;
                if !udp.verify_checksum(&src, &dst) {
                    flags |= RxFcbFlags::ETU;
                }
            }
        }
        _ => {}
    }
    flags
}

/// Sink that retains every delivered frame, for tests and self-tests.
#[derive(Default)]
pub struct CollectSink {
    frames: Arc<Mutex<Vec<crate::frame::Frame>>>,
}

impl CollectSink {
    /// New empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Shared handle to the delivered frames.
    #[must_use]
    pub fn handle(&self) -> Arc<Mutex<Vec<crate::frame::Frame>>> {
        Arc::clone(&self.frames)
    }
}

impl crate::rx::FrameSink for CollectSink {
    fn deliver(&mut self, frame: crate::frame::Frame) -> crate::rx::DeliverVerdict {
        self.frames
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(frame);
        crate::rx::DeliverVerdict::Accepted
    }
}

/// Allocator that refuses after a configurable number of allocations;
/// models memory pressure for the replenish paths.
#[derive(Debug)]
pub struct CountingAllocator {
    remaining: std::sync::atomic::AtomicUsize,
}

impl CountingAllocator {
    /// Allow `budget` allocations, then fail.
    #[must_use]
    pub fn new(budget: usize) -> Self {
        Self {
            remaining: std::sync::atomic::AtomicUsize::new(budget),
        }
    }
}

impl crate::pool::BufferAllocator for CountingAllocator {
    fn allocate_aligned(&self, len: usize) -> Result<Box<[u8]>, crate::err::OutOfMemory> {
        let mut current = self.remaining.load(Ordering::Acquire);
        loop {
            if current == 0 {
                return Err(crate::err::OutOfMemory);
            }
            match self.remaining.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Ok(vec![0u8; len].into_boxed_slice()),
                Err(seen) => current = seen,
            }
        }
    }
}

impl MacRegisters for SimMac {
    fn program_tx_ring(&self, queue: usize, slots: Arc<[Bd]>) {
        let mut state = self.lock();
        state.tx[queue] = DevRing {
            slots: Some(slots),
            head: 0,
        };
    }

    fn program_rx_ring(&self, queue: usize, slots: Arc<[Bd]>) {
        let mut state = self.lock();
        state.rx[queue] = DevRing {
            slots: Some(slots),
            head: 0,
        };
    }

    fn configure_offloads(&self, rx_fcb: bool, rx_timestamp: bool) {
        let mut state = self.lock();
        state.rx_fcb = rx_fcb;
        state.rx_tstamp = rx_timestamp;
    }

    fn kick_tx(&self, queue: usize) {
        // The doorbell clears a stalled queue and resumes polling; the next
        // `process` sweep picks the ring up again.
        self.lock().tx_stalled[queue] = false;
    }

    fn kick_rx(&self, _queue: usize) {}

    fn read_events(&self, group: usize) -> Events {
        Events::from_bits_retain(self.events[group % MAX_GROUPS].load(Ordering::Acquire))
    }

    fn ack_events(&self, group: usize, which: Events) {
        self.events[group % MAX_GROUPS].fetch_and(!which.bits(), Ordering::AcqRel);
    }

    fn set_mask(&self, group: usize, mask: Events) {
        self.masks[group % MAX_GROUPS].store(mask.bits(), Ordering::Release);
    }

    fn current_mask(&self, group: usize) -> Events {
        Events::from_bits_retain(self.masks[group % MAX_GROUPS].load(Ordering::Acquire))
    }

    fn write_tx_coalesce(&self, queue: usize, value: u32) {
        self.tx_coalesce[queue].store(value, Ordering::Release);
    }

    fn write_rx_coalesce(&self, queue: usize, value: u32) {
        self.rx_coalesce[queue].store(value, Ordering::Release);
    }

    fn tx_timestamp(&self) -> u64 {
        self.tx_tstamp.load(Ordering::Acquire)
    }

    fn request_halt(&self) {
        self.halt_requested.store(true, Ordering::Release);
    }

    fn halt_complete(&self) -> bool {
        if self.halt_requested.load(Ordering::Acquire)
            && !self.halt_stuck.load(Ordering::Acquire)
        {
            // Nothing is mid-transfer between sweeps, so a stop request
            // confirms on the next poll.
            self.halted.store(true, Ordering::Release);
        }
        self.halted.load(Ordering::Acquire)
    }

    fn resume(&self) {
        self.halt_requested.store(false, Ordering::Release);
        self.halted.store(false, Ordering::Release);
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    fn rx_idle_heuristic(&self) -> bool {
        // Between sweeps the modeled receiver is always quiescent.
        true
    }

    fn link_speed(&self) -> LinkSpeed {
        match self.link.load(Ordering::Acquire) {
            0 => LinkSpeed::Mbps10,
            1 => LinkSpeed::Mbps100,
            _ => LinkSpeed::Mbps1000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ring::DescRing;

    #[test]
    fn consumes_published_tx_chain_in_order() {
        let arena = Arc::new(DmaArena::new());
        let mac = SimMac::new(Arc::clone(&arena), 1);
        mac.set_enabled(true);

        let ring = DescRing::new(8).expect("ring");
        mac.program_tx_ring(0, ring.slot_base());

        let a = arena.map(b"frame-a".to_vec().into_boxed_slice());
        let b = arena.map(b"frame-b".to_vec().into_boxed_slice());
        ring.arm(0, a.raw(), 7, BdFlags::LAST | BdFlags::INTERRUPT).expect("arm a");
        ring.arm(1, b.raw(), 7, BdFlags::LAST | BdFlags::INTERRUPT).expect("arm b");

        assert_eq!(mac.process(), 2);
        assert_eq!(mac.pop_tx(), Some((0, b"frame-a".to_vec())));
        assert_eq!(mac.pop_tx(), Some((0, b"frame-b".to_vec())));
        assert!(mac.read_events(0).has_txf(0));
        assert!(ring.complete(0).is_some(), "slot released to software");
    }

    #[test]
    fn starved_rx_ring_raises_busy() {
        let arena = Arc::new(DmaArena::new());
        let mac = SimMac::new(Arc::clone(&arena), 1);
        mac.set_enabled(true);

        let ring = DescRing::new(4).expect("ring");
        mac.program_rx_ring(0, ring.slot_base());
        // No EMPTY slots armed.
        mac.inject_rx(0, &[0u8; 64]);
        mac.process();
        assert!(mac.read_events(0).contains(Events::RX_BUSY));
    }

    #[test]
    fn halt_handshake_confirms_unless_stuck() {
        let arena = Arc::new(DmaArena::new());
        let mac = SimMac::new(arena, 1);
        mac.set_enabled(true);

        mac.request_halt();
        assert!(mac.halt_complete());

        mac.resume();
        mac.set_halt_stuck(true);
        mac.request_halt();
        assert!(!mac.halt_complete());
        assert!(mac.rx_idle_heuristic());
    }
}
