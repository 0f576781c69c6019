// Author: Lukas Bower
// Purpose: Receive pipeline: budgeted drain, validation, replenish, delivery.

use log::{error, warn};

use crate::bd::BdFlags;
use crate::coalesce::IcPair;
use crate::config::{EngineConfig, Features};
use crate::dma::{BusAddr, DmaArena};
use crate::frame::{Frame, RxFcb, RxFcbFlags, CsumVerdict, FCB_LEN, FCS_LEN, TIMESTAMP_LEN};
use crate::pool::{BufferAllocator, BufferPool};
use crate::ring::DescRing;
use crate::stats::{EngineStats, QueueStats};

/// Upstream delivery verdict; `Dropped` is counted, never retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliverVerdict {
    /// The stack took ownership of the frame.
    Accepted,
    /// The stack refused the frame.
    Dropped,
}

/// Upstream delivery path for completed receive frames.
pub trait FrameSink: Send {
    /// Hand one frame up the stack. At-most-once: a `Dropped` frame is gone.
    fn deliver(&mut self, frame: Frame) -> DeliverVerdict;
}

/// One receive queue: its ring plus the bus address parked in each slot.
#[derive(Debug)]
pub(crate) struct RxQueue {
    pub ring: DescRing,
    bases: Box<[Option<BusAddr>]>,
    pub coalesce: IcPair,
    pub stats: QueueStats,
}

/// Outcome of one budgeted poll pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct RxPollOutcome {
    /// Descriptors processed (controls rescheduling against the budget).
    pub work: usize,
    /// Frames actually delivered upstream.
    pub delivered: usize,
}

/// Shared references for the receive pipeline.
pub(crate) struct RxContext<'a> {
    pub arena: &'a DmaArena,
    pub pool: &'a BufferPool,
    pub allocator: &'a dyn BufferAllocator,
    pub stats: &'a EngineStats,
    pub config: &'a EngineConfig,
    pub worker: usize,
}

impl RxQueue {
    pub fn new(ring: DescRing, coalesce: IcPair) -> Self {
        let capacity = ring.capacity();
        Self {
            ring,
            bases: (0..capacity).map(|_| None).collect(),
            coalesce,
            stats: QueueStats::default(),
        }
    }

    /// Arm every slot with a fresh buffer. Called at bring-up and after a
    /// reset, never while the controller might touch the ring.
    pub fn fill(&mut self, ctx: &RxContext<'_>) {
        for idx in 0..self.ring.capacity() {
            if self.bases[idx].is_some() {
                continue;
            }
            let Some(buf) = acquire_buffer(ctx) else {
                warn!("rx: ring fill starved at slot {idx}");
                ctx.stats.bump(&ctx.stats.rx_alloc_failed);
                continue;
            };
            let base = ctx.arena.map(buf);
            if !self.ring.reserve(1) {
                // Can't happen on a quiesced ring; keep the buffer.
                if let Some(b) = ctx.arena.unmap(base) {
                    ctx.pool.release(ctx.worker, b);
                }
                break;
            }
            arm_slot(&self.ring, idx, base);
            self.bases[idx] = Some(base);
        }
    }

    /// Unmap and recycle every parked buffer. Only valid once the
    /// controller is halted; this is the teardown half of the cancellation
    /// barrier.
    pub fn release_all(&mut self, ctx: &RxContext<'_>) {
        for slot in self.bases.iter_mut() {
            if let Some(base) = slot.take() {
                if let Some(buf) = ctx.arena.unmap(base) {
                    ctx.pool.release(ctx.worker, buf);
                }
            }
        }
        self.ring.reset();
    }

    /// Buffers currently armed into the ring.
    #[cfg(test)]
    pub fn armed(&self) -> usize {
        self.bases.iter().filter(|b| b.is_some()).count()
    }
}

/// Drain completed descriptors up to `budget`, delivering good frames and
/// recycling everything else. Every processed slot is replenished before the
/// cursor moves on, so the ring never sits unarmed longer than the current
/// iteration.
pub(crate) fn poll(
    ctx: &RxContext<'_>,
    queue_idx: usize,
    q: &mut RxQueue,
    sink: &mut dyn FrameSink,
    budget: usize,
) -> RxPollOutcome {
    let mut out = RxPollOutcome::default();

    while out.work < budget {
        let idx = q.ring.consume_cursor();
        let Some(base) = q.bases[idx] else {
            // Slot lost its buffer to a previous allocation failure; try to
            // re-arm it before anything else.
            if let Some(buf) = acquire_buffer(ctx) {
                let base = ctx.arena.map(buf);
                if q.ring.reserve(1) {
                    arm_slot(&q.ring, idx, base);
                    q.bases[idx] = Some(base);
                    q.ring.advance_consume(1);
                    continue;
                }
                if let Some(b) = ctx.arena.unmap(base) {
                    ctx.pool.release(ctx.worker, b);
                }
            }
            break;
        };
        let Some(mut status) = q.ring.complete(idx) else {
            break;
        };
        out.work += 1;
        q.ring.release_slots(1);

        // Grab the replacement before touching the completed buffer: if
        // allocation fails the old buffer is re-armed and the frame is
        // dropped, which keeps the ring fed under memory pressure.
        let replacement = acquire_buffer(ctx);

        let reported = q.ring.completed_len(idx) as usize;
        let prefix = ctx.config.rx_prefix_len();
        let max_ok = prefix + ctx.config.max_frame_len + FCS_LEN;
        if !status.has_rx_error() && reported > max_ok {
            status |= BdFlags::LARGE;
        }

        let Some(replacement) = replacement else {
            // Memory pressure: drop this frame, keep the ring fed with the
            // old buffer, and move on.
            ctx.stats.bump(&ctx.stats.rx_alloc_failed);
            rearm(ctx, q, idx, base);
            continue;
        };

        if !status.contains(BdFlags::LAST) || status.has_rx_error() {
            count_errors(status, ctx.stats);
            // Recycle the completed buffer straight back into the slot.
            rearm(ctx, q, idx, base);
            ctx.pool.release(ctx.worker, replacement);
            continue;
        }

        let Some(buf) = ctx.arena.unmap(base) else {
            error!("rx queue {queue_idx}: mapping vanished for slot {idx}");
            q.bases[idx] = None;
            q.ring.advance_consume(1);
            ctx.pool.release(ctx.worker, replacement);
            continue;
        };

        // Replenish immediately; only then look at the frame.
        let new_base = ctx.arena.map(replacement);
        rearm(ctx, q, idx, new_base);

        let pkt_len = reported.saturating_sub(FCS_LEN).min(buf.len());
        let mut frame = Frame::from_storage(Vec::from(buf), 0, pkt_len);
        match parse_metadata(ctx, queue_idx, &mut frame) {
            Ok(()) => {}
            Err(()) => {
                // Short on metadata bytes: treat as truncated.
                ctx.stats.bump(&ctx.stats.rx_truncated);
                recycle_frame(ctx, frame);
                continue;
            }
        }

        q.stats.record(frame.len());
        ctx.stats.bump(&ctx.stats.rx_packets);
        ctx.stats.add(&ctx.stats.rx_bytes, frame.len() as u64);

        match sink.deliver(frame) {
            DeliverVerdict::Accepted => out.delivered += 1,
            DeliverVerdict::Dropped => ctx.stats.bump(&ctx.stats.rx_upstream_dropped),
        }
    }

    out
}

fn rearm(ctx: &RxContext<'_>, q: &mut RxQueue, idx: usize, base: BusAddr) {
    if q.ring.reserve(1) {
        arm_slot(&q.ring, idx, base);
        q.bases[idx] = Some(base);
    } else {
        // Accounting says the ring is somehow full; park the buffer instead
        // of leaking the mapping.
        error!("rx: no capacity to re-arm slot {idx}");
        if let Some(buf) = ctx.arena.unmap(base) {
            ctx.pool.release(ctx.worker, buf);
        }
        q.bases[idx] = None;
    }
    q.ring.advance_consume(1);
}

fn arm_slot(ring: &DescRing, idx: usize, base: BusAddr) {
    if let Err(e) = ring.arm(idx, base.raw(), 0, BdFlags::INTERRUPT) {
        error!("rx: arming slot {idx} failed: {e}");
        debug_assert!(false, "armed receive slot while hardware-owned");
    }
}

fn acquire_buffer(ctx: &RxContext<'_>) -> Option<Box<[u8]>> {
    if let Some(buf) = ctx.pool.acquire(ctx.worker) {
        return Some(buf);
    }
    ctx.allocator.allocate_aligned(ctx.pool.buf_len()).ok()
}

fn recycle_frame(ctx: &RxContext<'_>, frame: Frame) {
    let storage = frame.into_storage();
    if storage.len() == ctx.pool.buf_len() {
        ctx.pool.release(ctx.worker, storage.into_boxed_slice());
    }
}

/// Strip and interpret the metadata prefix the controller wrote ahead of the
/// payload: control block first, then the receive timestamp.
fn parse_metadata(ctx: &RxContext<'_>, queue_idx: usize, frame: &mut Frame) -> Result<(), ()> {
    if ctx.config.uses_fcb() {
        if frame.linear_len() < FCB_LEN {
            return Err(());
        }
        let fcb = RxFcb::decode(frame.data()).map_err(|_| ())?;
        let flags = RxFcbFlags::from_bits_retain(fcb.flags);
        if ctx.config.features.contains(Features::RX_CSUM) && flags.csum_verified() {
            frame.meta.csum_verdict = CsumVerdict::Verified;
        } else {
            frame.meta.csum_verdict = CsumVerdict::Unknown;
        }
        if ctx.config.features.contains(Features::VLAN) && flags.contains(RxFcbFlags::VLN) {
            frame.meta.vlan = Some(fcb.vlan);
        }
        frame.pull(FCB_LEN);
    }
    if ctx.config.features.contains(Features::TIMESTAMP) {
        if frame.linear_len() < TIMESTAMP_LEN {
            return Err(());
        }
        let mut raw = [0u8; TIMESTAMP_LEN];
        raw.copy_from_slice(&frame.data()[..TIMESTAMP_LEN]);
        frame.meta.timestamp = Some(u64::from_be_bytes(raw));
        frame.pull(TIMESTAMP_LEN);
    }
    frame.meta.rx_queue = Some(queue_idx);
    Ok(())
}

/// Per-category error accounting. A truncated frame reports nothing else;
/// the remaining bits each feed their own counter.
fn count_errors(status: BdFlags, stats: &EngineStats) {
    if status.contains(BdFlags::TRUNCATED) {
        stats.bump(&stats.rx_truncated);
        return;
    }
    if !status.contains(BdFlags::LAST) {
        // A frame that never saw its LAST descriptor is an overrun in
        // disguise; report it as truncated as the hardware manual directs.
        stats.bump(&stats.rx_truncated);
        return;
    }
    if status.contains(BdFlags::LARGE) {
        stats.bump(&stats.rx_large);
    }
    if status.contains(BdFlags::SHORT) {
        stats.bump(&stats.rx_short);
    }
    if status.contains(BdFlags::NONOCTET) {
        stats.bump(&stats.rx_nonoctet);
    }
    if status.contains(BdFlags::CRC_ERR) {
        stats.bump(&stats.rx_crc_err);
    }
    if status.contains(BdFlags::OVERRUN) {
        stats.bump(&stats.rx_overrun);
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::mac::MacRegisters;
    use crate::pool::HeapAllocator;
    use crate::sim::SimMac;

    struct VecSink(Vec<Frame>);

    impl FrameSink for VecSink {
        fn deliver(&mut self, frame: Frame) -> DeliverVerdict {
            self.0.push(frame);
            DeliverVerdict::Accepted
        }
    }

    struct RefuseSink;

    impl FrameSink for RefuseSink {
        fn deliver(&mut self, _frame: Frame) -> DeliverVerdict {
            DeliverVerdict::Dropped
        }
    }

    struct Harness {
        arena: Arc<DmaArena>,
        mac: Arc<SimMac>,
        pool: BufferPool,
        stats: EngineStats,
        config: EngineConfig,
        allocator: HeapAllocator,
    }

    impl Harness {
        fn new(config: EngineConfig) -> Self {
            let arena = Arc::new(DmaArena::new());
            let mac = Arc::new(SimMac::new(Arc::clone(&arena), 1));
            mac.set_enabled(true);
            mac.configure_offloads(
                config.uses_fcb(),
                config.features.contains(Features::TIMESTAMP),
            );
            Self {
                pool: BufferPool::new(1, config.rx_buffer_len, 16),
                arena,
                mac,
                stats: EngineStats::default(),
                config,
                allocator: HeapAllocator,
            }
        }

        fn ctx(&self) -> RxContext<'_> {
            RxContext {
                arena: &self.arena,
                pool: &self.pool,
                allocator: &self.allocator,
                stats: &self.stats,
                config: &self.config,
                worker: 0,
            }
        }

        fn queue(&self, size: usize) -> RxQueue {
            let ring = DescRing::new(size).expect("ring");
            self.mac.program_rx_ring(0, ring.slot_base());
            let mut q = RxQueue::new(ring, IcPair::disabled());
            q.fill(&self.ctx());
            q
        }
    }

    #[test]
    fn good_frame_is_delivered_and_slot_replenished() {
        let h = Harness::new(EngineConfig::default());
        let mut q = h.queue(8);
        assert_eq!(q.armed(), 8);

        h.mac.inject_rx(0, &[0x42u8; 128]);
        h.mac.process();

        let mut sink = VecSink(Vec::new());
        let out = poll(&h.ctx(), 0, &mut q, &mut sink, 64);
        assert_eq!(out, RxPollOutcome { work: 1, delivered: 1 });
        assert_eq!(sink.0.len(), 1);
        assert_eq!(sink.0[0].data(), &[0x42u8; 128][..]);
        assert_eq!(sink.0[0].meta.rx_queue, Some(0));
        assert_eq!(q.armed(), 8, "slot must be re-armed");
        assert_eq!(h.stats.snapshot().rx_packets, 1);
    }

    #[test]
    fn crc_error_is_counted_dropped_and_replenished() {
        let h = Harness::new(EngineConfig::default());
        let mut q = h.queue(8);

        h.mac
            .inject_rx_with_status(0, &[0u8; 64], BdFlags::CRC_ERR, None);
        h.mac.process();

        let mut sink = VecSink(Vec::new());
        let out = poll(&h.ctx(), 0, &mut q, &mut sink, 64);
        assert_eq!(out.delivered, 0);
        assert_eq!(out.work, 1);
        assert!(sink.0.is_empty(), "corrupt frame must not go upstream");
        assert_eq!(h.stats.snapshot().rx_crc_err, 1);
        assert_eq!(q.armed(), 8);

        // The ring keeps flowing afterwards.
        h.mac.inject_rx(0, &[1u8; 64]);
        h.mac.process();
        let out = poll(&h.ctx(), 0, &mut q, &mut sink, 64);
        assert_eq!(out.delivered, 1);
    }

    #[test]
    fn budget_bounds_the_drain() {
        let h = Harness::new(EngineConfig::default());
        let mut q = h.queue(8);

        for _ in 0..5 {
            h.mac.inject_rx(0, &[7u8; 60]);
        }
        h.mac.process();

        let mut sink = VecSink(Vec::new());
        let out = poll(&h.ctx(), 0, &mut q, &mut sink, 3);
        assert_eq!(out.work, 3);
        let out = poll(&h.ctx(), 0, &mut q, &mut sink, 3);
        assert_eq!(out.work, 2, "remainder drained on the next pass");
        assert_eq!(sink.0.len(), 5);
    }

    #[test]
    fn upstream_drop_is_counted_not_retried() {
        let h = Harness::new(EngineConfig::default());
        let mut q = h.queue(4);

        h.mac.inject_rx(0, &[9u8; 80]);
        h.mac.process();

        let mut sink = RefuseSink;
        let out = poll(&h.ctx(), 0, &mut q, &mut sink, 16);
        assert_eq!(out.work, 1);
        assert_eq!(out.delivered, 0);
        assert_eq!(h.stats.snapshot().rx_upstream_dropped, 1);
        // The frame is gone; polling again finds nothing.
        let out = poll(&h.ctx(), 0, &mut q, &mut sink, 16);
        assert_eq!(out.work, 0);
    }

    #[test]
    fn vlan_and_checksum_metadata_are_extracted() {
        let h = Harness::new(EngineConfig::default());
        let mut q = h.queue(4);

        let wire = crate::tso::tests::tcp_frame(b"metadata", false);
        h.mac
            .inject_rx_with_status(0, &wire, BdFlags::empty(), Some(0x123));
        h.mac.process();

        let mut sink = VecSink(Vec::new());
        poll(&h.ctx(), 0, &mut q, &mut sink, 16);
        let frame = &sink.0[0];
        assert_eq!(frame.meta.vlan, Some(0x123));
        assert_eq!(frame.meta.csum_verdict, CsumVerdict::Verified);
        assert_eq!(frame.data(), &wire[..]);
    }

    #[test]
    fn corrupt_checksum_yields_unknown_verdict() {
        let h = Harness::new(EngineConfig::default());
        let mut q = h.queue(4);

        let mut wire = crate::tso::tests::tcp_frame(b"metadata", false);
        wire[40] ^= 0xff;
        h.mac.inject_rx(0, &wire);
        h.mac.process();

        let mut sink = VecSink(Vec::new());
        poll(&h.ctx(), 0, &mut q, &mut sink, 16);
        assert_eq!(sink.0[0].meta.csum_verdict, CsumVerdict::Unknown);
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut config = EngineConfig::default();
        config.max_frame_len = 256;
        config.rx_buffer_len = 512;
        let h = Harness::new(config);
        let mut q = h.queue(4);

        h.mac.inject_rx(0, &[1u8; 400]);
        h.mac.process();

        let mut sink = VecSink(Vec::new());
        let out = poll(&h.ctx(), 0, &mut q, &mut sink, 16);
        assert_eq!(out.delivered, 0);
        assert_eq!(h.stats.snapshot().rx_large, 1);
        assert_eq!(q.armed(), 4);
    }
}
