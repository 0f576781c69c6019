// Author: Lukas Bower
// Purpose: Transmit pipeline: descriptor mapping, offload metadata, reclaim.

use log::{error, warn};

use crate::bd::BdFlags;
use crate::coalesce::IcPair;
use crate::config::{EngineConfig, Features, CSUM_STALL_THRESHOLD, JUMBO_FRAME_SIZE};
use crate::dma::{BusAddr, DmaArena};
use crate::err::TxError;
use crate::frame::{Frame, TxFcb, TxFcbFlags, FCB_LEN};
use crate::mac::MacRegisters;
use crate::pool::BufferPool;
use crate::ring::DescRing;
use crate::stats::{EngineStats, QueueStats};
use crate::tso;

/// Bookkeeping for one in-flight transmitted frame, indexed by the ring slot
/// of its head descriptor.
#[derive(Debug)]
struct TxPending {
    slots: usize,
    head_base: BusAddr,
    frag_bases: Vec<BusAddr>,
    timestamp_req: bool,
}

/// One transmit queue: its ring, the per-slot pending array, and the
/// stop/wake backpressure flag.
#[derive(Debug)]
pub(crate) struct TxQueue {
    pub ring: DescRing,
    pending: Box<[Option<TxPending>]>,
    pub stopped: bool,
    pub in_flight: usize,
    pub coalesce: IcPair,
    pub stats: QueueStats,
    pub last_timestamp: Option<u64>,
}

impl TxQueue {
    pub fn new(ring: DescRing, coalesce: IcPair) -> Self {
        let capacity = ring.capacity();
        Self {
            ring,
            pending: (0..capacity).map(|_| None).collect(),
            stopped: false,
            in_flight: 0,
            coalesce,
            stats: QueueStats::default(),
            last_timestamp: None,
        }
    }

    /// Forget every in-flight frame, dropping buffers back out of the DMA
    /// arena. Only valid once the controller is halted.
    pub fn release_all(&mut self, arena: &DmaArena) {
        for slot in self.pending.iter_mut() {
            if let Some(p) = slot.take() {
                arena.unmap(p.head_base);
                for base in p.frag_bases {
                    arena.unmap(base);
                }
            }
        }
        self.in_flight = 0;
        self.stopped = false;
        self.ring.reset();
    }
}

/// Shared references the pipeline functions need.
pub(crate) struct TxContext<'a> {
    pub arena: &'a DmaArena,
    pub pool: &'a BufferPool,
    pub stats: &'a EngineStats,
    pub config: &'a EngineConfig,
    pub mac: &'a dyn MacRegisters,
    pub worker: usize,
}

/// Map a frame onto descriptor slots and hand it to the controller.
///
/// Backpressure contract: `Err(Busy)` stops the queue; the caller must not
/// submit again until a completion wakes it. All per-frame metadata work
/// happens before any slot is touched so a refused frame leaves no trace.
pub(crate) fn transmit(
    ctx: &TxContext<'_>,
    queue_idx: usize,
    q: &mut TxQueue,
    mut frame: Frame,
) -> Result<(), TxError> {
    // Affected revisions stall on long checksummed frames; resolve those in
    // software before they reach the inserter.
    if frame.meta.csum_offload
        && ctx.config.errata.csum_stall_large_frame
        && frame.len() > CSUM_STALL_THRESHOLD
    {
        software_checksum(&mut frame);
    }
    if frame.meta.csum_offload && !ctx.config.features.contains(Features::TX_CSUM) {
        software_checksum(&mut frame);
    }
    // Affected revisions consume a control block corrupted when it starts in
    // the last 8 bytes of a 32-byte cache line; checksum in software rather
    // than insert one there.
    if frame.meta.csum_offload
        && ctx.config.errata.unaligned_fcb
        && frame.headroom() >= FCB_LEN
        && (frame.headroom() - FCB_LEN) % 0x20 > 0x18
    {
        software_checksum(&mut frame);
    }

    // Oversized TCP frames fall back to software segmentation, except when a
    // hardware timestamp is wanted: the timestamp belongs to one frame, not
    // a burst of segments.
    if let Some(mss) = frame.meta.gso_mss {
        if !frame.meta.timestamp_req {
            return transmit_segmented(ctx, queue_idx, q, &frame, mss);
        }
    }
    if frame.len() > JUMBO_FRAME_SIZE {
        return Err(TxError::FrameTooLarge {
            len: frame.len(),
            limit: JUMBO_FRAME_SIZE,
        });
    }

    let timestamp_req =
        frame.meta.timestamp_req && ctx.config.features.contains(Features::TIMESTAMP);
    let wants_vlan = frame.meta.vlan.is_some() && ctx.config.features.contains(Features::VLAN);
    let needs_fcb = frame.meta.csum_offload || wants_vlan || timestamp_req;

    // The control block is prefixed to the frame, so there must be headroom
    // for it; grow the buffer when the caller left none.
    if needs_fcb && frame.headroom() < FCB_LEN {
        frame.expand_headroom(FCB_LEN);
        ctx.stats.bump(&ctx.stats.tx_headroom_realloc);
    }

    if needs_fcb {
        let mut fcb = TxFcb::default();
        let mut flags = TxFcbFlags::empty();
        if frame.meta.csum_offload {
            match tso::parse_tx_offsets(frame.data()) {
                Some(offs) => {
                    flags |= TxFcbFlags::IP | TxFcbFlags::TUP;
                    if offs.udp {
                        flags |= TxFcbFlags::UDP;
                    }
                    fcb.l3_off = offs.l3_off;
                    fcb.l4_off = offs.l4_off;
                    fcb.pseudo_csum = offs.transport_csum;
                }
                None => {
                    // Not a checksummable protocol: the inserter cannot help.
                    software_checksum(&mut frame);
                }
            }
        }
        if let Some(tag) = frame.meta.vlan.filter(|_| wants_vlan) {
            flags |= TxFcbFlags::VLN;
            fcb.vlan = tag;
        }
        if timestamp_req {
            flags |= TxFcbFlags::PTP;
        }
        fcb.flags = flags.bits();
        frame.push(FCB_LEN).copy_from_slice(&fcb.encode());
    }

    let nr_frags = frame.fragments().len();
    let nr_slots = 1 + nr_frags + usize::from(timestamp_req);
    if nr_slots > ctx.config.max_tx_segments {
        return Err(TxError::TooManySegments {
            needed: nr_slots,
            limit: ctx.config.max_tx_segments,
        });
    }

    if !q.ring.reserve(nr_slots) {
        // No space: stop the queue and let the reclaim path wake it.
        q.stopped = true;
        ctx.stats.bump(&ctx.stats.tx_fifo_full);
        return Err(TxError::Busy);
    }

    q.stats.record(frame.len());
    ctx.stats.bump(&ctx.stats.tx_packets);
    ctx.stats.add(&ctx.stats.tx_bytes, frame.len() as u64);

    let head_off = frame.head_offset();
    let linear_len = frame.linear_len();
    let frags = frame.take_fragments();
    let storage = frame.into_storage();
    let head_base = ctx.arena.map(storage.into_boxed_slice());
    let head_addr = head_base.offset(head_off);

    let head_idx = q.ring.produce_cursor();
    let fcb_flag = if needs_fcb { BdFlags::TOE } else { BdFlags::empty() };
    let last_mark = BdFlags::LAST | BdFlags::INTERRUPT;
    let mut frag_bases = Vec::with_capacity(nr_frags);

    // Arm every descriptor after the head first; the head's ready bit is
    // published last so the controller can never chase into an unarmed tail.
    let mut idx = head_idx;
    if timestamp_req {
        // Head slot carries only the control block; the payload follows in
        // its own descriptor out of the same mapping.
        idx = q.ring.next(idx);
        let data_flags = BdFlags::CRC | if nr_frags == 0 { last_mark } else { BdFlags::empty() };
        arm_or_log(
            &q.ring,
            idx,
            head_addr.offset(FCB_LEN).raw(),
            (linear_len - FCB_LEN) as u16,
            data_flags,
        );
    }
    for (i, frag) in frags.into_iter().enumerate() {
        idx = q.ring.next(idx);
        let len = frag.len() as u16;
        let base = ctx.arena.map(frag);
        let mut flags = BdFlags::CRC;
        if i == nr_frags - 1 {
            flags |= last_mark;
        }
        arm_or_log(&q.ring, idx, base.raw(), len, flags);
        frag_bases.push(base);
    }

    // Head descriptor: staged, then published with the ready bit.
    let mut head_flags = BdFlags::CRC | fcb_flag;
    let head_len = if timestamp_req {
        FCB_LEN
    } else {
        if nr_frags == 0 {
            head_flags |= last_mark;
        }
        linear_len
    };
    if let Err(e) = q.ring.stage(head_idx, head_addr.raw(), head_len as u16, head_flags) {
        error!("tx queue {queue_idx}: stage failed: {e}");
    }
    if let Err(e) = q.ring.publish(head_idx, head_flags) {
        error!("tx queue {queue_idx}: publish failed: {e}");
    }

    q.pending[head_idx] = Some(TxPending {
        slots: nr_slots,
        head_base,
        frag_bases,
        timestamp_req,
    });
    q.in_flight += 1;
    q.ring.advance_produce(nr_slots);

    if q.ring.free() == 0 {
        // The very next submission would fail; stop the queue now.
        q.stopped = true;
        ctx.stats.bump(&ctx.stats.tx_fifo_full);
    }

    // Doorbell: resume descriptor polling.
    ctx.mac.kick_tx(queue_idx);
    Ok(())
}

/// Software segmentation path: split, then feed each segment through the
/// ordinary transmit flow. A mid-sequence `Busy` discards the remaining
/// segments; partial delivery of a segment burst is never retried.
fn transmit_segmented(
    ctx: &TxContext<'_>,
    queue_idx: usize,
    q: &mut TxQueue,
    frame: &Frame,
    mss: usize,
) -> Result<(), TxError> {
    let segs = match tso::segment(frame, mss) {
        Ok(segs) => segs,
        Err(e) => {
            warn!("tx queue {queue_idx}: segmentation failed ({e}), frame dropped");
            return Err(TxError::FrameTooLarge {
                len: frame.len(),
                limit: JUMBO_FRAME_SIZE,
            });
        }
    };
    let total = segs.len();
    for (i, seg) in segs.into_iter().enumerate() {
        if transmit(ctx, queue_idx, q, seg).is_err() {
            let discarded = (total - i) as u64;
            ctx.stats.add(&ctx.stats.tso_discards, discarded);
            warn!(
                "tx queue {queue_idx}: ring filled mid-segmentation, {discarded} segments dropped"
            );
            break;
        }
        ctx.stats.bump(&ctx.stats.tso_segments);
    }
    Ok(())
}

/// Reclaim completed frames from the consume cursor, strictly in submission
/// order, up to `budget` frames. Returns how many frames were reclaimed and
/// wakes the queue if it was stopped and slots freed up.
pub(crate) fn reclaim(ctx: &TxContext<'_>, q: &mut TxQueue, budget: usize) -> usize {
    let mut howmany = 0;

    while howmany < budget {
        let dirty = q.ring.consume_cursor();
        let Some(pending) = q.pending[dirty].as_ref() else {
            break;
        };
        // Only whole frames are reclaimed: the frame is done when its final
        // descriptor has been handed back.
        let last_idx = q.ring.index_add(dirty, pending.slots - 1);
        if q.ring.complete(last_idx).is_none() {
            break;
        }
        let Some(pending) = q.pending[dirty].take() else {
            break;
        };

        if pending.timestamp_req {
            q.last_timestamp = Some(ctx.mac.tx_timestamp());
        }

        // Unmap every buffer of the frame. Linear storage that still has the
        // recycler's size goes back to the pool instead of the allocator.
        if let Some(storage) = ctx.arena.unmap(pending.head_base) {
            if storage.len() == ctx.pool.buf_len() {
                ctx.pool.release(ctx.worker, storage);
            }
        } else {
            error!("tx reclaim: missing mapping for slot {dirty}");
        }
        for base in pending.frag_bases {
            ctx.arena.unmap(base);
        }

        let mut idx = dirty;
        for _ in 0..pending.slots {
            q.ring.clear(idx);
            idx = q.ring.next(idx);
        }
        q.ring.advance_consume(pending.slots);
        q.ring.release_slots(pending.slots);
        q.in_flight -= 1;
        howmany += 1;
    }

    // Freed slots lift the backpressure.
    if q.stopped && q.ring.free() > 0 {
        q.stopped = false;
        ctx.stats.bump(&ctx.stats.queue_wakes);
    }

    howmany
}

fn software_checksum(frame: &mut Frame) {
    if let Err(e) = tso::resolve_checksums(frame) {
        warn!("tx: software checksum fallback failed: {e}");
    }
    frame.meta.csum_offload = false;
}

fn arm_or_log(ring: &DescRing, idx: usize, addr: u64, len: u16, flags: BdFlags) {
    if let Err(e) = ring.arm(idx, addr, len, flags) {
        error!("tx: arming slot {idx} failed: {e}");
        debug_assert!(false, "armed slot while hardware-owned");
    }
}
