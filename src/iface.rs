// Author: Lukas Bower
// Purpose: Interface assembly: queues, groups, lifecycle, and the poll loop.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use log::{debug, error, info, warn};

use crate::coalesce::IcPair;
use crate::config::{EngineConfig, Features};
use crate::dma::DmaArena;
use crate::err::{ConfigError, TxError};
use crate::frame::Frame;
use crate::mac::{Events, MacRegisters};
use crate::pool::{BufferAllocator, BufferPool, HeapAllocator, PoolCounters};
use crate::reset::{graceful_halt, DevState, Watchdog};
use crate::ring::DescRing;
use crate::rx::{self, FrameSink, RxContext, RxQueue};
use crate::sched::{split_budget, Direction, GroupState, PollScheduler, PollTask, RX_POLL_WEIGHT, TX_POLL_WEIGHT};
use crate::stats::{EngineStats, EngineStatsSnapshot};
use crate::tx::{self, TxContext, TxQueue};

/// The frame-transport interface: descriptor rings, buffer recycling,
/// interrupt-group scheduling, and the error/reset controller, wired to a
/// [`MacRegisters`] device and an upstream [`FrameSink`].
///
/// Two execution contexts touch each queue: the submission side
/// ([`EtsecIface::transmit`], serialized per queue) and the poll side
/// ([`EtsecIface::service`]). Backpressure is explicit: a `Busy` submission
/// stops the queue and the reclaim path wakes it.
pub struct EtsecIface {
    config: EngineConfig,
    mac: Arc<dyn MacRegisters>,
    arena: Arc<DmaArena>,
    pool: BufferPool,
    allocator: Box<dyn BufferAllocator>,
    sink: Mutex<Box<dyn FrameSink>>,
    tx_queues: Vec<Mutex<TxQueue>>,
    rx_queues: Vec<Mutex<RxQueue>>,
    groups: Vec<Mutex<GroupState>>,
    sched: PollScheduler,
    state: Mutex<DevState>,
    stats: EngineStats,
    watchdog: Mutex<Watchdog>,
    reclaimed_total: AtomicU64,
    bus_error_logged: AtomicBool,
}

impl EtsecIface {
    /// Build an interface from a validated configuration. The device starts
    /// [`DevState::Down`]; call [`EtsecIface::up`] to bring it online.
    pub fn new(
        config: EngineConfig,
        mac: Arc<dyn MacRegisters>,
        arena: Arc<DmaArena>,
        sink: Box<dyn FrameSink>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;

        let mut tx_queues = Vec::with_capacity(config.tx_queues);
        for _ in 0..config.tx_queues {
            let ring = DescRing::new(config.tx_ring_size)
                .map_err(|_| ConfigError::RingSize {
                    name: "transmit",
                    got: config.tx_ring_size,
                    max: crate::ring::MAX_RING_SIZE,
                })?;
            tx_queues.push(Mutex::new(TxQueue::new(ring, config.tx_coalesce)));
        }
        let mut rx_queues = Vec::with_capacity(config.rx_queues);
        for _ in 0..config.rx_queues {
            let ring = DescRing::new(config.rx_ring_size)
                .map_err(|_| ConfigError::RingSize {
                    name: "receive",
                    got: config.rx_ring_size,
                    max: crate::ring::MAX_RING_SIZE,
                })?;
            rx_queues.push(Mutex::new(RxQueue::new(ring, config.rx_coalesce)));
        }

        // Queues fan out over the interrupt groups round-robin, the same
        // fixed assignment the hardware's group registers encode.
        let mut groups: Vec<GroupState> = (0..config.groups).map(|_| GroupState::default()).collect();
        for q in 0..config.tx_queues {
            groups[q % config.groups].tx_queues.push(q);
        }
        for q in 0..config.rx_queues {
            groups[q % config.groups].rx_queues.push(q);
        }

        let pool = BufferPool::new(config.groups, config.rx_buffer_len, config.pool_local_cap);

        Ok(Self {
            config,
            mac,
            arena,
            pool,
            allocator: Box::new(HeapAllocator),
            sink: Mutex::new(sink),
            tx_queues,
            rx_queues,
            groups: groups.into_iter().map(Mutex::new).collect(),
            sched: PollScheduler::default(),
            state: Mutex::new(DevState::Down),
            stats: EngineStats::default(),
            watchdog: Mutex::new(Watchdog::default()),
            reclaimed_total: AtomicU64::new(0),
            bus_error_logged: AtomicBool::new(false),
        })
    }

    /// Replace the fallback buffer allocator (tests use this to model
    /// memory pressure).
    #[must_use]
    pub fn with_allocator(mut self, allocator: Box<dyn BufferAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> DevState {
        *self.guard(&self.state)
    }

    /// Bring the interface up: program rings and offloads, fill the receive
    /// rings, unmask interrupts, and start DMA.
    pub fn up(&self) {
        {
            let mut state = self.guard(&self.state);
            if *state != DevState::Down {
                return;
            }
            *state = DevState::Reinitializing;
        }
        self.program_and_start();
        *self.guard(&self.state) = DevState::Running;
        info!("interface up: {} tx / {} rx queues", self.config.tx_queues, self.config.rx_queues);
    }

    /// Take the interface down: stop submissions, drain what completed,
    /// halt DMA (the cancellation barrier), then release every buffer.
    pub fn down(&self) {
        {
            let mut state = self.guard(&self.state);
            if *state == DevState::Down {
                return;
            }
            *state = DevState::Halting;
        }
        self.stop_queues();

        // Bounded drain of already-completed frames before the halt.
        for _ in 0..self.config.halt_poll_attempts {
            let mut remaining = 0;
            for (i, q) in self.tx_queues.iter().enumerate() {
                let mut q = self.guard(q);
                let ctx = self.tx_ctx(i % self.config.groups);
                let n = tx::reclaim(&ctx, &mut q, usize::MAX);
                self.note_reclaimed(n);
                remaining += q.in_flight;
            }
            if remaining == 0 {
                break;
            }
        }

        self.halt_hardware();
        *self.guard(&self.state) = DevState::Halted;
        self.release_everything();
        *self.guard(&self.state) = DevState::Down;
        info!("interface down");
    }

    /// Submit a frame on `queue`. See the module docs for the backpressure
    /// contract around [`TxError::Busy`].
    pub fn transmit(&self, queue: usize, frame: Frame) -> Result<(), TxError> {
        if self.state() != DevState::Running {
            return Err(TxError::Down);
        }
        if queue >= self.tx_queues.len() {
            return Err(TxError::BadQueue(queue));
        }
        let mut q = self.guard(&self.tx_queues[queue]);
        let ctx = self.tx_ctx(queue % self.config.groups);
        tx::transmit(&ctx, queue, &mut q, frame)
    }

    /// Whether a transmit queue is currently stopped by backpressure.
    #[must_use]
    pub fn queue_stopped(&self, queue: usize) -> bool {
        self.guard(&self.tx_queues[queue]).stopped
    }

    /// Total frames in flight across every transmit queue.
    #[must_use]
    pub fn tx_in_flight(&self) -> usize {
        self.tx_queues.iter().map(|q| self.guard(q).in_flight).sum()
    }

    /// Hardware timestamp of the most recent timestamped frame on `queue`.
    #[must_use]
    pub fn last_tx_timestamp(&self, queue: usize) -> Option<u64> {
        self.guard(&self.tx_queues[queue]).last_timestamp
    }

    /// Dispatch one interrupt group: acknowledge its events, route errors,
    /// and schedule poll work with that direction's interrupts masked.
    pub fn on_interrupt(&self, group: usize) {
        let mask = self.mac.current_mask(group);
        let events = self.mac.read_events(group) & mask;
        if events.is_empty() {
            return;
        }
        self.mac.ack_events(group, events);

        let errors = events & Events::ERR_ALL;
        if !errors.is_empty() {
            self.handle_errors(group, errors);
        }
        let rx = events & Events::RX_ALL;
        if !rx.is_empty() {
            self.schedule_poll(group, Direction::Rx, rx);
        }
        let tx = events & Events::TX_ALL;
        if !tx.is_empty() {
            self.schedule_poll(group, Direction::Tx, tx);
        }
    }

    /// Check every group for unmasked pending events and dispatch them.
    /// Returns true when anything was dispatched.
    pub fn poll_interrupts(&self) -> bool {
        let mut any = false;
        for group in 0..self.groups.len() {
            let pending = self.mac.read_events(group) & self.mac.current_mask(group);
            if !pending.is_empty() {
                any = true;
                self.on_interrupt(group);
            }
        }
        any
    }

    /// Run one scheduled poll task. Returns false when no work was queued.
    pub fn service(&self) -> bool {
        let Some(task) = self.sched.pop() else {
            return false;
        };
        match task.dir {
            Direction::Rx => self.service_rx(task.group),
            Direction::Tx => self.service_tx(task.group),
        }
        true
    }

    /// Drain the task queue, interleaving interrupt checks, for at most
    /// `max_passes` tasks. Returns how many tasks ran.
    pub fn service_all(&self, max_passes: usize) -> usize {
        let mut ran = 0;
        while ran < max_passes {
            self.poll_interrupts();
            if !self.service() {
                break;
            }
            ran += 1;
        }
        ran
    }

    /// Account the transmit watchdog. `now_ms` comes from the caller's
    /// clock; when frames sit in flight a full interval with no completion
    /// progress, the full reset path runs.
    pub fn watchdog_tick(&self, now_ms: u64) {
        if self.state() != DevState::Running {
            return;
        }
        let in_flight = self.tx_in_flight();
        let completions = self.reclaimed_total.load(Ordering::Relaxed);
        let expired = self.guard(&self.watchdog).tick(
            now_ms,
            in_flight,
            completions,
            self.config.watchdog_timeout_ms,
        );
        if expired {
            warn!("transmit watchdog expired with {in_flight} frames in flight");
            self.stats.bump(&self.stats.tx_timeouts);
            self.reset();
        }
    }

    /// Full recovery cycle: halt, drop in-flight state, rebuild the rings,
    /// restart. In-flight frames are discarded, never redelivered.
    pub fn reset(&self) {
        {
            let mut state = self.guard(&self.state);
            if *state != DevState::Running {
                return;
            }
            *state = DevState::Halting;
        }
        self.stop_queues();
        self.halt_hardware();
        *self.guard(&self.state) = DevState::Halted;

        *self.guard(&self.state) = DevState::Reinitializing;
        self.release_everything();
        self.guard(&self.watchdog).disarm();
        self.program_and_start();

        *self.guard(&self.state) = DevState::Running;
        self.stats.bump(&self.stats.resets);
        info!("interface reset complete");
    }

    /// Reprogram both directions' coalescing registers; call after a link
    /// speed change, since the tick length depends on it.
    pub fn refresh_link(&self) {
        self.program_coalescing();
    }

    /// Set a transmit queue's coalescing pair.
    pub fn set_tx_coalesce(&self, queue: usize, pair: IcPair) -> Result<(), ConfigError> {
        pair.validate()?;
        self.guard(&self.tx_queues[queue]).coalesce = pair;
        self.mac
            .write_tx_coalesce(queue, pair.register_value(self.mac.link_speed()));
        Ok(())
    }

    /// Set a receive queue's coalescing pair.
    pub fn set_rx_coalesce(&self, queue: usize, pair: IcPair) -> Result<(), ConfigError> {
        pair.validate()?;
        self.guard(&self.rx_queues[queue]).coalesce = pair;
        self.mac
            .write_rx_coalesce(queue, pair.register_value(self.mac.link_speed()));
        Ok(())
    }

    /// A transmit queue's configured coalescing pair.
    #[must_use]
    pub fn tx_coalesce(&self, queue: usize) -> IcPair {
        self.guard(&self.tx_queues[queue]).coalesce
    }

    /// A receive queue's configured coalescing pair.
    #[must_use]
    pub fn rx_coalesce(&self, queue: usize) -> IcPair {
        self.guard(&self.rx_queues[queue]).coalesce
    }

    /// Interface-wide counter snapshot.
    #[must_use]
    pub fn stats(&self) -> EngineStatsSnapshot {
        self.stats.snapshot()
    }

    /// Buffer recycler counters.
    #[must_use]
    pub fn pool_counters(&self) -> PoolCounters {
        self.pool.counters()
    }

    /// (packets, bytes) through a transmit queue.
    #[must_use]
    pub fn tx_queue_stats(&self, queue: usize) -> (u64, u64) {
        self.guard(&self.tx_queues[queue]).stats.snapshot()
    }

    /// (packets, bytes) through a receive queue.
    #[must_use]
    pub fn rx_queue_stats(&self, queue: usize) -> (u64, u64) {
        self.guard(&self.rx_queues[queue]).stats.snapshot()
    }

    /// Free descriptor slots on a transmit queue.
    #[must_use]
    pub fn tx_free_slots(&self, queue: usize) -> usize {
        self.guard(&self.tx_queues[queue]).ring.free()
    }

    // --- internals -------------------------------------------------------

    fn tx_ctx(&self, worker: usize) -> TxContext<'_> {
        TxContext {
            arena: &self.arena,
            pool: &self.pool,
            stats: &self.stats,
            config: &self.config,
            mac: self.mac.as_ref(),
            worker,
        }
    }

    fn rx_ctx(&self, worker: usize) -> RxContext<'_> {
        RxContext {
            arena: &self.arena,
            pool: &self.pool,
            allocator: self.allocator.as_ref(),
            stats: &self.stats,
            config: &self.config,
            worker,
        }
    }

    fn guard<'a, T>(&self, m: &'a Mutex<T>) -> MutexGuard<'a, T> {
        m.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn stop_queues(&self) {
        for q in &self.tx_queues {
            self.guard(q).stopped = true;
        }
    }

    fn halt_hardware(&self) {
        for group in 0..self.groups.len() {
            self.mac.set_mask(group, Events::empty());
        }
        if let Err(e) = graceful_halt(
            self.mac.as_ref(),
            &self.config.errata,
            self.config.halt_poll_attempts,
        ) {
            warn!("graceful stop failed ({e}); forcing disable");
        }
        self.mac.set_enabled(false);
    }

    /// Drop every in-flight mapping and parked receive buffer. Only called
    /// with the hardware halted; the halt handshake is what makes touching
    /// these buffers safe at all.
    fn release_everything(&self) {
        for q in &self.tx_queues {
            self.guard(q).release_all(&self.arena);
        }
        for (i, q) in self.rx_queues.iter().enumerate() {
            let ctx = self.rx_ctx(i % self.config.groups);
            let mut q = self.guard(q);
            q.release_all(&ctx);
        }
        self.sched.clear();
        for g in &self.groups {
            let mut g = self.guard(g);
            g.pending_rx = Events::empty();
            g.pending_tx = Events::empty();
            g.rx_scheduled = false;
            g.tx_scheduled = false;
        }
        for group in 0..self.groups.len() {
            let stale = self.mac.read_events(group);
            self.mac.ack_events(group, stale);
        }
    }

    fn program_and_start(&self) {
        for (i, q) in self.tx_queues.iter().enumerate() {
            let mut q = self.guard(q);
            q.stopped = false;
            self.mac.program_tx_ring(i, q.ring.slot_base());
        }
        for (i, q) in self.rx_queues.iter().enumerate() {
            let ctx = self.rx_ctx(i % self.config.groups);
            let mut q = self.guard(q);
            q.fill(&ctx);
            self.mac.program_rx_ring(i, q.ring.slot_base());
        }
        self.mac.configure_offloads(
            self.config.uses_fcb(),
            self.config.features.contains(Features::TIMESTAMP),
        );
        self.program_coalescing();
        self.mac.resume();
        self.mac.set_enabled(true);
        for group in 0..self.groups.len() {
            self.mac
                .set_mask(group, Events::RX_ALL | Events::TX_ALL | Events::ERR_ALL);
        }
        for q in 0..self.tx_queues.len() {
            self.mac.kick_tx(q);
        }
        for q in 0..self.rx_queues.len() {
            self.mac.kick_rx(q);
        }
    }

    fn program_coalescing(&self) {
        let speed = self.mac.link_speed();
        for (i, q) in self.tx_queues.iter().enumerate() {
            let pair = self.guard(q).coalesce;
            self.mac.write_tx_coalesce(i, pair.register_value(speed));
        }
        for (i, q) in self.rx_queues.iter().enumerate() {
            let pair = self.guard(q).coalesce;
            self.mac.write_rx_coalesce(i, pair.register_value(speed));
        }
    }

    fn note_reclaimed(&self, frames: usize) {
        if frames > 0 {
            self.reclaimed_total
                .fetch_add(frames as u64, Ordering::Relaxed);
        }
    }

    fn schedule_poll(&self, group: usize, dir: Direction, bits: Events) {
        let mut guard = self.guard(&self.groups[group]);
        let g = &mut *guard;
        let (pending, scheduled, mask_off) = match dir {
            Direction::Rx => (&mut g.pending_rx, &mut g.rx_scheduled, Events::RX_ALL),
            Direction::Tx => (&mut g.pending_tx, &mut g.tx_scheduled, Events::TX_ALL),
        };
        *pending |= bits;
        if !*scheduled {
            *scheduled = true;
            // Mask this direction until the poll pass completes; the poll
            // either re-arms it or re-enqueues itself.
            let mask = self.mac.current_mask(group);
            self.mac.set_mask(group, mask.difference(mask_off));
            self.sched.push(PollTask { group, dir });
        }
    }

    fn service_rx(&self, group: usize) {
        let (pending, queues) = {
            let g = self.guard(&self.groups[group]);
            (g.pending_rx, g.rx_queues.clone())
        };
        let active = queues.iter().filter(|q| pending.has_rxf(**q)).count();
        let per_queue = split_budget(RX_POLL_WEIGHT, active);
        let mut done = true;

        for &queue in &queues {
            if !pending.has_rxf(queue) {
                continue;
            }
            let outcome = {
                let ctx = self.rx_ctx(group);
                let mut q = self.guard(&self.rx_queues[queue]);
                let mut sink = self.guard(&self.sink);
                rx::poll(&ctx, queue, &mut q, &mut **sink, per_queue)
            };
            if outcome.work >= per_queue {
                // Budget exhausted with possibly more waiting.
                done = false;
            } else {
                self.guard(&self.groups[group]).pending_rx &= !Events::rxf(queue);
                // Resume descriptor polling in case the queue halted while
                // it was starved.
                self.mac.kick_rx(queue);
            }
        }

        if !done {
            // Cooperative yield: interrupts stay masked, the task goes back
            // on the queue so other groups get a turn.
            self.sched.push(PollTask { group, dir: Direction::Rx });
            return;
        }

        self.guard(&self.groups[group]).rx_scheduled = false;
        self.program_coalescing();
        let mask = self.mac.current_mask(group);
        self.mac.set_mask(group, mask | Events::RX_ALL);

        // Completion/re-arm race: events that landed after the final poll
        // but before the unmask would otherwise wait for a new interrupt
        // edge that never comes. Take them now and go around again.
        let raced = self.mac.read_events(group) & Events::RX_ALL;
        if !raced.is_empty() {
            debug!("group {group}: rx events raced re-arm, rescheduling");
            self.mac.ack_events(group, raced);
            self.schedule_poll(group, Direction::Rx, raced);
        }
    }

    fn service_tx(&self, group: usize) {
        let (pending, queues) = {
            let g = self.guard(&self.groups[group]);
            (g.pending_tx, g.tx_queues.clone())
        };
        let active = queues.iter().filter(|q| pending.has_txf(**q)).count();
        let per_queue = split_budget(TX_POLL_WEIGHT, active);
        let mut done = true;

        for &queue in &queues {
            if !pending.has_txf(queue) {
                continue;
            }
            let reclaimed = {
                let ctx = self.tx_ctx(group);
                let mut q = self.guard(&self.tx_queues[queue]);
                tx::reclaim(&ctx, &mut q, per_queue)
            };
            self.note_reclaimed(reclaimed);
            if reclaimed >= per_queue {
                done = false;
            } else {
                self.guard(&self.groups[group]).pending_tx &= !Events::txf(queue);
            }
        }

        if !done {
            self.sched.push(PollTask { group, dir: Direction::Tx });
            return;
        }

        self.guard(&self.groups[group]).tx_scheduled = false;
        self.program_coalescing();
        let mask = self.mac.current_mask(group);
        self.mac.set_mask(group, mask | Events::TX_ALL);

        let raced = self.mac.read_events(group) & Events::TX_ALL;
        if !raced.is_empty() {
            debug!("group {group}: tx completions raced re-arm, rescheduling");
            self.mac.ack_events(group, raced);
            self.schedule_poll(group, Direction::Tx, raced);
        }
    }

    /// Error-event policy: underruns re-kick the stalled queue (cheap
    /// recovery), receive starvation re-kicks and repolls, babble is
    /// counted, and bus errors are counted and logged prominently exactly
    /// once. None of these halt the device on their own.
    fn handle_errors(&self, group: usize, errors: Events) {
        if errors.contains(Events::UNDERRUN) {
            self.stats.bump(&self.stats.tx_underrun);
            let queues = self.guard(&self.groups[group]).tx_queues.clone();
            for q in queues {
                self.mac.kick_tx(q);
            }
            debug!("group {group}: tx underrun, queues re-kicked");
        }
        if errors.contains(Events::RX_BUSY) {
            self.stats.bump(&self.stats.rx_busy);
            let queues = self.guard(&self.groups[group]).rx_queues.clone();
            let mut bits = Events::empty();
            for &q in &queues {
                self.mac.kick_rx(q);
                bits |= Events::rxf(q);
            }
            // Drain whatever is sitting in the rings so slots free up.
            self.schedule_poll(group, Direction::Rx, bits);
        }
        if errors.contains(Events::BABR) {
            self.stats.bump(&self.stats.rx_babr);
        }
        if errors.contains(Events::BABT) {
            self.stats.bump(&self.stats.tx_babt);
        }
        if errors.contains(Events::BUS_ERR) {
            self.stats.bump(&self.stats.bus_errors);
            if !self.bus_error_logged.swap(true, Ordering::AcqRel) {
                error!("system bus error during DMA; counting and continuing");
            } else {
                debug!("further system bus error");
            }
        }
    }
}
