// Author: Lukas Bower
// Purpose: Register-level seam between the transport core and the MAC device.

use std::sync::Arc;

use bitflags::bitflags;

use crate::bd::Bd;
use crate::coalesce::LinkSpeed;

/// Maximum queues per direction the register file exposes.
pub const MAX_QUEUES: usize = 8;
/// Maximum interrupt groups.
pub const MAX_GROUPS: usize = 2;

bitflags! {
    /// Event (interrupt cause) word of one interrupt group. The low two
    /// bytes carry per-queue receive/transmit completion bits; the rest are
    /// error causes.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Events: u32 {
        /// Any receive completion bit.
        const RX_ALL = 0x0000_00ff;
        /// Any transmit completion bit.
        const TX_ALL = 0x0000_ff00;
        /// Babbling receive: a frame ran past the maximum length.
        const BABR = 1 << 16;
        /// Babbling transmit.
        const BABT = 1 << 17;
        /// Transmit FIFO underrun; the affected queue's DMA has stalled.
        const UNDERRUN = 1 << 18;
        /// System bus error during a DMA transaction.
        const BUS_ERR = 1 << 19;
        /// Receive stalled for lack of an empty descriptor.
        const RX_BUSY = 1 << 20;
        /// Every error cause.
        const ERR_ALL = Self::BABR.bits()
            | Self::BABT.bits()
            | Self::UNDERRUN.bits()
            | Self::BUS_ERR.bits()
            | Self::RX_BUSY.bits();
    }
}

impl Events {
    /// Receive completion bit for a queue.
    #[must_use]
    pub fn rxf(queue: usize) -> Events {
        Events::from_bits_retain(1 << (queue & (MAX_QUEUES - 1)))
    }

    /// Transmit completion bit for a queue.
    #[must_use]
    pub fn txf(queue: usize) -> Events {
        Events::from_bits_retain(1 << (MAX_QUEUES + (queue & (MAX_QUEUES - 1))))
    }

    /// True when this word carries the receive bit for `queue`.
    #[must_use]
    pub fn has_rxf(self, queue: usize) -> bool {
        self.intersects(Self::rxf(queue))
    }

    /// True when this word carries the transmit bit for `queue`.
    #[must_use]
    pub fn has_txf(self, queue: usize) -> bool {
        self.intersects(Self::txf(queue))
    }
}

/// Everything the transport core needs from the MAC, expressed as the
/// register operations the real part exposes: ring base programming, a
/// doorbell per queue and direction, event/mask words per interrupt group,
/// coalescing registers, and the graceful-stop handshake.
///
/// Implementations must be callable from both the submission context and the
/// poll context concurrently.
pub trait MacRegisters: Send + Sync {
    /// Program a transmit ring's base for `queue`.
    fn program_tx_ring(&self, queue: usize, slots: Arc<[Bd]>);
    /// Program a receive ring's base for `queue`.
    fn program_rx_ring(&self, queue: usize, slots: Arc<[Bd]>);
    /// Tell the controller which metadata it must prepend to received
    /// frames.
    fn configure_offloads(&self, rx_fcb: bool, rx_timestamp: bool);

    /// Ring the transmit doorbell: resume descriptor polling on `queue`.
    fn kick_tx(&self, queue: usize);
    /// Ring the receive doorbell: resume descriptor polling on `queue`.
    fn kick_rx(&self, queue: usize);

    /// Read a group's pending event word without clearing it.
    fn read_events(&self, group: usize) -> Events;
    /// Acknowledge (clear) the given event bits; write-one-to-clear, so
    /// events raised after the read are preserved.
    fn ack_events(&self, group: usize, which: Events);
    /// Program which events may raise the group's interrupt line.
    fn set_mask(&self, group: usize, mask: Events);
    /// Currently programmed mask.
    fn current_mask(&self, group: usize) -> Events;

    /// Program a queue's transmit coalescing register.
    fn write_tx_coalesce(&self, queue: usize, value: u32);
    /// Program a queue's receive coalescing register.
    fn write_rx_coalesce(&self, queue: usize, value: u32);

    /// Timestamp latched for the most recent timestamped transmission.
    fn tx_timestamp(&self) -> u64;

    /// Request a graceful stop of both DMA directions.
    fn request_halt(&self);
    /// Whether the graceful stop has been confirmed.
    fn halt_complete(&self) -> bool;
    /// Clear the stop request and resume DMA polling.
    fn resume(&self);
    /// Enable or disable the MAC transmit/receive paths entirely.
    fn set_enabled(&self, enabled: bool);
    /// Erratum fallback: compare the receive datapath state registers and
    /// report whether the receiver looks idle despite an unconfirmed stop.
    fn rx_idle_heuristic(&self) -> bool;

    /// Current negotiated link speed.
    fn link_speed(&self) -> LinkSpeed;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_bits_do_not_collide() {
        for q in 0..MAX_QUEUES {
            assert!(Events::RX_ALL.contains(Events::rxf(q)));
            assert!(Events::TX_ALL.contains(Events::txf(q)));
            assert!(!Events::rxf(q).intersects(Events::TX_ALL));
            assert!(!Events::ERR_ALL.intersects(Events::rxf(q) | Events::txf(q)));
        }
    }
}
