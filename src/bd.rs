// Author: Lukas Bower
// Purpose: Hardware buffer descriptor layout and ownership transitions.

use core::sync::atomic::{AtomicU16, AtomicU64, Ordering};

use bitflags::bitflags;
use static_assertions::const_assert_eq;

bitflags! {
    /// Status word of one buffer descriptor.
    ///
    /// `HW` is the ownership bit: READY on transmit rings, EMPTY on receive
    /// rings. While it is set the slot belongs to the controller and software
    /// must not touch the address or length fields. The low byte doubles as
    /// the receive error report written back by the controller.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct BdFlags: u16 {
        /// Ownership bit (READY / EMPTY depending on ring direction).
        const HW        = 1 << 15;
        /// Last descriptor of the ring; the controller wraps after this slot.
        const WRAP      = 1 << 13;
        /// Raise a completion event when this descriptor finishes.
        const INTERRUPT = 1 << 12;
        /// Final descriptor of a frame.
        const LAST      = 1 << 11;
        /// Append/verify the frame check sequence.
        const CRC       = 1 << 10;
        /// An offload control block precedes the payload.
        const TOE       = 1 << 1;

        /// Receive error: frame longer than the programmed maximum.
        const LARGE     = 1 << 6;
        /// Receive error: frame below the minimum length.
        const SHORT     = 1 << 5;
        /// Receive error: frame length was not a whole number of octets.
        const NONOCTET  = 1 << 4;
        /// Receive error: frame check sequence mismatch.
        const CRC_ERR   = 1 << 2;
        /// Receive error: FIFO overrun while the frame arrived.
        const OVERRUN   = 1 << 7;
        /// Receive error: frame truncated to fit the buffer.
        const TRUNCATED = 1 << 0;
    }
}

impl BdFlags {
    /// Every receive-side error indication.
    pub const RX_ERRORS: BdFlags = BdFlags::LARGE
        .union(BdFlags::SHORT)
        .union(BdFlags::NONOCTET)
        .union(BdFlags::CRC_ERR)
        .union(BdFlags::OVERRUN)
        .union(BdFlags::TRUNCATED);

    /// True when any receive error bit is present.
    #[must_use]
    pub fn has_rx_error(self) -> bool {
        self.intersects(Self::RX_ERRORS)
    }
}

/// One hardware-visible buffer descriptor.
///
/// The fields are atomics so the descriptor area can be shared with the
/// device model without aliasing UB: software publishes a slot by writing
/// `addr`/`len` relaxed and then release-storing `status` with [`BdFlags::HW`]
/// set, and observes completion with an acquire load that sees the bit clear.
/// Nothing reads `addr`/`len` across that boundary without the matching
/// ordering, which is exactly the write-then-barrier-then-flag discipline the
/// controller requires.
#[derive(Debug)]
pub struct Bd {
    addr: AtomicU64,
    len: AtomicU16,
    status: AtomicU16,
}

const_assert_eq!(core::mem::size_of::<Bd>(), 16);

impl Bd {
    /// A zeroed, software-owned descriptor.
    #[must_use]
    pub fn new() -> Self {
        Self {
            addr: AtomicU64::new(0),
            len: AtomicU16::new(0),
            status: AtomicU16::new(0),
        }
    }

    /// Current status flags, acquire-ordered so that a cleared ownership bit
    /// licenses reads of the completion-dependent fields.
    #[must_use]
    pub fn status(&self) -> BdFlags {
        BdFlags::from_bits_retain(self.status.load(Ordering::Acquire))
    }

    /// True when software owns the slot.
    #[must_use]
    pub fn software_owned(&self) -> bool {
        !self.status().contains(BdFlags::HW)
    }

    /// Length field. Only meaningful on the side that currently owns the slot.
    #[must_use]
    pub fn len(&self) -> u16 {
        self.len.load(Ordering::Relaxed)
    }

    /// Bus address field.
    #[must_use]
    pub fn addr(&self) -> u64 {
        self.addr.load(Ordering::Relaxed)
    }

    /// Write the payload fields without publishing ownership. The caller
    /// must follow up with [`Bd::publish`].
    pub(crate) fn stage(&self, addr: u64, len: u16) {
        self.addr.store(addr, Ordering::Relaxed);
        self.len.store(len, Ordering::Relaxed);
    }

    /// Publish a staged descriptor to the controller. The release store is
    /// the barrier between the field writes above and the ownership flag;
    /// the controller side pairs it with an acquire load.
    pub(crate) fn publish(&self, flags: BdFlags) {
        self.status.store(flags.bits(), Ordering::Release);
    }

    /// Rewrite the status word while software owns the slot (cleanup path).
    pub(crate) fn set_status_relaxed(&self, flags: BdFlags) {
        self.status.store(flags.bits(), Ordering::Relaxed);
    }

    // --- device-side accessors -------------------------------------------
    //
    // Used only by the controller model: it acquires the published slot,
    // reads the staged fields, and hands the slot back with a release store
    // of its own.

    /// Device side: observe the status word.
    pub fn hw_status(&self) -> BdFlags {
        BdFlags::from_bits_retain(self.status.load(Ordering::Acquire))
    }

    /// Device side: complete a slot, writing back a length and a status word
    /// with the ownership bit cleared.
    pub fn hw_complete(&self, len: u16, flags: BdFlags) {
        self.len.store(len, Ordering::Relaxed);
        self.status
            .store(flags.difference(BdFlags::HW).bits(), Ordering::Release);
    }
}

impl Default for Bd {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ownership_round_trip() {
        let bd = Bd::new();
        assert!(bd.software_owned());

        bd.stage(0x4000, 128);
        bd.publish(BdFlags::HW | BdFlags::LAST | BdFlags::INTERRUPT);
        assert!(!bd.software_owned());
        assert_eq!(bd.addr(), 0x4000);

        bd.hw_complete(128, BdFlags::LAST | BdFlags::INTERRUPT);
        assert!(bd.software_owned());
        assert_eq!(bd.len(), 128);
    }

    #[test]
    fn rx_error_mask_matches_individual_bits() {
        let status = BdFlags::LAST | BdFlags::CRC_ERR;
        assert!(status.has_rx_error());
        assert!(!(BdFlags::LAST | BdFlags::WRAP).has_rx_error());
    }
}
