// Author: Lukas Bower
// Purpose: Fixed-capacity descriptor ring with ownership-transfer discipline.

use std::sync::Arc;

use crate::bd::{Bd, BdFlags};
use crate::err::RingError;

/// Largest ring the controller accepts.
pub const MAX_RING_SIZE: usize = 256;
/// Default ring depth for both directions.
pub const DEFAULT_RING_SIZE: usize = 256;

/// Circular array of hardware-visible descriptors plus the software
/// bookkeeping that goes with it: a produce cursor (next slot to arm), a
/// consume cursor (next slot to reclaim) and a free count.
///
/// Capacity is a power of two so index arithmetic stays mask-based; the
/// controller itself never does index arithmetic, it follows the explicit
/// [`BdFlags::WRAP`] marker on the physically last slot. Every status write
/// issued here re-asserts that marker.
///
/// All ownership transitions go through [`DescRing::stage`] /
/// [`DescRing::arm`] / [`DescRing::publish`] / [`DescRing::complete`]; no
/// other path may touch a slot, which is what keeps the "software never
/// writes a hardware-owned descriptor" invariant checkable.
#[derive(Debug)]
pub struct DescRing {
    slots: Arc<[Bd]>,
    mask: usize,
    produce: usize,
    consume: usize,
    free: usize,
}

impl DescRing {
    /// Allocate a ring of `capacity` descriptors, all software-owned.
    pub fn new(capacity: usize) -> Result<Self, RingError> {
        if !capacity.is_power_of_two() || capacity == 0 {
            return Err(RingError::NotPowerOfTwo(capacity));
        }
        if capacity > MAX_RING_SIZE {
            return Err(RingError::TooLarge {
                got: capacity,
                max: MAX_RING_SIZE,
            });
        }
        let slots: Arc<[Bd]> = (0..capacity).map(|_| Bd::new()).collect();
        let mut ring = Self {
            slots,
            mask: capacity - 1,
            produce: 0,
            consume: 0,
            free: capacity,
        };
        ring.reset();
        Ok(ring)
    }

    /// Ring capacity.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Slots currently available to produce into.
    #[must_use]
    pub fn free(&self) -> usize {
        self.free
    }

    /// Next slot the producer will arm.
    #[must_use]
    pub fn produce_cursor(&self) -> usize {
        self.produce
    }

    /// Next slot the consumer will reclaim.
    #[must_use]
    pub fn consume_cursor(&self) -> usize {
        self.consume
    }

    /// Shared handle to the descriptor area, for programming into the
    /// controller as the ring base.
    #[must_use]
    pub fn slot_base(&self) -> Arc<[Bd]> {
        Arc::clone(&self.slots)
    }

    /// Advance an index with wrap.
    #[must_use]
    pub fn next(&self, index: usize) -> usize {
        (index + 1) & self.mask
    }

    /// Advance an index by `n` slots with wrap.
    #[must_use]
    pub fn index_add(&self, index: usize, n: usize) -> usize {
        (index + n) & self.mask
    }

    /// Reserve `n` slots ahead of arming them. Fails without side effects
    /// when fewer than `n` are free.
    pub fn reserve(&mut self, n: usize) -> bool {
        if self.free < n {
            return false;
        }
        self.free -= n;
        true
    }

    /// Give reclaimed slots back to the producer.
    pub fn release_slots(&mut self, n: usize) {
        self.free += n;
        debug_assert!(self.free <= self.capacity());
    }

    /// Move the produce cursor past `n` armed slots.
    pub fn advance_produce(&mut self, n: usize) {
        self.produce = (self.produce + n) & self.mask;
    }

    /// Move the consume cursor past `n` reclaimed slots.
    pub fn advance_consume(&mut self, n: usize) {
        self.consume = (self.consume + n) & self.mask;
    }

    /// Write a descriptor's payload fields without granting ownership. The
    /// slot stays software-owned until [`DescRing::publish`].
    pub fn stage(
        &self,
        index: usize,
        addr: u64,
        len: u16,
        flags: BdFlags,
    ) -> Result<(), RingError> {
        let bd = self.slot(index)?;
        bd.stage(addr, len);
        bd.set_status_relaxed(self.with_wrap(index, flags.difference(BdFlags::HW)));
        Ok(())
    }

    /// Write and immediately publish a descriptor to the controller.
    pub fn arm(&self, index: usize, addr: u64, len: u16, flags: BdFlags) -> Result<(), RingError> {
        let bd = self.slot(index)?;
        bd.stage(addr, len);
        bd.publish(self.with_wrap(index, flags | BdFlags::HW));
        Ok(())
    }

    /// Publish a previously staged descriptor. This is the producer-side
    /// barrier: every other slot of the frame must already be armed, so the
    /// controller cannot race past this slot into an unarmed tail.
    pub fn publish(&self, index: usize, flags: BdFlags) -> Result<(), RingError> {
        let bd = self.slot(index)?;
        bd.publish(self.with_wrap(index, flags | BdFlags::HW));
        Ok(())
    }

    /// Poll a slot for completion. Returns the written-back status only once
    /// the controller has released ownership.
    #[must_use]
    pub fn complete(&self, index: usize) -> Option<BdFlags> {
        let bd = &self.slots[index & self.mask];
        let status = bd.status();
        if status.contains(BdFlags::HW) {
            None
        } else {
            Some(status)
        }
    }

    /// Length written back into a completed slot.
    #[must_use]
    pub fn completed_len(&self, index: usize) -> u16 {
        self.slots[index & self.mask].len()
    }

    /// Address field of a slot (software-owned slots only).
    #[must_use]
    pub fn slot_addr(&self, index: usize) -> u64 {
        self.slots[index & self.mask].addr()
    }

    /// Scrub a reclaimed slot back to its idle state.
    pub fn clear(&self, index: usize) {
        let bd = &self.slots[index & self.mask];
        debug_assert!(bd.software_owned(), "clearing a hardware-owned slot");
        bd.stage(0, 0);
        bd.set_status_relaxed(self.with_wrap(index, BdFlags::empty()));
    }

    /// Reinitialise the whole ring: cursors to zero, every slot
    /// software-owned and scrubbed, free count restored to capacity.
    pub fn reset(&mut self) {
        for i in 0..self.capacity() {
            let bd = &self.slots[i];
            bd.stage(0, 0);
            bd.set_status_relaxed(self.with_wrap(i, BdFlags::empty()));
        }
        self.produce = 0;
        self.consume = 0;
        self.free = self.capacity();
    }

    /// Count of slots the controller currently owns. Linear scan, meant for
    /// invariant checks and teardown accounting rather than the hot path.
    #[must_use]
    pub fn hardware_owned(&self) -> usize {
        self.slots
            .iter()
            .filter(|bd| !bd.software_owned())
            .count()
    }

    fn slot(&self, index: usize) -> Result<&Bd, RingError> {
        let bd = &self.slots[index & self.mask];
        if !bd.software_owned() {
            return Err(RingError::SlotHardwareOwned(index & self.mask));
        }
        Ok(bd)
    }

    fn with_wrap(&self, index: usize, flags: BdFlags) -> BdFlags {
        if index & self.mask == self.mask {
            flags | BdFlags::WRAP
        } else {
            flags
        }
    }
}
