// Author: Lukas Bower
// Purpose: Runtime configuration and hardware capability flags.

use crate::coalesce::IcPair;
use crate::err::ConfigError;
use crate::frame::{FCB_LEN, FCS_LEN, TIMESTAMP_LEN};
use crate::mac::{MAX_GROUPS, MAX_QUEUES};
use crate::ring::MAX_RING_SIZE;

/// Largest frame the transmit path accepts in one piece.
pub const JUMBO_FRAME_SIZE: usize = 9_600;
/// Default receive buffer size (standard frame plus alignment slack).
pub const DEFAULT_RX_BUFFER_LEN: usize = 1_536;
/// Default number of scatter segments the hardware will chain per frame.
pub const DEFAULT_MAX_SEGMENTS: usize = 18;
/// Checksummed frames above this length stall affected revisions; see
/// [`Errata::csum_stall_large_frame`].
pub const CSUM_STALL_THRESHOLD: usize = 2_500;

bitflags::bitflags! {
    /// Offload features negotiated at interface construction.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Features: u32 {
        /// Insert transmit checksums in hardware.
        const TX_CSUM = 1 << 0;
        /// Validate receive checksums in hardware.
        const RX_CSUM = 1 << 1;
        /// Insert/extract VLAN tags.
        const VLAN = 1 << 2;
        /// Hardware timestamping on both paths.
        const TIMESTAMP = 1 << 3;
    }
}

/// Per-revision hardware quirks, probed once at bring-up and checked with
/// ordinary branches.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Errata {
    /// Graceful stop may never confirm; fall back to the receive-idle
    /// register heuristic after the bounded wait.
    pub stuck_halt_idle_check: bool,
    /// Checksummed frames longer than [`CSUM_STALL_THRESHOLD`] see excess
    /// transmission delay; resolve their checksums in software instead.
    pub csum_stall_large_frame: bool,
    /// A control block starting in the last 8 bytes of a 32-byte cache line
    /// is consumed corrupted; skip checksum insertion for such frames.
    pub unaligned_fcb: bool,
}

/// Interface-wide configuration. Queue and group counts are fixed here;
/// nothing resizes at runtime.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Transmit queue count.
    pub tx_queues: usize,
    /// Receive queue count.
    pub rx_queues: usize,
    /// Interrupt group count; queues are distributed round-robin.
    pub groups: usize,
    /// Transmit ring depth (power of two).
    pub tx_ring_size: usize,
    /// Receive ring depth (power of two).
    pub rx_ring_size: usize,
    /// Size of pool receive buffers.
    pub rx_buffer_len: usize,
    /// Largest acceptable received frame (longer frames are counted and
    /// dropped).
    pub max_frame_len: usize,
    /// Scatter-segment limit per transmitted frame.
    pub max_tx_segments: usize,
    /// Enabled offloads.
    pub features: Features,
    /// Revision quirks.
    pub errata: Errata,
    /// Transmit watchdog interval in milliseconds.
    pub watchdog_timeout_ms: u64,
    /// Initial transmit coalescing for every queue.
    pub tx_coalesce: IcPair,
    /// Initial receive coalescing for every queue.
    pub rx_coalesce: IcPair,
    /// Buffers parked per worker list in the recycler.
    pub pool_local_cap: usize,
    /// Bounded attempts when polling the graceful-stop handshake.
    pub halt_poll_attempts: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            tx_queues: 1,
            rx_queues: 1,
            groups: 1,
            tx_ring_size: 64,
            rx_ring_size: 64,
            rx_buffer_len: DEFAULT_RX_BUFFER_LEN,
            max_frame_len: 1_518,
            max_tx_segments: DEFAULT_MAX_SEGMENTS,
            features: Features::TX_CSUM | Features::RX_CSUM | Features::VLAN,
            errata: Errata::default(),
            watchdog_timeout_ms: 2_000,
            tx_coalesce: IcPair::disabled(),
            rx_coalesce: IcPair::disabled(),
            pool_local_cap: 64,
            halt_poll_attempts: 1_000,
        }
    }
}

impl EngineConfig {
    /// Whether transmitted/received frames carry the offload control block.
    #[must_use]
    pub fn uses_fcb(&self) -> bool {
        self.features
            .intersects(Features::TX_CSUM | Features::RX_CSUM | Features::VLAN | Features::TIMESTAMP)
    }

    /// Receive-side bytes consumed by metadata ahead of the payload.
    #[must_use]
    pub fn rx_prefix_len(&self) -> usize {
        let mut len = 0;
        if self.uses_fcb() {
            len += FCB_LEN;
        }
        if self.features.contains(Features::TIMESTAMP) {
            len += TIMESTAMP_LEN;
        }
        len
    }

    /// Validate every field against hardware limits.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, size) in [
            ("transmit", self.tx_ring_size),
            ("receive", self.rx_ring_size),
        ] {
            if !size.is_power_of_two() || size == 0 || size > MAX_RING_SIZE {
                return Err(ConfigError::RingSize {
                    name,
                    got: size,
                    max: MAX_RING_SIZE,
                });
            }
        }
        for count in [self.tx_queues, self.rx_queues] {
            if count == 0 || count > MAX_QUEUES {
                return Err(ConfigError::QueueCount {
                    got: count,
                    max: MAX_QUEUES,
                });
            }
        }
        if self.groups == 0 || self.groups > MAX_GROUPS {
            return Err(ConfigError::GroupCount {
                got: self.groups,
                max: MAX_GROUPS,
            });
        }
        let need = self.max_frame_len + self.rx_prefix_len() + FCS_LEN;
        if self.rx_buffer_len < need {
            return Err(ConfigError::BufferTooSmall {
                got: self.rx_buffer_len,
                need,
            });
        }
        self.tx_coalesce.validate()?;
        self.rx_coalesce.validate()?;
        Ok(())
    }
}
