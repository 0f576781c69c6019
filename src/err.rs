// Author: Lukas Bower
// Purpose: Error taxonomy for the frame transport core.

use thiserror::Error;

/// Errors surfaced to the transmit caller. Everything here is a
/// resource-exhaustion or precondition problem the caller must react to;
/// per-frame hardware errors never propagate this way, they are counted.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TxError {
    /// Not enough free descriptor slots; the queue has been stopped and the
    /// caller must hold off until a completion wakes it.
    #[error("transmit ring full, queue stopped")]
    Busy,
    /// The frame needs more scatter slots than the hardware supports.
    #[error("frame needs {needed} descriptors, limit is {limit}")]
    TooManySegments { needed: usize, limit: usize },
    /// Frame exceeds the maximum single transmission size and carries no
    /// segmentation hint.
    #[error("frame of {len} bytes exceeds transmit limit {limit}")]
    FrameTooLarge { len: usize, limit: usize },
    /// Referenced queue does not exist.
    #[error("no such transmit queue {0}")]
    BadQueue(usize),
    /// The interface is not running.
    #[error("interface is down")]
    Down,
}

/// Errors raised while constructing or re-arming a descriptor ring.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum RingError {
    #[error("ring capacity {0} is not a power of two")]
    NotPowerOfTwo(usize),
    #[error("ring capacity {got} exceeds maximum {max}")]
    TooLarge { got: usize, max: usize },
    /// A slot the software tried to write was still owned by hardware.
    #[error("descriptor slot {0} is hardware-owned")]
    SlotHardwareOwned(usize),
}

/// Errors from the software segmentation fallback.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SegmentError {
    #[error("frame is not a segmentable TCP/IPv4 packet")]
    NotSegmentable,
    #[error("segment size of zero requested")]
    ZeroMss,
    #[error("frame malformed at offset {0}")]
    Malformed(usize),
}

/// Errors from the halt handshake and reset sequencing.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum HaltError {
    /// Graceful stop did not confirm within the bounded wait and the idle
    /// heuristic was unavailable or negative.
    #[error("graceful stop did not complete")]
    Timeout,
}

/// Configuration validation failures, reported at interface construction.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{name} ring size {got} invalid (power of two, at most {max})")]
    RingSize {
        name: &'static str,
        got: usize,
        max: usize,
    },
    #[error("queue count {got} exceeds maximum {max}")]
    QueueCount { got: usize, max: usize },
    #[error("group count {got} invalid (1..={max})")]
    GroupCount { got: usize, max: usize },
    #[error("receive buffer of {got} bytes cannot hold a {need}-byte frame")]
    BufferTooSmall { got: usize, need: usize },
    #[error("coalescing value out of range: {0}")]
    Coalesce(&'static str),
}

/// Out-of-memory from the external buffer allocator seam.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
#[error("buffer allocator exhausted")]
pub struct OutOfMemory;
