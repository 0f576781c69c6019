// CLASSIFICATION: COMMUNITY
// Filename: lib.rs v0.9
// Author: Lukas Bower
// Date Modified: 2027-01-22

//! Frame-transport core for eTSEC-class gigabit MACs.
//!
//! The crate implements the descriptor-ring engine such a controller is
//! driven by: fixed rings of hardware-shared buffer descriptors with
//! explicit ownership transfer, a two-tier buffer recycler, transmit and
//! receive pipelines with checksum/VLAN/timestamp offload metadata and a
//! software TCP segmentation fallback, budget-bounded multi-queue poll
//! scheduling with interrupt coalescing, and a watchdog-driven error/reset
//! controller. The hardware itself sits behind the [`mac::MacRegisters`]
//! seam; [`sim::SimMac`] models it faithfully enough to run the whole engine
//! hermetically.

/// Buffer descriptor layout and ownership flags.
pub mod bd;
/// Interrupt coalescing parameters and tick conversion.
pub mod coalesce;
/// Runtime configuration and hardware capability flags.
pub mod config;
/// DMA mapping arena shared with the device.
pub mod dma;
/// Error taxonomy.
pub mod err;
/// Frame container and offload control blocks.
pub mod frame;
/// Interface assembly and lifecycle.
pub mod iface;
/// Register-level device seam.
pub mod mac;
/// Two-tier receive buffer recycler.
pub mod pool;
/// Lifecycle state machine and halt handshake.
pub mod reset;
/// Descriptor ring engine.
pub mod ring;
/// Receive pipeline.
pub mod rx;
mod sched;
/// Software MAC model for hermetic operation.
pub mod sim;
/// Statistics counters.
pub mod stats;
/// Software segmentation fallback.
pub mod tso;
/// Transmit pipeline.
pub mod tx;

pub use coalesce::{IcPair, LinkSpeed};
pub use config::{EngineConfig, Errata, Features};
pub use err::{ConfigError, HaltError, OutOfMemory, RingError, SegmentError, TxError};
pub use frame::{CsumVerdict, Frame, FrameMeta};
pub use iface::EtsecIface;
pub use mac::{Events, MacRegisters};
pub use pool::{BufferAllocator, HeapAllocator};
pub use reset::DevState;
pub use rx::{DeliverVerdict, FrameSink};
pub use sim::SimMac;
