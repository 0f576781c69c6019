// Author: Lukas Bower
// Purpose: Frame container with headroom, scatter fragments, and offload metadata.

use crate::err::SegmentError;

/// Length of the offload control block prepended to frames that request
/// checksum, VLAN, or timestamp handling.
pub const FCB_LEN: usize = 8;
/// Length of the receive timestamp inserted after the control block.
pub const TIMESTAMP_LEN: usize = 8;
/// Trailing frame check sequence the controller reports in receive lengths.
pub const FCS_LEN: usize = 4;
/// Ethernet header length.
pub const ETH_HLEN: usize = 14;
/// Minimum valid frame length on the wire.
pub const MIN_FRAME_LEN: usize = 64;
/// Default headroom reserved in front of freshly built frames so metadata
/// insertion does not force a reallocation.
pub const DEFAULT_HEADROOM: usize = 16;

/// Checksum verdict attached to received frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CsumVerdict {
    /// The controller validated both the IP and transport checksums.
    Verified,
    /// Upstream must verify; the hardware made no claim.
    #[default]
    Unknown,
}

/// Offload metadata travelling with a frame in either direction.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameMeta {
    /// Transmit: ask the controller to insert the transport checksum.
    pub csum_offload: bool,
    /// Receive: hardware checksum validation result.
    pub csum_verdict: CsumVerdict,
    /// VLAN tag to insert (transmit) or extracted tag (receive).
    pub vlan: Option<u16>,
    /// Transmit: request a hardware timestamp for this frame.
    pub timestamp_req: bool,
    /// Timestamp captured by the controller, in device clock units.
    pub timestamp: Option<u64>,
    /// Transmit: segment the frame in software to this payload size before
    /// handing it to the ring (set by callers for oversized TCP frames).
    pub gso_mss: Option<usize>,
    /// Receive queue the frame arrived on.
    pub rx_queue: Option<usize>,
}

/// A network frame: one linear region with adjustable headroom plus zero or
/// more owned scatter fragments. The linear storage keeps its full allocated
/// length so buffers sized for the receive pool stay recyclable after a trip
/// through the transmit path.
#[derive(Debug, Default)]
pub struct Frame {
    storage: Vec<u8>,
    head: usize,
    len: usize,
    frags: Vec<Box<[u8]>>,
    /// Offload metadata.
    pub meta: FrameMeta,
}

impl Frame {
    /// Build a frame around `payload` with `headroom` bytes reserved in
    /// front of it.
    #[must_use]
    pub fn with_headroom(headroom: usize, payload: &[u8]) -> Self {
        let mut storage = vec![0u8; headroom + payload.len()];
        storage[headroom..].copy_from_slice(payload);
        Self {
            storage,
            head: headroom,
            len: payload.len(),
            frags: Vec::new(),
            meta: FrameMeta::default(),
        }
    }

    /// Build a frame from an existing buffer, with the data window covering
    /// `[head, head + len)`. Used by the receive path to wrap a pool buffer
    /// without copying.
    pub(crate) fn from_storage(storage: Vec<u8>, head: usize, len: usize) -> Self {
        debug_assert!(head + len <= storage.len());
        Self {
            storage,
            head,
            len,
            frags: Vec::new(),
            meta: FrameMeta::default(),
        }
    }

    /// Linear data of the frame (excluding fragments).
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.storage[self.head..self.head + self.len]
    }

    /// Mutable linear data.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.storage[self.head..self.head + self.len]
    }

    /// Total frame length across the linear region and all fragments.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len + self.frags.iter().map(|f| f.len()).sum::<usize>()
    }

    /// True when the frame carries no bytes at all.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length of the linear region only.
    #[must_use]
    pub fn linear_len(&self) -> usize {
        self.len
    }

    /// Bytes available in front of the data window.
    #[must_use]
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Scatter fragments following the linear region.
    #[must_use]
    pub fn fragments(&self) -> &[Box<[u8]>] {
        &self.frags
    }

    /// Append an owned fragment.
    pub fn push_fragment(&mut self, frag: Box<[u8]>) {
        self.frags.push(frag);
    }

    /// Detach every fragment, leaving the linear region in place.
    pub(crate) fn take_fragments(&mut self) -> Vec<Box<[u8]>> {
        std::mem::take(&mut self.frags)
    }

    /// Grow the data window backwards by `n` bytes and return the newly
    /// exposed prefix. Callers must check [`Frame::headroom`] first.
    pub fn push(&mut self, n: usize) -> &mut [u8] {
        assert!(self.head >= n, "push beyond available headroom");
        self.head -= n;
        self.len += n;
        &mut self.storage[self.head..self.head + n]
    }

    /// Shrink the data window from the front by `n` bytes.
    pub fn pull(&mut self, n: usize) {
        assert!(self.len >= n, "pull beyond frame length");
        self.head += n;
        self.len -= n;
    }

    /// Trim the data window to `n` bytes.
    pub fn truncate(&mut self, n: usize) {
        if n < self.len {
            self.len = n;
        }
    }

    /// Reallocate the linear storage with at least `headroom` bytes in
    /// front, copying the current data. Fragments are untouched.
    pub fn expand_headroom(&mut self, headroom: usize) {
        let mut storage = vec![0u8; headroom + self.len];
        storage[headroom..].copy_from_slice(self.data());
        self.storage = storage;
        self.head = headroom;
    }

    /// Flatten linear data plus fragments into one contiguous vector.
    #[must_use]
    pub fn to_contiguous(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.len());
        out.extend_from_slice(self.data());
        for frag in &self.frags {
            out.extend_from_slice(frag);
        }
        out
    }

    /// Take the linear storage out of the frame, e.g. to recycle it.
    pub(crate) fn into_storage(self) -> Vec<u8> {
        self.storage
    }

    /// Full allocated size of the linear storage.
    #[must_use]
    pub fn storage_len(&self) -> usize {
        self.storage.len()
    }

    /// Offset of the data window inside the linear storage.
    pub(crate) fn head_offset(&self) -> usize {
        self.head
    }
}

bitflags::bitflags! {
    /// Flag byte of the transmit control block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TxFcbFlags: u8 {
        /// Insert the IP header checksum.
        const IP   = 1 << 7;
        /// Insert the transport (TCP/UDP) checksum.
        const TUP  = 1 << 6;
        /// Transport protocol is UDP rather than TCP.
        const UDP  = 1 << 5;
        /// Insert the VLAN tag from the `vlan` field.
        const VLN  = 1 << 4;
        /// Capture a transmit timestamp for this frame.
        const PTP  = 1 << 0;
    }
}

/// Transmit offload control block, 8 bytes on the wire ahead of the frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TxFcb {
    /// Requested offloads.
    pub flags: u8,
    /// Offset from the end of the control block to the IP header.
    pub l3_off: u8,
    /// Length of the IP header (offset from L3 to L4).
    pub l4_off: u8,
    /// Pseudo-header checksum seed for the transport checksum.
    pub pseudo_csum: u16,
    /// VLAN tag to insert when `VLN` is set.
    pub vlan: u16,
}

impl TxFcb {
    /// Serialise into the 8-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; FCB_LEN] {
        let mut out = [0u8; FCB_LEN];
        out[0] = self.flags;
        out[1] = self.l3_off;
        out[2] = self.l4_off;
        out[4..6].copy_from_slice(&self.pseudo_csum.to_be_bytes());
        out[6..8].copy_from_slice(&self.vlan.to_be_bytes());
        out
    }

    /// Parse the wire form.
    #[must_use]
    pub fn decode(raw: &[u8; FCB_LEN]) -> Self {
        Self {
            flags: raw[0],
            l3_off: raw[1],
            l4_off: raw[2],
            pseudo_csum: u16::from_be_bytes([raw[4], raw[5]]),
            vlan: u16::from_be_bytes([raw[6], raw[7]]),
        }
    }
}

bitflags::bitflags! {
    /// Flag word of the receive control block.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RxFcbFlags: u16 {
        /// VLAN tag was extracted into the `vlan` field.
        const VLN = 1 << 15;
        /// IP header was recognised.
        const CIP = 1 << 14;
        /// IP checksum error.
        const EIP = 1 << 13;
        /// Transport header was recognised and its checksum verified.
        const CTU = 1 << 11;
        /// Transport checksum error.
        const ETU = 1 << 10;
    }
}

impl RxFcbFlags {
    const CSUM_MASK: RxFcbFlags = RxFcbFlags::CIP
        .union(RxFcbFlags::EIP)
        .union(RxFcbFlags::CTU)
        .union(RxFcbFlags::ETU);

    /// Hardware verified both checksums with no error bits.
    #[must_use]
    pub fn csum_verified(self) -> bool {
        self.intersection(Self::CSUM_MASK) == RxFcbFlags::CIP | RxFcbFlags::CTU
    }
}

/// Receive offload control block, 8 bytes written by the controller ahead of
/// each frame when receive offloads are enabled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RxFcb {
    /// Validation results.
    pub flags: u16,
    /// Queue the frame was steered to.
    pub queue: u8,
    /// Extracted VLAN tag when `VLN` is set.
    pub vlan: u16,
}

impl RxFcb {
    /// Serialise into the 8-byte wire form.
    #[must_use]
    pub fn encode(&self) -> [u8; FCB_LEN] {
        let mut out = [0u8; FCB_LEN];
        out[0..2].copy_from_slice(&self.flags.to_be_bytes());
        out[2] = self.queue;
        out[6..8].copy_from_slice(&self.vlan.to_be_bytes());
        out
    }

    /// Parse the wire form from the front of a received buffer.
    pub fn decode(raw: &[u8]) -> Result<Self, SegmentError> {
        if raw.len() < FCB_LEN {
            return Err(SegmentError::Malformed(raw.len()));
        }
        Ok(Self {
            flags: u16::from_be_bytes([raw[0], raw[1]]),
            queue: raw[2],
            vlan: u16::from_be_bytes([raw[6], raw[7]]),
        })
    }
}
