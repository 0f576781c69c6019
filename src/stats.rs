// Author: Lukas Bower
// Purpose: Interface and per-queue statistics counters.

use std::sync::atomic::{AtomicU64, Ordering};

macro_rules! counters {
    ($(#[$meta:meta])* $name:ident, $snap:ident { $($(#[$fmeta:meta])* $field:ident),+ $(,)? }) => {
        $(#[$meta])*
        #[derive(Debug, Default)]
        pub struct $name {
            $($(#[$fmeta])* pub $field: AtomicU64,)+
        }

        /// Plain-value snapshot of the matching counter block.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
        pub struct $snap {
            $($(#[$fmeta])* pub $field: u64,)+
        }

        impl $name {
            /// Copy every counter into a snapshot.
            #[must_use]
            pub fn snapshot(&self) -> $snap {
                $snap {
                    $($field: self.$field.load(Ordering::Relaxed),)+
                }
            }
        }
    };
}

counters! {
    /// Interface-wide counters, mirroring what the hardware's extended
    /// statistics block tracks plus the software recovery paths.
    EngineStats, EngineStatsSnapshot {
        /// Frames handed to the controller.
        tx_packets,
        /// Bytes handed to the controller.
        tx_bytes,
        /// Submissions refused because the ring was full.
        tx_fifo_full,
        /// Transmit FIFO underruns recovered by re-kicking the queue.
        tx_underrun,
        /// Babbling-transmit errors.
        tx_babt,
        /// Watchdog expirations that scheduled a reset.
        tx_timeouts,
        /// Frames whose headroom had to be reallocated for metadata.
        tx_headroom_realloc,
        /// Segments produced by the software segmentation fallback.
        tso_segments,
        /// Segments discarded after a mid-sequence submission failure.
        tso_discards,
        /// Stopped queues woken after completions freed slots.
        queue_wakes,
        /// Frames delivered upstream.
        rx_packets,
        /// Bytes delivered upstream.
        rx_bytes,
        /// Frames the upstream sink refused.
        rx_upstream_dropped,
        /// Frames dropped because no replacement buffer was available.
        rx_alloc_failed,
        /// Oversized frames.
        rx_large,
        /// Undersized frames.
        rx_short,
        /// Non-octet-aligned frames.
        rx_nonoctet,
        /// Frame-check-sequence mismatches.
        rx_crc_err,
        /// FIFO overruns.
        rx_overrun,
        /// Truncated frames.
        rx_truncated,
        /// Receive stalls for lack of an empty descriptor.
        rx_busy,
        /// Babbling-receive errors.
        rx_babr,
        /// System bus errors (counted, never fatal here).
        bus_errors,
        /// Full halt/reinit/restart cycles.
        resets,
    }
}

impl EngineStats {
    /// Bump a counter by one.
    pub fn bump(&self, counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Add to a counter.
    pub fn add(&self, counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Per-queue packet/byte counters.
#[derive(Debug, Default)]
pub struct QueueStats {
    /// Frames through this queue.
    pub packets: AtomicU64,
    /// Bytes through this queue.
    pub bytes: AtomicU64,
}

impl QueueStats {
    /// Record one frame of `bytes` length.
    pub fn record(&self, bytes: usize) {
        self.packets.fetch_add(1, Ordering::Relaxed);
        self.bytes.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    /// (packets, bytes) snapshot.
    #[must_use]
    pub fn snapshot(&self) -> (u64, u64) {
        (
            self.packets.load(Ordering::Relaxed),
            self.bytes.load(Ordering::Relaxed),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reflects_bumps() {
        let stats = EngineStats::default();
        stats.bump(&stats.rx_crc_err);
        stats.add(&stats.tx_bytes, 128);
        let snap = stats.snapshot();
        assert_eq!(snap.rx_crc_err, 1);
        assert_eq!(snap.tx_bytes, 128);
        assert_eq!(snap.rx_packets, 0);
    }
}
