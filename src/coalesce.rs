// Author: Lukas Bower
// Purpose: Interrupt coalescing parameters and link-speed tick conversion.

use crate::err::ConfigError;

/// Upper bound on the microsecond threshold.
pub const MAX_COALESCE_USECS: u32 = 0xffff;
/// Upper bound on the frame-count threshold.
pub const MAX_COALESCE_FRAMES: u32 = 0xff;

const ICEN: u32 = 1 << 31;
const FRAME_SHIFT: u32 = 21;

/// Negotiated link speed. The coalescing timer ticks at a different rate at
/// each speed, so register values must be recomputed whenever this changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkSpeed {
    /// 10 Mbps.
    Mbps10,
    /// 100 Mbps.
    Mbps100,
    /// 1000 Mbps.
    #[default]
    Mbps1000,
}

impl LinkSpeed {
    /// Nanoseconds per coalescing timer tick at this speed.
    #[must_use]
    pub fn tick_ns(self) -> u32 {
        match self {
            LinkSpeed::Mbps1000 => 512,
            LinkSpeed::Mbps100 => 2_560,
            LinkSpeed::Mbps10 => 25_600,
        }
    }
}

/// One direction's coalescing pair. Zero in either field disables coalescing
/// for that direction; both must be nonzero to arm the timer at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct IcPair {
    /// Delay threshold in microseconds.
    pub usecs: u32,
    /// Frame-count threshold.
    pub frames: u32,
}

impl IcPair {
    /// Pair that leaves coalescing off.
    #[must_use]
    pub fn disabled() -> Self {
        Self::default()
    }

    /// Coalescing is armed only when both thresholds are nonzero.
    #[must_use]
    pub fn enabled(&self) -> bool {
        self.usecs != 0 && self.frames != 0
    }

    /// Validate against the hardware field widths.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.usecs > MAX_COALESCE_USECS {
            return Err(ConfigError::Coalesce("usecs above 65535"));
        }
        if self.frames > MAX_COALESCE_FRAMES {
            return Err(ConfigError::Coalesce("frame count above 255"));
        }
        Ok(())
    }

    /// Pack the register value for the given link speed. Disabled pairs
    /// produce zero, which parks the timer.
    #[must_use]
    pub fn register_value(&self, speed: LinkSpeed) -> u32 {
        if !self.enabled() {
            return 0;
        }
        ICEN | (self.frames << FRAME_SHIFT) | usecs_to_ticks(self.usecs, speed)
    }
}

/// Convert a microsecond threshold into timer ticks at the given speed,
/// rounding up so any nonzero request stays nonzero.
#[must_use]
pub fn usecs_to_ticks(usecs: u32, speed: LinkSpeed) -> u32 {
    let tick_ns = speed.tick_ns();
    (usecs.saturating_mul(1000) + tick_ns - 1) / tick_ns
}

/// Inverse conversion, used when reporting configured values back.
#[must_use]
pub fn ticks_to_usecs(ticks: u32, speed: LinkSpeed) -> u32 {
    ticks.saturating_mul(speed.tick_ns()) / 1000
}
