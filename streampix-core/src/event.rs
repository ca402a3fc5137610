//! Timestamped event types produced by the wire decoder.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Picoseconds per SPIDR coarse tick (25 ns * 16384).
pub const PS_PER_SPIDR_TICK: u64 = 409_600_000;
/// Picoseconds per TDC coarse tick (1 / 320 MHz).
pub const PS_PER_TDC_TICK: u64 = 3_125;
/// Picoseconds per TDC fine step.
pub const PS_PER_TDC_FINE: u64 = 260;
/// Picoseconds per IsiBox photon tick.
pub const PS_PER_PHOTON_TICK: u64 = 120;

/// Extended (rollover-corrected) timestamp in integer picoseconds.
///
/// All clock domains are converted to a common picosecond axis so that
/// electrons, TDC triggers, and photons can be compared directly. The
/// electron combined-fine tick (25/16 ns = 1562.5 ps) is the only
/// non-integer unit; it is computed as `ctoa * 3125 / 2` and loses at
/// most half a picosecond.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct TimeStamp(pub u64);

impl TimeStamp {
    /// Creates a timestamp from raw picoseconds.
    #[inline]
    pub const fn from_ps(ps: u64) -> Self {
        Self(ps)
    }

    /// Creates a timestamp from nanoseconds.
    #[inline]
    pub const fn from_ns(ns: u64) -> Self {
        Self(ns * 1000)
    }

    /// Returns the raw picosecond value.
    #[inline]
    pub const fn as_ps(&self) -> u64 {
        self.0
    }

    /// Returns the timestamp in (fractional) nanoseconds.
    #[inline]
    pub fn as_ns(&self) -> f64 {
        self.0 as f64 / 1e3
    }

    /// Returns the timestamp in (fractional) seconds.
    #[inline]
    pub fn as_secs(&self) -> f64 {
        self.0 as f64 / 1e12
    }

    /// Signed difference `self - other` in picoseconds.
    ///
    /// Saturates at the `i64` limits; extended times in one session never
    /// get anywhere near them.
    #[inline]
    pub fn delta(&self, other: &Self) -> i64 {
        if self.0 >= other.0 {
            i64::try_from(self.0 - other.0).unwrap_or(i64::MAX)
        } else {
            i64::try_from(other.0 - self.0).map_or(i64::MIN, |d| -d)
        }
    }

    /// Absolute difference in picoseconds.
    #[inline]
    pub const fn abs_diff(&self, other: &Self) -> u64 {
        self.0.abs_diff(other.0)
    }

    /// Adds a signed picosecond correction, clamping at zero.
    #[inline]
    pub fn offset(&self, ps: i64) -> Self {
        Self(self.0.saturating_add_signed(ps))
    }
}

/// TDC trigger kind, one sliding reference window per variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TriggerKind {
    /// TDC 1 rising edge (the primary coincidence reference).
    Tdc1Rising,
    /// TDC 1 falling edge.
    Tdc1Falling,
    /// TDC 2 rising edge (scan line trigger in spectrum-image mode).
    Tdc2Rising,
    /// TDC 2 falling edge.
    Tdc2Falling,
}

impl TriggerKind {
    /// Number of trigger kinds.
    pub const COUNT: usize = 4;

    /// Decodes the 4-bit trigger pattern from a TDC packet.
    pub fn from_pattern(pattern: u8) -> Result<Self> {
        match pattern {
            0xF => Ok(Self::Tdc1Rising),
            0xA => Ok(Self::Tdc1Falling),
            0xE => Ok(Self::Tdc2Rising),
            0xB => Ok(Self::Tdc2Falling),
            other => Err(Error::InvalidTriggerPattern(other)),
        }
    }

    /// The on-wire 4-bit pattern for this trigger kind.
    #[inline]
    pub const fn pattern(&self) -> u8 {
        match self {
            Self::Tdc1Rising => 0xF,
            Self::Tdc1Falling => 0xA,
            Self::Tdc2Rising => 0xE,
            Self::Tdc2Falling => 0xB,
        }
    }

    /// Dense index for per-kind storage.
    #[inline]
    pub const fn index(&self) -> usize {
        match self {
            Self::Tdc1Rising => 0,
            Self::Tdc1Falling => 1,
            Self::Tdc2Rising => 2,
            Self::Tdc2Falling => 3,
        }
    }
}

/// A single reconstructed electron hit.
///
/// `x` is the global detector column after chip-geometry remapping
/// (0..1024 on a four-chip sensor); `y` is preserved from the local
/// pixel address. Raw counter fields are kept so that a hit can be
/// re-encoded bit-exactly.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectronEvent {
    /// Chip index (0..3).
    pub chip: u8,
    /// Global detector column.
    pub x: u16,
    /// Detector row (0..255).
    pub y: u16,
    /// 14-bit coarse time of arrival (25 ns units).
    pub toa: u16,
    /// 4-bit fine time of arrival, wire-inverted.
    pub ftoa: u8,
    /// 10-bit time over threshold (25 ns units).
    pub tot: u16,
    /// 16-bit SPIDR frame counter.
    pub spidr: u16,
    /// Extended global time, calibration applied.
    pub time: TimeStamp,
}

impl ElectronEvent {
    /// Combined coarse+fine time of arrival (18 bits, 25/16 ns units).
    ///
    /// The fine counter is inverted on the wire.
    #[inline]
    pub const fn ctoa(&self) -> u32 {
        ((self.toa as u32) << 4) | ((!self.ftoa & 0xF) as u32)
    }

    /// Raw in-epoch time in combined-fine ticks: `spidr * 2^18 + ctoa`.
    #[inline]
    pub const fn raw_ticks(&self) -> u64 {
        ((self.spidr as u64) << 18) | self.ctoa() as u64
    }

    /// ToT in nanoseconds.
    #[inline]
    pub fn tot_ns(&self) -> f64 {
        self.tot as f64 * 25.0
    }
}

/// An external trigger event from one of the two TDC inputs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TdcEvent {
    /// Edge and input identification.
    pub kind: TriggerKind,
    /// 12-bit trigger counter.
    pub counter: u16,
    /// 35-bit coarse timestamp (320 MHz).
    pub coarse: u64,
    /// 4-bit fine timestamp (260 ps steps).
    pub fine: u8,
    /// Extended global time.
    pub time: TimeStamp,
}

/// A photon arrival from the optional IsiBox sidechannel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhotonEvent {
    /// IsiBox channel (0..31).
    pub channel: u8,
    /// Extended global time.
    pub time: TimeStamp,
}
