//! Per-region and per-ToT timing calibration.
//!
//! The detector is tiled into `div_x * div_y` rectangular regions
//! (`div_y = div_x / 4`, matching the 4:1 aspect of the quad sensor).
//! Each region carries a signed picosecond delay applied to electron
//! times during reconstruction, plus an optional `(tot bucket, chip)`
//! delay table. Tables are fitted offline and loaded at startup; they
//! are never mutated by the pipeline.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Allowed horizontal region divisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u16", into = "u16")]
pub enum RegionDivision {
    /// 4 x 1 regions.
    Div4,
    /// 8 x 2 regions.
    Div8,
    /// 16 x 4 regions.
    Div16,
    /// 32 x 8 regions.
    Div32,
    /// 64 x 16 regions.
    Div64,
}

impl RegionDivision {
    /// Number of horizontal regions.
    #[inline]
    pub const fn div_x(&self) -> usize {
        match self {
            Self::Div4 => 4,
            Self::Div8 => 8,
            Self::Div16 => 16,
            Self::Div32 => 32,
            Self::Div64 => 64,
        }
    }

    /// Number of vertical regions (`div_x / 4`).
    #[inline]
    pub const fn div_y(&self) -> usize {
        self.div_x() / 4
    }
}

impl TryFrom<u16> for RegionDivision {
    type Error = Error;

    fn try_from(value: u16) -> Result<Self> {
        match value {
            4 => Ok(Self::Div4),
            8 => Ok(Self::Div8),
            16 => Ok(Self::Div16),
            32 => Ok(Self::Div32),
            64 => Ok(Self::Div64),
            other => Err(Error::CalibrationError(format!(
                "region division must be 4, 8, 16, 32 or 64, got {other}"
            ))),
        }
    }
}

impl From<RegionDivision> for u16 {
    fn from(value: RegionDivision) -> Self {
        value.div_x() as u16
    }
}

/// Immutable timing-delay calibration table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationTable {
    /// Region tiling granularity.
    pub division: RegionDivision,
    /// Detector width in pixels covered by the region grid.
    pub width: u16,
    /// Detector height in pixels covered by the region grid.
    pub height: u16,
    /// Row-major `[region_x][region_y]` delays in picoseconds.
    pub region_delays_ps: Vec<i64>,
    /// ToT bucket width in 25 ns ToT units.
    #[serde(default = "CalibrationTable::default_tot_bucket")]
    pub tot_bucket: u16,
    /// Row-major `[tot_bucket][chip]` delays in picoseconds. May be
    /// empty when no ToT correction was fitted.
    #[serde(default)]
    pub tot_delays_ps: Vec<i64>,
}

impl Default for CalibrationTable {
    fn default() -> Self {
        Self::identity(RegionDivision::Div16, 1024, 256)
    }
}

impl CalibrationTable {
    fn default_tot_bucket() -> u16 {
        25
    }

    /// An all-zero table: reconstruction without timing correction.
    #[must_use]
    pub fn identity(division: RegionDivision, width: u16, height: u16) -> Self {
        Self {
            division,
            width,
            height,
            region_delays_ps: vec![0; division.div_x() * division.div_y()],
            tot_bucket: Self::default_tot_bucket(),
            tot_delays_ps: Vec::new(),
        }
    }

    /// Loads and validates a table from a JSON file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let table: Self = serde_json::from_str(&raw)?;
        table.validate()?;
        Ok(table)
    }

    /// Checks internal consistency of the table shapes.
    pub fn validate(&self) -> Result<()> {
        let expected = self.division.div_x() * self.division.div_y();
        if self.region_delays_ps.len() != expected {
            return Err(Error::CalibrationError(format!(
                "region table holds {} entries, tiling needs {expected}",
                self.region_delays_ps.len()
            )));
        }
        if (self.width as usize) < self.division.div_x()
            || (self.height as usize) < self.division.div_y()
        {
            return Err(Error::CalibrationError(format!(
                "detector extent {}x{} smaller than the region grid",
                self.width, self.height
            )));
        }
        if !self.tot_delays_ps.is_empty() && !self.tot_delays_ps.len().is_multiple_of(4) {
            return Err(Error::CalibrationError(format!(
                "ToT table length {} is not a multiple of the 4 chips",
                self.tot_delays_ps.len()
            )));
        }
        Ok(())
    }

    /// Region delay for a global pixel coordinate, `None` when the
    /// coordinate falls outside the calibrated grid.
    #[inline]
    pub fn region_delay(&self, x: u16, y: u16) -> Option<i64> {
        if x >= self.width || y >= self.height {
            return None;
        }
        let rx = x as usize / (self.width as usize / self.division.div_x());
        let ry = y as usize / (self.height as usize / self.division.div_y());
        self.region_delays_ps
            .get(rx * self.division.div_y() + ry)
            .copied()
    }

    /// ToT-dependent delay for a chip; zero when no ToT table is loaded
    /// or the bucket is beyond the fitted range.
    #[inline]
    pub fn tot_delay(&self, tot: u16, chip: u8) -> i64 {
        if self.tot_delays_ps.is_empty() {
            return 0;
        }
        let bucket = (tot / self.tot_bucket.max(1)) as usize;
        self.tot_delays_ps
            .get(bucket * 4 + (chip & 0x3) as usize)
            .copied()
            .unwrap_or(0)
    }

    /// Sum of the corrections applicable to one electron, `None` when
    /// the pixel misses the region grid entirely.
    #[inline]
    pub fn correction(&self, x: u16, y: u16, tot: u16, chip: u8) -> Option<i64> {
        self.region_delay(x, y)
            .map(|delay| delay + self.tot_delay(tot, chip))
    }
}
