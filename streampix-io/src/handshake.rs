//! Client control handshake.
//!
//! A client may open the session by sending one fixed-size big-endian
//! record selecting the operating mode, the scan geometry, and the
//! coincidence window. Sessions without a handshake run with the
//! configured defaults.

use crate::{Error, Result};
use streampix_core::{AcquisitionConfig, RunMode};

/// Serialized handshake size: five u16 fields and two f64 fields.
pub const HANDSHAKE_LEN: usize = 26;

/// Decoded client handshake.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Handshake {
    /// Requested run mode.
    pub mode: u16,
    /// Scan columns.
    pub xspim: u16,
    /// Scan rows.
    pub yspim: u16,
    /// Detector width the client expects.
    pub xsize: u16,
    /// Detector height the client expects.
    pub ysize: u16,
    /// Coincidence delay in seconds.
    pub tdelay: f64,
    /// Coincidence width in seconds.
    pub twidth: f64,
}

impl Handshake {
    /// Decodes the big-endian handshake record.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HANDSHAKE_LEN {
            return Err(Error::InvalidFormat(format!(
                "handshake needs {HANDSHAKE_LEN} bytes, got {}",
                bytes.len()
            )));
        }
        let u16_at = |i: usize| u16::from_be_bytes([bytes[i], bytes[i + 1]]);
        Ok(Self {
            mode: u16_at(0),
            xspim: u16_at(2),
            yspim: u16_at(4),
            xsize: u16_at(6),
            ysize: u16_at(8),
            tdelay: f64::from_be_bytes(bytes[10..18].try_into().unwrap()),
            twidth: f64::from_be_bytes(bytes[18..26].try_into().unwrap()),
        })
    }

    /// Encodes the record, the client side of [`Self::decode`].
    #[must_use]
    pub fn encode(&self) -> [u8; HANDSHAKE_LEN] {
        let mut bytes = [0u8; HANDSHAKE_LEN];
        bytes[0..2].copy_from_slice(&self.mode.to_be_bytes());
        bytes[2..4].copy_from_slice(&self.xspim.to_be_bytes());
        bytes[4..6].copy_from_slice(&self.yspim.to_be_bytes());
        bytes[6..8].copy_from_slice(&self.xsize.to_be_bytes());
        bytes[8..10].copy_from_slice(&self.ysize.to_be_bytes());
        bytes[10..18].copy_from_slice(&self.tdelay.to_be_bytes());
        bytes[18..26].copy_from_slice(&self.twidth.to_be_bytes());
        bytes
    }

    /// Applies the handshake onto the session configuration.
    pub fn apply(&self, config: &mut AcquisitionConfig) -> Result<()> {
        config.mode = RunMode::from_u16(self.mode)?;
        if self.xspim > 0 && self.yspim > 0 {
            config.xspim = self.xspim;
            config.yspim = self.yspim;
        }
        if self.xsize > 0 {
            config.xsize = self.xsize;
        }
        if self.ysize > 0 {
            config.ysize = self.ysize;
        }
        if self.twidth > 0.0 {
            config.delay_ps = (self.tdelay * 1e12) as i64;
            config.width_ps = (self.twidth * 1e12) as i64;
        }
        config.validate()?;
        Ok(())
    }
}
