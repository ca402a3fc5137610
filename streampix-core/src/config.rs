//! Acquisition configuration.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};

/// Operating mode selected by the client handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RunMode {
    /// Total spectrum only, no correlation.
    Focus,
    /// Coincidence filtering against the TDC1 rising edge.
    Coincidence,
    /// Spectrum-image accumulation driven by the TDC2 line trigger.
    SpectralImage,
}

impl RunMode {
    /// Decodes the handshake mode word.
    pub fn from_u16(mode: u16) -> Result<Self> {
        match mode {
            0 => Ok(Self::Focus),
            1 => Ok(Self::Coincidence),
            2 => Ok(Self::SpectralImage),
            other => Err(Error::InvalidRunMode(other)),
        }
    }
}

/// Tunable parameters of one acquisition session.
///
/// Defaults reproduce a plain coincidence run on a four-chip 1024 x 256
/// sensor. A client handshake or a settings file may override any field.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AcquisitionConfig {
    /// Operating mode.
    pub mode: RunMode,
    /// Spectrum length, detector width plus composite margin.
    pub spim_pixels: usize,
    /// Scan columns in spectrum-image mode.
    pub xspim: u16,
    /// Scan rows in spectrum-image mode.
    pub yspim: u16,
    /// Detector width in pixels.
    pub xsize: u16,
    /// Detector height in pixels.
    pub ysize: u16,
    /// Coincidence window start, electron minus trigger, picoseconds.
    pub delay_ps: i64,
    /// Coincidence window width in picoseconds.
    pub width_ps: i64,
    /// Number of bins of the electron-to-trigger delay histogram.
    pub delay_bins: usize,
    /// Photon correlation half-window; `None` disables the g2 path.
    pub g2_width_ps: Option<i64>,
    /// Number of bins of the photon-photon delay histogram.
    pub g2_bins: usize,
    /// IsiBox channel pair correlated by the photon-photon g2.
    pub g2_channels: (u8, u8),
    /// Reference ring capacity per trigger kind.
    pub n_ref: usize,
    /// Photon ring capacity.
    pub n_photon: usize,
    /// Clock backstep tolerance in nanoseconds.
    pub backstep_slack_ns: u64,
    /// Per-pixel dwell time in spectrum-image mode, picoseconds.
    pub dwell_ps: u64,
    /// Pairing window for double-electron events, picoseconds.
    pub double_window_ps: u64,
    /// Maximum column distance for double-electron pairing.
    pub double_max_dx: u16,
    /// Emission timer period in milliseconds.
    pub emission_period_ms: u64,
    /// Append-stream byte threshold that forces an emission.
    pub stream_bytes_threshold: usize,
    /// Bounded electron queue depth between decode and coincidence.
    pub queue_depth: usize,
    /// Malformed-chunk recoveries allowed before the session aborts.
    pub resync_budget: u64,
    /// Also emit `spec`/`cspec` as comma-separated text for legacy
    /// consumers.
    pub legacy_text: bool,
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            mode: RunMode::Coincidence,
            spim_pixels: 1041,
            xspim: 1,
            yspim: 1,
            xsize: 1024,
            ysize: 256,
            delay_ps: 0,
            width_ps: 100_000,
            delay_bins: 512,
            g2_width_ps: None,
            g2_bins: 1024,
            g2_channels: (0, 12),
            n_ref: 16,
            n_photon: 64,
            backstep_slack_ns: 1_000,
            dwell_ps: 1_000_000,
            double_window_ps: 100_000,
            double_max_dx: 2,
            emission_period_ms: 100,
            stream_bytes_threshold: 64 * 1024,
            queue_depth: 65_536,
            resync_budget: 1_024,
            legacy_text: true,
        }
    }
}

impl AcquisitionConfig {
    /// Creates the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the operating mode.
    #[must_use]
    pub fn with_mode(mut self, mode: RunMode) -> Self {
        self.mode = mode;
        self
    }

    /// Sets the coincidence window `[delay, delay + width]` in
    /// picoseconds.
    #[must_use]
    pub fn with_window(mut self, delay_ps: i64, width_ps: i64) -> Self {
        self.delay_ps = delay_ps;
        self.width_ps = width_ps;
        self
    }

    /// Enables photon correlation with the given half-window.
    #[must_use]
    pub fn with_g2_window(mut self, width_ps: i64) -> Self {
        self.g2_width_ps = Some(width_ps);
        self
    }

    /// Sets the scan grid for spectrum-image mode.
    #[must_use]
    pub fn with_scan(mut self, xspim: u16, yspim: u16) -> Self {
        self.xspim = xspim;
        self.yspim = yspim;
        self
    }

    /// Validates cross-field invariants.
    pub fn validate(&self) -> Result<()> {
        if self.width_ps <= 0 {
            return Err(Error::ConfigError("window width must be positive".into()));
        }
        if self.delay_bins == 0 || self.g2_bins == 0 {
            return Err(Error::ConfigError("histograms need at least one bin".into()));
        }
        if self.spim_pixels < self.xsize as usize {
            return Err(Error::ConfigError(format!(
                "spectrum length {} shorter than detector width {}",
                self.spim_pixels, self.xsize
            )));
        }
        if self.mode == RunMode::SpectralImage && (self.xspim == 0 || self.yspim == 0) {
            return Err(Error::ConfigError("empty scan grid".into()));
        }
        if self.n_ref == 0 {
            return Err(Error::ConfigError("reference ring cannot be empty".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        assert!(AcquisitionConfig::default().validate().is_ok());
    }

    #[test]
    fn test_mode_decode() {
        assert_eq!(RunMode::from_u16(0).unwrap(), RunMode::Focus);
        assert_eq!(RunMode::from_u16(1).unwrap(), RunMode::Coincidence);
        assert_eq!(RunMode::from_u16(2).unwrap(), RunMode::SpectralImage);
        assert!(RunMode::from_u16(7).is_err());
    }

    #[test]
    fn test_validate_rejects_degenerate_windows() {
        let config = AcquisitionConfig::default().with_window(0, 0);
        assert!(config.validate().is_err());

        let config = AcquisitionConfig::default()
            .with_mode(RunMode::SpectralImage)
            .with_scan(0, 64);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_builder_chain() {
        let config = AcquisitionConfig::new()
            .with_window(400_000_000, 200_000_000)
            .with_g2_window(500_000)
            .with_scan(67, 67);
        assert_eq!(config.delay_ps, 400_000_000);
        assert_eq!(config.g2_width_ps, Some(500_000));
        assert_eq!(config.xspim, 67);
    }
}
