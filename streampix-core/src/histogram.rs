//! Histogram bank mutated by the coincidence stage.
//!
//! All dense arrays are allocated once at session start and live for the
//! whole run. The filtered-event streams use a Structure of Arrays
//! layout (one column per field) so they can be drained straight into
//! binary array emissions without per-event reshuffling.

use crate::config::{AcquisitionConfig, RunMode};
use crate::counters::PipelineCounters;
use crate::event::{ElectronEvent, PhotonEvent, TimeStamp};
use std::sync::Arc;

/// Dense 1-D histogram with u64 bins.
///
/// Out-of-range indices never wrap: the increment is dropped and
/// reported through the shared `out_of_range_bins` counter.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Histogram {
    bins: Vec<u64>,
}

impl Histogram {
    /// Creates a zeroed histogram with `len` bins.
    #[must_use]
    pub fn new(len: usize) -> Self {
        Self { bins: vec![0; len] }
    }

    /// Increments `bin`, returning whether it was in range.
    #[inline]
    pub fn record(&mut self, bin: usize) -> bool {
        if let Some(slot) = self.bins.get_mut(bin) {
            *slot += 1;
            true
        } else {
            false
        }
    }

    /// Read-only view of the bins.
    #[inline]
    pub fn bins(&self) -> &[u64] {
        &self.bins
    }

    /// Sum over all bins.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.bins.iter().sum()
    }

    /// Number of bins.
    #[inline]
    pub fn len(&self) -> usize {
        self.bins.len()
    }

    /// True when the histogram has no bins at all.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.bins.is_empty()
    }
}

/// 1-D histogram over a signed picosecond interval.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DelayHistogram {
    min_ps: i64,
    max_ps: i64,
    bins: Vec<u64>,
}

impl DelayHistogram {
    /// Creates a zeroed histogram covering `[min_ps, max_ps)`.
    #[must_use]
    pub fn new(min_ps: i64, max_ps: i64, bins: usize) -> Self {
        Self {
            min_ps,
            max_ps: max_ps.max(min_ps + 1),
            bins: vec![0; bins],
        }
    }

    /// Records a delay, returning whether it fell inside the range.
    #[inline]
    pub fn record(&mut self, delta_ps: i64) -> bool {
        if delta_ps < self.min_ps || delta_ps >= self.max_ps {
            return false;
        }
        let span = (self.max_ps - self.min_ps) as u128;
        let offset = (delta_ps - self.min_ps) as u128;
        let bin = (offset * self.bins.len() as u128 / span) as usize;
        self.bins[bin] += 1;
        true
    }

    /// Read-only view of the bins.
    #[inline]
    pub fn bins(&self) -> &[u64] {
        &self.bins
    }

    /// Lower edge of the covered interval in picoseconds.
    #[inline]
    pub const fn min_ps(&self) -> i64 {
        self.min_ps
    }

    /// Upper edge of the covered interval in picoseconds.
    #[inline]
    pub const fn max_ps(&self) -> i64 {
        self.max_ps
    }
}

/// Append-only filtered-event streams in SoA layout.
///
/// One row is pushed per electron that survives the coincidence filter;
/// photon rows carry the sentinel column values. Rows are drained into
/// each emission cycle, bounding memory by the emission period.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventStreams {
    /// Global detector column per event.
    pub x: Vec<u32>,
    /// Detector row per event.
    pub y: Vec<u32>,
    /// Electron-minus-trigger delay in picoseconds.
    pub t_rel: Vec<i64>,
    /// Absolute extended electron time in picoseconds.
    pub t_abs: Vec<u64>,
    /// Time over threshold.
    pub tot: Vec<u16>,
    /// Electron-to-photon delay, [`G2_NONE`] when no photon paired.
    pub g2_t: Vec<i64>,
    /// Photon channel associated with the event, [`NO_CHANNEL`] when
    /// none.
    pub channel: Vec<u32>,
    /// Delays of clustered double-electron events.
    pub double_t: Vec<i64>,
}

impl EventStreams {
    /// Creates streams with pre-sized columns.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            x: Vec::with_capacity(capacity),
            y: Vec::with_capacity(capacity),
            t_rel: Vec::with_capacity(capacity),
            t_abs: Vec::with_capacity(capacity),
            tot: Vec::with_capacity(capacity),
            g2_t: Vec::with_capacity(capacity),
            channel: Vec::with_capacity(capacity),
            double_t: Vec::with_capacity(capacity / 8),
        }
    }

    /// Number of event rows.
    #[inline]
    pub fn len(&self) -> usize {
        self.x.len()
    }

    /// True when no rows are buffered.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.x.is_empty()
    }

    /// Pushes one filtered event row.
    #[allow(clippy::too_many_arguments)]
    pub fn push(
        &mut self,
        x: u32,
        y: u32,
        t_rel: i64,
        t_abs: u64,
        tot: u16,
        g2_t: i64,
        channel: u32,
    ) {
        self.x.push(x);
        self.y.push(y);
        self.t_rel.push(t_rel);
        self.t_abs.push(t_abs);
        self.tot.push(tot);
        self.g2_t.push(g2_t);
        self.channel.push(channel);
    }

    /// Approximate buffered payload size in bytes, used for the
    /// emission byte threshold.
    #[must_use]
    pub fn byte_len(&self) -> usize {
        self.x.len() * (4 + 4 + 8 + 8 + 2 + 8 + 4) + self.double_t.len() * 8
    }

    /// Takes all buffered rows, leaving the streams empty but with
    /// their capacity intact.
    pub fn drain(&mut self) -> Self {
        Self {
            x: std::mem::take(&mut self.x),
            y: std::mem::take(&mut self.y),
            t_rel: std::mem::take(&mut self.t_rel),
            t_abs: std::mem::take(&mut self.t_abs),
            tot: std::mem::take(&mut self.tot),
            g2_t: std::mem::take(&mut self.g2_t),
            channel: std::mem::take(&mut self.channel),
            double_t: std::mem::take(&mut self.double_t),
        }
    }
}

/// Spectrum-image accumulator driven by the TDC2 line trigger.
///
/// Each line trigger starts a new scan row; within a row the scan
/// column advances with the configured per-pixel dwell time.
#[derive(Debug, Clone)]
pub struct SpimAccumulator {
    xspim: usize,
    yspim: usize,
    spim_pixels: usize,
    dwell_ps: u64,
    line_origin: Option<TimeStamp>,
    line_index: u64,
    counts: Vec<u32>,
}

impl SpimAccumulator {
    /// Creates a zeroed accumulator for an `xspim * yspim` scan.
    #[must_use]
    pub fn new(xspim: u16, yspim: u16, spim_pixels: usize, dwell_ps: u64) -> Self {
        let (xspim, yspim) = (xspim as usize, yspim as usize);
        Self {
            xspim,
            yspim,
            spim_pixels,
            dwell_ps: dwell_ps.max(1),
            line_origin: None,
            line_index: 0,
            counts: vec![0; xspim * yspim * spim_pixels],
        }
    }

    /// Registers a TDC2 rising edge: the start of the next scan line.
    pub fn line_trigger(&mut self, time: TimeStamp) {
        if self.line_origin.is_some() {
            self.line_index += 1;
        }
        self.line_origin = Some(time);
    }

    /// Accumulates an electron into the current scan pixel. Returns
    /// false when no line trigger was seen yet or the spectrum index is
    /// out of range.
    pub fn record(&mut self, spectrum_index: usize, time: TimeStamp) -> bool {
        let Some(origin) = self.line_origin else {
            return false;
        };
        if spectrum_index >= self.spim_pixels {
            return false;
        }
        let elapsed = time.as_ps().saturating_sub(origin.as_ps());
        let sx = ((elapsed / self.dwell_ps) as usize).min(self.xspim - 1);
        let sy = (self.line_index as usize) % self.yspim;
        self.counts[(sy * self.xspim + sx) * self.spim_pixels + spectrum_index] += 1;
        true
    }

    /// Read-only view of the scan counts.
    #[inline]
    pub fn counts(&self) -> &[u32] {
        &self.counts
    }
}

/// The fixed set of histograms owned by one session.
pub struct HistogramBank {
    /// Total spectrum, one bin per spectrum pixel.
    spec: Histogram,
    /// Coincidence spectrum.
    cspec: Histogram,
    /// Electron-to-trigger delay histogram over the coincidence window.
    t_delay: DelayHistogram,
    /// Electron-to-photon delay histogram, symmetric around zero.
    g2_delay: DelayHistogram,
    /// Photon-photon delay histogram from the sidechannel correlator.
    isi_g2: DelayHistogram,
    /// Photon counts per IsiBox channel.
    channel: Histogram,
    /// Spectrum image, mode 2 only.
    spim: Option<SpimAccumulator>,
    /// Filtered-event append streams.
    streams: EventStreams,
    counters: Arc<PipelineCounters>,
    seq: u64,
}

/// Number of IsiBox channels.
const PHOTON_CHANNELS: usize = 32;

/// Sentinel channel column for electrons without a photon partner.
pub const NO_CHANNEL: u32 = u32::MAX;

/// Sentinel `g2_t` column value for electrons without a photon partner;
/// falls outside any finite correlation window.
pub const G2_NONE: i64 = i64::MAX;

impl HistogramBank {
    /// Allocates the bank for one session.
    #[must_use]
    pub fn new(config: &AcquisitionConfig, counters: Arc<PipelineCounters>) -> Self {
        let g2_width = config.g2_width_ps.unwrap_or(1);
        Self {
            spec: Histogram::new(config.spim_pixels),
            cspec: Histogram::new(config.spim_pixels),
            t_delay: DelayHistogram::new(
                config.delay_ps,
                config.delay_ps + config.width_ps,
                config.delay_bins,
            ),
            g2_delay: DelayHistogram::new(-g2_width, g2_width, config.g2_bins),
            isi_g2: DelayHistogram::new(-g2_width, g2_width, config.g2_bins),
            channel: Histogram::new(PHOTON_CHANNELS),
            spim: (config.mode == RunMode::SpectralImage).then(|| {
                SpimAccumulator::new(
                    config.xspim,
                    config.yspim,
                    config.spim_pixels,
                    config.dwell_ps,
                )
            }),
            streams: EventStreams::with_capacity(config.stream_bytes_threshold / 30),
            counters,
            seq: 0,
        }
    }

    /// Records an electron into the total spectrum and, in mode 2, the
    /// spectrum image. Called once per electron regardless of the
    /// coincidence outcome.
    pub fn record_electron(&mut self, event: &ElectronEvent) {
        if !self.spec.record(event.x as usize) {
            self.counters.out_of_range_bins.bump();
        }
        if let Some(spim) = &mut self.spim {
            spim.record(event.x as usize, event.time);
        }
    }

    /// Records a matched electron: coincidence spectrum, delay
    /// histogram, and one filtered-event row.
    pub fn record_match(&mut self, event: &ElectronEvent, delta_ps: i64, g2_t: i64, channel: u32) {
        if !self.cspec.record(event.x as usize) {
            self.counters.out_of_range_bins.bump();
        }
        if !self.t_delay.record(delta_ps) {
            self.counters.out_of_range_bins.bump();
        }
        self.streams.push(
            event.x as u32,
            event.y as u32,
            delta_ps,
            event.time.as_ps(),
            event.tot,
            g2_t,
            channel,
        );
    }

    /// Records an electron-to-photon delay.
    pub fn record_g2(&mut self, delta_ps: i64) {
        if !self.g2_delay.record(delta_ps) {
            self.counters.out_of_range_bins.bump();
        }
    }

    /// Records a photon-photon delay from the sidechannel correlator.
    pub fn record_photon_g2(&mut self, delta_ps: i64) {
        if !self.isi_g2.record(delta_ps) {
            self.counters.out_of_range_bins.bump();
        }
    }

    /// Records a photon arrival on its channel.
    pub fn record_photon(&mut self, photon: &PhotonEvent) {
        if !self.channel.record(photon.channel as usize) {
            self.counters.out_of_range_bins.bump();
        }
    }

    /// Records the delay of a clustered double-electron event.
    pub fn record_double(&mut self, delta_ps: i64) {
        self.streams.double_t.push(delta_ps);
    }

    /// Registers a scan line trigger (mode 2).
    pub fn line_trigger(&mut self, time: TimeStamp) {
        if let Some(spim) = &mut self.spim {
            spim.line_trigger(time);
        }
    }

    /// Buffered append-stream payload in bytes.
    #[must_use]
    pub fn stream_bytes(&self) -> usize {
        self.streams.byte_len()
    }

    /// Takes a consistent snapshot of every array produced in this
    /// emission cycle and drains the append streams.
    pub fn snapshot(&mut self) -> BankSnapshot {
        self.seq += 1;
        BankSnapshot {
            seq: self.seq,
            spec: self.spec.bins().to_vec(),
            cspec: self.cspec.bins().to_vec(),
            t_delay: self.t_delay.bins().to_vec(),
            g2_delay: self.g2_delay.bins().to_vec(),
            isi_g2: self.isi_g2.bins().to_vec(),
            channel: self.channel.bins().to_vec(),
            spim: self.spim.as_ref().map(|s| s.counts().to_vec()),
            streams: self.streams.drain(),
        }
    }

    /// Total spectrum view, used by invariants and tests.
    #[inline]
    pub fn spec(&self) -> &Histogram {
        &self.spec
    }

    /// Coincidence spectrum view.
    #[inline]
    pub fn cspec(&self) -> &Histogram {
        &self.cspec
    }
}

/// One emission cycle's worth of consistent histogram data.
///
/// Snapshots are immutable once taken; consumers may drop them but
/// never mutate them.
#[derive(Debug, Clone, Default)]
pub struct BankSnapshot {
    /// Monotone snapshot sequence number.
    pub seq: u64,
    /// Total spectrum bins.
    pub spec: Vec<u64>,
    /// Coincidence spectrum bins.
    pub cspec: Vec<u64>,
    /// Electron-to-trigger delay bins.
    pub t_delay: Vec<u64>,
    /// Electron-to-photon delay bins.
    pub g2_delay: Vec<u64>,
    /// Photon-photon delay bins.
    pub isi_g2: Vec<u64>,
    /// Per-channel photon counts.
    pub channel: Vec<u64>,
    /// Spectrum-image counts when running in mode 2.
    pub spim: Option<Vec<u32>>,
    /// Filtered events drained for this cycle.
    pub streams: EventStreams,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::ElectronEvent;

    fn electron(x: u16, time_ps: u64) -> ElectronEvent {
        ElectronEvent {
            chip: 0,
            x,
            y: 5,
            toa: 0,
            ftoa: 0,
            tot: 40,
            spidr: 0,
            time: TimeStamp::from_ps(time_ps),
        }
    }

    fn bank(config: &AcquisitionConfig) -> HistogramBank {
        HistogramBank::new(config, Arc::new(PipelineCounters::default()))
    }

    #[test]
    fn test_histogram_rejects_out_of_range() {
        let mut hist = Histogram::new(4);
        assert!(hist.record(3));
        assert!(!hist.record(4));
        assert_eq!(hist.total(), 1);
    }

    #[test]
    fn test_delay_histogram_binning() {
        let mut hist = DelayHistogram::new(0, 100, 10);
        assert!(hist.record(0));
        assert!(hist.record(99));
        assert!(!hist.record(100));
        assert!(!hist.record(-1));
        assert_eq!(hist.bins()[0], 1);
        assert_eq!(hist.bins()[9], 1);
    }

    #[test]
    fn test_cspec_never_exceeds_spec() {
        let config = AcquisitionConfig::default().with_window(0, 1_000_000);
        let mut bank = bank(&config);

        for i in 0..10u16 {
            let e = electron(i, 1_000 * i as u64);
            bank.record_electron(&e);
            if i % 2 == 0 {
                bank.record_match(&e, 500, G2_NONE, NO_CHANNEL);
            }
        }
        assert!(bank.cspec().total() <= bank.spec().total());
    }

    #[test]
    fn test_snapshot_drains_streams() {
        let config = AcquisitionConfig::default();
        let mut bank = bank(&config);
        let e = electron(10, 42);
        bank.record_electron(&e);
        bank.record_match(&e, 10, G2_NONE, NO_CHANNEL);

        let snap = bank.snapshot();
        assert_eq!(snap.seq, 1);
        assert_eq!(snap.streams.len(), 1);
        assert_eq!(snap.streams.x[0], 10);
        // Dense arrays persist, streams drain.
        assert_eq!(bank.stream_bytes(), 0);
        let snap2 = bank.snapshot();
        assert_eq!(snap2.seq, 2);
        assert_eq!(snap2.spec[10], 1);
        assert!(snap2.streams.is_empty());
    }

    #[test]
    fn test_spim_accumulates_by_dwell() {
        let mut spim = SpimAccumulator::new(4, 2, 8, 1_000);
        // No line trigger yet: nothing is recorded.
        assert!(!spim.record(0, TimeStamp::from_ps(0)));

        spim.line_trigger(TimeStamp::from_ps(10_000));
        assert!(spim.record(3, TimeStamp::from_ps(10_100))); // scan x = 0
        assert!(spim.record(3, TimeStamp::from_ps(12_500))); // scan x = 2
        spim.line_trigger(TimeStamp::from_ps(20_000));
        assert!(spim.record(3, TimeStamp::from_ps(20_100))); // row 1, x = 0

        assert_eq!(spim.counts()[3], 1);
        assert_eq!(spim.counts()[2 * 8 + 3], 1);
        // Row 1 starts at scan-pixel index 4.
        assert_eq!(spim.counts()[4 * 8 + 3], 1);
    }
}
