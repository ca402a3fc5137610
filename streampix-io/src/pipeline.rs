//! The single-pass acquisition pipeline.
//!
//! One [`Pipeline`] owns the whole hot path: stream decode, event
//! reconstruction, coincidence matching, and histogram mutation. It is
//! driven from exactly one thread; snapshots leave through
//! [`Pipeline::snapshot`] and are the only data shared outward.

use crate::emitter::{ArtifactWriter, SnapshotConsumer};
use crate::replay::{FolderReplay, MappedCapture};
use crate::Result;
use log::info;
use streampix_coincidence::{CoincidenceEngine, PhotonCorrelator};
use streampix_core::{
    AcquisitionConfig, BankSnapshot, CalibrationTable, CounterSnapshot, HistogramBank,
    PipelineCounters, RunMode, TriggerKind, G2_NONE, NO_CHANNEL,
};
use streampix_tpx::{DecodedEvent, EventReconstructor, PacketRecord, StreamDecoder};
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Decode -> reconstruct -> correlate -> histogram, in one pass.
pub struct Pipeline {
    config: AcquisitionConfig,
    decoder: StreamDecoder,
    reconstructor: EventReconstructor,
    engine: CoincidenceEngine,
    correlator: Option<PhotonCorrelator>,
    bank: HistogramBank,
    counters: Arc<PipelineCounters>,
    scratch: Vec<PacketRecord>,
    last_emit: Instant,
}

impl Pipeline {
    /// Builds a pipeline for one session.
    pub fn new(config: AcquisitionConfig, calibration: CalibrationTable) -> Result<Self> {
        config.validate()?;
        let counters = Arc::new(PipelineCounters::default());
        let correlator = config.g2_width_ps.map(|width_ps| {
            PhotonCorrelator::new(
                config.g2_channels.0,
                config.g2_channels.1,
                width_ps.unsigned_abs(),
                config.n_photon,
            )
        });
        Ok(Self {
            decoder: StreamDecoder::new(Arc::clone(&counters)),
            reconstructor: EventReconstructor::new(
                calibration,
                config.backstep_slack_ns,
                Arc::clone(&counters),
            ),
            engine: CoincidenceEngine::new(&config),
            correlator,
            bank: HistogramBank::new(&config, Arc::clone(&counters)),
            counters,
            scratch: Vec::with_capacity(8_192),
            last_emit: Instant::now(),
            config,
        })
    }

    /// Shared counter handle for other tasks.
    #[must_use]
    pub fn counters(&self) -> Arc<PipelineCounters> {
        Arc::clone(&self.counters)
    }

    /// The active configuration.
    #[must_use]
    pub fn config(&self) -> &AcquisitionConfig {
        &self.config
    }

    /// Feeds raw stream bytes through the whole pipeline.
    ///
    /// Per-packet problems are recovered and counted; the only error is
    /// an exhausted resync budget, which ends the session.
    pub fn ingest(&mut self, bytes: &[u8]) -> Result<()> {
        let mut scratch = std::mem::take(&mut self.scratch);
        scratch.clear();
        self.decoder.feed_into(bytes, &mut scratch);
        for record in &scratch {
            if let Some(event) = self.reconstructor.process(record) {
                self.apply(event);
            }
        }
        self.scratch = scratch;

        if self.counters.resyncs.get() > self.config.resync_budget {
            return Err(streampix_tpx::Error::ResyncBudgetExhausted(
                self.counters.resyncs.get(),
            )
            .into());
        }
        Ok(())
    }

    fn apply(&mut self, event: DecodedEvent) {
        match event {
            DecodedEvent::Tdc(tdc) => {
                self.engine.process_tdc(&tdc);
                if tdc.kind == TriggerKind::Tdc2Rising {
                    self.bank.line_trigger(tdc.time);
                }
            }
            DecodedEvent::Electron(electron) => {
                self.bank.record_electron(&electron);
                if self.config.mode == RunMode::Focus {
                    return;
                }
                let outcome = self.engine.process_electron(&electron);
                // Photon and double pairings apply whether or not a
                // trigger matched.
                if let Some(p) = outcome.photon {
                    self.bank.record_g2(p.delta_ps);
                }
                if let Some(double_ps) = outcome.double_ps {
                    self.bank.record_double(double_ps);
                }
                match outcome.trigger_match {
                    Some(delta_ps) => {
                        let (g2_t, channel) = outcome
                            .photon
                            .map_or((G2_NONE, NO_CHANNEL), |p| {
                                (p.delta_ps, p.channel as u32)
                            });
                        self.bank.record_match(&electron, delta_ps, g2_t, channel);
                        self.counters.matched.bump();
                    }
                    None => {
                        self.counters.unmatched.bump();
                    }
                }
            }
        }
    }

    /// Feeds one photon arrival from the IsiBox sidechannel.
    pub fn ingest_photon(&mut self, channel: u8, raw_ticks: u64) {
        let photon = self.reconstructor.photon(channel, raw_ticks);
        self.bank.record_photon(&photon);
        self.engine.process_photon(&photon);
        if let Some(correlator) = &mut self.correlator {
            for &delta_ps in correlator.process(&photon) {
                self.bank.record_photon_g2(delta_ps);
            }
        }
    }

    /// True when the emission timer or the stream byte threshold asks
    /// for a snapshot.
    #[must_use]
    pub fn emission_due(&self) -> bool {
        self.last_emit.elapsed() >= Duration::from_millis(self.config.emission_period_ms)
            || self.bank.stream_bytes() >= self.config.stream_bytes_threshold
    }

    /// Takes a consistent snapshot and rearms the emission timer.
    pub fn snapshot(&mut self) -> BankSnapshot {
        self.last_emit = Instant::now();
        self.bank.snapshot()
    }

    /// Final counter report for the session.
    #[must_use]
    pub fn report(&self) -> CounterSnapshot {
        self.counters.snapshot()
    }

    /// Resets all non-calibration state for a fresh session.
    pub fn reset(&mut self) {
        self.decoder.reset();
        self.reconstructor.reset();
        self.engine.reset();
        if let Some(correlator) = &mut self.correlator {
            correlator.reset();
        }
        self.bank = HistogramBank::new(&self.config, Arc::clone(&self.counters));
        self.last_emit = Instant::now();
    }
}

/// Streams an on-disk capture through a pipeline, emitting artifacts
/// exactly like a live session.
pub fn replay_file<P: AsRef<Path>>(
    pipeline: &mut Pipeline,
    capture_path: P,
    output_dir: P,
) -> Result<CounterSnapshot> {
    let capture = MappedCapture::open(&capture_path)?;
    let mut writer = ArtifactWriter::create(&output_dir, pipeline.config().legacy_text)?;

    // Feed in payload-sized slices so emission interleaves like live.
    for slice in capture.slices(65_536) {
        pipeline.ingest(slice)?;
        if pipeline.emission_due() {
            let snapshot = pipeline.snapshot();
            writer.consume(&snapshot)?;
        }
    }
    let snapshot = pipeline.snapshot();
    writer.consume(&snapshot)?;

    let report = pipeline.report();
    info!("replay finished: {}", report.summary());
    Ok(report)
}

/// Replays a capture folder through a pipeline.
pub fn replay_folder<P: AsRef<Path>>(
    pipeline: &mut Pipeline,
    replay: &mut FolderReplay,
    output_dir: P,
) -> Result<CounterSnapshot> {
    let mut writer = ArtifactWriter::create(&output_dir, pipeline.config().legacy_text)?;

    while let Some(blob) = replay.next_blob()? {
        pipeline.ingest(&blob)?;
        if pipeline.emission_due() {
            let snapshot = pipeline.snapshot();
            writer.consume(&snapshot)?;
        }
    }
    let snapshot = pipeline.snapshot();
    writer.consume(&snapshot)?;

    let report = pipeline.report();
    info!("folder replay finished: {}", report.summary());
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use streampix_tpx::encode;

    const PS_PER_US: i64 = 1_000_000;

    fn coincidence_pipeline() -> Pipeline {
        let config = AcquisitionConfig::default().with_window(400 * PS_PER_US, 200 * PS_PER_US);
        Pipeline::new(config, CalibrationTable::default()).unwrap()
    }

    /// TDC packet whose reconstructed time is `us` microseconds.
    fn tdc_chunk(us: u64) -> Vec<u8> {
        let coarse = us * 1_000_000 / 3_125;
        encode::chunk(
            0,
            0,
            &[encode::trigger(TriggerKind::Tdc1Rising, 0, coarse, 0)],
        )
    }

    /// Electron chunk whose reconstructed time is roughly `us`
    /// microseconds (spidr granularity is 409.6 us, toa 25 ns).
    fn electron_chunk(toa_ticks: u16, spidr: u16) -> Vec<u8> {
        encode::chunk(0, 0, &[encode::electron(0, 0, toa_ticks, 0xF, 10, spidr)])
    }

    #[test]
    fn test_matched_electron_updates_cspec_and_streams() {
        let mut pipeline = coincidence_pipeline();

        // Trigger at 1 s.
        pipeline.ingest(&tdc_chunk(1_000_000)).unwrap();
        // Electron at 1.0005 s: spidr covers 409.6 us steps, so use
        // spidr = 2442 (1000.24 ms) plus toa for the remainder.
        let spidr = 2442u16;
        let base_ps = spidr as u64 * 409_600_000;
        let remainder_ps = 1_000_500 * PS_PER_US as u64 - base_ps;
        let toa = (remainder_ps / 25_000) as u16;
        pipeline.ingest(&electron_chunk(toa, spidr)).unwrap();

        let report = pipeline.report();
        assert_eq!(report.electrons, 1);
        assert_eq!(report.matched, 1);

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.cspec.iter().sum::<u64>(), 1);
        assert_eq!(snapshot.streams.len(), 1);
        let delta = snapshot.streams.t_rel[0];
        assert!((400 * PS_PER_US..=600 * PS_PER_US).contains(&delta));
    }

    #[test]
    fn test_unmatched_electron_only_in_spec() {
        let mut pipeline = coincidence_pipeline();
        pipeline.ingest(&tdc_chunk(1_000_000)).unwrap();
        // Electron at ~1.0015 s: outside [400, 600] us.
        let spidr = 2445u16;
        let base_ps = spidr as u64 * 409_600_000;
        let remainder_ps = 1_001_500 * PS_PER_US as u64 - base_ps;
        let toa = (remainder_ps / 25_000) as u16;
        pipeline.ingest(&electron_chunk(toa, spidr)).unwrap();

        let report = pipeline.report();
        assert_eq!(report.unmatched, 1);
        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.spec.iter().sum::<u64>(), 1);
        assert_eq!(snapshot.cspec.iter().sum::<u64>(), 0);
    }

    #[test]
    fn test_focus_mode_skips_correlation() {
        let config = AcquisitionConfig::default().with_mode(RunMode::Focus);
        let mut pipeline = Pipeline::new(config, CalibrationTable::default()).unwrap();

        pipeline.ingest(&tdc_chunk(1_000)).unwrap();
        pipeline.ingest(&electron_chunk(100, 0)).unwrap();

        let report = pipeline.report();
        assert_eq!(report.electrons, 1);
        assert_eq!(report.matched + report.unmatched, 0);
    }

    #[test]
    fn test_unmatched_electron_still_records_g2() {
        // Tight trigger window, wide photon window: the electron misses
        // every trigger but still pairs with the photon.
        let config = AcquisitionConfig::default()
            .with_window(400 * PS_PER_US, 200 * PS_PER_US)
            .with_g2_window(1_000_000);
        let mut pipeline = Pipeline::new(config, CalibrationTable::default()).unwrap();

        // Electron at toa = 100 is 2.5 us in; the photon sits 40 ps
        // earlier (20_833 ticks at 120 ps).
        pipeline.ingest_photon(5, 20_833);
        pipeline.ingest(&electron_chunk(100, 0)).unwrap();

        let report = pipeline.report();
        assert_eq!(report.unmatched, 1);
        assert_eq!(report.matched, 0);

        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.g2_delay.iter().sum::<u64>(), 1);
        // No trigger match: no coincidence row, no cspec count.
        assert_eq!(snapshot.cspec.iter().sum::<u64>(), 0);
        assert!(snapshot.streams.is_empty());
    }

    #[test]
    fn test_photon_ingest_feeds_channel_histogram() {
        let config = AcquisitionConfig::default().with_g2_window(1_000_000);
        let mut pipeline = Pipeline::new(config, CalibrationTable::default()).unwrap();

        pipeline.ingest_photon(0, 1_000);
        pipeline.ingest_photon(12, 1_010);
        let snapshot = pipeline.snapshot();
        assert_eq!(snapshot.channel[0], 1);
        assert_eq!(snapshot.channel[12], 1);
        // 10 ticks at 120 ps correlate within the window.
        assert_eq!(snapshot.isi_g2.iter().sum::<u64>(), 1);
    }

    #[test]
    fn test_replay_writes_artifacts() {
        let dir = tempfile::tempdir().unwrap();
        let capture_path = dir.path().join("run.tpx3");
        let mut stream = tdc_chunk(1_000_000);
        stream.extend_from_slice(&electron_chunk(100, 2441));
        std::fs::write(&capture_path, &stream).unwrap();

        let mut pipeline = coincidence_pipeline();
        let out = dir.path().join("out");
        let report = replay_file(&mut pipeline, &capture_path, &out).unwrap();
        assert_eq!(report.electrons, 1);
        assert!(out.join("spec.txt").exists());
    }

    #[test]
    fn test_cspec_subset_of_spec_invariant() {
        let mut pipeline = coincidence_pipeline();
        pipeline.ingest(&tdc_chunk(1_000_000)).unwrap();
        for spidr in [2440u16, 2441, 2442, 2443] {
            pipeline.ingest(&electron_chunk(0, spidr)).unwrap();
        }
        let snapshot = pipeline.snapshot();
        assert!(
            snapshot.cspec.iter().sum::<u64>() <= snapshot.spec.iter().sum::<u64>()
        );
    }
}
