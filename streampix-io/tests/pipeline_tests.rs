//! Cross-module pipeline tests: modes, emission frames, invariants.

use streampix_core::{AcquisitionConfig, CalibrationTable, RunMode, TriggerKind};
use streampix_io::{snapshot_frames, ArrayId, Frame, Pipeline};
use streampix_tpx::encode;

/// TDC chunk whose reconstructed time is `us` microseconds.
fn tdc_chunk(kind: TriggerKind, us: u64) -> Vec<u8> {
    let coarse = us * 1_000_000 / 3_125;
    encode::chunk(0, 0, &[encode::trigger(kind, 0, coarse, 0)])
}

/// Electron chunk at `spidr` frames plus `toa` 25 ns ticks, local
/// origin of the given chip.
fn electron_chunk(chip: u8, toa: u16, spidr: u16) -> Vec<u8> {
    encode::chunk(chip, 0, &[encode::electron(0, 0, toa, 0xF, 10, spidr)])
}

#[test]
fn spectral_image_mode_accumulates_per_scan_pixel() {
    let mut config = AcquisitionConfig::default()
        .with_mode(RunMode::SpectralImage)
        .with_scan(4, 2);
    // One scan pixel per 409.6 us so each spidr step advances one
    // scan column.
    config.dwell_ps = 409_600_000;
    let mut pipeline = Pipeline::new(config, CalibrationTable::default()).unwrap();

    // Line trigger at 0, then electrons marching across the line.
    pipeline
        .ingest(&tdc_chunk(TriggerKind::Tdc2Rising, 0))
        .unwrap();
    for spidr in 0..4u16 {
        pipeline.ingest(&electron_chunk(0, 0, spidr)).unwrap();
    }

    let snapshot = pipeline.snapshot();
    let spim = snapshot.spim.expect("mode 2 emits the spectrum image");
    let spim_pixels = snapshot.spec.len();
    // Chip 0 local x = 0 lands at global x = 255.
    let total: u32 = spim.iter().sum();
    assert_eq!(total, 4);
    for scan_x in 0..4 {
        assert_eq!(spim[scan_x * spim_pixels + 255], 1, "scan column {scan_x}");
    }
}

#[test]
fn electrons_before_first_line_trigger_stay_out_of_spim() {
    let config = AcquisitionConfig::default()
        .with_mode(RunMode::SpectralImage)
        .with_scan(4, 4);
    let mut pipeline = Pipeline::new(config, CalibrationTable::default()).unwrap();

    pipeline.ingest(&electron_chunk(0, 10, 0)).unwrap();
    let snapshot = pipeline.snapshot();
    // Counted in the total spectrum, not yet in the scan.
    assert_eq!(snapshot.spec.iter().sum::<u64>(), 1);
    assert_eq!(snapshot.spim.unwrap().iter().sum::<u32>(), 0);
}

#[test]
fn snapshot_frames_parse_back_as_emitted() {
    let config = AcquisitionConfig::default().with_window(0, 500_000_000_000);
    let mut pipeline = Pipeline::new(config, CalibrationTable::default()).unwrap();

    pipeline
        .ingest(&tdc_chunk(TriggerKind::Tdc1Rising, 1_000))
        .unwrap();
    pipeline.ingest(&electron_chunk(1, 100, 10)).unwrap();
    let snapshot = pipeline.snapshot();

    let mut bytes = Vec::new();
    for frame in snapshot_frames(&snapshot) {
        frame.write_to(&mut bytes).unwrap();
    }

    let mut offset = 0;
    let mut ids = Vec::new();
    while offset < bytes.len() {
        let (frame, consumed) = Frame::parse(&bytes[offset..]).unwrap();
        assert_eq!(frame.seq, snapshot.seq);
        ids.push(frame.array_id);
        offset += consumed;
    }
    assert_eq!(offset, bytes.len());
    assert!(ids.contains(&ArrayId::Spec));
    assert!(ids.contains(&ArrayId::TRelStream));
    // Array ids are unique within one emission cycle.
    let mut deduped = ids.clone();
    deduped.sort_by_key(|id| *id as u8);
    deduped.dedup();
    assert_eq!(deduped.len(), ids.len());
}

#[test]
fn coincidence_totals_stay_consistent_over_a_run() {
    let config = AcquisitionConfig::default().with_window(0, 1_000_000_000);
    let mut pipeline = Pipeline::new(config, CalibrationTable::default()).unwrap();

    let mut stream = Vec::new();
    for i in 0..50u64 {
        if i % 5 == 0 {
            stream.extend_from_slice(&tdc_chunk(TriggerKind::Tdc1Rising, i * 400));
        }
        stream.extend_from_slice(&electron_chunk((i % 4) as u8, (i * 7 % 16_384) as u16, i as u16));
    }
    pipeline.ingest(&stream).unwrap();

    let report = pipeline.report();
    assert_eq!(report.electrons, 50);
    assert_eq!(report.matched + report.unmatched, 50);

    let snapshot = pipeline.snapshot();
    assert_eq!(snapshot.spec.iter().sum::<u64>(), 50);
    assert_eq!(snapshot.cspec.iter().sum::<u64>(), report.matched);
    assert!(report.matched <= 50);
    assert_eq!(snapshot.streams.len() as u64, report.matched);
}
