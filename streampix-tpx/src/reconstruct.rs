//! Event reconstruction: packets to globally-timed events.
//!
//! Applies the quad-chip geometry remap, extends the per-chip SPIDR
//! clocks and the TDC clock across rollovers, and applies the timing
//! calibration. Decode failures are counted and skipped; the stream is
//! never aborted from here.

use crate::chunk::PacketRecord;
use crate::packet::PacketKind;
use streampix_core::{
    CalibrationTable, ClockTracker, ElectronEvent, PhotonEvent, PipelineCounters, TdcEvent,
    TimeStamp, TriggerKind, PS_PER_PHOTON_TICK, PS_PER_TDC_FINE, PS_PER_TDC_TICK,
    SPIDR_EPOCH_TICKS,
};
use std::sync::Arc;

/// Global x of local column 0, per chip index. Columns mirror within
/// each chip, so `x_global = REMAP_BASE[chip] - x_local`.
const REMAP_BASE: [u16; 4] = [255, 1023, 767, 511];

/// Picoseconds per electron combined-fine tick, as a ratio (3125 / 2).
const CTOA_PS_NUM: u64 = 3_125;

/// An event carrying its extended global time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodedEvent {
    /// A reconstructed electron hit.
    Electron(ElectronEvent),
    /// An external TDC trigger.
    Tdc(TdcEvent),
}

/// Packet-to-event reconstructor for one session.
pub struct EventReconstructor {
    /// One SPIDR clock per chip; the four read-out columns run
    /// independent frame counters.
    spidr_clocks: [ClockTracker; 4],
    tdc_clock: ClockTracker,
    photon_clock: ClockTracker,
    calibration: CalibrationTable,
    counters: Arc<PipelineCounters>,
}

impl EventReconstructor {
    /// Creates a reconstructor with the given calibration table.
    #[must_use]
    pub fn new(
        calibration: CalibrationTable,
        backstep_slack_ns: u64,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            spidr_clocks: std::array::from_fn(|_| ClockTracker::spidr(backstep_slack_ns)),
            tdc_clock: ClockTracker::tdc(backstep_slack_ns),
            photon_clock: ClockTracker::photon(backstep_slack_ns),
            calibration,
            counters,
        }
    }

    /// Processes one packet record, producing an event for electron and
    /// TDC packets. Global-time packets resynchronize the SPIDR epoch
    /// and produce nothing; unknown ids are counted and skipped.
    pub fn process(&mut self, record: &PacketRecord) -> Option<DecodedEvent> {
        match record.packet.kind() {
            PacketKind::Electron => self.electron(record).map(DecodedEvent::Electron),
            PacketKind::Tdc => self.tdc(record).map(DecodedEvent::Tdc),
            PacketKind::GlobalTime => {
                self.global_time(record);
                None
            }
            PacketKind::Ignored(_) => {
                self.counters.ignored_packets.bump();
                None
            }
        }
    }

    fn electron(&mut self, record: &PacketRecord) -> Option<ElectronEvent> {
        let packet = &record.packet;
        let chip = record.chip & 0x3;
        let (x_local, y) = packet.pixel_coordinates();
        let x = REMAP_BASE[chip as usize] - x_local;

        let mut event = ElectronEvent {
            chip,
            x,
            y,
            toa: packet.toa(),
            ftoa: packet.ftoa(),
            tot: packet.tot(),
            spidr: packet.spidr(),
            time: TimeStamp::default(),
        };

        let clock = &mut self.spidr_clocks[chip as usize];
        let regressions = clock.regressions();
        let extended = clock.extend(event.raw_ticks());
        if clock.regressions() > regressions {
            self.counters.clock_regressions.bump();
        }

        let time_ps = extended * CTOA_PS_NUM / 2;
        let correction = match self.calibration.correction(x, y, event.tot, chip) {
            Some(ps) => ps,
            None => {
                self.counters.calibration_misses.bump();
                0
            }
        };
        event.time = TimeStamp::from_ps(time_ps).offset(correction);

        self.counters.electrons.bump();
        Some(event)
    }

    fn tdc(&mut self, record: &PacketRecord) -> Option<TdcEvent> {
        let packet = &record.packet;
        let kind = match TriggerKind::from_pattern(packet.tdc_pattern()) {
            Ok(kind) => kind,
            Err(_) => {
                self.counters.malformed_tdc.bump();
                return None;
            }
        };

        let regressions = self.tdc_clock.regressions();
        let extended = self.tdc_clock.extend(packet.tdc_coarse());
        if self.tdc_clock.regressions() > regressions {
            self.counters.clock_regressions.bump();
        }

        let time_ps = extended * PS_PER_TDC_TICK + packet.tdc_fine() as u64 * PS_PER_TDC_FINE;
        self.counters.tdcs.bump();
        Some(TdcEvent {
            kind,
            counter: packet.tdc_counter(),
            coarse: packet.tdc_coarse(),
            fine: packet.tdc_fine(),
            time: TimeStamp::from_ps(time_ps),
        })
    }

    /// Opportunistic SPIDR epoch resync from the timer LSB packet.
    fn global_time(&mut self, record: &PacketRecord) {
        let packet = &record.packet;
        if packet.timer_subid() != 0x4 {
            return;
        }
        // Timer runs in 25 ns units; one SPIDR epoch is 2^30 of them.
        let combined_ticks = (packet.timer_lsb() as u64) << 4;
        let epochs = combined_ticks / SPIDR_EPOCH_TICKS;
        self.spidr_clocks[(record.chip & 0x3) as usize].resync_epochs(epochs);
    }

    /// Timestamps a photon arrival from the IsiBox sidechannel.
    pub fn photon(&mut self, channel: u8, raw_ticks: u64) -> PhotonEvent {
        let regressions = self.photon_clock.regressions();
        let extended = self.photon_clock.extend(raw_ticks);
        if self.photon_clock.regressions() > regressions {
            self.counters.clock_regressions.bump();
        }
        self.counters.photons.bump();
        PhotonEvent {
            channel: channel & 0x1F,
            time: TimeStamp::from_ps(extended * PS_PER_PHOTON_TICK),
        }
    }

    /// Resets all clock state for a new session; calibration stays.
    pub fn reset(&mut self) {
        for clock in &mut self.spidr_clocks {
            clock.reset();
        }
        self.tdc_clock.reset();
        self.photon_clock.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;

    fn reconstructor() -> EventReconstructor {
        EventReconstructor::new(
            CalibrationTable::default(),
            1_000,
            Arc::new(PipelineCounters::default()),
        )
    }

    fn record(chip: u8, packet: crate::Tpx3Packet) -> PacketRecord {
        PacketRecord { chip, packet }
    }

    #[test]
    fn test_single_electron_chip0_origin() {
        // toa = 0, ftoa = 0xF (inverts to 0), spidr = 0 at local origin:
        // global x mirrors to 255 and the reconstructed time is zero.
        let mut rec = reconstructor();
        let packet = encode::electron(0, 0, 0, 0xF, 0, 0);
        let Some(DecodedEvent::Electron(e)) = rec.process(&record(0, packet)) else {
            panic!("expected an electron");
        };
        assert_eq!(e.x, 255);
        assert_eq!(e.y, 0);
        assert_eq!(e.time.as_ps(), 0);
    }

    #[test]
    fn test_chip_remap_all_chips() {
        let mut rec = reconstructor();
        let mut xs = Vec::new();
        for chip in 0..4u8 {
            let packet = encode::electron(10, 0, 0, 0xF, 0, 0);
            if let Some(DecodedEvent::Electron(e)) = rec.process(&record(chip, packet)) {
                xs.push(e.x);
            }
        }
        assert_eq!(xs, vec![245, 1013, 757, 501]);
    }

    #[test]
    fn test_x_global_stays_in_detector() {
        let mut rec = reconstructor();
        for chip in 0..4u8 {
            for x_local in [0u16, 1, 127, 254, 255] {
                let packet = encode::electron(x_local, 0, 0, 0, 0, 0);
                let Some(DecodedEvent::Electron(e)) = rec.process(&record(chip, packet)) else {
                    panic!("expected an electron");
                };
                assert!(e.x < 1024);
                assert!(e.y < 256);
            }
        }
    }

    #[test]
    fn test_spidr_rollover_keeps_time_monotone() {
        let mut rec = reconstructor();
        let before = encode::electron(0, 0, 0, 0xF, 0, 65_535);
        let after = encode::electron(0, 0, 0, 0xF, 0, 1);

        let Some(DecodedEvent::Electron(e1)) = rec.process(&record(0, before)) else {
            panic!("expected an electron");
        };
        let Some(DecodedEvent::Electron(e2)) = rec.process(&record(0, after)) else {
            panic!("expected an electron");
        };

        assert!(e2.time > e1.time);
        // One epoch step: 26_843_545_600 ns, minus the raw distance.
        let spidr_tick_ps = 409_600_000u64;
        let expected = 26_843_545_600_000 + spidr_tick_ps - 65_535 * spidr_tick_ps;
        assert_eq!(e2.time.as_ps() - e1.time.as_ps(), expected);
    }

    #[test]
    fn test_tdc_time_combines_coarse_and_fine() {
        let mut rec = reconstructor();
        let packet = encode::tdc(0xF, 7, 320_000, 3);
        let Some(DecodedEvent::Tdc(t)) = rec.process(&record(3, packet)) else {
            panic!("expected a TDC event");
        };
        assert_eq!(t.kind, TriggerKind::Tdc1Rising);
        assert_eq!(t.counter, 7);
        // 320_000 * 3.125 ns + 3 * 260 ps
        assert_eq!(t.time.as_ps(), 320_000 * 3_125 + 3 * 260);
    }

    #[test]
    fn test_unknown_trigger_pattern_is_counted() {
        let counters = Arc::new(PipelineCounters::default());
        let mut rec = EventReconstructor::new(
            CalibrationTable::default(),
            1_000,
            Arc::clone(&counters),
        );
        let packet = encode::tdc(0x3, 0, 100, 0);
        assert!(rec.process(&record(0, packet)).is_none());
        assert_eq!(counters.snapshot().malformed_tdc, 1);
        assert_eq!(counters.snapshot().tdcs, 0);
    }

    #[test]
    fn test_calibration_shifts_electron_time() {
        let counters = Arc::new(PipelineCounters::default());
        let mut table = CalibrationTable::default();
        for delay in &mut table.region_delays_ps {
            *delay = 40_000;
        }
        let mut rec = EventReconstructor::new(table, 1_000, counters);
        let packet = encode::electron(0, 0, 0, 0xF, 0, 0);
        let Some(DecodedEvent::Electron(e)) = rec.process(&record(0, packet)) else {
            panic!("expected an electron");
        };
        assert_eq!(e.time.as_ps(), 40_000);
    }

    #[test]
    fn test_ignored_packets_are_counted() {
        let counters = Arc::new(PipelineCounters::default());
        let mut rec = EventReconstructor::new(
            CalibrationTable::default(),
            1_000,
            Arc::clone(&counters),
        );
        let packet = crate::Tpx3Packet::new(0x7000_0000_0000_0000);
        assert!(rec.process(&record(0, packet)).is_none());
        assert_eq!(counters.snapshot().ignored_packets, 1);
    }
}
