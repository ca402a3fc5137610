//! The time-domain coincidence engine.
//!
//! Keeps one bounded window of recent timestamps per trigger kind and
//! matches each electron against the TDC1 rising window, newest first.
//! Electrons are processed in a single pass in reconstruction order;
//! nothing is buffered here beyond the reference windows themselves.

use crate::ring::SlidingWindow;
use streampix_core::{
    AcquisitionConfig, ElectronEvent, PhotonEvent, TdcEvent, TimeStamp, TriggerKind,
};

/// A photon paired with a matched electron.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhotonMatch {
    /// IsiBox channel of the paired photon.
    pub channel: u8,
    /// Electron minus photon time in picoseconds.
    pub delta_ps: i64,
}

/// Correlation results for one electron.
///
/// The trigger scan and the photon/double pairings are independent
/// paths; an electron that misses every reference trigger can still
/// carry a photon partner or close a double-electron cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatchOutcome {
    /// Electron minus trigger time in picoseconds, when a reference
    /// inside the window matched.
    pub trigger_match: Option<i64>,
    /// Nearest photon within the g2 window, when configured.
    pub photon: Option<PhotonMatch>,
    /// Pair delay when this electron closes a double-electron cluster.
    pub double_ps: Option<i64>,
}

impl MatchOutcome {
    /// True when a reference trigger matched.
    #[must_use]
    pub const fn is_matched(&self) -> bool {
        self.trigger_match.is_some()
    }
}

/// Windowed coincidence matcher for one session.
pub struct CoincidenceEngine {
    refs: [SlidingWindow<TimeStamp>; TriggerKind::COUNT],
    photons: SlidingWindow<PhotonEvent>,
    delay_ps: i64,
    width_ps: i64,
    g2_width_ps: Option<i64>,
    double_window_ps: u64,
    double_max_dx: u16,
    previous: Option<ElectronEvent>,
}

impl CoincidenceEngine {
    /// Creates an engine from the session configuration.
    #[must_use]
    pub fn new(config: &AcquisitionConfig) -> Self {
        Self {
            refs: std::array::from_fn(|_| SlidingWindow::new(config.n_ref)),
            photons: SlidingWindow::new(config.n_photon),
            delay_ps: config.delay_ps,
            width_ps: config.width_ps,
            g2_width_ps: config.g2_width_ps,
            double_window_ps: config.double_window_ps,
            double_max_dx: config.double_max_dx,
            previous: None,
        }
    }

    /// Updates the coincidence window, e.g. from a client handshake.
    pub fn set_window(&mut self, delay_ps: i64, width_ps: i64) {
        self.delay_ps = delay_ps;
        self.width_ps = width_ps.max(1);
    }

    /// Registers a trigger in its reference window.
    pub fn process_tdc(&mut self, tdc: &TdcEvent) {
        self.refs[tdc.kind.index()].push(tdc.time);
    }

    /// Registers a photon arrival for the g2 paths.
    pub fn process_photon(&mut self, photon: &PhotonEvent) {
        self.photons.push(*photon);
    }

    /// Correlates one electron: the TDC1 rising window scan plus the
    /// photon and double-electron pairings, each independent of the
    /// others.
    ///
    /// The trigger scan runs newest to oldest and takes the first
    /// reference inside `[delay, delay + width]`; a later trigger
    /// therefore wins over an earlier one covering the same electron.
    pub fn process_electron(&mut self, event: &ElectronEvent) -> MatchOutcome {
        let trigger_match = self
            .refs[TriggerKind::Tdc1Rising.index()]
            .iter_newest_first()
            .map(|reference| event.time.delta(reference))
            .find(|delta| (self.delay_ps..=self.delay_ps + self.width_ps).contains(delta));

        let outcome = MatchOutcome {
            trigger_match,
            photon: self.nearest_photon(event),
            double_ps: self.double_delay(event),
        };
        self.previous = Some(*event);
        outcome
    }

    /// Electrons arriving before this time can no longer match any
    /// retained reference and may be flushed immediately upstream.
    #[must_use]
    pub fn horizon(&self) -> Option<TimeStamp> {
        self.refs[TriggerKind::Tdc1Rising.index()]
            .oldest()
            .map(|oldest| oldest.offset(self.delay_ps.saturating_add(self.width_ps)))
    }

    fn nearest_photon(&self, event: &ElectronEvent) -> Option<PhotonMatch> {
        let width = self.g2_width_ps?;
        let nearest = self
            .photons
            .iter_newest_first()
            .min_by_key(|photon| photon.time.abs_diff(&event.time))?;
        let delta_ps = event.time.delta(&nearest.time);
        (delta_ps.abs() <= width).then_some(PhotonMatch {
            channel: nearest.channel,
            delta_ps,
        })
    }

    fn double_delay(&self, event: &ElectronEvent) -> Option<i64> {
        let previous = self.previous.as_ref()?;
        let close_in_time = event.time.abs_diff(&previous.time) <= self.double_window_ps;
        let close_in_x = event.x.abs_diff(previous.x) <= self.double_max_dx;
        (close_in_time && close_in_x).then(|| event.time.delta(&previous.time))
    }

    /// Clears all windows for a new session.
    pub fn reset(&mut self) {
        for window in &mut self.refs {
            window.clear();
        }
        self.photons.clear();
        self.previous = None;
    }
}
