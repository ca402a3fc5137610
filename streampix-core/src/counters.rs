//! Pipeline observability counters.
//!
//! A single [`PipelineCounters`] instance is shared across the decode,
//! coincidence, and emission tasks via `Arc`. All counters are relaxed
//! atomics: they order nothing, they only have to end up correct.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};

/// One relaxed monotone event counter.
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    /// Increments by one.
    #[inline]
    pub fn bump(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    /// Adds `n`.
    #[inline]
    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    /// Current value.
    #[inline]
    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

macro_rules! counters {
    ($($(#[$doc:meta])* $name:ident),+ $(,)?) => {
        /// Live counters mutated by the pipeline tasks.
        #[derive(Debug, Default)]
        pub struct PipelineCounters {
            $($(#[$doc])* pub $name: Counter,)+
        }

        /// Point-in-time copy of all counters.
        #[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
        pub struct CounterSnapshot {
            $($(#[$doc])* pub $name: u64,)+
        }

        impl PipelineCounters {
            /// Takes a consistent-enough copy for reporting.
            #[must_use]
            pub fn snapshot(&self) -> CounterSnapshot {
                CounterSnapshot {
                    $($name: self.$name.get(),)+
                }
            }
        }
    };
}

counters! {
    /// Packets of any kind decoded from chunk payloads.
    packets,
    /// Electron hit packets decoded.
    electrons,
    /// TDC trigger packets decoded.
    tdcs,
    /// Packets with an id nibble the pipeline does not process.
    ignored_packets,
    /// Chunks rejected before payload decode.
    malformed_chunks,
    /// TDC packets with an unknown trigger pattern.
    malformed_tdc,
    /// Per-packet decode failures recovered in-stream.
    decode_errors,
    /// Magic re-scans after an invariant violation.
    resyncs,
    /// Bytes discarded while scanning for the next magic.
    resync_bytes,
    /// Clock backsteps beyond the configured slack.
    clock_regressions,
    /// Electrons whose pixel fell outside the calibration grid.
    calibration_misses,
    /// Histogram increments dropped for an out-of-range bin.
    out_of_range_bins,
    /// Electrons dropped by coincidence back-pressure.
    dropped_events,
    /// Snapshots dropped by a slow downstream consumer.
    dropped_snapshots,
    /// Electrons matched against a reference trigger.
    matched,
    /// Electrons that left the window unmatched.
    unmatched,
    /// Photon events taken from the sidechannel.
    photons,
}

impl CounterSnapshot {
    /// One-line summary for session-end reporting.
    #[must_use]
    pub fn summary(&self) -> String {
        format!(
            "packets={} electrons={} tdcs={} matched={} unmatched={} \
             resyncs={} decode_errors={} dropped_events={} dropped_snapshots={}",
            self.packets,
            self.electrons,
            self.tdcs,
            self.matched,
            self.unmatched,
            self.resyncs,
            self.decode_errors,
            self.dropped_events,
            self.dropped_snapshots,
        )
    }
}
