//! streampix-core: Core types for the streampix TPX3 coincidence pipeline.
//!
//! This crate provides the foundational abstractions shared by the wire
//! decoder, the coincidence engine, and the emission layer: timestamped
//! event types, per-domain clock rollover tracking, the calibration delay
//! table, the histogram bank, and the pipeline observability counters.

mod calibration;
mod clock;
mod config;
mod counters;
mod error;
mod event;
mod histogram;

pub use calibration::{CalibrationTable, RegionDivision};
pub use clock::{ClockTracker, PHOTON_EPOCH_TICKS, SPIDR_EPOCH_TICKS, TDC_EPOCH_TICKS};
pub use config::{AcquisitionConfig, RunMode};
pub use counters::{Counter, CounterSnapshot, PipelineCounters};
pub use error::{Error, Result};
pub use event::{
    ElectronEvent, PhotonEvent, TdcEvent, TimeStamp, TriggerKind, PS_PER_PHOTON_TICK,
    PS_PER_SPIDR_TICK, PS_PER_TDC_FINE, PS_PER_TDC_TICK,
};
pub use histogram::{
    BankSnapshot, DelayHistogram, EventStreams, Histogram, HistogramBank, SpimAccumulator,
    G2_NONE, NO_CHANNEL,
};
