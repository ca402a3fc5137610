//! streampix-coincidence: Windowed coincidence matching.
//!
//! This crate provides the time-domain correlation stage of the
//! pipeline:
//! - **CoincidenceEngine** - matches electrons against bounded windows
//!   of recent TDC triggers, newest first
//! - **PhotonCorrelator** - symmetric photon-photon g2 across two
//!   IsiBox channels
//! - **SlidingWindow** - the bounded FIFO both are built on

mod engine;
mod g2;
mod ring;

pub use engine::{CoincidenceEngine, MatchOutcome, PhotonMatch};
pub use g2::PhotonCorrelator;
pub use ring::SlidingWindow;
