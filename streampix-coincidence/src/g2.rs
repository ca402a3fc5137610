//! Photon-photon correlation across two IsiBox channels.
//!
//! A symmetric g2: each photon on one channel is correlated against the
//! buffered recent photons of the other channel, producing signed
//! delays inside the correlation window. Buffers are bounded, so memory
//! use is independent of the photon rate.

use crate::ring::SlidingWindow;
use streampix_core::PhotonEvent;

/// Cross-correlator for one channel pair.
pub struct PhotonCorrelator {
    channel_a: u8,
    channel_b: u8,
    window_ps: u64,
    buffer_a: SlidingWindow<u64>,
    buffer_b: SlidingWindow<u64>,
    scratch: Vec<i64>,
}

impl PhotonCorrelator {
    /// Creates a correlator between `channel_a` and `channel_b` with a
    /// symmetric window of `window_ps` and bounded buffers.
    #[must_use]
    pub fn new(channel_a: u8, channel_b: u8, window_ps: u64, capacity: usize) -> Self {
        Self {
            channel_a,
            channel_b,
            window_ps,
            buffer_a: SlidingWindow::new(capacity),
            buffer_b: SlidingWindow::new(capacity),
            scratch: Vec::with_capacity(capacity),
        }
    }

    /// Feeds one photon and returns the delays `t_a - t_b` it closes
    /// within the window. The slice is valid until the next call.
    pub fn process(&mut self, photon: &PhotonEvent) -> &[i64] {
        self.scratch.clear();
        let t = photon.time.as_ps();

        if photon.channel == self.channel_a {
            for &other in self.buffer_b.iter_newest_first() {
                let delta = t.abs_diff(other);
                if delta > self.window_ps {
                    // Entries only get older from here.
                    break;
                }
                self.scratch
                    .push(if t >= other { delta as i64 } else { -(delta as i64) });
            }
            self.buffer_a.push(t);
        } else if photon.channel == self.channel_b {
            for &other in self.buffer_a.iter_newest_first() {
                let delta = t.abs_diff(other);
                if delta > self.window_ps {
                    break;
                }
                self.scratch
                    .push(if other >= t { delta as i64 } else { -(delta as i64) });
            }
            self.buffer_b.push(t);
        }

        &self.scratch
    }

    /// Clears both buffers for a new session.
    pub fn reset(&mut self) {
        self.buffer_a.clear();
        self.buffer_b.clear();
        self.scratch.clear();
    }
}
