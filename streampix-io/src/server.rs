//! Live acquisition session over TCP.
//!
//! Three cooperating tasks, single-writer everywhere:
//! - a receive task reads the detector socket and forwards byte batches
//!   through a bounded channel (drop-newest on overflow),
//! - the pipeline task drains the channel and drives the hot path,
//! - the emission task serializes snapshots to the configured
//!   consumers.
//!
//! The pipeline task never blocks on I/O and the receive task never
//! blocks on the pipeline.

use crate::emitter::{ArtifactWriter, EmissionScheduler, FrameConsumer, SnapshotSlot};
use crate::handshake::{Handshake, HANDSHAKE_LEN};
use crate::pipeline::Pipeline;
use crate::{Error, Result};
use log::{debug, info, warn};
use streampix_core::{AcquisitionConfig, CalibrationTable, CounterSnapshot};
use std::io::Read;
use std::net::{TcpListener, TcpStream, ToSocketAddrs};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, RecvTimeoutError, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

/// Receive buffer size for one upstream read.
const RECV_BUF_BYTES: usize = 64 * 1024;

/// Bounded depth of the byte-batch channel between the receive task and
/// the pipeline task.
const INGEST_QUEUE_DEPTH: usize = 256;

/// Per-recv timeout; expiry only yields control, it drops nothing.
const RECV_TIMEOUT: Duration = Duration::from_millis(5);

/// How a finished session should be reported to the operating system.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionExit {
    /// Clean shutdown.
    Clean,
    /// The malformed-stream recovery budget was exhausted.
    MalformedFatal,
    /// The downstream consumer disconnected repeatedly.
    ConsumerLost,
    /// The session could not be configured.
    ConfigError,
}

impl SessionExit {
    /// Process exit code per the session contract.
    #[must_use]
    pub const fn code(&self) -> i32 {
        match self {
            Self::Clean => 0,
            Self::MalformedFatal => 1,
            Self::ConsumerLost => 2,
            Self::ConfigError => 3,
        }
    }

    /// Maps a session error onto its exit code.
    #[must_use]
    pub fn from_error(error: &Error) -> Self {
        match error {
            Error::WireError(streampix_tpx::Error::ResyncBudgetExhausted(_)) => {
                Self::MalformedFatal
            }
            Error::ConsumerLost(_) => Self::ConsumerLost,
            Error::CoreError(_) => Self::ConfigError,
            _ => Self::MalformedFatal,
        }
    }
}

/// One live acquisition session.
pub struct LiveSession {
    config: AcquisitionConfig,
    calibration: CalibrationTable,
    /// Where to write analysis artifacts; `None` disables the writer.
    output_dir: Option<PathBuf>,
}

impl LiveSession {
    /// Creates a session description.
    #[must_use]
    pub fn new(config: AcquisitionConfig, calibration: CalibrationTable) -> Self {
        Self {
            config,
            calibration,
            output_dir: None,
        }
    }

    /// Also writes analysis artifacts into `dir` each emission cycle.
    #[must_use]
    pub fn with_output_dir(mut self, dir: PathBuf) -> Self {
        self.output_dir = Some(dir);
        self
    }

    /// Accepts one client on `listen_addr` (reading its handshake),
    /// connects to the detector at `upstream_addr`, and runs the
    /// session until the upstream disconnects or `shutdown` is set.
    pub fn run<A: ToSocketAddrs, B: ToSocketAddrs>(
        mut self,
        listen_addr: Option<A>,
        upstream_addr: B,
        shutdown: Arc<AtomicBool>,
    ) -> Result<CounterSnapshot> {
        let client = match listen_addr {
            Some(addr) => Some(self.accept_client(addr)?),
            None => None,
        };

        let upstream = TcpStream::connect(upstream_addr)?;
        upstream.set_read_timeout(Some(RECV_TIMEOUT))?;
        info!("upstream connected: {:?}", upstream.peer_addr());

        let mut pipeline = Pipeline::new(self.config.clone(), self.calibration.clone())?;
        let counters = pipeline.counters();

        // Emission task.
        let slot = Arc::new(SnapshotSlot::new());
        let mut scheduler = EmissionScheduler::new(
            Arc::clone(&slot),
            Duration::from_millis(self.config.emission_period_ms / 4 + 1),
        );
        if let Some(dir) = &self.output_dir {
            scheduler.add_consumer(Box::new(ArtifactWriter::create(
                dir,
                self.config.legacy_text,
            )?));
        }
        if let Some(client) = client {
            let name = format!("client {:?}", client.peer_addr());
            scheduler.add_consumer(Box::new(FrameConsumer::new(name, client)));
        }
        let emitter_shutdown = Arc::clone(&shutdown);
        let emitter = thread::spawn(move || scheduler.run(&emitter_shutdown));

        // Receive task.
        let (batch_tx, batch_rx) = sync_channel::<Vec<u8>>(INGEST_QUEUE_DEPTH);
        let recv_counters = Arc::clone(&counters);
        let recv_shutdown = Arc::clone(&shutdown);
        let receiver = thread::spawn(move || {
            let mut upstream = upstream;
            let mut buf = vec![0u8; RECV_BUF_BYTES];
            while !recv_shutdown.load(Ordering::Relaxed) {
                match upstream.read(&mut buf) {
                    Ok(0) => {
                        debug!("upstream closed");
                        break;
                    }
                    Ok(n) => match batch_tx.try_send(buf[..n].to_vec()) {
                        Ok(()) => {}
                        Err(TrySendError::Full(_)) => {
                            // Pipeline is behind; shed the newest batch.
                            recv_counters.dropped_events.bump();
                        }
                        Err(TrySendError::Disconnected(_)) => break,
                    },
                    Err(e)
                        if e.kind() == std::io::ErrorKind::WouldBlock
                            || e.kind() == std::io::ErrorKind::TimedOut =>
                    {
                        // Idle link; nothing to drop.
                    }
                    Err(e) => {
                        warn!("upstream read failed: {e}");
                        break;
                    }
                }
            }
            // Dropping the sender ends the pipeline loop.
        });

        // Pipeline task, on this thread.
        let result = drive(&mut pipeline, &batch_rx, &slot, &shutdown);

        // Publish the final snapshot before signalling shutdown so the
        // emitter delivers it either in its loop or in its final drain.
        slot.publish(pipeline.snapshot(), &counters);
        shutdown.store(true, Ordering::Relaxed);
        receiver.join().map_err(|_| {
            Error::UpstreamDisconnect("receive task panicked".into())
        })?;
        let emitter_result = emitter
            .join()
            .map_err(|_| Error::ConsumerLost("emission task panicked".into()))?;

        let report = pipeline.report();
        info!("session finished: {}", report.summary());
        result?;
        emitter_result?;
        Ok(report)
    }

    /// Waits for one downstream client and applies its handshake, when
    /// it sends one, onto the session configuration.
    fn accept_client<A: ToSocketAddrs>(&mut self, addr: A) -> Result<TcpStream> {
        let listener = TcpListener::bind(addr)?;
        info!("waiting for client on {:?}", listener.local_addr());
        let (mut stream, peer) = listener.accept()?;
        info!("client connected: {peer}");

        stream.set_read_timeout(Some(Duration::from_millis(200)))?;
        let mut buf = [0u8; HANDSHAKE_LEN];
        let mut filled = 0;
        while filled < HANDSHAKE_LEN {
            match stream.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e)
                    if e.kind() == std::io::ErrorKind::WouldBlock
                        || e.kind() == std::io::ErrorKind::TimedOut =>
                {
                    break;
                }
                Err(e) => return Err(e.into()),
            }
        }

        if filled == HANDSHAKE_LEN {
            let handshake = Handshake::decode(&buf)?;
            handshake.apply(&mut self.config)?;
            info!("handshake applied: {handshake:?}");
        } else if filled > 0 {
            warn!("short handshake ({filled} bytes), using defaults");
        } else {
            debug!("no handshake, using defaults");
        }
        Ok(stream)
    }
}

/// The pipeline loop: drain byte batches, snapshot on the emission
/// triggers. Ends when the receive task hangs up or `shutdown` is set.
fn drive(
    pipeline: &mut Pipeline,
    batches: &Receiver<Vec<u8>>,
    slot: &SnapshotSlot,
    shutdown: &AtomicBool,
) -> Result<()> {
    let counters = pipeline.counters();
    while !shutdown.load(Ordering::Relaxed) {
        match batches.recv_timeout(RECV_TIMEOUT) {
            Ok(batch) => pipeline.ingest(&batch)?,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break,
        }
        if pipeline.emission_due() {
            slot.publish(pipeline.snapshot(), &counters);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::net::TcpListener;
    use streampix_tpx::encode;

    #[test]
    fn test_exit_code_mapping() {
        assert_eq!(SessionExit::Clean.code(), 0);
        assert_eq!(SessionExit::MalformedFatal.code(), 1);
        assert_eq!(SessionExit::ConsumerLost.code(), 2);
        assert_eq!(SessionExit::ConfigError.code(), 3);

        let err = Error::WireError(streampix_tpx::Error::ResyncBudgetExhausted(9));
        assert_eq!(SessionExit::from_error(&err), SessionExit::MalformedFatal);
        let err = Error::ConsumerLost("gone".into());
        assert_eq!(SessionExit::from_error(&err), SessionExit::ConsumerLost);
    }

    #[test]
    fn test_session_against_mock_upstream() {
        // A minimal scripted detector: accepts, sends two chunks, closes.
        let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
        let upstream_addr = upstream.local_addr().unwrap();
        let feeder = thread::spawn(move || {
            let (mut conn, _) = upstream.accept().unwrap();
            let chunk = encode::chunk(
                0,
                0,
                &[
                    encode::trigger(streampix_core::TriggerKind::Tdc1Rising, 0, 320_000, 0),
                    encode::electron(10, 20, 100, 0xF, 30, 3),
                ],
            );
            conn.write_all(&chunk).unwrap();
            conn.flush().unwrap();
            // Closing the connection ends the session cleanly.
        });

        let dir = tempfile::tempdir().unwrap();
        let session = LiveSession::new(
            AcquisitionConfig::default(),
            CalibrationTable::default(),
        )
        .with_output_dir(dir.path().to_path_buf());

        let shutdown = Arc::new(AtomicBool::new(false));
        let report = session
            .run(None::<&str>, upstream_addr, shutdown)
            .unwrap();

        feeder.join().unwrap();
        assert_eq!(report.packets, 2);
        assert_eq!(report.electrons, 1);
        assert_eq!(report.tdcs, 1);
        assert!(dir.path().join("spec.txt").exists());
    }
}
