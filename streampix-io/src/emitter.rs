//! Snapshot emission scheduling.
//!
//! The hot path publishes finished snapshots into a single-slot
//! mailbox; the emission task drains the slot on its own cadence and
//! serializes to the configured consumers. Publishing over an
//! unconsumed snapshot drops the older one, so a slow consumer can
//! never stall the coincidence loop.

use crate::snapshot::{legacy_text_array, snapshot_frames};
use crate::{Error, Result};
use log::{debug, warn};
use streampix_core::{BankSnapshot, PipelineCounters};
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Consecutive failures before a consumer is considered lost.
const MAX_CONSUMER_FAILURES: u32 = 3;

/// Single-slot snapshot mailbox between the pipeline and the emitter.
#[derive(Default)]
pub struct SnapshotSlot {
    inner: Mutex<Option<BankSnapshot>>,
}

impl SnapshotSlot {
    /// Creates an empty slot.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes a snapshot, dropping an unconsumed predecessor.
    pub fn publish(&self, snapshot: BankSnapshot, counters: &PipelineCounters) {
        let mut slot = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if slot.replace(snapshot).is_some() {
            counters.dropped_snapshots.bump();
            warn!("emission fell behind, dropped pending snapshot");
        }
    }

    /// Takes the pending snapshot, if any.
    pub fn take(&self) -> Option<BankSnapshot> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).take()
    }
}

/// A downstream consumer of emitted snapshots.
///
/// Consumers may fail transiently; the scheduler retries and gives up
/// after [`MAX_CONSUMER_FAILURES`] consecutive errors.
pub trait SnapshotConsumer: Send {
    /// Consumer name for logging.
    fn name(&self) -> &str;

    /// Handles one snapshot.
    fn consume(&mut self, snapshot: &BankSnapshot) -> Result<()>;
}

/// Writes the analysis artifacts the offline scripts load.
///
/// Dense spectra are rewritten each cycle (`spec.txt`, `cspec.txt` as
/// comma-separated text, the delay histograms as packed i64); the
/// filtered-event streams are appended as packed little-endian binary.
pub struct ArtifactWriter {
    dir: PathBuf,
    legacy_text: bool,
}

impl ArtifactWriter {
    /// Creates a writer emitting into `dir`, creating it if needed.
    pub fn create<P: AsRef<Path>>(dir: P, legacy_text: bool) -> Result<Self> {
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
            legacy_text,
        })
    }

    fn rewrite(&self, name: &str, bytes: &[u8]) -> Result<()> {
        let mut writer = BufWriter::new(File::create(self.dir.join(name))?);
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }

    fn append(&self, name: &str, bytes: &[u8]) -> Result<()> {
        if bytes.is_empty() {
            return Ok(());
        }
        let mut writer = BufWriter::new(
            OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.dir.join(name))?,
        );
        writer.write_all(bytes)?;
        writer.flush()?;
        Ok(())
    }
}

fn packed_i64(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn packed_u64(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn packed_u32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn packed_u16(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

impl SnapshotConsumer for ArtifactWriter {
    fn name(&self) -> &str {
        "artifacts"
    }

    fn consume(&mut self, snapshot: &BankSnapshot) -> Result<()> {
        if self.legacy_text {
            self.rewrite("spec.txt", legacy_text_array(&snapshot.spec).as_bytes())?;
            self.rewrite("cspec.txt", legacy_text_array(&snapshot.cspec).as_bytes())?;
        }
        let isi: Vec<i64> = snapshot.isi_g2.iter().map(|&v| v as i64).collect();
        self.rewrite("isi_g2.txt", &packed_i64(&isi))?;
        if let Some(spim) = &snapshot.spim {
            self.rewrite("spim.txt", &packed_u32(spim))?;
        }

        let streams = &snapshot.streams;
        self.append("xH.txt", &packed_u32(&streams.x))?;
        self.append("yH.txt", &packed_u32(&streams.y))?;
        self.append("tH.txt", &packed_i64(&streams.t_rel))?;
        self.append("tabsH.txt", &packed_u64(&streams.t_abs))?;
        self.append("tot.txt", &packed_u16(&streams.tot))?;
        self.append("g2tH.txt", &packed_i64(&streams.g2_t))?;
        self.append("channel.txt", &packed_u32(&streams.channel))?;
        self.append("double_tH.txt", &packed_i64(&streams.double_t))?;
        Ok(())
    }
}

/// Streams framed snapshot arrays to any byte sink, typically the
/// connected client socket.
pub struct FrameConsumer<W: Write + Send> {
    name: String,
    sink: W,
}

impl<W: Write + Send> FrameConsumer<W> {
    /// Wraps a sink under a display name.
    pub fn new(name: impl Into<String>, sink: W) -> Self {
        Self {
            name: name.into(),
            sink,
        }
    }
}

impl<W: Write + Send> SnapshotConsumer for FrameConsumer<W> {
    fn name(&self) -> &str {
        &self.name
    }

    fn consume(&mut self, snapshot: &BankSnapshot) -> Result<()> {
        for frame in snapshot_frames(snapshot) {
            frame.write_to(&mut self.sink)?;
        }
        self.sink.flush()?;
        Ok(())
    }
}

/// The emission task: drains the slot and fans out to consumers.
pub struct EmissionScheduler {
    slot: Arc<SnapshotSlot>,
    consumers: Vec<(Box<dyn SnapshotConsumer>, u32)>,
    poll: Duration,
    lost_consumers: usize,
}

impl EmissionScheduler {
    /// Creates a scheduler over the shared snapshot slot.
    #[must_use]
    pub fn new(slot: Arc<SnapshotSlot>, poll: Duration) -> Self {
        Self {
            slot,
            consumers: Vec::new(),
            poll,
            lost_consumers: 0,
        }
    }

    /// Registers a consumer.
    pub fn add_consumer(&mut self, consumer: Box<dyn SnapshotConsumer>) {
        self.consumers.push((consumer, 0));
    }

    /// Number of registered consumers still alive.
    #[must_use]
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Delivers one snapshot to all consumers, dropping any that keep
    /// failing.
    pub fn deliver(&mut self, snapshot: &BankSnapshot) {
        self.consumers.retain_mut(|(consumer, failures)| {
            match consumer.consume(snapshot) {
                Ok(()) => {
                    *failures = 0;
                    true
                }
                Err(err) => {
                    *failures += 1;
                    warn!(
                        "consumer {} failed ({}/{}): {err}",
                        consumer.name(),
                        failures,
                        MAX_CONSUMER_FAILURES
                    );
                    *failures < MAX_CONSUMER_FAILURES
                }
            }
        });
    }

    /// Runs until `shutdown` is set, then drains one final snapshot.
    ///
    /// Returns an error when every consumer was lost to repeated
    /// failures while at least one had been configured.
    pub fn run(&mut self, shutdown: &AtomicBool) -> Result<()> {
        let had_consumers = !self.consumers.is_empty();

        while !shutdown.load(Ordering::Relaxed) {
            if let Some(snapshot) = self.slot.take() {
                debug!("emitting snapshot seq {}", snapshot.seq);
                let alive = self.consumers.len();
                self.deliver(&snapshot);
                self.lost_consumers += alive - self.consumers.len();
            }
            if had_consumers && self.consumers.is_empty() {
                return Err(Error::ConsumerLost(format!(
                    "{} consumer(s) failed repeatedly",
                    self.lost_consumers
                )));
            }
            std::thread::sleep(self.poll);
        }

        // Final drain on shutdown.
        if let Some(snapshot) = self.slot.take() {
            self.deliver(&snapshot);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use streampix_core::EventStreams;

    fn snapshot(seq: u64) -> BankSnapshot {
        let mut streams = EventStreams::default();
        streams.push(1, 2, -3, 4, 5, 6, 7);
        BankSnapshot {
            seq,
            spec: vec![9, 8],
            cspec: vec![1, 0],
            t_delay: vec![0; 4],
            g2_delay: vec![0; 4],
            isi_g2: vec![2; 4],
            channel: vec![0; 32],
            spim: None,
            streams,
        }
    }

    #[test]
    fn test_slot_drops_oldest() {
        let slot = SnapshotSlot::new();
        let counters = PipelineCounters::default();
        slot.publish(snapshot(1), &counters);
        slot.publish(snapshot(2), &counters);

        assert_eq!(counters.snapshot().dropped_snapshots, 1);
        assert_eq!(slot.take().unwrap().seq, 2);
        assert!(slot.take().is_none());
    }

    #[test]
    fn test_artifact_writer_layout() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = ArtifactWriter::create(dir.path(), true).unwrap();
        writer.consume(&snapshot(1)).unwrap();
        writer.consume(&snapshot(2)).unwrap();

        let spec = std::fs::read_to_string(dir.path().join("spec.txt")).unwrap();
        assert_eq!(spec, "9,8");

        // Streams append across cycles: two rows of 4 bytes each.
        let x = std::fs::read(dir.path().join("xH.txt")).unwrap();
        assert_eq!(x.len(), 8);
        assert_eq!(u32::from_le_bytes(x[0..4].try_into().unwrap()), 1);

        let t = std::fs::read(dir.path().join("tH.txt")).unwrap();
        assert_eq!(i64::from_le_bytes(t[0..8].try_into().unwrap()), -3);

        // Dense arrays are rewritten, not appended.
        let isi = std::fs::read(dir.path().join("isi_g2.txt")).unwrap();
        assert_eq!(isi.len(), 4 * 8);
    }

    #[test]
    fn test_frame_consumer_emits_parseable_frames() {
        let mut bytes = Vec::new();
        {
            let mut consumer = FrameConsumer::new("test", &mut bytes);
            consumer.consume(&snapshot(5)).unwrap();
        }
        let (frame, consumed) = crate::snapshot::Frame::parse(&bytes).unwrap();
        assert_eq!(frame.seq, 5);
        assert!(consumed < bytes.len());
    }

    struct FailingConsumer;

    impl SnapshotConsumer for FailingConsumer {
        fn name(&self) -> &str {
            "failing"
        }
        fn consume(&mut self, _snapshot: &BankSnapshot) -> Result<()> {
            Err(Error::Io(std::io::Error::from(
                std::io::ErrorKind::BrokenPipe,
            )))
        }
    }

    #[test]
    fn test_repeated_failures_drop_consumer() {
        let slot = Arc::new(SnapshotSlot::new());
        let mut scheduler = EmissionScheduler::new(slot, Duration::from_millis(1));
        scheduler.add_consumer(Box::new(FailingConsumer));

        for seq in 0..MAX_CONSUMER_FAILURES as u64 {
            scheduler.deliver(&snapshot(seq));
        }
        assert_eq!(scheduler.consumer_count(), 0);
    }
}
