//! Replay sources for on-disk captures.
//!
//! A single `.tpx3` file is memory-mapped and fed through the pipeline
//! in slices; a capture folder is replayed file by file in sequence
//! order, optionally synthesizing a TDC1 rising trigger between files
//! the way the folder streaming utility does.

use crate::{Error, Result};
use memmap2::Mmap;
use streampix_core::TriggerKind;
use streampix_tpx::encode;
use std::fs::File;
use std::path::{Path, PathBuf};

/// A memory-mapped raw capture file.
pub struct MappedCapture {
    mmap: Mmap,
}

impl MappedCapture {
    /// Opens a capture for memory-mapped reading.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path)?;
        // Safety: the capture is only read, never resized while mapped.
        #[allow(unsafe_code)]
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { mmap })
    }

    /// The raw capture bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    /// Capture size in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    /// True for an empty capture.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Iterates the capture in feed-sized slices.
    pub fn slices(&self, slice_bytes: usize) -> impl Iterator<Item = &[u8]> {
        self.mmap.chunks(slice_bytes.max(8))
    }
}

/// Replays a folder of sequence captures (`*_000NNN.tpx3`).
pub struct FolderReplay {
    files: Vec<PathBuf>,
    next: usize,
    synthetic_tdc: Option<SyntheticTdc>,
}

/// State for the synthesized inter-file trigger.
struct SyntheticTdc {
    interval_ps: u64,
    elapsed_ps: u64,
    counter: u16,
}

impl FolderReplay {
    /// Scans `dir` for `.tpx3` files and orders them by name, which
    /// sorts the zero-padded sequence numbering correctly.
    pub fn open<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let mut files: Vec<PathBuf> = std::fs::read_dir(&dir)?
            .filter_map(std::result::Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "tpx3"))
            .collect();
        files.sort();
        if files.is_empty() {
            return Err(Error::InvalidFormat(format!(
                "no .tpx3 files under {}",
                dir.as_ref().display()
            )));
        }
        Ok(Self {
            files,
            next: 0,
            synthetic_tdc: None,
        })
    }

    /// Synthesizes one TDC1 rising trigger after each file, advancing a
    /// virtual clock by `interval_ps` per file.
    #[must_use]
    pub fn with_synthetic_tdc(mut self, interval_ps: u64) -> Self {
        self.synthetic_tdc = Some(SyntheticTdc {
            interval_ps,
            elapsed_ps: 0,
            counter: 0,
        });
        self
    }

    /// Number of capture files found.
    #[must_use]
    pub fn file_count(&self) -> usize {
        self.files.len()
    }

    /// Reads the next blob to feed, or `None` at the end.
    pub fn next_blob(&mut self) -> Result<Option<Vec<u8>>> {
        let Some(path) = self.files.get(self.next) else {
            return Ok(None);
        };
        self.next += 1;

        let mut data = std::fs::read(path)?;
        if let Some(synth) = &mut self.synthetic_tdc {
            synth.elapsed_ps += synth.interval_ps;
            let coarse = synth.elapsed_ps / 3_125;
            let packet = encode::trigger(TriggerKind::Tdc1Rising, synth.counter, coarse, 0);
            synth.counter = (synth.counter + 1) & 0xFFF;
            data.extend_from_slice(&encode::chunk(0, 0, &[packet]));
        }
        Ok(Some(data))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use streampix_tpx::{decode_all, PacketKind};

    fn write_capture(path: &Path) {
        let packets = [encode::electron(5, 6, 7, 0x8, 9, 10)];
        let mut file = File::create(path).unwrap();
        file.write_all(&encode::chunk(0, 0, &packets)).unwrap();
    }

    #[test]
    fn test_mapped_capture_slices() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.tpx3");
        write_capture(&path);

        let capture = MappedCapture::open(&path).unwrap();
        assert_eq!(capture.len(), 16);
        let slices: Vec<_> = capture.slices(8).collect();
        assert_eq!(slices.len(), 2);
    }

    #[test]
    fn test_folder_replay_orders_by_sequence() {
        let dir = tempfile::tempdir().unwrap();
        for i in [2, 0, 1] {
            write_capture(&dir.path().join(format!("tdc_check_000{i:03}.tpx3")));
        }

        let mut replay = FolderReplay::open(dir.path()).unwrap();
        assert_eq!(replay.file_count(), 3);
        let mut blobs = 0;
        while replay.next_blob().unwrap().is_some() {
            blobs += 1;
        }
        assert_eq!(blobs, 3);
    }

    #[test]
    fn test_synthetic_tdc_appended_per_file() {
        let dir = tempfile::tempdir().unwrap();
        write_capture(&dir.path().join("tdc_check_000000.tpx3"));

        let mut replay = FolderReplay::open(dir.path())
            .unwrap()
            .with_synthetic_tdc(1_000_000_000);
        let blob = replay.next_blob().unwrap().unwrap();
        let records = decode_all(&blob);
        assert_eq!(records.len(), 2);
        assert_eq!(records[1].packet.kind(), PacketKind::Tdc);
        // 1 ms at 3.125 ns per coarse tick.
        assert_eq!(records[1].packet.tdc_coarse(), 320_000);
    }

    #[test]
    fn test_empty_folder_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(FolderReplay::open(dir.path()).is_err());
    }
}
