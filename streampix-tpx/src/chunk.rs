//! Chunk framing and stream decoding.
//!
//! The decoder consumes a growing byte stream, frame-synchronizes on
//! the `TPX3` magic, and emits the 8-byte packets of each chunk payload
//! tagged with the chunk's chip index. Any framing violation discards
//! bytes only up to the next magic and is surfaced through the resync
//! counters, never silently.

use crate::packet::Tpx3Packet;
use log::warn;
use streampix_core::PipelineCounters;
use std::sync::Arc;

/// Magic bytes opening every chunk header.
pub const CHUNK_MAGIC: &[u8; 4] = b"TPX3";

/// Chunk header size on the wire.
pub const HEADER_BYTES: usize = 8;

/// Largest payload a chunk header can carry (`u16::MAX` rounded down to
/// whole packets).
pub const MAX_PAYLOAD_BYTES: usize = 65_528;

/// One packet tagged with the chip that produced it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketRecord {
    /// Chip index from the chunk header.
    pub chip: u8,
    /// The packet, byte-reversed and ready for field extraction.
    pub packet: Tpx3Packet,
}

/// Parsed chunk header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkHeader {
    /// Chip index (0..3).
    pub chip: u8,
    /// Acquisition mode byte, carried through untouched.
    pub mode: u8,
    /// Payload size in bytes; always a multiple of 8.
    pub payload_bytes: usize,
}

impl ChunkHeader {
    /// Parses the 8 header bytes following a verified magic.
    pub(crate) fn parse_at(bytes: &[u8]) -> Option<Self> {
        debug_assert!(bytes.len() >= HEADER_BYTES);
        debug_assert_eq!(&bytes[0..4], CHUNK_MAGIC);

        let chip = bytes[4];
        let mode = bytes[5];
        let payload_bytes = u16::from_le_bytes([bytes[6], bytes[7]]) as usize;
        if chip > 3 || !payload_bytes.is_multiple_of(8) || payload_bytes > MAX_PAYLOAD_BYTES {
            return None;
        }
        Some(Self {
            chip,
            mode,
            payload_bytes,
        })
    }
}

enum DecodeState {
    /// Looking for the next magic.
    Scanning,
    /// Inside a chunk payload with `remaining` bytes to consume.
    InChunk { chip: u8, remaining: usize },
}

/// Incremental TPX3 stream decoder.
///
/// Feed it byte slices as they arrive; it retains unconsumed trailing
/// bytes so the emitted packet sequence is independent of how the
/// stream is split across calls.
pub struct StreamDecoder {
    buf: Vec<u8>,
    state: DecodeState,
    counters: Arc<PipelineCounters>,
    /// True while discarding a contiguous garbage run, so one run is
    /// counted as one resync.
    skipping: bool,
}

impl StreamDecoder {
    /// Creates a decoder reporting into the shared counters.
    #[must_use]
    pub fn new(counters: Arc<PipelineCounters>) -> Self {
        Self {
            buf: Vec::with_capacity(2 * MAX_PAYLOAD_BYTES),
            state: DecodeState::Scanning,
            counters,
            skipping: false,
        }
    }

    /// Number of buffered, not yet consumed bytes.
    #[must_use]
    pub fn pending_bytes(&self) -> usize {
        self.buf.len()
    }

    /// Consumes `bytes`, appending decoded packets to `out`.
    pub fn feed_into(&mut self, bytes: &[u8], out: &mut Vec<PacketRecord>) {
        self.buf.extend_from_slice(bytes);
        let mut cursor = 0;

        loop {
            match self.state {
                DecodeState::Scanning => {
                    match find_magic(&self.buf[cursor..]) {
                        Some(offset) => {
                            if offset > 0 {
                                self.note_skip(offset);
                                cursor += offset;
                            }
                            self.skipping = false;
                            if self.buf.len() - cursor < HEADER_BYTES {
                                break;
                            }
                            match ChunkHeader::parse_at(&self.buf[cursor..]) {
                                Some(header) => {
                                    cursor += HEADER_BYTES;
                                    self.state = DecodeState::InChunk {
                                        chip: header.chip,
                                        remaining: header.payload_bytes,
                                    };
                                }
                                None => {
                                    // Bad header; skip the magic itself and
                                    // rescan from the next byte. The skip run
                                    // that follows belongs to this violation.
                                    self.counters.malformed_chunks.bump();
                                    self.counters.resyncs.bump();
                                    warn!(
                                        "malformed chunk header {:02x?}",
                                        &self.buf[cursor..cursor + HEADER_BYTES]
                                    );
                                    self.counters.resync_bytes.add(1);
                                    self.skipping = true;
                                    cursor += 1;
                                }
                            }
                        }
                        None => {
                            // Keep a possible partial magic at the tail.
                            let keep = partial_magic_len(&self.buf[cursor..]);
                            let dropped = self.buf.len() - cursor - keep;
                            if dropped > 0 {
                                self.note_skip(dropped);
                                cursor = self.buf.len() - keep;
                            }
                            break;
                        }
                    }
                }
                DecodeState::InChunk { chip, remaining } => {
                    let available = self.buf.len() - cursor;
                    let take = available.min(remaining) / 8 * 8;
                    for start in (cursor..cursor + take).step_by(8) {
                        let wire: [u8; 8] = self.buf[start..start + 8].try_into().unwrap();
                        out.push(PacketRecord {
                            chip,
                            packet: Tpx3Packet::from_wire(wire),
                        });
                        self.counters.packets.bump();
                    }
                    cursor += take;
                    let remaining = remaining - take;
                    if remaining == 0 {
                        self.state = DecodeState::Scanning;
                    } else {
                        self.state = DecodeState::InChunk { chip, remaining };
                        break;
                    }
                }
            }
        }

        self.buf.drain(..cursor);
    }

    /// Convenience wrapper returning the decoded packets.
    #[must_use]
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<PacketRecord> {
        let mut out = Vec::new();
        self.feed_into(bytes, &mut out);
        out
    }

    /// Resets all framing state for a new session. Counters are shared
    /// and keep accumulating.
    pub fn reset(&mut self) {
        self.buf.clear();
        self.state = DecodeState::Scanning;
        self.skipping = false;
    }

    fn note_skip(&mut self, dropped: usize) {
        if !self.skipping {
            self.skipping = true;
            self.counters.malformed_chunks.bump();
            self.counters.resyncs.bump();
            warn!("lost framing, discarding up to next magic");
        }
        self.counters.resync_bytes.add(dropped as u64);
    }
}

/// Offset of the first magic in `haystack`, if any.
fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(CHUNK_MAGIC.len())
        .position(|window| window == CHUNK_MAGIC)
}

/// Length of the longest magic prefix ending at the buffer tail.
fn partial_magic_len(tail: &[u8]) -> usize {
    for keep in (1..CHUNK_MAGIC.len()).rev() {
        if tail.len() >= keep && tail[tail.len() - keep..] == CHUNK_MAGIC[..keep] {
            return keep;
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;

    fn decoder() -> (StreamDecoder, Arc<PipelineCounters>) {
        let counters = Arc::new(PipelineCounters::default());
        (StreamDecoder::new(Arc::clone(&counters)), counters)
    }

    #[test]
    fn test_single_chunk_emits_all_packets() {
        let (mut dec, counters) = decoder();
        let packets = [
            encode::electron(1, 2, 3, 0x4, 5, 6),
            encode::electron(7, 8, 9, 0xA, 11, 12),
        ];
        let records = dec.feed(&encode::chunk(0, 0, &packets));

        assert_eq!(records.len(), 2);
        assert_eq!(records[0].chip, 0);
        assert_eq!(records[0].packet, packets[0]);
        assert_eq!(records[1].packet, packets[1]);
        assert_eq!(counters.snapshot().packets, 2);
        assert_eq!(dec.pending_bytes(), 0);
    }

    #[test]
    fn test_split_feeds_match_single_blob() {
        let mut stream = Vec::new();
        for chip in 0..4u8 {
            let packets = [
                encode::electron(10, 20, 30, 0x0, 50, 60),
                encode::tdc(0xF, 0, 1_000, 1),
            ];
            stream.extend_from_slice(&encode::chunk(chip, 0, &packets));
        }

        let (mut whole, _) = decoder();
        let expected = whole.feed(&stream);

        // Re-feed the same stream one byte at a time.
        let (mut split, _) = decoder();
        let mut got = Vec::new();
        for byte in &stream {
            split.feed_into(std::slice::from_ref(byte), &mut got);
        }
        assert_eq!(got, expected);

        // And at an arbitrary boundary inside a header.
        let (mut halves, _) = decoder();
        let mut got = halves.feed(&stream[..13]);
        got.extend(halves.feed(&stream[13..]));
        assert_eq!(got, expected);
    }

    #[test]
    fn test_garbage_prefix_is_one_resync() {
        let (mut dec, counters) = decoder();
        let mut stream = vec![0xFF; 32];
        let packet = encode::electron(3, 4, 5, 0x6, 7, 8);
        stream.extend_from_slice(&encode::chunk(1, 0, &[packet]));

        let records = dec.feed(&stream);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].chip, 1);
        assert_eq!(records[0].packet, packet);

        let snap = counters.snapshot();
        assert_eq!(snap.malformed_chunks, 1);
        assert_eq!(snap.resyncs, 1);
        assert_eq!(snap.resync_bytes, 32);
    }

    #[test]
    fn test_bad_payload_size_resynchronizes() {
        let (mut dec, counters) = decoder();
        // Header with payload_bytes = 7 (not a multiple of 8).
        let mut stream = b"TPX3".to_vec();
        stream.extend_from_slice(&[0, 0, 7, 0]);
        stream.extend_from_slice(&encode::chunk(2, 0, &[encode::tdc(0xF, 0, 5, 0)]));

        let records = dec.feed(&stream);
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].chip, 2);
        assert!(counters.snapshot().malformed_chunks >= 1);
    }

    #[test]
    fn test_payload_sum_matches_header() {
        let (mut dec, counters) = decoder();
        let packets: Vec<_> = (0..37)
            .map(|i| encode::electron(i, 0, i, 0, 0, 0))
            .collect();
        let stream = encode::chunk(3, 0, &packets);
        let payload_bytes = stream.len() - HEADER_BYTES;

        let records = dec.feed(&stream);
        assert_eq!(records.len() * 8, payload_bytes);
        assert_eq!(counters.snapshot().packets * 8, payload_bytes as u64);
    }

    #[test]
    fn test_magic_split_across_feeds_survives() {
        let (mut dec, _) = decoder();
        let stream = encode::chunk(0, 0, &[encode::electron(9, 9, 9, 0x9, 9, 9)]);

        let mut records = dec.feed(&stream[..2]); // "TP"
        assert!(records.is_empty());
        records.extend(dec.feed(&stream[2..]));
        assert_eq!(records.len(), 1);
    }
}
