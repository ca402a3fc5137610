//! Batch decoding of complete on-disk captures.
//!
//! The live path decodes incrementally through [`StreamDecoder`]; for
//! replay and inspection of whole files the chunk table can be scanned
//! up front and the payloads decoded in parallel.

use crate::chunk::{ChunkHeader, PacketRecord, StreamDecoder, CHUNK_MAGIC, HEADER_BYTES};
use crate::packet::Tpx3Packet;
use rayon::prelude::*;
use streampix_core::PipelineCounters;
use std::sync::Arc;

/// Payload location of one chunk inside a mapped capture.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSpan {
    /// Chip index from the header.
    pub chip: u8,
    /// Byte offset of the first payload packet.
    pub payload_start: usize,
    /// Payload length in bytes.
    pub payload_bytes: usize,
}

/// Scans a complete capture for chunk payloads.
///
/// Malformed headers are skipped exactly like the streaming decoder
/// skips them; the scan is sequential and cheap compared to decode.
#[must_use]
pub fn scan_chunks(data: &[u8]) -> Vec<ChunkSpan> {
    let mut spans = Vec::new();
    let mut cursor = 0;

    while cursor + HEADER_BYTES <= data.len() {
        let Some(offset) = find_magic(&data[cursor..]) else {
            break;
        };
        cursor += offset;
        if cursor + HEADER_BYTES > data.len() {
            break;
        }
        match ChunkHeader::parse_at(&data[cursor..]) {
            Some(header) if cursor + HEADER_BYTES + header.payload_bytes <= data.len() => {
                spans.push(ChunkSpan {
                    chip: header.chip,
                    payload_start: cursor + HEADER_BYTES,
                    payload_bytes: header.payload_bytes,
                });
                cursor += HEADER_BYTES + header.payload_bytes;
            }
            _ => {
                cursor += 1;
            }
        }
    }
    spans
}

/// Decodes every packet of a complete capture, chunk payloads in
/// parallel.
#[must_use]
pub fn decode_all(data: &[u8]) -> Vec<PacketRecord> {
    let spans = scan_chunks(data);
    spans
        .par_iter()
        .flat_map_iter(|span| {
            let payload = &data[span.payload_start..span.payload_start + span.payload_bytes];
            payload.chunks_exact(8).map(|bytes| PacketRecord {
                chip: span.chip,
                packet: Tpx3Packet::from_wire(bytes.try_into().unwrap()),
            })
        })
        .collect()
}

/// Streams a capture through a fresh [`StreamDecoder`], for parity
/// checks against [`decode_all`] and for small inputs.
#[must_use]
pub fn decode_sequential(data: &[u8], counters: Arc<PipelineCounters>) -> Vec<PacketRecord> {
    let mut decoder = StreamDecoder::new(counters);
    decoder.feed(data)
}

fn find_magic(haystack: &[u8]) -> Option<usize> {
    haystack
        .windows(CHUNK_MAGIC.len())
        .position(|window| window == CHUNK_MAGIC)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encode;

    fn capture() -> Vec<u8> {
        let mut data = Vec::new();
        for chip in 0..4u8 {
            let packets: Vec<_> = (0..9)
                .map(|i| encode::electron(i + chip as u16, 0, i, 0, 0, 0))
                .collect();
            data.extend_from_slice(&encode::chunk(chip, 0, &packets));
        }
        data
    }

    #[test]
    fn test_scan_finds_all_chunks() {
        let data = capture();
        let spans = scan_chunks(&data);
        assert_eq!(spans.len(), 4);
        assert_eq!(spans[0].payload_bytes, 72);
        assert_eq!(spans[3].chip, 3);
    }

    #[test]
    fn test_parallel_matches_streaming() {
        let data = capture();
        let parallel = decode_all(&data);
        let sequential =
            decode_sequential(&data, Arc::new(PipelineCounters::default()));
        assert_eq!(parallel, sequential);
    }

    #[test]
    fn test_truncated_tail_chunk_is_dropped() {
        let mut data = capture();
        data.extend_from_slice(&encode::chunk(0, 0, &[encode::tdc(0xF, 0, 1, 0)])[..12]);
        let spans = scan_chunks(&data);
        assert_eq!(spans.len(), 4);
    }
}
