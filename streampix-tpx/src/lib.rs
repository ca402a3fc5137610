//! streampix-tpx: TPX3 wire-format decoding and event reconstruction.
//!
//! This crate turns the raw detector byte stream into globally-timed
//! events: chunk framing with magic resynchronization, 64-bit packet
//! field extraction, chip-geometry remapping, and clock extension.

mod batch;
mod chunk;
pub mod encode;
mod error;
mod packet;
mod reconstruct;

pub use batch::{decode_all, decode_sequential, scan_chunks, ChunkSpan};
pub use chunk::{ChunkHeader, PacketRecord, StreamDecoder, CHUNK_MAGIC, MAX_PAYLOAD_BYTES};
pub use error::{Error, Result};
pub use packet::{PacketKind, Tpx3Packet};
pub use reconstruct::{DecodedEvent, EventReconstructor};
