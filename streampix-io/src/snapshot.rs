//! Snapshot frame serialization.
//!
//! Every emitted array travels as a 32-byte header followed by the
//! little-endian packed elements. The header carries the array
//! identity, element type, element count, the snapshot sequence
//! number, and a CRC32 over the payload:
//!
//! ```text
//! [0xA5 'T' 'P' 'X' 'H' ver array_id dtype] [len u32] [seq u64] [crc u32] [reserved; 8]
//! ```

use crate::{Error, Result};
use streampix_core::BankSnapshot;
use std::io::Write;

/// First header byte.
pub const FRAME_SENTINEL: u8 = 0xA5;
/// Header magic following the sentinel.
pub const FRAME_MAGIC: &[u8; 4] = b"TPXH";
/// Current frame format version.
pub const FRAME_VERSION: u8 = 1;
/// Serialized header size.
pub const HEADER_LEN: usize = 32;

/// Identity of an emitted array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ArrayId {
    /// Total spectrum (dense).
    Spec = 0,
    /// Coincidence spectrum (dense).
    Cspec = 1,
    /// Electron-to-trigger delay histogram (dense).
    TDelay = 2,
    /// Electron-to-photon delay histogram (dense).
    G2Delay = 3,
    /// Photon-photon delay histogram (dense).
    IsiG2 = 4,
    /// Per-channel photon counts (dense).
    Channel = 5,
    /// Spectrum image (dense, mode 2).
    Spim = 6,
    /// Filtered-event x stream.
    XStream = 7,
    /// Filtered-event y stream.
    YStream = 8,
    /// Filtered-event delay stream.
    TRelStream = 9,
    /// Filtered-event absolute-time stream.
    TAbsStream = 10,
    /// Filtered-event ToT stream.
    TotStream = 11,
    /// Filtered-event photon-delay stream.
    G2Stream = 12,
    /// Filtered-event channel stream.
    ChannelStream = 13,
    /// Double-electron delay stream.
    DoubleStream = 14,
}

/// Element type of an emitted array.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ElemType {
    /// Unsigned 8-bit.
    U8 = 0,
    /// Unsigned 16-bit little-endian.
    U16 = 1,
    /// Unsigned 32-bit little-endian.
    U32 = 2,
    /// Unsigned 64-bit little-endian.
    U64 = 3,
    /// Signed 16-bit little-endian.
    I16 = 4,
    /// Signed 64-bit little-endian.
    I64 = 5,
}

impl ElemType {
    /// Element size in bytes.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            Self::U8 => 1,
            Self::U16 | Self::I16 => 2,
            Self::U32 => 4,
            Self::U64 | Self::I64 => 8,
        }
    }
}

/// One serialized array frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Array identity.
    pub array_id: ArrayId,
    /// Element type of the payload.
    pub elem_type: ElemType,
    /// Snapshot sequence number.
    pub seq: u64,
    /// Little-endian packed elements.
    pub payload: Vec<u8>,
}

impl Frame {
    /// Number of elements in the payload.
    #[must_use]
    pub fn elem_count(&self) -> u32 {
        (self.payload.len() / self.elem_type.size()) as u32
    }

    /// Serializes the 32-byte header.
    #[must_use]
    pub fn header(&self) -> [u8; HEADER_LEN] {
        let mut header = [0u8; HEADER_LEN];
        header[0] = FRAME_SENTINEL;
        header[1..5].copy_from_slice(FRAME_MAGIC);
        header[5] = FRAME_VERSION;
        header[6] = self.array_id as u8;
        header[7] = self.elem_type as u8;
        header[8..12].copy_from_slice(&self.elem_count().to_le_bytes());
        header[12..20].copy_from_slice(&self.seq.to_le_bytes());
        header[20..24].copy_from_slice(&crc32fast::hash(&self.payload).to_le_bytes());
        header
    }

    /// Writes header and payload to `sink`.
    pub fn write_to<W: Write>(&self, sink: &mut W) -> Result<()> {
        sink.write_all(&self.header())?;
        sink.write_all(&self.payload)?;
        Ok(())
    }

    /// Parses a frame back from `bytes`, returning the frame and the
    /// number of bytes consumed. Used by consumers and the round-trip
    /// tests.
    pub fn parse(bytes: &[u8]) -> Result<(Self, usize)> {
        if bytes.len() < HEADER_LEN {
            return Err(Error::InvalidFormat("short frame header".into()));
        }
        if bytes[0] != FRAME_SENTINEL || &bytes[1..5] != FRAME_MAGIC {
            return Err(Error::InvalidFormat("bad frame magic".into()));
        }
        if bytes[5] != FRAME_VERSION {
            return Err(Error::InvalidFormat(format!(
                "unsupported frame version {}",
                bytes[5]
            )));
        }
        let array_id = ArrayId::from_u8(bytes[6])?;
        let elem_type = ElemType::from_u8(bytes[7])?;
        let elem_count = u32::from_le_bytes(bytes[8..12].try_into().unwrap()) as usize;
        let seq = u64::from_le_bytes(bytes[12..20].try_into().unwrap());
        let crc = u32::from_le_bytes(bytes[20..24].try_into().unwrap());

        let payload_len = elem_count * elem_type.size();
        let total = HEADER_LEN + payload_len;
        if bytes.len() < total {
            return Err(Error::InvalidFormat("truncated frame payload".into()));
        }
        let payload = bytes[HEADER_LEN..total].to_vec();
        if crc32fast::hash(&payload) != crc {
            return Err(Error::InvalidFormat("frame checksum mismatch".into()));
        }
        Ok((
            Self {
                array_id,
                elem_type,
                seq,
                payload,
            },
            total,
        ))
    }
}

impl ArrayId {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::Spec,
            1 => Self::Cspec,
            2 => Self::TDelay,
            3 => Self::G2Delay,
            4 => Self::IsiG2,
            5 => Self::Channel,
            6 => Self::Spim,
            7 => Self::XStream,
            8 => Self::YStream,
            9 => Self::TRelStream,
            10 => Self::TAbsStream,
            11 => Self::TotStream,
            12 => Self::G2Stream,
            13 => Self::ChannelStream,
            14 => Self::DoubleStream,
            other => {
                return Err(Error::InvalidFormat(format!("unknown array id {other}")));
            }
        })
    }
}

impl ElemType {
    fn from_u8(value: u8) -> Result<Self> {
        Ok(match value {
            0 => Self::U8,
            1 => Self::U16,
            2 => Self::U32,
            3 => Self::U64,
            4 => Self::I16,
            5 => Self::I64,
            other => {
                return Err(Error::InvalidFormat(format!("unknown element type {other}")));
            }
        })
    }
}

fn pack_u16(values: &[u16]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn pack_u32(values: &[u32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn pack_u64(values: &[u64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn pack_i64(values: &[i64]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

/// Serializes a bank snapshot into its array frames.
///
/// Dense histograms are always present; stream frames are emitted only
/// when they drained any rows this cycle.
#[must_use]
pub fn snapshot_frames(snapshot: &BankSnapshot) -> Vec<Frame> {
    let seq = snapshot.seq;
    let frame = |array_id, elem_type, payload| Frame {
        array_id,
        elem_type,
        seq,
        payload,
    };

    let mut frames = vec![
        frame(ArrayId::Spec, ElemType::U64, pack_u64(&snapshot.spec)),
        frame(ArrayId::Cspec, ElemType::U64, pack_u64(&snapshot.cspec)),
        frame(ArrayId::TDelay, ElemType::U64, pack_u64(&snapshot.t_delay)),
        frame(ArrayId::G2Delay, ElemType::U64, pack_u64(&snapshot.g2_delay)),
        frame(ArrayId::IsiG2, ElemType::U64, pack_u64(&snapshot.isi_g2)),
        frame(ArrayId::Channel, ElemType::U64, pack_u64(&snapshot.channel)),
    ];
    if let Some(spim) = &snapshot.spim {
        frames.push(frame(ArrayId::Spim, ElemType::U32, pack_u32(spim)));
    }

    let streams = &snapshot.streams;
    if !streams.is_empty() {
        frames.push(frame(ArrayId::XStream, ElemType::U32, pack_u32(&streams.x)));
        frames.push(frame(ArrayId::YStream, ElemType::U32, pack_u32(&streams.y)));
        frames.push(frame(
            ArrayId::TRelStream,
            ElemType::I64,
            pack_i64(&streams.t_rel),
        ));
        frames.push(frame(
            ArrayId::TAbsStream,
            ElemType::U64,
            pack_u64(&streams.t_abs),
        ));
        frames.push(frame(
            ArrayId::TotStream,
            ElemType::U16,
            pack_u16(&streams.tot),
        ));
        frames.push(frame(
            ArrayId::G2Stream,
            ElemType::I64,
            pack_i64(&streams.g2_t),
        ));
        frames.push(frame(
            ArrayId::ChannelStream,
            ElemType::U32,
            pack_u32(&streams.channel),
        ));
    }
    if !streams.double_t.is_empty() {
        frames.push(frame(
            ArrayId::DoubleStream,
            ElemType::I64,
            pack_i64(&streams.double_t),
        ));
    }
    frames
}

/// Formats a dense spectrum as the comma-separated legacy text array.
#[must_use]
pub fn legacy_text_array(bins: &[u64]) -> String {
    let mut text = String::with_capacity(bins.len() * 4);
    for (i, bin) in bins.iter().enumerate() {
        if i > 0 {
            text.push(',');
        }
        text.push_str(&bin.to_string());
    }
    text
}
