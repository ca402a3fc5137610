//! Reference encoders for packets and chunks.
//!
//! Mirrors of the decode path, used by the round-trip property tests
//! and by tooling that fabricates detector streams. The encoders build
//! the same byte sequences the read-out hardware transmits: an 8-byte
//! chunk header carrying the `TPX3` magic followed by 8-byte
//! little-endian packets.

use crate::packet::Tpx3Packet;
use streampix_core::TriggerKind;

/// Encodes an electron hit packet from chip-local coordinates.
///
/// `ftoa` is the wire value, i.e. already inverted relative to the
/// physical fine time.
#[must_use]
pub fn electron(x_local: u16, y: u16, toa: u16, ftoa: u8, tot: u16, spidr: u16) -> Tpx3Packet {
    let dcol = (x_local & 0xFE) as u64;
    let spix = (y & 0xFC) as u64;
    let pix = (((x_local & 0x1) << 2) | (y & 0x3)) as u64;
    let addr = (dcol << 8) | (spix << 1) | pix;

    let raw = (0xBu64 << 60)
        | (addr << 44)
        | (((toa & 0x3FFF) as u64) << 30)
        | (((tot & 0x3FF) as u64) << 20)
        | (((ftoa & 0xF) as u64) << 16)
        | spidr as u64;
    Tpx3Packet::new(raw)
}

/// Encodes a TDC trigger packet from a raw 4-bit pattern.
#[must_use]
pub fn tdc(pattern: u8, counter: u16, coarse: u64, fine: u8) -> Tpx3Packet {
    let raw = (0x6u64 << 60)
        | (((pattern & 0xF) as u64) << 56)
        | (((counter & 0xFFF) as u64) << 44)
        | ((coarse & 0x7_FFFF_FFFF) << 9)
        | (((fine & 0xF) as u64) << 5);
    Tpx3Packet::new(raw)
}

/// Encodes a TDC trigger packet for a trigger kind.
#[must_use]
pub fn trigger(kind: TriggerKind, counter: u16, coarse: u64, fine: u8) -> Tpx3Packet {
    tdc(kind.pattern(), counter, coarse, fine)
}

/// Wraps packets into a framed chunk for `chip`.
///
/// The header is transmitted as `"TPX3"`, chip index, mode, and the
/// payload size as a little-endian u16.
#[must_use]
pub fn chunk(chip: u8, mode: u8, packets: &[Tpx3Packet]) -> Vec<u8> {
    let payload = packets.len() * 8;
    debug_assert!(payload <= 65_528);

    let mut bytes = Vec::with_capacity(8 + payload);
    bytes.extend_from_slice(b"TPX3");
    bytes.push(chip);
    bytes.push(mode);
    bytes.extend_from_slice(&(payload as u16).to_le_bytes());
    for packet in packets {
        bytes.extend_from_slice(&packet.to_wire());
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_electron_encode_decode() {
        for (x, y) in [(0, 0), (1, 3), (254, 252), (255, 255), (137, 42)] {
            let packet = electron(x, y, 100, 0x5, 40, 7);
            assert_eq!(packet.pixel_coordinates(), (x, y), "({x}, {y})");
        }
    }

    #[test]
    fn test_chunk_header_layout() {
        let bytes = chunk(2, 0, &[electron(0, 0, 0, 0xF, 0, 0)]);
        assert_eq!(&bytes[0..4], b"TPX3");
        assert_eq!(bytes[4], 2);
        assert_eq!(bytes[5], 0);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 8);
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_trigger_uses_kind_pattern() {
        let packet = trigger(TriggerKind::Tdc2Rising, 1, 1000, 2);
        assert_eq!(packet.tdc_pattern(), 0xE);
    }
}
