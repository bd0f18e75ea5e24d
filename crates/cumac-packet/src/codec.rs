//! Byte-level encoding and decoding of CUMAC frames.
//!
//! All multi-byte fields are big-endian.

use crate::{
    AckHeader, Address, BeaconExtension, BeaconHeader, CommonHeader, CtsHeader, CumacHeader,
    CumacPacket, DataHeader, FrameType, PacketError, RtsHeader, WirePosition,
    BEACON_EXTENDED_SIZE, BEACON_HEADER_SIZE, COMMON_HEADER_SIZE, RTS_CHANNEL_SLOTS,
};
use std::collections::BTreeSet;

// ============================================================================
// Reader
// ============================================================================

/// Cursor over an input buffer that fails with [`PacketError::Truncated`]
/// instead of defaulting missing fields.
pub(crate) struct Reader<'a> {
    data: &'a [u8],
    pos: usize,
    what: &'static str,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(data: &'a [u8], what: &'static str) -> Self {
        Self { data, pos: 0, what }
    }

    /// Bytes not consumed yet.
    pub(crate) fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// Fail unless at least `n` more bytes are available.
    pub(crate) fn require(&self, n: usize) -> Result<(), PacketError> {
        if self.remaining() < n {
            return Err(PacketError::Truncated {
                what: self.what,
                expected: self.pos + n,
                actual: self.data.len(),
            });
        }
        Ok(())
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, PacketError> {
        self.require(1)?;
        let value = self.data[self.pos];
        self.pos += 1;
        Ok(value)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, PacketError> {
        self.require(2)?;
        let value = u16::from_be_bytes([self.data[self.pos], self.data[self.pos + 1]]);
        self.pos += 2;
        Ok(value)
    }

    pub(crate) fn read_position(&mut self) -> Result<WirePosition, PacketError> {
        self.require(WirePosition::SIZE)?;
        Ok(WirePosition {
            x: self.read_u16()?,
            y: self.read_u16()?,
            z: self.read_u16()?,
        })
    }

    pub(crate) fn read_rest(&mut self) -> Vec<u8> {
        let rest = self.data[self.pos..].to_vec();
        self.pos = self.data.len();
        rest
    }

    /// Switch the label used in truncation errors.
    pub(crate) fn section(&mut self, what: &'static str) {
        self.what = what;
    }

    /// Fail if any bytes are left.
    pub(crate) fn finish(&self) -> Result<(), PacketError> {
        match self.remaining() {
            0 => Ok(()),
            count => Err(PacketError::TrailingBytes {
                what: self.what,
                count,
            }),
        }
    }
}

fn write_position(out: &mut Vec<u8>, position: &WirePosition) {
    out.extend_from_slice(&position.x.to_be_bytes());
    out.extend_from_slice(&position.y.to_be_bytes());
    out.extend_from_slice(&position.z.to_be_bytes());
}

// ============================================================================
// Header Codecs
// ============================================================================

pub(crate) fn encode_common(out: &mut Vec<u8>, common: &CommonHeader) {
    out.push(common.src.0);
    out.push(common.dst.0);
    out.push(common.frame_type.to_byte());
}

pub(crate) fn decode_common(reader: &mut Reader<'_>) -> Result<CommonHeader, PacketError> {
    reader.require(COMMON_HEADER_SIZE)?;
    let src = Address(reader.read_u8()?);
    let dst = Address(reader.read_u8()?);
    let type_byte = reader.read_u8()?;
    let frame_type =
        FrameType::from_byte(type_byte).ok_or(PacketError::UnknownFrameType(type_byte))?;
    Ok(CommonHeader {
        src,
        dst,
        frame_type,
    })
}

fn encode_rts(out: &mut Vec<u8>, rts: &RtsHeader) {
    out.push(rts.frame_no);
    out.extend_from_slice(&rts.length.to_be_bytes());
    write_position(out, &rts.position);
    let mut slots = [0u8; RTS_CHANNEL_SLOTS];
    for (slot, channel) in slots.iter_mut().zip(rts.channels.iter()) {
        *slot = *channel;
    }
    out.extend_from_slice(&slots);
}

fn decode_rts(reader: &mut Reader<'_>) -> Result<RtsHeader, PacketError> {
    reader.section("RTS header");
    reader.require(RtsHeader::SIZE)?;
    let frame_no = reader.read_u8()?;
    let length = reader.read_u16()?;
    let position = reader.read_position()?;
    let mut channels = Vec::with_capacity(RTS_CHANNEL_SLOTS);
    for _ in 0..RTS_CHANNEL_SLOTS {
        let channel = reader.read_u8()?;
        if channel != 0 {
            channels.push(channel);
        }
    }
    reader.finish()?;
    Ok(RtsHeader {
        frame_no,
        length,
        position,
        channels,
    })
}

fn encode_beacon(out: &mut Vec<u8>, beacon: &BeaconHeader) {
    out.push(beacon.channel);
    out.push(beacon.signal_interval);
    write_position(out, &beacon.dst_position);
    if let Some(ext) = &beacon.extension {
        out.extend_from_slice(&ext.length.to_be_bytes());
        write_position(out, &ext.src_position);
    }
}

fn decode_beacon(reader: &mut Reader<'_>) -> Result<BeaconHeader, PacketError> {
    reader.section("Beacon header");
    reader.require(BEACON_HEADER_SIZE)?;
    let channel = reader.read_u8()?;
    let signal_interval = reader.read_u8()?;
    let dst_position = reader.read_position()?;
    let extension = if reader.remaining() == 0 {
        None
    } else {
        reader.section("Beacon extension");
        reader.require(BEACON_EXTENDED_SIZE - BEACON_HEADER_SIZE)?;
        Some(BeaconExtension {
            length: reader.read_u16()?,
            src_position: reader.read_position()?,
        })
    };
    reader.finish()?;
    Ok(BeaconHeader {
        channel,
        signal_interval,
        dst_position,
        extension,
    })
}

fn encode_cts(out: &mut Vec<u8>, cts: &CtsHeader) {
    out.push(cts.channel);
    out.push(cts.frame_no);
    out.extend_from_slice(&cts.packet_size.to_be_bytes());
    write_position(out, &cts.src_position);
    write_position(out, &cts.dst_position);
}

fn decode_cts(reader: &mut Reader<'_>) -> Result<CtsHeader, PacketError> {
    reader.section("CTS header");
    reader.require(CtsHeader::SIZE)?;
    let header = CtsHeader {
        channel: reader.read_u8()?,
        frame_no: reader.read_u8()?,
        packet_size: reader.read_u16()?,
        src_position: reader.read_position()?,
        dst_position: reader.read_position()?,
    };
    reader.finish()?;
    Ok(header)
}

// ============================================================================
// Packet Codec
// ============================================================================

/// Encode a complete frame: common header, kind header, payload.
pub fn encode_packet(packet: &CumacPacket) -> Vec<u8> {
    let mut out = Vec::with_capacity(COMMON_HEADER_SIZE + packet.header.size() + packet.payload.len());
    encode_common(&mut out, &packet.common);
    match &packet.header {
        CumacHeader::Data(data) => out.push(data.frame_no),
        CumacHeader::Rts(rts) => encode_rts(&mut out, rts),
        CumacHeader::Beacon(beacon) => encode_beacon(&mut out, beacon),
        CumacHeader::Cts(cts) => encode_cts(&mut out, cts),
    }
    if matches!(packet.header, CumacHeader::Data(_)) {
        out.extend_from_slice(&packet.payload);
    }
    out
}

/// Decode a complete frame.
pub fn decode_packet(data: &[u8]) -> Result<CumacPacket, PacketError> {
    let mut reader = Reader::new(data, "common header");
    let common = decode_common(&mut reader)?;
    let (header, payload) = match common.frame_type {
        FrameType::Data => {
            reader.section("Data header");
            let frame_no = reader.read_u8()?;
            (CumacHeader::Data(DataHeader { frame_no }), reader.read_rest())
        }
        FrameType::Rts => (CumacHeader::Rts(decode_rts(&mut reader)?), Vec::new()),
        FrameType::Beacon => (CumacHeader::Beacon(decode_beacon(&mut reader)?), Vec::new()),
        FrameType::Cts => (CumacHeader::Cts(decode_cts(&mut reader)?), Vec::new()),
    };
    Ok(CumacPacket {
        common,
        header,
        payload,
    })
}

// ============================================================================
// Ack Codec
// ============================================================================

/// Encode a standalone Ack header.
pub fn encode_ack(ack: &AckHeader) -> Vec<u8> {
    let nacks: Vec<u8> = ack.nacked_frames.iter().copied().take(u8::MAX as usize).collect();
    let mut out = Vec::with_capacity(2 + nacks.len());
    out.push(ack.frame_no);
    out.push(nacks.len() as u8);
    out.extend_from_slice(&nacks);
    out
}

/// Decode a standalone Ack header.
pub fn decode_ack(data: &[u8]) -> Result<AckHeader, PacketError> {
    let mut reader = Reader::new(data, "Ack header");
    let frame_no = reader.read_u8()?;
    let count = reader.read_u8()? as usize;
    reader.require(count)?;
    let mut nacked_frames = BTreeSet::new();
    for _ in 0..count {
        nacked_frames.insert(reader.read_u8()?);
    }
    reader.finish()?;
    Ok(AckHeader {
        frame_no,
        nacked_frames,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reader_reports_truncation() {
        let mut reader = Reader::new(&[0x01], "test");
        assert_eq!(reader.read_u8(), Ok(1));
        assert_eq!(
            reader.read_u16(),
            Err(PacketError::Truncated {
                what: "test",
                expected: 3,
                actual: 1
            })
        );
    }

    #[test]
    fn test_big_endian_fields() {
        let packet = CumacPacket::rts(
            Address(0),
            Address(1),
            RtsHeader {
                frame_no: 10,
                length: 0x0102,
                position: WirePosition { x: 0x0304, y: 0, z: 0 },
                channels: vec![1],
            },
        );
        let bytes = encode_packet(&packet);
        assert_eq!(&bytes[..3], &[0, 1, FrameType::Rts.to_byte()]);
        assert_eq!(&bytes[3..8], &[10, 0x01, 0x02, 0x03, 0x04]);
    }

    #[test]
    fn test_control_frames_reject_trailing_bytes() {
        let packet = CumacPacket::cts(
            Address(2),
            Address(1),
            CtsHeader {
                channel: 2,
                frame_no: 3,
                packet_size: 300,
                src_position: WirePosition::default(),
                dst_position: WirePosition::default(),
            },
        );
        let mut bytes = encode_packet(&packet);
        bytes.push(0xAA);
        assert_eq!(
            decode_packet(&bytes),
            Err(PacketError::TrailingBytes {
                what: "CTS header",
                count: 1
            })
        );
    }

    #[test]
    fn test_ack_count_must_match_buffer() {
        assert!(matches!(
            decode_ack(&[7, 3, 1, 2]),
            Err(PacketError::Truncated { what: "Ack header", .. })
        ));
    }
}
