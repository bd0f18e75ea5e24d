//! # cumac-packet
//!
//! Frame encoding and decoding for the CUMAC multi-channel MAC protocol.
//!
//! ## Frame Structure
//!
//! Every frame starts with a common header:
//! - Source address (1 byte)
//! - Destination address (1 byte, 255 = broadcast)
//! - Frame type (1 byte): DATA=0, RTS=1, CTS=2, BEACON=3
//!
//! followed by exactly one kind-specific header:
//! - Data: frame number (1 byte), then the application payload
//! - RTS: frame number (1), length (2), position (6), 8 channel slots (8)
//! - Beacon: channel (1), signal interval (1), beaconer position (6),
//!   optionally length (2) and initiator position (6)
//! - CTS: channel (1), frame number (1), packet size (2),
//!   initiator position (6), responder position (6)
//!
//! The Ack header ([`AckHeader`]) is a standalone structure without the
//! common header. All multi-byte fields are big-endian.
//!
//! ## Example
//!
//! ```rust
//! use cumac_packet::{Address, CumacPacket, RtsHeader, WirePosition};
//!
//! let rts = RtsHeader::new(10, 300, WirePosition::new(255, 256, 257), vec![1, 2]).unwrap();
//! let packet = CumacPacket::rts(Address(0), Address(1), rts);
//! let decoded = CumacPacket::decode(&packet.encode()).unwrap();
//! assert_eq!(packet, decoded);
//! ```

pub mod codec;
pub mod error;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

pub use error::PacketError;

// ============================================================================
// Constants
// ============================================================================

/// Channel identifier. Channel 0 is the control channel.
pub type ChannelId = u8;

/// The control channel, used for RTS, Beacon and CTS only.
pub const CONTROL_CHANNEL: ChannelId = 0;

/// Number of channel slots in an RTS header.
pub const RTS_CHANNEL_SLOTS: usize = 8;

/// Size of the common header in bytes.
pub const COMMON_HEADER_SIZE: usize = 3;

/// Size of the Data header in bytes (after the common header).
pub const DATA_HEADER_SIZE: usize = 1;

/// Size of a base Beacon header in bytes.
pub const BEACON_HEADER_SIZE: usize = 8;

/// Size of an extended Beacon header in bytes.
pub const BEACON_EXTENDED_SIZE: usize = 16;

/// Maximum number of NACKed frame ids in an Ack.
pub const MAX_NACKS: usize = u8::MAX as usize;

// ============================================================================
// Addressing
// ============================================================================

/// One-byte node address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Address(pub u8);

impl Address {
    /// The broadcast address.
    pub const BROADCAST: Address = Address(255);

    /// Returns true for the broadcast address.
    pub fn is_broadcast(self) -> bool {
        self == Self::BROADCAST
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Position as carried on the wire: one unsigned 16-bit value per axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WirePosition {
    pub x: u16,
    pub y: u16,
    pub z: u16,
}

impl WirePosition {
    /// Encoded size in bytes.
    pub const SIZE: usize = 6;

    pub fn new(x: u16, y: u16, z: u16) -> Self {
        Self { x, y, z }
    }
}

// ============================================================================
// Frame Types
// ============================================================================

/// Frame type carried in the common header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum FrameType {
    /// Application data.
    Data = 0,
    /// Request to send.
    Rts = 1,
    /// Clear to send.
    Cts = 2,
    /// Channel announcement by the RTS receiver.
    Beacon = 3,
}

impl FrameType {
    /// Parse the type byte.
    pub fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(FrameType::Data),
            1 => Some(FrameType::Rts),
            2 => Some(FrameType::Cts),
            3 => Some(FrameType::Beacon),
            _ => None,
        }
    }

    /// Type byte for the common header.
    pub fn to_byte(self) -> u8 {
        self as u8
    }

    /// Lowercase label for metrics and traces.
    pub fn as_label(&self) -> &'static str {
        match self {
            FrameType::Data => "data",
            FrameType::Rts => "rts",
            FrameType::Cts => "cts",
            FrameType::Beacon => "beacon",
        }
    }
}

impl fmt::Display for FrameType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameType::Data => write!(f, "DATA"),
            FrameType::Rts => write!(f, "RTS"),
            FrameType::Cts => write!(f, "CTS"),
            FrameType::Beacon => write!(f, "BEACON"),
        }
    }
}

// ============================================================================
// Headers
// ============================================================================

/// Addressing and type preamble shared by all frame kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommonHeader {
    pub src: Address,
    pub dst: Address,
    pub frame_type: FrameType,
}

/// Data header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataHeader {
    pub frame_no: u8,
}

/// RTS header: the initiator's frame number, payload length, position and
/// candidate data channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtsHeader {
    pub frame_no: u8,
    /// Length of the application payload in bytes.
    pub length: u16,
    /// Position of the initiator.
    pub position: WirePosition,
    /// Candidate data channels in preference order. Zero slots are not
    /// represented here.
    pub channels: Vec<ChannelId>,
}

impl RtsHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 1 + 2 + WirePosition::SIZE + RTS_CHANNEL_SLOTS;

    /// Build an RTS header, validating the channel list.
    pub fn new(
        frame_no: u8,
        length: u16,
        position: WirePosition,
        channels: Vec<ChannelId>,
    ) -> Result<Self, PacketError> {
        if channels.len() > RTS_CHANNEL_SLOTS {
            return Err(PacketError::TooManyChannels(channels.len()));
        }
        if channels.contains(&CONTROL_CHANNEL) {
            return Err(PacketError::ReservedChannel);
        }
        Ok(Self {
            frame_no,
            length,
            position,
            channels,
        })
    }
}

/// Optional Beacon fields describing the pending data transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconExtension {
    /// Payload length taken from the RTS.
    pub length: u16,
    /// Position of the RTS initiator.
    pub src_position: WirePosition,
}

/// Beacon header: the responder announces the channel it is about to claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BeaconHeader {
    pub channel: ChannelId,
    /// Tone-pulse discriminator chosen by the beaconing node.
    pub signal_interval: u8,
    /// Position of the beaconing node (the data receiver).
    pub dst_position: WirePosition,
    pub extension: Option<BeaconExtension>,
}

impl BeaconHeader {
    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        if self.extension.is_some() {
            BEACON_EXTENDED_SIZE
        } else {
            BEACON_HEADER_SIZE
        }
    }
}

/// CTS header: confirms the data channel to the initiator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CtsHeader {
    pub channel: ChannelId,
    pub frame_no: u8,
    /// Payload length of the confirmed data frame.
    pub packet_size: u16,
    /// Position of the data sender (RTS initiator).
    pub src_position: WirePosition,
    /// Position of the data receiver (CTS sender).
    pub dst_position: WirePosition,
}

impl CtsHeader {
    /// Encoded size in bytes.
    pub const SIZE: usize = 1 + 1 + 2 + 2 * WirePosition::SIZE;
}

/// Kind-specific header of a frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum CumacHeader {
    Data(DataHeader),
    Rts(RtsHeader),
    Beacon(BeaconHeader),
    Cts(CtsHeader),
}

impl CumacHeader {
    /// The frame type this header belongs to.
    pub fn frame_type(&self) -> FrameType {
        match self {
            CumacHeader::Data(_) => FrameType::Data,
            CumacHeader::Rts(_) => FrameType::Rts,
            CumacHeader::Beacon(_) => FrameType::Beacon,
            CumacHeader::Cts(_) => FrameType::Cts,
        }
    }

    /// Encoded size in bytes, excluding the common header.
    pub fn size(&self) -> usize {
        match self {
            CumacHeader::Data(_) => DATA_HEADER_SIZE,
            CumacHeader::Rts(_) => RtsHeader::SIZE,
            CumacHeader::Beacon(beacon) => beacon.size(),
            CumacHeader::Cts(_) => CtsHeader::SIZE,
        }
    }
}

// ============================================================================
// Ack
// ============================================================================

/// Acknowledgement listing frames that were not received.
///
/// Not part of the RTS/Beacon/CTS/Data handshake and carried without the
/// common header.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct AckHeader {
    pub frame_no: u8,
    pub nacked_frames: BTreeSet<u8>,
}

impl AckHeader {
    /// Build an Ack, validating the NACK count.
    pub fn new(frame_no: u8, nacked_frames: BTreeSet<u8>) -> Result<Self, PacketError> {
        if nacked_frames.len() > MAX_NACKS {
            return Err(PacketError::TooManyNacks(nacked_frames.len()));
        }
        Ok(Self {
            frame_no,
            nacked_frames,
        })
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        2 + self.nacked_frames.len()
    }

    pub fn encode(&self) -> Vec<u8> {
        codec::encode_ack(self)
    }

    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        codec::decode_ack(data)
    }
}

// ============================================================================
// Packet
// ============================================================================

/// A complete CUMAC frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CumacPacket {
    pub common: CommonHeader,
    pub header: CumacHeader,
    /// Application payload. Always empty for control frames.
    pub payload: Vec<u8>,
}

impl CumacPacket {
    /// Create a frame, deriving the type byte from the header.
    pub fn new(src: Address, dst: Address, header: CumacHeader, payload: Vec<u8>) -> Self {
        Self {
            common: CommonHeader {
                src,
                dst,
                frame_type: header.frame_type(),
            },
            header,
            payload,
        }
    }

    /// Create a Data frame.
    pub fn data(src: Address, dst: Address, frame_no: u8, payload: Vec<u8>) -> Self {
        Self::new(src, dst, CumacHeader::Data(DataHeader { frame_no }), payload)
    }

    /// Create an RTS frame.
    pub fn rts(src: Address, dst: Address, rts: RtsHeader) -> Self {
        Self::new(src, dst, CumacHeader::Rts(rts), Vec::new())
    }

    /// Create a Beacon frame. Beacons are always broadcast.
    pub fn beacon(src: Address, beacon: BeaconHeader) -> Self {
        Self::new(src, Address::BROADCAST, CumacHeader::Beacon(beacon), Vec::new())
    }

    /// Create a CTS frame.
    pub fn cts(src: Address, dst: Address, cts: CtsHeader) -> Self {
        Self::new(src, dst, CumacHeader::Cts(cts), Vec::new())
    }

    /// Encode the frame to bytes.
    pub fn encode(&self) -> Vec<u8> {
        codec::encode_packet(self)
    }

    /// Decode a frame from bytes.
    pub fn decode(data: &[u8]) -> Result<Self, PacketError> {
        codec::decode_packet(data)
    }

    /// Decode only the common header.
    pub fn peek_common(data: &[u8]) -> Result<CommonHeader, PacketError> {
        codec::decode_common(&mut codec::Reader::new(data, "common header"))
    }

    pub fn frame_type(&self) -> FrameType {
        self.common.frame_type
    }

    /// Encoded size in bytes.
    pub fn size(&self) -> usize {
        COMMON_HEADER_SIZE + self.header.size() + self.payload.len()
    }

    /// Short human-readable description for logs.
    pub fn display(&self) -> String {
        format!(
            "{} {} -> {} ({} bytes)",
            self.common.frame_type,
            self.common.src,
            self.common.dst,
            self.size()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pos(x: u16, y: u16, z: u16) -> WirePosition {
        WirePosition::new(x, y, z)
    }

    #[test]
    fn test_frame_type_roundtrip() {
        for ft in [FrameType::Data, FrameType::Rts, FrameType::Cts, FrameType::Beacon] {
            assert_eq!(FrameType::from_byte(ft.to_byte()), Some(ft));
        }
        assert_eq!(FrameType::from_byte(4), None);
    }

    #[test]
    fn test_rts_roundtrip() {
        let rts = RtsHeader::new(10, 300, pos(255, 256, 257), vec![1, 2]).unwrap();
        let packet = CumacPacket::rts(Address(0), Address(1), rts);
        let bytes = packet.encode();
        assert_eq!(bytes.len(), COMMON_HEADER_SIZE + RtsHeader::SIZE);

        let decoded = CumacPacket::decode(&bytes).unwrap();
        assert_eq!(decoded.common.src, Address(0));
        assert_eq!(decoded.common.dst, Address(1));
        let CumacHeader::Rts(rts) = decoded.header else {
            panic!("expected RTS header");
        };
        assert_eq!(rts.frame_no, 10);
        assert_eq!(rts.length, 300);
        assert_eq!(rts.position, pos(255, 256, 257));
        assert_eq!(rts.channels, vec![1, 2]);
    }

    #[test]
    fn test_rts_channel_list_boundaries() {
        let empty = CumacPacket::rts(
            Address(3),
            Address(4),
            RtsHeader::new(0, 0, pos(0, 0, 0), vec![]).unwrap(),
        );
        assert_eq!(CumacPacket::decode(&empty.encode()).unwrap(), empty);

        let full = CumacPacket::rts(
            Address(3),
            Address(4),
            RtsHeader::new(u8::MAX, u16::MAX, pos(u16::MAX, 0, 1), (1..=8).collect()).unwrap(),
        );
        assert_eq!(CumacPacket::decode(&full.encode()).unwrap(), full);
    }

    #[test]
    fn test_rts_rejects_invalid_channels() {
        assert_eq!(
            RtsHeader::new(0, 0, pos(0, 0, 0), (1..=9).collect()),
            Err(PacketError::TooManyChannels(9))
        );
        assert_eq!(
            RtsHeader::new(0, 0, pos(0, 0, 0), vec![0, 1]),
            Err(PacketError::ReservedChannel)
        );
    }

    #[test]
    fn test_cts_roundtrip() {
        let packet = CumacPacket::cts(
            Address(2),
            Address(1),
            CtsHeader {
                channel: 2,
                frame_no: 3,
                packet_size: 300,
                src_position: pos(0, 0, 0),
                dst_position: pos(0, 0, 300),
            },
        );
        let decoded = CumacPacket::decode(&packet.encode()).unwrap();
        assert_eq!(decoded, packet);
        let CumacHeader::Cts(cts) = decoded.header else {
            panic!("expected CTS header");
        };
        assert_eq!(cts.frame_no, 3);
        assert_eq!(cts.channel, 2);
        assert_eq!(decoded.common.src, Address(2));
    }

    #[test]
    fn test_beacon_base_and_extended() {
        let base = BeaconHeader {
            channel: 4,
            signal_interval: 11,
            dst_position: pos(10, 20, 30),
            extension: None,
        };
        let packet = CumacPacket::beacon(Address(9), base);
        let bytes = packet.encode();
        assert_eq!(bytes.len(), COMMON_HEADER_SIZE + BEACON_HEADER_SIZE);
        assert_eq!(CumacPacket::decode(&bytes).unwrap(), packet);
        assert!(packet.common.dst.is_broadcast());

        let extended = BeaconHeader {
            extension: Some(BeaconExtension {
                length: 64,
                src_position: pos(1, 2, 3),
            }),
            ..base
        };
        let packet = CumacPacket::beacon(Address(9), extended);
        let bytes = packet.encode();
        assert_eq!(bytes.len(), COMMON_HEADER_SIZE + BEACON_EXTENDED_SIZE);
        assert_eq!(CumacPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_beacon_partial_extension_is_truncated() {
        let packet = CumacPacket::beacon(
            Address(9),
            BeaconHeader {
                channel: 4,
                signal_interval: 0,
                dst_position: pos(0, 0, 0),
                extension: Some(BeaconExtension {
                    length: 1,
                    src_position: pos(0, 0, 0),
                }),
            },
        );
        let bytes = packet.encode();
        let err = CumacPacket::decode(&bytes[..bytes.len() - 3]).unwrap_err();
        assert!(matches!(err, PacketError::Truncated { what: "Beacon extension", .. }));
    }

    #[test]
    fn test_data_roundtrip_with_payload() {
        let packet = CumacPacket::data(Address(1), Address(2), 7, b"hello".to_vec());
        let bytes = packet.encode();
        assert_eq!(bytes.len(), COMMON_HEADER_SIZE + DATA_HEADER_SIZE + 5);
        assert_eq!(packet.size(), bytes.len());
        assert_eq!(CumacPacket::decode(&bytes).unwrap(), packet);
    }

    #[test]
    fn test_truncated_frames_fail() {
        let packet = CumacPacket::cts(
            Address(2),
            Address(1),
            CtsHeader {
                channel: 1,
                frame_no: 1,
                packet_size: 1,
                src_position: pos(0, 0, 0),
                dst_position: pos(0, 0, 0),
            },
        );
        let bytes = packet.encode();
        for len in 0..bytes.len() {
            assert!(
                matches!(CumacPacket::decode(&bytes[..len]), Err(PacketError::Truncated { .. })),
                "length {} should be truncated",
                len
            );
        }
        assert!(matches!(
            CumacPacket::decode(&[1, 2, 0]),
            Err(PacketError::Truncated { what: "Data header", .. })
        ));
    }

    #[test]
    fn test_unknown_frame_type() {
        assert_eq!(
            CumacPacket::decode(&[1, 2, 9, 0]),
            Err(PacketError::UnknownFrameType(9))
        );
    }

    #[test]
    fn test_peek_common() {
        let packet = CumacPacket::data(Address(5), Address(6), 1, vec![1, 2, 3]);
        let common = CumacPacket::peek_common(&packet.encode()).unwrap();
        assert_eq!(common.frame_type, FrameType::Data);
        assert_eq!(common.src, Address(5));
    }

    #[test]
    fn test_ack_roundtrip() {
        let empty = AckHeader::new(1, BTreeSet::new()).unwrap();
        assert_eq!(AckHeader::decode(&empty.encode()).unwrap(), empty);

        let ack = AckHeader::new(9, [3u8, 1, 200].into_iter().collect()).unwrap();
        let bytes = ack.encode();
        assert_eq!(bytes, vec![9, 3, 1, 3, 200]);
        assert_eq!(AckHeader::decode(&bytes).unwrap(), ack);

        let all: BTreeSet<u8> = (0..=u8::MAX).collect();
        assert_eq!(AckHeader::new(0, all), Err(PacketError::TooManyNacks(256)));
    }
}
