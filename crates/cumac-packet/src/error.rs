//! Error types for CUMAC frame encoding and decoding.

use thiserror::Error;

/// Errors raised while building or decoding CUMAC frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PacketError {
    /// The buffer ended before a fixed-size field could be read.
    #[error("{what} truncated: need {expected} bytes, have {actual}")]
    Truncated {
        /// Which part of the frame was being read.
        what: &'static str,
        /// Bytes required.
        expected: usize,
        /// Bytes available.
        actual: usize,
    },

    /// The frame type byte is not one of DATA/RTS/CTS/BEACON.
    #[error("Unknown frame type: {0}")]
    UnknownFrameType(u8),

    /// An RTS can advertise at most 8 channels.
    #[error("RTS channel list holds {0} channels, at most 8 fit")]
    TooManyChannels(usize),

    /// Channel 0 is the control channel and cannot carry data.
    #[error("Channel 0 is reserved for control frames")]
    ReservedChannel,

    /// An Ack can carry at most 255 NACKed frame ids.
    #[error("Ack carries {0} NACKed frames, at most 255 fit")]
    TooManyNacks(usize),

    /// A control frame had bytes left over after its header.
    #[error("{what} has {count} trailing bytes")]
    TrailingBytes {
        /// Which frame kind was being read.
        what: &'static str,
        /// Number of unread bytes.
        count: usize,
    },
}
