//! Frame type shared by the decoder and the encoder.

use std::fmt;

use thiserror::Error;

/// Byte repeated to form the multiplexed preamble.
pub const PREAMBLE_BYTE: u8 = 0xAA;

/// Multiplexed frames start with this sequence.
pub const PREAMBLE: [u8; 4] = [PREAMBLE_BYTE; 4];

/// The length field is 16 bits wide.
pub const MAX_PAYLOAD_LEN: usize = u16::MAX as usize;

/// Which wire variant is spoken on the serial line.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameMode {
    /// Preamble, channel id, length, payload and CRC-8.
    Multiplexed,
    /// Length and payload only.
    Single,
}

impl FrameMode {
    pub fn is_multiplexed(self) -> bool {
        self == FrameMode::Multiplexed
    }
}

impl fmt::Display for FrameMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FrameMode::Multiplexed => write!(f, "multiplexed"),
            FrameMode::Single => write!(f, "single"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// The CRC received at the end of a frame does not match the one computed
    /// over its header and payload. The frame was dropped.
    #[error("CRC mismatch on channel {channel_id}: expected {expected:#04x}, received {received:#04x}")]
    CrcMismatch {
        channel_id: u16,
        expected: u8,
        received: u8,
    },
    #[error("payload of {0} bytes does not fit a frame")]
    PayloadTooLarge(usize),
    #[error("frame channel does not match the {0} mode")]
    ChannelMismatch(FrameMode),
}

/// One unit of the wire protocol, stripped of its framing.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    channel_id: Option<u16>,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame, checking that the payload length fits the 16 bit length
    /// field.
    pub fn new(channel_id: Option<u16>, payload: Vec<u8>) -> Result<Self, FrameError> {
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(FrameError::PayloadTooLarge(payload.len()));
        }
        Ok(Frame {
            channel_id,
            payload,
        })
    }

    /// Frames coming off the wire are bounded by the length field already.
    pub(super) fn from_wire(channel_id: Option<u16>, payload: Vec<u8>) -> Self {
        debug_assert!(payload.len() <= MAX_PAYLOAD_LEN);
        Frame {
            channel_id,
            payload,
        }
    }

    pub fn multiplexed(channel_id: u16, payload: Vec<u8>) -> Result<Self, FrameError> {
        Frame::new(Some(channel_id), payload)
    }

    pub fn single(payload: Vec<u8>) -> Result<Self, FrameError> {
        Frame::new(None, payload)
    }

    pub fn channel_id(&self) -> Option<u16> {
        self.channel_id
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn into_payload(self) -> Vec<u8> {
        self.payload
    }

    /// Value of the length field on the wire.
    pub fn length(&self) -> u16 {
        // Bounded by construction.
        self.payload.len() as u16
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("channel_id", &self.channel_id)
            .field("length", &self.length())
            .finish()
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
