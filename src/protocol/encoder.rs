//! Frame encoder, the byte-exact inverse of the decoder.

use super::crc::Crc8;
use super::frame::{Frame, FrameError, FrameMode, PREAMBLE};

/// Turns [`Frame`]s into bytes ready to be written to the serial line.
///
/// The whole frame is produced as one buffer so that it is handed to the
/// transport as a single ordered write.
#[derive(Debug, Clone, Copy)]
pub struct FrameEncoder {
    mode: FrameMode,
}

impl FrameEncoder {
    pub fn new(mode: FrameMode) -> Self {
        FrameEncoder { mode }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Encode `frame`. A multiplexed encoder needs a channel id, a single
    /// channel encoder refuses one.
    pub fn encode(&self, frame: &Frame) -> Result<Vec<u8>, FrameError> {
        let length = frame.length().to_be_bytes();
        match (self.mode, frame.channel_id()) {
            (FrameMode::Multiplexed, Some(channel_id)) => {
                let channel_id = channel_id.to_be_bytes();
                let mut crc = Crc8::new();
                crc.update_all(&channel_id);
                crc.update_all(&length);
                crc.update_all(frame.payload());

                let mut out = Vec::with_capacity(PREAMBLE.len() + 4 + frame.payload().len() + 1);
                out.extend_from_slice(&PREAMBLE);
                out.extend_from_slice(&channel_id);
                out.extend_from_slice(&length);
                out.extend_from_slice(frame.payload());
                out.push(crc.value());
                Ok(out)
            }
            (FrameMode::Single, None) => {
                let mut out = Vec::with_capacity(2 + frame.payload().len());
                out.extend_from_slice(&length);
                out.extend_from_slice(frame.payload());
                Ok(out)
            }
            (mode, _) => Err(FrameError::ChannelMismatch(mode)),
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
