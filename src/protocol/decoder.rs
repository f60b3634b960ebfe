//! Byte-at-a-time frame decoder.
//!
//! The decoder is a small state machine fed with whatever the serial line
//! delivers, in chunks of any size. It keeps partial frames across calls, so
//! neither the frame boundaries nor the CRC depend on how the input was split.
//!
//! ```text
//!                  4 x 0xAA            4 bytes             len bytes
//!  SeekPreamble ------------> Header ----------> Payload -------------> Crc
//!     ^   |  other byte:                                                 |
//!     |   '- counter reset                                               |
//!     '-------------------- frame emitted or CRC mismatch reported -------'
//! ```
//!
//! In single channel mode there is no preamble and no CRC: the decoder reads
//! the 2 bytes of length, then the payload, and emits.

use std::mem;

use log::trace;

use super::crc::Crc8;
use super::frame::{Frame, FrameError, FrameMode, PREAMBLE, PREAMBLE_BYTE};

// =============================================================================
// Public Interface
// =============================================================================

/// Stateful decoder turning raw serial bytes into [`Frame`]s.
#[derive(Debug)]
pub struct FrameDecoder {
    mode: FrameMode,
    state: DecoderState,
    header: [u8; 4],
    payload: Vec<u8>,
    crc: Crc8,
}

impl FrameDecoder {
    pub fn new(mode: FrameMode) -> Self {
        FrameDecoder {
            mode,
            state: DecoderState::initial(mode),
            header: [0; 4],
            payload: Vec::new(),
            crc: Crc8::new(),
        }
    }

    pub fn mode(&self) -> FrameMode {
        self.mode
    }

    /// Forget any partially received frame and wait for the start of a new
    /// one.
    pub fn reset(&mut self) {
        self.state = DecoderState::initial(self.mode);
        self.payload.clear();
        self.crc.reset();
    }

    /// `true` while a frame has been started but not completed.
    pub fn in_frame(&self) -> bool {
        match self.state {
            DecoderState::SeekPreamble { count } => count > 0,
            DecoderState::Header { filled } => filled > 0 || self.mode.is_multiplexed(),
            _ => true,
        }
    }

    /// Feed a chunk of bytes and collect every outcome it completes, in
    /// order. CRC failures are reported in-line and do not stop the decoding
    /// of the following frames.
    pub fn feed(&mut self, data: &[u8]) -> Vec<Result<Frame, FrameError>> {
        data.iter().filter_map(|b| self.push(*b)).collect()
    }

    /// Feed a single byte. Returns `Some` when the byte completes a frame,
    /// successfully or not.
    pub fn push(&mut self, byte: u8) -> Option<Result<Frame, FrameError>> {
        match self.state {
            DecoderState::SeekPreamble { count } => {
                if byte == PREAMBLE_BYTE {
                    let count = count + 1;
                    self.state = if count as usize == PREAMBLE.len() {
                        DecoderState::Header { filled: 0 }
                    } else {
                        DecoderState::SeekPreamble { count }
                    };
                } else {
                    // Mistook something else for the preamble, start over
                    self.state = DecoderState::SeekPreamble { count: 0 };
                }
                None
            }
            DecoderState::Header { filled } => {
                self.header[filled] = byte;
                let filled = filled + 1;
                if filled < self.header_len() {
                    self.state = DecoderState::Header { filled };
                    return None;
                }
                self.start_payload()
            }
            DecoderState::Payload {
                channel_id,
                remaining,
            } => {
                self.payload.push(byte);
                if self.mode.is_multiplexed() {
                    self.crc.update(byte);
                }
                let remaining = remaining - 1;
                if remaining > 0 {
                    self.state = DecoderState::Payload {
                        channel_id,
                        remaining,
                    };
                    return None;
                }
                match channel_id {
                    Some(channel_id) => {
                        self.state = DecoderState::Crc { channel_id };
                        None
                    }
                    None => Some(Ok(self.emit(None))),
                }
            }
            DecoderState::Crc { channel_id } => {
                let expected = self.crc.value();
                if byte == expected {
                    Some(Ok(self.emit(Some(channel_id))))
                } else {
                    self.reset();
                    Some(Err(FrameError::CrcMismatch {
                        channel_id,
                        expected,
                        received: byte,
                    }))
                }
            }
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DecoderState {
    /// Counting consecutive preamble bytes (multiplexed only).
    SeekPreamble { count: u8 },
    /// Accumulating the header: channel id and length when multiplexed, the
    /// length only otherwise.
    Header { filled: usize },
    /// Accumulating payload bytes.
    Payload {
        channel_id: Option<u16>,
        remaining: usize,
    },
    /// Waiting for the trailing CRC byte (multiplexed only).
    Crc { channel_id: u16 },
}

impl DecoderState {
    fn initial(mode: FrameMode) -> Self {
        match mode {
            FrameMode::Multiplexed => DecoderState::SeekPreamble { count: 0 },
            FrameMode::Single => DecoderState::Header { filled: 0 },
        }
    }
}

impl FrameDecoder {
    fn header_len(&self) -> usize {
        match self.mode {
            FrameMode::Multiplexed => 4,
            FrameMode::Single => 2,
        }
    }

    /// The header is complete: decode it and move on to the payload.
    fn start_payload(&mut self) -> Option<Result<Frame, FrameError>> {
        self.payload.clear();
        let (channel_id, length) = match self.mode {
            FrameMode::Multiplexed => {
                self.crc.reset();
                self.crc.update_all(&self.header);
                (
                    Some(u16::from_be_bytes([self.header[0], self.header[1]])),
                    u16::from_be_bytes([self.header[2], self.header[3]]),
                )
            }
            FrameMode::Single => (None, u16::from_be_bytes([self.header[0], self.header[1]])),
        };
        trace!(
            "frame header: channel {:?}, {} bytes of payload",
            channel_id,
            length
        );
        self.payload.reserve(length as usize);

        match (length, channel_id) {
            (0, Some(channel_id)) => {
                self.state = DecoderState::Crc { channel_id };
                None
            }
            (0, None) => Some(Ok(self.emit(None))),
            (length, channel_id) => {
                self.state = DecoderState::Payload {
                    channel_id,
                    remaining: length as usize,
                };
                None
            }
        }
    }

    fn emit(&mut self, channel_id: Option<u16>) -> Frame {
        let payload = mem::take(&mut self.payload);
        self.reset();
        Frame::from_wire(channel_id, payload)
    }
}

// =============================================================================
// Unit Tests
// =============================================================================
