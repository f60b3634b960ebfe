//! Wire framing spoken with the device on the other side of the serial line.
//!
//! Two variants exist, chosen once at configuration time through
//! [`FrameMode`]:
//!
//! ```text
//! Multiplexed
//! +----------+------------+---------------+----------+--------+
//! | Preamble | Channel ID | Packet Length |   Data   | CRC-8  |
//! +----------+------------+---------------+----------+--------+
//! | AA AA AA AA | u16 BE  | u16 BE        | len bytes| 1 byte |
//! +----------+------------+---------------+----------+--------+
//!
//! Single channel
//! +---------------+----------+
//! | Packet Length |   Data   |
//! +---------------+----------+
//! | u16 BE        | len bytes|
//! +---------------+----------+
//! ```
//!
//! The CRC covers the channel id, the length and the data, and is the
//! Dallas/Maxim 1-Wire CRC-8 (see [`crc`]).
//!
//! **Example** - Round trip through the codec:
//! ```
//! use serialmq::protocol::{Frame, FrameDecoder, FrameEncoder, FrameMode};
//!
//! let encoder = FrameEncoder::new(FrameMode::Multiplexed);
//! let bytes = encoder.encode(&Frame::multiplexed(1, b"hi!".to_vec()).unwrap()).unwrap();
//!
//! let mut decoder = FrameDecoder::new(FrameMode::Multiplexed);
//! let frames = decoder.feed(&bytes);
//! assert_eq!(frames.len(), 1);
//! assert_eq!(frames[0].as_ref().unwrap().payload(), b"hi!");
//! ```

pub mod crc;
mod decoder;
mod encoder;
mod frame;

pub use decoder::FrameDecoder;
pub use encoder::FrameEncoder;
pub use frame::{Frame, FrameError, FrameMode, MAX_PAYLOAD_LEN, PREAMBLE, PREAMBLE_BYTE};
