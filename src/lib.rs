//! `serialmq` bridges a device speaking a small binary framing protocol over a
//! serial port with an MQTT broker.
//!
//! Frames sent by the device are published on the broker, one topic per
//! channel, and messages published by others on the inbound topics are framed
//! and written to the device:
//!
//! ```text
//!  .--------.  frames  .-----------------.  publish    .--------.
//!  | device |--------->|                 |------------>|        |
//!  |        |          |    serialmq     |             | broker |
//!  |        |<---------|                 |<------------|        |
//!  '--------'  frames  '-----------------'  subscribe  '--------'
//! ```
//!
//! Both sides fail and recover independently. The broker connection is
//! re-established, and its subscriptions restored, whenever it drops. The
//! serial side is the reason the bridge exists: losing it stops the bridge.
//!
//! The building blocks can be used on their own:
//!
//! * [`channel`]: a bounded queue that can be closed, waking everybody up,
//! * [`transport`]: an async serial port, driven by two I/O threads,
//! * [`protocol`]: the frame codec,
//! * [`session`]: a publish/subscribe session that confirms its requests,
//! * [`bridge`]: all of the above wired together.
//!
//! The lifecycle of the bridge is implemented as a state machine, in terms of
//! **states** and **transitions** between them:
//!
//! * It can only be in one state at any time.
//! * Each state can have its own associated data, and some data (the
//!   context) is shared by all states.
//! * Transitions are triggered by typed **events**, which carry the data
//!   handed over from one state to the next.
//! * Transitioning consumes the original state. Going back to a state
//!   creates a new one.
//!
//! Transitions are implemented with `From`: a state is built from the event
//! that leads to it. Only transitions for which `From` is implemented exist,
//! any other one is rejected at compile time.

pub mod bridge;
pub mod channel;
mod error;
pub mod protocol;
pub mod session;
pub mod settings;
pub mod transport;
pub mod utils;

#[cfg(test)]
mod testing;

pub use bridge::Bridge;
pub use channel::{CancelableChannel, ChannelClosed};
pub use error::BridgeError;
pub use session::{MqttConnector, PubSubSession};
pub use settings::{Settings, SettingsBuilder, SettingsError};
pub use transport::{SerialDevice, SerialTransport, TransportError, TransportOptions};
