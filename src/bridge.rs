//! The bridge between the serial port and the broker.
//!
//! Frames received from the device are published on the broker, and
//! messages received from the broker are framed and written to the device.
//! The topic layout is described by [`TopicScheme`] and the lifecycle by the
//! [`Bridge`] state machine.

mod events;
mod forward;
mod state_machine;
mod states;
mod topics;

pub use state_machine::Bridge;
pub use topics::{MalformedTopic, TopicScheme};
