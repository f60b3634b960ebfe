//! Helper functions to deal with serial ports.

mod ports;

pub use ports::{enumerate_serial_ports, list_ports, open_and_setup_port, select_port, DetectedPort};
