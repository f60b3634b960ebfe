//! The byte device underneath the serial transport.
//!
//! [`ByteTransport`] is the seam between the transport flows and the actual
//! hardware. Opening a device yields three independent handles so that the
//! read flow, the write flow and the closing task never contend for the same
//! object:
//!
//! * a blocking reader, owned by the read flow,
//! * a blocking writer, owned by the write flow,
//! * a [`CancelRead`] handle, used by `close()` to unblock a pending read.

use std::fmt;
use std::io::{self, Read, Write};
use std::time::Duration;

use log::debug;

use crate::settings::Settings;
use crate::utils::open_and_setup_port;

// =============================================================================
// Public Interface
// =============================================================================

/// Read timeout applied to serial ports. It bounds how long a read stays
/// blocked after the transport starts closing.
pub const SERIAL_READ_TIMEOUT: Duration = Duration::from_millis(50);

/// A device that can be opened into independent read and write halves.
pub trait ByteTransport: Send + 'static {
    /// Human readable name, used in logs.
    fn name(&self) -> String;

    /// Open the device. Called once, on a blocking worker thread.
    fn open(&mut self) -> io::Result<DeviceHalves>;
}

/// Makes a pending blocking read return as soon as possible.
pub trait CancelRead: Send + Sync {
    fn cancel_read(&self);
}

/// The handles obtained by opening a [`ByteTransport`].
///
/// Reads that time out (`TimedOut`, `WouldBlock`) or are interrupted are not
/// errors for the transport; any other I/O error closes it.
pub struct DeviceHalves {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub canceller: Box<dyn CancelRead>,
}

impl fmt::Debug for DeviceHalves {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceHalves").finish_non_exhaustive()
    }
}

/// A serial port, as configured in the [`Settings`].
#[derive(Debug, Clone)]
pub struct SerialDevice {
    settings: Settings,
}

impl SerialDevice {
    pub fn new(settings: Settings) -> Self {
        SerialDevice { settings }
    }
}

impl ByteTransport for SerialDevice {
    fn name(&self) -> String {
        self.settings
            .path
            .clone()
            .unwrap_or_else(|| "<no port>".into())
    }

    fn open(&mut self) -> io::Result<DeviceHalves> {
        let mut port = open_and_setup_port(&self.settings)?;
        if self.settings.disable_dtr_rts {
            // Some boards reset when the port is opened with DTR/RTS set.
            port.write_data_terminal_ready(false)?;
            port.write_request_to_send(false)?;
        }
        port.set_timeout(SERIAL_READ_TIMEOUT)?;
        let writer = port.try_clone()?;
        debug!("serial port '{}' split into reader/writer", self.name());

        Ok(DeviceHalves {
            reader: Box::new(port),
            writer: Box::new(writer),
            canceller: Box::new(SerialReadCanceller),
        })
    }
}

// =============================================================================
// Private stuff
// =============================================================================

struct SerialReadCanceller;

impl CancelRead for SerialReadCanceller {
    /// Does nothing: `serialport` has no way to abort a blocking read from
    /// another thread. The port is opened with a [`SERIAL_READ_TIMEOUT`]
    /// read timeout instead, so a pending read returns within that delay and
    /// the read flow then sees the closing flag.
    fn cancel_read(&self) {}
}

// =============================================================================
// Unit Tests
// =============================================================================
