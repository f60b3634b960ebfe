//! Asynchronous serial transport.
//!
//! The serial device only offers blocking reads and writes. The transport
//! runs each of them on a dedicated OS thread, so the async side never blocks
//! on a native call:
//!
//! ```text
//!                 .---------------- SerialTransport ----------------.
//!   device ---->  | read flow (thread) --put--> [ rx channel ] --get--|--> read()
//!   device <----  | write flow (thread) <--get-- [ tx channel ] <-put-|--- write()
//!                 '--------------------------------------------------'
//! ```
//!
//! Both channels are [`CancelableChannel`]s. Closing the transport, whether
//! requested by the user or caused by an I/O error inside one of the flows,
//! closes both channels, which unblocks every reader and writer on either
//! side. Errors never escape the flows as panics: they are logged and turned
//! into a transport close, later observed as [`TransportError::Closed`].
//!
//! **Example** - Echo whatever comes in:
//! ```no_run
//! # async fn echo() -> Result<(), serialmq::TransportError> {
//! use serialmq::{SerialDevice, SerialTransport, SettingsBuilder, TransportOptions};
//!
//! let settings = SettingsBuilder::new().path("/dev/ttyUSB0").finalize();
//! let device = Box::new(SerialDevice::new(settings));
//! let port = SerialTransport::open(device, TransportOptions::default()).await?;
//! while let Ok(data) = port.read().await {
//!     port.write(data).await?;
//! }
//! port.close().await;
//! # Ok(())
//! # }
//! ```

mod device;
mod lines;

pub use device::{ByteTransport, CancelRead, DeviceHalves, SerialDevice, SERIAL_READ_TIMEOUT};

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use thiserror::Error;
use tokio::runtime::Handle;

use crate::channel::{CancelableChannel, CloseCause};
use lines::LineSplitter;

// =============================================================================
// Public Interface
// =============================================================================

#[derive(Debug, Error)]
pub enum TransportError {
    /// The device could not be opened.
    #[error("unable to open port '{name}': {source}")]
    Open {
        name: String,
        #[source]
        source: io::Error,
    },
    /// The transport was closed, normally or because of a device error.
    #[error("serial port is closed")]
    Closed,
    /// Nothing was received within the requested time.
    #[error("read timeout")]
    Timeout,
}

/// Tuning of the transport flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportOptions {
    /// Deliver complete lines (`\n` terminated, `\r` ignored) instead of raw
    /// chunks of bytes.
    pub line_mode: bool,
    /// Capacity of the inbound channel, in read units.
    pub rx_capacity: usize,
    /// Capacity of the outbound channel, in write buffers.
    pub tx_capacity: usize,
}

impl Default for TransportOptions {
    fn default() -> Self {
        TransportOptions {
            line_mode: false,
            rx_capacity: 1024,
            tx_capacity: 1024,
        }
    }
}

/// A byte device driven by a read flow and a write flow, exposed as an async
/// `read()`/`write()` pair.
///
/// The transport must be opened from within a tokio runtime; the flows use
/// the runtime handle to wait on the channels.
pub struct SerialTransport {
    shared: Arc<Shared>,
    flows: tokio::sync::Mutex<Option<Flows>>,
}

impl SerialTransport {
    /// Open `device` and start the read and write flows.
    pub async fn open(
        mut device: Box<dyn ByteTransport>,
        options: TransportOptions,
    ) -> Result<Self, TransportError> {
        let name = device.name();
        let open_error = |source| TransportError::Open {
            name: name.clone(),
            source,
        };

        let halves = tokio::task::spawn_blocking(move || device.open())
            .await
            .map_err(|e| open_error(io::Error::new(io::ErrorKind::Other, e)))?
            .map_err(|e| {
                error!("Error during opening '{}'", name);
                open_error(e)
            })?;

        let shared = Arc::new(Shared {
            name: name.clone(),
            closing: AtomicBool::new(false),
            rx: CancelableChannel::new(options.rx_capacity),
            tx: CancelableChannel::new(options.tx_capacity),
            canceller: halves.canceller,
        });

        let handle = Handle::current();
        let rx = {
            let flow = shared.clone();
            let handle = handle.clone();
            let reader = halves.reader;
            thread::Builder::new()
                .name(format!("{}-rx", name))
                .spawn(move || read_flow(flow, reader, options.line_mode, handle))
                .map_err(open_error)?
        };
        let tx = {
            let flow = shared.clone();
            let writer = halves.writer;
            match thread::Builder::new()
                .name(format!("{}-tx", name))
                .spawn(move || write_flow(flow, writer, handle))
            {
                Ok(tx) => tx,
                Err(e) => {
                    shared.shutdown(None);
                    return Err(open_error(e));
                }
            }
        };

        info!("Port '{}' is now opened", name);
        Ok(SerialTransport {
            shared,
            flows: tokio::sync::Mutex::new(Some(Flows { rx, tx })),
        })
    }

    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// `false` as soon as closing has started, for any reason.
    pub fn is_open(&self) -> bool {
        !self.shared.closing.load(Ordering::SeqCst)
    }

    /// Next unit received from the device: a chunk of bytes, or a line in
    /// line mode.
    pub async fn read(&self) -> Result<Vec<u8>, TransportError> {
        self.shared
            .rx
            .get()
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Same as [`read`](Self::read) but gives up after `timeout`.
    pub async fn read_for(&self, timeout: Duration) -> Result<Vec<u8>, TransportError> {
        tokio::time::timeout(timeout, self.read())
            .await
            .map_err(|_| TransportError::Timeout)?
    }

    /// Queue `data` for transmission. Waits when the outbound channel is
    /// full.
    pub async fn write(&self, data: Vec<u8>) -> Result<(), TransportError> {
        self.shared
            .tx
            .put(data)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Write `data` followed by a new line.
    pub async fn println(&self, data: &[u8]) -> Result<(), TransportError> {
        let mut line = Vec::with_capacity(data.len() + 1);
        line.extend_from_slice(data);
        line.push(b'\n');
        self.write(line).await
    }

    /// Discard everything received but not read yet.
    pub fn flush_input(&self) -> usize {
        let dropped = self.shared.rx.clear();
        if dropped > 0 {
            debug!("{}: discarded {} stale input units", self.name(), dropped);
        }
        dropped
    }

    /// Close the transport and wait for both flows to end. Safe to call more
    /// than once and from several tasks; every caller returns once the flows
    /// are gone.
    pub async fn close(&self) {
        let mut flows = self.flows.lock().await;
        self.shared.shutdown(None);

        if let Some(flows) = flows.take() {
            let name = self.shared.name.clone();
            let joined = tokio::task::spawn_blocking(move || flows.join()).await;
            if !matches!(joined, Ok(Ok(()))) {
                warn!("Port '{}': failed to join the transport flows", name);
            }
            info!("Port '{}' is now closed", self.shared.name);
        }
    }
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("name", &self.shared.name)
            .field("open", &self.is_open())
            .finish()
    }
}

impl Drop for SerialTransport {
    fn drop(&mut self) {
        // Flows that were not joined still need to be told to stop.
        self.shared.shutdown(None);
    }
}

// =============================================================================
// Private stuff
// =============================================================================

/// Buffer size of a single device read.
const READ_CHUNK: usize = 4096;

/// Pause after a read returned no data without blocking.
const IDLE_BACKOFF: Duration = Duration::from_millis(10);

/// State shared by the transport handle and its two flows.
struct Shared {
    name: String,
    closing: AtomicBool,
    rx: CancelableChannel<Vec<u8>>,
    tx: CancelableChannel<Vec<u8>>,
    canceller: Box<dyn CancelRead>,
}

impl Shared {
    /// Stop both flows. Channels are closed with `cause`, already buffered
    /// input can still be read.
    fn shutdown(&self, cause: Option<CloseCause>) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.canceller.cancel_read();
        self.rx.close(cause.clone());
        self.tx.close(cause);
    }

    fn is_closing(&self) -> bool {
        self.closing.load(Ordering::SeqCst)
    }
}

struct Flows {
    rx: JoinHandle<()>,
    tx: JoinHandle<()>,
}

impl Flows {
    fn join(self) -> thread::Result<()> {
        let tx = self.tx.join();
        let rx = self.rx.join();
        tx.and(rx)
    }
}

fn is_transient(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
    )
}

/// Reception thread: device -> rx channel.
fn read_flow(shared: Arc<Shared>, mut reader: Box<dyn Read + Send>, line_mode: bool, handle: Handle) {
    let mut buf = vec![0u8; READ_CHUNK];
    let mut lines = LineSplitter::new();

    'flow: while !shared.is_closing() {
        match reader.read(&mut buf) {
            Ok(0) => thread::sleep(IDLE_BACKOFF),
            Ok(n) => {
                // The read may have returned because the port is closing
                if shared.is_closing() {
                    break;
                }
                trace!("{} > {} bytes", shared.name, n);
                let units = if line_mode {
                    lines.push(&buf[..n])
                } else {
                    vec![buf[..n].to_vec()]
                };
                for unit in units {
                    // Only fails when the channel got closed, i.e. we are
                    // shutting down.
                    if handle.block_on(shared.rx.put(unit)).is_err() {
                        break 'flow;
                    }
                }
            }
            Err(ref e) if is_transient(e) => {}
            Err(e) => {
                error!("RX error on port '{}': {}", shared.name, e);
                shared.shutdown(Some(Arc::new(e)));
                break;
            }
        }
    }

    debug!("RX flow has ended for port '{}'", shared.name);
}

/// Transmission thread: tx channel -> device.
fn write_flow(shared: Arc<Shared>, mut writer: Box<dyn Write + Send>, handle: Handle) {
    while !shared.is_closing() {
        let data = match handle.block_on(shared.tx.get()) {
            Ok(data) => data,
            // Closed and drained, the port is going away
            Err(_) => break,
        };
        if let Err(e) = writer.write_all(&data).and_then(|_| writer.flush()) {
            error!("TX error on port '{}': {}", shared.name, e);
            shared.shutdown(Some(Arc::new(e)));
            break;
        }
        trace!("{} < {} bytes", shared.name, data.len());
    }

    debug!("TX flow has ended for port '{}'", shared.name);
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockDevice;

    async fn open(device: MockDevice, options: TransportOptions) -> SerialTransport {
        SerialTransport::open(Box::new(device), options)
            .await
            .expect("mock device opens")
    }

    #[tokio::test]
    async fn open_failure_is_reported() {
        let (device, _remote) = MockDevice::new();
        device.fail_open();
        let result = SerialTransport::open(Box::new(device), TransportOptions::default()).await;
        assert!(matches!(result, Err(TransportError::Open { .. })));
    }

    #[tokio::test]
    async fn reads_what_the_device_sends() {
        let (device, remote) = MockDevice::new();
        let port = open(device, TransportOptions::default()).await;
        remote.send(b"abc");
        assert_eq!(port.read().await.unwrap(), b"abc");
        port.close().await;
    }

    #[tokio::test]
    async fn writes_reach_the_device_in_order() {
        let (device, remote) = MockDevice::new();
        let port = open(device, TransportOptions::default()).await;
        port.write(b"one".to_vec()).await.unwrap();
        port.println(b"two").await.unwrap();
        assert_eq!(remote.wait_written(8).await, b"onetwo\n");
        port.close().await;
    }

    #[tokio::test]
    async fn line_mode_delivers_lines() {
        let (device, remote) = MockDevice::new();
        let options = TransportOptions {
            line_mode: true,
            ..TransportOptions::default()
        };
        let port = open(device, options).await;
        remote.send(b"hel");
        remote.send(b"lo\r\nwor");
        remote.send(b"ld\n");
        assert_eq!(port.read().await.unwrap(), b"hello");
        assert_eq!(port.read().await.unwrap(), b"world");
        port.close().await;
    }

    #[tokio::test]
    async fn close_unblocks_pending_read_and_rejects_io() {
        let (device, remote) = MockDevice::new();
        let port = Arc::new(open(device, TransportOptions::default()).await);
        let reader = {
            let port = port.clone();
            tokio::spawn(async move { port.read().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;

        port.close().await;
        port.close().await;

        let result = tokio::time::timeout(Duration::from_secs(1), reader)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        assert!(matches!(
            port.write(vec![1]).await,
            Err(TransportError::Closed)
        ));
        assert!(!port.is_open());
        assert!(remote.was_cancelled());
    }

    #[tokio::test]
    async fn device_error_closes_the_transport() {
        let (device, remote) = MockDevice::new();
        let port = open(device, TransportOptions::default()).await;
        remote.send(b"last words");
        remote.fail_read();

        // Data received before the failure is still delivered.
        assert_eq!(port.read().await.unwrap(), b"last words");
        assert!(matches!(port.read().await, Err(TransportError::Closed)));
        assert!(!port.is_open());
        port.close().await;
    }

    #[tokio::test]
    async fn write_error_closes_the_transport() {
        let (device, remote) = MockDevice::new();
        remote.fail_writes();
        let port = open(device, TransportOptions::default()).await;
        port.write(b"lost".to_vec()).await.unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), port.read())
            .await
            .unwrap();
        assert!(matches!(result, Err(TransportError::Closed)));
        port.close().await;
    }

    #[tokio::test]
    async fn read_for_times_out() {
        let (device, _remote) = MockDevice::new();
        let port = open(device, TransportOptions::default()).await;
        assert!(matches!(
            port.read_for(Duration::from_millis(20)).await,
            Err(TransportError::Timeout)
        ));
        port.close().await;
    }

    #[tokio::test]
    async fn flush_input_discards_stale_data() {
        let (device, remote) = MockDevice::new();
        let port = open(device, TransportOptions::default()).await;
        remote.send(b"stale");
        // Give the read flow time to queue it
        while port.shared.rx.is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(port.flush_input(), 1);
        remote.send(b"fresh");
        assert_eq!(port.read().await.unwrap(), b"fresh");
        port.close().await;
    }
}
