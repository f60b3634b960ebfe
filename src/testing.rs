//! Test doubles for the serial device and the broker.

use std::collections::HashSet;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use tokio::sync::mpsc as async_mpsc;

use crate::session::{
    AckId, BrokerConnector, BrokerError, BrokerEvent, BrokerLink, ConnectError, ConnectOptions,
    QoS,
};
use crate::transport::{ByteTransport, CancelRead, DeviceHalves};

const WAIT_STEP: Duration = Duration::from_millis(5);
const WAIT_LIMIT: Duration = Duration::from_secs(2);

// =============================================================================
// Serial device
// =============================================================================

enum Input {
    Data(Vec<u8>),
    Fail,
    Cancel,
}

#[derive(Default)]
struct DeviceControl {
    fail_open: AtomicBool,
    fail_writes: AtomicBool,
    cancelled: AtomicBool,
    written: Mutex<Vec<u8>>,
}

/// An in-memory [`ByteTransport`]. The paired [`MockRemote`] plays the other
/// end of the wire.
pub(crate) struct MockDevice {
    input: Option<Receiver<Input>>,
    sender: Sender<Input>,
    control: Arc<DeviceControl>,
}

pub(crate) struct MockRemote {
    sender: Sender<Input>,
    control: Arc<DeviceControl>,
}

impl MockDevice {
    pub(crate) fn new() -> (MockDevice, MockRemote) {
        let (sender, input) = mpsc::channel();
        let control = Arc::new(DeviceControl::default());
        let remote = MockRemote {
            sender: sender.clone(),
            control: control.clone(),
        };
        let device = MockDevice {
            input: Some(input),
            sender,
            control,
        };
        (device, remote)
    }

    pub(crate) fn fail_open(&self) {
        self.control.fail_open.store(true, Ordering::SeqCst);
    }
}

impl ByteTransport for MockDevice {
    fn name(&self) -> String {
        "mock".into()
    }

    fn open(&mut self) -> io::Result<DeviceHalves> {
        if self.control.fail_open.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::NotFound, "no such device"));
        }
        let input = self
            .input
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "already opened"))?;

        Ok(DeviceHalves {
            reader: Box::new(MockReader {
                input,
                pending: vec![],
            }),
            writer: Box::new(MockWriter {
                control: self.control.clone(),
            }),
            canceller: Box::new(MockCanceller {
                sender: Mutex::new(self.sender.clone()),
                control: self.control.clone(),
            }),
        })
    }
}

impl MockRemote {
    /// Bytes the device will hand to the next read.
    pub(crate) fn send(&self, data: &[u8]) {
        let _ = self.sender.send(Input::Data(data.to_vec()));
    }

    /// Make the next read (after the data already sent) fail.
    pub(crate) fn fail_read(&self) {
        let _ = self.sender.send(Input::Fail);
    }

    pub(crate) fn fail_writes(&self) {
        self.control.fail_writes.store(true, Ordering::SeqCst);
    }

    pub(crate) fn written(&self) -> Vec<u8> {
        self.control.written.lock().unwrap().clone()
    }

    /// Wait until at least `len` bytes were written to the device.
    pub(crate) async fn wait_written(&self, len: usize) -> Vec<u8> {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let written = self.written();
            if written.len() >= len {
                return written;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "device received only {:02X?}",
                written
            );
            tokio::time::sleep(WAIT_STEP).await;
        }
    }

    pub(crate) fn was_cancelled(&self) -> bool {
        self.control.cancelled.load(Ordering::SeqCst)
    }
}

struct MockReader {
    input: Receiver<Input>,
    pending: Vec<u8>,
}

impl Read for MockReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.input.recv_timeout(Duration::from_millis(10)) {
                Ok(Input::Data(data)) => self.pending = data,
                Ok(Input::Fail) => {
                    return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"))
                }
                Ok(Input::Cancel) => return Ok(0),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"))
                }
                Err(RecvTimeoutError::Disconnected) => {
                    thread::sleep(Duration::from_millis(10));
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
                }
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct MockWriter {
    control: Arc<DeviceControl>,
}

impl Write for MockWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.control.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "device unplugged"));
        }
        self.control.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct MockCanceller {
    sender: Mutex<Sender<Input>>,
    control: Arc<DeviceControl>,
}

impl CancelRead for MockCanceller {
    fn cancel_read(&self) {
        self.control.cancelled.store(true, Ordering::SeqCst);
        let _ = self.sender.lock().unwrap().send(Input::Cancel);
    }
}

// =============================================================================
// Broker
// =============================================================================

/// How the mock broker answers subscriptions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum AckMode {
    Grant,
    Refuse,
    /// Never answer.
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Request {
    Subscribe(String, QoS),
    Unsubscribe(String),
    Disconnect,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Published {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

struct BrokerState {
    refuse_connect: bool,
    ack_mode: AckMode,
    refused_filters: HashSet<String>,
    connects: Vec<ConnectOptions>,
    events: Option<async_mpsc::Sender<BrokerEvent>>,
    requests: Vec<Request>,
    published: Vec<Published>,
}

/// In-memory broker implementing [`BrokerConnector`]. Clones share the same
/// broker.
#[derive(Clone)]
pub(crate) struct MockBroker {
    state: Arc<Mutex<BrokerState>>,
}

pub(crate) struct MockLink {
    broker: MockBroker,
    events: async_mpsc::Sender<BrokerEvent>,
}

impl MockBroker {
    pub(crate) fn new() -> Self {
        MockBroker {
            state: Arc::new(Mutex::new(BrokerState {
                refuse_connect: false,
                ack_mode: AckMode::Grant,
                refused_filters: HashSet::new(),
                connects: vec![],
                events: None,
                requests: vec![],
                published: vec![],
            })),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BrokerState> {
        self.state.lock().unwrap()
    }

    pub(crate) fn refuse_connect(&self, refuse: bool) {
        self.lock().refuse_connect = refuse;
    }

    pub(crate) fn ack_mode(&self, mode: AckMode) {
        self.lock().ack_mode = mode;
    }

    pub(crate) fn refuse_filter(&self, filter: &str) {
        self.lock().refused_filters.insert(filter.into());
    }

    pub(crate) fn connects(&self) -> Vec<ConnectOptions> {
        self.lock().connects.clone()
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.lock().requests.clone()
    }

    pub(crate) fn published(&self) -> Vec<Published> {
        self.lock().published.clone()
    }

    pub(crate) fn is_connected(&self) -> bool {
        self.lock().events.is_some()
    }

    /// Deliver a message to the connected client.
    pub(crate) async fn inject(&self, topic: &str, payload: &[u8]) {
        let events = self.lock().events.clone();
        if let Some(events) = events {
            let _ = events
                .send(BrokerEvent::Message {
                    topic: topic.into(),
                    payload: payload.to_vec(),
                })
                .await;
        }
    }

    /// Drop the current connection as a network failure would.
    pub(crate) async fn drop_connection(&self) {
        let events = self.lock().events.take();
        if let Some(events) = events {
            let _ = events
                .send(BrokerEvent::ConnectionLost {
                    reason: "connection reset by peer".into(),
                })
                .await;
        }
    }

    /// Wait until at least `count` messages were published.
    pub(crate) async fn wait_published(&self, count: usize) -> Vec<Published> {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        loop {
            let published = self.published();
            if published.len() >= count {
                return published;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "broker received only {:?}",
                published
            );
            tokio::time::sleep(WAIT_STEP).await;
        }
    }

    /// Wait until the client is connected `count` times in total.
    pub(crate) async fn wait_connects(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
        while self.lock().connects.len() < count || !self.is_connected() {
            assert!(
                tokio::time::Instant::now() < deadline,
                "client did not reconnect"
            );
            tokio::time::sleep(WAIT_STEP).await;
        }
    }
}

impl BrokerConnector for MockBroker {
    type Link = MockLink;

    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<(MockLink, async_mpsc::Receiver<BrokerEvent>), ConnectError> {
        let mut state = self.lock();
        if state.refuse_connect {
            return Err(ConnectError::Unreachable {
                address: options.endpoint.to_string(),
                reason: "connection refused".into(),
            });
        }
        let (events, receiver) = async_mpsc::channel(64);
        state.connects.push(options.clone());
        state.events = Some(events.clone());
        drop(state);

        let link = MockLink {
            broker: self.clone(),
            events,
        };
        Ok((link, receiver))
    }
}

impl MockLink {
    async fn acknowledge(&self, event: Option<BrokerEvent>) {
        if let Some(event) = event {
            let _ = self.events.send(event).await;
        }
    }
}

impl BrokerLink for MockLink {
    async fn subscribe(&self, id: AckId, filter: &str, qos: QoS) -> Result<(), BrokerError> {
        let ack = {
            let mut state = self.broker.lock();
            state.requests.push(Request::Subscribe(filter.into(), qos));
            let refused = state.refused_filters.contains(filter);
            match state.ack_mode {
                AckMode::Grant => Some(BrokerEvent::SubAck {
                    id,
                    granted: !refused,
                }),
                AckMode::Refuse => Some(BrokerEvent::SubAck { id, granted: false }),
                AckMode::Ignore => None,
            }
        };
        self.acknowledge(ack).await;
        Ok(())
    }

    async fn unsubscribe(&self, id: AckId, filter: &str) -> Result<(), BrokerError> {
        let ack = {
            let mut state = self.broker.lock();
            state.requests.push(Request::Unsubscribe(filter.into()));
            match state.ack_mode {
                AckMode::Ignore => None,
                _ => Some(BrokerEvent::UnsubAck { id }),
            }
        };
        self.acknowledge(ack).await;
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.broker.lock().published.push(Published {
            topic: topic.into(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn disconnect(&self) {
        let mut state = self.broker.lock();
        state.requests.push(Request::Disconnect);
        state.events = None;
    }
}
