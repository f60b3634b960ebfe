//! Lifecycle of the bridge.
//!
//! The bridge first acquires its two sides one after the other, then serves
//! until asked to stop or until the serial port is lost. Failing to acquire a
//! side is fatal: there is no point in holding a broker connection without a
//! device, or the opposite, so everything acquired so far is released and
//! the bridge stops with the corresponding error.
//!
//! ```text
//!                            START
//!                              |
//!                              v
//!                          .-------.   invalid
//!                          | Init  |-----------------------------.
//!                          '-------'                             |
//!                              |                                 |
//!                              v                                 |
//!                        .----------.  open error                |
//!                        | OpenPort |-------------------------.  |
//!                        '----------'                         |  |
//!                              |                              |  |
//!                              v                              |  |
//!                        .----------.  connect error/stop     |  |
//!                        | Connect  |----------------------.  |  |
//!                        '----------'                      |  |  |
//!                              |                           |  |  |
//!                              v                           |  |  |
//!                        .-----------.  not granted        |  |  |
//!                        | Subscribe |-----------------.   |  |  |
//!                        '-----------'                 |   |  |  |
//!                              |                       v   v  v  v
//!                              v                      .------------.
//!                      ******************  stop/lost  |    Done    |
//!                      *     Service    *------------>|            |
//!                      ******************             '------------'
//!                                                           |
//!                                                           v
//!                                                          END
//! ```

use std::sync::{Arc, Mutex};

use tokio::sync::watch;

use super::events::*;
use super::states::*;
use super::topics::TopicScheme;
use crate::error::BridgeError;
use crate::session::{BrokerConnector, PubSubSession};
use crate::settings::Settings;
use crate::transport::ByteTransport;

// =============================================================================
// Public Interface
// =============================================================================

/// Serial port to broker bridge.
///
/// Encapsulates the state machine and its event loop.
///
/// **Example**
/// ```no_run
/// # async fn bridge() -> i32 {
/// use serialmq::{Bridge, MqttConnector, SerialDevice, SettingsBuilder};
///
/// let settings = SettingsBuilder::new()
///     .path("/dev/ttyUSB0")
///     .host("localhost")
///     .root("devices")
///     .finalize();
/// let device = Box::new(SerialDevice::new(settings.clone()));
/// let (_stop, shutdown) = tokio::sync::watch::channel(false);
///
/// let bridge = Bridge::new(settings, device, MqttConnector::new(), shutdown);
/// match bridge.run().await {
///     Ok(()) => 0,
///     Err(e) => e.exit_code(),
/// }
/// # }
/// ```
pub struct Bridge<C: BrokerConnector> {
    states: BridgeStates<C>,
}

impl<C: BrokerConnector> Bridge<C> {
    /// The bridge stops once `shutdown` turns `true`.
    pub fn new(
        settings: Settings,
        device: Box<dyn ByteTransport>,
        connector: C,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let topics = TopicScheme::new(
            settings.root.clone().unwrap_or_default(),
            settings.frame_mode(),
        );
        let session = PubSubSession::new(connector, settings.session_options(topics.availability()));
        let ctx = Context {
            settings,
            topics: Arc::new(topics),
            device: Mutex::new(Some(device)),
            session: Arc::new(session),
            shutdown,
        };
        Bridge {
            states: BridgeStates::Init(BridgeStateMachine {
                ctx,
                state: InitState {},
            }),
        }
    }

    /// Run the event loop until the `Done` state is reached and its
    /// `should_exit` flag is set.
    pub async fn run(self) -> Result<(), BridgeError> {
        let mut states = self.states;
        loop {
            states = states.step().await;
            if let BridgeStates::Done(sm) = &mut states {
                if sm.state.should_exit {
                    return match sm.state.error.take() {
                        Some(e) => Err(e),
                        None => Ok(()),
                    };
                }
            }
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

// -----------------------------------------------------------------------------
// The State Machine
// -----------------------------------------------------------------------------

/// The bridge state machine: the context shared by all states, and the
/// current state.
struct BridgeStateMachine<C: BrokerConnector, S> {
    ctx: Context<C>,
    state: S,
}
impl<C: BrokerConnector, S: Runnable<C>> BridgeStateMachine<C, S> {
    async fn run(self) -> Event<C> {
        self.state.run(self.ctx).await
    }
}

/// Wraps the state machine and its various states into a simple enum, which
/// can also be used for pattern matching during state transitions.
enum BridgeStates<C: BrokerConnector> {
    Init(BridgeStateMachine<C, InitState>),
    OpenPort(BridgeStateMachine<C, OpenPortState>),
    Connect(BridgeStateMachine<C, ConnectState>),
    Subscribe(BridgeStateMachine<C, SubscribeState>),
    Service(BridgeStateMachine<C, ServiceState>),
    Done(BridgeStateMachine<C, DoneState>),
}
impl<C: BrokerConnector> BridgeStates<C> {
    async fn step(self) -> Self {
        match self {
            BridgeStates::Init(sm) => match sm.run().await {
                Event::OpenPort(ev) => BridgeStates::OpenPort(ev.into()),
                Event::Done(ev) => BridgeStates::Done(ev.into()),
                event => unreachable!("illegal event {:?} at state Init", event),
            },
            BridgeStates::OpenPort(sm) => match sm.run().await {
                Event::PortOpened(ev) => BridgeStates::Connect(ev.into()),
                Event::Done(ev) => BridgeStates::Done(ev.into()),
                event => unreachable!("illegal event {:?} at state OpenPort", event),
            },
            BridgeStates::Connect(sm) => match sm.run().await {
                Event::Connected(ev) => BridgeStates::Subscribe(ev.into()),
                Event::Done(ev) => BridgeStates::Done(ev.into()),
                event => unreachable!("illegal event {:?} at state Connect", event),
            },
            BridgeStates::Subscribe(sm) => match sm.run().await {
                Event::Subscribed(ev) => BridgeStates::Service(ev.into()),
                Event::Done(ev) => BridgeStates::Done(ev.into()),
                event => unreachable!("illegal event {:?} at state Subscribe", event),
            },
            BridgeStates::Service(sm) => match sm.run().await {
                Event::Done(ev) => BridgeStates::Done(ev.into()),
                event => unreachable!("illegal event {:?} at state Service", event),
            },
            BridgeStates::Done(sm) => match sm.run().await {
                Event::Exit(ev) => BridgeStates::Done(ev.into()),
                event => unreachable!("illegal event {:?} at state Done", event),
            },
        }
    }
}

// -----------------------------------------------------------------------------
// State from Event transitions
// -----------------------------------------------------------------------------

impl<C: BrokerConnector> From<OpenPortEvent<C>> for BridgeStateMachine<C, OpenPortState> {
    fn from(event: OpenPortEvent<C>) -> Self {
        BridgeStateMachine {
            ctx: event.ctx,
            state: OpenPortState {},
        }
    }
}

impl<C: BrokerConnector> From<PortOpenedEvent<C>> for BridgeStateMachine<C, ConnectState> {
    fn from(event: PortOpenedEvent<C>) -> Self {
        BridgeStateMachine {
            ctx: event.ctx,
            state: ConnectState {
                transport: event.transport,
            },
        }
    }
}

impl<C: BrokerConnector> From<ConnectedEvent<C>> for BridgeStateMachine<C, SubscribeState> {
    fn from(event: ConnectedEvent<C>) -> Self {
        BridgeStateMachine {
            ctx: event.ctx,
            state: SubscribeState {
                transport: event.transport,
            },
        }
    }
}

impl<C: BrokerConnector> From<SubscribedEvent<C>> for BridgeStateMachine<C, ServiceState> {
    fn from(event: SubscribedEvent<C>) -> Self {
        BridgeStateMachine {
            ctx: event.ctx,
            state: ServiceState {
                transport: event.transport,
            },
        }
    }
}

impl<C: BrokerConnector> From<DoneEvent<C>> for BridgeStateMachine<C, DoneState> {
    fn from(event: DoneEvent<C>) -> Self {
        BridgeStateMachine {
            ctx: event.ctx,
            state: DoneState {
                error: event.error,
                should_exit: false,
            },
        }
    }
}
impl<C: BrokerConnector> From<ExitEvent<C>> for BridgeStateMachine<C, DoneState> {
    fn from(event: ExitEvent<C>) -> Self {
        BridgeStateMachine {
            ctx: event.ctx,
            state: DoneState {
                error: event.error,
                should_exit: true,
            },
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::protocol::FrameMode;
    use crate::session::QoS;
    use crate::settings::SettingsBuilder;
    use crate::testing::{AckMode, MockBroker, MockDevice, MockRemote, Request};

    /// `hi!` on channel 1.
    const HI_FRAME: [u8; 12] = [
        0xAA, 0xAA, 0xAA, 0xAA, 0x00, 0x01, 0x00, 0x03, 0x68, 0x69, 0x21, 0xAA,
    ];
    /// `ok` on channel 2.
    const OK_FRAME: [u8; 11] = [
        0xAA, 0xAA, 0xAA, 0xAA, 0x00, 0x02, 0x00, 0x02, 0x6F, 0x6B, 0xCB,
    ];

    fn settings() -> SettingsBuilder {
        SettingsBuilder::new()
            .path("mock")
            .host("localhost")
            .root("root")
            .ack_timeout(Duration::from_millis(200))
            .reconnect_delay(Duration::from_millis(20))
    }

    struct Running {
        broker: MockBroker,
        remote: MockRemote,
        stop: watch::Sender<bool>,
        bridge: tokio::task::JoinHandle<Result<(), BridgeError>>,
    }

    impl Running {
        async fn stop(self) -> Result<(), BridgeError> {
            self.stop.send_replace(true);
            tokio::time::timeout(Duration::from_secs(5), self.bridge)
                .await
                .expect("bridge stops")
                .expect("bridge task")
        }
    }

    /// Start a bridge and wait until it listens on the inbound topics.
    async fn start(settings: Settings) -> Running {
        let broker = MockBroker::new();
        let (device, remote) = MockDevice::new();
        let (stop, shutdown) = watch::channel(false);
        let bridge = Bridge::new(settings, Box::new(device), broker.clone(), shutdown);
        let bridge = tokio::spawn(bridge.run());

        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while !broker
            .requests()
            .iter()
            .any(|r| matches!(r, Request::Subscribe(..)))
        {
            assert!(tokio::time::Instant::now() < deadline, "bridge never subscribed");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        // Let the service state install its handlers
        tokio::time::sleep(Duration::from_millis(50)).await;

        Running {
            broker,
            remote,
            stop,
            bridge,
        }
    }

    async fn run_to_end(settings: Settings, broker: MockBroker, device: MockDevice) -> Result<(), BridgeError> {
        let (_stop, shutdown) = watch::channel(false);
        let bridge = Bridge::new(settings, Box::new(device), broker, shutdown);
        tokio::time::timeout(Duration::from_secs(5), bridge.run())
            .await
            .expect("bridge stops")
    }

    #[tokio::test]
    async fn device_frames_are_published() {
        let running = start(settings().finalize()).await;
        assert_eq!(
            running.broker.requests()[0],
            Request::Subscribe("root/+/in".into(), QoS::ExactlyOnce)
        );

        running.remote.send(&HI_FRAME);
        let published = running.broker.wait_published(2).await;
        let frame = &published[1];
        assert_eq!(frame.topic, "root/1/out");
        assert_eq!(frame.payload, b"hi!");
        assert_eq!(frame.qos, QoS::ExactlyOnce);
        assert!(!frame.retain);

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn broker_messages_reach_the_device() {
        let running = start(settings().finalize()).await;

        running.broker.inject("root/2/in", b"ok").await;
        assert_eq!(running.remote.wait_written(OK_FRAME.len()).await, OK_FRAME);

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn malformed_topics_do_not_reach_the_device() {
        let running = start(settings().finalize()).await;

        running.broker.inject("root/x/in", b"nope").await;
        running.broker.inject("root/2/in", b"ok").await;
        assert_eq!(running.remote.wait_written(OK_FRAME.len()).await, OK_FRAME);

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn corrupted_frames_are_skipped() {
        let running = start(settings().finalize()).await;

        let mut corrupted = HI_FRAME;
        corrupted[11] ^= 0xFF;
        running.remote.send(&corrupted);
        running.remote.send(&HI_FRAME);

        let published = running.broker.wait_published(2).await;
        assert_eq!(published.len(), 2);
        assert_eq!(published[1].payload, b"hi!");

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn single_mode_topics() {
        let running = start(settings().multiplexed(false).finalize()).await;
        assert_eq!(
            running.broker.requests()[0],
            Request::Subscribe("root/in".into(), QoS::ExactlyOnce)
        );

        running.remote.send(&[0x00, 0x02, b'o', b'k']);
        let published = running.broker.wait_published(2).await;
        assert_eq!(published[1].topic, "root/out");
        assert_eq!(published[1].payload, b"ok");

        running.broker.inject("root/in", b"hi").await;
        assert_eq!(
            running.remote.wait_written(4).await,
            [0x00, 0x02, b'h', b'i']
        );

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_announces_offline() {
        let running = start(settings().finalize()).await;
        let broker = running.broker.clone();
        running.stop().await.unwrap();

        let last = broker.published().pop().unwrap();
        assert_eq!(last.topic, "root/available");
        assert_eq!(last.payload, b"0");
        assert_eq!(broker.requests().last(), Some(&Request::Disconnect));
    }

    #[tokio::test]
    async fn reconnects_and_resubscribes() {
        let running = start(settings().finalize()).await;

        running.broker.drop_connection().await;
        running.broker.wait_connects(2).await;
        let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
        while running
            .broker
            .requests()
            .iter()
            .filter(|r| matches!(r, Request::Subscribe(..)))
            .count()
            < 2
        {
            assert!(tokio::time::Instant::now() < deadline, "no resubscription");
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        running.broker.inject("root/2/in", b"ok").await;
        assert_eq!(running.remote.wait_written(OK_FRAME.len()).await, OK_FRAME);

        running.stop().await.unwrap();
    }

    #[tokio::test]
    async fn losing_the_port_is_fatal() {
        let running = start(settings().finalize()).await;
        running.remote.fail_read();

        let result = tokio::time::timeout(Duration::from_secs(5), running.bridge)
            .await
            .unwrap()
            .unwrap();
        let error = result.unwrap_err();
        assert!(matches!(error, BridgeError::TransportLost(_)));
        assert_eq!(error.exit_code(), 5);
        // The bridge still says goodbye
        assert_eq!(running.broker.published().pop().unwrap().payload, b"0");
    }

    #[tokio::test]
    async fn invalid_settings() {
        let (device, _remote) = MockDevice::new();
        let result = run_to_end(SettingsBuilder::new().finalize(), MockBroker::new(), device).await;
        assert_eq!(result.unwrap_err().exit_code(), 1);
    }

    #[tokio::test]
    async fn port_open_failure() {
        let (device, _remote) = MockDevice::new();
        device.fail_open();
        let result = run_to_end(settings().finalize(), MockBroker::new(), device).await;
        assert_eq!(result.unwrap_err().exit_code(), 2);
    }

    #[tokio::test]
    async fn broker_connect_failure() {
        let broker = MockBroker::new();
        broker.refuse_connect(true);
        let (device, remote) = MockDevice::new();
        let result = run_to_end(settings().finalize(), broker, device).await;
        assert_eq!(result.unwrap_err().exit_code(), 3);
        assert!(remote.was_cancelled());
    }

    #[tokio::test]
    async fn subscription_refused() {
        let broker = MockBroker::new();
        broker.ack_mode(AckMode::Refuse);
        let (device, _remote) = MockDevice::new();
        let result = run_to_end(settings().finalize(), broker.clone(), device).await;
        assert!(matches!(result, Err(BridgeError::Subscribe(ref f)) if f == "root/+/in"));
        assert!(!broker.is_connected());
    }

    #[tokio::test]
    async fn stop_while_connecting() {
        let (device, _remote) = MockDevice::new();
        let (stop, shutdown) = watch::channel(false);
        stop.send_replace(true);
        let broker = MockBroker::new();
        let bridge = Bridge::new(settings().finalize(), Box::new(device), broker, shutdown);
        let result = tokio::time::timeout(Duration::from_secs(5), bridge.run())
            .await
            .unwrap();
        // Either connected and stopped from the service, or stopped while
        // connecting: both are clean exits.
        assert!(result.is_ok());
    }

    #[test]
    fn topics_follow_the_settings() {
        let topics = TopicScheme::new("root", settings().multiplexed(false).finalize().frame_mode());
        assert_eq!(topics.mode(), FrameMode::Single);
    }
}
