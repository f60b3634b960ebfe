//! The bridge in service: frames flowing both ways.
//!
//! ```text
//!   serial read --> decode --> [ uplink ] --> publish --> <root>/<ch>/out
//!   serial write <-- encode <-- [ downlink ] <-- route <-- <root>/<ch>/in
//! ```
//!
//! Each arrow with a queue is a task of its own, the queues are bounded
//! [`CancelableChannel`]s so that a slow side holds back the other one
//! instead of dropping frames. A supervisor task reconnects the broker
//! session whenever it drops.
//!
//! Losing the serial port ends the service. On the way out, things are
//! stopped in an order that lets frames already received from the device
//! reach the broker:
//!
//! 1. the supervisor,
//! 2. the serial transport, which ends the decode task and closes the
//!    uplink,
//! 3. the uplink, drained into the broker,
//! 4. the broker session, which announces the bridge offline,
//! 5. the downlink.

use std::sync::Arc;
use std::time::Duration;

use hexplay::HexViewBuilder;
use log::{debug, error, info, log_enabled, trace, warn, Level};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::channel::CancelableChannel;
use crate::error::BridgeError;
use crate::protocol::{Frame, FrameDecoder, FrameEncoder, FrameMode};
use crate::session::{BrokerConnector, BrokerEndpoint, ConnectionStatus, PubSubSession, QoS};
use crate::transport::SerialTransport;

use super::topics::TopicScheme;

/// Upper bound on the time spent publishing what is left in the uplink.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Resolves once a shutdown is requested, or when nobody can request it
/// anymore.
pub(crate) async fn wait_for_shutdown(mut shutdown: watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

pub(crate) struct Forwarder<C: BrokerConnector> {
    pub session: Arc<PubSubSession<C>>,
    pub topics: Arc<TopicScheme>,
    pub transport: Arc<SerialTransport>,
    pub endpoint: BrokerEndpoint,
    pub queue_capacity: usize,
    pub reconnect_delay: Duration,
}

impl<C: BrokerConnector> Forwarder<C> {
    /// Serve until `shutdown` or until the serial port is lost.
    pub(crate) async fn run(self, shutdown: watch::Receiver<bool>) -> Result<(), BridgeError> {
        let mode = self.topics.mode();
        let uplink = Arc::new(CancelableChannel::new(self.queue_capacity));
        let downlink = Arc::new(CancelableChannel::new(self.queue_capacity));

        // Whatever the device sent before we were ready is stale
        self.transport.flush_input();

        {
            let topics = self.topics.clone();
            let downlink = downlink.clone();
            self.session.on_message(move |topic, payload| {
                let topics = topics.clone();
                let downlink = downlink.clone();
                async move { route_inbound(&topics, &downlink, topic, payload).await }
            });
        }

        let mut decoder = tokio::spawn(decode(self.transport.clone(), mode, uplink.clone()));
        let mut publisher = tokio::spawn(publish(
            self.session.clone(),
            self.topics.clone(),
            uplink.clone(),
        ));
        let writer = tokio::spawn(write(self.transport.clone(), mode, downlink.clone()));
        let supervisor = tokio::spawn(supervise(
            self.session.clone(),
            self.endpoint.clone(),
            self.topics.inbound_filter(),
            self.reconnect_delay,
        ));
        info!(
            "Bridging '{}' and {} under '{}' ({})",
            self.transport.name(),
            self.endpoint,
            self.topics.root(),
            mode
        );

        let lost = tokio::select! {
            _ = wait_for_shutdown(shutdown) => false,
            _ = &mut decoder => true,
        };
        if lost {
            error!("Serial port '{}' was lost", self.transport.name());
        } else {
            info!("Shutting down the bridge");
        }

        supervisor.abort();
        self.transport.close().await;
        if !lost {
            join(decoder, "decode").await;
        }
        uplink.close(None);
        if tokio::time::timeout(DRAIN_TIMEOUT, &mut publisher)
            .await
            .is_err()
        {
            warn!("{} frames not published in time, dropping them", uplink.len());
            publisher.abort();
        }
        self.session.close(false).await;
        downlink.close(None);
        join(writer, "write").await;

        if lost {
            Err(BridgeError::TransportLost(self.transport.name().into()))
        } else {
            Ok(())
        }
    }
}

async fn join(task: JoinHandle<()>, name: &str) {
    if let Err(e) = task.await {
        warn!("The {} task failed: {}", name, e);
    }
}

/// Serial input -> frames -> uplink.
async fn decode(
    transport: Arc<SerialTransport>,
    mode: FrameMode,
    uplink: Arc<CancelableChannel<Frame>>,
) {
    let mut decoder = FrameDecoder::new(mode);
    while let Ok(data) = transport.read().await {
        for result in decoder.feed(&data) {
            match result {
                Ok(frame) => {
                    trace!("{:?} from the device", frame);
                    if uplink.put(frame).await.is_err() {
                        return;
                    }
                }
                Err(e) => warn!("Dropping frame: {}", e),
            }
        }
    }
    debug!("Serial input has ended");
    uplink.close(None);
}

/// Uplink -> broker.
async fn publish<C: BrokerConnector>(
    session: Arc<PubSubSession<C>>,
    topics: Arc<TopicScheme>,
    uplink: Arc<CancelableChannel<Frame>>,
) {
    while let Ok(frame) = uplink.get().await {
        let topic = topics.outbound(frame.channel_id());
        let length = frame.length();
        if session
            .publish(&topic, frame.into_payload(), QoS::ExactlyOnce, false)
            .await
        {
            trace!("{} bytes published on '{}'", length, topic);
        } else {
            warn!("Dropping {} bytes for '{}': not published", length, topic);
        }
    }
    debug!("Uplink has ended");
}

/// Broker message -> downlink.
async fn route_inbound(
    topics: &TopicScheme,
    downlink: &CancelableChannel<Frame>,
    topic: String,
    payload: Vec<u8>,
) {
    let channel_id = match topics.parse_inbound(&topic) {
        Ok(channel_id) => channel_id,
        Err(e) => {
            warn!("Ignoring message: {}", e);
            return;
        }
    };
    let frame = match Frame::new(channel_id, payload) {
        Ok(frame) => frame,
        Err(e) => {
            warn!("Ignoring message on '{}': {}", topic, e);
            return;
        }
    };
    if downlink.put(frame).await.is_err() {
        debug!("Downlink is closed, dropping message on '{}'", topic);
    }
}

/// Downlink -> serial output.
async fn write(
    transport: Arc<SerialTransport>,
    mode: FrameMode,
    downlink: Arc<CancelableChannel<Frame>>,
) {
    let encoder = FrameEncoder::new(mode);
    while let Ok(frame) = downlink.get().await {
        let bytes = match encoder.encode(&frame) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!("Dropping {:?}: {}", frame, e);
                continue;
            }
        };
        if log_enabled!(Level::Debug) {
            let view = HexViewBuilder::new(&bytes)
                .address_offset(0)
                .row_width(16)
                .finish();
            debug!("To the device:\n{}", view);
        }
        if transport.write(bytes).await.is_err() {
            break;
        }
    }
    debug!("Serial output has ended");
}

/// Reconnect the session each time it drops, restoring the subscription to
/// the inbound topics if needed.
async fn supervise<C: BrokerConnector>(
    session: Arc<PubSubSession<C>>,
    endpoint: BrokerEndpoint,
    inbound: String,
    delay: Duration,
) {
    let mut status = session.watch_status();
    loop {
        let closed = status
            .wait_for(|s| *s == ConnectionStatus::Disconnected)
            .await
            .is_err();
        if closed {
            return;
        }
        warn!("Broker connection lost, reconnecting every {:?}", delay);

        loop {
            tokio::time::sleep(delay).await;
            match session.connect(&endpoint).await {
                Ok(()) => break,
                Err(e) => warn!("Reconnection to {} failed: {}", endpoint, e),
            }
        }

        if !session.subscriptions().contains(&inbound)
            && !session.subscribe(&inbound, QoS::ExactlyOnce).await
        {
            error!("Could not listen on '{}' again, dropping the connection", inbound);
            session.close(false).await;
            continue;
        }
        info!("Broker connection restored");
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn malformed_topics_are_dropped() {
        let topics = TopicScheme::new("root", FrameMode::Multiplexed);
        let downlink = CancelableChannel::new(4);

        route_inbound(&topics, &downlink, "root/x/in".into(), b"no".to_vec()).await;
        route_inbound(&topics, &downlink, "elsewhere/1/in".into(), b"no".to_vec()).await;
        assert!(downlink.is_empty());

        route_inbound(&topics, &downlink, "root/2/in".into(), b"ok".to_vec()).await;
        let frame = downlink.try_get().unwrap();
        assert_eq!(frame.channel_id(), Some(2));
        assert_eq!(frame.payload(), b"ok");
    }

    #[tokio::test]
    async fn single_mode_routes_without_channel() {
        let topics = TopicScheme::new("root", FrameMode::Single);
        let downlink = CancelableChannel::new(4);
        route_inbound(&topics, &downlink, "root/in".into(), b"ok".to_vec()).await;
        assert_eq!(downlink.try_get().unwrap().channel_id(), None);
    }

    #[tokio::test]
    async fn oversized_messages_are_dropped() {
        let topics = TopicScheme::new("root", FrameMode::Multiplexed);
        let downlink = CancelableChannel::new(4);
        let payload = vec![0; crate::protocol::MAX_PAYLOAD_LEN + 1];
        route_inbound(&topics, &downlink, "root/1/in".into(), payload).await;
        assert!(downlink.is_empty());
    }

    #[tokio::test]
    async fn shutdown_wait_ends_with_the_sender() {
        let (stop, shutdown) = watch::channel(false);
        let waiting = tokio::spawn(wait_for_shutdown(shutdown));
        stop.send_replace(true);
        tokio::time::timeout(Duration::from_secs(1), waiting)
            .await
            .unwrap()
            .unwrap();

        let (stop, shutdown) = watch::channel(false);
        drop(stop);
        tokio::time::timeout(Duration::from_secs(1), wait_for_shutdown(shutdown))
            .await
            .unwrap();
    }
}
