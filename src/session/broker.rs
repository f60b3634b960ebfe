//! The broker client seam.
//!
//! [`PubSubSession`](super::PubSubSession) does not talk to a broker library
//! directly. It drives a [`BrokerConnector`], which opens a connection and
//! hands back:
//!
//! * a [`BrokerLink`] to send requests on that connection,
//! * a stream of [`BrokerEvent`]s (acknowledgements, inbound messages,
//!   connection loss) produced by the connection until it ends.
//!
//! Subscribe and unsubscribe requests carry a correlation id chosen by the
//! session; the connector reports the matching acknowledgement with the same
//! id. The production connector is [`MqttConnector`](super::MqttConnector).

use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;

pub use rumqttc::QoS;

/// Correlation id of a subscribe or unsubscribe request.
pub type AckId = u16;

#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Where the broker lives and how to log into it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerEndpoint {
    pub host: String,
    pub port: u16,
    pub credentials: Option<Credentials>,
}

impl std::fmt::Display for BrokerEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Everything a connector needs to open one connection.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    pub client_id: String,
    pub endpoint: BrokerEndpoint,
    /// Last will: topic and payload, published retained at QoS 2 by the
    /// broker when the connection is lost.
    pub will: Option<(String, Vec<u8>)>,
    pub clean_session: bool,
    pub keep_alive: Duration,
    /// Upper bound on the handshake.
    pub connect_timeout: Duration,
}

/// Something that happened on an open connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BrokerEvent {
    /// Subscription acknowledged; `granted` is false when the broker refused
    /// it.
    SubAck { id: AckId, granted: bool },
    UnsubAck { id: AckId },
    Message { topic: String, payload: Vec<u8> },
    /// The connection is gone; no more events follow.
    ConnectionLost { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConnectError {
    #[error("broker {address} is unreachable: {reason}")]
    Unreachable { address: String, reason: String },
    #[error("connection refused by the broker: {0}")]
    Refused(String),
    #[error("no answer from the broker within {0:?}")]
    Timeout(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BrokerError {
    #[error("not connected")]
    NotConnected,
    #[error("request could not be queued: {0}")]
    Request(String),
}

/// Opens connections to a broker.
pub trait BrokerConnector: Send + Sync + 'static {
    type Link: BrokerLink;

    /// Connect and complete the handshake. Events of the new connection are
    /// delivered on the returned receiver until it ends with
    /// [`BrokerEvent::ConnectionLost`] or is closed.
    fn connect(
        &self,
        options: &ConnectOptions,
    ) -> impl Future<Output = Result<(Self::Link, mpsc::Receiver<BrokerEvent>), ConnectError>> + Send;
}

/// Requests on one open connection.
pub trait BrokerLink: Send + Sync + 'static {
    fn subscribe(
        &self,
        id: AckId,
        filter: &str,
        qos: QoS,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn unsubscribe(&self, id: AckId, filter: &str)
        -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Gracefully close the connection. No last will is sent.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;
}
