//! Publish/subscribe session on top of a broker connection.
//!
//! A [`PubSubSession`] wraps a [`BrokerConnector`] and keeps what must
//! survive a connection:
//!
//! * the subscriptions the broker granted, replayed on every new connection,
//! * the message handler,
//! * the presence announcement: a retained *online* payload published once
//!   connected, and a matching *offline* payload registered as last will and
//!   published on a graceful close.
//!
//! Subscribe and unsubscribe requests are confirmed by the broker. Every
//! request in flight is kept in a registry keyed by its correlation id, with
//! a one-shot responder that the connection's event task completes when the
//! acknowledgement arrives:
//!
//! ```text
//!   subscribe() --register id--> [ pending ] <--ack(id)-- event task <-- broker
//!        |                           |
//!        '------- wait (timeout) <---'
//! ```
//!
//! A request that times out is removed from the registry, so a late
//! acknowledgement finds nothing to complete. Losing the connection fails
//! every request in flight.

mod broker;
mod mqtt;
mod topic;

pub use broker::{
    AckId, BrokerConnector, BrokerEndpoint, BrokerError, BrokerEvent, BrokerLink, ConnectError,
    ConnectOptions, Credentials, QoS,
};
pub use mqtt::MqttConnector;
pub use topic::{TopicError, TopicFilter};

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, error, info, trace, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

// =============================================================================
// Public Interface
// =============================================================================

/// Default time to wait for the acknowledgement of a request.
pub const DEFAULT_ACK_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let status = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        };
        f.write_str(status)
    }
}

/// Retained availability announcement of the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Presence {
    pub topic: String,
    pub online: Vec<u8>,
    pub offline: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub client_id: String,
    pub presence: Option<Presence>,
    pub clean_session: bool,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// Replay the known subscriptions after (re)connecting. When off they
    /// are still tracked, the broker session is expected to keep them.
    pub resubscribe: bool,
    pub ack_timeout: Duration,
}

impl SessionOptions {
    pub fn new(client_id: impl Into<String>) -> Self {
        SessionOptions {
            client_id: client_id.into(),
            presence: None,
            clean_session: true,
            keep_alive: Duration::from_secs(30),
            connect_timeout: DEFAULT_ACK_TIMEOUT,
            resubscribe: true,
            ack_timeout: DEFAULT_ACK_TIMEOUT,
        }
    }
}

/// Future returned by a message handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = ()> + Send>>;

type MessageHandler = Arc<dyn Fn(String, Vec<u8>) -> HandlerFuture + Send + Sync>;

pub struct PubSubSession<C: BrokerConnector> {
    connector: C,
    options: SessionOptions,
    shared: Arc<Shared<C::Link>>,
}

impl<C: BrokerConnector> PubSubSession<C> {
    pub fn new(connector: C, options: SessionOptions) -> Self {
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        PubSubSession {
            connector,
            options,
            shared: Arc::new(Shared {
                state: Mutex::new(State {
                    link: None,
                    generation: 0,
                    events_task: None,
                    pending: HashMap::new(),
                    subscriptions: BTreeMap::new(),
                    next_id: 0,
                }),
                handler: Mutex::new(None),
                status,
            }),
        }
    }

    /// Install the handler of inbound messages, replacing the previous one.
    /// Messages are handled one at a time, in arrival order.
    pub fn on_message<F, Fut>(&self, handler: F)
    where
        F: Fn(String, Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handler: MessageHandler =
            Arc::new(move |topic: String, payload: Vec<u8>| -> HandlerFuture {
                Box::pin(handler(topic, payload))
            });
        *self.shared.handler.lock().unwrap_or_else(|e| e.into_inner()) = Some(handler);
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status.borrow()
    }

    /// Follow the connection status.
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.shared.lock().link.is_some()
    }

    /// Connect to `endpoint`, dropping the current connection if any.
    ///
    /// Once connected, the known subscriptions are replayed (when enabled)
    /// and the online announcement is published. A subscription the broker
    /// no longer grants is logged and forgotten, it does not fail the
    /// connection.
    pub async fn connect(&self, endpoint: &BrokerEndpoint) -> Result<(), ConnectError> {
        self.close(false).await;
        self.shared.set_status(ConnectionStatus::Connecting);

        let options = ConnectOptions {
            client_id: self.options.client_id.clone(),
            endpoint: endpoint.clone(),
            will: self
                .options
                .presence
                .as_ref()
                .map(|p| (p.topic.clone(), p.offline.clone())),
            clean_session: self.options.clean_session,
            keep_alive: self.options.keep_alive,
            connect_timeout: self.options.connect_timeout,
        };
        let (link, events) = match self.connector.connect(&options).await {
            Ok(connection) => connection,
            Err(e) => {
                error!("Unable to connect to broker {}: {}", endpoint, e);
                self.shared.set_status(ConnectionStatus::Disconnected);
                return Err(e);
            }
        };

        let replay = {
            let mut state = self.shared.lock();
            state.generation += 1;
            state.link = Some(Arc::new(link));
            let task = tokio::spawn(event_loop(self.shared.clone(), state.generation, events));
            state.events_task = Some(task);
            if self.options.resubscribe {
                state
                    .subscriptions
                    .iter()
                    .map(|(topic, subscription)| (topic.clone(), subscription.qos))
                    .collect::<Vec<_>>()
            } else {
                vec![]
            }
        };
        self.shared.set_status(ConnectionStatus::Connected);
        info!(
            "Connected to broker {} as '{}'",
            endpoint, self.options.client_id
        );

        for (topic, qos) in replay {
            if !self.subscribe(&topic, qos).await {
                warn!("Subscription to '{}' could not be restored", topic);
                self.shared.lock().subscriptions.remove(&topic);
            }
        }

        if let Some(presence) = &self.options.presence {
            self.publish(
                &presence.topic,
                presence.online.clone(),
                QoS::ExactlyOnce,
                true,
            )
            .await;
        }
        Ok(())
    }

    /// Subscribe to `filter` and wait for the broker to grant it.
    pub async fn subscribe(&self, filter: &str, qos: QoS) -> bool {
        let matcher = match TopicFilter::new(filter) {
            Ok(matcher) => matcher,
            Err(e) => {
                warn!("Refusing to subscribe: {}", e);
                return false;
            }
        };
        let (link, id, ack) = match self.shared.register(AckKind::Subscribe, filter) {
            Some(request) => request,
            None => {
                debug!("Cannot subscribe to '{}': not connected", filter);
                return false;
            }
        };

        if let Err(e) = link.subscribe(id, filter, qos).await {
            warn!("Subscription to '{}' failed: {}", filter, e);
            self.shared.forget(id);
            return false;
        }
        let granted = self.wait_ack(id, filter, ack).await;
        if granted {
            debug!("Subscribed to '{}' ({:?})", filter, qos);
            self.shared
                .lock()
                .subscriptions
                .insert(filter.into(), Subscription { qos, matcher });
        } else {
            warn!("Subscription to '{}' was not granted", filter);
        }
        granted
    }

    /// Drop the subscription to `filter`. When not connected the
    /// subscription is only forgotten locally.
    pub async fn unsubscribe(&self, filter: &str) -> bool {
        let (link, id, ack) = {
            let mut state = self.shared.lock();
            if state.link.is_none() {
                return state.subscriptions.remove(filter).is_some();
            }
            drop(state);
            match self.shared.register(AckKind::Unsubscribe, filter) {
                Some(request) => request,
                None => return self.shared.lock().subscriptions.remove(filter).is_some(),
            }
        };

        if let Err(e) = link.unsubscribe(id, filter).await {
            warn!("Unsubscription from '{}' failed: {}", filter, e);
            self.shared.forget(id);
            return false;
        }
        let done = self.wait_ack(id, filter, ack).await;
        if done {
            debug!("Unsubscribed from '{}'", filter);
            self.shared.lock().subscriptions.remove(filter);
        }
        done
    }

    /// Unsubscribe from everything, stopping at the first failure.
    pub async fn clear_subscriptions(&self) -> bool {
        for filter in self.subscriptions() {
            if !self.unsubscribe(&filter).await {
                return false;
            }
        }
        true
    }

    /// Granted subscription filters, sorted.
    pub fn subscriptions(&self) -> Vec<String> {
        self.shared.lock().subscriptions.keys().cloned().collect()
    }

    /// Whether a message published on `topic` would be delivered by one of
    /// the current subscriptions.
    pub fn is_subscribed(&self, topic: &str) -> bool {
        self.shared
            .lock()
            .subscriptions
            .values()
            .any(|subscription| subscription.matcher.matches(topic))
    }

    /// Queue a message for publication. Returns `false` when not connected or
    /// when the client refused it.
    pub async fn publish(&self, topic: &str, payload: Vec<u8>, qos: QoS, retain: bool) -> bool {
        let link = match self.shared.link() {
            Some(link) => link,
            None => {
                debug!("Dropping message for '{}': not connected", topic);
                return false;
            }
        };
        match link.publish(topic, payload, qos, retain).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Publication on '{}' failed: {}", topic, e);
                false
            }
        }
    }

    /// Close the connection, if any. The offline announcement is published
    /// first. Requests in flight fail. With `discard_subscriptions`, the
    /// known subscriptions are not replayed by the next `connect()`.
    pub async fn close(&self, discard_subscriptions: bool) {
        let (link, task) = {
            let mut state = self.shared.lock();
            state.generation += 1;
            if discard_subscriptions {
                state.subscriptions.clear();
            }
            state.fail_pending();
            (state.link.take(), state.events_task.take())
        };
        if let Some(task) = task {
            task.abort();
        }

        if let Some(link) = link {
            if let Some(presence) = &self.options.presence {
                let offline = presence.offline.clone();
                if let Err(e) = link
                    .publish(&presence.topic, offline, QoS::ExactlyOnce, true)
                    .await
                {
                    debug!("Offline announcement not sent: {}", e);
                }
            }
            link.disconnect().await;
            info!("Disconnected from broker");
        }
        self.shared.set_status(ConnectionStatus::Disconnected);
    }

    async fn wait_ack(&self, id: AckId, filter: &str, ack: oneshot::Receiver<bool>) -> bool {
        tokio::select! {
            result = ack => result.unwrap_or(false),
            _ = tokio::time::sleep(self.options.ack_timeout) => {
                warn!("No acknowledgement for '{}' within {:?}", filter, self.options.ack_timeout);
                self.shared.forget(id);
                false
            }
        }
    }
}

impl<C: BrokerConnector> Drop for PubSubSession<C> {
    fn drop(&mut self) {
        if let Some(task) = self.shared.lock().events_task.take() {
            task.abort();
        }
    }
}

// =============================================================================
// Private stuff
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AckKind {
    Subscribe,
    Unsubscribe,
}

/// A request waiting for its acknowledgement.
struct PendingAck {
    kind: AckKind,
    filter: String,
    responder: oneshot::Sender<bool>,
}

struct State<L> {
    link: Option<Arc<L>>,
    /// Bumped on every connect and close, so that the event task of a
    /// previous connection cannot tear down the current one.
    generation: u64,
    events_task: Option<JoinHandle<()>>,
    pending: HashMap<AckId, PendingAck>,
    subscriptions: BTreeMap<String, Subscription>,
    next_id: AckId,
}

/// A granted subscription, with its filter compiled once.
struct Subscription {
    qos: QoS,
    matcher: TopicFilter,
}

impl<L> State<L> {
    fn next_ack_id(&mut self) -> AckId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if self.next_id != 0 && !self.pending.contains_key(&self.next_id) {
                return self.next_id;
            }
        }
    }

    fn fail_pending(&mut self) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.responder.send(false);
        }
    }
}

struct Shared<L> {
    state: Mutex<State<L>>,
    handler: Mutex<Option<MessageHandler>>,
    status: watch::Sender<ConnectionStatus>,
}

impl<L: BrokerLink> Shared<L> {
    fn lock(&self) -> MutexGuard<'_, State<L>> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn link(&self) -> Option<Arc<L>> {
        self.lock().link.clone()
    }

    fn handler(&self) -> Option<MessageHandler> {
        self.handler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.status.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            *current = status;
            true
        });
    }

    /// Allocate an id for a new request and register its responder.
    fn register(
        &self,
        kind: AckKind,
        filter: &str,
    ) -> Option<(Arc<L>, AckId, oneshot::Receiver<bool>)> {
        let mut state = self.lock();
        let link = state.link.clone()?;
        let id = state.next_ack_id();
        let (responder, ack) = oneshot::channel();
        state.pending.insert(
            id,
            PendingAck {
                kind,
                filter: filter.into(),
                responder,
            },
        );
        Some((link, id, ack))
    }

    fn forget(&self, id: AckId) {
        self.lock().pending.remove(&id);
    }

    fn acknowledge(&self, id: AckId, kind: AckKind, success: bool) {
        let pending = {
            let mut state = self.lock();
            match state.pending.get(&id) {
                Some(pending) if pending.kind == kind => state.pending.remove(&id),
                _ => None,
            }
        };
        match pending {
            Some(pending) => {
                trace!("{:?} #{} on '{}' acknowledged", kind, id, pending.filter);
                let _ = pending.responder.send(success);
            }
            None => debug!("Ignoring stale acknowledgement #{}", id),
        }
    }

    fn connection_lost(&self, generation: u64) {
        {
            let mut state = self.lock();
            if state.generation != generation || state.link.is_none() {
                return;
            }
            state.link = None;
            state.events_task = None;
            state.fail_pending();
        }
        self.set_status(ConnectionStatus::Disconnected);
    }
}

/// Consumes the events of one connection.
async fn event_loop<L: BrokerLink>(
    shared: Arc<Shared<L>>,
    generation: u64,
    mut events: mpsc::Receiver<BrokerEvent>,
) {
    while let Some(event) = events.recv().await {
        match event {
            BrokerEvent::SubAck { id, granted } => {
                shared.acknowledge(id, AckKind::Subscribe, granted)
            }
            BrokerEvent::UnsubAck { id } => shared.acknowledge(id, AckKind::Unsubscribe, true),
            BrokerEvent::Message { topic, payload } => match shared.handler() {
                Some(handler) => handler(topic, payload).await,
                None => trace!("No handler, dropping message on '{}'", topic),
            },
            BrokerEvent::ConnectionLost { reason } => {
                warn!("Connection to broker lost: {}", reason);
                break;
            }
        }
    }
    shared.connection_lost(generation);
}

// =============================================================================
// Unit Tests
// =============================================================================
