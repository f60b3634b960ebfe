//! States of the bridge state machine.
//!
//! This module is private and restricted to the [`bridge`](crate::bridge)
//! scope. The public interface of the state machine is
//! [`Bridge`](super::Bridge).
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex};

use log::{error, info};
use tokio::sync::watch;

use crate::error::BridgeError;
use crate::session::{BrokerConnector, BrokerEndpoint, PubSubSession, QoS};
use crate::settings::Settings;
use crate::transport::{ByteTransport, SerialTransport, TransportError, TransportOptions};

use super::events::*;
use super::forward::{wait_for_shutdown, Forwarder};
use super::topics::TopicScheme;

// =============================================================================
// Crate-Public Interface
// =============================================================================

/// Data shared by all states.
pub(crate) struct Context<C: BrokerConnector> {
    pub settings: Settings,
    pub topics: Arc<TopicScheme>,
    /// Taken by the `OpenPort` state.
    pub device: Mutex<Option<Box<dyn ByteTransport>>>,
    pub session: Arc<PubSubSession<C>>,
    pub shutdown: watch::Receiver<bool>,
}

impl<C: BrokerConnector> Context<C> {
    fn endpoint(&self) -> Result<BrokerEndpoint, BridgeError> {
        Ok(self.settings.endpoint()?)
    }
}

impl<C: BrokerConnector> fmt::Debug for Context<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("settings", &self.settings)
            .field("topics", &self.topics)
            .finish_non_exhaustive()
    }
}

/// Trait adding the ability for a state to be `run` after a transition into it.
pub(crate) trait Runnable<C: BrokerConnector> {
    /// A state implements this method so it can be `run` after the state
    /// machine transitions into it.
    ///
    /// The state does its work and requests the transition to a new state by
    /// returning the appropriate `event`, which hands the context over. The
    /// `event` is then consumed to create the new `state` using the
    /// corresponding `From` implementation.
    fn run(self, ctx: Context<C>) -> impl Future<Output = Event<C>> + Send;
}

fn done<C: BrokerConnector>(ctx: Context<C>, error: Option<BridgeError>) -> Event<C> {
    Event::Done(DoneEvent { ctx, error })
}

// Init State ==================================================================

/// Represents the initial state of the bridge state machine.
///
/// From the `InitState`, the state machine can evolve via the following
/// transitions:
///
///  * **`OpenPortEvent` => `OpenPortState`** when the settings are valid,
///  * **`DoneEvent` => `DoneState`** otherwise.
#[derive(Debug)]
pub(crate) struct InitState {}
impl<C: BrokerConnector> Runnable<C> for InitState {
    async fn run(self, ctx: Context<C>) -> Event<C> {
        info!("=> Init");
        match ctx.settings.validate() {
            Ok(()) => Event::OpenPort(OpenPortEvent { ctx }),
            Err(e) => {
                error!("Invalid settings: {}", e);
                done(ctx, Some(e.into()))
            }
        }
    }
}

// OpenPortState ===============================================================

#[derive(Debug)]
pub(crate) struct OpenPortState {}
impl<C: BrokerConnector> Runnable<C> for OpenPortState {
    async fn run(self, ctx: Context<C>) -> Event<C> {
        info!("=> OpenPort");
        let device = ctx
            .device
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        let device = match device {
            Some(device) => device,
            None => {
                return done(ctx, Some(BridgeError::TransportOpen(TransportError::Closed)));
            }
        };

        let options = TransportOptions {
            line_mode: ctx.settings.line_mode,
            rx_capacity: ctx.settings.queue_capacity,
            tx_capacity: ctx.settings.queue_capacity,
            ..TransportOptions::default()
        };
        match SerialTransport::open(device, options).await {
            Ok(transport) => Event::PortOpened(PortOpenedEvent {
                ctx,
                transport: Arc::new(transport),
            }),
            Err(e) => {
                error!("{}", e);
                done(ctx, Some(BridgeError::TransportOpen(e)))
            }
        }
    }
}

// ConnectState ================================================================

#[derive(Debug)]
pub(crate) struct ConnectState {
    pub transport: Arc<SerialTransport>,
}
impl<C: BrokerConnector> Runnable<C> for ConnectState {
    async fn run(self, ctx: Context<C>) -> Event<C> {
        info!("=> Connect");
        let endpoint = match ctx.endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                self.transport.close().await;
                return done(ctx, Some(e));
            }
        };

        let connected = tokio::select! {
            result = ctx.session.connect(&endpoint) => Some(result),
            _ = wait_for_shutdown(ctx.shutdown.clone()) => None,
        };
        match connected {
            Some(Ok(())) => Event::Connected(ConnectedEvent {
                ctx,
                transport: self.transport,
            }),
            Some(Err(e)) => {
                self.transport.close().await;
                done(ctx, Some(e.into()))
            }
            // Stopped while connecting
            None => {
                ctx.session.close(false).await;
                self.transport.close().await;
                done(ctx, None)
            }
        }
    }
}

// SubscribeState ==============================================================

#[derive(Debug)]
pub(crate) struct SubscribeState {
    pub transport: Arc<SerialTransport>,
}
impl<C: BrokerConnector> Runnable<C> for SubscribeState {
    async fn run(self, ctx: Context<C>) -> Event<C> {
        info!("=> Subscribe");
        let filter = ctx.topics.inbound_filter();
        if ctx.session.subscribe(&filter, QoS::ExactlyOnce).await {
            info!("Listening on '{}'", filter);
            Event::Subscribed(SubscribedEvent {
                ctx,
                transport: self.transport,
            })
        } else {
            error!("Subscription to '{}' was not granted", filter);
            ctx.session.close(false).await;
            self.transport.close().await;
            done(ctx, Some(BridgeError::Subscribe(filter)))
        }
    }
}

// ServiceState ================================================================

#[derive(Debug)]
pub(crate) struct ServiceState {
    pub transport: Arc<SerialTransport>,
}
impl<C: BrokerConnector> Runnable<C> for ServiceState {
    async fn run(self, ctx: Context<C>) -> Event<C> {
        info!("=> Service");
        let endpoint = match ctx.endpoint() {
            Ok(endpoint) => endpoint,
            Err(e) => {
                ctx.session.close(false).await;
                self.transport.close().await;
                return done(ctx, Some(e));
            }
        };

        let forwarder = Forwarder {
            session: ctx.session.clone(),
            topics: ctx.topics.clone(),
            transport: self.transport,
            endpoint,
            queue_capacity: ctx.settings.queue_capacity,
            reconnect_delay: ctx.settings.reconnect_delay,
        };
        let result = forwarder.run(ctx.shutdown.clone()).await;
        done(ctx, result.err())
    }
}

// Done State ==================================================================

#[derive(Debug)]
pub(crate) struct DoneState {
    pub error: Option<BridgeError>,
    pub should_exit: bool,
}
impl<C: BrokerConnector> Runnable<C> for DoneState {
    async fn run(mut self, ctx: Context<C>) -> Event<C> {
        info!(
            "=> Done with{}errors",
            if self.error.is_some() { " " } else { " no " }
        );
        Event::Exit(ExitEvent {
            ctx,
            error: self.error.take(),
        })
    }
}
