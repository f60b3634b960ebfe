//! Events of the bridge state machine.
//!
//! This module is private and restricted to the [`bridge`](crate::bridge)
//! scope. Every event carries the [`Context`] shared by all states, plus
//! whatever the origin state hands over to the target state.
//!
//! Refer to the [`state_machine`](super::state_machine) module for an overview
//! of states, events and transitions.

use std::fmt;
use std::sync::Arc;

use crate::error::BridgeError;
use crate::session::BrokerConnector;
use crate::transport::SerialTransport;

use super::states::Context;

// =============================================================================
// Crate-Public Interface
// =============================================================================

// OpenPortEvent ===============================================================

/// Event fired from the `Init` state once the settings are known to be
/// valid. Triggers the transition to the `OpenPort` state.
pub(crate) struct OpenPortEvent<C: BrokerConnector> {
    pub ctx: Context<C>,
}

// PortOpenedEvent =============================================================

/// Event fired when the serial transport is up. Triggers the transition to
/// the `Connect` state, which takes over the transport.
pub(crate) struct PortOpenedEvent<C: BrokerConnector> {
    pub ctx: Context<C>,
    pub transport: Arc<SerialTransport>,
}

// ConnectedEvent ==============================================================

/// Event fired once the broker session is connected. Triggers the transition
/// to the `Subscribe` state.
pub(crate) struct ConnectedEvent<C: BrokerConnector> {
    pub ctx: Context<C>,
    pub transport: Arc<SerialTransport>,
}

// SubscribedEvent =============================================================

/// Event fired once the broker granted the subscription to the inbound
/// topics. Triggers the transition to the `Service` state.
pub(crate) struct SubscribedEvent<C: BrokerConnector> {
    pub ctx: Context<C>,
    pub transport: Arc<SerialTransport>,
}

// DoneEvent ===================================================================

/// Event fired when the bridge stops, either on request or on a fatal error.
/// It can be fired from any state but `Done`, after the state released what
/// it owned. Triggers the transition to the `Done` state.
pub(crate) struct DoneEvent<C: BrokerConnector> {
    pub ctx: Context<C>,
    pub error: Option<BridgeError>,
}

// ExitEvent ===================================================================

/// The last event of the state machine. The event loop terminates after it
/// and hands the outcome back to the caller of
/// [`Bridge::run`](super::Bridge::run).
pub(crate) struct ExitEvent<C: BrokerConnector> {
    pub ctx: Context<C>,
    pub error: Option<BridgeError>,
}

// Events enum =================================================================

/// Events that can be triggered within the bridge state machine.
pub(crate) enum Event<C: BrokerConnector> {
    OpenPort(OpenPortEvent<C>),
    PortOpened(PortOpenedEvent<C>),
    Connected(ConnectedEvent<C>),
    Subscribed(SubscribedEvent<C>),
    Done(DoneEvent<C>),
    Exit(ExitEvent<C>),
}

impl<C: BrokerConnector> fmt::Debug for Event<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Event::OpenPort(_) => f.write_str("OpenPort"),
            Event::PortOpened(ev) => write!(f, "PortOpened({})", ev.transport.name()),
            Event::Connected(_) => f.write_str("Connected"),
            Event::Subscribed(_) => f.write_str("Subscribed"),
            Event::Done(ev) => write!(f, "Done({:?})", ev.error),
            Event::Exit(ev) => write!(f, "Exit({:?})", ev.error),
        }
    }
}
