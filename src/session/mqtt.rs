//! [`BrokerConnector`] over MQTT 3.1.1, using `rumqttc`.
//!
//! `rumqttc` assigns packet ids itself and only reveals them when the request
//! is written to the network (`Outgoing::Subscribe(pkid)`). Requests are
//! queued in the client in submission order, so the link remembers the
//! correlation ids of submitted requests in a FIFO and pairs them with packet
//! ids as the outgoing events come by:
//!
//! ```text
//!   subscribe(id) --> [ submitted: id ] --Outgoing(pkid)--> { pkid: id } --SubAck(pkid)--> SubAck(id)
//! ```

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use log::{debug, trace, warn};
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, LastWill, MqttOptions,
    Outgoing, Packet, SubscribeReasonCode,
};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::broker::{
    AckId, BrokerConnector, BrokerError, BrokerEvent, BrokerLink, ConnectError, ConnectOptions,
    QoS,
};

/// Capacity of the request queue of the client, and of the event stream.
const DEFAULT_CAPACITY: usize = 64;

/// Time given to the connection to flush a disconnect request.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct MqttConnector {
    capacity: usize,
}

impl Default for MqttConnector {
    fn default() -> Self {
        MqttConnector {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

impl MqttConnector {
    pub fn new() -> Self {
        MqttConnector::default()
    }
}

impl BrokerConnector for MqttConnector {
    type Link = MqttLink;

    async fn connect(
        &self,
        options: &ConnectOptions,
    ) -> Result<(MqttLink, mpsc::Receiver<BrokerEvent>), ConnectError> {
        let endpoint = &options.endpoint;
        let mut mqtt = MqttOptions::new(&options.client_id, &endpoint.host, endpoint.port);
        mqtt.set_keep_alive(options.keep_alive);
        mqtt.set_clean_session(options.clean_session);
        if let Some(credentials) = &endpoint.credentials {
            mqtt.set_credentials(&credentials.username, &credentials.password);
        }
        if let Some((topic, payload)) = &options.will {
            mqtt.set_last_will(LastWill::new(
                topic,
                payload.clone(),
                QoS::ExactlyOnce,
                true,
            ));
        }

        let (client, mut eventloop) = AsyncClient::new(mqtt, self.capacity);
        debug!("Connecting to {} as '{}'", endpoint, options.client_id);
        let handshake = async {
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                        return match ack.code {
                            ConnectReturnCode::Success => Ok(()),
                            code => Err(ConnectError::Refused(format!("{:?}", code))),
                        };
                    }
                    Ok(_) => {}
                    Err(ConnectionError::ConnectionRefused(code)) => {
                        return Err(ConnectError::Refused(format!("{:?}", code)))
                    }
                    Err(e) => {
                        return Err(ConnectError::Unreachable {
                            address: endpoint.to_string(),
                            reason: e.to_string(),
                        })
                    }
                }
            }
        };
        tokio::time::timeout(options.connect_timeout, handshake)
            .await
            .map_err(|_| ConnectError::Timeout(options.connect_timeout))??;

        let (events, receiver) = mpsc::channel(self.capacity);
        let in_flight = Arc::new(Mutex::new(InFlight::default()));
        let driver = tokio::spawn(drive(eventloop, in_flight.clone(), events));

        Ok((
            MqttLink {
                client,
                in_flight,
                submit: tokio::sync::Mutex::new(()),
                driver: Mutex::new(Some(driver)),
            },
            receiver,
        ))
    }
}

/// An open MQTT connection. A background task keeps polling the connection
/// until it ends or the link is dropped.
pub struct MqttLink {
    client: AsyncClient,
    in_flight: Arc<Mutex<InFlight>>,
    /// Keeps requests and their correlation ids in the same order.
    submit: tokio::sync::Mutex<()>,
    driver: Mutex<Option<JoinHandle<()>>>,
}

impl MqttLink {
    fn in_flight(&self) -> MutexGuard<'_, InFlight> {
        lock(&self.in_flight)
    }
}

impl BrokerLink for MqttLink {
    async fn subscribe(&self, id: AckId, filter: &str, qos: QoS) -> Result<(), BrokerError> {
        let _order = self.submit.lock().await;
        self.in_flight().subscribes.push_back(id);
        if let Err(e) = self.client.subscribe(filter, qos).await {
            self.in_flight().subscribes.pop_back();
            return Err(BrokerError::Request(e.to_string()));
        }
        Ok(())
    }

    async fn unsubscribe(&self, id: AckId, filter: &str) -> Result<(), BrokerError> {
        let _order = self.submit.lock().await;
        self.in_flight().unsubscribes.push_back(id);
        if let Err(e) = self.client.unsubscribe(filter).await {
            self.in_flight().unsubscribes.pop_back();
            return Err(BrokerError::Request(e.to_string()));
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), BrokerError> {
        self.client
            .publish(topic, qos, retain, payload)
            .await
            .map_err(|e| BrokerError::Request(e.to_string()))
    }

    async fn disconnect(&self) {
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request not queued: {}", e);
        }
        let driver = lock(&self.driver).take();
        if let Some(mut driver) = driver {
            if tokio::time::timeout(DISCONNECT_GRACE, &mut driver)
                .await
                .is_err()
            {
                driver.abort();
            }
        }
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        if let Some(driver) = lock(&self.driver).take() {
            driver.abort();
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Correlation ids of requests, before and after they got a packet id.
#[derive(Debug, Default)]
struct InFlight {
    subscribes: VecDeque<AckId>,
    unsubscribes: VecDeque<AckId>,
    subscribe_pkids: HashMap<u16, AckId>,
    unsubscribe_pkids: HashMap<u16, AckId>,
}

/// Polls the connection and turns its events into [`BrokerEvent`]s.
async fn drive(
    mut eventloop: EventLoop,
    in_flight: Arc<Mutex<InFlight>>,
    events: mpsc::Sender<BrokerEvent>,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                let mut in_flight = lock(&in_flight);
                if let Some(id) = in_flight.subscribes.pop_front() {
                    in_flight.subscribe_pkids.insert(pkid, id);
                }
                None
            }
            Ok(Event::Outgoing(Outgoing::Unsubscribe(pkid))) => {
                let mut in_flight = lock(&in_flight);
                if let Some(id) = in_flight.unsubscribes.pop_front() {
                    in_flight.unsubscribe_pkids.insert(pkid, id);
                }
                None
            }
            Ok(Event::Incoming(Packet::SubAck(ack))) => {
                let id = lock(&in_flight).subscribe_pkids.remove(&ack.pkid);
                id.map(|id| BrokerEvent::SubAck {
                    id,
                    granted: ack
                        .return_codes
                        .iter()
                        .all(|code| matches!(code, SubscribeReasonCode::Success(_))),
                })
            }
            Ok(Event::Incoming(Packet::UnsubAck(ack))) => {
                let id = lock(&in_flight).unsubscribe_pkids.remove(&ack.pkid);
                id.map(|id| BrokerEvent::UnsubAck { id })
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                trace!(
                    "Message on '{}' ({} bytes)",
                    publish.topic,
                    publish.payload.len()
                );
                Some(BrokerEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload.to_vec(),
                })
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Disconnect sent, connection closed");
                break;
            }
            Ok(_) => None,
            Err(e) => {
                warn!("MQTT connection error: {}", e);
                Some(BrokerEvent::ConnectionLost {
                    reason: e.to_string(),
                })
            }
        };

        if let Some(event) = event {
            let last = matches!(event, BrokerEvent::ConnectionLost { .. });
            if events.send(event).await.is_err() || last {
                break;
            }
        }
    }
}
