//! MQTT broker client built on `rumqttc`.
//!
//! Every `connect()` builds a fresh client and event loop. The loop is
//! polled until CONNACK, then handed to a background task that forwards
//! inbound publishes. When that task sees an error it marks the client
//! disconnected, counts a session loss, and exits; reconnecting is the
//! supervisor's job.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Packet, QoS};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{BrokerClient, BrokerError, InboundMessage};

/// Capacity of the request channel between `AsyncClient` and its event loop.
const REQUEST_CAPACITY: usize = 64;

const INBOUND_CAPACITY: usize = 64;

/// How long `disconnect()` waits for the event loop to flush.
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

/// Message the broker publishes on our behalf if the connection dies.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WillMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    pub keep_alive: Duration,
    pub connect_timeout: Duration,
    /// 0, 1, or 2.
    pub qos: u8,
    /// Published retained.
    pub last_will: Option<WillMessage>,
}

impl MqttSettings {
    pub fn qos(&self) -> QoS {
        qos_from_level(self.qos)
    }

    fn options(&self) -> MqttOptions {
        let mut options = MqttOptions::new(self.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(self.keep_alive);
        options.set_clean_session(true);
        if let (Some(username), Some(password)) = (&self.username, &self.password) {
            options.set_credentials(username.clone(), password.clone());
        }
        if let Some(will) = &self.last_will {
            options.set_last_will(LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                self.qos(),
                true,
            ));
        }
        options
    }
}

/// Levels above 2 are rejected by config validation; they map to QoS 2.
pub fn qos_from_level(level: u8) -> QoS {
    match level {
        0 => QoS::AtMostOnce,
        1 => QoS::AtLeastOnce,
        _ => QoS::ExactlyOnce,
    }
}

struct Session {
    client: AsyncClient,
    task: JoinHandle<()>,
}

struct Shared {
    connected: AtomicBool,
    generation: AtomicU64,
    losses: watch::Sender<u64>,
}

impl Shared {
    /// Mark session `generation` as gone if it is still the current one.
    /// Returns whether it was.
    fn end_session(&self, generation: u64) -> bool {
        if self.generation.load(Ordering::SeqCst) != generation {
            return false;
        }
        self.connected.store(false, Ordering::SeqCst);
        self.losses.send_modify(|n| *n += 1);
        true
    }
}

pub struct MqttBroker {
    name: String,
    settings: MqttSettings,
    shared: Arc<Shared>,
    session: Mutex<Option<Session>>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl MqttBroker {
    pub fn new(settings: MqttSettings) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            name: format!("mqtt[{}:{}]", settings.host, settings.port),
            settings,
            shared: Arc::new(Shared {
                connected: AtomicBool::new(false),
                generation: AtomicU64::new(0),
                losses: watch::channel(0).0,
            }),
            session: Mutex::new(None),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    pub fn settings(&self) -> &MqttSettings {
        &self.settings
    }

    fn client(&self) -> Result<AsyncClient, BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.session
            .lock()
            .as_ref()
            .map(|s| s.client.clone())
            .ok_or(BrokerError::NotConnected)
    }

    /// Invalidate the current session and stop its event loop.
    async fn teardown(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        self.shared.connected.store(false, Ordering::SeqCst);

        let session = self.session.lock().take();
        let Some(Session { client, mut task }) = session else {
            return;
        };
        if let Err(e) = client.try_disconnect() {
            debug!(broker = %self.name, error = %e, "disconnect request not queued");
        }
        if tokio::time::timeout(DISCONNECT_GRACE, &mut task).await.is_err() {
            task.abort();
        }
    }
}

async fn await_connack(eventloop: &mut EventLoop) -> Result<(), BrokerError> {
    loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                return if ack.code == ConnectReturnCode::Success {
                    Ok(())
                } else {
                    Err(BrokerError::ConnectionRefused(format!("{:?}", ack.code)))
                };
            }
            Ok(_) => {}
            Err(e) => return Err(BrokerError::Connection(e.to_string())),
        }
    }
}

async fn drive_event_loop(
    name: String,
    mut eventloop: EventLoop,
    shared: Arc<Shared>,
    generation: u64,
    inbound: mpsc::Sender<InboundMessage>,
) {
    let reason = loop {
        match eventloop.poll().await {
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let message = InboundMessage {
                    topic: publish.topic.clone(),
                    payload: publish.payload.to_vec(),
                };
                if inbound.try_send(message).is_err() {
                    debug!(broker = %name, topic = %publish.topic, "inbound queue full, message dropped");
                }
            }
            Ok(Event::Incoming(Packet::Disconnect)) => break "broker closed the session".to_string(),
            Ok(_) => {}
            Err(e) => break e.to_string(),
        }
    };
    if shared.end_session(generation) {
        warn!(broker = %name, reason = %reason, "broker connection lost");
    }
}

impl BrokerClient for MqttBroker {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    fn session_losses(&self) -> watch::Receiver<u64> {
        self.shared.losses.subscribe()
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        self.teardown().await;

        let (client, mut eventloop) = AsyncClient::new(self.settings.options(), REQUEST_CAPACITY);
        match tokio::time::timeout(self.settings.connect_timeout, await_connack(&mut eventloop)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(e),
            Err(_) => return Err(BrokerError::ConnectTimeout),
        }

        let generation = self.shared.generation.load(Ordering::SeqCst);
        self.shared.connected.store(true, Ordering::SeqCst);
        let task = tokio::spawn(drive_event_loop(
            self.name.clone(),
            eventloop,
            Arc::clone(&self.shared),
            generation,
            self.inbound_tx.clone(),
        ));
        *self.session.lock() = Some(Session { client, task });
        info!(broker = %self.name, client_id = %self.settings.client_id, "connected to broker");
        Ok(())
    }

    async fn disconnect(&self) {
        self.teardown().await;
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BrokerError> {
        let client = self.client()?;
        client.try_publish(topic, self.settings.qos(), retain, payload)?;
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        let client = self.client()?;
        client.subscribe(topic, self.settings.qos()).await?;
        Ok(())
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().take()
    }
}
