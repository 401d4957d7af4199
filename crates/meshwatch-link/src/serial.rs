//! Serial device link speaking the Meshtastic stream API.
//!
//! One session runs from `connect()` until the port fails, the device
//! reboots, or `disconnect()` is called:
//!
//! 1. Open the port (8N1, no flow control) and start a blocking reader.
//! 2. Write the wake preamble and `ToRadio{want_config_id}`.
//! 3. The reader records `MyNodeInfo` and `NodeInfo` entries until
//!    `config_complete_id` echoes the request id.
//! 4. While connected, a heartbeat is written every `heartbeat_interval`.
//!
//! Every item the reader forwards is tagged with the session generation, so
//! events from an earlier session are never delivered after a reconnect.

use std::collections::HashMap;
use std::io::{ErrorKind, Read, Write};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use prost::Message;
use rand::Rng;
use serialport::{DataBits, FlowControl, Parity, SerialPort, StopBits};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, trace, warn};

use meshwatch_core::constants::{START2, WAKE_PREAMBLE_LEN};
use meshwatch_core::framing::stream_frame;
use meshwatch_core::proto::ToRadio;
use meshwatch_core::{DecodeError, MeshEvent, NodeId, NodeUpdate, RadioMessage, decode_from_radio};

use crate::error::LinkError;
use crate::framing::StreamFrameAccumulator;
use crate::shutdown::ShutdownToken;
use crate::traits::DeviceLink;

pub const DEFAULT_BAUD_RATE: u32 = 115_200;

/// How long the device gets to finish its configuration dump.
pub const DEFAULT_CONFIG_TIMEOUT: Duration = Duration::from_secs(10);

/// The firmware drops a silent serial client after 15 minutes.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(300);

/// Port read timeout; bounds how long the reader takes to notice a stop.
pub const READ_TIMEOUT: Duration = Duration::from_millis(100);

const READ_BUFFER: usize = 1024;
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Paths of serial ports present on this machine.
pub fn available_ports() -> Vec<String> {
    match serialport::available_ports() {
        Ok(ports) => ports.into_iter().map(|p| p.port_name).collect(),
        Err(e) => {
            debug!("serial port enumeration failed: {}", e);
            Vec::new()
        }
    }
}

#[derive(Debug, Clone)]
pub struct SerialLinkConfig {
    pub path: String,
    pub baud_rate: u32,
    pub config_timeout: Duration,
    /// `Duration::ZERO` disables heartbeats.
    pub heartbeat_interval: Duration,
    pub read_timeout: Duration,
}

impl SerialLinkConfig {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            baud_rate: DEFAULT_BAUD_RATE,
            config_timeout: DEFAULT_CONFIG_TIMEOUT,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            read_timeout: READ_TIMEOUT,
        }
    }
}

/// What the reader hands to `next_event`.
enum ReaderItem {
    Event(MeshEvent),
    Malformed(DecodeError),
    Lost(String),
}

struct Tagged {
    generation: u64,
    item: ReaderItem,
}

/// Outcome of routing one frame inside the reader.
enum Routed {
    Forward(ReaderItem),
    Handled,
    End(String),
}

struct Inner {
    name: String,
    config: SerialLinkConfig,
    connected: AtomicBool,
    generation: AtomicU64,
    writer: Mutex<Option<Box<dyn SerialPort>>>,
    nodes: Mutex<HashMap<NodeId, NodeUpdate>>,
    my_node: Mutex<Option<NodeId>>,
    config_complete: watch::Sender<Option<u32>>,
    session: Mutex<Option<Arc<ShutdownToken>>>,
    tx: mpsc::Sender<Tagged>,
}

impl Inner {
    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    /// Encode, frame, and write one message to the radio.
    fn send(&self, msg: &ToRadio) -> Result<(), LinkError> {
        let framed = stream_frame(&msg.encode_to_vec())?;
        let mut guard = self.writer.lock();
        let port = guard.as_mut().ok_or(LinkError::NotConnected)?;
        port.write_all(&framed)?;
        port.flush()?;
        Ok(())
    }

    fn send_wake(&self) -> Result<(), LinkError> {
        let mut guard = self.writer.lock();
        let port = guard.as_mut().ok_or(LinkError::NotConnected)?;
        port.write_all(&[START2; WAKE_PREAMBLE_LEN])?;
        port.flush()?;
        Ok(())
    }

    /// Decode one frame, keeping the node database current.
    fn route_frame(&self, frame: &[u8]) -> Routed {
        match decode_from_radio(frame) {
            Ok(RadioMessage::Packet(event)) => Routed::Forward(ReaderItem::Event(event)),
            Ok(RadioMessage::MyInfo(id)) => {
                debug!("{}: local node is {}", self.name, id);
                *self.my_node.lock() = Some(id);
                Routed::Handled
            }
            Ok(RadioMessage::NodeInfo(id, update)) => {
                trace!("{}: node db entry {}", self.name, id);
                self.nodes.lock().entry(id).or_default().merge(update);
                Routed::Handled
            }
            Ok(RadioMessage::ConfigComplete(id)) => {
                self.config_complete.send_replace(Some(id));
                Routed::Handled
            }
            Ok(RadioMessage::Rebooted) => Routed::End("device rebooted".to_string()),
            Ok(RadioMessage::Other) => Routed::Handled,
            Err(e) => Routed::Forward(ReaderItem::Malformed(e)),
        }
    }

    /// Queue an item for `next_event`. Items are dropped when the consumer
    /// has fallen behind by a full channel.
    fn forward(&self, generation: u64, item: ReaderItem) -> bool {
        match self.tx.try_send(Tagged { generation, item }) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("{}: event queue full, dropping frame", self.name);
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// End the given session from inside (reader or heartbeat failure).
    fn lose_session(&self, generation: u64, reason: String) {
        if self.is_current(generation) {
            self.connected.store(false, Ordering::SeqCst);
            warn!("{}: connection lost: {}", self.name, reason);
            if let Some(session) = self.session.lock().as_ref() {
                session.signal_stop();
            }
            self.forward(generation, ReaderItem::Lost(reason));
        }
    }

    /// Wait for the device to echo `config_id`, giving up early if the
    /// session stops underneath the handshake.
    async fn await_config(&self, session: &ShutdownToken, config_id: u32) -> Result<(), LinkError> {
        let mut complete_rx = self.config_complete.subscribe();
        let handshake = async {
            tokio::select! {
                done = complete_rx.wait_for(|done| *done == Some(config_id)) => {
                    done.map(|_| ()).map_err(|_| LinkError::Stopped)
                }
                () = session.stopped() => {
                    Err(LinkError::ConnectionLost("session ended during handshake".into()))
                }
            }
        };
        match tokio::time::timeout(self.config.config_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(LinkError::Timeout),
        }
    }
}

/// A [`DeviceLink`] over a USB serial port.
pub struct SerialLink {
    inner: Arc<Inner>,
    rx: tokio::sync::Mutex<mpsc::Receiver<Tagged>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl SerialLink {
    pub fn new(config: SerialLinkConfig) -> Result<Self, LinkError> {
        if config.path.trim().is_empty() {
            return Err(LinkError::Configuration("serial port path is empty".into()));
        }
        if config.baud_rate == 0 {
            return Err(LinkError::Configuration("baud rate must be positive".into()));
        }
        let (tx, rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let (config_complete, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            name: format!("serial[{}]", config.path),
            config,
            connected: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            writer: Mutex::new(None),
            nodes: Mutex::new(HashMap::new()),
            my_node: Mutex::new(None),
            config_complete,
            session: Mutex::new(None),
            tx,
        });
        Ok(Self {
            inner,
            rx: tokio::sync::Mutex::new(rx),
            lifecycle: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SerialLinkConfig {
        &self.inner.config
    }

    /// Node number of the attached radio, once a handshake has reported it.
    pub fn local_node(&self) -> Option<NodeId> {
        *self.inner.my_node.lock()
    }

    fn open_port(&self) -> Result<Box<dyn SerialPort>, LinkError> {
        let config = &self.inner.config;
        let port = serialport::new(&config.path, config.baud_rate)
            .data_bits(DataBits::Eight)
            .parity(Parity::None)
            .stop_bits(StopBits::One)
            .flow_control(FlowControl::None)
            .timeout(config.read_timeout)
            .open()?;
        Ok(port)
    }

    /// Stop the current session's tasks and close the port.
    async fn teardown(&self) {
        self.inner.connected.store(false, Ordering::SeqCst);
        // Anything the old reader still queues is now stale.
        self.inner.generation.fetch_add(1, Ordering::SeqCst);
        let session = self.inner.session.lock().take();
        if let Some(session) = session {
            session.shutdown().await;
        }
        self.inner.writer.lock().take();
    }

    async fn open_session(&self) -> Result<(), LinkError> {
        let port = self.open_port()?;
        let reader = port.try_clone()?;
        let generation = self.inner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let session = Arc::new(ShutdownToken::new());

        *self.inner.writer.lock() = Some(port);
        self.inner.nodes.lock().clear();
        self.inner.config_complete.send_replace(None);

        *self.inner.session.lock() = Some(Arc::clone(&session));
        let inner = Arc::clone(&self.inner);
        let stop_rx = session.subscribe();
        session.add_task(tokio::task::spawn_blocking(move || {
            read_loop(inner, reader, stop_rx, generation);
        }));

        let config_id = rand::thread_rng().gen_range(1..=u32::MAX);
        self.inner.send_wake()?;
        self.inner.send(&ToRadio::want_config(config_id))?;
        debug!("{}: requested config id {}", self.inner.name, config_id);

        self.inner.await_config(&session, config_id).await?;
        if !self.inner.is_current(generation) || session.is_stopped() {
            return Err(LinkError::ConnectionLost("session ended during handshake".into()));
        }

        self.inner.connected.store(true, Ordering::SeqCst);
        let interval = self.inner.config.heartbeat_interval;
        if !interval.is_zero() {
            let inner = Arc::clone(&self.inner);
            let stop_rx = session.subscribe();
            session.add_task(tokio::spawn(heartbeat_loop(
                inner, stop_rx, interval, generation,
            )));
        }
        Ok(())
    }
}

impl DeviceLink for SerialLink {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), LinkError> {
        let _guard = self.lifecycle.lock().await;
        self.teardown().await;

        match self.open_session().await {
            Ok(()) => {
                let local = self
                    .local_node()
                    .map_or_else(|| "unknown".to_string(), |id| id.to_string());
                info!(
                    "{}: connected to {}, {} nodes in device database",
                    self.inner.name,
                    local,
                    self.inner.nodes.lock().len()
                );
                Ok(())
            }
            Err(e) => {
                self.teardown().await;
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        let _guard = self.lifecycle.lock().await;
        let has_port = self.inner.writer.lock().is_some();
        if has_port && let Err(e) = self.inner.send(&ToRadio::disconnect())
        {
            debug!("{}: disconnect notice not sent: {}", self.inner.name, e);
        }
        self.teardown().await;
        Ok(())
    }

    async fn next_event(&self) -> Result<MeshEvent, LinkError> {
        let mut rx = self.rx.lock().await;
        loop {
            if !self.is_connected() {
                return Err(LinkError::NotConnected);
            }
            let Some(tagged) = rx.recv().await else {
                return Err(LinkError::Stopped);
            };
            if !self.inner.is_current(tagged.generation) {
                continue;
            }
            match tagged.item {
                ReaderItem::Event(event) => return Ok(event),
                ReaderItem::Malformed(e) => return Err(LinkError::Decode(e)),
                ReaderItem::Lost(reason) => return Err(LinkError::ConnectionLost(reason)),
            }
        }
    }

    fn visible_nodes(&self) -> Vec<(NodeId, NodeUpdate)> {
        let mut nodes: Vec<_> = self
            .inner
            .nodes
            .lock()
            .iter()
            .map(|(id, update)| (*id, update.clone()))
            .collect();
        nodes.sort_by_key(|(id, _)| *id);
        nodes
    }
}

/// Blocking read loop for one session.
fn read_loop(
    inner: Arc<Inner>,
    mut port: Box<dyn SerialPort>,
    stop_rx: watch::Receiver<bool>,
    generation: u64,
) {
    let mut acc = StreamFrameAccumulator::new();
    let mut buf = [0u8; READ_BUFFER];

    let reason = 'session: loop {
        if *stop_rx.borrow() {
            return;
        }
        let n = match port.read(&mut buf) {
            Ok(0) => break "end of stream".to_string(),
            Ok(n) => n,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::Interrupted) => continue,
            Err(e) => break format!("read error: {e}"),
        };

        for frame in acc.feed(&buf[..n]) {
            match inner.route_frame(&frame) {
                Routed::Forward(item) => {
                    if !inner.forward(generation, item) {
                        return;
                    }
                }
                Routed::Handled => {}
                Routed::End(reason) => break 'session reason,
            }
        }
        if let Some(text) = acc.take_console() {
            for line in text.lines().filter(|l| !l.trim().is_empty()) {
                trace!(target: "meshwatch::console", "{}: {}", inner.name, line.trim_end());
            }
        }
    };

    if !*stop_rx.borrow() {
        inner.lose_session(generation, reason);
    }
}

async fn heartbeat_loop(
    inner: Arc<Inner>,
    mut stop_rx: watch::Receiver<bool>,
    interval: Duration,
    generation: u64,
) {
    let mut ticker = tokio::time::interval(interval);
    // The first tick completes immediately; the handshake already proved liveness.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                match inner.send(&ToRadio::heartbeat()) {
                    Ok(()) => trace!("{}: heartbeat sent", inner.name),
                    Err(e) => {
                        inner.lose_session(generation, format!("heartbeat failed: {e}"));
                        break;
                    }
                }
            }
            _ = stop_rx.changed() => break,
        }
    }
}
