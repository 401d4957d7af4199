//! In-memory broker used by tests.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};
use tokio::time::Instant;

use super::{BrokerClient, BrokerError, InboundMessage};

const INBOUND_CAPACITY: usize = 64;

/// A message accepted by [`MemoryBroker::publish`].
#[derive(Debug, Clone, PartialEq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub retain: bool,
}

impl PublishedMessage {
    /// Payload parsed as JSON. Panics on invalid JSON.
    pub fn json(&self) -> serde_json::Value {
        serde_json::from_slice(&self.payload).unwrap_or_else(|e| {
            panic!("payload on {} is not JSON: {e}", self.topic);
        })
    }
}

#[derive(Default)]
struct Recorded {
    published: Vec<PublishedMessage>,
    subscriptions: Vec<String>,
    connect_attempts: Vec<Instant>,
}

/// [`BrokerClient`] that keeps every publish in memory.
///
/// Reachability is controlled by the test: [`drop_connection`] ends the
/// current session and [`set_reachable`] decides whether the next
/// `connect()` succeeds.
///
/// [`drop_connection`]: Self::drop_connection
/// [`set_reachable`]: Self::set_reachable
pub struct MemoryBroker {
    name: String,
    connected: AtomicBool,
    reachable: AtomicBool,
    failures_left: AtomicU32,
    connects: AtomicU32,
    losses: watch::Sender<u64>,
    recorded: Mutex<Recorded>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    inbound_rx: Mutex<Option<mpsc::Receiver<InboundMessage>>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
        Self {
            name: "memory".to_string(),
            connected: AtomicBool::new(false),
            reachable: AtomicBool::new(true),
            failures_left: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            losses: watch::channel(0).0,
            recorded: Mutex::new(Recorded::default()),
            inbound_tx,
            inbound_rx: Mutex::new(Some(inbound_rx)),
        }
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// End the current session as if the network went away.
    pub fn drop_connection(&self) {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.losses.send_modify(|n| *n += 1);
        }
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Deliver a message as if another client published it.
    pub fn inject(&self, topic: impl Into<String>, payload: impl Into<Vec<u8>>) {
        let _ = self.inbound_tx.try_send(InboundMessage {
            topic: topic.into(),
            payload: payload.into(),
        });
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.recorded.lock().published.clone()
    }

    /// Messages published on topics starting with `prefix`.
    pub fn published_under(&self, prefix: &str) -> Vec<PublishedMessage> {
        self.recorded
            .lock()
            .published
            .iter()
            .filter(|m| m.topic.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub fn clear_published(&self) {
        self.recorded.lock().published.clear();
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.recorded.lock().subscriptions.clone()
    }

    /// Successful connections so far.
    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    /// When each connection attempt was made, successful or not.
    pub fn connect_attempts(&self) -> Vec<Instant> {
        self.recorded.lock().connect_attempts.clone()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl BrokerClient for MemoryBroker {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn session_losses(&self) -> watch::Receiver<u64> {
        self.losses.subscribe()
    }

    async fn connect(&self) -> Result<(), BrokerError> {
        self.recorded.lock().connect_attempts.push(Instant::now());
        self.connected.store(false, Ordering::SeqCst);

        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(BrokerError::ConnectionRefused("scripted failure".into()));
        }
        if !self.reachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Connection("broker unreachable".into()));
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn publish(&self, topic: &str, payload: Vec<u8>, retain: bool) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.recorded.lock().published.push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            retain,
        });
        Ok(())
    }

    async fn subscribe(&self, topic: &str) -> Result<(), BrokerError> {
        if !self.is_connected() {
            return Err(BrokerError::NotConnected);
        }
        self.recorded.lock().subscriptions.push(topic.to_string());
        Ok(())
    }

    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>> {
        self.inbound_rx.lock().take()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_requires_connection() {
        let broker = MemoryBroker::new();
        assert!(matches!(
            broker.publish("t", b"x".to_vec(), false).await,
            Err(BrokerError::NotConnected)
        ));

        broker.connect().await.unwrap();
        broker.publish("t", b"{}".to_vec(), true).await.unwrap();
        let published = broker.published();
        assert_eq!(published.len(), 1);
        assert!(published[0].retain);
        assert_eq!(published[0].json(), serde_json::json!({}));
    }

    #[tokio::test]
    async fn unreachable_broker_refuses_connects() {
        let broker = MemoryBroker::new();
        broker.set_reachable(false);
        assert!(broker.connect().await.is_err());
        assert!(!broker.is_connected());

        broker.set_reachable(true);
        broker.fail_next_connects(1);
        assert!(broker.connect().await.is_err());
        assert!(broker.connect().await.is_ok());
        assert_eq!(broker.connect_count(), 1);
        assert_eq!(broker.connect_attempts().len(), 3);
    }

    #[tokio::test]
    async fn inbound_can_be_taken_once() {
        let broker = MemoryBroker::new();
        let mut rx = broker.take_inbound().unwrap();
        assert!(broker.take_inbound().is_none());

        broker.inject("mesh/bridge/refresh", "now");
        let msg = rx.recv().await.unwrap();
        assert_eq!(msg.topic, "mesh/bridge/refresh");
        assert_eq!(msg.payload, b"now");
    }

    #[tokio::test]
    async fn dropped_session_is_counted_but_disconnect_is_not() {
        let broker = MemoryBroker::new();
        let mut losses = broker.session_losses();

        broker.connect().await.unwrap();
        broker.disconnect().await;
        broker.drop_connection();
        assert!(!losses.has_changed().unwrap());

        broker.connect().await.unwrap();
        broker.drop_connection();
        assert!(losses.has_changed().unwrap());
        assert_eq!(*losses.borrow_and_update(), 1);
    }
}
