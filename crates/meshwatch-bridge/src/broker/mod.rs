//! Broker client abstraction.
//!
//! [`MqttBroker`](mqtt::MqttBroker) talks to a real MQTT broker;
//! [`MemoryBroker`](memory::MemoryBroker) records publishes for tests.

pub mod memory;
pub mod mqtt;

use tokio::sync::{mpsc, watch};

pub use memory::{MemoryBroker, PublishedMessage};
pub use mqtt::{MqttBroker, MqttSettings, WillMessage};

/// Errors reported by a broker client.
#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker not connected")]
    NotConnected,
    #[error("timed out waiting for the broker to accept the connection")]
    ConnectTimeout,
    #[error("broker refused the connection: {0}")]
    ConnectionRefused(String),
    #[error("broker connection failed: {0}")]
    Connection(String),
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),
}

/// A publish received on a subscribed topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Async broker client.
///
/// Methods take `&self` so one client can be shared by the relay, the
/// status reporter, and its supervisor.
pub trait BrokerClient: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn is_connected(&self) -> bool;

    /// Counts sessions that ended without `disconnect()` being called.
    fn session_losses(&self) -> watch::Receiver<u64>;

    /// Establish a new session, replacing any existing one.
    fn connect(&self) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Close the session. Idempotent.
    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// Publish without retrying. Fails with [`BrokerError::NotConnected`]
    /// when there is no session.
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        retain: bool,
    ) -> impl Future<Output = Result<(), BrokerError>> + Send;

    fn subscribe(&self, topic: &str) -> impl Future<Output = Result<(), BrokerError>> + Send;

    /// Receiver for publishes on subscribed topics. Survives reconnects and
    /// can be taken once.
    fn take_inbound(&self) -> Option<mpsc::Receiver<InboundMessage>>;
}
