//! Error types for the bridge service.

use meshwatch_link::LinkError;

use crate::broker::BrokerError;

/// Errors that can occur while configuring or running the bridge.
#[derive(Debug, thiserror::Error)]
pub enum BridgeError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("device error: {0}")]
    Link(#[from] LinkError),
    #[error("broker error: {0}")]
    Broker(#[from] BrokerError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("startup failed: {0}")]
    Startup(String),
    #[error("bridge already running")]
    AlreadyRunning,
}
