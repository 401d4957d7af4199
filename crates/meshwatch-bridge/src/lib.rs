//! Service side of meshwatch: node registry, event relay, broker client,
//! connection supervision, and status reporting.
//!
//! [`Bridge`] wires a [`DeviceLink`](meshwatch_link::DeviceLink) to a
//! [`BrokerClient`] and keeps both connections alive until shutdown.

pub mod bridge;
pub mod broker;
pub mod config;
pub mod error;
pub mod logging;
pub mod monitor;
pub mod registry;
pub mod relay;
pub mod status;
pub mod topics;

pub use bridge::{Bridge, BridgeSettings, ShutdownHandle, run_service};
pub use broker::{BrokerClient, BrokerError, InboundMessage};
pub use config::BridgeConfig;
pub use error::BridgeError;
pub use monitor::{ConnectionHandle, ConnectionState, ReconnectPolicy};
pub use registry::{NodeRecord, NodeRegistry};
pub use relay::{EventRelay, RelayStats, RelayStatsSnapshot};
pub use topics::TopicScheme;
