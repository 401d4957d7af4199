//! Device links for the meshwatch relay.
//!
//! A [`DeviceLink`] yields decoded [`MeshEvent`](meshwatch_core::MeshEvent)s
//! from an attached radio. [`SerialLink`] speaks the Meshtastic serial stream
//! protocol; [`testing::ScriptedLink`] replays scripted events for tests.

pub mod error;
pub mod framing;
pub mod serial;
pub mod shutdown;
pub mod testing;
pub mod traits;

pub use error::LinkError;
pub use framing::StreamFrameAccumulator;
pub use serial::{SerialLink, SerialLinkConfig, available_ports};
pub use shutdown::ShutdownToken;
pub use traits::DeviceLink;
