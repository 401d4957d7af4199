//! Core types, event model, and wire decoding for the meshwatch relay.
//!
//! This crate defines node identifiers, the closed set of mesh events the
//! relay forwards, the subset of the Meshtastic protobuf schema the relay
//! understands, and the serial stream framing. It performs no I/O.

pub mod constants;
pub mod decode;
pub mod error;
pub mod event;
pub mod framing;
pub mod proto;
pub mod types;

pub use decode::{RadioMessage, decode_from_radio};
pub use error::{DecodeError, FramingError};
pub use event::{
    DeviceMetrics, EnvironmentMetrics, EventKind, MeshEvent, NodeUpdate, PacketMeta, Position,
    SignalQuality,
};
pub use types::{InvalidNodeId, NodeId};
