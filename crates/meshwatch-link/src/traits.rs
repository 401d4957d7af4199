//! Device link trait.

use meshwatch_core::{MeshEvent, NodeId, NodeUpdate};

use crate::error::LinkError;

/// Async trait implemented by every device link.
///
/// Methods take `&self` so a link can be shared between the event pump and
/// the connection supervisor behind an `Arc`.
pub trait DeviceLink: Send + Sync + 'static {
    /// Human-readable name (e.g. "serial[/dev/ttyUSB0]").
    fn name(&self) -> &str;

    /// Whether a session is currently established.
    fn is_connected(&self) -> bool;

    /// Open a new session, replacing any existing one.
    fn connect(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Close the current session. Idempotent.
    fn disconnect(&self) -> impl Future<Output = Result<(), LinkError>> + Send;

    /// Wait for the next mesh event.
    ///
    /// `LinkError::Decode` reports a single malformed frame and the session
    /// stays usable. Any other error means the session is gone.
    fn next_event(&self) -> impl Future<Output = Result<MeshEvent, LinkError>> + Send;

    /// Nodes the device currently knows about, as reported in its node
    /// database during the last handshake and kept current since.
    fn visible_nodes(&self) -> Vec<(NodeId, NodeUpdate)>;
}
