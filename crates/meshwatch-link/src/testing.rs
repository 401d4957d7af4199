//! Test support: a scripted in-memory link and conformance assertions that
//! every [`DeviceLink`] should satisfy.
//!
//! ```rust,ignore
//! use meshwatch_link::testing::{self, ScriptedLink};
//!
//! let link = ScriptedLink::new("radio");
//! testing::assert_pre_connect_conformance(&link).await;
//! link.connect().await?;
//! link.push_event(event);
//! ```

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::{Mutex as AsyncMutex, mpsc};

use meshwatch_core::{DecodeError, MeshEvent, NodeId, NodeUpdate};

use crate::error::LinkError;
use crate::traits::DeviceLink;

/// Assert that the link has a non-empty name.
pub fn assert_has_name(link: &impl DeviceLink) {
    assert!(!link.name().is_empty(), "link name must not be empty");
}

/// Assert that the link reports `is_connected() == false` before `connect()`.
pub fn assert_not_connected_before_connect(link: &impl DeviceLink) {
    assert!(
        !link.is_connected(),
        "link should not be connected before connect()"
    );
}

/// Assert that waiting for an event before `connect()` fails instead of hanging.
pub async fn assert_next_event_before_connect_fails(link: &impl DeviceLink) {
    match link.next_event().await {
        Err(LinkError::NotConnected) | Err(LinkError::Stopped) => {}
        Err(e) => panic!("unexpected error from next_event before connect: {e}"),
        Ok(event) => panic!("next_event should fail before connect(), got {event:?}"),
    }
}

/// Assert that `disconnect()` succeeds, leaves the link disconnected, and
/// can be repeated.
pub async fn assert_disconnect_is_idempotent(link: &impl DeviceLink) {
    let first = link.disconnect().await;
    assert!(first.is_ok(), "disconnect() should succeed: {:?}", first.err());
    assert!(!link.is_connected(), "is_connected() should be false after disconnect()");
    let second = link.disconnect().await;
    assert!(
        second.is_ok(),
        "second disconnect() should be idempotent: {:?}",
        second.err()
    );
}

/// Run every check that applies before a session exists.
pub async fn assert_pre_connect_conformance(link: &impl DeviceLink) {
    assert_has_name(link);
    assert_not_connected_before_connect(link);
    assert_next_event_before_connect_fails(link).await;
    assert_disconnect_is_idempotent(link).await;
}

enum Script {
    Event(MeshEvent),
    Malformed,
    Lost(String),
}

/// In-memory [`DeviceLink`] driven by the test.
///
/// Events pushed with [`push_event`](Self::push_event) are delivered in
/// order while connected. [`drop_connection`](Self::drop_connection) ends the
/// session the way a pulled USB cable would. Connection attempts can be made
/// to fail with [`fail_next_connects`](Self::fail_next_connects).
pub struct ScriptedLink {
    name: String,
    connected: AtomicBool,
    failures_left: AtomicU32,
    connects: AtomicU32,
    disconnects: AtomicU32,
    nodes: Mutex<HashMap<NodeId, NodeUpdate>>,
    tx: mpsc::UnboundedSender<Script>,
    rx: AsyncMutex<mpsc::UnboundedReceiver<Script>>,
}

impl ScriptedLink {
    pub fn new(name: impl Into<String>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            name: name.into(),
            connected: AtomicBool::new(false),
            failures_left: AtomicU32::new(0),
            connects: AtomicU32::new(0),
            disconnects: AtomicU32::new(0),
            nodes: Mutex::new(HashMap::new()),
            tx,
            rx: AsyncMutex::new(rx),
        }
    }

    /// Queue an event for delivery.
    pub fn push_event(&self, event: MeshEvent) {
        self.push(Script::Event(event));
    }

    /// Queue a frame that fails to decode.
    pub fn push_malformed(&self) {
        self.push(Script::Malformed);
    }

    /// End the current session. Events queued before the call are delivered
    /// first.
    pub fn drop_connection(&self) {
        self.push(Script::Lost("scripted disconnect".into()));
    }

    /// Make the next `n` connection attempts fail.
    pub fn fail_next_connects(&self, n: u32) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    /// Set the node database reported after each connect.
    pub fn set_visible_nodes(&self, nodes: impl IntoIterator<Item = (NodeId, NodeUpdate)>) {
        *self.nodes.lock() = nodes.into_iter().collect();
    }

    pub fn connect_count(&self) -> u32 {
        self.connects.load(Ordering::SeqCst)
    }

    pub fn disconnect_count(&self) -> u32 {
        self.disconnects.load(Ordering::SeqCst)
    }

    fn push(&self, item: Script) {
        // The receiver lives as long as `self`.
        let _ = self.tx.send(item);
    }
}

impl DeviceLink for ScriptedLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn connect(&self) -> Result<(), LinkError> {
        let left = self.failures_left.load(Ordering::SeqCst);
        if left > 0 {
            self.failures_left.store(left - 1, Ordering::SeqCst);
            return Err(LinkError::Timeout);
        }
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), LinkError> {
        if self.connected.swap(false, Ordering::SeqCst) {
            self.disconnects.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn next_event(&self) -> Result<MeshEvent, LinkError> {
        if !self.is_connected() {
            return Err(LinkError::NotConnected);
        }
        let item = {
            let mut rx = self.rx.lock().await;
            rx.recv().await.ok_or(LinkError::Stopped)?
        };
        match item {
            Script::Event(event) => Ok(event),
            Script::Malformed => Err(LinkError::Decode(DecodeError::MissingSender)),
            Script::Lost(reason) => {
                self.connected.store(false, Ordering::SeqCst);
                Err(LinkError::ConnectionLost(reason))
            }
        }
    }

    fn visible_nodes(&self) -> Vec<(NodeId, NodeUpdate)> {
        let mut nodes: Vec<_> = self
            .nodes
            .lock()
            .iter()
            .map(|(id, update)| (*id, update.clone()))
            .collect();
        nodes.sort_by_key(|(id, _)| *id);
        nodes
    }
}
