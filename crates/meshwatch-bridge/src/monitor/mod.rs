//! Connection state tracking and supervision.
//!
//! Each managed connection (device link, broker) has a [`ConnectionHandle`]
//! owned by its supervisor task. Other tasks read the state, wait on it, or
//! report failures through the handle; only the supervisor changes it.

mod backoff;
mod supervisor;
mod targets;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::info;

pub use backoff::Backoff;
pub use supervisor::{Supervised, supervise};
pub use targets::{BrokerTarget, DeviceTarget};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

impl ConnectionState {
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

struct HandleInner {
    name: String,
    state: watch::Sender<ConnectionState>,
    failures: watch::Sender<u64>,
    /// Incremented on every transition into `Connected`.
    epoch: AtomicU64,
}

/// Shared view of one connection's state.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub fn new(name: impl Into<String>) -> Self {
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (failures, _) = watch::channel(0);
        Self {
            inner: Arc::new(HandleInner {
                name: name.into(),
                state,
                failures,
                epoch: AtomicU64::new(0),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Move to `state`. No-op if already there.
    pub fn set(&self, state: ConnectionState) {
        let mut previous = state;
        let changed = self.inner.state.send_if_modified(|current| {
            if *current == state {
                return false;
            }
            previous = *current;
            if state == ConnectionState::Connected {
                self.inner.epoch.fetch_add(1, Ordering::SeqCst);
            }
            *current = state;
            true
        });
        if changed {
            info!(connection = %self.inner.name, from = %previous, to = %state, "connection state changed");
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    /// Ask the supervisor to tear the connection down and reconnect.
    pub fn report_failure(&self) {
        self.inner.failures.send_modify(|count| *count += 1);
    }

    pub fn failure_count(&self) -> u64 {
        *self.inner.failures.borrow()
    }

    pub(crate) fn failure_rx(&self) -> watch::Receiver<u64> {
        self.inner.failures.subscribe()
    }

    /// Number of times the connection has reached `Connected`.
    pub fn epoch(&self) -> u64 {
        self.inner.epoch.load(Ordering::SeqCst)
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("name", &self.inner.name)
            .field("state", &self.state())
            .field("epoch", &self.epoch())
            .finish()
    }
}

/// Time of the last event received from the device.
#[derive(Debug, Clone)]
pub struct Activity {
    last: Arc<Mutex<Instant>>,
}

impl Activity {
    pub fn new() -> Self {
        Self {
            last: Arc::new(Mutex::new(Instant::now())),
        }
    }

    pub fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    pub fn idle(&self) -> Duration {
        self.last.lock().elapsed()
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Timing for health checks and reconnection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Delay before the first reconnection attempt after a failure.
    pub min_delay: Duration,
    /// Cap for the doubling delay.
    pub max_delay: Duration,
    pub health_interval: Duration,
    /// A connection that stayed up this long resets the backoff.
    pub reset_after: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_secs(2),
            max_delay: Duration::from_secs(60),
            health_interval: Duration::from_secs(60),
            reset_after: Duration::from_secs(300),
        }
    }
}

/// Resolves once the shutdown flag is set or its sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Wait until the connection reaches `Connected` in an epoch other than
/// `seen`. Returns the new epoch, or `None` if the handle was dropped.
pub(crate) async fn next_session(
    handle: &ConnectionHandle,
    rx: &mut watch::Receiver<ConnectionState>,
    seen: u64,
) -> Option<u64> {
    let ready = rx
        .wait_for(|state| *state == ConnectionState::Connected && handle.epoch() != seen)
        .await
        .is_ok();
    ready.then(|| handle.epoch())
}
