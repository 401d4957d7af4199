//! Cancellation token for a group of background tasks.
//!
//! A serial session owns one token for its reader and heartbeat tasks; the
//! bridge owns one for its pump, supervisors, and status reporter. Tasks
//! observe the `watch` channel and the owner awaits every registered handle
//! after signalling stop.

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub struct ShutdownToken {
    stop_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ShutdownToken {
    pub fn new() -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            stop_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// New subscription to the stop signal.
    ///
    /// Async tasks await `changed()` in a `select!` branch; blocking tasks
    /// poll `*rx.borrow()` between reads.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// Resolves once stop has been signalled.
    pub async fn stopped(&self) {
        let mut rx = self.subscribe();
        let _ = rx.wait_for(|stopped| *stopped).await;
    }

    /// Signal every subscriber. Idempotent.
    pub fn signal_stop(&self) {
        self.stop_tx.send_replace(true);
    }

    /// Register a task to be awaited by [`join_all`](Self::join_all).
    pub fn add_task(&self, handle: JoinHandle<()>) {
        self.tasks.lock().push(handle);
    }

    /// Number of registered tasks not yet joined.
    pub fn task_count(&self) -> usize {
        self.tasks.lock().len()
    }

    /// Await all registered tasks, draining the list. Join errors are ignored.
    pub async fn join_all(&self) {
        let handles: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
    }

    /// Signal stop, then await every task.
    pub async fn shutdown(&self) {
        self.signal_stop();
        self.join_all().await;
    }
}

impl Default for ShutdownToken {
    fn default() -> Self {
        Self::new()
    }
}
