//! Reconnect loop shared by the device and broker supervisors.

use std::sync::Arc;

use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::backoff::Backoff;
use super::{ConnectionHandle, ConnectionState, ReconnectPolicy, stopped};
use crate::error::BridgeError;

/// A connection the supervisor can (re)establish and health-check.
pub trait Supervised: Send + Sync + 'static {
    fn name(&self) -> &str;

    fn connect(&self) -> impl Future<Output = Result<(), BridgeError>> + Send;

    fn disconnect(&self) -> impl Future<Output = ()> + Send;

    /// Polled on every health check while connected.
    fn is_healthy(&self) -> bool;

    /// Called after every successful connect, once the handle reads
    /// `Connected`.
    fn on_connected(&self) {}

    /// Counter the target bumps when its connection drops on its own.
    /// Without one, a drop is only noticed by a reported failure or the
    /// next health check.
    fn losses(&self) -> Option<watch::Receiver<u64>> {
        None
    }
}

/// Resolves on the next recorded loss. Never resolves without a counter.
async fn dropped(losses: &mut Option<watch::Receiver<u64>>) {
    if let Some(rx) = losses.as_mut()
        && rx.changed().await.is_ok()
    {
        return;
    }
    std::future::pending::<()>().await
}

enum Lost {
    Shutdown,
    Failed(&'static str),
}

/// Keep `target` connected until `shutdown` fires.
///
/// The first attempt happens immediately unless `handle` already reads
/// `Connected`. After a failure the next attempt waits for the backoff
/// delay, which starts at `policy.min_delay` and doubles up to
/// `policy.max_delay`. A connection that survives `policy.reset_after`
/// resets the delay. On shutdown the target is disconnected and the handle
/// left `Disconnected`.
pub async fn supervise<T: Supervised>(
    target: Arc<T>,
    handle: ConnectionHandle,
    policy: ReconnectPolicy,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut backoff = Backoff::new(policy.min_delay, policy.max_delay);
    let mut failures = handle.failure_rx();
    let mut losses = target.losses();

    'outer: loop {
        if *shutdown.borrow() {
            break;
        }

        if !handle.is_connected() {
            // Anything reported before this attempt belongs to an older
            // session; reports from here on end the new one.
            failures.borrow_and_update();
            if let Some(rx) = losses.as_mut() {
                rx.borrow_and_update();
            }
            handle.set(ConnectionState::Connecting);
            let attempt = tokio::select! {
                _ = stopped(&mut shutdown) => break 'outer,
                result = target.connect() => result,
            };
            match attempt {
                Ok(()) => {
                    handle.set(ConnectionState::Connected);
                    target.on_connected();
                }
                Err(e) => {
                    handle.set(ConnectionState::Disconnected);
                    let delay = backoff.next_delay();
                    warn!(
                        connection = %target.name(),
                        error = %e,
                        retry_in_ms = delay.as_millis() as u64,
                        "connection attempt failed"
                    );
                    tokio::select! {
                        _ = stopped(&mut shutdown) => break 'outer,
                        _ = tokio::time::sleep(delay) => continue 'outer,
                    }
                }
            }
        }

        let connected_at = Instant::now();
        let mut health = tokio::time::interval_at(
            connected_at + policy.health_interval,
            policy.health_interval,
        );
        health.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let lost = loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break Lost::Shutdown,
                changed = failures.changed() => {
                    if changed.is_err() {
                        break Lost::Shutdown;
                    }
                    break Lost::Failed("failure reported");
                }
                _ = dropped(&mut losses) => break Lost::Failed("connection dropped"),
                _ = health.tick() => {
                    if !target.is_healthy() {
                        break Lost::Failed("health check failed");
                    }
                    debug!(connection = %target.name(), "health check passed");
                }
            }
        };

        let reason = match lost {
            Lost::Shutdown => break,
            Lost::Failed(reason) => reason,
        };
        if connected_at.elapsed() >= policy.reset_after {
            backoff.reset();
        }
        warn!(connection = %target.name(), reason, "connection lost");
        target.disconnect().await;
        handle.set(ConnectionState::Disconnected);

        let delay = backoff.next_delay();
        info!(connection = %target.name(), retry_in_ms = delay.as_millis() as u64, "reconnecting");
        tokio::select! {
            _ = stopped(&mut shutdown) => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }

    target.disconnect().await;
    handle.set(ConnectionState::Disconnected);
    debug!(connection = %target.name(), "supervisor stopped");
}
