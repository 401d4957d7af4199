//! Bridge status and node list publishing.
//!
//! Status reports go to `<prefix>/bridge_status` whenever either connection
//! changes state and on a fixed interval. Node records are republished
//! (retained) after the device node database is loaded, on the interval,
//! and whenever something publishes to `<prefix>/bridge/refresh`.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{Notify, mpsc, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerError, InboundMessage};
use crate::monitor::{ConnectionHandle, ConnectionState, stopped};
use crate::registry::{NodeRecord, NodeRegistry};
use crate::relay::{RelayStats, RelayStatsSnapshot};
use crate::topics::TopicScheme;

/// Body of every `bridge_status` message.
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport<'a> {
    pub status_type: &'a str,
    pub value: &'a str,
    pub timestamp: String,
    /// Events published so far.
    pub message_count: u64,
    /// Seconds since the bridge started.
    pub uptime: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<RelayStatsSnapshot>,
}

#[derive(Serialize)]
struct NodeSummary<'a> {
    total_nodes: usize,
    nodes: &'a [NodeRecord],
    updated: String,
}

/// Payload the broker publishes as our last will.
pub fn offline_payload() -> Vec<u8> {
    let report = serde_json::json!({
        "status_type": "bridge_status",
        "value": "offline",
    });
    report.to_string().into_bytes()
}

pub struct StatusReporter<B> {
    broker: Arc<B>,
    broker_state: ConnectionHandle,
    device_state: ConnectionHandle,
    registry: Arc<NodeRegistry>,
    stats: Arc<RelayStats>,
    topics: TopicScheme,
    interval: Option<Duration>,
    nodes_changed: Arc<Notify>,
    started: Instant,
}

impl<B: BrokerClient> StatusReporter<B> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<B>,
        broker_state: ConnectionHandle,
        device_state: ConnectionHandle,
        registry: Arc<NodeRegistry>,
        stats: Arc<RelayStats>,
        topics: TopicScheme,
        interval: Option<Duration>,
        nodes_changed: Arc<Notify>,
    ) -> Self {
        Self {
            broker,
            broker_state,
            device_state,
            registry,
            stats,
            topics,
            interval,
            nodes_changed,
            started: Instant::now(),
        }
    }

    /// Publish one status report. Skipped while the broker is offline.
    pub async fn publish_status(
        &self,
        status_type: &str,
        value: &str,
        with_stats: bool,
    ) -> Result<(), BrokerError> {
        if !self.broker_state.is_connected() {
            debug!(status_type, value, "broker offline, status not published");
            return Ok(());
        }
        let stats = self.stats.snapshot();
        let report = StatusReport {
            status_type,
            value,
            timestamp: Utc::now().to_rfc3339(),
            message_count: stats.published,
            uptime: self.started.elapsed().as_secs(),
            stats: with_stats.then_some(stats),
        };
        let payload = serde_json::to_vec(&report)
            .map_err(|e| BrokerError::Connection(format!("status encoding failed: {e}")))?;
        self.broker
            .publish(&self.topics.bridge_status(), payload, false)
            .await
    }

    /// Publish every node record (retained) and the summary. Returns the
    /// number of nodes published.
    pub async fn publish_nodes(&self) -> Result<usize, BrokerError> {
        if !self.broker_state.is_connected() {
            return Ok(0);
        }
        let records = self.registry.snapshot();
        for record in &records {
            let payload = serde_json::to_vec(record)
                .map_err(|e| BrokerError::Connection(format!("node encoding failed: {e}")))?;
            self.broker
                .publish(&self.topics.node(record.node_id), payload, true)
                .await?;
        }
        let summary = NodeSummary {
            total_nodes: records.len(),
            nodes: &records,
            updated: Utc::now().to_rfc3339(),
        };
        let payload = serde_json::to_vec(&summary)
            .map_err(|e| BrokerError::Connection(format!("summary encoding failed: {e}")))?;
        self.broker
            .publish(&self.topics.nodes_summary(), payload, false)
            .await?;
        debug!(nodes = records.len(), "published node list");
        Ok(records.len())
    }

    async fn announce_broker_connected(&self) {
        self.log_failure("bridge_status", self.publish_status("bridge_status", "connected", false).await);
        self.log_failure("nodes", self.publish_nodes().await.map(|_| ()));
    }

    async fn periodic(&self) {
        let stats = self.stats.snapshot();
        info!(
            received = stats.received,
            published = stats.published,
            failures = stats.publish_failures,
            dropped = stats.dropped_offline,
            malformed = stats.malformed,
            nodes = self.registry.len(),
            device = %self.device_state.state(),
            broker = %self.broker_state.state(),
            "bridge status"
        );
        self.log_failure("periodic_update", self.publish_status("periodic_update", "running", true).await);
        self.log_failure("nodes", self.publish_nodes().await.map(|_| ()));
    }

    fn log_failure(&self, what: &str, result: Result<(), BrokerError>) {
        if let Err(e) = result {
            warn!(what, error = %e, "status publish failed");
            if matches!(e, BrokerError::NotConnected) {
                self.broker_state.report_failure();
            }
        }
    }

    /// Run until shutdown.
    ///
    /// `inbound` carries publishes on subscribed topics; only the refresh
    /// topic is acted on.
    pub async fn run(
        self: Arc<Self>,
        mut inbound: Option<mpsc::Receiver<InboundMessage>>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        let mut device_rx = self.device_state.subscribe();
        let mut broker_rx = self.broker_state.subscribe();
        let mut ticker = self.interval.map(|period| {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker
        });
        let refresh_topic = self.topics.refresh();

        if self.broker_state.is_connected() {
            self.announce_broker_connected().await;
        }

        loop {
            tokio::select! {
                _ = stopped(&mut shutdown) => break,
                Ok(()) = device_rx.changed() => {
                    let state = *device_rx.borrow_and_update();
                    self.log_failure(
                        "meshtastic_status",
                        self.publish_status("meshtastic_status", state.as_str(), false).await,
                    );
                }
                Ok(()) = broker_rx.changed() => {
                    let state = *broker_rx.borrow_and_update();
                    if state == ConnectionState::Connected {
                        self.announce_broker_connected().await;
                    }
                }
                _ = tick(&mut ticker) => self.periodic().await,
                _ = self.nodes_changed.notified() => {
                    self.log_failure("nodes", self.publish_nodes().await.map(|_| ()));
                }
                message = recv(&mut inbound) => match message {
                    Some(message) if message.topic == refresh_topic => {
                        debug!("node list refresh requested");
                        self.log_failure("nodes", self.publish_nodes().await.map(|_| ()));
                    }
                    Some(message) => debug!(topic = %message.topic, "ignoring inbound message"),
                    None => inbound = None,
                },
            }
        }
        debug!("status reporter stopped");
    }
}

async fn tick(ticker: &mut Option<Interval>) {
    match ticker {
        Some(ticker) => {
            ticker.tick().await;
        }
        None => std::future::pending().await,
    }
}

async fn recv(inbound: &mut Option<mpsc::Receiver<InboundMessage>>) -> Option<InboundMessage> {
    match inbound {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
