//! Turns mesh events into broker publishes.
//!
//! Every event updates the registry first, then is serialized and published
//! on `<prefix>/<kind>/<node id>`. Publishing is attempted only while the
//! broker reads `Connected`; events that arrive during an outage are counted
//! and dropped rather than queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;
use tracing::{debug, trace, warn};

use meshwatch_core::constants::BROADCAST_NUM;
use meshwatch_core::{EventKind, MeshEvent, NodeId};
use meshwatch_link::LinkError;

use crate::broker::{BrokerClient, BrokerError};
use crate::monitor::ConnectionHandle;
use crate::registry::NodeRegistry;
use crate::topics::TopicScheme;

/// Counters for the relay. Updated with relaxed atomics.
#[derive(Debug, Default)]
pub struct RelayStats {
    received: AtomicU64,
    published: AtomicU64,
    publish_failures: AtomicU64,
    dropped_offline: AtomicU64,
    malformed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RelayStatsSnapshot {
    pub received: u64,
    pub published: u64,
    pub publish_failures: u64,
    pub dropped_offline: u64,
    pub malformed: u64,
}

impl RelayStats {
    pub fn snapshot(&self) -> RelayStatsSnapshot {
        RelayStatsSnapshot {
            received: self.received.load(Ordering::Relaxed),
            published: self.published.load(Ordering::Relaxed),
            publish_failures: self.publish_failures.load(Ordering::Relaxed),
            dropped_offline: self.dropped_offline.load(Ordering::Relaxed),
            malformed: self.malformed.load(Ordering::Relaxed),
        }
    }

    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

/// What happened to one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayOutcome {
    Published,
    /// The broker was not connected.
    DroppedOffline,
    /// The publish was attempted and failed.
    Failed,
}

#[derive(Serialize)]
struct RelayMessage<'a> {
    timestamp: String,
    sequence: u64,
    message_type: EventKind,
    from_id: NodeId,
    to_id: String,
    from_name: String,
    to_name: String,
    packet_id: u32,
    channel: u32,
    hop_limit: u32,
    hop_start: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    hops_away: Option<u32>,
    want_ack: bool,
    via_mqtt: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    rssi: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    snr: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    rx_time: Option<u32>,
    #[serde(flatten)]
    body: Body<'a>,
}

#[derive(Serialize)]
#[serde(untagged)]
enum Body<'a> {
    Text {
        text: &'a str,
    },
    NodeInfo {
        #[serde(skip_serializing_if = "Option::is_none")]
        short_name: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        long_name: Option<&'a str>,
        #[serde(skip_serializing_if = "Option::is_none")]
        hw_model: Option<&'a str>,
    },
    Telemetry {
        #[serde(skip_serializing_if = "Option::is_none")]
        battery_level: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        voltage: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        channel_utilization: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        air_util_tx: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        uptime_seconds: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        temperature: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        relative_humidity: Option<f32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        barometric_pressure: Option<f32>,
    },
    Position {
        latitude: f64,
        longitude: f64,
        #[serde(skip_serializing_if = "Option::is_none")]
        altitude: Option<i32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        position_time: Option<u32>,
    },
    Packet {
        port_num: &'a str,
        payload_len: usize,
    },
}

impl<'a> Body<'a> {
    fn from_event(event: &'a MeshEvent) -> Self {
        match event {
            MeshEvent::TextMessage { text, .. } => Body::Text { text },
            MeshEvent::NodeInfo { update, .. } => Body::NodeInfo {
                short_name: update.short_name.as_deref(),
                long_name: update.long_name.as_deref(),
                hw_model: update.hw_model.as_deref(),
            },
            MeshEvent::Telemetry {
                device,
                environment,
                ..
            } => {
                let device = device.unwrap_or_default();
                let environment = environment.unwrap_or_default();
                Body::Telemetry {
                    battery_level: device.battery_level,
                    voltage: device.voltage,
                    channel_utilization: device.channel_utilization,
                    air_util_tx: device.air_util_tx,
                    uptime_seconds: device.uptime_seconds,
                    temperature: environment.temperature,
                    relative_humidity: environment.relative_humidity,
                    barometric_pressure: environment.barometric_pressure,
                }
            }
            MeshEvent::Position { position, .. } => Body::Position {
                latitude: position.latitude,
                longitude: position.longitude,
                altitude: position.altitude,
                position_time: position.time,
            },
            MeshEvent::Packet {
                port, payload_len, ..
            } => Body::Packet {
                port_num: port,
                payload_len: *payload_len,
            },
        }
    }
}

/// Forwards events from the device link to the broker.
pub struct EventRelay<B> {
    broker: Arc<B>,
    broker_state: ConnectionHandle,
    registry: Arc<NodeRegistry>,
    topics: TopicScheme,
    stats: Arc<RelayStats>,
    sequence: AtomicU64,
}

impl<B: BrokerClient> EventRelay<B> {
    pub fn new(
        broker: Arc<B>,
        broker_state: ConnectionHandle,
        registry: Arc<NodeRegistry>,
        topics: TopicScheme,
        stats: Arc<RelayStats>,
    ) -> Self {
        Self {
            broker,
            broker_state,
            registry,
            topics,
            stats,
            sequence: AtomicU64::new(0),
        }
    }

    pub fn stats(&self) -> &Arc<RelayStats> {
        &self.stats
    }

    /// Update the registry from `event` and publish it.
    ///
    /// Never retries. A publish that fails because the session is gone is
    /// reported to the broker supervisor.
    pub async fn on_event(&self, event: MeshEvent) -> RelayOutcome {
        RelayStats::bump(&self.stats.received);

        let source = event.source();
        if !source.is_broadcast() {
            let outcome = self.registry.upsert(source, event.node_update());
            if outcome.created {
                debug!(node = %source, "new node");
            }
        }

        if !self.broker_state.is_connected() {
            RelayStats::bump(&self.stats.dropped_offline);
            trace!(node = %source, kind = %event.kind(), "broker offline, event dropped");
            return RelayOutcome::DroppedOffline;
        }

        let topic = self.topics.event(event.kind(), source);
        let payload = match serde_json::to_vec(&self.message(&event)) {
            Ok(payload) => payload,
            Err(e) => {
                RelayStats::bump(&self.stats.publish_failures);
                warn!(node = %source, error = %e, "failed to serialize event");
                return RelayOutcome::Failed;
            }
        };

        match self.broker.publish(&topic, payload, false).await {
            Ok(()) => {
                RelayStats::bump(&self.stats.published);
                debug!(%topic, "event relayed");
                RelayOutcome::Published
            }
            Err(e) => {
                RelayStats::bump(&self.stats.publish_failures);
                warn!(%topic, error = %e, "publish failed, event dropped");
                if matches!(e, BrokerError::NotConnected) {
                    self.broker_state.report_failure();
                }
                RelayOutcome::Failed
            }
        }
    }

    /// Count and log a frame the link could not decode.
    pub fn record_malformed(&self, error: &LinkError) {
        RelayStats::bump(&self.stats.malformed);
        warn!(error = %error, "skipping malformed frame");
    }

    fn message<'a>(&self, event: &'a MeshEvent) -> RelayMessage<'a> {
        let meta = event.meta();
        let (to_id, to_name) = match meta.to {
            Some(to) => (to.to_string(), self.registry.display_name(to)),
            None => (
                NodeId::new(BROADCAST_NUM).to_string(),
                "broadcast".to_string(),
            ),
        };
        RelayMessage {
            timestamp: meta.received_at.to_rfc3339(),
            sequence: self.sequence.fetch_add(1, Ordering::Relaxed) + 1,
            message_type: event.kind(),
            from_id: meta.from,
            to_id,
            from_name: self.registry.display_name(meta.from),
            to_name,
            packet_id: meta.packet_id,
            channel: meta.channel,
            hop_limit: meta.hop_limit,
            hop_start: meta.hop_start,
            hops_away: meta.hops_taken(),
            want_ack: meta.want_ack,
            via_mqtt: meta.via_mqtt,
            rssi: meta.signal.rssi,
            snr: meta.signal.snr,
            rx_time: meta.rx_time,
            body: Body::from_event(event),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwatch_core::{DeviceMetrics, NodeUpdate, PacketMeta, Position, SignalQuality};

    use crate::broker::MemoryBroker;
    use crate::monitor::ConnectionState;

    struct Fixture {
        broker: Arc<MemoryBroker>,
        state: ConnectionHandle,
        registry: Arc<NodeRegistry>,
        relay: EventRelay<MemoryBroker>,
    }

    async fn fixture() -> Fixture {
        let broker = Arc::new(MemoryBroker::new());
        broker.connect().await.unwrap();
        let state = ConnectionHandle::new("broker");
        state.set(ConnectionState::Connected);
        let registry = Arc::new(NodeRegistry::new());
        let relay = EventRelay::new(
            Arc::clone(&broker),
            state.clone(),
            Arc::clone(&registry),
            TopicScheme::default(),
            Arc::new(RelayStats::default()),
        );
        Fixture {
            broker,
            state,
            registry,
            relay,
        }
    }

    fn meta(from: u32) -> PacketMeta {
        PacketMeta {
            channel: 0,
            packet_id: 42,
            hop_limit: 2,
            hop_start: 3,
            signal: SignalQuality {
                rssi: Some(-90),
                snr: Some(6.5),
            },
            ..PacketMeta::new(NodeId::new(from))
        }
    }

    #[tokio::test]
    async fn text_message_payload() {
        let f = fixture().await;
        f.registry.upsert(
            NodeId::new(0xabcd_1234),
            NodeUpdate {
                short_name: Some("ABCD".into()),
                ..Default::default()
            },
        );

        let outcome = f
            .relay
            .on_event(MeshEvent::TextMessage {
                meta: meta(0xabcd_1234),
                text: "hello mesh".into(),
            })
            .await;
        assert_eq!(outcome, RelayOutcome::Published);

        let published = f.broker.published();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "meshtastic/text/!abcd1234");
        assert!(!published[0].retain);

        let json = published[0].json();
        assert_eq!(json["message_type"], "text");
        assert_eq!(json["text"], "hello mesh");
        assert_eq!(json["from_id"], "!abcd1234");
        assert_eq!(json["from_name"], "ABCD");
        assert_eq!(json["to_id"], "!ffffffff");
        assert_eq!(json["to_name"], "broadcast");
        assert_eq!(json["rssi"], -90);
        assert_eq!(json["snr"], 6.5);
        assert_eq!(json["hop_start"], 3);
        assert_eq!(json["hops_away"], 1);
        assert_eq!(json["sequence"], 1);
        assert!(json.get("rx_time").is_none());
    }

    #[tokio::test]
    async fn telemetry_updates_registry_and_omits_absent_fields() {
        let f = fixture().await;
        let node = NodeId::new(7);
        f.relay
            .on_event(MeshEvent::Telemetry {
                meta: meta(7),
                device: Some(DeviceMetrics {
                    battery_level: Some(72),
                    voltage: Some(3.9),
                    ..Default::default()
                }),
                environment: None,
            })
            .await;

        let record = f.registry.get(node).unwrap();
        assert_eq!(record.battery_level, Some(72));
        assert_eq!(record.rssi, Some(-90));
        assert!(record.last_seen.is_some());

        let json = f.broker.published()[0].json();
        assert_eq!(json["battery_level"], 72);
        assert!(json.get("temperature").is_none());
        assert!(json.get("channel_utilization").is_none());
        assert_eq!(json["from_name"], "!00000007");
    }

    #[tokio::test]
    async fn position_and_packet_payloads() {
        let f = fixture().await;
        f.relay
            .on_event(MeshEvent::Position {
                meta: meta(9),
                position: Position {
                    latitude: 52.5,
                    longitude: 13.25,
                    altitude: Some(34),
                    time: None,
                },
            })
            .await;
        f.relay
            .on_event(MeshEvent::Packet {
                meta: PacketMeta {
                    to: Some(NodeId::new(9)),
                    ..meta(10)
                },
                port: "ENCRYPTED".into(),
                payload_len: 48,
            })
            .await;

        let published = f.broker.published();
        assert_eq!(published[0].topic, "meshtastic/position/!00000009");
        let position = published[0].json();
        assert_eq!(position["latitude"], 52.5);
        assert_eq!(position["altitude"], 34);

        assert_eq!(published[1].topic, "meshtastic/packet/!0000000a");
        let packet = published[1].json();
        assert_eq!(packet["port_num"], "ENCRYPTED");
        assert_eq!(packet["payload_len"], 48);
        assert_eq!(packet["to_id"], "!00000009");
        assert_eq!(packet["sequence"], 2);
        assert_eq!(f.registry.get(NodeId::new(9)).unwrap().position.unwrap().altitude, Some(34));
    }

    #[tokio::test]
    async fn offline_broker_drops_without_publishing() {
        let f = fixture().await;
        f.state.set(ConnectionState::Disconnected);

        let outcome = f
            .relay
            .on_event(MeshEvent::TextMessage {
                meta: meta(1),
                text: "lost".into(),
            })
            .await;
        assert_eq!(outcome, RelayOutcome::DroppedOffline);
        assert!(f.broker.published().is_empty());
        assert!(f.registry.get(NodeId::new(1)).is_some());

        let stats = f.relay.stats().snapshot();
        assert_eq!(stats.received, 1);
        assert_eq!(stats.dropped_offline, 1);
        assert_eq!(stats.published, 0);
    }

    #[tokio::test]
    async fn publish_failure_is_counted_and_reported() {
        let f = fixture().await;
        f.broker.drop_connection();

        let outcome = f
            .relay
            .on_event(MeshEvent::TextMessage {
                meta: meta(1),
                text: "x".into(),
            })
            .await;
        assert_eq!(outcome, RelayOutcome::Failed);
        assert_eq!(f.relay.stats().snapshot().publish_failures, 1);
        assert_eq!(f.state.failure_count(), 1);
    }

    #[tokio::test]
    async fn malformed_frames_are_counted() {
        let f = fixture().await;
        f.relay
            .record_malformed(&LinkError::Decode(meshwatch_core::DecodeError::MissingSender));
        assert_eq!(f.relay.stats().snapshot().malformed, 1);
    }
}
