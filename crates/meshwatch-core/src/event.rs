//! The closed set of events the relay forwards.
//!
//! Events are decoded once at the device link boundary and are immutable
//! afterwards. Every variant carries the [`PacketMeta`] of the mesh packet it
//! came from.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// Topic segment and payload tag for each [`MeshEvent`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    NodeInfo,
    Telemetry,
    Text,
    Position,
    Packet,
}

impl EventKind {
    pub const ALL: [EventKind; 5] = [
        EventKind::NodeInfo,
        EventKind::Telemetry,
        EventKind::Text,
        EventKind::Position,
        EventKind::Packet,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            EventKind::NodeInfo => "nodeinfo",
            EventKind::Telemetry => "telemetry",
            EventKind::Text => "text",
            EventKind::Position => "position",
            EventKind::Packet => "packet",
        }
    }
}

impl core::fmt::Display for EventKind {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Radio signal quality as measured by the receiving device.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SignalQuality {
    pub rssi: Option<i32>,
    pub snr: Option<f32>,
}

/// Envelope fields shared by every event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PacketMeta {
    pub from: NodeId,
    /// `None` for broadcast packets.
    pub to: Option<NodeId>,
    pub channel: u32,
    pub packet_id: u32,
    /// Device receive time, seconds since the Unix epoch, if the radio set it.
    pub rx_time: Option<u32>,
    pub hop_limit: u32,
    pub hop_start: u32,
    pub want_ack: bool,
    pub via_mqtt: bool,
    pub signal: SignalQuality,
    /// When the relay received the event.
    pub received_at: DateTime<Utc>,
}

impl PacketMeta {
    /// Minimal metadata for an event from `from`, received now.
    pub fn new(from: NodeId) -> Self {
        Self {
            from,
            to: None,
            channel: 0,
            packet_id: 0,
            rx_time: None,
            hop_limit: 0,
            hop_start: 0,
            want_ack: false,
            via_mqtt: false,
            signal: SignalQuality::default(),
            received_at: Utc::now(),
        }
    }

    /// Number of hops the packet took, when the sender advertised a start.
    pub fn hops_taken(&self) -> Option<u32> {
        (self.hop_start > 0).then(|| self.hop_start.saturating_sub(self.hop_limit))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceMetrics {
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub uptime_seconds: Option<u32>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvironmentMetrics {
    pub temperature: Option<f32>,
    pub relative_humidity: Option<f32>,
    pub barometric_pressure: Option<f32>,
}

/// A geographic fix in decimal degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub latitude: f64,
    pub longitude: f64,
    pub altitude: Option<i32>,
    /// Fix time reported by the node, seconds since the Unix epoch.
    pub time: Option<u32>,
}

/// Partial update for a node record.
///
/// Absent fields leave the stored value untouched. Empty strings count as
/// absent, so a node that re-announces itself without a name does not erase
/// one learned earlier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NodeUpdate {
    pub short_name: Option<String>,
    pub long_name: Option<String>,
    pub hw_model: Option<String>,
    pub battery_level: Option<u32>,
    pub voltage: Option<f32>,
    pub channel_utilization: Option<f32>,
    pub air_util_tx: Option<f32>,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub position: Option<Position>,
    pub last_heard: Option<DateTime<Utc>>,
}

impl NodeUpdate {
    /// Overlay `other` onto `self`, keeping current values where `other`
    /// has none.
    pub fn merge(&mut self, other: NodeUpdate) {
        merge_text(&mut self.short_name, other.short_name);
        merge_text(&mut self.long_name, other.long_name);
        merge_text(&mut self.hw_model, other.hw_model);
        merge_value(&mut self.battery_level, other.battery_level);
        merge_value(&mut self.voltage, other.voltage);
        merge_value(&mut self.channel_utilization, other.channel_utilization);
        merge_value(&mut self.air_util_tx, other.air_util_tx);
        merge_value(&mut self.snr, other.snr);
        merge_value(&mut self.rssi, other.rssi);
        merge_value(&mut self.position, other.position);
        merge_value(&mut self.last_heard, other.last_heard);
    }

    /// Fold signal quality into the update.
    pub fn with_signal(mut self, signal: SignalQuality) -> Self {
        merge_value(&mut self.rssi, signal.rssi);
        merge_value(&mut self.snr, signal.snr);
        self
    }

    /// Fold device metrics into the update.
    pub fn with_device_metrics(mut self, metrics: &DeviceMetrics) -> Self {
        merge_value(&mut self.battery_level, metrics.battery_level);
        merge_value(&mut self.voltage, metrics.voltage);
        merge_value(&mut self.channel_utilization, metrics.channel_utilization);
        merge_value(&mut self.air_util_tx, metrics.air_util_tx);
        self
    }
}

/// Replace `slot` with `value` if the value is present and not blank.
pub fn merge_text(slot: &mut Option<String>, value: Option<String>) {
    if let Some(v) = value
        && !v.trim().is_empty()
    {
        *slot = Some(v);
    }
}

/// Replace `slot` with `value` if the value is present.
pub fn merge_value<T>(slot: &mut Option<T>, value: Option<T>) {
    if value.is_some() {
        *slot = value;
    }
}

/// An event received from the mesh.
#[derive(Debug, Clone, PartialEq)]
pub enum MeshEvent {
    /// A node announced its user information.
    NodeInfo { meta: PacketMeta, update: NodeUpdate },
    /// Device or environment metrics from a node.
    Telemetry {
        meta: PacketMeta,
        device: Option<DeviceMetrics>,
        environment: Option<EnvironmentMetrics>,
    },
    TextMessage { meta: PacketMeta, text: String },
    Position { meta: PacketMeta, position: Position },
    /// Any other port, or a packet the device could not decrypt.
    Packet {
        meta: PacketMeta,
        port: String,
        payload_len: usize,
    },
}

impl MeshEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            MeshEvent::NodeInfo { .. } => EventKind::NodeInfo,
            MeshEvent::Telemetry { .. } => EventKind::Telemetry,
            MeshEvent::TextMessage { .. } => EventKind::Text,
            MeshEvent::Position { .. } => EventKind::Position,
            MeshEvent::Packet { .. } => EventKind::Packet,
        }
    }

    pub fn meta(&self) -> &PacketMeta {
        match self {
            MeshEvent::NodeInfo { meta, .. }
            | MeshEvent::Telemetry { meta, .. }
            | MeshEvent::TextMessage { meta, .. }
            | MeshEvent::Position { meta, .. }
            | MeshEvent::Packet { meta, .. } => meta,
        }
    }

    /// The node that sent the packet.
    pub fn source(&self) -> NodeId {
        self.meta().from
    }

    /// Registry update implied by this event for its source node.
    ///
    /// Every event refreshes last-heard and signal quality; the variant adds
    /// names, metrics, or position.
    pub fn node_update(&self) -> NodeUpdate {
        let meta = self.meta();
        let base = NodeUpdate {
            last_heard: Some(meta.received_at),
            ..NodeUpdate::default()
        }
        .with_signal(meta.signal);

        match self {
            MeshEvent::NodeInfo { update, .. } => {
                let mut merged = base;
                merged.merge(update.clone());
                merged
            }
            MeshEvent::Telemetry {
                device: Some(metrics),
                ..
            } => base.with_device_metrics(metrics),
            MeshEvent::Position { position, .. } => NodeUpdate {
                position: Some(*position),
                ..base
            },
            _ => base,
        }
    }
}
