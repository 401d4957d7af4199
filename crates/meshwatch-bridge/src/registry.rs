//! In-memory table of every node the bridge has heard of.
//!
//! Records are created on first mention and only ever updated afterwards.
//! Each `upsert` and `snapshot` is a single critical section, so readers
//! never observe a half-applied update.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;

use meshwatch_core::event::{merge_text, merge_value};
use meshwatch_core::{NodeId, NodeUpdate, Position};

/// Placeholders the radio firmware reports for nodes that never set a name.
const UNKNOWN_SHORT_NAME: &str = "UNK";
const UNKNOWN_LONG_NAME: &str = "Unknown";

/// Everything known about one node.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NodeRecord {
    pub node_id: NodeId,
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
    pub first_seen: DateTime<Utc>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl NodeRecord {
    fn new(node_id: NodeId, now: DateTime<Utc>) -> Self {
        Self {
            node_id,
            short_name: None,
            long_name: None,
            hw_model: None,
            battery_level: None,
            voltage: None,
            channel_utilization: None,
            air_util_tx: None,
            snr: None,
            rssi: None,
            position: None,
            first_seen: now,
            last_seen: None,
        }
    }

    fn apply(&mut self, update: NodeUpdate) {
        merge_text(&mut self.short_name, update.short_name);
        merge_text(&mut self.long_name, update.long_name);
        merge_text(&mut self.hw_model, update.hw_model);
        merge_value(&mut self.battery_level, update.battery_level);
        merge_value(&mut self.voltage, update.voltage);
        merge_value(&mut self.channel_utilization, update.channel_utilization);
        merge_value(&mut self.air_util_tx, update.air_util_tx);
        merge_value(&mut self.snr, update.snr);
        merge_value(&mut self.rssi, update.rssi);
        merge_value(&mut self.position, update.position);

        // Node database replays carry old timestamps.
        if let Some(heard) = update.last_heard
            && self.last_seen.is_none_or(|seen| heard > seen)
        {
            self.last_seen = Some(heard);
        }
    }

    /// Best human-readable name: short name, then long name, then the id.
    pub fn display_name(&self) -> String {
        if let Some(short) = &self.short_name
            && short != UNKNOWN_SHORT_NAME
        {
            return short.clone();
        }
        if let Some(long) = &self.long_name
            && long != UNKNOWN_LONG_NAME
        {
            return long.clone();
        }
        self.node_id.to_string()
    }
}

/// Result of [`NodeRegistry::upsert`].
#[derive(Debug, Clone)]
pub struct UpsertOutcome {
    /// Whether the node was unknown before this call.
    pub created: bool,
    /// The record after the update.
    pub record: NodeRecord,
}

/// Shared node table.
#[derive(Debug, Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<NodeId, NodeRecord>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `update` into the record for `node`, creating it if needed.
    pub fn upsert(&self, node: NodeId, update: NodeUpdate) -> UpsertOutcome {
        let now = Utc::now();
        let mut nodes = self.nodes.write();
        let mut created = false;
        let record = nodes.entry(node).or_insert_with(|| {
            created = true;
            NodeRecord::new(node, update.last_heard.unwrap_or(now))
        });
        record.apply(update);
        UpsertOutcome {
            created,
            record: record.clone(),
        }
    }

    pub fn get(&self, node: NodeId) -> Option<NodeRecord> {
        self.nodes.read().get(&node).cloned()
    }

    /// Copy of every record, ordered by node id.
    pub fn snapshot(&self) -> Vec<NodeRecord> {
        let mut records: Vec<_> = self.nodes.read().values().cloned().collect();
        records.sort_by_key(|r| r.node_id);
        records
    }

    /// Name for log lines and payloads. Unknown nodes get a `Node-XXXX` label.
    pub fn display_name(&self, node: NodeId) -> String {
        match self.nodes.read().get(&node) {
            Some(record) => record.display_name(),
            None => node.friendly_label(),
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use proptest::prelude::*;

    fn named(short: &str, long: &str) -> NodeUpdate {
        NodeUpdate {
            short_name: Some(short.into()),
            long_name: Some(long.into()),
            ..Default::default()
        }
    }

    #[test]
    fn upsert_creates_then_merges() {
        let registry = NodeRegistry::new();
        let node: NodeId = "!abcd1234".parse().unwrap();

        let first = registry.upsert(node, named("ABCD", "Alpha Base"));
        assert!(first.created);

        let second = registry.upsert(
            node,
            NodeUpdate {
                battery_level: Some(72),
                ..Default::default()
            },
        );
        assert!(!second.created);

        let record = registry.get(node).unwrap();
        assert_eq!(record.short_name.as_deref(), Some("ABCD"));
        assert_eq!(record.long_name.as_deref(), Some("Alpha Base"));
        assert_eq!(record.battery_level, Some(72));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn get_unknown_node_is_none() {
        let registry = NodeRegistry::new();
        assert!(registry.is_empty());
        assert!(registry.get(NodeId::new(5)).is_none());
    }

    #[test]
    fn blank_names_do_not_erase() {
        let registry = NodeRegistry::new();
        let node = NodeId::new(1);
        registry.upsert(node, named("AB", "Alpha"));
        registry.upsert(node, named("", "  "));
        let record = registry.get(node).unwrap();
        assert_eq!(record.short_name.as_deref(), Some("AB"));
        assert_eq!(record.long_name.as_deref(), Some("Alpha"));
    }

    #[test]
    fn last_seen_never_moves_backwards() {
        let registry = NodeRegistry::new();
        let node = NodeId::new(2);
        let newer = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let older = Utc.with_ymd_and_hms(2024, 4, 1, 12, 0, 0).unwrap();

        registry.upsert(
            node,
            NodeUpdate {
                last_heard: Some(newer),
                ..Default::default()
            },
        );
        registry.upsert(
            node,
            NodeUpdate {
                last_heard: Some(older),
                ..Default::default()
            },
        );
        let record = registry.get(node).unwrap();
        assert_eq!(record.last_seen, Some(newer));
        assert_eq!(record.first_seen, newer);
    }

    #[test]
    fn snapshot_is_sorted_copy() {
        let registry = NodeRegistry::new();
        for num in [30, 10, 20] {
            registry.upsert(NodeId::new(num), NodeUpdate::default());
        }
        let snapshot = registry.snapshot();
        let ids: Vec<u32> = snapshot.iter().map(|r| r.node_id.num()).collect();
        assert_eq!(ids, vec![10, 20, 30]);

        registry.upsert(NodeId::new(10), named("X", "Xray"));
        assert_eq!(snapshot[0].short_name, None);
    }

    #[test]
    fn display_name_fallbacks() {
        let registry = NodeRegistry::new();
        let unknown: NodeId = "!abcd1234".parse().unwrap();
        assert_eq!(registry.display_name(unknown), "Node-1234");

        let placeholder = NodeId::new(0x10);
        registry.upsert(placeholder, named("UNK", "Unknown"));
        assert_eq!(registry.display_name(placeholder), "!00000010");

        let long_only = NodeId::new(0x11);
        registry.upsert(long_only, named("UNK", "Hilltop Relay"));
        assert_eq!(registry.display_name(long_only), "Hilltop Relay");

        let short = NodeId::new(0x12);
        registry.upsert(short, named("HTR", "Hilltop Relay"));
        assert_eq!(registry.display_name(short), "HTR");
    }

    fn arb_update() -> impl Strategy<Value = NodeUpdate> {
        (
            proptest::option::of("[A-Z]{1,4}"),
            proptest::option::of(0u32..=100),
            proptest::option::of(-130i32..0),
        )
            .prop_map(|(short_name, battery_level, rssi)| NodeUpdate {
                short_name,
                battery_level,
                rssi,
                ..Default::default()
            })
    }

    proptest! {
        #[test]
        fn registry_keeps_latest_value_per_field(
            updates in proptest::collection::vec(arb_update(), 1..20)
        ) {
            let registry = NodeRegistry::new();
            let node = NodeId::new(0xabcd_1234);
            for update in &updates {
                registry.upsert(node, update.clone());
            }
            let record = registry.get(node).unwrap();

            let last_short = updates.iter().rev().find_map(|u| u.short_name.clone());
            let last_battery = updates.iter().rev().find_map(|u| u.battery_level);
            let last_rssi = updates.iter().rev().find_map(|u| u.rssi);
            prop_assert_eq!(record.short_name, last_short);
            prop_assert_eq!(record.battery_level, last_battery);
            prop_assert_eq!(record.rssi, last_rssi);
        }
    }
}
