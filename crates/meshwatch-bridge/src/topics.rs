//! MQTT topic layout.
//!
//! ```text
//! <prefix>/<kind>/<node id>      relayed events, e.g. meshtastic/text/!a1b2c3d4
//! <prefix>/nodes/<node id>       retained node record
//! <prefix>/nodes_summary         node summary
//! <prefix>/bridge_status         bridge status reports and last will
//! <prefix>/bridge/refresh        inbound request to republish the node list
//! ```

use meshwatch_core::{EventKind, NodeId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicScheme {
    prefix: String,
}

impl TopicScheme {
    /// Leading and trailing slashes are stripped from `prefix`.
    pub fn new(prefix: impl AsRef<str>) -> Self {
        Self {
            prefix: prefix.as_ref().trim_matches('/').to_string(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn event(&self, kind: EventKind, node: NodeId) -> String {
        format!("{}/{}/{}", self.prefix, kind.as_str(), node)
    }

    pub fn node(&self, node: NodeId) -> String {
        format!("{}/nodes/{}", self.prefix, node)
    }

    pub fn nodes_summary(&self) -> String {
        format!("{}/nodes_summary", self.prefix)
    }

    pub fn bridge_status(&self) -> String {
        format!("{}/bridge_status", self.prefix)
    }

    pub fn refresh(&self) -> String {
        format!("{}/bridge/refresh", self.prefix)
    }
}

impl Default for TopicScheme {
    fn default() -> Self {
        Self::new("meshtastic")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_topics_per_kind() {
        let topics = TopicScheme::default();
        let node = NodeId::new(0xa1b2_c3d4);
        assert_eq!(
            topics.event(EventKind::Text, node),
            "meshtastic/text/!a1b2c3d4"
        );
        assert_eq!(
            topics.event(EventKind::NodeInfo, node),
            "meshtastic/nodeinfo/!a1b2c3d4"
        );
        assert_eq!(
            topics.event(EventKind::Packet, node),
            "meshtastic/packet/!a1b2c3d4"
        );
    }

    #[test]
    fn service_topics() {
        let topics = TopicScheme::new("/lab/mesh/");
        assert_eq!(topics.prefix(), "lab/mesh");
        assert_eq!(topics.node(NodeId::new(1)), "lab/mesh/nodes/!00000001");
        assert_eq!(topics.nodes_summary(), "lab/mesh/nodes_summary");
        assert_eq!(topics.bridge_status(), "lab/mesh/bridge_status");
        assert_eq!(topics.refresh(), "lab/mesh/bridge/refresh");
    }

    #[test]
    fn node_topics_do_not_collide_with_event_kinds() {
        let topics = TopicScheme::default();
        let node = NodeId::new(7);
        for kind in EventKind::ALL {
            assert_ne!(topics.event(kind, node), topics.node(node));
        }
    }
}
