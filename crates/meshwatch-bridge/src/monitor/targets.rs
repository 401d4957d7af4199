//! The two connections the bridge supervises.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Notify, watch};
use tracing::{debug, info, warn};

use meshwatch_link::DeviceLink;

use super::supervisor::Supervised;
use super::Activity;
use crate::broker::BrokerClient;
use crate::error::BridgeError;
use crate::registry::NodeRegistry;
use crate::topics::TopicScheme;

/// Supervises the radio. After each connect the device's node database is
/// loaded into the registry.
pub struct DeviceTarget<L> {
    link: Arc<L>,
    registry: Arc<NodeRegistry>,
    activity: Activity,
    stale_after: Option<Duration>,
    nodes_changed: Arc<Notify>,
}

impl<L: DeviceLink> DeviceTarget<L> {
    pub fn new(
        link: Arc<L>,
        registry: Arc<NodeRegistry>,
        activity: Activity,
        stale_after: Option<Duration>,
        nodes_changed: Arc<Notify>,
    ) -> Self {
        Self {
            link,
            registry,
            activity,
            stale_after,
            nodes_changed,
        }
    }
}

impl<L: DeviceLink> Supervised for DeviceTarget<L> {
    fn name(&self) -> &str {
        self.link.name()
    }

    async fn connect(&self) -> Result<(), BridgeError> {
        self.link.connect().await?;
        self.activity.touch();
        Ok(())
    }

    async fn disconnect(&self) {
        if let Err(e) = self.link.disconnect().await {
            debug!(link = %self.link.name(), error = %e, "disconnect failed");
        }
    }

    fn is_healthy(&self) -> bool {
        if !self.link.is_connected() {
            return false;
        }
        match self.stale_after {
            Some(limit) if self.activity.idle() > limit => {
                warn!(
                    link = %self.link.name(),
                    idle_secs = self.activity.idle().as_secs(),
                    "no events from device"
                );
                false
            }
            _ => true,
        }
    }

    fn on_connected(&self) {
        let nodes = self.link.visible_nodes();
        let mut created = 0usize;
        for (node, update) in nodes.iter().cloned() {
            if node.is_broadcast() {
                continue;
            }
            if self.registry.upsert(node, update).created {
                created += 1;
            }
        }
        info!(
            link = %self.link.name(),
            visible = nodes.len(),
            new = created,
            total = self.registry.len(),
            "loaded device node database"
        );
        self.nodes_changed.notify_one();
    }
}

/// Supervises the broker session and keeps the refresh subscription alive.
pub struct BrokerTarget<B> {
    broker: Arc<B>,
    topics: TopicScheme,
}

impl<B: BrokerClient> BrokerTarget<B> {
    pub fn new(broker: Arc<B>, topics: TopicScheme) -> Self {
        Self { broker, topics }
    }
}

impl<B: BrokerClient> Supervised for BrokerTarget<B> {
    fn name(&self) -> &str {
        self.broker.name()
    }

    async fn connect(&self) -> Result<(), BridgeError> {
        self.broker.connect().await?;
        if let Err(e) = self.broker.subscribe(&self.topics.refresh()).await {
            self.broker.disconnect().await;
            return Err(e.into());
        }
        Ok(())
    }

    async fn disconnect(&self) {
        self.broker.disconnect().await;
    }

    fn is_healthy(&self) -> bool {
        self.broker.is_connected()
    }

    fn losses(&self) -> Option<watch::Receiver<u64>> {
        Some(self.broker.session_losses())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshwatch_core::{NodeId, NodeUpdate};
    use meshwatch_link::testing::ScriptedLink;

    use crate::broker::MemoryBroker;

    #[tokio::test]
    async fn device_connect_loads_node_database() {
        let link = Arc::new(ScriptedLink::new("radio"));
        link.set_visible_nodes([(
            NodeId::new(0x1234),
            NodeUpdate {
                short_name: Some("AB".into()),
                ..Default::default()
            },
        )]);
        let registry = Arc::new(NodeRegistry::new());
        let notify = Arc::new(Notify::new());
        let target = DeviceTarget::new(
            Arc::clone(&link),
            Arc::clone(&registry),
            Activity::new(),
            None,
            Arc::clone(&notify),
        );

        target.connect().await.unwrap();
        target.on_connected();
        assert!(target.is_healthy());
        assert_eq!(
            registry.get(NodeId::new(0x1234)).unwrap().short_name.as_deref(),
            Some("AB")
        );
        // The permit is stored, so this resolves immediately.
        notify.notified().await;

        target.disconnect().await;
        assert!(!target.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn stale_device_is_unhealthy() {
        let link = Arc::new(ScriptedLink::new("radio"));
        let activity = Activity::new();
        let target = DeviceTarget::new(
            Arc::clone(&link),
            Arc::new(NodeRegistry::new()),
            activity.clone(),
            Some(Duration::from_secs(300)),
            Arc::new(Notify::new()),
        );
        target.connect().await.unwrap();
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(target.is_healthy());
        tokio::time::sleep(Duration::from_secs(200)).await;
        assert!(!target.is_healthy());
        activity.touch();
        assert!(target.is_healthy());
    }

    #[tokio::test]
    async fn broker_connect_subscribes_to_refresh() {
        let broker = Arc::new(MemoryBroker::new());
        let target = BrokerTarget::new(Arc::clone(&broker), TopicScheme::new("mesh"));
        target.connect().await.unwrap();
        assert!(target.is_healthy());
        assert_eq!(broker.subscriptions(), vec!["mesh/bridge/refresh".to_string()]);

        let mut losses = target.losses().unwrap();
        broker.drop_connection();
        assert!(!target.is_healthy());
        assert!(losses.has_changed().unwrap());
        assert_eq!(*losses.borrow_and_update(), 1);
    }

    #[tokio::test]
    async fn broker_connect_failure_is_reported() {
        let broker = Arc::new(MemoryBroker::new());
        broker.set_reachable(false);
        let target = BrokerTarget::new(Arc::clone(&broker), TopicScheme::default());
        assert!(matches!(
            target.connect().await,
            Err(BridgeError::Broker(_))
        ));
    }
}
