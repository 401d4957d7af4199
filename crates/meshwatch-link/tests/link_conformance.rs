//! Conformance checks run against every `DeviceLink` implementation.

use meshwatch_core::{MeshEvent, NodeId, NodeUpdate, PacketMeta};
use meshwatch_link::testing::{self, ScriptedLink};
use meshwatch_link::{DeviceLink, LinkError, SerialLink, SerialLinkConfig};

fn text(from: u32, body: &str) -> MeshEvent {
    MeshEvent::TextMessage {
        meta: PacketMeta::new(NodeId::new(from)),
        text: body.to_string(),
    }
}

#[tokio::test]
async fn serial_link_pre_connect_conformance() {
    let link = SerialLink::new(SerialLinkConfig::new("/dev/meshwatch-test-port")).unwrap();
    testing::assert_pre_connect_conformance(&link).await;
}

#[tokio::test]
async fn scripted_link_pre_connect_conformance() {
    let link = ScriptedLink::new("scripted");
    testing::assert_pre_connect_conformance(&link).await;
}

#[tokio::test]
async fn scripted_link_delivers_in_order() {
    let link = ScriptedLink::new("scripted");
    link.connect().await.unwrap();
    for i in 0..5 {
        link.push_event(text(1, &format!("msg {i}")));
    }
    for i in 0..5 {
        match link.next_event().await.unwrap() {
            MeshEvent::TextMessage { text, .. } => assert_eq!(text, format!("msg {i}")),
            other => panic!("unexpected event {other:?}"),
        }
    }
}

#[tokio::test]
async fn scripted_link_malformed_keeps_session() {
    let link = ScriptedLink::new("scripted");
    link.connect().await.unwrap();
    link.push_malformed();
    link.push_event(text(2, "after"));

    let err = link.next_event().await.unwrap_err();
    assert!(err.is_malformed());
    assert!(link.is_connected());
    assert!(link.next_event().await.is_ok());
}

#[tokio::test]
async fn scripted_link_drop_ends_session() {
    let link = ScriptedLink::new("scripted");
    link.connect().await.unwrap();
    link.drop_connection();

    assert!(matches!(
        link.next_event().await,
        Err(LinkError::ConnectionLost(_))
    ));
    assert!(!link.is_connected());
    assert!(matches!(
        link.next_event().await,
        Err(LinkError::NotConnected)
    ));

    link.connect().await.unwrap();
    assert_eq!(link.connect_count(), 2);
}

#[tokio::test]
async fn scripted_link_connect_failures() {
    let link = ScriptedLink::new("scripted");
    link.fail_next_connects(2);
    assert!(link.connect().await.is_err());
    assert!(link.connect().await.is_err());
    assert!(link.connect().await.is_ok());
    assert_eq!(link.connect_count(), 1);
}

#[tokio::test]
async fn scripted_link_reports_visible_nodes_sorted() {
    let link = ScriptedLink::new("scripted");
    link.set_visible_nodes([
        (NodeId::new(9), NodeUpdate::default()),
        (
            NodeId::new(3),
            NodeUpdate {
                short_name: Some("C".into()),
                ..Default::default()
            },
        ),
    ]);
    let nodes = link.visible_nodes();
    assert_eq!(nodes[0].0, NodeId::new(3));
    assert_eq!(nodes[1].0, NodeId::new(9));
}
