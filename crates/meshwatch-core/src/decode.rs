//! Decoding of `FromRadio` frame payloads into relay events.

use chrono::Utc;
use prost::Message;

use crate::constants::{POSITION_SCALE, hardware_model_label};
use crate::error::DecodeError;
use crate::event::{
    DeviceMetrics, EnvironmentMetrics, MeshEvent, NodeUpdate, PacketMeta, Position,
    SignalQuality,
};
use crate::proto::{self, PortNum, from_radio, mesh_packet, telemetry};
use crate::types::NodeId;

/// What the radio sent in one frame.
#[derive(Debug, Clone, PartialEq)]
pub enum RadioMessage {
    /// A mesh packet, classified into an event.
    Packet(MeshEvent),
    /// The number of the locally attached node.
    MyInfo(NodeId),
    /// One entry of the device's node database.
    NodeInfo(NodeId, NodeUpdate),
    /// End of the configuration dump for the given request id.
    ConfigComplete(u32),
    /// The device restarted; the session is gone.
    Rebooted,
    /// A variant the relay does not use.
    Other,
}

/// Decode one `FromRadio` payload.
pub fn decode_from_radio(payload: &[u8]) -> Result<RadioMessage, DecodeError> {
    let msg = proto::FromRadio::decode(payload)
        .map_err(|e| DecodeError::protobuf("FromRadio", e))?;

    match msg.payload_variant {
        Some(from_radio::PayloadVariant::Packet(packet)) => {
            decode_packet(packet).map(RadioMessage::Packet)
        }
        Some(from_radio::PayloadVariant::MyInfo(info)) => {
            Ok(RadioMessage::MyInfo(NodeId::new(info.my_node_num)))
        }
        Some(from_radio::PayloadVariant::NodeInfo(info)) => {
            Ok(RadioMessage::NodeInfo(NodeId::new(info.num), node_db_update(&info)))
        }
        Some(from_radio::PayloadVariant::ConfigCompleteId(id)) => {
            Ok(RadioMessage::ConfigComplete(id))
        }
        Some(from_radio::PayloadVariant::Rebooted(_)) => Ok(RadioMessage::Rebooted),
        None => Ok(RadioMessage::Other),
    }
}

/// Classify a mesh packet by its application port.
pub fn decode_packet(packet: proto::MeshPacket) -> Result<MeshEvent, DecodeError> {
    if packet.from == 0 {
        return Err(DecodeError::MissingSender);
    }
    let meta = packet_meta(&packet);

    let data = match packet.payload_variant {
        Some(mesh_packet::PayloadVariant::Decoded(data)) => data,
        Some(mesh_packet::PayloadVariant::Encrypted(bytes)) => {
            return Ok(MeshEvent::Packet {
                meta,
                port: "ENCRYPTED".to_string(),
                payload_len: bytes.len(),
            });
        }
        None => {
            return Ok(MeshEvent::Packet {
                meta,
                port: "UNKNOWN".to_string(),
                payload_len: 0,
            });
        }
    };

    let Ok(port) = PortNum::try_from(data.portnum) else {
        return Ok(MeshEvent::Packet {
            meta,
            port: format!("PORT_{}", data.portnum),
            payload_len: data.payload.len(),
        });
    };

    match port {
        PortNum::TextMessageApp => {
            let text = String::from_utf8(data.payload).map_err(|_| DecodeError::InvalidText)?;
            Ok(MeshEvent::TextMessage { meta, text })
        }
        PortNum::NodeinfoApp => {
            let user = proto::User::decode(data.payload.as_slice())
                .map_err(|e| DecodeError::protobuf("User", e))?;
            Ok(MeshEvent::NodeInfo {
                meta,
                update: user_update(&user),
            })
        }
        PortNum::TelemetryApp => {
            let telemetry = proto::Telemetry::decode(data.payload.as_slice())
                .map_err(|e| DecodeError::protobuf("Telemetry", e))?;
            match telemetry.variant {
                Some(telemetry::Variant::DeviceMetrics(m)) => Ok(MeshEvent::Telemetry {
                    meta,
                    device: Some(device_metrics(&m)),
                    environment: None,
                }),
                Some(telemetry::Variant::EnvironmentMetrics(m)) => Ok(MeshEvent::Telemetry {
                    meta,
                    device: None,
                    environment: Some(EnvironmentMetrics {
                        temperature: m.temperature,
                        relative_humidity: m.relative_humidity,
                        barometric_pressure: m.barometric_pressure,
                    }),
                }),
                None => Err(DecodeError::MissingField {
                    port: "TELEMETRY_APP",
                    field: "variant",
                }),
            }
        }
        PortNum::PositionApp => {
            let pos = proto::Position::decode(data.payload.as_slice())
                .map_err(|e| DecodeError::protobuf("Position", e))?;
            let position = scale_position(&pos).ok_or(DecodeError::MissingField {
                port: "POSITION_APP",
                field: "latitude_i/longitude_i",
            })?;
            Ok(MeshEvent::Position { meta, position })
        }
        other => Ok(MeshEvent::Packet {
            meta,
            port: other.as_str_name().to_string(),
            payload_len: data.payload.len(),
        }),
    }
}

fn packet_meta(packet: &proto::MeshPacket) -> PacketMeta {
    let to = NodeId::new(packet.to);
    PacketMeta {
        from: NodeId::new(packet.from),
        to: (!to.is_broadcast() && packet.to != 0).then_some(to),
        channel: packet.channel,
        packet_id: packet.id,
        rx_time: (packet.rx_time != 0).then_some(packet.rx_time),
        hop_limit: packet.hop_limit,
        hop_start: packet.hop_start,
        want_ack: packet.want_ack,
        via_mqtt: packet.via_mqtt,
        signal: SignalQuality {
            // Zero means the radio did not measure it.
            rssi: (packet.rx_rssi != 0).then_some(packet.rx_rssi),
            snr: (packet.rx_snr != 0.0).then_some(packet.rx_snr),
        },
        received_at: Utc::now(),
    }
}

fn user_update(user: &proto::User) -> NodeUpdate {
    let text = |s: &str| (!s.trim().is_empty()).then(|| s.to_string());
    NodeUpdate {
        short_name: text(&user.short_name),
        long_name: text(&user.long_name),
        // Zero is the proto3 default for an omitted model.
        hw_model: (user.hw_model != 0).then(|| hardware_model_label(user.hw_model)),
        ..NodeUpdate::default()
    }
}

fn device_metrics(m: &proto::DeviceMetrics) -> DeviceMetrics {
    DeviceMetrics {
        battery_level: m.battery_level,
        voltage: m.voltage,
        channel_utilization: m.channel_utilization,
        air_util_tx: m.air_util_tx,
        uptime_seconds: m.uptime_seconds,
    }
}

fn scale_position(pos: &proto::Position) -> Option<Position> {
    let (lat, lon) = (pos.latitude_i?, pos.longitude_i?);
    Some(Position {
        latitude: f64::from(lat) * POSITION_SCALE,
        longitude: f64::from(lon) * POSITION_SCALE,
        altitude: pos.altitude,
        time: (pos.time != 0).then_some(pos.time),
    })
}

/// Registry update from a node database entry sent during the config dump.
fn node_db_update(info: &proto::NodeInfo) -> NodeUpdate {
    let mut update = info.user.as_ref().map(user_update).unwrap_or_default();
    if let Some(metrics) = &info.device_metrics {
        update = update.with_device_metrics(&device_metrics(metrics));
    }
    if let Some(pos) = &info.position {
        update.position = scale_position(pos);
    }
    if info.snr != 0.0 {
        update.snr = Some(info.snr);
    }
    if info.last_heard != 0 {
        update.last_heard = chrono::DateTime::from_timestamp(i64::from(info.last_heard), 0);
    }
    update
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::EventKind;

    fn packet(from: u32, port: PortNum, payload: Vec<u8>) -> proto::MeshPacket {
        proto::MeshPacket {
            from,
            to: crate::constants::BROADCAST_NUM,
            rx_rssi: -80,
            rx_snr: 5.25,
            hop_limit: 2,
            hop_start: 3,
            payload_variant: Some(mesh_packet::PayloadVariant::Decoded(proto::Data {
                portnum: port as i32,
                payload,
                want_response: false,
            })),
            ..Default::default()
        }
    }

    fn from_radio(packet: proto::MeshPacket) -> Vec<u8> {
        proto::FromRadio {
            id: 1,
            payload_variant: Some(from_radio::PayloadVariant::Packet(packet)),
        }
        .encode_to_vec()
    }

    #[test]
    fn decodes_nodeinfo() {
        let user = proto::User {
            id: "!abcd1234".into(),
            long_name: "Alpha Base".into(),
            short_name: "ABCD".into(),
            hw_model: 43,
            is_licensed: false,
        };
        let bytes = from_radio(packet(0xabcd1234, PortNum::NodeinfoApp, user.encode_to_vec()));
        let RadioMessage::Packet(event) = decode_from_radio(&bytes).unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(event.kind(), EventKind::NodeInfo);
        assert_eq!(event.source().to_string(), "!abcd1234");
        let update = event.node_update();
        assert_eq!(update.short_name.as_deref(), Some("ABCD"));
        assert_eq!(update.hw_model.as_deref(), Some("HELTEC_V3"));
        assert_eq!(event.meta().to, None);
        assert_eq!(event.meta().signal.rssi, Some(-80));
    }

    #[test]
    fn nodeinfo_without_model_keeps_known_model() {
        let decode_user = |user: proto::User| {
            let bytes = from_radio(packet(0xabcd1234, PortNum::NodeinfoApp, user.encode_to_vec()));
            let RadioMessage::Packet(event) = decode_from_radio(&bytes).unwrap() else {
                panic!("expected packet");
            };
            event.node_update()
        };
        let mut known = decode_user(proto::User {
            hw_model: 43,
            ..proto::User::default()
        });
        let later = decode_user(proto::User {
            short_name: "AB".into(),
            ..proto::User::default()
        });
        assert_eq!(later.hw_model, None);
        known.merge(later);
        assert_eq!(known.hw_model.as_deref(), Some("HELTEC_V3"));
        assert_eq!(known.short_name.as_deref(), Some("AB"));
    }

    #[test]
    fn decodes_device_telemetry() {
        let t = proto::Telemetry {
            time: 0,
            variant: Some(telemetry::Variant::DeviceMetrics(proto::DeviceMetrics {
                battery_level: Some(72),
                voltage: Some(3.9),
                ..Default::default()
            })),
        };
        let bytes = from_radio(packet(0xabcd1234, PortNum::TelemetryApp, t.encode_to_vec()));
        let RadioMessage::Packet(MeshEvent::Telemetry { device, .. }) =
            decode_from_radio(&bytes).unwrap()
        else {
            panic!("expected telemetry");
        };
        assert_eq!(device.unwrap().battery_level, Some(72));
    }

    #[test]
    fn telemetry_without_variant_is_malformed() {
        let t = proto::Telemetry {
            time: 5,
            variant: None,
        };
        let bytes = from_radio(packet(1, PortNum::TelemetryApp, t.encode_to_vec()));
        assert!(matches!(
            decode_from_radio(&bytes),
            Err(DecodeError::MissingField { .. })
        ));
    }

    #[test]
    fn decodes_text_and_rejects_bad_utf8() {
        let bytes = from_radio(packet(7, PortNum::TextMessageApp, b"hello mesh".to_vec()));
        let RadioMessage::Packet(MeshEvent::TextMessage { text, .. }) =
            decode_from_radio(&bytes).unwrap()
        else {
            panic!("expected text");
        };
        assert_eq!(text, "hello mesh");

        let bytes = from_radio(packet(7, PortNum::TextMessageApp, vec![0xff, 0xfe]));
        assert!(matches!(
            decode_from_radio(&bytes),
            Err(DecodeError::InvalidText)
        ));
    }

    #[test]
    fn decodes_position_scaled() {
        let pos = proto::Position {
            latitude_i: Some(525_200_000),
            longitude_i: Some(134_050_000),
            altitude: Some(40),
            time: 0,
        };
        let bytes = from_radio(packet(9, PortNum::PositionApp, pos.encode_to_vec()));
        let RadioMessage::Packet(MeshEvent::Position { position, .. }) =
            decode_from_radio(&bytes).unwrap()
        else {
            panic!("expected position");
        };
        assert!((position.latitude - 52.52).abs() < 1e-6);
        assert!((position.longitude - 13.405).abs() < 1e-6);
        assert_eq!(position.altitude, Some(40));
    }

    #[test]
    fn other_ports_become_packets() {
        let bytes = from_radio(packet(9, PortNum::RoutingApp, vec![1, 2, 3]));
        let RadioMessage::Packet(MeshEvent::Packet {
            port, payload_len, ..
        }) = decode_from_radio(&bytes).unwrap()
        else {
            panic!("expected packet");
        };
        assert_eq!(port, "ROUTING_APP");
        assert_eq!(payload_len, 3);
    }

    #[test]
    fn encrypted_packets_are_forwarded() {
        let p = proto::MeshPacket {
            from: 9,
            to: 10,
            payload_variant: Some(mesh_packet::PayloadVariant::Encrypted(vec![0; 16])),
            ..Default::default()
        };
        let RadioMessage::Packet(event) = decode_from_radio(&from_radio(p)).unwrap() else {
            panic!("expected packet");
        };
        assert_eq!(event.kind(), EventKind::Packet);
        assert_eq!(event.meta().to, Some(NodeId::new(10)));
    }

    #[test]
    fn missing_sender_is_malformed() {
        let bytes = from_radio(packet(0, PortNum::TextMessageApp, b"x".to_vec()));
        assert!(matches!(
            decode_from_radio(&bytes),
            Err(DecodeError::MissingSender)
        ));
    }

    #[test]
    fn garbage_is_protobuf_error() {
        assert!(matches!(
            decode_from_radio(&[0xff, 0xff, 0xff]),
            Err(DecodeError::Protobuf { .. })
        ));
    }

    #[test]
    fn control_messages() {
        let complete = proto::FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::ConfigCompleteId(42)),
        };
        assert_eq!(
            decode_from_radio(&complete.encode_to_vec()).unwrap(),
            RadioMessage::ConfigComplete(42)
        );

        let my_info = proto::FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::MyInfo(proto::MyNodeInfo {
                my_node_num: 0x1234,
            })),
        };
        assert_eq!(
            decode_from_radio(&my_info.encode_to_vec()).unwrap(),
            RadioMessage::MyInfo(NodeId::new(0x1234))
        );

        let node = proto::FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::NodeInfo(proto::NodeInfo {
                num: 0xabcd1234,
                user: Some(proto::User {
                    short_name: "ABCD".into(),
                    ..Default::default()
                }),
                device_metrics: Some(proto::DeviceMetrics {
                    battery_level: Some(88),
                    ..Default::default()
                }),
                ..Default::default()
            })),
        };
        let RadioMessage::NodeInfo(id, update) =
            decode_from_radio(&node.encode_to_vec()).unwrap()
        else {
            panic!("expected node info");
        };
        assert_eq!(id, NodeId::new(0xabcd1234));
        assert_eq!(update.short_name.as_deref(), Some("ABCD"));
        assert_eq!(update.battery_level, Some(88));

        let rebooted = proto::FromRadio {
            id: 0,
            payload_variant: Some(from_radio::PayloadVariant::Rebooted(true)),
        };
        assert_eq!(
            decode_from_radio(&rebooted.encode_to_vec()).unwrap(),
            RadioMessage::Rebooted
        );
    }
}
