//! Wire schema of the debug-info topic.
//!
//! A node that receives `{"type":"Request"}` floods back
//! `{"type":"Response","dst":<requester>,"peerInfo":{...}}` on the same topic.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::address::{ConnectionType, Multiaddr, MultiaddrExt};
use crate::identity::PeerId;
use crate::transport::{Connection, Direction};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SelfInfo {
    pub peer_id: String,
    pub multiaddrs: Vec<String>,
}

impl SelfInfo {
    pub fn new(peer_id: &PeerId, multiaddrs: &[Multiaddr]) -> Self {
        Self {
            peer_id: peer_id.to_string(),
            multiaddrs: multiaddrs.iter().map(ToString::to_string).collect(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerSelfInfo {
    #[serde(flatten)]
    pub self_info: SelfInfo,
    pub primary_relay_multiaddr: String,
    pub primary_relay_peer_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub id: String,
    pub peer_id: String,
    pub multiaddr: String,
    pub direction: Direction,
    pub status: String,
    /// Round-trip times in milliseconds, newest first.
    pub latency: Vec<u64>,
    #[serde(rename = "type")]
    pub connection_type: ConnectionType,
}

impl ConnectionInfo {
    pub fn new(connection: &Connection, latency: Vec<u64>) -> Self {
        Self {
            id: connection.id.to_string(),
            peer_id: connection.remote_peer.to_string(),
            multiaddr: connection.remote_addr.to_string(),
            direction: connection.direction,
            status: format!("{:?}", connection.status).to_uppercase(),
            latency,
            connection_type: connection.remote_addr.connection_type(),
        }
    }
}

/// Role of the remote end of a connection, as seen by a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeType {
    #[serde(rename = "Relay(Primary)")]
    RelayPrimary,
    #[serde(rename = "Relay(Secondary)")]
    RelaySecondary,
    Peer,
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RelayPrimary => write!(f, "Relay(Primary)"),
            Self::RelaySecondary => write!(f, "Relay(Secondary)"),
            Self::Peer => write!(f, "Peer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PeerConnectionInfo {
    #[serde(flatten)]
    pub connection: ConnectionInfo,
    pub node_type: NodeType,
    pub is_peer_relay: bool,
    pub is_peer_relay_primary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hop_relay_peer_id: Option<String>,
}

impl PeerConnectionInfo {
    /// Classify `connection` relative to the primary relay address.
    pub fn new(connection: &Connection, latency: Vec<u64>, primary_relay: &Multiaddr) -> Self {
        let addr = &connection.remote_addr;
        let is_peer_relay = addr.is_relay_peer_addr();
        let is_peer_relay_primary = addr == primary_relay;
        let node_type = match (is_peer_relay, is_peer_relay_primary) {
            (true, true) => NodeType::RelayPrimary,
            (true, false) => NodeType::RelaySecondary,
            _ => NodeType::Peer,
        };
        let hop_relay_peer_id = match addr.connection_type() {
            ConnectionType::Relayed => addr.hop_relay_peer_id().map(|id| id.to_string()),
            ConnectionType::Direct => None,
        };

        Self {
            connection: ConnectionInfo::new(connection, latency),
            node_type,
            is_peer_relay,
            is_peer_relay_primary,
            hop_relay_peer_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugPeerInfo {
    pub self_info: PeerSelfInfo,
    pub conn_info: Vec<PeerConnectionInfo>,
    pub metrics: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugRelayInfo {
    pub self_info: SelfInfo,
    pub conn_info: Vec<ConnectionInfo>,
    pub metrics: BTreeMap<String, u64>,
}

/// Snapshot carried by a debug `Response`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DebugInfo {
    Peer(DebugPeerInfo),
    Relay(DebugRelayInfo),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum DebugMsg {
    Request,
    #[serde(rename_all = "camelCase")]
    Response { dst: String, peer_info: DebugInfo },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{ConnectionId, ConnectionStatus};
    use chrono::Utc;
    use serde_json::json;

    const RELAY_ID: &str = "12D3KooWS5xJw4cHLzWkFHichaPPtsfhitgaR6cjxwr4mzssv481";
    const PEER_B: &str = "12D3KooWDwoZsUupWJSqJVV75axnChkY8CzEakoLjRbRBi6LiAQF";
    const RELAY_S: &str = "12D3KooWHo4b9dp66i6k1VehFnZbwMoVTueVnBMkoUVKnXXUse8G";
    const PEER_A: &str = "12D3KooWKSswjQQULkhymWwUDtgDESn8AQtrqnqYDcFKHwMSiE5j";

    fn relay() -> String {
        format!("/ip4/127.0.0.1/tcp/9090/ws/p2p/{RELAY_ID}")
    }

    fn conn(addr: &str, peer: &str) -> Connection {
        Connection {
            id: ConnectionId::new("c1"),
            remote_peer: peer.parse().unwrap(),
            remote_addr: addr.parse().unwrap(),
            direction: Direction::Outbound,
            status: ConnectionStatus::Open,
            streams: Vec::new(),
            opened_at: Utc::now(),
        }
    }

    #[test]
    fn test_request_wire_format() {
        assert_eq!(serde_json::to_value(DebugMsg::Request).unwrap(), json!({ "type": "Request" }));
        let parsed: DebugMsg = serde_json::from_value(json!({ "type": "Request" })).unwrap();
        assert_eq!(parsed, DebugMsg::Request);
    }

    #[test]
    fn test_primary_relay_connection_info() {
        let primary: Multiaddr = relay().parse().unwrap();
        let info = PeerConnectionInfo::new(&conn(&relay(), RELAY_ID), vec![12, 10], &primary);
        assert_eq!(info.node_type, NodeType::RelayPrimary);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["id"], "c1");
        assert_eq!(json["peerId"], RELAY_ID);
        assert_eq!(json["direction"], "outbound");
        assert_eq!(json["status"], "OPEN");
        assert_eq!(json["type"], "direct");
        assert_eq!(json["latency"], json!([12, 10]));
        assert_eq!(json["nodeType"], "Relay(Primary)");
        assert_eq!(json["isPeerRelay"], true);
        assert_eq!(json["isPeerRelayPrimary"], true);
        assert!(json.get("hopRelayPeerId").is_none());
    }

    #[test]
    fn test_relayed_peer_connection_info() {
        let primary: Multiaddr = relay().parse().unwrap();
        let circuit = format!("{}/p2p-circuit/p2p/{PEER_B}", relay());
        let info = PeerConnectionInfo::new(&conn(&circuit, PEER_B), Vec::new(), &primary);

        assert_eq!(info.node_type, NodeType::Peer);
        assert!(!info.is_peer_relay);
        assert_eq!(info.connection.connection_type, ConnectionType::Relayed);
        assert_eq!(info.hop_relay_peer_id.as_deref(), Some(RELAY_ID));

        let secondary = conn(&format!("/ip4/10.0.0.5/tcp/9090/ws/p2p/{RELAY_S}"), RELAY_S);
        let info = PeerConnectionInfo::new(&secondary, Vec::new(), &primary);
        assert_eq!(info.node_type, NodeType::RelaySecondary);
    }

    #[test]
    fn test_response_round_trip() {
        let primary: Multiaddr = relay().parse().unwrap();
        let response = DebugMsg::Response {
            dst: PEER_A.into(),
            peer_info: DebugInfo::Peer(DebugPeerInfo {
                self_info: PeerSelfInfo {
                    self_info: SelfInfo::new(&PEER_B.parse().unwrap(), &[]),
                    primary_relay_multiaddr: relay(),
                    primary_relay_peer_id: Some(RELAY_ID.into()),
                },
                conn_info: vec![PeerConnectionInfo::new(&conn(&relay(), RELAY_ID), vec![3], &primary)],
                metrics: BTreeMap::from([("messages_sent_total".to_string(), 4)]),
            }),
        };

        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["type"], "Response");
        assert_eq!(json["dst"], PEER_A);
        assert_eq!(json["peerInfo"]["selfInfo"]["peerId"], PEER_B);
        assert_eq!(json["peerInfo"]["selfInfo"]["primaryRelayPeerId"], RELAY_ID);
        assert_eq!(json["peerInfo"]["metrics"]["messages_sent_total"], 4);

        let back: DebugMsg = serde_json::from_value(json).unwrap();
        assert_eq!(back, response);
    }
}
