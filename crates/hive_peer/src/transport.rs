//! The pluggable transport capability.
//!
//! Everything below the peer layer (dialing, listening, encryption, stream
//! multiplexing, pubsub routing, NAT traversal) is provided by an
//! implementation of [`Transport`]. The peer layer only observes
//! [`TransportEvent`]s and issues requests back through the trait.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;

use crate::address::Multiaddr;
use crate::error::PeerError;
use crate::identity::PeerId;

/// Transport-assigned connection identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ConnectionStatus {
    Open,
    Closing,
    Closed,
}

/// Snapshot of a live transport session. Owned by the transport.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub remote_peer: PeerId,
    pub remote_addr: Multiaddr,
    pub direction: Direction,
    pub status: ConnectionStatus,
    /// Protocols of the streams currently open on this connection.
    pub streams: Vec<String>,
    pub opened_at: DateTime<Utc>,
}

impl Connection {
    pub fn has_stream(&self, protocol: &str) -> bool {
        self.streams.iter().any(|p| p == protocol)
    }
}

/// A peer found by a discovery mechanism, with every address it advertised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredPeer {
    pub id: PeerId,
    pub multiaddrs: Vec<Multiaddr>,
}

/// A message received on a pubsub topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PubSubMessage {
    Signed {
        from: PeerId,
        topic: String,
        data: Vec<u8>,
        sequence_number: u64,
    },
    Unsigned {
        topic: String,
        data: Vec<u8>,
    },
}

impl PubSubMessage {
    pub fn topic(&self) -> &str {
        match self {
            Self::Signed { topic, .. } | Self::Unsigned { topic, .. } => topic,
        }
    }
}

/// Pubsub router flavour run by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PubSubKind {
    Floodsub,
    #[default]
    Gossipsub,
}

/// A negotiated duplex byte stream.
pub trait StreamIo: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> StreamIo for T {}

pub type ProtocolStream = Box<dyn StreamIo>;

/// Notifications from the transport, delivered in order on one channel.
pub enum TransportEvent {
    Discovery(DiscoveredPeer),
    Connect(Connection),
    /// Emitted once per closed connection.
    Disconnect(Connection),
    ProtocolsChanged {
        peer: PeerId,
        protocols: Vec<String>,
    },
    AddressesChanged {
        peer: PeerId,
        multiaddrs: Vec<Multiaddr>,
    },
    /// The remote opened a stream for a protocol we handle.
    InboundStream {
        connection: Connection,
        protocol: String,
        stream: ProtocolStream,
    },
    PubSub(PubSubMessage),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Discovery(peer) => f.debug_tuple("Discovery").field(peer).finish(),
            Self::Connect(conn) => f.debug_tuple("Connect").field(&conn.id).finish(),
            Self::Disconnect(conn) => f.debug_tuple("Disconnect").field(&conn.id).finish(),
            Self::ProtocolsChanged { peer, protocols } => f
                .debug_struct("ProtocolsChanged")
                .field("peer", peer)
                .field("protocols", protocols)
                .finish(),
            Self::AddressesChanged { peer, multiaddrs } => f
                .debug_struct("AddressesChanged")
                .field("peer", peer)
                .field("multiaddrs", multiaddrs)
                .finish(),
            Self::InboundStream {
                connection,
                protocol,
                ..
            } => f
                .debug_struct("InboundStream")
                .field("connection", &connection.id)
                .field("protocol", protocol)
                .finish_non_exhaustive(),
            Self::PubSub(msg) => f.debug_tuple("PubSub").field(&msg.topic()).finish(),
        }
    }
}

/// Dial, listen, stream and pubsub capability consumed by the peer layer.
#[async_trait]
pub trait Transport: Send + Sync {
    fn local_peer_id(&self) -> PeerId;

    fn listen_addrs(&self) -> Vec<Multiaddr>;

    fn pubsub_kind(&self) -> PubSubKind;

    /// Hand out the event receiver. Returns `None` after the first call.
    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>>;

    async fn dial(&self, addr: &Multiaddr) -> Result<Connection, PeerError>;

    /// Dial a known peer on all of its addresses; resolves to one connection.
    async fn dial_peer(&self, peer: &PeerId) -> Result<Connection, PeerError>;

    /// Open connections, optionally only those to `peer`.
    fn connections(&self, peer: Option<&PeerId>) -> Vec<Connection>;

    /// Peers with at least one open connection.
    fn peers(&self) -> Vec<PeerId>;

    async fn close_connection(&self, id: &ConnectionId) -> Result<(), PeerError>;

    /// Close every connection to `peer`.
    async fn hang_up(&self, peer: &PeerId) -> Result<(), PeerError>;

    /// Round-trip time of one ping.
    async fn ping(&self, peer: &PeerId) -> Result<Duration, PeerError>;

    /// Protocols the remote peer advertises.
    fn protocols(&self, peer: &PeerId) -> Vec<String>;

    async fn handle(&self, protocol: &str) -> Result<(), PeerError>;

    async fn unhandle(&self, protocol: &str) -> Result<(), PeerError>;

    async fn open_stream(
        &self,
        connection: &ConnectionId,
        protocol: &str,
    ) -> Result<ProtocolStream, PeerError>;

    async fn subscribe(&self, topic: &str) -> Result<(), PeerError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), PeerError>;

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PeerError>;

    /// Tag a peer for the connection manager. `Ok(false)` if already tagged.
    async fn tag_peer(&self, peer: &PeerId, tag: &str, value: u32) -> Result<bool, PeerError>;
}
