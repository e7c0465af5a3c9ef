//! Hive Peer: relay-assisted peer-to-peer connectivity.
//!
//! This crate provides the peer layer of a distributed application: nodes
//! find each other through a relay, connect directly when NAT allows and
//! through a relayed circuit otherwise, exchange messages on one protocol
//! stream per peer and on pubsub topics, and watch every connection with an
//! application-level heartbeat.
//!
//! # Architecture
//!
//! - **Transport**: a pluggable [`Transport`] provides dialing, streams and
//!   pubsub. [`memory::MemoryNetwork`] is an in-process implementation.
//! - **Relay**: the primary relay is dialed at init and redialed whenever it
//!   drops.
//! - **Admission**: connection caps and deduplication of redundant
//!   connections, settled by comparing peer ids.
//! - **Streams**: length-prefixed JSON frames on `/chat/1.0.0`.
//! - **Pubsub**: per-topic handler lists plus the debug-info topic.
//! - **Heartbeat**: periodic pings; a peer that stops answering is hung up.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use hive_peer::{Peer, PeerConfig, Transport};
//! use hive_peer::memory::MemoryNetwork;
//!
//! # async fn example() -> Result<(), hive_peer::PeerError> {
//! let network = MemoryNetwork::new();
//! let relay = network.add_relay("relay-r");
//! let transport = network.add_peer("peer-a");
//!
//! let config = PeerConfig::new(relay.listen_addrs()[0].to_string());
//! let mut peer = Peer::new(config, transport)?;
//! peer.init().await?;
//! let _chat = peer
//!     .subscribe_topic("chat", |from, msg| println!("{from}: {msg}"))
//!     .await?;
//! peer.flood_message("chat", "hello").await?;
//! peer.close().await;
//! # Ok(())
//! # }
//! ```

pub mod address;
pub mod admission;
pub mod config;
pub mod debug_info;
pub mod error;
pub mod heartbeat;
pub mod identity;
pub mod logging;
pub mod memory;
pub mod metrics;
pub mod peer;
pub mod pseudonym;
pub mod pubsub;
pub mod relay;
pub mod relay_node;
pub mod router;
pub mod stream;
pub mod transport;

// ── Re-exports for convenience ──────────────────────────────────────────

pub use address::{ConnectionType, Multiaddr, MultiaddrExt};
pub use config::{PeerConfig, RelayNodeConfig};
pub use debug_info::{DebugInfo, DebugMsg, DebugPeerInfo, DebugRelayInfo};
pub use error::PeerError;
pub use identity::{PeerId, PeerIdFile};
pub use peer::{Peer, PeerEvent};
pub use relay_node::RelayNode;
pub use router::Subscription;
pub use transport::{Connection, Transport, TransportEvent};
