//! Configuration for peers and relay nodes.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::address::{Multiaddr, MultiaddrExt};
use crate::error::PeerError;
use crate::transport::PubSubKind;

/// Protocol negotiated for the application message stream.
pub const CHAT_PROTOCOL: &str = "/chat/1.0.0";

/// Reserved pubsub topic for debug-info requests and responses.
pub const DEBUG_INFO_TOPIC: &str = "debug-info";

/// Tag placed on the primary relay so the transport prunes it last.
pub const RELAY_TAG: (&str, u32) = ("laconic:relay-primary", 100);

/// Number of latency samples kept per peer.
pub const LATENCY_HISTORY_LEN: usize = 5;

/// Default bounded retry count for relay nodes dialing their relay peers.
pub const RELAY_DEFAULT_MAX_DIAL_RETRY: u32 = 5;

/// Configuration for a [`Peer`](crate::peer::Peer).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PeerConfig {
    /// Multiaddr of the primary relay node; must end in `/p2p/<peer-id>`.
    pub relay_multiaddr: String,

    /// Addresses (or address prefixes) to refuse.
    pub deny_multiaddrs: Vec<String>,

    /// Optional JSON file holding an array of additional denied addresses.
    pub deny_list_file: Option<PathBuf>,

    /// Maximum number of simultaneous connections.
    pub max_connections: usize,

    /// Desired minimum number of connections.
    pub min_connections: usize,

    /// Maximum number of connections to relay nodes.
    pub max_relay_connections: usize,

    /// Upper bound for a single dial attempt.
    #[serde(with = "duration_ms")]
    pub dial_timeout: Duration,

    /// Fixed backoff between primary relay dial attempts.
    #[serde(with = "duration_ms")]
    pub relay_redial_interval: Duration,

    /// Retry budget for the initial relay dial. `None` retries forever.
    pub relay_max_dial_retry: Option<u32>,

    /// Interval between heartbeat checks of a connected peer.
    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,

    /// Timeout for one ping; must not exceed `ping_interval`.
    #[serde(with = "duration_ms")]
    pub ping_timeout: Duration,

    /// Pubsub implementation the transport is expected to run.
    pub pubsub: PubSubKind,

    /// Answer and allow debug-info requests.
    pub enable_debug_info: bool,
}

impl Default for PeerConfig {
    fn default() -> Self {
        Self {
            relay_multiaddr: String::new(),
            deny_multiaddrs: Vec::new(),
            deny_list_file: None,
            max_connections: 10,
            min_connections: 0,
            max_relay_connections: 2,
            dial_timeout: Duration::from_secs(10),
            relay_redial_interval: Duration::from_secs(5),
            relay_max_dial_retry: None,
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            pubsub: PubSubKind::Gossipsub,
            enable_debug_info: false,
        }
    }
}

impl PeerConfig {
    /// Defaults with the given primary relay.
    pub fn new(relay_multiaddr: impl Into<String>) -> Self {
        Self {
            relay_multiaddr: relay_multiaddr.into(),
            ..Self::default()
        }
    }

    /// Parse the primary relay address, requiring an embedded peer id.
    pub fn relay_multiaddr(&self) -> Result<Multiaddr, PeerError> {
        let addr: Multiaddr = self.relay_multiaddr.parse()?;
        if addr.target_peer_id().is_none() {
            return Err(PeerError::InvalidConfig(format!(
                "relay multiaddr {addr} has no peer id"
            )));
        }
        Ok(addr)
    }

    pub fn validate(&self) -> Result<(), PeerError> {
        self.relay_multiaddr()?;
        validate_ping(self.ping_interval, self.ping_timeout)?;
        if self.max_relay_connections == 0 {
            return Err(PeerError::InvalidConfig(
                "max_relay_connections must be at least 1".into(),
            ));
        }
        if self.min_connections > self.max_connections {
            return Err(PeerError::InvalidConfig(format!(
                "min_connections ({}) exceeds max_connections ({})",
                self.min_connections, self.max_connections
            )));
        }
        Ok(())
    }

    /// Inline deny entries plus the entries of `deny_list_file`, parsed.
    ///
    /// Unparseable entries are skipped with a warning; an unreadable file is
    /// an error.
    pub fn resolved_deny_multiaddrs(&self) -> Result<Vec<Multiaddr>, PeerError> {
        let mut entries = self.deny_multiaddrs.clone();
        if let Some(path) = &self.deny_list_file {
            entries.extend(load_multiaddr_list(path)?);
        }
        Ok(parse_multiaddrs("deny-list", &entries))
    }

    /// Save the config to a JSON file.
    pub fn save_to_file(&self, path: &Path) -> Result<(), PeerError> {
        save_json(self, path)
    }

    /// Load a config file. Missing fields take their defaults.
    pub fn load_from_file(path: &Path) -> Result<Self, PeerError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

/// Configuration for a [`RelayNode`](crate::relay_node::RelayNode).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayNodeConfig {
    /// Other relay nodes to keep a connection with.
    pub relay_peers: Vec<String>,

    /// Addresses (or prefixes) never dialed.
    pub deny_multiaddrs: Vec<String>,

    #[serde(with = "duration_ms")]
    pub dial_timeout: Duration,

    #[serde(with = "duration_ms")]
    pub ping_interval: Duration,

    #[serde(with = "duration_ms")]
    pub ping_timeout: Duration,

    /// Backoff between relay peer dial attempts.
    #[serde(with = "duration_ms")]
    pub redial_interval: Duration,

    /// Bounded retry budget per relay peer dial.
    pub max_dial_retry: u32,

    pub pubsub: PubSubKind,

    pub enable_debug_info: bool,
}

impl Default for RelayNodeConfig {
    fn default() -> Self {
        Self {
            relay_peers: Vec::new(),
            deny_multiaddrs: Vec::new(),
            dial_timeout: Duration::from_secs(10),
            ping_interval: Duration::from_secs(10),
            ping_timeout: Duration::from_secs(5),
            redial_interval: Duration::from_secs(5),
            max_dial_retry: RELAY_DEFAULT_MAX_DIAL_RETRY,
            pubsub: PubSubKind::Floodsub,
            enable_debug_info: false,
        }
    }
}

impl RelayNodeConfig {
    pub fn validate(&self) -> Result<(), PeerError> {
        validate_ping(self.ping_interval, self.ping_timeout)?;
        if self.max_dial_retry == 0 {
            return Err(PeerError::InvalidConfig(
                "max_dial_retry must be at least 1".into(),
            ));
        }
        for addr in &self.relay_peers {
            let parsed: Multiaddr = addr.parse()?;
            if parsed.target_peer_id().is_none() {
                return Err(PeerError::InvalidConfig(format!(
                    "relay peer {addr} has no peer id"
                )));
            }
        }
        Ok(())
    }

    /// Replace `relay_peers` with the contents of a JSON array file.
    pub fn load_relay_peers(&mut self, path: &Path) -> Result<(), PeerError> {
        self.relay_peers = load_multiaddr_list(path)?;
        Ok(())
    }

    pub fn save_to_file(&self, path: &Path) -> Result<(), PeerError> {
        save_json(self, path)
    }

    pub fn load_from_file(path: &Path) -> Result<Self, PeerError> {
        let data = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }
}

fn validate_ping(interval: Duration, timeout: Duration) -> Result<(), PeerError> {
    if timeout.is_zero() || interval.is_zero() {
        return Err(PeerError::InvalidConfig(
            "ping interval and timeout must be non-zero".into(),
        ));
    }
    if timeout > interval {
        return Err(PeerError::InvalidConfig(format!(
            "ping_timeout ({timeout:?}) exceeds ping_interval ({interval:?})"
        )));
    }
    Ok(())
}

/// Read a JSON array of multiaddr strings.
pub fn load_multiaddr_list(path: &Path) -> Result<Vec<String>, PeerError> {
    let data = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&data)?)
}

/// Parse a list of multiaddrs, skipping unparseable `kind` entries with a
/// warning.
pub(crate) fn parse_multiaddrs(kind: &str, entries: &[String]) -> Vec<Multiaddr> {
    entries
        .iter()
        .filter_map(|entry| match entry.parse::<Multiaddr>() {
            Ok(addr) => Some(addr),
            Err(e) => {
                tracing::warn!("Ignoring {kind} entry {entry}: {e}");
                None
            }
        })
        .collect()
}

fn save_json<T: Serialize>(value: &T, path: &Path) -> Result<(), PeerError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(value)?;
    std::fs::write(path, json)?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Serde helpers
// ---------------------------------------------------------------------------

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(dur: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(dur.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ms = u64::deserialize(d)?;
        Ok(Duration::from_millis(ms))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
