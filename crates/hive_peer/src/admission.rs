//! Connection admission: caps, deduplication and protocol stream setup.
//!
//! Two peers may end up with several connections to each other (a relayed
//! circuit found through discovery plus a direct one, or both sides dialing
//! at once). Only one side acts on it: the side with the smaller peer id, or
//! any side whose remote is a relay. That side keeps a single connection,
//! preferring a direct one over a relayed circuit, and opens the chat stream.
//!
//! Connections from denied addresses are refused on arrival, whichever side
//! dialed; the primary relay is exempt from the deny list and the connection
//! cap.
//!
//! Admission never fails outward. Transport errors are logged and the peer is
//! left as it was; the next event for it retries.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, info, warn};

use crate::address::{Multiaddr, MultiaddrExt};
use crate::config::{CHAT_PROTOCOL, PeerConfig};
use crate::error::PeerError;
use crate::heartbeat::HeartbeatSupervisor;
use crate::identity::PeerId;
use crate::metrics::PeerMetrics;
use crate::pseudonym::pseudonym;
use crate::stream::ProtocolStreamManager;
use crate::transport::{Connection, ConnectionId, DiscoveredPeer, Transport};

/// Limits and addresses admission decisions are made against.
#[derive(Debug, Clone)]
pub struct AdmissionPolicy {
    pub primary_relay: Multiaddr,
    pub deny: Vec<Multiaddr>,
    pub max_connections: usize,
    pub min_connections: usize,
    pub max_relay_connections: usize,
    pub dial_timeout: Duration,
}

impl AdmissionPolicy {
    pub fn from_config(config: &PeerConfig, deny: Vec<Multiaddr>) -> Result<Self, PeerError> {
        Ok(Self {
            primary_relay: config.relay_multiaddr()?,
            deny,
            max_connections: config.max_connections,
            min_connections: config.min_connections,
            max_relay_connections: config.max_relay_connections,
            dial_timeout: config.dial_timeout,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectOutcome {
    /// The connection was kept.
    Admitted,
    /// Closed as redundant with another connection to the same peer.
    Closed,
    /// Closed because the remote is denied or a connection cap was reached.
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectOutcome {
    /// Another connection to the peer is still open.
    StillConnected,
    /// The last connection to the peer closed.
    PeerGone { primary_relay: bool },
}

pub struct ConnectionAdmission {
    local_peer: PeerId,
    policy: AdmissionPolicy,
    transport: Arc<dyn Transport>,
    streams: Arc<ProtocolStreamManager>,
    heartbeat: Arc<HeartbeatSupervisor>,
    metrics: Arc<PeerMetrics>,
    /// Open connections to relay nodes.
    relay_connections: Mutex<HashSet<ConnectionId>>,
    /// Dials started from discovery, by target peer.
    dials: Mutex<HashMap<PeerId, AbortHandle>>,
}

impl ConnectionAdmission {
    pub fn new(
        policy: AdmissionPolicy,
        transport: Arc<dyn Transport>,
        streams: Arc<ProtocolStreamManager>,
        heartbeat: Arc<HeartbeatSupervisor>,
        metrics: Arc<PeerMetrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            local_peer: transport.local_peer_id(),
            policy,
            transport,
            streams,
            heartbeat,
            metrics,
            relay_connections: Mutex::new(HashSet::new()),
            dials: Mutex::new(HashMap::new()),
        })
    }

    pub fn policy(&self) -> &AdmissionPolicy {
        &self.policy
    }

    pub fn relay_connection_count(&self) -> usize {
        self.relay_connections.lock().len()
    }

    pub fn is_primary_relay(&self, addr: &Multiaddr) -> bool {
        *addr == self.policy.primary_relay
    }

    /// Dial a newly discovered peer unless it is known, denied or over a cap.
    ///
    /// The dial runs in its own task; its handle is returned.
    pub fn handle_discovery(self: &Arc<Self>, peer: DiscoveredPeer) -> Option<JoinHandle<()>> {
        if peer.id == self.local_peer {
            return None;
        }
        // Peers are rediscovered periodically.
        if !self.transport.connections(Some(&peer.id)).is_empty() {
            return None;
        }

        let mut is_relay_peer = false;
        for addr in &peer.multiaddrs {
            if addr.is_denied(&self.policy.deny) {
                info!("Ignoring denied node with multiaddr {addr}");
                return None;
            }
            if addr.is_relay_peer_addr() {
                is_relay_peer = true;
                break;
            }
        }

        if is_relay_peer && self.relay_connection_count() >= self.policy.max_relay_connections {
            debug!(
                "Ignoring discovered relay node {} as max relay connections limit reached",
                peer.id
            );
            return None;
        }
        if self.transport.connections(None).len() >= self.policy.max_connections {
            debug!(
                "Ignoring discovered peer {} as max connections limit reached",
                peer.id
            );
            return None;
        }

        let mut dials = self.dials.lock();
        dials.retain(|_, dial| !dial.is_finished());
        if dials.contains_key(&peer.id) {
            debug!("Already dialling discovered peer {}", peer.id);
            return None;
        }

        let addrs: Vec<String> = peer.multiaddrs.iter().map(ToString::to_string).collect();
        info!(
            "Discovered peer {} ({}) with multiaddrs {addrs:?}",
            peer.id,
            pseudonym(&peer.id)
        );

        let this = Arc::clone(self);
        let target = peer.id.clone();
        let handle = tokio::spawn(async move {
            this.connect_peer(&peer.id).await;
        });
        dials.insert(target, handle.abort_handle());
        Some(handle)
    }

    /// Abort every dial still running from discovery.
    pub fn abort_dials(&self) {
        let dials: Vec<(PeerId, AbortHandle)> = self.dials.lock().drain().collect();
        for (peer, dial) in dials {
            if !dial.is_finished() {
                debug!("Aborting dial to {peer}");
                dial.abort();
            }
        }
    }

    async fn connect_peer(&self, peer: &PeerId) {
        info!("Dialling peer {peer} ({})", pseudonym(peer));
        let result = tokio::time::timeout(self.policy.dial_timeout, self.transport.dial_peer(peer))
            .await
            .unwrap_or(Err(PeerError::Timeout(self.policy.dial_timeout)));
        if let Err(e) = result {
            self.metrics.dials_failed.inc();
            warn!("Could not dial {peer} ({}): {e}", pseudonym(peer));
        }
    }

    /// Apply caps and deduplication to a new connection, then start tracking
    /// its peer.
    pub async fn handle_connect(&self, connection: &Connection) -> ConnectOutcome {
        let peer = &connection.remote_peer;
        let addr = &connection.remote_addr;
        self.metrics.connections_opened.inc();
        info!("Connected to {peer} ({}) using multiaddr {addr}", pseudonym(peer));

        let is_remote_relay = addr.is_relay_peer_addr();
        let is_primary = self.is_primary_relay(addr);

        if !is_primary && addr.is_denied(&self.policy.deny) {
            info!(
                "Closing connection to denied node {peer} ({}) with multiaddr {addr}",
                pseudonym(peer)
            );
            self.close(connection).await;
            return ConnectOutcome::Rejected;
        }

        if is_remote_relay {
            let count = {
                let mut relays = self.relay_connections.lock();
                relays.insert(connection.id.clone());
                relays.len()
            };
            self.metrics.relay_connections.set(count as u64);

            if count > self.policy.max_relay_connections && !is_primary {
                info!(
                    "Closing connection to relay {peer} ({}) as max relay connections limit reached",
                    pseudonym(peer)
                );
                self.close(connection).await;
                return ConnectOutcome::Rejected;
            }
        }

        if self.transport.connections(None).len() > self.policy.max_connections && !is_primary {
            info!(
                "Closing connection to {peer} ({}) as max connections limit reached",
                pseudonym(peer)
            );
            self.close(connection).await;
            return ConnectOutcome::Rejected;
        }

        if is_remote_relay || self.local_peer < *peer {
            let remote_connections = self.transport.connections(Some(peer));
            if !remote_connections.iter().any(|c| c.id == connection.id) {
                debug!("Connection {} to {peer} already closed", connection.id);
                return ConnectOutcome::Closed;
            }

            if remote_connections.len() > 1 {
                let others: Vec<&Connection> = remote_connections
                    .iter()
                    .filter(|c| c.id != connection.id)
                    .collect();

                if addr.is_relayed_circuit() {
                    info!(
                        "Closing new relayed connection with {peer} ({}) in favor of existing connection",
                        pseudonym(peer)
                    );
                    self.close(connection).await;
                    return ConnectOutcome::Closed;
                }

                if others.iter().any(|c| !c.remote_addr.is_relayed_circuit()) {
                    info!(
                        "Closing new connection with {peer} ({}) in favor of existing direct connection",
                        pseudonym(peer)
                    );
                    self.close(connection).await;
                    return ConnectOutcome::Closed;
                }

                info!(
                    "Closing existing relayed connections with {peer} ({}) in favor of new direct connection",
                    pseudonym(peer)
                );
                for other in others {
                    self.close(other).await;
                }
            }

            if self
                .transport
                .protocols(peer)
                .iter()
                .any(|p| p == CHAT_PROTOCOL)
            {
                // Failure is logged by the stream manager; change:protocols or
                // a reconnect retries.
                let _ = self.streams.open_stream(connection).await;
            }
        }

        debug!(
            "Current number of peers connected: {}",
            self.transport.peers().len()
        );

        let transport = Arc::clone(&self.transport);
        let dead_peer = peer.clone();
        self.heartbeat.start(peer.clone(), move || async move {
            info!(
                "Closing connections for {dead_peer} ({})",
                pseudonym(&dead_peer)
            );
            if let Err(e) = transport.hang_up(&dead_peer).await {
                warn!("Could not hang up {dead_peer}: {e}");
            }
        });

        ConnectOutcome::Admitted
    }

    /// Release per-connection state; per-peer state goes once no connection
    /// to the peer remains.
    pub fn handle_disconnect(&self, connection: &Connection) -> DisconnectOutcome {
        let peer = &connection.remote_peer;
        let count = {
            let mut relays = self.relay_connections.lock();
            relays.remove(&connection.id);
            relays.len()
        };
        self.metrics.relay_connections.set(count as u64);
        self.metrics.connections_closed.inc();

        info!(
            "Disconnected from {peer} ({}) using multiaddr {}",
            pseudonym(peer),
            connection.remote_addr
        );

        // The stream may ride on this connection even when others remain.
        self.streams.remove_connection(&connection.id);
        if !self.transport.connections(Some(peer)).is_empty() {
            return DisconnectOutcome::StillConnected;
        }

        self.heartbeat.stop(peer);
        self.streams.remove_peer(peer);

        let connected = self.transport.peers().len();
        debug!("Current number of peers connected: {connected}");
        if connected < self.policy.min_connections {
            warn!(
                "Connected to {connected} peers, below the minimum of {}",
                self.policy.min_connections
            );
        }

        DisconnectOutcome::PeerGone {
            primary_relay: self.policy.primary_relay.target_peer_id().as_ref() == Some(peer),
        }
    }

    /// Open the chat stream once the remote starts advertising it.
    pub async fn handle_protocols_changed(&self, peer: &PeerId, protocols: &[String]) {
        if *peer == self.local_peer {
            return;
        }
        if !protocols.iter().any(|p| p == CHAT_PROTOCOL) {
            return;
        }
        // Only the smaller id opens the stream.
        if self.local_peer > *peer {
            return;
        }

        let connections = self.transport.connections(Some(peer));
        if let Some(connection) = connections.first() {
            if !connection.has_stream(CHAT_PROTOCOL) {
                let _ = self.streams.open_stream(connection).await;
            }
        }
    }

    async fn close(&self, connection: &Connection) {
        if let Err(e) = self.transport.close_connection(&connection.id).await {
            warn!(
                "Could not close connection {} to {}: {e}",
                connection.id, connection.remote_peer
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
