//! RelayNode, the bootstrap/relay role.
//!
//! A relay accepts connections from peers, forwards circuits and pubsub
//! traffic (both done by the transport), keeps a heartbeat on every
//! connected node and maintains links to its configured relay peers.

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address::{Multiaddr, MultiaddrExt};
use crate::config::{RelayNodeConfig, parse_multiaddrs};
use crate::debug_info::{ConnectionInfo, DebugInfo, DebugRelayInfo, SelfInfo};
use crate::error::PeerError;
use crate::heartbeat::HeartbeatSupervisor;
use crate::identity::PeerId;
use crate::metrics::PeerMetrics;
use crate::pseudonym::pseudonym;
use crate::pubsub::{DebugSnapshotFn, PubSubGateway};
use crate::relay::{DialRetryOptions, RelayDialer};
use crate::router::Subscription;
use crate::transport::{Connection, Transport, TransportEvent};

struct RelayShared {
    config: RelayNodeConfig,
    local_peer: PeerId,
    relay_peers: Vec<Multiaddr>,
    transport: Arc<dyn Transport>,
    metrics: Arc<PeerMetrics>,
    pubsub: Arc<PubSubGateway>,
    heartbeat: Arc<HeartbeatSupervisor>,
    dialer: RelayDialer,
}

impl RelayShared {
    fn relay_info(&self) -> DebugRelayInfo {
        DebugRelayInfo {
            self_info: SelfInfo::new(&self.local_peer, &self.transport.listen_addrs()),
            conn_info: self
                .transport
                .connections(None)
                .iter()
                .map(|c| ConnectionInfo::new(c, self.heartbeat.get_latency_data(&c.remote_peer)))
                .collect(),
            metrics: self.metrics.snapshot(),
        }
    }

    fn on_connect(&self, connection: &Connection) {
        let peer = &connection.remote_peer;
        self.metrics.connections_opened.inc();
        info!(
            "Connected to {peer} ({}) using multiaddr {}",
            pseudonym(peer),
            connection.remote_addr
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
    }

    /// Returns the relay peer address to redial, if the disconnected node
    /// was one and no connection to it remains.
    fn on_disconnect(&self, connection: &Connection) -> Option<Multiaddr> {
        let peer = &connection.remote_peer;
        self.metrics.connections_closed.inc();
        info!(
            "Disconnected from {peer} ({}) using multiaddr {}",
            pseudonym(peer),
            connection.remote_addr
        );

        if !self.transport.connections(Some(peer)).is_empty() {
            return None;
        }
        self.heartbeat.stop(peer);
        self.relay_peers
            .iter()
            .find(|addr| addr.target_peer_id().as_ref() == Some(peer))
            .cloned()
    }
}

/// A running relay node.
pub struct RelayNode {
    shared: Arc<RelayShared>,
    event_loop: Option<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    debug_subscription: Option<Subscription>,
}

impl RelayNode {
    /// Start handling events on `transport` and dial the configured relay
    /// peers in the background.
    pub async fn start(
        config: RelayNodeConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self, PeerError> {
        config.validate()?;
        let events = transport
            .take_events()
            .ok_or_else(|| PeerError::Transport("transport events already taken".into()))?;

        let local_peer = transport.local_peer_id();
        let addrs: Vec<String> = transport
            .listen_addrs()
            .iter()
            .map(ToString::to_string)
            .collect();
        info!(
            "Relay node {local_peer} ({}) listening on {addrs:?}",
            pseudonym(&local_peer)
        );

        let pubsub_kind = transport.pubsub_kind();
        if pubsub_kind != config.pubsub {
            warn!(
                "Transport runs {pubsub_kind:?} but {:?} is configured",
                config.pubsub
            );
        }

        let deny = parse_multiaddrs("deny-list", &config.deny_multiaddrs);
        let mut relay_peers = Vec::new();
        for addr in parse_multiaddrs("relay-peer", &config.relay_peers) {
            if addr.is_denied(&deny) {
                info!("Skipping denied relay peer {addr}");
            } else {
                relay_peers.push(addr);
            }
        }

        let metrics = Arc::new(PeerMetrics::new());
        let shared = Arc::new(RelayShared {
            local_peer,
            relay_peers,
            pubsub: PubSubGateway::new(Arc::clone(&transport), Arc::clone(&metrics)),
            heartbeat: HeartbeatSupervisor::new(
                Arc::clone(&transport),
                config.ping_interval,
                config.ping_timeout,
                Arc::clone(&metrics),
            ),
            dialer: RelayDialer::new(Arc::clone(&transport), config.dial_timeout),
            config,
            transport,
            metrics,
        });

        let debug_subscription = if shared.config.enable_debug_info {
            let weak = Arc::downgrade(&shared);
            let snapshot: DebugSnapshotFn =
                Arc::new(move || weak.upgrade().map(|s| DebugInfo::Relay(s.relay_info())));
            Some(shared.pubsub.register_debug_responder(snapshot).await?)
        } else {
            None
        };

        let (shutdown_tx, _) = broadcast::channel(8);
        let loop_shared = Arc::clone(&shared);
        let loop_shutdown = shutdown_tx.subscribe();
        let loop_shutdown_tx = shutdown_tx.clone();
        let event_loop = tokio::spawn(async move {
            Self::event_loop(loop_shared, events, loop_shutdown_tx, loop_shutdown).await;
        });

        for addr in &shared.relay_peers {
            Self::spawn_dial(&shared, addr.clone(), &shutdown_tx);
        }

        Ok(Self {
            shared,
            event_loop: Some(event_loop),
            shutdown_tx: Some(shutdown_tx),
            debug_subscription,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.shared.local_peer
    }

    pub fn metrics(&self) -> &Arc<PeerMetrics> {
        &self.shared.metrics
    }

    /// Relay peers this node keeps a connection with, denied ones excluded.
    pub fn relay_peers(&self) -> &[Multiaddr] {
        &self.shared.relay_peers
    }

    /// Snapshot of this relay, its connections and its metrics.
    pub fn relay_info(&self) -> DebugRelayInfo {
        self.shared.relay_info()
    }

    pub fn get_latency_data(&self, peer: &PeerId) -> Vec<u64> {
        self.shared.heartbeat.get_latency_data(peer)
    }

    /// Stop the event loop and hang up every connected node.
    pub async fn close(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.event_loop.take() {
            if let Err(e) = handle.await {
                error!("Relay event loop failed: {e}");
            }
        }

        let shared = &self.shared;
        if let Some(subscription) = self.debug_subscription.take() {
            subscription.unsubscribe().await;
        }
        shared.pubsub.unsubscribe_all().await;
        shared.heartbeat.stop_all();
        for peer in shared.transport.peers() {
            if let Err(e) = shared.transport.hang_up(&peer).await {
                warn!("Could not hang up {peer}: {e}");
            }
        }
        info!("Relay node {} closed", shared.local_peer);
    }

    async fn event_loop(
        shared: Arc<RelayShared>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown_tx: broadcast::Sender<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    Self::handle_event(&shared, event, &shutdown_tx);
                }

                _ = shutdown.recv() => {
                    debug!("Relay event loop shutting down");
                    break;
                }

                else => break,
            }
        }
    }

    fn handle_event(
        shared: &Arc<RelayShared>,
        event: TransportEvent,
        shutdown_tx: &broadcast::Sender<()>,
    ) {
        match event {
            TransportEvent::Connect(connection) => shared.on_connect(&connection),
            TransportEvent::Disconnect(connection) => {
                if let Some(addr) = shared.on_disconnect(&connection) {
                    info!("Relay peer {addr} disconnected, redialling");
                    Self::spawn_dial(shared, addr, shutdown_tx);
                }
            }
            TransportEvent::PubSub(message) => shared.pubsub.dispatch(message),
            TransportEvent::Discovery(peer) => {
                debug!("Ignoring discovered peer {}", peer.id);
            }
            TransportEvent::ProtocolsChanged { peer, protocols } => {
                debug!("Peer {peer} protocols changed: {protocols:?}");
            }
            TransportEvent::AddressesChanged { peer, .. } => {
                debug!("Peer {peer} addresses changed");
            }
            TransportEvent::InboundStream {
                connection,
                protocol,
                ..
            } => {
                debug!(
                    "Ignoring {protocol} stream from {}",
                    connection.remote_peer
                );
            }
        }
    }

    fn spawn_dial(shared: &Arc<RelayShared>, addr: Multiaddr, shutdown_tx: &broadcast::Sender<()>) {
        let shared = Arc::clone(shared);
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            let options =
                DialRetryOptions::bounded(shared.config.redial_interval, shared.config.max_dial_retry);
            tokio::select! {
                result = shared.dialer.dial_with_retry(&addr, options) => {
                    if let Err(e) = result {
                        shared.metrics.dials_failed.inc();
                        error!("{e}");
                    }
                }
                _ = shutdown.recv() => {}
            }
        });
    }
}

impl Drop for RelayNode {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
