//! Peer: top-level coordinator for a node of the peer network.
//!
//! [`Peer`] owns every component of the peer layer and wires transport
//! notifications to them:
//! - Relay dialing (initial dial and automatic redial of the primary relay)
//! - Connection admission (caps, deduplication, chat stream setup)
//! - Protocol stream messaging (`/chat/1.0.0`)
//! - Pubsub topics, including the debug-info topic
//! - Heartbeat liveness checks for every connected peer

use std::sync::Arc;

use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::address::{Multiaddr, MultiaddrExt};
use crate::admission::{AdmissionPolicy, ConnectOutcome, ConnectionAdmission, DisconnectOutcome};
use crate::config::{CHAT_PROTOCOL, DEBUG_INFO_TOPIC, PeerConfig, RELAY_TAG};
use crate::debug_info::{DebugInfo, DebugMsg, DebugPeerInfo, PeerConnectionInfo, PeerSelfInfo, SelfInfo};
use crate::error::PeerError;
use crate::heartbeat::HeartbeatSupervisor;
use crate::identity::PeerId;
use crate::metrics::PeerMetrics;
use crate::pseudonym::pseudonym;
use crate::pubsub::{DebugSnapshotFn, PubSubGateway};
use crate::relay::{DialRetryOptions, RelayDialer};
use crate::router::{MessageHandler, Subscription};
use crate::stream::ProtocolStreamManager;
use crate::transport::{Connection, Transport, TransportEvent};

/// Capacity of the [`PeerEvent`] broadcast channel.
const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Connection lifecycle notifications for observers of a [`Peer`].
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A connection passed admission.
    Connected(Connection),
    /// The last connection to a peer closed.
    Disconnected(PeerId),
}

/// State shared between the facade, its event loop and spawned tasks.
struct PeerShared {
    config: PeerConfig,
    local_peer: PeerId,
    relay_multiaddr: Multiaddr,
    transport: Arc<dyn Transport>,
    metrics: Arc<PeerMetrics>,
    streams: Arc<ProtocolStreamManager>,
    pubsub: Arc<PubSubGateway>,
    heartbeat: Arc<HeartbeatSupervisor>,
    admission: Arc<ConnectionAdmission>,
    dialer: RelayDialer,
    events: broadcast::Sender<PeerEvent>,
}

impl PeerShared {
    /// Dial the primary relay and tag it for the connection manager.
    async fn dial_relay(&self, options: DialRetryOptions) -> Result<Connection, PeerError> {
        let connection = match self.dialer.dial_with_retry(&self.relay_multiaddr, options).await {
            Ok(connection) => connection,
            Err(e) => {
                self.metrics.dials_failed.inc();
                return Err(e);
            }
        };

        let relay = &connection.remote_peer;
        let (tag, value) = RELAY_TAG;
        match self.transport.tag_peer(relay, tag, value).await {
            Ok(true) => debug!("Tagged primary relay {relay} with {tag}"),
            Ok(false) => debug!("Primary relay {relay} already tagged"),
            Err(e) => warn!("Could not tag primary relay {relay}: {e}"),
        }
        Ok(connection)
    }

    fn self_info(&self) -> PeerSelfInfo {
        PeerSelfInfo {
            self_info: SelfInfo::new(&self.local_peer, &self.transport.listen_addrs()),
            primary_relay_multiaddr: self.relay_multiaddr.to_string(),
            primary_relay_peer_id: self
                .relay_multiaddr
                .target_peer_id()
                .map(|id| id.to_string()),
        }
    }

    fn connections_info(&self) -> Vec<PeerConnectionInfo> {
        self.transport
            .connections(None)
            .iter()
            .map(|connection| {
                let latency = self.heartbeat.get_latency_data(&connection.remote_peer);
                PeerConnectionInfo::new(connection, latency, &self.relay_multiaddr)
            })
            .collect()
    }

    fn peer_info(&self) -> DebugPeerInfo {
        DebugPeerInfo {
            self_info: self.self_info(),
            conn_info: self.connections_info(),
            metrics: self.metrics.snapshot(),
        }
    }
}

/// A node of the peer network.
///
/// Create one per transport. Call [`init()`](Peer::init) to start handling
/// transport events and dial the primary relay, and [`close()`](Peer::close)
/// to release every connection, stream and subscription.
pub struct Peer {
    shared: Arc<PeerShared>,
    event_loop: Option<JoinHandle<()>>,
    shutdown_tx: Option<broadcast::Sender<()>>,
    debug_subscription: Option<Subscription>,
    initialized: bool,
}

impl Peer {
    /// Build a peer on top of `transport`. Nothing runs until `init`.
    pub fn new(config: PeerConfig, transport: Arc<dyn Transport>) -> Result<Self, PeerError> {
        config.validate()?;
        let relay_multiaddr = config.relay_multiaddr()?;
        let deny = config.resolved_deny_multiaddrs()?;
        let metrics = Arc::new(PeerMetrics::new());

        let streams =
            ProtocolStreamManager::new(Arc::clone(&transport), CHAT_PROTOCOL, Arc::clone(&metrics));
        let pubsub = PubSubGateway::new(Arc::clone(&transport), Arc::clone(&metrics));
        let heartbeat = HeartbeatSupervisor::new(
            Arc::clone(&transport),
            config.ping_interval,
            config.ping_timeout,
            Arc::clone(&metrics),
        );
        let admission = ConnectionAdmission::new(
            AdmissionPolicy::from_config(&config, deny)?,
            Arc::clone(&transport),
            Arc::clone(&streams),
            Arc::clone(&heartbeat),
            Arc::clone(&metrics),
        );
        let dialer = RelayDialer::new(Arc::clone(&transport), config.dial_timeout);
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        Ok(Self {
            shared: Arc::new(PeerShared {
                local_peer: transport.local_peer_id(),
                config,
                relay_multiaddr,
                transport,
                metrics,
                streams,
                pubsub,
                heartbeat,
                admission,
                dialer,
                events,
            }),
            event_loop: None,
            shutdown_tx: None,
            debug_subscription: None,
            initialized: false,
        })
    }

    pub fn peer_id(&self) -> &PeerId {
        &self.shared.local_peer
    }

    pub fn config(&self) -> &PeerConfig {
        &self.shared.config
    }

    pub fn relay_multiaddr(&self) -> &Multiaddr {
        &self.shared.relay_multiaddr
    }

    pub fn metrics(&self) -> &Arc<PeerMetrics> {
        &self.shared.metrics
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Start handling transport events and dial the primary relay.
    ///
    /// Fails with [`PeerError::DialExhausted`] if the relay cannot be reached
    /// within `relay_max_dial_retry` attempts. The event loop keeps running in
    /// that case; `close` still has to be called.
    pub async fn init(&mut self) -> Result<(), PeerError> {
        if self.initialized {
            return Err(PeerError::AlreadyInitialized);
        }
        let shared = Arc::clone(&self.shared);

        let pubsub_kind = shared.transport.pubsub_kind();
        if pubsub_kind != shared.config.pubsub {
            warn!(
                "Transport runs {pubsub_kind:?} but {:?} is configured",
                shared.config.pubsub
            );
        }

        let events = shared
            .transport
            .take_events()
            .ok_or_else(|| PeerError::Transport("transport events already taken".into()))?;

        shared.transport.handle(CHAT_PROTOCOL).await?;

        if shared.config.enable_debug_info {
            let weak = Arc::downgrade(&shared);
            let snapshot: DebugSnapshotFn =
                Arc::new(move || weak.upgrade().map(|s| DebugInfo::Peer(s.peer_info())));
            self.debug_subscription = Some(shared.pubsub.register_debug_responder(snapshot).await?);
        }

        let (shutdown_tx, _) = broadcast::channel(8);
        let loop_shutdown = shutdown_tx.subscribe();
        let loop_shared = Arc::clone(&shared);
        let loop_shutdown_tx = shutdown_tx.clone();
        self.event_loop = Some(tokio::spawn(async move {
            Self::event_loop(loop_shared, events, loop_shutdown_tx, loop_shutdown).await;
        }));
        self.shutdown_tx = Some(shutdown_tx);
        self.initialized = true;

        info!(
            "Peer {} ({}) started with multiaddrs {:?}",
            shared.local_peer,
            pseudonym(&shared.local_peer),
            shared
                .transport
                .listen_addrs()
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
        );

        let options = DialRetryOptions {
            redial_interval: shared.config.relay_redial_interval,
            max_retry: shared.config.relay_max_dial_retry,
        };
        shared.dial_relay(options).await?;
        Ok(())
    }

    /// Stop the event loop and release every per-peer resource.
    pub async fn close(&mut self) {
        if !self.initialized {
            return;
        }
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.event_loop.take() {
            if let Err(e) = handle.await {
                error!("Peer event loop failed: {e}");
            }
        }

        let shared = &self.shared;
        shared.admission.abort_dials();
        if let Some(subscription) = self.debug_subscription.take() {
            subscription.unsubscribe().await;
        }
        shared.pubsub.unsubscribe_all().await;
        if let Err(e) = shared.transport.unhandle(CHAT_PROTOCOL).await {
            warn!("Could not unhandle {CHAT_PROTOCOL}: {e}");
        }

        shared.heartbeat.stop_all();
        shared.streams.close_all();
        for peer in shared.transport.peers() {
            debug!("Hanging up {peer} ({})", pseudonym(&peer));
            if let Err(e) = shared.transport.hang_up(&peer).await {
                warn!("Could not hang up {peer}: {e}");
            }
        }

        self.initialized = false;
        info!(
            "Peer {} ({}) closed",
            shared.local_peer,
            pseudonym(&shared.local_peer)
        );
    }

    fn ensure_initialized(&self) -> Result<(), PeerError> {
        if self.initialized {
            Ok(())
        } else {
            Err(PeerError::NotInitialized)
        }
    }

    fn ensure_debug_info(&self) -> Result<(), PeerError> {
        self.ensure_initialized()?;
        if self.shared.config.enable_debug_info {
            Ok(())
        } else {
            Err(PeerError::DebugInfoNotEnabled)
        }
    }

    // Messaging
    // -----------------------------------------------------------------------

    /// Register a handler for messages arriving on chat protocol streams.
    pub fn subscribe_message(
        &self,
        handler: impl Fn(&PeerId, &Value) + Send + Sync + 'static,
    ) -> Subscription {
        self.shared.streams.subscribe(Arc::new(handler))
    }

    /// Send `message` on every open chat stream. Returns the number of peers
    /// it was queued for.
    pub fn broadcast_message(&self, message: &Value) -> usize {
        self.shared.streams.broadcast(message)
    }

    /// Register a handler for `topic`.
    pub async fn subscribe_topic(
        &self,
        topic: &str,
        handler: impl Fn(&PeerId, &Value) + Send + Sync + 'static,
    ) -> Result<Subscription, PeerError> {
        self.ensure_initialized()?;
        self.shared.pubsub.subscribe_topic(topic, Arc::new(handler)).await
    }

    /// Publish `message` on `topic`.
    pub async fn flood_message<T: Serialize + ?Sized>(
        &self,
        topic: &str,
        message: &T,
    ) -> Result<(), PeerError> {
        self.ensure_initialized()?;
        self.shared.pubsub.flood_message(topic, message).await
    }

    // Debug info
    // -----------------------------------------------------------------------

    /// Ask every node on the debug-info topic for its snapshot.
    pub async fn request_peer_info(&self) -> Result<(), PeerError> {
        self.ensure_debug_info()?;
        self.shared
            .pubsub
            .flood_message(DEBUG_INFO_TOPIC, &DebugMsg::Request)
            .await
    }

    /// Register a handler for debug-info traffic. Payloads that are not
    /// debug messages are skipped.
    pub async fn subscribe_debug_info(
        &self,
        handler: impl Fn(&PeerId, &DebugMsg) + Send + Sync + 'static,
    ) -> Result<Subscription, PeerError> {
        self.ensure_debug_info()?;
        let handler: MessageHandler = Arc::new(move |from: &PeerId, value: &Value| {
            match serde_json::from_value::<DebugMsg>(value.clone()) {
                Ok(msg) => handler(from, &msg),
                Err(e) => debug!("Ignoring debug-info payload from {from}: {e}"),
            }
        });
        self.shared.pubsub.subscribe_topic(DEBUG_INFO_TOPIC, handler).await
    }

    /// Snapshot of this peer, its connections and its metrics.
    pub fn get_peer_info(&self) -> DebugPeerInfo {
        self.shared.peer_info()
    }

    pub fn peer_self_info(&self) -> PeerSelfInfo {
        self.shared.self_info()
    }

    pub fn peer_connections_info(&self) -> Vec<PeerConnectionInfo> {
        self.shared.connections_info()
    }

    /// Ping round-trip history of `peer` in milliseconds, newest first.
    pub fn get_latency_data(&self, peer: &PeerId) -> Vec<u64> {
        self.shared.heartbeat.get_latency_data(peer)
    }

    // Introspection
    // -----------------------------------------------------------------------

    pub fn is_relay_peer_multiaddr(&self, addr: &Multiaddr) -> bool {
        addr.is_relay_peer_addr()
    }

    pub fn is_primary_relay(&self, addr: &Multiaddr) -> bool {
        self.shared.admission.is_primary_relay(addr)
    }

    /// Peers with at least one open connection.
    pub fn connected_peers(&self) -> Vec<PeerId> {
        self.shared.transport.peers()
    }

    /// Peers with an open chat stream.
    pub fn stream_peers(&self) -> Vec<PeerId> {
        self.shared.streams.stream_peers()
    }

    pub fn relay_connection_count(&self) -> usize {
        self.shared.admission.relay_connection_count()
    }

    /// Receive connection lifecycle events from now on.
    pub fn subscribe_events(&self) -> broadcast::Receiver<PeerEvent> {
        self.shared.events.subscribe()
    }

    // Internal tasks
    // -----------------------------------------------------------------------

    /// Main event loop: transport notifications are handled one at a time.
    async fn event_loop(
        shared: Arc<PeerShared>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        shutdown_tx: broadcast::Sender<()>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                Some(event) = events.recv() => {
                    Self::handle_event(&shared, event, &shutdown_tx).await;
                }

                _ = shutdown.recv() => {
                    debug!("Event loop shutting down");
                    break;
                }

                else => {
                    debug!("Transport event stream ended");
                    break;
                }
            }
        }
    }

    async fn handle_event(
        shared: &Arc<PeerShared>,
        event: TransportEvent,
        shutdown_tx: &broadcast::Sender<()>,
    ) {
        match event {
            TransportEvent::Discovery(peer) => {
                let _ = shared.admission.handle_discovery(peer);
            }
            TransportEvent::Connect(connection) => {
                if shared.admission.handle_connect(&connection).await == ConnectOutcome::Admitted {
                    let _ = shared.events.send(PeerEvent::Connected(connection));
                }
            }
            TransportEvent::Disconnect(connection) => {
                if let DisconnectOutcome::PeerGone { primary_relay } =
                    shared.admission.handle_disconnect(&connection)
                {
                    let _ = shared
                        .events
                        .send(PeerEvent::Disconnected(connection.remote_peer.clone()));
                    if primary_relay {
                        Self::spawn_relay_redial(shared, shutdown_tx);
                    }
                }
            }
            TransportEvent::ProtocolsChanged { peer, protocols } => {
                shared
                    .admission
                    .handle_protocols_changed(&peer, &protocols)
                    .await;
            }
            TransportEvent::AddressesChanged { peer, multiaddrs } => {
                let addrs: Vec<String> = multiaddrs.iter().map(ToString::to_string).collect();
                debug!(
                    "Peer {peer} ({}) changed addresses to {addrs:?}",
                    pseudonym(&peer)
                );
            }
            TransportEvent::InboundStream {
                connection,
                protocol,
                stream,
            } => {
                let peer = connection.remote_peer;
                if protocol == CHAT_PROTOCOL {
                    debug!("Accepted {protocol} stream from {peer} ({})", pseudonym(&peer));
                    shared.streams.handle_stream(peer, connection.id, stream);
                } else {
                    debug!("Ignoring {protocol} stream from {peer}");
                }
            }
            TransportEvent::PubSub(message) => shared.pubsub.dispatch(message),
        }
    }

    /// Redial the primary relay until it answers or the peer closes.
    fn spawn_relay_redial(shared: &Arc<PeerShared>, shutdown_tx: &broadcast::Sender<()>) {
        let shared = Arc::clone(shared);
        let mut shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move {
            info!("Primary relay disconnected, redialling {}", shared.relay_multiaddr);
            let options = DialRetryOptions::unbounded(shared.config.relay_redial_interval);
            tokio::select! {
                result = shared.dial_relay(options) => {
                    if let Err(e) = result {
                        error!("Could not redial primary relay: {e}");
                    }
                }
                _ = shutdown.recv() => {
                    debug!("Relay redial cancelled");
                }
            }
        });
    }
}

impl Drop for Peer {
    fn drop(&mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::debug_info::NodeType;
    use crate::memory::MemoryNetwork;
    use serde_json::json;
    use std::time::Duration;

    fn relay_config(network: &MemoryNetwork) -> PeerConfig {
        let relay = network
            .listen_addr(&network.peer_id("relay-r").unwrap())
            .unwrap()
            .to_string();
        PeerConfig::new(relay)
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let network = MemoryNetwork::new();
        let transport = network.add_peer("peer-a");

        let result = Peer::new(
            PeerConfig::new("/ip4/127.0.0.1/tcp/9090/ws"),
            transport.clone(),
        );
        assert!(matches!(result, Err(PeerError::InvalidConfig(_))));

        let mut config = PeerConfig::new(format!(
            "/ip4/127.0.0.1/tcp/9090/ws/p2p/{}",
            PeerId::random()
        ));
        config.ping_timeout = Duration::from_secs(20);
        assert!(Peer::new(config, transport).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_dials_and_tags_primary_relay() {
        let network = MemoryNetwork::new();
        network.add_relay("relay-r");
        let transport = network.add_peer("peer-a");
        let mut peer = Peer::new(relay_config(&network), transport).unwrap();

        peer.init().await.unwrap();
        assert!(peer.is_initialized());

        let me = network.peer_id("peer-a").unwrap();
        let relay = network.peer_id("relay-r").unwrap();
        assert_eq!(network.connections_between(&me, &relay).len(), 1);
        assert_eq!(network.tags(&me, &relay), vec!["laconic:relay-primary".to_string()]);

        assert!(matches!(peer.init().await, Err(PeerError::AlreadyInitialized)));
        peer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_init_fails_when_relay_unreachable() {
        let network = MemoryNetwork::new();
        let relay = network.add_relay("relay-r");
        network.set_online(&relay.local_peer_id(), false);
        let transport = network.add_peer("peer-a");

        let mut config = relay_config(&network);
        config.relay_max_dial_retry = Some(2);
        let mut peer = Peer::new(config, transport).unwrap();

        match peer.init().await {
            Err(PeerError::DialExhausted { attempts, .. }) => assert_eq!(attempts, 2),
            other => panic!("Expected DialExhausted, got {other:?}"),
        }
        assert_eq!(peer.metrics().dials_failed.get(), 1);
        peer.close().await;
    }

    #[tokio::test]
    async fn test_operations_before_init() {
        let network = MemoryNetwork::new();
        network.add_relay("relay-r");
        let transport = network.add_peer("peer-a");
        let mut config = relay_config(&network);
        config.enable_debug_info = true;
        let peer = Peer::new(config, transport).unwrap();

        assert!(matches!(
            peer.flood_message("chat", &json!("hi")).await,
            Err(PeerError::NotInitialized)
        ));
        assert!(matches!(
            peer.subscribe_topic("chat", |_, _| {}).await,
            Err(PeerError::NotInitialized)
        ));
        assert_eq!(peer.broadcast_message(&json!("hi")), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_debug_info_disabled() {
        let network = MemoryNetwork::new();
        network.add_relay("relay-r");
        let transport = network.add_peer("peer-a");
        let mut peer = Peer::new(relay_config(&network), transport).unwrap();
        peer.init().await.unwrap();

        assert!(matches!(
            peer.request_peer_info().await,
            Err(PeerError::DebugInfoNotEnabled)
        ));
        assert!(matches!(
            peer.subscribe_debug_info(|_, _| {}).await,
            Err(PeerError::DebugInfoNotEnabled)
        ));
        assert!(!network.is_subscribed(&network.peer_id("peer-a").unwrap(), DEBUG_INFO_TOPIC));
        peer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_peer_info_classifies_primary_relay() {
        let network = MemoryNetwork::new();
        network.add_relay("relay-r");
        let transport = network.add_peer("peer-a");
        let mut peer = Peer::new(relay_config(&network), transport).unwrap();
        peer.init().await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let info = peer.get_peer_info();
        let me = network.peer_id("peer-a").unwrap().to_string();
        let relay = network.peer_id("relay-r").unwrap().to_string();
        assert_eq!(info.self_info.self_info.peer_id, me);
        assert_eq!(info.self_info.primary_relay_peer_id, Some(relay));
        assert_eq!(info.conn_info.len(), 1);
        assert_eq!(info.conn_info[0].node_type, NodeType::RelayPrimary);
        assert!(info.conn_info[0].is_peer_relay_primary);
        assert_eq!(info.metrics["connections_opened_total"], 1);
        assert_eq!(peer.relay_connection_count(), 1);
        assert!(peer.is_primary_relay(peer.relay_multiaddr()));
        assert!(peer.is_relay_peer_multiaddr(peer.relay_multiaddr()));

        peer.close().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_releases_resources() {
        let network = MemoryNetwork::new();
        network.add_relay("relay-r");
        let transport = network.add_peer("peer-a");
        let mut config = relay_config(&network);
        config.enable_debug_info = true;
        let mut peer = Peer::new(config, transport).unwrap();
        peer.init().await.unwrap();
        let _chat = peer.subscribe_topic("chat", |_, _| {}).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        let me = network.peer_id("peer-a").unwrap();
        assert!(network.is_subscribed(&me, DEBUG_INFO_TOPIC));
        peer.close().await;

        assert!(!peer.is_initialized());
        assert!(!network.is_subscribed(&me, DEBUG_INFO_TOPIC));
        assert!(!network.is_subscribed(&me, "chat"));
        assert!(peer.connected_peers().is_empty());
        assert_eq!(network.link_count(), 0);
        assert!(peer
            .get_latency_data(&network.peer_id("relay-r").unwrap())
            .is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_aborts_pending_discovery_dials() {
        let network = MemoryNetwork::new();
        let relay = network.add_relay("relay-r");
        let transport = network.add_peer("peer-a");
        let me = transport.local_peer_id();
        let b = network.add_peer("peer-b");
        let mut peer = Peer::new(relay_config(&network), transport).unwrap();
        peer.init().await.unwrap();

        // peer-b joining the relay is announced to peer-a, whose dial stalls.
        network.set_dial_latency(&me, Duration::from_secs(5));
        b.dial(&relay.listen_addrs()[0]).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;

        peer.close().await;
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert!(network
            .connections_between(&me, &b.local_peer_id())
            .is_empty());
    }
}
