//! In-process simulated network implementing [`Transport`].
//!
//! Nodes are either relays, listening on `/ip4/127.0.0.1/tcp/<port>/ws/p2p/<id>`,
//! or peers, listening on a webrtc-star address. Two peers can always link
//! directly unless the pair is blocked, in which case they can still reach
//! each other through `<relay>/p2p-circuit/p2p/<target>` when both hold a
//! link to that relay.
//!
//! Peers linked to the same relay discover one another, standing in for
//! pubsub peer discovery. Pubsub messages are flooded along links: relays
//! forward every topic, peers forward the topics they subscribe to. Streams
//! are in-memory duplex pipes that end when their link closes. Ping latency
//! and reachability can be set per ordered pair for fault injection.
//!
//! Every node runs with a real ed25519 identity, either freshly generated or
//! loaded from a [`PeerIdFile`]. Tests refer to nodes by the label they were
//! added under and resolve it with [`MemoryNetwork::peer_id`].

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::future::Future;
use std::io;
use std::net::Ipv4Addr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libp2p_identity::Keypair;
use parking_lot::Mutex;
use tokio::io::{AsyncRead, AsyncWrite, DuplexStream, ReadBuf};
use tokio::sync::mpsc;
use tokio_util::sync::{CancellationToken, WaitForCancellationFutureOwned};
use tracing::{debug, trace};

use crate::address::{Multiaddr, MultiaddrExt, Protocol, circuit_addr};
use crate::error::PeerError;
use crate::identity::{PeerId, PeerIdFile};
use crate::transport::{
    Connection, ConnectionId, ConnectionStatus, DiscoveredPeer, Direction, ProtocolStream,
    PubSubKind, PubSubMessage, Transport, TransportEvent,
};

/// Buffer size of each in-memory stream direction.
const STREAM_BUFFER: usize = 64 * 1024;

const FIRST_PORT: u16 = 9090;

struct SimNode {
    is_relay: bool,
    listen_addr: Multiaddr,
    online: bool,
    events: mpsc::UnboundedSender<TransportEvent>,
    receiver: Option<mpsc::UnboundedReceiver<TransportEvent>>,
    handled: BTreeSet<String>,
    topics: HashSet<String>,
    tags: HashMap<PeerId, HashSet<String>>,
    pubsub_kind: PubSubKind,
}

struct Link {
    id: ConnectionId,
    dialer: PeerId,
    listener: PeerId,
    /// Address of the listener as seen by the dialer.
    dialer_view_addr: Multiaddr,
    /// Address of the dialer as seen by the listener.
    listener_view_addr: Multiaddr,
    /// Relay forwarding this link, for circuits.
    via: Option<PeerId>,
    streams: Vec<String>,
    opened_at: DateTime<Utc>,
    /// Cancelled when the link closes; ends every stream opened on it.
    closed: CancellationToken,
}

impl Link {
    fn involves(&self, peer: &PeerId) -> bool {
        self.dialer == *peer || self.listener == *peer
    }

    fn joins(&self, a: &PeerId, b: &PeerId) -> bool {
        (self.dialer == *a && self.listener == *b) || (self.dialer == *b && self.listener == *a)
    }

    fn other(&self, me: &PeerId) -> &PeerId {
        if self.dialer == *me {
            &self.listener
        } else {
            &self.dialer
        }
    }

    fn view(&self, me: &PeerId, status: ConnectionStatus) -> Connection {
        let (remote_peer, remote_addr, direction) = if self.dialer == *me {
            (&self.listener, &self.dialer_view_addr, Direction::Outbound)
        } else {
            (&self.dialer, &self.listener_view_addr, Direction::Inbound)
        };
        Connection {
            id: self.id.clone(),
            remote_peer: remote_peer.clone(),
            remote_addr: remote_addr.clone(),
            direction,
            status,
            streams: self.streams.clone(),
            opened_at: self.opened_at,
        }
    }
}

/// One half of an in-memory stream. Reads end and writes fail once the
/// link carrying the stream is closed.
struct LinkStream {
    inner: DuplexStream,
    link_closed: CancellationToken,
    closed: Pin<Box<WaitForCancellationFutureOwned>>,
}

impl LinkStream {
    fn new(inner: DuplexStream, link_closed: CancellationToken) -> Self {
        let closed = Box::pin(link_closed.clone().cancelled_owned());
        Self {
            inner,
            link_closed,
            closed,
        }
    }

    /// Also registers the waker so a pending read wakes up on close.
    fn poll_closed(&mut self, cx: &mut Context<'_>) -> bool {
        self.link_closed.is_cancelled() || self.closed.as_mut().poll(cx).is_ready()
    }
}

fn link_closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::BrokenPipe, "connection closed")
}

impl AsyncRead for LinkStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_read(cx, buf)
    }
}

impl AsyncWrite for LinkStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(link_closed_error()));
        }
        Pin::new(&mut this.inner).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.poll_closed(cx) {
            return Poll::Ready(Err(link_closed_error()));
        }
        Pin::new(&mut this.inner).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        if this.link_closed.is_cancelled() {
            return Poll::Ready(Ok(()));
        }
        Pin::new(&mut this.inner).poll_shutdown(cx)
    }
}

#[derive(Default)]
struct NetworkState {
    nodes: HashMap<PeerId, SimNode>,
    /// Labels nodes were added under.
    names: HashMap<String, PeerId>,
    links: Vec<Link>,
    next_link: u64,
    next_port: u16,
    blocked_direct: HashSet<(PeerId, PeerId)>,
    unreachable: HashSet<(PeerId, PeerId)>,
    latency: HashMap<(PeerId, PeerId), Duration>,
    ping_counts: HashMap<(PeerId, PeerId), usize>,
    dial_latency: HashMap<PeerId, Duration>,
    unsubscribe_latency: HashMap<PeerId, Duration>,
    next_seq: u64,
}

fn unordered(a: &PeerId, b: &PeerId) -> (PeerId, PeerId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

impl NetworkState {
    fn emit(&self, to: &PeerId, event: TransportEvent) {
        if let Some(node) = self.nodes.get(to) {
            trace!("memory: {to} <- {event:?}");
            let _ = node.events.send(event);
        }
    }

    fn node(&self, id: &PeerId) -> Result<&SimNode, PeerError> {
        self.nodes
            .get(id)
            .ok_or_else(|| PeerError::Transport(format!("unknown peer {id}")))
    }

    fn online_node(&self, id: &PeerId) -> Result<&SimNode, PeerError> {
        let node = self.node(id)?;
        if !node.online {
            return Err(PeerError::Transport(format!("{id} is unreachable")));
        }
        Ok(node)
    }

    fn is_relay(&self, id: &PeerId) -> bool {
        self.nodes.get(id).is_some_and(|n| n.is_relay)
    }

    fn has_plain_link(&self, a: &PeerId, b: &PeerId) -> bool {
        self.links.iter().any(|l| l.via.is_none() && l.joins(a, b))
    }

    fn protocols_of(&self, id: &PeerId) -> Vec<String> {
        self.nodes
            .get(id)
            .map(|n| n.handled.iter().cloned().collect())
            .unwrap_or_default()
    }

    fn peer_info(&self, id: &PeerId, via: &PeerId) -> Option<DiscoveredPeer> {
        let node = self.nodes.get(id)?;
        let mut multiaddrs = vec![node.listen_addr.clone()];
        if !node.is_relay {
            let relay = self.nodes.get(via)?;
            multiaddrs.push(circuit_addr(&relay.listen_addr, id));
        }
        Some(DiscoveredPeer {
            id: id.clone(),
            multiaddrs,
        })
    }

    fn open_link(
        &mut self,
        dialer: &PeerId,
        listener: &PeerId,
        dialer_view_addr: Multiaddr,
        listener_view_addr: Multiaddr,
        via: Option<PeerId>,
    ) -> Connection {
        self.next_link += 1;
        let link = Link {
            id: ConnectionId::new(format!("mem-{}", self.next_link)),
            dialer: dialer.clone(),
            listener: listener.clone(),
            dialer_view_addr,
            listener_view_addr,
            via: via.clone(),
            streams: Vec::new(),
            opened_at: Utc::now(),
            closed: CancellationToken::new(),
        };
        let dialer_view = link.view(dialer, ConnectionStatus::Open);
        let listener_view = link.view(listener, ConnectionStatus::Open);
        self.links.push(link);

        self.emit(dialer, TransportEvent::Connect(dialer_view.clone()));
        self.emit(listener, TransportEvent::Connect(listener_view));
        self.emit(
            dialer,
            TransportEvent::ProtocolsChanged {
                peer: listener.clone(),
                protocols: self.protocols_of(listener),
            },
        );
        self.emit(
            listener,
            TransportEvent::ProtocolsChanged {
                peer: dialer.clone(),
                protocols: self.protocols_of(dialer),
            },
        );

        if via.is_none() {
            if self.is_relay(listener) {
                self.announce_through(dialer, listener);
            }
            if self.is_relay(dialer) {
                self.announce_through(listener, dialer);
            }
        }
        dialer_view
    }

    /// `node` just linked to `relay`: introduce it to the relay's other
    /// neighbours and them to it. Only peers act on discovery.
    fn announce_through(&self, node: &PeerId, relay: &PeerId) {
        let node_is_relay = self.is_relay(node);
        let neighbours: BTreeSet<PeerId> = self
            .links
            .iter()
            .filter(|l| l.via.is_none() && l.involves(relay))
            .map(|l| l.other(relay).clone())
            .filter(|n| n != node && self.nodes.get(n).is_some_and(|s| s.online))
            .collect();

        for other in neighbours {
            let other_is_relay = self.is_relay(&other);
            if !node_is_relay {
                if let Some(info) = self.peer_info(&other, relay) {
                    self.emit(node, TransportEvent::Discovery(info));
                }
            }
            if !other_is_relay {
                if let Some(info) = self.peer_info(node, relay) {
                    self.emit(&other, TransportEvent::Discovery(info));
                }
            }
        }
    }

    /// Close the given links, cascading to circuits that lose their relay hop.
    fn close_links(&mut self, ids: Vec<ConnectionId>) {
        let mut queue: VecDeque<ConnectionId> = ids.into();
        while let Some(id) = queue.pop_front() {
            let Some(pos) = self.links.iter().position(|l| l.id == id) else {
                continue;
            };
            let link = self.links.remove(pos);
            link.closed.cancel();

            if link.via.is_none() {
                for (relay, end) in [(&link.listener, &link.dialer), (&link.dialer, &link.listener)] {
                    if !self.is_relay(relay) {
                        continue;
                    }
                    queue.extend(
                        self.links
                            .iter()
                            .filter(|l| l.via.as_ref() == Some(relay) && l.involves(end))
                            .map(|l| l.id.clone()),
                    );
                }
            }

            self.emit(
                &link.dialer,
                TransportEvent::Disconnect(link.view(&link.dialer, ConnectionStatus::Closed)),
            );
            self.emit(
                &link.listener,
                TransportEvent::Disconnect(link.view(&link.listener, ConnectionStatus::Closed)),
            );
        }
    }

    fn links_between(&self, a: &PeerId, b: &PeerId) -> Vec<ConnectionId> {
        self.links
            .iter()
            .filter(|l| l.joins(a, b))
            .map(|l| l.id.clone())
            .collect()
    }

    fn dial_addr(&mut self, me: &PeerId, addr: &Multiaddr) -> Result<Connection, PeerError> {
        let target = addr
            .target_peer_id()
            .ok_or_else(|| PeerError::InvalidAddress(format!("{addr} has no peer id")))?;
        if target == *me {
            return Err(PeerError::Transport("cannot dial self".into()));
        }
        let my_addr = self.online_node(me)?.listen_addr.clone();
        let target_addr = self.online_node(&target)?.listen_addr.clone();

        if addr.is_relayed_circuit() {
            let relay = addr
                .hop_relay_peer_id()
                .ok_or_else(|| PeerError::InvalidAddress(format!("{addr} has no relay hop")))?;
            let relay_addr = self.online_node(&relay)?.listen_addr.clone();
            if !self.is_relay(&relay) {
                return Err(PeerError::Transport(format!("{relay} is not a relay")));
            }
            if !self.has_plain_link(me, &relay) || !self.has_plain_link(&target, &relay) {
                return Err(PeerError::Transport(format!(
                    "no reservation for {target} on relay {relay}"
                )));
            }
            let back = circuit_addr(&relay_addr, me);
            return Ok(self.open_link(me, &target, addr.clone(), back, Some(relay)));
        }

        if *addr != target_addr {
            return Err(PeerError::Transport(format!("nothing listening on {addr}")));
        }
        if self.blocked_direct.contains(&unordered(me, &target)) {
            return Err(PeerError::Transport(format!(
                "direct connection to {target} blocked"
            )));
        }
        Ok(self.open_link(me, &target, target_addr, my_addr, None))
    }
}

/// Handle to a simulated network. Cheap to clone.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<Mutex<NetworkState>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    fn add_node(&self, name: &str, peer_id: PeerId, is_relay: bool) -> Arc<MemoryTransport> {
        let mut state = self.state.lock();
        let port = FIRST_PORT + state.next_port;
        state.next_port += 1;

        let mut listen_addr = Multiaddr::empty()
            .with(Protocol::Ip4(Ipv4Addr::LOCALHOST))
            .with(Protocol::Tcp(port));
        if is_relay {
            listen_addr.push(Protocol::Ws("/".into()));
        } else {
            listen_addr.push(Protocol::Wss("/".into()));
            listen_addr.push(Protocol::P2pWebRtcStar);
        }
        listen_addr.push(Protocol::P2p(*peer_id.as_libp2p()));
        debug!("memory: {name} is {peer_id} on {listen_addr}");

        state.names.insert(name.to_string(), peer_id.clone());
        let (events, receiver) = mpsc::unbounded_channel();
        state.nodes.insert(
            peer_id.clone(),
            SimNode {
                is_relay,
                listen_addr,
                online: true,
                events,
                receiver: Some(receiver),
                handled: BTreeSet::new(),
                topics: HashSet::new(),
                tags: HashMap::new(),
                pubsub_kind: if is_relay {
                    PubSubKind::Floodsub
                } else {
                    PubSubKind::Gossipsub
                },
            },
        );

        Arc::new(MemoryTransport {
            id: peer_id,
            state: Arc::clone(&self.state),
        })
    }

    /// Add a relay node with a freshly generated identity.
    pub fn add_relay(&self, name: &str) -> Arc<MemoryTransport> {
        self.add_node(name, fresh_peer_id(), true)
    }

    /// Add a peer node with a freshly generated identity.
    pub fn add_peer(&self, name: &str) -> Arc<MemoryTransport> {
        self.add_node(name, fresh_peer_id(), false)
    }

    /// Add a relay node running with the identity stored in `identity`.
    pub fn add_relay_with_identity(
        &self,
        name: &str,
        identity: &PeerIdFile,
    ) -> Result<Arc<MemoryTransport>, PeerError> {
        let keypair = identity.keypair()?;
        Ok(self.add_node(name, PeerId::from_public_key(&keypair.public()), true))
    }

    /// Add a peer node running with the identity stored in `identity`.
    pub fn add_peer_with_identity(
        &self,
        name: &str,
        identity: &PeerIdFile,
    ) -> Result<Arc<MemoryTransport>, PeerError> {
        let keypair = identity.keypair()?;
        Ok(self.add_node(name, PeerId::from_public_key(&keypair.public()), false))
    }

    /// The id of the node added under `name`.
    pub fn peer_id(&self, name: &str) -> Option<PeerId> {
        self.state.lock().names.get(name).cloned()
    }

    /// Another handle to the node added under `name`.
    pub fn transport(&self, name: &str) -> Option<Arc<MemoryTransport>> {
        let id = self.peer_id(name)?;
        Some(Arc::new(MemoryTransport {
            id,
            state: Arc::clone(&self.state),
        }))
    }

    pub fn listen_addr(&self, id: &PeerId) -> Option<Multiaddr> {
        self.state.lock().nodes.get(id).map(|n| n.listen_addr.clone())
    }

    /// `target` as reached through `relay`.
    pub fn circuit_addr(&self, relay: &PeerId, target: &PeerId) -> Option<Multiaddr> {
        let relay_addr = self.listen_addr(relay)?;
        Some(circuit_addr(&relay_addr, target))
    }

    /// Forbid direct links between `a` and `b` (symmetric NAT).
    pub fn block_direct(&self, a: &PeerId, b: &PeerId) {
        self.state.lock().blocked_direct.insert(unordered(a, b));
    }

    pub fn allow_direct(&self, a: &PeerId, b: &PeerId) {
        self.state.lock().blocked_direct.remove(&unordered(a, b));
    }

    /// Make pings from `from` to `to` fail.
    pub fn set_ping_unreachable(&self, from: &PeerId, to: &PeerId, unreachable: bool) {
        let mut state = self.state.lock();
        let key = (from.clone(), to.clone());
        if unreachable {
            state.unreachable.insert(key);
        } else {
            state.unreachable.remove(&key);
        }
    }

    pub fn set_ping_latency(&self, from: &PeerId, to: &PeerId, latency: Duration) {
        self.state
            .lock()
            .latency
            .insert((from.clone(), to.clone()), latency);
    }

    /// Ping attempts from `from` to `to`, answered or not.
    pub fn ping_count(&self, from: &PeerId, to: &PeerId) -> usize {
        self.state
            .lock()
            .ping_counts
            .get(&(from.clone(), to.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Delay every dial made by `id`.
    pub fn set_dial_latency(&self, id: &PeerId, latency: Duration) {
        self.state.lock().dial_latency.insert(id.clone(), latency);
    }

    /// Delay every topic unsubscription made by `id`.
    pub fn set_unsubscribe_latency(&self, id: &PeerId, latency: Duration) {
        self.state
            .lock()
            .unsubscribe_latency
            .insert(id.clone(), latency);
    }

    pub fn set_pubsub_kind(&self, id: &PeerId, kind: PubSubKind) {
        if let Some(node) = self.state.lock().nodes.get_mut(id) {
            node.pubsub_kind = kind;
        }
    }

    /// Deliver a raw pubsub message to `to`.
    pub fn inject_pubsub(&self, to: &PeerId, message: PubSubMessage) {
        self.state.lock().emit(to, TransportEvent::PubSub(message));
    }

    /// Re-announce `id` through every relay it is linked to.
    pub fn announce(&self, id: &PeerId) {
        let state = self.state.lock();
        let relays: BTreeSet<PeerId> = state
            .links
            .iter()
            .filter(|l| l.via.is_none() && l.involves(id))
            .map(|l| l.other(id).clone())
            .filter(|other| state.is_relay(other))
            .collect();
        for relay in relays {
            state.announce_through(id, &relay);
        }
    }

    /// Drop every link between `a` and `b`.
    pub fn disconnect(&self, a: &PeerId, b: &PeerId) {
        let mut state = self.state.lock();
        let ids = state.links_between(a, b);
        state.close_links(ids);
    }

    /// Take a node off the network (closing its links) or bring it back.
    pub fn set_online(&self, id: &PeerId, online: bool) {
        let mut state = self.state.lock();
        let Some(node) = state.nodes.get_mut(id) else {
            return;
        };
        node.online = online;
        if !online {
            let ids = state
                .links
                .iter()
                .filter(|l| l.involves(id))
                .map(|l| l.id.clone())
                .collect();
            state.close_links(ids);
        }
    }

    pub fn link_count(&self) -> usize {
        self.state.lock().links.len()
    }

    /// Connections between `a` and `b`, as seen from `a`.
    pub fn connections_between(&self, a: &PeerId, b: &PeerId) -> Vec<Connection> {
        self.state
            .lock()
            .links
            .iter()
            .filter(|l| l.joins(a, b))
            .map(|l| l.view(a, ConnectionStatus::Open))
            .collect()
    }

    pub fn is_subscribed(&self, id: &PeerId, topic: &str) -> bool {
        self.state
            .lock()
            .nodes
            .get(id)
            .is_some_and(|n| n.topics.contains(topic))
    }

    pub fn tags(&self, id: &PeerId, peer: &PeerId) -> Vec<String> {
        let state = self.state.lock();
        let mut tags: Vec<String> = state
            .nodes
            .get(id)
            .and_then(|n| n.tags.get(peer))
            .map(|t| t.iter().cloned().collect())
            .unwrap_or_default();
        tags.sort();
        tags
    }
}

fn fresh_peer_id() -> PeerId {
    PeerId::from_public_key(&Keypair::generate_ed25519().public())
}

/// One node's view of a [`MemoryNetwork`].
pub struct MemoryTransport {
    id: PeerId,
    state: Arc<Mutex<NetworkState>>,
}

#[async_trait]
impl Transport for MemoryTransport {
    fn local_peer_id(&self) -> PeerId {
        self.id.clone()
    }

    fn listen_addrs(&self) -> Vec<Multiaddr> {
        self.state
            .lock()
            .nodes
            .get(&self.id)
            .map(|n| vec![n.listen_addr.clone()])
            .unwrap_or_default()
    }

    fn pubsub_kind(&self) -> PubSubKind {
        self.state
            .lock()
            .nodes
            .get(&self.id)
            .map(|n| n.pubsub_kind)
            .unwrap_or_default()
    }

    fn take_events(&self) -> Option<mpsc::UnboundedReceiver<TransportEvent>> {
        self.state
            .lock()
            .nodes
            .get_mut(&self.id)
            .and_then(|n| n.receiver.take())
    }

    async fn dial(&self, addr: &Multiaddr) -> Result<Connection, PeerError> {
        self.dial_delay().await;
        self.state.lock().dial_addr(&self.id, addr)
    }

    async fn dial_peer(&self, peer: &PeerId) -> Result<Connection, PeerError> {
        self.dial_delay().await;
        let mut state = self.state.lock();
        if let Some(link) = state.links.iter().find(|l| l.joins(&self.id, peer)) {
            return Ok(link.view(&self.id, ConnectionStatus::Open));
        }

        let target_addr = state.online_node(peer)?.listen_addr.clone();
        if !state.blocked_direct.contains(&unordered(&self.id, peer)) {
            return state.dial_addr(&self.id, &target_addr);
        }

        let relay = state
            .links
            .iter()
            .filter(|l| l.via.is_none() && l.involves(&self.id))
            .map(|l| l.other(&self.id).clone())
            .find(|r| state.is_relay(r) && state.has_plain_link(peer, r))
            .ok_or_else(|| PeerError::Transport(format!("no route to {peer}")))?;
        let relay_addr = state.node(&relay)?.listen_addr.clone();
        state.dial_addr(&self.id, &circuit_addr(&relay_addr, peer))
    }

    fn connections(&self, peer: Option<&PeerId>) -> Vec<Connection> {
        self.state
            .lock()
            .links
            .iter()
            .filter(|l| l.involves(&self.id))
            .filter(|l| peer.is_none_or(|p| l.other(&self.id) == p))
            .map(|l| l.view(&self.id, ConnectionStatus::Open))
            .collect()
    }

    fn peers(&self) -> Vec<PeerId> {
        let state = self.state.lock();
        let peers: BTreeSet<PeerId> = state
            .links
            .iter()
            .filter(|l| l.involves(&self.id))
            .map(|l| l.other(&self.id).clone())
            .collect();
        peers.into_iter().collect()
    }

    async fn close_connection(&self, id: &ConnectionId) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        let owned = state
            .links
            .iter()
            .any(|l| l.id == *id && l.involves(&self.id));
        if owned {
            state.close_links(vec![id.clone()]);
        }
        Ok(())
    }

    async fn hang_up(&self, peer: &PeerId) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        let ids = state.links_between(&self.id, peer);
        state.close_links(ids);
        Ok(())
    }

    async fn ping(&self, peer: &PeerId) -> Result<Duration, PeerError> {
        let latency = {
            let mut state = self.state.lock();
            let key = (self.id.clone(), peer.clone());
            *state.ping_counts.entry(key.clone()).or_default() += 1;
            if !state.links.iter().any(|l| l.joins(&self.id, peer)) {
                return Err(PeerError::Transport(format!("not connected to {peer}")));
            }
            if state.unreachable.contains(&key) {
                return Err(PeerError::Transport(format!("no pong from {peer}")));
            }
            state.latency.get(&key).copied().unwrap_or_default()
        };
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        Ok(latency)
    }

    fn protocols(&self, peer: &PeerId) -> Vec<String> {
        self.state.lock().protocols_of(peer)
    }

    async fn handle(&self, protocol: &str) -> Result<(), PeerError> {
        self.set_handled(protocol, true);
        Ok(())
    }

    async fn unhandle(&self, protocol: &str) -> Result<(), PeerError> {
        self.set_handled(protocol, false);
        Ok(())
    }

    async fn open_stream(
        &self,
        connection: &ConnectionId,
        protocol: &str,
    ) -> Result<ProtocolStream, PeerError> {
        let mut state = self.state.lock();
        let pos = state
            .links
            .iter()
            .position(|l| l.id == *connection && l.involves(&self.id))
            .ok_or_else(|| PeerError::Transport(format!("connection {connection} is closed")))?;
        let remote = state.links[pos].other(&self.id).clone();
        if !state.node(&remote)?.handled.contains(protocol) {
            return Err(PeerError::Transport(format!(
                "{remote} does not support {protocol}"
            )));
        }

        let (local, far) = tokio::io::duplex(STREAM_BUFFER);
        let closed = state.links[pos].closed.clone();
        state.links[pos].streams.push(protocol.to_string());
        let remote_view = state.links[pos].view(&remote, ConnectionStatus::Open);
        state.emit(
            &remote,
            TransportEvent::InboundStream {
                connection: remote_view,
                protocol: protocol.to_string(),
                stream: Box::new(LinkStream::new(far, closed.clone())),
            },
        );
        Ok(Box::new(LinkStream::new(local, closed)))
    }

    async fn subscribe(&self, topic: &str) -> Result<(), PeerError> {
        if let Some(node) = self.state.lock().nodes.get_mut(&self.id) {
            node.topics.insert(topic.to_string());
        }
        Ok(())
    }

    async fn unsubscribe(&self, topic: &str) -> Result<(), PeerError> {
        let latency = self.state.lock().unsubscribe_latency.get(&self.id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
        if let Some(node) = self.state.lock().nodes.get_mut(&self.id) {
            node.topics.remove(topic);
        }
        Ok(())
    }

    async fn publish(&self, topic: &str, data: Vec<u8>) -> Result<(), PeerError> {
        let mut state = self.state.lock();
        state.next_seq += 1;
        let sequence_number = state.next_seq;

        let mut visited: HashSet<PeerId> = HashSet::from([self.id.clone()]);
        let mut frontier = VecDeque::from([self.id.clone()]);
        let mut recipients = Vec::new();
        while let Some(node_id) = frontier.pop_front() {
            let forwards = node_id == self.id
                || state
                    .nodes
                    .get(&node_id)
                    .is_some_and(|n| n.is_relay || n.topics.contains(topic));
            if !forwards {
                continue;
            }
            for link in state.links.iter().filter(|l| l.involves(&node_id)) {
                let next = link.other(&node_id);
                if visited.insert(next.clone()) {
                    frontier.push_back(next.clone());
                    if state.nodes.get(next).is_some_and(|n| n.topics.contains(topic)) {
                        recipients.push(next.clone());
                    }
                }
            }
        }

        for to in recipients {
            state.emit(
                &to,
                TransportEvent::PubSub(PubSubMessage::Signed {
                    from: self.id.clone(),
                    topic: topic.to_string(),
                    data: data.clone(),
                    sequence_number,
                }),
            );
        }
        Ok(())
    }

    async fn tag_peer(&self, peer: &PeerId, tag: &str, _value: u32) -> Result<bool, PeerError> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .get_mut(&self.id)
            .ok_or_else(|| PeerError::Transport(format!("unknown peer {}", self.id)))?;
        Ok(node
            .tags
            .entry(peer.clone())
            .or_default()
            .insert(tag.to_string()))
    }
}

impl MemoryTransport {
    async fn dial_delay(&self) {
        let latency = self.state.lock().dial_latency.get(&self.id).copied();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn set_handled(&self, protocol: &str, handled: bool) {
        let mut state = self.state.lock();
        let Some(node) = state.nodes.get_mut(&self.id) else {
            return;
        };
        let changed = if handled {
            node.handled.insert(protocol.to_string())
        } else {
            node.handled.remove(protocol)
        };
        if !changed {
            return;
        }

        let protocols = state.protocols_of(&self.id);
        let remotes: BTreeSet<PeerId> = state
            .links
            .iter()
            .filter(|l| l.involves(&self.id))
            .map(|l| l.other(&self.id).clone())
            .collect();
        for remote in remotes {
            state.emit(
                &remote,
                TransportEvent::ProtocolsChanged {
                    peer: self.id.clone(),
                    protocols: protocols.clone(),
                },
            );
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
