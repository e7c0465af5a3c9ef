//! End-to-end scenarios: a relay and two peers on an in-process network.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use hive_peer::address::{ConnectionType, MultiaddrExt};
use hive_peer::debug_info::NodeType;
use hive_peer::memory::{MemoryNetwork, MemoryTransport};
use hive_peer::{
    DebugInfo, DebugMsg, Peer, PeerConfig, PeerEvent, PeerId, RelayNode, RelayNodeConfig,
};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

fn id(network: &MemoryNetwork, name: &str) -> PeerId {
    network.peer_id(name).unwrap()
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    for _ in 0..500 {
        if condition() {
            return;
        }
        sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

fn peer_config(network: &MemoryNetwork, debug: bool) -> PeerConfig {
    let relay = network.listen_addr(&id(network, "relay-r")).unwrap();
    let mut config = PeerConfig::new(relay.to_string());
    config.enable_debug_info = debug;
    config.relay_redial_interval = Duration::from_secs(1);
    config
}

async fn start_peer(transport: Arc<MemoryTransport>, config: PeerConfig) -> Peer {
    let mut peer = Peer::new(config, transport).unwrap();
    peer.init().await.unwrap();
    peer
}

struct Cluster {
    network: MemoryNetwork,
    relay: RelayNode,
    a: Peer,
    b: Peer,
}

impl Cluster {
    async fn start(debug: bool, block_direct: bool) -> Self {
        let network = MemoryNetwork::new();
        let relay_config = RelayNodeConfig {
            enable_debug_info: debug,
            ..RelayNodeConfig::default()
        };
        let relay = RelayNode::start(relay_config, network.add_relay("relay-r"))
            .await
            .unwrap();
        let a_transport = network.add_peer("peer-a");
        let b_transport = network.add_peer("peer-b");
        let (a_id, b_id) = (id(&network, "peer-a"), id(&network, "peer-b"));
        if block_direct {
            network.block_direct(&a_id, &b_id);
        }

        let a = start_peer(a_transport, peer_config(&network, debug)).await;
        let b = start_peer(b_transport, peer_config(&network, debug)).await;
        wait_until(|| a.stream_peers().contains(&b_id)).await;
        wait_until(|| b.stream_peers().contains(&a_id)).await;

        Self {
            network,
            relay,
            a,
            b,
        }
    }

    fn id(&self, name: &str) -> PeerId {
        id(&self.network, name)
    }

    async fn shutdown(mut self) {
        self.a.close().await;
        self.b.close().await;
        self.relay.close().await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_discovered_peers_connect_directly() {
    let cluster = Cluster::start(false, false).await;

    let links = cluster
        .network
        .connections_between(&cluster.id("peer-a"), &cluster.id("peer-b"));
    assert_eq!(links.len(), 1);
    assert!(!links[0].remote_addr.is_relayed_circuit());

    let info = cluster.a.get_peer_info();
    let to_b = info
        .conn_info
        .iter()
        .find(|c| c.connection.peer_id == cluster.id("peer-b").to_string())
        .unwrap();
    assert_eq!(to_b.connection.connection_type, ConnectionType::Direct);
    assert_eq!(to_b.node_type, NodeType::Peer);
    let to_relay = info
        .conn_info
        .iter()
        .find(|c| c.connection.peer_id == cluster.id("relay-r").to_string())
        .unwrap();
    assert_eq!(to_relay.node_type, NodeType::RelayPrimary);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_blocked_peers_connect_through_relay() {
    let cluster = Cluster::start(false, true).await;

    let links = cluster
        .network
        .connections_between(&cluster.id("peer-a"), &cluster.id("peer-b"));
    assert_eq!(links.len(), 1);
    assert!(links[0].remote_addr.is_relayed_circuit());

    let info = cluster.a.get_peer_info();
    let to_b = info
        .conn_info
        .iter()
        .find(|c| c.connection.peer_id == cluster.id("peer-b").to_string())
        .unwrap();
    assert_eq!(to_b.connection.connection_type, ConnectionType::Relayed);
    assert_eq!(
        to_b.hop_relay_peer_id,
        Some(cluster.id("relay-r").to_string())
    );

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_chat_topic_flood_reaches_other_peer() {
    let cluster = Cluster::start(false, false).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<(PeerId, Value)>();
    let _a_chat = cluster.a.subscribe_topic("chat", |_, _| {}).await.unwrap();
    let _b_chat = cluster
        .b
        .subscribe_topic("chat", move |from, msg| {
            let _ = tx.send((from.clone(), msg.clone()));
        })
        .await
        .unwrap();

    cluster.a.flood_message("chat", "hello").await.unwrap();

    let (from, msg) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, cluster.id("peer-a"));
    assert_eq!(msg, json!("hello"));

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_protocol_stream_broadcast() {
    let cluster = Cluster::start(false, false).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<(PeerId, Value)>();
    let _messages = cluster.b.subscribe_message(move |from, msg| {
        let _ = tx.send((from.clone(), msg.clone()));
    });

    let sent = cluster
        .a
        .broadcast_message(&json!({ "kind": "greeting", "body": "hi" }));
    assert_eq!(sent, 1);

    let (from, msg) = timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(from, cluster.id("peer-a"));
    assert_eq!(msg["body"], "hi");
    assert_eq!(cluster.a.metrics().messages_sent.get(), 1);
    assert_eq!(cluster.b.metrics().messages_received.get(), 1);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_debug_info_request_and_responses() {
    let cluster = Cluster::start(true, false).await;

    let (tx, mut rx) = mpsc::unbounded_channel::<(PeerId, DebugMsg)>();
    let _debug = cluster
        .a
        .subscribe_debug_info(move |from, msg| {
            let _ = tx.send((from.clone(), msg.clone()));
        })
        .await
        .unwrap();

    cluster.a.request_peer_info().await.unwrap();

    let mut responses: HashMap<PeerId, DebugInfo> = HashMap::new();
    timeout(Duration::from_secs(5), async {
        while responses.len() < 2 {
            let (from, msg) = rx.recv().await.unwrap();
            if let DebugMsg::Response { dst, peer_info } = msg {
                assert_eq!(dst, cluster.id("peer-a").to_string());
                responses.insert(from, peer_info);
            }
        }
    })
    .await
    .unwrap();

    match &responses[&cluster.id("peer-b")] {
        DebugInfo::Peer(info) => {
            assert_eq!(info.self_info.self_info.peer_id, cluster.id("peer-b").to_string());
            assert_eq!(
                info.self_info.primary_relay_peer_id,
                Some(cluster.id("relay-r").to_string())
            );
            let a = cluster.id("peer-a").to_string();
            assert!(info.conn_info.iter().any(|c| c.connection.peer_id == a));
        }
        other => panic!("Expected peer info from peer-b, got {other:?}"),
    }
    match &responses[&cluster.id("relay-r")] {
        DebugInfo::Relay(info) => {
            assert_eq!(info.self_info.peer_id, cluster.id("relay-r").to_string());
            assert_eq!(info.conn_info.len(), 2);
        }
        other => panic!("Expected relay info from relay-r, got {other:?}"),
    }

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_unresponsive_peer_is_hung_up() {
    let cluster = Cluster::start(false, false).await;
    let mut events = cluster.a.subscribe_events();

    cluster
        .network
        .set_ping_unreachable(&cluster.id("peer-a"), &cluster.id("peer-b"), true);

    timeout(Duration::from_secs(60), async {
        loop {
            if let Ok(PeerEvent::Disconnected(peer)) = events.recv().await {
                if peer == cluster.id("peer-b") {
                    return;
                }
            }
        }
    })
    .await
    .unwrap();

    assert!(cluster
        .network
        .connections_between(&cluster.id("peer-a"), &cluster.id("peer-b"))
        .is_empty());
    assert!(cluster.a.connected_peers().contains(&cluster.id("relay-r")));
    assert!(cluster.a.stream_peers().is_empty());
    assert_eq!(cluster.a.metrics().heartbeat_failures.get(), 1);

    cluster.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_primary_relay_is_redialled() {
    let network = MemoryNetwork::new();
    let mut relay = RelayNode::start(RelayNodeConfig::default(), network.add_relay("relay-r"))
        .await
        .unwrap();
    let id = |name: &str| network.peer_id(name).unwrap();
    let mut a = start_peer(network.add_peer("peer-a"), peer_config(&network, false)).await;
    wait_until(|| a.relay_connection_count() == 1).await;

    network.set_online(&id("relay-r"), false);
    wait_until(|| a.relay_connection_count() == 0).await;
    sleep(Duration::from_secs(5)).await;
    assert!(a.connected_peers().is_empty());

    network.set_online(&id("relay-r"), true);
    wait_until(|| a.relay_connection_count() == 1).await;
    assert_eq!(
        network
            .connections_between(&id("peer-a"), &id("relay-r"))
            .len(),
        1
    );
    assert_eq!(
        network.tags(&id("peer-a"), &id("relay-r")),
        vec!["laconic:relay-primary".to_string()]
    );
    assert_eq!(a.metrics().connections_opened.get(), 2);

    a.close().await;
    relay.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_close_releases_every_peer() {
    let cluster = Cluster::start(false, false).await;
    let Cluster {
        network,
        mut relay,
        mut a,
        mut b,
    } = cluster;
    let id = |name: &str| network.peer_id(name).unwrap();
    let _chat = a.subscribe_topic("chat", |_, _| {}).await.unwrap();
    let mut b_events = b.subscribe_events();

    a.close().await;

    assert!(!network.is_subscribed(&id("peer-a"), "chat"));
    assert!(a.connected_peers().is_empty());
    assert!(a.stream_peers().is_empty());
    assert!(a.get_latency_data(&id("peer-b")).is_empty());

    timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(PeerEvent::Disconnected(peer)) = b_events.recv().await {
                if peer == id("peer-a") {
                    return;
                }
            }
        }
    })
    .await
    .unwrap();
    wait_until(|| b.stream_peers().is_empty()).await;
    assert_eq!(b.connected_peers(), vec![id("relay-r")]);

    b.close().await;
    relay.close().await;
}
