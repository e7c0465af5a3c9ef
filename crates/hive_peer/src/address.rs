//! Endpoint addresses ("multiaddrs").
//!
//! Addresses are [`multiaddr::Multiaddr`] values such as
//! `/ip4/127.0.0.1/tcp/9090/ws/p2p/<peer-id>`. [`MultiaddrExt`] answers the
//! questions connection admission asks of them:
//!
//! - which peer does the address point at,
//! - is it a relayed circuit through another node,
//! - does it belong to a relay node,
//! - is it covered by a deny-list entry.

pub use multiaddr::{Multiaddr, Protocol};
use serde::{Deserialize, Serialize};

use crate::identity::PeerId;

/// How a connection reaches its remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionType {
    /// Tunneled through a relay (`.../p2p-circuit/p2p/<peer>`).
    Relayed,
    /// Peer-to-peer.
    Direct,
}

/// Classification helpers on [`Multiaddr`].
pub trait MultiaddrExt {
    /// The peer the address ultimately points at (the last `/p2p` segment).
    fn target_peer_id(&self) -> Option<PeerId>;

    /// Whether the address contains a `/p2p-circuit` hop.
    fn is_relayed_circuit(&self) -> bool;

    /// `Relayed` when the address contains `/p2p-circuit/p2p/...`, else `Direct`.
    fn connection_type(&self) -> ConnectionType;

    /// An address that is neither a relayed circuit nor a webrtc-star
    /// address can only belong to a relay node.
    fn is_relay_peer_addr(&self) -> bool;

    /// For a relayed address, the peer id of the relay that forwards it.
    fn hop_relay_peer_id(&self) -> Option<PeerId>;

    /// Whether a deny-list entry covers this address.
    ///
    /// An entry matches when it is a segment prefix of the address, so
    /// `/ip4/10.0.0.1` denies every port and peer on that host while a full
    /// address denies exactly that endpoint.
    fn is_denied(&self, deny: &[Multiaddr]) -> bool;
}

fn last_peer_id<'a, 'b: 'a>(
    protocols: impl DoubleEndedIterator<Item = &'a Protocol<'b>>,
) -> Option<PeerId> {
    protocols.rev().find_map(|p| match p {
        Protocol::P2p(id) => Some(PeerId::from(*id)),
        _ => None,
    })
}

impl MultiaddrExt for Multiaddr {
    fn target_peer_id(&self) -> Option<PeerId> {
        let protocols: Vec<Protocol<'_>> = self.iter().collect();
        last_peer_id(protocols.iter())
    }

    fn is_relayed_circuit(&self) -> bool {
        self.iter().any(|p| matches!(p, Protocol::P2pCircuit))
    }

    fn connection_type(&self) -> ConnectionType {
        let protocols: Vec<Protocol<'_>> = self.iter().collect();
        let relayed = protocols
            .windows(2)
            .any(|w| matches!((&w[0], &w[1]), (Protocol::P2pCircuit, Protocol::P2p(_))));
        if relayed {
            ConnectionType::Relayed
        } else {
            ConnectionType::Direct
        }
    }

    fn is_relay_peer_addr(&self) -> bool {
        !self
            .iter()
            .any(|p| matches!(p, Protocol::P2pCircuit | Protocol::P2pWebRtcStar))
    }

    fn hop_relay_peer_id(&self) -> Option<PeerId> {
        let protocols: Vec<Protocol<'_>> = self.iter().collect();
        let circuit_at = protocols
            .iter()
            .rposition(|p| matches!(p, Protocol::P2pCircuit))?;
        last_peer_id(protocols[..circuit_at].iter())
    }

    fn is_denied(&self, deny: &[Multiaddr]) -> bool {
        deny.iter().any(|entry| {
            if entry.is_empty() {
                return false;
            }
            let mut own = self.iter();
            entry.iter().all(|p| own.next().is_some_and(|q| q == p))
        })
    }
}

/// The address of `target` reached through the relay at `relay_addr`.
pub fn circuit_addr(relay_addr: &Multiaddr, target: &PeerId) -> Multiaddr {
    relay_addr
        .clone()
        .with(Protocol::P2pCircuit)
        .with(Protocol::P2p(*target.as_libp2p()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    const RELAY_ID: &str = "12D3KooWS5xJw4cHLzWkFHichaPPtsfhitgaR6cjxwr4mzssv481";
    const PEER_B: &str = "12D3KooWDwoZsUupWJSqJVV75axnChkY8CzEakoLjRbRBi6LiAQF";
    const PEER_C: &str = "12D3KooWHo4b9dp66i6k1VehFnZbwMoVTueVnBMkoUVKnXXUse8G";

    fn ma(s: &str) -> Multiaddr {
        s.parse().unwrap()
    }

    fn relay() -> Multiaddr {
        ma(&format!("/ip4/127.0.0.1/tcp/9090/ws/p2p/{RELAY_ID}"))
    }

    fn id(s: &str) -> PeerId {
        s.parse().unwrap()
    }

    #[test]
    fn test_target_peer_id() {
        assert_eq!(relay().target_peer_id(), Some(id(RELAY_ID)));
        assert_eq!(ma("/ip4/127.0.0.1/tcp/9090/ws").target_peer_id(), None);
    }

    #[test]
    fn test_relay_classification() {
        let relay = relay();
        assert!(relay.is_relay_peer_addr());
        assert!(!relay.is_relayed_circuit());
        assert_eq!(relay.connection_type(), ConnectionType::Direct);

        let circuit = circuit_addr(&relay, &id(PEER_B));
        assert_eq!(
            circuit.to_string(),
            format!("/ip4/127.0.0.1/tcp/9090/ws/p2p/{RELAY_ID}/p2p-circuit/p2p/{PEER_B}")
        );
        assert!(!circuit.is_relay_peer_addr());
        assert!(circuit.is_relayed_circuit());
        assert_eq!(circuit.connection_type(), ConnectionType::Relayed);
        assert_eq!(circuit.target_peer_id(), Some(id(PEER_B)));
        assert_eq!(circuit.hop_relay_peer_id(), Some(id(RELAY_ID)));

        let star = ma(&format!(
            "/dns4/signal.example.com/tcp/443/wss/p2p-webrtc-star/p2p/{PEER_C}"
        ));
        assert!(!star.is_relay_peer_addr());
        assert_eq!(star.connection_type(), ConnectionType::Direct);
        assert_eq!(star.hop_relay_peer_id(), None);
    }

    #[test]
    fn test_bare_circuit_is_not_relayed_connection() {
        // A circuit reservation address carries no target peer.
        let reservation = relay().with(Protocol::P2pCircuit);
        assert!(reservation.is_relayed_circuit());
        assert_eq!(reservation.connection_type(), ConnectionType::Direct);
    }

    #[test]
    fn test_deny_list_prefix_matching() {
        let addr = relay();
        let mut without_peer = addr.clone();
        without_peer.pop();

        assert!(addr.is_denied(&[ma("/ip4/127.0.0.1")]));
        assert!(addr.is_denied(&[addr.clone()]));
        assert!(addr.is_denied(&[without_peer]));
        assert!(!addr.is_denied(&[ma("/ip4/10.0.0.1")]));
        assert!(!addr.is_denied(&[ma("/ip4/127.0.0.1/tcp/9091")]));
        assert!(!addr.is_denied(&[Multiaddr::empty()]));
        assert!(!addr.is_denied(&[]));
    }

    #[test]
    fn test_longer_entry_does_not_deny_prefix() {
        let host = ma("/ip4/127.0.0.1/tcp/9090");
        assert!(!host.is_denied(&[relay()]));
    }
}
