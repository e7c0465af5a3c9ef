//! Dialing a relay node with fixed-backoff retry.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::address::Multiaddr;
use crate::error::PeerError;
use crate::transport::{Connection, Transport};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DialRetryOptions {
    /// Wait between a failed attempt and the next one.
    pub redial_interval: Duration,
    /// Total attempts. `None` retries until success.
    pub max_retry: Option<u32>,
}

impl DialRetryOptions {
    pub fn unbounded(redial_interval: Duration) -> Self {
        Self {
            redial_interval,
            max_retry: None,
        }
    }

    pub fn bounded(redial_interval: Duration, max_retry: u32) -> Self {
        Self {
            redial_interval,
            max_retry: Some(max_retry),
        }
    }
}

/// Dials relay addresses, retrying on failure.
#[derive(Clone)]
pub struct RelayDialer {
    transport: Arc<dyn Transport>,
    dial_timeout: Duration,
}

impl RelayDialer {
    pub fn new(transport: Arc<dyn Transport>, dial_timeout: Duration) -> Self {
        Self {
            transport,
            dial_timeout,
        }
    }

    /// Dial `addr` until it succeeds or the retry budget is spent.
    ///
    /// Each attempt is bounded by the dial timeout. After the last failed
    /// attempt this returns [`PeerError::DialExhausted`] without waiting.
    pub async fn dial_with_retry(
        &self,
        addr: &Multiaddr,
        options: DialRetryOptions,
    ) -> Result<Connection, PeerError> {
        let max = options.max_retry.unwrap_or(u32::MAX).max(1);
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            info!("Dialling relay node {addr} (attempt {attempt})");

            let result = match tokio::time::timeout(self.dial_timeout, self.transport.dial(addr)).await {
                Ok(result) => result,
                Err(_) => Err(PeerError::Timeout(self.dial_timeout)),
            };

            match result {
                Ok(conn) => {
                    info!("Connected to relay node {addr} as connection {}", conn.id);
                    return Ok(conn);
                }
                Err(e) => {
                    warn!("Could not dial relay {addr}: {e}");
                    if attempt >= max {
                        return Err(PeerError::DialExhausted {
                            addr: addr.to_string(),
                            attempts: attempt,
                        });
                    }
                }
            }

            tokio::time::sleep(options.redial_interval).await;
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::PeerId;
    use crate::memory::MemoryNetwork;

    #[tokio::test(start_paused = true)]
    async fn test_dial_exhausted_after_max_retry() {
        let network = MemoryNetwork::new();
        let peer = network.add_peer("peer-a");
        let missing: Multiaddr = format!("/ip4/127.0.0.1/tcp/1/ws/p2p/{}", PeerId::random())
            .parse()
            .unwrap();

        let dialer = RelayDialer::new(peer, Duration::from_secs(10));
        let start = tokio::time::Instant::now();
        let err = dialer
            .dial_with_retry(&missing, DialRetryOptions::bounded(Duration::from_secs(5), 3))
            .await
            .unwrap_err();

        match err {
            PeerError::DialExhausted { attempts, .. } => assert_eq!(attempts, 3),
            other => panic!("Expected DialExhausted, got {other:?}"),
        }
        // Two waits between three attempts.
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_dial_succeeds_once_relay_comes_online() {
        let network = MemoryNetwork::new();
        let relay = network.add_relay("relay-r");
        let relay_id = relay.local_peer_id();
        let relay_addr = relay.listen_addrs()[0].clone();
        network.set_online(&relay_id, false);
        let peer = network.add_peer("peer-a");

        let net = network.clone();
        let back = relay_id.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(12)).await;
            net.set_online(&back, true);
        });

        let dialer = RelayDialer::new(peer, Duration::from_secs(10));
        let conn = dialer
            .dial_with_retry(&relay_addr, DialRetryOptions::unbounded(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(conn.remote_peer, relay_id);
    }
}
